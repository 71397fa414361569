//! Cross-component scenario tests: pipes, fan-in, fan-out, nodes, and
//! whole topologies working together.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::context::Context;
use crate::data::{Map, Value};
use crate::tuple::Tuple;

use super::builder::{Topology, TopologyConfig};
use super::destinations::DataDestinations;
use super::error::TopologyError;
use super::pipe::pipe;
use super::sources::DataSources;
use super::state::NodeState;
use super::testutil::TupleCollectorSink;
use super::traits::{Operator, Sink, Source, Updater, Writer};

fn int_tuple(v: i64) -> Tuple {
    let mut data = Map::default();
    data.insert("v".into(), Value::Int(v));
    Tuple::new(data)
}

/// Emits `count` tuples (`v = 0..count`) per stream phase, then returns.
struct BatchSource {
    count: i64,
    rewindable: bool,
    stopped: AtomicBool,
}

impl BatchSource {
    fn new(count: i64) -> Self {
        Self {
            count,
            rewindable: false,
            stopped: AtomicBool::new(false),
        }
    }

    fn rewindable(count: i64) -> Self {
        Self {
            count,
            rewindable: true,
            stopped: AtomicBool::new(false),
        }
    }
}

impl Source for BatchSource {
    fn generate_stream(&self, ctx: &Context, writer: &dyn Writer) -> Result<(), TopologyError> {
        for i in 0..self.count {
            if self.stopped.load(Ordering::Relaxed) {
                break;
            }
            writer.write(ctx, int_tuple(i))?;
        }
        Ok(())
    }

    fn stop(&self, _ctx: &Context) -> Result<(), TopologyError> {
        self.stopped.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn rewindable(&self) -> bool {
        self.rewindable
    }

    fn rewind(&self, _ctx: &Context) -> Result<(), TopologyError> {
        Ok(())
    }
}

/// Fails immediately without emitting anything.
struct FailingSource;

impl Source for FailingSource {
    fn generate_stream(&self, _ctx: &Context, _writer: &dyn Writer) -> Result<(), TopologyError> {
        Err(TopologyError::Source("connection refused".to_owned()))
    }

    fn stop(&self, _ctx: &Context) -> Result<(), TopologyError> {
        Ok(())
    }
}

/// Multiplies the `v` field and forwards the tuple.
struct Multiply(i64);

impl Operator for Multiply {
    fn process(
        &self,
        ctx: &Context,
        mut tuple: Tuple,
        emitter: &dyn Writer,
    ) -> Result<(), TopologyError> {
        let v = tuple.data["v"]
            .as_int()
            .map_err(|err| TopologyError::UserWrite(err.to_string()))?;
        tuple.data.insert("v".into(), Value::Int(v * self.0));
        emitter.write(ctx, tuple)
    }
}

// ---- Fan-in under contention ----

#[test]
fn test_fan_in_graceful_drain_delivers_every_write() {
    let ctx = Arc::new(Context::new());
    let srcs = Arc::new(DataSources::new("drain_test"));
    let sink = Arc::new(TupleCollectorSink::new());

    // Capacity-1 pipes force the producers to await capacity, interleaving
    // with the pour loop.
    let (s1, r1) = pipe("a", 1);
    let (s2, r2) = pipe("b", 1);
    srcs.add("a", r1).unwrap();
    srcs.add("b", r2).unwrap();

    let pouring = {
        let srcs = Arc::clone(&srcs);
        let sink = Arc::clone(&sink);
        let ctx = Arc::clone(&ctx);
        thread::spawn(move || srcs.pour(&ctx, sink.as_ref(), 2))
    };
    srcs.wait_state(NodeState::Running);

    let w1 = {
        let ctx = Arc::clone(&ctx);
        thread::spawn(move || {
            for i in 0..5 {
                s1.write(&ctx, int_tuple(i)).unwrap();
            }
        })
    };
    let w2 = {
        let ctx = Arc::clone(&ctx);
        thread::spawn(move || {
            for i in 0..3 {
                s2.write(&ctx, int_tuple(i)).unwrap();
            }
        })
    };
    w1.join().unwrap();
    w2.join().unwrap();

    srcs.enable_graceful_stop();
    srcs.stop(&ctx);
    pouring.join().unwrap().unwrap();

    assert_eq!(sink.len(), 8);
    assert_eq!(srcs.num_errors(), 0);
}

#[test]
fn test_fan_in_round_robin_serves_both_inputs() {
    let ctx = Arc::new(Context::new());
    let srcs = Arc::new(DataSources::new("fair_test"));
    let sink = Arc::new(TupleCollectorSink::new());

    let (s1, r1) = pipe("a", 8);
    let (s2, r2) = pipe("b", 8);
    srcs.add("a", r1).unwrap();
    srcs.add("b", r2).unwrap();

    for i in 0..4 {
        s1.write(&ctx, int_tuple(i)).unwrap();
        s2.write(&ctx, int_tuple(i)).unwrap();
    }

    let pouring = {
        let srcs = Arc::clone(&srcs);
        let sink = Arc::clone(&sink);
        let ctx = Arc::clone(&ctx);
        thread::spawn(move || srcs.pour(&ctx, sink.as_ref(), 1))
    };
    sink.wait(8);

    // Both inputs were served and within-input order survived.
    let by_input = |name: &str| -> Vec<i64> {
        sink.snapshot()
            .iter()
            .filter(|t| t.input_name == name)
            .map(|t| t.data["v"].as_int().unwrap())
            .collect()
    };
    assert_eq!(by_input("a"), vec![0, 1, 2, 3]);
    assert_eq!(by_input("b"), vec![0, 1, 2, 3]);

    srcs.stop(&ctx);
    pouring.join().unwrap().unwrap();
}

// ---- Lifecycle ----

#[test]
fn test_lifecycle_is_monotone_through_pour_and_stop() {
    let ctx = Context::new();
    let srcs = Arc::new(DataSources::new("state_test"));
    let sink = Arc::new(TupleCollectorSink::new());

    assert_eq!(srcs.state(), NodeState::Initialized);

    thread::scope(|scope| {
        let pouring = {
            let srcs = Arc::clone(&srcs);
            let sink = Arc::clone(&sink);
            let ctx = &ctx;
            scope.spawn(move || srcs.pour(ctx, sink.as_ref(), 1))
        };

        assert!(srcs.wait_state(NodeState::Running) >= NodeState::Running);
        srcs.stop(&ctx);
        pouring.join().unwrap().unwrap();
    });

    assert_eq!(srcs.state(), NodeState::Stopped);
    // wait() on an earlier state returns immediately once past it.
    assert_eq!(srcs.wait_state(NodeState::Running), NodeState::Stopped);
}

// ---- Whole topologies ----

#[test]
fn test_linear_topology_flow() {
    let ctx = Arc::new(Context::new());
    let topology = Topology::new(Arc::clone(&ctx));
    let collector = Arc::new(TupleCollectorSink::new());

    let source = topology
        .add_source_paused("numbers", Arc::new(BatchSource::new(10)))
        .unwrap();
    topology
        .add_box("double", Arc::new(Multiply(2)), &["numbers"])
        .unwrap();
    topology
        .add_sink("collect", Arc::clone(&collector) as Arc<dyn Sink>, &["double"])
        .unwrap();

    source.resume(&ctx).unwrap();
    collector.wait(10);

    let tuples = collector.snapshot();
    let mut values: Vec<i64> = tuples
        .iter()
        .map(|t| t.data["v"].as_int().unwrap())
        .collect();
    values.sort_unstable();
    assert_eq!(values, (0..10).map(|i| i * 2).collect::<Vec<_>>());
    assert!(tuples.iter().all(|t| t.input_name == "double"));

    topology.stop();

    assert_eq!(source.stats().sent, 10);
    let double = topology.box_node("double").unwrap();
    assert_eq!(double.stats().received, 10);
    assert_eq!(double.stats().sent, 10);
    assert_eq!(topology.sink_node("collect").unwrap().stats().received, 10);
}

#[test]
fn test_fan_out_fan_in_topology() {
    let ctx = Arc::new(Context::new());
    let topology = Topology::new(Arc::clone(&ctx));
    let collector = Arc::new(TupleCollectorSink::new());

    let source = topology
        .add_source_paused("numbers", Arc::new(BatchSource::new(5)))
        .unwrap();
    topology
        .add_box("double", Arc::new(Multiply(2)), &["numbers"])
        .unwrap();
    topology
        .add_box("triple", Arc::new(Multiply(3)), &["numbers"])
        .unwrap();
    topology
        .add_sink("collect", Arc::clone(&collector) as Arc<dyn Sink>, &["double", "triple"])
        .unwrap();

    source.resume(&ctx).unwrap();
    collector.wait(10);
    topology.stop();

    let tuples = collector.snapshot();
    assert_eq!(tuples.len(), 10);
    let from = |name: &str| tuples.iter().filter(|t| t.input_name == name).count();
    assert_eq!(from("double"), 5);
    assert_eq!(from("triple"), 5);
    // The source's distributor deep-copied per branch.
    assert_eq!(source.stats().sent, 5);
}

#[test]
fn test_source_error_stops_only_its_subtree() {
    let ctx = Arc::new(Context::new());
    let topology = Topology::new(Arc::clone(&ctx));
    let healthy_out = Arc::new(TupleCollectorSink::new());

    let bad = topology
        .add_source("bad", Arc::new(FailingSource))
        .unwrap();
    let good = topology
        .add_source_paused("good", Arc::new(BatchSource::new(3)))
        .unwrap();
    topology
        .add_sink("collect", Arc::clone(&healthy_out) as Arc<dyn Sink>, &["good"])
        .unwrap();

    good.resume(&ctx).unwrap();
    healthy_out.wait(3);

    // The failing source's node wound itself down.
    while bad.state() != NodeState::Stopped {
        thread::yield_now();
    }
    assert_eq!(bad.stats().errors, 1);

    // The unrelated branch was unaffected.
    assert_eq!(healthy_out.len(), 3);
    topology.stop();
}

#[test]
fn test_rewindable_source_replays_stream() {
    let ctx = Arc::new(Context::new());
    let topology = Topology::new(Arc::clone(&ctx));
    let collector = Arc::new(TupleCollectorSink::new());

    let source = topology
        .add_source_paused("replay", Arc::new(BatchSource::rewindable(4)))
        .unwrap();
    topology
        .add_sink("collect", Arc::clone(&collector) as Arc<dyn Sink>, &["replay"])
        .unwrap();

    source.resume(&ctx).unwrap();
    collector.wait(4);

    source.rewind(&ctx).unwrap();
    collector.wait(8);
    topology.stop();

    // Rewind + full consume reproduces the original sequence.
    let values: Vec<i64> = collector
        .snapshot()
        .iter()
        .map(|t| t.data["v"].as_int().unwrap())
        .collect();
    assert_eq!(values[..4], values[4..]);
}

#[test]
fn test_rewind_rejected_for_plain_source() {
    let ctx = Arc::new(Context::new());
    let topology = Topology::new(Arc::clone(&ctx));

    let source = topology
        .add_source_paused("plain", Arc::new(BatchSource::new(1)))
        .unwrap();

    assert_eq!(
        source.rewind(&ctx),
        Err(TopologyError::Rewind("plain".into()))
    );
    topology.stop();
}

#[test]
fn test_paused_source_holds_tuples_until_resume() {
    let ctx = Arc::new(Context::new());
    let topology = Topology::new(Arc::clone(&ctx));
    let collector = Arc::new(TupleCollectorSink::new());

    let source = topology
        .add_source_paused("numbers", Arc::new(BatchSource::new(3)))
        .unwrap();
    topology
        .add_sink("collect", Arc::clone(&collector) as Arc<dyn Sink>, &["numbers"])
        .unwrap();

    // Nothing flows while paused.
    thread::sleep(Duration::from_millis(50));
    assert_eq!(collector.len(), 0);

    source.resume(&ctx).unwrap();
    collector.wait(3);
    topology.stop();
}

#[test]
fn test_topology_stop_is_idempotent() {
    let ctx = Arc::new(Context::new());
    let topology = Topology::new(Arc::clone(&ctx));
    let collector = Arc::new(TupleCollectorSink::new());

    let source = topology
        .add_source_paused("numbers", Arc::new(BatchSource::new(2)))
        .unwrap();
    topology
        .add_sink("collect", Arc::clone(&collector) as Arc<dyn Sink>, &["numbers"])
        .unwrap();
    source.resume(&ctx).unwrap();
    collector.wait(2);

    topology.stop();
    topology.stop();

    assert_eq!(source.state(), NodeState::Stopped);
    assert_eq!(
        topology.sink_node("collect").unwrap().state(),
        NodeState::Stopped
    );
}

#[test]
fn test_duplicate_node_name_rejected() {
    let ctx = Arc::new(Context::new());
    let topology = Topology::new(ctx);

    topology
        .add_source("src", Arc::new(BatchSource::new(0)))
        .unwrap();
    let dup = topology.add_source("src", Arc::new(BatchSource::new(0)));
    assert_eq!(dup.unwrap_err(), TopologyError::DuplicateName("src".into()));

    let missing = topology.add_box("b", Arc::new(Multiply(1)), &["no_such_node"]);
    assert_eq!(
        missing.unwrap_err(),
        TopologyError::NodeNotFound("no_such_node".into())
    );
    topology.stop();
}

#[test]
fn test_small_capacity_drop_oldest_topology_keeps_latest() {
    let ctx = Arc::new(Context::new());
    let config = TopologyConfig {
        pipe_capacity: 1,
        drop_mode: super::pipe::DropMode::DropOldest,
        ..TopologyConfig::default()
    };
    let topology = Topology::with_config(Arc::clone(&ctx), config);
    let collector = Arc::new(TupleCollectorSink::new());

    let source = topology
        .add_source_paused("burst", Arc::new(BatchSource::new(100)))
        .unwrap();
    topology
        .add_sink("collect", Arc::clone(&collector) as Arc<dyn Sink>, &["burst"])
        .unwrap();

    source.resume(&ctx).unwrap();
    // Wait for the emit phase to finish, then drain.
    while source.stats().sent < 100 {
        thread::yield_now();
    }
    topology.stop();

    let tuples = collector.snapshot();
    assert!(!tuples.is_empty());
    assert!(tuples.len() <= 100);
    // Whatever arrived preserved emission order.
    let values: Vec<i64> = tuples
        .iter()
        .map(|t| t.data["v"].as_int().unwrap())
        .collect();
    let mut sorted = values.clone();
    sorted.sort_unstable();
    assert_eq!(values, sorted);
    // Dropped tuples were counted, never silently lost.
    assert_eq!(
        u64::try_from(tuples.len()).unwrap() + ctx.dropped_tuples(),
        100
    );
}

// ---- Fan-out behavior under a live topology ----

#[test]
fn test_destinations_write_after_close_fails() {
    let ctx = Context::new();
    let dsts = DataDestinations::new("n");
    let (s, _r) = pipe("out", 1);
    dsts.add("down", s).unwrap();

    dsts.close(&ctx);
    assert_eq!(dsts.write(&ctx, int_tuple(1)), Err(TopologyError::PipeClosed));
    assert_eq!(
        dsts.add("late", pipe("late", 1).0),
        Err(TopologyError::PipeClosed)
    );
}

// ---- Live reconfiguration ----

struct Threshold {
    limit: Mutex<i64>,
}

impl crate::context::SharedState for Threshold {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl Updater for Threshold {
    fn update(&self, _ctx: &Context, params: &Map) -> Result<(), TopologyError> {
        let limit = params
            .get("limit")
            .ok_or_else(|| TopologyError::Parameter("missing limit".to_owned()))?
            .as_int()
            .map_err(|err| TopologyError::Parameter(err.to_string()))?;
        if limit < 0 {
            return Err(TopologyError::Parameter("limit must be >= 0".to_owned()));
        }
        *self.limit.lock() = limit;
        Ok(())
    }
}

#[test]
fn test_shared_state_updated_through_registry() {
    let ctx = Context::new();
    let threshold = Arc::new(Threshold {
        limit: Mutex::new(10),
    });
    ctx.shared_states().add("threshold", threshold).unwrap();

    let state = ctx.shared_states().get("threshold").unwrap();
    let threshold = state.as_any().downcast_ref::<Threshold>().unwrap();

    let mut params = Map::default();
    params.insert("limit".into(), Value::Int(42));
    threshold.update(&ctx, &params).unwrap();
    assert_eq!(*threshold.limit.lock(), 42);

    params.insert("limit".into(), Value::from("not a number"));
    assert!(matches!(
        threshold.update(&ctx, &params),
        Err(TopologyError::Parameter(_))
    ));
    params.insert("limit".into(), Value::Int(-1));
    assert!(matches!(
        threshold.update(&ctx, &params),
        Err(TopologyError::Parameter(_))
    ));
    // Failed updates leave the previous value in place.
    assert_eq!(*threshold.limit.lock(), 42);
}
