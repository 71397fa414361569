//! Per-node glue: wires a user component between fan-in and fan-out.
//!
//! Every node owns its [`DataSources`] (absent on sources) and its
//! [`DataDestinations`] (absent on sinks), runs its processing loop on a
//! dedicated thread, and exposes lifecycle control plus per-node counters.
//!
//! Shutdown cascades topologically: stopping a node closes its input
//! receivers (releasing upstream senders) and its output senders (releasing
//! downstream receivers).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use crate::context::Context;
use crate::tuple::Tuple;

use super::destinations::DataDestinations;
use super::error::TopologyError;
use super::sources::DataSources;
use super::state::{NodeState, StateMachine};
use super::traits::{Operator, Sink, Source, Writer};

/// The role of a node in the topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    /// Origin; produces tuples.
    Source,
    /// Transform; consumes from inputs, emits to outputs.
    Box,
    /// Terminus; consumes only.
    Sink,
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Source => f.write_str("source"),
            Self::Box => f.write_str("box"),
            Self::Sink => f.write_str("sink"),
        }
    }
}

/// Per-node counters, updated during processing and readable at any time.
#[derive(Debug, Default)]
pub struct NodeStats {
    received: AtomicU64,
    sent: AtomicU64,
    dropped: AtomicU64,
    errors: AtomicU64,
}

impl NodeStats {
    fn add_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    fn add_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    fn add_error_dropping(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn add_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time copy of the counters.
    #[must_use]
    pub fn snapshot(&self) -> NodeStatsSnapshot {
        NodeStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a node's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeStatsSnapshot {
    /// Tuples the node received from its inputs.
    pub received: u64,
    /// Tuples the node emitted to its outputs.
    pub sent: u64,
    /// Tuples the node discarded (processing failures).
    pub dropped: u64,
    /// Processing errors.
    pub errors: u64,
}

/// Counts emissions, then forwards to the node's distributor.
struct EmitCounter {
    stats: Arc<NodeStats>,
    dsts: Arc<DataDestinations>,
}

impl Writer for EmitCounter {
    fn write(&self, ctx: &Context, tuple: Tuple) -> Result<(), TopologyError> {
        self.dsts.write(ctx, tuple)?;
        self.stats.add_sent();
        Ok(())
    }
}

/// A source node: runs `Source::generate_stream` into its distributor.
pub struct SourceNode {
    name: String,
    source: Arc<dyn Source>,
    dsts: Arc<DataDestinations>,
    state: Arc<StateMachine>,
    stats: Arc<NodeStats>,
    rewind: Mutex<RewindSignal>,
    rewind_cond: Condvar,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// What wakes a source parked between emit phases. Both flags live under
/// the one mutex the run loop waits on, so a stop raised between predicate
/// check and park cannot be missed.
#[derive(Default)]
struct RewindSignal {
    requested: bool,
    stopping: bool,
}

enum AfterStream {
    Rewind,
    Stop,
}

impl SourceNode {
    pub(super) fn new(name: impl Into<String>, source: Arc<dyn Source>) -> Self {
        let name = name.into();
        Self {
            dsts: Arc::new(DataDestinations::new(name.clone())),
            name,
            source,
            state: Arc::new(StateMachine::default()),
            stats: Arc::new(NodeStats::default()),
            rewind: Mutex::new(RewindSignal::default()),
            rewind_cond: Condvar::new(),
            handle: Mutex::new(None),
        }
    }

    /// Returns the node's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the node's role.
    #[must_use]
    pub fn node_type(&self) -> NodeType {
        NodeType::Source
    }

    /// Returns the node's lifecycle state.
    #[must_use]
    pub fn state(&self) -> NodeState {
        self.state.get()
    }

    /// Returns a snapshot of the node's counters.
    #[must_use]
    pub fn stats(&self) -> NodeStatsSnapshot {
        self.stats.snapshot()
    }

    /// Returns the node's fan-out distributor, for wiring downstream edges.
    #[must_use]
    pub fn destinations(&self) -> &Arc<DataDestinations> {
        &self.dsts
    }

    /// Suspends emission by pausing the distributor.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::WrongState`] once the node is stopping.
    pub fn pause(&self, _ctx: &Context) -> Result<(), TopologyError> {
        let state = self.state.get();
        if state >= NodeState::Stopping {
            return Err(TopologyError::WrongState { op: "pause", state });
        }
        self.dsts.pause();
        let _ = self
            .state
            .try_transition("pause", NodeState::Running, NodeState::Paused);
        Ok(())
    }

    /// Resumes emission paused by [`pause`](SourceNode::pause).
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::WrongState`] once the node is stopping.
    pub fn resume(&self, _ctx: &Context) -> Result<(), TopologyError> {
        let state = self.state.get();
        if state >= NodeState::Stopping {
            return Err(TopologyError::WrongState { op: "resume", state });
        }
        let _ = self
            .state
            .try_transition("resume", NodeState::Paused, NodeState::Running);
        self.dsts.resume();
        Ok(())
    }

    /// Requests that the source replay its stream from the beginning.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::Rewind`] for a non-rewindable source and
    /// [`TopologyError::WrongState`] once the node is stopping.
    pub fn rewind(&self, _ctx: &Context) -> Result<(), TopologyError> {
        if !self.source.rewindable() {
            return Err(TopologyError::Rewind(self.name.clone()));
        }
        let state = self.state.get();
        if state >= NodeState::Stopping {
            return Err(TopologyError::WrongState { op: "rewind", state });
        }
        let mut signal = self.rewind.lock();
        signal.requested = true;
        self.rewind_cond.notify_all();
        Ok(())
    }

    /// Stops the node: the source returns, the distributor closes, and the
    /// state reaches `Stopped`. Idempotent; blocks until shutdown finishes.
    pub fn stop(&self, ctx: &Context) {
        if let Err(err) = self.source.stop(ctx) {
            self.stats.add_error();
            tracing::warn!(node = %self.name, %err, "source stop failed");
        }
        self.state.advance(NodeState::Stopping);
        // Raise the stop under the rewind lock so a source parked between
        // emit phases cannot miss the wakeup.
        {
            let mut signal = self.rewind.lock();
            signal.stopping = true;
            self.rewind_cond.notify_all();
        }
        // In case the source was paused mid-stream.
        self.dsts.resume();
        self.state.wait(NodeState::Stopped);
        self.join();
    }

    pub(super) fn set_handle(&self, handle: JoinHandle<()>) {
        *self.handle.lock() = Some(handle);
    }

    fn join(&self) {
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    /// The node's thread body: emit, then either rewind and emit again or
    /// stop.
    pub(super) fn run(&self, ctx: &Context) {
        self.state.advance(NodeState::Starting);
        self.state.advance(NodeState::Running);

        let emitter = EmitCounter {
            stats: Arc::clone(&self.stats),
            dsts: Arc::clone(&self.dsts),
        };

        loop {
            match self.source.generate_stream(ctx, &emitter) {
                Ok(()) => {}
                // The distributor failed over mid-stop; a clean exit, not a
                // source failure.
                Err(TopologyError::PipeClosed) => break,
                Err(err) => {
                    self.stats.add_error();
                    tracing::error!(node = %self.name, %err, "source stream failed; stopping node");
                    break;
                }
            }
            match self.after_stream() {
                AfterStream::Stop => break,
                AfterStream::Rewind => {
                    if let Err(err) = self.source.rewind(ctx) {
                        self.stats.add_error();
                        tracing::error!(node = %self.name, %err, "rewind failed; stopping node");
                        break;
                    }
                }
            }
        }

        self.dsts.close(ctx);
        self.state.advance(NodeState::Stopping);
        self.state.advance(NodeState::Stopped);
    }

    /// Parks between emit phases until a rewind or a stop arrives.
    fn after_stream(&self) -> AfterStream {
        let mut signal = self.rewind.lock();
        loop {
            if signal.stopping {
                return AfterStream::Stop;
            }
            if signal.requested {
                signal.requested = false;
                return AfterStream::Rewind;
            }
            self.rewind_cond.wait(&mut signal);
        }
    }
}

impl std::fmt::Debug for SourceNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceNode")
            .field("name", &self.name)
            .field("state", &self.state.get())
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}

/// Adapts a box node's fan-in stream onto its operator.
struct BoxWriter {
    node_name: String,
    op: Arc<dyn Operator>,
    stats: Arc<NodeStats>,
    emitter: EmitCounter,
}

impl Writer for BoxWriter {
    fn write(&self, ctx: &Context, tuple: Tuple) -> Result<(), TopologyError> {
        self.stats.add_received();
        if let Err(err) = self.op.process(ctx, tuple, &self.emitter) {
            self.stats.add_error_dropping();
            tracing::warn!(node = %self.node_name, %err, "operator failed; tuple dropped");
            return Err(err);
        }
        Ok(())
    }
}

/// A box node: pours its fan-in through an [`Operator`] into its fan-out.
pub struct BoxNode {
    name: String,
    srcs: Arc<DataSources>,
    dsts: Arc<DataDestinations>,
    state: Arc<StateMachine>,
    stats: Arc<NodeStats>,
    parallelism: usize,
    writer: BoxWriter,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BoxNode {
    pub(super) fn new(
        name: impl Into<String>,
        op: Arc<dyn Operator>,
        parallelism: usize,
    ) -> Self {
        let name = name.into();
        let stats = Arc::new(NodeStats::default());
        let dsts = Arc::new(DataDestinations::new(name.clone()));
        let writer = BoxWriter {
            node_name: name.clone(),
            op,
            stats: Arc::clone(&stats),
            emitter: EmitCounter {
                stats: Arc::clone(&stats),
                dsts: Arc::clone(&dsts),
            },
        };
        Self {
            srcs: Arc::new(DataSources::new(name.clone())),
            dsts,
            state: Arc::new(StateMachine::default()),
            stats,
            parallelism: parallelism.max(1),
            writer,
            name,
            handle: Mutex::new(None),
        }
    }

    /// Returns the node's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the node's role.
    #[must_use]
    pub fn node_type(&self) -> NodeType {
        NodeType::Box
    }

    /// Returns the node's lifecycle state.
    #[must_use]
    pub fn state(&self) -> NodeState {
        self.state.get()
    }

    /// Returns a snapshot of the node's counters.
    #[must_use]
    pub fn stats(&self) -> NodeStatsSnapshot {
        self.stats.snapshot()
    }

    /// Returns the node's fan-in aggregator, for wiring upstream edges.
    #[must_use]
    pub fn sources(&self) -> &Arc<DataSources> {
        &self.srcs
    }

    /// Returns the node's fan-out distributor, for wiring downstream edges.
    #[must_use]
    pub fn destinations(&self) -> &Arc<DataDestinations> {
        &self.dsts
    }

    /// Requests that queued input drain before the node stops.
    pub fn enable_graceful_stop(&self) {
        self.srcs.enable_graceful_stop();
    }

    /// Stops the node and blocks until its state reaches `Stopped`.
    /// Idempotent.
    pub fn stop(&self, ctx: &Context) {
        // Stop wakes any pauser: a worker blocked in a paused distributor
        // must be able to finish so the fan-in can drain.
        self.dsts.resume();
        self.srcs.stop(ctx);
        self.state.wait(NodeState::Stopped);
        self.join();
    }

    pub(super) fn set_handle(&self, handle: JoinHandle<()>) {
        *self.handle.lock() = Some(handle);
    }

    fn join(&self) {
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    /// The node's thread body.
    pub(super) fn run(&self, ctx: &Context) {
        self.state.advance(NodeState::Starting);
        self.state.advance(NodeState::Running);

        if let Err(err) = self.srcs.pour(ctx, &self.writer, self.parallelism) {
            tracing::warn!(node = %self.name, %err, "box node never started pouring");
        }

        self.dsts.close(ctx);
        self.state.advance(NodeState::Stopping);
        self.state.advance(NodeState::Stopped);
    }
}

impl std::fmt::Debug for BoxNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxNode")
            .field("name", &self.name)
            .field("state", &self.state.get())
            .field("stats", &self.stats.snapshot())
            .field("parallelism", &self.parallelism)
            .finish_non_exhaustive()
    }
}

/// Counts arrivals, then forwards to the user sink.
struct SinkWriter {
    sink: Arc<dyn Sink>,
    stats: Arc<NodeStats>,
}

impl Writer for SinkWriter {
    fn write(&self, ctx: &Context, tuple: Tuple) -> Result<(), TopologyError> {
        self.stats.add_received();
        if let Err(err) = self.sink.write(ctx, tuple) {
            self.stats.add_error_dropping();
            return Err(err);
        }
        Ok(())
    }
}

/// A sink node: pours its fan-in directly into a user [`Sink`].
pub struct SinkNode {
    name: String,
    sink: Arc<dyn Sink>,
    srcs: Arc<DataSources>,
    state: Arc<StateMachine>,
    stats: Arc<NodeStats>,
    writer: SinkWriter,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SinkNode {
    pub(super) fn new(name: impl Into<String>, sink: Arc<dyn Sink>) -> Self {
        let name = name.into();
        let stats = Arc::new(NodeStats::default());
        let writer = SinkWriter {
            sink: Arc::clone(&sink),
            stats: Arc::clone(&stats),
        };
        Self {
            srcs: Arc::new(DataSources::new(name.clone())),
            sink,
            state: Arc::new(StateMachine::default()),
            stats,
            writer,
            name,
            handle: Mutex::new(None),
        }
    }

    /// Returns the node's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the node's role.
    #[must_use]
    pub fn node_type(&self) -> NodeType {
        NodeType::Sink
    }

    /// Returns the node's lifecycle state.
    #[must_use]
    pub fn state(&self) -> NodeState {
        self.state.get()
    }

    /// Returns a snapshot of the node's counters.
    #[must_use]
    pub fn stats(&self) -> NodeStatsSnapshot {
        self.stats.snapshot()
    }

    /// Returns the node's fan-in aggregator, for wiring upstream edges.
    #[must_use]
    pub fn sources(&self) -> &Arc<DataSources> {
        &self.srcs
    }

    /// Requests that queued input drain before the node stops.
    pub fn enable_graceful_stop(&self) {
        self.srcs.enable_graceful_stop();
    }

    /// Stops the node and blocks until its state reaches `Stopped`.
    /// Idempotent.
    pub fn stop(&self, ctx: &Context) {
        self.srcs.stop(ctx);
        self.state.wait(NodeState::Stopped);
        self.join();
    }

    pub(super) fn set_handle(&self, handle: JoinHandle<()>) {
        *self.handle.lock() = Some(handle);
    }

    fn join(&self) {
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    /// The node's thread body.
    pub(super) fn run(&self, ctx: &Context) {
        self.state.advance(NodeState::Starting);
        self.state.advance(NodeState::Running);

        if let Err(err) = self.srcs.pour(ctx, &self.writer, 1) {
            tracing::warn!(node = %self.name, %err, "sink node never started pouring");
        }

        if let Err(err) = self.sink.close(ctx) {
            self.stats.add_error();
            tracing::warn!(node = %self.name, %err, "sink close failed");
        }
        self.state.advance(NodeState::Stopping);
        self.state.advance(NodeState::Stopped);
    }
}

impl std::fmt::Debug for SinkNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkNode")
            .field("name", &self.name)
            .field("state", &self.state.get())
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}
