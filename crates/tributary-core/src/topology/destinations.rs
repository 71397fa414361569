//! Fan-out distributor: broadcasts each emitted tuple to M output pipes.
//!
//! A [`DataDestinations`] sits behind every non-sink node. It owns the
//! sender end of each output pipe and duplicates every written tuple onto
//! all of them — a deep copy per destination when M ≥ 2 (downstream nodes
//! mutate `input_name` and the trace), a move when M = 1.
//!
//! Destinations are dynamic. [`remove`](DataDestinations::remove) closes the
//! pipe's sender immediately; tuples already handed to that pipe stay
//! deliverable downstream. A destination whose *receiver* closed is healed
//! lazily: the next [`write`](DataDestinations::write) that observes the
//! closed pipe evicts it from the set.
//!
//! [`pause`](DataDestinations::pause) blocks subsequent writes inside the
//! distributor until [`resume`](DataDestinations::resume); both are
//! idempotent, and a close wakes any pauser.

use parking_lot::{Condvar, Mutex, RwLock};
use smallvec::SmallVec;

use fxhash::FxHashMap;

use crate::context::Context;
use crate::tuple::Tuple;

use super::error::TopologyError;
use super::pipe::PipeSender;
use super::state::{NodeState, StateMachine};
use super::traits::Writer;

/// Fan-out distributor for one node.
///
/// Ready on construction: the lifecycle starts at `Running` and ends at
/// `Stopped` via [`close`](DataDestinations::close), passing through
/// `Paused` while paused.
pub struct DataDestinations {
    node_name: String,
    state: StateMachine,
    paused: Mutex<bool>,
    pause_cond: Condvar,
    /// Registered outputs. Read on the hot path (broadcast), written by
    /// add/remove/evict.
    outputs: RwLock<FxHashMap<String, PipeSender>>,
}

impl DataDestinations {
    /// Creates a distributor for the named node.
    #[must_use]
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            state: StateMachine::new(NodeState::Running),
            paused: Mutex::new(false),
            pause_cond: Condvar::new(),
            outputs: RwLock::new(FxHashMap::default()),
        }
    }

    /// Registers a new destination under a unique edge name.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::Parameter`] for an empty name,
    /// [`TopologyError::DuplicateName`] if the name is taken, or
    /// [`TopologyError::PipeClosed`] once the distributor is closed.
    pub fn add(&self, name: impl Into<String>, sender: PipeSender) -> Result<(), TopologyError> {
        let name = name.into();
        if name.is_empty() {
            return Err(TopologyError::Parameter("empty destination name".to_owned()));
        }
        if self.state.stop_requested() {
            return Err(TopologyError::PipeClosed);
        }

        let mut outputs = self.outputs.write();
        if outputs.contains_key(&name) {
            return Err(TopologyError::DuplicateName(name));
        }
        outputs.insert(name, sender);
        Ok(())
    }

    /// Removes a destination by name, closing its sender immediately.
    ///
    /// Idempotent; removing a nonexistent name is a no-op. Tuples already
    /// handed to the pipe remain deliverable — the downstream receiver
    /// drains them and then observes the close. (Contrast with
    /// [`DataSources::remove`](super::DataSources::remove), which drains
    /// before detaching.)
    pub fn remove(&self, name: &str) {
        let removed = self.outputs.write().remove(name);
        if let Some(sender) = removed {
            sender.close();
        }
    }

    /// Returns true if a destination with the given name is registered.
    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.outputs.read().contains_key(name)
    }

    /// Returns the number of registered destinations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.outputs.read().len()
    }

    /// Returns true if no destinations are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outputs.read().is_empty()
    }

    /// Returns the distributor's lifecycle state.
    #[must_use]
    pub fn state(&self) -> NodeState {
        self.state.get()
    }

    /// Blocks subsequent writes until [`resume`](DataDestinations::resume).
    ///
    /// Idempotent. Tuples fully delivered before `pause` returns are not
    /// affected.
    pub fn pause(&self) {
        let mut paused = self.paused.lock();
        *paused = true;
        drop(paused);
        let _ = self
            .state
            .try_transition("pause", NodeState::Running, NodeState::Paused);
    }

    /// Unblocks writes paused by [`pause`](DataDestinations::pause).
    /// Idempotent.
    pub fn resume(&self) {
        let mut paused = self.paused.lock();
        *paused = false;
        self.pause_cond.notify_all();
        drop(paused);
        let _ = self
            .state
            .try_transition("resume", NodeState::Paused, NodeState::Running);
    }

    /// Closes every downstream sender and stops the distributor.
    ///
    /// Idempotent; wakes any writer blocked in a pause. Downstream
    /// receivers drain their queues and then observe the close.
    pub fn close(&self, _ctx: &Context) {
        if self.state.advance(NodeState::Stopping) > NodeState::Stopping {
            return;
        }
        // Wake pausers so their writes can fail over. Notifying under the
        // paused lock orders this after any writer that saw the pre-stop
        // state has parked; without it the wakeup can be lost.
        {
            let _paused = self.paused.lock();
            self.pause_cond.notify_all();
        }

        let outputs = self.outputs.read();
        for sender in outputs.values() {
            sender.close();
        }
        drop(outputs);

        self.state.advance(NodeState::Stopped);
    }

    /// Waits while the distributor is paused. Returns once writable or
    /// closed.
    fn wait_while_paused(&self) {
        let mut paused = self.paused.lock();
        while *paused && !self.state.stop_requested() {
            self.pause_cond.wait(&mut paused);
        }
    }

    /// Broadcasts one tuple to every registered destination.
    fn broadcast(&self, ctx: &Context, tuple: Tuple) -> Result<(), TopologyError> {
        let mut evicted: SmallVec<[String; 4]> = SmallVec::new();
        {
            let outputs = self.outputs.read();
            if outputs.is_empty() {
                // A node with no outputs silently discards; this is the
                // normal state of a freshly added node before wiring.
                return Ok(());
            }

            let last = outputs.len() - 1;
            let mut pending = Some(tuple);
            for (i, (name, sender)) in outputs.iter().enumerate() {
                // Deep-copy for all but the last destination; the last one
                // takes the original.
                let copy = if i == last {
                    pending.take()
                } else {
                    pending.clone()
                };
                let Some(copy) = copy else { break };
                if let Err(TopologyError::PipeClosed) = sender.write(ctx, copy) {
                    // Receiver side closed; heal by evicting below.
                    evicted.push(name.clone());
                }
            }
        }

        if !evicted.is_empty() {
            let mut outputs = self.outputs.write();
            for name in evicted {
                tracing::debug!(
                    node = %self.node_name,
                    destination = %name,
                    "removing closed destination"
                );
                outputs.remove(&name);
            }
        }
        Ok(())
    }
}

impl Writer for DataDestinations {
    /// Broadcasts `tuple` to every live destination.
    ///
    /// Blocks while paused. Destinations whose receiver closed are evicted
    /// before the call returns; eviction is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::PipeClosed`] once the distributor itself is
    /// closed.
    fn write(&self, ctx: &Context, tuple: Tuple) -> Result<(), TopologyError> {
        self.wait_while_paused();
        if self.state.stop_requested() {
            return Err(TopologyError::PipeClosed);
        }
        self.broadcast(ctx, tuple)
    }
}

impl std::fmt::Debug for DataDestinations {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataDestinations")
            .field("node", &self.node_name)
            .field("state", &self.state.get())
            .field("outputs", &self.len())
            .field("paused", &*self.paused.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Map, Value};
    use crate::topology::pipe::{pipe, PipeReceiver};
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;

    fn test_tuple() -> Tuple {
        let mut data = Map::default();
        data.insert("v".into(), Value::Int(1));
        Tuple::new(data).with_input_name("test_component")
    }

    fn two_destinations() -> (DataDestinations, Vec<PipeReceiver>) {
        let dsts = DataDestinations::new("test_component");
        let mut receivers = Vec::new();
        for i in 1..=2 {
            let (s, r) = pipe(format!("test{i}"), 1);
            dsts.add(format!("test_node_{i}"), s).unwrap();
            receivers.push(r);
        }
        (dsts, receivers)
    }

    #[test]
    fn test_write_with_no_destinations_is_ok() {
        let ctx = Context::new();
        let dsts = DataDestinations::new("test_component");
        assert!(dsts.write(&ctx, test_tuple()).is_ok());
    }

    #[test]
    fn test_broadcast_reaches_all_destinations() {
        let ctx = Context::new();
        let (dsts, recvs) = two_destinations();

        dsts.write(&ctx, test_tuple()).unwrap();

        let t1 = recvs[0].recv().unwrap();
        let t2 = recvs[1].recv().unwrap();
        assert_eq!(t1.input_name, "test1");
        assert_eq!(t2.input_name, "test2");
        assert_eq!(t1.data["v"], Value::Int(1));
        assert_eq!(t2.data["v"], Value::Int(1));
    }

    #[test]
    fn test_close_signals_receivers_after_delivery() {
        let ctx = Context::new();
        let (dsts, recvs) = two_destinations();

        dsts.write(&ctx, test_tuple()).unwrap();
        dsts.close(&ctx);
        dsts.close(&ctx); // idempotent

        for r in &recvs {
            assert!(r.recv().is_some());
            assert!(r.recv().is_none());
        }
        assert_eq!(
            dsts.write(&ctx, test_tuple()),
            Err(TopologyError::PipeClosed)
        );
    }

    #[test]
    fn test_receiver_closed_destination_is_evicted() {
        let ctx = Context::new();
        let (dsts, recvs) = two_destinations();

        recvs[0].close();
        while recvs[0].try_recv().is_some() {}

        // Keep the healthy destination drained so writes never block.
        let healthy = &recvs[1];
        while dsts.has("test_node_1") {
            dsts.write(&ctx, test_tuple()).unwrap();
            while healthy.try_recv().is_some() {}
        }

        // The healthy destination still receives new tuples.
        dsts.write(&ctx, test_tuple()).unwrap();
        assert!(healthy.recv().is_some());
        dsts.close(&ctx);
    }

    #[test]
    fn test_late_destination_sees_only_new_tuples() {
        let ctx = Context::new();
        let (dsts, recvs) = two_destinations();

        dsts.write(&ctx, test_tuple()).unwrap();

        let (s3, r3) = pipe("test3", 1);
        dsts.add("test_node_3", s3).unwrap();

        assert!(r3.try_recv().is_none());

        for r in &recvs {
            let _ = r.try_recv();
        }
        dsts.write(&ctx, test_tuple()).unwrap();
        assert!(r3.recv().is_some());
        dsts.close(&ctx);
    }

    #[test]
    fn test_duplicate_destination_name_rejected() {
        let (dsts, _recvs) = two_destinations();
        let (s, _r) = pipe("hoge", 1);
        assert_eq!(
            dsts.add("test_node_1", s),
            Err(TopologyError::DuplicateName("test_node_1".into()))
        );
    }

    #[test]
    fn test_remove_closes_destination() {
        let ctx = Context::new();
        let (dsts, recvs) = two_destinations();

        dsts.remove("test_node_1");

        assert!(recvs[0].recv().is_none());
        dsts.write(&ctx, test_tuple()).unwrap();
        assert!(recvs[1].recv().is_some());
    }

    #[test]
    fn test_remove_after_write_keeps_tuple_deliverable() {
        let ctx = Context::new();
        let (dsts, mut recvs) = two_destinations();

        let drainer = {
            let r2 = recvs.pop().unwrap();
            thread::spawn(move || while r2.recv().is_some() {})
        };

        dsts.write(&ctx, test_tuple()).unwrap();
        dsts.remove("test_node_1");

        assert!(recvs[0].recv().is_some());
        assert!(recvs[0].recv().is_none());

        dsts.close(&ctx);
        drainer.join().unwrap();
    }

    #[test]
    fn test_remove_nonexistent_is_noop() {
        let (dsts, _recvs) = two_destinations();
        dsts.remove("test_node_100");
        dsts.remove("test_node_100");
        assert_eq!(dsts.len(), 2);
    }

    #[test]
    fn test_pause_blocks_and_resume_unblocks() {
        let ctx = Arc::new(Context::new());
        let (dsts, recvs) = two_destinations();
        let dsts = Arc::new(dsts);

        dsts.pause();
        dsts.pause(); // idempotent
        assert_eq!(dsts.state(), NodeState::Paused);

        let (started_tx, started_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();
        let writer = {
            let dsts = Arc::clone(&dsts);
            let ctx = Arc::clone(&ctx);
            thread::spawn(move || {
                started_tx.send(()).unwrap();
                let result = dsts.write(&ctx, test_tuple());
                done_tx.send(()).unwrap();
                result
            })
        };
        started_rx.recv().unwrap();

        // The write must still be blocked.
        assert!(done_rx
            .recv_timeout(std::time::Duration::from_millis(50))
            .is_err());

        dsts.resume();
        dsts.resume(); // idempotent
        done_rx.recv().unwrap();
        writer.join().unwrap().unwrap();

        assert!(recvs[0].recv().is_some());
        assert!(recvs[1].recv().is_some());
    }

    #[test]
    fn test_close_wakes_paused_writer() {
        let ctx = Arc::new(Context::new());
        let (dsts, _recvs) = two_destinations();
        let dsts = Arc::new(dsts);

        dsts.pause();
        let writer = {
            let dsts = Arc::clone(&dsts);
            let ctx = Arc::clone(&ctx);
            thread::spawn(move || dsts.write(&ctx, test_tuple()))
        };

        dsts.close(&ctx);
        assert_eq!(writer.join().unwrap(), Err(TopologyError::PipeClosed));
    }
}
