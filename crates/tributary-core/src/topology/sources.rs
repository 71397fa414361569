//! Fan-in aggregator: merges N input pipes into one serial stream.
//!
//! A [`DataSources`] sits in front of every non-source node. It owns the
//! receiver end of each input pipe and multiplexes all of them into calls on
//! a single downstream [`Writer`] (the node's processing function).
//!
//! Inputs are dynamic: [`add`](DataSources::add) and
//! [`remove`](DataSources::remove) work while the aggregator is running.
//! Removal is graceful on this side: the input's receiver is closed so the
//! upstream writer fails over, but tuples already queued on it are still
//! delivered before the input is detached.
//!
//! Multiplexing is readiness-aware. Registered pipes signal a shared
//! [`ReadyMonitor`] on every enqueue and close; the pour loop scans the
//! inputs round-robin from a rotating cursor (bounded progress on every
//! non-empty input, no starvation) and parks on the monitor when nothing is
//! ready. No busy-polling, no sleeping.
//!
//! `pour` accepts a `parallelism` bound `P`: the loop runs on the calling
//! thread plus `P - 1` helpers, so at most `P` `writer.write` calls are
//! inflight. Within-input ordering survives only up to the writer call;
//! beyond that the downstream node is responsible.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::RwLock;

use crate::context::Context;
use crate::tuple::{EventType, Tuple};

use super::error::TopologyError;
use super::pipe::{PipeReceiver, ReadyMonitor};
use super::state::{NodeState, StateMachine};
use super::traits::Writer;

struct InputSlot {
    name: String,
    receiver: PipeReceiver,
}

/// Fan-in aggregator for one node.
pub struct DataSources {
    node_name: String,
    state: StateMachine,
    monitor: Arc<ReadyMonitor>,
    /// Registered inputs. Read on the hot path (scan), written by
    /// add/remove/detach.
    inputs: RwLock<Vec<InputSlot>>,
    /// Rotating scan start for round-robin fairness.
    cursor: AtomicUsize,
    num_errors: AtomicU64,
    graceful_stop: AtomicBool,
}

impl DataSources {
    /// Creates an aggregator for the named node.
    #[must_use]
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            state: StateMachine::default(),
            monitor: Arc::new(ReadyMonitor::default()),
            inputs: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            num_errors: AtomicU64::new(0),
            graceful_stop: AtomicBool::new(false),
        }
    }

    /// Registers a new input under a unique edge name.
    ///
    /// May be called before or during `pour`; a new input contributes
    /// tuples immediately.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::Parameter`] for an empty name,
    /// [`TopologyError::DuplicateName`] if the name is taken, or
    /// [`TopologyError::WrongState`] once the aggregator is stopping.
    pub fn add(
        &self,
        name: impl Into<String>,
        receiver: PipeReceiver,
    ) -> Result<(), TopologyError> {
        let name = name.into();
        if name.is_empty() {
            return Err(TopologyError::Parameter("empty input name".to_owned()));
        }

        let state = self.state.get();
        if state >= NodeState::Stopping {
            return Err(TopologyError::WrongState { op: "add", state });
        }

        let mut inputs = self.inputs.write();
        if inputs.iter().any(|slot| slot.name == name) {
            return Err(TopologyError::DuplicateName(name));
        }
        receiver.attach_monitor(Arc::clone(&self.monitor));
        inputs.push(InputSlot { name, receiver });
        drop(inputs);

        self.monitor.notify();
        Ok(())
    }

    /// Removes an input by name. Idempotent; unknown names are a no-op.
    ///
    /// The input's receiver is closed so the upstream sender fails over,
    /// but tuples already queued on it are still delivered to the node
    /// before the input is detached (removal is graceful on this side —
    /// unlike [`DataDestinations::remove`](super::DataDestinations::remove),
    /// which closes immediately).
    pub fn remove(&self, name: &str) {
        let inputs = self.inputs.read();
        let Some(slot) = inputs.iter().find(|slot| slot.name == name) else {
            return;
        };
        slot.receiver.close();
        drop(inputs);

        // Without a running pour loop nothing will drain the queue, so the
        // input detaches right away.
        let state = self.state.get();
        if state == NodeState::Initialized || state == NodeState::Stopped {
            self.inputs.write().retain(|slot| slot.name != name);
        }
        self.monitor.notify();
    }

    /// Requests that `pour` drain every queued tuple before returning once
    /// stopped.
    pub fn enable_graceful_stop(&self) {
        self.graceful_stop.store(true, Ordering::Relaxed);
    }

    /// Returns the number of downstream writer failures (errors and
    /// panics) observed so far.
    #[must_use]
    pub fn num_errors(&self) -> u64 {
        self.num_errors.load(Ordering::Relaxed)
    }

    /// Returns the aggregator's lifecycle state.
    #[must_use]
    pub fn state(&self) -> NodeState {
        self.state.get()
    }

    /// Blocks until the lifecycle state is at or past `target`.
    pub fn wait_state(&self, target: NodeState) -> NodeState {
        self.state.wait(target)
    }

    /// Multiplexes all current and future inputs into `writer`.
    ///
    /// Transitions `Initialized → Starting → Running`, then serves inputs
    /// until [`stop`](DataSources::stop) completes the lifecycle. At most
    /// `parallelism` (min 1) concurrent `writer.write` calls are inflight.
    /// Returns once the aggregator has reached `Stopped`; with graceful
    /// stop enabled, every tuple queued at stop time has been delivered by
    /// then.
    ///
    /// Writer errors and panics are counted and swallowed; the stream keeps
    /// flowing.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::WrongState`] if the aggregator was already
    /// poured or stopped.
    pub fn pour(
        &self,
        ctx: &Context,
        writer: &dyn Writer,
        parallelism: usize,
    ) -> Result<(), TopologyError> {
        self.state
            .try_transition("pour", NodeState::Initialized, NodeState::Starting)?;

        // advance, not set: a racing stop may already have moved past
        // Running.
        self.state.advance(NodeState::Running);

        let workers = parallelism.max(1);
        thread::scope(|scope| {
            for _ in 1..workers {
                scope.spawn(|| self.run_worker(ctx, writer));
            }
            self.run_worker(ctx, writer);
        });

        self.cleanup(ctx);
        self.state.advance(NodeState::Stopped);
        Ok(())
    }

    /// Stops the aggregator. Idempotent, safe from any state.
    ///
    /// Closes every input receiver and completes the lifecycle. If `pour`
    /// is running, blocks until it has reached `Stopped` (draining first
    /// when graceful stop is enabled; discarding queued tuples otherwise).
    /// Stopping a never-poured aggregator jumps straight to `Stopped` and
    /// makes a later `pour` fail.
    pub fn stop(&self, _ctx: &Context) {
        if self
            .state
            .try_transition("stop", NodeState::Initialized, NodeState::Stopped)
            .is_ok()
        {
            self.close_all_receivers();
            return;
        }

        self.close_all_receivers();
        let after = self.state.advance(NodeState::Stopping);
        self.monitor.notify();
        if after != NodeState::Stopped {
            self.state.wait(NodeState::Stopped);
        }
    }

    fn graceful(&self) -> bool {
        self.graceful_stop.load(Ordering::Relaxed)
    }

    fn close_all_receivers(&self) {
        let inputs = self.inputs.read();
        for slot in inputs.iter() {
            slot.receiver.close();
        }
    }

    /// One multiplex loop. Runs until a stop is requested; under graceful
    /// stop it keeps serving until every input queue is empty.
    fn run_worker(&self, ctx: &Context, writer: &dyn Writer) {
        loop {
            let seen = self.monitor.generation();

            if self.state.stop_requested() {
                if !self.graceful() {
                    // Pending tuples are discarded by the final cleanup.
                    break;
                }
                match self.pop_ready() {
                    Some(tuple) => {
                        self.dispatch(ctx, writer, tuple);
                        continue;
                    }
                    // A sibling worker may still hold the last tuples;
                    // rescan until the queues really are empty.
                    None if self.any_queued() => continue,
                    None => break,
                }
            }

            if let Some(tuple) = self.pop_ready() {
                self.dispatch(ctx, writer, tuple);
                continue;
            }

            self.monitor.wait_past(seen);
        }
    }

    /// Pops one tuple from any ready input, scanning round-robin from a
    /// rotating cursor. Detaches inputs that are closed and fully drained.
    fn pop_ready(&self) -> Option<Tuple> {
        let mut drained = false;
        let tuple = {
            let inputs = self.inputs.read();
            let n = inputs.len();
            if n == 0 {
                return None;
            }
            let start = self.cursor.fetch_add(1, Ordering::Relaxed) % n;
            let mut found = None;
            for i in 0..n {
                let slot = &inputs[(start + i) % n];
                if let Some(tuple) = slot.receiver.try_recv() {
                    found = Some(tuple);
                    break;
                }
                if slot.receiver.is_drained() {
                    drained = true;
                }
            }
            found
        };

        if drained {
            self.inputs
                .write()
                .retain(|slot| !slot.receiver.is_drained());
        }
        tuple
    }

    /// Hands one tuple to the writer, capturing errors and panics.
    fn dispatch(&self, ctx: &Context, writer: &dyn Writer, mut tuple: Tuple) {
        if ctx.flags().tuple_trace() {
            let input = tuple.input_name.clone();
            tuple.add_trace_event(EventType::Input, input);
        }

        match panic::catch_unwind(AssertUnwindSafe(|| writer.write(ctx, tuple))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                self.num_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(node = %self.node_name, %err, "writer failed; tuple dropped");
            }
            Err(_) => {
                self.num_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(node = %self.node_name, "writer panicked; tuple dropped");
            }
        }
    }

    /// Final teardown after the workers exit: close everything, discard
    /// whatever a non-graceful stop left behind, and detach all inputs.
    fn cleanup(&self, ctx: &Context) {
        let mut inputs = self.inputs.write();
        for slot in inputs.drain(..) {
            slot.receiver.close();
            slot.receiver.discard_queue(ctx);
        }
    }

    fn any_queued(&self) -> bool {
        self.inputs
            .read()
            .iter()
            .any(|slot| !slot.receiver.is_empty())
    }
}

impl std::fmt::Debug for DataSources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSources")
            .field("node", &self.node_name)
            .field("state", &self.state.get())
            .field("inputs", &self.inputs.read().len())
            .field("num_errors", &self.num_errors())
            .finish()
    }
}
