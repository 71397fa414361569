//! Lifecycle state machine shared by nodes, fan-in, and fan-out.
//!
//! Every runtime component advances through the same state sequence:
//!
//! ```text
//! Initialized → Starting → Running ⇄ Paused → Stopping → Stopped
//! ```
//!
//! Transitions are monotone except for the sanctioned `Paused → Running`
//! resume. A component stopped before it ever started jumps straight from
//! `Initialized` to `Stopped`.
//!
//! Waiting is a classical monitor: state behind a mutex, all waiters
//! signalled on every transition. `wait(target)` returns once the state is
//! at or past the target, so `wait(Running)` returns immediately for a
//! component that is already `Paused` or `Stopped`.

use parking_lot::{Condvar, Mutex};

use super::error::TopologyError;

/// Lifecycle state of a runtime component.
///
/// The discriminant order is the lifecycle order; `Paused` sits past
/// `Running` so that ordinal comparison treats a paused component as having
/// reached the running phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum NodeState {
    /// Constructed, not yet started.
    Initialized = 0,
    /// Start requested, not yet processing.
    Starting = 1,
    /// Actively processing.
    Running = 2,
    /// Processing suspended; resumable.
    Paused = 3,
    /// Stop requested; inflight work draining.
    Stopping = 4,
    /// Terminal.
    Stopped = 5,
}

/// Monitor-backed holder of a [`NodeState`].
#[derive(Debug)]
pub struct StateMachine {
    state: Mutex<NodeState>,
    cond: Condvar,
}

impl StateMachine {
    /// Creates a state machine in the given initial state.
    #[must_use]
    pub fn new(initial: NodeState) -> Self {
        Self {
            state: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    /// Returns the current state.
    #[must_use]
    pub fn get(&self) -> NodeState {
        *self.state.lock()
    }

    /// Unconditionally moves to `next` and wakes all waiters.
    pub fn set(&self, next: NodeState) {
        let mut state = self.state.lock();
        *state = next;
        self.cond.notify_all();
    }

    /// Moves from `from` to `to` atomically.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::WrongState`] if the current state is not
    /// `from`.
    pub fn try_transition(
        &self,
        op: &'static str,
        from: NodeState,
        to: NodeState,
    ) -> Result<(), TopologyError> {
        let mut state = self.state.lock();
        if *state != from {
            return Err(TopologyError::WrongState { op, state: *state });
        }
        *state = to;
        self.cond.notify_all();
        Ok(())
    }

    /// Moves to `target` only if the current state is earlier.
    ///
    /// Returns the state after the call. This is the race-safe form of
    /// `set` for stop paths: a component already past `target` is left
    /// alone.
    pub fn advance(&self, target: NodeState) -> NodeState {
        let mut state = self.state.lock();
        if *state < target {
            *state = target;
            self.cond.notify_all();
        }
        *state
    }

    /// Blocks until the state is at or past `target`; returns the state
    /// observed at wakeup.
    pub fn wait(&self, target: NodeState) -> NodeState {
        let mut state = self.state.lock();
        while *state < target {
            self.cond.wait(&mut state);
        }
        *state
    }

    /// Returns true once a stop has been requested (or completed).
    #[inline]
    #[must_use]
    pub fn stop_requested(&self) -> bool {
        self.get() >= NodeState::Stopping
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new(NodeState::Initialized)
    }
}
