//! Per-topology execution context.
//!
//! A [`Context`] is constructed once per topology and passed by reference on
//! every call into the runtime. It carries debugging flags, the
//! topology-wide dropped-tuple counter, and the shared-state registry used
//! for live reconfiguration. The context itself is immutable after
//! construction; all interior fields are atomics or locks.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::RwLock;

/// Debugging toggles, atomically flippable at runtime.
#[derive(Debug, Default)]
pub struct ContextFlags {
    tuple_trace: AtomicBool,
    dropped_tuple_log: AtomicBool,
}

impl ContextFlags {
    /// Returns whether tuples record trace events on each hop.
    #[inline]
    #[must_use]
    pub fn tuple_trace(&self) -> bool {
        self.tuple_trace.load(Ordering::Relaxed)
    }

    /// Enables or disables tuple tracing.
    pub fn set_tuple_trace(&self, enabled: bool) {
        self.tuple_trace.store(enabled, Ordering::Relaxed);
    }

    /// Returns whether dropped tuples are logged.
    #[inline]
    #[must_use]
    pub fn dropped_tuple_log(&self) -> bool {
        self.dropped_tuple_log.load(Ordering::Relaxed)
    }

    /// Enables or disables dropped-tuple logging.
    pub fn set_dropped_tuple_log(&self, enabled: bool) {
        self.dropped_tuple_log.store(enabled, Ordering::Relaxed);
    }
}

/// Errors from the shared-state registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SharedStateError {
    /// A state with the same name is already registered.
    #[error("shared state already registered: {0}")]
    DuplicateName(String),

    /// No state with the given name is registered.
    #[error("shared state not found: {0}")]
    NotFound(String),
}

/// A named value shared between nodes of one topology.
///
/// States that support live reconfiguration additionally implement
/// [`Updater`](crate::topology::Updater); callers downcast through
/// [`as_any`](SharedState::as_any) to reach the concrete type.
pub trait SharedState: Send + Sync {
    /// Returns self as `Any` for downcasting.
    fn as_any(&self) -> &dyn Any;
}

/// Name-keyed registry of shared states.
///
/// Reads take the read lock; registration and removal take the write lock.
#[derive(Default)]
pub struct SharedStateRegistry {
    states: RwLock<FxHashMap<String, Arc<dyn SharedState>>>,
}

impl SharedStateRegistry {
    /// Registers a state under a unique name.
    ///
    /// # Errors
    ///
    /// Returns [`SharedStateError::DuplicateName`] if the name is taken.
    pub fn add(
        &self,
        name: impl Into<String>,
        state: Arc<dyn SharedState>,
    ) -> Result<(), SharedStateError> {
        let name = name.into();
        let mut states = self.states.write();
        if states.contains_key(&name) {
            return Err(SharedStateError::DuplicateName(name));
        }
        states.insert(name, state);
        Ok(())
    }

    /// Looks up a state by name.
    ///
    /// # Errors
    ///
    /// Returns [`SharedStateError::NotFound`] if no state has the name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn SharedState>, SharedStateError> {
        self.states
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| SharedStateError::NotFound(name.to_owned()))
    }

    /// Removes a state. Removing an unknown name is a no-op.
    pub fn remove(&self, name: &str) {
        self.states.write().remove(name);
    }

    /// Returns the registered names.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.states.read().keys().cloned().collect()
    }
}

impl std::fmt::Debug for SharedStateRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedStateRegistry")
            .field("names", &self.names())
            .finish()
    }
}

/// Topology-wide execution context.
#[derive(Debug, Default)]
pub struct Context {
    flags: ContextFlags,
    dropped_tuples: AtomicU64,
    shared_states: SharedStateRegistry,
}

impl Context {
    /// Creates a context with default flags.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the debugging flags.
    #[inline]
    #[must_use]
    pub fn flags(&self) -> &ContextFlags {
        &self.flags
    }

    /// Returns the shared-state registry.
    #[inline]
    #[must_use]
    pub fn shared_states(&self) -> &SharedStateRegistry {
        &self.shared_states
    }

    /// Records one dropped tuple.
    ///
    /// Increments the topology-wide counter and, when dropped-tuple logging
    /// is enabled, logs where and why the tuple was lost.
    pub fn report_dropped_tuple(&self, location: &str, reason: &str) {
        self.dropped_tuples.fetch_add(1, Ordering::Relaxed);
        if self.flags.dropped_tuple_log() {
            tracing::debug!(location, reason, "tuple dropped");
        }
    }

    /// Returns the total number of tuples dropped so far.
    #[must_use]
    pub fn dropped_tuples(&self) -> u64 {
        self.dropped_tuples.load(Ordering::Relaxed)
    }
}
