//! # Tributary Core
//!
//! The streaming topology runtime at the heart of the Tributary
//! continuous-query engine: typed records (*tuples*) flowing through a
//! directed graph of user-defined nodes.
//!
//! This crate provides:
//! - **Pipes**: bounded channels with drop policies and two-sided close
//! - **Fan-in / fan-out**: dynamic edge sets with backpressure and
//!   pause/resume
//! - **Lifecycle**: a shared state machine with monitor-based waiting
//! - **Node glue**: source, box, and sink nodes with per-node counters
//!
//! ## Design principles
//!
//! 1. **Tasks communicate through pipes** — never through shared mutable
//!    state
//! 2. **No busy-polling** — every wait is a condition-variable wait
//! 3. **Stop is the universal cancel** — idempotent and safe from any state
//! 4. **Drops are explicit** — every lost tuple is counted and attributable
//!
//! ## Example
//!
//! ```rust,ignore
//! use tributary_core::prelude::*;
//!
//! let ctx = Arc::new(Context::new());
//! let topology = Topology::new(Arc::clone(&ctx));
//!
//! topology.add_source("trades", Arc::new(my_source))?;
//! topology.add_box("normalize", Arc::new(my_operator), &["trades"])?;
//! topology.add_sink("out", Arc::new(my_sink), &["normalize"])?;
//!
//! // ... data flows ...
//! topology.stop();
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod context;
pub mod data;
pub mod topology;
pub mod tuple;

pub use context::{Context, ContextFlags, SharedState, SharedStateError, SharedStateRegistry};
pub use tuple::{EventType, TraceEvent, Tuple};

/// Result type for tributary-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for tributary-core.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// Topology runtime errors.
    #[error("topology error: {0}")]
    Topology(#[from] topology::TopologyError),

    /// Data model type errors.
    #[error("type error: {0}")]
    Type(#[from] data::TypeError),

    /// Shared-state registry errors.
    #[error("shared state error: {0}")]
    SharedState(#[from] context::SharedStateError),
}

/// Commonly used types, importable in one line.
pub mod prelude {
    pub use crate::context::Context;
    pub use crate::data::{Map, Value};
    pub use crate::topology::{
        pipe, DataDestinations, DataSources, DropMode, NodeState, Operator, Sink, Source,
        Topology, TopologyError, Updater, Writer,
    };
    pub use crate::tuple::Tuple;
}
