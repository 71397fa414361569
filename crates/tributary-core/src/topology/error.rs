//! Error types for topology operations.

use super::state::NodeState;

/// Errors that can occur while building or running a topology.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopologyError {
    /// A write targeted a pipe that was closed from either end.
    #[error("pipe is closed")]
    PipeClosed,

    /// An edge or node with the same name already exists in the set.
    #[error("duplicate name: {0}")]
    DuplicateName(String),

    /// The operation is incompatible with the component's current state.
    #[error("operation {op} not allowed in state {state:?}")]
    WrongState {
        /// The attempted operation.
        op: &'static str,
        /// The state the component was in.
        state: NodeState,
    },

    /// A downstream writer returned an error (or panicked); counted and
    /// swallowed by the fan-in aggregator.
    #[error("user writer failed: {0}")]
    UserWrite(String),

    /// A source's stream generation failed.
    #[error("source failed: {0}")]
    Source(String),

    /// A parameter was rejected (bad name, bad value, bad type).
    #[error("invalid parameter: {0}")]
    Parameter(String),

    /// Rewind was requested on a source that cannot replay its stream.
    #[error("source is not rewindable: {0}")]
    Rewind(String),

    /// A referenced node does not exist in the topology.
    #[error("node not found: {0}")]
    NodeNotFound(String),
}
