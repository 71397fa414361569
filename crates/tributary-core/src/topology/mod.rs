//! # Streaming topology runtime
//!
//! The per-node I/O machinery of the engine: bounded pipes between nodes,
//! fan-in aggregation, fan-out distribution, and the lifecycle state
//! machine that coordinates them.
//!
//! ## Architecture
//!
//! ```text
//!                       ┌──────────────── node ────────────────┐
//!                       │                                      │
//! upstream ──▶ Pipe ──▶ │ DataSources ─▶ process() ─▶ DataDest │ ──▶ Pipe ──▶ downstream
//! upstream ──▶ Pipe ──▶ │  (fan-in)                  (fan-out) │ ──▶ Pipe ──▶ downstream
//!                       │                                      │
//!                       └──────────────────────────────────────┘
//! ```
//!
//! Each edge is a [`pipe()`]: a named, bounded FIFO with a drop policy and
//! two-sided close. A [`DataSources`] merges N input pipes into one serial
//! stream for the node's processing function; a [`DataDestinations`]
//! duplicates each emitted tuple onto M output pipes. All three share the
//! [`NodeState`] lifecycle.
//!
//! ## Module structure
//!
//! - [`pipe`](mod@self::pipe): bounded channel with drop policies
//! - [`state`]: lifecycle state machine with monitor-based waiting
//! - [`sources`]: fan-in aggregator
//! - [`destinations`]: fan-out distributor
//! - [`node`] / [`builder`]: per-node glue and topology assembly
//! - [`traits`]: contracts implemented by user components
//! - [`error`]: error kinds
//!
//! ## Delivery guarantees
//!
//! At-most-once under a drop policy or non-graceful stop; at-least-once
//! under graceful stop. Writes from one producer to one pipe preserve their
//! order; there is no ordering across different inputs of a node.

pub mod builder;
pub mod destinations;
pub mod error;
pub mod node;
pub mod pipe;
pub mod sources;
pub mod state;
pub mod traits;

#[cfg(test)]
pub(crate) mod testutil;

#[cfg(test)]
mod tests;

pub use builder::{Topology, TopologyConfig, DEFAULT_PIPE_CAPACITY};
pub use destinations::DataDestinations;
pub use error::TopologyError;
pub use node::{BoxNode, NodeStats, NodeStatsSnapshot, NodeType, SinkNode, SourceNode};
pub use pipe::{pipe, DropMode, PipeReceiver, PipeSender, PipeStats};
pub use sources::DataSources;
pub use state::{NodeState, StateMachine};
pub use traits::{Operator, Sink, Source, Updater, Writer, WriterFunc};
