//! The unit of data flowing through a topology.
//!
//! A [`Tuple`] wraps a schemaless [`Map`] together with two timestamps
//! (origin wall-clock and topology entry time), a debugging trace, and the
//! name of the edge it most recently arrived on. The input name is
//! overwritten on every cross-pipe hop so that a node with several inputs
//! can tell them apart.
//!
//! Tuples are value-semantic within one hop. `Clone` is a deep copy: the
//! fan-out distributor clones a tuple once per destination precisely because
//! downstream nodes mutate `input_name` and the trace independently.

use chrono::{DateTime, Utc};

use crate::data::Map;

/// What a trace event records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventType {
    /// The tuple arrived at a node.
    Input,
    /// The tuple was emitted by a node.
    Output,
    /// Anything else; the tag names the occasion.
    Other(String),
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Input => f.write_str("input"),
            Self::Output => f.write_str("output"),
            Self::Other(tag) => f.write_str(tag),
        }
    }
}

/// One entry in a tuple's debugging trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEvent {
    /// When the event happened.
    pub timestamp: DateTime<Utc>,
    /// The kind of event.
    pub event_type: EventType,
    /// The node the event happened at.
    pub node: String,
}

/// One record flowing through the topology.
#[derive(Debug, Clone, PartialEq)]
pub struct Tuple {
    /// The schemaless payload.
    pub data: Map,

    /// Wall-clock time of origin (event time).
    pub timestamp: DateTime<Utc>,

    /// Time the tuple entered the topology (processing time).
    pub proc_timestamp: DateTime<Utc>,

    /// Ordered trace of events, populated only when tracing is enabled.
    pub trace: Vec<TraceEvent>,

    /// The local edge name this tuple most recently arrived on.
    ///
    /// Overwritten by every pipe the tuple crosses.
    pub input_name: String,
}

impl Tuple {
    /// Creates a tuple with the given payload; both timestamps are set to now.
    #[must_use]
    pub fn new(data: Map) -> Self {
        let now = Utc::now();
        Self {
            data,
            timestamp: now,
            proc_timestamp: now,
            trace: Vec::new(),
            input_name: String::new(),
        }
    }

    /// Sets the origin timestamp, consuming and returning the tuple.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Sets the input name, consuming and returning the tuple.
    #[must_use]
    pub fn with_input_name(mut self, name: impl Into<String>) -> Self {
        self.input_name = name.into();
        self
    }

    /// Appends a trace event stamped with the current time.
    pub fn add_trace_event(&mut self, event_type: EventType, node: impl Into<String>) {
        self.trace.push(TraceEvent {
            timestamp: Utc::now(),
            event_type,
            node: node.into(),
        });
    }
}

impl Default for Tuple {
    fn default() -> Self {
        Self::new(Map::default())
    }
}
