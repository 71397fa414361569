//! Topology assembly: a name-keyed registry of running nodes.
//!
//! A [`Topology`] owns the context and the nodes. Adding a node spawns its
//! processing thread immediately; edges are wired at add time by creating a
//! pipe per declared input and registering its two ends with the upstream
//! distributor and the downstream aggregator. Edges can also be added and
//! removed later through the per-node [`DataSources`] and
//! [`DataDestinations`] handles while data is flowing.
//!
//! [`stop`](Topology::stop) shuts the graph down in flow order — sources,
//! then boxes in insertion order, then sinks — with graceful drain enabled
//! so tuples already accepted are delivered before their node stops.

use std::sync::Arc;
use std::thread;

use fxhash::FxHashMap;
use parking_lot::RwLock;

use crate::context::Context;

use super::destinations::DataDestinations;
use super::error::TopologyError;
use super::node::{BoxNode, SinkNode, SourceNode};
use super::pipe::{pipe, DropMode};
use super::sources::DataSources;
use super::traits::{Operator, Sink, Source};

/// Default capacity of pipes created by a topology.
pub const DEFAULT_PIPE_CAPACITY: usize = 1024;

/// Tuning knobs for topology-created edges and nodes.
#[derive(Debug, Clone)]
pub struct TopologyConfig {
    /// Capacity of each created pipe.
    pub pipe_capacity: usize,

    /// Drop policy of each created pipe.
    pub drop_mode: DropMode,

    /// Fan-in parallelism of box nodes (max concurrent operator calls).
    pub box_parallelism: usize,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
            drop_mode: DropMode::Block,
            box_parallelism: 1,
        }
    }
}

enum NodeEntry {
    Source(Arc<SourceNode>),
    Box(Arc<BoxNode>),
    Sink(Arc<SinkNode>),
}

impl NodeEntry {
    /// The distributor of this node, if it has outputs.
    fn destinations(&self) -> Option<&Arc<DataDestinations>> {
        match self {
            Self::Source(node) => Some(node.destinations()),
            Self::Box(node) => Some(node.destinations()),
            Self::Sink(_) => None,
        }
    }
}

/// A running directed graph of nodes connected by pipes.
pub struct Topology {
    ctx: Arc<Context>,
    config: TopologyConfig,
    nodes: RwLock<FxHashMap<String, NodeEntry>>,
    /// Insertion order, used for the stop cascade.
    order: RwLock<Vec<String>>,
}

impl Topology {
    /// Creates an empty topology with default configuration.
    #[must_use]
    pub fn new(ctx: Arc<Context>) -> Self {
        Self::with_config(ctx, TopologyConfig::default())
    }

    /// Creates an empty topology with the given configuration.
    #[must_use]
    pub fn with_config(ctx: Arc<Context>, config: TopologyConfig) -> Self {
        Self {
            ctx,
            config,
            nodes: RwLock::new(FxHashMap::default()),
            order: RwLock::new(Vec::new()),
        }
    }

    /// Returns the topology's context.
    #[must_use]
    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Adds a source node and starts emitting.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::Parameter`] for an empty name or
    /// [`TopologyError::DuplicateName`] if the name is taken.
    pub fn add_source(
        &self,
        name: impl Into<String>,
        source: Arc<dyn Source>,
    ) -> Result<Arc<SourceNode>, TopologyError> {
        let name = validated(name)?;
        let node = Arc::new(SourceNode::new(name.clone(), source));

        self.register(name, NodeEntry::Source(Arc::clone(&node)))?;
        self.spawn_source(&node);
        Ok(node)
    }

    /// Adds a source node with its distributor paused.
    ///
    /// Tuples emitted into an unwired distributor are silently discarded,
    /// so a source whose downstream edges are added after it should start
    /// paused and be resumed once wiring is done.
    ///
    /// # Errors
    ///
    /// Same conditions as [`add_source`](Topology::add_source).
    pub fn add_source_paused(
        &self,
        name: impl Into<String>,
        source: Arc<dyn Source>,
    ) -> Result<Arc<SourceNode>, TopologyError> {
        let name = validated(name)?;
        let node = Arc::new(SourceNode::new(name.clone(), source));
        node.destinations().pause();

        self.register(name, NodeEntry::Source(Arc::clone(&node)))?;
        self.spawn_source(&node);
        Ok(node)
    }

    /// Adds a box node consuming from the named upstream nodes.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::Parameter`] for an empty name,
    /// [`TopologyError::DuplicateName`] if the name is taken, or
    /// [`TopologyError::NodeNotFound`] if an input does not exist or cannot
    /// emit (a sink).
    pub fn add_box(
        &self,
        name: impl Into<String>,
        op: Arc<dyn Operator>,
        inputs: &[&str],
    ) -> Result<Arc<BoxNode>, TopologyError> {
        let name = validated(name)?;
        self.ensure_absent(&name)?;
        let node = Arc::new(BoxNode::new(
            name.clone(),
            op,
            self.config.box_parallelism,
        ));

        self.wire_inputs(&name, node.sources(), inputs)?;
        self.register(name, NodeEntry::Box(Arc::clone(&node)))?;
        self.spawn_box(&node);
        Ok(node)
    }

    /// Adds a sink node consuming from the named upstream nodes.
    ///
    /// # Errors
    ///
    /// Same conditions as [`add_box`](Topology::add_box).
    pub fn add_sink(
        &self,
        name: impl Into<String>,
        sink: Arc<dyn Sink>,
        inputs: &[&str],
    ) -> Result<Arc<SinkNode>, TopologyError> {
        let name = validated(name)?;
        self.ensure_absent(&name)?;
        let node = Arc::new(SinkNode::new(name.clone(), sink));

        self.wire_inputs(&name, node.sources(), inputs)?;
        self.register(name, NodeEntry::Sink(Arc::clone(&node)))?;
        self.spawn_sink(&node);
        Ok(node)
    }

    /// Looks up a source node by name.
    #[must_use]
    pub fn source_node(&self, name: &str) -> Option<Arc<SourceNode>> {
        match self.nodes.read().get(name) {
            Some(NodeEntry::Source(node)) => Some(Arc::clone(node)),
            _ => None,
        }
    }

    /// Looks up a box node by name.
    #[must_use]
    pub fn box_node(&self, name: &str) -> Option<Arc<BoxNode>> {
        match self.nodes.read().get(name) {
            Some(NodeEntry::Box(node)) => Some(Arc::clone(node)),
            _ => None,
        }
    }

    /// Looks up a sink node by name.
    #[must_use]
    pub fn sink_node(&self, name: &str) -> Option<Arc<SinkNode>> {
        match self.nodes.read().get(name) {
            Some(NodeEntry::Sink(node)) => Some(Arc::clone(node)),
            _ => None,
        }
    }

    /// Stops every node, draining inflight tuples.
    ///
    /// Sources stop first; closing their distributors cascades the close
    /// down every pipe. Boxes (in insertion order) and then sinks stop
    /// gracefully, delivering what was already queued. Idempotent.
    pub fn stop(&self) {
        let order = self.order.read().clone();
        let nodes = self.nodes.read();

        for name in &order {
            if let Some(NodeEntry::Source(node)) = nodes.get(name) {
                node.stop(&self.ctx);
            }
        }
        for name in &order {
            if let Some(NodeEntry::Box(node)) = nodes.get(name) {
                node.enable_graceful_stop();
                node.stop(&self.ctx);
            }
        }
        for name in &order {
            if let Some(NodeEntry::Sink(node)) = nodes.get(name) {
                node.enable_graceful_stop();
                node.stop(&self.ctx);
            }
        }
    }

    /// Creates one pipe per declared input and registers both ends.
    ///
    /// The pipe carries the upstream node's name, which becomes the
    /// arriving tuple's `input_name` downstream.
    fn wire_inputs(
        &self,
        node_name: &str,
        srcs: &Arc<DataSources>,
        inputs: &[&str],
    ) -> Result<(), TopologyError> {
        let nodes = self.nodes.read();
        for &input in inputs {
            let upstream = nodes
                .get(input)
                .and_then(NodeEntry::destinations)
                .ok_or_else(|| TopologyError::NodeNotFound(input.to_owned()))?;

            let (sender, receiver) = pipe(input, self.config.pipe_capacity);
            sender.set_drop_mode(self.config.drop_mode);
            srcs.add(input, receiver)?;
            upstream.add(node_name, sender)?;
        }
        Ok(())
    }

    /// Rejects a name already in use, before any edges get wired to the
    /// new node.
    fn ensure_absent(&self, name: &str) -> Result<(), TopologyError> {
        if self.nodes.read().contains_key(name) {
            return Err(TopologyError::DuplicateName(name.to_owned()));
        }
        Ok(())
    }

    fn register(&self, name: String, entry: NodeEntry) -> Result<(), TopologyError> {
        let mut nodes = self.nodes.write();
        if nodes.contains_key(&name) {
            return Err(TopologyError::DuplicateName(name));
        }
        nodes.insert(name.clone(), entry);
        self.order.write().push(name);
        Ok(())
    }

    fn spawn_source(&self, node: &Arc<SourceNode>) {
        let ctx = Arc::clone(&self.ctx);
        let node_ref = Arc::clone(node);
        node.set_handle(thread::spawn(move || node_ref.run(&ctx)));
    }

    fn spawn_box(&self, node: &Arc<BoxNode>) {
        let ctx = Arc::clone(&self.ctx);
        let node_ref = Arc::clone(node);
        node.set_handle(thread::spawn(move || node_ref.run(&ctx)));
    }

    fn spawn_sink(&self, node: &Arc<SinkNode>) {
        let ctx = Arc::clone(&self.ctx);
        let node_ref = Arc::clone(node);
        node.set_handle(thread::spawn(move || node_ref.run(&ctx)));
    }
}

impl std::fmt::Debug for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topology")
            .field("nodes", &self.order.read())
            .finish_non_exhaustive()
    }
}

fn validated(name: impl Into<String>) -> Result<String, TopologyError> {
    let name = name.into();
    if name.is_empty() {
        return Err(TopologyError::Parameter("empty node name".to_owned()));
    }
    Ok(name)
}
