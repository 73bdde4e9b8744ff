//! Graph capture/instantiate/launch (`spec.md` §3).
//!
//! A capture region records dispatches as `GraphNode`s; `instantiate`
//! freezes them into an ordered, immutable sequence; `launch` replays that
//! sequence by recording every node's commands into a fresh command buffer.
//! Grounded on `original_source/src/rt/graph/include/gcore/rt/graph/graph.hpp`
//! (`GraphNode::record`, `Graph::add_node`/`record_all`) translated from a
//! `unique_ptr<GraphNode>` vtable hierarchy into a boxed-trait-object vector,
//! per the tagged-variant/trait-object guidance in `spec.md` §9.

use ash::vk;

use crate::utils::{CoreError, Result};

/// One recordable unit of work within a captured graph.
pub trait GraphNode: Send {
    /// Record this node's commands into `cmd`.
    ///
    /// # Safety
    /// `cmd` must be a command buffer currently in the recording state.
    unsafe fn record(&self, cmd: vk::CommandBuffer) -> Result<()>;

    fn name(&self) -> &str;
}

/// A capture region: an ordered sequence of [`GraphNode`]s.
#[derive(Default)]
pub struct Graph {
    nodes: Vec<Box<dyn GraphNode>>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: Box<dyn GraphNode>) {
        self.nodes.push(node);
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Record every node's commands, in order, into `cmd`.
    ///
    /// # Safety
    /// `cmd` must be a command buffer currently in the recording state.
    pub unsafe fn record_all(&self, cmd: vk::CommandBuffer) -> Result<()> {
        for node in &self.nodes {
            node.record(cmd)
                .map_err(|e| CoreError::Device(format!("{}: {e}", node.name())))?;
        }
        Ok(())
    }
}

/// An instantiated (compiled, replayable) graph.
pub struct InstantiatedGraph {
    graph: Graph,
}

impl Graph {
    /// Freeze this capture region for repeated replay.
    pub fn instantiate(self) -> InstantiatedGraph {
        InstantiatedGraph { graph: self }
    }
}

impl InstantiatedGraph {
    /// Record the instantiated graph's nodes into `cmd` for submission.
    ///
    /// # Safety
    /// `cmd` must be a command buffer currently in the recording state.
    pub unsafe fn launch(&self, cmd: vk::CommandBuffer) -> Result<()> {
        self.graph.record_all(cmd)
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }
}
