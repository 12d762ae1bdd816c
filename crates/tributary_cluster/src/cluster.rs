//! Several nodes in one process, connected by a [`LoopbackNetwork`].

use crate::node::{Node, SubmissionHandle};
use crate::transport::{LoopbackNetwork, NetworkStats, Transport};
use std::sync::Arc;
use tributary_core::{
    ActionSequence, CoreError, CoreResult, EngineConfig, InputSource, NodeId, SubmissionId,
};
use tributary_runtime::{ActionRegistry, SubmissionStats};

/// In-process cluster.
///
/// Every message between nodes goes through the wire encoding, so the
/// cluster behaves like a distributed deployment minus the sockets.
/// Submissions are made through node 0.
pub struct LoopbackCluster {
    network: Arc<LoopbackNetwork>,
    nodes: Vec<Node>,
}

impl LoopbackCluster {
    /// Start `nodes` nodes with the built-in steps
    ///
    /// # Errors
    ///
    /// Returns error if a node cannot be started
    pub fn start(config: &EngineConfig, nodes: u32) -> CoreResult<Self> {
        Self::with_registry(config, nodes, ActionRegistry::with_builtins)
    }

    /// Start `nodes` nodes, each with a registry built by `registry`.
    ///
    /// `config` is the template of every node; its cluster fields are
    /// overridden.
    ///
    /// # Errors
    ///
    /// Returns error if a node cannot be started
    pub fn with_registry<F>(config: &EngineConfig, nodes: u32, registry: F) -> CoreResult<Self>
    where
        F: Fn() -> ActionRegistry,
    {
        if nodes == 0 {
            return Err(CoreError::InvalidConfig {
                reason: "a cluster needs at least one node".to_string(),
            });
        }

        let network = Arc::new(LoopbackNetwork::new());
        let mut started = Vec::with_capacity(nodes as usize);
        for index in 0..nodes {
            let mut node_config = config.clone();
            node_config.local_mode = false;
            node_config.node_count = nodes;
            node_config.node_id = NodeId::new(index);

            let transport: Arc<dyn Transport> = network.clone();
            let node = Node::start(node_config, registry(), Some(transport))?;
            network.register(node.id(), node.message_handler());
            started.push(node);
        }

        tracing::info!(nodes, "loopback cluster started");
        Ok(Self {
            network,
            nodes: started,
        })
    }

    /// Node by index
    #[must_use]
    pub fn node(&self, index: usize) -> Option<&Node> {
        self.nodes.get(index)
    }

    /// Number of nodes
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the cluster has no node
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Submit through node 0
    ///
    /// # Errors
    ///
    /// Returns error if the submission is rejected
    pub fn submit(&self, actions: &ActionSequence, input: InputSource) -> CoreResult<SubmissionHandle> {
        let first = self.nodes.first().ok_or_else(|| CoreError::Closed {
            resource: "loopback cluster".to_string(),
        })?;
        first.submit(actions, input)
    }

    /// Statistics of a submission, summed over every node
    #[must_use]
    pub fn stats(&self, submission: SubmissionId) -> SubmissionStats {
        let merged = tributary_runtime::StatisticsCollector::new();
        for node in &self.nodes {
            merged.merge(submission, &node.stats(submission));
        }
        merged.snapshot(submission)
    }

    /// Traffic carried so far
    #[must_use]
    pub fn network_stats(&self) -> NetworkStats {
        self.network.stats()
    }

    /// Drop a submission's state on every node
    pub fn cleanup(&self, submission: SubmissionId) {
        for node in &self.nodes {
            node.cleanup(submission);
        }
    }

    /// Stop every node
    pub fn shutdown(&self) {
        for node in &self.nodes {
            self.network.unregister(node.id());
        }
        for node in &self.nodes {
            node.shutdown();
        }
    }
}

impl Drop for LoopbackCluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for LoopbackCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackCluster")
            .field("nodes", &self.nodes)
            .field("network", &self.network)
            .finish()
    }
}
