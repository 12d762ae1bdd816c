//! Engine configuration shared by every node.

use crate::{CoreError, CoreResult, NodeId, Value};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// What a full chain queue does with a new chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Fail the enqueue with a capacity error
    #[default]
    Reject,
    /// Wait until a slot frees up
    Block,
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Run every chain on this node, without the network layer
    pub local_mode: bool,
    /// Number of nodes in the cluster
    pub node_count: u32,
    /// Index of this node
    pub node_id: NodeId,
    /// Maximum pipeline depth of a chain
    pub max_chain_steps: usize,
    /// Chain queue capacity
    pub queue_capacity: usize,
    /// Chain queue overflow behaviour
    pub overflow_policy: OverflowPolicy,
    /// Handlers started with the pool
    pub initial_handlers: usize,
    /// Upper bound on handlers, extra handlers included
    pub max_handlers: usize,
    /// Tuples buffered by a split stream before the producer blocks
    pub split_capacity: usize,
    /// Free-form parameters read by steps
    pub properties: IndexMap<String, Value>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            local_mode: true,
            node_count: 1,
            node_id: NodeId::new(0),
            max_chain_steps: 32,
            queue_capacity: 1024,
            overflow_policy: OverflowPolicy::Reject,
            initial_handlers: 2,
            max_handlers: 16,
            split_capacity: 256,
            properties: IndexMap::new(),
        }
    }
}

impl EngineConfig {
    /// Single-node configuration
    #[must_use]
    pub fn local() -> Self {
        Self::default()
    }

    /// Configuration for one node of a cluster
    #[must_use]
    pub fn distributed(node_id: NodeId, node_count: u32) -> Self {
        Self {
            local_mode: false,
            node_count,
            node_id,
            ..Self::default()
        }
    }

    /// Set the node this configuration belongs to
    #[must_use]
    pub fn with_node_id(mut self, node_id: NodeId) -> Self {
        self.node_id = node_id;
        self
    }

    /// Set the pipeline depth cap
    #[must_use]
    pub fn with_max_chain_steps(mut self, max: usize) -> Self {
        self.max_chain_steps = max;
        self
    }

    /// Set the chain queue capacity and overflow policy
    #[must_use]
    pub fn with_queue(mut self, capacity: usize, policy: OverflowPolicy) -> Self {
        self.queue_capacity = capacity;
        self.overflow_policy = policy;
        self
    }

    /// Set the handler pool bounds
    #[must_use]
    pub fn with_handlers(mut self, initial: usize, max: usize) -> Self {
        self.initial_handlers = initial;
        self.max_handlers = max;
        self
    }

    /// Set the split stream buffer size
    #[must_use]
    pub fn with_split_capacity(mut self, capacity: usize) -> Self {
        self.split_capacity = capacity;
        self
    }

    /// Add a free-form property
    #[must_use]
    pub fn with_property(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    /// Integer property
    #[must_use]
    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.properties.get(key).and_then(Value::as_long)
    }

    /// Boolean property
    #[must_use]
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.properties.get(key).and_then(Value::as_bool)
    }

    /// String property
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }

    /// Check the configuration is usable
    ///
    /// # Errors
    ///
    /// Returns error on zero capacities, an empty cluster, a node index
    /// outside the cluster or handler bounds that cannot be met
    pub fn validate(&self) -> CoreResult<()> {
        let invalid = |reason: String| Err(CoreError::InvalidConfig { reason });

        if self.node_count == 0 {
            return invalid("node_count must be at least 1".to_string());
        }
        if self.node_id.as_u32() >= self.node_count {
            return invalid(format!(
                "{} is outside a cluster of {} nodes",
                self.node_id, self.node_count
            ));
        }
        if self.local_mode && self.node_count != 1 {
            return invalid("local mode runs a single node".to_string());
        }
        if self.max_chain_steps == 0 {
            return invalid("max_chain_steps must be at least 1".to_string());
        }
        if self.queue_capacity == 0 || self.split_capacity == 0 {
            return invalid("queue and split capacities must be non-zero".to_string());
        }
        if self.initial_handlers == 0 || self.initial_handlers > self.max_handlers {
            return invalid(format!(
                "handler bounds {}..{} are not satisfiable",
                self.initial_handlers, self.max_handlers
            ));
        }
        Ok(())
    }

    /// Parse from JSON; missing fields take their defaults
    ///
    /// # Errors
    ///
    /// Returns error if the JSON is malformed or the result is invalid
    pub fn from_json_str(json: &str) -> CoreResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn from_json_file(path: impl AsRef<Path>) -> CoreResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Render as pretty JSON
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> CoreResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_distributed_builder() {
        let config = EngineConfig::distributed(NodeId::new(2), 4).with_handlers(1, 3);
        assert!(!config.local_mode);
        assert!(config.validate().is_ok());

        let bad = EngineConfig::distributed(NodeId::new(4), 4);
        assert!(matches!(bad.validate(), Err(CoreError::InvalidConfig { .. })));
    }

    #[test]
    fn test_validate_rejects_bad_bounds() {
        assert!(EngineConfig::local().with_handlers(4, 2).validate().is_err());
        assert!(EngineConfig::local().with_max_chain_steps(0).validate().is_err());
        assert!(
            EngineConfig::local()
                .with_queue(0, OverflowPolicy::Block)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_properties() {
        let config = EngineConfig::local()
            .with_property("sort.buffer", 64i64)
            .with_property("verbose", true)
            .with_property("label", "demo");
        assert_eq!(config.get_int("sort.buffer"), Some(64));
        assert_eq!(config.get_bool("verbose"), Some(true));
        assert_eq!(config.get_str("label"), Some("demo"));
        assert_eq!(config.get_int("label"), None);
    }

    #[test]
    fn test_from_json_partial() {
        let config =
            EngineConfig::from_json_str(r#"{"queue_capacity": 8, "overflow_policy": "block"}"#)
                .unwrap();
        assert_eq!(config.queue_capacity, 8);
        assert_eq!(config.overflow_policy, OverflowPolicy::Block);
        assert_eq!(config.max_chain_steps, 32);
    }

    #[test]
    fn test_from_json_malformed() {
        assert_eq!(
            EngineConfig::from_json_str("{not json"),
            Err(CoreError::InvalidEncoding)
        );
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let config = EngineConfig::distributed(NodeId::new(1), 3).with_split_capacity(4);
        file.write_all(config.to_json().unwrap().as_bytes()).unwrap();

        let loaded = EngineConfig::from_json_file(file.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_from_json_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let result = EngineConfig::from_json_file(dir.path().join("absent.json"));
        assert!(matches!(result, Err(CoreError::Io { .. })));
    }
}
