//! Chain descriptors: the schedulable unit of work.
//!
//! A chain is an ordered list of steps plus identity, lineage and the
//! source it reads its initial input from. Descriptors are plain data:
//! they are cloned when a chain forks and encoded when a chain crosses
//! the network. Executing a chain is the runtime's job.

use crate::{BucketId, ChainId, CoreError, CoreResult, NodeId, SplitId, SubmissionId, Tuple, Value};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Configuration of one processing step, resolved by name at execution time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionConf {
    /// Registered action name
    pub name: String,
    /// Named parameters
    pub params: IndexMap<String, Value>,
}

impl ActionConf {
    /// Create a configuration with no parameters
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: IndexMap::new(),
        }
    }

    /// Add a parameter
    #[must_use]
    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    /// Get a raw parameter
    #[must_use]
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    /// Get a required integer parameter
    ///
    /// # Errors
    ///
    /// Returns error if the parameter is missing or not an integer
    pub fn long_param(&self, key: &str) -> CoreResult<i64> {
        self.param(key)
            .and_then(Value::as_long)
            .ok_or_else(|| CoreError::Validation {
                field: format!("{}.{}", self.name, key),
                reason: "missing integer parameter".to_string(),
            })
    }

    /// Get an integer parameter with a fallback
    #[must_use]
    pub fn long_param_or(&self, key: &str, default: i64) -> i64 {
        self.param(key).and_then(Value::as_long).unwrap_or(default)
    }

    /// Get a boolean parameter with a fallback
    #[must_use]
    pub fn bool_param_or(&self, key: &str, default: bool) -> bool {
        self.param(key).and_then(Value::as_bool).unwrap_or(default)
    }

    /// Get a string parameter
    #[must_use]
    pub fn str_param(&self, key: &str) -> Option<&str> {
        self.param(key).and_then(Value::as_str)
    }
}

/// Ordered list of step configurations attached to a new chain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionSequence {
    actions: Vec<ActionConf>,
}

impl ActionSequence {
    /// Create an empty sequence
    #[must_use]
    pub fn new() -> Self {
        Self {
            actions: Vec::new(),
        }
    }

    /// Append an action (builder form)
    #[must_use]
    pub fn then(mut self, action: ActionConf) -> Self {
        self.actions.push(action);
        self
    }

    /// Append an action
    pub fn push(&mut self, action: ActionConf) {
        self.actions.push(action);
    }

    /// Number of actions
    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Whether the sequence is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Iterate over the actions
    pub fn iter(&self) -> impl Iterator<Item = &ActionConf> {
        self.actions.iter()
    }
}

impl From<Vec<ActionConf>> for ActionSequence {
    fn from(actions: Vec<ActionConf>) -> Self {
        Self { actions }
    }
}

/// One step of a chain with its lineage bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainStep {
    /// Step configuration
    pub action: ActionConf,
    /// Whether this chain is the principal owner of the step
    pub root: bool,
    /// Work estimate when the step was attached
    pub raw_size: u64,
    /// Chain whose counter owns work reconnecting into this step
    pub responsible_chain: ChainId,
}

/// Where a chain reads its initial input from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputSource {
    /// A single empty tuple, triggering the first step once
    Dummy,
    /// Inline records supplied by the submitter
    Tuples(Vec<Tuple>),
    /// A bucket stored on a node
    Bucket {
        /// Bucket to read
        bucket: BucketId,
        /// Node holding the bucket
        node: NodeId,
    },
    /// A split stream fed by another chain on the same node
    Split {
        /// Stream to read
        split: SplitId,
    },
}

impl InputSource {
    /// Short name of the source kind
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Dummy => "dummy",
            Self::Tuples(_) => "tuples",
            Self::Bucket { .. } => "bucket",
            Self::Split { .. } => "split",
        }
    }
}

/// Chain descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chain {
    /// Chain ID
    pub chain_id: ChainId,
    /// Parent of record, `None` for root chains
    pub parent_chain_id: Option<ChainId>,
    /// Chain whose execution created this one, `None` for root chains
    pub creator_chain_id: Option<ChainId>,
    /// Submission the chain belongs to
    pub submission_id: SubmissionId,
    /// Node the submission was made on
    pub submission_node: NodeId,
    /// Remaining-work estimate
    pub raw_size: u64,
    /// Signed count of outstanding descendants
    pub total_chain_children: i32,
    /// How many times this chain's computation migrated before
    pub generation: u32,
    /// Input source
    pub input: InputSource,
    /// Steps, in execution order
    pub steps: Vec<ChainStep>,
}

impl Chain {
    /// Create a root chain owning every step
    #[must_use]
    pub fn root(
        chain_id: ChainId,
        submission_id: SubmissionId,
        submission_node: NodeId,
        actions: &ActionSequence,
        input: InputSource,
    ) -> Self {
        let steps = actions
            .iter()
            .map(|action| ChainStep {
                action: action.clone(),
                root: true,
                raw_size: 0,
                responsible_chain: chain_id,
            })
            .collect();

        Self {
            chain_id,
            parent_chain_id: None,
            creator_chain_id: None,
            submission_id,
            submission_node,
            raw_size: 0,
            total_chain_children: 0,
            generation: 0,
            input,
            steps,
        }
    }

    /// Set the work estimate on the chain and its steps
    #[must_use]
    pub fn with_raw_size(mut self, raw_size: u64) -> Self {
        self.raw_size = raw_size;
        for step in &mut self.steps {
            step.raw_size = raw_size;
        }
        self
    }

    /// Number of steps
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the chain has no steps
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Check the chain can be executed within the pipeline depth cap
    ///
    /// # Errors
    ///
    /// Returns error if the chain has no steps or too many
    pub fn validate(&self, max_steps: usize) -> CoreResult<()> {
        if self.steps.is_empty() {
            return Err(CoreError::Validation {
                field: "steps".to_string(),
                reason: format!("{} has no steps", self.chain_id),
            });
        }
        if self.steps.len() > max_steps {
            return Err(CoreError::CapacityExceeded {
                resource: format!("steps of {}", self.chain_id),
                limit: max_steps as u64,
            });
        }
        Ok(())
    }

    /// Derive a descendant chain.
    ///
    /// The new chain runs `head` (owned by the new chain) and then, when
    /// `reconnect_from` is set, this chain's steps from that index on,
    /// which stay owned by their current responsible chains.
    #[must_use]
    pub fn derive(
        &self,
        chain_id: ChainId,
        parent_chain_id: ChainId,
        head: Option<&ActionSequence>,
        reconnect_from: Option<usize>,
    ) -> Chain {
        let mut steps: Vec<ChainStep> = head
            .into_iter()
            .flat_map(|sequence| sequence.iter())
            .map(|action| ChainStep {
                action: action.clone(),
                root: true,
                raw_size: self.raw_size,
                responsible_chain: chain_id,
            })
            .collect();

        if let Some(from) = reconnect_from {
            let tail = self.steps.get(from..).unwrap_or(&[]);
            steps.extend(tail.iter().map(|step| ChainStep {
                root: false,
                ..step.clone()
            }));
        }

        Chain {
            chain_id,
            parent_chain_id: Some(parent_chain_id),
            creator_chain_id: Some(self.chain_id),
            submission_id: self.submission_id,
            submission_node: self.submission_node,
            raw_size: self.raw_size,
            total_chain_children: 0,
            generation: 0,
            input: InputSource::Dummy,
            steps,
        }
    }

    /// Clone this chain as the continuation of a migrated computation.
    ///
    /// Keeps identity and lineage, runs the steps from `from` on, reads
    /// the given bucket and starts with a zero child counter.
    #[must_use]
    pub fn continuation(&self, from: usize, node: NodeId, bucket: BucketId) -> Chain {
        Chain {
            steps: self.steps.get(from..).unwrap_or(&[]).to_vec(),
            total_chain_children: 0,
            generation: self.generation + 1,
            input: InputSource::Bucket { bucket, node },
            ..self.clone()
        }
    }

    /// Encode for the wire
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        Ok(postcard::to_allocvec(self)?)
    }

    /// Decode from the wire
    ///
    /// # Errors
    ///
    /// Returns error if the bytes are not a chain
    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        Ok(postcard::from_bytes(bytes)?)
    }
}

/// Counter reconciliation message: signed deltas keyed by chain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterDeltas {
    entries: BTreeMap<ChainId, Vec<i32>>,
}

impl CounterDeltas {
    /// Create an empty message
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Record one delta for a chain
    pub fn push(&mut self, chain: ChainId, delta: i32) {
        self.entries.entry(chain).or_default().push(delta);
    }

    /// Merge another message into this one
    pub fn merge(&mut self, other: CounterDeltas) {
        for (chain, deltas) in other.entries {
            self.entries.entry(chain).or_default().extend(deltas);
        }
    }

    /// Deltas recorded for a chain
    #[must_use]
    pub fn get(&self, chain: ChainId) -> &[i32] {
        self.entries.get(&chain).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Iterate over chains and their deltas, in chain order
    pub fn iter(&self) -> impl Iterator<Item = (ChainId, &[i32])> {
        self.entries.iter().map(|(chain, deltas)| (*chain, deltas.as_slice()))
    }

    /// Total number of deltas
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    /// Whether no delta is recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.values().all(Vec::is_empty)
    }

    /// Take the recorded deltas, leaving this message empty
    #[must_use]
    pub fn take(&mut self) -> CounterDeltas {
        std::mem::take(self)
    }
}

impl IntoIterator for CounterDeltas {
    type Item = (ChainId, Vec<i32>);
    type IntoIter = std::collections::btree_map::IntoIter<ChainId, Vec<i32>>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}
