//! Chains created at runtime: branches, splits and migration continuations,
//! plus the bucket transfers that carry a migrated computation's input.

use crate::action::ActionOutput;
use crate::executor::ChainFrame;
use crate::monitor::CHAINS_DYNAMICALLY_GENERATED;
use tributary_core::{
    ActionSequence, BucketId, CoreError, CoreResult, InputSource, NodeId, Tuple, Value,
};
use tributary_storage::{BucketAlert, BucketShipment, SplitWriter, WriterReport};

/// Node a migration without an explicit node lands on
pub(crate) const DEFAULT_MIGRATION_NODE: NodeId = NodeId::new(0);

/// Open bucket writer of a chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferHandle {
    /// Node holding the bucket
    pub node: NodeId,
    /// Bucket written
    pub bucket: BucketId,
}

#[derive(Debug, Default)]
pub(crate) struct TransferBuffer {
    sort: Option<Vec<usize>>,
    tuples: Vec<Tuple>,
}

/// Producer side of a split, handed to the step that created it
#[derive(Debug)]
pub struct SplitOutput {
    writer: SplitWriter,
    scratch: Tuple,
}

impl SplitOutput {
    /// Stream being fed
    #[must_use]
    pub fn writer(&self) -> &SplitWriter {
        &self.writer
    }
}

impl ActionOutput for SplitOutput {
    fn output(&mut self, tuple: &Tuple) -> CoreResult<()> {
        self.writer.send(tuple.clone())
    }

    fn output_values(&mut self, values: &[Value]) -> CoreResult<()> {
        self.scratch.set(values);
        self.writer.send(self.scratch.clone())
    }
}

impl ChainFrame {
    pub(crate) fn branch(&mut self, current: usize, actions: &ActionSequence) -> CoreResult<()> {
        if actions.is_empty() {
            return Err(CoreError::usage("branch", "There is no action to branch"));
        }

        let child_id = self.node.ids().next_chain_id();
        let last_local = current + 1 == self.local_steps;
        let parent = if self.migration.is_some() && last_local {
            // The rest of the chain runs elsewhere: the child reports to
            // whoever owns the continuation
            let responsible = self.chain.steps[current].responsible_chain;
            self.increment_children(responsible, 1, current);
            responsible
        } else {
            self.chain.total_chain_children += 1;
            self.chain.chain_id
        };

        let child = self
            .chain
            .derive(child_id, parent, Some(actions), Some(current + 1));
        child.validate(self.node.config().max_chain_steps)?;

        if !self.stopping && current > 0 {
            self.record_runtime_branch(current);
        }

        tracing::debug!(
            chain = %self.chain.chain_id,
            child = %child_id,
            %parent,
            step = current,
            steps = child.len(),
            "branch"
        );
        self.dispatcher.dispatch(child, None)?;
        self.node
            .stats()
            .add_counter(self.chain.submission_id, CHAINS_DYNAMICALLY_GENERATED, 1);
        Ok(())
    }

    pub(crate) fn split(
        &mut self,
        current: usize,
        reconnect_at: i32,
        actions: Option<&ActionSequence>,
    ) -> CoreResult<SplitOutput> {
        let no_actions = actions.is_none_or(ActionSequence::is_empty);
        if no_actions && reconnect_at == -1 {
            return Err(CoreError::usage(
                "split",
                "There is no action to split and no reconnection point",
            ));
        }
        if reconnect_at < -1 {
            return Err(CoreError::usage(
                "split",
                format!("invalid reconnection offset {}", reconnect_at),
            ));
        }

        let child_id = self.node.ids().next_chain_id();
        let tail = (self.local_steps - current - 1) as i32;
        let reconnect_from = (reconnect_at >= 0).then(|| current + 1 + reconnect_at as usize);

        let parent = if self.migration.is_some() && reconnect_at != -1 && reconnect_at < tail {
            self.chain.total_chain_children += 1;
            self.chain.chain_id
        } else {
            let reconnect_step = (current as i32 + 1 + reconnect_at) as usize;
            let parent = self
                .chain
                .steps
                .get(reconnect_step)
                .map_or(self.chain.chain_id, |step| step.responsible_chain);
            self.increment_children(parent, reconnect_at + 1, current);
            parent
        };

        let writer = self.node.splits().register();
        let mut child = self.chain.derive(child_id, parent, actions, reconnect_from);
        child.input = InputSource::Split { split: writer.id() };
        if let Err(err) = child.validate(self.node.config().max_chain_steps) {
            writer.close();
            let _ = self.node.splits().take_reader(writer.id());
            return Err(err);
        }

        tracing::debug!(
            chain = %self.chain.chain_id,
            child = %child_id,
            %parent,
            split = %writer.id(),
            reconnect_at,
            "split"
        );
        if let Err(err) = self.dispatcher.start_separate_handler(child) {
            writer.close();
            let _ = self.node.splits().take_reader(writer.id());
            return Err(err);
        }
        self.node
            .stats()
            .add_counter(self.chain.submission_id, CHAINS_DYNAMICALLY_GENERATED, 1);

        self.open_streams.push(writer.clone());
        Ok(SplitOutput {
            writer,
            scratch: Tuple::new(),
        })
    }

    /// Dispatch the rest of the chain once the local steps started, if the
    /// computation migrates from a step this chain owns
    pub(crate) fn dispatch_continuation(&mut self) -> CoreResult<()> {
        let Some(target) = self.migration else {
            return Ok(());
        };
        if !self.has_continuation() || self.continuation_dispatched {
            return Ok(());
        }
        let last = &self.chain.steps[self.local_steps - 1];
        if !last.root {
            return Ok(());
        }

        let node = target.node.unwrap_or(DEFAULT_MIGRATION_NODE);
        let mut continuation = self.chain.continuation(self.local_steps, node, target.bucket);
        continuation.raw_size = last.raw_size;

        tracing::debug!(
            chain = %self.chain.chain_id,
            %node,
            bucket = %target.bucket,
            generation = continuation.generation,
            steps = continuation.len(),
            "computation migrates"
        );
        self.dispatcher.dispatch(continuation, Some(node))?;
        self.continuation_dispatched = true;
        Ok(())
    }

    pub(crate) fn start_transfer(
        &mut self,
        node: NodeId,
        bucket: BucketId,
        sort: Option<Vec<usize>>,
    ) -> CoreResult<TransferHandle> {
        let handle = TransferHandle { node, bucket };
        if self.transfers.contains_key(&handle) {
            return Err(CoreError::AlreadyExists {
                kind: "Transfer".to_string(),
                id: format!("{} on {}", bucket, node),
            });
        }

        let submission = self.chain.submission_id;
        if self.node.is_local(node) {
            self.node
                .buckets()
                .get_or_create(submission, bucket, sort.clone())?;
        } else {
            self.dispatcher.alert_bucket(
                node,
                BucketAlert {
                    submission,
                    bucket,
                    sort: sort.clone(),
                },
            )?;
        }

        self.transfers.insert(
            handle,
            TransferBuffer {
                sort,
                tuples: Vec::new(),
            },
        );
        Ok(handle)
    }

    pub(crate) fn write_transfer(&mut self, handle: TransferHandle, tuple: &Tuple) -> CoreResult<()> {
        let buffer = self
            .transfers
            .get_mut(&handle)
            .ok_or_else(|| not_open(handle))?;
        buffer.tuples.push(tuple.clone());
        Ok(())
    }

    pub(crate) fn finish_transfer(
        &mut self,
        current: usize,
        handle: TransferHandle,
        decrease_counter: bool,
    ) -> CoreResult<()> {
        let buffer = self
            .transfers
            .remove(&handle)
            .ok_or_else(|| not_open(handle))?;

        let mut writer = WriterReport {
            chain: Some(self.chain.chain_id),
            children: self.adjusted_children(current),
            principal: self.chain.steps[current].root,
            decrease_counter,
            deltas: Default::default(),
        };
        if self.is_migration_target(handle) {
            writer.deltas = self.new_children.take();
            tracing::debug!(
                chain = %self.chain.chain_id,
                bucket = %handle.bucket,
                deltas = writer.deltas.len(),
                "counter deltas forwarded"
            );
        }

        let shipment = BucketShipment {
            submission: self.chain.submission_id,
            bucket: handle.bucket,
            sort: buffer.sort,
            tuples: buffer.tuples,
            writer,
        };
        if self.node.is_local(handle.node) {
            self.node.buckets().deliver(shipment)
        } else {
            self.dispatcher.ship_bucket(handle.node, shipment)
        }
    }

    fn has_continuation(&self) -> bool {
        self.chain.len() > self.local_steps
    }

    fn is_migration_target(&self, handle: TransferHandle) -> bool {
        let Some(target) = self.migration else {
            return false;
        };
        let node_matches = match target.node {
            Some(node) => node == handle.node,
            None => handle.node == DEFAULT_MIGRATION_NODE,
        };
        self.has_continuation() && handle.bucket == target.bucket && node_matches
    }
}

fn not_open(handle: TransferHandle) -> CoreError {
    CoreError::NotFound {
        kind: "Transfer".to_string(),
        id: format!("{} on {}", handle.bucket, handle.node),
    }
}
