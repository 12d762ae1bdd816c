//! Chain input sources.

use crate::context::{HandlerStatus, NodeContext};
use tributary_core::{Chain, CoreError, CoreResult, CounterDeltas, InputSource, Tuple};
use tributary_storage::SplitReader;

/// Pull-based stream of input tuples
pub trait TupleIterator: Send {
    /// Next tuple, `None` at end of input
    ///
    /// # Errors
    ///
    /// Returns error if the source fails
    fn next_tuple(&mut self) -> CoreResult<Option<Tuple>>;
}

/// Yields a single empty tuple
#[derive(Debug, Default)]
pub struct DummyInput {
    done: bool,
}

impl TupleIterator for DummyInput {
    fn next_tuple(&mut self) -> CoreResult<Option<Tuple>> {
        if self.done {
            return Ok(None);
        }
        self.done = true;
        Ok(Some(Tuple::new()))
    }
}

/// Yields tuples held in memory
#[derive(Debug)]
pub struct VecInput {
    tuples: std::vec::IntoIter<Tuple>,
}

impl VecInput {
    /// Wrap a list of tuples
    #[must_use]
    pub fn new(tuples: Vec<Tuple>) -> Self {
        Self {
            tuples: tuples.into_iter(),
        }
    }
}

impl TupleIterator for VecInput {
    fn next_tuple(&mut self) -> CoreResult<Option<Tuple>> {
        Ok(self.tuples.next())
    }
}

/// Yields tuples from a split stream until its producer closes it
#[derive(Debug)]
pub struct SplitInput {
    reader: SplitReader,
}

impl TupleIterator for SplitInput {
    fn next_tuple(&mut self) -> CoreResult<Option<Tuple>> {
        Ok(self.reader.next_tuple())
    }
}

/// An opened input plus the counter deltas that came with it
pub struct OpenedInput {
    /// Input tuples
    pub tuples: Box<dyn TupleIterator>,
    /// Deltas forwarded by the writers of a bucket input
    pub forwarded: CounterDeltas,
}

impl std::fmt::Debug for OpenedInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedInput")
            .field("forwarded", &self.forwarded)
            .finish_non_exhaustive()
    }
}

/// Open the input of a chain.
///
/// Bucket inputs block until the bucket is sealed; the handler is marked
/// waiting meanwhile.
///
/// # Errors
///
/// Returns error if the bucket lives on another node, the split stream
/// is unknown or the wait is cancelled
pub fn open_input(
    chain: &Chain,
    ctx: &NodeContext,
    status: Option<&HandlerStatus>,
) -> CoreResult<OpenedInput> {
    let opened = |tuples: Box<dyn TupleIterator>| OpenedInput {
        tuples,
        forwarded: CounterDeltas::new(),
    };

    match &chain.input {
        InputSource::Dummy => Ok(opened(Box::new(DummyInput::default()))),
        InputSource::Tuples(tuples) => Ok(opened(Box::new(VecInput::new(tuples.clone())))),
        InputSource::Split { split } => {
            let reader = ctx.splits().take_reader(*split)?;
            Ok(opened(Box::new(SplitInput { reader })))
        }
        InputSource::Bucket { bucket, node } => {
            if !ctx.is_local(*node) {
                return Err(CoreError::usage(
                    "bucket input",
                    format!("{} lives on {}, not on {}", bucket, node, ctx.node_id()),
                ));
            }
            let bucket = ctx
                .buckets()
                .get_or_create(chain.submission_id, *bucket, None)?;

            if let Some(status) = status {
                status.set_waiting();
            }
            let contents = bucket.wait_sealed();
            if let Some(status) = status {
                status.set_active();
            }
            let contents = contents?;

            tracing::debug!(
                chain = %chain.chain_id,
                bucket = %bucket.id(),
                tuples = contents.tuples.len(),
                deltas = contents.deltas.len(),
                "bucket input opened"
            );
            Ok(OpenedInput {
                tuples: Box::new(VecInput::new(contents.tuples)),
                forwarded: contents.deltas,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ActionRegistry;
    use tributary_core::{
        ActionConf, ActionSequence, BucketId, ChainId, EngineConfig, NodeId, SubmissionId, Value,
    };
    use tributary_storage::WriterReport;

    fn chain(input: InputSource) -> Chain {
        Chain::root(
            ChainId::from_raw(1),
            SubmissionId::new(1),
            NodeId::new(0),
            &ActionSequence::new().then(ActionConf::new("a")),
            input,
        )
    }

    fn drain(mut input: OpenedInput) -> Vec<Tuple> {
        let mut out = Vec::new();
        while let Some(t) = input.tuples.next_tuple().unwrap() {
            out.push(t);
        }
        out
    }

    fn ctx() -> NodeContext {
        NodeContext::new(EngineConfig::local(), ActionRegistry::new())
    }

    #[test]
    fn test_dummy_yields_one_empty_tuple() {
        let input = open_input(&chain(InputSource::Dummy), &ctx(), None).unwrap();
        assert_eq!(drain(input), vec![Tuple::new()]);
    }

    #[test]
    fn test_inline_tuples() {
        let tuples = vec![
            Tuple::from_values(vec![Value::Int(1)]),
            Tuple::from_values(vec![Value::Int(2)]),
        ];
        let input = open_input(&chain(InputSource::Tuples(tuples.clone())), &ctx(), None).unwrap();
        assert_eq!(drain(input), tuples);
    }

    #[test]
    fn test_split_input() {
        let ctx = ctx();
        let writer = ctx.splits().register();
        writer.send(Tuple::from_values(vec![Value::Int(9)])).unwrap();
        writer.close();

        let input = open_input(&chain(InputSource::Split { split: writer.id() }), &ctx, None).unwrap();
        assert_eq!(drain(input).len(), 1);
    }

    #[test]
    fn test_bucket_input_waits_for_seal() {
        let ctx = ctx();
        let bucket = ctx
            .buckets()
            .get_or_create(SubmissionId::new(1), BucketId::new(42), None)
            .unwrap();
        bucket.add(Tuple::from_values(vec![Value::Int(1)])).unwrap();
        let mut deltas = CounterDeltas::new();
        deltas.push(ChainId::from_raw(1), 0);
        bucket
            .finish_writer(WriterReport::principal(ChainId::from_raw(1), 0).with_deltas(deltas))
            .unwrap();

        let status = HandlerStatus::new("h");
        let input = open_input(
            &chain(InputSource::Bucket {
                bucket: BucketId::new(42),
                node: NodeId::new(0),
            }),
            &ctx,
            Some(&status),
        )
        .unwrap();
        assert_eq!(input.forwarded.len(), 1);
        assert_eq!(status.state(), crate::context::HandlerState::Active);
        assert_eq!(drain(input).len(), 1);
    }

    #[test]
    fn test_remote_bucket_rejected() {
        let config = EngineConfig::distributed(NodeId::new(0), 2);
        let ctx = NodeContext::new(config, ActionRegistry::new());
        let source = InputSource::Bucket {
            bucket: BucketId::new(1),
            node: NodeId::new(1),
        };
        assert!(matches!(
            open_input(&chain(source), &ctx, None),
            Err(CoreError::Usage { .. })
        ));
    }
}
