//! Test harness: a node context with recording collaborators and a few
//! instrumented steps.

use crate::action::{Action, ActionOutput, MigrationTarget};
use crate::context::{ChainDispatcher, NodeContext};
use crate::executor::{ActionContext, ChainExecutor};
use crate::fork::{SplitOutput, TransferHandle};
use crate::input::{DummyInput, OpenedInput};
use crate::registry::ActionRegistry;
use parking_lot::Mutex;
use std::sync::Arc;
use tributary_core::{
    ActionConf, ActionSequence, BucketId, Chain, CoreError, CoreResult, CounterDeltas, EngineConfig,
    InputSource, NodeId, SubmissionId, Tuple, Value,
};
use tributary_storage::{BucketAlert, BucketShipment, CacheBroadcaster, RemoteBuckets};

pub(crate) const SUBMISSION: SubmissionId = SubmissionId::new(1);

type Journal = Arc<Mutex<Vec<String>>>;
type Script = Arc<Mutex<Vec<(usize, u8)>>>;

/// Dispatcher recording everything instead of running it
#[derive(Debug, Default)]
pub(crate) struct RecordingDispatcher {
    dispatched: Mutex<Vec<(Chain, Option<NodeId>)>>,
    separate: Mutex<Vec<Chain>>,
    alerts: Mutex<Vec<(NodeId, BucketAlert)>>,
    shipments: Mutex<Vec<(NodeId, BucketShipment)>>,
    broadcasts: Mutex<Vec<(SubmissionId, String, Value)>>,
}

impl RecordingDispatcher {
    pub(crate) fn dispatched(&self) -> Vec<(Chain, Option<NodeId>)> {
        self.dispatched.lock().clone()
    }

    pub(crate) fn separate(&self) -> Vec<Chain> {
        self.separate.lock().clone()
    }

    pub(crate) fn alerts(&self) -> Vec<(NodeId, BucketAlert)> {
        self.alerts.lock().clone()
    }

    pub(crate) fn shipments(&self) -> Vec<(NodeId, BucketShipment)> {
        self.shipments.lock().clone()
    }

    pub(crate) fn broadcasts(&self) -> Vec<(SubmissionId, String, Value)> {
        self.broadcasts.lock().clone()
    }
}

impl RemoteBuckets for RecordingDispatcher {
    fn alert_bucket(&self, node: NodeId, alert: BucketAlert) -> CoreResult<()> {
        self.alerts.lock().push((node, alert));
        Ok(())
    }

    fn ship_bucket(&self, node: NodeId, shipment: BucketShipment) -> CoreResult<()> {
        self.shipments.lock().push((node, shipment));
        Ok(())
    }
}

impl CacheBroadcaster for RecordingDispatcher {
    fn broadcast_cache(&self, submission: SubmissionId, key: &str, value: &Value) -> CoreResult<()> {
        self.broadcasts
            .lock()
            .push((submission, key.to_string(), value.clone()));
        Ok(())
    }
}

impl ChainDispatcher for RecordingDispatcher {
    fn dispatch(&self, chain: Chain, target: Option<NodeId>) -> CoreResult<()> {
        self.dispatched.lock().push((chain, target));
        Ok(())
    }

    fn start_separate_handler(&self, chain: Chain) -> CoreResult<()> {
        self.separate.lock().push(chain);
        Ok(())
    }
}

pub(crate) struct Harness {
    node: Arc<NodeContext>,
    recorder: Arc<RecordingDispatcher>,
    journal: Journal,
    script: Script,
}

impl Harness {
    pub(crate) fn local() -> Self {
        Self::with_config(EngineConfig::local())
    }

    pub(crate) fn with_config(config: EngineConfig) -> Self {
        let journal = Journal::default();
        let script = Script::default();
        let mut registry = ActionRegistry::with_builtins();
        register_test_actions(&mut registry, &journal, &script);
        Self {
            node: Arc::new(NodeContext::new(config, registry)),
            recorder: Arc::new(RecordingDispatcher::default()),
            journal,
            script,
        }
    }

    pub(crate) fn node(&self) -> Arc<NodeContext> {
        Arc::clone(&self.node)
    }

    pub(crate) fn dispatcher(&self) -> Arc<dyn ChainDispatcher> {
        self.recorder.clone()
    }

    pub(crate) fn recorder(&self) -> &RecordingDispatcher {
        &self.recorder
    }

    pub(crate) fn root(&self, actions: ActionSequence) -> Chain {
        Chain::root(
            self.node.ids().next_chain_id(),
            SUBMISSION,
            NodeId::new(0),
            &actions,
            InputSource::Dummy,
        )
    }

    pub(crate) fn build(&self, chain: Chain) -> ChainExecutor {
        ChainExecutor::build(chain, self.node(), self.dispatcher(), None).unwrap()
    }

    pub(crate) fn open_dummy(&self) -> OpenedInput {
        OpenedInput {
            tuples: Box::new(DummyInput::default()),
            forwarded: CounterDeltas::new(),
        }
    }

    pub(crate) fn journal(&self) -> Vec<String> {
        self.journal.lock().clone()
    }

    pub(crate) fn counter(&self, name: &str) -> i64 {
        self.node.stats().counter(SUBMISSION, name)
    }

    pub(crate) fn set_script(&self, ops: Vec<(usize, u8)>) {
        *self.script.lock() = ops;
    }
}

pub(crate) fn seq(steps: &[ActionConf]) -> ActionSequence {
    ActionSequence::from(steps.to_vec())
}

pub(crate) fn journal_step(label: &str) -> ActionConf {
    ActionConf::new("journal").with_param("label", label)
}

/// One journal step per comma-separated label of `child`
fn child_sequence(conf: &ActionConf) -> ActionSequence {
    conf.str_param("child")
        .map(|labels| {
            let steps: Vec<_> = labels.split(',').map(journal_step).collect();
            seq(&steps)
        })
        .unwrap_or_default()
}

fn register_test_actions(registry: &mut ActionRegistry, journal: &Journal, script: &Script) {
    let log = Arc::clone(journal);
    registry.register_or_replace("journal", move |conf: &ActionConf| {
        Ok(Box::new(JournalStep {
            label: conf.str_param("label").unwrap_or_default().to_string(),
            track_principal: conf.bool_param_or("track_principal", false),
            journal: Arc::clone(&log),
        }) as Box<dyn Action>)
    });
    registry.register_or_replace("emit", |conf: &ActionConf| {
        Ok(Box::new(Emit {
            count: conf.long_param_or("count", 1) as i32,
            on_start: conf.bool_param_or("on_start", false),
        }) as Box<dyn Action>)
    });
    registry.register_or_replace("fail", |conf: &ActionConf| {
        Ok(Box::new(Fail {
            phase: conf.str_param("phase").unwrap_or("process").to_string(),
        }) as Box<dyn Action>)
    });
    registry.register_or_replace("brancher", |conf: &ActionConf| {
        Ok(Box::new(Brancher {
            child: child_sequence(conf),
        }) as Box<dyn Action>)
    });
    registry.register_or_replace("splitter", |conf: &ActionConf| {
        let child = child_sequence(conf);
        Ok(Box::new(Splitter {
            reconnect: conf.long_param_or("reconnect", 0) as i32,
            child: (!child.is_empty()).then_some(child),
            output: None,
        }) as Box<dyn Action>)
    });
    registry.register_or_replace("migrate_branch", |conf: &ActionConf| {
        Ok(Box::new(MigrateBranch {
            bucket: BucketId::new(conf.long_param("bucket")? as u32),
            child: child_sequence(conf),
            transfer: None,
        }) as Box<dyn Action>)
    });
    let ops = Arc::clone(script);
    registry.register_or_replace("scripted", move |_conf: &ActionConf| {
        Ok(Box::new(Scripted {
            script: Arc::clone(&ops),
        }) as Box<dyn Action>)
    });
}

struct JournalStep {
    label: String,
    track_principal: bool,
    journal: Journal,
}

impl Action for JournalStep {
    fn start_process(&mut self, _ctx: &mut ActionContext<'_>) -> CoreResult<()> {
        self.journal.lock().push(format!("start:{}", self.label));
        Ok(())
    }

    fn process(&mut self, tuple: &Tuple, ctx: &mut ActionContext<'_>) -> CoreResult<()> {
        {
            let mut journal = self.journal.lock();
            if self.track_principal {
                journal.push(format!("principal:{}:{}", self.label, ctx.is_principal_branch()));
            }
            journal.push(format!("process:{}:{}", self.label, tuple));
        }
        ctx.output(tuple)
    }

    fn stop_process(&mut self, _ctx: &mut ActionContext<'_>) -> CoreResult<()> {
        self.journal.lock().push(format!("stop:{}", self.label));
        Ok(())
    }
}

struct Emit {
    count: i32,
    on_start: bool,
}

impl Emit {
    fn emit(&self, ctx: &mut ActionContext<'_>) -> CoreResult<()> {
        for i in 0..self.count {
            ctx.output_values(&[Value::Int(i)])?;
        }
        Ok(())
    }
}

impl Action for Emit {
    fn start_process(&mut self, ctx: &mut ActionContext<'_>) -> CoreResult<()> {
        if self.on_start { self.emit(ctx) } else { Ok(()) }
    }

    fn process(&mut self, _tuple: &Tuple, ctx: &mut ActionContext<'_>) -> CoreResult<()> {
        if self.on_start { Ok(()) } else { self.emit(ctx) }
    }
}

struct Fail {
    phase: String,
}

impl Fail {
    fn check(&self, phase: &str) -> CoreResult<()> {
        if self.phase == phase {
            return Err(CoreError::Internal {
                message: format!("failed in {}", phase),
            });
        }
        Ok(())
    }
}

impl Action for Fail {
    fn start_process(&mut self, _ctx: &mut ActionContext<'_>) -> CoreResult<()> {
        self.check("start")
    }

    fn process(&mut self, tuple: &Tuple, ctx: &mut ActionContext<'_>) -> CoreResult<()> {
        self.check("process")?;
        ctx.output(tuple)
    }

    fn stop_process(&mut self, _ctx: &mut ActionContext<'_>) -> CoreResult<()> {
        self.check("stop")
    }
}

struct Brancher {
    child: ActionSequence,
}

impl Action for Brancher {
    fn process(&mut self, tuple: &Tuple, ctx: &mut ActionContext<'_>) -> CoreResult<()> {
        ctx.branch(&self.child)?;
        ctx.output(tuple)
    }
}

struct Splitter {
    reconnect: i32,
    child: Option<ActionSequence>,
    output: Option<SplitOutput>,
}

impl Action for Splitter {
    fn start_process(&mut self, ctx: &mut ActionContext<'_>) -> CoreResult<()> {
        self.output = Some(ctx.split(self.reconnect, self.child.as_ref())?);
        Ok(())
    }

    fn process(&mut self, tuple: &Tuple, ctx: &mut ActionContext<'_>) -> CoreResult<()> {
        if let Some(output) = &mut self.output {
            output.output(tuple)?;
        }
        ctx.output(tuple)
    }
}

struct MigrateBranch {
    bucket: BucketId,
    child: ActionSequence,
    transfer: Option<TransferHandle>,
}

impl Action for MigrateBranch {
    fn start_process(&mut self, ctx: &mut ActionContext<'_>) -> CoreResult<()> {
        self.transfer = Some(ctx.start_transfer(NodeId::new(0), self.bucket, None)?);
        Ok(())
    }

    fn process(&mut self, tuple: &Tuple, ctx: &mut ActionContext<'_>) -> CoreResult<()> {
        if let Some(transfer) = self.transfer {
            ctx.write_transfer(transfer, tuple)?;
        }
        if !self.child.is_empty() {
            ctx.branch(&self.child)?;
        }
        Ok(())
    }

    fn stop_process(&mut self, ctx: &mut ActionContext<'_>) -> CoreResult<()> {
        match self.transfer.take() {
            Some(transfer) => {
                let secondary = !ctx.is_principal_branch();
                ctx.finish_transfer(transfer, secondary)
            }
            None => Ok(()),
        }
    }

    fn migration_target(&self) -> Option<MigrationTarget> {
        Some(MigrationTarget {
            node: None,
            bucket: self.bucket,
        })
    }
}

struct Scripted {
    script: Script,
}

impl Action for Scripted {
    fn process(&mut self, tuple: &Tuple, ctx: &mut ActionContext<'_>) -> CoreResult<()> {
        let ops = self.script.lock().clone();
        let head = seq(&[journal_step("s")]);
        for (step, kind) in ops {
            if step != ctx.index() {
                continue;
            }
            match kind {
                0 => ctx.branch(&head)?,
                1 => drop(ctx.split(0, Some(&head))?),
                _ => drop(ctx.split(-1, Some(&head))?),
            }
        }
        ctx.output(tuple)
    }
}
