//! Built-in steps.

use crate::action::{Action, ActionOutput, MigrationTarget};
use crate::executor::ActionContext;
use crate::fork::{DEFAULT_MIGRATION_NODE, TransferHandle};
use crate::registry::ActionRegistry;
use tributary_core::{
    ActionConf, ActionSequence, BucketId, CoreError, CoreResult, NodeId, Tuple, Value,
};

/// Writes every record to a bucket, optionally moving the rest of the
/// chain next to it.
///
/// Split chains are not counted as writers, so without `migrate` they
/// should reconnect after this step.
pub const COLLECT_TO_BUCKET: &str = "collect_to_bucket";
/// Emits `count` numbered records per input record
pub const GENERATE: &str = "generate";
/// Forwards records unchanged
pub const IDENTITY: &str = "identity";
/// Counts records into a statistics counter
pub const COUNT: &str = "count";
/// Branches `copies` chains running the rest of this one
pub const FORK: &str = "fork";
/// Waits for a synchronization token before processing
pub const WAIT: &str = "wait";
/// Signals a synchronization token once its input is exhausted
pub const SIGNAL: &str = "signal";

/// Default statistics counter of [`COUNT`]
pub const TUPLES_COUNTED: &str = "Tuples Counted";

/// Register every built-in step
pub fn register_builtins(registry: &mut ActionRegistry) {
    registry.register_or_replace(COLLECT_TO_BUCKET, |conf: &ActionConf| {
        Ok(Box::new(CollectToBucket::from_conf(conf)?) as Box<dyn Action>)
    });
    registry.register_or_replace(GENERATE, |conf: &ActionConf| {
        let count = conf.long_param(GENERATE_COUNT)?;
        Ok(Box::new(Generate { count }) as Box<dyn Action>)
    });
    registry.register_or_replace(IDENTITY, |_conf: &ActionConf| {
        Ok(Box::new(Identity) as Box<dyn Action>)
    });
    registry.register_or_replace(COUNT, |conf: &ActionConf| {
        let counter = conf.str_param("name").unwrap_or(TUPLES_COUNTED).to_string();
        Ok(Box::new(Count { counter, seen: 0 }) as Box<dyn Action>)
    });
    registry.register_or_replace(FORK, |conf: &ActionConf| {
        let copies = conf.long_param("copies")?;
        Ok(Box::new(Fork { copies }) as Box<dyn Action>)
    });
    registry.register_or_replace(WAIT, |conf: &ActionConf| {
        let token = token_param(conf)?;
        Ok(Box::new(Wait { token }) as Box<dyn Action>)
    });
    registry.register_or_replace(SIGNAL, |conf: &ActionConf| {
        let token = token_param(conf)?;
        Ok(Box::new(Signal { token }) as Box<dyn Action>)
    });
}

const GENERATE_COUNT: &str = "count";

fn token_param(conf: &ActionConf) -> CoreResult<i32> {
    let token = conf.long_param("token")?;
    i32::try_from(token).map_err(|_| CoreError::Validation {
        field: format!("{}.token", conf.name),
        reason: format!("{} out of range", token),
    })
}

/// Parse a sort key such as `"0,2"` into field indices
///
/// # Errors
///
/// Returns error if a field is not a non-negative integer
pub fn parse_sort(key: &str) -> CoreResult<Vec<usize>> {
    key.split(',')
        .map(str::trim)
        .filter(|field| !field.is_empty())
        .map(|field| {
            field.parse::<usize>().map_err(|_| CoreError::Validation {
                field: "sort".to_string(),
                reason: format!("invalid field index '{}'", field),
            })
        })
        .collect()
}

struct CollectToBucket {
    node: Option<NodeId>,
    bucket: BucketId,
    sort: Option<Vec<usize>>,
    migrate: bool,
    transfer: Option<TransferHandle>,
}

impl CollectToBucket {
    fn from_conf(conf: &ActionConf) -> CoreResult<Self> {
        let out_of_range = |key: &str, value: i64| CoreError::Validation {
            field: format!("{}.{}", conf.name, key),
            reason: format!("{} out of range", value),
        };

        let bucket = conf.long_param("bucket")?;
        let bucket = u32::try_from(bucket).map_err(|_| out_of_range("bucket", bucket))?;
        let node = match conf.param("node").and_then(Value::as_long) {
            Some(node) => Some(NodeId::new(
                u32::try_from(node).map_err(|_| out_of_range("node", node))?,
            )),
            None => None,
        };
        let sort = conf.str_param("sort").map(parse_sort).transpose()?;

        Ok(Self {
            node,
            bucket: BucketId::new(bucket),
            sort,
            migrate: conf.bool_param_or("migrate", true),
            transfer: None,
        })
    }
}

impl Action for CollectToBucket {
    fn start_process(&mut self, ctx: &mut ActionContext<'_>) -> CoreResult<()> {
        let node = self.node.unwrap_or(DEFAULT_MIGRATION_NODE);
        self.transfer = Some(ctx.start_transfer(node, self.bucket, self.sort.clone())?);
        Ok(())
    }

    fn process(&mut self, tuple: &Tuple, ctx: &mut ActionContext<'_>) -> CoreResult<()> {
        let transfer = self
            .transfer
            .ok_or_else(|| CoreError::usage(COLLECT_TO_BUCKET, "transfer not started"))?;
        ctx.write_transfer(transfer, tuple)?;
        ctx.output(tuple)
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
        self.migrate.then_some(MigrationTarget {
            node: self.node,
            bucket: self.bucket,
        })
    }
}

struct Generate {
    count: i64,
}

impl Action for Generate {
    fn process(&mut self, _tuple: &Tuple, ctx: &mut ActionContext<'_>) -> CoreResult<()> {
        for i in 0..self.count {
            ctx.output_values(&[Value::Long(i)])?;
        }
        Ok(())
    }
}

struct Identity;

impl Action for Identity {
    fn process(&mut self, tuple: &Tuple, ctx: &mut ActionContext<'_>) -> CoreResult<()> {
        ctx.output(tuple)
    }
}

struct Count {
    counter: String,
    seen: i64,
}

impl Action for Count {
    fn process(&mut self, tuple: &Tuple, ctx: &mut ActionContext<'_>) -> CoreResult<()> {
        self.seen += 1;
        ctx.output(tuple)
    }

    fn stop_process(&mut self, ctx: &mut ActionContext<'_>) -> CoreResult<()> {
        ctx.incr_counter(&self.counter, self.seen);
        Ok(())
    }
}

struct Fork {
    copies: i64,
}

impl Action for Fork {
    fn start_process(&mut self, ctx: &mut ActionContext<'_>) -> CoreResult<()> {
        // Only the original chain forks, or every copy would fork again
        if !ctx.is_principal_branch() {
            return Ok(());
        }
        let head = ActionSequence::new().then(ActionConf::new(IDENTITY));
        for _ in 0..self.copies {
            ctx.branch(&head)?;
        }
        Ok(())
    }

    fn process(&mut self, tuple: &Tuple, ctx: &mut ActionContext<'_>) -> CoreResult<()> {
        ctx.output(tuple)
    }
}

struct Wait {
    token: i32,
}

impl Action for Wait {
    fn start_process(&mut self, ctx: &mut ActionContext<'_>) -> CoreResult<()> {
        ctx.wait_for(self.token)
    }

    fn process(&mut self, tuple: &Tuple, ctx: &mut ActionContext<'_>) -> CoreResult<()> {
        ctx.output(tuple)
    }
}

struct Signal {
    token: i32,
}

impl Action for Signal {
    fn process(&mut self, tuple: &Tuple, ctx: &mut ActionContext<'_>) -> CoreResult<()> {
        ctx.output(tuple)
    }

    fn stop_process(&mut self, ctx: &mut ActionContext<'_>) -> CoreResult<()> {
        ctx.signal(self.token)
    }
}
