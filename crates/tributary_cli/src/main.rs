//! TRIBUTARY CLI
//!
//! Runs demo submissions on a single node or an in-process cluster and
//! prints the effective engine configuration.

#![warn(missing_docs)]
#![warn(clippy::all)]

use anyhow::Context;
use clap::{Parser, Subcommand};
use color_eyre::Result;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tributary_cluster::{LoopbackCluster, Node, SubmissionStatus};
use tributary_core::{ActionConf, ActionSequence, EngineConfig, InputSource};
use tributary_runtime::ActionRegistry;
use tributary_runtime::builtin::{COLLECT_TO_BUCKET, COUNT, FORK, GENERATE};

#[derive(Parser)]
#[command(name = "tributary")]
#[command(about = "TRIBUTARY - Distributed dataflow chain engine", long_about = None)]
struct Cli {
    /// Engine configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the demo pipeline: generate, fork, collect to a bucket, count
    Run {
        /// Nodes to run; more than one starts a loopback cluster
        #[arg(short, long, default_value_t = 1)]
        nodes: u32,
        /// Tuples generated by the root chain
        #[arg(short, long, default_value_t = 1000)]
        tuples: i64,
        /// Copies forked by the root chain
        #[arg(long, default_value_t = 2)]
        copies: i64,
        /// Node receiving the bucket the computation migrates to
        #[arg(long, default_value_t = 0)]
        bucket_node: i64,
        /// Seconds to wait for completion
        #[arg(long, default_value_t = 30)]
        timeout: u64,
        /// Print the outcome as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration
    Config,
    /// List the built-in steps
    Steps,
}

/// Outcome of a demo run
#[derive(Debug, Serialize)]
struct RunReport {
    nodes: u32,
    status: String,
    elapsed_ms: u64,
    counters: Vec<(String, i64)>,
}

/// Load the configuration file, or the defaults when none is given
fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::from_json_file(path)
            .with_context(|| format!("failed to load configuration from {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

fn demo_pipeline(tuples: i64, copies: i64, bucket_node: i64) -> ActionSequence {
    ActionSequence::new()
        .then(ActionConf::new(GENERATE).with_param("count", tuples))
        .then(ActionConf::new(FORK).with_param("copies", copies))
        .then(
            ActionConf::new(COLLECT_TO_BUCKET)
                .with_param("bucket", 1i64)
                .with_param("node", bucket_node)
                .with_param("sort", "0"),
        )
        .then(ActionConf::new(COUNT))
}

fn describe(status: &SubmissionStatus) -> String {
    match status {
        SubmissionStatus::Running => "running".to_string(),
        SubmissionStatus::Completed => "completed".to_string(),
        SubmissionStatus::Failed(reason) => format!("failed: {}", reason),
    }
}

async fn run(
    config: EngineConfig,
    nodes: u32,
    actions: &ActionSequence,
    timeout: Duration,
) -> anyhow::Result<RunReport> {
    let started = Instant::now();
    let (status, stats) = if nodes <= 1 {
        let config = EngineConfig {
            local_mode: true,
            node_count: 1,
            ..config
        };
        let node = Node::start(config, ActionRegistry::with_builtins(), None)?;
        let mut handle = node.submit(actions, InputSource::Dummy)?;
        let status = handle.wait_timeout(timeout).await?;
        let stats = node.stats(handle.id());
        node.shutdown();
        (status, stats)
    } else {
        let cluster = LoopbackCluster::start(&config, nodes)?;
        let mut handle = cluster.submit(actions, InputSource::Dummy)?;
        let status = handle.wait_timeout(timeout).await?;
        let stats = cluster.stats(handle.id());
        tracing::info!(
            messages = cluster.network_stats().messages,
            bytes = cluster.network_stats().bytes,
            "network traffic"
        );
        cluster.shutdown();
        (status, stats)
    };

    Ok(RunReport {
        nodes: nodes.max(1),
        status: describe(&status),
        elapsed_ms: started.elapsed().as_millis() as u64,
        counters: stats
            .iter()
            .map(|(name, value)| (name.to_string(), value))
            .collect(),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tributary=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())
        .map_err(|err| color_eyre::eyre::eyre!("{:#}", err))?;

    match cli.command {
        Commands::Run {
            nodes,
            tuples,
            copies,
            bucket_node,
            timeout,
            json,
        } => {
            let actions = demo_pipeline(tuples, copies, bucket_node);
            let report = run(config, nodes, &actions, Duration::from_secs(timeout))
                .await
                .map_err(|err| color_eyre::eyre::eyre!("{:#}", err))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "Submission {} on {} node(s) in {} ms",
                    report.status, report.nodes, report.elapsed_ms
                );
                for (name, value) in &report.counters {
                    println!("  {:<32} {}", name, value);
                }
            }
            Ok(())
        }
        Commands::Config => {
            println!("{}", config.to_json()?);
            Ok(())
        }
        Commands::Steps => {
            let registry = ActionRegistry::with_builtins();
            let mut names: Vec<&str> = registry.names().collect();
            names.sort_unstable();
            for name in names {
                println!("{}", name);
            }
            Ok(())
        }
    }
}
