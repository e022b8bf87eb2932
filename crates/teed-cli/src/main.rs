//! teed-worker CLI
//!
//! Runs the task worker against RabbitMQ, or publishes a task for it.
//! Configuration comes from the environment (and `.env`).

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use teed_core::app::{WorkerBuilder, listen_for_signals, shutdown_channel};
use teed_core::domain::{Envelope, Operation, Task, TaskArgs, TaskId};
use teed_core::impls::{AmqpConnector, CommandOperation};
use teed_core::ports::{Connector, QueueSpec};
use teed_core::WorkerConfig;
use tracing::{Level, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "teed-worker")]
#[command(about = "Consume processing tasks from a durable queue and run them")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker until SIGINT/SIGTERM (default)
    Run {
        /// Refuse to start unless this operation has a command configured
        #[arg(
            long = "require",
            value_name = "OPERATION",
            env = "REQUIRED_OPERATIONS",
            value_delimiter = ','
        )]
        require: Vec<Operation>,
    },

    /// Publish a task to the worker queue and print its id
    Publish {
        /// Operation to request (bulkcm_probe, bulkcm_split, bulkcm_parse, meas_parse)
        #[arg(short, long, required_unless_present = "raw")]
        operation: Option<Operation>,

        /// Task argument, repeatable
        #[arg(short, long = "arg", value_name = "KEY=VALUE", value_parser = parse_key_val)]
        args: Vec<(String, String)>,

        /// Task this one was derived from
        #[arg(long)]
        parent_id: Option<TaskId>,

        /// Producer identity (defaults to the worker name)
        #[arg(long)]
        created_by: Option<String>,

        /// Publish this body verbatim instead of building a task
        #[arg(long, conflicts_with_all = ["operation", "args", "parent_id", "created_by"])]
        raw: Option<String>,

        /// Content type for --raw (omit for none)
        #[arg(long, requires = "raw")]
        content_type: Option<String>,
    },
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine; the environment may already be set.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_ascii_lowercase()));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = WorkerConfig::from_env().context("invalid configuration")?;

    // Bare invocation means `run`; parse it so its env-backed args still apply.
    let command = match cli.command {
        Some(command) => command,
        None => Cli::try_parse_from(["teed-worker", "run"])?
            .command
            .context("default run command")?,
    };

    match command {
        Commands::Run { require } => run_worker(config, &require).await,
        Commands::Publish {
            operation,
            args,
            parent_id,
            created_by,
            raw,
            content_type,
        } => {
            let (envelope, task_id) = match raw {
                Some(body) => (Envelope::new(content_type, body), None),
                None => {
                    let Some(operation) = operation else {
                        bail!("--operation is required");
                    };
                    let args: TaskArgs = args.into_iter().collect();
                    let created_by = created_by.unwrap_or_else(|| config.worker_name.clone());
                    let mut task = Task::new(TaskId::generate(), Utc::now(), created_by, operation, args);
                    if let Some(parent_id) = parent_id {
                        task = task.with_parent(parent_id);
                    }
                    (Envelope::json(serde_json::to_vec(&task)?), Some(task.id()))
                }
            };
            publish(&config, &envelope).await?;
            if let Some(task_id) = task_id {
                println!("{task_id}");
            }
            Ok(())
        }
    }
}

async fn run_worker(config: WorkerConfig, require: &[Operation]) -> Result<()> {
    info!(config = ?config, "Loaded configuration");

    let mut builder = WorkerBuilder::from_config(&config)
        .connector(Arc::new(AmqpConnector::new(config.broker.clone())))
        .expect_operations(require);

    for (operation, argv) in &config.operation_commands {
        let Some(command) = CommandOperation::from_argv(argv) else {
            continue;
        };
        info!(operation = %operation, program = command.program(), "Operation {} runs '{}'", operation, command.program());
        builder = builder.register(
            *operation,
            Arc::new(command.partial_exit_code(config.partial_exit_code)),
        )?;
    }
    if config.operation_commands.is_empty() {
        warn!("No operation commands configured; every task will resolve as failed");
    }

    let worker = builder.build()?;

    let (handle, signal) = shutdown_channel();
    listen_for_signals(handle);

    let stats = worker.run(signal).await?;
    info!(
        "Processed {} messages: {} done, {} done with error, {} failed, {} rejected",
        stats.received, stats.done, stats.done_with_error, stats.failed, stats.rejected
    );
    Ok(())
}

async fn publish(config: &WorkerConfig, envelope: &Envelope) -> Result<()> {
    let queue = &config.broker.queue_name;
    let connector = AmqpConnector::new(config.broker.clone());
    let broker = connector.connect().await?;

    let result = async {
        broker.declare_queue(&QueueSpec::durable(queue.as_str())).await?;
        broker.publish(queue, envelope).await
    }
    .await;
    broker.close().await?;
    result?;

    info!(queue = %queue, "Published {} bytes to {}", envelope.body.len(), queue);
    Ok(())
}
