//! tasks-cli: runs a handful of demo tasks on an in-memory engine.

mod demo;

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use tasks_core::app::BlankTask;
use tasks_core::{EngineBuilder, RequestContext, TaskId, TaskType, TasksConfig};

use demo::{DoubleTask, FanoutTask, FlakyTask};

/// Short periods so the demo finishes in a few seconds.
const DEMO_CONFIG: &str = r#"
runners_count = 4
stalking_runners_count = 1
poll_for_task_updates_period = "100ms"
poll_for_tasks_period_min = "100ms"
poll_for_tasks_period_max = "300ms"
poll_for_stalling_tasks_period_min = "1s"
poll_for_stalling_tasks_period_max = "2s"
task_ping_period = "500ms"
task_stalling_timeout = "5s"
task_waiting_timeout = "1s"
max_retriable_error_count = 5
"#;

#[derive(Parser, Debug)]
#[command(name = "tasks-cli", version, about = "Run demo tasks on an in-memory engine")]
struct Cli {
    /// Path to a TOML config file. Built-in demo settings are used when omitted.
    #[arg(long, env = "TASKS_CONFIG")]
    config: Option<String>,

    /// Host name reported in heartbeats.
    #[arg(long, env = "TASKS_HOST", default_value = "localhost")]
    host: String,

    /// Input of the double task.
    #[arg(long, default_value_t = 21)]
    value: i64,

    /// How many times the flaky task fails before succeeding.
    #[arg(long, default_value_t = 2)]
    flaky_failures: u32,

    /// Inputs of the fanout task.
    #[arg(long, value_delimiter = ',', default_value = "1,2,3")]
    fanout: Vec<i64>,

    /// Give up waiting after this many seconds.
    #[arg(long, default_value_t = 30)]
    timeout: u64,
}

fn load_config(cli: &Cli) -> anyhow::Result<TasksConfig> {
    match &cli.config {
        Some(path) => {
            let config = TasksConfig::from_file(path)
                .with_context(|| format!("failed to load config from {path}"))?;
            info!(path = %path, "loaded tasks config");
            Ok(config)
        }
        None => TasksConfig::from_toml(DEMO_CONFIG).context("invalid built-in demo config"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let mut engine = EngineBuilder::new()
        .config(config)
        .host(cli.host.clone())
        .register_typed_for_execution::<DoubleTask>()?
        .register_typed_for_execution::<FlakyTask>()?
        .register_for_execution_with(FanoutTask::TYPE, |s| Box::new(FanoutTask::new(s.clone())))
        .expect_tasks(&[DoubleTask::TYPE, FlakyTask::TYPE, FanoutTask::TYPE])
        .build()
        .context("failed to build engine")?;
    engine.start();

    let scheduler = engine.scheduler().clone();
    let ctx = RequestContext::default().with_user("tasks-cli");
    let mut submitted: Vec<(&str, TaskId)> = vec![
        (
            DoubleTask::TYPE,
            scheduler
                .schedule_task(&ctx, DoubleTask::TYPE, "double", &cli.value, "", "")
                .await?,
        ),
        (
            FlakyTask::TYPE,
            scheduler
                .schedule_task(&ctx, FlakyTask::TYPE, "flaky", &cli.flaky_failures, "", "")
                .await?,
        ),
        (
            FanoutTask::TYPE,
            scheduler
                .schedule_task(&ctx, FanoutTask::TYPE, "fanout", &cli.fanout, "", "")
                .await?,
        ),
    ];
    submitted.push((BlankTask::TYPE, scheduler.schedule_blank_task(&ctx).await?));

    let timeout = Duration::from_secs(cli.timeout);
    let waiting = async {
        for (task_type, id) in &submitted {
            match scheduler.wait_task_sync(*id, timeout).await {
                Ok(response) => println!("{task_type} {id}: {response}"),
                Err(err) => println!("{task_type} {id}: failed: {err}"),
            }
        }
    };

    tokio::select! {
        _ = waiting => {}
        _ = tokio::signal::ctrl_c() => warn!("interrupted"),
    }

    for (_, id) in &submitted {
        let op = scheduler.get_operation(*id).await?;
        println!("{}", serde_json::to_string_pretty(&op)?);
    }

    engine.shutdown_and_join().await;
    Ok(())
}
