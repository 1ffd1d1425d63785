//! taskmill: runs one task manager instance against an in-memory store.
//!
//! Registers a few demo task types, schedules a recurring task, triggers a `run_now`
//! and an ephemeral batch, then keeps polling until Ctrl-C.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use taskmill_core::app::TaskManagerBuilder;
use taskmill_core::config::TaskManagerConfig;
use taskmill_core::domain::{IntervalSchedule, RunResult, RunnerError};
use taskmill_core::typed::{Handler, RunContext, TaskDefinition, TaskParams};

// ── CLI ─────────────────────────────────────────────────────────────

/// Task manager demo instance.
#[derive(Parser, Debug)]
#[command(name = "taskmill", version, about)]
struct Cli {
    /// Path to a TOML config file. Missing fields use defaults.
    #[arg(long, env = "TASKMILL_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides `poll_interval_ms`.
    #[arg(long, env = "TASKMILL_POLL_INTERVAL_MS")]
    poll_interval_ms: Option<u64>,

    /// Overrides `max_workers`.
    #[arg(long, env = "TASKMILL_MAX_WORKERS")]
    max_workers: Option<usize>,

    /// Owner id of this instance (generated when absent).
    #[arg(long, env = "TASKMILL_OWNER_ID")]
    owner_id: Option<String>,
}

fn load_config(path: Option<&Path>) -> anyhow::Result<TaskManagerConfig> {
    let Some(path) = path else {
        return Ok(TaskManagerConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let config = toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?;
    info!(path = %path.display(), "loaded config");
    Ok(config)
}

// ── Demo task types ─────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct Heartbeat;

impl TaskParams for Heartbeat {
    const TYPE: &'static str = "demo.heartbeat";
}

struct HeartbeatHandler;

#[async_trait]
impl Handler<Heartbeat> for HeartbeatHandler {
    async fn run(&self, _params: Heartbeat, ctx: RunContext) -> Result<RunResult, RunnerError> {
        let beats = ctx.state.get("beats").and_then(|v| v.as_u64()).unwrap_or(0) + 1;
        info!(task_id = %ctx.id, beats, "heartbeat");
        Ok(RunResult::with_state(serde_json::json!({ "beats": beats })))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Greet {
    name: String,
}

impl TaskParams for Greet {
    const TYPE: &'static str = "demo.greet";
}

struct GreetHandler;

#[async_trait]
impl Handler<Greet> for GreetHandler {
    async fn run(&self, params: Greet, _ctx: RunContext) -> Result<RunResult, RunnerError> {
        if params.name.is_empty() {
            return Err(RunnerError::new("nobody to greet"));
        }
        Ok(RunResult::with_state(
            serde_json::json!({ "greeting": format!("Hello, {}!", params.name) }),
        ))
    }
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(poll_interval_ms) = cli.poll_interval_ms {
        config.poll_interval_ms = poll_interval_ms;
    }
    if let Some(max_workers) = cli.max_workers {
        config.max_workers = max_workers;
    }

    let mut builder = TaskManagerBuilder::new()
        .config(config)
        .register_typed::<Heartbeat, _>(HeartbeatHandler)?
        .register(
            TaskDefinition::typed::<Greet, _>(GreetHandler)
                .with_title("Greeting")
                .with_max_concurrency(2)
                .with_timeout(Duration::from_secs(5)),
        )?
        .expect_tasks(&[Heartbeat::TYPE, Greet::TYPE]);
    if let Some(owner_id) = cli.owner_id {
        builder = builder.owner_id(owner_id);
    }
    let manager = builder.build()?;
    let handle = manager.start();
    let scheduling = handle.scheduling();

    let heartbeat = Heartbeat
        .to_instance()?
        .with_id("demo-heartbeat")
        .with_schedule(IntervalSchedule::every(Duration::from_secs(10)));
    scheduling.ensure_scheduled(heartbeat).await?;

    let greet = Greet {
        name: "taskmill".to_string(),
    }
    .to_instance()?
    .with_id("demo-greet");
    scheduling.schedule(greet).await?;
    match scheduling.run_now("demo-greet").await {
        Ok(result) => info!(task_id = %result.id, state = %result.state, "run_now finished"),
        Err(err) => warn!(error = %err, "run_now failed"),
    }

    let batch = vec![
        Greet {
            name: "ephemeral".to_string(),
        }
        .to_ephemeral()?,
        Greet {
            name: String::new(),
        }
        .to_ephemeral()?,
    ];
    for result in scheduling.ephemeral_run_now(batch).await {
        match result {
            Ok(ran) => info!(task_id = %ran.id, state = %ran.state, "ephemeral task finished"),
            Err(err) => warn!(error = %err, "ephemeral task failed"),
        }
    }

    info!(owner = %handle.owner_id(), "running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    let counts = scheduling.counts().await?;
    info!(idle = counts.idle, running = counts.running, failed = counts.failed, "final task counts");
    handle.shutdown_and_join().await;
    Ok(())
}
