//! # TaskClaw — governed trigger engine CLI
//!
//! Usage:
//!   taskclaw validate                    # Check config and every [[triggers]] entry
//!   taskclaw next daily_report -n 5      # Upcoming fire times for a trigger
//!   taskclaw fire daily_report           # Run one firing now and print the result
//!   taskclaw run                         # Start the scheduler loop (Ctrl-C to stop)

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use taskclaw_core::SchedulerConfig;
use taskclaw_scheduler::cron::CronSchedule;
use taskclaw_scheduler::dispatch::channels_from_config;
use taskclaw_scheduler::tasks::{FallbackContext, FallbackHandler};
use taskclaw_scheduler::{
    HttpExecutor, LogChannel, MemoryLedger, SqliteCircuitStore, TriggerConfig, TriggerRegistry,
    spawn_scheduler,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "taskclaw",
    version,
    about = "⏰ TaskClaw — governed scheduled trigger engine"
)]
struct Cli {
    /// Config file (scheduler settings plus [[triggers]])
    #[arg(short, long, default_value = "~/.taskclaw/config.toml")]
    config: String,

    /// Persist circuit breaker state in this SQLite file
    #[arg(long)]
    circuit_db: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate the config file and its triggers
    Validate,
    /// Show upcoming fire times for a trigger
    Next {
        event_name: String,
        #[arg(short = 'n', long, default_value = "5")]
        count: usize,
    },
    /// Fire a trigger immediately, bypassing its schedule
    Fire {
        event_name: String,
        /// JSON payload handed to the executor or fallback
        #[arg(long)]
        payload: Option<String>,
    },
    /// Run the scheduler loop until Ctrl-C
    Run {
        /// Seconds to wait for in-flight firings on shutdown
        #[arg(long, default_value = "30")]
        drain_timeout: u64,
    },
}

/// On-disk config: scheduler settings, trigger table, optional agent endpoint.
#[derive(Debug, Default, Deserialize)]
struct AppConfig {
    #[serde(flatten)]
    scheduler: SchedulerConfig,
    #[serde(default)]
    triggers: Vec<TriggerConfig>,
    #[serde(default)]
    executor: Option<ExecutorSection>,
}

#[derive(Debug, Deserialize)]
struct ExecutorSection {
    url: String,
    #[serde(default)]
    bearer_token: Option<String>,
    #[serde(default = "default_executor_timeout_secs")]
    timeout_secs: u64,
}

fn default_executor_timeout_secs() -> u64 {
    300
}

fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

fn load_config(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        tracing::warn!("⚠️ Config not found at {}, using defaults", path.display());
        return Ok(AppConfig::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let mut config: AppConfig =
        toml::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))?;
    config.scheduler.validate()?;
    config.scheduler.batch.fallback_log_path =
        expand_path(&config.scheduler.batch.fallback_log_path.to_string_lossy());
    Ok(config)
}

/// Config-file triggers carry no code, so their fallback path logs the firing.
fn log_fallback() -> FallbackHandler {
    FallbackHandler::from_sync(|ctx: FallbackContext| {
        tracing::info!(
            "📝 Fallback for '{}' ({}): payload {}",
            ctx.event_name,
            ctx.execution_id,
            ctx.payload
        );
        Ok(serde_json::json!({ "logged": true }))
    })
}

async fn build_registry(cli: &Cli, config: AppConfig) -> Result<Arc<TriggerRegistry>> {
    let mut builder = TriggerRegistry::builder(config.scheduler.clone())
        .ledger(Arc::new(MemoryLedger::new()))
        .channel(Arc::new(LogChannel));

    for channel in channels_from_config(&config.scheduler.notify) {
        builder = builder.channel(channel);
    }
    if let Some(section) = &config.executor {
        let mut executor =
            HttpExecutor::new(&section.url).with_timeout(Duration::from_secs(section.timeout_secs));
        if let Some(token) = &section.bearer_token {
            executor = executor.with_bearer_token(token);
        }
        builder = builder.executor(Arc::new(executor));
    }
    if let Some(db) = &cli.circuit_db {
        let path = expand_path(db);
        let store = SqliteCircuitStore::open(&path)
            .with_context(|| format!("failed to open circuit store {}", path.display()))?;
        builder = builder.circuit_store(Arc::new(store));
    }

    let registry = Arc::new(builder.build());
    for trigger in config.triggers {
        let name = trigger.event_name.clone();
        registry
            .register(trigger.with_fallback(log_fallback()))
            .await
            .with_context(|| format!("failed to register trigger '{name}'"))?;
    }
    Ok(registry)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "taskclaw=debug,taskclaw_scheduler=debug,taskclaw_core=debug"
    } else {
        "taskclaw=info,taskclaw_scheduler=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config_path = expand_path(&cli.config);
    let config = load_config(&config_path)?;

    match &cli.command {
        Command::Validate => {
            let mut failures = 0;
            for trigger in &config.triggers {
                match trigger.clone().validated() {
                    Ok(t) => println!("✅ {} ({}, weight {:.2})", t.event_name, t.cron_expression, t.migration_weight),
                    Err(e) => {
                        failures += 1;
                        println!("❌ {}: {e}", trigger.event_name);
                    }
                }
            }
            if failures > 0 {
                bail!("{failures} invalid trigger(s) in {}", config_path.display());
            }
            println!("{} trigger(s) OK", config.triggers.len());
        }
        Command::Next { event_name, count } => {
            let trigger = config
                .triggers
                .iter()
                .find(|t| &t.event_name == event_name)
                .with_context(|| format!("no trigger named '{event_name}'"))?;
            let schedule = CronSchedule::parse(&trigger.cron_expression)?;
            for at in schedule.upcoming(chrono::Utc::now(), *count) {
                println!("{}", at.to_rfc3339());
            }
        }
        Command::Fire { event_name, payload } => {
            let payload = match payload {
                Some(raw) => serde_json::from_str(raw).context("--payload is not valid JSON")?,
                None => serde_json::json!({}),
            };
            let registry = build_registry(&cli, config).await?;
            let result = registry.trigger_now_with_payload(event_name, payload).await;
            registry.shutdown(Duration::from_secs(5)).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Run { drain_timeout } => {
            let tick = Duration::from_secs(config.scheduler.tick_interval_secs.max(1));
            let registry = build_registry(&cli, config).await?;
            let loop_handle = spawn_scheduler(registry.clone(), tick);

            tokio::signal::ctrl_c().await?;
            tracing::info!("🛑 Ctrl-C received, stopping scheduler");
            loop_handle.abort();
            if !registry.shutdown(Duration::from_secs(*drain_timeout)).await {
                tracing::warn!("⚠️ Some firings were still running after {drain_timeout}s");
            }
        }
    }
    Ok(())
}
