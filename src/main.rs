use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use floodgate::config::Settings;
use floodgate::load::{render_table, run_prefix, run_scenario, LoadStats, Scenario};
use floodgate::ratelimit::{RateLimiter, RedisBackend};

/// Distributed token-bucket rate limiter backed by Redis.
#[derive(Debug, Parser)]
#[command(name = "floodgate", version, about)]
struct Cli {
    /// Settings file (YAML); environment variables prefixed FLOODGATE_ override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Redis URL, overriding settings
    #[arg(long, global = true)]
    redis_url: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Make one admission decision for a key
    Check {
        /// Caller key
        key: String,

        /// Tokens to consume
        #[arg(long, default_value_t = 1)]
        cost: u32,

        /// Give up on the store after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Drive the limiter with paced traffic scenarios
    Load {
        /// Scenario to run (normal, slow_then_burst, burst); repeatable, defaults to all
        #[arg(long = "scenario")]
        scenarios: Vec<String>,

        /// Print one JSON object per scenario instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Delete the stored bucket for a key
    Reset {
        /// Caller key
        key: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(url) = cli.redis_url {
        settings.redis.url = url;
    }
    info!(redis_url = %settings.redis.url, "Configuration loaded");

    let backend = connect(&settings).await?;

    match cli.command {
        Command::Check {
            key,
            cost,
            timeout_ms,
        } => {
            let limiter = RateLimiter::new(backend, settings.limiter.to_limiter_config()?)?;
            let decision = match timeout_ms {
                Some(ms) => {
                    limiter
                        .allow_n_within(&key, cost, Duration::from_millis(ms))
                        .await?
                }
                None => limiter.allow_n(&key, cost).await?,
            };

            println!(
                "allowed: {}, remaining: {}",
                decision.allowed, decision.remaining
            );
        }
        Command::Load { scenarios, json } => {
            tokio::select! {
                result = run_load(&settings, backend, &scenarios, json) => result?,
                _ = shutdown_signal() => {
                    warn!("Load run interrupted");
                }
            }
        }
        Command::Reset { key } => {
            let limiter = RateLimiter::new(backend, settings.limiter.to_limiter_config()?)?;
            limiter.reset(&key).await?;
            println!("reset: {}", limiter.store_key(&key)?);
        }
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn connect(settings: &Settings) -> anyhow::Result<RedisBackend> {
    let backend =
        RedisBackend::connect_with_timeout(&settings.redis.url, settings.redis.connect_timeout())
            .await
            .with_context(|| format!("connecting to {}", settings.redis.url))?;

    backend
        .wait_until_ready(settings.redis.ready_timeout())
        .await
        .with_context(|| format!("redis not reachable at {}", settings.redis.url))?;

    Ok(backend)
}

async fn run_load(
    settings: &Settings,
    backend: RedisBackend,
    names: &[String],
    json: bool,
) -> anyhow::Result<()> {
    let scenarios = if names.is_empty() {
        Scenario::builtin(&settings.load)
    } else {
        names
            .iter()
            .map(|name| {
                Scenario::named(name, &settings.load)
                    .ok_or_else(|| anyhow!("unknown scenario: {}", name))
            })
            .collect::<anyhow::Result<Vec<_>>>()?
    };

    let run_id = Uuid::new_v4();
    info!(
        run_id = %run_id,
        rate_per_second = settings.limiter.rate_per_second,
        capacity = settings.limiter.capacity,
        concurrency = settings.load.concurrency,
        "Starting load run"
    );

    let mut rows: Vec<LoadStats> = Vec::with_capacity(scenarios.len());
    for scenario in &scenarios {
        let prefix = run_prefix(&settings.limiter.prefix, &run_id, &scenario.name);
        let config = settings.limiter.to_limiter_config()?.with_prefix(prefix);
        let limiter = RateLimiter::new(backend.clone(), config)?;

        let stats = run_scenario(
            &limiter,
            &settings.load.key,
            scenario,
            settings.load.concurrency,
        )
        .await?;

        if json {
            println!("{}", serde_json::to_string(&stats)?);
        }
        rows.push(stats);
    }

    if !json {
        print!("{}", render_table(&rows));
    }

    if let Some(empty) = rows.iter().find(|r| r.total == 0) {
        bail!("no requests executed for scenario {}", empty.scenario);
    }

    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping");
        }
    }
}
