use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tollgate::config::TollgateConfig;
use tollgate::{CircuitBreaker, KeyValueStore, RateLimiter, RedisStore, Scope};

/// Inspect and drive Tollgate rate limits in a shared Redis store.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the Redis URL from configuration
    #[arg(long)]
    redis_url: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Record a request if the scope is within budget
    Log(ScopeArgs),
    /// Check whether the scope is within budget without recording
    Check(ScopeArgs),
    /// Count recorded requests in the current window
    Count(ScopeArgs),
    /// Delete every recorded request for the scope
    Flush(ScopeArgs),
    /// Drive a configured circuit breaker
    Breaker {
        /// Protected resource
        #[arg(long)]
        resource: String,
        /// Only probe the breaker, recording nothing
        #[arg(long)]
        probe: bool,
    },
}

#[derive(Debug, Args)]
struct ScopeArgs {
    /// Resource identifier
    #[arg(long)]
    resource: String,
    /// Client identifier; omit for a global scope
    #[arg(long)]
    client: Option<String>,
    /// Override the configured request budget
    #[arg(long)]
    limit: Option<u64>,
    /// Override the configured window in milliseconds
    #[arg(long)]
    window_ms: Option<u64>,
}

impl ScopeArgs {
    fn scope(&self) -> Scope {
        Scope::new(self.resource.clone(), self.client.clone())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let mut config = TollgateConfig::load(cli.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(url) = cli.redis_url.clone() {
        config.store.redis_url = url;
    }
    info!(redis_url = %config.store.redis_url, "Configuration loaded");

    let store: Arc<dyn KeyValueStore> = Arc::new(
        RedisStore::connect(&config.store)
            .await
            .context("Failed to connect to Redis")?,
    );

    let output = match cli.command {
        Command::Breaker { resource, probe } => {
            let settings = config
                .breaker(&resource)
                .with_context(|| format!("No circuit breaker configured for {}", resource))?;
            let breaker = CircuitBreaker::from_settings(store, settings)?;
            let allowed = if probe {
                breaker.short_circuit().await?
            } else {
                breaker.log().await?
            };
            json!({ "resource": resource, "allowed": allowed })
        }
        Command::Log(args) => {
            let (limiter, scope) = limiter_for(store, &config, &args)?;
            let allowed = limiter.log(&scope).await?;
            json!({ "scope": scope.to_string(), "allowed": allowed })
        }
        Command::Check(args) => {
            let (limiter, scope) = limiter_for(store, &config, &args)?;
            let allowed = limiter.is_allowed(&scope).await?;
            json!({ "scope": scope.to_string(), "allowed": allowed })
        }
        Command::Count(args) => {
            let (limiter, scope) = limiter_for(store, &config, &args)?;
            let count = limiter.count_logs(&scope).await?;
            json!({ "scope": scope.to_string(), "count": count })
        }
        Command::Flush(args) => {
            let (limiter, scope) = limiter_for(store, &config, &args)?;
            limiter.flush_logs(&scope).await?;
            json!({ "scope": scope.to_string(), "flushed": true })
        }
    };

    println!("{}", output);
    Ok(())
}

fn limiter_for(
    store: Arc<dyn KeyValueStore>,
    config: &TollgateConfig,
    args: &ScopeArgs,
) -> anyhow::Result<(RateLimiter, Scope)> {
    let mut settings = config.limiter.to_settings();
    if let Some(limit) = args.limit {
        settings.number_of_requests = limit;
    }
    if let Some(window_ms) = args.window_ms {
        settings.time_bound = Duration::from_millis(window_ms);
    }

    let limiter = RateLimiter::new(store, settings)?;
    Ok((limiter, args.scope()))
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
