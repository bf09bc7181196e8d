use anyhow::Context;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::config::{StoreBackend, TurnstileConfig};
use turnstile::net::resolve_client_ip;
use turnstile::ratelimit::{
    CounterStore, Decision, MemoryCounterStore, MemoryPolicyStore, PolicyManager, RateLimitPolicy, RateLimiter,
    RequestIdentity,
};

/// How often the in-memory store drops expired counters.
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Evaluate requests read from stdin, one JSON object per line, and print one
/// JSON decision per line.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Args {
    /// Configuration file (YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Policy file (YAML), overriding `policy_path` from the configuration
    #[arg(short, long)]
    policy: Option<PathBuf>,

    /// Validate the configuration and policy, then exit
    #[arg(long)]
    check: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

/// One request to evaluate.
#[derive(Debug, Deserialize)]
struct RequestLine {
    /// Address of the directly connected peer
    client_ip: String,
    #[serde(default)]
    client_key: Option<String>,
    #[serde(default)]
    endpoint: String,
    /// Raw `X-Forwarded-For` header value
    #[serde(default)]
    forwarded_for: Option<String>,
    #[serde(default)]
    force_whitelist: bool,
}

#[derive(Debug, Serialize)]
struct DecisionLine<'a> {
    client_ip: &'a str,
    client_key: &'a str,
    endpoint: &'a str,
    #[serde(flatten)]
    decision: Decision,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => TurnstileConfig::from_file(path),
        None => TurnstileConfig::from_env(),
    }
    .context("failed to load configuration")?;

    init_tracing(&config.log.level, args.json_logs || config.log.json);

    info!("Starting Turnstile");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let policy_path = args.policy.clone().or_else(|| config.policy_path.as_ref().map(PathBuf::from));
    let policy = match &policy_path {
        Some(path) => Some(
            RateLimitPolicy::from_file(path)
                .with_context(|| format!("failed to load policy from {}", path.display()))?,
        ),
        None => None,
    };

    if args.check {
        match &policy {
            Some(policy) => info!(
                ip_throttling = policy.ip_throttling,
                client_throttling = policy.client_throttling,
                endpoint_throttling = policy.endpoint_throttling,
                ip_rules = policy.ip_rules.len(),
                client_rules = policy.client_rules.len(),
                endpoint_rules = policy.endpoint_rules.len(),
                route_rules = policy.route_rules.len(),
                "Policy is valid"
            ),
            None => info!("Configuration is valid; no policy configured"),
        }
        return Ok(());
    }

    let store = build_store(&config).await?;
    let limiter = RateLimiter::from_config(&config, store);
    info!(backend = ?config.store.backend, "Rate limiter initialized");

    let policies = PolicyManager::new(Arc::new(MemoryPolicyStore::new()), &config.keys);
    match policy {
        Some(policy) => policies.update_policy(policy),
        None => warn!("No policy configured, every request will be allowed"),
    }

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read request")?,
            _ = &mut shutdown => break,
        };

        let Some(line) = line else {
            debug!("Input closed");
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let request: RequestLine = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Skipping malformed request line");
                continue;
            }
        };

        let client_ip = resolve_client_ip(request.forwarded_for.as_deref(), &request.client_ip);
        let identity = RequestIdentity::new(client_ip, request.client_key.as_deref(), &request.endpoint)
            .with_force_whitelist(request.force_whitelist);

        let decision = limiter.evaluate_current(&identity, &policies).await;
        let output = DecisionLine {
            client_ip: &identity.client_ip,
            client_key: &identity.client_key,
            endpoint: &identity.endpoint,
            decision,
            message: decision.throttled().map(ToString::to_string),
        };

        let mut encoded = serde_json::to_vec(&output)?;
        encoded.push(b'\n');
        stdout.write_all(&encoded).await?;
        stdout.flush().await?;
    }

    info!(store_failures = limiter.store_failures(), "Turnstile stopped");
    Ok(())
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if json {
        builder.json().init();
    } else {
        builder.with_thread_ids(true).init();
    }
}

async fn build_store(config: &TurnstileConfig) -> anyhow::Result<Arc<dyn CounterStore>> {
    match config.store.backend {
        StoreBackend::Memory => {
            let store = Arc::new(MemoryCounterStore::new());
            spawn_purge_task(store.clone());
            Ok(store)
        }
        #[cfg(feature = "redis-store")]
        StoreBackend::Redis => {
            let store = turnstile::ratelimit::RedisCounterStore::connect(
                &config.store.redis_url,
                config.keys.throttle_prefix(),
            )
            .await
            .context("failed to connect to Redis")?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis-store"))]
        StoreBackend::Redis => {
            anyhow::bail!("the redis store backend requires building with the `redis-store` feature")
        }
    }
}

fn spawn_purge_task(store: Arc<MemoryCounterStore>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            let purged = store.purge_expired();
            if purged > 0 {
                debug!(purged = purged, remaining = store.len(), "Purged expired counters");
            }
        }
    });
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
