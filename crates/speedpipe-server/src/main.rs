use std::env;
use std::time::Duration;

use anyhow::Context;
use speedpipe_server::config::loader::{DEFAULT_CONFIG_PATH, load_config};
use speedpipe_server::{LatestValueCache, ServerBuilder};
use tokio_util::sync::CancellationToken;

/// How the configuration path was determined.
#[derive(Debug, Clone, Copy)]
enum ConfigSource {
    /// From --config CLI argument
    CliArgument,
    /// From SPEEDPIPE_CONFIG environment variable
    EnvironmentVariable,
    /// Default path (config/defaults.toml)
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CliArgument => write!(f, "CLI argument (--config)"),
            Self::EnvironmentVariable => write!(f, "environment variable (SPEEDPIPE_CONFIG)"),
            Self::Default => write!(f, "default"),
        }
    }
}

#[tokio::main]
async fn main() {
    // Load .env file if present (before anything else)
    if let Err(e) = dotenvy::dotenv() {
        // Not an error if .env doesn't exist - it's optional
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound) {
            eprintln!("Warning: Failed to load .env file: {e}");
        }
    }

    // Initialize tracing early with the default level
    speedpipe_server::observability::init_tracing();

    let (config_path, source) = resolve_config_path();

    let cfg = match load_config(Some(&config_path)) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(2);
        }
    };

    speedpipe_server::observability::apply_logging_level(&cfg.logging.level);
    tracing::info!(
        path = %config_path,
        source = %source,
        version = env!("CARGO_PKG_VERSION"),
        commit = env!("GIT_COMMIT"),
        "Configuration loaded"
    );

    if let Err(err) = run(cfg).await {
        tracing::error!(error = %format!("{err:#}"), "speedpipe stopped with an error");
        eprintln!("Server error: {err:#}");
        std::process::exit(1);
    }
}

async fn run(cfg: speedpipe_server::AppConfig) -> anyhow::Result<()> {
    if cfg.auth.uses_dev_secret() {
        tracing::warn!("auth.secret is the development default; set SPEEDPIPE__AUTH__SECRET");
    }

    let shutdown = CancellationToken::new();

    let store = speedpipe_server::create_store_backend(&cfg.redis)
        .await
        .context("Redis initialization failed")?;
    let cache = LatestValueCache::new(store, cfg.redis.key.clone(), cfg.redis.ttl());

    let broker = speedpipe_server::connect_broker(&cfg.mqtt, shutdown.clone())
        .await
        .context("MQTT connection failed")?;

    let (state, listener) =
        speedpipe_server::build_state(&cfg, broker.clone(), cache, shutdown.clone())
            .await
            .context("echo subscription failed")?;

    let served = ServerBuilder::new(state)
        .with_config(cfg)
        .build()
        .run(shutdown.clone())
        .await;

    if let Err(e) = broker.disconnect().await {
        tracing::warn!(error = %e, "broker disconnect failed");
    }
    shutdown.cancel();
    if tokio::time::timeout(Duration::from_secs(5), listener)
        .await
        .is_err()
    {
        tracing::warn!("echo listener did not stop in time");
    }
    tracing::info!("speedpipe stopped");
    served
}

/// Resolve the configuration file path.
///
/// Priority order:
/// 1. CLI argument: --config <path>
/// 2. Environment variable: SPEEDPIPE_CONFIG
/// 3. Default: config/defaults.toml
fn resolve_config_path() -> (String, ConfigSource) {
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config"
            && let Some(path) = args.next()
        {
            return (path, ConfigSource::CliArgument);
        }
    }

    if let Ok(path) = env::var("SPEEDPIPE_CONFIG")
        && !path.is_empty()
    {
        return (path, ConfigSource::EnvironmentVariable);
    }

    (DEFAULT_CONFIG_PATH.to_string(), ConfigSource::Default)
}
