pub mod broker;
pub mod cache;
pub mod config;
pub mod echo;
pub mod handlers;
pub mod middleware;
pub mod observability;
pub mod pipeline;
pub mod reading;
pub mod server;

use std::sync::Arc;

use speedpipe_auth::{AuthState, JwtService};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use broker::{BrokerError, MemoryBroker, MessageBroker, MqttBroker};
pub use cache::{CacheError, LatestValueCache, StoreBackend};
pub use config::{AppConfig, BrokerBackend, ConfirmMode, MqttConfig, RedisConfig, ServerConfig};
pub use echo::{EchoListener, EchoRegistry, EchoSink};
pub use observability::{apply_logging_level, init_tracing};
pub use pipeline::{PipelineError, PublishPipeline, PublishTimeouts};
pub use reading::Reading;
pub use server::{AppState, ServerBuilder, SpeedpipeServer, build_app};

/// Create the store backend for the latest-value slot.
///
/// ## Modes
///
/// - **Redis disabled**: in-process store (DashMap)
/// - **Redis enabled**: connects to `redis.url` on DB `redis.db` and checks
///   the connection. An unreachable Redis is an error; there is no fallback
///   to the local store because readers on other instances would never see
///   the value.
pub async fn create_store_backend(config: &RedisConfig) -> Result<StoreBackend, CacheError> {
    if !config.enabled {
        tracing::info!("Redis disabled, using local store");
        return Ok(StoreBackend::new_local());
    }

    let url = redis_url_with_db(&config.url, config.db)?;
    tracing::info!(url = %redacted(&url), db = config.db, "Connecting to Redis");

    // Create Redis pool configuration
    let mut redis_config = deadpool_redis::Config::from_url(url.as_str());
    let pool_config = redis_config
        .pool
        .get_or_insert_with(|| deadpool_redis::PoolConfig::new(config.pool_size));
    pool_config.max_size = config.pool_size;
    pool_config.timeouts.wait = Some(config.timeout());
    pool_config.timeouts.create = Some(config.timeout());
    pool_config.timeouts.recycle = Some(config.timeout());

    let pool = redis_config
        .create_pool(Some(deadpool_redis::Runtime::Tokio1))
        .map_err(|e| CacheError::store(format!("failed to create Redis pool: {e}")))?;

    let backend = StoreBackend::new_redis(pool);
    backend.ping().await?;
    tracing::info!("✓ Connected to Redis successfully");
    Ok(backend)
}

/// Put the DB index into the URL path, replacing any index already there.
fn redis_url_with_db(raw: &str, db: i64) -> Result<url::Url, CacheError> {
    let mut url =
        url::Url::parse(raw).map_err(|e| CacheError::store(format!("invalid redis.url: {e}")))?;
    url.set_path(&format!("/{db}"));
    Ok(url)
}

fn redacted(url: &url::Url) -> String {
    let mut shown = url.clone();
    if shown.password().is_some() {
        let _ = shown.set_password(Some("***"));
    }
    shown.to_string()
}

/// Connect the configured broker backend.
pub async fn connect_broker(
    config: &MqttConfig,
    shutdown: CancellationToken,
) -> Result<Arc<dyn MessageBroker>, BrokerError> {
    match config.backend {
        BrokerBackend::Memory => {
            tracing::info!("Using in-process memory broker");
            Ok(Arc::new(MemoryBroker::new()))
        }
        BrokerBackend::Mqtt => {
            let broker = MqttBroker::connect(config, shutdown).await?;
            Ok(Arc::new(broker))
        }
    }
}

/// Wire the echo path and build the handler state.
///
/// Spawns the echo listener and subscribes it to `mqtt.topic`. A failed
/// subscription is returned as an error: the service must not serve
/// traffic without its echo path.
pub async fn build_state(
    cfg: &AppConfig,
    broker: Arc<dyn MessageBroker>,
    cache: LatestValueCache,
    shutdown: CancellationToken,
) -> Result<(AppState, JoinHandle<()>), BrokerError> {
    let registry = Arc::new(EchoRegistry::new());
    let (sink, rx) = EchoSink::channel(cfg.mqtt.channel_capacity);
    let listener =
        EchoListener::new(cache.clone(), Arc::clone(&registry)).spawn(rx, shutdown.clone());

    if let Err(e) = broker.subscribe(&cfg.mqtt.topic, sink.clone()).await {
        shutdown.cancel();
        listener.abort();
        return Err(e);
    }
    tracing::info!(
        topic = %cfg.mqtt.topic,
        broker = broker.name(),
        confirm = %cfg.pipeline.confirm,
        "Echo listener subscribed"
    );

    let pipeline = PublishPipeline::new(
        broker,
        registry,
        cfg.mqtt.topic.clone(),
        cfg.pipeline.confirm,
        cfg.publish_timeouts(),
    );
    let auth = AuthState::new(Arc::new(JwtService::from_config(&cfg.auth)));

    Ok((
        AppState {
            pipeline: Arc::new(pipeline),
            echo_sink: sink,
            cache,
            auth,
        },
        listener,
    ))
}
