use serde::{Deserialize, Serialize};
use speedpipe_auth::config::AuthConfig;

use crate::pipeline::PublishTimeouts;
use std::{net::SocketAddr, time::Duration};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Latest-value store
    #[serde(default)]
    pub redis: RedisConfig,
    /// Broker connection and topic
    #[serde(default)]
    pub mqtt: MqttConfig,
    /// Publish confirmation behaviour
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Token signing
    #[serde(default)]
    pub auth: AuthConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        // Server validations
        if self.server.port == 0 {
            return Err("server.port must be > 0".into());
        }
        if self.server.request_timeout_ms == 0 || self.server.shutdown_timeout_ms == 0 {
            return Err("server timeouts must be > 0".into());
        }
        // Logging validation
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        // Redis validations
        if self.redis.enabled {
            if self.redis.url.is_empty() {
                return Err("redis.url must not be empty when redis.enabled=true".into());
            }
            if self.redis.pool_size == 0 {
                return Err("redis.pool_size must be > 0".into());
            }
            if self.redis.timeout_ms == 0 {
                return Err("redis.timeout_ms must be > 0".into());
            }
        }
        if self.redis.key.is_empty() {
            return Err("redis.key must not be empty".into());
        }
        if self.redis.ttl_secs == Some(0) {
            return Err("redis.ttl_secs must be > 0 when set".into());
        }
        // MQTT validations
        if self.mqtt.topic.is_empty() {
            return Err("mqtt.topic must not be empty".into());
        }
        if self.mqtt.topic.contains(['+', '#']) {
            return Err("mqtt.topic must be a concrete topic without wildcards".into());
        }
        if self.mqtt.qos > 2 {
            return Err("mqtt.qos must be 0, 1 or 2".into());
        }
        if self.mqtt.client_id.is_empty() {
            return Err("mqtt.client_id must not be empty".into());
        }
        if self.mqtt.connect_timeout_ms == 0 || self.mqtt.ack_timeout_ms == 0 {
            return Err("mqtt timeouts must be > 0".into());
        }
        if self.mqtt.channel_capacity == 0 {
            return Err("mqtt.channel_capacity must be > 0".into());
        }
        // Pipeline validations
        if self.pipeline.echo_timeout_ms == 0 {
            return Err("pipeline.echo_timeout_ms must be > 0".into());
        }
        // A publish waits for the ack and then for the echo; both must fit
        // inside the request timeout so the error reaches the client.
        let publish_budget = self
            .mqtt
            .ack_timeout_ms
            .saturating_add(self.pipeline.echo_timeout_ms);
        if publish_budget >= self.server.request_timeout_ms {
            return Err(format!(
                "mqtt.ack_timeout_ms + pipeline.echo_timeout_ms ({publish_budget}) must be below server.request_timeout_ms ({})",
                self.server.request_timeout_ms
            ));
        }
        // Auth validation
        self.auth
            .validate()
            .map_err(|e| format!("auth config error: {e}"))?;
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        use std::net::{IpAddr, Ipv4Addr};
        let host: IpAddr = self
            .server
            .host
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));
        SocketAddr::from((host, self.server.port))
    }

    pub fn publish_timeouts(&self) -> PublishTimeouts {
        PublishTimeouts {
            ack: self.mqtt.ack_timeout(),
            echo: self.pipeline.echo_timeout(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.server.request_timeout_ms)
    }
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.server.shutdown_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Upper bound for a whole request, echo wait included
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Upper bound for draining in-flight requests on shutdown
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    4000
}
fn default_request_timeout_ms() -> u64 {
    10_000
}
fn default_shutdown_timeout_ms() -> u64 {
    10_000
}
fn default_body_limit() -> usize {
    64 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_ms: default_request_timeout_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            body_limit_bytes: default_body_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}
fn default_log_level() -> String {
    "info".into()
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Redis configuration for the latest-value slot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Use Redis; when false an in-process store is used instead
    #[serde(default = "default_redis_enabled")]
    pub enabled: bool,

    /// Redis connection URL (e.g., "redis://localhost:6379")
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Database index selected on every connection
    #[serde(default)]
    pub db: i64,

    /// Connection pool size
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,

    /// Connection and wait timeout in milliseconds
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,

    /// Expiry applied on every write; `None` keeps the value forever
    #[serde(default)]
    pub ttl_secs: Option<u64>,

    /// Key holding the latest reading
    #[serde(default = "default_redis_key")]
    pub key: String,
}

fn default_redis_enabled() -> bool {
    true
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_redis_pool_size() -> usize {
    10
}

fn default_redis_timeout_ms() -> u64 {
    5000
}

fn default_redis_key() -> String {
    "latest_speed_data".to_string()
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: default_redis_enabled(),
            url: default_redis_url(),
            db: 0,
            pool_size: default_redis_pool_size(),
            timeout_ms: default_redis_timeout_ms(),
            ttl_secs: None,
            key: default_redis_key(),
        }
    }
}

impl RedisConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs.map(Duration::from_secs)
    }
}

/// Which broker implementation backs the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BrokerBackend {
    #[default]
    Mqtt,
    /// In-process loopback, for local runs without a broker
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    #[serde(default)]
    pub backend: BrokerBackend,
    /// Broker address, `tcp://host:port` or `mqtt://host:port`
    #[serde(default = "default_mqtt_broker")]
    pub broker: String,
    #[serde(default = "default_mqtt_topic")]
    pub topic: String,
    #[serde(default = "default_mqtt_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub qos: u8,
    #[serde(default = "default_mqtt_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Bound for the initial CONNACK and for every SUBACK
    #[serde(default = "default_mqtt_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Bound for the PUBACK/PUBCOMP of a single publish
    #[serde(default = "default_mqtt_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    /// Capacity of the client request queue and of the echo channel
    #[serde(default = "default_mqtt_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_mqtt_broker() -> String {
    "tcp://broker.emqx.io:1883".into()
}
fn default_mqtt_topic() -> String {
    "speed_topic".into()
}
/// `speedpipe-` plus a random suffix, so two instances sharing a broker do
/// not take over each other's session.
fn default_mqtt_client_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("speedpipe-{}", &suffix[..12])
}
fn default_mqtt_keep_alive_secs() -> u64 {
    30
}
fn default_mqtt_connect_timeout_ms() -> u64 {
    5000
}
fn default_mqtt_ack_timeout_ms() -> u64 {
    3000
}
fn default_mqtt_channel_capacity() -> usize {
    64
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            backend: BrokerBackend::default(),
            broker: default_mqtt_broker(),
            topic: default_mqtt_topic(),
            client_id: default_mqtt_client_id(),
            qos: 0,
            keep_alive_secs: default_mqtt_keep_alive_secs(),
            connect_timeout_ms: default_mqtt_connect_timeout_ms(),
            ack_timeout_ms: default_mqtt_ack_timeout_ms(),
            channel_capacity: default_mqtt_channel_capacity(),
        }
    }
}

impl MqttConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

/// How a publish request is confirmed before it is answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmMode {
    /// Wait for the echo carrying this request's correlation id
    #[default]
    Correlated,
    /// Wait for the next unclaimed echo, whoever published it
    Any,
    /// Answer right after the broker acknowledgement
    None,
}

impl std::fmt::Display for ConfirmMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Correlated => write!(f, "correlated"),
            Self::Any => write!(f, "any"),
            Self::None => write!(f, "none"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub confirm: ConfirmMode,
    #[serde(default = "default_echo_timeout_ms")]
    pub echo_timeout_ms: u64,
}

fn default_echo_timeout_ms() -> u64 {
    5000
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            confirm: ConfirmMode::default(),
            echo_timeout_ms: default_echo_timeout_ms(),
        }
    }
}

impl PipelineConfig {
    pub fn echo_timeout(&self) -> Duration {
        Duration::from_millis(self.echo_timeout_ms)
    }
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File, FileFormat};
    use std::path::PathBuf;

    /// Default configuration file, relative to the working directory.
    pub const DEFAULT_CONFIG_PATH: &str = "config/defaults.toml";

    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let mut builder = Config::builder();
        let pathbuf = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_PATH));
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf).format(FileFormat::Toml));
        }
        // Environment variable overrides, e.g., SPEEDPIPE__SERVER__PORT=9090
        builder = builder.add_source(
            Environment::with_prefix("SPEEDPIPE")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        // Validate
        merged.validate()?;
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid_and_match_service_conventions() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.addr().port(), 4000);
        assert_eq!(cfg.mqtt.broker, "tcp://broker.emqx.io:1883");
        assert_eq!(cfg.redis.key, "latest_speed_data");
        assert_eq!(cfg.redis.ttl(), None);
        assert_eq!(cfg.pipeline.confirm, ConfirmMode::Correlated);
        assert_eq!(cfg.request_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn echo_timeout_must_fit_inside_request_timeout() {
        let mut cfg = AppConfig::default();
        cfg.pipeline.echo_timeout_ms = cfg.server.request_timeout_ms;
        let err = cfg.validate().unwrap_err();
        assert!(err.contains("echo_timeout_ms"));
    }

    #[test]
    fn ack_and_echo_timeouts_together_must_fit_inside_request_timeout() {
        let mut cfg = AppConfig::default();
        cfg.server.request_timeout_ms = 400;
        cfg.mqtt.ack_timeout_ms = 300;
        cfg.pipeline.echo_timeout_ms = 300;
        let err = cfg.validate().unwrap_err();
        assert!(err.contains("mqtt.ack_timeout_ms + pipeline.echo_timeout_ms (600)"));

        cfg.mqtt.ack_timeout_ms = 150;
        cfg.pipeline.echo_timeout_ms = 200;
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.publish_timeouts().total(), Duration::from_millis(350));

        cfg.mqtt.ack_timeout_ms = u64::MAX;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn default_publish_budget_leaves_headroom() {
        let cfg = AppConfig::default();
        assert!(cfg.publish_timeouts().total() < cfg.request_timeout());
    }

    #[test]
    fn rejects_out_of_range_values() {
        let mut cfg = AppConfig::default();
        cfg.mqtt.qos = 3;
        assert!(cfg.validate().unwrap_err().contains("qos"));

        let mut cfg = AppConfig::default();
        cfg.mqtt.topic = "speed/#".into();
        assert!(cfg.validate().unwrap_err().contains("wildcards"));

        let mut cfg = AppConfig::default();
        cfg.mqtt.channel_capacity = 0;
        assert!(cfg.validate().unwrap_err().contains("channel_capacity"));

        let mut cfg = AppConfig::default();
        cfg.logging.level = "loud".into();
        assert!(cfg.validate().unwrap_err().contains("logging.level"));
    }

    #[test]
    fn default_client_ids_differ_between_instances() {
        let first = MqttConfig::default().client_id;
        let second = MqttConfig::default().client_id;
        assert!(first.starts_with("speedpipe-"));
        assert_eq!(first.len(), "speedpipe-".len() + 12);
        assert_ne!(first, second);
    }

    #[test]
    fn confirm_mode_parses_lowercase() {
        let cfg: PipelineConfig = toml::from_str("confirm = \"any\"").unwrap();
        assert_eq!(cfg.confirm, ConfirmMode::Any);
        assert_eq!(cfg.echo_timeout_ms, 5000);
    }
}
