//! Relay configuration
//!
//! Loaded from a JSON file; every field has a default so a minimal file only
//! names an inbound source and the delivery endpoint:
//!
//! ```json
//! {
//!   "mqtt": { "broker": "tcp://127.0.0.1:1883", "client_id": "relay" },
//!   "topics": ["tele/+/SENSOR", "stat/+/POWER"],
//!   "bus": { "url": "nats://127.0.0.1:4222", "subjects": ["tele.>"] },
//!   "api": { "url": "https://ingest.example.com/events", "key": "..." }
//! }
//! ```
//!
//! Either source may be left out. Duration fields are in seconds; the short
//! key names of the MQTT buffer service (`flush_interval`, `timeout`,
//! `stats_interval`, ...) are accepted as aliases.

use crate::backoff::BackoffPolicy;
use crate::breaker::BreakerConfig;
use crate::buffer::BufferConfig;
use crate::error::{RelayError, Result};
use crate::sender::HttpSenderConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "A3S_RELAY_CONFIG";

/// Environment variable overriding the persistence directory
pub const PST_PATH_ENV: &str = "A3S_RELAY_PST_PATH";

/// File name used under the persistence directory override
pub const BUFFER_FILE_NAME: &str = "relay-buffer.json";

/// Port used when `mqtt.broker` names none
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Upper bound on every duration setting (one year)
pub const MAX_DURATION_SECS: u64 = 365 * 24 * 60 * 60;

/// Top-level relay configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub mqtt: MqttConfig,
    /// MQTT topic filters to subscribe to
    pub topics: Vec<String>,
    pub bus: BusConfig,
    pub api: ApiConfig,
    pub buffer: BufferSettings,
    pub circuit_breaker: BreakerSettings,
    pub logging: LoggingConfig,
}

/// Inbound MQTT broker; disabled while `broker` is empty
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// `tcp://host:port`, `mqtt://host:port` or `host[:port]`
    pub broker: String,
    pub client_id: String,
    /// Credentials are sent only when `username` is non-empty
    pub username: String,
    pub password: String,
    /// First delay before reconnecting after a connection error
    #[serde(alias = "reconnect_interval")]
    pub reconnect_interval_secs: u64,
    /// Ceiling for the doubling reconnect delay
    #[serde(alias = "max_reconnect_interval")]
    pub max_reconnect_interval_secs: u64,
    pub keep_alive_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: String::new(),
            client_id: "a3s-relay".to_string(),
            username: String::new(),
            password: String::new(),
            reconnect_interval_secs: 5,
            max_reconnect_interval_secs: 60,
            keep_alive_secs: 30,
        }
    }
}

impl MqttConfig {
    /// Whether an MQTT source is configured
    pub fn enabled(&self) -> bool {
        !self.broker.trim().is_empty()
    }

    /// Host and port of `broker`
    pub fn endpoint(&self) -> Result<(String, u16)> {
        let invalid = |why: &str| {
            RelayError::Config(format!("invalid mqtt.broker '{}': {}", self.broker, why))
        };

        let rest = match self.broker.trim().split_once("://") {
            Some(("tcp" | "mqtt", rest)) => rest,
            Some((scheme, _)) => {
                return Err(invalid(&format!(
                    "unsupported scheme '{}', use tcp:// or mqtt://",
                    scheme
                )))
            }
            None => self.broker.trim(),
        };
        let rest = rest.trim_end_matches('/');

        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => (
                host,
                port.parse::<u16>().map_err(|_| invalid("bad port"))?,
            ),
            None => (rest, DEFAULT_MQTT_PORT),
        };
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        Ok((host.to_string(), port))
    }

    /// Reject client ids the MQTT client cannot use
    pub fn check_client_id(&self) -> Result<()> {
        if self.client_id.is_empty() || self.client_id.starts_with(' ') {
            return Err(RelayError::Config(
                "mqtt.client_id must be non-empty and must not start with a space".to_string(),
            ));
        }
        Ok(())
    }

    /// First reconnect delay
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }

    /// Reconnect delay ceiling
    pub fn max_reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.max_reconnect_interval_secs)
    }

    /// Keep-alive period sent in CONNECT
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

/// Inbound message bus (NATS); disabled while `subjects` is empty
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Server URL
    pub url: String,

    /// Optional auth token
    pub token: Option<String>,

    /// Connection name reported to the server
    pub client_name: String,

    /// Subject patterns to subscribe to (wildcards allowed)
    pub subjects: Vec<String>,

    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: "nats://127.0.0.1:4222".to_string(),
            token: None,
            client_name: "a3s-relay".to_string(),
            subjects: Vec::new(),
            connect_timeout_secs: 5,
        }
    }
}

impl BusConfig {
    /// Whether a NATS source is configured
    pub fn enabled(&self) -> bool {
        !self.subjects.is_empty()
    }
}

/// Delivery endpoint
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub url: String,
    pub key: String,
    /// Per-request timeout in seconds
    #[serde(alias = "timeout")]
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            key: String::new(),
            timeout_secs: 30,
        }
    }
}

/// Buffer, delivery and retention settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BufferSettings {
    pub max_size: usize,
    /// Buffer file, rewritten after every mutation
    pub persist_file: PathBuf,
    #[serde(alias = "flush_interval")]
    pub flush_interval_secs: u64,
    pub max_retries: u32,
    #[serde(alias = "cleanup_interval")]
    pub cleanup_interval_secs: u64,
    pub message_retention_days: u64,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    pub backoff_grace_secs: u64,
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            max_size: 10_000,
            persist_file: PathBuf::from(BUFFER_FILE_NAME),
            flush_interval_secs: 10,
            max_retries: 5,
            cleanup_interval_secs: 3600,
            message_retention_days: 7,
            backoff_base_secs: 1,
            backoff_max_secs: 300,
            backoff_grace_secs: 24 * 60 * 60,
        }
    }
}

/// Circuit breaker settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub max_failures: u32,
    /// Seconds the circuit stays open
    #[serde(alias = "timeout")]
    pub timeout_secs: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            max_failures: 5,
            timeout_secs: 30,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    #[serde(alias = "stats_interval")]
    pub stats_interval_secs: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            stats_interval_secs: 60,
        }
    }
}

impl RelayConfig {
    /// Read and validate a config file, applying environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| {
            RelayError::Config(format!("failed to read config file {}: {}", path.display(), e))
        })?;

        let mut config: RelayConfig = serde_json::from_str(&data).map_err(|e| {
            RelayError::Config(format!("failed to parse config file {}: {}", path.display(), e))
        })?;

        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Config file path from `A3S_RELAY_CONFIG`, defaulting to `config.json`
    pub fn path_from_env() -> PathBuf {
        std::env::var(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.json"))
    }

    /// Apply overrides from an environment lookup
    ///
    /// `A3S_RELAY_PST_PATH` relocates the buffer file to
    /// `<dir>/relay-buffer.json`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(PST_PATH_ENV).filter(|d| !d.is_empty()) {
            self.buffer.persist_file = Path::new(&dir).join(BUFFER_FILE_NAME);
            tracing::info!(
                path = %self.buffer.persist_file.display(),
                "Using persistent storage override"
            );
        }
    }

    /// Reject settings the relay cannot run with
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(RelayError::Config(msg.to_string()));

        if !self.mqtt.enabled() && !self.bus.enabled() {
            return fail("no inbound source: set mqtt.broker and topics, or bus.subjects");
        }
        if self.mqtt.enabled() {
            self.mqtt.endpoint()?;
            if self.topics.is_empty() {
                return fail("topics must name at least one topic when mqtt.broker is set");
            }
            self.mqtt.check_client_id()?;
            if self.mqtt.max_reconnect_interval_secs < self.mqtt.reconnect_interval_secs {
                return fail("mqtt.max_reconnect_interval must not be below mqtt.reconnect_interval");
            }
            // Keep-alive travels as a u16 in CONNECT
            if self.mqtt.keep_alive_secs > u64::from(u16::MAX) {
                return fail("mqtt.keep_alive_secs must fit in 16 bits");
            }
        } else if !self.topics.is_empty() {
            return fail("topics are set but mqtt.broker is empty");
        }
        if self.topics.iter().any(|t| t.trim().is_empty()) {
            return fail("topics must not contain empty topics");
        }
        if self.bus.subjects.iter().any(|s| s.trim().is_empty()) {
            return fail("bus.subjects must not contain empty subjects");
        }
        if self.api.url.is_empty() {
            return fail("api.url must be set");
        }
        if self.buffer.max_size == 0 {
            return fail("buffer.max_size must be greater than 0");
        }
        if self.buffer.max_retries == 0 {
            return fail("buffer.max_retries must be greater than 0");
        }
        if self.circuit_breaker.max_failures == 0 {
            return fail("circuit_breaker.max_failures must be greater than 0");
        }

        let positive = [
            ("api.timeout_secs", self.api.timeout_secs),
            ("bus.connect_timeout_secs", self.bus.connect_timeout_secs),
            ("buffer.flush_interval_secs", self.buffer.flush_interval_secs),
            ("buffer.cleanup_interval_secs", self.buffer.cleanup_interval_secs),
            ("buffer.backoff_base_secs", self.buffer.backoff_base_secs),
            ("buffer.backoff_max_secs", self.buffer.backoff_max_secs),
            ("logging.stats_interval_secs", self.logging.stats_interval_secs),
            ("mqtt.reconnect_interval_secs", self.mqtt.reconnect_interval_secs),
            ("mqtt.max_reconnect_interval_secs", self.mqtt.max_reconnect_interval_secs),
            ("mqtt.keep_alive_secs", self.mqtt.keep_alive_secs),
        ];
        let bounded = [
            ("buffer.backoff_grace_secs", self.buffer.backoff_grace_secs),
            ("circuit_breaker.timeout_secs", self.circuit_breaker.timeout_secs),
            (
                "buffer.message_retention_days",
                self.buffer.message_retention_days.saturating_mul(24 * 60 * 60),
            ),
        ];

        for (name, secs) in positive {
            if secs == 0 {
                return fail(&format!("{} must be greater than 0", name));
            }
        }
        for (name, secs) in positive.into_iter().chain(bounded) {
            if secs > MAX_DURATION_SECS {
                return fail(&format!(
                    "{} must not exceed {} seconds",
                    name, MAX_DURATION_SECS
                ));
            }
        }
        Ok(())
    }

    /// Buffer sizing, retry and breaker policy
    pub fn buffer_config(&self) -> BufferConfig {
        BufferConfig {
            capacity: self.buffer.max_size,
            max_retries: self.buffer.max_retries,
            backoff: BackoffPolicy {
                base: Duration::from_secs(self.buffer.backoff_base_secs),
                max_delay: Duration::from_secs(self.buffer.backoff_max_secs),
                grace: Duration::from_secs(self.buffer.backoff_grace_secs),
            },
            breaker: BreakerConfig {
                failure_threshold: self.circuit_breaker.max_failures,
                open_duration: Duration::from_secs(self.circuit_breaker.timeout_secs),
            },
        }
    }

    /// Delivery endpoint settings
    pub fn sender_config(&self) -> HttpSenderConfig {
        HttpSenderConfig {
            url: self.api.url.clone(),
            api_key: self.api.key.clone(),
            timeout: Duration::from_secs(self.api.timeout_secs),
        }
    }

    /// How long a message may stay buffered
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.buffer.message_retention_days.saturating_mul(24 * 60 * 60))
    }

    /// Delivery cycle period
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.buffer.flush_interval_secs)
    }

    /// Retention sweep period
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.buffer.cleanup_interval_secs)
    }

    /// Statistics log period
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.logging.stats_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json() -> &'static str {
        r#"{
            "bus": { "subjects": ["tele.>", "stat.*.POWER"] },
            "api": { "url": "https://ingest.example.com/events", "key": "k" }
        }"#
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: RelayConfig = serde_json::from_str(minimal_json()).unwrap();
        config.validate().unwrap();

        assert_eq!(config.bus.url, "nats://127.0.0.1:4222");
        assert_eq!(config.bus.subjects.len(), 2);
        assert_eq!(config.buffer.max_size, 10_000);
        assert_eq!(config.buffer.max_retries, 5);
        assert_eq!(config.circuit_breaker.max_failures, 5);
        assert_eq!(config.retention(), Duration::from_secs(7 * 86_400));
        assert_eq!(config.flush_interval(), Duration::from_secs(10));

        let buffer = config.buffer_config();
        assert_eq!(buffer.backoff.max_delay, Duration::from_secs(300));
        assert_eq!(buffer.breaker.open_duration, Duration::from_secs(30));
    }

    #[test]
    fn test_full_config() {
        let json = r#"{
            "bus": { "url": "nats://bus:4222", "token": "t", "subjects": ["a"] },
            "api": { "url": "http://api", "key": "secret", "timeout_secs": 5 },
            "buffer": {
                "max_size": 50,
                "persist_file": "/data/buffer.json",
                "flush_interval_secs": 2,
                "max_retries": 3,
                "cleanup_interval_secs": 60,
                "message_retention_days": 1
            },
            "circuit_breaker": { "max_failures": 2, "timeout_secs": 9 },
            "logging": { "level": "debug", "stats_interval_secs": 15 }
        }"#;
        let config: RelayConfig = serde_json::from_str(json).unwrap();
        config.validate().unwrap();

        assert_eq!(config.bus.token.as_deref(), Some("t"));
        assert_eq!(config.buffer.persist_file, PathBuf::from("/data/buffer.json"));
        assert_eq!(config.buffer_config().capacity, 50);
        assert_eq!(config.buffer_config().breaker.failure_threshold, 2);
        let sender = config.sender_config();
        assert_eq!(sender.api_key, "secret");
        assert_eq!(sender.timeout, Duration::from_secs(5));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let base: RelayConfig = serde_json::from_str(minimal_json()).unwrap();

        let mut no_subjects = base.clone();
        no_subjects.bus.subjects.clear();
        assert!(no_subjects.validate().is_err());

        let mut no_url = base.clone();
        no_url.api.url.clear();
        assert!(no_url.validate().is_err());

        let mut zero_capacity = base.clone();
        zero_capacity.buffer.max_size = 0;
        assert!(zero_capacity.validate().is_err());

        let mut zero_interval = base.clone();
        zero_interval.buffer.flush_interval_secs = 0;
        assert!(zero_interval.validate().is_err());

        let mut zero_threshold = base;
        zero_threshold.circuit_breaker.max_failures = 0;
        assert!(matches!(
            zero_threshold.validate(),
            Err(RelayError::Config(_))
        ));
    }

    #[test]
    fn test_pst_path_override() {
        let mut config: RelayConfig = serde_json::from_str(minimal_json()).unwrap();
        config.apply_env_overrides(|key| (key == PST_PATH_ENV).then(|| "/var/lib/pst".to_string()));
        assert_eq!(
            config.buffer.persist_file,
            PathBuf::from("/var/lib/pst/relay-buffer.json")
        );

        let mut untouched: RelayConfig = serde_json::from_str(minimal_json()).unwrap();
        untouched.apply_env_overrides(|_| None);
        assert_eq!(untouched.buffer.persist_file, PathBuf::from(BUFFER_FILE_NAME));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, minimal_json()).unwrap();

        let config = RelayConfig::load(&path).unwrap();
        assert_eq!(config.api.key, "k");

        std::fs::write(&path, "{ nope").unwrap();
        assert!(matches!(RelayConfig::load(&path), Err(RelayError::Config(_))));
        assert!(RelayConfig::load(dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_validate_rejects_unrepresentable_durations() {
        let base: RelayConfig = serde_json::from_str(minimal_json()).unwrap();

        let mut grace = base.clone();
        grace.buffer.backoff_grace_secs = u64::MAX;
        assert!(matches!(grace.validate(), Err(RelayError::Config(_))));

        let mut backoff = base.clone();
        backoff.buffer.backoff_base_secs = u64::MAX;
        backoff.buffer.backoff_max_secs = u64::MAX;
        assert!(backoff.validate().is_err());

        let mut flush = base.clone();
        flush.buffer.flush_interval_secs = MAX_DURATION_SECS + 1;
        assert!(flush.validate().is_err());

        let mut at_limit = base;
        at_limit.buffer.backoff_grace_secs = MAX_DURATION_SECS;
        at_limit.validate().unwrap();
    }

    #[test]
    fn test_huge_grace_from_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "bus": { "subjects": ["a"] },
                "api": { "url": "http://api" },
                "buffer": { "backoff_grace_secs": 18446744073709551615 }
            }"#,
        )
        .unwrap();
        assert!(matches!(RelayConfig::load(&path), Err(RelayError::Config(_))));
    }

    #[test]
    fn test_mqtt_buffer_service_config_shape() {
        let json = r#"{
            "mqtt": {
                "broker": "tcp://192.168.1.10:1883",
                "client_id": "pikvm-buffer",
                "username": "kvm",
                "password": "secret",
                "reconnect_interval": 5,
                "max_reconnect_interval": 60
            },
            "api": { "url": "https://ingest.example.com/rest/v1/events", "key": "k", "timeout": 15 },
            "buffer": {
                "max_size": 5000,
                "persist_file": "/var/lib/kvmd/pst/data/mqtt-buffer.json",
                "flush_interval": 20,
                "max_retries": 4,
                "cleanup_interval": 1800,
                "message_retention_days": 3
            },
            "circuit_breaker": { "max_failures": 3, "timeout": 45 },
            "topics": ["tele/tasmota_F3E3A4/SENSOR", "stat/+/POWER"],
            "logging": { "level": "debug", "stats_interval": 120 }
        }"#;
        let config: RelayConfig = serde_json::from_str(json).unwrap();
        config.validate().unwrap();

        assert!(config.mqtt.enabled());
        assert!(!config.bus.enabled());
        assert_eq!(
            config.mqtt.endpoint().unwrap(),
            ("192.168.1.10".to_string(), 1883)
        );
        assert_eq!(config.mqtt.username, "kvm");
        assert_eq!(config.mqtt.reconnect_interval(), Duration::from_secs(5));
        assert_eq!(config.mqtt.max_reconnect_interval(), Duration::from_secs(60));
        assert_eq!(config.topics.len(), 2);

        assert_eq!(config.sender_config().timeout, Duration::from_secs(15));
        assert_eq!(config.flush_interval(), Duration::from_secs(20));
        assert_eq!(config.cleanup_interval(), Duration::from_secs(1800));
        assert_eq!(config.stats_interval(), Duration::from_secs(120));
        assert_eq!(config.retention(), Duration::from_secs(3 * 86_400));

        let buffer = config.buffer_config();
        assert_eq!(buffer.capacity, 5000);
        assert_eq!(buffer.max_retries, 4);
        assert_eq!(buffer.breaker.failure_threshold, 3);
        assert_eq!(buffer.breaker.open_duration, Duration::from_secs(45));
    }

    #[test]
    fn test_inbound_source_rules() {
        let api = r#""api": { "url": "http://api" }"#;

        let none: RelayConfig = serde_json::from_str(&format!("{{ {} }}", api)).unwrap();
        assert!(none.validate().is_err());

        let topics_only: RelayConfig =
            serde_json::from_str(&format!(r#"{{ {}, "topics": ["a/b"] }}"#, api)).unwrap();
        assert!(topics_only.validate().is_err());

        let broker_only: RelayConfig = serde_json::from_str(&format!(
            r#"{{ {}, "mqtt": {{ "broker": "tcp://localhost" }} }}"#,
            api
        ))
        .unwrap();
        assert!(broker_only.validate().is_err());

        let both: RelayConfig = serde_json::from_str(&format!(
            r#"{{ {}, "mqtt": {{ "broker": "localhost" }}, "topics": ["a/#"],
                 "bus": {{ "subjects": ["a.>"] }} }}"#,
            api
        ))
        .unwrap();
        both.validate().unwrap();

        let mut backwards = both.clone();
        backwards.mqtt.reconnect_interval_secs = 120;
        assert!(backwards.validate().is_err());
    }

    #[test]
    fn test_mqtt_endpoint_parsing() {
        let endpoint = |broker: &str| {
            MqttConfig {
                broker: broker.to_string(),
                ..Default::default()
            }
            .endpoint()
        };

        assert_eq!(endpoint("tcp://broker:1884").unwrap(), ("broker".to_string(), 1884));
        assert_eq!(endpoint("mqtt://broker/").unwrap(), ("broker".to_string(), 1883));
        assert_eq!(endpoint("10.0.0.5").unwrap(), ("10.0.0.5".to_string(), 1883));
        assert_eq!(endpoint("[::1]:1883").unwrap(), ("::1".to_string(), 1883));

        assert!(endpoint("ssl://broker:8883").is_err());
        assert!(endpoint("tcp://broker:notaport").is_err());
        assert!(endpoint("tcp://:1883").is_err());
    }

    #[test]
    fn test_mqtt_client_id_rules() {
        let mut config = MqttConfig::default();
        config.check_client_id().unwrap();

        config.client_id = " relay".to_string();
        assert!(config.check_client_id().is_err());
        config.client_id.clear();
        assert!(config.check_client_id().is_err());
    }
}
