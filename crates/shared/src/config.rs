//! Configuration management using environment variables
//!
//! All settings are read once at startup into a [`SensorConfig`] that is
//! passed to the components that need it. Nothing reads the environment
//! after startup.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::env;
use std::str::FromStr;

/// Sensor process configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SensorConfig {
    /// Sensor name (also the JetStream key/value bucket name)
    pub sensor_name: String,

    /// Path of the JSON sensor spec (dependencies + triggers)
    pub spec_path: String,

    /// Event bus the sensor consumes from
    pub eventbus: BusConfig,

    /// Where pending correlation state is persisted (JetStream only)
    pub state_store: StateStoreKind,

    /// Redis configuration (trigger job queue, optional state store)
    pub redis: RedisConfig,

    /// Correlation timing settings
    pub correlation: CorrelationSettings,
}

/// Event bus selection, resolved once at startup
#[derive(Debug, Clone, Deserialize)]
pub enum BusConfig {
    /// NATS JetStream
    JetStream(JetStreamBusConfig),
    /// Kafka
    Kafka(KafkaBusConfig),
    /// NATS Streaming (STAN)
    Stan(StanBusConfig),
}

impl BusConfig {
    /// Short name of the configured bus, used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            BusConfig::JetStream(_) => "jetstream",
            BusConfig::Kafka(_) => "kafka",
            BusConfig::Stan(_) => "stan",
        }
    }
}

/// JetStream connection settings
#[derive(Debug, Clone, Deserialize)]
pub struct JetStreamBusConfig {
    /// NATS server URL
    pub url: String,

    /// Stream holding all event source subjects (`<stream>.<source>.<event>`)
    pub stream: String,
}

/// Kafka connection settings
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaBusConfig {
    /// Comma separated bootstrap servers
    pub brokers: String,

    /// Event topic; trigger and action topics are derived from it
    pub topic: String,

    /// Consumer group name
    pub consumer_group: String,

    /// Default for triggers that do not set `atLeastOnce`
    pub at_least_once: bool,

    /// Start from the earliest offset when the group has no committed offset
    pub start_oldest: bool,
}

/// NATS Streaming connection settings
#[derive(Debug, Clone, Deserialize)]
pub struct StanBusConfig {
    /// NATS server URL
    pub url: String,

    /// Streaming cluster ID
    pub cluster_id: String,

    /// Client ID; the queue group is this ID without its last `-` segment
    pub client_id: String,

    /// Subject every event source publishes to
    pub subject: String,
}

/// Backend for persisted correlation state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum StateStoreKind {
    /// JetStream key/value bucket named after the sensor
    JetStream,
    /// Redis hashes under `sensor:<name>:`
    Redis,
}

impl FromStr for StateStoreKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "jetstream" | "kv" => Ok(StateStoreKind::JetStream),
            "redis" => Ok(StateStoreKind::Redis),
            other => Err(Error::config(format!("Invalid STATE_STORE: {}", other))),
        }
    }
}

/// Correlation timing settings
#[derive(Debug, Clone, Deserialize)]
pub struct CorrelationSettings {
    /// Seconds after the first satisfied dependency before a forced reset
    pub failsafe_timeout_secs: u64,

    /// Seconds a processed message ID is remembered for de-duplication
    pub dedup_window_secs: u64,
}

/// Redis configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis host
    pub host: String,

    /// Redis port
    pub port: u16,

    /// Redis password (optional)
    pub password: Option<String>,

    /// Direct Redis URL (takes precedence over host/port/password)
    /// Supports both `redis://` and `rediss://` (TLS) schemes
    pub url: Option<String>,
}

impl RedisConfig {
    /// Build a Redis connection URL
    ///
    /// If `url` is set (from REDIS_URL env var), uses that directly.
    /// Otherwise, builds URL from host/port/password components.
    pub fn connection_url(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }

        if let Some(password) = &self.password {
            format!("redis://:{}@{}:{}", password, self.host, self.port)
        } else {
            format!("redis://{}:{}", self.host, self.port)
        }
    }
}

impl SensorConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for missing required variables or values that
    /// do not parse.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let sensor_name = lookup("SENSOR_NAME")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::config("SENSOR_NAME must be set"))?;
        let spec_path = var("SENSOR_SPEC_PATH", "/etc/sensor/spec.json");

        let eventbus = match var("EVENTBUS_TYPE", "jetstream").to_lowercase().as_str() {
            "jetstream" => BusConfig::JetStream(JetStreamBusConfig {
                url: var("JETSTREAM_URL", "nats://localhost:4222"),
                stream: var("JETSTREAM_STREAM", "default"),
            }),
            "kafka" => BusConfig::Kafka(KafkaBusConfig {
                brokers: lookup("KAFKA_BROKERS")
                    .ok_or_else(|| Error::config("KAFKA_BROKERS must be set"))?,
                topic: var("KAFKA_TOPIC", "argo-events"),
                consumer_group: var(
                    "KAFKA_CONSUMER_GROUP",
                    &format!("argo-events-{}", sensor_name),
                ),
                at_least_once: parse_bool("KAFKA_AT_LEAST_ONCE", &var("KAFKA_AT_LEAST_ONCE", "true"))?,
                start_oldest: parse_bool("KAFKA_START_OLDEST", &var("KAFKA_START_OLDEST", "false"))?,
            }),
            "stan" => BusConfig::Stan(StanBusConfig {
                url: var("STAN_URL", "nats://localhost:4222"),
                cluster_id: var("STAN_CLUSTER_ID", "stan"),
                client_id: lookup("STAN_CLIENT_ID")
                    .ok_or_else(|| Error::config("STAN_CLIENT_ID must be set"))?,
                subject: var("STAN_SUBJECT", "eventbus-default"),
            }),
            other => {
                return Err(Error::config(format!("Invalid EVENTBUS_TYPE: {}", other)));
            }
        };

        Ok(Self {
            sensor_name,
            spec_path,
            eventbus,
            state_store: var("STATE_STORE", "jetstream").parse()?,
            redis: RedisConfig {
                host: var("REDIS_HOST", "localhost"),
                port: var("REDIS_PORT", "6379")
                    .parse()
                    .map_err(|e| Error::config(format!("Invalid REDIS_PORT: {}", e)))?,
                password: lookup("REDIS_PASSWORD").filter(|s| !s.is_empty()),
                url: lookup("REDIS_URL").filter(|s| !s.is_empty()),
            },
            correlation: CorrelationSettings {
                failsafe_timeout_secs: var("FAILSAFE_TIMEOUT_SECS", "60")
                    .parse()
                    .map_err(|e| Error::config(format!("Invalid FAILSAFE_TIMEOUT_SECS: {}", e)))?,
                dedup_window_secs: var("DEDUP_WINDOW_SECS", "300")
                    .parse()
                    .map_err(|e| Error::config(format!("Invalid DEDUP_WINDOW_SECS: {}", e)))?,
            },
        })
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    value
        .parse()
        .map_err(|e| Error::config(format!("Invalid {}: {}", key, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<SensorConfig> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SensorConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults_to_jetstream() {
        let config = load(&[("SENSOR_NAME", "webhook-sensor")]).unwrap();
        match config.eventbus {
            BusConfig::JetStream(js) => {
                assert_eq!(js.url, "nats://localhost:4222");
                assert_eq!(js.stream, "default");
            }
            other => panic!("unexpected bus {:?}", other),
        }
        assert_eq!(config.state_store, StateStoreKind::JetStream);
        assert_eq!(config.correlation.failsafe_timeout_secs, 60);
        assert_eq!(config.correlation.dedup_window_secs, 300);
    }

    #[test]
    fn test_sensor_name_required() {
        assert!(matches!(load(&[]), Err(Error::Config(_))));
    }

    #[test]
    fn test_kafka_config() {
        let config = load(&[
            ("SENSOR_NAME", "s"),
            ("EVENTBUS_TYPE", "kafka"),
            ("KAFKA_BROKERS", "k1:9092,k2:9092"),
            ("KAFKA_AT_LEAST_ONCE", "false"),
        ])
        .unwrap();
        match config.eventbus {
            BusConfig::Kafka(kafka) => {
                assert_eq!(kafka.brokers, "k1:9092,k2:9092");
                assert_eq!(kafka.topic, "argo-events");
                assert_eq!(kafka.consumer_group, "argo-events-s");
                assert!(!kafka.at_least_once);
                assert!(!kafka.start_oldest);
            }
            other => panic!("unexpected bus {:?}", other),
        }
    }

    #[test]
    fn test_kafka_requires_brokers() {
        let result = load(&[("SENSOR_NAME", "s"), ("EVENTBUS_TYPE", "kafka")]);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_invalid_eventbus_type() {
        let result = load(&[("SENSOR_NAME", "s"), ("EVENTBUS_TYPE", "pulsar")]);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_invalid_failsafe_timeout() {
        let result = load(&[("SENSOR_NAME", "s"), ("FAILSAFE_TIMEOUT_SECS", "soon")]);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_redis_connection_url_with_password() {
        let config = RedisConfig {
            host: "localhost".to_string(),
            port: 6379,
            password: Some("secret".to_string()),
            url: None,
        };
        assert_eq!(config.connection_url(), "redis://:secret@localhost:6379");
    }

    #[test]
    fn test_redis_connection_url_with_direct_url() {
        let config = RedisConfig {
            host: "ignored".to_string(),
            port: 1234,
            password: Some("ignored".to_string()),
            url: Some("rediss://cache.example.com:6379".to_string()),
        };
        assert_eq!(config.connection_url(), "rediss://cache.example.com:6379");
    }

    #[test]
    fn test_state_store_parse() {
        assert_eq!("redis".parse::<StateStoreKind>().unwrap(), StateStoreKind::Redis);
        assert!("etcd".parse::<StateStoreKind>().is_err());
    }
}
