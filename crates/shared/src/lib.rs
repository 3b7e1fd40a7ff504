//! Shared library for the sensor services
//!
//! This crate provides common functionality used by the sensor engine and
//! the trigger job consumers:
//! - Event, dependency and sensor spec models
//! - Error handling types
//! - Configuration management
//! - Logging infrastructure
//! - Trigger job definitions
//! - Redis client

pub mod config;
pub mod error;
pub mod jobs;
pub mod models;
pub mod redis;

// Re-export commonly used types
pub use config::{
    BusConfig, CorrelationSettings, JetStreamBusConfig, KafkaBusConfig, RedisConfig,
    SensorConfig, StanBusConfig, StateStoreKind,
};
pub use error::{Error, Result};
pub use jobs::{TriggerJob, TRIGGER_JOBS_QUEUE};
pub use models::{event_key, Dependency, Event, JetStreamConsumerConfig, SensorSpec, TriggerSpec};

/// Initialize tracing subscriber for structured logging
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shared=debug,sensor_engine=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
