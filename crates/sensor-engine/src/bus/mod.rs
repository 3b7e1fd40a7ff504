//! Event bus drivers
//!
//! Every bus exposes the same two-level contract:
//!
//! - a [`SensorDriver`] is created once per sensor process, performs any
//!   one-time setup in [`SensorDriver::initialize`] and hands out one
//!   [`TriggerConnection`] per trigger
//! - [`TriggerConnection::subscribe`] consumes the trigger's dependencies
//!   until cancelled, calling back into a [`TriggerHandler`]
//!
//! The bus is selected once from [`BusConfig`] by [`sensor_driver`].

pub mod jetstream;
pub mod kafka;
pub mod pipeline;
pub mod stan;

use crate::correlation::CorrelationConfig;
use crate::error::{BusError, BusResult};
use crate::store::{JetStreamKvStore, KeyValueStore, RedisStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use shared::{BusConfig, Dependency, Event, SensorConfig, SensorSpec, StateStoreKind};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Callbacks a trigger connection invokes while correlating
#[async_trait]
pub trait TriggerHandler: Send + Sync {
    /// Rewrite an event before it is matched against filters
    fn transform(&self, dependency: &str, event: Event) -> anyhow::Result<Event>;

    /// Whether the event may satisfy the dependency
    fn filter(&self, dependency: &str, event: &Event) -> bool;

    /// Execute the trigger with one event per satisfied dependency
    async fn action(&self, events: HashMap<String, Event>);
}

/// Everything a subscription needs from its caller
pub struct SubscribeRequest {
    /// Cancelled when the sensor shuts down
    pub cancel: CancellationToken,
    /// Cancelled to close only this subscription
    pub close: CancellationToken,
    /// Each message requests a reset of the trigger conditions
    pub reset_conditions: mpsc::Receiver<()>,
    /// Pending events older than this are discarded on subscribe
    pub last_reset_time: Option<DateTime<Utc>>,
    /// Trigger callbacks
    pub handler: Arc<dyn TriggerHandler>,
    /// Subject to subscribe to on buses with a single shared subject (STAN)
    pub default_subject: Option<String>,
}

impl SubscribeRequest {
    /// Create a request; the returned sender triggers condition resets
    pub fn new(cancel: CancellationToken, handler: Arc<dyn TriggerHandler>) -> (Self, mpsc::Sender<()>) {
        let (reset_tx, reset_rx) = mpsc::channel(1);
        let request = Self {
            close: cancel.child_token(),
            cancel,
            reset_conditions: reset_rx,
            last_reset_time: None,
            handler,
            default_subject: None,
        };
        (request, reset_tx)
    }

    pub fn with_last_reset_time(mut self, last_reset_time: Option<DateTime<Utc>>) -> Self {
        self.last_reset_time = last_reset_time;
        self
    }

    pub fn with_default_subject(mut self, subject: impl Into<String>) -> Self {
        self.default_subject = Some(subject.into());
        self
    }

    pub fn with_close(mut self, close: CancellationToken) -> Self {
        self.close = close;
        self
    }
}

/// Subscription of one trigger to its dependencies
#[async_trait]
pub trait TriggerConnection: Send + Sync {
    fn trigger_name(&self) -> &str;

    /// Consume and correlate until `cancel` or `close` fires
    ///
    /// # Errors
    ///
    /// Setup problems are returned before consuming starts. `BusError::Fatal`
    /// is returned when the bus client can no longer make progress.
    async fn subscribe(&self, request: SubscribeRequest) -> BusResult<()>;

    fn is_closed(&self) -> bool;

    async fn close(&self) -> BusResult<()>;
}

/// Per-sensor entry point of an event bus
#[async_trait]
pub trait SensorDriver: Send + Sync {
    /// One-time setup before any trigger connects
    async fn initialize(&mut self) -> BusResult<()>;

    /// Create the connection of one trigger
    ///
    /// # Arguments
    ///
    /// * `trigger_name` - Trigger name
    /// * `expression` - Dependency expression of the trigger
    /// * `dependencies` - Dependencies referenced by the expression
    /// * `at_least_once` - Run the action before committing consumed messages
    async fn connect(
        &self,
        trigger_name: &str,
        expression: &str,
        dependencies: &[Dependency],
        at_least_once: bool,
    ) -> BusResult<Box<dyn TriggerConnection>>;
}

/// Build the driver of the configured event bus
///
/// # Errors
///
/// Returns `BusError::Setup` when the bus cannot be reached or is not
/// available in this build.
pub async fn sensor_driver(
    config: &SensorConfig,
    spec: SensorSpec,
    redis: ConnectionManager,
) -> BusResult<Box<dyn SensorDriver>> {
    let correlation = CorrelationConfig::from(&config.correlation);
    tracing::info!(
        eventbus = config.eventbus.kind(),
        sensor = %spec.name,
        "Creating sensor driver"
    );

    match &config.eventbus {
        BusConfig::JetStream(js) => {
            let client = async_nats::connect(&js.url)
                .await
                .map_err(|e| BusError::setup(format!("failed to connect to {}: {}", js.url, e)))?;
            let context = async_nats::jetstream::new(client.clone());
            let store: Arc<dyn KeyValueStore> = match config.state_store {
                StateStoreKind::JetStream => {
                    Arc::new(JetStreamKvStore::open(&context, &spec.name).await?)
                }
                StateStoreKind::Redis => Arc::new(RedisStore::new(redis, &spec.name)),
            };
            Ok(Box::new(jetstream::JetStreamSensor::new(
                js.url.clone(),
                js.stream.clone(),
                client,
                spec,
                store,
                correlation,
            )))
        }
        BusConfig::Kafka(kafka_config) => {
            kafka::sensor_driver(kafka_config, spec, correlation)
        }
        BusConfig::Stan(stan_config) => Err(BusError::setup(format!(
            "no NATS Streaming client is available for cluster {} at {}; embed the engine and pass a StanClient to StanSensor::new",
            stan_config.cluster_id, stan_config.url
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHandler;

    #[async_trait]
    impl TriggerHandler for NoopHandler {
        fn transform(&self, _dependency: &str, event: Event) -> anyhow::Result<Event> {
            Ok(event)
        }

        fn filter(&self, _dependency: &str, _event: &Event) -> bool {
            true
        }

        async fn action(&self, _events: HashMap<String, Event>) {}
    }

    #[tokio::test]
    async fn test_subscribe_request_close_follows_cancel() {
        let cancel = CancellationToken::new();
        let (request, reset_tx) = SubscribeRequest::new(cancel.clone(), Arc::new(NoopHandler));
        let request = request.with_default_subject("events");

        assert_eq!(request.default_subject.as_deref(), Some("events"));
        assert!(!request.close.is_cancelled());
        cancel.cancel();
        assert!(request.close.is_cancelled());

        drop(request);
        assert!(reset_tx.send(()).await.is_err());
    }
}
