//! NATS JetStream driver
//!
//! Each trigger dependency gets one durable pull consumer on
//! `<stream>.<eventSourceName>.<eventName>`. Consumers are named
//! `group-<fnv32a(sensor-trigger-dependency)>` so a restarted sensor resumes
//! where it left off. Pending events are kept in the sensor's key/value
//! bucket (or Redis) and survive restarts.

use super::pipeline::{
    run_pipeline, Acker, AckingProcessor, Delivery, FetchError, MessageSource,
};
use super::{SensorDriver, SubscribeRequest, TriggerConnection};
use crate::correlation::{CorrelationConfig, Correlator, MessageMeta};
use crate::error::{BusError, BusResult};
use crate::store::{sync_to_spec, ConsumerPurger, KeyValueStore};
use async_nats::jetstream::{self, consumer, AckKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use shared::{Dependency, SensorSpec};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Maximum wait of one pull request
const FETCH_EXPIRY: Duration = Duration::from_secs(1);

/// In-progress ack interval while a message is being correlated
const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// 32-bit FNV-1a hash
pub fn fnv32a(data: &[u8]) -> u32 {
    data.iter().fold(0x811c_9dc5_u32, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(0x0100_0193)
    })
}

/// Durable consumer name of a trigger dependency
pub fn durable_name(sensor: &str, trigger: &str, dependency: &str) -> String {
    let key = format!("{}-{}-{}", sensor, trigger, dependency);
    format!("group-{}", fnv32a(key.as_bytes()))
}

/// Subject carrying the events of a dependency
pub fn dependency_subject(stream: &str, dependency: &Dependency) -> String {
    format!(
        "{}.{}.{}",
        stream, dependency.event_source_name, dependency.event_name
    )
}

/// Deliver policy of a dependency's consumer
///
/// Returns a warning message when the configured value is not recognized
/// and the default (`new`) is used instead.
pub fn deliver_policy(dependency: &Dependency) -> (consumer::DeliverPolicy, Option<String>) {
    let configured = dependency
        .jet_stream
        .as_ref()
        .and_then(|js| js.deliver_policy.as_deref());

    match configured.map(str::to_lowercase).as_deref() {
        None | Some("") | Some("new") => (consumer::DeliverPolicy::New, None),
        Some("all") => (consumer::DeliverPolicy::All, None),
        Some("last") => (consumer::DeliverPolicy::Last, None),
        Some(other) => (
            consumer::DeliverPolicy::New,
            Some(format!(
                "unknown deliver policy '{}' for dependency {}, using 'new'",
                other, dependency.name
            )),
        ),
    }
}

/// JetStream sensor driver
pub struct JetStreamSensor {
    url: String,
    stream: String,
    client: async_nats::Client,
    spec: SensorSpec,
    store: Arc<dyn KeyValueStore>,
    correlation: CorrelationConfig,
}

impl JetStreamSensor {
    /// Create the driver
    ///
    /// # Arguments
    ///
    /// * `url` - NATS URL, used for per-trigger connections
    /// * `stream` - Stream holding the event source subjects
    /// * `client` - Connection used for setup
    /// * `spec` - Sensor spec
    /// * `store` - Pending event store
    /// * `correlation` - Failsafe and de-duplication timing
    pub fn new(
        url: String,
        stream: String,
        client: async_nats::Client,
        spec: SensorSpec,
        store: Arc<dyn KeyValueStore>,
        correlation: CorrelationConfig,
    ) -> Self {
        Self {
            url,
            stream,
            client,
            spec,
            store,
            correlation,
        }
    }
}

#[async_trait]
impl SensorDriver for JetStreamSensor {
    async fn initialize(&mut self) -> BusResult<()> {
        let purger = DurableConsumerPurger {
            context: jetstream::new(self.client.clone()),
            stream: self.stream.clone(),
            sensor: self.spec.name.clone(),
        };
        sync_to_spec(self.store.as_ref(), &self.spec, &purger).await?;
        Ok(())
    }

    async fn connect(
        &self,
        trigger_name: &str,
        expression: &str,
        dependencies: &[Dependency],
        _at_least_once: bool,
    ) -> BusResult<Box<dyn TriggerConnection>> {
        let client = async_nats::connect(&self.url)
            .await
            .map_err(|e| BusError::setup(format!("failed to connect to {}: {}", self.url, e)))?;
        info!(
            trigger = %trigger_name,
            url = %self.url,
            "Connected trigger to JetStream"
        );

        Ok(Box::new(JetStreamTriggerConn {
            sensor_name: self.spec.name.clone(),
            trigger_name: trigger_name.to_string(),
            expression: expression.to_string(),
            dependencies: dependencies.to_vec(),
            stream: self.stream.clone(),
            context: jetstream::new(client.clone()),
            client,
            store: self.store.clone(),
            correlation: self.correlation,
            closed: AtomicBool::new(false),
        }))
    }
}

struct DurableConsumerPurger {
    context: jetstream::Context,
    stream: String,
    sensor: String,
}

#[async_trait]
impl ConsumerPurger for DurableConsumerPurger {
    async fn purge_consumer(&self, trigger: &str, dependency: &str) -> BusResult<()> {
        let durable = durable_name(&self.sensor, trigger, dependency);
        let stream = self
            .context
            .get_stream(&self.stream)
            .await
            .map_err(|e| BusError::transport(e.to_string()))?;
        stream
            .delete_consumer(&durable)
            .await
            .map_err(|e| BusError::transport(format!("delete consumer {}: {}", durable, e)))?;
        info!(trigger = %trigger, dependency = %dependency, durable = %durable, "Deleted durable consumer");
        Ok(())
    }
}

/// Trigger connection backed by durable pull consumers
pub struct JetStreamTriggerConn {
    sensor_name: String,
    trigger_name: String,
    expression: String,
    dependencies: Vec<Dependency>,
    stream: String,
    client: async_nats::Client,
    context: jetstream::Context,
    store: Arc<dyn KeyValueStore>,
    correlation: CorrelationConfig,
    closed: AtomicBool,
}

impl JetStreamTriggerConn {
    async fn sources(&self) -> BusResult<Vec<Box<dyn MessageSource>>> {
        let stream = self
            .context
            .get_stream(&self.stream)
            .await
            .map_err(|e| BusError::setup(format!("stream {} not available: {}", self.stream, e)))?;

        let mut subjects = HashSet::new();
        let mut sources: Vec<Box<dyn MessageSource>> = Vec::new();
        for dependency in &self.dependencies {
            let subject = dependency_subject(&self.stream, dependency);
            if !subjects.insert(subject.clone()) {
                continue;
            }

            let durable = durable_name(&self.sensor_name, &self.trigger_name, &dependency.name);
            let (policy, warning) = deliver_policy(dependency);
            if let Some(warning) = warning {
                warn!(trigger = %self.trigger_name, dependency = %dependency.name, "{}", warning);
            }

            let consumer = stream
                .get_or_create_consumer(
                    &durable,
                    consumer::pull::Config {
                        durable_name: Some(durable.clone()),
                        filter_subject: subject.clone(),
                        ack_policy: consumer::AckPolicy::Explicit,
                        deliver_policy: policy,
                        ..Default::default()
                    },
                )
                .await
                .map_err(|e| {
                    BusError::setup(format!("failed to create consumer {}: {}", durable, e))
                })?;

            info!(
                trigger = %self.trigger_name,
                dependency = %dependency.name,
                subject = %subject,
                durable = %durable,
                "Subscribed to dependency subject"
            );
            sources.push(Box::new(JetStreamSource {
                consumer,
                subject,
                durable,
            }));
        }
        Ok(sources)
    }
}

#[async_trait]
impl TriggerConnection for JetStreamTriggerConn {
    fn trigger_name(&self) -> &str {
        &self.trigger_name
    }

    async fn subscribe(&self, request: SubscribeRequest) -> BusResult<()> {
        let mut correlator = Correlator::new(
            self.trigger_name.clone(),
            &self.expression,
            &self.dependencies,
            self.correlation,
        )?
        .with_store(self.store.clone());

        let pending = correlator
            .restore(request.last_reset_time, Utc::now())
            .await?;
        info!(
            trigger = %self.trigger_name,
            pending = pending,
            one_and_done = correlator.expression().one_and_done(),
            "Restored trigger state"
        );

        let sources = self.sources().await?;
        let processor = AckingProcessor::new(correlator, request.handler.clone(), PROGRESS_INTERVAL);
        let result = run_pipeline(sources, processor, request).await;

        if let Err(e) = self.client.flush().await {
            warn!(trigger = %self.trigger_name, error = %e, "Failed to flush NATS connection");
        }
        result
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
            || self.client.connection_state() == async_nats::connection::State::Disconnected
    }

    async fn close(&self) -> BusResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.client
            .flush()
            .await
            .map_err(|e| BusError::transport(e.to_string()))
    }
}

struct JetStreamSource {
    consumer: consumer::PullConsumer,
    subject: String,
    durable: String,
}

#[async_trait]
impl MessageSource for JetStreamSource {
    fn describe(&self) -> String {
        format!("{} ({})", self.subject, self.durable)
    }

    async fn fetch(&mut self) -> Result<Vec<Delivery>, FetchError> {
        let mut batch = self
            .consumer
            .batch()
            .max_messages(1)
            .expires(FETCH_EXPIRY)
            .messages()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let mut deliveries = Vec::new();
        while let Some(message) = batch.next().await {
            let message = message.map_err(|e| FetchError::Transport(e.to_string()))?;
            deliveries.push(into_delivery(message)?);
        }

        if deliveries.is_empty() {
            Err(FetchError::Timeout)
        } else {
            Ok(deliveries)
        }
    }
}

fn into_delivery(message: jetstream::Message) -> Result<Delivery, FetchError> {
    let meta = {
        let info = message
            .info()
            .map_err(|e| FetchError::Transport(format!("invalid message metadata: {}", e)))?;
        MessageMeta {
            stream_sequence: info.stream_sequence,
            consumer_sequence: info.consumer_sequence,
            partition: None,
            timestamp: DateTime::from_timestamp(
                info.published.unix_timestamp(),
                info.published.nanosecond(),
            )
            .unwrap_or_else(Utc::now),
        }
    };

    let (message, acker) = message.split();
    Ok(Delivery {
        data: message.payload.to_vec(),
        meta,
        acker: Box::new(JetStreamAcker(acker)),
    })
}

struct JetStreamAcker(jetstream::message::Acker);

#[async_trait]
impl Acker for JetStreamAcker {
    async fn ack(&self) -> BusResult<()> {
        self.0
            .double_ack()
            .await
            .map_err(|e| BusError::transport(e.to_string()))
    }

    async fn in_progress(&self) -> BusResult<()> {
        self.0
            .ack_with(AckKind::Progress)
            .await
            .map_err(|e| BusError::transport(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::JetStreamConsumerConfig;

    fn dependency_with_policy(policy: Option<&str>) -> Dependency {
        let mut dep = Dependency::new("dep", "webhook", "example");
        dep.jet_stream = policy.map(|p| JetStreamConsumerConfig {
            deliver_policy: Some(p.to_string()),
        });
        dep
    }

    #[test]
    fn test_fnv32a_known_values() {
        assert_eq!(fnv32a(b""), 0x811c_9dc5);
        assert_eq!(fnv32a(b"a"), 0xe40c_292c);
        assert_eq!(fnv32a(b"foobar"), 0xbf9c_f968);
    }

    #[test]
    fn test_durable_name_is_stable() {
        let name = durable_name("sensor", "trigger", "dep");
        assert_eq!(name, durable_name("sensor", "trigger", "dep"));
        assert!(name.starts_with("group-"));
        assert_ne!(name, durable_name("sensor", "trigger", "dep2"));
        assert_eq!(
            name,
            format!("group-{}", fnv32a(b"sensor-trigger-dep"))
        );
    }

    #[test]
    fn test_dependency_subject() {
        let dep = Dependency::new("dep", "webhook", "example");
        assert_eq!(dependency_subject("default", &dep), "default.webhook.example");
    }

    #[test]
    fn test_deliver_policy() {
        let cases = [
            (None, consumer::DeliverPolicy::New, false),
            (Some("all"), consumer::DeliverPolicy::All, false),
            (Some("LAST"), consumer::DeliverPolicy::Last, false),
            (Some("new"), consumer::DeliverPolicy::New, false),
            (Some("sometimes"), consumer::DeliverPolicy::New, true),
        ];
        for (configured, expected, warns) in cases {
            let (policy, warning) = deliver_policy(&dependency_with_policy(configured));
            assert_eq!(policy, expected, "policy for {:?}", configured);
            assert_eq!(warning.is_some(), warns, "warning for {:?}", configured);
        }
    }
}
