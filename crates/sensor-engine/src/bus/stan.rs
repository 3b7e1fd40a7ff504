//! NATS Streaming (STAN) driver
//!
//! All event sources publish to one subject. Each trigger holds a durable
//! queue-group subscription on it with manual acknowledgement, and leaves
//! messages of satisfied dependencies unacknowledged until the trigger fires
//! or resets. The server keeps redelivering held messages every ack wait,
//! which both refreshes them and, once the trigger has fired, gets them
//! acknowledged as older than the last reset.
//!
//! No STAN client crate is available; the transport is expressed through
//! [`StanClient`] so a host process can plug one in.

use super::pipeline::{
    decode_event, run_pipeline, Acker, Delivery, DeliveryProcessor, FetchError, MessageSource,
};
use super::{SensorDriver, SubscribeRequest, TriggerConnection, TriggerHandler};
use crate::correlation::{CorrelationConfig, Correlator, MessageMeta, Outcome};
use crate::error::{BusError, BusResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::Dependency;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long the server waits for an ack before redelivering
pub const ACK_WAIT: Duration = Duration::from_secs(1);

/// How long a fetch waits for the next message
const FETCH_TIMEOUT: Duration = Duration::from_secs(1);

/// Held messages not redelivered for this long are considered gone from
/// the server
pub fn stale_after() -> chrono::Duration {
    chrono::Duration::minutes(10)
}

/// A message delivered by a STAN subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StanMessage {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub data: Vec<u8>,
    pub redelivered: bool,
}

/// Options of a durable queue subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StanSubscriptionOptions {
    pub subject: String,
    pub queue_group: String,
    pub durable_name: String,
    pub manual_ack: bool,
    pub ack_wait: Duration,
    pub max_in_flight: usize,
    /// Start with messages published after the subscription is created
    pub new_only: bool,
}

/// An open STAN subscription
#[async_trait]
pub trait StanSubscription: Send {
    /// Next message with its ack handle, `None` once the subscription closed
    async fn next(&mut self) -> Option<(StanMessage, Box<dyn Acker>)>;

    async fn close(&mut self) -> BusResult<()>;
}

/// A connected STAN client
#[async_trait]
pub trait StanClient: Send + Sync {
    fn client_id(&self) -> &str;

    async fn queue_subscribe(
        &self,
        options: StanSubscriptionOptions,
    ) -> BusResult<Box<dyn StanSubscription>>;

    fn is_closed(&self) -> bool;

    async fn close(&self) -> BusResult<()>;
}

/// Queue group (and durable name) of a client: its ID without the last
/// `-` separated part
///
/// # Errors
///
/// Returns `BusError::Setup` when the client ID contains no `-`.
pub fn group_name_from_client_id(client_id: &str) -> BusResult<String> {
    match client_id.rsplit_once('-') {
        Some((group, _)) => Ok(group.to_string()),
        None => Err(BusError::setup(format!(
            "expected client ID to contain a dash: {}",
            client_id
        ))),
    }
}

/// STAN sensor driver
pub struct StanSensor {
    client: Arc<dyn StanClient>,
    sensor_name: String,
    correlation: CorrelationConfig,
}

impl StanSensor {
    pub fn new(
        client: Arc<dyn StanClient>,
        sensor_name: impl Into<String>,
        correlation: CorrelationConfig,
    ) -> Self {
        Self {
            client,
            sensor_name: sensor_name.into(),
            correlation,
        }
    }
}

#[async_trait]
impl SensorDriver for StanSensor {
    async fn initialize(&mut self) -> BusResult<()> {
        info!(
            sensor = %self.sensor_name,
            client_id = %self.client.client_id(),
            "STAN sensor ready"
        );
        Ok(())
    }

    async fn connect(
        &self,
        trigger_name: &str,
        expression: &str,
        dependencies: &[Dependency],
        _at_least_once: bool,
    ) -> BusResult<Box<dyn TriggerConnection>> {
        group_name_from_client_id(self.client.client_id())?;
        Ok(Box::new(StanTriggerConn {
            client: self.client.clone(),
            trigger_name: trigger_name.to_string(),
            expression: expression.to_string(),
            dependencies: dependencies.to_vec(),
            correlation: self.correlation,
            closed: AtomicBool::new(false),
        }))
    }
}

/// Trigger connection on the shared STAN subject
pub struct StanTriggerConn {
    client: Arc<dyn StanClient>,
    trigger_name: String,
    expression: String,
    dependencies: Vec<Dependency>,
    correlation: CorrelationConfig,
    closed: AtomicBool,
}

#[async_trait]
impl TriggerConnection for StanTriggerConn {
    fn trigger_name(&self) -> &str {
        &self.trigger_name
    }

    async fn subscribe(&self, request: SubscribeRequest) -> BusResult<()> {
        let subject = request
            .default_subject
            .clone()
            .ok_or_else(|| BusError::setup("can't subscribe over NATS streaming: default subject not set"))?;
        let group = group_name_from_client_id(self.client.client_id())?;

        let mut correlator = Correlator::new(
            self.trigger_name.clone(),
            &self.expression,
            &self.dependencies,
            self.correlation,
        )?;
        correlator.set_last_reset_time(request.last_reset_time);

        let options = StanSubscriptionOptions {
            subject: subject.clone(),
            queue_group: group.clone(),
            durable_name: group.clone(),
            manual_ack: true,
            ack_wait: ACK_WAIT,
            max_in_flight: correlator.expression().variables().len() + 2,
            new_only: true,
        };
        let subscription = self.client.queue_subscribe(options).await?;
        info!(
            trigger = %self.trigger_name,
            subject = %subject,
            durable = %group,
            "Subscribed to STAN subject"
        );

        let source = StanSource {
            subscription,
            subject,
        };
        let processor = StanProcessor::new(correlator, request.handler.clone());
        run_pipeline(vec![Box::new(source)], processor, request).await
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.client.is_closed()
    }

    async fn close(&self) -> BusResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct StanSource {
    subscription: Box<dyn StanSubscription>,
    subject: String,
}

#[async_trait]
impl MessageSource for StanSource {
    fn describe(&self) -> String {
        format!("stan:{}", self.subject)
    }

    async fn fetch(&mut self) -> Result<Vec<Delivery>, FetchError> {
        match tokio::time::timeout(FETCH_TIMEOUT, self.subscription.next()).await {
            Err(_) => Err(FetchError::Timeout),
            Ok(None) => Err(FetchError::Closed),
            Ok(Some((message, acker))) => Ok(vec![Delivery {
                meta: MessageMeta {
                    stream_sequence: message.sequence,
                    consumer_sequence: message.sequence,
                    partition: None,
                    timestamp: message.timestamp,
                },
                data: message.data,
                acker,
            }]),
        }
    }

    async fn close(&mut self) {
        match self.subscription.close().await {
            Ok(()) => info!(subject = %self.subject, "STAN subscription closed"),
            Err(e) => warn!(subject = %self.subject, error = %e, "Failed to close STAN subscription"),
        }
    }
}

/// Why a message is acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckReason {
    Malformed,
    Unresolved,
    TransformFailed,
    Filtered,
    Duplicate,
    /// Published at or before the last reset
    BeforeReset,
    /// An older redelivery of a dependency that holds a newer message
    Superseded,
    Fired,
}

/// Why a message is left unacknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldReason {
    /// Dependency satisfied, trigger not yet
    Pending,
    /// Redelivery of the held message
    Redelivered,
    EvaluationFailed,
}

/// Acknowledgement decision for one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanDecision {
    Ack(AckReason),
    Hold(HoldReason),
}

/// Correlation rules of a STAN trigger
pub struct StanProcessor {
    correlator: Correlator,
    handler: Arc<dyn TriggerHandler>,
    last_delivered: HashMap<String, DateTime<Utc>>,
}

impl StanProcessor {
    pub fn new(correlator: Correlator, handler: Arc<dyn TriggerHandler>) -> Self {
        Self {
            correlator,
            handler,
            last_delivered: HashMap::new(),
        }
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    /// Correlate one message and decide whether to acknowledge it
    pub async fn decide(&mut self, data: &[u8], meta: MessageMeta, now: DateTime<Utc>) -> StanDecision {
        let event = match decode_event(data) {
            Ok(event) => event,
            Err(e) => {
                error!(
                    trigger = %self.correlator.trigger_name(),
                    sequence = meta.stream_sequence,
                    error = %e,
                    error_id = "MALFORMED_MESSAGE",
                    "Failed to decode event, discarding it"
                );
                return StanDecision::Ack(AckReason::Malformed);
            }
        };

        let Some(dependency) = self
            .correlator
            .resolve(&event.source, event.subject())
            .into_iter()
            .next()
        else {
            return StanDecision::Ack(AckReason::Unresolved);
        };

        let event = match self.handler.transform(&dependency, event) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    trigger = %self.correlator.trigger_name(),
                    dependency = %dependency,
                    error = %e,
                    "Failed to transform event"
                );
                return StanDecision::Ack(AckReason::TransformFailed);
            }
        };
        if !self.handler.filter(&dependency, &event) {
            debug!(trigger = %self.correlator.trigger_name(), dependency = %dependency, "Event filtered out");
            return StanDecision::Ack(AckReason::Filtered);
        }

        if self.correlator.is_duplicate(&event.id, now) {
            info!(
                trigger = %self.correlator.trigger_name(),
                event_id = %event.id,
                "Duplicate delivered message detected"
            );
            return StanDecision::Ack(AckReason::Duplicate);
        }

        self.apply_failsafe(now).await;

        if let Some(reset) = self.correlator.last_reset_time() {
            if meta.timestamp <= reset {
                self.correlator.clear_dependency(&dependency).await;
                self.last_delivered.remove(&dependency);
                self.correlator.remember(&event.id, now);
                debug!(
                    trigger = %self.correlator.trigger_name(),
                    dependency = %dependency,
                    timestamp = %meta.timestamp,
                    last_reset_time = %reset,
                    "Message published before last reset, clearing dependency"
                );
                return StanDecision::Ack(AckReason::BeforeReset);
            }
        }

        if let Some(held) = self.correlator.state().pending(&dependency) {
            if meta.timestamp == held.timestamp {
                self.last_delivered.insert(dependency, now);
                return StanDecision::Hold(HoldReason::Redelivered);
            }
            if meta.timestamp < held.timestamp {
                self.correlator.remember(&event.id, now);
                debug!(
                    trigger = %self.correlator.trigger_name(),
                    event_id = %event.id,
                    "Dropping message, a later one also satisfies the dependency"
                );
                return StanDecision::Ack(AckReason::Superseded);
            }
        }

        self.evict_stale(now).await;

        let event_id = event.id.clone();
        match self.correlator.correlate(&dependency, event, meta, now).await {
            Outcome::Pending { .. } => {
                self.last_delivered.insert(dependency, now);
                StanDecision::Hold(HoldReason::Pending)
            }
            Outcome::Fired { events, .. } => {
                self.correlator.set_last_reset_time(Some(meta.timestamp));
                self.handler.action(events).await;
                self.last_delivered.clear();
                self.correlator.remember(&event_id, now);
                StanDecision::Ack(AckReason::Fired)
            }
            Outcome::EvaluationFailed { .. } => StanDecision::Hold(HoldReason::EvaluationFailed),
            Outcome::Filtered { .. } | Outcome::TransformFailed { .. } => {
                StanDecision::Ack(AckReason::Filtered)
            }
        }
    }

    /// Clear everything once the failsafe deadline has passed
    ///
    /// The last reset time moves up to the newest cleared message, so the
    /// held messages the broker redelivers afterwards are acknowledged
    /// instead of being correlated again.
    async fn apply_failsafe(&mut self, now: DateTime<Utc>) -> bool {
        let newest = self
            .correlator
            .state()
            .pending_events()
            .map(|(_, pending)| pending.timestamp)
            .max();
        if !self.correlator.check_failsafe(now).await {
            return false;
        }
        if let Some(newest) = newest {
            if self.correlator.last_reset_time().map_or(true, |reset| reset < newest) {
                self.correlator.set_last_reset_time(Some(newest));
            }
        }
        self.last_delivered.clear();
        true
    }

    async fn evict_stale(&mut self, now: DateTime<Utc>) {
        let stale: Vec<String> = self
            .last_delivered
            .iter()
            .filter(|(_, delivered)| now - **delivered > stale_after())
            .map(|(dependency, _)| dependency.clone())
            .collect();
        for dependency in stale {
            warn!(
                trigger = %self.correlator.trigger_name(),
                dependency = %dependency,
                "Held message not redelivered recently, treating it as stale"
            );
            self.correlator.clear_dependency(&dependency).await;
            self.last_delivered.remove(&dependency);
        }
    }

    fn prune_delivered(&mut self) {
        let state = self.correlator.state();
        self.last_delivered
            .retain(|dependency, _| state.pending(dependency).is_some());
    }
}

#[async_trait]
impl DeliveryProcessor for StanProcessor {
    async fn process(&mut self, delivery: Delivery) {
        let Delivery { data, meta, acker } = delivery;
        let decision = self.decide(&data, meta, Utc::now()).await;
        debug!(
            trigger = %self.correlator.trigger_name(),
            sequence = meta.stream_sequence,
            decision = ?decision,
            "Processed STAN message"
        );

        if let StanDecision::Ack(_) = decision {
            if let Err(e) = acker.ack().await {
                warn!(
                    trigger = %self.correlator.trigger_name(),
                    sequence = meta.stream_sequence,
                    error = %e,
                    "Failed to acknowledge message"
                );
            }
        }
    }

    async fn reset_conditions(&mut self, now: DateTime<Utc>) {
        self.correlator.reset_conditions(now).await;
        self.prune_delivered();
    }

    async fn tick(&mut self, now: DateTime<Utc>) {
        self.apply_failsafe(now).await;
        self.prune_delivered();
    }
}
