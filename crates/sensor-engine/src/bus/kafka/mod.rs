//! Kafka driver
//!
//! All triggers of a sensor share one consumer group over three topics:
//!
//! - `<topic>`: events published by event sources
//! - `<topic>-<sensor>-trigger`: events that satisfied a dependency of a
//!   trigger whose expression needs more than one dependency, keyed by
//!   trigger name
//! - `<topic>-<sensor>-action`: the events of a trigger ready to fire,
//!   keyed by trigger name
//!
//! Records are consumed in batches, and every batch of a partition is
//! committed in a single transaction together with the consumed offset. The
//! trigger topic offset that gets committed is held back to the oldest
//! record still pending in any trigger, so correlation state is rebuilt by
//! replay after a restart. Per-trigger checkpoints stored in the offset
//! metadata prevent a fired trigger from firing again during that replay.

pub mod batch;
pub mod checkpoint;
#[cfg(feature = "kafka")]
pub mod client;
pub mod transaction;

pub use checkpoint::{Checkpoint, Checkpoints};
pub use transaction::{
    commit_batch, BatchCommit, CommitOutcome, TransactionalProducer, TxnError, TxnErrorKind,
};

use super::pipeline::{decode_event, RateLimitedLog, FETCH_ERROR_LOG_INTERVAL};
use super::{SensorDriver, SubscribeRequest, TriggerConnection, TriggerHandler};
use crate::correlation::{CorrelationConfig, CorrelationState, Correlator, MessageMeta, Outcome};
use crate::error::{BusError, BusResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::{Dependency, Event, KafkaBusConfig, SensorSpec};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Pause after a failed poll before trying again
const POLL_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Topics of one sensor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaTopics {
    pub event: String,
    pub trigger: String,
    pub action: String,
}

impl KafkaTopics {
    pub fn new(topic: &str, sensor: &str) -> Self {
        Self {
            event: topic.to_string(),
            trigger: format!("{}-{}-trigger", topic, sensor),
            action: format!("{}-{}-action", topic, sensor),
        }
    }

    pub fn list(&self) -> [&str; 3] {
        [&self.event, &self.trigger, &self.action]
    }
}

/// A consumed record, detached from the client's buffers
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumedRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub value: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

/// A record to produce inside the batch transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducedRecord {
    pub topic: String,
    pub key: String,
    pub value: Vec<u8>,
}

/// Offset (next to consume) and metadata of a topic partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedPosition {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub metadata: String,
}

/// A partition assigned to this consumer and its committed position
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignedPartition {
    pub topic: String,
    pub partition: i32,
    /// `None` when the group never committed an offset for the partition
    pub committed: Option<i64>,
    pub metadata: String,
}

/// Consumer side of the group session
#[async_trait]
pub trait KafkaConsumerSession: Send {
    /// Next batch of records
    ///
    /// Returns an empty batch when nothing arrived within the batch window and
    /// `None` once the consumer has stopped.
    async fn next_batch(&mut self) -> BusResult<Option<Vec<ConsumedRecord>>>;

    /// The new assignment when partitions were rebalanced since the last call
    async fn assignment_changed(&mut self) -> BusResult<Option<Vec<AssignedPartition>>>;

    /// Commit an offset outside of a transaction
    async fn commit(&mut self, position: &ConsumedPosition) -> BusResult<()>;

    /// Seek back to a position and commit it
    async fn rewind(&mut self, position: &ConsumedPosition) -> BusResult<()>;
}

/// Creates the consumer session and transactional producer of a sensor
pub trait KafkaClientFactory: Send + Sync {
    /// # Errors
    ///
    /// Returns `BusError::Setup` when the clients cannot be created.
    fn connect(
        &self,
    ) -> BusResult<(Box<dyn KafkaConsumerSession>, Arc<dyn TransactionalProducer>)>;
}

/// Value of a trigger topic record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerRecord {
    pub dependency: String,
    pub event: Event,
}

/// Action of a trigger to run once its batch is committed
pub struct DeferredAction {
    pub trigger: String,
    handler: Arc<dyn TriggerHandler>,
    events: HashMap<String, Event>,
}

impl DeferredAction {
    pub async fn run(self) {
        debug!(trigger = %self.trigger, "Running deferred trigger action");
        self.handler.action(self.events).await;
    }
}

/// Result of handling one record
pub struct HandlerOutput {
    pub records: Vec<ProducedRecord>,
    /// Offset that may be committed for the record's partition
    pub next_offset: i64,
    pub deferred: Option<DeferredAction>,
}

impl HandlerOutput {
    fn empty(next_offset: i64) -> Self {
        Self {
            records: Vec::new(),
            next_offset,
            deferred: None,
        }
    }
}

/// A subscribed trigger as seen by the consumer
pub struct TriggerRegistration {
    pub correlator: Correlator,
    pub handler: Arc<dyn TriggerHandler>,
    pub at_least_once: bool,
    pub reset_requests: mpsc::Receiver<()>,
}

/// Record handling and batch bookkeeping of a sensor's consumer
pub struct KafkaSensorCore {
    topics: KafkaTopics,
    triggers: BTreeMap<String, TriggerRegistration>,
    checkpoints: Checkpoints,
}

impl KafkaSensorCore {
    pub fn new(topics: KafkaTopics) -> Self {
        Self {
            topics,
            triggers: BTreeMap::new(),
            checkpoints: Checkpoints::new(),
        }
    }

    pub fn register(&mut self, name: String, registration: TriggerRegistration) {
        self.triggers.insert(name, registration);
    }

    pub fn topics(&self) -> &KafkaTopics {
        &self.topics
    }

    pub fn checkpoints(&self) -> &Checkpoints {
        &self.checkpoints
    }

    pub fn correlator(&self, trigger: &str) -> Option<&Correlator> {
        self.triggers.get(trigger).map(|t| &t.correlator)
    }

    /// Route a record to the handler of its topic
    pub async fn handle(&mut self, record: &ConsumedRecord, now: DateTime<Utc>) -> HandlerOutput {
        if record.topic == self.topics.event {
            self.handle_event(record, now)
        } else if record.topic == self.topics.trigger {
            self.handle_trigger(record, now).await
        } else if record.topic == self.topics.action {
            self.handle_action(record).await
        } else {
            warn!(topic = %record.topic, "Record from unrecognized topic, skipping");
            HandlerOutput::empty(record.offset + 1)
        }
    }

    /// Fan an event out to every trigger with a matching dependency
    ///
    /// One-and-done triggers go straight to the action topic, everything
    /// else to the trigger topic.
    pub fn handle_event(&mut self, record: &ConsumedRecord, now: DateTime<Utc>) -> HandlerOutput {
        let mut output = HandlerOutput::empty(record.offset + 1);
        let event = match decode_event(&record.value) {
            Ok(event) => event,
            Err(e) => {
                error!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    error_id = "MALFORMED_MESSAGE",
                    "Failed to decode event, skipping"
                );
                return output;
            }
        };

        for (name, trigger) in self.triggers.iter_mut() {
            if trigger.correlator.is_duplicate(&event.id, now) {
                debug!(trigger = %name, event_id = %event.id, "Duplicate message, skipping");
                continue;
            }

            let dependencies = trigger.correlator.resolve(&event.source, event.subject());
            if dependencies.is_empty() {
                continue;
            }

            let mut completed = false;
            for dependency in dependencies {
                let transformed = match trigger.handler.transform(&dependency, event.clone()) {
                    Ok(transformed) => transformed,
                    Err(e) => {
                        warn!(
                            trigger = %name,
                            dependency = %dependency,
                            event_id = %event.id,
                            error = %e,
                            "Failed to transform event, skipping"
                        );
                        continue;
                    }
                };
                if !trigger.handler.filter(&dependency, &transformed) {
                    debug!(trigger = %name, dependency = %dependency, "Event filtered out");
                    completed = true;
                    continue;
                }

                let encoded = if trigger.correlator.expression().one_and_done() {
                    let events = HashMap::from([(dependency.clone(), transformed)]);
                    serde_json::to_vec(&events).map(|value| (self.topics.action.clone(), value))
                } else {
                    let value = TriggerRecord {
                        dependency: dependency.clone(),
                        event: transformed,
                    };
                    serde_json::to_vec(&value).map(|value| (self.topics.trigger.clone(), value))
                };

                match encoded {
                    Ok((topic, value)) => {
                        completed = true;
                        output.records.push(ProducedRecord {
                            topic,
                            key: name.clone(),
                            value,
                        });
                    }
                    Err(e) => error!(
                        trigger = %name,
                        dependency = %dependency,
                        error = %e,
                        error_id = "RECORD_ENCODE_FAILED",
                        "Failed to encode record, skipping"
                    ),
                }
            }

            if completed {
                trigger.correlator.remember(&event.id, now);
            }
        }

        output
    }

    /// Correlate a trigger record and produce an action record when the
    /// trigger fires
    pub async fn handle_trigger(
        &mut self,
        record: &ConsumedRecord,
        now: DateTime<Utc>,
    ) -> HandlerOutput {
        let mut output = HandlerOutput::empty(record.offset + 1);
        let key = record.key.clone().unwrap_or_default();

        match serde_json::from_slice::<TriggerRecord>(&record.value) {
            Err(e) => error!(
                trigger = %key,
                offset = record.offset,
                error = %e,
                error_id = "MALFORMED_MESSAGE",
                "Failed to decode trigger record, skipping"
            ),
            Ok(trigger_record) => match self.triggers.get_mut(&key) {
                None => warn!(trigger = %key, "Trigger record for unknown trigger, skipping"),
                Some(trigger) => {
                    let reset = trigger.correlator.last_reset_time();
                    if reset.is_some_and(|reset| record.timestamp < reset) {
                        debug!(
                            trigger = %key,
                            offset = record.offset,
                            "Trigger record older than last reset, skipping"
                        );
                    } else {
                        let meta = MessageMeta {
                            stream_sequence: record.offset as u64,
                            consumer_sequence: record.offset as u64,
                            partition: Some(record.partition),
                            timestamp: record.timestamp,
                        };
                        let outcome = trigger
                            .correlator
                            .correlate(&trigger_record.dependency, trigger_record.event, meta, now)
                            .await;
                        if let Outcome::Fired { events, .. } = outcome {
                            match serde_json::to_vec(&events) {
                                Ok(value) => output.records.push(ProducedRecord {
                                    topic: self.topics.action.clone(),
                                    key: key.clone(),
                                    value,
                                }),
                                Err(e) => error!(
                                    trigger = %key,
                                    error = %e,
                                    error_id = "RECORD_ENCODE_FAILED",
                                    "Failed to encode action record"
                                ),
                            }
                        }
                    }
                }
            },
        }

        output.next_offset = self.committable_offset(&record.topic, record.partition, output.next_offset);
        output
    }

    /// Run or defer the action of a fired trigger
    ///
    /// At-least-once triggers run the action now, before the batch commits;
    /// the others run after the commit.
    pub async fn handle_action(&mut self, record: &ConsumedRecord) -> HandlerOutput {
        let mut output = HandlerOutput::empty(record.offset + 1);
        let key = record.key.clone().unwrap_or_default();

        let events: HashMap<String, Event> = match serde_json::from_slice(&record.value) {
            Ok(events) => events,
            Err(e) => {
                error!(
                    trigger = %key,
                    offset = record.offset,
                    error = %e,
                    error_id = "MALFORMED_MESSAGE",
                    "Failed to decode action record, skipping"
                );
                return output;
            }
        };

        let Some(trigger) = self.triggers.get(&key) else {
            warn!(trigger = %key, "Action record for unknown trigger, skipping");
            return output;
        };

        if trigger.at_least_once {
            trigger.handler.action(events).await;
        } else {
            output.deferred = Some(DeferredAction {
                trigger: key,
                handler: trigger.handler.clone(),
                events,
            });
        }
        output
    }

    /// Offset that may be committed once `next` is consumed
    ///
    /// On the trigger topic this is held back to the oldest record still
    /// pending in any trigger on the same partition.
    pub fn committable_offset(&self, topic: &str, partition: i32, next: i64) -> i64 {
        if topic != self.topics.trigger {
            return next;
        }
        self.triggers
            .values()
            .flat_map(|t| t.correlator.state().pending_events())
            .filter(|(_, pending)| pending.partition == Some(partition))
            .map(|(_, pending)| pending.stream_sequence as i64)
            .fold(next, i64::min)
    }

    /// Apply a new partition assignment
    ///
    /// Checkpoints are rebuilt from the committed offsets and in-memory
    /// correlation state is dropped; it is rebuilt by replay.
    pub fn on_assignment(&mut self, partitions: Vec<AssignedPartition>) {
        info!(
            partitions = ?partitions
                .iter()
                .map(|p| format!("{}/{}", p.topic, p.partition))
                .collect::<Vec<_>>(),
            "Kafka partitions assigned"
        );

        self.checkpoints.clear();
        for partition in partitions {
            let checkpoint = Checkpoint::from_committed(
                partition.committed,
                &partition.metadata,
                partition.topic == self.topics.trigger,
            );
            self.checkpoints
                .insert(&partition.topic, partition.partition, checkpoint);
        }

        for trigger in self.triggers.values_mut() {
            trigger.correlator.reset_session();
        }
    }

    /// Apply pending reset requests and the failsafe deadline of every trigger
    pub async fn housekeeping(&mut self, now: DateTime<Utc>) {
        for trigger in self.triggers.values_mut() {
            while trigger.reset_requests.try_recv().is_ok() {
                trigger.correlator.reset_conditions(now).await;
            }
            trigger.correlator.check_failsafe(now).await;
        }
    }

    /// Handle a batch and commit it, one transaction per partition
    ///
    /// Deferred actions of committed partitions are spawned on `tracker`.
    ///
    /// # Errors
    ///
    /// Returns `BusError::Fatal` when a transaction fails fatally and the
    /// session's error when an offset cannot be committed.
    pub async fn process_batch(
        &mut self,
        session: &mut dyn KafkaConsumerSession,
        producer: &dyn TransactionalProducer,
        records: Vec<ConsumedRecord>,
        tracker: &TaskTracker,
        now: DateTime<Utc>,
    ) -> BusResult<()> {
        for ((topic, partition), records) in group_by_partition(records) {
            let Some(first) = records.first() else {
                continue;
            };

            let before = self.checkpoints.get_mut(&topic, partition).clone();
            let reset = ConsumedPosition {
                topic: topic.clone(),
                partition,
                offset: self.committable_offset(&topic, partition, first.offset),
                metadata: before.metadata(),
            };
            let states: Vec<(String, CorrelationState)> = if topic == self.topics.trigger {
                self.triggers
                    .iter()
                    .map(|(name, t)| (name.clone(), t.correlator.snapshot()))
                    .collect()
            } else {
                Vec::new()
            };

            if before.init {
                session
                    .commit(&ConsumedPosition {
                        topic: topic.clone(),
                        partition,
                        offset: first.offset,
                        metadata: String::new(),
                    })
                    .await?;
                self.checkpoints.get_mut(&topic, partition).init = false;
            }

            let mut produced = Vec::new();
            let mut deferred = Vec::new();
            let mut next_offset = first.offset;

            for record in &records {
                let key = record.key.clone().unwrap_or_default();
                debug!(
                    topic = %record.topic,
                    key = %key,
                    partition = record.partition,
                    offset = record.offset,
                    "Received record"
                );

                if self.checkpoints.get_mut(&topic, partition).skip(&key, record.offset) {
                    info!(
                        trigger = %key,
                        offset = record.offset,
                        checkpoint = ?self.checkpoints.get(&topic, partition).and_then(|c| c.offset(&key)),
                        "Skipping record already handled for trigger"
                    );
                    next_offset = self.committable_offset(&topic, partition, record.offset + 1);
                    continue;
                }

                let output = self.handle(record, now).await;
                if topic == self.topics.trigger && !output.records.is_empty() {
                    self.checkpoints
                        .get_mut(&topic, partition)
                        .set(&key, record.offset + 1);
                }
                produced.extend(output.records);
                deferred.extend(output.deferred);
                next_offset = output.next_offset;
            }

            let commit = BatchCommit {
                records: produced,
                position: ConsumedPosition {
                    topic: topic.clone(),
                    partition,
                    offset: next_offset,
                    metadata: self.checkpoints.get_mut(&topic, partition).metadata(),
                },
                reset,
            };

            match commit_batch(producer, session, &commit).await? {
                CommitOutcome::Committed => {
                    for action in deferred {
                        tracker.spawn(action.run());
                    }
                }
                CommitOutcome::Rewound => {
                    let mut restored = before;
                    restored.init = false;
                    self.checkpoints.insert(&topic, partition, restored);
                    if topic == self.topics.event {
                        self.forget_events(&records);
                    }
                    for (name, state) in states {
                        if let Some(trigger) = self.triggers.get_mut(&name) {
                            trigger.correlator.rollback(state);
                        }
                    }
                    warn!(
                        topic = %topic,
                        partition = partition,
                        dropped_actions = deferred.len(),
                        "Batch rewound, it will be consumed again"
                    );
                }
            }
        }
        Ok(())
    }

    /// Forget the IDs of rewound events so their replay is not dropped as
    /// duplicates
    fn forget_events(&mut self, records: &[ConsumedRecord]) {
        for record in records {
            let Ok(event) = decode_event(&record.value) else {
                continue;
            };
            for trigger in self.triggers.values_mut() {
                trigger.correlator.forget_message(&event.id);
            }
        }
    }
}

fn group_by_partition(records: Vec<ConsumedRecord>) -> Vec<((String, i32), Vec<ConsumedRecord>)> {
    let mut groups: Vec<((String, i32), Vec<ConsumedRecord>)> = Vec::new();
    for record in records {
        let key = (record.topic.clone(), record.partition);
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, group)) => group.push(record),
            None => groups.push((key, vec![record])),
        }
    }
    groups
}

/// Consume and commit batches until `stop` fires or the consumer stops
///
/// # Errors
///
/// Returns `BusError::Fatal` when the client can no longer make progress.
pub async fn run_consumer(
    core: &mut KafkaSensorCore,
    session: &mut dyn KafkaConsumerSession,
    producer: &dyn TransactionalProducer,
    stop: CancellationToken,
) -> BusResult<()> {
    let tracker = TaskTracker::new();
    let mut errors = RateLimitedLog::new(FETCH_ERROR_LOG_INTERVAL);
    info!(topics = ?core.topics().list(), "Starting Kafka consumer");

    let result = loop {
        let polled = tokio::select! {
            biased;
            _ = stop.cancelled() => break Ok(()),
            polled = session.next_batch() => polled,
        };

        let records = match polled {
            Ok(Some(records)) => records,
            Ok(None) => {
                warn!("Kafka consumer stopped");
                break Ok(());
            }
            Err(e) if e.is_fatal() => break Err(e),
            Err(e) => {
                if errors.should_log(&e.to_string(), Instant::now()) {
                    error!(error = %e, error_id = "FETCH_FAILED", "Failed to poll Kafka");
                }
                tokio::select! {
                    _ = stop.cancelled() => break Ok(()),
                    _ = tokio::time::sleep(POLL_RETRY_DELAY) => continue,
                }
            }
        };

        match session.assignment_changed().await {
            Ok(Some(partitions)) => core.on_assignment(partitions),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Failed to read partition assignment"),
        }

        let now = Utc::now();
        core.housekeeping(now).await;
        if records.is_empty() {
            continue;
        }

        if let Err(e) = core
            .process_batch(session, producer, records, &tracker, now)
            .await
        {
            if e.is_fatal() {
                break Err(e);
            }
            error!(error = %e, error_id = "KAFKA_BATCH_FAILED", "Failed to process batch");
        }
    };

    tracker.close();
    tracker.wait().await;
    info!("Exiting Kafka consumer");
    result
}

/// Kafka sensor driver
///
/// Triggers register with the shared consumer as they subscribe; consuming
/// starts once every trigger of the sensor is registered.
pub struct KafkaSensor {
    shared: Arc<KafkaShared>,
}

struct KafkaShared {
    topics: KafkaTopics,
    expected_triggers: usize,
    default_at_least_once: bool,
    correlation: CorrelationConfig,
    factory: Box<dyn KafkaClientFactory>,
    clients: Mutex<Option<(Box<dyn KafkaConsumerSession>, Arc<dyn TransactionalProducer>)>>,
    registrations: Mutex<Vec<(String, TriggerRegistration)>>,
    started: AtomicBool,
    stop: CancellationToken,
    done: watch::Sender<Option<Result<(), String>>>,
}

impl KafkaSensor {
    /// Create the driver
    ///
    /// # Arguments
    ///
    /// * `topics` - Sensor topics
    /// * `expected_triggers` - Number of triggers that must subscribe before consuming
    /// * `default_at_least_once` - Run actions before commit for every trigger
    /// * `correlation` - Failsafe and de-duplication timing
    /// * `factory` - Creates the consumer and producer on initialize
    pub fn new(
        topics: KafkaTopics,
        expected_triggers: usize,
        default_at_least_once: bool,
        correlation: CorrelationConfig,
        factory: Box<dyn KafkaClientFactory>,
    ) -> Self {
        let (done, _) = watch::channel(None);
        Self {
            shared: Arc::new(KafkaShared {
                topics,
                expected_triggers,
                default_at_least_once,
                correlation,
                factory,
                clients: Mutex::new(None),
                registrations: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
                stop: CancellationToken::new(),
                done,
            }),
        }
    }
}

#[async_trait]
impl SensorDriver for KafkaSensor {
    async fn initialize(&mut self) -> BusResult<()> {
        let clients = self.shared.factory.connect()?;
        *self.shared.clients.lock().await = Some(clients);
        info!(topics = ?self.shared.topics.list(), "Initialized Kafka clients");
        Ok(())
    }

    async fn connect(
        &self,
        trigger_name: &str,
        expression: &str,
        dependencies: &[Dependency],
        at_least_once: bool,
    ) -> BusResult<Box<dyn TriggerConnection>> {
        Correlator::new(trigger_name, expression, dependencies, self.shared.correlation)?;
        Ok(Box::new(KafkaTriggerConnection {
            shared: self.shared.clone(),
            trigger_name: trigger_name.to_string(),
            expression: expression.to_string(),
            dependencies: dependencies.to_vec(),
            at_least_once: at_least_once || self.shared.default_at_least_once,
        }))
    }
}

impl KafkaShared {
    /// Add a trigger and start consuming when it is the last one expected
    async fn register(self: &Arc<Self>, name: String, registration: TriggerRegistration) -> BusResult<()> {
        let mut registrations = self.registrations.lock().await;
        if self.stop.is_cancelled() {
            return Err(BusError::setup("kafka consumer already stopped"));
        }
        if registrations.iter().any(|(registered, _)| registered == &name) {
            return Err(BusError::setup(format!("trigger {} already subscribed", name)));
        }

        let complete = registrations.len() + 1 >= self.expected_triggers;
        let clients = if complete {
            let clients = self.clients.lock().await.take();
            if clients.is_none() {
                return Err(BusError::setup("kafka sensor not initialized"));
            }
            clients
        } else {
            None
        };

        registrations.push((name, registration));
        info!(
            registered = registrations.len(),
            expected = self.expected_triggers,
            "Trigger registered with Kafka consumer"
        );

        let Some((mut session, producer)) = clients else {
            return Ok(());
        };

        let mut core = KafkaSensorCore::new(self.topics.clone());
        for (name, registration) in registrations.drain(..) {
            core.register(name, registration);
        }
        self.started.store(true, Ordering::SeqCst);

        let shared = self.clone();
        tokio::spawn(async move {
            let result = run_consumer(
                &mut core,
                session.as_mut(),
                producer.as_ref(),
                shared.stop.clone(),
            )
            .await;
            if let Err(e) = &result {
                error!(error = %e, error_id = "KAFKA_CONSUMER_FAILED", "Kafka consumer failed");
            }
            shared.done.send_replace(Some(result.map_err(|e| e.to_string())));
        });
        Ok(())
    }

    async fn wait_done(&self) -> BusResult<()> {
        let mut done = self.done.subscribe();
        let result = match done.wait_for(Option::is_some).await {
            Ok(result) => result.clone(),
            Err(_) => None,
        };
        result.map_or(Ok(()), |r| r.map_err(BusError::fatal))
    }
}

/// Trigger connection of the shared Kafka consumer
pub struct KafkaTriggerConnection {
    shared: Arc<KafkaShared>,
    trigger_name: String,
    expression: String,
    dependencies: Vec<Dependency>,
    at_least_once: bool,
}

#[async_trait]
impl TriggerConnection for KafkaTriggerConnection {
    fn trigger_name(&self) -> &str {
        &self.trigger_name
    }

    async fn subscribe(&self, request: SubscribeRequest) -> BusResult<()> {
        let SubscribeRequest {
            cancel,
            close,
            reset_conditions,
            last_reset_time,
            handler,
            ..
        } = request;

        let mut correlator = Correlator::new(
            self.trigger_name.clone(),
            &self.expression,
            &self.dependencies,
            self.shared.correlation,
        )?;
        correlator.set_last_reset_time(last_reset_time);

        self.shared
            .register(
                self.trigger_name.clone(),
                TriggerRegistration {
                    correlator,
                    handler,
                    at_least_once: self.at_least_once,
                    reset_requests: reset_conditions,
                },
            )
            .await?;

        tokio::select! {
            _ = cancel.cancelled() => info!(trigger = %self.trigger_name, "Subscription cancelled"),
            _ = close.cancelled() => info!(trigger = %self.trigger_name, "Subscription closed"),
            result = self.shared.wait_done() => return result,
        }

        self.shared.stop.cancel();
        if self.shared.started.load(Ordering::SeqCst) {
            self.shared.wait_done().await
        } else {
            Ok(())
        }
    }

    fn is_closed(&self) -> bool {
        self.shared.stop.is_cancelled()
    }

    async fn close(&self) -> BusResult<()> {
        self.shared.stop.cancel();
        Ok(())
    }
}

/// Build the Kafka driver of a sensor
///
/// # Errors
///
/// Returns `BusError::Setup` when the binary was built without the `kafka`
/// feature.
pub fn sensor_driver(
    config: &KafkaBusConfig,
    spec: SensorSpec,
    correlation: CorrelationConfig,
) -> BusResult<Box<dyn SensorDriver>> {
    let topics = KafkaTopics::new(&config.topic, &spec.name);

    #[cfg(feature = "kafka")]
    {
        let factory = client::RdKafkaFactory::new(config.clone(), topics.clone());
        Ok(Box::new(KafkaSensor::new(
            topics,
            spec.triggers.len(),
            config.at_least_once,
            correlation,
            Box::new(factory),
        )))
    }

    #[cfg(not(feature = "kafka"))]
    {
        let _ = (spec, correlation);
        Err(BusError::setup(format!(
            "kafka support is not compiled in (topics {:?}); rebuild with the `kafka` feature",
            topics.list()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::CorrelationConfig;
    use chrono::TimeZone;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingHandler {
        actions: StdMutex<Vec<HashMap<String, Event>>>,
        failing_transforms: StdMutex<u32>,
    }

    #[async_trait]
    impl TriggerHandler for RecordingHandler {
        fn transform(&self, _dependency: &str, event: Event) -> anyhow::Result<Event> {
            let mut failing = self.failing_transforms.lock().unwrap();
            if *failing > 0 {
                *failing -= 1;
                anyhow::bail!("transform unavailable");
            }
            Ok(event)
        }

        fn filter(&self, _dependency: &str, _event: &Event) -> bool {
            true
        }

        async fn action(&self, events: HashMap<String, Event>) {
            self.actions.lock().unwrap().push(events);
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn topics() -> KafkaTopics {
        KafkaTopics::new("argo-events", "sensor")
    }

    fn core_with(expression: &str, at_least_once: bool) -> (KafkaSensorCore, Arc<RecordingHandler>) {
        let deps = vec![
            Dependency::new("a", "webhook", "a"),
            Dependency::new("b", "webhook", "b"),
        ];
        let handler = Arc::new(RecordingHandler::default());
        let (_reset_tx, reset_rx) = mpsc::channel(1);
        let mut core = KafkaSensorCore::new(topics());
        core.register(
            "t1".to_string(),
            TriggerRegistration {
                correlator: Correlator::new("t1", expression, &deps, CorrelationConfig::default())
                    .unwrap(),
                handler: handler.clone(),
                at_least_once,
                reset_requests: reset_rx,
            },
        );
        (core, handler)
    }

    fn event_record(offset: i64, id: &str, subject: &str) -> ConsumedRecord {
        ConsumedRecord {
            topic: "argo-events".to_string(),
            partition: 0,
            offset,
            key: None,
            value: serde_json::to_vec(&Event::new(id, "webhook", subject)).unwrap(),
            timestamp: at(10),
        }
    }

    fn as_consumed(record: &ProducedRecord, partition: i32, offset: i64) -> ConsumedRecord {
        ConsumedRecord {
            topic: record.topic.clone(),
            partition,
            offset,
            key: Some(record.key.clone()),
            value: record.value.clone(),
            timestamp: at(10),
        }
    }

    #[test]
    fn test_topics() {
        let topics = topics();
        assert_eq!(
            topics.list(),
            ["argo-events", "argo-events-sensor-trigger", "argo-events-sensor-action"]
        );
    }

    #[tokio::test]
    async fn test_event_routed_to_trigger_topic() {
        let (mut core, _) = core_with("a && b", false);

        let output = core.handle(&event_record(3, "1", "a"), at(10)).await;

        assert_eq!(output.next_offset, 4);
        assert_eq!(output.records.len(), 1);
        assert_eq!(output.records[0].topic, "argo-events-sensor-trigger");
        assert_eq!(output.records[0].key, "t1");
        let record: TriggerRecord = serde_json::from_slice(&output.records[0].value).unwrap();
        assert_eq!(record.dependency, "a");
    }

    #[tokio::test]
    async fn test_one_and_done_routed_to_action_topic() {
        let (mut core, _) = core_with("a || b", false);

        let output = core.handle(&event_record(0, "1", "b"), at(10)).await;

        assert_eq!(output.records.len(), 1);
        assert_eq!(output.records[0].topic, "argo-events-sensor-action");
    }

    #[tokio::test]
    async fn test_unmatched_and_duplicate_events_produce_nothing() {
        let (mut core, _) = core_with("a && b", false);

        assert!(core.handle(&event_record(0, "1", "zzz"), at(10)).await.records.is_empty());
        assert_eq!(core.handle(&event_record(1, "2", "a"), at(10)).await.records.len(), 1);
        assert!(core.handle(&event_record(2, "2", "a"), at(11)).await.records.is_empty());
    }

    #[tokio::test]
    async fn test_redelivery_after_failed_transform_is_routed() {
        let (mut core, handler) = core_with("a && b", false);
        *handler.failing_transforms.lock().unwrap() = 1;

        assert!(core.handle(&event_record(0, "1", "a"), at(10)).await.records.is_empty());
        let output = core.handle(&event_record(1, "1", "a"), at(11)).await;

        assert_eq!(output.records.len(), 1);
        assert_eq!(output.records[0].topic, "argo-events-sensor-trigger");
    }

    #[tokio::test]
    async fn test_trigger_records_fire_and_hold_back_offset() {
        let (mut core, _) = core_with("a && b", false);
        let to_a = core.handle(&event_record(0, "1", "a"), at(10)).await.records.remove(0);
        let to_b = core.handle(&event_record(1, "2", "b"), at(10)).await.records.remove(0);

        let first = core.handle(&as_consumed(&to_a, 0, 5), at(10)).await;
        assert!(first.records.is_empty());
        assert_eq!(first.next_offset, 5);

        let second = core.handle(&as_consumed(&to_b, 0, 6), at(11)).await;
        assert_eq!(second.records.len(), 1);
        assert_eq!(second.records[0].topic, "argo-events-sensor-action");
        assert_eq!(second.next_offset, 7);

        let events: HashMap<String, Event> = serde_json::from_slice(&second.records[0].value).unwrap();
        assert_eq!(events["a"].id, "1");
        assert_eq!(events["b"].id, "2");
    }

    #[tokio::test]
    async fn test_action_deferred_unless_at_least_once() {
        let (mut core, handler) = core_with("a && b", false);
        let record = ProducedRecord {
            topic: topics().action,
            key: "t1".to_string(),
            value: serde_json::to_vec(&HashMap::from([(
                "a".to_string(),
                Event::new("1", "webhook", "a"),
            )]))
            .unwrap(),
        };

        let output = core.handle(&as_consumed(&record, 0, 0), at(10)).await;
        assert!(handler.actions.lock().unwrap().is_empty());
        output.deferred.unwrap().run().await;
        assert_eq!(handler.actions.lock().unwrap().len(), 1);

        let (mut core, handler) = core_with("a && b", true);
        let output = core.handle(&as_consumed(&record, 0, 0), at(10)).await;
        assert!(output.deferred.is_none());
        assert_eq!(handler.actions.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_assignment_resets_session_and_loads_checkpoints() {
        let (mut core, _) = core_with("a && b", false);
        let to_a = core.handle(&event_record(0, "1", "a"), at(10)).await.records.remove(0);
        core.handle(&as_consumed(&to_a, 0, 5), at(10)).await;
        assert!(!core.correlator("t1").unwrap().state().is_idle());

        core.on_assignment(vec![AssignedPartition {
            topic: topics().trigger,
            partition: 0,
            committed: Some(5),
            metadata: r#"{"t1":4}"#.to_string(),
        }]);

        assert!(core.correlator("t1").unwrap().state().is_idle());
        let checkpoint = core.checkpoints().get(&topics().trigger, 0).unwrap();
        assert!(checkpoint.skip("t1", 3));
        assert!(!checkpoint.init);
    }

    #[test]
    fn test_group_by_partition_preserves_order() {
        let mut records = vec![event_record(0, "1", "a"), event_record(1, "2", "a")];
        let mut other = event_record(0, "3", "a");
        other.partition = 1;
        records.insert(1, other);

        let groups = group_by_partition(records);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, ("argo-events".to_string(), 0));
        assert_eq!(
            groups[0].1.iter().map(|r| r.offset).collect::<Vec<_>>(),
            vec![0, 1]
        );
        assert_eq!(groups[1].0, ("argo-events".to_string(), 1));
    }
}
