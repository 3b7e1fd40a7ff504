//! librdkafka backed consumer session and transactional producer

use super::batch::{collect_batch, MAX_BATCH_SIZE, MAX_BATCH_WAIT};
use super::{
    AssignedPartition, ConsumedPosition, ConsumedRecord, KafkaClientFactory,
    KafkaConsumerSession, KafkaTopics, ProducedRecord, TransactionalProducer, TxnError,
};
use crate::error::{BusError, BusResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{Offset, TopicPartitionList};
use shared::KafkaBusConfig;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Timeout of blocking transaction and offset calls
const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Creates the librdkafka clients of a sensor
pub struct RdKafkaFactory {
    config: KafkaBusConfig,
    topics: KafkaTopics,
}

impl RdKafkaFactory {
    pub fn new(config: KafkaBusConfig, topics: KafkaTopics) -> Self {
        Self { config, topics }
    }

    fn transactional_id(&self) -> String {
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| format!("{}-{}", self.config.consumer_group, uuid::Uuid::new_v4()))
    }
}

impl KafkaClientFactory for RdKafkaFactory {
    fn connect(
        &self,
    ) -> BusResult<(Box<dyn KafkaConsumerSession>, Arc<dyn TransactionalProducer>)> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.config.brokers)
            .set("group.id", &self.config.consumer_group)
            .set("enable.auto.commit", "false")
            .set("isolation.level", "read_committed")
            .set(
                "auto.offset.reset",
                if self.config.start_oldest { "earliest" } else { "latest" },
            )
            .create()
            .map_err(|e| BusError::setup(format!("failed to create Kafka consumer: {}", e)))?;

        consumer.subscribe(&self.topics.list()).map_err(|e| {
            BusError::setup(format!(
                "failed to subscribe to {:?}, ensure the topics exist or auto.create.topics.enable is set: {}",
                self.topics.list(),
                e
            ))
        })?;

        let transactional_id = self.transactional_id();
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &self.config.brokers)
            .set("transactional.id", &transactional_id)
            .set("enable.idempotence", "true")
            .create()
            .map_err(|e| BusError::setup(format!("failed to create Kafka producer: {}", e)))?;
        producer
            .init_transactions(CLIENT_TIMEOUT)
            .map_err(|e| BusError::setup(format!("failed to initialize transactions: {}", e)))?;

        info!(
            brokers = %self.config.brokers,
            group = %self.config.consumer_group,
            transactional_id = %transactional_id,
            "Created Kafka clients"
        );

        let consumer = Arc::new(consumer);
        Ok((
            Box::new(RdKafkaSession {
                consumer: consumer.clone(),
                assignment: None,
            }),
            Arc::new(RdKafkaProducer { producer, consumer }),
        ))
    }
}

fn position_list(position: &ConsumedPosition) -> Result<TopicPartitionList, KafkaError> {
    let mut list = TopicPartitionList::new();
    list.add_partition_offset(
        &position.topic,
        position.partition,
        Offset::Offset(position.offset),
    )?;
    if let Some(mut element) = list.find_partition(&position.topic, position.partition) {
        element.set_metadata(position.metadata.clone());
    }
    Ok(list)
}

struct RdKafkaSession {
    consumer: Arc<StreamConsumer>,
    assignment: Option<BTreeSet<(String, i32)>>,
}

#[async_trait]
impl KafkaConsumerSession for RdKafkaSession {
    async fn next_batch(&mut self) -> BusResult<Option<Vec<ConsumedRecord>>> {
        let mut stream = self.consumer.stream();
        let Some(batch) = collect_batch(&mut stream, MAX_BATCH_SIZE, MAX_BATCH_WAIT).await else {
            return Ok(None);
        };

        let mut records = Vec::with_capacity(batch.len());
        for message in batch {
            match message {
                Ok(message) => records.push(ConsumedRecord {
                    topic: message.topic().to_string(),
                    partition: message.partition(),
                    offset: message.offset(),
                    key: message.key().map(|k| String::from_utf8_lossy(k).into_owned()),
                    value: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                    timestamp: message
                        .timestamp()
                        .to_millis()
                        .and_then(DateTime::from_timestamp_millis)
                        .unwrap_or_else(Utc::now),
                }),
                Err(e) => warn!(error = %e, "Kafka consumer error"),
            }
        }
        Ok(Some(records))
    }

    async fn assignment_changed(&mut self) -> BusResult<Option<Vec<AssignedPartition>>> {
        let assignment = self
            .consumer
            .assignment()
            .map_err(|e| BusError::transport(e.to_string()))?;
        let current: BTreeSet<(String, i32)> = assignment
            .elements()
            .iter()
            .map(|e| (e.topic().to_string(), e.partition()))
            .collect();
        if self.assignment.as_ref() == Some(&current) {
            return Ok(None);
        }

        let committed = tokio::task::block_in_place(|| {
            self.consumer.committed_offsets(assignment, CLIENT_TIMEOUT)
        })
        .map_err(|e| BusError::transport(e.to_string()))?;

        let partitions = committed
            .elements()
            .iter()
            .map(|e| AssignedPartition {
                topic: e.topic().to_string(),
                partition: e.partition(),
                committed: match e.offset() {
                    Offset::Offset(offset) => Some(offset),
                    _ => None,
                },
                metadata: e.metadata().to_string(),
            })
            .collect();
        self.assignment = Some(current);
        Ok(Some(partitions))
    }

    async fn commit(&mut self, position: &ConsumedPosition) -> BusResult<()> {
        let list = position_list(position).map_err(|e| BusError::transport(e.to_string()))?;
        tokio::task::block_in_place(|| self.consumer.commit(&list, CommitMode::Sync))
            .map_err(|e| BusError::transport(e.to_string()))
    }

    async fn rewind(&mut self, position: &ConsumedPosition) -> BusResult<()> {
        tokio::task::block_in_place(|| {
            self.consumer.seek(
                &position.topic,
                position.partition,
                Offset::Offset(position.offset),
                CLIENT_TIMEOUT,
            )
        })
        .map_err(|e| BusError::transport(e.to_string()))?;
        self.commit(position).await
    }
}

struct RdKafkaProducer {
    producer: FutureProducer,
    consumer: Arc<StreamConsumer>,
}

fn classify(error: KafkaError) -> TxnError {
    match &error {
        KafkaError::Transaction(rd) if rd.is_fatal() => TxnError::fatal(error.to_string()),
        KafkaError::Transaction(rd) if rd.txn_requires_abort() => TxnError::abortable(error.to_string()),
        KafkaError::Transaction(rd) if rd.is_retriable() => TxnError::retryable(error.to_string()),
        _ => TxnError::abortable(error.to_string()),
    }
}

#[async_trait]
impl TransactionalProducer for RdKafkaProducer {
    async fn begin(&self) -> Result<(), TxnError> {
        self.producer.begin_transaction().map_err(classify)
    }

    async fn send(&self, record: &ProducedRecord) -> Result<(), TxnError> {
        self.producer
            .send(
                FutureRecord::to(&record.topic)
                    .key(record.key.as_str())
                    .payload(record.value.as_slice()),
                Duration::ZERO,
            )
            .await
            .map(|_| ())
            .map_err(|(e, _)| classify(e))
    }

    async fn send_offsets(&self, position: &ConsumedPosition) -> Result<(), TxnError> {
        let list = position_list(position).map_err(classify)?;
        let metadata = self
            .consumer
            .group_metadata()
            .ok_or_else(|| TxnError::fatal("consumer group metadata unavailable"))?;
        tokio::task::block_in_place(|| {
            self.producer
                .send_offsets_to_transaction(&list, &metadata, CLIENT_TIMEOUT)
        })
        .map_err(classify)
    }

    async fn commit(&self) -> Result<(), TxnError> {
        tokio::task::block_in_place(|| self.producer.commit_transaction(CLIENT_TIMEOUT))
            .map_err(classify)
    }

    async fn abort(&self) -> Result<(), TxnError> {
        tokio::task::block_in_place(|| self.producer.abort_transaction(CLIENT_TIMEOUT))
            .map_err(classify)
    }
}
