//! Batch transactions
//!
//! Every batch consumed from one partition is committed in a single
//! transaction: produced records and the consumed offset (with checkpoint
//! metadata) become visible together or not at all.
//!
//! Error handling follows the transactional producer's classification:
//!
//! - retryable: the failing step is retried, at most `MAX_STEP_RETRIES` times
//! - abortable: the transaction is aborted and the consumer rewound to the
//!   first offset of the batch with the previous checkpoint metadata
//! - fatal: the consumer is rewound and `BusError::Fatal` is returned; the
//!   producer cannot be used again

use super::{ConsumedPosition, KafkaConsumerSession, ProducedRecord};
use crate::error::{BusError, BusResult};
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Attempts of a retryable step before the transaction is aborted
pub const MAX_STEP_RETRIES: u32 = 10;

/// Pause between attempts of a retryable step
const STEP_RETRY_DELAY: Duration = Duration::from_millis(100);

/// How a transactional producer error must be handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnErrorKind {
    Retryable,
    Abortable,
    Fatal,
}

/// Error of one transaction step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnError {
    pub kind: TxnErrorKind,
    pub message: String,
}

impl TxnError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: TxnErrorKind::Retryable,
            message: message.into(),
        }
    }

    pub fn abortable(message: impl Into<String>) -> Self {
        Self {
            kind: TxnErrorKind::Abortable,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: TxnErrorKind::Fatal,
            message: message.into(),
        }
    }
}

impl fmt::Display for TxnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} transaction error: {}", self.kind, self.message)
    }
}

impl std::error::Error for TxnError {}

/// Transactional producer bound to the sensor's consumer group
#[async_trait]
pub trait TransactionalProducer: Send + Sync {
    async fn begin(&self) -> Result<(), TxnError>;

    async fn send(&self, record: &ProducedRecord) -> Result<(), TxnError>;

    /// Add the consumed position to the transaction
    async fn send_offsets(&self, position: &ConsumedPosition) -> Result<(), TxnError>;

    async fn commit(&self) -> Result<(), TxnError>;

    async fn abort(&self) -> Result<(), TxnError>;
}

/// Work of one partition batch
#[derive(Debug, Clone, PartialEq)]
pub struct BatchCommit {
    /// Records to produce atomically with the offset
    pub records: Vec<ProducedRecord>,
    /// Next offset to consume, with the new checkpoint metadata
    pub position: ConsumedPosition,
    /// First offset of the batch, with the checkpoint metadata before it
    pub reset: ConsumedPosition,
}

/// What happened to a batch commit that did not fail fatally
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// The batch will be consumed again from its first offset
    Rewound,
}

/// Commit a batch
///
/// Without records only the offset is committed.
///
/// # Errors
///
/// Returns `BusError::Fatal` when the producer reports a fatal error, and
/// the session's error when a plain offset commit or rewind fails.
pub async fn commit_batch(
    producer: &dyn TransactionalProducer,
    session: &mut dyn KafkaConsumerSession,
    batch: &BatchCommit,
) -> BusResult<CommitOutcome> {
    if batch.records.is_empty() {
        session.commit(&batch.position).await?;
        return Ok(CommitOutcome::Committed);
    }

    let result = run_transaction(producer, batch).await;
    let Err(txn_error) = result else {
        debug!(
            topic = %batch.position.topic,
            partition = batch.position.partition,
            offset = batch.position.offset,
            records = batch.records.len(),
            "Committed transaction"
        );
        return Ok(CommitOutcome::Committed);
    };

    match txn_error.kind {
        TxnErrorKind::Fatal => {
            error!(
                topic = %batch.position.topic,
                partition = batch.position.partition,
                error = %txn_error,
                error_id = "KAFKA_TRANSACTION_FATAL",
                "Fatal transaction error, rewinding consumer"
            );
            if let Err(e) = session.rewind(&batch.reset).await {
                warn!(error = %e, "Failed to rewind consumer after fatal transaction error");
            }
            Err(BusError::fatal(txn_error.to_string()))
        }
        TxnErrorKind::Abortable | TxnErrorKind::Retryable => {
            warn!(
                topic = %batch.position.topic,
                partition = batch.position.partition,
                reset_offset = batch.reset.offset,
                error = %txn_error,
                error_id = "KAFKA_TRANSACTION_ABORTED",
                "Aborting transaction and rewinding consumer"
            );
            if let Err(e) = with_retries("abort", || producer.abort()).await {
                if e.kind == TxnErrorKind::Fatal {
                    session.rewind(&batch.reset).await?;
                    return Err(BusError::fatal(e.to_string()));
                }
                warn!(error = %e, "Failed to abort transaction");
            }
            session.rewind(&batch.reset).await?;
            Ok(CommitOutcome::Rewound)
        }
    }
}

async fn run_transaction(
    producer: &dyn TransactionalProducer,
    batch: &BatchCommit,
) -> Result<(), TxnError> {
    with_retries("begin", || producer.begin()).await?;
    for record in &batch.records {
        with_retries("send", || producer.send(record)).await?;
    }
    with_retries("send_offsets", || producer.send_offsets(&batch.position)).await?;
    with_retries("commit", || producer.commit()).await
}

async fn with_retries<F, Fut>(step: &str, mut attempt: F) -> Result<(), TxnError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), TxnError>>,
{
    let mut retries = 0;
    loop {
        match attempt().await {
            Err(e) if e.kind == TxnErrorKind::Retryable && retries < MAX_STEP_RETRIES => {
                retries += 1;
                debug!(step = %step, retries = retries, error = %e, "Retrying transaction step");
                tokio::time::sleep(STEP_RETRY_DELAY).await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::kafka::{AssignedPartition, ConsumedRecord};
    use mockall::mock;
    use mockall::Sequence;
    use std::sync::{Arc, Mutex};

    mock! {
        pub Producer {}

        #[async_trait]
        impl TransactionalProducer for Producer {
            async fn begin(&self) -> Result<(), TxnError>;
            async fn send(&self, record: &ProducedRecord) -> Result<(), TxnError>;
            async fn send_offsets(&self, position: &ConsumedPosition) -> Result<(), TxnError>;
            async fn commit(&self) -> Result<(), TxnError>;
            async fn abort(&self) -> Result<(), TxnError>;
        }
    }

    #[derive(Default)]
    struct RecordingSession {
        commits: Arc<Mutex<Vec<ConsumedPosition>>>,
        rewinds: Arc<Mutex<Vec<ConsumedPosition>>>,
    }

    #[async_trait]
    impl KafkaConsumerSession for RecordingSession {
        async fn next_batch(&mut self) -> BusResult<Option<Vec<ConsumedRecord>>> {
            Ok(None)
        }

        async fn assignment_changed(&mut self) -> BusResult<Option<Vec<AssignedPartition>>> {
            Ok(None)
        }

        async fn commit(&mut self, position: &ConsumedPosition) -> BusResult<()> {
            self.commits.lock().unwrap().push(position.clone());
            Ok(())
        }

        async fn rewind(&mut self, position: &ConsumedPosition) -> BusResult<()> {
            self.rewinds.lock().unwrap().push(position.clone());
            Ok(())
        }
    }

    fn position(offset: i64, metadata: &str) -> ConsumedPosition {
        ConsumedPosition {
            topic: "argo-events-sensor-trigger".to_string(),
            partition: 0,
            offset,
            metadata: metadata.to_string(),
        }
    }

    fn batch(records: usize) -> BatchCommit {
        BatchCommit {
            records: (0..records)
                .map(|i| ProducedRecord {
                    topic: "argo-events-sensor-action".to_string(),
                    key: "t1".to_string(),
                    value: format!("{}", i).into_bytes(),
                })
                .collect(),
            position: position(12, r#"{"t1":12}"#),
            reset: position(10, ""),
        }
    }

    #[tokio::test]
    async fn test_empty_batch_commits_offset_only() {
        let producer = MockProducer::new();
        let mut session = RecordingSession::default();

        let outcome = commit_batch(&producer, &mut session, &batch(0)).await.unwrap();

        assert_eq!(outcome, CommitOutcome::Committed);
        assert_eq!(session.commits.lock().unwrap().clone(), vec![position(12, r#"{"t1":12}"#)]);
    }

    #[tokio::test]
    async fn test_transaction_steps_in_order() {
        let mut producer = MockProducer::new();
        let mut seq = Sequence::new();
        producer.expect_begin().times(1).in_sequence(&mut seq).returning(|| Ok(()));
        producer.expect_send().times(2).in_sequence(&mut seq).returning(|_| Ok(()));
        producer
            .expect_send_offsets()
            .withf(|p| p.offset == 12 && p.metadata == r#"{"t1":12}"#)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        producer.expect_commit().times(1).in_sequence(&mut seq).returning(|| Ok(()));
        producer.expect_abort().never();
        let mut session = RecordingSession::default();

        let outcome = commit_batch(&producer, &mut session, &batch(2)).await.unwrap();

        assert_eq!(outcome, CommitOutcome::Committed);
        assert!(session.commits.lock().unwrap().is_empty());
        assert!(session.rewinds.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_step_is_retried() {
        let mut producer = MockProducer::new();
        let attempts = Arc::new(Mutex::new(0));
        let counter = attempts.clone();
        producer.expect_begin().returning(|| Ok(()));
        producer.expect_send().returning(|_| Ok(()));
        producer.expect_send_offsets().returning(|_| Ok(()));
        producer.expect_commit().times(3).returning(move || {
            let mut attempts = counter.lock().unwrap();
            *attempts += 1;
            if *attempts < 3 {
                Err(TxnError::retryable("coordinator loading"))
            } else {
                Ok(())
            }
        });
        let mut session = RecordingSession::default();

        let outcome = commit_batch(&producer, &mut session, &batch(1)).await.unwrap();

        assert_eq!(outcome, CommitOutcome::Committed);
        assert_eq!(*attempts.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_abortable_error_aborts_and_rewinds() {
        let mut producer = MockProducer::new();
        producer.expect_begin().returning(|| Ok(()));
        producer
            .expect_send()
            .returning(|_| Err(TxnError::abortable("producer fenced by timeout")));
        producer.expect_send_offsets().never();
        producer.expect_commit().never();
        producer.expect_abort().times(1).returning(|| Ok(()));
        let mut session = RecordingSession::default();

        let outcome = commit_batch(&producer, &mut session, &batch(1)).await.unwrap();

        assert_eq!(outcome, CommitOutcome::Rewound);
        assert_eq!(session.rewinds.lock().unwrap().clone(), vec![position(10, "")]);
    }

    #[tokio::test]
    async fn test_fatal_error_rewinds_and_fails() {
        let mut producer = MockProducer::new();
        producer
            .expect_begin()
            .returning(|| Err(TxnError::fatal("producer fenced")));
        producer.expect_abort().never();
        let mut session = RecordingSession::default();

        let result = commit_batch(&producer, &mut session, &batch(1)).await;

        assert!(matches!(result, Err(BusError::Fatal(_))));
        assert_eq!(session.rewinds.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_aborts() {
        let mut producer = MockProducer::new();
        producer
            .expect_begin()
            .times(MAX_STEP_RETRIES as usize + 1)
            .returning(|| Err(TxnError::retryable("timed out")));
        producer.expect_abort().times(1).returning(|| Ok(()));
        let mut session = RecordingSession::default();

        let outcome = commit_batch(&producer, &mut session, &batch(1)).await.unwrap();

        assert_eq!(outcome, CommitOutcome::Rewound);
    }
}
