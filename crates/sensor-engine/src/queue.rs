//! Trigger job queue
//!
//! Fired triggers are handed to the trigger workers as [`TriggerJob`]s on a
//! Redis list.
//!
//! # Queue Overflow Protection
//!
//! Queue depth is checked before every enqueue. Above `MAX_QUEUE_DEPTH` a
//! warning is logged; at `CRITICAL_QUEUE_DEPTH` the job is rejected so Redis
//! memory stays bounded while the workers catch up.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use shared::{TriggerJob, TRIGGER_JOBS_QUEUE};

/// Queue depth above which warnings are logged
const MAX_QUEUE_DEPTH: usize = 10_000;

/// Queue depth at which new jobs are rejected (backpressure)
const CRITICAL_QUEUE_DEPTH: usize = 50_000;

/// Abstract job queue interface for testability
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a job for processing
    ///
    /// # Arguments
    ///
    /// * `job` - The trigger job to enqueue
    async fn enqueue(&self, job: &TriggerJob) -> Result<()>;
}

/// Redis-backed job queue implementation
#[derive(Clone)]
pub struct RedisJobQueue {
    conn: ConnectionManager,
}

impl RedisJobQueue {
    /// Create a new Redis job queue
    ///
    /// # Arguments
    ///
    /// * `conn` - Managed Redis connection
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, job: &TriggerJob) -> Result<()> {
        let mut conn = self.conn.clone();
        let queue_depth: usize = conn
            .llen(TRIGGER_JOBS_QUEUE)
            .await
            .context("Failed to get queue depth from Redis")?;

        if queue_depth >= CRITICAL_QUEUE_DEPTH {
            tracing::error!(
                queue_depth = queue_depth,
                critical_threshold = CRITICAL_QUEUE_DEPTH,
                job_id = %job.id,
                trigger = %job.trigger,
                error_id = "QUEUE_CRITICAL_DEPTH",
                "CRITICAL: Redis queue at critical depth, rejecting new job (backpressure)"
            );

            #[cfg(feature = "metrics")]
            metrics::counter!("sensor_engine.queue_rejections").increment(1);

            bail!(
                "Redis queue depth {} exceeds critical threshold {} - rejecting job to prevent memory exhaustion",
                queue_depth,
                CRITICAL_QUEUE_DEPTH
            );
        }

        if queue_depth >= MAX_QUEUE_DEPTH {
            tracing::warn!(
                queue_depth = queue_depth,
                max_threshold = MAX_QUEUE_DEPTH,
                job_id = %job.id,
                trigger = %job.trigger,
                error_id = "QUEUE_HIGH_DEPTH",
                "Redis queue depth exceeds threshold - trigger workers may be falling behind"
            );

            #[cfg(feature = "metrics")]
            metrics::gauge!("sensor_engine.queue_depth_high").set(1.0);
        }

        let job_json = serde_json::to_string(job).context("Failed to serialize trigger job")?;

        // LPUSH + BRPOP on the worker side keeps FIFO order
        conn.lpush::<_, _, ()>(TRIGGER_JOBS_QUEUE, &job_json)
            .await
            .context("Failed to enqueue trigger job to Redis")?;

        #[cfg(feature = "metrics")]
        metrics::gauge!("sensor_engine.queue_depth").set(queue_depth as f64);

        tracing::debug!(
            job_id = %job.id,
            sensor = %job.sensor,
            trigger = %job.trigger,
            events = ?job.event_ids(),
            queue_depth = queue_depth,
            "Enqueued trigger job"
        );

        Ok(())
    }
}
