//! Sensor supervisor
//!
//! Connects every trigger of a sensor to the event bus and keeps the
//! subscriptions alive until shutdown. Transient subscription failures are
//! retried with exponential backoff; fatal bus errors stop the sensor so the
//! process can restart with a fresh client.

use crate::bus::{SensorDriver, SubscribeRequest, TriggerConnection, TriggerHandler};
use crate::error::BusResult;
use crate::expr::{BoolMinifier, DependencyExpression};
use crate::queue::JobQueue;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{Event, SensorSpec, TriggerJob};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Consecutive subscription failures after which errors are escalated
const MAX_CONSECUTIVE_ERRORS: u32 = 10;

/// Upper bound of the reconnect backoff in seconds
const MAX_BACKOFF_SECS: u64 = 60;

/// Trigger handler that enqueues a [`TriggerJob`] per fired trigger
pub struct JobQueueHandler {
    sensor: String,
    trigger: String,
    queue: Arc<dyn JobQueue>,
}

impl JobQueueHandler {
    pub fn new(sensor: impl Into<String>, trigger: impl Into<String>, queue: Arc<dyn JobQueue>) -> Self {
        Self {
            sensor: sensor.into(),
            trigger: trigger.into(),
            queue,
        }
    }
}

#[async_trait]
impl TriggerHandler for JobQueueHandler {
    fn transform(&self, _dependency: &str, event: Event) -> anyhow::Result<Event> {
        Ok(event)
    }

    fn filter(&self, _dependency: &str, _event: &Event) -> bool {
        true
    }

    async fn action(&self, events: HashMap<String, Event>) {
        let job = TriggerJob::new(&self.sensor, &self.trigger, events);

        #[cfg(feature = "metrics")]
        metrics::counter!("sensor_engine.triggers_fired", "trigger" => self.trigger.clone())
            .increment(1);

        match self.queue.enqueue(&job).await {
            Ok(()) => info!(
                job_id = %job.id,
                trigger = %self.trigger,
                events = ?job.event_ids(),
                "Trigger fired"
            ),
            Err(e) => error!(
                job_id = %job.id,
                trigger = %self.trigger,
                error = %e,
                error_id = "TRIGGER_JOB_ENQUEUE_FAILED",
                "Failed to enqueue trigger job"
            ),
        }
    }
}

/// Backoff before the given retry: `min(2^n, 60)` seconds
pub fn reconnect_backoff(consecutive_errors: u32) -> Duration {
    let secs = 2u64
        .checked_pow(consecutive_errors)
        .map_or(MAX_BACKOFF_SECS, |s| s.min(MAX_BACKOFF_SECS));
    Duration::from_secs(secs)
}

/// Expression a trigger is connected with
///
/// The minified form replaces `expression` when it references fewer
/// dependencies, so a dependency absorbed by the others (`b` in
/// `a || (a && b)`) is never subscribed to. Expressions the minifier does
/// not accept, such as ones using `!`, are kept as they are.
pub fn subscription_expression(expression: &str) -> String {
    let Ok(minifier) = BoolMinifier::new(expression) else {
        return expression.to_string();
    };
    let minified = minifier.minify();
    if minified.is_empty() {
        return expression.to_string();
    }
    match BoolMinifier::new(&minified) {
        Ok(reduced) if reduced.variables().len() < minifier.variables().len() => minified,
        _ => expression.to_string(),
    }
}

/// Connect and run every trigger of `spec` until `cancel` fires
///
/// # Arguments
///
/// * `driver` - Initialized bus driver
/// * `spec` - Sensor spec
/// * `queue` - Destination of fired trigger jobs
/// * `default_subject` - Subject for buses with one shared subject
/// * `resets` - Each message resets the conditions of every trigger
/// * `cancel` - Shutdown signal
///
/// # Errors
///
/// Returns an error when a trigger cannot be connected or a subscription
/// fails with a non-retryable bus error.
pub async fn run_sensor(
    driver: Arc<dyn SensorDriver>,
    spec: &SensorSpec,
    queue: Arc<dyn JobQueue>,
    default_subject: Option<String>,
    resets: broadcast::Sender<()>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut tasks = JoinSet::new();

    for trigger in &spec.triggers {
        let configured = spec.trigger_expression(trigger);
        DependencyExpression::parse(&configured)
            .with_context(|| format!("Invalid dependency expression of trigger {}", trigger.name))?;
        let expression = subscription_expression(&configured);
        if expression != configured {
            info!(
                trigger = %trigger.name,
                configured = %configured,
                minified = %expression,
                "Dependency expression minified, absorbed dependencies are not subscribed"
            );
        }
        let parsed = DependencyExpression::parse(&expression)
            .with_context(|| format!("Invalid dependency expression of trigger {}", trigger.name))?;
        let dependencies = spec
            .dependencies_for(parsed.variables())
            .with_context(|| format!("Unknown dependency in trigger {}", trigger.name))?;

        let connection = driver
            .connect(&trigger.name, &expression, &dependencies, trigger.at_least_once)
            .await
            .with_context(|| format!("Failed to connect trigger {}", trigger.name))?;

        info!(
            trigger = %trigger.name,
            expression = %expression,
            dependencies = dependencies.len(),
            "Connected trigger"
        );

        let handler: Arc<dyn TriggerHandler> =
            Arc::new(JobQueueHandler::new(&spec.name, &trigger.name, queue.clone()));
        tasks.spawn(run_trigger(
            connection,
            handler,
            default_subject.clone(),
            resets.subscribe(),
            cancel.clone(),
        ));
    }

    let mut outcome = Ok(());
    while let Some(joined) = tasks.join_next().await {
        let failure = match joined {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => anyhow::Error::new(e).context("Trigger subscription failed"),
            Err(e) => anyhow::anyhow!("Trigger task panicked: {}", e),
        };
        error!(error_id = "TRIGGER_SUBSCRIPTION_FAILED", "Stopping sensor: {:#}", failure);
        cancel.cancel();
        if outcome.is_ok() {
            outcome = Err(failure);
        }
    }
    outcome
}

/// Keep one trigger subscribed until shutdown
async fn run_trigger(
    connection: Box<dyn TriggerConnection>,
    handler: Arc<dyn TriggerHandler>,
    default_subject: Option<String>,
    mut resets: broadcast::Receiver<()>,
    cancel: CancellationToken,
) -> BusResult<()> {
    let trigger = connection.trigger_name().to_string();
    let mut last_reset_time: Option<DateTime<Utc>> = None;
    let mut consecutive_errors = 0u32;

    loop {
        let (mut request, reset_tx) = SubscribeRequest::new(cancel.clone(), handler.clone());
        request = request.with_last_reset_time(last_reset_time);
        if let Some(subject) = &default_subject {
            request = request.with_default_subject(subject.clone());
        }

        let subscription = connection.subscribe(request);
        tokio::pin!(subscription);
        let result = loop {
            tokio::select! {
                result = &mut subscription => break result,
                Ok(()) = resets.recv() => {
                    info!(trigger = %trigger, "Resetting trigger conditions");
                    last_reset_time = Some(Utc::now());
                    // A full channel already holds a pending reset
                    let _ = reset_tx.try_send(());
                }
            }
        };

        if cancel.is_cancelled() {
            info!(trigger = %trigger, "Trigger subscription stopped");
            return result;
        }

        let backoff = match result {
            Ok(()) => {
                warn!(trigger = %trigger, "Subscription ended unexpectedly, resubscribing");
                consecutive_errors = 0;
                reconnect_backoff(0)
            }
            Err(e) if e.is_retryable() => {
                consecutive_errors += 1;
                let backoff = reconnect_backoff(consecutive_errors);
                if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    error!(
                        trigger = %trigger,
                        error = %e,
                        consecutive_errors = consecutive_errors,
                        backoff_secs = backoff.as_secs(),
                        error_id = "SUBSCRIPTION_REPEATED_FAILURE",
                        "Subscription keeps failing"
                    );
                } else {
                    warn!(
                        trigger = %trigger,
                        error = %e,
                        consecutive_errors = consecutive_errors,
                        backoff_secs = backoff.as_secs(),
                        "Subscription failed, retrying"
                    );
                }
                backoff
            }
            Err(e) => {
                if !connection.is_closed() {
                    if let Err(close_error) = connection.close().await {
                        warn!(trigger = %trigger, error = %close_error, "Failed to close connection");
                    }
                }
                return Err(e);
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(backoff) => {}
        }
    }
}

/// Forward SIGHUP to the condition reset channel
#[cfg(unix)]
pub async fn forward_reset_signals(resets: broadcast::Sender<()>, cancel: CancellationToken) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup()).context("Failed to listen for SIGHUP")?;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            received = hangup.recv() => {
                if received.is_none() {
                    return Ok(());
                }
                info!("SIGHUP received, resetting trigger conditions");
                let _ = resets.send(());
            }
        }
    }
}

/// Condition resets by signal are only available on unix
#[cfg(not(unix))]
pub async fn forward_reset_signals(_resets: broadcast::Sender<()>, cancel: CancellationToken) -> Result<()> {
    cancel.cancelled().await;
    Ok(())
}
