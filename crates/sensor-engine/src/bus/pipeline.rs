//! Fetch loops feeding a single correlation task
//!
//! ```text
//! MessageSource ─┐
//! MessageSource ─┼─> mpsc (64) ─> DeliveryProcessor (one task, owns the Correlator)
//! MessageSource ─┘                   ^ reset requests, failsafe ticks
//! ```
//!
//! Producers only fetch and forward. All correlation state is owned by the
//! processor task, so it needs no locking. Shutdown cancels every task and
//! waits for them through a `TaskTracker` before the caller drops its
//! broker connection.

use super::{SubscribeRequest, TriggerHandler};
use crate::correlation::{Correlator, Disposition, MessageMeta};
use crate::error::{BusError, BusResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::Event;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Capacity of the channel between fetch loops and the correlation task
pub const INBOUND_CHANNEL_CAPACITY: usize = 64;

/// How often the correlation task checks the failsafe deadline while idle
pub const FAILSAFE_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Minimum spacing of repeated identical fetch error logs
pub const FETCH_ERROR_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Pause after a failed fetch before trying again
const FETCH_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Shortest cycle of an idle fetch loop when the source returns empty
/// fetches without waiting on the broker
pub const IDLE_FETCH_INTERVAL: Duration = Duration::from_millis(250);

/// Acknowledgement handle of one delivered message
#[async_trait]
pub trait Acker: Send + Sync {
    /// Final acknowledgement
    async fn ack(&self) -> BusResult<()>;

    /// Tell the broker the message is still being worked on
    async fn in_progress(&self) -> BusResult<()> {
        Ok(())
    }
}

/// A raw message handed from a fetch loop to the correlation task
pub struct Delivery {
    pub data: Vec<u8>,
    pub meta: MessageMeta,
    pub acker: Box<dyn Acker>,
}

/// Why a fetch returned no messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Nothing arrived before the fetch expired
    Timeout,
    /// The broker call failed
    Transport(String),
    /// The subscription is gone for good
    Closed,
}

/// Pull-style source of deliveries (one per broker subscription)
#[async_trait]
pub trait MessageSource: Send {
    /// Human readable name used in logs
    fn describe(&self) -> String;

    /// Fetch the next batch of messages
    async fn fetch(&mut self) -> Result<Vec<Delivery>, FetchError>;

    /// Release the broker subscription once the fetch loop exits
    async fn close(&mut self) {}
}

/// Owner of the correlation state, driven by the correlation task
#[async_trait]
pub trait DeliveryProcessor: Send {
    /// Correlate one delivery and acknowledge it as the bus requires
    async fn process(&mut self, delivery: Delivery);

    /// Apply an explicit reset request
    async fn reset_conditions(&mut self, now: DateTime<Utc>);

    /// Periodic housekeeping (failsafe deadline, cache eviction)
    async fn tick(&mut self, now: DateTime<Utc>);
}

/// Logs an error only when it differs from the previous one or the
/// previous log is older than the interval
#[derive(Debug)]
pub struct RateLimitedLog {
    interval: Duration,
    previous: Option<(String, Instant)>,
}

impl RateLimitedLog {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            previous: None,
        }
    }

    /// Whether `message` should be logged at `now`; records it when it should
    pub fn should_log(&mut self, message: &str, now: Instant) -> bool {
        let log = match &self.previous {
            Some((previous, logged_at)) => {
                previous != message || now.duration_since(*logged_at) > self.interval
            }
            None => true,
        };
        if log {
            self.previous = Some((message.to_string(), now));
        }
        log
    }
}

/// Decode a delivery payload into an event
pub fn decode_event(data: &[u8]) -> BusResult<Event> {
    Event::from_slice(data).map_err(|e| BusError::malformed(e.to_string()))
}

/// Forward fetched messages until `stop` fires or the receiver is gone
pub async fn run_fetch_loop(
    mut source: Box<dyn MessageSource>,
    tx: mpsc::Sender<Delivery>,
    stop: CancellationToken,
) {
    let name = source.describe();
    let mut errors = RateLimitedLog::new(FETCH_ERROR_LOG_INTERVAL);
    info!(source = %name, "Starting fetch loop");

    'fetch: loop {
        let started = tokio::time::Instant::now();
        let fetched = tokio::select! {
            _ = stop.cancelled() => break,
            fetched = source.fetch() => fetched,
        };

        match fetched {
            Ok(deliveries) => {
                for delivery in deliveries {
                    tokio::select! {
                        _ = stop.cancelled() => break 'fetch,
                        sent = tx.send(delivery) => {
                            if sent.is_err() {
                                debug!(source = %name, "Correlation task gone, exiting fetch loop");
                                break 'fetch;
                            }
                        }
                    }
                }
            }
            Err(FetchError::Timeout) => {
                let idle_until = started + IDLE_FETCH_INTERVAL;
                if tokio::time::Instant::now() < idle_until {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep_until(idle_until) => {}
                    }
                }
            }
            Err(FetchError::Closed) => {
                warn!(source = %name, "Subscription closed, exiting fetch loop");
                break;
            }
            Err(FetchError::Transport(message)) => {
                if errors.should_log(&message, Instant::now()) {
                    error!(
                        source = %name,
                        error = %message,
                        error_id = "FETCH_FAILED",
                        "Failed to fetch messages"
                    );
                }
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(FETCH_RETRY_DELAY) => {}
                }
            }
        }
    }

    source.close().await;
    info!(source = %name, "Exiting fetch loop");
}

/// Drive a processor from the inbound channel, reset requests and a
/// failsafe ticker until `stop` fires or every producer is gone
pub async fn run_correlation_loop<P: DeliveryProcessor>(
    mut processor: P,
    mut inbound: mpsc::Receiver<Delivery>,
    mut reset_requests: mpsc::Receiver<()>,
    stop: CancellationToken,
    tick_interval: Duration,
) {
    let mut ticker = tokio::time::interval(tick_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut resets_open = true;

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            reset = reset_requests.recv(), if resets_open => match reset {
                Some(()) => processor.reset_conditions(Utc::now()).await,
                None => resets_open = false,
            },
            delivery = inbound.recv() => match delivery {
                Some(delivery) => processor.process(delivery).await,
                None => {
                    warn!("All fetch loops exited, stopping correlation task");
                    break;
                }
            },
            _ = ticker.tick() => processor.tick(Utc::now()).await,
        }
    }

    info!("Exiting correlation task");
}

/// Run fetch loops and the correlation task until the request is
/// cancelled or closed, then wait for every task to finish
pub async fn run_pipeline<P>(
    sources: Vec<Box<dyn MessageSource>>,
    processor: P,
    request: SubscribeRequest,
) -> BusResult<()>
where
    P: DeliveryProcessor + 'static,
{
    let SubscribeRequest {
        cancel,
        close,
        reset_conditions,
        ..
    } = request;

    let (tx, rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
    let stop = CancellationToken::new();
    let tracker = TaskTracker::new();

    for source in sources {
        tracker.spawn(run_fetch_loop(source, tx.clone(), stop.clone()));
    }
    drop(tx);

    tracker.spawn(run_correlation_loop(
        processor,
        rx,
        reset_conditions,
        stop.clone(),
        FAILSAFE_CHECK_INTERVAL,
    ));
    tracker.close();

    tokio::select! {
        _ = cancel.cancelled() => info!("Subscription cancelled, shutting down"),
        _ = close.cancelled() => info!("Subscription closed, shutting down"),
        _ = tracker.wait() => warn!("Subscription tasks exited on their own"),
    }

    stop.cancel();
    tracker.wait().await;
    Ok(())
}

/// Processor for buses where every message is acknowledged once processed
///
/// While a message is being correlated an in-progress notification is sent
/// every `progress_interval`.
pub struct AckingProcessor {
    correlator: Correlator,
    handler: Arc<dyn TriggerHandler>,
    progress_interval: Duration,
}

impl AckingProcessor {
    pub fn new(
        correlator: Correlator,
        handler: Arc<dyn TriggerHandler>,
        progress_interval: Duration,
    ) -> Self {
        Self {
            correlator,
            handler,
            progress_interval,
        }
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }
}

#[async_trait]
impl DeliveryProcessor for AckingProcessor {
    async fn process(&mut self, delivery: Delivery) {
        let Delivery { data, meta, acker } = delivery;
        let trigger = self.correlator.trigger_name().to_string();

        match decode_event(&data) {
            Err(e) => {
                error!(
                    trigger = %trigger,
                    stream_sequence = meta.stream_sequence,
                    error = %e,
                    error_id = "MALFORMED_MESSAGE",
                    "Dropping undecodable message"
                );
            }
            Ok(event) => {
                let event_id = event.id.clone();
                let work = self
                    .correlator
                    .handle(event, meta, self.handler.as_ref(), Utc::now());
                tokio::pin!(work);

                let mut progress = tokio::time::interval(self.progress_interval);
                progress.tick().await;
                let disposition = loop {
                    tokio::select! {
                        disposition = &mut work => break disposition,
                        _ = progress.tick() => {
                            if let Err(e) = acker.in_progress().await {
                                debug!(trigger = %trigger, error = %e, "Failed to send in-progress ack");
                            }
                        }
                    }
                };

                match &disposition {
                    Disposition::Duplicate => {
                        info!(trigger = %trigger, event_id = %event_id, "Duplicate message, acknowledging")
                    }
                    Disposition::Unresolved => {}
                    Disposition::Processed(outcomes) => {
                        debug!(trigger = %trigger, event_id = %event_id, outcomes = ?outcomes, "Processed message")
                    }
                }
            }
        }

        if let Err(e) = acker.ack().await {
            warn!(
                trigger = %trigger,
                stream_sequence = meta.stream_sequence,
                error = %e,
                "Failed to acknowledge message"
            );
        }
    }

    async fn reset_conditions(&mut self, now: DateTime<Utc>) {
        self.correlator.reset_conditions(now).await;
    }

    async fn tick(&mut self, now: DateTime<Utc>) {
        self.correlator.check_failsafe(now).await;
    }
}
