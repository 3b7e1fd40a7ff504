//! Trigger dependency correlation
//!
//! A [`Correlator`] owns everything one trigger needs to decide when to
//! fire: the parsed expression, the dependency index, the correlation
//! state, the de-duplication cache and (optionally) the persisted copy of
//! the pending events. It is driven by exactly one task, so none of this
//! state is shared or locked.
//!
//! Time is always passed in explicitly (`now`), which keeps failsafe and
//! reset behavior testable without sleeping.

pub mod dedup;
pub mod resolver;
pub mod state;

pub use dedup::DeduplicationCache;
pub use resolver::DependencyIndex;
pub use state::{CorrelationState, MessageMeta, PendingEvent};

use crate::bus::TriggerHandler;
use crate::error::{BusError, BusResult};
use crate::expr::DependencyExpression;
use crate::store::{KeyValueStore, PendingStateStore};
use chrono::{DateTime, Duration, Utc};
use shared::{CorrelationSettings, Dependency, Event};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Timing settings of a correlator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrelationConfig {
    /// Forced reset this long after the first dependency of a round is satisfied
    pub failsafe_timeout: Duration,
    /// How long processed message IDs are remembered
    pub dedup_window: Duration,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            failsafe_timeout: Duration::seconds(60),
            dedup_window: Duration::minutes(5),
        }
    }
}

impl From<&CorrelationSettings> for CorrelationConfig {
    fn from(settings: &CorrelationSettings) -> Self {
        Self {
            failsafe_timeout: Duration::seconds(settings.failsafe_timeout_secs as i64),
            dedup_window: Duration::seconds(settings.dedup_window_secs as i64),
        }
    }
}

/// Result of correlating one event for one dependency
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Dependency recorded, expression not yet satisfied
    Pending { dependency: String },
    /// Expression satisfied; `events` holds one event per satisfied dependency
    Fired {
        dependency: String,
        events: HashMap<String, Event>,
    },
    /// Rejected by the handler's filter
    Filtered { dependency: String },
    /// The handler's transform failed
    TransformFailed { dependency: String },
    /// The expression could not be evaluated; state left unchanged
    EvaluationFailed { dependency: String },
}

/// What happened to a delivered event
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Same message ID already processed within the window
    Duplicate,
    /// No dependency of this trigger matches the event
    Unresolved,
    /// One outcome per matched dependency
    Processed(Vec<Outcome>),
}

impl Outcome {
    /// Whether the event was fully processed for this dependency
    pub fn completed(&self) -> bool {
        matches!(
            self,
            Outcome::Pending { .. } | Outcome::Fired { .. } | Outcome::Filtered { .. }
        )
    }
}

impl Disposition {
    /// Whether any outcome fired the trigger
    pub fn fired(&self) -> bool {
        matches!(self, Disposition::Processed(outcomes)
            if outcomes.iter().any(|o| matches!(o, Outcome::Fired { .. })))
    }
}

/// Correlation engine of a single trigger
pub struct Correlator {
    trigger_name: String,
    expression: DependencyExpression,
    index: DependencyIndex,
    state: CorrelationState,
    dedup: DeduplicationCache,
    store: Option<PendingStateStore>,
    config: CorrelationConfig,
}

impl Correlator {
    /// Build a correlator for a trigger
    ///
    /// # Arguments
    ///
    /// * `trigger_name` - Trigger name, also the store key prefix
    /// * `expression` - Dependency expression of the trigger
    /// * `dependencies` - Dependencies referenced by the expression
    /// * `config` - Failsafe and de-duplication timing
    ///
    /// # Errors
    ///
    /// Returns `BusError::Expression` when the expression does not parse and
    /// `BusError::Setup` when it references an unknown dependency.
    pub fn new(
        trigger_name: impl Into<String>,
        expression: &str,
        dependencies: &[Dependency],
        config: CorrelationConfig,
    ) -> BusResult<Self> {
        let trigger_name = trigger_name.into();
        let expression = DependencyExpression::parse(expression)?;

        for variable in expression.variables() {
            if !dependencies.iter().any(|d| &d.name == variable) {
                return Err(BusError::setup(format!(
                    "trigger {} references unknown dependency {}",
                    trigger_name, variable
                )));
            }
        }

        Ok(Self {
            state: CorrelationState::new(dependencies.iter().map(|d| d.name.clone())),
            index: DependencyIndex::new(dependencies),
            dedup: DeduplicationCache::new(config.dedup_window),
            store: None,
            trigger_name,
            expression,
            config,
        })
    }

    /// Persist pending events in `kv`
    ///
    /// Ignored for one-and-done expressions, which never hold pending events.
    pub fn with_store(mut self, kv: Arc<dyn KeyValueStore>) -> Self {
        if self.expression.one_and_done() {
            debug!(trigger = %self.trigger_name, "One-and-done trigger, pending state is not persisted");
        } else {
            self.store = Some(PendingStateStore::new(kv, self.trigger_name.clone()));
        }
        self
    }

    pub fn trigger_name(&self) -> &str {
        &self.trigger_name
    }

    pub fn expression(&self) -> &DependencyExpression {
        &self.expression
    }

    pub fn state(&self) -> &CorrelationState {
        &self.state
    }

    pub fn config(&self) -> &CorrelationConfig {
        &self.config
    }

    /// Copy of the in-memory correlation state
    pub fn snapshot(&self) -> CorrelationState {
        self.state.clone()
    }

    /// Put back a state taken with [`Correlator::snapshot`]
    ///
    /// Only the in-memory state changes; the store is left as is.
    pub fn rollback(&mut self, state: CorrelationState) {
        self.state = state;
    }

    /// Reload persisted pending events and apply the last reset time
    ///
    /// Entries older than `last_reset_time` are cleared from state and store.
    /// Returns the number of dependencies left pending.
    ///
    /// # Errors
    ///
    /// Returns `BusError::Store` when the store cannot be read.
    pub async fn restore(
        &mut self,
        last_reset_time: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> BusResult<usize> {
        if let Some(store) = self.store.as_mut() {
            let names: Vec<String> = self.index.dependency_names().map(str::to_string).collect();
            for name in names {
                if let Some(pending) = store.load(&name).await? {
                    debug!(
                        trigger = %self.trigger_name,
                        dependency = %name,
                        event_id = %pending.event.id,
                        "Restored pending event"
                    );
                    self.state.record(&name, pending, now, self.config.failsafe_timeout);
                }
            }
        }

        if let Some(reset_time) = last_reset_time {
            self.state.set_last_reset_time(Some(reset_time));
            let cleared = self.state.clear_before(reset_time);
            if !cleared.is_empty() {
                info!(
                    trigger = %self.trigger_name,
                    cleared = ?cleared,
                    last_reset_time = %reset_time,
                    "Cleared pending events older than last reset"
                );
                self.forget(&cleared).await;
            }
        }

        Ok(self.state.pending_events().count())
    }

    /// Names of the dependencies an event satisfies
    pub fn resolve(&self, source: &str, subject: &str) -> Vec<String> {
        self.index
            .resolve(source, subject)
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// Whether a message ID was processed within the window
    pub fn is_duplicate(&mut self, id: &str, now: DateTime<Utc>) -> bool {
        let duplicate = self.dedup.contains(id, now);
        if duplicate {
            #[cfg(feature = "metrics")]
            metrics::counter!("sensor_engine.duplicate_messages", "trigger" => self.trigger_name.clone())
                .increment(1);
        }
        duplicate
    }

    /// Record a message ID as processed
    pub fn remember(&mut self, id: &str, now: DateTime<Utc>) {
        self.dedup.insert(id, now);
    }

    /// Forget a processed message ID so a redelivery is handled again
    pub fn forget_message(&mut self, id: &str) {
        if self.dedup.remove(id) {
            debug!(trigger = %self.trigger_name, event_id = %id, "Forgot processed message");
        }
    }

    /// Run one delivered event through the full pipeline
    ///
    /// Duplicate check, dependency resolution, `transform`, `filter`,
    /// correlation and, when satisfied, `action`. The event ID is recorded
    /// for de-duplication once at least one dependency completed; when every
    /// transform or evaluation failed it is left out so a redelivery is
    /// processed again.
    pub async fn handle(
        &mut self,
        event: Event,
        meta: MessageMeta,
        handler: &dyn TriggerHandler,
        now: DateTime<Utc>,
    ) -> Disposition {
        if self.is_duplicate(&event.id, now) {
            debug!(
                trigger = %self.trigger_name,
                event_id = %event.id,
                "Duplicate message, skipping"
            );
            return Disposition::Duplicate;
        }

        let dependencies = self.resolve(&event.source, event.subject());
        if dependencies.is_empty() {
            debug!(
                trigger = %self.trigger_name,
                source = %event.source,
                subject = %event.subject(),
                "Event matches no dependency of this trigger"
            );
            return Disposition::Unresolved;
        }

        let mut outcomes = Vec::with_capacity(dependencies.len());
        for dependency in dependencies {
            let transformed = match handler.transform(&dependency, event.clone()) {
                Ok(transformed) => transformed,
                Err(e) => {
                    warn!(
                        trigger = %self.trigger_name,
                        dependency = %dependency,
                        event_id = %event.id,
                        error = %e,
                        "Failed to transform event"
                    );
                    outcomes.push(Outcome::TransformFailed { dependency });
                    continue;
                }
            };

            if !handler.filter(&dependency, &transformed) {
                debug!(
                    trigger = %self.trigger_name,
                    dependency = %dependency,
                    event_id = %event.id,
                    "Event filtered out"
                );
                outcomes.push(Outcome::Filtered { dependency });
                continue;
            }

            let outcome = self.correlate(&dependency, transformed, meta, now).await;
            if let Outcome::Fired { events, .. } = &outcome {
                handler.action(events.clone()).await;
            }
            outcomes.push(outcome);
        }

        if outcomes.iter().any(Outcome::completed) {
            self.remember(&event.id, now);
        } else {
            debug!(
                trigger = %self.trigger_name,
                event_id = %event.id,
                "No dependency processed the event, a redelivery will be handled again"
            );
        }
        Disposition::Processed(outcomes)
    }

    /// Record an already transformed and filtered event and evaluate
    ///
    /// Does not invoke the action; callers decide when to run it.
    pub async fn correlate(
        &mut self,
        dependency: &str,
        event: Event,
        meta: MessageMeta,
        now: DateTime<Utc>,
    ) -> Outcome {
        if self.check_failsafe(now).await {
            debug!(trigger = %self.trigger_name, "Failsafe reset applied before correlation");
        }

        if self.expression.one_and_done() {
            info!(
                trigger = %self.trigger_name,
                dependency = %dependency,
                event_id = %event.id,
                "One-and-done dependency satisfied, firing trigger"
            );
            self.count_fired();
            let mut events = HashMap::new();
            events.insert(dependency.to_string(), event);
            return Outcome::Fired {
                dependency: dependency.to_string(),
                events,
            };
        }

        let event_id = event.id.clone();
        let previous = self.state.record(
            dependency,
            PendingEvent::new(&meta, event),
            now,
            self.config.failsafe_timeout,
        );

        match self.expression.evaluate(self.state.parameters()) {
            Err(e) => {
                error!(
                    trigger = %self.trigger_name,
                    dependency = %dependency,
                    event_id = %event_id,
                    expression = %self.expression.source(),
                    error = %e,
                    error_id = "EXPRESSION_EVALUATION_FAILED",
                    "Failed to evaluate dependency expression"
                );
                self.state.restore(dependency, previous);
                Outcome::EvaluationFailed {
                    dependency: dependency.to_string(),
                }
            }
            Ok(false) => {
                debug!(
                    trigger = %self.trigger_name,
                    dependency = %dependency,
                    event_id = %event_id,
                    "Trigger conditions not yet met"
                );
                self.persist(dependency).await;
                Outcome::Pending {
                    dependency: dependency.to_string(),
                }
            }
            Ok(true) => {
                let mut satisfied: Vec<String> =
                    self.state.pending_events().map(|(name, _)| name.clone()).collect();
                satisfied.sort();
                let events = self.state.drain();
                info!(
                    trigger = %self.trigger_name,
                    dependencies = ?satisfied,
                    "Trigger conditions met, firing trigger"
                );
                self.count_fired();
                self.forget(&satisfied).await;
                Outcome::Fired {
                    dependency: dependency.to_string(),
                    events,
                }
            }
        }
    }

    /// Explicit reset: set the last reset time to `now` and clear every
    /// pending event older than it
    pub async fn reset_conditions(&mut self, now: DateTime<Utc>) -> Vec<String> {
        self.state.set_last_reset_time(Some(now));
        let cleared = self.state.clear_before(now);
        info!(
            trigger = %self.trigger_name,
            cleared = ?cleared,
            "Reset trigger conditions"
        );
        self.forget(&cleared).await;
        cleared
    }

    /// Clear everything when the failsafe deadline has passed
    ///
    /// Returns whether a reset happened.
    pub async fn check_failsafe(&mut self, now: DateTime<Utc>) -> bool {
        if !self.state.failsafe_expired(now) {
            return false;
        }
        warn!(
            trigger = %self.trigger_name,
            deadline = ?self.state.failsafe_deadline(),
            error_id = "FAILSAFE_RESET",
            "Trigger conditions not met before failsafe deadline, clearing all dependencies"
        );
        #[cfg(feature = "metrics")]
        metrics::counter!("sensor_engine.failsafe_resets", "trigger" => self.trigger_name.clone())
            .increment(1);
        self.clear_all().await;
        true
    }

    /// Clear one dependency in state and store
    pub async fn clear_dependency(&mut self, dependency: &str) {
        if self.state.clear(dependency).is_some() {
            self.forget(&[dependency.to_string()]).await;
        }
    }

    /// Clear every dependency in state and store
    pub async fn clear_all(&mut self) -> Vec<String> {
        let cleared = self.state.clear_all();
        self.forget(&cleared).await;
        cleared
    }

    pub fn last_reset_time(&self) -> Option<DateTime<Utc>> {
        self.state.last_reset_time()
    }

    pub fn set_last_reset_time(&mut self, time: Option<DateTime<Utc>>) {
        self.state.set_last_reset_time(time);
    }

    /// Drop in-memory state and remembered IDs without touching the store
    ///
    /// Used when the bus will redeliver everything that was pending, e.g.
    /// after a consumer group rebalance.
    pub fn reset_session(&mut self) {
        let cleared = self.state.clear_all();
        self.dedup.clear();
        if !cleared.is_empty() {
            info!(trigger = %self.trigger_name, cleared = ?cleared, "Dropped in-memory correlation state");
        }
    }

    fn count_fired(&self) {
        #[cfg(feature = "metrics")]
        metrics::counter!("sensor_engine.triggers_fired", "trigger" => self.trigger_name.clone())
            .increment(1);
    }

    async fn persist(&mut self, dependency: &str) {
        let (Some(store), Some(pending)) = (self.store.as_mut(), self.state.pending(dependency))
        else {
            return;
        };
        if let Err(e) = store.save(dependency, pending).await {
            error!(
                trigger = %self.trigger_name,
                dependency = %dependency,
                error = %e,
                error_id = "PENDING_STATE_PERSIST_FAILED",
                "Failed to persist pending event"
            );
        }
    }

    async fn forget(&mut self, dependencies: &[String]) {
        let Some(store) = self.store.as_mut() else {
            return;
        };
        for dependency in dependencies {
            if let Err(e) = store.delete(dependency).await {
                error!(
                    trigger = %self.trigger_name,
                    dependency = %dependency,
                    error = %e,
                    error_id = "PENDING_STATE_DELETE_FAILED",
                    "Failed to delete pending event"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn meta(seq: u64, secs: i64) -> MessageMeta {
        MessageMeta {
            stream_sequence: seq,
            consumer_sequence: seq,
            partition: None,
            timestamp: at(secs),
        }
    }

    fn deps() -> Vec<Dependency> {
        vec![
            Dependency::new("a", "webhook", "a"),
            Dependency::new("b", "webhook", "b"),
        ]
    }

    #[test]
    fn test_new_rejects_unknown_dependency() {
        let result = Correlator::new("t", "a && c", &deps(), CorrelationConfig::default());
        assert!(matches!(result, Err(BusError::Setup(_))));
    }

    #[test]
    fn test_new_rejects_bad_expression() {
        let result = Correlator::new("t", "a &", &deps(), CorrelationConfig::default());
        assert!(matches!(result, Err(BusError::Expression(_))));
    }

    #[tokio::test]
    async fn test_correlate_persists_and_fires() {
        let kv = Arc::new(MemoryStore::new());
        let mut correlator = Correlator::new("t", "a && b", &deps(), CorrelationConfig::default())
            .unwrap()
            .with_store(kv.clone());

        let outcome = correlator
            .correlate("a", Event::new("1", "webhook", "a"), meta(1, 10), at(10))
            .await;
        assert_eq!(outcome, Outcome::Pending { dependency: "a".to_string() });
        assert_eq!(kv.keys(), vec!["t/a"]);

        let outcome = correlator
            .correlate("b", Event::new("2", "webhook", "b"), meta(2, 11), at(11))
            .await;
        match outcome {
            Outcome::Fired { events, .. } => {
                assert_eq!(events["a"].id, "1");
                assert_eq!(events["b"].id, "2");
            }
            other => panic!("expected fire, got {:?}", other),
        }
        assert!(kv.is_empty());
        assert!(correlator.state().is_idle());
    }

    #[tokio::test]
    async fn test_one_and_done_ignores_store() {
        let kv = Arc::new(MemoryStore::new());
        let mut correlator = Correlator::new("t", "a || b", &deps(), CorrelationConfig::default())
            .unwrap()
            .with_store(kv.clone());

        let outcome = correlator
            .correlate("b", Event::new("1", "webhook", "b"), meta(1, 10), at(10))
            .await;
        assert!(matches!(outcome, Outcome::Fired { .. }));
        assert!(kv.is_empty());
        assert!(correlator.state().is_idle());
    }

    #[tokio::test]
    async fn test_restore_applies_last_reset_time() {
        let kv = Arc::new(MemoryStore::new());
        {
            let mut first = Correlator::new("t", "a && b", &deps(), CorrelationConfig::default())
                .unwrap()
                .with_store(kv.clone());
            first
                .correlate("a", Event::new("1", "webhook", "a"), meta(1, 10), at(10))
                .await;
        }

        let mut restored = Correlator::new("t", "a && b", &deps(), CorrelationConfig::default())
            .unwrap()
            .with_store(kv.clone());
        assert_eq!(restored.restore(None, at(20)).await.unwrap(), 1);

        let mut reset = Correlator::new("t", "a && b", &deps(), CorrelationConfig::default())
            .unwrap()
            .with_store(kv.clone());
        assert_eq!(reset.restore(Some(at(15)), at(20)).await.unwrap(), 0);
        assert!(kv.is_empty());
    }
}
