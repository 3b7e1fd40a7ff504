//! Per-trigger correlation state
//!
//! Tracks which dependencies have produced a matching event since the last
//! resolution. The invariants maintained by every method:
//!
//! - a dependency has a pending event iff its parameter is `true`
//! - the failsafe deadline is set iff at least one parameter is `true`

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use shared::Event;
use std::collections::HashMap;

/// Transport position of a consumed message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageMeta {
    /// Stream sequence (JetStream), offset (Kafka) or sequence (STAN)
    pub stream_sequence: u64,
    /// Consumer sequence; equals `stream_sequence` where the bus has no such notion
    pub consumer_sequence: u64,
    /// Partition of the message (Kafka only)
    pub partition: Option<i32>,
    /// Broker timestamp of the message
    pub timestamp: DateTime<Utc>,
}

/// Event held for a satisfied dependency, as persisted in the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEvent {
    #[serde(rename = "StreamSeq")]
    pub stream_sequence: u64,
    #[serde(rename = "ConsumerSeq")]
    pub consumer_sequence: u64,
    #[serde(rename = "Partition", default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<i32>,
    #[serde(rename = "Timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "Event")]
    pub event: Event,
}

impl PendingEvent {
    pub fn new(meta: &MessageMeta, event: Event) -> Self {
        Self {
            stream_sequence: meta.stream_sequence,
            consumer_sequence: meta.consumer_sequence,
            partition: meta.partition,
            timestamp: meta.timestamp,
            event,
        }
    }
}

/// Correlation state of one trigger
#[derive(Debug, Clone)]
pub struct CorrelationState {
    parameters: HashMap<String, bool>,
    pending: HashMap<String, PendingEvent>,
    last_reset_time: Option<DateTime<Utc>>,
    failsafe_deadline: Option<DateTime<Utc>>,
}

impl CorrelationState {
    /// Idle state with every dependency unsatisfied
    pub fn new<I, S>(dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            parameters: dependencies.into_iter().map(|d| (d.into(), false)).collect(),
            pending: HashMap::new(),
            last_reset_time: None,
            failsafe_deadline: None,
        }
    }

    /// Dependency → satisfied map, suitable for expression evaluation
    pub fn parameters(&self) -> &HashMap<String, bool> {
        &self.parameters
    }

    pub fn pending(&self, dependency: &str) -> Option<&PendingEvent> {
        self.pending.get(dependency)
    }

    pub fn pending_events(&self) -> impl Iterator<Item = (&String, &PendingEvent)> {
        self.pending.iter()
    }

    /// Whether no dependency is satisfied
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn last_reset_time(&self) -> Option<DateTime<Utc>> {
        self.last_reset_time
    }

    pub fn set_last_reset_time(&mut self, time: Option<DateTime<Utc>>) {
        self.last_reset_time = time;
    }

    pub fn failsafe_deadline(&self) -> Option<DateTime<Utc>> {
        self.failsafe_deadline
    }

    /// Whether the failsafe deadline has passed at `now`
    pub fn failsafe_expired(&self, now: DateTime<Utc>) -> bool {
        self.failsafe_deadline.is_some_and(|deadline| now >= deadline)
    }

    /// Mark a dependency satisfied by `event`, replacing any earlier event
    ///
    /// Arms the failsafe at `now + failsafe_timeout` when this is the first
    /// satisfied dependency of the round. Returns the replaced event.
    pub fn record(
        &mut self,
        dependency: &str,
        event: PendingEvent,
        now: DateTime<Utc>,
        failsafe_timeout: Duration,
    ) -> Option<PendingEvent> {
        if self.is_idle() {
            self.failsafe_deadline = Some(now + failsafe_timeout);
        }
        self.parameters.insert(dependency.to_string(), true);
        self.pending.insert(dependency.to_string(), event)
    }

    /// Put back a previously replaced event, or clear the dependency when
    /// there was none
    pub fn restore(&mut self, dependency: &str, previous: Option<PendingEvent>) {
        match previous {
            Some(event) => {
                self.parameters.insert(dependency.to_string(), true);
                self.pending.insert(dependency.to_string(), event);
            }
            None => {
                self.clear(dependency);
            }
        }
    }

    /// Clear one dependency, returning its event
    pub fn clear(&mut self, dependency: &str) -> Option<PendingEvent> {
        if let Some(satisfied) = self.parameters.get_mut(dependency) {
            *satisfied = false;
        }
        let removed = self.pending.remove(dependency);
        if self.is_idle() {
            self.failsafe_deadline = None;
        }
        removed
    }

    /// Clear every dependency, returning the names that were satisfied
    pub fn clear_all(&mut self) -> Vec<String> {
        let mut cleared: Vec<String> = self.pending.drain().map(|(name, _)| name).collect();
        cleared.sort();
        for satisfied in self.parameters.values_mut() {
            *satisfied = false;
        }
        self.failsafe_deadline = None;
        cleared
    }

    /// Clear dependencies whose event timestamp is strictly before `time`
    pub fn clear_before(&mut self, time: DateTime<Utc>) -> Vec<String> {
        let mut stale: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.timestamp < time)
            .map(|(name, _)| name.clone())
            .collect();
        stale.sort();
        for name in &stale {
            self.clear(name);
        }
        stale
    }

    /// Take every pending event, leaving the state idle
    pub fn drain(&mut self) -> HashMap<String, Event> {
        let events = self
            .pending
            .drain()
            .map(|(name, pending)| (name, pending.event))
            .collect();
        for satisfied in self.parameters.values_mut() {
            *satisfied = false;
        }
        self.failsafe_deadline = None;
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn pending(id: &str, secs: i64) -> PendingEvent {
        PendingEvent::new(
            &MessageMeta {
                stream_sequence: 7,
                consumer_sequence: 3,
                partition: None,
                timestamp: at(secs),
            },
            Event::new(id, "webhook", "example"),
        )
    }

    fn assert_invariants(state: &CorrelationState) {
        for (name, satisfied) in state.parameters() {
            assert_eq!(*satisfied, state.pending(name).is_some(), "dependency {}", name);
        }
        assert_eq!(state.failsafe_deadline().is_some(), !state.is_idle());
    }

    #[test]
    fn test_record_arms_failsafe_once() {
        let mut state = CorrelationState::new(["a", "b"]);
        state.record("a", pending("1", 0), at(100), Duration::seconds(60));
        assert_eq!(state.failsafe_deadline(), Some(at(160)));

        state.record("b", pending("2", 0), at(130), Duration::seconds(60));
        assert_eq!(state.failsafe_deadline(), Some(at(160)));
        assert!(state.failsafe_expired(at(160)));
        assert!(!state.failsafe_expired(at(159)));
        assert_invariants(&state);
    }

    #[test]
    fn test_clear_disarms_failsafe_when_idle() {
        let mut state = CorrelationState::new(["a", "b"]);
        state.record("a", pending("1", 0), at(0), Duration::seconds(60));
        state.record("b", pending("2", 0), at(0), Duration::seconds(60));

        assert!(state.clear("a").is_some());
        assert!(state.failsafe_deadline().is_some());
        assert!(state.clear("b").is_some());
        assert!(state.failsafe_deadline().is_none());
        assert!(state.clear("b").is_none());
        assert_invariants(&state);
    }

    #[test]
    fn test_clear_before_is_strict() {
        let mut state = CorrelationState::new(["a", "b", "c"]);
        state.record("a", pending("1", 10), at(0), Duration::seconds(60));
        state.record("b", pending("2", 20), at(0), Duration::seconds(60));
        state.record("c", pending("3", 30), at(0), Duration::seconds(60));

        assert_eq!(state.clear_before(at(20)), vec!["a"]);
        assert!(state.pending("b").is_some());
        assert!(state.pending("c").is_some());
        assert_invariants(&state);
    }

    #[test]
    fn test_drain_returns_events_and_idles() {
        let mut state = CorrelationState::new(["a", "b"]);
        state.record("a", pending("1", 10), at(0), Duration::seconds(60));
        state.record("b", pending("2", 20), at(0), Duration::seconds(60));

        let events = state.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events["a"].id, "1");
        assert!(state.is_idle());
        assert_invariants(&state);
    }

    #[test]
    fn test_restore_previous() {
        let mut state = CorrelationState::new(["a"]);
        let previous = state.record("a", pending("1", 10), at(0), Duration::seconds(60));
        assert!(previous.is_none());
        state.restore("a", previous);
        assert!(state.is_idle());
        assert_invariants(&state);

        state.record("a", pending("1", 10), at(0), Duration::seconds(60));
        let previous = state.record("a", pending("2", 20), at(0), Duration::seconds(60));
        state.restore("a", previous);
        assert_eq!(state.pending("a").unwrap().event.id, "1");
        assert_invariants(&state);
    }

    #[test]
    fn test_pending_event_json_field_names() {
        let value = serde_json::to_value(pending("1", 10)).unwrap();
        assert_eq!(value["StreamSeq"], 7);
        assert_eq!(value["ConsumerSeq"], 3);
        assert!(value.get("Partition").is_none());
        assert_eq!(value["Event"]["id"], "1");
        assert!(value["Timestamp"].is_string());
    }
}
