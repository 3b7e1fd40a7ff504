//! Data models shared by the sensor engine and the trigger job consumers
//!
//! - [`Event`] is the CloudEvents envelope carried on every event bus
//! - [`Dependency`] names one `(eventSourceName, eventName)` pair a trigger waits for
//! - [`SensorSpec`] / [`TriggerSpec`] describe a sensor loaded from its JSON spec file

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

fn default_spec_version() -> String {
    "1.0".to_string()
}

/// CloudEvents envelope as published by event sources
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event ID, unique per event source (used for de-duplication)
    pub id: String,
    /// Event source name
    pub source: String,
    /// CloudEvents spec version
    #[serde(default = "default_spec_version")]
    pub specversion: String,
    /// Event type (the event source type)
    #[serde(rename = "type", default)]
    pub event_type: String,
    /// Event name within the source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Time the event was produced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    /// Content type of `data`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacontenttype: Option<String>,
    /// Event payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Event {
    /// Create a minimal event with the given ID, source and subject
    pub fn new(id: impl Into<String>, source: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            specversion: default_spec_version(),
            event_type: String::new(),
            subject: Some(subject.into()),
            time: None,
            datacontenttype: None,
            data: None,
        }
    }

    /// Event subject, or an empty string when absent
    pub fn subject(&self) -> &str {
        self.subject.as_deref().unwrap_or("")
    }

    /// Decode an event from its JSON wire form
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` for invalid JSON and `Error::Validation`
    /// when the mandatory `id` or `source` attributes are empty.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let event: Event = serde_json::from_slice(bytes)?;
        if event.id.is_empty() {
            return Err(Error::validation("event id must not be empty"));
        }
        if event.source.is_empty() {
            return Err(Error::validation("event source must not be empty"));
        }
        Ok(event)
    }
}

/// Consumer options for the JetStream event bus
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JetStreamConsumerConfig {
    /// One of `all`, `last`, `new`; anything else falls back to `new`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deliver_policy: Option<String>,
}

/// A named event dependency of a sensor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dependency {
    /// Dependency name, used as a variable in trigger expressions
    pub name: String,
    /// Name of the event source (may be a glob)
    pub event_source_name: String,
    /// Name of the event within the source (may be a glob)
    pub event_name: String,
    /// JetStream consumer options
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jet_stream: Option<JetStreamConsumerConfig>,
}

impl Dependency {
    pub fn new(
        name: impl Into<String>,
        event_source_name: impl Into<String>,
        event_name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            event_source_name: event_source_name.into(),
            event_name: event_name.into(),
            jet_stream: None,
        }
    }

    /// Key used to match incoming events: `<eventSourceName>__<eventName>`
    pub fn event_key(&self) -> String {
        event_key(&self.event_source_name, &self.event_name)
    }
}

/// Build the `<source>__<name>` key used for dependency resolution
pub fn event_key(source: &str, name: &str) -> String {
    format!("{}__{}", source, name)
}

/// Trigger definition inside a sensor spec
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerSpec {
    /// Trigger name
    pub name: String,
    /// Dependency expression; empty means "all dependencies"
    #[serde(default)]
    pub conditions: String,
    /// Run the action before committing consumed offsets (Kafka only)
    #[serde(default)]
    pub at_least_once: bool,
}

/// Sensor definition loaded from the spec file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorSpec {
    /// Sensor name
    pub name: String,
    /// Dependencies shared by all triggers
    pub dependencies: Vec<Dependency>,
    /// Triggers fired by this sensor
    pub triggers: Vec<TriggerSpec>,
}

impl SensorSpec {
    /// Load and validate a sensor spec from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let spec: SensorSpec = serde_json::from_slice(&bytes)?;
        spec.validate()?;
        tracing::debug!(
            path = %path.display(),
            sensor = %spec.name,
            dependencies = spec.dependencies.len(),
            triggers = spec.triggers.len(),
            "Loaded sensor spec"
        );
        Ok(spec)
    }

    /// Check that names are present and unique
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::validation("sensor name must not be empty"));
        }
        if self.dependencies.is_empty() {
            return Err(Error::validation("sensor must declare at least one dependency"));
        }
        let mut seen = HashSet::new();
        for dep in &self.dependencies {
            if dep.name.is_empty() {
                return Err(Error::validation("dependency name must not be empty"));
            }
            if !seen.insert(dep.name.as_str()) {
                return Err(Error::validation(format!(
                    "duplicate dependency name '{}'",
                    dep.name
                )));
            }
        }
        let mut seen = HashSet::new();
        for trigger in &self.triggers {
            if trigger.name.is_empty() {
                return Err(Error::validation("trigger name must not be empty"));
            }
            if !seen.insert(trigger.name.as_str()) {
                return Err(Error::validation(format!(
                    "duplicate trigger name '{}'",
                    trigger.name
                )));
            }
        }
        Ok(())
    }

    /// Find a trigger by name
    pub fn trigger(&self, name: &str) -> Option<&TriggerSpec> {
        self.triggers.iter().find(|t| t.name == name)
    }

    /// Effective dependency expression of a trigger
    ///
    /// An empty `conditions` string means every dependency must be satisfied.
    pub fn trigger_expression(&self, trigger: &TriggerSpec) -> String {
        if trigger.conditions.trim().is_empty() {
            self.dependencies
                .iter()
                .map(|d| d.name.as_str())
                .collect::<Vec<_>>()
                .join(" && ")
        } else {
            trigger.conditions.clone()
        }
    }

    /// Dependencies referenced by the given variable names, in spec order
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` when a variable names no declared dependency.
    pub fn dependencies_for(&self, variables: &[String]) -> Result<Vec<Dependency>> {
        for variable in variables {
            if !self.dependencies.iter().any(|d| &d.name == variable) {
                return Err(Error::not_found("Dependency", variable.clone()));
            }
        }
        Ok(self
            .dependencies
            .iter()
            .filter(|d| variables.contains(&d.name))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_spec() -> SensorSpec {
        SensorSpec {
            name: "sensor".to_string(),
            dependencies: vec![
                Dependency::new("dep-a", "webhook", "a"),
                Dependency::new("dep-b", "calendar", "b"),
            ],
            triggers: vec![
                TriggerSpec {
                    name: "both".to_string(),
                    conditions: String::new(),
                    at_least_once: false,
                },
                TriggerSpec {
                    name: "either".to_string(),
                    conditions: "dep-a || dep-b".to_string(),
                    at_least_once: true,
                },
            ],
        }
    }

    #[test]
    fn test_event_decode_cloudevent() {
        let bytes = serde_json::to_vec(&json!({
            "id": "1",
            "source": "webhook",
            "specversion": "1.0",
            "type": "webhook",
            "subject": "example",
            "time": "2024-01-01T00:00:00Z",
            "datacontenttype": "application/json",
            "data": {"hello": "world"}
        }))
        .unwrap();

        let event = Event::from_slice(&bytes).unwrap();
        assert_eq!(event.id, "1");
        assert_eq!(event.subject(), "example");
        assert_eq!(event.event_type, "webhook");
        assert_eq!(event.data, Some(json!({"hello": "world"})));
    }

    #[test]
    fn test_event_decode_rejects_empty_id() {
        let bytes = br#"{"id": "", "source": "webhook"}"#;
        assert!(matches!(
            Event::from_slice(bytes),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_event_decode_rejects_garbage() {
        assert!(matches!(
            Event::from_slice(b"not json"),
            Err(Error::Serialization(_))
        ));
    }

    #[test]
    fn test_dependency_camel_case() {
        let dep: Dependency = serde_json::from_value(json!({
            "name": "d",
            "eventSourceName": "src",
            "eventName": "evt",
            "jetStream": {"deliverPolicy": "all"}
        }))
        .unwrap();
        assert_eq!(dep.event_key(), "src__evt");
        assert_eq!(
            dep.jet_stream.unwrap().deliver_policy.as_deref(),
            Some("all")
        );
    }

    #[test]
    fn test_trigger_expression_defaults_to_all_dependencies() {
        let spec = sample_spec();
        assert_eq!(spec.trigger_expression(&spec.triggers[0]), "dep-a && dep-b");
        assert_eq!(spec.trigger_expression(&spec.triggers[1]), "dep-a || dep-b");
    }

    #[test]
    fn test_dependencies_for_unknown_variable() {
        let spec = sample_spec();
        let deps = spec.dependencies_for(&["dep-b".to_string()]).unwrap();
        assert_eq!(deps.len(), 1);
        assert!(spec.dependencies_for(&["nope".to_string()]).is_err());
    }

    #[test]
    fn test_validate_duplicate_dependency() {
        let mut spec = sample_spec();
        spec.dependencies.push(Dependency::new("dep-a", "x", "y"));
        assert!(spec.validate().is_err());
    }
}
