//! Trigger job definitions for the sensor engine and trigger workers
//!
//! Jobs are created when a trigger's dependency expression is satisfied and
//! are enqueued to Redis for the workers that execute the trigger.

use crate::models::Event;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Queue name for trigger jobs
pub const TRIGGER_JOBS_QUEUE: &str = "trigger_jobs";

/// Trigger job to be processed by trigger workers
///
/// Contains the merged set of events that satisfied the trigger, keyed by
/// dependency name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerJob {
    /// Unique job identifier
    pub id: String,
    /// Sensor that fired the trigger
    pub sensor: String,
    /// Name of the fired trigger
    pub trigger: String,
    /// Events that satisfied the trigger, keyed by dependency name
    pub events: HashMap<String, Event>,
    /// When this job was created
    pub created_at: DateTime<Utc>,
}

impl TriggerJob {
    /// Create a new trigger job
    ///
    /// # Arguments
    ///
    /// * `sensor` - Name of the sensor
    /// * `trigger` - Name of the fired trigger
    /// * `events` - Merged events keyed by dependency name
    pub fn new(sensor: &str, trigger: &str, events: HashMap<String, Event>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sensor: sensor.to_string(),
            trigger: trigger.to_string(),
            events,
            created_at: Utc::now(),
        }
    }

    /// Sorted IDs of the events carried by this job
    pub fn event_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.events.values().map(|e| e.id.as_str()).collect();
        ids.sort_unstable();
        ids
    }
}
