//! Align persisted correlation state with the current sensor spec
//!
//! A sensor can be redeployed with different dependencies or trigger
//! conditions while pending events from the previous version are still in
//! the store. On startup the stored dependency hashes and trigger
//! expressions are compared with the spec:
//!
//! - pending events of changed or removed dependencies are purged from
//!   triggers that are otherwise unchanged
//! - every pending event of a changed or removed trigger is purged
//! - the new dependency hashes, trigger list and expressions are stored

use super::{
    dependency_key, expression_key, KeyValueStore, StoreError, DEPENDENCY_DEFINITIONS_KEY,
    TRIGGERS_KEY,
};
use crate::error::BusResult;
use crate::expr;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use shared::{Dependency, SensorSpec};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

/// Removes the broker-side consumer of a trigger dependency
#[async_trait]
pub trait ConsumerPurger: Send + Sync {
    async fn purge_consumer(&self, trigger: &str, dependency: &str) -> BusResult<()>;
}

/// What a sync found and did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub changed_dependencies: Vec<String>,
    pub removed_dependencies: Vec<String>,
    pub changed_triggers: Vec<String>,
    pub removed_triggers: Vec<String>,
    /// `(trigger, dependency)` pairs whose pending state was purged
    pub purged: Vec<(String, String)>,
}

/// Hex encoded SHA-256 of a dependency definition
pub fn dependency_hash(dependency: &Dependency) -> Result<String, StoreError> {
    let bytes = serde_json::to_vec(dependency)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Compare stored state with `spec`, purge what no longer applies and store
/// the new definitions
///
/// # Errors
///
/// Returns `BusError::Store` when the store cannot be read or written.
/// Failures to purge a single key or consumer are only logged.
pub async fn sync_to_spec(
    kv: &dyn KeyValueStore,
    spec: &SensorSpec,
    purger: &dyn ConsumerPurger,
) -> BusResult<SyncReport> {
    let mut report = SyncReport::default();

    let stored_deps: BTreeMap<String, String> = load_json(kv, DEPENDENCY_DEFINITIONS_KEY).await?;
    let mut current_deps = BTreeMap::new();
    for dep in &spec.dependencies {
        current_deps.insert(dep.name.clone(), dependency_hash(dep)?);
    }

    for (name, stored_hash) in &stored_deps {
        match current_deps.get(name) {
            Some(hash) if hash == stored_hash => {}
            Some(_) => report.changed_dependencies.push(name.clone()),
            None => report.removed_dependencies.push(name.clone()),
        }
    }

    let stored_triggers: Vec<String> = load_json(kv, TRIGGERS_KEY).await?;
    let mut valid_triggers = Vec::new();
    let mut stale_expressions = Vec::new();
    for trigger_name in &stored_triggers {
        let stored_expression = kv
            .get(&expression_key(trigger_name))
            .await?
            .map(|entry| String::from_utf8_lossy(&entry.value).into_owned());

        match spec.trigger(trigger_name) {
            None => {
                report.removed_triggers.push(trigger_name.clone());
                stale_expressions.push((trigger_name.clone(), stored_expression));
            }
            Some(trigger) => {
                let current = spec.trigger_expression(trigger);
                if stored_expression.as_deref() == Some(current.as_str()) {
                    valid_triggers.push(trigger_name.clone());
                } else {
                    report.changed_triggers.push(trigger_name.clone());
                    stale_expressions.push((trigger_name.clone(), stored_expression));
                }
            }
        }
    }

    let outdated: Vec<String> = report
        .changed_dependencies
        .iter()
        .chain(&report.removed_dependencies)
        .cloned()
        .collect();
    for trigger in &valid_triggers {
        for dependency in &outdated {
            purge(kv, purger, trigger, dependency, &mut report).await;
        }
    }

    for (trigger, expression) in &stale_expressions {
        let dependencies = expression
            .as_deref()
            .map(expression_dependencies)
            .unwrap_or_default();
        for dependency in dependencies {
            purge(kv, purger, trigger, &dependency, &mut report).await;
        }
    }

    for trigger in &report.removed_triggers {
        kv.delete(&expression_key(trigger)).await?;
    }
    kv.put(DEPENDENCY_DEFINITIONS_KEY, serde_json::to_vec(&current_deps).map_err(StoreError::from)?)
        .await?;
    let trigger_names: Vec<&str> = spec.triggers.iter().map(|t| t.name.as_str()).collect();
    kv.put(TRIGGERS_KEY, serde_json::to_vec(&trigger_names).map_err(StoreError::from)?)
        .await?;
    for trigger in &spec.triggers {
        kv.put(
            &expression_key(&trigger.name),
            spec.trigger_expression(trigger).into_bytes(),
        )
        .await?;
    }

    info!(
        sensor = %spec.name,
        changed_dependencies = ?report.changed_dependencies,
        removed_dependencies = ?report.removed_dependencies,
        changed_triggers = ?report.changed_triggers,
        removed_triggers = ?report.removed_triggers,
        purged = report.purged.len(),
        "Synchronized stored correlation state with sensor spec"
    );
    Ok(report)
}

async fn load_json<T>(kv: &dyn KeyValueStore, key: &str) -> Result<T, StoreError>
where
    T: serde::de::DeserializeOwned + Default,
{
    let Some(entry) = kv.get(key).await? else {
        return Ok(T::default());
    };
    match serde_json::from_slice(&entry.value) {
        Ok(value) => Ok(value),
        Err(e) => {
            warn!(key = %key, error = %e, "Ignoring undecodable stored value");
            Ok(T::default())
        }
    }
}

/// Dependency names of a stored expression, tolerating expressions this
/// version can no longer parse
fn expression_dependencies(expression: &str) -> Vec<String> {
    match expr::tokenize(expression) {
        Ok(tokens) => expr::variables(&tokens),
        Err(_) => {
            let names: BTreeSet<&str> = expression
                .split(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')))
                .filter(|s| !s.is_empty())
                .collect();
            names.into_iter().map(str::to_string).collect()
        }
    }
}

async fn purge(
    kv: &dyn KeyValueStore,
    purger: &dyn ConsumerPurger,
    trigger: &str,
    dependency: &str,
    report: &mut SyncReport,
) {
    if let Err(e) = kv.delete(&dependency_key(trigger, dependency)).await {
        warn!(
            trigger = %trigger,
            dependency = %dependency,
            error = %e,
            "Failed to purge pending event"
        );
    }
    if let Err(e) = purger.purge_consumer(trigger, dependency).await {
        warn!(
            trigger = %trigger,
            dependency = %dependency,
            error = %e,
            "Failed to purge consumer"
        );
    }
    report
        .purged
        .push((trigger.to_string(), dependency.to_string()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use shared::TriggerSpec;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingPurger {
        purged: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl ConsumerPurger for RecordingPurger {
        async fn purge_consumer(&self, trigger: &str, dependency: &str) -> BusResult<()> {
            self.purged
                .lock()
                .unwrap()
                .push((trigger.to_string(), dependency.to_string()));
            Ok(())
        }
    }

    fn trigger(name: &str, conditions: &str) -> TriggerSpec {
        TriggerSpec {
            name: name.to_string(),
            conditions: conditions.to_string(),
            at_least_once: false,
        }
    }

    fn spec(dependencies: Vec<Dependency>, triggers: Vec<TriggerSpec>) -> SensorSpec {
        SensorSpec {
            name: "sensor".to_string(),
            dependencies,
            triggers,
        }
    }

    #[tokio::test]
    async fn test_first_sync_stores_definitions() {
        let kv = MemoryStore::new();
        let purger = RecordingPurger::default();
        let spec = spec(
            vec![Dependency::new("a", "s", "a"), Dependency::new("b", "s", "b")],
            vec![trigger("t1", "a && b")],
        );

        let report = sync_to_spec(&kv, &spec, &purger).await.unwrap();
        assert_eq!(report, SyncReport::default());
        assert_eq!(kv.keys(), vec!["Deps", "Triggers", "t1/Expression"]);

        let expression = kv.get("t1/Expression").await.unwrap().unwrap();
        assert_eq!(expression.value, b"a && b");
    }

    #[tokio::test]
    async fn test_changed_dependency_purged_from_valid_trigger() {
        let kv = MemoryStore::new();
        let purger = RecordingPurger::default();
        let original = spec(
            vec![Dependency::new("a", "s", "a"), Dependency::new("b", "s", "b")],
            vec![trigger("t1", "a && b")],
        );
        sync_to_spec(&kv, &original, &purger).await.unwrap();
        kv.put("t1/a", b"{}".to_vec()).await.unwrap();
        kv.put("t1/b", b"{}".to_vec()).await.unwrap();

        let updated = spec(
            vec![Dependency::new("a", "s", "a2"), Dependency::new("b", "s", "b")],
            vec![trigger("t1", "a && b")],
        );
        let report = sync_to_spec(&kv, &updated, &purger).await.unwrap();

        assert_eq!(report.changed_dependencies, vec!["a"]);
        assert_eq!(report.purged, vec![("t1".to_string(), "a".to_string())]);
        assert!(kv.get("t1/a").await.unwrap().is_none());
        assert!(kv.get("t1/b").await.unwrap().is_some());
        assert_eq!(purger.purged.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_changed_and_removed_triggers_purged() {
        let kv = MemoryStore::new();
        let purger = RecordingPurger::default();
        let original = spec(
            vec![Dependency::new("a", "s", "a"), Dependency::new("b", "s", "b")],
            vec![trigger("t1", "a && b"), trigger("t2", "a && b")],
        );
        sync_to_spec(&kv, &original, &purger).await.unwrap();
        for key in ["t1/a", "t1/b", "t2/a"] {
            kv.put(key, b"{}".to_vec()).await.unwrap();
        }

        let updated = spec(
            vec![Dependency::new("a", "s", "a"), Dependency::new("b", "s", "b")],
            vec![trigger("t1", "a || b")],
        );
        let report = sync_to_spec(&kv, &updated, &purger).await.unwrap();

        assert_eq!(report.changed_triggers, vec!["t1"]);
        assert_eq!(report.removed_triggers, vec!["t2"]);
        assert_eq!(kv.keys(), vec!["Deps", "Triggers", "t1/Expression"]);
        assert_eq!(
            kv.get("t1/Expression").await.unwrap().unwrap().value,
            b"a || b"
        );
    }

    #[test]
    fn test_expression_dependencies_fallback() {
        assert_eq!(expression_dependencies("a && (b || c)"), vec!["a", "b", "c"]);
        assert_eq!(expression_dependencies("a & b"), vec!["a", "b"]);
    }

    #[test]
    fn test_dependency_hash_is_stable() {
        let dep = Dependency::new("a", "s", "a");
        assert_eq!(dependency_hash(&dep).unwrap(), dependency_hash(&dep.clone()).unwrap());
        assert_eq!(dependency_hash(&dep).unwrap().len(), 64);
        assert_ne!(
            dependency_hash(&dep).unwrap(),
            dependency_hash(&Dependency::new("a", "s", "b")).unwrap()
        );
    }
}
