//! Recently processed message IDs
//!
//! At-least-once buses redeliver messages whose ack was lost. IDs are
//! remembered for a fixed window and evicted inline on every call.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};

/// Time-windowed set of message IDs
#[derive(Debug, Clone)]
pub struct DeduplicationCache {
    window: Duration,
    seen: HashMap<String, DateTime<Utc>>,
    order: VecDeque<(DateTime<Utc>, String)>,
}

impl DeduplicationCache {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Whether `id` was recorded within the window ending at `now`
    pub fn contains(&mut self, id: &str, now: DateTime<Utc>) -> bool {
        self.evict(now);
        self.seen.contains_key(id)
    }

    /// Remember `id` as processed at `now`
    pub fn insert(&mut self, id: &str, now: DateTime<Utc>) {
        self.evict(now);
        if !self.seen.contains_key(id) {
            self.seen.insert(id.to_string(), now);
            self.order.push_back((now, id.to_string()));
        }
    }

    /// Drop entries older than the window, returning how many were dropped
    pub fn evict(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.window;
        let mut evicted = 0;
        while let Some((first_seen, _)) = self.order.front() {
            if *first_seen >= cutoff {
                break;
            }
            if let Some((first_seen, id)) = self.order.pop_front() {
                // A forgotten and re-inserted ID has a newer entry of its own
                if self.seen.get(&id) == Some(&first_seen) {
                    self.seen.remove(&id);
                    evicted += 1;
                }
            }
        }
        evicted
    }

    /// Forget `id`, returning whether it was remembered
    pub fn remove(&mut self, id: &str) -> bool {
        self.seen.remove(id).is_some()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_contains_within_window() {
        let mut cache = DeduplicationCache::new(Duration::minutes(5));
        cache.insert("m1", at(0));
        assert!(cache.contains("m1", at(299)));
        assert!(!cache.contains("m2", at(10)));
    }

    #[test]
    fn test_evicts_after_window() {
        let mut cache = DeduplicationCache::new(Duration::minutes(5));
        cache.insert("m1", at(0));
        cache.insert("m2", at(100));

        assert!(!cache.contains("m1", at(301)));
        assert_eq!(cache.len(), 1);
        assert!(cache.contains("m2", at(301)));
        assert_eq!(cache.evict(at(1000)), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_insert_keeps_first_seen_time() {
        let mut cache = DeduplicationCache::new(Duration::seconds(60));
        cache.insert("m1", at(0));
        cache.insert("m1", at(50));
        assert!(!cache.contains("m1", at(61)));
    }

    #[test]
    fn test_removed_id_gets_a_fresh_window() {
        let mut cache = DeduplicationCache::new(Duration::seconds(60));
        cache.insert("m1", at(0));
        assert!(cache.remove("m1"));
        assert!(!cache.remove("m1"));

        cache.insert("m1", at(30));
        assert!(cache.contains("m1", at(61)));
        assert!(!cache.contains("m1", at(91)));
    }
}
