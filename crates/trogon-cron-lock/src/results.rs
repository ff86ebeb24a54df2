use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;

type Record = Arc<Mutex<VecDeque<Value>>>;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct Records {
    by_name: HashMap<String, Record>,
    closed: bool,
}

/// Most recent task outputs, bounded per task name.
///
/// Each name has its own mutex covering the whole evict-then-append step, so
/// concurrent firings of one task never lose an update. The outer map lock is
/// only held to look the record up.
#[derive(Clone, Default)]
pub struct ResultCache {
    records: Arc<Mutex<Records>>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record for `name`, `None` once the cache is closed.
    fn record(&self, name: &str) -> Option<Record> {
        let mut records = locked(&self.records);
        if records.closed {
            return None;
        }
        let record = records
            .by_name
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(VecDeque::new())))
            .clone();
        Some(record)
    }

    /// Append `value`, evicting the oldest entries so at most `capacity` remain.
    ///
    /// A push racing [`close`](Self::close) may land in a record that is
    /// already detached from the cache; it is never visible through `get`.
    pub fn push(&self, name: &str, value: Value, capacity: usize) {
        if capacity == 0 {
            return;
        }
        let Some(record) = self.record(name) else {
            return;
        };
        let mut values = locked(&record);
        while values.len() >= capacity {
            values.pop_front();
        }
        values.push_back(value);
    }

    /// Retained values for `name`, oldest first.
    pub fn get(&self, name: &str) -> Vec<Value> {
        let record = locked(&self.records).by_name.get(name).cloned();
        match record {
            Some(record) => locked(&record).iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    pub fn clear(&self) {
        locked(&self.records).by_name.clear();
    }

    /// Drop every record and ignore all later pushes.
    pub fn close(&self) {
        let mut records = locked(&self.records);
        records.closed = true;
        records.by_name.clear();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn capacity_one_keeps_only_the_latest() {
        let cache = ResultCache::new();
        for v in ["v1", "v2", "v3"] {
            cache.push("cron:build", json!(v), 1);
        }
        assert_eq!(cache.get("cron:build"), vec![json!("v3")]);
    }

    #[test]
    fn overflow_keeps_most_recent_in_order() {
        let cache = ResultCache::new();
        for i in 0..7 {
            cache.push("job", json!(i), 4);
        }
        assert_eq!(cache.get("job"), vec![json!(3), json!(4), json!(5), json!(6)]);
    }

    #[test]
    fn zero_capacity_stores_nothing() {
        let cache = ResultCache::new();
        cache.push("job", json!("x"), 0);
        assert!(cache.get("job").is_empty());
    }

    #[test]
    fn unknown_name_reads_empty() {
        assert!(ResultCache::new().get("missing").is_empty());
    }

    #[test]
    fn names_are_independent() {
        let cache = ResultCache::new();
        cache.push("a", json!(1), 1);
        cache.push("b", json!(2), 1);
        assert_eq!(cache.get("a"), vec![json!(1)]);
        assert_eq!(cache.get("b"), vec![json!(2)]);
    }

    #[test]
    fn clear_drops_all_records() {
        let cache = ResultCache::new();
        cache.push("a", json!(1), 3);
        cache.clear();
        assert!(cache.get("a").is_empty());
    }

    #[test]
    fn close_drops_records_and_ignores_later_pushes() {
        let cache = ResultCache::new();
        cache.push("a", json!(1), 3);

        cache.close();
        cache.push("a", json!(2), 3);
        cache.push("b", json!(3), 3);

        assert!(cache.get("a").is_empty());
        assert!(cache.get("b").is_empty());
    }

    #[test]
    fn clear_keeps_the_cache_usable() {
        let cache = ResultCache::new();
        cache.push("a", json!(1), 3);
        cache.clear();
        cache.push("a", json!(2), 3);
        assert_eq!(cache.get("a"), vec![json!(2)]);
    }

    #[test]
    fn concurrent_pushes_to_one_name_are_not_lost() {
        let cache = ResultCache::new();
        std::thread::scope(|s| {
            for t in 0..8 {
                let cache = cache.clone();
                s.spawn(move || {
                    for i in 0..100 {
                        cache.push("shared", json!(t * 1000 + i), 10_000);
                    }
                });
            }
        });
        assert_eq!(cache.get("shared").len(), 800);
    }

    #[test]
    fn concurrent_pushes_never_exceed_capacity() {
        let cache = ResultCache::new();
        std::thread::scope(|s| {
            for t in 0..8 {
                let cache = cache.clone();
                s.spawn(move || {
                    for i in 0..200 {
                        cache.push("shared", json!(t * 1000 + i), 5);
                        assert!(cache.get("shared").len() <= 5);
                    }
                });
            }
        });
        assert_eq!(cache.get("shared").len(), 5);
    }
}
