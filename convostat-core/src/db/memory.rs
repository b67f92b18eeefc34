//! In-process store backed by hash maps.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{stored_sequence, AnalyticsStore};
use crate::analytics::StatAggregate;
use crate::error::{Error, Result};
use crate::types::{Event, TimeWindow};

/// Non-durable [`AnalyticsStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    aggregates: RwLock<HashMap<String, StatAggregate>>,
    history: RwLock<HashMap<String, Vec<Event>>>,
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read()
        .map_err(|_| Error::StoreUnavailable("memory store lock poisoned".to_string()))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write()
        .map_err(|_| Error::StoreUnavailable("memory store lock poisoned".to_string()))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of users with a stored aggregate.
    pub fn user_count(&self) -> Result<usize> {
        Ok(read(&self.aggregates)?.len())
    }
}

impl AnalyticsStore for MemoryStore {
    fn get_aggregate(&self, user_id: &str) -> Result<Option<StatAggregate>> {
        Ok(read(&self.aggregates)?.get(user_id).cloned())
    }

    fn put_aggregate(&self, aggregate: &StatAggregate) -> Result<()> {
        write(&self.aggregates)?.insert(aggregate.user_id.clone(), aggregate.clone());
        Ok(())
    }

    fn append_event(&self, event: &Event) -> Result<()> {
        let sequence = stored_sequence(event)?;
        let mut history = write(&self.history)?;
        let events = history.entry(event.user_id.clone()).or_default();
        match events.iter().position(|e| e.sequence == Some(sequence)) {
            Some(pos) => events[pos] = event.clone(),
            None => {
                events.push(event.clone());
                if events.len() > 1 && events[events.len() - 2].sequence > Some(sequence) {
                    events.sort_by_key(|e| e.sequence);
                }
            }
        }
        Ok(())
    }

    fn get_history(&self, user_id: &str, window: TimeWindow) -> Result<Vec<Event>> {
        let history = read(&self.history)?;
        Ok(history
            .get(user_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| window.contains(e.timestamp_utc()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn delete_history(&self, user_id: &str) -> Result<()> {
        write(&self.history)?.remove(user_id);
        Ok(())
    }

    fn delete_aggregate(&self, user_id: &str) -> Result<()> {
        write(&self.aggregates)?.remove(user_id);
        Ok(())
    }

    fn list_stale_users(&self, older_than: DateTime<Utc>) -> Result<Vec<String>> {
        let aggregates = read(&self.aggregates)?;
        let mut users: Vec<String> = aggregates
            .values()
            .filter(|agg| agg.last_updated_at < older_than)
            .map(|agg| agg.user_id.clone())
            .collect();
        users.sort();
        Ok(users)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;
    use chrono::{Duration, TimeZone};

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, h, 0, 0).unwrap()
    }

    fn event(user: &str, seq: u64, h: u32, len: i64) -> Event {
        Event::message(user, "c1", Role::User, at(h).fixed_offset(), len).with_sequence(seq)
    }

    #[test]
    fn test_aggregate_put_get_delete() {
        let store = MemoryStore::new();
        assert!(store.get_aggregate("u1").unwrap().is_none());
        assert!(matches!(
            store.require_aggregate("u1"),
            Err(Error::NotFound(_))
        ));

        store.put_aggregate(&StatAggregate::new("u1", at(1))).unwrap();
        assert_eq!(store.require_aggregate("u1").unwrap().user_id, "u1");
        assert_eq!(store.user_count().unwrap(), 1);

        store.delete_user_data("u1").unwrap();
        store.delete_user_data("u1").unwrap();
        assert!(store.get_aggregate("u1").unwrap().is_none());
    }

    #[test]
    fn test_history_ordered_by_sequence_and_windowed() {
        let store = MemoryStore::new();
        store.append_event(&event("u1", 2, 5, 20)).unwrap();
        store.append_event(&event("u1", 1, 3, 10)).unwrap();
        store.append_event(&event("u1", 3, 9, 30)).unwrap();
        store.append_event(&event("u2", 1, 4, 99)).unwrap();

        let all = store.get_history("u1", TimeWindow::until(at(23))).unwrap();
        let seqs: Vec<_> = all.iter().filter_map(|e| e.sequence).collect();
        assert_eq!(seqs, [1, 2, 3]);

        let window = TimeWindow::new(at(4), at(6)).unwrap();
        let some = store.get_history("u1", window).unwrap();
        assert_eq!(some.len(), 1);
        assert_eq!(some[0].content_length, 20);
    }

    #[test]
    fn test_append_same_sequence_replaces() {
        let store = MemoryStore::new();
        store.append_event(&event("u1", 1, 3, 10)).unwrap();
        store.append_event(&event("u1", 1, 3, 11)).unwrap();

        let all = store.get_history("u1", TimeWindow::until(at(23))).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].content_length, 11);
    }

    #[test]
    fn test_append_requires_sequence() {
        let store = MemoryStore::new();
        let unsequenced = Event::message("u1", "c1", Role::User, at(1).fixed_offset(), 1);
        assert!(matches!(
            store.append_event(&unsequenced),
            Err(Error::InvalidEvent(_))
        ));
    }

    #[test]
    fn test_list_stale_users() {
        let store = MemoryStore::new();
        store.put_aggregate(&StatAggregate::new("old", at(1))).unwrap();
        store.put_aggregate(&StatAggregate::new("new", at(10))).unwrap();

        let stale = store.list_stale_users(at(1) + Duration::hours(2)).unwrap();
        assert_eq!(stale, ["old"]);
    }
}
