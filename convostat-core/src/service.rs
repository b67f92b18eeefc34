//! Query and update surface over an [`AnalyticsStore`].
//!
//! Every read-modify-write of a user's aggregate (get, streaming update,
//! append history, put) runs under that user's lock. Different users never
//! wait on each other. Batch recomputation runs outside the lock; a
//! reconcile takes the lock only to merge events that arrived meanwhile and
//! to store the result.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::analytics::{
    compute_trends, BatchCalculator, StatAggregate, StreamingUpdater, UsageTrends,
};
use crate::db::AnalyticsStore;
use crate::error::{Error, Result};
use crate::retry::{with_backoff, Backoff};
use crate::types::{Event, TimeWindow};

// ============================================
// Per-user locks
// ============================================

/// Lazily created mutual exclusion per user id.
#[derive(Debug, Default)]
pub struct UserLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, user_id: &str) -> Arc<Mutex<()>> {
        // The map and the per-user mutexes guard no data of their own, so a
        // poisoned lock is still usable.
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(user_id.to_string()).or_default())
    }

    /// Run `f` while holding `user_id`'s lock.
    pub fn with_user<T>(&self, user_id: &str, f: impl FnOnce() -> T) -> T {
        let handle = self.handle(user_id);
        let _guard = handle.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }

    /// Drop lock entries nobody is holding or waiting on. Returns how many
    /// were removed.
    pub fn prune(&self) -> usize {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let before = locks.len();
        locks.retain(|_, handle| Arc::strong_count(handle) > 1);
        before - locks.len()
    }

    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================
// Service
// ============================================

/// Per-user analytics over a store.
pub struct AnalyticsService<S: AnalyticsStore> {
    store: S,
    locks: UserLocks,
    updater: StreamingUpdater,
    calculator: BatchCalculator,
    backoff: Backoff,
}

impl<S: AnalyticsStore> AnalyticsService<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            locks: UserLocks::new(),
            updater: StreamingUpdater::new(),
            calculator: BatchCalculator::new(),
            backoff: Backoff::new(3),
        }
    }

    /// Use `backoff` for transient store failures.
    pub fn with_retry(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn locks(&self) -> &UserLocks {
        &self.locks
    }

    pub(crate) fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Load and check the stored aggregate.
    fn load(&self, user_id: &str) -> Result<StatAggregate> {
        let aggregate = with_backoff(&self.backoff, "get_aggregate", || {
            self.store.require_aggregate(user_id)
        })?;
        if aggregate.user_id != user_id {
            return Err(Error::CorruptAggregate {
                user_id: user_id.to_string(),
                message: format!("stored aggregate belongs to {}", aggregate.user_id),
            });
        }
        aggregate.validate()?;
        Ok(aggregate)
    }

    fn store_aggregate(&self, aggregate: &StatAggregate) -> Result<()> {
        with_backoff(&self.backoff, "put_aggregate", || {
            self.store.put_aggregate(aggregate)
        })
    }

    fn history(&self, user_id: &str, window: TimeWindow) -> Result<Vec<Event>> {
        with_backoff(&self.backoff, "get_history", || {
            self.store.get_history(user_id, window)
        })
    }

    // ============================================
    // Streaming path
    // ============================================

    /// Apply one event to the user's aggregate and record it in history.
    ///
    /// Events without a sequence get the next one. An explicit sequence that
    /// does not follow the stored aggregate fails with [`Error::StaleEvent`].
    pub fn apply_event(&self, user_id: &str, event: Event) -> Result<StatAggregate> {
        if event.user_id != user_id {
            return Err(Error::InvalidEvent(format!(
                "event for {} submitted as {}",
                event.user_id, user_id
            )));
        }
        self.locks
            .with_user(user_id, || self.apply_locked(user_id, event))
    }

    fn apply_locked(&self, user_id: &str, mut event: Event) -> Result<StatAggregate> {
        let current = match self.load(user_id) {
            Ok(aggregate) => aggregate,
            Err(Error::NotFound(_)) => StatAggregate::new(user_id, Utc::now()),
            Err(e) => return Err(e),
        };

        let sequence = *event.sequence.get_or_insert(current.next_sequence());
        let next = self.updater.apply(&current, &event).map_err(|e| {
            tracing::warn!(user_id, sequence, error = %e, "Rejected event");
            e
        })?;

        with_backoff(&self.backoff, "append_event", || {
            self.store.append_event(&event)
        })?;
        self.store_aggregate(&next)?;

        tracing::debug!(
            user_id,
            sequence,
            conversation_id = %event.conversation_id,
            "Applied event"
        );
        Ok(next)
    }

    /// Apply an event, reconciling first if it is out of sequence.
    ///
    /// An event the reconciled aggregate already covers is not applied
    /// again.
    pub fn ingest(&self, user_id: &str, event: Event) -> Result<StatAggregate> {
        match self.apply_event(user_id, event.clone()) {
            Err(Error::StaleEvent { expected, got, .. }) => {
                tracing::info!(user_id, expected, got, "Stale event, reconciling");
                let reconciled = self.reconcile(user_id)?;
                match event.sequence {
                    Some(seq) if seq <= reconciled.event_sequence_number => Ok(reconciled),
                    _ => self.apply_event(user_id, event),
                }
            }
            other => other,
        }
    }

    // ============================================
    // Queries
    // ============================================

    /// The user's aggregate, creating and storing an empty one on first access.
    pub fn get_current(&self, user_id: &str) -> Result<StatAggregate> {
        self.locks.with_user(user_id, || match self.load(user_id) {
            Ok(aggregate) => Ok(aggregate),
            Err(Error::NotFound(_)) => {
                let aggregate = StatAggregate::new(user_id, Utc::now());
                self.store_aggregate(&aggregate)?;
                tracing::debug!(user_id, "Created empty aggregate");
                Ok(aggregate)
            }
            Err(e) => Err(e),
        })
    }

    /// Recompute the aggregate for `window` from history without storing it.
    pub fn recompute(&self, user_id: &str, window: TimeWindow) -> Result<StatAggregate> {
        let history = self.history(user_id, window)?;
        self.calculator.compute(user_id, &history, window)
    }

    /// Replace the stored aggregate with one recomputed from full history.
    ///
    /// Events appended while the recomputation ran are applied on top before
    /// the result is stored.
    pub fn reconcile(&self, user_id: &str) -> Result<StatAggregate> {
        let window = TimeWindow::all();
        let snapshot = self.history(user_id, window)?;
        let mut batch = self.calculator.compute(user_id, &snapshot, window)?;
        // History sequence numbers are authoritative
        if let Some(last) = snapshot.last().and_then(|e| e.sequence) {
            batch.event_sequence_number = last;
        }

        self.locks.with_user(user_id, || {
            if batch.is_empty() {
                batch.last_updated_at = match self.load(user_id) {
                    Ok(existing) => existing.last_updated_at,
                    Err(Error::NotFound(_)) | Err(Error::CorruptAggregate { .. }) => Utc::now(),
                    Err(e) => return Err(e),
                };
            }

            let covered = batch.event_sequence_number;
            let latest = self.history(user_id, window)?;
            let mut merged = 0usize;
            for event in latest.iter().filter(|e| e.sequence > Some(covered)) {
                batch = self.updater.apply(&batch, event)?;
                merged += 1;
            }

            self.store_aggregate(&batch)?;
            tracing::info!(
                user_id,
                recomputed_events = snapshot.len(),
                merged_events = merged,
                sequence = batch.event_sequence_number,
                "Reconciled aggregate"
            );
            Ok(batch.clone())
        })
    }

    /// Day-level trends over the last `days` days.
    pub fn usage_trends(&self, user_id: &str, days: u32) -> Result<UsageTrends> {
        self.usage_trends_at(user_id, days, Utc::now())
    }

    /// Day-level trends over the `days` days ending at `now`.
    pub fn usage_trends_at(
        &self,
        user_id: &str,
        days: u32,
        now: DateTime<Utc>,
    ) -> Result<UsageTrends> {
        let window = TimeWindow::last_days(now, days);
        let history = self.history(user_id, window)?;
        Ok(compute_trends(&history, window))
    }
}
