//! Retention sweeps.
//!
//! A sweep deletes every user whose aggregate has not been updated within
//! the configured horizon. Each delete attempt takes that user's lock and
//! re-reads the aggregate first, so a user updated after the stale listing
//! is kept. Backoff between attempts happens with the lock released, and a
//! failing user does not stop the sweep.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::config::RetentionConfig;
use crate::db::AnalyticsStore;
use crate::error::Result;
use crate::retry::with_backoff;
use crate::service::AnalyticsService;

/// A user the sweep could not delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepFailure {
    pub user_id: String,
    pub error: String,
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Users older than this were considered stale
    pub cutoff: Option<DateTime<Utc>>,
    pub swept: Vec<String>,
    /// Listed as stale but updated or removed before the delete
    pub skipped: Vec<String>,
    pub failed: Vec<SweepFailure>,
    /// Idle lock entries dropped after the sweep
    pub pruned_locks: usize,
}

impl SweepReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Deletes data for users idle longer than the horizon.
#[derive(Debug, Clone, Copy)]
pub struct RetentionSweeper {
    horizon: Duration,
}

impl RetentionSweeper {
    pub fn new(horizon: Duration) -> Self {
        Self { horizon }
    }

    /// Build from config. Fails when no horizon is configured.
    pub fn from_config(config: &RetentionConfig) -> Result<Self> {
        Ok(Self::new(config.horizon()?))
    }

    pub fn horizon(&self) -> Duration {
        self.horizon
    }

    /// Delete every user last updated before `now - horizon`.
    ///
    /// Only listing the stale users can fail the sweep as a whole; per-user
    /// failures are collected in the report.
    pub fn sweep<S: AnalyticsStore>(
        &self,
        service: &AnalyticsService<S>,
        now: DateTime<Utc>,
    ) -> Result<SweepReport> {
        let cutoff = now - self.horizon;
        let store = service.store();
        let stale = with_backoff(service.backoff(), "list_stale_users", || {
            store.list_stale_users(cutoff)
        })?;

        tracing::info!(%cutoff, stale_users = stale.len(), "Starting retention sweep");

        let mut report = SweepReport {
            cutoff: Some(cutoff),
            ..SweepReport::default()
        };

        for user_id in stale {
            let result = with_backoff(service.backoff(), "delete_user_data", || {
                service
                    .locks()
                    .with_user(&user_id, || Self::delete_if_stale(store, &user_id, cutoff))
            });
            match result {
                Ok(true) => {
                    tracing::debug!(user_id = %user_id, "Swept user");
                    report.swept.push(user_id);
                }
                Ok(false) => {
                    tracing::debug!(user_id = %user_id, "User no longer stale, skipped");
                    report.skipped.push(user_id);
                }
                Err(e) => {
                    tracing::warn!(user_id = %user_id, error = %e, "Failed to sweep user");
                    report.failed.push(SweepFailure {
                        user_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        report.pruned_locks = service.locks().prune();

        tracing::info!(
            swept = report.swept.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            pruned_locks = report.pruned_locks,
            "Retention sweep complete"
        );
        Ok(report)
    }

    /// Delete `user_id` if its aggregate is still older than `cutoff`.
    /// Must run under the user's lock.
    fn delete_if_stale<S: AnalyticsStore>(
        store: &S,
        user_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<bool> {
        match store.get_aggregate(user_id)? {
            Some(aggregate) if aggregate.last_updated_at < cutoff => {
                store.delete_user_data(user_id)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
