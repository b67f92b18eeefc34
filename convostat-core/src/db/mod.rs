//! Storage layer for convostat
//!
//! Aggregates and raw event history live behind [`AnalyticsStore`]:
//! - [`Database`]: SQLite with schema migrations, used by the CLI
//! - [`MemoryStore`]: process-local maps for tests and embedding

pub mod memory;
pub mod repo;
pub mod schema;

pub use memory::MemoryStore;
pub use repo::Database;

use chrono::{DateTime, Utc};

use crate::analytics::StatAggregate;
use crate::error::{Error, Result};
use crate::types::{Event, TimeWindow};

/// Durable keyed storage for per-user aggregates and their event history.
///
/// Every call is atomic on its own. Callers that need read-modify-write
/// serialize per user themselves (see
/// [`AnalyticsService`](crate::service::AnalyticsService)).
pub trait AnalyticsStore: Send + Sync {
    /// Stored aggregate for `user_id`, if any.
    fn get_aggregate(&self, user_id: &str) -> Result<Option<StatAggregate>>;

    /// Replace the user's aggregate.
    fn put_aggregate(&self, aggregate: &StatAggregate) -> Result<()>;

    /// Record an event in the user's history.
    ///
    /// The event must carry a sequence. Appending a sequence that already
    /// exists replaces the stored event.
    fn append_event(&self, event: &Event) -> Result<()>;

    /// History events inside `window`, in sequence order.
    fn get_history(&self, user_id: &str, window: TimeWindow) -> Result<Vec<Event>>;

    /// Remove the user's history. Removing nothing is not an error.
    fn delete_history(&self, user_id: &str) -> Result<()>;

    /// Remove the user's aggregate. Removing nothing is not an error.
    fn delete_aggregate(&self, user_id: &str) -> Result<()>;

    /// Users whose aggregate was last updated before `older_than`.
    fn list_stale_users(&self, older_than: DateTime<Utc>) -> Result<Vec<String>>;

    /// Remove everything stored for the user.
    ///
    /// History goes first: if the aggregate delete fails, the user is still
    /// listed as stale and the next sweep finishes the job.
    fn delete_user_data(&self, user_id: &str) -> Result<()> {
        self.delete_history(user_id)?;
        self.delete_aggregate(user_id)
    }

    /// Stored aggregate, or [`Error::NotFound`].
    fn require_aggregate(&self, user_id: &str) -> Result<StatAggregate> {
        self.get_aggregate(user_id)?
            .ok_or_else(|| Error::NotFound(user_id.to_string()))
    }
}

/// Sequence of an event about to be stored.
pub(crate) fn stored_sequence(event: &Event) -> Result<u64> {
    event.sequence.ok_or_else(|| {
        Error::InvalidEvent(format!(
            "cannot store event for {} without a sequence",
            event.user_id
        ))
    })
}
