//! SQLite-backed analytics store
//!
//! Aggregates are stored whole as JSON, one row per user, so a put is a
//! single atomic upsert. History rows keep the raw event JSON next to the
//! columns used for window queries.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::{stored_sequence, AnalyticsStore};
use crate::analytics::StatAggregate;
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::types::{Event, TimeWindow};

/// Map SQLite contention to a retryable error; everything else stays a
/// database error.
fn store_error(err: rusqlite::Error) -> Error {
    match err.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
            Error::StoreUnavailable(err.to_string())
        }
        _ => Error::Database(err),
    }
}

/// Database handle with connection pooling (single connection for now)
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: &Path, store: &StoreConfig) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(store.busy_timeout())?;

        // WAL lets readers proceed while a writer holds the lock
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;

        tracing::debug!(path = %path.display(), "Opened analytics database");

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        let conn = self.connection()?;
        super::schema::run_migrations(&conn)
    }

    /// Get the underlying connection (for advanced use)
    pub fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::StoreUnavailable("database connection lock poisoned".to_string()))
    }

    /// Number of stored aggregates.
    pub fn count_aggregates(&self) -> Result<i64> {
        let conn = self.connection()?;
        conn.query_row("SELECT COUNT(*) FROM aggregates", [], |r| r.get(0))
            .map_err(store_error)
    }

    /// Number of stored history events across all users.
    pub fn count_events(&self) -> Result<i64> {
        let conn = self.connection()?;
        conn.query_row("SELECT COUNT(*) FROM events", [], |r| r.get(0))
            .map_err(store_error)
    }

    /// Every user with a stored aggregate, sorted.
    pub fn list_users(&self) -> Result<Vec<String>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare("SELECT user_id FROM aggregates ORDER BY user_id")
            .map_err(store_error)?;
        let users = stmt
            .query_map([], |row| row.get(0))
            .map_err(store_error)?
            .collect::<rusqlite::Result<Vec<String>>>()
            .map_err(store_error)?;
        Ok(users)
    }
}

impl AnalyticsStore for Database {
    // ============================================
    // Aggregate operations
    // ============================================

    fn get_aggregate(&self, user_id: &str) -> Result<Option<StatAggregate>> {
        let conn = self.connection()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM aggregates WHERE user_id = ?",
                [user_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(store_error)?;

        body.map(|json| {
            serde_json::from_str(&json).map_err(|e| Error::CorruptAggregate {
                user_id: user_id.to_string(),
                message: format!("stored body does not parse: {}", e),
            })
        })
        .transpose()
    }

    fn put_aggregate(&self, aggregate: &StatAggregate) -> Result<()> {
        let body = serde_json::to_string(aggregate)?;
        let conn = self.connection()?;
        conn.execute(
            r#"
            INSERT INTO aggregates (user_id, event_sequence_number, last_updated_at, body, stored_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(user_id) DO UPDATE SET
                event_sequence_number = excluded.event_sequence_number,
                last_updated_at = excluded.last_updated_at,
                body = excluded.body,
                stored_at = excluded.stored_at
            "#,
            params![
                aggregate.user_id,
                aggregate.event_sequence_number as i64,
                aggregate.last_updated_at.timestamp_micros(),
                body,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(store_error)?;
        Ok(())
    }

    fn delete_aggregate(&self, user_id: &str) -> Result<()> {
        let conn = self.connection()?;
        conn.execute("DELETE FROM aggregates WHERE user_id = ?", [user_id])
            .map_err(store_error)?;
        Ok(())
    }

    fn list_stale_users(&self, older_than: DateTime<Utc>) -> Result<Vec<String>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(
                "SELECT user_id FROM aggregates WHERE last_updated_at < ? ORDER BY user_id",
            )
            .map_err(store_error)?;
        let users = stmt
            .query_map([older_than.timestamp_micros()], |row| row.get(0))
            .map_err(store_error)?
            .collect::<rusqlite::Result<Vec<String>>>()
            .map_err(store_error)?;
        Ok(users)
    }

    // ============================================
    // History operations
    // ============================================

    fn append_event(&self, event: &Event) -> Result<()> {
        let sequence = stored_sequence(event)?;
        let raw = serde_json::to_string(event)?;
        let conn = self.connection()?;
        conn.execute(
            r#"
            INSERT INTO events (user_id, sequence, conversation_id, ts, raw_data, recorded_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(user_id, sequence) DO UPDATE SET
                conversation_id = excluded.conversation_id,
                ts = excluded.ts,
                raw_data = excluded.raw_data,
                recorded_at = excluded.recorded_at
            "#,
            params![
                event.user_id,
                sequence as i64,
                event.conversation_id,
                event.timestamp_utc().timestamp_micros(),
                raw,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(store_error)?;
        Ok(())
    }

    fn get_history(&self, user_id: &str, window: TimeWindow) -> Result<Vec<Event>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT raw_data FROM events
                WHERE user_id = ?1 AND ts >= ?2 AND ts <= ?3
                ORDER BY sequence
                "#,
            )
            .map_err(store_error)?;
        let rows = stmt
            .query_map(
                params![
                    user_id,
                    window.start.timestamp_micros(),
                    window.end.timestamp_micros()
                ],
                |row| row.get::<_, String>(0),
            )
            .map_err(store_error)?
            .collect::<rusqlite::Result<Vec<String>>>()
            .map_err(store_error)?;

        rows.iter()
            .map(|raw| serde_json::from_str(raw).map_err(Error::from))
            .collect()
    }

    fn delete_history(&self, user_id: &str) -> Result<()> {
        let conn = self.connection()?;
        let deleted = conn
            .execute("DELETE FROM events WHERE user_id = ?", [user_id])
            .map_err(store_error)?;
        tracing::debug!(user_id, deleted, "Deleted history");
        Ok(())
    }
}
