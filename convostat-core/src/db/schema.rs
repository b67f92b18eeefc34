//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: aggregates and event history
    r#"
    -- One row per user. `body` is the serialized StatAggregate; the
    -- other columns are copies used for lookups.
    CREATE TABLE IF NOT EXISTS aggregates (
        user_id               TEXT PRIMARY KEY,
        event_sequence_number INTEGER NOT NULL,
        last_updated_at       INTEGER NOT NULL,  -- unix micros
        body                  JSON NOT NULL,
        stored_at             DATETIME NOT NULL
    );

    CREATE TABLE IF NOT EXISTS events (
        user_id          TEXT NOT NULL,
        sequence         INTEGER NOT NULL,
        conversation_id  TEXT NOT NULL,
        ts               INTEGER NOT NULL,       -- unix micros
        raw_data         JSON NOT NULL,
        recorded_at      DATETIME NOT NULL,
        PRIMARY KEY (user_id, sequence)
    );
    "#,
    // Version 2: indexes for window and staleness queries
    r#"
    CREATE INDEX IF NOT EXISTS idx_events_user_ts ON events(user_id, ts);
    CREATE INDEX IF NOT EXISTS idx_aggregates_last_updated ON aggregates(last_updated_at);
    "#,
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let current_version = get_schema_version(conn)?;

    tracing::info!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking database migrations"
    );

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute(&format!("PRAGMA user_version = {}", version), [])?;
        }
    }

    if current_version < SCHEMA_VERSION {
        tracing::info!(
            from = current_version,
            to = SCHEMA_VERSION,
            "Migrations complete"
        );
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_idempotent() {
        let conn = Connection::open_in_memory().unwrap();

        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let version = get_schema_version(&conn).unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_tables_and_indexes_created() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        for (kind, name) in [
            ("table", "aggregates"),
            ("table", "events"),
            ("index", "idx_events_user_ts"),
            ("index", "idx_aggregates_last_updated"),
        ] {
            let exists: i32 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = ?1 AND name = ?2",
                    [kind, name],
                    |r| r.get(0),
                )
                .unwrap();
            assert_eq!(exists, 1, "{} {} should exist", kind, name);
        }
    }
}
