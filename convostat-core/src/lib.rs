//! # convostat-core
//!
//! Core library for convostat - per-user conversation analytics.
//!
//! This library provides:
//! - Domain types for conversation events and time windows
//! - Streaming and batch computation of per-user aggregates
//! - Storage behind the [`AnalyticsStore`] trait, with SQLite and in-memory backends
//! - Retention sweeps, configuration, and logging
//!
//! ## Consistency
//!
//! The aggregate kept up to date event by event must equal the one recomputed
//! from history over the same events: counts and rankings exactly, averages
//! within floating-point rounding. [`AnalyticsService::reconcile`] replaces the
//! stored aggregate with a recomputed one whenever the two may have diverged.
//!
//! ## Example
//!
//! ```rust,no_run
//! use convostat_core::{AnalyticsService, Config, Database, Event, Role};
//!
//! let config = Config::load().expect("failed to load config");
//! let db = Database::open(&Config::database_path(), &config.store)
//!     .expect("failed to open database");
//! db.migrate().expect("failed to run migrations");
//!
//! let service = AnalyticsService::new(db);
//! let event = Event::message("alice", "conv-1", Role::User, chrono::Utc::now().fixed_offset(), 42);
//! let aggregate = service.apply_event("alice", event).expect("failed to apply event");
//! println!("{} messages", aggregate.messages.total);
//! ```

// Re-export commonly used items at the crate root
pub use analytics::{BatchCalculator, StatAggregate, StreamingUpdater, TopKTracker, UsageTrends};
pub use config::Config;
pub use db::{AnalyticsStore, Database, MemoryStore};
pub use error::{Error, Result};
pub use retention::{RetentionSweeper, SweepReport};
pub use retry::Backoff;
pub use service::AnalyticsService;
pub use types::*;

// Public modules
pub mod analytics;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod retention;
pub mod retry;
pub mod service;
pub mod types;
