//! Analytics module for convostat
//!
//! Two paths produce the same [`StatAggregate`]:
//! - [`StreamingUpdater`]: applies one event at a time to the current aggregate
//! - [`BatchCalculator`]: folds a complete event list in one pass
//!
//! [`compute_trends`] derives day-level usage trends from raw history.

pub mod aggregate;
pub mod batch;
pub mod streaming;
pub mod topk;
pub mod trends;

pub use aggregate::{
    CategoryStats, ConversationStats, ConversationTrack, MessageStats, StatAggregate, TagStats,
    TimeStats, ACTIVE_WINDOW_HOURS, TOP_TAG_COUNT,
};
pub use batch::BatchCalculator;
pub use streaming::{running_mean, StreamingUpdater};
pub use topk::TopKTracker;
pub use trends::{compute_trends, UsageTrends};
