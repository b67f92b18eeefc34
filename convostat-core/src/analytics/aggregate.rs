//! Per-user statistics bundle.
//!
//! A [`StatAggregate`] is the root entity the store keeps per user. It is
//! produced either by folding events through the
//! [`StreamingUpdater`](super::StreamingUpdater) or in one pass by the
//! [`BatchCalculator`](super::BatchCalculator); both must arrive at the same
//! values for the same events.

use chrono::{DateTime, Datelike, Duration, FixedOffset, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::topk::TopKTracker;
use crate::error::{Error, Result};
use crate::types::Role;

/// Conversations touched within this many hours of the latest event are active.
pub const ACTIVE_WINDOW_HOURS: i64 = 24;

/// Number of tags kept in [`TagStats::top_tags`].
pub const TOP_TAG_COUNT: usize = 5;

/// Length of the activity window.
pub fn active_window() -> Duration {
    Duration::hours(ACTIVE_WINDOW_HOURS)
}

/// Hour-of-day (0-23) and weekday (0 = Monday) of a timestamp in its own offset.
pub fn calendar_slots(ts: &DateTime<FixedOffset>) -> (usize, usize) {
    (ts.hour() as usize, ts.weekday().num_days_from_monday() as usize)
}

// ============================================
// Sub-aggregates
// ============================================

/// Message volume and length statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageStats {
    pub total: u64,
    pub user_count: u64,
    pub assistant_count: u64,
    /// Mean user message length, 0.0 when there are none
    pub avg_user_length: f64,
    /// Mean assistant message length, 0.0 when there are none
    pub avg_assistant_length: f64,
}

/// When messages happen and how fast the assistant answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeStats {
    /// Message count by hour of day (0-23)
    pub hour_histogram: [u64; 24],
    /// Message count by weekday (0 = Monday)
    pub weekday_histogram: [u64; 7],
    /// Mean seconds between a user message and the assistant reply to it
    pub avg_response_latency: f64,
    /// Number of replies included in the latency mean
    pub latency_samples: u64,
}

impl Default for TimeStats {
    fn default() -> Self {
        Self {
            hour_histogram: [0; 24],
            weekday_histogram: [0; 7],
            avg_response_latency: 0.0,
            latency_samples: 0,
        }
    }
}

impl TimeStats {
    /// Busiest hour (0-23); the earliest hour wins ties. `None` without messages.
    pub fn peak_hour(&self) -> Option<u8> {
        first_max(&self.hour_histogram).map(|h| h as u8)
    }

    /// Busiest weekday (0 = Monday); the earliest day wins ties.
    pub fn busiest_weekday(&self) -> Option<u8> {
        first_max(&self.weekday_histogram).map(|d| d as u8)
    }

    /// Get day name from index.
    pub fn day_name(day: u8) -> &'static str {
        match day {
            0 => "Monday",
            1 => "Tuesday",
            2 => "Wednesday",
            3 => "Thursday",
            4 => "Friday",
            5 => "Saturday",
            6 => "Sunday",
            _ => "Unknown",
        }
    }
}

fn first_max(counts: &[u64]) -> Option<usize> {
    let mut best: Option<(usize, u64)> = None;
    for (i, &c) in counts.iter().enumerate() {
        if c > 0 && best.map_or(true, |(_, b)| c > b) {
            best = Some((i, c));
        }
    }
    best.map(|(i, _)| i)
}

/// Category popularity, counted once per conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryStats {
    ranking: TopKTracker,
}

impl Default for CategoryStats {
    fn default() -> Self {
        Self {
            ranking: TopKTracker::new(1),
        }
    }
}

impl CategoryStats {
    pub fn distribution(&self) -> &BTreeMap<String, u64> {
        self.ranking.distribution()
    }

    /// Category with the highest count; on a tie the incumbent stays.
    pub fn dominant_category(&self) -> Option<&str> {
        self.ranking.leader()
    }

    pub(crate) fn record(&mut self, category: &str) {
        self.ranking.increment(category);
    }
}

/// Tag popularity, counted once per conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagStats {
    ranking: TopKTracker,
}

impl Default for TagStats {
    fn default() -> Self {
        Self {
            ranking: TopKTracker::new(TOP_TAG_COUNT),
        }
    }
}

impl TagStats {
    pub fn distribution(&self) -> &BTreeMap<String, u64> {
        self.ranking.distribution()
    }

    /// Up to five most used tags, best first.
    pub fn top_tags(&self) -> &[String] {
        self.ranking.leaders()
    }

    pub(crate) fn record(&mut self, tag: &str) {
        self.ranking.increment(tag);
    }
}

/// What the aggregate remembers about one conversation.
///
/// Kept while the conversation is open, and for the activity window after it
/// closes, so that categories and tags are counted once per conversation and
/// reply latency can be matched to the preceding user message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTrack {
    pub last_touched_at: DateTime<Utc>,
    pub last_role: Option<Role>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub categories: BTreeSet<String>,
    pub tags: BTreeSet<String>,
    pub closed: bool,
}

impl ConversationTrack {
    pub fn new(touched_at: DateTime<Utc>) -> Self {
        Self {
            last_touched_at: touched_at,
            last_role: None,
            last_message_at: None,
            categories: BTreeSet::new(),
            tags: BTreeSet::new(),
            closed: false,
        }
    }
}

/// Conversation lifecycle statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationStats {
    /// Number of closed conversations
    pub total_conversations: u64,
    /// Conversations touched within 24h of the latest event
    pub active_in_window: u64,
    /// Mean message count over closed conversations
    pub avg_messages_per_conversation: f64,
    /// Mean duration over closed conversations, in minutes
    pub avg_conversation_duration_minutes: f64,
    /// Per-conversation state, keyed by conversation id
    pub tracked: BTreeMap<String, ConversationTrack>,
}

impl ConversationStats {
    /// Drop closed conversations idle for longer than the activity window and
    /// recount the active ones, relative to `reference`.
    pub fn refresh_window(&mut self, reference: DateTime<Utc>) {
        let cutoff = reference - active_window();
        self.tracked
            .retain(|_, track| !track.closed || track.last_touched_at >= cutoff);
        self.active_in_window = self
            .tracked
            .values()
            .filter(|track| track.last_touched_at >= cutoff)
            .count() as u64;
    }
}

// ============================================
// StatAggregate
// ============================================

/// The per-user analytics root entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatAggregate {
    pub user_id: String,
    /// Timestamp of the earliest applied event
    pub period_start: Option<DateTime<Utc>>,
    /// Timestamp of the latest applied event
    pub period_end: Option<DateTime<Utc>>,
    pub messages: MessageStats,
    pub time: TimeStats,
    pub categories: CategoryStats,
    pub tags: TagStats,
    pub conversations: ConversationStats,
    /// Latest activity: the newest event time, or creation time before any event
    pub last_updated_at: DateTime<Utc>,
    /// Number of events applied; the next event must carry this plus one
    pub event_sequence_number: u64,
}

impl StatAggregate {
    /// An aggregate with no events applied.
    pub fn new(user_id: &str, created_at: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            period_start: None,
            period_end: None,
            messages: MessageStats::default(),
            time: TimeStats::default(),
            categories: CategoryStats::default(),
            tags: TagStats::default(),
            conversations: ConversationStats::default(),
            last_updated_at: created_at,
            event_sequence_number: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.event_sequence_number == 0
    }

    pub fn next_sequence(&self) -> u64 {
        self.event_sequence_number + 1
    }

    /// Check every structural invariant.
    pub fn validate(&self) -> Result<()> {
        let corrupt = |message: String| Error::CorruptAggregate {
            user_id: self.user_id.clone(),
            message,
        };

        let m = &self.messages;
        if m.total != m.user_count + m.assistant_count {
            return Err(corrupt(format!(
                "total {} != user {} + assistant {}",
                m.total, m.user_count, m.assistant_count
            )));
        }
        let hour_sum: u64 = self.time.hour_histogram.iter().sum();
        let weekday_sum: u64 = self.time.weekday_histogram.iter().sum();
        if hour_sum != m.total || weekday_sum != m.total {
            return Err(corrupt(format!(
                "histograms ({} by hour, {} by weekday) do not sum to {} messages",
                hour_sum, weekday_sum, m.total
            )));
        }
        if self.time.latency_samples > m.assistant_count {
            return Err(corrupt(format!(
                "{} latency samples exceed {} assistant messages",
                self.time.latency_samples, m.assistant_count
            )));
        }

        let averages = [
            ("avg_user_length", m.avg_user_length, m.user_count),
            ("avg_assistant_length", m.avg_assistant_length, m.assistant_count),
            (
                "avg_response_latency",
                self.time.avg_response_latency,
                self.time.latency_samples,
            ),
            (
                "avg_messages_per_conversation",
                self.conversations.avg_messages_per_conversation,
                self.conversations.total_conversations,
            ),
            (
                "avg_conversation_duration_minutes",
                self.conversations.avg_conversation_duration_minutes,
                self.conversations.total_conversations,
            ),
        ];
        for (name, value, count) in averages {
            if !value.is_finite() || value < 0.0 {
                return Err(corrupt(format!("{} is {}", name, value)));
            }
            if count == 0 && value != 0.0 {
                return Err(corrupt(format!("{} is {} with no samples", name, value)));
            }
        }

        self.categories
            .ranking
            .validate()
            .map_err(|e| corrupt(format!("categories: {}", e)))?;
        self.tags
            .ranking
            .validate()
            .map_err(|e| corrupt(format!("tags: {}", e)))?;

        if self.conversations.active_in_window > self.conversations.tracked.len() as u64 {
            return Err(corrupt("more active conversations than tracked".to_string()));
        }
        if let (Some(start), Some(end)) = (self.period_start, self.period_end) {
            if start > end {
                return Err(corrupt(format!("period start {} after end {}", start, end)));
            }
        }
        if self.event_sequence_number == 0 && (m.total > 0 || self.period_end.is_some()) {
            return Err(corrupt("events recorded with sequence 0".to_string()));
        }
        Ok(())
    }
}
