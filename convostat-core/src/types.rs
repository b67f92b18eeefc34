//! Core domain types for convostat
//!
//! These types describe the input side of the analytics core: the finalized
//! conversation events handed over by the chat collaborator, and the time
//! windows used to select history for batch recomputation.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Event** | One finalized fact: a message, or the close of a conversation |
//! | **Conversation** | A thread of messages between one user and the assistant |
//! | **Sequence** | Position of an event in a user's stream, starting at 1 |
//! | **Window** | Inclusive time range used to filter history |

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::{Error, Result};

// ============================================
// Role
// ============================================

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The person using the chat
    User,
    /// The model replying
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            _ => Err(format!("unknown role: {}", s)),
        }
    }
}

// ============================================
// Event
// ============================================

/// What an event represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A message was appended to a conversation
    Message,
    /// A conversation was closed
    ConversationClosed,
}

/// A finalized conversation event.
///
/// One event is produced per message, plus a terminal event when a
/// conversation closes. Close events carry `conversation_duration_seconds`
/// and use `message_count_delta` for the number of messages the
/// conversation held; their `role`, `content_length`, category and tags are
/// not counted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// User the event belongs to
    pub user_id: String,
    /// Conversation the event belongs to
    pub conversation_id: String,
    /// Position in the user's stream. `None` lets the service assign the next one.
    #[serde(default)]
    pub sequence: Option<u64>,
    /// When the event happened, in the author's local offset
    pub timestamp: DateTime<FixedOffset>,
    /// Message author
    pub role: Role,
    /// Message length in characters
    #[serde(default)]
    pub content_length: i64,
    /// Seconds between the preceding user message and this assistant reply
    #[serde(default)]
    pub response_latency_seconds: Option<f64>,
    /// Conversation category, if assigned
    #[serde(default)]
    pub category: Option<String>,
    /// Conversation tags
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Set only on the event that closes a conversation
    #[serde(default)]
    pub conversation_duration_seconds: Option<f64>,
    /// Messages contributed by this event (message count on close events)
    #[serde(default = "default_message_count_delta")]
    pub message_count_delta: i64,
}

fn default_message_count_delta() -> i64 {
    1
}

impl Event {
    /// Create a message event.
    pub fn message(
        user_id: &str,
        conversation_id: &str,
        role: Role,
        timestamp: DateTime<FixedOffset>,
        content_length: i64,
    ) -> Self {
        Self {
            user_id: user_id.to_string(),
            conversation_id: conversation_id.to_string(),
            sequence: None,
            timestamp,
            role,
            content_length,
            response_latency_seconds: None,
            category: None,
            tags: BTreeSet::new(),
            conversation_duration_seconds: None,
            message_count_delta: 1,
        }
    }

    /// Create the terminal event for a conversation.
    pub fn conversation_closed(
        user_id: &str,
        conversation_id: &str,
        timestamp: DateTime<FixedOffset>,
        duration_seconds: f64,
        message_count: i64,
    ) -> Self {
        Self {
            user_id: user_id.to_string(),
            conversation_id: conversation_id.to_string(),
            sequence: None,
            timestamp,
            role: Role::Assistant,
            content_length: 0,
            response_latency_seconds: None,
            category: None,
            tags: BTreeSet::new(),
            conversation_duration_seconds: Some(duration_seconds),
            message_count_delta: message_count,
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    pub fn with_latency(mut self, seconds: f64) -> Self {
        self.response_latency_seconds = Some(seconds);
        self
    }

    pub fn with_category(mut self, category: &str) -> Self {
        self.category = Some(category.to_string());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn kind(&self) -> EventKind {
        if self.conversation_duration_seconds.is_some() {
            EventKind::ConversationClosed
        } else {
            EventKind::Message
        }
    }

    /// Event time as UTC.
    pub fn timestamp_utc(&self) -> DateTime<Utc> {
        self.timestamp.with_timezone(&Utc)
    }

    /// Check the event for malformed or out-of-range fields.
    pub fn validate(&self) -> Result<()> {
        if self.user_id.is_empty() {
            return Err(Error::InvalidEvent("user_id is empty".to_string()));
        }
        if self.conversation_id.is_empty() {
            return Err(Error::InvalidEvent("conversation_id is empty".to_string()));
        }
        if self.content_length < 0 {
            return Err(Error::InvalidEvent(format!(
                "content_length must be >= 0, got {}",
                self.content_length
            )));
        }
        if self.message_count_delta < 0 {
            return Err(Error::InvalidEvent(format!(
                "message_count_delta must be >= 0, got {}",
                self.message_count_delta
            )));
        }
        if let Some(latency) = self.response_latency_seconds {
            if !latency.is_finite() || latency < 0.0 {
                return Err(Error::InvalidEvent(format!(
                    "response_latency_seconds must be a finite value >= 0, got {}",
                    latency
                )));
            }
            if self.role == Role::User && self.kind() == EventKind::Message {
                return Err(Error::InvalidEvent(
                    "response_latency_seconds is only valid on assistant messages".to_string(),
                ));
            }
        }
        if let Some(duration) = self.conversation_duration_seconds {
            if !duration.is_finite() || duration < 0.0 {
                return Err(Error::InvalidEvent(format!(
                    "conversation_duration_seconds must be a finite value >= 0, got {}",
                    duration
                )));
            }
        }
        if matches!(&self.category, Some(c) if c.is_empty()) {
            return Err(Error::InvalidEvent("category is empty".to_string()));
        }
        if self.tags.iter().any(|t| t.is_empty()) {
            return Err(Error::InvalidEvent("tags contain an empty tag".to_string()));
        }
        Ok(())
    }
}

// ============================================
// Time window
// ============================================

/// Inclusive time range `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start > end {
            return Err(Error::Config(format!(
                "window start {} is after end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// Everything up to and including `end`.
    pub fn until(end: DateTime<Utc>) -> Self {
        Self {
            start: DateTime::<Utc>::MIN_UTC,
            end,
        }
    }

    /// Every representable instant.
    pub fn all() -> Self {
        Self {
            start: DateTime::<Utc>::MIN_UTC,
            end: DateTime::<Utc>::MAX_UTC,
        }
    }

    /// The `days` days ending at `end`.
    pub fn last_days(end: DateTime<Utc>, days: u32) -> Self {
        Self {
            start: end - chrono::Duration::days(days as i64),
            end,
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts <= self.end
    }
}
