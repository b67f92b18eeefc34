//! Usage trends over a recent slice of history.
//!
//! Unlike the aggregate, trends are always derived from raw history and are
//! never stored. Conversations are bucketed by the local calendar day of their
//! first event inside the window.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::{Event, EventKind, Role, TimeWindow};

/// Day-level activity summary for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageTrends {
    pub window: TimeWindow,
    /// Conversations started per local calendar day
    pub daily_conversation_counts: BTreeMap<NaiveDate, u64>,
    /// Conversations per category
    pub category_trends: BTreeMap<String, u64>,
    /// Conversations with at least one event in the window
    pub total_conversations: u64,
    /// Days with at least one conversation started
    pub active_days: u64,
    /// Day with the most conversations started; the earliest wins ties
    pub peak_day: Option<NaiveDate>,
    /// Mean of the reply latencies reported on assistant messages
    pub avg_response_latency: f64,
    /// Mean length over all messages
    pub avg_message_length: f64,
}

#[derive(Default)]
struct ConversationSummary {
    first_day: Option<(chrono::DateTime<chrono::Utc>, NaiveDate)>,
    categories: Vec<String>,
}

/// Summarize `events` that fall inside `window`.
pub fn compute_trends(events: &[Event], window: TimeWindow) -> UsageTrends {
    let mut conversations: BTreeMap<&str, ConversationSummary> = BTreeMap::new();
    let mut latency_sum = 0.0;
    let mut latency_count = 0u64;
    let mut length_sum = 0.0;
    let mut length_count = 0u64;

    for event in events.iter().filter(|e| window.contains(e.timestamp_utc())) {
        let ts = event.timestamp_utc();
        let summary = conversations
            .entry(event.conversation_id.as_str())
            .or_default();
        if summary.first_day.map_or(true, |(first, _)| ts < first) {
            summary.first_day = Some((ts, event.timestamp.date_naive()));
        }

        if event.kind() != EventKind::Message {
            continue;
        }
        length_sum += event.content_length as f64;
        length_count += 1;

        if let Some(category) = &event.category {
            if !summary.categories.contains(category) {
                summary.categories.push(category.clone());
            }
        }
        if let (Role::Assistant, Some(latency)) = (event.role, event.response_latency_seconds) {
            latency_sum += latency;
            latency_count += 1;
        }
    }

    let mut daily_conversation_counts: BTreeMap<NaiveDate, u64> = BTreeMap::new();
    let mut category_trends: BTreeMap<String, u64> = BTreeMap::new();
    for summary in conversations.values() {
        if let Some((_, day)) = summary.first_day {
            *daily_conversation_counts.entry(day).or_insert(0) += 1;
        }
        for category in &summary.categories {
            *category_trends.entry(category.clone()).or_insert(0) += 1;
        }
    }

    // BTreeMap iterates days in order, so a strict comparison keeps the earliest
    let mut peak: Option<(NaiveDate, u64)> = None;
    for (&day, &count) in &daily_conversation_counts {
        if peak.map_or(true, |(_, best)| count > best) {
            peak = Some((day, count));
        }
    }

    UsageTrends {
        window,
        total_conversations: conversations.len() as u64,
        active_days: daily_conversation_counts.len() as u64,
        peak_day: peak.map(|(day, _)| day),
        daily_conversation_counts,
        category_trends,
        avg_response_latency: mean(latency_sum, latency_count),
        avg_message_length: mean(length_sum, length_count),
    }
}

fn mean(sum: f64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}
