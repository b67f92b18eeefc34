//! Incremental aggregate maintenance.
//!
//! [`StreamingUpdater::apply`] takes the current aggregate and one event and
//! returns the next aggregate without looking at earlier events. Means are
//! maintained with `(old * n + x) / (n + 1)` where `n` is the sample count
//! before the event.

use chrono::{DateTime, Utc};

use super::aggregate::{calendar_slots, ConversationTrack, StatAggregate};
use crate::error::{Error, Result};
use crate::types::{Event, EventKind, Role};

/// Running mean after adding sample `x` to `n` earlier samples averaging `old`.
pub fn running_mean(old: f64, n: u64, x: f64) -> f64 {
    (old * n as f64 + x) / (n + 1) as f64
}

/// Seconds from `earlier` to `later`, never negative.
pub(crate) fn seconds_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> f64 {
    let delta = later.signed_duration_since(earlier);
    let seconds = match delta.num_microseconds() {
        Some(us) => us as f64 / 1_000_000.0,
        None => delta.num_milliseconds() as f64 / 1_000.0,
    };
    seconds.max(0.0)
}

/// Applies single events to an aggregate.
#[derive(Debug, Default, Clone, Copy)]
pub struct StreamingUpdater;

impl StreamingUpdater {
    pub fn new() -> Self {
        Self
    }

    /// Produce the aggregate that follows `current` once `event` is applied.
    ///
    /// The event must carry sequence `current.event_sequence_number + 1`.
    /// On error `current` is untouched.
    pub fn apply(&self, current: &StatAggregate, event: &Event) -> Result<StatAggregate> {
        event.validate()?;
        if event.user_id != current.user_id {
            return Err(Error::InvalidEvent(format!(
                "event for user {} applied to aggregate of {}",
                event.user_id, current.user_id
            )));
        }

        let expected = current.next_sequence();
        let sequence = event.sequence.ok_or_else(|| {
            Error::InvalidEvent("event has no sequence number assigned".to_string())
        })?;
        if sequence != expected {
            return Err(Error::StaleEvent {
                user_id: current.user_id.clone(),
                expected,
                got: sequence,
            });
        }

        let mut next = current.clone();
        let ts = event.timestamp_utc();

        match event.kind() {
            EventKind::Message => Self::apply_message(&mut next, event, ts),
            EventKind::ConversationClosed => Self::apply_close(&mut next, event, ts),
        }

        next.period_start = Some(next.period_start.map_or(ts, |start| start.min(ts)));
        let period_end = next.period_end.map_or(ts, |end| end.max(ts));
        next.period_end = Some(period_end);
        next.last_updated_at = if current.is_empty() {
            ts
        } else {
            current.last_updated_at.max(ts)
        };
        next.conversations.refresh_window(period_end);
        next.event_sequence_number = sequence;

        tracing::trace!(
            user_id = %next.user_id,
            sequence,
            conversation_id = %event.conversation_id,
            "Applied event"
        );

        Ok(next)
    }

    fn apply_message(agg: &mut StatAggregate, event: &Event, ts: DateTime<Utc>) {
        let length = event.content_length as f64;
        let messages = &mut agg.messages;
        match event.role {
            Role::User => {
                messages.avg_user_length =
                    running_mean(messages.avg_user_length, messages.user_count, length);
                messages.user_count += 1;
            }
            Role::Assistant => {
                messages.avg_assistant_length = running_mean(
                    messages.avg_assistant_length,
                    messages.assistant_count,
                    length,
                );
                messages.assistant_count += 1;
            }
        }
        messages.total += 1;

        let (hour, weekday) = calendar_slots(&event.timestamp);
        agg.time.hour_histogram[hour] += 1;
        agg.time.weekday_histogram[weekday] += 1;

        let track = agg
            .conversations
            .tracked
            .entry(event.conversation_id.clone())
            .or_insert_with(|| ConversationTrack::new(ts));

        if event.role == Role::Assistant && track.last_role == Some(Role::User) {
            let latency = match (event.response_latency_seconds, track.last_message_at) {
                (Some(latency), _) => latency,
                (None, Some(asked_at)) => seconds_between(asked_at, ts),
                (None, None) => 0.0,
            };
            agg.time.avg_response_latency =
                running_mean(agg.time.avg_response_latency, agg.time.latency_samples, latency);
            agg.time.latency_samples += 1;
        }

        track.last_role = Some(event.role);
        track.last_message_at = Some(ts);
        track.last_touched_at = track.last_touched_at.max(ts);

        if let Some(category) = &event.category {
            if track.categories.insert(category.clone()) {
                agg.categories.record(category);
            }
        }
        for tag in &event.tags {
            if track.tags.insert(tag.clone()) {
                agg.tags.record(tag);
            }
        }
    }

    fn apply_close(agg: &mut StatAggregate, event: &Event, ts: DateTime<Utc>) {
        let duration_minutes = event.conversation_duration_seconds.unwrap_or(0.0) / 60.0;
        let stats = &mut agg.conversations;
        let n = stats.total_conversations;

        stats.avg_messages_per_conversation = running_mean(
            stats.avg_messages_per_conversation,
            n,
            event.message_count_delta as f64,
        );
        stats.avg_conversation_duration_minutes =
            running_mean(stats.avg_conversation_duration_minutes, n, duration_minutes);
        stats.total_conversations += 1;

        let track = stats
            .tracked
            .entry(event.conversation_id.clone())
            .or_insert_with(|| ConversationTrack::new(ts));
        track.closed = true;
        track.last_touched_at = track.last_touched_at.max(ts);
    }
}
