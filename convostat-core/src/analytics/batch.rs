//! Full recomputation of an aggregate from stored history.
//!
//! Used for cold start, audits, and reconciliation. Each sub-aggregate is
//! folded independently over the events inside the window; nothing is
//! carried over from a previous aggregate.
//!
//! A conversation id can be reused after the streaming path has forgotten
//! the closed conversation it named. Events are therefore grouped by
//! conversation *life*, which starts over exactly where streaming would
//! start a fresh track.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};

use super::aggregate::{active_window, calendar_slots, ConversationTrack, StatAggregate};
use super::streaming::seconds_between;
use crate::error::{Error, Result};
use crate::types::{Event, EventKind, Role, TimeWindow};

/// Recomputes aggregates from complete event lists.
#[derive(Debug, Default, Clone, Copy)]
pub struct BatchCalculator;

/// A windowed event together with its position in the input.
#[derive(Clone, Copy)]
struct Indexed<'a> {
    index: usize,
    ts: DateTime<Utc>,
    event: &'a Event,
    /// Incarnation of the conversation id, 0 for its first
    life: u32,
}

impl<'a> Indexed<'a> {
    fn conversation(&self) -> (&'a str, u32) {
        (self.event.conversation_id.as_str(), self.life)
    }
}

impl BatchCalculator {
    pub fn new() -> Self {
        Self
    }

    /// Compute an aggregate for `user_id` from `events` inside `window`.
    ///
    /// Ties in category and tag rankings are resolved by input order. The
    /// result's `event_sequence_number` is the number of events folded.
    pub fn compute(
        &self,
        user_id: &str,
        events: &[Event],
        window: TimeWindow,
    ) -> Result<StatAggregate> {
        for event in events {
            event.validate()?;
            if event.user_id != user_id {
                return Err(Error::InvalidEvent(format!(
                    "history of {} contains an event for {}",
                    user_id, event.user_id
                )));
            }
        }

        let mut selected: Vec<Indexed<'_>> = events
            .iter()
            .enumerate()
            .map(|(index, event)| Indexed {
                index,
                ts: event.timestamp_utc(),
                event,
                life: 0,
            })
            .filter(|e| window.contains(e.ts))
            .collect();

        let mut agg = StatAggregate::new(user_id, window.end);
        if selected.is_empty() {
            return Ok(agg);
        }

        Self::assign_lives(&mut selected);
        Self::fold_messages(&mut agg, &selected);
        Self::fold_times(&mut agg, &selected);
        Self::fold_rankings(&mut agg, &selected);
        Self::fold_conversations(&mut agg, &selected);

        let period_start = selected.iter().map(|e| e.ts).min();
        let period_end = selected.iter().map(|e| e.ts).max();
        agg.period_start = period_start;
        agg.period_end = period_end;
        if let Some(end) = period_end {
            agg.last_updated_at = end;
            agg.conversations.refresh_window(end);
        }
        agg.event_sequence_number = selected.len() as u64;

        tracing::debug!(
            user_id,
            input_events = events.len(),
            folded_events = selected.len(),
            "Recomputed aggregate"
        );

        Ok(agg)
    }

    /// Number the lives of each conversation id in input order.
    ///
    /// A closed conversation last touched before `latest - window`, where
    /// `latest` is the newest timestamp seen so far, has been dropped from the
    /// tracked set; the next event with its id begins a new life.
    fn assign_lives<'a>(selected: &mut [Indexed<'a>]) {
        struct Life {
            number: u32,
            last_touched_at: DateTime<Utc>,
            closed: bool,
        }

        let mut lives: BTreeMap<&'a str, Life> = BTreeMap::new();
        let mut latest: Option<DateTime<Utc>> = None;

        for e in selected.iter_mut() {
            let event: &'a Event = e.event;
            let cutoff = latest.map(|ts| ts - active_window());
            let life = lives
                .entry(event.conversation_id.as_str())
                .or_insert(Life {
                    number: 0,
                    last_touched_at: e.ts,
                    closed: false,
                });

            let forgotten =
                life.closed && cutoff.map_or(false, |cutoff| life.last_touched_at < cutoff);
            if forgotten {
                *life = Life {
                    number: life.number + 1,
                    last_touched_at: e.ts,
                    closed: false,
                };
            }
            life.last_touched_at = life.last_touched_at.max(e.ts);
            if event.kind() == EventKind::ConversationClosed {
                life.closed = true;
            }

            e.life = life.number;
            latest = Some(latest.map_or(e.ts, |ts| ts.max(e.ts)));
        }
    }

    fn messages<'a, 'b>(selected: &'b [Indexed<'a>]) -> impl Iterator<Item = &'b Indexed<'a>> {
        selected
            .iter()
            .filter(|e| e.event.kind() == EventKind::Message)
    }

    fn fold_messages(agg: &mut StatAggregate, selected: &[Indexed<'_>]) {
        let mut user_sum = 0.0;
        let mut assistant_sum = 0.0;
        let stats = &mut agg.messages;

        for e in Self::messages(selected) {
            let length = e.event.content_length as f64;
            match e.event.role {
                Role::User => {
                    stats.user_count += 1;
                    user_sum += length;
                }
                Role::Assistant => {
                    stats.assistant_count += 1;
                    assistant_sum += length;
                }
            }
        }

        stats.total = stats.user_count + stats.assistant_count;
        stats.avg_user_length = mean(user_sum, stats.user_count);
        stats.avg_assistant_length = mean(assistant_sum, stats.assistant_count);
    }

    fn fold_times(agg: &mut StatAggregate, selected: &[Indexed<'_>]) {
        for e in Self::messages(selected) {
            let (hour, weekday) = calendar_slots(&e.event.timestamp);
            agg.time.hour_histogram[hour] += 1;
            agg.time.weekday_histogram[weekday] += 1;
        }

        // Adjacency is per conversation in timestamp order, not list order.
        let mut by_conversation: BTreeMap<(&str, u32), Vec<Indexed<'_>>> = BTreeMap::new();
        for e in Self::messages(selected) {
            by_conversation
                .entry(e.conversation())
                .or_default()
                .push(*e);
        }

        let mut latency_sum = 0.0;
        let mut samples = 0u64;
        for thread in by_conversation.values_mut() {
            thread.sort_by_key(|e| (e.ts, e.index));
            for pair in thread.windows(2) {
                let (prev, cur) = (&pair[0], &pair[1]);
                if prev.event.role == Role::User && cur.event.role == Role::Assistant {
                    latency_sum += cur
                        .event
                        .response_latency_seconds
                        .unwrap_or_else(|| seconds_between(prev.ts, cur.ts));
                    samples += 1;
                }
            }
        }
        agg.time.latency_samples = samples;
        agg.time.avg_response_latency = mean(latency_sum, samples);
    }

    fn fold_rankings(agg: &mut StatAggregate, selected: &[Indexed<'_>]) {
        let mut seen_categories: BTreeSet<((&str, u32), &str)> = BTreeSet::new();
        let mut seen_tags: BTreeSet<((&str, u32), &str)> = BTreeSet::new();

        for e in Self::messages(selected) {
            let conversation = e.conversation();
            if let Some(category) = e.event.category.as_deref() {
                if seen_categories.insert((conversation, category)) {
                    agg.categories.record(category);
                }
            }
            for tag in &e.event.tags {
                if seen_tags.insert((conversation, tag.as_str())) {
                    agg.tags.record(tag);
                }
            }
        }
    }

    fn fold_conversations(agg: &mut StatAggregate, selected: &[Indexed<'_>]) {
        let mut closed = 0u64;
        let mut message_sum = 0.0;
        let mut minutes_sum = 0.0;
        // only the latest life of each id is tracked
        let mut tracked: BTreeMap<&str, (u32, ConversationTrack)> = BTreeMap::new();
        let mut last_message: BTreeMap<(&str, u32), (DateTime<Utc>, usize, Role)> =
            BTreeMap::new();

        for e in selected {
            let event = e.event;
            let (conversation, life) = e.conversation();
            let entry = tracked
                .entry(conversation)
                .or_insert_with(|| (life, ConversationTrack::new(e.ts)));
            if entry.0 != life {
                *entry = (life, ConversationTrack::new(e.ts));
            }
            let track = &mut entry.1;
            track.last_touched_at = track.last_touched_at.max(e.ts);

            match event.kind() {
                EventKind::ConversationClosed => {
                    closed += 1;
                    message_sum += event.message_count_delta as f64;
                    minutes_sum += event.conversation_duration_seconds.unwrap_or(0.0) / 60.0;
                    track.closed = true;
                }
                EventKind::Message => {
                    if let Some(category) = &event.category {
                        track.categories.insert(category.clone());
                    }
                    track.tags.extend(event.tags.iter().cloned());

                    let key = (e.ts, e.index);
                    let latest = last_message
                        .entry((conversation, life))
                        .or_insert((e.ts, e.index, event.role));
                    if key >= (latest.0, latest.1) {
                        *latest = (e.ts, e.index, event.role);
                    }
                }
            }
        }

        for ((conversation, life), (ts, _, role)) in last_message {
            match tracked.get_mut(conversation) {
                Some((current, track)) if *current == life => {
                    track.last_role = Some(role);
                    track.last_message_at = Some(ts);
                }
                _ => {}
            }
        }

        let stats = &mut agg.conversations;
        stats.total_conversations = closed;
        stats.avg_messages_per_conversation = mean(message_sum, closed);
        stats.avg_conversation_duration_minutes = mean(minutes_sum, closed);
        stats.tracked = tracked
            .into_iter()
            .map(|(id, (_, track))| (id.to_string(), track))
            .collect();
    }
}

fn mean(sum: f64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::StreamingUpdater;
    use chrono::{Duration, FixedOffset, TimeZone};

    fn base() -> DateTime<FixedOffset> {
        Utc.with_ymd_and_hms(2025, 6, 2, 9, 0, 0)
            .unwrap()
            .fixed_offset()
    }

    fn all() -> TimeWindow {
        TimeWindow::until(Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap())
    }

    fn msg(conv: &str, role: Role, minutes: i64, len: i64) -> Event {
        Event::message("u1", conv, role, base() + Duration::minutes(minutes), len)
    }

    #[test]
    fn test_empty_history() {
        let window = all();
        let agg = BatchCalculator::new().compute("u1", &[], window).unwrap();
        assert!(agg.is_empty());
        assert_eq!(agg.last_updated_at, window.end);
        assert_eq!(agg.messages.avg_user_length, 0.0);
        assert!(agg.validate().is_ok());
    }

    #[test]
    fn test_scenario_a() {
        let events = vec![
            msg("c1", Role::User, 0, 10),
            msg("c1", Role::Assistant, 1, 20).with_latency(2.0),
            msg("c1", Role::User, 2, 30),
            msg("c1", Role::Assistant, 3, 10).with_latency(1.0),
        ];
        let agg = BatchCalculator::new().compute("u1", &events, all()).unwrap();

        assert_eq!(agg.messages.avg_user_length, 20.0);
        assert_eq!(agg.messages.avg_assistant_length, 15.0);
        assert_eq!(agg.time.avg_response_latency, 1.5);
        assert_eq!(agg.event_sequence_number, 4);
        assert!(agg.validate().is_ok());
    }

    #[test]
    fn test_scenario_c() {
        let events = vec![
            Event::conversation_closed("u1", "c1", base(), 120.0, 6),
            Event::conversation_closed("u1", "c2", base() + Duration::minutes(5), 60.0, 2),
        ];
        let agg = BatchCalculator::new().compute("u1", &events, all()).unwrap();

        assert_eq!(agg.conversations.avg_conversation_duration_minutes, 1.5);
        assert_eq!(agg.conversations.avg_messages_per_conversation, 4.0);
        assert_eq!(agg.conversations.total_conversations, 2);
    }

    #[test]
    fn test_window_filters_events() {
        let events = vec![
            msg("c1", Role::User, 0, 100),
            msg("c1", Role::User, 60, 10),
            msg("c1", Role::User, 120, 20),
        ];
        let start = (base() + Duration::minutes(30)).with_timezone(&Utc);
        let end = (base() + Duration::minutes(120)).with_timezone(&Utc);
        let window = TimeWindow::new(start, end).unwrap();

        let agg = BatchCalculator::new().compute("u1", &events, window).unwrap();
        assert_eq!(agg.messages.user_count, 2);
        assert_eq!(agg.messages.avg_user_length, 15.0);
        assert_eq!(agg.event_sequence_number, 2);
        assert_eq!(agg.period_end, Some(end));
    }

    #[test]
    fn test_latency_adjacency_uses_timestamps_not_list_position() {
        // List order interleaves two conversations and lists a reply before
        // its question; conversation order still pairs them.
        let events = vec![
            msg("c1", Role::Assistant, 2, 8),
            msg("c2", Role::User, 1, 4),
            msg("c1", Role::User, 0, 4),
        ];
        let agg = BatchCalculator::new().compute("u1", &events, all()).unwrap();

        assert_eq!(agg.time.latency_samples, 1);
        assert_eq!(agg.time.avg_response_latency, 120.0);
    }

    #[test]
    fn test_categories_counted_once_per_conversation() {
        let events = vec![
            msg("c1", Role::User, 0, 1).with_category("A"),
            msg("c1", Role::User, 1, 1).with_category("A"),
            msg("c2", Role::User, 2, 1).with_category("B"),
            msg("c2", Role::User, 3, 1)
                .with_category("B")
                .with_tags(["x", "y"]),
            msg("c3", Role::User, 4, 1).with_tags(["y"]),
        ];
        let agg = BatchCalculator::new().compute("u1", &events, all()).unwrap();

        assert_eq!(agg.categories.distribution().get("A"), Some(&1));
        assert_eq!(agg.categories.distribution().get("B"), Some(&1));
        // A was seen first and is only tied
        assert_eq!(agg.categories.dominant_category(), Some("A"));
        assert_eq!(agg.tags.top_tags(), ["y", "x"]);
    }

    #[test]
    fn test_rejects_foreign_or_invalid_events() {
        let foreign = vec![Event::message("u2", "c1", Role::User, base(), 1)];
        assert!(matches!(
            BatchCalculator::new().compute("u1", &foreign, all()),
            Err(Error::InvalidEvent(_))
        ));

        let invalid = vec![msg("c1", Role::User, 0, -4)];
        assert!(BatchCalculator::new().compute("u1", &invalid, all()).is_err());
    }

    #[test]
    fn test_tracks_open_conversation_state() {
        let events = vec![
            msg("c1", Role::User, 0, 4).with_category("A"),
            msg("c1", Role::Assistant, 1, 4),
            msg("c2", Role::User, 2, 4),
            Event::conversation_closed("u1", "c2", base() + Duration::minutes(3), 60.0, 1),
        ];
        let agg = BatchCalculator::new().compute("u1", &events, all()).unwrap();

        let c1 = &agg.conversations.tracked["c1"];
        assert_eq!(c1.last_role, Some(Role::Assistant));
        assert!(c1.categories.contains("A"));
        assert!(!c1.closed);
        assert!(agg.conversations.tracked["c2"].closed);
        assert_eq!(agg.conversations.active_in_window, 2);
    }

    fn stream(events: &[Event]) -> StatAggregate {
        let updater = StreamingUpdater::new();
        let mut agg = StatAggregate::new("u1", base().with_timezone(&Utc));
        for (i, event) in events.iter().enumerate() {
            let event = event.clone().with_sequence(i as u64 + 1);
            agg = updater.apply(&agg, &event).unwrap();
        }
        agg
    }

    #[test]
    fn test_reused_id_after_idle_close_starts_a_new_conversation() {
        let hour = 60;
        let events = vec![
            msg("c1", Role::User, 0, 4).with_category("A").with_tags(["t"]),
            Event::conversation_closed("u1", "c1", base() + Duration::minutes(1), 60.0, 1),
            msg("c2", Role::User, 30 * hour, 4),
            msg("c1", Role::User, 31 * hour, 4)
                .with_category("A")
                .with_tags(["t"]),
            msg("c1", Role::Assistant, 31 * hour + 1, 4),
        ];
        let batch = BatchCalculator::new().compute("u1", &events, all()).unwrap();
        let streamed = stream(&events);

        assert_eq!(batch.categories.distribution().get("A"), Some(&2));
        assert_eq!(batch.tags.distribution().get("t"), Some(&2));
        assert_eq!(batch.categories.distribution(), streamed.categories.distribution());
        assert_eq!(batch.tags.distribution(), streamed.tags.distribution());
        assert_eq!(batch.time.latency_samples, streamed.time.latency_samples);
        assert_eq!(batch.conversations.tracked, streamed.conversations.tracked);
        assert!(!batch.conversations.tracked["c1"].closed);
    }

    #[test]
    fn test_reopened_within_window_stays_one_conversation() {
        // no pruning happens: the question before the close pairs with the
        // reply after it, and the category is not counted twice
        let events = vec![
            msg("c1", Role::User, 0, 4).with_category("A"),
            Event::conversation_closed("u1", "c1", base() + Duration::minutes(1), 60.0, 1),
            msg("c1", Role::Assistant, 120, 4).with_category("A"),
        ];
        let batch = BatchCalculator::new().compute("u1", &events, all()).unwrap();
        let streamed = stream(&events);

        assert_eq!(batch.categories.distribution().get("A"), Some(&1));
        assert_eq!(batch.time.latency_samples, 1);
        assert_eq!(batch.time.avg_response_latency, 120.0 * 60.0);
        assert_eq!(batch.conversations.tracked, streamed.conversations.tracked);
        assert_eq!(batch.time.latency_samples, streamed.time.latency_samples);
    }
}
