//! Incrementally maintained top-N view over a growing frequency distribution.
//!
//! Leaders are ordered by count, descending. Among equal counts, the key that
//! reached that count first ranks higher: a key that merely ties an
//! incumbent never overtakes it. Every update touches at most `limit`
//! leader slots, so the distribution itself is never resorted.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopKTracker {
    limit: usize,
    distribution: BTreeMap<String, u64>,
    leaders: Vec<String>,
}

impl TopKTracker {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            distribution: BTreeMap::new(),
            leaders: Vec::with_capacity(limit),
        }
    }

    /// Add one to `key` and return its new count.
    pub fn increment(&mut self, key: &str) -> u64 {
        let count = {
            let entry = self.distribution.entry(key.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };

        let position = match self.leaders.iter().position(|k| k == key) {
            Some(pos) => pos,
            None if self.leaders.len() < self.limit => {
                self.leaders.push(key.to_string());
                self.leaders.len() - 1
            }
            None => {
                let Some(last) = self.leaders.last() else {
                    return count;
                };
                if count <= self.count(last) {
                    return count;
                }
                let slot = self.leaders.len() - 1;
                self.leaders[slot] = key.to_string();
                slot
            }
        };

        self.bubble_up(position, count);
        count
    }

    /// Move the leader at `position` forward past strictly smaller counts.
    fn bubble_up(&mut self, mut position: usize, count: u64) {
        while position > 0 && self.count(&self.leaders[position - 1]) < count {
            self.leaders.swap(position - 1, position);
            position -= 1;
        }
    }

    pub fn count(&self, key: &str) -> u64 {
        self.distribution.get(key).copied().unwrap_or(0)
    }

    /// Current leaders, best first.
    pub fn leaders(&self) -> &[String] {
        &self.leaders
    }

    /// The single best key, if any.
    pub fn leader(&self) -> Option<&str> {
        self.leaders.first().map(String::as_str)
    }

    pub fn distribution(&self) -> &BTreeMap<String, u64> {
        &self.distribution
    }

    /// Check the leader list against the distribution.
    pub fn validate(&self) -> Result<(), String> {
        if self.leaders.len() > self.limit {
            return Err(format!(
                "{} leaders exceed limit {}",
                self.leaders.len(),
                self.limit
            ));
        }
        if self.leaders.len() < self.limit.min(self.distribution.len()) {
            return Err("leader list is not full".to_string());
        }
        for key in &self.leaders {
            if !self.distribution.contains_key(key) {
                return Err(format!("leader {:?} missing from distribution", key));
            }
        }
        for pair in self.leaders.windows(2) {
            if self.count(&pair[0]) < self.count(&pair[1]) {
                return Err(format!("leaders {:?} out of order", pair));
            }
        }
        if let Some(last) = self.leaders.last() {
            let floor = self.count(last);
            let outranked = self
                .distribution
                .iter()
                .any(|(k, &c)| c > floor && !self.leaders.contains(k));
            if outranked {
                return Err("a non-leader outranks the last leader".to_string());
            }
        }
        Ok(())
    }
}
