//! Server-side per-topic log of past subscription updates.
//!
//! The log backs gap-fill replay: when a client notices a `prev_server_seq`
//! discontinuity it asks for a sequence range, and the server re-delivers the
//! stored updates through the normal push channel. The log assumes a single
//! ordered publisher per topic, so anything at or below the last recorded
//! sequence is dropped rather than reordered.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use tracing::warn;
use wavelink_proto::SubscriptionData;

pub const DEFAULT_HISTORY_LIMIT: usize = 1024;

#[derive(Debug)]
pub struct UpdateHistory {
    max_entries: usize,
    topics: Mutex<HashMap<String, VecDeque<SubscriptionData>>>,
}

impl Default for UpdateHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl UpdateHistory {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries,
            topics: Mutex::new(HashMap::new()),
        }
    }

    /// Appends `message` to the topic's log. Returns `false` (after logging)
    /// when the message carries no usable sequence or does not advance the
    /// topic's last recorded sequence.
    pub fn record(&self, topic: &str, message: &SubscriptionData) -> bool {
        if message.server_seq == 0 {
            warn!(
                target = "wavelink::history",
                topic,
                id = %message.id,
                "update without a positive server seq; dropping"
            );
            return false;
        }

        let mut topics = self.topics.lock();
        let entries = topics.entry(topic.to_string()).or_default();
        if let Some(last) = entries.back() {
            if message.server_seq <= last.server_seq {
                warn!(
                    target = "wavelink::history",
                    topic,
                    server_seq = message.server_seq,
                    last_seq = last.server_seq,
                    "duplicate or out-of-order update; dropping"
                );
                return false;
            }
        }
        entries.push_back(message.clone());
        if entries.len() > self.max_entries {
            // Replay only ever serves recent gaps; oldest-first eviction.
            entries.pop_front();
        }
        true
    }

    /// All recorded messages with `from_exclusive < server_seq <= to_inclusive`,
    /// ascending. Empty when the topic is unknown or the range is invalid.
    pub fn range(
        &self,
        topic: &str,
        from_exclusive: u64,
        to_inclusive: u64,
    ) -> Vec<SubscriptionData> {
        if from_exclusive >= to_inclusive {
            return Vec::new();
        }
        let topics = self.topics.lock();
        let Some(entries) = topics.get(topic) else {
            return Vec::new();
        };
        let mut matched = Vec::new();
        for entry in entries {
            if entry.server_seq <= from_exclusive {
                continue;
            }
            if entry.server_seq > to_inclusive {
                // The log is sequence-sorted; nothing further can match.
                break;
            }
            matched.push(entry.clone());
        }
        matched
    }

    pub fn last_seq(&self, topic: &str) -> Option<u64> {
        self.topics
            .lock()
            .get(topic)
            .and_then(|entries| entries.back().map(|entry| entry.server_seq))
    }

    pub fn len(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .get(topic)
            .map(|entries| entries.len())
            .unwrap_or(0)
    }

    pub fn clear(&self, topic: &str) {
        self.topics.lock().remove(topic);
    }

    pub fn clear_all(&self) {
        self.topics.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wavelink_proto::Id;

    fn update(seq: u64) -> SubscriptionData {
        SubscriptionData {
            id: Id::Num(10),
            data: json!(seq),
            server_seq: seq,
            prev_server_seq: seq.checked_sub(1).filter(|prev| *prev > 0),
        }
    }

    #[test]
    fn range_returns_recorded_messages_in_order() {
        let history = UpdateHistory::new(16);
        for seq in 1..=5 {
            assert!(history.record("onCountUpdate", &update(seq)));
        }
        let replay = history.range("onCountUpdate", 0, 5);
        let seqs: Vec<u64> = replay.iter().map(|m| m.server_seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn range_is_exclusive_below_and_inclusive_above() {
        let history = UpdateHistory::new(16);
        for seq in 1..=5 {
            history.record("t", &update(seq));
        }
        let seqs: Vec<u64> = history
            .range("t", 1, 3)
            .iter()
            .map(|m| m.server_seq)
            .collect();
        assert_eq!(seqs, vec![2, 3]);
    }

    #[test]
    fn stale_and_duplicate_sequences_are_dropped() {
        let history = UpdateHistory::new(16);
        assert!(history.record("t", &update(3)));
        assert!(!history.record("t", &update(3)));
        assert!(!history.record("t", &update(2)));
        assert_eq!(history.len("t"), 1);
        assert_eq!(history.last_seq("t"), Some(3));
    }

    #[test]
    fn zero_sequence_is_rejected() {
        let history = UpdateHistory::new(16);
        assert!(!history.record("t", &update(0)));
        assert_eq!(history.len("t"), 0);
    }

    #[test]
    fn oldest_entries_evicted_first() {
        let history = UpdateHistory::new(3);
        for seq in 1..=5 {
            history.record("t", &update(seq));
        }
        assert_eq!(history.len("t"), 3);
        // Evicted entries are never served by range.
        assert!(history.range("t", 0, 2).is_empty());
        let seqs: Vec<u64> = history
            .range("t", 0, 5)
            .iter()
            .map(|m| m.server_seq)
            .collect();
        assert_eq!(seqs, vec![3, 4, 5]);
    }

    #[test]
    fn invalid_or_unknown_ranges_are_empty() {
        let history = UpdateHistory::new(16);
        history.record("t", &update(1));
        assert!(history.range("t", 3, 3).is_empty());
        assert!(history.range("t", 4, 2).is_empty());
        assert!(history.range("unknown", 0, 10).is_empty());
    }

    #[test]
    fn clear_forgets_single_topic_only() {
        let history = UpdateHistory::new(16);
        history.record("a", &update(1));
        history.record("b", &update(1));
        history.clear("a");
        assert_eq!(history.len("a"), 0);
        assert_eq!(history.len("b"), 1);
        history.clear_all();
        assert_eq!(history.len("b"), 0);
    }
}
