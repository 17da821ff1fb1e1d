//! In-memory replicated key-value state.
//!
//! Every node, leader and follower alike, holds one [`ReplicatedStore`].
//! Writes arrive either from the leader's own write path or from
//! replication messages, possibly out of order and possibly more than once,
//! so each key keeps the sequence number of the write that produced it and
//! older writes are discarded.

use std::collections::BTreeMap;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

/// Current state of a single key.
///
/// A delete leaves a tombstone behind instead of removing the key, so that a
/// late-arriving PUT with a lower sequence cannot resurrect it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueEntry {
    pub value: Option<String>,
    pub tombstone: bool,
    pub seq: u64,
}

impl ValueEntry {
    fn live(value: String, seq: u64) -> Self {
        Self {
            value: Some(value),
            tombstone: false,
            seq,
        }
    }

    fn tombstone(seq: u64) -> Self {
        Self {
            value: None,
            tombstone: true,
            seq,
        }
    }

    /// The stored value, or `None` for a tombstone.
    pub fn visible_value(&self) -> Option<&str> {
        if self.tombstone {
            None
        } else {
            self.value.as_deref()
        }
    }
}

/// Last-writer-wins map keyed by string.
///
/// Backed by a sharded map so independent keys never contend on one lock;
/// the read-compare-write for a single key happens under that key's shard
/// guard. Keys are assumed valid; the dispatcher rejects bad ones.
#[derive(Debug, Default)]
pub struct ReplicatedStore {
    entries: DashMap<String, ValueEntry>,
}

impl ReplicatedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` unless the key already holds a write with a higher `seq`.
    ///
    /// Returns whether the write took effect.
    pub fn apply_put(&self, key: &str, value: String, seq: u64) -> bool {
        self.apply(key, ValueEntry::live(value, seq))
    }

    /// Tombstones the key unless it already holds a write with a higher `seq`.
    pub fn apply_delete(&self, key: &str, seq: u64) -> bool {
        self.apply(key, ValueEntry::tombstone(seq))
    }

    // Equal sequences only come from redelivered copies of the same write,
    // so letting the incoming one win yields the same state either way.
    fn apply(&self, key: &str, incoming: ValueEntry) -> bool {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut current) => {
                if incoming.seq >= current.get().seq {
                    current.insert(incoming);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(incoming);
                true
            }
        }
    }

    /// Returns the raw entry, tombstones included.
    pub fn get(&self, key: &str) -> Option<ValueEntry> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Snapshot of every live key. Sorted so dumps compare cleanly across nodes.
    pub fn dump(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .visible_value()
                    .map(|value| (entry.key().clone(), value.to_string()))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn absent_key_accepts_any_write() {
        let store = ReplicatedStore::new();
        assert!(store.apply_put("k", "v".into(), 7));
        assert_eq!(store.get("k").and_then(|e| e.value), Some("v".to_string()));
    }

    #[test]
    fn stale_put_is_discarded() {
        let store = ReplicatedStore::new();
        store.apply_put("k", "new".into(), 5);
        assert!(!store.apply_put("k", "old".into(), 4));
        assert_eq!(store.get("k").map(|e| (e.value, e.seq)), Some((Some("new".to_string()), 5)));
    }

    #[test]
    fn equal_seq_lets_incoming_win() {
        let store = ReplicatedStore::new();
        store.apply_put("k", "first".into(), 3);
        assert!(store.apply_put("k", "second".into(), 3));
        assert_eq!(store.get("k").and_then(|e| e.value), Some("second".to_string()));
    }

    #[test]
    fn delete_leaves_tombstone_that_blocks_older_puts() {
        let store = ReplicatedStore::new();
        store.apply_put("k", "v".into(), 1);
        assert!(store.apply_delete("k", 2));
        assert!(!store.apply_put("k", "late".into(), 1));

        let entry = store.get("k").expect("tombstone kept");
        assert!(entry.tombstone);
        assert_eq!(entry.visible_value(), None);
        assert!(store.dump().is_empty());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn delete_on_absent_key_records_tombstone() {
        let store = ReplicatedStore::new();
        assert!(store.apply_delete("ghost", 4));
        assert!(!store.apply_put("ghost", "v".into(), 3));
        assert!(store.apply_put("ghost", "v".into(), 5));
        assert_eq!(store.dump().get("ghost").map(String::as_str), Some("v"));
    }

    #[test]
    fn highest_seq_wins_regardless_of_arrival_order() {
        let writes: Vec<(u64, Option<&str>)> = vec![
            (4, Some("d")),
            (1, Some("a")),
            (6, None),
            (3, Some("c")),
            (5, Some("e")),
            (2, None),
        ];
        let store = ReplicatedStore::new();
        for (seq, value) in &writes {
            match value {
                Some(v) => store.apply_put("k", v.to_string(), *seq),
                None => store.apply_delete("k", *seq),
            };
        }
        let entry = store.get("k").expect("entry");
        assert_eq!(entry.seq, 6);
        assert!(entry.tombstone);
    }

    #[test]
    fn dump_lists_live_keys_in_order() {
        let store = ReplicatedStore::new();
        store.apply_put("b", "2".into(), 2);
        store.apply_put("a", "1".into(), 1);
        store.apply_put("c", "3".into(), 3);
        store.apply_delete("c", 4);

        let dump = store.dump();
        let pairs: Vec<_> = dump.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        assert_eq!(pairs, vec![("a", "1"), ("b", "2")]);
    }

    #[test]
    fn concurrent_writers_converge_on_highest_seq() {
        let store = Arc::new(ReplicatedStore::new());
        let handles: Vec<_> = (1..=8u64)
            .map(|seq| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    store.apply_put("shared", format!("v{seq}"), seq);
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("writer thread");
        }
        assert_eq!(store.get("shared").map(|e| e.seq), Some(8));
        assert_eq!(store.dump().get("shared").map(String::as_str), Some("v8"));
    }
}
