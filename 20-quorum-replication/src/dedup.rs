//! Time-bounded memory of replication operation ids.
//!
//! Followers consult this before applying a REPL_PUT / REPL_DELETE so that
//! the leader's retries are harmless: a redelivered operation is
//! acknowledged again but not re-applied.
//!
//! An id is recorded when its first copy arrives, which may be well before
//! the write lands (followers can be configured to delay applies). Only
//! after [`DedupCache::mark_applied`] do redeliveries count as applied, so a
//! follower never acknowledges a write it has not stored yet.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

#[derive(Debug, Clone, Copy)]
struct Sighting {
    first_seen: Instant,
    applied: bool,
}

#[derive(Debug)]
pub struct DedupCache {
    seen: DashMap<String, Sighting>,
    ttl: Duration,
}

impl DedupCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            seen: DashMap::new(),
            ttl,
        }
    }

    /// Records `op_id` and reports whether it had been recorded before.
    ///
    /// Blank ids are never recorded and always report unseen; callers must
    /// reject them on their own.
    pub fn seen_or_add(&self, op_id: &str) -> bool {
        if op_id.trim().is_empty() {
            return false;
        }
        match self.seen.entry(op_id.to_string()) {
            Entry::Occupied(_) => true,
            Entry::Vacant(slot) => {
                slot.insert(Sighting {
                    first_seen: Instant::now(),
                    applied: false,
                });
                false
            }
        }
    }

    /// Records that the write carried by `op_id` is in the store.
    pub fn mark_applied(&self, op_id: &str) {
        if let Some(mut sighting) = self.seen.get_mut(op_id) {
            sighting.applied = true;
        }
    }

    /// Whether the first copy of `op_id` has finished applying.
    pub fn is_applied(&self, op_id: &str) -> bool {
        self.seen.get(op_id).is_some_and(|sighting| sighting.applied)
    }

    /// Drops ids first seen more than one TTL ago. Returns how many were dropped.
    pub fn cleanup(&self) -> usize {
        self.purge_older_than(self.ttl)
    }

    pub fn purge_older_than(&self, age: Duration) -> usize {
        let before = self.seen.len();
        self.seen.retain(|_, sighting| sighting.first_seen.elapsed() < age);
        before.saturating_sub(self.seen.len())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
