//! In-flight forward index backed by [`DashMap`].
//!
//! Maps a [`RoutingKey`] to the [`PendingForward`] that opened it. Every
//! operation locks a single shard for its own duration only, so concurrent
//! dispatchers never contend on a lock held across an await point. An
//! insertion-order queue makes capacity eviction O(1) amortized.

use std::collections::VecDeque;
use std::time::Duration;

use dashmap::DashMap;
use fwdwatch_core::{PendingForward, RoutingKey};
use parking_lot::Mutex;
use tracing::warn;

/// A pending forward together with its local insertion time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingEntry {
    pub forward: PendingForward,
    /// Local clock reading (ms since epoch) when the entry was inserted.
    pub inserted_at_ms: u64,
}

/// Result of inserting a pending forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The key was free.
    Inserted,
    /// An entry already held the key and was overwritten.
    Replaced(PendingEntry),
    /// The index was full; the oldest entry was evicted to make room.
    EvictedOldest(PendingEntry),
}

/// Map value: the entry plus the insertion sequence number it was stored
/// under, so stale tags in the order queue can be recognised.
struct Slot {
    entry: PendingEntry,
    seq: u64,
}

/// Keys in insertion order. A tag whose sequence number no longer matches
/// the map (taken, swept or overwritten since) is skipped lazily.
#[derive(Default)]
struct OrderQueue {
    tags: VecDeque<(RoutingKey, u64)>,
    next_seq: u64,
}

/// Stale tags tolerated beyond twice the live entry count before compaction.
const COMPACT_SLACK: usize = 64;

/// Correlation index: routing key to unresolved forwarding attempt.
///
/// Inserts are serialized on the order queue, so the capacity bound holds
/// under concurrent inserters. Lookups, takes and sweeps only touch the map.
pub struct CorrelationIndex {
    entries: DashMap<RoutingKey, Slot>,
    order: Mutex<OrderQueue>,
    max_entries: usize,
}

impl CorrelationIndex {
    /// Creates an empty index holding at most `max_entries` entries.
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            order: Mutex::new(OrderQueue::default()),
            max_entries: max_entries.max(1),
        }
    }

    /// Insert a pending forward, overwriting any entry already at its key.
    ///
    /// When the key is new and the index is at capacity, the least recently
    /// inserted entry is evicted first. Overwrites never evict.
    pub fn insert(&self, forward: PendingForward, now_ms: u64) -> InsertOutcome {
        let entry = PendingEntry {
            forward,
            inserted_at_ms: now_ms,
        };

        let mut order = self.order.lock();
        let seq = order.next_seq;
        order.next_seq += 1;

        let evicted = if !self.entries.contains_key(&forward.key)
            && self.entries.len() >= self.max_entries
        {
            self.pop_oldest(&mut order)
        } else {
            None
        };
        let previous = self
            .entries
            .insert(forward.key, Slot { entry, seq })
            .map(|slot| slot.entry);
        order.tags.push_back((forward.key, seq));
        self.compact(&mut order);
        drop(order);

        match (evicted, previous) {
            (Some(evicted), _) => {
                warn!(
                    key = %evicted.forward.key,
                    capacity = self.max_entries,
                    "Correlation index full; evicted oldest pending forward"
                );
                InsertOutcome::EvictedOldest(evicted)
            }
            (None, Some(previous)) => InsertOutcome::Replaced(previous),
            (None, None) => InsertOutcome::Inserted,
        }
    }

    /// Remove and return the entry at `key`.
    pub fn take(&self, key: &RoutingKey) -> Option<PendingEntry> {
        self.entries.remove(key).map(|(_, slot)| slot.entry)
    }

    /// Return a copy of the entry at `key` without removing it.
    #[must_use]
    pub fn get(&self, key: &RoutingKey) -> Option<PendingEntry> {
        self.entries.get(key).map(|slot| slot.value().entry)
    }

    #[must_use]
    pub fn contains(&self, key: &RoutingKey) -> bool {
        self.entries.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.max_entries
    }

    /// Evict every entry inserted more than `max_age` before `now_ms`.
    ///
    /// Returns the evicted entries, oldest first.
    pub fn sweep_stale(&self, now_ms: u64, max_age: Duration) -> Vec<PendingEntry> {
        let max_age_ms = u64::try_from(max_age.as_millis()).unwrap_or(u64::MAX);
        let cutoff = now_ms.saturating_sub(max_age_ms);

        let stale: Vec<RoutingKey> = self
            .entries
            .iter()
            .filter(|slot| slot.value().entry.inserted_at_ms < cutoff)
            .map(|slot| *slot.key())
            .collect();

        // Re-check under the shard lock: the entry may have been resolved or
        // replaced by a fresh attempt since the scan.
        let mut evicted: Vec<PendingEntry> = stale
            .into_iter()
            .filter_map(|key| {
                self.entries
                    .remove_if(&key, |_, slot| slot.entry.inserted_at_ms < cutoff)
                    .map(|(_, slot)| slot.entry)
            })
            .collect();
        evicted.sort_by_key(|entry| entry.inserted_at_ms);
        evicted
    }

    /// Point-in-time copy of all entries.
    #[must_use]
    pub fn snapshot(&self) -> Vec<PendingEntry> {
        self.entries.iter().map(|slot| slot.value().entry).collect()
    }

    fn pop_oldest(&self, order: &mut OrderQueue) -> Option<PendingEntry> {
        while let Some((key, seq)) = order.tags.pop_front() {
            if let Some((_, slot)) = self.entries.remove_if(&key, |_, slot| slot.seq == seq) {
                return Some(slot.entry);
            }
        }
        None
    }

    fn compact(&self, order: &mut OrderQueue) {
        if order.tags.len() <= self.entries.len() * 2 + COMPACT_SLACK {
            return;
        }
        order
            .tags
            .retain(|(key, seq)| self.entries.get(key).is_some_and(|slot| slot.seq == *seq));
    }
}
