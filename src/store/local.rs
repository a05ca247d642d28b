use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::common::{unix_millis, DataEntry, NodeId};

#[derive(Debug, Clone)]
struct StoredEntry {
    entry: DataEntry,
    stored_at: Instant,
}

impl StoredEntry {
    /// Expired once `ttl` passed since the creator wrote the entry, or since
    /// this node stored it when the creator's clock runs ahead of ours.
    fn is_expired(&self, now: Instant, now_millis: u64) -> bool {
        now_millis.saturating_sub(self.entry.created_at) >= self.entry.ttl
            || now.duration_since(self.stored_at) >= Duration::from_millis(self.entry.ttl)
    }
}

#[derive(Debug, Default)]
/// This node's share of the replicated data, at most one entry per
/// `(key, creator)`.
///
/// An entry lives for its ttl counted from its `created_at`, and never longer
/// than its ttl counted from when this node stored it.
/// Expired entries are hidden from reads and dropped by [Self::remove_expired].
pub struct LocalDataStore {
    entries: HashMap<NodeId, HashMap<NodeId, StoredEntry>>,
}

impl LocalDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry of `entry.creator` under `entry.key`.
    ///
    /// Returns false, keeping the existing entry, if the existing one is newer,
    /// or a tombstone not strictly older than the incoming entry. Entries whose
    /// ttl already passed are never stored.
    pub fn store_entry(&mut self, entry: DataEntry) -> bool {
        let (now, now_millis) = (Instant::now(), unix_millis());
        let creator = *entry.creator.node_id();

        if now_millis.saturating_sub(entry.created_at) >= entry.ttl {
            trace!(key = ?entry.key, ?creator, "Ignoring expired entry");
            return false;
        }

        let creators = self.entries.entry(entry.key).or_default();

        if let Some(existing) = creators.get(&creator).filter(|e| !e.is_expired(now, now_millis)) {
            let existing = &existing.entry;

            if existing.created_at > entry.created_at
                || (existing.deleted && entry.created_at <= existing.created_at)
            {
                trace!(key = ?entry.key, ?creator, "Ignoring outdated entry");
                return false;
            }
        }

        creators.insert(
            creator,
            StoredEntry {
                entry,
                stored_at: now,
            },
        );

        true
    }

    /// All live entries under `key` by creator, tombstones included.
    pub fn get_entries(&self, key: &NodeId) -> HashMap<NodeId, DataEntry> {
        let (now, now_millis) = (Instant::now(), unix_millis());

        self.entries
            .get(key)
            .map(|creators| {
                creators
                    .iter()
                    .filter(|(_, stored)| !stored.is_expired(now, now_millis))
                    .map(|(creator, stored)| (*creator, stored.entry.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Live entries under `key`, ordered by creator.
    pub fn entries_for(&self, key: &NodeId) -> Vec<DataEntry> {
        let mut entries = self.get_entries(key).into_values().collect::<Vec<_>>();
        entries.sort_by(|a, b| a.creator.node_id().cmp(b.creator.node_id()));

        entries
    }

    /// Remove the entry of `creator` under `key` entirely.
    pub fn delete_entry(&mut self, key: &NodeId, creator: &NodeId) -> bool {
        let Some(creators) = self.entries.get_mut(key) else {
            return false;
        };

        let removed = creators.remove(creator).is_some();

        if creators.is_empty() {
            self.entries.remove(key);
        }

        removed
    }

    /// Turn the entry of `creator` under `key` into a tombstone, keeping it until it expires.
    pub fn mark_as_deleted(&mut self, key: &NodeId, creator: &NodeId) -> bool {
        let (now, now_millis) = (Instant::now(), unix_millis());

        match self
            .entries
            .get_mut(key)
            .and_then(|creators| creators.get_mut(creator))
            .filter(|stored| !stored.is_expired(now, now_millis))
        {
            Some(stored) => {
                stored.entry.deleted = true;
                true
            }
            None => false,
        }
    }

    pub fn set_stale(&mut self, key: &NodeId, creator: &NodeId, stale: bool) -> bool {
        match self
            .entries
            .get_mut(key)
            .and_then(|creators| creators.get_mut(creator))
        {
            Some(stored) => {
                stored.entry.stale = stale;
                true
            }
            None => false,
        }
    }

    /// Mark every entry under `key` as stale, returning how many there are.
    pub fn set_all_stale(&mut self, key: &NodeId) -> usize {
        self.entries
            .get_mut(key)
            .map(|creators| {
                creators
                    .values_mut()
                    .for_each(|stored| stored.entry.stale = true);
                creators.len()
            })
            .unwrap_or_default()
    }

    /// Drop every expired entry, returning how many were dropped.
    pub fn remove_expired(&mut self) -> usize {
        let (now, now_millis) = (Instant::now(), unix_millis());
        let mut removed = 0;

        self.entries.retain(|_, creators| {
            let before = creators.len();
            creators.retain(|_, stored| !stored.is_expired(now, now_millis));
            removed += before - creators.len();

            !creators.is_empty()
        });

        removed
    }

    /// Every live entry.
    pub fn entries(&self) -> impl Iterator<Item = &DataEntry> + '_ {
        let (now, now_millis) = (Instant::now(), unix_millis());

        self.entries
            .values()
            .flat_map(|creators| creators.values())
            .filter(move |stored| !stored.is_expired(now, now_millis))
            .map(|stored| &stored.entry)
    }

    /// Number of stored entries, including expired ones not swept yet.
    pub fn len(&self) -> usize {
        self.entries.values().map(|creators| creators.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
