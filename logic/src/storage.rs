use std::cmp::Reverse;
use std::collections::HashMap;

use priority_queue::PriorityQueue;
use thiserror::Error;
use tracing::{debug, info};

use crate::clock::Timestamp;
use crate::config::StorageConfig;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum StorageError {
    #[error("Too many entries stored")]
    TooManyEntries,
    #[error("Value of {0} bytes exceeds the stored-value limit")]
    ValueTooLarge(usize),
}

/// One cached value under a (key, subkey) pair.
///
/// `expire == None` marks an entry this node itself published: it never
/// ages out and rides the slower republish cadence. `refreshed_at` is the
/// last time this node pushed the entry to its replica set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredValue {
    pub value: Vec<u8>,
    pub expire: Option<Timestamp>,
    pub refreshed_at: Timestamp,
}

/// Two-level value cache: hex key id, then subkey.
#[derive(Clone, Debug)]
pub struct Storage {
    config: StorageConfig,
    entry_count: usize,
    entries: HashMap<String, HashMap<String, StoredValue>>,
    deadlines: PriorityQueue<(String, String), Reverse<Timestamp>>,
}

impl Storage {
    pub fn new(config: StorageConfig) -> Self {
        Storage {
            config,
            entry_count: 0,
            entries: HashMap::new(),
            deadlines: PriorityQueue::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entry_count
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    fn replicate_deadline(&self, expire: Option<Timestamp>, from: Timestamp) -> Timestamp {
        if expire.is_none() {
            from + self.config.republish_interval
        } else {
            from + self.config.replicate_interval
        }
    }

    pub fn insert(
        &mut self,
        id_hex: &str,
        subkey: &str,
        value: Vec<u8>,
        expire: Option<Timestamp>,
        now: Timestamp,
    ) -> Result<(), StorageError> {
        if value.len() > self.config.max_value_size {
            return Err(StorageError::ValueTooLarge(value.len()));
        }
        let existing = self
            .entries
            .get(id_hex)
            .map_or(false, |subs| subs.contains_key(subkey));
        if !existing && self.entry_count >= self.config.max_entries {
            return Err(StorageError::TooManyEntries);
        }

        let deadline = self.replicate_deadline(expire, now);
        self.entries.entry(id_hex.to_owned()).or_default().insert(
            subkey.to_owned(),
            StoredValue {
                value,
                expire,
                refreshed_at: now,
            },
        );
        if !existing {
            self.entry_count += 1;
        }
        self.deadlines
            .push((id_hex.to_owned(), subkey.to_owned()), Reverse(deadline));
        Ok(())
    }

    pub fn get(&self, id_hex: &str, subkey: &str) -> Option<&StoredValue> {
        self.entries.get(id_hex)?.get(subkey)
    }

    pub fn get_all(&self, id_hex: &str) -> Option<&HashMap<String, StoredValue>> {
        self.entries.get(id_hex)
    }

    pub fn remove(&mut self, id_hex: &str, subkey: &str) -> Option<StoredValue> {
        let subs = self.entries.get_mut(id_hex)?;
        let removed = subs.remove(subkey)?;
        if subs.is_empty() {
            self.entries.remove(id_hex);
        }
        self.entry_count -= 1;
        self.deadlines
            .remove(&(id_hex.to_owned(), subkey.to_owned()));
        Some(removed)
    }

    /// Pops every entry whose replication deadline has passed. The caller
    /// replicates best-effort and reschedules with [`Self::mark_replicated`].
    pub fn take_due(&mut self, now: Timestamp) -> Vec<(String, String)> {
        let mut due = Vec::new();
        while let Some((_, Reverse(deadline))) = self.deadlines.peek() {
            if *deadline > now {
                break;
            }
            let (key, _) = self.deadlines.pop().unwrap();
            due.push(key);
        }
        due
    }

    pub fn mark_replicated(&mut self, id_hex: &str, subkey: &str, now: Timestamp) {
        let entry = self
            .entries
            .get_mut(id_hex)
            .and_then(|subs| subs.get_mut(subkey));
        let Some(stored) = entry else { return };
        let expire = stored.expire;
        stored.refreshed_at = now;
        let deadline = self.replicate_deadline(expire, now);
        self.deadlines
            .push((id_hex.to_owned(), subkey.to_owned()), Reverse(deadline));
    }

    pub fn next_due(&self) -> Option<Timestamp> {
        self.deadlines.peek().map(|(_, Reverse(t))| *t)
    }

    /// Drops every entry whose scaled residual lifetime has run out.
    ///
    /// `closer_nodes` reports how many known contacts sit closer to the
    /// local id than the key does; when that count exceeds the bucket size
    /// this node is outside the key's nominal replica set and the residual
    /// lifetime is scaled by `exp(k / n)`. Publisher entries
    /// (`expire == None`) are exempt.
    pub fn expire<F: FnMut(&str) -> usize>(
        &mut self,
        now: Timestamp,
        bucket_size: usize,
        mut closer_nodes: F,
    ) {
        let mut dropped = Vec::new();
        for (id_hex, subs) in &self.entries {
            let mut closer: Option<usize> = None;
            for (subkey, stored) in subs {
                let Some(expire) = stored.expire else { continue };
                let mut remaining = expire.millis_since(now);
                let n = *closer.get_or_insert_with(|| closer_nodes(id_hex));
                if n > bucket_size {
                    let factor = (bucket_size as f64 / n as f64).exp();
                    remaining = (remaining as f64 * factor) as i64;
                }
                if remaining <= 0 {
                    dropped.push((id_hex.clone(), subkey.clone()));
                }
            }
        }
        for (id_hex, subkey) in dropped {
            debug!(%id_hex, %subkey, "expiring cached value");
            self.remove(&id_hex, &subkey);
        }
        if self.entry_count >= self.config.max_entries {
            info!(entries = self.entry_count, "value cache is saturated");
        }
    }
}
