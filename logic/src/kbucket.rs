use std::time::Duration;

use crate::clock::Timestamp;
use crate::contact::Contact;
use crate::id::{Id, Prefix};

/// Outcome of [`KBucket::store`]; on overflow the rejected contact is
/// handed back so the caller can retry after a split or an eviction.
#[derive(Debug)]
pub enum BucketInsert<E> {
    Stored,
    Full(Contact<E>),
}

/// Capacity-bounded contact list for one prefix region, oldest first.
///
/// Every stored contact's id starts with the bucket prefix, and no two
/// stored contacts share an id.
#[derive(Clone, Debug)]
pub struct KBucket<E> {
    capacity: usize,
    prefix: Prefix,
    contacts: Vec<Contact<E>>,
    refreshed_at: Option<Timestamp>,
}

impl<E: Clone> KBucket<E> {
    pub fn new(capacity: usize, prefix: Prefix) -> Self {
        KBucket {
            capacity,
            prefix,
            contacts: Vec::with_capacity(capacity),
            refreshed_at: None,
        }
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn prefix(&self) -> &Prefix {
        &self.prefix
    }

    /// A re-seen id moves to the tail (most recently seen) and takes the
    /// new endpoint; a fresh one is appended unless the bucket is full.
    pub fn store(&mut self, contact: Contact<E>) -> BucketInsert<E> {
        if let Some(index) = self.contacts.iter().position(|c| c.id == contact.id) {
            self.contacts.remove(index);
            self.contacts.push(contact);
            return BucketInsert::Stored;
        }
        if self.contacts.len() >= self.capacity {
            return BucketInsert::Full(contact);
        }
        self.contacts.push(contact);
        BucketInsert::Stored
    }

    pub fn remove(&mut self, id: &Id) -> Option<Contact<E>> {
        let index = self.contacts.iter().position(|c| &c.id == id)?;
        Some(self.contacts.remove(index))
    }

    /// Up to the first `n` contacts, oldest first.
    pub fn obtain(&self, n: usize) -> &[Contact<E>] {
        &self.contacts[..n.min(self.contacts.len())]
    }

    pub fn contacts(&self) -> &[Contact<E>] {
        &self.contacts
    }

    pub fn oldest(&self) -> Option<&Contact<E>> {
        self.contacts.first()
    }

    /// Splits into the two child buckets, routing each contact by its
    /// `nth` bit and keeping relative age order on both sides.
    pub fn split(self, nth: usize) -> (KBucket<E>, KBucket<E>) {
        let mut zero = KBucket::new(self.capacity, self.prefix.child(false));
        let mut one = KBucket::new(self.capacity, self.prefix.child(true));
        zero.refreshed_at = self.refreshed_at;
        one.refreshed_at = self.refreshed_at;
        for contact in self.contacts {
            if contact.id.at(nth) {
                one.contacts.push(contact);
            } else {
                zero.contacts.push(contact);
            }
        }
        (zero, one)
    }

    /// A weakly random id inside this bucket's region, used as a refresh
    /// probe target.
    pub fn random_id(&self) -> Id {
        let mut id = Id::generate_weak();
        id.apply_prefix(&self.prefix);
        id
    }

    /// `None` when the bucket is due for a refresh (never refreshed, or the
    /// interval has elapsed); otherwise the next due time.
    pub fn next_refresh(&self, interval: Duration, now: Timestamp) -> Option<Timestamp> {
        let due = self.refreshed_at? + interval;
        if due <= now {
            None
        } else {
            Some(due)
        }
    }

    pub fn mark_refreshed(&mut self, now: Timestamp) {
        self.refreshed_at = Some(now);
    }
}
