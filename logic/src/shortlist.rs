use std::cmp::Ordering;

use crate::contact::Contact;
use crate::id::Id;

struct Entry<E> {
    queried: bool,
    contact: Contact<E>,
}

/// Bounded candidate window of a lookup, sorted by ascending XOR distance
/// to a fixed target. At most `limit` entries, never two with the same id.
pub struct ShortList<E> {
    target: Id,
    limit: usize,
    entries: Vec<Entry<E>>,
}

impl<E: Clone> ShortList<E> {
    pub fn new(target: Id, limit: usize) -> Self {
        ShortList {
            target,
            limit,
            entries: Vec::with_capacity(limit),
        }
    }

    pub fn target(&self) -> &Id {
        &self.target
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Inserts keeping distance order; when the list would overflow the
    /// farthest entry is dropped. Returns whether the contact was retained.
    pub fn insert(&mut self, contact: Contact<E>) -> bool {
        if self.entries.iter().any(|e| e.contact.id == contact.id) {
            return false;
        }
        let position = self
            .entries
            .iter()
            .position(|e| self.target.cmp_distance(&contact.id, &e.contact.id) == Ordering::Less)
            .unwrap_or(self.entries.len());
        if position >= self.limit {
            return false;
        }
        self.entries.insert(
            position,
            Entry {
                queried: false,
                contact,
            },
        );
        self.entries.truncate(self.limit);
        true
    }

    pub fn insert_many<I: IntoIterator<Item = Contact<E>>>(&mut self, contacts: I) {
        for contact in contacts {
            self.insert(contact);
        }
    }

    /// The closest contact not queried yet, marked as queried.
    pub fn next(&mut self) -> Option<Contact<E>> {
        let entry = self.entries.iter_mut().find(|e| !e.queried)?;
        entry.queried = true;
        Some(entry.contact.clone())
    }

    pub fn has_unqueried(&self) -> bool {
        self.entries.iter().any(|e| !e.queried)
    }

    pub fn remove(&mut self, id: &Id) -> Option<Contact<E>> {
        let index = self.entries.iter().position(|e| &e.contact.id == id)?;
        Some(self.entries.remove(index).contact)
    }

    pub fn contacts(&self) -> impl Iterator<Item = &Contact<E>> {
        self.entries.iter().map(|e| &e.contact)
    }

    pub fn into_contacts(self) -> Vec<Contact<E>> {
        self.entries.into_iter().map(|e| e.contact).collect()
    }
}
