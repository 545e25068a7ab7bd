use std::collections::HashMap;
use std::time::Duration;

use tracing::debug;

use crate::clock::Timestamp;
use crate::config::RoutingConfig;
use crate::consts::ID_LEN_BITS;
use crate::contact::Contact;
use crate::id::{Id, Prefix};
use crate::kbucket::{BucketInsert, KBucket};
use crate::shortlist::ShortList;
use crate::transport::Endpoint;

/// Outcome of [`KTree::store`].
#[derive(Debug)]
pub enum TreeInsert<E> {
    Stored,
    /// The covering bucket is full and may not split; the bucket's oldest
    /// contact is returned so the caller can validate it before evicting.
    Full(Contact<E>),
    /// The local id is never stored.
    Rejected,
}

enum Node<E> {
    Leaf(KBucket<E>),
    Branch {
        left: Box<Node<E>>,
        right: Box<Node<E>>,
    },
}

/// Binary prefix tree of buckets rooted at the local id.
///
/// Each leaf's prefix is its path from the root (left 0, right 1). Only
/// buckets covering the local id's region split; everything else evicts.
/// The side map from canonical endpoint bytes to id keeps every transport
/// address bound to at most one identifier.
pub struct KTree<E: Endpoint> {
    id: Id,
    config: RoutingConfig,
    root: Node<E>,
    endpoints: HashMap<Vec<u8>, Id>,
}

impl<E: Endpoint> KTree<E> {
    pub fn new(id: Id, config: RoutingConfig) -> Self {
        let root = Node::Leaf(KBucket::new(config.bucket_size, Prefix::default()));
        KTree {
            id,
            config,
            root,
            endpoints: HashMap::new(),
        }
    }

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn endpoint_owner(&self, canonical: &[u8]) -> Option<&Id> {
        self.endpoints.get(canonical)
    }

    pub fn has(&self, id: &Id) -> bool {
        let mut node = &self.root;
        let mut depth = 0;
        loop {
            match node {
                Node::Leaf(bucket) => return bucket.contacts().iter().any(|c| &c.id == id),
                Node::Branch { left, right } => {
                    node = if id.at(depth) { right } else { left };
                    depth += 1;
                }
            }
        }
    }

    pub fn store(&mut self, contact: Contact<E>) -> TreeInsert<E> {
        if contact.id == self.id {
            return TreeInsert::Rejected;
        }
        let id = contact.id;
        let canonical = contact.endpoint.canonical();
        let outcome = Self::insert_at(&mut self.root, &self.id, contact, 0, true);
        if matches!(outcome, TreeInsert::Stored) {
            self.register_endpoint(canonical, id);
        }
        outcome
    }

    fn insert_at(
        node: &mut Node<E>,
        local: &Id,
        contact: Contact<E>,
        depth: usize,
        on_path: bool,
    ) -> TreeInsert<E> {
        match node {
            Node::Branch { left, right } => {
                let bit = contact.id.at(depth);
                let on_path = on_path && bit == local.at(depth);
                let child = if bit { right } else { left };
                Self::insert_at(child, local, contact, depth + 1, on_path)
            }
            Node::Leaf(bucket) => {
                let contact = match bucket.store(contact) {
                    BucketInsert::Stored => return TreeInsert::Stored,
                    BucketInsert::Full(c) => c,
                };
                if !on_path || depth + 1 >= ID_LEN_BITS {
                    let oldest = bucket
                        .oldest()
                        .cloned()
                        .expect("a full bucket has an oldest entry");
                    return TreeInsert::Full(oldest);
                }
                // The region covers the local id: turn the leaf into a
                // branch, redistribute by the deciding bit, and retry.
                debug!(depth, "splitting bucket");
                let full = std::mem::replace(bucket, KBucket::new(0, Prefix::default()));
                let (zero, one) = full.split(depth);
                *node = Node::Branch {
                    left: Box::new(Node::Leaf(zero)),
                    right: Box::new(Node::Leaf(one)),
                };
                Self::insert_at(node, local, contact, depth, on_path)
            }
        }
    }

    /// Binds `canonical` to `id`; a different id that previously claimed
    /// the same address is dropped from the table, so a restarted (or
    /// hostile) peer cannot hold several ids from one address.
    fn register_endpoint(&mut self, canonical: Vec<u8>, id: Id) {
        if let Some(prior) = self.endpoints.insert(canonical, id) {
            if prior != id {
                debug!(?prior, ?id, "endpoint rebound, dropping prior id");
                self.remove(&prior);
            }
        }
    }

    pub fn remove(&mut self, id: &Id) -> Option<Contact<E>> {
        let mut node = &mut self.root;
        let mut depth = 0;
        let removed = loop {
            match node {
                Node::Leaf(bucket) => break bucket.remove(id),
                Node::Branch { left, right } => {
                    node = if id.at(depth) { right } else { left };
                    depth += 1;
                }
            }
        };
        if let Some(contact) = &removed {
            let canonical = contact.endpoint.canonical();
            if self.endpoints.get(&canonical) == Some(id) {
                self.endpoints.remove(&canonical);
            }
        }
        removed
    }

    /// The up-to-`n` closest known contacts to `target`, sorted by
    /// distance. Descends the matching subtree first and only widens to
    /// siblings while the accumulator is short, which preserves
    /// extremality: everything in a matching subtree is closer than
    /// anything in its sibling.
    pub fn find(&self, target: &Id, n: usize) -> Vec<Contact<E>> {
        let mut list = ShortList::new(*target, n);
        Self::collect(&self.root, target, 0, n, &mut list);
        list.into_contacts()
    }

    fn collect(node: &Node<E>, target: &Id, depth: usize, n: usize, list: &mut ShortList<E>) {
        match node {
            Node::Leaf(bucket) => {
                list.insert_many(bucket.contacts().iter().cloned());
            }
            Node::Branch { left, right } => {
                let bit = target.at(depth);
                let (matching, sibling) = if bit { (right, left) } else { (left, right) };
                Self::collect(matching, target, depth + 1, n, list);
                if list.len() < n {
                    Self::collect(sibling, target, depth + 1, n, list);
                }
            }
        }
    }

    /// Collects one random probe target per due bucket, stamping those
    /// buckets as refreshed, and reports the earliest upcoming due time.
    pub fn refresh_targets(
        &mut self,
        interval: Duration,
        now: Timestamp,
    ) -> (Vec<Id>, Option<Timestamp>) {
        let mut targets = Vec::new();
        let mut next: Option<Timestamp> = None;
        Self::walk_refresh(&mut self.root, interval, now, &mut targets, &mut next);
        (targets, next)
    }

    fn walk_refresh(
        node: &mut Node<E>,
        interval: Duration,
        now: Timestamp,
        targets: &mut Vec<Id>,
        next: &mut Option<Timestamp>,
    ) {
        match node {
            Node::Leaf(bucket) => {
                let due = match bucket.next_refresh(interval, now) {
                    None => {
                        targets.push(bucket.random_id());
                        bucket.mark_refreshed(now);
                        now + interval
                    }
                    Some(due) => due,
                };
                *next = Some(next.map_or(due, |n| n.min(due)));
            }
            Node::Branch { left, right } => {
                Self::walk_refresh(left, interval, now, targets, next);
                Self::walk_refresh(right, interval, now, targets, next);
            }
        }
    }

    /// Stamps the bucket currently covering `id` as refreshed.
    pub fn mark_refreshed(&mut self, id: &Id, now: Timestamp) {
        let mut node = &mut self.root;
        let mut depth = 0;
        loop {
            match node {
                Node::Leaf(bucket) => {
                    bucket.mark_refreshed(now);
                    return;
                }
                Node::Branch { left, right } => {
                    node = if id.at(depth) { right } else { left };
                    depth += 1;
                }
            }
        }
    }

    /// How many stored contacts sit strictly closer to the local id than
    /// `id` does. Drives the over-caching expiration factor.
    pub fn count_closest_nodes(&self, id: &Id) -> usize {
        let mut count = 0;
        Self::walk_count(&self.root, &self.id, id, &mut count);
        count
    }

    fn walk_count(node: &Node<E>, local: &Id, id: &Id, count: &mut usize) {
        match node {
            Node::Leaf(bucket) => {
                *count += bucket
                    .contacts()
                    .iter()
                    .filter(|c| local.cmp_distance(id, &c.id) == std::cmp::Ordering::Greater)
                    .count();
            }
            Node::Branch { left, right } => {
                Self::walk_count(left, local, id, count);
                Self::walk_count(right, local, id, count);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(k: usize) -> RoutingConfig {
        RoutingConfig {
            bucket_size: k,
            ..Default::default()
        }
    }

    fn contact(hex: &str) -> Contact<String> {
        Contact::new(Id::from_hex(hex).unwrap(), format!("ep-{hex}"))
    }

    fn id(hex: &str) -> Id {
        Id::from_hex(hex).unwrap()
    }

    fn leaves<'a, E: Endpoint>(node: &'a Node<E>, out: &mut Vec<&'a KBucket<E>>) {
        match node {
            Node::Leaf(bucket) => out.push(bucket),
            Node::Branch { left, right } => {
                leaves(left, out);
                leaves(right, out);
            }
        }
    }

    #[test]
    fn rejects_local_id() {
        let local = Id::generate();
        let mut tree = KTree::new(local, config(2));
        assert!(matches!(
            tree.store(Contact::new(local, "self".to_owned())),
            TreeInsert::Rejected
        ));
        assert!(!tree.has(&local));
    }

    #[test]
    fn split_boundary() {
        // Local id all zeros, k = 2: the right subtree (prefix 1) may not
        // split, the left one may.
        let mut tree = KTree::new(Id::ZERO, config(2));

        let near1 = "0000000000000000000000000000000000000001";
        let near2 = "0000000000000000000000000000000000000002";
        let far1 = "8000000000000000000000000000000000000001";
        let far2 = "8000000000000000000000000000000000000002";
        let far3 = "8000000000000000000000000000000000000003";

        assert!(matches!(tree.store(contact(near1)), TreeInsert::Stored));
        assert!(matches!(tree.store(contact(near2)), TreeInsert::Stored));
        assert!(matches!(tree.store(contact(far1)), TreeInsert::Stored));
        assert!(matches!(tree.store(contact(far2)), TreeInsert::Stored));

        let evicted = match tree.store(contact(far3)) {
            TreeInsert::Full(oldest) => oldest,
            other => panic!("expected a full bucket, got {other:?}"),
        };
        assert_eq!(evicted.id, id(far1));
        assert!(!tree.has(&id(far3)));

        let mut buckets = Vec::new();
        leaves(&tree.root, &mut buckets);
        assert_eq!(buckets.len(), 2);

        let right = buckets
            .iter()
            .find(|b| b.prefix().len() == 1 && b.prefix().bit(0))
            .unwrap();
        let right_ids: Vec<_> = right.contacts().iter().map(|c| c.id).collect();
        assert_eq!(right_ids, vec![id(far1), id(far2)]);

        let left = buckets
            .iter()
            .find(|b| b.prefix().len() == 1 && !b.prefix().bit(0))
            .unwrap();
        let left_ids: Vec<_> = left.contacts().iter().map(|c| c.id).collect();
        assert_eq!(left_ids, vec![id(near1), id(near2)]);
    }

    #[test]
    fn bucket_prefixes_match_contents() {
        let mut tree = KTree::new(Id::ZERO, config(2));
        let mut rng_ids = Vec::new();
        for i in 0..32u8 {
            let mut raw = [0u8; crate::consts::ID_LEN];
            raw[0] = i.wrapping_mul(37);
            raw[19] = i + 1;
            rng_ids.push(Id(raw));
        }
        for nid in &rng_ids {
            tree.store(Contact::new(*nid, format!("ep-{}", nid.to_hex())));
        }

        let mut buckets = Vec::new();
        leaves(&tree.root, &mut buckets);
        for bucket in buckets {
            assert!(bucket.len() <= 2);
            for c in bucket.contacts() {
                assert!(bucket.prefix().matches(&c.id));
            }
        }
    }

    #[test]
    fn endpoint_rebinding_drops_prior_id() {
        let mut tree = KTree::new(Id::ZERO, config(4));
        let x = id("0a");
        let y = id("0b");
        tree.store(Contact::new(x, "e1".to_owned()));
        assert!(tree.has(&x));

        tree.store(Contact::new(y, "e1".to_owned()));
        assert!(!tree.has(&x));
        assert!(tree.has(&y));
        assert_eq!(tree.endpoint_owner(b"e1"), Some(&y));
    }

    #[test]
    fn remove_clears_endpoint_binding() {
        let mut tree = KTree::new(Id::ZERO, config(4));
        let x = id("0a");
        tree.store(Contact::new(x, "e1".to_owned()));
        assert!(tree.remove(&x).is_some());
        assert_eq!(tree.endpoint_owner(b"e1"), None);
    }

    #[test]
    fn find_is_sorted_bounded_and_extremal() {
        let local = id("a000000000000000000000000000000000000000");
        let mut tree = KTree::new(local, config(2));
        let stored = [
            "b000000000000000000000000000000000000000",
            "b000000000000000000000000000000000000008",
            "a000000000000000000000000000000000000008",
            "a000000000000000000000000000000000000001",
            "a000000000000000000000000000000000000002",
        ];
        let mut kept = Vec::new();
        for hex in stored {
            if matches!(tree.store(contact(hex)), TreeInsert::Stored) {
                kept.push(id(hex));
            }
        }

        let target = id("b000000000000000000000000000000000000009");
        let found = tree.find(&target, 3);
        assert_eq!(found.len(), 3);

        // sorted ascending by distance
        for pair in found.windows(2) {
            assert_ne!(
                target.cmp_distance(&pair[0].id, &pair[1].id),
                std::cmp::Ordering::Greater
            );
        }
        // extremal: every omitted stored contact is at least as far as the
        // farthest returned one
        let farthest = &found.last().unwrap().id;
        for nid in kept {
            if !found.iter().any(|c| c.id == nid) {
                assert_ne!(
                    target.cmp_distance(&nid, farthest),
                    std::cmp::Ordering::Less
                );
            }
        }
    }

    #[test]
    fn count_closest_nodes_counts_strictly_closer() {
        let mut tree = KTree::new(Id::ZERO, config(4));
        tree.store(contact("01"));
        tree.store(contact("02"));
        tree.store(contact("0c"));
        // distance to local (zero) is the id itself
        assert_eq!(tree.count_closest_nodes(&id("08")), 2);
        assert_eq!(tree.count_closest_nodes(&id("01")), 0);
        assert_eq!(tree.count_closest_nodes(&id("ff")), 3);
    }

    #[test]
    fn refresh_targets_probe_due_buckets() {
        let interval = Duration::from_secs(3600);
        let now = Timestamp::from_millis(1_000_000);
        let mut tree = KTree::<String>::new(Id::ZERO, config(2));

        let (targets, next) = tree.refresh_targets(interval, now);
        assert_eq!(targets.len(), 1); // single root bucket, never refreshed
        assert_eq!(next, Some(now + interval));

        // nothing due until the interval elapses
        let (targets, _) = tree.refresh_targets(interval, now + Duration::from_secs(1));
        assert!(targets.is_empty());

        let (targets, _) = tree.refresh_targets(interval, now + interval);
        assert_eq!(targets.len(), 1);
    }
}
