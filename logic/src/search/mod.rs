use std::cmp::Ordering;
use std::collections::{hash_map::Entry, HashMap};

use futures::prelude::*;
use futures::stream::FuturesUnordered;
use tracing::{debug, instrument, warn};

use crate::clock::Timestamp;
use crate::contact::Contact;
use crate::dht::KademliaDht;
use crate::id::Id;
use crate::shortlist::ShortList;
use crate::transport::{Request, Response, SubkeySelect, Transport};

#[derive(Clone, Debug)]
pub struct SearchOptions {
    // Also called alpha in the original paper
    // n. of nodes queried in parallel
    pub parallelism: u32,
}

#[derive(Clone, Debug)]
pub enum SearchType {
    Nodes,
    Value {
        idkey: String,
        subkeys: SubkeySelect,
    },
}

/// A value reported by a responder during a value search.
#[derive(Clone, Debug)]
pub struct FoundValue<E> {
    pub value: Vec<u8>,
    pub expire: Option<Timestamp>,
    pub source: Contact<E>,
}

/// Result of a finished search: the final candidate window in distance
/// order, plus (for value searches) the winning value per subkey.
pub struct SearchOutcome<E> {
    pub closest: Vec<Contact<E>>,
    pub values: HashMap<String, FoundValue<E>>,
}

/// Iterative search, taken from the Kademlia original paper.
///
/// Keeps a bucket-size window of the closest known contacts to the target.
/// A newly learned contact enters the window only if it lands among the
/// k closest. At most `parallelism` contacts are queried at a time; the
/// search ends when the whole window was probed (or, for a single-subkey
/// value search, on the first hit).
///
/// Contacts whose query fails drop out of the window; they may re-enter
/// if another responder reports them again.
pub struct Search<'a, T: Transport> {
    dht: &'a KademliaDht<T>,
    options: SearchOptions,
    search_type: SearchType,
    target: Id,
}

impl<'a, T: Transport> Search<'a, T> {
    pub fn create(
        dht: &'a KademliaDht<T>,
        options: SearchOptions,
        search_type: SearchType,
        target: Id,
    ) -> Self {
        Self {
            dht,
            options,
            search_type,
            target,
        }
    }

    fn request(&self) -> Request {
        let id = self.dht.id();
        match &self.search_type {
            SearchType::Nodes => Request::FindNode {
                id,
                target: self.target,
            },
            SearchType::Value { idkey, subkeys } => Request::FindValue {
                id,
                target: self.target,
                idkey: idkey.clone(),
                subkeys: subkeys.clone(),
            },
        }
    }

    fn start_query(
        &self,
        list: &mut ShortList<T::Endpoint>,
    ) -> Option<impl Future<Output = (Contact<T::Endpoint>, Result<Response<T::Endpoint>, crate::transport::RpcError>)>>
    {
        // The closest unqueried entry, since the window keeps distance order.
        let contact = list.next()?;
        let fut = self.dht.transport().send(&contact.endpoint, self.request());
        Some(fut.map(move |res| (contact, res)))
    }

    #[instrument(skip_all, fields(target = %self.target.as_short_hex()))]
    pub async fn run(&self, seeds: Vec<Contact<T::Endpoint>>) -> SearchOutcome<T::Endpoint> {
        let bucket_size = self.dht.config().routing.bucket_size;
        let parallelism = self.options.parallelism.max(1);
        let local_id = self.dht.id();

        let mut list = ShortList::new(self.target, bucket_size);
        list.insert_many(seeds.into_iter().filter(|c| c.id != local_id));
        debug!(window = list.len(), "search starting");

        let mut values: HashMap<String, FoundValue<T::Endpoint>> = HashMap::new();

        let pending: FuturesUnordered<_> = (0..parallelism)
            .filter_map(|_| self.start_query(&mut list))
            .collect();
        let mut available = parallelism - pending.len() as u32;
        tokio::pin!(pending);

        'drive: while let Some((contact, res)) = pending.next().await {
            available += 1;
            match res {
                Err(err) => {
                    debug!(id = ?contact.id, %err, "query failed, dropping from window");
                    list.remove(&contact.id);
                }
                Ok(Response::Nodes(peers)) => {
                    self.dht.discovered(contact.clone());
                    list.insert_many(
                        peers
                            .into_iter()
                            .filter(|p| p.id != local_id)
                            .map(|p| Contact::new(p.id, p.endpoint)),
                    );
                }
                Ok(Response::Value(entries)) => {
                    self.dht.discovered(contact.clone());
                    match &self.search_type {
                        SearchType::Nodes => {
                            warn!(id = ?contact.id, "responder returned a value to a node search");
                        }
                        SearchType::Value {
                            subkeys: SubkeySelect::Single(want),
                            ..
                        } => {
                            if let Some(entry) = entries.into_iter().find(|e| &e.subkey == want) {
                                values.insert(
                                    entry.subkey,
                                    FoundValue {
                                        value: entry.value,
                                        expire: entry.expire,
                                        source: contact,
                                    },
                                );
                                // First hit wins; whatever is still in
                                // flight gets discarded.
                                break 'drive;
                            }
                        }
                        SearchType::Value { .. } => {
                            for entry in entries {
                                match values.entry(entry.subkey) {
                                    Entry::Occupied(mut current) => {
                                        // A strictly closer source takes the
                                        // subkey; equal distance keeps the
                                        // earliest report.
                                        let closer = self
                                            .target
                                            .cmp_distance(&contact.id, &current.get().source.id)
                                            == Ordering::Less;
                                        if closer {
                                            current.insert(FoundValue {
                                                value: entry.value,
                                                expire: entry.expire,
                                                source: contact.clone(),
                                            });
                                        }
                                    }
                                    Entry::Vacant(slot) => {
                                        slot.insert(FoundValue {
                                            value: entry.value,
                                            expire: entry.expire,
                                            source: contact.clone(),
                                        });
                                    }
                                }
                            }
                        }
                    }
                }
                Ok(other) => {
                    warn!(id = ?contact.id, ?other, "unexpected search response");
                }
            }

            // Top the in-flight set back up to the parallelism limit.
            while available > 0 {
                match self.start_query(&mut list) {
                    None => break,
                    Some(fut) => {
                        pending.push(fut);
                        available -= 1;
                    }
                }
            }
        }

        debug!(
            window = list.len(),
            values = values.len(),
            "search finished"
        );
        SearchOutcome {
            closest: list.into_contacts(),
            values,
        }
    }
}
