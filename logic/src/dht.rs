use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use futures::prelude::*;
use futures::stream::FuturesUnordered;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use crate::clock::{Clock, Timestamp};
use crate::config::SystemConfig;
use crate::contact::Contact;
use crate::id::{Id, IdError};
use crate::ktree::{KTree, TreeInsert};
use crate::search::{Search, SearchOptions, SearchOutcome, SearchType};
use crate::storage::{Storage, StorageError};
use crate::transport::{PeerInfo, Request, Response, SubkeySelect, Transport, ValueEntry};

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(&'static str),

    #[error(transparent)]
    Id(#[from] IdError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("no bootstrap seed responded")]
    NoSeedReachable,
}

/// A lookup key: either an already-derived identifier or a plain string
/// hashed into one at the API boundary.
#[derive(Clone, Debug)]
pub enum Key {
    Id(Id),
    Text(String),
}

impl Key {
    pub fn resolve(&self) -> Id {
        match self {
            Key::Id(id) => *id,
            Key::Text(text) => Id::from_key(text.as_bytes()),
        }
    }

    /// The subkey used when the caller did not name one: the key itself.
    pub fn default_subkey(&self) -> String {
        match self {
            Key::Id(id) => id.to_hex(),
            Key::Text(text) => text.clone(),
        }
    }
}

impl From<Id> for Key {
    fn from(id: Id) -> Self {
        Key::Id(id)
    }
}

impl From<&str> for Key {
    fn from(text: &str) -> Self {
        Key::Text(text.to_owned())
    }
}

impl From<String> for Key {
    fn from(text: String) -> Self {
        Key::Text(text)
    }
}

/// The node itself: routing table, value cache, and the operations glued
/// on top of an abstract request/response transport.
///
/// All mutable state lives behind the node's own locks, which are never
/// held across an await. Incoming requests are delivered by the transport
/// glue through [`KademliaDht::handle_request`], which must run inside a
/// tokio runtime (contact validation probes are spawned from it).
pub struct KademliaDht<T: Transport> {
    // Immutable data
    config: SystemConfig,
    id: Id,
    clock: Arc<dyn Clock>,
    myself: Weak<KademliaDht<T>>,
    // Mutable runtime data
    pub transport: T,
    pub tree: Mutex<KTree<T::Endpoint>>,
    pub storage: RwLock<Storage>,
    // At most one contact-validation ping may be outstanding.
    eviction_busy: AtomicBool,
}

impl<T: Transport> KademliaDht<T> {
    pub fn new(
        config: SystemConfig,
        id: Id,
        transport: T,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>, Error> {
        if config.routing.bucket_size == 0 {
            return Err(Error::Config("bucket size must be at least 1"));
        }
        if config.lookup.concurrency == 0 {
            return Err(Error::Config("lookup concurrency must be at least 1"));
        }
        Ok(Arc::new_cyclic(|myself| Self {
            config: config.clone(),
            id,
            clock,
            myself: myself.clone(),
            transport,
            tree: Mutex::new(KTree::new(id, config.routing)),
            storage: RwLock::new(Storage::new(config.storage)),
            eviction_busy: AtomicBool::new(false),
        }))
    }

    /// Creates a node with a fresh random id, starts its maintenance loop
    /// and joins the network through `seeds`.
    pub async fn spawn(
        config: SystemConfig,
        transport: T,
        clock: Arc<dyn Clock>,
        seeds: Vec<T::Endpoint>,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<Arc<Self>, Error> {
        let id = Id::generate();
        let dht = Self::new(config, id, transport, clock)?;
        tokio::spawn(dht.clone().run(shutdown));
        dht.bootstrap(seeds).await?;
        Ok(dht)
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Pings every seed in parallel, adopts each live responder as a
    /// contact, then walks the network towards the own id to fill buckets.
    pub async fn bootstrap(&self, seeds: Vec<T::Endpoint>) -> Result<(), Error> {
        if seeds.is_empty() {
            debug!("no seeds, starting a fresh network");
            return Ok(());
        }

        let mut pongs: FuturesUnordered<_> = seeds
            .iter()
            .map(|endpoint| {
                let fut = self.transport.send(endpoint, Request::Ping { id: self.id });
                fut.map(move |res| (endpoint.clone(), res))
            })
            .collect();

        let mut reached = 0usize;
        while let Some((endpoint, res)) = pongs.next().await {
            match res {
                Ok(Response::Pong { id }) => {
                    reached += 1;
                    self.discovered(Contact::new(id, endpoint));
                }
                Ok(other) => warn!(?endpoint, ?other, "unexpected ping response"),
                Err(err) => warn!(?endpoint, %err, "seed unreachable"),
            }
        }
        if reached == 0 {
            return Err(Error::NoSeedReachable);
        }
        info!(reached, total = seeds.len(), "bootstrap pings done");

        self.iterative_find_node(self.id).await;
        Ok(())
    }

    /// The up-to-k closest reachable contacts to `target`, found by
    /// iterative parallel probing.
    pub async fn iterative_find_node(&self, target: Id) -> Vec<Contact<T::Endpoint>> {
        let options = SearchOptions {
            parallelism: self.config.lookup.concurrency,
        };
        let seeds = {
            self.tree
                .lock()
                .unwrap()
                .find(&target, self.config.routing.bucket_size)
        };
        let search = Search::create(self, options, SearchType::Nodes, target);
        let outcome = search.run(seeds).await;
        self.tree
            .lock()
            .unwrap()
            .mark_refreshed(&target, self.clock.now());
        outcome.closest
    }

    pub async fn iterative_find_value(
        &self,
        target: Id,
        idkey: String,
        subkeys: SubkeySelect,
    ) -> SearchOutcome<T::Endpoint> {
        let options = SearchOptions {
            parallelism: self.config.lookup.concurrency,
        };
        let seeds = {
            self.tree
                .lock()
                .unwrap()
                .find(&target, self.config.routing.bucket_size)
        };
        let search = Search::create(self, options, SearchType::Value { idkey, subkeys }, target);
        let outcome = search.run(seeds).await;
        self.tree
            .lock()
            .unwrap()
            .mark_refreshed(&target, self.clock.now());
        outcome
    }

    /// Publishes `value` under `key`, with the subkey defaulting to the
    /// key itself. Returns how many replicas accepted it (the own cache
    /// included).
    pub async fn set(&self, key: impl Into<Key>, value: Vec<u8>) -> Result<usize, Error> {
        let key = key.into();
        let subkey = key.default_subkey();
        self.multiset(key, &subkey, value).await
    }

    /// Publishes `value` under `(key, subkey)`.
    ///
    /// The own copy is kept without an expiration: this node is the
    /// publisher and republishes it on the slow cadence until it goes
    /// away. Network replicas get the default TTL.
    pub async fn multiset(
        &self,
        key: impl Into<Key>,
        subkey: &str,
        value: Vec<u8>,
    ) -> Result<usize, Error> {
        let keyid = key.into().resolve();
        let id_hex = keyid.to_hex();
        let now = self.clock.now();
        info!(key = %id_hex, %subkey, bytes = value.len(), "publishing value");

        self.storage
            .write()
            .unwrap()
            .insert(&id_hex, subkey, value.clone(), None, now)?;

        let contacts = self.iterative_find_node(keyid).await;
        let expire = now + self.config.storage.default_lifetime;
        let stored = self
            .broadcast_store(&contacts, &id_hex, subkey, &value, expire)
            .await;
        Ok(stored + 1)
    }

    /// Retrieves the value under `key`'s default subkey, consulting the
    /// own cache first and the network after. `None` only means the value
    /// was not found here or at the probed nodes.
    pub async fn get(&self, key: impl Into<Key>) -> Option<Vec<u8>> {
        let key = key.into();
        let subkey = key.default_subkey();
        self.multiget(key, SubkeySelect::Single(subkey.clone()))
            .await
            .and_then(|mut found| found.remove(&subkey))
    }

    /// Retrieves every subkey stored under `key` across the network.
    pub async fn get_all(&self, key: impl Into<Key>) -> Option<HashMap<String, Vec<u8>>> {
        self.multiget(key, SubkeySelect::All).await
    }

    /// The general retrieval path. A single explicit subkey may be served
    /// straight from the cache; anything wider always asks the network,
    /// since the local cache says nothing about completeness.
    pub async fn multiget(
        &self,
        key: impl Into<Key>,
        subkeys: SubkeySelect,
    ) -> Option<HashMap<String, Vec<u8>>> {
        let keyid = key.into().resolve();
        let id_hex = keyid.to_hex();
        let now = self.clock.now();
        self.expire_cache(now);

        if let SubkeySelect::Single(want) = &subkeys {
            let cached = self
                .storage
                .read()
                .unwrap()
                .get(&id_hex, want)
                .map(|stored| stored.value.clone());
            if let Some(value) = cached {
                debug!(key = %id_hex, subkey = %want, "served from cache");
                return Some(HashMap::from([(want.clone(), value)]));
            }
        }

        let single = subkeys.is_single();
        let outcome = self
            .iterative_find_value(keyid, id_hex.clone(), subkeys)
            .await;
        if outcome.values.is_empty() {
            return None;
        }

        // Cache the result at the closest probed node that did not hold
        // it, so the next lookup converges faster.
        let single_source = if single {
            outcome.values.values().next().map(|found| found.source.id)
        } else {
            None
        };
        let chosen = outcome
            .closest
            .iter()
            .find(|c| Some(c.id) != single_source)
            .cloned();
        if let Some(chosen) = chosen {
            for (subkey, found) in &outcome.values {
                if found.source.id == chosen.id {
                    continue;
                }
                let expire = found
                    .expire
                    .unwrap_or(now + self.config.storage.default_lifetime);
                self.broadcast_store(
                    std::slice::from_ref(&chosen),
                    &id_hex,
                    subkey,
                    &found.value,
                    expire,
                )
                .await;
            }
        }

        Some(
            outcome
                .values
                .into_iter()
                .map(|(subkey, found)| (subkey, found.value))
                .collect(),
        )
    }

    /// Synchronous cache read under the default subkey; runs expiration
    /// first. `None` does not mean the network lacks the value.
    pub fn peek(&self, key: impl Into<Key>) -> Option<Vec<u8>> {
        let key = key.into();
        let subkey = key.default_subkey();
        self.peek_subkey(key, &subkey)
    }

    pub fn peek_subkey(&self, key: impl Into<Key>, subkey: &str) -> Option<Vec<u8>> {
        let id_hex = key.into().resolve().to_hex();
        self.expire_cache(self.clock.now());
        self.storage
            .read()
            .unwrap()
            .get(&id_hex, subkey)
            .map(|stored| stored.value.clone())
    }

    pub fn peek_all(&self, key: impl Into<Key>) -> Option<HashMap<String, Vec<u8>>> {
        let id_hex = key.into().resolve().to_hex();
        self.expire_cache(self.clock.now());
        self.storage.read().unwrap().get_all(&id_hex).map(|subs| {
            subs.iter()
                .map(|(subkey, stored)| (subkey.clone(), stored.value.clone()))
                .collect()
        })
    }

    /// Feeds a peer observed on the wire into the routing table.
    ///
    /// When its bucket is full and may not split, the bucket's oldest
    /// contact is pinged: if it still answers with its id it stays and the
    /// newcomer is dropped, otherwise it is replaced. Only one such probe
    /// runs at a time.
    pub fn discovered(&self, contact: Contact<T::Endpoint>) {
        if contact.id == self.id {
            return;
        }
        let outcome = { self.tree.lock().unwrap().store(contact.clone()) };
        if let TreeInsert::Full(oldest) = outcome {
            if self.eviction_busy.swap(true, Ordering::SeqCst) {
                return;
            }
            match self.myself.upgrade() {
                Some(me) => {
                    tokio::spawn(async move {
                        me.validate_eviction(oldest, contact).await;
                        me.eviction_busy.store(false, Ordering::SeqCst);
                    });
                }
                None => self.eviction_busy.store(false, Ordering::SeqCst),
            }
        }
    }

    async fn validate_eviction(
        &self,
        mut oldest: Contact<T::Endpoint>,
        replacement: Contact<T::Endpoint>,
    ) {
        let res = self
            .transport
            .send(&oldest.endpoint, Request::Ping { id: self.id })
            .await;
        let same_peer = matches!(&res, Ok(Response::Pong { id }) if *id == oldest.id);

        let mut tree = self.tree.lock().unwrap();
        if same_peer {
            oldest.set_alive(true);
            // The survivor becomes the freshest entry of its bucket.
            tree.store(oldest);
        } else {
            oldest.set_alive(false);
            debug!(id = ?oldest.id, misses = oldest.dead_count(), "evicting unresponsive contact");
            tree.remove(&oldest.id);
            tree.store(replacement);
        }
    }

    /// Serves one incoming request. Called by the transport glue; must
    /// run inside a tokio runtime.
    #[instrument(skip(self, request), fields(local = %self.id.as_short_hex()))]
    pub fn handle_request(&self, from: T::Endpoint, request: Request) -> Response<T::Endpoint> {
        debug!(?request, "incoming request");
        match request {
            Request::Ping { id } => {
                self.discovered(Contact::new(id, from));
                Response::Pong { id: self.id }
            }
            Request::Store {
                id,
                idkey,
                subkey,
                value,
                expire,
            } => {
                self.discovered(Contact::new(id, from));
                let now = self.clock.now();
                let expire = Some(expire.unwrap_or(now + self.config.storage.default_lifetime));
                match self
                    .storage
                    .write()
                    .unwrap()
                    .insert(&idkey, &subkey, value, expire, now)
                {
                    Ok(()) => Response::Stored,
                    Err(err) => {
                        warn!(%err, "rejecting store");
                        Response::Error
                    }
                }
            }
            Request::FindNode { id, target } => {
                self.discovered(Contact::new(id, from));
                Response::Nodes(self.closest_peers(&target, id))
            }
            Request::FindValue {
                id,
                target,
                idkey,
                subkeys,
            } => {
                self.discovered(Contact::new(id, from));
                self.expire_cache(self.clock.now());
                let entries = {
                    let storage = self.storage.read().unwrap();
                    match &subkeys {
                        SubkeySelect::Single(want) => storage.get(&idkey, want).map(|stored| {
                            vec![ValueEntry {
                                subkey: want.clone(),
                                value: stored.value.clone(),
                                expire: stored.expire,
                            }]
                        }),
                        SubkeySelect::Many(wants) => {
                            let found: Vec<_> = wants
                                .iter()
                                .filter_map(|want| {
                                    storage.get(&idkey, want).map(|stored| ValueEntry {
                                        subkey: want.clone(),
                                        value: stored.value.clone(),
                                        expire: stored.expire,
                                    })
                                })
                                .collect();
                            if found.is_empty() {
                                None
                            } else {
                                Some(found)
                            }
                        }
                        SubkeySelect::All => storage.get_all(&idkey).map(|subs| {
                            subs.iter()
                                .map(|(subkey, stored)| ValueEntry {
                                    subkey: subkey.clone(),
                                    value: stored.value.clone(),
                                    expire: stored.expire,
                                })
                                .collect()
                        }),
                    }
                };
                match entries {
                    Some(entries) => Response::Value(entries),
                    None => Response::Nodes(self.closest_peers(&target, id)),
                }
            }
        }
    }

    fn closest_peers(&self, target: &Id, requester: Id) -> Vec<PeerInfo<T::Endpoint>> {
        self.tree
            .lock()
            .unwrap()
            .find(target, self.config.routing.bucket_size)
            .into_iter()
            .filter(|c| c.id != requester)
            .map(|c| PeerInfo {
                id: c.id,
                endpoint: c.endpoint,
            })
            .collect()
    }

    pub(crate) fn expire_cache(&self, now: Timestamp) {
        let tree = self.tree.lock().unwrap();
        let mut storage = self.storage.write().unwrap();
        let bucket_size = self.config.routing.bucket_size;
        storage.expire(now, bucket_size, |id_hex| {
            Id::from_hex(id_hex)
                .map(|id| tree.count_closest_nodes(&id))
                .unwrap_or(0)
        });
    }

    async fn broadcast_store(
        &self,
        contacts: &[Contact<T::Endpoint>],
        idkey: &str,
        subkey: &str,
        value: &[u8],
        expire: Timestamp,
    ) -> usize {
        let mut answers: FuturesUnordered<_> = contacts
            .iter()
            .filter(|c| c.id != self.id)
            .map(|c| {
                let request = Request::Store {
                    id: self.id,
                    idkey: idkey.to_owned(),
                    subkey: subkey.to_owned(),
                    value: value.to_vec(),
                    expire: Some(expire),
                };
                let fut = self.transport.send(&c.endpoint, request);
                fut.map(move |res| (c.id, res))
            })
            .collect();

        let mut count = 0;
        while let Some((id, res)) = answers.next().await {
            match res {
                Ok(Response::Stored) => count += 1,
                Ok(Response::Error) => warn!(?id, "peer refused the store"),
                Ok(other) => warn!(?id, ?other, "unexpected store response"),
                Err(err) => warn!(?id, %err, "store failed"),
            }
        }
        count
    }

    /// Pushes every entry whose replication deadline has passed to its
    /// current k closest nodes, best-effort, and reports when the next
    /// entry comes due (capped at one full replication interval).
    pub(crate) async fn replicate_tick(&self, now: Timestamp) -> Timestamp {
        self.expire_cache(now);
        let due = { self.storage.write().unwrap().take_due(now) };
        for (id_hex, subkey) in due {
            let entry = { self.storage.read().unwrap().get(&id_hex, &subkey).cloned() };
            let Some(stored) = entry else { continue };
            let target = match Id::from_hex(&id_hex) {
                Ok(target) => target,
                Err(err) => {
                    warn!(%id_hex, %err, "undecodable key in cache, skipping");
                    continue;
                }
            };

            let contacts = self.iterative_find_node(target).await;
            let expire = stored
                .expire
                .unwrap_or(now + self.config.storage.default_lifetime);
            let replicas = self
                .broadcast_store(&contacts, &id_hex, &subkey, &stored.value, expire)
                .await;
            debug!(key = %id_hex, %subkey, replicas, "replicated entry");
            self.storage
                .write()
                .unwrap()
                .mark_replicated(&id_hex, &subkey, now);
        }

        let ceiling = now + self.config.storage.replicate_interval;
        self.storage
            .read()
            .unwrap()
            .next_due()
            .map_or(ceiling, |due| due.min(ceiling))
    }

    /// Probes a random id in every bucket that went stale, and reports
    /// the next bucket due time.
    pub(crate) async fn refresh_tick(&self, now: Timestamp) -> Option<Timestamp> {
        let (targets, next) = {
            self.tree
                .lock()
                .unwrap()
                .refresh_targets(self.config.routing.refresh_interval, now)
        };
        for target in targets {
            debug!(target = %target.as_short_hex(), "refreshing bucket");
            self.iterative_find_node(target).await;
        }
        next
    }

    /// Maintenance loop: replication, expiration and bucket refresh.
    /// Runs until `shutdown` fires (or its sender goes away).
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        loop {
            let now = self.clock.now();
            let next_replicate = self.replicate_tick(now).await;
            let next_refresh = self.refresh_tick(now).await;
            let wake = next_refresh.map_or(next_replicate, |t| t.min(next_replicate));

            let sleep_ms = wake.millis_since(self.clock.now()).max(1) as u64;
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(Duration::from_millis(sleep_ms)) => {}
            }
        }
        debug!("maintenance loop stopped");
    }
}
