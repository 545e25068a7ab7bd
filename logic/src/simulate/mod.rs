use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::broadcast;
use tracing::trace;

use crate::clock::Clock;
use crate::config::SystemConfig;
use crate::dht::{Error, KademliaDht};
use crate::id::Id;
use crate::transport::{Request, Response, RpcError, Transport};

#[derive(Default)]
struct NetInner {
    nodes: HashMap<String, NodeSlot>,
}

struct NodeSlot {
    node: Arc<KademliaDht<SimTransport>>,
    alive: bool,
}

/// An in-memory network for tests: endpoints are plain strings naming
/// registered nodes, and a request is served by invoking the target's
/// handler directly. Killed nodes answer with a transport error.
#[derive(Clone, Default)]
pub struct SimNetwork {
    inner: Arc<Mutex<NetInner>>,
}

impl SimNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(&self, endpoint: &str) -> SimTransport {
        SimTransport {
            origin: endpoint.to_owned(),
            inner: self.inner.clone(),
        }
    }

    /// Builds a node living at `endpoint` and wires it into the network.
    pub fn create(
        &self,
        config: SystemConfig,
        id: Id,
        endpoint: &str,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<KademliaDht<SimTransport>>, Error> {
        let node = KademliaDht::new(config, id, self.transport(endpoint), clock)?;
        self.inner.lock().unwrap().nodes.insert(
            endpoint.to_owned(),
            NodeSlot {
                node: node.clone(),
                alive: true,
            },
        );
        Ok(node)
    }

    /// Like [`Self::create`], but also starts the maintenance loop and
    /// bootstraps from `seeds`.
    pub async fn spawn(
        &self,
        config: SystemConfig,
        id: Id,
        endpoint: &str,
        clock: Arc<dyn Clock>,
        seeds: Vec<String>,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<Arc<KademliaDht<SimTransport>>, Error> {
        let node = self.create(config, id, endpoint, clock)?;
        tokio::spawn(node.clone().run(shutdown));
        node.bootstrap(seeds).await?;
        Ok(node)
    }

    /// Makes `endpoint` unreachable until revived.
    pub fn kill(&self, endpoint: &str) {
        if let Some(slot) = self.inner.lock().unwrap().nodes.get_mut(endpoint) {
            slot.alive = false;
        }
    }

    pub fn revive(&self, endpoint: &str) {
        if let Some(slot) = self.inner.lock().unwrap().nodes.get_mut(endpoint) {
            slot.alive = true;
        }
    }

    pub fn node(&self, endpoint: &str) -> Option<Arc<KademliaDht<SimTransport>>> {
        self.inner
            .lock()
            .unwrap()
            .nodes
            .get(endpoint)
            .map(|slot| slot.node.clone())
    }
}

#[derive(Clone)]
pub struct SimTransport {
    origin: String,
    inner: Arc<Mutex<NetInner>>,
}

impl Transport for SimTransport {
    type Endpoint = String;
    type Fut = BoxFuture<'static, Result<Response<String>, RpcError>>;

    fn send(&self, to: &String, request: Request) -> Self::Fut {
        let inner = self.inner.clone();
        let origin = self.origin.clone();
        let to = to.clone();
        async move {
            // Requests land on a fresh tick, like on any real transport.
            tokio::task::yield_now().await;
            let target = {
                let net = inner.lock().unwrap();
                match net.nodes.get(&to) {
                    Some(slot) if slot.alive => slot.node.clone(),
                    _ => return Err(RpcError::Unreachable),
                }
            };
            trace!(%origin, %to, "delivering request");
            Ok(target.handle_request(origin, request))
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use test_log::test;

    use super::*;
    use crate::clock::{ManualClock, Timestamp};
    use crate::config::RoutingConfig;
    use crate::contact::Contact;
    use crate::dht::Key;
    use crate::transport::SubkeySelect;

    const T0: Timestamp = Timestamp::from_millis(1_750_000_000_000);

    fn manual_clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(T0))
    }

    fn config_with_k(k: usize) -> SystemConfig {
        SystemConfig {
            routing: RoutingConfig {
                bucket_size: k,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn id(hex: &str) -> Id {
        Id::from_hex(hex).unwrap()
    }

    #[test(tokio::test)]
    async fn single_node_publish_and_peek() {
        let net = SimNetwork::new();
        let node = net
            .create(SystemConfig::default(), Id::generate(), "a", manual_clock())
            .unwrap();

        let replicas = node.set("hello", b"world".to_vec()).await.unwrap();
        assert_eq!(replicas, 1); // alone in the network: only the own cache

        assert_eq!(node.peek("hello").unwrap(), b"world");

        let id_hex = Id::from_key(b"hello").to_hex();
        let storage = node.storage.read().unwrap();
        let entry = storage.get(&id_hex, "hello").unwrap();
        assert_eq!(entry.value, b"world");
        // publisher copy never expires
        assert_eq!(entry.expire, None);
    }

    #[test(tokio::test)]
    async fn two_node_store_and_get() {
        let net = SimNetwork::new();
        let clock = manual_clock();
        let a = net
            .create(SystemConfig::default(), id("0a"), "a", clock.clone())
            .unwrap();
        let b = net
            .create(SystemConfig::default(), id("0b"), "b", clock.clone())
            .unwrap();

        b.bootstrap(vec!["a".to_owned()]).await.unwrap();
        assert!(a.tree.lock().unwrap().has(&b.id()));
        assert!(b.tree.lock().unwrap().has(&a.id()));

        let replicas = b.set("hello", b"world".to_vec()).await.unwrap();
        assert_eq!(replicas, 2);

        assert_eq!(a.get("hello").await.unwrap(), b"world");
        assert_eq!(a.peek("hello").unwrap(), b"world");

        // a third node that joins later finds the value over the network
        let c = net
            .create(SystemConfig::default(), id("0c"), "c", clock)
            .unwrap();
        c.bootstrap(vec!["a".to_owned()]).await.unwrap();
        assert_eq!(c.get("hello").await.unwrap(), b"world");
    }

    #[test(tokio::test)]
    async fn bootstrap_with_no_live_seed_fails() {
        let net = SimNetwork::new();
        let node = net
            .create(SystemConfig::default(), id("0a"), "a", manual_clock())
            .unwrap();
        assert!(matches!(
            node.bootstrap(vec!["ghost".to_owned()]).await,
            Err(Error::NoSeedReachable)
        ));
    }

    #[test(tokio::test)]
    async fn lookup_converges_around_a_dead_node() {
        let net = SimNetwork::new();
        let clock = manual_clock();
        let cfg = SystemConfig::default();

        let node_a = net.create(cfg.clone(), id("03"), "a", clock.clone()).unwrap();
        let _node_b = net.create(cfg.clone(), id("04"), "b", clock.clone()).unwrap();
        let node_c = net.create(cfg.clone(), id("02"), "c", clock.clone()).unwrap();
        let node_d = net.create(cfg.clone(), id("01"), "d", clock.clone()).unwrap();
        let querier = net
            .create(cfg, id("f000000000000000000000000000000000000000"), "q", clock)
            .unwrap();

        // a and c know d; the querier knows a, b and c but not d
        node_a.discovered(Contact::new(node_d.id(), "d".to_owned()));
        node_c.discovered(Contact::new(node_d.id(), "d".to_owned()));
        querier.discovered(Contact::new(node_a.id(), "a".to_owned()));
        querier.discovered(Contact::new(id("04"), "b".to_owned()));
        querier.discovered(Contact::new(node_c.id(), "c".to_owned()));

        net.kill("b");

        let found = querier.iterative_find_node(Id::ZERO).await;
        let found_ids: Vec<_> = found.iter().map(|c| c.id).collect();

        // d was learned mid-lookup and probed; the dead b dropped out;
        // distance order to the target holds
        assert_eq!(found_ids, vec![id("01"), id("02"), id("03")]);
    }

    #[test(tokio::test)]
    async fn found_value_is_cached_at_the_closest_non_holder() {
        let net = SimNetwork::new();
        let clock = manual_clock();
        let cfg = SystemConfig::default();

        let key_id = id("0000000000000000000000000000000000000001");
        let holder = net
            .create(cfg.clone(), id("f000000000000000000000000000000000000000"), "holder", clock.clone())
            .unwrap();
        let closer = net
            .create(cfg.clone(), id("0000000000000000000000000000000000000003"), "closer", clock.clone())
            .unwrap();
        let querier = net
            .create(cfg, id("8000000000000000000000000000000000000000"), "querier", clock)
            .unwrap();

        // only the far node holds the value
        holder
            .storage
            .write()
            .unwrap()
            .insert(
                &key_id.to_hex(),
                "greeting",
                b"hi".to_vec(),
                Some(T0 + Duration::from_secs(3600)),
                T0,
            )
            .unwrap();

        querier.discovered(Contact::new(holder.id(), "holder".to_owned()));
        querier.discovered(Contact::new(closer.id(), "closer".to_owned()));

        let found = querier
            .multiget(Key::Id(key_id), SubkeySelect::Single("greeting".to_owned()))
            .await
            .unwrap();
        assert_eq!(found["greeting"], b"hi");

        // the closer node never held the value but received a copy
        let cached = closer.storage.read().unwrap();
        let entry = cached.get(&key_id.to_hex(), "greeting").unwrap();
        assert_eq!(entry.value, b"hi");
        assert!(entry.expire.is_some());
    }

    #[test(tokio::test)]
    async fn full_bucket_keeps_a_live_oldest_contact() {
        let net = SimNetwork::new();
        let clock = manual_clock();
        let cfg = config_with_k(1);

        let x = net.create(cfg.clone(), id("0000000000000000000000000000000000000001"), "x", clock.clone()).unwrap();
        let _y = net.create(cfg.clone(), id("0000000000000000000000000000000000000002"), "y", clock.clone()).unwrap();
        let local = net
            .create(cfg, id("f000000000000000000000000000000000000000"), "local", clock)
            .unwrap();

        local.discovered(Contact::new(x.id(), "x".to_owned()));
        local.discovered(Contact::new(id("0000000000000000000000000000000000000002"), "y".to_owned()));
        // the validation ping to x succeeds, so x stays
        tokio::time::sleep(Duration::from_millis(50)).await;

        let tree = local.tree.lock().unwrap();
        assert!(tree.has(&x.id()));
        assert!(!tree.has(&id("0000000000000000000000000000000000000002")));
    }

    #[test(tokio::test)]
    async fn full_bucket_replaces_a_dead_oldest_contact() {
        let net = SimNetwork::new();
        let clock = manual_clock();
        let cfg = config_with_k(1);

        let x = net.create(cfg.clone(), id("0000000000000000000000000000000000000001"), "x", clock.clone()).unwrap();
        let y_id = id("0000000000000000000000000000000000000002");
        let _y = net.create(cfg.clone(), y_id, "y", clock.clone()).unwrap();
        let local = net
            .create(cfg, id("f000000000000000000000000000000000000000"), "local", clock)
            .unwrap();

        local.discovered(Contact::new(x.id(), "x".to_owned()));
        net.kill("x");
        local.discovered(Contact::new(y_id, "y".to_owned()));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let tree = local.tree.lock().unwrap();
        assert!(!tree.has(&x.id()));
        assert!(tree.has(&y_id));
    }

    #[test(tokio::test)]
    async fn replication_reaches_nodes_that_joined_later() {
        let net = SimNetwork::new();
        let clock = manual_clock();
        let cfg = SystemConfig::default();

        let a = net.create(cfg.clone(), id("0a"), "a", clock.clone()).unwrap();
        let b = net.create(cfg.clone(), id("0b"), "b", clock.clone()).unwrap();
        b.bootstrap(vec!["a".to_owned()]).await.unwrap();

        b.set("topic", b"payload".to_vec()).await.unwrap();

        // a newcomer the publisher learns about after the initial store
        let late = net.create(cfg.clone(), id("0c"), "late", clock.clone()).unwrap();
        b.discovered(Contact::new(late.id(), "late".to_owned()));

        let id_hex = Id::from_key(b"topic").to_hex();
        assert!(late.storage.read().unwrap().get(&id_hex, "topic").is_none());

        clock.advance(cfg.storage.republish_interval + Duration::from_secs(1));
        b.replicate_tick(clock.now()).await;

        let cached = late.storage.read().unwrap();
        assert_eq!(cached.get(&id_hex, "topic").unwrap().value, b"payload");
    }

    #[test(tokio::test)]
    async fn stored_values_expire() {
        let net = SimNetwork::new();
        let clock = manual_clock();
        let node = net
            .create(SystemConfig::default(), id("0a"), "a", clock.clone())
            .unwrap();

        let key_hex = Id::from_key(b"volatile").to_hex();
        node.storage
            .write()
            .unwrap()
            .insert(
                &key_hex,
                "volatile",
                b"soon gone".to_vec(),
                Some(T0 + Duration::from_secs(2)),
                T0,
            )
            .unwrap();

        assert_eq!(node.peek("volatile").unwrap(), b"soon gone");

        clock.advance(Duration::from_secs(3));
        assert!(node.peek("volatile").is_none());
    }

    #[test(tokio::test)]
    async fn get_all_collects_every_subkey() {
        let net = SimNetwork::new();
        let clock = manual_clock();
        let cfg = SystemConfig::default();

        let a = net.create(cfg.clone(), id("0a"), "a", clock.clone()).unwrap();
        let b = net.create(cfg.clone(), id("0b"), "b", clock.clone()).unwrap();
        b.bootstrap(vec!["a".to_owned()]).await.unwrap();

        b.multiset("room", "alice", b"hi".to_vec()).await.unwrap();
        b.multiset("room", "bob", b"hey".to_vec()).await.unwrap();

        let c = net.create(cfg, id("0c"), "c", clock).unwrap();
        c.bootstrap(vec!["a".to_owned()]).await.unwrap();

        let all = c.get_all("room").await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["alice"], b"hi");
        assert_eq!(all["bob"], b"hey");

        let _ = a;
    }

    #[test(tokio::test)]
    async fn spawn_runs_the_maintenance_loop() {
        let net = SimNetwork::new();
        let clock = manual_clock();
        let cfg = SystemConfig::default();

        let a = net.create(cfg.clone(), id("0a"), "a", clock.clone()).unwrap();
        let (killswitch, shutdown) = broadcast::channel(1);

        let b = net
            .spawn(cfg, id("0b"), "b", clock, vec!["a".to_owned()], shutdown)
            .await
            .unwrap();

        assert!(a.tree.lock().unwrap().has(&b.id()));
        assert!(b.tree.lock().unwrap().has(&a.id()));

        killswitch.send(()).ok();
    }
}
