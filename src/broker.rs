//! The broker shell: construction, the single-threaded event loop, and
//! lifecycle handling for nodes and sessions.
//!
//! Exactly one command handler runs at a time — the loop consumes bus
//! events, worker events and the heartbeat sweep strictly in turn, so the
//! model needs no locking. Worker tasks (TCP probes, DNS lookups, tunnel
//! sockets) communicate back either through the loop's event channel or by
//! enqueuing outbound bus traffic.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::{mpsc, oneshot};

use crate::bus::{BusEvent, BusSender, Rid};
use crate::config::Config;
use crate::constants::{HEARTBEAT_SWEEP_SECS, HEARTBEAT_TIMEOUT_SECS, SECRET_KEY_FILE};
use crate::controller::dns::TokenLookup;
use crate::controller::haproxy::ProxyConfig;
use crate::controller::images::ImageCache;
use crate::controller::network::{self, TopologyDriver};
use crate::controller::volumes;
use crate::model::node::Node;
use crate::model::session::Session;
use crate::model::tagged::Tagged;
use crate::model::{persist_session, Model};
use crate::store::Store;
use crate::wire::WireValue;
use crate::wire_map;

/// Events consumed by the broker loop besides bus traffic: results from
/// worker tasks and snapshot requests from the inspection endpoint.
#[derive(Debug)]
pub enum LoopEvent {
    /// A tunnel connect worker got its socket up.
    ProxyUp {
        rid: Rid,
        tunnel: Vec<u8>,
        proxy: i64,
        stream: tokio::net::TcpStream,
    },
    /// A tunnel connect worker gave up (tunnel timeout).
    ProxyDead { rid: Rid, tunnel: Vec<u8>, proxy: i64 },
    /// A connected proxy's socket hit EOF or an error.
    ProxyEof { rid: Rid, tunnel: Vec<u8>, proxy: i64 },
    /// A TXT lookup worker finished for `claim_domain`.
    DomainVerdict {
        rid: Rid,
        uuid: Vec<u8>,
        user: Vec<u8>,
        domain: String,
        records: Result<Vec<Vec<String>>, String>,
    },
    /// The inspection endpoint wants a state snapshot.
    Snapshot(oneshot::Sender<serde_json::Value>),
}

/// The broker: owns the model and every loop-resident subsystem.
pub struct Broker {
    pub cfg: Config,
    pub model: Model,
    pub images: ImageCache,
    pub topology: TopologyDriver,
    pub proxy: ProxyConfig,
    pub bus: BusSender,
    pub events: mpsc::UnboundedSender<LoopEvent>,
    pub resolver: Arc<dyn TokenLookup>,
    pub local_ip: String,
}

impl Broker {
    /// Construct the broker: state directory, durable store, model
    /// recovery, layer cache reclamation, baseline firewall and an initial
    /// front-end rebuild. Fails (and the process exits) when the secret
    /// key is missing or the store cannot be opened.
    pub fn new(
        cfg: Config,
        bus: BusSender,
        events: mpsc::UnboundedSender<LoopEvent>,
        resolver: Arc<dyn TokenLookup>,
    ) -> Result<Broker> {
        std::fs::create_dir_all(&cfg.state_dir)
            .with_context(|| format!("creating state dir: {}", cfg.state_dir.display()))?;

        let key_path = cfg.state_dir.join(SECRET_KEY_FILE);
        if !key_path.is_file() {
            bail!(
                "secret key not found at {} — remove any stale published public key \
                 and restart to mint a fresh pair",
                key_path.display()
            );
        }

        let store = Store::open(&cfg.state_dir)?;
        let model = Model::load(store, volumes::enumerate())?;
        let images = ImageCache::open(&cfg.state_dir)?;
        let proxy = ProxyConfig::new(cfg.haproxy_path.clone(), cfg.state_dir.clone());
        let local_ip = network::local_external_ip();

        let broker = Broker {
            cfg,
            model,
            images,
            topology: TopologyDriver::new(),
            proxy,
            bus,
            events,
            resolver,
            local_ip,
        };

        // recovered clusters need their certificate bundles back on disk
        for sess in broker.model.sessions.values() {
            for cluster in sess.clusters.values() {
                if let Err(e) = cluster.write_cert(broker.proxy.cert_dir()) {
                    log::error!("could not restore certificate bundle for {}: {e}", cluster.fqdn());
                }
            }
        }

        network::drop_incoming_from_underlay(false);
        broker.rebuild_proxy();
        Ok(broker)
    }

    /// Run until the bus closes. Consumes bus events, worker events and the
    /// heartbeat sweep, one at a time.
    pub async fn run(
        mut self,
        mut bus_rx: mpsc::UnboundedReceiver<BusEvent>,
        mut events_rx: mpsc::UnboundedReceiver<LoopEvent>,
    ) -> Result<()> {
        let mut sweep = tokio::time::interval(Duration::from_secs(HEARTBEAT_SWEEP_SECS));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            tokio::select! {
                event = bus_rx.recv() => match event {
                    Some(event) => self.handle_bus_event(event),
                    None => {
                        log::info!("bus closed, shutting down");
                        break;
                    }
                },
                event = events_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_loop_event(event);
                    }
                },
                _ = sweep.tick() => self.check_heartbeats(),
                _ = &mut ctrl_c => {
                    log::info!("interrupted, shutting down");
                    break;
                }
            }
        }

        self.shutdown();
        Ok(())
    }

    pub fn handle_bus_event(&mut self, event: BusEvent) {
        match event {
            BusEvent::Message(msg) => self.dispatch(msg),
            BusEvent::NodeConnected { pk, rid, config } => self.node_connected(pk, rid, &config),
            BusEvent::NodeDisconnected { pk } => self.node_disconnected(&pk),
            BusEvent::SessionOpened { rid, user } => self.session_opened(rid, user),
            BusEvent::SessionRecovered { old_rid, new_rid } => {
                self.session_recovered(&old_rid, new_rid);
            }
            BusEvent::SessionClosed { rid } => self.session_destroyed(&rid),
            BusEvent::ForwardingLearned { key, value } => {
                if let Err(e) = self.model.store.put_forwarding(&key, &value) {
                    log::error!("could not persist forwarding record: {e}");
                }
                self.model.forwards.insert(key, value);
            }
            BusEvent::ForwardingForgotten { key } => {
                if let Err(e) = self.model.store.delete_forwarding(&key) {
                    log::error!("could not delete forwarding record: {e}");
                }
                self.model.forwards.remove(&key);
            }
        }
    }

    pub fn handle_loop_event(&mut self, event: LoopEvent) {
        match event {
            LoopEvent::ProxyUp { rid, tunnel, proxy, stream } => {
                let bus = self.bus.clone();
                let events = self.events.clone();
                let Some(tun) = self
                    .model
                    .sessions
                    .get_mut(&rid)
                    .and_then(|sess| sess.tunnels.get_mut(&tunnel))
                else {
                    return; // closed while connecting; the socket drops here
                };
                tun.proxy_up(proxy, stream, &rid, &bus, &events);
            }
            LoopEvent::ProxyDead { rid, tunnel, proxy } => {
                let bus = self.bus.clone();
                if let Some(tun) = self
                    .model
                    .sessions
                    .get_mut(&rid)
                    .and_then(|sess| sess.tunnels.get_mut(&tunnel))
                {
                    tun.connect_failed(proxy, &bus);
                }
            }
            LoopEvent::ProxyEof { rid, tunnel, proxy } => {
                let bus = self.bus.clone();
                if let Some(tun) = self
                    .model
                    .sessions
                    .get_mut(&rid)
                    .and_then(|sess| sess.tunnels.get_mut(&tunnel))
                {
                    tun.proxy_eof(proxy, &rid, &bus);
                }
            }
            LoopEvent::DomainVerdict { rid, uuid, user, domain, records } => {
                self.finish_claim_domain(rid, uuid, user, domain, records);
            }
            LoopEvent::Snapshot(tx) => {
                let _ = tx.send(self.state_snapshot());
            }
        }
    }

    // ─── node lifecycle ────────────────────────────────────────────────

    fn node_connected(&mut self, pk: Vec<u8>, rid: Rid, config: &str) {
        let node = match Node::from_config(pk.clone(), rid.clone(), config) {
            Ok(node) => node,
            Err(e) => {
                log::error!("rejecting node with a broken registration record: {e:#}");
                self.bus.disconnect(&rid);
                return;
            }
        };
        log::info!("node connected, subnet {}", node.subnet_id);
        self.model.node_rids.insert(rid, pk.clone());
        self.model.nodes.insert(pk.clone(), node);

        let rids: Vec<Rid> = self.model.sessions.keys().cloned().collect();
        for session_rid in rids {
            self.bus
                .send_cmd(&session_rid, "node_created", wire_map! { "node" => pk.clone() });
        }
        // topology is recreated when the node sends its external IP
    }

    fn node_disconnected(&mut self, pk: &[u8]) {
        let Some(node) = self.model.nodes.remove(pk) else {
            log::warn!("disconnect for an unknown node");
            return;
        };
        self.model.node_rids.remove(&node.rid);
        log::info!("node disconnected, subnet {}", node.subnet_id);

        let rids: Vec<Rid> = self.model.sessions.keys().cloned().collect();
        for session_rid in rids {
            self.bus
                .send_cmd(&session_rid, "node_destroyed", wire_map! { "node" => pk.to_vec() });
        }

        // walk every container shadow through the destroyed path — not just
        // this node's; over-broad but long-standing behaviour
        let shadows: Vec<(Vec<u8>, Option<String>)> = self
            .model
            .containers
            .values()
            .map(|entry| {
                let ip = self.model.container(&entry.uuid).map(|c| c.ip.clone());
                (entry.uuid.clone(), ip)
            })
            .collect();
        for (uuid, ip) in shadows {
            self.drop_container_shadow(&uuid, ip.as_deref());
        }

        self.broadcast_topology();
    }

    /// Recompute the topology, program the firewall delta and push the new
    /// layout to every node.
    pub(crate) fn broadcast_topology(&mut self) {
        let topo = self.model.network_topology(&self.local_ip);
        let (added, removed) = self.topology.delta(&topo);
        for (subnet, _) in &added {
            network::allow_incoming_from_subnet(subnet, false);
        }
        for (subnet, _) in &removed {
            network::allow_incoming_from_subnet(subnet, true);
        }

        let wire_topo: Vec<WireValue> = topo
            .iter()
            .map(|(subnet, ip)| {
                WireValue::List(vec![
                    WireValue::Str(subnet.clone()),
                    WireValue::Str(ip.clone()),
                ])
            })
            .collect();
        let rids: Vec<Rid> = self.model.node_rids.keys().cloned().collect();
        for rid in rids {
            self.bus.send_cmd(
                &rid,
                "network_topology",
                wire_map! { "topology" => WireValue::List(wire_topo.clone()) },
            );
        }
    }

    // ─── session lifecycle ─────────────────────────────────────────────

    fn session_opened(&mut self, rid: Rid, user: Vec<u8>) {
        let sess = Session::new(rid.clone(), user.clone());
        persist_session(&self.model.store, &sess);
        self.model.sessions.insert(rid.clone(), sess);
        let offer = self.model.resources(&user);
        self.bus.send_cmd(&rid, "resource_offer", offer);
    }

    fn session_recovered(&mut self, old_rid: &[u8], new_rid: Rid) {
        let Some(mut sess) = self.model.sessions.remove(old_rid) else {
            log::warn!("client tried to resume an unknown session: {}", hex::encode(old_rid));
            self.bus.disconnect(&new_rid);
            return;
        };
        log::info!("session recovered {} -> {}", hex::encode(old_rid), hex::encode(&new_rid));

        // the backlink from containers must point at the new rid
        sess.rid = new_rid.clone();
        for container in sess.containers.values_mut() {
            container.session_rid = new_rid.clone();
        }
        for uuid in sess.containers.keys() {
            if let Some(entry) = self.model.containers.get_mut(uuid) {
                entry.session_rid = new_rid.clone();
            }
        }

        // fix up the forwarding table
        let stale: Vec<Vec<u8>> = self
            .model
            .forwards
            .iter()
            .filter(|(_, value)| value.as_slice() == old_rid)
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            self.model.forwards.insert(key.clone(), new_rid.clone());
            if let Err(e) = self.model.store.put_forwarding(&key, &new_rid) {
                log::error!("could not rewrite forwarding record: {e}");
            }
        }

        if let Err(e) = self.model.store.delete_session(old_rid) {
            log::error!("could not drop old session row: {e}");
        }
        persist_session(&self.model.store, &sess);
        let user = sess.user.clone();
        self.model.sessions.insert(new_rid.clone(), sess);

        let offer = self.model.resources(&user);
        self.bus.send_cmd(&new_rid, "resource_offer", offer);
    }

    fn session_destroyed(&mut self, rid: &[u8]) {
        self.close_session(rid);
        if let Err(e) = self.model.store.delete_session(rid) {
            log::error!("could not delete session record: {e}");
        }
    }

    /// Release everything a session owns: clusters come off the front end,
    /// tunnels drop their proxies, and each live host node is told to
    /// destroy the session's containers. An offline node's containers are
    /// considered gone.
    fn close_session(&mut self, rid: &[u8]) {
        let Some(mut sess) = self.model.sessions.remove(rid) else { return };
        log::debug!("closing session rid {}", hex::encode(rid));

        let had_clusters = !sess.clusters.is_empty();
        for cluster in sess.clusters.values() {
            log::info!("...garbage collecting cluster: {}", String::from_utf8_lossy(&cluster.uuid));
            cluster.remove_cert(self.proxy.cert_dir());
        }
        sess.clusters.clear();

        for tunnel in sess.tunnels.values_mut() {
            log::info!(
                "...garbage collecting tunnel: {}",
                String::from_utf8_lossy(&tunnel.spec.uuid)
            );
            tunnel.disconnect();
        }
        sess.tunnels.clear();

        for (uuid, container) in &sess.containers {
            log::info!("...garbage collecting container: {}", String::from_utf8_lossy(uuid));
            self.model.containers.remove(uuid);
            match self.model.nodes.get(&container.node_pk) {
                Some(node) => self.bus.send_cmd(
                    &node.rid,
                    "destroy_container",
                    wire_map! {
                        "container" => uuid.clone(),
                        "session" => rid.to_vec(),
                        "inform" => false,
                    },
                ),
                // the node has not reappeared, assume the container went with it
                None => {}
            }
        }

        if had_clusters {
            self.rebuild_proxy();
        }
    }

    /// Sweep sessions whose heartbeat went quiet.
    pub fn check_heartbeats(&mut self) {
        let timeout = Duration::from_secs(HEARTBEAT_TIMEOUT_SECS);
        let dead: Vec<Rid> = self
            .model
            .sessions
            .iter()
            .filter(|(_, sess)| sess.last_heartbeat.elapsed() >= timeout)
            .map(|(rid, _)| rid.clone())
            .collect();
        for rid in dead {
            log::info!("session timed out: {}", hex::encode(&rid));
            self.session_destroyed(&rid);
            self.bus.disconnect(&rid);
        }
    }

    // ─── support ───────────────────────────────────────────────────────

    pub(crate) fn rebuild_proxy(&self) {
        if let Err(e) = self.proxy.rebuild(&self.model) {
            log::error!("front-end rebuild failed: {e:#}");
        }
    }

    /// Unified state document for the inspection endpoint.
    pub fn state_snapshot(&self) -> serde_json::Value {
        let rid_to_session: serde_json::Map<String, serde_json::Value> = self
            .model
            .sessions
            .iter()
            .map(|(rid, sess)| (hex::encode(rid), sess.state()))
            .collect();

        let rid_to_node: serde_json::Map<String, serde_json::Value> = self
            .model
            .node_rids
            .iter()
            .filter_map(|(rid, pk)| {
                self.model.nodes.get(pk).map(|node| (hex::encode(rid), node.state()))
            })
            .collect();

        let volumes: Vec<String> =
            self.model.volumes.values().map(Tagged::display_name).collect();

        let tagged_containers: Vec<String> = self
            .model
            .containers
            .values()
            .filter(|entry| entry.tag.is_some())
            .map(Tagged::display_name)
            .collect();

        let domains: serde_json::Map<String, serde_json::Value> = self
            .model
            .domains
            .values()
            .flat_map(|user_domains| user_domains.values())
            .filter(|dom| dom.is_valid())
            .map(|dom| (dom.domain.clone(), dom.state()))
            .collect();

        serde_json::json!({
            "rid_to_session": rid_to_session,
            "rid_to_node": rid_to_node,
            "volumes": volumes,
            "tagged_containers": tagged_containers,
            "domains": domains,
            "allocations": self.model.allocations.iter().collect::<Vec<_>>(),
        })
    }

    /// Retract firewall state and flush the store.
    pub fn shutdown(&mut self) {
        for node in self.model.nodes.values() {
            network::allow_incoming_from_subnet(&node.subnet_id.to_string(), true);
        }
        network::drop_incoming_from_underlay(true);
        if let Err(e) = self.model.store.flush() {
            log::error!("could not flush the store on shutdown: {e}");
        }
    }
}
