//! The authoritative in-memory view of cluster state.
//!
//! The broker thinks in terms of sessions, not users; user public keys are
//! an authentication and filtering parameter. Everything here is owned by
//! the broker loop — no locks, one writer.

pub mod cluster;
pub mod container;
pub mod domain;
pub mod node;
pub mod session;
pub mod tagged;
pub mod volume;

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use rand::Rng as _;

use crate::bus::Rid;
use crate::constants::{SUBNET_RESERVED_LOW, SUBNET_SPAN};
use crate::controller::CommandError;
use crate::model::cluster::Cluster;
use crate::model::container::{Container, ContainerRef};
use crate::model::domain::Domain;
use crate::model::node::Node;
use crate::model::session::Session;
use crate::model::tagged::TaggedStore;
use crate::model::volume::Volume;
use crate::store::Store;
use crate::wire::{WireMap, WireValue};
use crate::wire_map;

/// In-memory authoritative state plus the durable store it projects into.
pub struct Model {
    pub store: Store,
    /// Live and recoverable sessions, keyed by route id.
    pub sessions: HashMap<Rid, Session>,
    /// Connected nodes keyed by public key.
    pub nodes: HashMap<Vec<u8>, Node>,
    /// Route id → node public key.
    pub node_rids: HashMap<Rid, Vec<u8>>,
    /// Broker-wide tag index over all sessions' containers.
    pub containers: TaggedStore<ContainerRef>,
    /// Tagged mirror of host volumes.
    pub volumes: TaggedStore<Volume>,
    /// Every currently assigned container IP.
    pub allocations: HashSet<String>,
    /// Domain claims: user pk → domain name → record.
    pub domains: HashMap<Vec<u8>, HashMap<String, Domain>>,
    /// Domains advertised to everyone.
    pub global_domains: HashMap<String, Domain>,
    /// Long-term forwarding routes (key → rid).
    pub forwards: HashMap<Vec<u8>, Vec<u8>>,
    /// Per-(user, image) opaque description cache.
    pub descriptions: HashMap<String, WireValue>,
}

impl Model {
    /// Load persisted state: sessions (rebuilding the container index and
    /// the IP allocation set), forwarding routes, domains, descriptions.
    /// The volume mirror is enumerated from the host by the caller.
    pub fn load(store: Store, volumes: TaggedStore<Volume>) -> Result<Model> {
        let mut model = Model {
            store,
            sessions: HashMap::new(),
            nodes: HashMap::new(),
            node_rids: HashMap::new(),
            containers: TaggedStore::new(),
            volumes,
            allocations: HashSet::new(),
            domains: HashMap::new(),
            global_domains: HashMap::new(),
            forwards: HashMap::new(),
            descriptions: HashMap::new(),
        };

        for (rid, blob) in model.store.sessions()? {
            let sess = match Session::from_blob(rid.clone(), &blob) {
                Ok(sess) => sess,
                Err(e) => {
                    log::error!("dropping undecodable session {}: {e}", hex::encode(&rid));
                    continue;
                }
            };
            for container in sess.containers.values() {
                model.containers.insert(ContainerRef::of(container));
                model.allocations.insert(container.ip.clone());
            }
            model.sessions.insert(rid, sess);
        }

        for (key, value) in model.store.forwarding()? {
            model.forwards.insert(key, value);
        }

        for row in model.store.domains()? {
            let dom = Domain::from_row(&row)?;
            if dom.global {
                model.global_domains.insert(dom.domain.clone(), dom.clone());
            }
            model
                .domains
                .entry(dom.user.clone())
                .or_default()
                .insert(dom.domain.clone(), dom);
        }

        for (full_id, blob) in model.store.descriptions()? {
            model.descriptions.insert(full_id, WireValue::from_bytes(&blob)?);
        }

        Ok(model)
    }

    // ─── sessions ──────────────────────────────────────────────────────

    pub fn valid_session(&self, rid: &[u8]) -> Result<&Session, CommandError> {
        self.sessions
            .get(rid)
            .ok_or_else(|| CommandError::invalid("Command does not appear to have come from a valid session"))
    }

    /// A container owned by the calling session.
    pub fn valid_container(&self, rid: &[u8], uuid: &[u8]) -> Result<&Container, CommandError> {
        self.valid_session(rid)?
            .containers
            .get(uuid)
            .ok_or_else(|| CommandError::invalid("Command does not appear to be addressed to a valid container"))
    }

    /// A volume owned by `user`. Ownership mismatch reports the same text
    /// as non-existence so callers learn nothing about other users' volumes.
    pub fn valid_volume(&self, user: &[u8], uuid: &[u8]) -> Result<&Volume, CommandError> {
        let text = format!("Referenced a non-existent volume: {}", String::from_utf8_lossy(uuid));
        let Some(vol) = self.volumes.get(uuid) else {
            log::info!("attempt to access a non-existent volume: {}", String::from_utf8_lossy(uuid));
            return Err(CommandError::invalid(text));
        };
        if vol.user != user {
            log::warn!(
                "user attempted to access a volume owned by someone else: {}",
                String::from_utf8_lossy(uuid)
            );
            return Err(CommandError::invalid(text));
        }
        Ok(vol)
    }

    /// A container shadow looked up broker-wide (node commands, publish).
    pub fn container(&self, uuid: &[u8]) -> Option<&Container> {
        let entry = self.containers.get(uuid)?;
        self.sessions.get(&entry.session_rid)?.containers.get(uuid)
    }

    // ─── clusters ──────────────────────────────────────────────────────

    /// All live clusters. Duplicate FQDNs (a publish swapping over) yield
    /// only the first record.
    pub fn all_clusters(&self) -> Vec<&Cluster> {
        let mut seen = HashSet::new();
        let mut clusters = Vec::new();
        for sess in self.sessions.values() {
            for cluster in sess.clusters.values() {
                if seen.insert(cluster.fqdn()) {
                    clusters.push(cluster);
                } else {
                    log::debug!("skipping duplicate cluster record for {}", cluster.fqdn());
                }
            }
        }
        clusters
    }

    // ─── IP allocation ─────────────────────────────────────────────────

    /// Allocate a random free IP inside a node's /16. The bottom 256
    /// addresses are reserved for tunnel endpoints, the top few skipped.
    pub fn next_ip(&mut self, subnet_id: u32) -> String {
        let smallest = subnet_id * 65536 + SUBNET_RESERVED_LOW;
        let biggest = smallest + SUBNET_SPAN;
        loop {
            let ip = Model::ip_from_int(rand::rng().random_range(smallest..biggest));
            if self.allocations.insert(ip.clone()) {
                log::info!("allocated ip: {ip}");
                return ip;
            }
        }
    }

    /// Release an allocation; double-release is a no-op.
    pub fn release_ip(&mut self, ip: &str) {
        if self.allocations.remove(ip) {
            log::info!("released ip: {ip}");
        } else {
            log::debug!("tried to release an ip not in the table: {ip}");
        }
    }

    pub fn ip_from_int(n: u32) -> String {
        format!("10.{}.{}.{}", n / 65536, (n / 256) % 256, n % 256)
    }

    // ─── topology ──────────────────────────────────────────────────────

    /// `(subnet_id, external_ip)` pairs for every node that has reported
    /// its external IP, plus the broker's own underlay pair.
    pub fn network_topology(&self, local_ip: &str) -> Vec<(String, String)> {
        let mut topo: Vec<(String, String)> = self
            .nodes
            .values()
            .filter_map(|node| {
                node.external_ip
                    .as_ref()
                    .map(|ip| (node.subnet_id.to_string(), ip.clone()))
            })
            .collect();
        topo.push(("1".to_string(), local_ip.to_string()));
        topo
    }

    // ─── domains ───────────────────────────────────────────────────────

    pub fn user_domain(&self, user: &[u8], domain: &str) -> Option<&Domain> {
        self.domains.get(user)?.get(domain)
    }

    pub fn user_domain_mut(&mut self, user: &[u8], domain: &str) -> Option<&mut Domain> {
        self.domains.get_mut(user)?.get_mut(domain)
    }

    pub fn valid_domain_mut(&mut self, user: &[u8], domain: &str) -> Result<&mut Domain, CommandError> {
        self.domains
            .get_mut(user)
            .and_then(|doms| doms.get_mut(domain))
            .ok_or_else(|| CommandError::invalid("Not apparently one of your domains"))
    }

    pub fn add_global_domain(&mut self, dom: Domain) {
        if self.global_domains.contains_key(&dom.domain) {
            log::warn!("tried to add a global domain that was already added");
            return;
        }
        self.global_domains.insert(dom.domain.clone(), dom);
    }

    pub fn remove_global_domain(&mut self, domain: &str) {
        if self.global_domains.remove(domain).is_none() {
            log::warn!("tried to remove a global domain that was not there");
        }
    }

    /// Shed pending domains older than the timeout window, for all users.
    pub fn shed_aged_domains(&mut self) {
        let users: Vec<Vec<u8>> = self.domains.keys().cloned().collect();
        for user in users {
            self.shed_aged_domains_for(&user);
        }
    }

    /// Shed one user's timed-out pending domains, removing their rows.
    pub fn shed_aged_domains_for(&mut self, user: &[u8]) {
        let now = chrono::Utc::now().timestamp();
        let Some(user_domains) = self.domains.get_mut(user) else { return };
        let aged: Vec<String> = user_domains
            .values()
            .filter(|d| d.timed_out(now))
            .map(|d| d.domain.clone())
            .collect();
        for name in aged {
            log::info!("domain removed due to timeout: {name}");
            user_domains.remove(&name);
            if let Err(e) = self.store.delete_domain(&name) {
                log::error!("could not delete aged domain row {name}: {e}");
            }
        }
    }

    // ─── descriptions ──────────────────────────────────────────────────

    pub fn description_id(user: &[u8], image_id: &str) -> String {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine as _;
        format!("{}{}", STANDARD.encode(user), image_id)
    }

    /// Cache an opaque description blob; unchanged writes are skipped.
    pub fn create_update_description(
        &mut self,
        user: &[u8],
        image_id: &str,
        desc: WireValue,
    ) -> Result<()> {
        let full_id = Model::description_id(user, image_id);
        if self.descriptions.get(&full_id) == Some(&desc) {
            return Ok(());
        }
        self.store.put_description(&full_id, &desc.to_bytes()?)?;
        self.descriptions.insert(full_id, desc);
        Ok(())
    }

    // ─── resource offers ───────────────────────────────────────────────

    /// Build the resource offer sent to a client when its session opens.
    pub fn resources(&mut self, user: &[u8]) -> WireMap {
        self.shed_aged_domains_for(user);

        let nodes: Vec<WireValue> = self
            .nodes
            .values()
            .map(|node| WireValue::List(vec![WireValue::Bytes(node.pk.clone()), node.perf_wire()]))
            .collect();

        let volumes: Vec<WireValue> = self
            .volumes
            .values()
            .filter(|vol| vol.user == user)
            .map(|vol| {
                WireValue::Map(wire_map! {
                    "uuid" => vol.uuid.clone(),
                    "tag" => vol.tag.clone(),
                })
            })
            .collect();

        let externals: Vec<WireValue> = self
            .containers
            .values()
            .filter(|entry| entry.tag.is_some() && entry.user == user)
            .filter_map(|entry| self.container(&entry.uuid))
            .map(|ctr| {
                WireValue::Map(wire_map! {
                    "tag" => ctr.tag.clone(),
                    "uuid" => ctr.uuid.clone(),
                    "ip" => ctr.ip.clone(),
                    "node" => ctr.node_pk.clone(),
                })
            })
            .collect();

        let mut domains: Vec<WireValue> = Vec::new();
        if let Some(user_domains) = self.domains.get(user) {
            domains.extend(user_domains.values().filter(|d| d.is_valid()).map(|d| {
                WireValue::Map(wire_map! { "domain" => d.domain.clone(), "global" => d.global })
            }));
        }
        domains.extend(
            self.global_domains
                .values()
                .filter(|d| d.is_valid() && d.user != user)
                .map(|d| {
                    WireValue::Map(wire_map! { "domain" => d.domain.clone(), "global" => d.global })
                }),
        );

        wire_map! {
            "nodes" => WireValue::List(nodes),
            "volumes" => WireValue::List(volumes),
            "externals" => WireValue::List(externals),
            "domains" => WireValue::List(domains),
        }
    }
}

/// Mutable session lookup as a free function so the borrow stays on the
/// sessions map and write-through to the store can happen alongside it.
pub fn session_mut<'a>(
    sessions: &'a mut HashMap<Rid, Session>,
    rid: &[u8],
) -> Result<&'a mut Session, CommandError> {
    sessions
        .get_mut(rid)
        .ok_or_else(|| CommandError::invalid("Command does not appear to have come from a valid session"))
}

/// Write-through of a session's serialized form; storage failures are
/// logged, never propagated into command handling.
pub fn persist_session(store: &Store, sess: &Session) {
    match sess.blob() {
        Ok(blob) => {
            if let Err(e) = store.put_session(&sess.rid, &blob) {
                log::error!("could not persist session {}: {e}", hex::encode(&sess.rid));
            }
        }
        Err(e) => log::error!("could not serialize session {}: {e}", hex::encode(&sess.rid)),
    }
}

/// Persist a domain record in place.
pub fn persist_domain(store: &Store, dom: &Domain) {
    match dom.to_row() {
        Ok(row) => {
            if let Err(e) = store.put_domain(&dom.domain, &row) {
                log::error!("could not persist domain {}: {e}", dom.domain);
            }
        }
        Err(e) => log::error!("could not serialize domain {}: {e}", dom.domain),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_model() -> (tempfile::TempDir, Model) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let model = Model::load(store, TaggedStore::new()).unwrap();
        (dir, model)
    }

    #[test]
    fn test_ip_formatting() {
        assert_eq!(Model::ip_from_int(2 * 65536 + 256), "10.2.1.0");
        assert_eq!(Model::ip_from_int(3 * 65536 + 65532), "10.3.255.252");
    }

    #[test]
    fn test_allocation_bounds_and_uniqueness() {
        let (_dir, mut model) = empty_model();
        let mut seen = HashSet::new();
        for _ in 0..64 {
            let ip = model.next_ip(2);
            assert!(seen.insert(ip.clone()), "duplicate allocation {ip}");
            let octets: Vec<u32> = ip.split('.').map(|o| o.parse().unwrap()).collect();
            assert_eq!(octets[0], 10);
            assert_eq!(octets[1], 2);
            let host = octets[1] * 65536 + octets[2] * 256 + octets[3];
            assert!(host >= 2 * 65536 + SUBNET_RESERVED_LOW);
            assert!(host < 2 * 65536 + SUBNET_RESERVED_LOW + SUBNET_SPAN);
        }
        assert_eq!(model.allocations.len(), 64);
    }

    #[test]
    fn test_release_restores_pool() {
        let (_dir, mut model) = empty_model();
        let ip = model.next_ip(2);
        assert!(model.allocations.contains(&ip));
        model.release_ip(&ip);
        assert!(model.allocations.is_empty());
        // double release is a no-op
        model.release_ip(&ip);
        assert!(model.allocations.is_empty());
    }

    #[test]
    fn test_topology_includes_underlay() {
        let (_dir, mut model) = empty_model();
        let mut node = Node::from_config(b"n1".to_vec(), b"r1".to_vec(), r#"{"subnet_id": 2}"#).unwrap();
        node.external_ip = Some("203.0.113.5".into());
        model.nodes.insert(b"n1".to_vec(), node);
        // a node that has not reported its IP is not part of the topology
        let silent = Node::from_config(b"n2".to_vec(), b"r2".to_vec(), r#"{"subnet_id": 3}"#).unwrap();
        model.nodes.insert(b"n2".to_vec(), silent);

        let mut topo = model.network_topology("198.51.100.1");
        topo.sort();
        assert_eq!(
            topo,
            vec![
                ("1".to_string(), "198.51.100.1".to_string()),
                ("2".to_string(), "203.0.113.5".to_string()),
            ]
        );
    }

    #[test]
    fn test_description_cache_skips_unchanged() {
        let (_dir, mut model) = empty_model();
        let desc = WireValue::Str("layers and config".into());
        model.create_update_description(b"alice", "img-1", desc.clone()).unwrap();
        model.create_update_description(b"alice", "img-1", desc.clone()).unwrap();
        let full_id = Model::description_id(b"alice", "img-1");
        assert_eq!(model.descriptions.get(&full_id), Some(&desc));
    }

    #[test]
    fn test_volume_ownership_hidden() {
        let (_dir, mut model) = empty_model();
        model.volumes.insert(Volume {
            user: b"alice".to_vec(),
            uuid: b"vol-1".to_vec(),
            tag: None,
        });
        let missing = model.valid_volume(b"bob", b"vol-9").unwrap_err();
        let not_ours = model.valid_volume(b"bob", b"vol-1").unwrap_err();
        // same message, nothing disclosed
        assert_eq!(
            missing.to_string().replace("vol-9", "X"),
            not_ours.to_string().replace("vol-1", "X")
        );
        assert!(model.valid_volume(b"alice", b"vol-1").is_ok());
    }
}
