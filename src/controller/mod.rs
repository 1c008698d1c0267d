//! Command dispatch and handlers.
//!
//! One handler runs at a time on the broker loop, so everything here
//! mutates the model without locks. Handlers must not block: TCP probes,
//! DNS lookups and tunnel connects are pushed onto worker tasks that report
//! back through the loop's event channel or reply straight through the bus.
//!
//! Validation failures become failure replies carrying a readable message;
//! anything else is logged and the message dropped — the broker stays live.

pub mod commands;
pub mod dns;
pub mod haproxy;
pub mod images;
pub mod inspect;
pub mod network;
pub mod tunnel;
pub mod volumes;

use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::net::TcpStream;

use crate::broker::{Broker, LoopEvent};
use crate::bus::Message;
use crate::constants::{WAIT_TCP_ATTEMPTS, WAIT_TCP_INTERVAL_MS};
use crate::model::cluster::Cluster;
use crate::model::container::{Container, ContainerRef};
use crate::model::domain::Domain;
use crate::model::{persist_domain, persist_session, session_mut};
use crate::wire::{WireMap, WireValue};
use crate::wire_map;

use self::tunnel::{Tunnel, TunnelSpec};

/// Errors crossing the dispatch boundary.
#[derive(Debug, Error)]
pub enum CommandError {
    /// Caller error — surfaced to the sender as a failure reply.
    #[error("{0}")]
    Invalid(String),
    /// Broker-side error — logged, message dropped.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CommandError {
    pub fn invalid(text: impl Into<String>) -> CommandError {
        CommandError::Invalid(text.into())
    }
}

/// Required param present but of the wrong shape.
fn bad_param(key: &str) -> CommandError {
    CommandError::invalid(format!("Parameter '{key}' is malformed"))
}

fn bytes_arg(msg: &Message, key: &str) -> Result<Vec<u8>, CommandError> {
    msg.bytes_param(key).ok_or_else(|| bad_param(key))
}

fn str_arg(msg: &Message, key: &str) -> Result<String, CommandError> {
    msg.str_param(key).ok_or_else(|| bad_param(key))
}

fn int_arg(msg: &Message, key: &str) -> Result<i64, CommandError> {
    msg.int_param(key).ok_or_else(|| bad_param(key))
}

/// Optional byte string: absent or null both read as `None`.
fn opt_bytes_arg(msg: &Message, key: &str) -> Option<Vec<u8>> {
    msg.bytes_param(key)
}

fn opt_str_arg(msg: &Message, key: &str) -> Option<String> {
    msg.str_param(key)
}

impl Broker {
    /// Validate an inbound message against the command table and run its
    /// handler.
    pub(crate) fn dispatch(&mut self, msg: Message) {
        let Some(spec) = commands::lookup(&msg.command) else {
            log::warn!("unknown command: {}", msg.command_name());
            self.bus.reply_exception(&msg, "Unknown command");
            return;
        };
        for key in spec.required {
            if !msg.params.contains_key(*key) {
                self.bus.reply_exception(&msg, &format!("Missing parameter: {key}"));
                return;
            }
        }
        if spec.node_only && !self.model.node_rids.contains_key(&msg.rid) {
            self.bus
                .reply_exception(&msg, &format!("Command is node-only: {}", spec.name));
            return;
        }

        let (rid, uuid) = (msg.rid.clone(), msg.uuid.clone());
        match self.invoke(spec.name, msg) {
            Ok(()) => {}
            Err(CommandError::Invalid(text)) => {
                log::info!("rejected {}: {text}", spec.name);
                self.bus.reply_exception_raw(&rid, &uuid, &text);
            }
            Err(CommandError::Internal(e)) => {
                log::error!("handler for {} failed: {e:#}", spec.name);
            }
        }
    }

    fn invoke(&mut self, name: &str, msg: Message) -> Result<(), CommandError> {
        match name {
            "inform_external_ip" => self.inform_external_ip(&msg),
            "update_stats" => self.update_stats(&msg),
            "wait_tcp" => self.wait_tcp(&msg),
            "create_tunnel" => self.create_tunnel(&msg),
            "destroy_tunnel" => self.destroy_tunnel(&msg),
            "to_proxy" => self.to_proxy(msg),
            "close_proxy" => self.close_proxy(&msg),
            "cache_description" => self.cache_description(&msg),
            "retrieve_description" => self.retrieve_description(&msg),
            "upload_requirements" => self.upload_requirements(&msg),
            "upload_slab" => self.upload_slab(&msg),
            "upload_complete" => self.upload_complete(&msg),
            "create_volume" => self.create_volume(&msg),
            "destroy_volume" => self.destroy_volume(&msg),
            "snapshot_volume" => self.snapshot_volume(&msg),
            "rollback_volume" => self.rollback_volume(&msg),
            "approve_tag" => self.approve_tag(&msg),
            "allocate_ip" => self.allocate_ip(&msg),
            "dependent_container" => self.dependent_container(&msg),
            "destroyed_container" => self.destroyed_container(&msg),
            "prepare_domain" => self.prepare_domain(&msg),
            "claim_domain" => self.claim_domain(&msg),
            "make_domain_global" => self.make_domain_global(&msg),
            "make_domain_private" => self.make_domain_private(&msg),
            "release_domain" => self.release_domain(&msg),
            "publish_web" => self.publish_web(&msg),
            "unpublish_web" => self.unpublish_web(&msg),
            "add_to_cluster" => self.add_to_cluster(&msg),
            "remove_from_cluster" => self.remove_from_cluster(&msg),
            "heartbeat" => self.heartbeat(&msg),
            "ping" => {
                self.bus.reply(&msg, WireMap::new());
                Ok(())
            }
            other => {
                log::error!("command {other} is in the table but has no handler");
                Ok(())
            }
        }
    }

    // ─── nodes ─────────────────────────────────────────────────────────

    /// A node reports its externally reachable IP (and, on cloud hosts,
    /// its instance id). Triggers a topology recomputation and broadcast.
    fn inform_external_ip(&mut self, msg: &Message) -> Result<(), CommandError> {
        let Some(pk) = self.model.node_rids.get(&msg.rid).cloned() else {
            log::warn!("inform_external_ip from an unknown node connection");
            return Ok(());
        };
        let ip = str_arg(msg, "ip")?;
        let instance_id = opt_str_arg(msg, "instance_id");
        if let Some(node) = self.model.nodes.get_mut(&pk) {
            node.external_ip = Some(ip);
            if instance_id.is_some() {
                node.instance_id = instance_id;
            }
        }
        self.broadcast_topology();
        Ok(())
    }

    /// Updated performance counters from a node. Fans the raw counters out
    /// to every session and rebuilds proxy weights, but only on change.
    fn update_stats(&mut self, msg: &Message) -> Result<(), CommandError> {
        let Some(pk) = self.model.node_rids.get(&msg.rid).cloned() else {
            log::warn!("update_stats from an unknown node connection: {}", hex::encode(&msg.rid));
            return Ok(());
        };
        let Some(node) = self.model.nodes.get_mut(&pk) else {
            log::warn!("could not relate public key to a node");
            return Ok(());
        };
        let Some(stats) = msg.param("stats").and_then(WireValue::as_map) else {
            return Err(bad_param("stats"));
        };

        let old = node.perf.clone();
        if let Err(e) = node.update_stats(stats) {
            log::warn!("node sent broken stats: {e}");
            return Ok(());
        }
        if node.perf == old {
            return Ok(());
        }

        self.rebuild_proxy();

        let raw = msg.param("stats").cloned().unwrap_or(WireValue::Null);
        let rids: Vec<Vec<u8>> = self.model.sessions.keys().cloned().collect();
        for rid in rids {
            self.bus.send_cmd(
                &rid,
                "update_stats",
                wire_map! { "node" => pk.clone(), "stats" => raw.clone() },
            );
        }
        Ok(())
    }

    /// Reply to a node asking for a fresh IP in its subnet.
    fn allocate_ip(&mut self, msg: &Message) -> Result<(), CommandError> {
        let pk = self
            .model
            .node_rids
            .get(&msg.rid)
            .cloned()
            .ok_or_else(|| CommandError::invalid("Unknown node connection"))?;
        let subnet_id = self
            .model
            .nodes
            .get(&pk)
            .map(|n| n.subnet_id)
            .ok_or_else(|| CommandError::invalid("Unknown node"))?;
        let container = bytes_arg(msg, "container")?;
        let ip = self.model.next_ip(subnet_id);
        self.bus.reply(msg, wire_map! { "ip" => ip, "container" => container });
        Ok(())
    }

    // ─── containers ────────────────────────────────────────────────────

    /// Probe a container port until it accepts TCP, off-loop.
    fn wait_tcp(&mut self, msg: &Message) -> Result<(), CommandError> {
        let container = bytes_arg(msg, "container")?;
        let port = int_arg(msg, "port")? as u16;
        let ip = self.model.valid_container(&msg.rid, &container)?.ip.clone();

        let bus = self.bus.clone();
        let (rid, uuid) = (msg.rid.clone(), msg.uuid.clone());
        tokio::spawn(async move {
            for _ in 0..WAIT_TCP_ATTEMPTS {
                tokio::time::sleep(Duration::from_millis(WAIT_TCP_INTERVAL_MS)).await;
                if TcpStream::connect((ip.as_str(), port)).await.is_ok() {
                    bus.reply_raw(&rid, &uuid, WireMap::new());
                    return;
                }
            }
            bus.reply_exception_raw(&rid, &uuid, "Could not connect");
        });
        Ok(())
    }

    /// Reserve a (user, tag) pair ahead of asynchronous container creation.
    fn approve_tag(&mut self, msg: &Message) -> Result<(), CommandError> {
        let user = bytes_arg(msg, "user")?;
        let tag = opt_bytes_arg(msg, "tag");
        if self.model.containers.will_clash(&user, &msg.uuid, tag.as_deref()) {
            return Err(CommandError::invalid("Tag is already being used"));
        }
        self.bus.reply(msg, WireMap::new());
        Ok(())
    }

    /// A node registers a container it just created against its session.
    /// A tag clash or a vanished session means the container must go.
    fn dependent_container(&mut self, msg: &Message) -> Result<(), CommandError> {
        let uuid = bytes_arg(msg, "container")?;
        let node_pk = bytes_arg(msg, "node_pk")?;
        let ip = str_arg(msg, "ip")?;
        let cookie = msg.param("cookie").and_then(WireValue::as_map).ok_or_else(|| bad_param("cookie"))?;
        let user = cookie.get("user").and_then(|v| v.as_bytes()).map(<[u8]>::to_vec).ok_or_else(|| bad_param("cookie"))?;
        let tag = cookie.get("tag").and_then(|v| v.as_bytes()).map(<[u8]>::to_vec);
        let session_rid = cookie.get("session").and_then(|v| v.as_bytes()).map(<[u8]>::to_vec).ok_or_else(|| bad_param("cookie"))?;
        let volumes: Vec<Vec<u8>> = msg
            .param("volumes")
            .and_then(WireValue::as_list)
            .map(|list| list.iter().filter_map(|v| v.as_bytes().map(<[u8]>::to_vec)).collect())
            .unwrap_or_default();

        if self.model.containers.will_clash(&user, &uuid, tag.as_deref()) {
            log::info!("dependent container would collide on its tag, destroying");
            self.bus.send_cmd(
                &msg.rid,
                "destroy_container",
                wire_map! { "container" => uuid, "inform" => false },
            );
            return Ok(());
        }

        let Some(sess) = self.model.sessions.get_mut(&session_rid) else {
            // don't tell the session, it is gone
            log::info!("dependent container's session has already gone, destroying");
            self.bus.send_cmd(
                &msg.rid,
                "destroy_container",
                wire_map! { "container" => uuid, "inform" => false },
            );
            return Ok(());
        };

        let container = Container {
            user,
            uuid: uuid.clone(),
            tag,
            session_rid: session_rid.clone(),
            node_pk,
            ip,
            volumes,
        };
        self.model.containers.insert(ContainerRef::of(&container));
        sess.containers.insert(uuid.clone(), container);
        persist_session(&self.model.store, sess);
        log::info!(
            "registered a dependency: {} -> {}",
            hex::encode(&session_rid),
            String::from_utf8_lossy(&uuid)
        );
        Ok(())
    }

    /// A node reports a container gone: release its IP and drop the shadow.
    fn destroyed_container(&mut self, msg: &Message) -> Result<(), CommandError> {
        let uuid = bytes_arg(msg, "container")?;
        log::info!("a dependent container has been destroyed: {}", String::from_utf8_lossy(&uuid));
        let ip = opt_str_arg(msg, "ip");
        self.drop_container_shadow(&uuid, ip.as_deref());
        Ok(())
    }

    /// Shared teardown for `destroyed_container` and node destruction. The
    /// released IP comes from the caller, not the shadow — the shadow may
    /// already be missing.
    pub(crate) fn drop_container_shadow(&mut self, uuid: &[u8], ip: Option<&str>) {
        if let Some(ip) = ip {
            self.model.release_ip(ip);
        }
        let Some(entry) = self.model.containers.remove(uuid) else {
            log::debug!("destroyed container had no shadow: {}", String::from_utf8_lossy(uuid));
            return;
        };
        match self.model.sessions.get_mut(&entry.session_rid) {
            Some(sess) => {
                sess.containers.remove(uuid);
                persist_session(&self.model.store, sess);
            }
            None => log::debug!(
                "session disappeared before its container: {}",
                String::from_utf8_lossy(uuid)
            ),
        }
    }

    // ─── tunnels ───────────────────────────────────────────────────────

    fn create_tunnel(&mut self, msg: &Message) -> Result<(), CommandError> {
        let container = bytes_arg(msg, "container")?;
        let port = int_arg(msg, "port")? as u16;
        let timeout = int_arg(msg, "timeout")?.max(0) as u64;
        let ip = self.model.valid_container(&msg.rid, &container)?.ip.clone();

        let sess = session_mut(&mut self.model.sessions, &msg.rid)?;
        let spec = TunnelSpec { uuid: msg.uuid.clone(), ip, port, timeout };
        sess.tunnels.insert(msg.uuid.clone(), Tunnel::new(spec));
        persist_session(&self.model.store, sess);
        Ok(())
    }

    fn destroy_tunnel(&mut self, msg: &Message) -> Result<(), CommandError> {
        let uuid = bytes_arg(msg, "tunnel")?;
        let sess = session_mut(&mut self.model.sessions, &msg.rid)?;
        let Some(mut tun) = sess.tunnels.remove(&uuid) else {
            return Err(CommandError::invalid("Unknown session or tunnel"));
        };
        tun.disconnect();
        persist_session(&self.model.store, sess);
        log::info!("destroyed tunnel uuid: {}", String::from_utf8_lossy(&uuid));
        Ok(())
    }

    /// Forward client payload down a tunnel. Unknown sessions or tunnels
    /// are absorbed: closes race with in-flight data.
    fn to_proxy(&mut self, msg: Message) -> Result<(), CommandError> {
        let Some(tunnel_uuid) = msg.bytes_param("tunnel") else { return Ok(()) };
        let Some(fd) = msg.int_param("proxy") else { return Ok(()) };
        let events = self.events.clone();
        let rid = msg.rid.clone();
        let Some(sess) = self.model.sessions.get_mut(&rid) else { return Ok(()) };
        let Some(tun) = sess.tunnels.get_mut(&tunnel_uuid) else { return Ok(()) };
        tun.forward(fd, msg, &rid, &events);
        Ok(())
    }

    /// Client is done with one virtual connection. Also arrives as the echo
    /// of our own close notifications, hence the silent misses.
    fn close_proxy(&mut self, msg: &Message) -> Result<(), CommandError> {
        let Some(tunnel_uuid) = msg.bytes_param("tunnel") else { return Ok(()) };
        let Some(fd) = msg.int_param("proxy") else { return Ok(()) };
        let Some(sess) = self.model.sessions.get_mut(&msg.rid) else { return Ok(()) };
        let Some(tun) = sess.tunnels.get_mut(&tunnel_uuid) else { return Ok(()) };
        tun.close_proxy(fd);
        Ok(())
    }

    // ─── image descriptions ────────────────────────────────────────────

    fn cache_description(&mut self, msg: &Message) -> Result<(), CommandError> {
        let user = bytes_arg(msg, "user")?;
        let image_id = str_arg(msg, "image_id")?;
        let desc = msg.param("description").cloned().unwrap_or(WireValue::Null);
        self.model
            .create_update_description(&user, &image_id, desc)
            .map_err(CommandError::Internal)?;
        log::debug!("cached description for: {image_id}");
        Ok(())
    }

    fn retrieve_description(&mut self, msg: &Message) -> Result<(), CommandError> {
        let user = bytes_arg(msg, "user")?;
        let image_id = str_arg(msg, "image_id")?;
        let full_id = crate::model::Model::description_id(&user, &image_id);
        match self.model.descriptions.get(&full_id) {
            Some(desc) => {
                log::debug!("cache hit on descriptions for: {image_id}");
                self.bus.reply(msg, wire_map! { "description" => desc.clone() });
            }
            None => {
                log::debug!("cache miss on descriptions for: {image_id}");
                self.bus.reply(msg, WireMap::new());
            }
        }
        Ok(())
    }

    // ─── layer uploads ─────────────────────────────────────────────────

    fn upload_requirements(&mut self, msg: &Message) -> Result<(), CommandError> {
        let layers: Vec<Option<String>> = msg
            .param("layers")
            .and_then(WireValue::as_list)
            .ok_or_else(|| bad_param("layers"))?
            .iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect();
        let needed = self.images.upload_requirements(&layers)?;
        let needed: Vec<WireValue> = needed.into_iter().map(WireValue::Str).collect();
        self.bus.reply(msg, wire_map! { "layers" => needed });
        Ok(())
    }

    fn upload_slab(&mut self, msg: &Message) -> Result<(), CommandError> {
        let digest = str_arg(msg, "sha256")?;
        let slab = int_arg(msg, "slab")?;
        let line = self.images.upload_slab(&digest, slab, &msg.bulk)?;
        self.bus.reply(msg, wire_map! { "log" => line });
        Ok(())
    }

    fn upload_complete(&mut self, msg: &Message) -> Result<(), CommandError> {
        let digest = str_arg(msg, "sha256")?;
        let line = self.images.upload_complete(&digest)?;
        log::info!("{line}");
        self.bus.reply(msg, wire_map! { "log" => line });
        Ok(())
    }

    // ─── volumes ───────────────────────────────────────────────────────

    fn create_volume(&mut self, msg: &Message) -> Result<(), CommandError> {
        let user = bytes_arg(msg, "user")?;
        let tag = opt_bytes_arg(msg, "tag");
        let sync_disabled = msg.bool_param("async").unwrap_or(false);
        if self.model.volumes.will_clash(&user, &msg.uuid, tag.as_deref()) {
            return Err(CommandError::invalid("Volume tag is already being used"));
        }
        let vol = volumes::create(&user, &msg.uuid, tag.as_deref(), sync_disabled)
            .map_err(|e| CommandError::invalid(e.to_string()))?;
        self.model.volumes.insert(vol);
        self.bus.reply(msg, WireMap::new());

        let rids: Vec<Vec<u8>> = self.model.sessions.keys().cloned().collect();
        for rid in rids {
            if rid != msg.rid {
                self.bus.send_cmd(
                    &rid,
                    "volume_created",
                    wire_map! { "volume" => msg.uuid.clone(), "tag" => tag.clone() },
                );
            }
        }
        Ok(())
    }

    fn destroy_volume(&mut self, msg: &Message) -> Result<(), CommandError> {
        let uuid = bytes_arg(msg, "volume")?;
        let user = bytes_arg(msg, "user")?;

        // refuse while any live container mounts it
        for sess in self.model.sessions.values() {
            for ctr in sess.containers.values() {
                if ctr.volumes.iter().any(|v| v == &uuid) {
                    return Err(CommandError::invalid(format!(
                        "Volume is mounted in a container: {}",
                        String::from_utf8_lossy(&ctr.uuid)
                    )));
                }
            }
        }

        let vol = self.model.valid_volume(&user, &uuid)?.clone();
        volumes::destroy(&vol);
        self.model.volumes.remove(&uuid);
        self.bus.reply(msg, WireMap::new());

        let rids: Vec<Vec<u8>> = self.model.sessions.keys().cloned().collect();
        for rid in rids {
            if rid != msg.rid {
                self.bus
                    .send_cmd(&rid, "volume_destroyed", wire_map! { "volume" => uuid.clone() });
            }
        }
        Ok(())
    }

    fn snapshot_volume(&mut self, msg: &Message) -> Result<(), CommandError> {
        let uuid = bytes_arg(msg, "volume")?;
        let user = bytes_arg(msg, "user")?;
        volumes::snapshot(self.model.valid_volume(&user, &uuid)?);
        Ok(())
    }

    fn rollback_volume(&mut self, msg: &Message) -> Result<(), CommandError> {
        let uuid = bytes_arg(msg, "volume")?;
        let user = bytes_arg(msg, "user")?;
        volumes::rollback(self.model.valid_volume(&user, &uuid)?);
        Ok(())
    }

    // ─── domains ───────────────────────────────────────────────────────

    /// Phase one of the ownership proof: allocate and persist a token.
    fn prepare_domain(&mut self, msg: &Message) -> Result<(), CommandError> {
        let domain = msg
            .str_param("domain")
            .ok_or_else(|| CommandError::invalid("Need a domain name"))?;
        let user = self.model.valid_session(&msg.rid)?.user.clone();

        if let Some(existing) = self.model.user_domain(&user, &domain) {
            if existing.is_valid() {
                return Err(CommandError::invalid("You have already claimed this domain."));
            }
            let token = existing.token.clone().unwrap_or_default();
            return Err(CommandError::invalid(format!(
                "You are already trying to claim this domain, the token is {}",
                String::from_utf8_lossy(&token)
            )));
        }

        let dom = Domain::pending(domain.clone(), msg.uuid.clone(), user.clone());
        let row = dom.to_row().map_err(CommandError::Internal)?;
        let mut inserted = self.model.store.try_insert_domain(&domain, &row).map_err(CommandError::Internal)?;
        if !inserted {
            // maybe an aged claim is squatting on the name
            log::debug!("preparing domain hit a claimed name, shedding aged domains: {domain}");
            self.model.shed_aged_domains();
            inserted = self.model.store.try_insert_domain(&domain, &row).map_err(CommandError::Internal)?;
        }
        if !inserted {
            return Err(CommandError::invalid(
                "This domain is already claimed or in the process of being claimed",
            ));
        }

        let token = dom.token.clone().unwrap_or_default();
        self.model.domains.entry(user).or_default().insert(domain.clone(), dom);
        log::info!("user prepared to claim domain: {domain}");
        self.bus.reply(msg, wire_map! { "token" => token });
        Ok(())
    }

    /// Phase two: verify the token via DNS. The lookup runs on a worker;
    /// the claim is finalised when its verdict event reaches the loop.
    fn claim_domain(&mut self, msg: &Message) -> Result<(), CommandError> {
        let domain = msg
            .str_param("domain")
            .ok_or_else(|| CommandError::invalid("Need a domain name"))?;
        let user = self.model.valid_session(&msg.rid)?.user.clone();
        let Some(dom) = self.model.user_domain(&user, &domain) else {
            return Err(CommandError::invalid("Domain is not in the process of being claimed by you"));
        };
        if dom.is_valid() {
            return Err(CommandError::invalid("Domain has already been claimed"));
        }

        let resolver = self.resolver.clone();
        let events = self.events.clone();
        let (rid, uuid) = (msg.rid.clone(), msg.uuid.clone());
        tokio::spawn(async move {
            let records = resolver
                .txt(&Domain::token_record(&domain))
                .await
                .map_err(|e| e.to_string());
            let _ = events.send(LoopEvent::DomainVerdict { rid, uuid, user, domain, records });
        });
        Ok(())
    }

    /// Finalise a claim once the TXT worker reports back. The pending
    /// domain is re-validated — it may have been released mid-lookup.
    pub(crate) fn finish_claim_domain(
        &mut self,
        rid: Vec<u8>,
        uuid: Vec<u8>,
        user: Vec<u8>,
        domain: String,
        records: Result<Vec<Vec<String>>, String>,
    ) {
        let record_name = Domain::token_record(&domain);
        let outcome: Result<(), String> = (|| {
            let Some(dom) = self.model.user_domain_mut(&user, &domain) else {
                return Err("Domain is not in the process of being claimed by you".to_string());
            };
            if dom.is_valid() {
                return Err("Domain has already been claimed".to_string());
            }
            let records =
                records.map_err(|_| format!("Did not find a TXT record for {record_name}"))?;
            if records.len() != 1 || records[0].len() != 1 {
                return Err("DNS token was malformed (more than one txt record?)".to_string());
            }
            let expected = dom.token.clone().unwrap_or_default();
            if records[0][0].as_bytes() != expected.as_slice() {
                return Err(format!(
                    "DNS returned the wrong token, needed {}",
                    String::from_utf8_lossy(&expected)
                ));
            }
            dom.mark_valid();
            let snapshot = dom.clone();
            persist_domain(&self.model.store, &snapshot);
            log::info!("user successfully claimed domain: {domain}");
            Ok(())
        })();
        match outcome {
            Ok(()) => self.bus.reply_raw(&rid, &uuid, WireMap::new()),
            Err(text) => self.bus.reply_exception_raw(&rid, &uuid, &text),
        }
    }

    fn make_domain_global(&mut self, msg: &Message) -> Result<(), CommandError> {
        let domain = str_arg(msg, "domain")?;
        let user = self.model.valid_session(&msg.rid)?.user.clone();
        let dom = self.model.valid_domain_mut(&user, &domain)?;
        dom.global = true;
        let snapshot = dom.clone();
        self.model.add_global_domain(snapshot.clone());
        persist_domain(&self.model.store, &snapshot);
        log::info!("domain made global: {domain}");
        self.bus.reply(msg, WireMap::new());
        Ok(())
    }

    fn make_domain_private(&mut self, msg: &Message) -> Result<(), CommandError> {
        let domain = str_arg(msg, "domain")?;
        let user = self.model.valid_session(&msg.rid)?.user.clone();
        let dom = self.model.valid_domain_mut(&user, &domain)?;
        dom.global = false;
        let snapshot = dom.clone();
        self.model.remove_global_domain(&domain);
        persist_domain(&self.model.store, &snapshot);
        log::info!("domain made private: {domain}");
        self.bus.reply(msg, WireMap::new());
        Ok(())
    }

    fn release_domain(&mut self, msg: &Message) -> Result<(), CommandError> {
        let domain = msg
            .str_param("domain")
            .ok_or_else(|| CommandError::invalid("Need a domain name"))?;
        let user = self.model.valid_session(&msg.rid)?.user.clone();
        let removed = self
            .model
            .domains
            .get_mut(&user)
            .and_then(|doms| doms.remove(&domain));
        if removed.is_none() {
            return Err(CommandError::invalid(
                "Domain has not been either prepared or claimed by you",
            ));
        }
        self.model.global_domains.remove(&domain);
        self.model.store.delete_domain(&domain).map_err(CommandError::Internal)?;
        log::info!("user released domain: {domain}");
        self.bus.reply(msg, WireMap::new());
        Ok(())
    }

    // ─── clusters ──────────────────────────────────────────────────────

    /// Publish a virtual host over a set of the session's containers.
    fn publish_web(&mut self, msg: &Message) -> Result<(), CommandError> {
        let domain = str_arg(msg, "domain")?;
        let subdomain = str_arg(msg, "subdomain")?;
        let ssl = opt_str_arg(msg, "ssl");
        let rewrite = opt_str_arg(msg, "rewrite");
        let user = self.model.valid_session(&msg.rid)?.user.clone();

        // the user's own domains shadow globally advertised ones
        let eligible = match self.model.user_domain(&user, &domain) {
            Some(dom) => Some(dom.is_valid()),
            None => self.model.global_domains.get(&domain).map(Domain::is_valid),
        };
        match eligible {
            None => {
                return Err(CommandError::invalid(format!(
                    "Domain is not valid for this user: {domain}"
                )))
            }
            Some(false) => return Err(CommandError::invalid("Domain setup has not been completed")),
            Some(true) => {}
        }

        let fqdn = format!("{subdomain}{domain}");
        if self.model.all_clusters().iter().any(|c| c.fqdn() == fqdn) {
            return Err(CommandError::invalid("FQDN is being used by another session"));
        }

        let sess = self.model.valid_session(&msg.rid)?;
        let mut members = Vec::new();
        for value in msg
            .param("containers")
            .and_then(WireValue::as_list)
            .ok_or_else(|| bad_param("containers"))?
        {
            let uuid = value
                .as_bytes()
                .filter(|uuid| sess.containers.contains_key(*uuid))
                .ok_or_else(|| CommandError::invalid("Incorrect uuid in containers"))?;
            members.push(uuid.to_vec());
        }

        let cluster = Cluster {
            uuid: msg.uuid.clone(),
            domain,
            subdomain,
            ssl,
            rewrite,
            containers: members,
        };
        let cert_dir = self.proxy.cert_dir().to_path_buf();
        cluster.write_cert(&cert_dir).map_err(CommandError::Internal)?;

        let sess = session_mut(&mut self.model.sessions, &msg.rid)?;
        sess.clusters.insert(msg.uuid.clone(), cluster);
        persist_session(&self.model.store, sess);
        self.rebuild_proxy();
        log::info!("published cluster ({}) to: {fqdn}", String::from_utf8_lossy(&msg.uuid));
        self.bus.reply(msg, WireMap::new());
        Ok(())
    }

    fn unpublish_web(&mut self, msg: &Message) -> Result<(), CommandError> {
        let uuid = bytes_arg(msg, "cluster")?;
        let cert_dir = self.proxy.cert_dir().to_path_buf();
        let sess = session_mut(&mut self.model.sessions, &msg.rid)?;
        let Some(cluster) = sess.clusters.remove(&uuid) else {
            return Err(CommandError::invalid("Cluster does not exist"));
        };
        cluster.remove_cert(&cert_dir);
        persist_session(&self.model.store, sess);
        self.rebuild_proxy();
        log::info!("unpublished cluster: {}", String::from_utf8_lossy(&uuid));
        Ok(())
    }

    fn add_to_cluster(&mut self, msg: &Message) -> Result<(), CommandError> {
        let cluster_uuid = bytes_arg(msg, "cluster")?;
        let container = bytes_arg(msg, "container")?;
        self.model.valid_container(&msg.rid, &container)?;
        let sess = session_mut(&mut self.model.sessions, &msg.rid)?;
        let Some(cluster) = sess.clusters.get_mut(&cluster_uuid) else {
            return Err(CommandError::invalid("Cluster does not exist"));
        };
        if !cluster.containers.contains(&container) {
            cluster.containers.push(container.clone());
            persist_session(&self.model.store, sess);
            self.rebuild_proxy();
            log::info!(
                "added ({}) to cluster: {}",
                String::from_utf8_lossy(&container),
                String::from_utf8_lossy(&cluster_uuid)
            );
        }
        self.bus.reply(msg, WireMap::new());
        Ok(())
    }

    fn remove_from_cluster(&mut self, msg: &Message) -> Result<(), CommandError> {
        let cluster_uuid = bytes_arg(msg, "cluster")?;
        let container = bytes_arg(msg, "container")?;
        self.model.valid_container(&msg.rid, &container)?;
        let sess = session_mut(&mut self.model.sessions, &msg.rid)?;
        let Some(cluster) = sess.clusters.get_mut(&cluster_uuid) else {
            return Err(CommandError::invalid("Cluster does not exist"));
        };
        if let Some(at) = cluster.containers.iter().position(|c| c == &container) {
            cluster.containers.remove(at);
            persist_session(&self.model.store, sess);
            self.rebuild_proxy();
            log::info!(
                "removed ({}) from cluster: {}",
                String::from_utf8_lossy(&container),
                String::from_utf8_lossy(&cluster_uuid)
            );
        }
        Ok(())
    }

    // ─── sessions ──────────────────────────────────────────────────────

    /// Mark the session live and pass the heartbeat on to every node
    /// hosting one of its containers.
    fn heartbeat(&mut self, msg: &Message) -> Result<(), CommandError> {
        let Some(sess) = self.model.sessions.get_mut(&msg.rid) else {
            log::warn!(
                "a heartbeat arrived for a session we thought was gone: {}",
                hex::encode(&msg.rid)
            );
            return Ok(());
        };
        sess.last_heartbeat = Instant::now();

        for (uuid, ctr) in &sess.containers {
            match self.model.nodes.get(&ctr.node_pk) {
                Some(node) => {
                    self.bus.send_cmd(
                        &node.rid,
                        "heartbeat_container",
                        wire_map! { "container" => uuid.clone() },
                    );
                }
                None => {
                    // node is temporarily (hopefully) offline
                    log::warn!("tried to heartbeat a container but couldn't find the node");
                }
            }
        }
        Ok(())
    }
}
