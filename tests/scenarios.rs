//! End-to-end scenarios driven through the broker loop.
//!
//! Each test stands up a broker against a temporary state directory and an
//! in-memory bus, then feeds it the same events the transport would.

use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use wharfd::broker::{Broker, LoopEvent};
use wharfd::bus::{BusEvent, BusSender, Message, Outbound};
use wharfd::model::container::{Container, ContainerRef};
use wharfd::model::domain::Domain;
use wharfd::wire_map;
use wharfd::{Config, TokenLookup, WireMap, WireValue};

// ─── harness ───────────────────────────────────────────────────────────

struct StubResolver {
    records: HashMap<String, Vec<Vec<String>>>,
}

#[async_trait]
impl TokenLookup for StubResolver {
    async fn txt(&self, name: &str) -> anyhow::Result<Vec<Vec<String>>> {
        self.records
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no TXT records for {name}"))
    }
}

struct Harness {
    broker: Broker,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    events_rx: mpsc::UnboundedReceiver<LoopEvent>,
    cfg: Config,
    _dir: tempfile::TempDir,
}

fn harness() -> Harness {
    harness_with_records(HashMap::new())
}

fn harness_with_records(records: HashMap<String, Vec<Vec<String>>>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config_for(&dir);
    std::fs::create_dir_all(&cfg.state_dir).unwrap();
    std::fs::write(cfg.state_dir.join("secret.key"), b"test-secret").unwrap();

    let (bus, outbound) = BusSender::channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let broker = Broker::new(cfg.clone(), bus, events_tx, Arc::new(StubResolver { records })).unwrap();
    Harness { broker, outbound, events_rx, cfg, _dir: dir }
}

fn config_for(dir: &tempfile::TempDir) -> Config {
    Config {
        state_dir: dir.path().join("state"),
        haproxy_path: dir.path().join("haproxy.cfg"),
        inspect_port: 0,
        bus_socket: dir.path().join("bus.sock"),
    }
}

fn msg(rid: &[u8], uuid: &[u8], command: &str, params: WireMap) -> Message {
    Message {
        rid: rid.to_vec(),
        uuid: uuid.to_vec(),
        command: command.as_bytes().to_vec(),
        params,
        bulk: Vec::new(),
    }
}

fn msg_bulk(rid: &[u8], uuid: &[u8], command: &str, params: WireMap, bulk: Vec<u8>) -> Message {
    Message { bulk, ..msg(rid, uuid, command, params) }
}

impl Harness {
    fn send(&mut self, message: Message) {
        self.broker.handle_bus_event(BusEvent::Message(message));
    }

    fn connect_node(&mut self, pk: &[u8], rid: &[u8], subnet_id: u32) {
        self.broker.handle_bus_event(BusEvent::NodeConnected {
            pk: pk.to_vec(),
            rid: rid.to_vec(),
            config: format!(r#"{{"subnet_id": {subnet_id}}}"#),
        });
    }

    fn open_session(&mut self, rid: &[u8], user: &[u8]) {
        self.broker.handle_bus_event(BusEvent::SessionOpened {
            rid: rid.to_vec(),
            user: user.to_vec(),
        });
    }

    /// Plant a container shadow inside a session, as if a node had
    /// registered it.
    fn plant_container(&mut self, rid: &[u8], uuid: &[u8], ip: &str, tag: Option<&[u8]>) {
        let container = Container {
            user: self.broker.model.sessions[rid].user.clone(),
            uuid: uuid.to_vec(),
            tag: tag.map(<[u8]>::to_vec),
            session_rid: rid.to_vec(),
            node_pk: b"node-pk".to_vec(),
            ip: ip.to_string(),
            volumes: Vec::new(),
        };
        self.broker.model.containers.insert(ContainerRef::of(&container));
        self.broker
            .model
            .sessions
            .get_mut(rid)
            .unwrap()
            .containers
            .insert(uuid.to_vec(), container);
    }

    /// Pop outbound traffic until a reply for `uuid` arrives.
    fn reply_for(&mut self, uuid: &[u8]) -> WireMap {
        loop {
            match self.outbound.try_recv().expect("no reply queued") {
                Outbound::Reply { uuid: got, params, .. } if got == uuid => return params,
                _ => continue,
            }
        }
    }

    /// Pop outbound traffic until a command with `name` arrives.
    async fn command_named(&mut self, name: &str) -> (Vec<u8>, WireMap, Vec<u8>) {
        loop {
            let item = tokio::time::timeout(Duration::from_secs(5), self.outbound.recv())
                .await
                .expect("timed out waiting for outbound command")
                .expect("bus closed");
            if let Outbound::Command { command, params, bulk, .. } = item {
                if command == name.as_bytes() {
                    return (command, params, bulk);
                }
            }
        }
    }

    async fn next_event(&mut self) -> LoopEvent {
        tokio::time::timeout(Duration::from_secs(10), self.events_rx.recv())
            .await
            .expect("timed out waiting for a loop event")
            .expect("event channel closed")
    }
}

fn exception(params: &WireMap) -> Option<&str> {
    params.get("exception").and_then(WireValue::as_str)
}

fn compress(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    lzma_rs::lzma_compress(&mut Cursor::new(data), &mut out).unwrap();
    out
}

// ─── scenarios ─────────────────────────────────────────────────────────

#[tokio::test]
async fn ip_allocation_stays_in_subnet() {
    let mut h = harness();
    h.connect_node(b"node-pk", b"node-rid", 2);

    let mut ips = Vec::new();
    for n in 0..3 {
        let uuid = format!("alloc-{n}").into_bytes();
        h.send(msg(
            b"node-rid",
            &uuid,
            "allocate_ip",
            wire_map! { "container" => format!("ctr-{n}").into_bytes() },
        ));
        let reply = h.reply_for(&uuid);
        let ip = reply.get("ip").and_then(WireValue::as_str).unwrap().to_string();
        ips.push(ip);
    }

    for ip in &ips {
        let octets: Vec<u32> = ip.split('.').map(|o| o.parse().unwrap()).collect();
        assert_eq!(octets.len(), 4);
        assert_eq!(octets[0], 10);
        assert_eq!(octets[1], 2);
        let host = octets[1] * 65536 + octets[2] * 256 + octets[3];
        assert!((2 * 65536 + 256..2 * 65536 + 65533).contains(&host), "{ip} out of range");
    }
    assert_eq!(ips.iter().collect::<std::collections::HashSet<_>>().len(), 3);

    let snapshot = h.broker.state_snapshot();
    assert_eq!(snapshot["allocations"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn approve_tag_rejects_collision() {
    let mut h = harness();
    h.connect_node(b"node-pk", b"node-rid", 2);
    h.open_session(b"sess-1", b"alice");

    h.send(msg(
        b"sess-1",
        b"ap-1",
        "approve_tag",
        wire_map! { "user" => b"alice".to_vec(), "tag" => b"web".to_vec() },
    ));
    assert!(exception(&h.reply_for(b"ap-1")).is_none());

    // register a live container carrying the tag
    h.send(msg(
        b"node-rid",
        b"dep-1",
        "dependent_container",
        wire_map! {
            "container" => b"ctr-1".to_vec(),
            "node_pk" => b"node-pk".to_vec(),
            "ip" => "10.2.0.5",
            "cookie" => WireValue::Map(wire_map! {
                "user" => b"alice".to_vec(),
                "tag" => b"web".to_vec(),
                "session" => b"sess-1".to_vec(),
            }),
            "volumes" => Vec::<WireValue>::new(),
        },
    ));

    h.send(msg(
        b"sess-1",
        b"ap-2",
        "approve_tag",
        wire_map! { "user" => b"alice".to_vec(), "tag" => b"web".to_vec() },
    ));
    let reply = h.reply_for(b"ap-2");
    assert_eq!(exception(&reply), Some("Tag is already being used"));
}

#[tokio::test]
async fn layer_upload_roundtrip() {
    let mut h = harness();
    h.open_session(b"sess-1", b"alice");

    let offer = wire_map! {
        "layers" => vec![WireValue::Str("a".into()), WireValue::Str("b".into())],
    };
    h.send(msg(b"sess-1", b"req-1", "upload_requirements", offer.clone()));
    let reply = h.reply_for(b"req-1");
    let needed: Vec<&str> = reply["layers"].as_list().unwrap().iter().filter_map(WireValue::as_str).collect();
    assert_eq!(needed, vec!["a", "b"]);

    h.send(msg_bulk(
        b"sess-1",
        b"slab-0",
        "upload_slab",
        wire_map! { "sha256" => "a", "slab" => 0i64 },
        compress(b"hello"),
    ));
    h.reply_for(b"slab-0");
    h.send(msg_bulk(
        b"sess-1",
        b"slab-1",
        "upload_slab",
        wire_map! { "sha256" => "a", "slab" => 1i64 },
        compress(b" world"),
    ));
    h.reply_for(b"slab-1");
    h.send(msg(b"sess-1", b"done-1", "upload_complete", wire_map! { "sha256" => "a" }));
    h.reply_for(b"done-1");

    h.send(msg(b"sess-1", b"req-2", "upload_requirements", offer));
    let reply = h.reply_for(b"req-2");
    let needed: Vec<&str> = reply["layers"].as_list().unwrap().iter().filter_map(WireValue::as_str).collect();
    assert_eq!(needed, vec!["b"]);

    let stored = std::fs::read_to_string(h.cfg.state_dir.join("layer_cache").join("a")).unwrap();
    assert_eq!(stored, "hello world");
}

#[tokio::test]
async fn tunnel_timeout_tears_proxy_down() {
    let mut h = harness();
    h.open_session(b"sess-1", b"alice");
    // TEST-NET-1 address: nothing listens there
    h.plant_container(b"sess-1", b"ctr-1", "192.0.2.1", None);

    h.send(msg(
        b"sess-1",
        b"tun-1",
        "create_tunnel",
        wire_map! { "container" => b"ctr-1".to_vec(), "port" => 9i64, "timeout" => 1i64 },
    ));

    let started = Instant::now();
    h.send(msg_bulk(
        b"sess-1",
        b"px-1",
        "to_proxy",
        wire_map! { "tunnel" => b"tun-1".to_vec(), "proxy" => 7i64 },
        b"payload".to_vec(),
    ));
    assert!(h.broker.model.sessions[b"sess-1".as_slice()].tunnels[b"tun-1".as_slice()].has_proxy(7));

    let event = h.next_event().await;
    assert!(
        matches!(event, LoopEvent::ProxyDead { proxy: 7, .. }),
        "expected a dead proxy, got {event:?}"
    );
    assert!(started.elapsed() < Duration::from_secs(4));
    h.broker.handle_loop_event(event);

    let reply = h.reply_for(b"px-1");
    assert!(exception(&reply).unwrap().contains("timed out"));
    assert!(!h.broker.model.sessions[b"sess-1".as_slice()].tunnels[b"tun-1".as_slice()].has_proxy(7));
}

#[tokio::test]
async fn tunnel_forwards_and_returns_data() {
    let mut h = harness();
    h.open_session(b"sess-1", b"alice");

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4];
        socket.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        socket.write_all(b"pong").await.unwrap();
        socket.shutdown().await.unwrap();
    });

    h.plant_container(b"sess-1", b"ctr-1", "127.0.0.1", None);
    h.send(msg(
        b"sess-1",
        b"tun-1",
        "create_tunnel",
        wire_map! { "container" => b"ctr-1".to_vec(), "port" => i64::from(port), "timeout" => 5i64 },
    ));
    h.send(msg_bulk(
        b"sess-1",
        b"px-1",
        "to_proxy",
        wire_map! { "tunnel" => b"tun-1".to_vec(), "proxy" => 3i64 },
        b"ping".to_vec(),
    ));

    let up = h.next_event().await;
    assert!(matches!(up, LoopEvent::ProxyUp { proxy: 3, .. }), "got {up:?}");
    h.broker.handle_loop_event(up);

    // return path: container bytes come back as a from_proxy command
    let (_, params, bulk) = h.command_named("from_proxy").await;
    assert_eq!(params.get("proxy").and_then(WireValue::as_i64), Some(3));
    assert_eq!(bulk, b"pong");

    // orderly close on the container side notifies the client
    let eof = h.next_event().await;
    assert!(matches!(eof, LoopEvent::ProxyEof { proxy: 3, .. }), "got {eof:?}");
    h.broker.handle_loop_event(eof);
    let (_, params, _) = h.command_named("close_proxy").await;
    assert_eq!(params.get("proxy").and_then(WireValue::as_i64), Some(3));
    assert!(!h.broker.model.sessions[b"sess-1".as_slice()].tunnels[b"tun-1".as_slice()].has_proxy(3));
}

#[tokio::test]
async fn session_recovery_rewrites_rids() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config_for(&dir);
    std::fs::create_dir_all(&cfg.state_dir).unwrap();
    std::fs::write(cfg.state_dir.join("secret.key"), b"test-secret").unwrap();

    // first life: a session with one container, one tunnel, one forward
    {
        let (bus, _outbound) = BusSender::channel();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let mut broker = Broker::new(
            cfg.clone(),
            bus,
            events_tx,
            Arc::new(StubResolver { records: HashMap::new() }),
        )
        .unwrap();

        broker.handle_bus_event(BusEvent::SessionOpened { rid: b"rid-old".to_vec(), user: b"alice".to_vec() });
        broker.handle_bus_event(BusEvent::NodeConnected {
            pk: b"node-pk".to_vec(),
            rid: b"node-rid".to_vec(),
            config: r#"{"subnet_id": 2}"#.to_string(),
        });
        broker.handle_bus_event(BusEvent::Message(msg(
            b"node-rid",
            b"dep-1",
            "dependent_container",
            wire_map! {
                "container" => b"ctr-1".to_vec(),
                "node_pk" => b"node-pk".to_vec(),
                "ip" => "10.2.0.9",
                "cookie" => WireValue::Map(wire_map! {
                    "user" => b"alice".to_vec(),
                    "tag" => WireValue::Null,
                    "session" => b"rid-old".to_vec(),
                }),
                "volumes" => Vec::<WireValue>::new(),
            },
        )));
        broker.handle_bus_event(BusEvent::Message(msg(
            b"rid-old",
            b"tun-1",
            "create_tunnel",
            wire_map! { "container" => b"ctr-1".to_vec(), "port" => 5432i64, "timeout" => 30i64 },
        )));
        broker.handle_bus_event(BusEvent::ForwardingLearned {
            key: b"fwd-key".to_vec(),
            value: b"rid-old".to_vec(),
        });
        broker.shutdown();
    }

    // second life: the session comes back under a new rid
    let (bus, _outbound) = BusSender::channel();
    let (events_tx, _events_rx) = mpsc::unbounded_channel();
    let mut broker = Broker::new(cfg, bus, events_tx, Arc::new(StubResolver { records: HashMap::new() })).unwrap();

    assert!(broker.model.sessions.contains_key(b"rid-old".as_slice()));
    assert!(broker.model.allocations.contains("10.2.0.9"));

    broker.handle_bus_event(BusEvent::SessionRecovered {
        old_rid: b"rid-old".to_vec(),
        new_rid: b"rid-new".to_vec(),
    });

    let sess = &broker.model.sessions[b"rid-new".as_slice()];
    assert!(!broker.model.sessions.contains_key(b"rid-old".as_slice()));
    assert_eq!(sess.containers[b"ctr-1".as_slice()].session_rid, b"rid-new");

    let tunnel = &sess.tunnels[b"tun-1".as_slice()];
    assert_eq!(tunnel.spec.ip, "10.2.0.9");
    assert_eq!(tunnel.spec.port, 5432);
    assert_eq!(tunnel.spec.timeout, 30);
    assert_eq!(tunnel.proxy_count(), 0);

    assert_eq!(broker.model.forwards[b"fwd-key".as_slice()], b"rid-new");
    let rows = broker.model.store.forwarding().unwrap();
    assert_eq!(rows, vec![(b"fwd-key".to_vec(), b"rid-new".to_vec())]);
}

#[tokio::test]
async fn domain_claim_two_phase() {
    let mut records = HashMap::new();
    records.insert("tf-token.x.test".to_string(), vec![vec!["tok-1".to_string()]]);
    let mut h = harness_with_records(records);
    h.open_session(b"sess-1", b"alice");

    h.send(msg(b"sess-1", b"tok-1", "prepare_domain", wire_map! { "domain" => "x.test" }));
    let reply = h.reply_for(b"tok-1");
    assert_eq!(reply.get("token").and_then(|v| v.as_bytes()), Some(b"tok-1".as_slice()));

    h.send(msg(b"sess-1", b"clm-1", "claim_domain", wire_map! { "domain" => "x.test" }));
    let verdict = h.next_event().await;
    assert!(matches!(verdict, LoopEvent::DomainVerdict { .. }));
    h.broker.handle_loop_event(verdict);
    let reply = h.reply_for(b"clm-1");
    assert!(exception(&reply).is_none(), "claim failed: {reply:?}");

    // the domain is now valid — a second claim is rejected outright
    h.send(msg(b"sess-1", b"clm-2", "claim_domain", wire_map! { "domain" => "x.test" }));
    assert_eq!(exception(&h.reply_for(b"clm-2")), Some("Domain has already been claimed"));

    // and so is preparing it again
    h.send(msg(b"sess-1", b"tok-2", "prepare_domain", wire_map! { "domain" => "x.test" }));
    assert_eq!(
        exception(&h.reply_for(b"tok-2")),
        Some("You have already claimed this domain.")
    );
}

#[tokio::test]
async fn claim_with_wrong_token_fails() {
    let mut records = HashMap::new();
    records.insert("tf-token.y.test".to_string(), vec![vec!["not-the-token".to_string()]]);
    let mut h = harness_with_records(records);
    h.open_session(b"sess-1", b"alice");

    h.send(msg(b"sess-1", b"tok-9", "prepare_domain", wire_map! { "domain" => "y.test" }));
    h.reply_for(b"tok-9");
    h.send(msg(b"sess-1", b"clm-9", "claim_domain", wire_map! { "domain" => "y.test" }));
    let verdict = h.next_event().await;
    h.broker.handle_loop_event(verdict);
    assert!(exception(&h.reply_for(b"clm-9")).unwrap().contains("wrong token"));

    // still pending, not validated
    assert!(!h.broker.model.domains[b"alice".as_slice()]["y.test"].is_valid());
}

#[tokio::test]
async fn publish_then_unpublish_restores_config() {
    let mut h = harness();
    h.open_session(b"sess-1", b"alice");
    h.plant_container(b"sess-1", b"ctr-1", "10.2.0.7", None);
    h.broker.model.domains.entry(b"alice".to_vec()).or_default().insert(
        "example.test".to_string(),
        Domain {
            domain: "example.test".to_string(),
            token: None,
            user: b"alice".to_vec(),
            attempted: 0,
            global: false,
        },
    );

    let baseline = std::fs::read_to_string(&h.cfg.haproxy_path).unwrap();

    h.send(msg(
        b"sess-1",
        b"clu-1",
        "publish_web",
        wire_map! {
            "domain" => "example.test",
            "subdomain" => "www.",
            "ssl" => WireValue::Null,
            "rewrite" => WireValue::Null,
            "containers" => vec![WireValue::Bytes(b"ctr-1".to_vec())],
        },
    ));
    assert!(exception(&h.reply_for(b"clu-1")).is_none());

    let published = std::fs::read_to_string(&h.cfg.haproxy_path).unwrap();
    assert_ne!(published, baseline);
    assert!(published.contains("server ctr-1 10.2.0.7:80 weight 10"));
    assert!(published.contains("acl host_www_example_test hdr(host) -i www.example.test"));

    // a second publish on the same fqdn is refused
    h.open_session(b"sess-2", b"bob");
    h.broker.model.domains.entry(b"bob".to_vec()).or_default().insert(
        "example.test".to_string(),
        Domain {
            domain: "example.test".to_string(),
            token: None,
            user: b"bob".to_vec(),
            attempted: 0,
            global: false,
        },
    );
    h.send(msg(
        b"sess-2",
        b"clu-2",
        "publish_web",
        wire_map! {
            "domain" => "example.test",
            "subdomain" => "www.",
            "ssl" => WireValue::Null,
            "rewrite" => WireValue::Null,
            "containers" => Vec::<WireValue>::new(),
        },
    ));
    assert_eq!(
        exception(&h.reply_for(b"clu-2")),
        Some("FQDN is being used by another session")
    );

    h.send(msg(b"sess-1", b"unp-1", "unpublish_web", wire_map! { "cluster" => b"clu-1".to_vec() }));
    let restored = std::fs::read_to_string(&h.cfg.haproxy_path).unwrap();
    assert_eq!(restored, baseline);
}

#[tokio::test]
async fn heartbeat_timeout_closes_session() {
    let mut h = harness();
    h.open_session(b"sess-1", b"alice");

    // a fresh heartbeat is idempotent
    h.send(msg(b"sess-1", b"", "heartbeat", WireMap::new()));
    h.send(msg(b"sess-1", b"", "heartbeat", WireMap::new()));
    assert_eq!(h.broker.model.sessions.len(), 1);
    h.broker.check_heartbeats();
    assert_eq!(h.broker.model.sessions.len(), 1);

    // rewind the clock past the timeout
    h.broker.model.sessions.get_mut(b"sess-1".as_slice()).unwrap().last_heartbeat =
        Instant::now() - Duration::from_secs(121);
    h.broker.check_heartbeats();

    assert!(h.broker.model.sessions.is_empty());
    assert!(h.broker.model.store.sessions().unwrap().is_empty());

    // the bus was told to drop the connection
    let mut disconnected = false;
    while let Ok(item) = h.outbound.try_recv() {
        if matches!(item, Outbound::Disconnect { ref rid } if rid == b"sess-1") {
            disconnected = true;
        }
    }
    assert!(disconnected);
}

#[tokio::test]
async fn session_close_destroys_dependents() {
    let mut h = harness();
    h.connect_node(b"node-pk", b"node-rid", 2);
    h.open_session(b"sess-1", b"alice");
    h.send(msg(
        b"node-rid",
        b"dep-1",
        "dependent_container",
        wire_map! {
            "container" => b"ctr-1".to_vec(),
            "node_pk" => b"node-pk".to_vec(),
            "ip" => "10.2.0.5",
            "cookie" => WireValue::Map(wire_map! {
                "user" => b"alice".to_vec(),
                "tag" => WireValue::Null,
                "session" => b"sess-1".to_vec(),
            }),
            "volumes" => Vec::<WireValue>::new(),
        },
    ));
    assert!(h.broker.model.containers.contains(b"ctr-1"));

    h.broker.handle_bus_event(BusEvent::SessionClosed { rid: b"sess-1".to_vec() });

    assert!(h.broker.model.sessions.is_empty());
    assert!(!h.broker.model.containers.contains(b"ctr-1"));
    let (_, params, _) = h.command_named("destroy_container").await;
    assert_eq!(params.get("container").and_then(|v| v.as_bytes()), Some(b"ctr-1".as_slice()));
    assert_eq!(params.get("inform").and_then(WireValue::as_bool), Some(false));
}
