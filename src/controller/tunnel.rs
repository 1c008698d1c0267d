//! Forward tunnels onto containers.
//!
//! A tunnel is a named destination `(ip, port, timeout)` owned by one
//! session. The client multiplexes independent virtual TCP connections over
//! the bus, naming each by an opaque *remote proxy fd*; the broker keeps a
//! bijection between remote fds and local outbound sockets.
//!
//! Per proxy the life cycle is Pending → Connected → Closed. While Pending,
//! a connect worker retries the destination until the tunnel timeout;
//! forwarded payloads queue on the broker loop and flush on connect. Once
//! Connected, a writer task drains payloads to the socket and a reader task
//! returns up to 8 KiB chunks as `from_proxy` commands. An EOF or socket
//! error on a connected proxy sends the client a close notification and
//! tears the bijection down; a connect timeout tears down and answers the
//! originating message with an exception.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::broker::LoopEvent;
use crate::bus::{BusSender, Message, Rid};
use crate::constants::{PROXY_CONNECT_RETRY_MS, PROXY_READ_BUF};
use crate::wire_map;

/// The persisted part of a tunnel: destination and per-connection timeout.
/// Live proxies are process state and are not restored across restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelSpec {
    pub uuid: Vec<u8>,
    pub ip: String,
    pub port: u16,
    pub timeout: u64,
}

/// One virtual connection through a tunnel.
struct Proxy {
    pipe: Pipe,
    tasks: Vec<JoinHandle<()>>,
}

enum Pipe {
    /// Outbound connect in progress; payloads queue here.
    Pending { queued: Vec<Message> },
    /// Socket up; payloads flow through the writer task.
    Connected { tx: mpsc::UnboundedSender<Vec<u8>> },
}

impl Drop for Proxy {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// A live tunnel: spec plus the remote-fd → socket bijection.
pub struct Tunnel {
    pub spec: TunnelSpec,
    proxies: HashMap<i64, Proxy>,
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("uuid", &String::from_utf8_lossy(&self.spec.uuid))
            .field("dest", &format!("{}:{}", self.spec.ip, self.spec.port))
            .field("proxies", &self.proxies.len())
            .finish()
    }
}

impl Tunnel {
    pub fn new(spec: TunnelSpec) -> Tunnel {
        log::debug!("creating tunnel onto {}:{}", spec.ip, spec.port);
        Tunnel { spec, proxies: HashMap::new() }
    }

    pub fn has_proxy(&self, fd: i64) -> bool {
        self.proxies.contains_key(&fd)
    }

    pub fn proxy_count(&self) -> usize {
        self.proxies.len()
    }

    /// Forward a payload to the container, opening the proxy on first sight
    /// of its remote fd.
    pub fn forward(
        &mut self,
        fd: i64,
        msg: Message,
        session_rid: &Rid,
        events: &mpsc::UnboundedSender<LoopEvent>,
    ) {
        if !self.proxies.contains_key(&fd) {
            let connect = self.spawn_connect(fd, session_rid.clone(), events.clone());
            self.proxies.insert(fd, Proxy { pipe: Pipe::Pending { queued: Vec::new() }, tasks: vec![connect] });
        }

        match &mut self.proxies.get_mut(&fd).expect("proxy just ensured").pipe {
            Pipe::Pending { queued } => {
                log::debug!("proxy fd {fd} still connecting, queueing {} bytes", msg.bulk.len());
                queued.push(msg);
            }
            Pipe::Connected { tx } => {
                // A send failure means the writer task died; its EOF event is
                // already on the loop queue and will tear this proxy down.
                let _ = tx.send(msg.bulk);
            }
        }
    }

    /// The connect worker succeeded — wire up reader and writer tasks and
    /// flush anything queued while Pending.
    pub fn proxy_up(
        &mut self,
        fd: i64,
        stream: TcpStream,
        session_rid: &Rid,
        bus: &BusSender,
        events: &mpsc::UnboundedSender<LoopEvent>,
    ) {
        let Some(proxy) = self.proxies.get_mut(&fd) else {
            // Closed while the connect was in flight.
            return;
        };

        let (mut read_half, mut write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let writer_events = events.clone();
        let (writer_rid, writer_uuid) = (session_rid.clone(), self.spec.uuid.clone());
        let writer = tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                if write_half.write_all(&chunk).await.is_err() {
                    let _ = writer_events.send(LoopEvent::ProxyEof {
                        rid: writer_rid,
                        tunnel: writer_uuid,
                        proxy: fd,
                    });
                    return;
                }
            }
            let _ = write_half.shutdown().await;
        });

        let reader_events = events.clone();
        let reader_bus = bus.clone();
        let (reader_rid, reader_uuid) = (session_rid.clone(), self.spec.uuid.clone());
        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; PROXY_READ_BUF];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) | Err(_) => {
                        let _ = reader_events.send(LoopEvent::ProxyEof {
                            rid: reader_rid,
                            tunnel: reader_uuid,
                            proxy: fd,
                        });
                        return;
                    }
                    Ok(n) => {
                        reader_bus.send_cmd_full(
                            &reader_rid,
                            "from_proxy",
                            &reader_uuid,
                            wire_map! { "proxy" => fd },
                            buf[..n].to_vec(),
                        );
                    }
                }
            }
        });

        let previous = std::mem::replace(&mut proxy.pipe, Pipe::Connected { tx: tx.clone() });
        proxy.tasks.push(writer);
        proxy.tasks.push(reader);

        if let Pipe::Pending { queued } = previous {
            log::debug!("proxy fd {fd} connected, flushing {} queued forwards", queued.len());
            for msg in queued {
                let _ = tx.send(msg.bulk);
            }
        }
    }

    /// The connect worker gave up — tear down and answer the originating
    /// message with an exception.
    pub fn connect_failed(&mut self, fd: i64, bus: &BusSender) {
        let Some(proxy) = self.proxies.remove(&fd) else { return };
        let failure = format!(
            "Tunnel ({}) timed out trying to connect to: {}:{}",
            String::from_utf8_lossy(&self.spec.uuid),
            self.spec.ip,
            self.spec.port
        );
        log::info!("{failure}");
        if let Pipe::Pending { queued } = &proxy.pipe {
            if let Some(first) = queued.first() {
                bus.reply_exception(first, &failure);
            }
        }
    }

    /// EOF or error on a connected proxy's socket: notify the client and
    /// tear the bijection down. EOFs on proxies already gone are absorbed
    /// (the container rebooting closes both halves).
    pub fn proxy_eof(&mut self, fd: i64, session_rid: &Rid, bus: &BusSender) {
        let Some(proxy) = self.proxies.remove(&fd) else { return };
        if matches!(proxy.pipe, Pipe::Connected { .. }) {
            log::debug!("proxy fd {fd} closed server side, notifying client");
            bus.send_cmd_full(
                session_rid,
                "close_proxy",
                &self.spec.uuid,
                wire_map! { "tunnel" => self.spec.uuid.clone(), "proxy" => fd },
                Vec::new(),
            );
        }
    }

    /// Explicit close from the client side.
    pub fn close_proxy(&mut self, fd: i64) {
        if self.proxies.remove(&fd).is_some() {
            log::debug!("closed proxy connection remote fd {fd}");
        }
    }

    /// Close every proxy (tunnel destroyed or session gone).
    pub fn disconnect(&mut self) {
        log::debug!(
            "disconnecting all proxies for tunnel {}",
            String::from_utf8_lossy(&self.spec.uuid)
        );
        self.proxies.clear();
    }

    fn spawn_connect(
        &self,
        fd: i64,
        session_rid: Rid,
        events: mpsc::UnboundedSender<LoopEvent>,
    ) -> JoinHandle<()> {
        let ip = self.spec.ip.clone();
        let port = self.spec.port;
        let tunnel_uuid = self.spec.uuid.clone();
        let deadline = Instant::now() + Duration::from_secs(self.spec.timeout.max(1));
        tokio::spawn(async move {
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match tokio::time::timeout(remaining, TcpStream::connect((ip.as_str(), port))).await
                {
                    Ok(Ok(stream)) => {
                        let _ = events.send(LoopEvent::ProxyUp {
                            rid: session_rid,
                            tunnel: tunnel_uuid,
                            proxy: fd,
                            stream,
                        });
                        return;
                    }
                    Ok(Err(_refused)) => {
                        tokio::time::sleep(Duration::from_millis(PROXY_CONNECT_RETRY_MS)).await;
                    }
                    Err(_elapsed) => break,
                }
            }
            let _ = events.send(LoopEvent::ProxyDead {
                rid: session_rid,
                tunnel: tunnel_uuid,
                proxy: fd,
            });
        })
    }

    /// Inspection form.
    pub fn state(&self) -> serde_json::Value {
        let proxies: std::collections::BTreeMap<String, &str> = self
            .proxies
            .iter()
            .map(|(fd, proxy)| {
                let status = match proxy.pipe {
                    Pipe::Pending { .. } => "pending",
                    Pipe::Connected { .. } => "connected",
                };
                (fd.to_string(), status)
            })
            .collect();
        json!({
            "dest_ip_port": [self.spec.ip, self.spec.port],
            "proxies": proxies,
        })
    }
}
