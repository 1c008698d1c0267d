//! Message-bus boundary types.
//!
//! The transport delivers framed messages tagged with a *route id* (rid)
//! identifying the sender's connection — either a worker node or a client
//! session. The broker consumes [`BusEvent`]s and enqueues [`Outbound`]
//! traffic through a clonable [`BusSender`]; worker tasks hold their own
//! `BusSender` clone so replies produced off the loop still flow through a
//! single ordered queue.

pub mod transport;

use std::collections::BTreeMap;

use tokio::sync::mpsc;

use crate::wire::{WireMap, WireValue};

/// Opaque per-connection route identifier assigned by the transport.
pub type Rid = Vec<u8>;

/// One inbound command message.
#[derive(Debug, Clone)]
pub struct Message {
    /// Route id of the sending connection.
    pub rid: Rid,
    /// Correlation uuid for the reply (may be empty when none is expected).
    pub uuid: Vec<u8>,
    /// Command name.
    pub command: Vec<u8>,
    /// Parameter map.
    pub params: WireMap,
    /// Bulk binary payload.
    pub bulk: Vec<u8>,
}

impl Message {
    pub fn param(&self, key: &str) -> Option<&WireValue> {
        self.params.get(key)
    }

    /// Bytes param (byte string or text), `None` when absent or null.
    pub fn bytes_param(&self, key: &str) -> Option<Vec<u8>> {
        self.params.get(key).and_then(|v| v.as_bytes()).map(<[u8]>::to_vec)
    }

    pub fn str_param(&self, key: &str) -> Option<String> {
        self.params.get(key).and_then(|v| v.as_str()).map(str::to_string)
    }

    pub fn int_param(&self, key: &str) -> Option<i64> {
        self.params.get(key).and_then(WireValue::as_i64)
    }

    pub fn bool_param(&self, key: &str) -> Option<bool> {
        self.params.get(key).and_then(WireValue::as_bool)
    }

    pub fn command_name(&self) -> String {
        String::from_utf8_lossy(&self.command).into_owned()
    }
}

/// Connection lifecycle and message delivery, as reported by the transport.
#[derive(Debug)]
pub enum BusEvent {
    /// A framed command message arrived.
    Message(Message),
    /// A node authenticated; `config` is its registration record (JSON).
    NodeConnected { pk: Vec<u8>, rid: Rid, config: String },
    /// A node's connection dropped.
    NodeDisconnected { pk: Vec<u8> },
    /// A fresh client session connected.
    SessionOpened { rid: Rid, user: Vec<u8> },
    /// A client reconnected to a persisted session under a new rid.
    SessionRecovered { old_rid: Rid, new_rid: Rid },
    /// A client connection dropped.
    SessionClosed { rid: Rid },
    /// The transport learned a long-term forwarding route.
    ForwardingLearned { key: Vec<u8>, value: Vec<u8> },
    /// The transport evicted a long-term forwarding route.
    ForwardingForgotten { key: Vec<u8> },
}

/// Outbound traffic handed back to the transport.
#[derive(Debug)]
pub enum Outbound {
    /// A command pushed to a node or session.
    Command {
        rid: Rid,
        command: Vec<u8>,
        uuid: Vec<u8>,
        params: WireMap,
        bulk: Vec<u8>,
    },
    /// A reply correlated to an inbound message's uuid.
    Reply {
        rid: Rid,
        uuid: Vec<u8>,
        params: WireMap,
        bulk: Vec<u8>,
    },
    /// Forcibly drop the connection behind a rid.
    Disconnect { rid: Rid },
}

/// Clonable handle enqueuing outbound bus traffic.
#[derive(Debug, Clone)]
pub struct BusSender {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl BusSender {
    pub fn new(tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { tx }
    }

    /// Create a sender plus the receiving end (used by transports and tests).
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send_cmd(&self, rid: &[u8], command: &str, params: WireMap) {
        self.send_cmd_full(rid, command, &[], params, Vec::new());
    }

    /// Send a command carrying an explicit uuid and bulk payload.
    pub fn send_cmd_full(&self, rid: &[u8], command: &str, uuid: &[u8], params: WireMap, bulk: Vec<u8>) {
        let _ = self.tx.send(Outbound::Command {
            rid: rid.to_vec(),
            command: command.as_bytes().to_vec(),
            uuid: uuid.to_vec(),
            params,
            bulk,
        });
    }

    pub fn reply(&self, msg: &Message, params: WireMap) {
        self.reply_raw(&msg.rid, &msg.uuid, params);
    }

    pub fn reply_raw(&self, rid: &[u8], uuid: &[u8], params: WireMap) {
        let _ = self.tx.send(Outbound::Reply {
            rid: rid.to_vec(),
            uuid: uuid.to_vec(),
            params,
            bulk: Vec::new(),
        });
    }

    /// Failure reply: a human-readable message under the `exception` key.
    pub fn reply_exception(&self, msg: &Message, text: &str) {
        self.reply_exception_raw(&msg.rid, &msg.uuid, text);
    }

    pub fn reply_exception_raw(&self, rid: &[u8], uuid: &[u8], text: &str) {
        let mut params = BTreeMap::new();
        params.insert("exception".to_string(), WireValue::Str(text.to_string()));
        self.reply_raw(rid, uuid, params);
    }

    pub fn disconnect(&self, rid: &[u8]) {
        let _ = self.tx.send(Outbound::Disconnect { rid: rid.to_vec() });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire_map;

    #[test]
    fn test_reply_exception_shape() {
        let (bus, mut rx) = BusSender::channel();
        let msg = Message {
            rid: b"r1".to_vec(),
            uuid: b"u1".to_vec(),
            command: b"ping".to_vec(),
            params: WireMap::new(),
            bulk: Vec::new(),
        };
        bus.reply_exception(&msg, "nope");
        match rx.try_recv().unwrap() {
            Outbound::Reply { rid, uuid, params, .. } => {
                assert_eq!(rid, b"r1");
                assert_eq!(uuid, b"u1");
                assert_eq!(params.get("exception").and_then(|v| v.as_str()), Some("nope"));
            }
            other => panic!("unexpected outbound: {other:?}"),
        }
    }

    #[test]
    fn test_send_cmd_full_carries_bulk() {
        let (bus, mut rx) = BusSender::channel();
        bus.send_cmd_full(b"r2", "from_proxy", b"tun", wire_map! { "proxy" => 7i64 }, vec![1, 2, 3]);
        match rx.try_recv().unwrap() {
            Outbound::Command { command, uuid, bulk, .. } => {
                assert_eq!(command, b"from_proxy");
                assert_eq!(uuid, b"tun");
                assert_eq!(bulk, vec![1, 2, 3]);
            }
            other => panic!("unexpected outbound: {other:?}"),
        }
    }
}
