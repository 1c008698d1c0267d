//! Framed Unix-socket transport adapter.
//!
//! Length-prefixed frames with a type byte:
//!
//! ```text
//! [u32 LE length] [u8 type] [payload: length-1 bytes]
//! ```
//!
//! The first frame on a connection must be a hello declaring the peer —
//! a node (public key + registration config) or a client session (user
//! public key, optionally resuming a previous route id). Every connection
//! is assigned a fresh random route id; all later frames are commands or
//! replies encoded as MessagePack envelopes.
//!
//! Authentication and encryption are the surrounding deployment's problem;
//! this adapter only does framing, route-id bookkeeping and lifecycle
//! notification.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

use crate::bus::{BusEvent, Message, Outbound, Rid};
use crate::wire::WireMap;

/// Maximum frame payload size (64 MB — bulk slabs can be large).
const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Frame type constants.
pub mod frame_type {
    /// Node hello (first frame of a node connection).
    pub const HELLO_NODE: u8 = 0x01;
    /// Session hello (first frame of a client connection).
    pub const HELLO_SESSION: u8 = 0x02;
    /// Command message (peer → broker).
    pub const MESSAGE: u8 = 0x03;
    /// Command message (broker → peer).
    pub const COMMAND: u8 = 0x04;
    /// Reply correlated by uuid (broker → peer).
    pub const REPLY: u8 = 0x05;
}

#[derive(Debug, Serialize, Deserialize)]
struct HelloNode {
    pk: Vec<u8>,
    config: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct HelloSession {
    user: Vec<u8>,
    resume: Option<Vec<u8>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    uuid: Vec<u8>,
    command: Vec<u8>,
    params: WireMap,
    bulk: Vec<u8>,
}

/// Encode a frame from a type byte and an already-serialized payload.
pub fn encode_frame(kind: u8, payload: &[u8]) -> Vec<u8> {
    let length = (payload.len() + 1) as u32;
    let mut buf = Vec::with_capacity(4 + 1 + payload.len());
    buf.extend_from_slice(&length.to_le_bytes());
    buf.push(kind);
    buf.extend_from_slice(payload);
    buf
}

/// Read one `(type, payload)` frame from the stream.
async fn read_frame(stream: &mut UnixStream) -> Result<(u8, Vec<u8>)> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let length = u32::from_le_bytes(header);
    if length == 0 || length > MAX_FRAME_SIZE {
        bail!("bad frame length: {length}");
    }
    let mut body = vec![0u8; length as usize];
    stream.read_exact(&mut body).await?;
    let kind = body[0];
    Ok((kind, body.split_off(1)))
}

fn fresh_rid() -> Rid {
    uuid::Uuid::new_v4().as_bytes().to_vec()
}

type WriterMap = Arc<Mutex<HashMap<Rid, mpsc::UnboundedSender<Vec<u8>>>>>;

/// Run the transport: accept connections on `socket_path`, feed decoded
/// events into `events`, and drain `outbound` back to the right peers.
pub async fn serve(
    socket_path: PathBuf,
    events: mpsc::UnboundedSender<BusEvent>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) -> Result<()> {
    let _ = std::fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("bind bus socket: {}", socket_path.display()))?;
    log::info!("bus listening on {}", socket_path.display());

    let writers: WriterMap = Arc::new(Mutex::new(HashMap::new()));

    // Outbound pump — encodes broker traffic and routes it by rid.
    let pump_writers = Arc::clone(&writers);
    tokio::spawn(async move {
        while let Some(item) = outbound.recv().await {
            match item {
                Outbound::Command { rid, command, uuid, params, bulk } => {
                    let envelope = Envelope { uuid, command, params, bulk };
                    send_to(&pump_writers, &rid, frame_type::COMMAND, &envelope);
                }
                Outbound::Reply { rid, uuid, params, bulk } => {
                    let envelope = Envelope { uuid, command: Vec::new(), params, bulk };
                    send_to(&pump_writers, &rid, frame_type::REPLY, &envelope);
                }
                Outbound::Disconnect { rid } => {
                    // Dropping the writer closes the connection task's queue.
                    pump_writers.lock().expect("writer map poisoned").remove(&rid);
                }
            }
        }
    });

    loop {
        let (stream, _) = listener.accept().await?;
        let conn_events = events.clone();
        let conn_writers = Arc::clone(&writers);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, conn_events, conn_writers).await {
                log::debug!("bus connection ended: {e}");
            }
        });
    }
}

fn send_to<T: Serialize>(writers: &WriterMap, rid: &[u8], kind: u8, envelope: &T) {
    let payload = match rmp_serde::to_vec(envelope) {
        Ok(p) => p,
        Err(e) => {
            log::warn!("could not encode outbound frame: {e}");
            return;
        }
    };
    let frame = encode_frame(kind, &payload);
    let guard = writers.lock().expect("writer map poisoned");
    match guard.get(rid) {
        Some(tx) => {
            let _ = tx.send(frame);
        }
        None => log::warn!("outbound frame for unknown rid: {}", hex::encode(rid)),
    }
}

async fn handle_connection(
    mut stream: UnixStream,
    events: mpsc::UnboundedSender<BusEvent>,
    writers: WriterMap,
) -> Result<()> {
    // First frame must identify the peer.
    let (kind, payload) = read_frame(&mut stream).await.context("reading hello frame")?;
    let rid = fresh_rid();

    enum Peer {
        Node(Vec<u8>),
        Session,
    }

    let peer = match kind {
        frame_type::HELLO_NODE => {
            let hello: HelloNode = rmp_serde::from_slice(&payload)?;
            let _ = events.send(BusEvent::NodeConnected {
                pk: hello.pk.clone(),
                rid: rid.clone(),
                config: hello.config,
            });
            Peer::Node(hello.pk)
        }
        frame_type::HELLO_SESSION => {
            let hello: HelloSession = rmp_serde::from_slice(&payload)?;
            match hello.resume {
                Some(old_rid) => {
                    let _ = events.send(BusEvent::SessionRecovered {
                        old_rid,
                        new_rid: rid.clone(),
                    });
                }
                None => {
                    let _ = events.send(BusEvent::SessionOpened {
                        rid: rid.clone(),
                        user: hello.user,
                    });
                }
            }
            Peer::Session
        }
        other => bail!("first frame was not a hello (type {other:#04x})"),
    };

    // Split writer: a dedicated task drains the queue so slow peers never
    // block frame decoding.
    let (write_tx, mut write_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    writers.lock().expect("writer map poisoned").insert(rid.clone(), write_tx);

    let (mut read_half, mut write_half) = stream.into_split();
    let writer = tokio::spawn(async move {
        while let Some(frame) = write_rx.recv().await {
            if write_half.write_all(&frame).await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    // Read loop.
    let read_result: Result<()> = async {
        loop {
            let mut header = [0u8; 4];
            if read_half.read_exact(&mut header).await.is_err() {
                return Ok(()); // orderly close
            }
            let length = u32::from_le_bytes(header);
            if length == 0 || length > MAX_FRAME_SIZE {
                bail!("bad frame length: {length}");
            }
            let mut body = vec![0u8; length as usize];
            read_half.read_exact(&mut body).await?;
            let payload = body.split_off(1);
            if body[0] != frame_type::MESSAGE {
                log::debug!("ignoring unexpected frame type {:#04x}", body[0]);
                continue;
            }
            let envelope: Envelope = rmp_serde::from_slice(&payload)?;
            let _ = events.send(BusEvent::Message(Message {
                rid: rid.clone(),
                uuid: envelope.uuid,
                command: envelope.command,
                params: envelope.params,
                bulk: envelope.bulk,
            }));
        }
    }
    .await;

    // Connection gone — unregister and notify.
    writers.lock().expect("writer map poisoned").remove(&rid);
    writer.abort();
    match peer {
        Peer::Node(pk) => {
            let _ = events.send(BusEvent::NodeDisconnected { pk });
        }
        Peer::Session => {
            let _ = events.send(BusEvent::SessionClosed { rid });
        }
    }
    read_result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_encode_shape() {
        let frame = encode_frame(frame_type::MESSAGE, b"abc");
        assert_eq!(&frame[..4], &4u32.to_le_bytes());
        assert_eq!(frame[4], frame_type::MESSAGE);
        assert_eq!(&frame[5..], b"abc");
    }

    #[test]
    fn test_envelope_roundtrip() {
        let envelope = Envelope {
            uuid: b"u".to_vec(),
            command: b"ping".to_vec(),
            params: WireMap::new(),
            bulk: vec![9, 9],
        };
        let bytes = rmp_serde::to_vec(&envelope).unwrap();
        let back: Envelope = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(back.command, b"ping");
        assert_eq!(back.bulk, vec![9, 9]);
    }

    #[test]
    fn test_fresh_rids_distinct() {
        assert_ne!(fresh_rid(), fresh_rid());
    }
}
