//! Per-client resource ownership.
//!
//! A session scopes everything one connected client has created: dependent
//! containers, tunnels and published clusters. Sessions are persisted after
//! every owned-resource mutation and recovered (under a possibly new route
//! id) when the broker restarts; tunnels come back as bare destination
//! descriptors with no live sockets.

use std::time::Instant;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;

use crate::bus::Rid;
use crate::controller::tunnel::{Tunnel, TunnelSpec};
use crate::model::cluster::Cluster;
use crate::model::container::Container;

/// One connected (or recoverable) client.
pub struct Session {
    pub rid: Rid,
    /// Owning user's public key.
    pub user: Vec<u8>,
    pub containers: HashMap<Vec<u8>, Container>,
    pub tunnels: HashMap<Vec<u8>, Tunnel>,
    pub clusters: HashMap<Vec<u8>, Cluster>,
    pub last_heartbeat: Instant,
}

/// Durable form of a session.
#[derive(Debug, Serialize, Deserialize)]
struct SessionBlob {
    user: Vec<u8>,
    containers: Vec<Container>,
    tunnels: Vec<TunnelSpec>,
    clusters: Vec<Cluster>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("rid", &hex::encode(&self.rid))
            .field("containers", &self.containers.len())
            .field("tunnels", &self.tunnels.len())
            .field("clusters", &self.clusters.len())
            .finish()
    }
}

impl Session {
    pub fn new(rid: Rid, user: Vec<u8>) -> Session {
        log::debug!("creating session rid {}", hex::encode(&rid));
        Session {
            rid,
            user,
            containers: HashMap::new(),
            tunnels: HashMap::new(),
            clusters: HashMap::new(),
            last_heartbeat: Instant::now(),
        }
    }

    /// Serialize for the durable store. Opaque identifiers are preserved
    /// verbatim; tunnels contribute only their destination descriptors.
    pub fn blob(&self) -> Result<Vec<u8>> {
        let blob = SessionBlob {
            user: self.user.clone(),
            containers: self.containers.values().cloned().collect(),
            tunnels: self.tunnels.values().map(|t| t.spec.clone()).collect(),
            clusters: self.clusters.values().cloned().collect(),
        };
        Ok(rmp_serde::to_vec(&blob)?)
    }

    /// Rebuild from a durable blob under the stored route id.
    pub fn from_blob(rid: Rid, blob: &[u8]) -> Result<Session> {
        log::info!("recovering session {}", hex::encode(&rid));
        let blob: SessionBlob = rmp_serde::from_slice(blob).context("decoding session blob")?;
        let mut sess = Session::new(rid, blob.user);
        for container in blob.containers {
            log::info!("...dependent container {}", String::from_utf8_lossy(&container.uuid));
            sess.containers.insert(container.uuid.clone(), container);
        }
        for spec in blob.tunnels {
            log::info!("...persisted tunnel {}", String::from_utf8_lossy(&spec.uuid));
            sess.tunnels.insert(spec.uuid.clone(), Tunnel::new(spec));
        }
        for cluster in blob.clusters {
            log::info!("...persisted cluster {}", String::from_utf8_lossy(&cluster.uuid));
            sess.clusters.insert(cluster.uuid.clone(), cluster);
        }
        Ok(sess)
    }

    /// Inspection form.
    pub fn state(&self) -> serde_json::Value {
        json!({
            "pk": base64_pk(&self.user),
            "since_heartbeat": self.last_heartbeat.elapsed().as_secs_f64(),
            "containers": self
                .containers
                .iter()
                .map(|(uuid, c)| (String::from_utf8_lossy(uuid).into_owned(), c.state()))
                .collect::<serde_json::Map<String, serde_json::Value>>(),
            "tunnels": self
                .tunnels
                .iter()
                .map(|(uuid, t)| (String::from_utf8_lossy(uuid).into_owned(), t.state()))
                .collect::<serde_json::Map<String, serde_json::Value>>(),
            "clusters": self
                .clusters
                .iter()
                .map(|(uuid, c)| (String::from_utf8_lossy(uuid).into_owned(), c.state()))
                .collect::<serde_json::Map<String, serde_json::Value>>(),
        })
    }
}

fn base64_pk(pk: &[u8]) -> String {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    STANDARD.encode(pk)
}
