//! Broker-side shadow of a container running on a node.
//!
//! Authoritative container state lives on the host node; the broker keeps
//! just enough to route tunnels, police tags and destroy dependents when a
//! session goes away.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::bus::Rid;
use crate::model::tagged::Tagged;

/// The shadow record: ownership, placement and mounted volumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub user: Vec<u8>,
    pub uuid: Vec<u8>,
    pub tag: Option<Vec<u8>>,
    pub session_rid: Rid,
    pub node_pk: Vec<u8>,
    pub ip: String,
    pub volumes: Vec<Vec<u8>>,
}

impl Container {
    /// Inspection form.
    pub fn state(&self) -> serde_json::Value {
        json!({
            "ip": self.ip,
            "volumes": self.volumes.iter().map(|v| String::from_utf8_lossy(v)).collect::<Vec<_>>(),
            "node": BASE64.encode(&self.node_pk),
            "session": hex::encode(&self.session_rid),
        })
    }
}

/// Entry in the broker-wide tag index, pointing back at the owning session.
#[derive(Debug, Clone)]
pub struct ContainerRef {
    pub user: Vec<u8>,
    pub uuid: Vec<u8>,
    pub tag: Option<Vec<u8>>,
    pub session_rid: Rid,
}

impl ContainerRef {
    pub fn of(container: &Container) -> ContainerRef {
        ContainerRef {
            user: container.user.clone(),
            uuid: container.uuid.clone(),
            tag: container.tag.clone(),
            session_rid: container.session_rid.clone(),
        }
    }
}

impl Tagged for ContainerRef {
    fn user(&self) -> &[u8] {
        &self.user
    }
    fn uuid(&self) -> &[u8] {
        &self.uuid
    }
    fn tag(&self) -> Option<&[u8]> {
        self.tag.as_deref()
    }
}
