//! Tagged mirror of a client-owned volume.
//!
//! Authoritative storage is a ZFS dataset on the broker host (see
//! `controller::volumes` for the provisioning commands); the model keeps
//! the ownership/tag mirror used for clash checks and resource offers.

use crate::model::tagged::Tagged;

#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    pub user: Vec<u8>,
    pub uuid: Vec<u8>,
    pub tag: Option<Vec<u8>>,
}

impl Volume {
    /// ZFS dataset name backing this volume.
    pub fn dataset(&self) -> String {
        format!("tf/vol-{}", String::from_utf8_lossy(&self.uuid))
    }
}

impl Tagged for Volume {
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
