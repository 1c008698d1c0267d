//! Durable projections of broker state.
//!
//! Four key/value tables backed by a single embedded sled database inside
//! the state directory: serialized sessions keyed by route id, long-term
//! forwarding routes, domain claims keyed by domain name, and the
//! per-(user, image) description cache. All writes go through the broker
//! loop; values are MessagePack blobs produced by the model types.

use std::path::Path;

use anyhow::{Context, Result};

/// The durable store: one tree per table.
pub struct Store {
    db: sled::Db,
    sessions: sled::Tree,
    forwarding: sled::Tree,
    domains: sled::Tree,
    descriptions: sled::Tree,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("sessions", &self.sessions.len())
            .field("domains", &self.domains.len())
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Open (creating if needed) the store under `state_dir/store`.
    pub fn open(state_dir: &Path) -> Result<Store> {
        let path = state_dir.join("store");
        let db = sled::open(&path)
            .with_context(|| format!("open state store: {}", path.display()))?;
        Ok(Store {
            sessions: db.open_tree("sessions")?,
            forwarding: db.open_tree("forwarding")?,
            domains: db.open_tree("domains")?,
            descriptions: db.open_tree("descriptions")?,
            db,
        })
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    // ─── sessions ──────────────────────────────────────────────────────

    pub fn put_session(&self, rid: &[u8], blob: &[u8]) -> Result<()> {
        self.sessions.insert(rid, blob)?;
        Ok(())
    }

    pub fn delete_session(&self, rid: &[u8]) -> Result<()> {
        self.sessions.remove(rid)?;
        Ok(())
    }

    pub fn sessions(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        rows(&self.sessions)
    }

    // ─── forwarding ────────────────────────────────────────────────────

    pub fn put_forwarding(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.forwarding.insert(key, value)?;
        Ok(())
    }

    pub fn delete_forwarding(&self, key: &[u8]) -> Result<()> {
        self.forwarding.remove(key)?;
        Ok(())
    }

    pub fn forwarding(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        rows(&self.forwarding)
    }

    // ─── domains ───────────────────────────────────────────────────────

    /// Insert a domain row only if the name is unclaimed. Returns `false`
    /// when a row for the domain already exists (the uniqueness violation).
    pub fn try_insert_domain(&self, domain: &str, row: &[u8]) -> Result<bool> {
        let outcome = self
            .domains
            .compare_and_swap(domain.as_bytes(), None::<&[u8]>, Some(row))?;
        Ok(outcome.is_ok())
    }

    pub fn put_domain(&self, domain: &str, row: &[u8]) -> Result<()> {
        self.domains.insert(domain.as_bytes(), row)?;
        Ok(())
    }

    pub fn delete_domain(&self, domain: &str) -> Result<()> {
        self.domains.remove(domain.as_bytes())?;
        Ok(())
    }

    pub fn domains(&self) -> Result<Vec<Vec<u8>>> {
        self.domains
            .iter()
            .map(|item| Ok(item?.1.to_vec()))
            .collect()
    }

    // ─── descriptions ──────────────────────────────────────────────────

    pub fn put_description(&self, full_id: &str, blob: &[u8]) -> Result<()> {
        self.descriptions.insert(full_id.as_bytes(), blob)?;
        Ok(())
    }

    pub fn descriptions(&self) -> Result<Vec<(String, Vec<u8>)>> {
        self.descriptions
            .iter()
            .map(|item| {
                let (k, v) = item?;
                Ok((String::from_utf8_lossy(&k).into_owned(), v.to_vec()))
            })
            .collect()
    }
}

fn rows(tree: &sled::Tree) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    tree.iter()
        .map(|item| {
            let (k, v) = item?;
            Ok((k.to_vec(), v.to_vec()))
        })
        .collect()
}
