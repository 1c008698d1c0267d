//! A published virtual host: a set of backend containers selected by
//! HTTP Host header through the front-end proxy.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// A cluster owned by one session. `containers` holds the uuids of backend
/// containers, which must already be dependents of the same session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub uuid: Vec<u8>,
    pub domain: String,
    pub subdomain: String,
    /// TLS certificate bundle (PEM text), materialised to a per-FQDN file.
    pub ssl: Option<String>,
    /// Optional Host header rewrite applied at the proxy.
    pub rewrite: Option<String>,
    pub containers: Vec<Vec<u8>>,
}

impl Cluster {
    /// subdomain ∘ domain — unique across all live clusters.
    pub fn fqdn(&self) -> String {
        format!("{}{}", self.subdomain, self.domain)
    }

    pub fn cert_path(&self, cert_dir: &Path) -> PathBuf {
        cert_dir.join(format!("{}.ssl", self.fqdn()))
    }

    /// Write the certificate bundle file (no-op for plain-HTTP clusters).
    pub fn write_cert(&self, cert_dir: &Path) -> Result<()> {
        if let Some(bundle) = &self.ssl {
            let path = self.cert_path(cert_dir);
            fs::write(&path, bundle)
                .with_context(|| format!("writing certificate bundle: {}", path.display()))?;
        }
        Ok(())
    }

    /// Remove the certificate bundle file on cluster destruction.
    pub fn remove_cert(&self, cert_dir: &Path) {
        if self.ssl.is_some() {
            let path = self.cert_path(cert_dir);
            if let Err(e) = fs::remove_file(&path) {
                log::debug!("could not remove certificate bundle {}: {e}", path.display());
            }
        }
    }

    /// Inspection form.
    pub fn state(&self) -> serde_json::Value {
        json!({
            "fqdn": self.fqdn(),
            "ssl": self.ssl.is_some(),
            "rewrite": self.rewrite,
            "containers": self
                .containers
                .iter()
                .map(|c| String::from_utf8_lossy(c))
                .collect::<Vec<_>>(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fqdn_concatenation() {
        let cluster = Cluster {
            uuid: b"c1".to_vec(),
            domain: "example.test".into(),
            subdomain: "www.".into(),
            ssl: None,
            rewrite: None,
            containers: vec![],
        };
        assert_eq!(cluster.fqdn(), "www.example.test");
    }

    #[test]
    fn test_cert_file_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = Cluster {
            uuid: b"c1".to_vec(),
            domain: "example.test".into(),
            subdomain: "www.".into(),
            ssl: Some("-----BEGIN CERTIFICATE-----".into()),
            rewrite: None,
            containers: vec![],
        };
        cluster.write_cert(dir.path()).unwrap();
        let path = cluster.cert_path(dir.path());
        assert!(path.is_file());
        cluster.remove_cert(dir.path());
        assert!(!path.exists());
    }
}
