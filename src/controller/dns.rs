//! TXT record lookups for the domain ownership proof.
//!
//! The lookup runs on a worker task, never on the broker loop; the trait
//! boundary lets tests substitute a canned resolver.

use anyhow::{Context, Result};
use async_trait::async_trait;
use hickory_resolver::TokioResolver;

/// Resolve the strings of every TXT record under a name.
#[async_trait]
pub trait TokenLookup: Send + Sync {
    /// Returns one entry per TXT record, each holding that record's strings.
    async fn txt(&self, name: &str) -> Result<Vec<Vec<String>>>;
}

/// System-configured resolver.
pub struct SystemResolver {
    resolver: TokioResolver,
}

impl SystemResolver {
    pub fn new() -> Result<SystemResolver> {
        let resolver = TokioResolver::builder_tokio()
            .context("reading system resolver configuration")?
            .build();
        Ok(SystemResolver { resolver })
    }
}

#[async_trait]
impl TokenLookup for SystemResolver {
    async fn txt(&self, name: &str) -> Result<Vec<Vec<String>>> {
        let lookup = self
            .resolver
            .txt_lookup(name.to_string())
            .await
            .with_context(|| format!("TXT lookup for {name}"))?;
        Ok(lookup
            .iter()
            .map(|record| {
                record
                    .txt_data()
                    .iter()
                    .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
                    .collect()
            })
            .collect())
    }
}
