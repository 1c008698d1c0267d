//! DNS domains claimed (or being claimed) by users.
//!
//! Ownership is proven in two phases: prepare allocates a token the user
//! places in a TXT record, claim verifies it. A domain whose token is null
//! has completed the proof; a pending domain times out six hours after the
//! first attempt.

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::constants::DOMAIN_PENDING_TIMEOUT_SECS;

/// A domain record, persisted in the `domains` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Domain {
    pub domain: String,
    /// Ownership token; `None` once validated.
    pub token: Option<Vec<u8>>,
    pub user: Vec<u8>,
    /// Epoch seconds of the first claim attempt.
    pub attempted: i64,
    pub global: bool,
}

impl Domain {
    pub fn pending(domain: String, token: Vec<u8>, user: Vec<u8>) -> Domain {
        Domain {
            domain,
            token: Some(token),
            user,
            attempted: chrono::Utc::now().timestamp(),
            global: false,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.token.is_none()
    }

    pub fn mark_valid(&mut self) {
        self.token = None;
    }

    /// A pending claim older than the window has timed out.
    pub fn timed_out(&self, now: i64) -> bool {
        !self.is_valid() && now - self.attempted > DOMAIN_PENDING_TIMEOUT_SECS
    }

    /// TXT record name the token must appear under.
    pub fn token_record(domain: &str) -> String {
        format!("tf-token.{domain}")
    }

    pub fn to_row(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_row(row: &[u8]) -> Result<Domain> {
        Ok(rmp_serde::from_slice(row)?)
    }

    /// Inspection form.
    pub fn state(&self) -> serde_json::Value {
        json!({
            "user": BASE64.encode(&self.user),
            "global": self.global,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validity_follows_token() {
        let mut dom = Domain::pending("x.test".into(), b"tok".to_vec(), b"alice".to_vec());
        assert!(!dom.is_valid());
        dom.mark_valid();
        assert!(dom.is_valid());
    }

    #[test]
    fn test_pending_timeout_window() {
        let dom = Domain::pending("x.test".into(), b"tok".to_vec(), b"alice".to_vec());
        let now = dom.attempted;
        assert!(!dom.timed_out(now + DOMAIN_PENDING_TIMEOUT_SECS));
        assert!(dom.timed_out(now + DOMAIN_PENDING_TIMEOUT_SECS + 1));

        // a validated domain never times out
        let mut valid = dom.clone();
        valid.mark_valid();
        assert!(!valid.timed_out(now + DOMAIN_PENDING_TIMEOUT_SECS * 2));
    }

    #[test]
    fn test_row_roundtrip() {
        let dom = Domain::pending("x.test".into(), b"tok".to_vec(), b"alice".to_vec());
        let row = dom.to_row().unwrap();
        assert_eq!(Domain::from_row(&row).unwrap(), dom);
    }
}
