//! Underlay topology tracking and firewall programming.
//!
//! Every node that has reported an external IP contributes a
//! `(subnet_id, external_ip)` pair; the broker itself holds subnet 1. The
//! driver diffs the live pair set against what was last applied and installs
//! or retracts the matching per-subnet firewall rules. Firewall commands are
//! best-effort: a missing or unwilling `iptables` is logged and ignored so
//! the broker keeps running on development hosts.

use std::collections::HashSet;
use std::process::{Command, Stdio};

/// One topology entry: (subnet id as decimal text, external IP).
pub type TopologyPair = (String, String);

/// Tracks the currently applied pair set and produces deltas.
#[derive(Debug, Default)]
pub struct TopologyDriver {
    applied: HashSet<TopologyPair>,
}

impl TopologyDriver {
    pub fn new() -> TopologyDriver {
        TopologyDriver::default()
    }

    /// Diff `live` against the applied set. Returns `(added, removed)`
    /// pairs and updates the applied set to `live`.
    pub fn delta(&mut self, live: &[TopologyPair]) -> (Vec<TopologyPair>, Vec<TopologyPair>) {
        let live_set: HashSet<TopologyPair> = live.iter().cloned().collect();
        let added: Vec<TopologyPair> = live_set.difference(&self.applied).cloned().collect();
        let removed: Vec<TopologyPair> = self.applied.difference(&live_set).cloned().collect();
        self.applied = live_set;
        (added, removed)
    }

    pub fn applied(&self) -> &HashSet<TopologyPair> {
        &self.applied
    }
}

/// Install (or retract) the allow rule for a node subnet's /16.
pub fn allow_incoming_from_subnet(subnet_id: &str, retract: bool) {
    let rule = format!("10.{subnet_id}.0.0/16");
    let op = if retract { "-D" } else { "-I" };
    run_iptables(&[op, "INPUT", "-s", &rule, "-j", "ACCEPT"]);
}

/// Baseline: drop underlay-facing incoming traffic (retract on shutdown).
pub fn drop_incoming_from_underlay(retract: bool) {
    let op = if retract { "-D" } else { "-A" };
    run_iptables(&[op, "INPUT", "-s", "10.0.0.0/8", "-j", "DROP"]);
}

fn run_iptables(args: &[&str]) {
    match Command::new("iptables")
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(status) if status.success() => {}
        Ok(status) => log::warn!("iptables {} exited with {status}", args.join(" ")),
        Err(e) => log::warn!("could not run iptables: {e}"),
    }
}

/// The broker's own externally reachable IP: first address reported by
/// `hostname -I`, falling back to loopback when unavailable.
pub fn local_external_ip() -> String {
    let fallback = || {
        log::warn!("could not determine local external ip, using loopback");
        "127.0.0.1".to_string()
    };
    match Command::new("hostname").arg("-I").output() {
        Ok(output) if output.status.success() => {
            String::from_utf8_lossy(&output.stdout)
                .split_whitespace()
                .next()
                .map(str::to_string)
                .unwrap_or_else(fallback)
        }
        _ => fallback(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(subnet: &str, ip: &str) -> TopologyPair {
        (subnet.to_string(), ip.to_string())
    }

    #[test]
    fn test_delta_from_empty() {
        let mut driver = TopologyDriver::new();
        let live = vec![pair("1", "198.51.100.1"), pair("2", "203.0.113.5")];
        let (added, removed) = driver.delta(&live);
        assert_eq!(added.len(), 2);
        assert!(removed.is_empty());
    }

    #[test]
    fn test_delta_reproduces_live_set() {
        let mut driver = TopologyDriver::new();
        driver.delta(&[pair("1", "198.51.100.1"), pair("2", "203.0.113.5")]);
        let before = driver.applied().clone();

        let live = vec![pair("1", "198.51.100.1"), pair("3", "192.0.2.9")];
        let (added, removed) = driver.delta(&live);

        // applied' = applied - removed + added = live
        let mut reconstructed = before;
        for r in &removed {
            reconstructed.remove(r);
        }
        for a in &added {
            reconstructed.insert(a.clone());
        }
        assert_eq!(reconstructed, live.into_iter().collect());
        assert_eq!(driver.applied(), &reconstructed);
    }

    #[test]
    fn test_changed_ip_is_remove_plus_add() {
        let mut driver = TopologyDriver::new();
        driver.delta(&[pair("2", "203.0.113.5")]);
        let (added, removed) = driver.delta(&[pair("2", "203.0.113.99")]);
        assert_eq!(added, vec![pair("2", "203.0.113.99")]);
        assert_eq!(removed, vec![pair("2", "203.0.113.5")]);
    }

    #[test]
    fn test_no_change_no_delta() {
        let mut driver = TopologyDriver::new();
        let live = vec![pair("2", "203.0.113.5")];
        driver.delta(&live);
        let (added, removed) = driver.delta(&live);
        assert!(added.is_empty());
        assert!(removed.is_empty());
    }
}
