//! Broker-side record of a connected worker node.

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::json;

use crate::bus::Rid;
use crate::wire::{WireMap, WireValue};

/// Performance counters as held broker-side (cpu already scaled by the
/// node's passmarks weighting, memory in MiB).
#[derive(Debug, Clone, PartialEq)]
pub struct PerfCounters {
    pub cpu: i64,
    pub memory: i64,
    pub paging: i64,
    pub ave_start_time: f64,
}

impl Default for PerfCounters {
    fn default() -> Self {
        Self { cpu: 1000, memory: 1000, paging: 0, ave_start_time: 0.0 }
    }
}

/// Registration record delivered by the identity store when a node connects.
#[derive(Debug, Deserialize)]
struct NodeConfig {
    subnet_id: u32,
    #[serde(default = "default_passmarks")]
    passmarks: i64,
}

fn default_passmarks() -> i64 {
    10000
}

/// A connected node: stable public key, its live route id, subnet and
/// performance state.
#[derive(Debug)]
pub struct Node {
    pub pk: Vec<u8>,
    pub rid: Rid,
    pub subnet_id: u32,
    pub passmarks: i64,
    pub external_ip: Option<String>,
    pub instance_id: Option<String>,
    pub perf: PerfCounters,
}

impl Node {
    /// Build from the registration config (JSON: `subnet_id`, optional
    /// `passmarks`).
    pub fn from_config(pk: Vec<u8>, rid: Rid, config: &str) -> Result<Node> {
        let parsed: NodeConfig =
            serde_json::from_str(config).context("parsing node registration config")?;
        Ok(Node {
            pk,
            rid,
            subnet_id: parsed.subnet_id,
            passmarks: parsed.passmarks,
            external_ip: None,
            instance_id: None,
            perf: PerfCounters::default(),
        })
    }

    /// Replace the perf counters from a raw stats map as sent by the node.
    ///
    /// Scaling: cpu percent × passmarks / 100, memory bytes → MiB.
    pub fn update_stats(&mut self, raw: &WireMap) -> Result<()> {
        let cpu = stat(raw, "cpu")?;
        let memory = stat(raw, "memory")?;
        let paging = stat(raw, "paging")?;
        let ave_start_time = stat(raw, "ave_start_time")?;
        self.perf = PerfCounters {
            cpu: (cpu * self.passmarks as f64 * 0.01) as i64,
            memory: (memory as i64) / 1024,
            paging: paging as i64,
            ave_start_time,
        };
        Ok(())
    }

    /// HAProxy server weight for containers hosted on this node.
    pub fn weight(&self) -> i64 {
        self.perf.cpu / 100 + 10
    }

    /// Perf counters in wire form, for resource offers.
    pub fn perf_wire(&self) -> WireValue {
        WireValue::Map(crate::wire_map! {
            "cpu" => self.perf.cpu,
            "memory" => self.perf.memory,
            "paging" => self.perf.paging,
            "ave_start_time" => self.perf.ave_start_time as i64,
        })
    }

    /// Inspection form.
    pub fn state(&self) -> serde_json::Value {
        json!({
            "subnet_id": self.subnet_id,
            "external_ip": self.external_ip,
            "instance_id": self.instance_id,
            "pk": BASE64.encode(&self.pk),
            "weight": self.weight(),
            "perf_counters": {
                "cpu": self.perf.cpu,
                "memory": self.perf.memory,
                "paging": self.perf.paging,
                "ave_start_time": self.perf.ave_start_time,
            },
        })
    }
}

fn stat(raw: &WireMap, key: &str) -> Result<f64> {
    raw.get(key)
        .and_then(WireValue::as_f64)
        .with_context(|| format!("stats map missing numeric '{key}'"))
}
