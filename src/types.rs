//! Data structures shared between the adapter, the store and the HTTP API.
//!
//! These types are serialised using [`serde`](https://serde.rs/) in the
//! shape the dashboard consumes.  Addresses travel as strings; a
//! container without an address is sent as `""` rather than `null`.

use std::collections::BTreeMap;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A running container as seen by the container engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    /// Engine-assigned identifier.
    pub id: String,
    /// Container name without the leading `/`; becomes the DNS label.
    pub name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, with = "optional_ip")]
    pub ip_address: Option<IpAddr>,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    #[serde(default = "default_true")]
    pub dns_enabled: bool,
    #[serde(default)]
    pub created: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub container_port: String,
    pub protocol: String,
    pub host_port: Option<String>,
}

/// A client-side `dns_enabled` decision sent along with a reload.
///
/// The dashboard posts whole container objects; only the identifying
/// fields and the flag matter here, everything else is ignored.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ContainerOverride {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    pub dns_enabled: bool,
}

/// One resolved DNS query (or a manual audit entry).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryLogEntry {
    pub timestamp: DateTime<Utc>,
    pub ip_address: String,
    pub domain: String,
}

/// Point-in-time resource usage of one container.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerStats {
    pub id: String,
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub cpu: CpuStats,
    pub memory: MemoryStats,
    pub network: NetworkStats,
    pub disk: DiskStats,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CpuStats {
    pub usage_percent: f64,
    pub online_cpus: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryStats {
    pub usage: u64,
    pub limit: u64,
    pub usage_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkStats {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiskStats {
    pub read_bytes: u64,
    pub write_bytes: u64,
}

/// One line of container output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogLine {
    pub timestamp: String,
    pub message: String,
}

fn default_true() -> bool {
    true
}

/// `Option<IpAddr>` as a plain string, with `""` standing for `None`.
mod optional_ip {
    use std::net::IpAddr;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ip: &Option<IpAddr>, s: S) -> Result<S::Ok, S::Error> {
        match ip {
            Some(ip) => s.collect_str(ip),
            None => s.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<IpAddr>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        match raw.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(s) => s.parse().map(Some).map_err(serde::de::Error::custom),
        }
    }
}
