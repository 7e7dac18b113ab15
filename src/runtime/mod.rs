use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use url::{Host, Url};

use crate::error::{AdapterError, ValidationError};
use crate::types::{ContainerRecord, ContainerStats, LogLine};

pub mod docker;
pub use docker::DockerConnector;

/// Read-only view of one container engine.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Running containers, filtered to the ones eligible for DNS.
    async fn list_containers(&self) -> Result<Vec<ContainerRecord>, AdapterError>;

    async fn container_stats(&self, id: &str) -> Result<ContainerStats, AdapterError>;

    /// The last `lines` lines of stdout and stderr.
    async fn container_logs(&self, id: &str, lines: usize) -> Result<Vec<LogLine>, AdapterError>;
}

/// Builds a runtime for a target. Connecting does not touch the network;
/// only calls on the returned runtime do.
pub trait Connector: Send + Sync {
    fn connect(&self, target: &Target) -> Result<Arc<dyn ContainerRuntime>, AdapterError>;
}

/// Which engine a request is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Local,
    Remote(RemoteHost),
}

impl Target {
    /// Resolve an optional `remote_host` request parameter. Blank means local.
    pub fn from_param(remote_host: Option<&str>) -> Result<Self, ValidationError> {
        match remote_host.map(str::trim) {
            None | Some("") => Ok(Self::Local),
            Some(host) => RemoteHost::parse(host).map(Self::Remote),
        }
    }

    pub fn remote(&self) -> Option<&RemoteHost> {
        match self {
            Self::Local => None,
            Self::Remote(host) => Some(host),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Remote(host) => host.fmt(f),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Tcp,
    Http,
    Https,
}

impl Scheme {
    fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "tcp" => Some(Self::Tcp),
            "http" => Some(Self::Http),
            "https" => Some(Self::Https),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Http => "http",
            Self::Https => "https",
        }
    }

    fn default_port(self) -> u16 {
        match self {
            Self::Tcp | Self::Http => 2375,
            Self::Https => 2376,
        }
    }
}

/// A validated remote Docker Engine endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteHost {
    scheme: Scheme,
    host: String,
    port: u16,
}

impl RemoteHost {
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ValidationError::Empty);
        }
        let (scheme, rest) = raw
            .split_once("://")
            .and_then(|(scheme, rest)| Some((Scheme::from_name(scheme)?, rest)))
            .ok_or_else(|| ValidationError::UnsupportedScheme(raw.to_string()))?;

        let malformed = || ValidationError::Malformed(raw.to_string());
        let url = Url::parse(raw).map_err(|_| malformed())?;
        if !url.username().is_empty()
            || url.password().is_some()
            || url.query().is_some()
            || url.fragment().is_some()
            || !matches!(url.path(), "" | "/")
        {
            return Err(malformed());
        }

        let host = match url.host().ok_or_else(malformed)? {
            Host::Domain(name) if !name.is_empty() && !name.contains(':') => {
                name.to_ascii_lowercase()
            }
            Host::Domain(_) => return Err(malformed()),
            Host::Ipv4(addr) => addr.to_string(),
            Host::Ipv6(addr) => addr.to_string(),
        };

        // `Url` drops an explicit port equal to the well-known one (80/443)
        let port = match (url.port(), url.port_or_known_default()) {
            (Some(port), _) => port,
            (None, Some(known)) if authority_has_port(rest, known) => known,
            _ => scheme.default_port(),
        };

        Ok(Self { scheme, host, port })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for RemoteHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme.as_str(), self.authority())
    }
}

fn authority_has_port(rest: &str, port: u16) -> bool {
    rest.split(['/', '?', '#'])
        .next()
        .is_some_and(|authority| authority.ends_with(&format!(":{}", port)))
}

/// In-memory engine used by controller and API tests.
#[cfg(test)]
pub mod testing {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;
    use crate::types::{CpuStats, DiskStats, MemoryStats, NetworkStats};

    pub fn container(id: &str, name: &str, ip: Option<&str>) -> ContainerRecord {
        ContainerRecord {
            id: id.to_string(),
            name: name.to_string(),
            image: format!("{}:latest", name),
            status: "running".to_string(),
            ip_address: ip.map(|ip| ip.parse().unwrap()),
            ports: Vec::new(),
            dns_enabled: true,
            created: String::new(),
            labels: Default::default(),
        }
    }

    #[derive(Clone)]
    enum Behaviour {
        Serve(Vec<ContainerRecord>),
        Fail(AdapterError),
    }

    /// A fleet per target; unknown targets are unreachable.
    #[derive(Default)]
    pub struct StaticConnector {
        fleets: Mutex<HashMap<Target, Behaviour>>,
        pub connects: AtomicUsize,
    }

    impl StaticConnector {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn serve(&self, target: Target, containers: Vec<ContainerRecord>) {
            self.fleets.lock().insert(target, Behaviour::Serve(containers));
        }

        pub fn fail(&self, target: Target, error: AdapterError) {
            self.fleets.lock().insert(target, Behaviour::Fail(error));
        }

        pub fn unreachable(&self, target: Target) {
            let endpoint = target.to_string();
            self.fail(
                target,
                AdapterError::Unreachable {
                    endpoint,
                    reason: "connection refused".into(),
                },
            );
        }
    }

    impl Connector for StaticConnector {
        fn connect(&self, target: &Target) -> Result<Arc<dyn ContainerRuntime>, AdapterError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let behaviour = self.fleets.lock().get(target).cloned().unwrap_or_else(|| {
                Behaviour::Fail(AdapterError::Unreachable {
                    endpoint: target.to_string(),
                    reason: "no such engine".into(),
                })
            });
            Ok(Arc::new(StaticRuntime { behaviour }))
        }
    }

    struct StaticRuntime {
        behaviour: Behaviour,
    }

    impl StaticRuntime {
        fn fleet(&self) -> Result<&[ContainerRecord], AdapterError> {
            match &self.behaviour {
                Behaviour::Serve(containers) => Ok(containers),
                Behaviour::Fail(e) => Err(e.clone()),
            }
        }

        fn find(&self, id: &str) -> Result<&ContainerRecord, AdapterError> {
            self.fleet()?
                .iter()
                .find(|c| c.id == id || c.name == id)
                .ok_or_else(|| AdapterError::NotFound(id.to_string()))
        }
    }

    #[async_trait]
    impl ContainerRuntime for StaticRuntime {
        async fn list_containers(&self) -> Result<Vec<ContainerRecord>, AdapterError> {
            self.fleet().map(<[_]>::to_vec)
        }

        async fn container_stats(&self, id: &str) -> Result<ContainerStats, AdapterError> {
            let c = self.find(id)?;
            Ok(ContainerStats {
                id: c.id.clone(),
                name: c.name.clone(),
                timestamp: chrono::Utc::now(),
                cpu: CpuStats {
                    usage_percent: 1.5,
                    online_cpus: 2,
                },
                memory: MemoryStats {
                    usage: 512,
                    limit: 1024,
                    usage_percent: 50.0,
                },
                network: NetworkStats {
                    rx_bytes: 10,
                    tx_bytes: 20,
                },
                disk: DiskStats {
                    read_bytes: 0,
                    write_bytes: 0,
                },
            })
        }

        async fn container_logs(&self, id: &str, lines: usize) -> Result<Vec<LogLine>, AdapterError> {
            let c = self.find(id)?;
            Ok((0..lines.min(3))
                .map(|i| LogLine {
                    timestamp: format!("2024-01-01T00:00:0{}Z", i),
                    message: format!("{} line {}", c.name, i),
                })
                .collect())
        }
    }
}
