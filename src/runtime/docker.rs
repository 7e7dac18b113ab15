use super::{Connector, ContainerRuntime, Scheme, Target};
use crate::error::AdapterError;
use crate::types::{
    ContainerRecord, ContainerStats, CpuStats, DiskStats, LogLine, MemoryStats, NetworkStats,
    PortMapping,
};
use async_trait::async_trait;
use bollard::container::{ListContainersOptions, LogOutput, LogsOptions, Stats, StatsOptions};
use bollard::models::ContainerSummary;
use bollard::system::EventsOptions;
use bollard::{Docker, API_DEFAULT_VERSION};
use chrono::{DateTime, Utc};
use futures_util::stream::{StreamExt, TryStreamExt};
use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

/// Label that opts a container out of DNS when set to `false`.
const ENABLE_LABEL: &str = "subdomain.enabled";

/// Creates bollard clients for local and remote engines.
#[derive(Debug, Clone)]
pub struct DockerConnector {
    network_name: Option<String>,
    skip_containers: Arc<[String]>,
    timeout: Duration,
    cert_path: Option<PathBuf>,
}

impl DockerConnector {
    pub fn new(
        network_name: Option<String>,
        skip_containers: Vec<String>,
        timeout: Duration,
        cert_path: Option<PathBuf>,
    ) -> Self {
        Self {
            network_name,
            skip_containers: skip_containers.into(),
            timeout,
            cert_path,
        }
    }

    fn client(&self, target: &Target) -> Result<Docker, AdapterError> {
        let endpoint = target.to_string();
        let docker = match target {
            // This handles unix socket on Linux.
            Target::Local => {
                Docker::connect_with_local_defaults().map_err(|e| classify(&endpoint, e))?
            }
            Target::Remote(host) if host.scheme() == Scheme::Https => {
                let dir = self.cert_path.as_ref().ok_or_else(|| {
                    AdapterError::Tls(format!(
                        "{} needs docker_cert_path with ca.pem, cert.pem and key.pem",
                        endpoint
                    ))
                })?;
                Docker::connect_with_ssl(
                    &host.authority(),
                    &dir.join("key.pem"),
                    &dir.join("cert.pem"),
                    &dir.join("ca.pem"),
                    self.timeout.as_secs(),
                    API_DEFAULT_VERSION,
                )
                .map_err(|e| AdapterError::Tls(e.to_string()))?
            }
            Target::Remote(host) => Docker::connect_with_http(
                &host.authority(),
                self.timeout.as_secs(),
                API_DEFAULT_VERSION,
            )
            .map_err(|e| classify(&endpoint, e))?,
        };

        Ok(docker.with_timeout(self.timeout))
    }

    /// Watch engine lifecycle events and signal `notify` whenever a
    /// container starts or stops. Reconnects on stream failure until the
    /// receiver is dropped.
    pub async fn watch(&self, target: Target, notify: mpsc::Sender<String>) {
        loop {
            let docker = match self.client(&target) {
                Ok(d) => d,
                Err(e) => {
                    error!("Failed to connect to Docker at {}: {}. Retrying in 5s...", target, e);
                    sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };

            let opts = EventsOptions::<String> {
                filters: [
                    ("type", ["container"].as_slice()),
                    ("event", ["start", "die", "kill", "stop"].as_slice()),
                ]
                .iter()
                .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
                .collect(),
                ..Default::default()
            };

            let mut stream = docker.events(Some(opts));

            info!("Listening for Docker events on {}...", target);
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(event) => {
                        let action = event.action.unwrap_or_default();
                        let name = event
                            .actor
                            .and_then(|actor| {
                                actor
                                    .attributes
                                    .and_then(|attrs| attrs.get("name").cloned())
                                    .or(actor.id)
                            })
                            .unwrap_or_default();
                        debug!("Container event: {} for {}", action, name);

                        if notify.send(name).await.is_err() {
                            info!("Event receiver closed, stopping Docker watch");
                            return;
                        }
                    }
                    Err(e) => {
                        error!("Error in Docker event stream: {}", e);
                        break; // Break inner loop to reconnect
                    }
                }
            }

            warn!("Docker event stream ended. Reconnecting in 2s...");
            sleep(Duration::from_secs(2)).await;
        }
    }
}

impl Connector for DockerConnector {
    fn connect(&self, target: &Target) -> Result<Arc<dyn ContainerRuntime>, AdapterError> {
        Ok(Arc::new(DockerRuntime {
            docker: self.client(target)?,
            endpoint: target.to_string(),
            network_name: self.network_name.clone(),
            skip_containers: Arc::clone(&self.skip_containers),
        }))
    }
}

pub struct DockerRuntime {
    docker: Docker,
    endpoint: String,
    network_name: Option<String>,
    skip_containers: Arc<[String]>,
}

impl DockerRuntime {
    fn error(&self, id: Option<&str>, e: bollard::errors::Error) -> AdapterError {
        match (classify(&self.endpoint, e), id) {
            (AdapterError::NotFound(_), Some(id)) => AdapterError::NotFound(id.to_string()),
            (other, _) => other,
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_containers(&self) -> Result<Vec<ContainerRecord>, AdapterError> {
        let opts = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(opts))
            .await
            .map_err(|e| self.error(None, e))?;

        let records: Vec<ContainerRecord> = containers
            .into_iter()
            .filter_map(|c| summary_to_record(c, self.network_name.as_deref()))
            .filter(|c| !should_skip(c, &self.skip_containers))
            .collect();
        debug!("{} listed {} eligible containers", self.endpoint, records.len());
        Ok(records)
    }

    async fn container_stats(&self, id: &str) -> Result<ContainerStats, AdapterError> {
        let opts = StatsOptions {
            stream: false,
            one_shot: false,
        };
        let mut samples: Vec<Stats> = self
            .docker
            .stats(id, Some(opts))
            .take(1)
            .try_collect()
            .await
            .map_err(|e| self.error(Some(id), e))?;
        let stats = samples
            .pop()
            .ok_or_else(|| AdapterError::Malformed(format!("no stats sample for {}", id)))?;

        let name = stats.name.trim_start_matches('/').to_string();
        Ok(compute_stats(id, name, &ResourceSample::from(&stats), Utc::now()))
    }

    async fn container_logs(&self, id: &str, lines: usize) -> Result<Vec<LogLine>, AdapterError> {
        let opts = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            timestamps: true,
            tail: lines.to_string(),
            ..Default::default()
        };
        let output: Vec<LogOutput> = self
            .docker
            .logs(id, Some(opts))
            .try_collect()
            .await
            .map_err(|e| self.error(Some(id), e))?;

        let text: String = output.iter().map(|chunk| chunk.to_string()).collect();
        Ok(parse_log_lines(&text))
    }
}

fn classify(endpoint: &str, e: bollard::errors::Error) -> AdapterError {
    use bollard::errors::Error;

    match e {
        Error::DockerResponseServerError {
            status_code: 404,
            message,
        } => AdapterError::NotFound(message),
        Error::DockerResponseServerError {
            status_code,
            message,
        } => AdapterError::Engine {
            status: status_code,
            message,
        },
        Error::RequestTimeoutError => AdapterError::Timeout {
            endpoint: endpoint.to_string(),
        },
        e @ (Error::JsonDataError { .. } | Error::JsonSerdeError { .. }) => {
            AdapterError::Malformed(e.to_string())
        }
        other => AdapterError::Unreachable {
            endpoint: endpoint.to_string(),
            reason: other.to_string(),
        },
    }
}

fn summary_to_record(summary: ContainerSummary, network_name: Option<&str>) -> Option<ContainerRecord> {
    let id = summary.id.clone()?;
    let name = summary
        .names
        .as_ref()
        .and_then(|n| n.first())
        .map(|n| n.trim_start_matches('/').to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| id.clone());

    let ports = summary
        .ports
        .as_deref()
        .unwrap_or_default()
        .iter()
        // Only ports actually published on the host
        .filter_map(|p| {
            let host_port = p.public_port?;
            let protocol = p
                .typ
                .as_ref()
                .map(|t| t.to_string())
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| "tcp".to_string());
            Some(PortMapping {
                container_port: p.private_port.to_string(),
                protocol,
                host_port: Some(host_port.to_string()),
            })
        })
        .collect();

    let created = summary
        .created
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .map(|t| t.to_rfc3339())
        .unwrap_or_default();

    Some(ContainerRecord {
        ip_address: get_ip_for_network(&summary, network_name),
        id,
        name,
        image: summary.image.unwrap_or_default(),
        status: summary.state.unwrap_or_default(),
        ports,
        dns_enabled: true,
        created,
        labels: summary
            .labels
            .map(|l| l.into_iter().collect::<BTreeMap<_, _>>())
            .unwrap_or_default(),
    })
}

fn should_skip(record: &ContainerRecord, skip_containers: &[String]) -> bool {
    if skip_containers.iter().any(|s| s == &record.name) {
        return true;
    }
    record
        .labels
        .get(ENABLE_LABEL)
        .is_some_and(|v| v.eq_ignore_ascii_case("false"))
}

/// Address on `network_name` if given, else on the first network by name.
fn get_ip_for_network(summary: &ContainerSummary, network_name: Option<&str>) -> Option<IpAddr> {
    let networks = summary.network_settings.as_ref()?.networks.as_ref()?;
    let net = match network_name {
        Some(name) => networks.get(name)?,
        None => networks.iter().min_by(|a, b| a.0.cmp(b.0))?.1,
    };
    [&net.ip_address, &net.global_ipv6_address]
        .into_iter()
        .flatten()
        .find_map(|ip| ip.parse().ok())
}

/// The counters one stats sample contributes.
#[derive(Debug, Clone, Default, PartialEq)]
struct ResourceSample {
    cpu_total: u64,
    precpu_total: u64,
    system_cpu: u64,
    presystem_cpu: u64,
    online_cpus: u64,
    memory_usage: u64,
    memory_limit: u64,
    rx_bytes: u64,
    tx_bytes: u64,
    read_bytes: u64,
    write_bytes: u64,
}

impl From<&Stats> for ResourceSample {
    fn from(stats: &Stats) -> Self {
        let online_cpus = stats.cpu_stats.online_cpus.unwrap_or_else(|| {
            stats
                .cpu_stats
                .cpu_usage
                .percpu_usage
                .as_ref()
                .map_or(1, |v| v.len().max(1) as u64)
        });

        let (rx_bytes, tx_bytes) = stats
            .networks
            .iter()
            .flat_map(|n| n.values())
            .fold((0, 0), |(rx, tx), n| (rx + n.rx_bytes, tx + n.tx_bytes));

        let (read_bytes, write_bytes) = stats
            .blkio_stats
            .io_service_bytes_recursive
            .iter()
            .flatten()
            .fold((0, 0), |(r, w), entry| match entry.op.to_ascii_lowercase().as_str() {
                "read" => (r + entry.value, w),
                "write" => (r, w + entry.value),
                _ => (r, w),
            });

        Self {
            cpu_total: stats.cpu_stats.cpu_usage.total_usage,
            precpu_total: stats.precpu_stats.cpu_usage.total_usage,
            system_cpu: stats.cpu_stats.system_cpu_usage.unwrap_or(0),
            presystem_cpu: stats.precpu_stats.system_cpu_usage.unwrap_or(0),
            online_cpus,
            memory_usage: stats.memory_stats.usage.unwrap_or(0),
            memory_limit: stats.memory_stats.limit.unwrap_or(0),
            rx_bytes,
            tx_bytes,
            read_bytes,
            write_bytes,
        }
    }
}

fn compute_stats(id: &str, name: String, s: &ResourceSample, now: DateTime<Utc>) -> ContainerStats {
    let mut cpu_percent = 0.0;
    if s.system_cpu > 0 && s.presystem_cpu > 0 {
        let cpu_delta = s.cpu_total.saturating_sub(s.precpu_total);
        let system_delta = s.system_cpu.saturating_sub(s.presystem_cpu);
        if cpu_delta > 0 && system_delta > 0 {
            cpu_percent = cpu_delta as f64 / system_delta as f64 * s.online_cpus as f64 * 100.0;
        }
    }
    let memory_percent = if s.memory_limit > 0 {
        s.memory_usage as f64 / s.memory_limit as f64 * 100.0
    } else {
        0.0
    };

    ContainerStats {
        id: id.to_string(),
        name,
        timestamp: now,
        cpu: CpuStats {
            usage_percent: round2(cpu_percent),
            online_cpus: s.online_cpus,
        },
        memory: MemoryStats {
            usage: s.memory_usage,
            limit: s.memory_limit,
            usage_percent: round2(memory_percent),
        },
        network: NetworkStats {
            rx_bytes: s.rx_bytes,
            tx_bytes: s.tx_bytes,
        },
        disk: DiskStats {
            read_bytes: s.read_bytes,
            write_bytes: s.write_bytes,
        },
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Split engine output of the form `<timestamp> <message>` into lines.
fn parse_log_lines(text: &str) -> Vec<LogLine> {
    text.lines()
        .filter(|line| !line.is_empty())
        .map(|line| match line.split_once(' ') {
            Some((timestamp, message)) => LogLine {
                timestamp: timestamp.to_string(),
                message: message.to_string(),
            },
            None => LogLine {
                timestamp: String::new(),
                message: line.to_string(),
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{ContainerSummaryNetworkSettings, EndpointSettings, Port, PortTypeEnum};
    use std::collections::HashMap;

    fn summary(name: &str, networks: &[(&str, &str)]) -> ContainerSummary {
        ContainerSummary {
            id: Some(format!("{}-id", name)),
            names: Some(vec![format!("/{}", name)]),
            image: Some("nginx:alpine".into()),
            state: Some("running".into()),
            network_settings: Some(ContainerSummaryNetworkSettings {
                networks: Some(
                    networks
                        .iter()
                        .map(|(net, ip)| {
                            (
                                net.to_string(),
                                EndpointSettings {
                                    ip_address: Some(ip.to_string()),
                                    ..Default::default()
                                },
                            )
                        })
                        .collect::<HashMap<_, _>>(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn maps_summary_fields() {
        let mut s = summary("web1", &[("bridge", "172.17.0.2")]);
        s.created = Some(0);
        s.ports = Some(vec![
            Port {
                private_port: 80,
                public_port: Some(8080),
                typ: Some(PortTypeEnum::TCP),
                ..Default::default()
            },
            Port {
                private_port: 443,
                public_port: None,
                ..Default::default()
            },
        ]);

        let record = summary_to_record(s, None).unwrap();
        assert_eq!(record.id, "web1-id");
        assert_eq!(record.name, "web1");
        assert_eq!(record.status, "running");
        assert_eq!(record.ip_address, Some("172.17.0.2".parse().unwrap()));
        assert_eq!(record.created, "1970-01-01T00:00:00+00:00");
        assert_eq!(
            record.ports,
            vec![PortMapping {
                container_port: "80".into(),
                protocol: "tcp".into(),
                host_port: Some("8080".into()),
            }]
        );
    }

    #[test]
    fn picks_configured_network_or_first_by_name() {
        let s = summary("db", &[("zeta", "10.0.9.9"), ("alpha", "10.0.1.1")]);
        assert_eq!(
            get_ip_for_network(&s, None),
            Some("10.0.1.1".parse().unwrap())
        );
        assert_eq!(
            get_ip_for_network(&s, Some("zeta")),
            Some("10.0.9.9".parse().unwrap())
        );
        assert_eq!(get_ip_for_network(&s, Some("missing")), None);
    }

    #[test]
    fn empty_address_is_none() {
        let s = summary("host-net", &[("host", "")]);
        assert_eq!(get_ip_for_network(&s, None), None);
    }

    #[test]
    fn skips_system_and_opted_out_containers() {
        let skip = vec!["zeronsd".to_string()];
        let mut record = summary_to_record(summary("zeronsd", &[]), None).unwrap();
        assert!(should_skip(&record, &skip));

        record.name = "api".into();
        assert!(!should_skip(&record, &skip));

        record.labels.insert(ENABLE_LABEL.into(), "FALSE".into());
        assert!(should_skip(&record, &skip));
    }

    #[test]
    fn computes_cpu_and_memory_percentages() {
        let sample = ResourceSample {
            cpu_total: 2_000,
            precpu_total: 1_000,
            system_cpu: 20_000,
            presystem_cpu: 10_000,
            online_cpus: 4,
            memory_usage: 256,
            memory_limit: 1024,
            rx_bytes: 1,
            tx_bytes: 2,
            read_bytes: 3,
            write_bytes: 4,
        };
        let stats = compute_stats("abc", "web1".into(), &sample, Utc::now());
        assert_eq!(stats.cpu.usage_percent, 40.0);
        assert_eq!(stats.memory.usage_percent, 25.0);
        assert_eq!(stats.network.tx_bytes, 2);
        assert_eq!(stats.disk.write_bytes, 4);
    }

    #[test]
    fn first_sample_has_zero_cpu() {
        let sample = ResourceSample {
            cpu_total: 500,
            system_cpu: 10_000,
            online_cpus: 1,
            ..Default::default()
        };
        let stats = compute_stats("abc", "web1".into(), &sample, Utc::now());
        assert_eq!(stats.cpu.usage_percent, 0.0);
        assert_eq!(stats.memory.usage_percent, 0.0);
    }

    #[test]
    fn splits_timestamp_from_message() {
        let lines = parse_log_lines(
            "2024-05-01T10:00:00.000Z GET /health 200\nno-timestamp\n\n2024-05-01T10:00:01Z ready\n",
        );
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].timestamp, "2024-05-01T10:00:00.000Z");
        assert_eq!(lines[0].message, "GET /health 200");
        assert_eq!(lines[1].timestamp, "");
        assert_eq!(lines[1].message, "no-timestamp");
        assert_eq!(lines[2].message, "ready");
    }

    #[test]
    fn classifies_engine_errors() {
        let e = classify(
            "local",
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message: "No such container".into(),
            },
        );
        assert!(matches!(e, AdapterError::NotFound(_)));

        let e = classify("tcp://h:2375", bollard::errors::Error::RequestTimeoutError);
        assert!(e.is_connectivity());

        let e = classify(
            "local",
            bollard::errors::Error::DockerResponseServerError {
                status_code: 500,
                message: "boom".into(),
            },
        );
        assert!(!e.is_connectivity());
    }
}
