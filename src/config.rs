use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::runtime::RemoteHost;

pub const DEFAULT_DOMAIN_SUFFIX: &str = "vexinet.local";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Zone the container names are published under.
    pub domain_suffix: String,
    pub dns_bind: SocketAddr,
    pub http_bind: SocketAddr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_ip: Option<String>,
    /// TTL in seconds for answers served from the record store.
    pub record_ttl: u32,
    /// Forward names outside the zone to the system resolvers.
    pub forward_upstream: bool,
    /// Also record NXDOMAIN answers in the query log.
    pub log_unresolved: bool,
    pub query_log_capacity: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_log_path: Option<PathBuf>,
    /// Seconds between timer-driven reloads; 0 disables the timer.
    pub sync_interval_secs: u64,
    pub docker_timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_cert_path: Option<PathBuf>,
    pub skip_containers: Vec<String>,
    /// Remote engine to connect to at startup instead of the local socket.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_host: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            domain_suffix: DEFAULT_DOMAIN_SUFFIX.into(),
            dns_bind: SocketAddr::from(([0, 0, 0, 0], 53)),
            http_bind: SocketAddr::from(([0, 0, 0, 0], 8000)),
            bind_ip: None,
            record_ttl: 5,
            forward_upstream: false,
            log_unresolved: false,
            query_log_capacity: 1000,
            query_log_path: None,
            sync_interval_secs: 30,
            docker_timeout_secs: 10,
            network_name: None,
            docker_cert_path: None,
            skip_containers: vec!["zeronsd".into(), "dns-manager".into()],
            remote_host: None,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::from_figment(
            Figment::from(Serialized::defaults(Config::default()))
                .merge(Toml::file("zerodeploy.toml"))
                .merge(Json::file("zerodeploy.json"))
                .merge(Env::prefixed("ZERODEPLOY_")),
        )
    }

    fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let mut config: Config = figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // Same variable the docker CLI reads for TLS material
        if config.docker_cert_path.is_none() {
            if let Ok(path) = std::env::var("DOCKER_CERT_PATH") {
                config.docker_cert_path = Some(PathBuf::from(path));
            }
        }

        // If bind_ip is set, override the IP part of dns_bind
        if let Some(ref ip) = config.bind_ip {
            let port = config.dns_bind.port();
            config.dns_bind = format!("{}:{}", ip, port)
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid bind_ip: {}", e))?;
        }

        config.domain_suffix = normalize_suffix(&config.domain_suffix);
        if config.domain_suffix.is_empty() {
            anyhow::bail!("domain_suffix must not be empty");
        }
        if config.query_log_capacity == 0 {
            anyhow::bail!("query_log_capacity must be at least 1");
        }
        if let Some(ref host) = config.remote_host {
            RemoteHost::parse(host).map_err(|e| anyhow::anyhow!("Invalid remote_host: {}", e))?;
        }

        Ok(config)
    }
}

/// Lowercase the suffix and strip surrounding dots.
pub fn normalize_suffix(suffix: &str) -> String {
    suffix.trim().trim_matches('.').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    fn load_in_jail() -> Result<Config, figment::Error> {
        Config::load().map_err(|e| figment::Error::from(e.to_string()))
    }

    #[test]
    fn defaults_match_dashboard_expectations() {
        let cfg = Config::default();
        assert_eq!(cfg.domain_suffix, "vexinet.local");
        assert_eq!(cfg.query_log_capacity, 1000);
        assert!(!cfg.forward_upstream);
        assert_eq!(cfg.skip_containers, vec!["zeronsd", "dns-manager"]);
    }

    #[test]
    fn env_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "zerodeploy.toml",
                r#"
                    domain_suffix = "Lab.Internal."
                    query_log_capacity = 50
                "#,
            )?;
            jail.set_env("ZERODEPLOY_QUERY_LOG_CAPACITY", "7");
            jail.set_env("ZERODEPLOY_BIND_IP", "127.0.0.1");

            let cfg = load_in_jail()?;
            assert_eq!(cfg.domain_suffix, "lab.internal");
            assert_eq!(cfg.query_log_capacity, 7);
            assert_eq!(cfg.dns_bind, "127.0.0.1:53".parse().unwrap());
            Ok(())
        });
    }

    #[test]
    fn json_file_overrides_toml() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "zerodeploy.toml",
                r#"
                    record_ttl = 30
                    sync_interval_secs = 10
                "#,
            )?;
            jail.create_file("zerodeploy.json", r#"{ "record_ttl": 9 }"#)?;

            let cfg = load_in_jail()?;
            assert_eq!(cfg.record_ttl, 9);
            assert_eq!(cfg.sync_interval_secs, 10);
            Ok(())
        });
    }

    #[test]
    fn docker_cert_path_falls_back_to_docker_env() {
        Jail::expect_with(|jail| {
            jail.set_env("DOCKER_CERT_PATH", "/etc/docker/certs");
            let cfg = load_in_jail()?;
            assert_eq!(cfg.docker_cert_path, Some(PathBuf::from("/etc/docker/certs")));

            jail.set_env("ZERODEPLOY_DOCKER_CERT_PATH", "/srv/tls");
            let cfg = load_in_jail()?;
            assert_eq!(cfg.docker_cert_path, Some(PathBuf::from("/srv/tls")));
            Ok(())
        });
    }

    #[test]
    fn rejects_zero_capacity() {
        Jail::expect_with(|jail| {
            jail.set_env("ZERODEPLOY_QUERY_LOG_CAPACITY", "0");
            assert!(load_in_jail().is_err());
            Ok(())
        });
    }

    #[test]
    fn rejects_bad_initial_remote_host() {
        Jail::expect_with(|jail| {
            jail.set_env("ZERODEPLOY_REMOTE_HOST", "ftp://docker.lan");
            assert!(load_in_jail().is_err());
            Ok(())
        });
    }
}
