//! Committed DNS records and the staged toggle overlay.
//!
//! Readers (the DNS handler, HTTP reads) take a cheap `Arc` clone of the
//! committed snapshot; a commit builds a complete new snapshot and swaps
//! it in under the write lock, so no reader ever sees a partial update.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::types::ContainerRecord;

/// Maximum length of a single DNS label.
const MAX_LABEL_LEN: usize = 63;

/// One published name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DnsRecord {
    pub address: IpAddr,
    /// The container's committed `dns_enabled`; lookups only answer for
    /// enabled records.
    pub enabled: bool,
    pub container_id: String,
}

/// The name → address mapping served over DNS.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DnsRecordSet {
    serial: u64,
    records: BTreeMap<String, DnsRecord>,
}

impl DnsRecordSet {
    /// Derive the mapping from `containers`. Disabled or address-less
    /// containers never appear.
    pub fn build(containers: &[ContainerRecord], suffix: &str) -> Self {
        let mut eligible: Vec<&ContainerRecord> = containers
            .iter()
            .filter(|c| c.dns_enabled && c.ip_address.is_some())
            .collect();
        // Smaller id wins a label collision
        eligible.sort_by(|a, b| a.id.cmp(&b.id));

        let mut records: BTreeMap<String, DnsRecord> = BTreeMap::new();
        for c in eligible {
            let Some(address) = c.ip_address else {
                continue;
            };
            let label = sanitize_label(&c.name);
            if label.is_empty() {
                warn!("Skipping container {} with unusable name {:?}", c.id, c.name);
                continue;
            }
            let fqdn = format!("{}.{}", label, suffix);
            if let Some(existing) = records.get(&fqdn) {
                warn!(
                    "{} already published for container {}, ignoring {}",
                    fqdn,
                    existing.container_id,
                    c.id
                );
                continue;
            }
            records.insert(
                fqdn,
                DnsRecord {
                    address,
                    enabled: c.dns_enabled,
                    container_id: c.id.clone(),
                },
            );
        }

        Self { serial: 0, records }
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn get(&self, fqdn: &str) -> Option<&DnsRecord> {
        self.records.get(fqdn)
    }

    #[cfg(test)]
    pub fn contains(&self, fqdn: &str) -> bool {
        self.records.contains_key(fqdn)
    }

    #[cfg(test)]
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Turn a container name into a DNS label.
pub fn sanitize_label(name: &str) -> String {
    let mut label: String = name
        .trim_start_matches('/')
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | ' ' => '-',
            c => c.to_ascii_lowercase(),
        })
        .collect();
    label = label.trim_matches('-').to_string();
    if label.len() > MAX_LABEL_LEN {
        let mut end = MAX_LABEL_LEN;
        while !label.is_char_boundary(end) {
            end -= 1;
        }
        label.truncate(end);
    }
    label
}

#[derive(Debug, Default)]
struct Committed {
    records: Arc<DnsRecordSet>,
    /// Containers of the last commit, with the flags they were committed with.
    containers: Arc<BTreeMap<String, ContainerRecord>>,
}

/// Authoritative record store.
#[derive(Debug)]
pub struct RecordStore {
    suffix: String,
    committed: RwLock<Committed>,
    staged: Mutex<HashMap<String, bool>>,
}

impl RecordStore {
    pub fn new(suffix: impl Into<String>) -> Self {
        Self {
            suffix: suffix.into(),
            committed: RwLock::new(Committed::default()),
            staged: Mutex::new(HashMap::new()),
        }
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// The committed mapping.
    pub fn get(&self) -> Arc<DnsRecordSet> {
        Arc::clone(&self.committed.read().records)
    }

    pub fn lookup(&self, fqdn: &str) -> Option<IpAddr> {
        let name = fqdn.trim_end_matches('.').to_ascii_lowercase();
        self.committed
            .read()
            .records
            .get(&name)
            .filter(|r| r.enabled)
            .map(|r| r.address)
    }

    /// Containers as of the last commit, keyed by id.
    pub fn committed_containers(&self) -> Arc<BTreeMap<String, ContainerRecord>> {
        Arc::clone(&self.committed.read().containers)
    }

    /// Stage a flag for the next commit. Returns the previously staged value.
    pub fn toggle(&self, container_id: &str, enabled: bool) -> Option<bool> {
        debug!("Staged dns_enabled={} for {}", enabled, container_id);
        self.staged.lock().insert(container_id.to_string(), enabled)
    }

    #[cfg(test)]
    pub fn staged(&self) -> HashMap<String, bool> {
        self.staged.lock().clone()
    }

    /// The flag a container would be committed with if nothing else overrides it.
    pub fn effective_enabled(&self, container: &ContainerRecord) -> bool {
        if let Some(&staged) = self.staged.lock().get(&container.id) {
            return staged;
        }
        self.committed_enabled(container)
    }

    /// The flag from the last commit, or the container's own default if it
    /// was never committed.
    pub fn committed_enabled(&self, container: &ContainerRecord) -> bool {
        self.committed
            .read()
            .containers
            .get(&container.id)
            .map_or(container.dns_enabled, |c| c.dns_enabled)
    }

    /// Atomically replace the committed state with one derived from
    /// `containers`, whose `dns_enabled` flags are final.
    pub fn replace(&self, containers: Vec<ContainerRecord>) -> Arc<DnsRecordSet> {
        let mut next = DnsRecordSet::build(&containers, &self.suffix);
        let by_id: BTreeMap<String, ContainerRecord> =
            containers.into_iter().map(|c| (c.id.clone(), c)).collect();

        let published = {
            let mut committed = self.committed.write();
            if committed.records.records == next.records {
                next.serial = committed.records.serial;
            } else {
                next.serial = committed.records.serial + 1;
                info!(
                    "Published {} DNS records (serial {})",
                    next.records.len(),
                    next.serial
                );
            }
            let next = Arc::new(next);
            *committed = Committed {
                records: Arc::clone(&next),
                containers: Arc::new(by_id),
            };
            next
        };

        // Drop staged flags this commit consumed or whose container is gone
        let committed = self.committed_containers();
        self.staged.lock().retain(|id, enabled| {
            committed
                .get(id)
                .is_some_and(|c| c.dns_enabled != *enabled)
        });

        published
    }
}
