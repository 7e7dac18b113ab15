//! Bounded log of resolved DNS queries.

use std::fs;
use std::io;
use std::path::Path;

use chrono::Utc;
use log::{info, warn};
use parking_lot::Mutex;

use crate::types::QueryLogEntry;

/// Fixed-capacity circular buffer. Appends overwrite the oldest slot once
/// the buffer is full.
#[derive(Debug)]
struct Ring {
    slots: Vec<Option<QueryLogEntry>>,
    /// Index of the oldest entry.
    head: usize,
    len: usize,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            head: 0,
            len: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn push(&mut self, entry: QueryLogEntry) {
        let cap = self.capacity();
        let tail = (self.head + self.len) % cap;
        self.slots[tail] = Some(entry);
        if self.len == cap {
            self.head = (self.head + 1) % cap;
        } else {
            self.len += 1;
        }
    }

    fn newest(&self) -> Option<&QueryLogEntry> {
        if self.len == 0 {
            return None;
        }
        let idx = (self.head + self.len - 1) % self.capacity();
        self.slots[idx].as_ref()
    }

    /// Entries from newest to oldest.
    fn iter_rev(&self) -> impl Iterator<Item = &QueryLogEntry> {
        let cap = self.capacity();
        (0..self.len)
            .rev()
            .filter_map(move |i| self.slots[(self.head + i) % cap].as_ref())
    }
}

/// Query log shared between the DNS handler and the HTTP API.
#[derive(Debug)]
pub struct QueryLog {
    ring: Mutex<Ring>,
}

impl QueryLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(Ring::new(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.ring.lock().capacity()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().len
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append an entry, keeping timestamps non-decreasing.
    pub fn append(&self, mut entry: QueryLogEntry) -> QueryLogEntry {
        let mut ring = self.ring.lock();
        if let Some(newest) = ring.newest() {
            if entry.timestamp < newest.timestamp {
                entry.timestamp = newest.timestamp;
            }
        }
        ring.push(entry.clone());
        entry
    }

    /// Record a query answered now.
    pub fn record(&self, ip_address: impl Into<String>, domain: impl Into<String>) -> QueryLogEntry {
        self.append(QueryLogEntry {
            timestamp: Utc::now(),
            ip_address: ip_address.into(),
            domain: domain.into(),
        })
    }

    /// Out-of-band insertion for testing and audit.
    pub fn add_manual(&self, ip_address: &str, domain: &str) -> QueryLogEntry {
        info!("Manual DNS log entry: {} -> {}", ip_address, domain);
        self.record(ip_address, domain)
    }

    /// The `count` most recent entries, newest first.
    pub fn recent(&self, count: usize) -> Vec<QueryLogEntry> {
        self.ring.lock().iter_rev().take(count).cloned().collect()
    }

    /// Load a log saved by [`QueryLog::save`], keeping the newest
    /// `capacity` entries. A missing or unreadable file yields an empty log.
    pub fn load(path: &Path, capacity: usize) -> Self {
        let log = Self::new(capacity);
        let entries: Vec<QueryLogEntry> = match fs::read(path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("Could not parse query log {}: {}, starting empty", path.display(), e);
                    return log;
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => return log,
            Err(e) => {
                warn!("Could not read query log {}: {}, starting empty", path.display(), e);
                return log;
            }
        };

        let skip = entries.len().saturating_sub(capacity);
        for entry in entries.into_iter().skip(skip) {
            log.append(entry);
        }
        info!("Loaded {} query log entries from {}", log.len(), path.display());
        log
    }

    /// Write all entries, oldest first, as a JSON array.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let mut entries = self.recent(usize::MAX);
        entries.reverse();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        fs::write(path, serde_json::to_vec(&entries)?)?;
        info!("Saved {} query log entries to {}", entries.len(), path.display());
        Ok(())
    }
}
