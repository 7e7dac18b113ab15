//! Reconciles container engine state into the record store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};

use crate::error::{AdapterError, SyncError};
use crate::runtime::{Connector, ContainerRuntime, RemoteHost, Target};
use crate::session::Session;
use crate::store::RecordStore;
use crate::types::{ContainerOverride, ContainerRecord, ContainerStats, LogLine};

/// Quiet period after a lifecycle event before reloading, so a burst of
/// events (stop + die + start) costs one reload.
const EVENT_SETTLE: Duration = Duration::from_millis(500);

/// Outcome of a committed reload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReloadReport {
    pub published: usize,
    pub serial: u64,
    pub changed: bool,
}

/// Which flags a reload commits for containers without an explicit override.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flags {
    /// Commit staged toggles (user-initiated reloads).
    Staged,
    /// Keep the committed flags and leave the overlay staged (timer, events).
    Committed,
}

pub struct SyncController {
    connector: Arc<dyn Connector>,
    store: Arc<RecordStore>,
    session: Arc<Session>,
    reload_lock: Mutex<()>,
}

impl SyncController {
    pub fn new(connector: Arc<dyn Connector>, store: Arc<RecordStore>, session: Arc<Session>) -> Self {
        Self {
            connector,
            store,
            session,
            reload_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    fn runtime(&self, target: &Target) -> Result<Arc<dyn ContainerRuntime>, SyncError> {
        if let Some(remote) = target.remote() {
            if self.session.is_lost(remote) {
                return Err(SyncError::Disconnected(remote.to_string()));
            }
        }
        self.connector
            .connect(target)
            .map_err(|e| self.adapter_failed(target, e))
    }

    /// Downgrade the session if `target` is its endpoint and became unreachable.
    fn adapter_failed(&self, target: &Target, e: AdapterError) -> SyncError {
        if e.is_connectivity() {
            if let Some(remote) = target.remote() {
                if self.session.mark_lost(remote) {
                    return SyncError::Disconnected(remote.to_string());
                }
            }
        }
        SyncError::Adapter(e)
    }

    /// Raw enumeration with the engine's own defaults.
    pub async fn enumerate(&self, target: &Target) -> Result<Vec<ContainerRecord>, SyncError> {
        self.runtime(target)?
            .list_containers()
            .await
            .map_err(|e| self.adapter_failed(target, e))
    }

    /// Enumeration with `dns_enabled` reflecting staged and committed state.
    pub async fn list(&self, target: &Target) -> Result<Vec<ContainerRecord>, SyncError> {
        let mut containers = self.enumerate(target).await?;
        for c in &mut containers {
            c.dns_enabled = self.store.effective_enabled(c);
        }
        Ok(containers)
    }

    pub async fn stats(&self, target: &Target, id: &str) -> Result<ContainerStats, SyncError> {
        self.runtime(target)?
            .container_stats(id)
            .await
            .map_err(|e| self.adapter_failed(target, e))
    }

    pub async fn logs(&self, target: &Target, id: &str, lines: usize) -> Result<Vec<LogLine>, SyncError> {
        self.runtime(target)?
            .container_logs(id, lines)
            .await
            .map_err(|e| self.adapter_failed(target, e))
    }

    /// Probe `endpoint` and make it the session target if it answers.
    /// This is also the explicit reconnect path for a lost session.
    pub async fn connect_remote(&self, endpoint: RemoteHost) -> Result<Vec<ContainerRecord>, SyncError> {
        let target = Target::Remote(endpoint.clone());
        let mut containers = self
            .connector
            .connect(&target)?
            .list_containers()
            .await?;
        self.session.connect(endpoint);
        for c in &mut containers {
            c.dns_enabled = self.store.effective_enabled(c);
        }
        Ok(containers)
    }

    /// Enumerate `target`, merge `overrides` and commit. Waits for any
    /// reload already running.
    pub async fn reload(
        &self,
        target: &Target,
        overrides: &[ContainerOverride],
    ) -> Result<ReloadReport, SyncError> {
        let _guard = self.reload_lock.lock().await;
        self.reload_locked(target, overrides, Flags::Staged).await
    }

    /// Like [`reload`](Self::reload) but fails with [`SyncError::InProgress`]
    /// instead of waiting.
    pub async fn try_reload(
        &self,
        target: &Target,
        overrides: &[ContainerOverride],
    ) -> Result<ReloadReport, SyncError> {
        let _guard = self
            .reload_lock
            .try_lock()
            .map_err(|_| SyncError::InProgress)?;
        self.reload_locked(target, overrides, Flags::Staged).await
    }

    /// Unattended refresh of the session target.
    async fn refresh(&self) -> Option<Result<ReloadReport, SyncError>> {
        let Some(target) = self.session.target() else {
            debug!("Remote session is down, skipping refresh");
            return None;
        };
        let _guard = self.reload_lock.lock().await;
        Some(self.reload_locked(&target, &[], Flags::Committed).await)
    }

    async fn reload_locked(
        &self,
        target: &Target,
        overrides: &[ContainerOverride],
        flags: Flags,
    ) -> Result<ReloadReport, SyncError> {
        let mut containers = self.enumerate(target).await?;
        self.merge(&mut containers, overrides, flags);

        let before = self.store.get().serial();
        let published = self.store.replace(containers);
        // What was explicitly committed is what unattended refreshes follow
        if flags == Flags::Staged {
            self.session.follow(target);
        }
        let report = ReloadReport {
            published: published.len(),
            serial: published.serial(),
            changed: published.serial() != before,
        };
        debug!("Reload of {} committed: {:?}", target, report);
        Ok(report)
    }

    fn merge(&self, containers: &mut [ContainerRecord], overrides: &[ContainerOverride], flags: Flags) {
        let mut by_id = HashMap::new();
        let mut by_name = HashMap::new();
        for o in overrides {
            if let Some(id) = o.id.as_deref().filter(|id| !id.is_empty()) {
                by_id.insert(id, o.dns_enabled);
            } else if let Some(name) = o.name.as_deref() {
                by_name.insert(name, o.dns_enabled);
            }
        }

        for c in containers.iter_mut() {
            let explicit = by_id
                .get(c.id.as_str())
                .or_else(|| by_name.get(c.name.as_str()))
                .copied();
            c.dns_enabled = match (explicit, flags) {
                (Some(enabled), _) => enabled,
                (None, Flags::Staged) => self.store.effective_enabled(c),
                (None, Flags::Committed) => self.store.committed_enabled(c),
            };
        }
    }

    /// Refresh on a timer until the task is aborted. The first tick fires
    /// immediately, which gives the initial sync at startup.
    pub async fn run_periodic(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.log_refresh("Periodic", self.refresh().await);
        }
    }

    /// Refresh after container lifecycle events on the local engine.
    pub async fn run_on_events(self: Arc<Self>, mut events: mpsc::Receiver<String>) {
        while let Some(name) = events.recv().await {
            tokio::time::sleep(EVENT_SETTLE).await;
            while events.try_recv().is_ok() {}

            if self.session.target() != Some(Target::Local) {
                debug!("Ignoring local event for {} while following a remote host", name);
                continue;
            }
            self.log_refresh("Event-driven", self.refresh().await);
        }
        info!("Lifecycle event channel closed");
    }

    fn log_refresh(&self, kind: &str, outcome: Option<Result<ReloadReport, SyncError>>) {
        match outcome {
            Some(Ok(report)) if report.changed => {
                info!("{} reload published {} records", kind, report.published)
            }
            Some(Ok(_)) => debug!("{} reload: no changes", kind),
            Some(Err(e)) => warn!("{} reload failed: {}", kind, e),
            None => {}
        }
    }
}
