//! The one remote engine the daemon follows instead of the local socket.

use log::{info, warn};
use parking_lot::RwLock;
use serde::Serialize;

use crate::runtime::{RemoteHost, Target};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    /// `None` when following the local engine.
    pub remote_host: Option<String>,
    pub connected: bool,
}

#[derive(Debug, Clone)]
struct RemoteSession {
    endpoint: RemoteHost,
    connected: bool,
}

#[derive(Debug, Default)]
pub struct Session {
    inner: RwLock<Option<RemoteSession>>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace any existing session with a connected one to `endpoint`.
    pub fn connect(&self, endpoint: RemoteHost) {
        info!("Remote session connected to {}", endpoint);
        *self.inner.write() = Some(RemoteSession {
            endpoint,
            connected: true,
        });
    }

    /// Revert to the local engine.
    pub fn disconnect(&self) {
        if let Some(old) = self.inner.write().take() {
            info!("Remote session to {} closed", old.endpoint);
        }
    }

    /// Make `target` the target for unattended work. Keeps an existing
    /// connected session to the same endpoint as is.
    pub fn follow(&self, target: &Target) {
        match target {
            Target::Local => self.disconnect(),
            Target::Remote(endpoint) => {
                let current = self
                    .inner
                    .read()
                    .as_ref()
                    .is_some_and(|s| &s.endpoint == endpoint && s.connected);
                if !current {
                    self.connect(endpoint.clone());
                }
            }
        }
    }

    /// Mark the session down after connectivity loss to `endpoint`.
    /// Returns true if the session was downgraded by this call.
    pub fn mark_lost(&self, endpoint: &RemoteHost) -> bool {
        let mut inner = self.inner.write();
        match inner.as_mut() {
            Some(s) if &s.endpoint == endpoint && s.connected => {
                warn!("Lost remote session to {}; reconnect required", endpoint);
                s.connected = false;
                true
            }
            _ => false,
        }
    }

    /// True if `endpoint` is the session endpoint and it is down.
    pub fn is_lost(&self, endpoint: &RemoteHost) -> bool {
        self.inner
            .read()
            .as_ref()
            .is_some_and(|s| &s.endpoint == endpoint && !s.connected)
    }

    /// Target for unattended work: local without a session, the remote
    /// endpoint while connected, nothing while disconnected.
    pub fn target(&self) -> Option<Target> {
        match self.inner.read().as_ref() {
            None => Some(Target::Local),
            Some(s) if s.connected => Some(Target::Remote(s.endpoint.clone())),
            Some(_) => None,
        }
    }

    pub fn status(&self) -> SessionStatus {
        match self.inner.read().as_ref() {
            None => SessionStatus {
                remote_host: None,
                connected: false,
            },
            Some(s) => SessionStatus {
                remote_host: Some(s.endpoint.to_string()),
                connected: s.connected,
            },
        }
    }
}
