//! ZeroDeploy daemon entry point.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::signal;
use tokio::sync::mpsc;

mod api;
mod config;
mod dns_server;
mod error;
mod query_log;
mod runtime;
mod session;
mod store;
mod sync;
mod types;

use api::AppState;
use config::Config;
use dns_server::{run_dns_server, ZoneResolver};
use query_log::QueryLog;
use runtime::{DockerConnector, RemoteHost, Target};
use session::Session;
use store::RecordStore;
use sync::SyncController;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting ZeroDeploy with config: {:?}", cfg);

    // Shared state
    let store = Arc::new(RecordStore::new(cfg.domain_suffix.clone()));
    let query_log = Arc::new(match &cfg.query_log_path {
        Some(path) => QueryLog::load(path, cfg.query_log_capacity),
        None => QueryLog::new(cfg.query_log_capacity),
    });
    info!(
        "Query log holds {} of {} entries",
        query_log.len(),
        query_log.capacity()
    );
    let session = Arc::new(Session::new());

    // Container Runtime (Docker)
    let connector = Arc::new(DockerConnector::new(
        cfg.network_name.clone(),
        cfg.skip_containers.clone(),
        Duration::from_secs(cfg.docker_timeout_secs),
        cfg.docker_cert_path.clone(),
    ));
    let controller = Arc::new(SyncController::new(
        connector.clone(),
        Arc::clone(&store),
        Arc::clone(&session),
    ));

    if let Some(raw) = cfg.remote_host.as_deref() {
        let endpoint = RemoteHost::parse(raw)?;
        match controller.connect_remote(endpoint.clone()).await {
            Ok(containers) => info!("Following {} ({} containers)", endpoint, containers.len()),
            Err(e) => {
                warn!("Remote host {} unavailable at startup: {}", endpoint, e);
                session.connect(endpoint.clone());
                session.mark_lost(&endpoint);
            }
        }
    }

    // Periodic sync; the first tick is the initial load
    let sync_handle = if cfg.sync_interval_secs > 0 {
        let interval = Duration::from_secs(cfg.sync_interval_secs);
        tokio::spawn(Arc::clone(&controller).run_periodic(interval))
    } else {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            if let Some(target) = controller.session().target() {
                if let Err(e) = controller.reload(&target, &[]).await {
                    error!("Initial reload failed: {}", e);
                }
            }
        })
    };

    // Local lifecycle events
    let (event_tx, event_rx) = mpsc::channel(128);
    let watcher = Arc::clone(&connector);
    let watch_handle = tokio::spawn(async move { watcher.watch(Target::Local, event_tx).await });
    let events_handle = tokio::spawn(Arc::clone(&controller).run_on_events(event_rx));

    // DNS Server
    let mut resolver = ZoneResolver::new(
        Arc::clone(&store),
        Arc::clone(&query_log),
        cfg.record_ttl,
        cfg.log_unresolved,
    );
    if cfg.forward_upstream {
        resolver = resolver.with_forwarding()?;
    }
    let dns_bind = cfg.dns_bind;
    let dns_handle = tokio::spawn(async move {
        if let Err(e) = run_dns_server(dns_bind, resolver).await {
            error!("DNS server failed: {}", e);
        }
    });

    // HTTP API
    let app = api::router(AppState {
        controller: Arc::clone(&controller),
        query_log: Arc::clone(&query_log),
    });
    let http_bind = cfg.http_bind;
    let http_handle = tokio::spawn(async move {
        if let Err(e) = api::serve(http_bind, app).await {
            error!("HTTP API failed: {}", e);
        }
    });

    // Graceful Shutdown
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    // Abort tasks
    sync_handle.abort();
    watch_handle.abort();
    events_handle.abort();
    dns_handle.abort();
    http_handle.abort();

    if let Some(path) = &cfg.query_log_path {
        if let Err(e) = query_log.save(path) {
            error!("Failed to save query log: {}", e);
        }
    }

    info!("Shutdown complete.");
    Ok(())
}
