//! Config Audit Controller
//!
//! Audits workload configuration with a pluggable checker and persists the
//! results as `ConfigAuditReport` objects next to each workload:
//! - Pods and intermediate controllers are resolved to their top-level owner
//! - Concurrent audits are capped per namespace (or cluster-wide)
//! - Reports are re-audited when the workload spec changes or the scan
//!   interval elapses, and removed when the workload is deleted

mod backoff;
mod config;
mod controller;
mod error;
mod health;
mod limiter;
mod logs;
mod owner;
mod plugin;
mod reconciler;
mod report_cache;
mod store;
mod watcher;

#[cfg(test)]
mod test_utils;

use crate::config::OperatorSettings;
use crate::error::ControllerError;
use controller::Controller;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // kube uses rustls; pick the ring provider explicitly
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("A rustls crypto provider was already installed");
    }

    info!("Starting Config Audit Controller");

    let settings = OperatorSettings::from_env()?;
    info!("Configuration:");
    info!("  Operator namespace: {}", settings.namespace);
    info!("  Config object: {}", settings.config_name);
    info!("  Health probes: {}", settings.health_addr);
    info!("  Workers per kind: {}", settings.worker_concurrency);

    let controller = Controller::new(settings).await?;
    controller.run().await?;

    Ok(())
}
