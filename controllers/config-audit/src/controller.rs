//! Main controller implementation.
//!
//! Wires the config audit controller together: loads configuration, builds
//! the reconciler and starts the background tasks:
//! - one watcher per audited kind
//! - the ConfigAuditReport cache
//! - the health probe server

use crate::config::{ConfigManager, OperatorSettings};
use crate::error::ControllerError;
use crate::health;
use crate::limiter::AdmissionLimiter;
use crate::plugin::PluginRegistry;
use crate::reconciler::Reconciler;
use crate::report_cache::{LoggingHandler, ReportCache};
use crate::watcher::{target_kinds, watch_kind};
use cluster_client::{ClusterClient, ClusterClientTrait};
use crds::ConfigAuditReport;
use futures::future::select_all;
use kube::{Api, Client};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

type Task = JoinHandle<Result<(), ControllerError>>;

/// Main controller for config audits.
pub struct Controller {
    tasks: Vec<(String, Task)>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.tasks.iter().map(|(name, _)| name.as_str()).collect();
        f.debug_struct("Controller").field("tasks", &names).finish()
    }
}

impl Controller {
    /// Creates a new controller instance and starts its background tasks.
    pub async fn new(settings: OperatorSettings) -> Result<Self, ControllerError> {
        info!("Initializing Config Audit Controller");

        let kube_client = Client::try_default().await?;
        let cluster: Arc<dyn ClusterClientTrait> = Arc::new(ClusterClient::new(kube_client.clone()));

        // Configuration is loaded once, before any component is built
        let config_manager = ConfigManager::new(Arc::clone(&cluster), &settings.namespace, &settings.config_name);
        config_manager.ensure_default().await?;
        let config = Arc::new(config_manager.read().await?);

        let plugin = PluginRegistry::builtin().select(&config.plugin)?;
        info!("Using audit plugin {} v{}", plugin.name(), plugin.version());

        let limiter = AdmissionLimiter::new(config.max_concurrent_audits);
        info!("Admitting at most {} audits per {:?} scope", limiter.limit(), config.limit_scope);
        let reconciler = Arc::new(Reconciler::new(Arc::clone(&config), cluster, limiter, plugin));
        let shutdown = CancellationToken::new();
        let mut tasks: Vec<(String, Task)> = Vec::new();

        let cache = Arc::new(ReportCache::new());
        cache.subscribe(Arc::new(LoggingHandler));
        {
            let cache = Arc::clone(&cache);
            let api: Api<ConfigAuditReport> = Api::all(kube_client.clone());
            tasks.push(("ConfigAuditReport cache".to_string(), tokio::spawn(cache.run(api))));
        }

        for resource in target_kinds() {
            let name = format!("{} watcher", resource.kind);
            let task = tokio::spawn(watch_kind(
                kube_client.clone(),
                resource,
                Arc::clone(&reconciler),
                settings.worker_concurrency,
                shutdown.clone(),
            ));
            tasks.push((name, task));
        }

        tasks.push((
            "health probes".to_string(),
            tokio::spawn(health::serve(settings.health_addr, Arc::clone(&cache), shutdown.clone())),
        ));

        Ok(Self { tasks, shutdown })
    }

    /// Runs until a task exits or the process is interrupted.
    pub async fn run(self) -> Result<(), ControllerError> {
        info!("Config Audit Controller running");

        let (names, handles): (Vec<_>, Vec<_>) = self.tasks.into_iter().unzip();
        let result = tokio::select! {
            (result, index, _remaining) = select_all(handles) => {
                let name = &names[index];
                match result {
                    Ok(Ok(())) => Err(ControllerError::Watch(format!("{name} exited unexpectedly"))),
                    Ok(Err(e)) => Err(ControllerError::Watch(format!("{name} failed: {e}"))),
                    Err(e) => Err(ControllerError::Watch(format!("{name} panicked: {e}"))),
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("Shutdown signal received");
                Ok(())
            }
        };

        if let Err(e) = &result {
            error!("Config Audit Controller stopping: {}", e);
        }
        // Stops watchers and in-flight reconciles; their admission tokens are released on drop
        self.shutdown.cancel();
        result
    }
}
