//! Audit plugins
//!
//! A plugin inspects one subject and returns an opaque JSON payload that is
//! persisted verbatim in the report. Plugins never touch the cluster
//! directly: everything they may read is exposed through `Evidence`, which
//! is restricted to the owner chain being audited.
//!
//! Exactly one plugin is active per process; it is selected by name from
//! the `PluginRegistry` at startup.

pub mod hardening;

use crate::config::ConfigError;
use crate::logs::{LogsError, LogsReader};
use crate::owner::OwnerChain;
use async_trait::async_trait;
use cluster_client::{ClusterClientTrait, ClusterError, LogOptions};
use crds::ResourceRef;
use kube::api::DynamicObject;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Successful plugin result
#[derive(Debug, Clone, PartialEq)]
pub struct AuditResult {
    /// Plugin-defined structured payload
    pub payload: serde_json::Value,
    /// Version of the plugin that produced the payload
    pub plugin_version: String,
}

/// Plugin failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PluginError {
    /// Evidence could not be read; the cycle is retried
    #[error("transient plugin failure: {0}")]
    Transient(String),

    /// The subject cannot be audited; recorded as a failed report
    #[error("{0}")]
    Permanent(String),

    /// A chain object vanished mid-audit; the cycle ends without a report
    #[error("evidence no longer exists: {0}")]
    NotFound(String),
}

/// Read-only view of the cluster a plugin may consult
///
/// Object reads are limited to the owner chain; log reads to the subject,
/// and only when the subject is a Pod.
pub struct Evidence<'a> {
    client: &'a dyn ClusterClientTrait,
    logs: &'a LogsReader,
    chain: &'a OwnerChain,
}

impl std::fmt::Debug for Evidence<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Evidence").field("chain", &self.chain).finish_non_exhaustive()
    }
}

impl<'a> Evidence<'a> {
    pub fn new(client: &'a dyn ClusterClientTrait, logs: &'a LogsReader, chain: &'a OwnerChain) -> Self {
        Self { client, logs, chain }
    }

    /// Read an object from the owner chain
    pub async fn object(&self, reference: &ResourceRef) -> Result<DynamicObject, PluginError> {
        if !self.chain.contains(reference) {
            return Err(PluginError::Permanent(format!(
                "{reference} is outside the owner chain of {}",
                self.chain.subject()
            )));
        }
        self.client.get_object(reference).await.map_err(|e| match e {
            ClusterError::NotFound(_) => PluginError::NotFound(reference.to_string()),
            other => PluginError::Transient(format!("failed to read {reference}: {other}")),
        })
    }

    /// Read logs of the subject; `None` unless the subject is a Pod that still exists
    pub async fn logs(&self, options: &LogOptions) -> Result<Option<Vec<u8>>, PluginError> {
        let Some(pod) = self.chain.pod() else {
            return Ok(None);
        };
        self.logs.fetch_logs(pod, options).await.map_err(|e| match e {
            LogsError::NotAPod(_) => PluginError::Permanent(e.to_string()),
            LogsError::Cluster(_) => PluginError::Transient(e.to_string()),
        })
    }
}

/// Contract for audit plugins
#[async_trait]
pub trait AuditPlugin: Send + Sync {
    /// Registered name, a lowercase DNS label
    fn name(&self) -> &str;

    /// Semantic version recorded in every report
    fn version(&self) -> &str;

    /// Audit `subject` given its resolved owner chain. Must be side-effect
    /// free; cluster reads go through `evidence`.
    async fn audit(
        &self,
        subject: &ResourceRef,
        chain: &OwnerChain,
        evidence: &Evidence<'_>,
    ) -> Result<AuditResult, PluginError>;
}

type PluginFactory = Box<dyn Fn() -> Arc<dyn AuditPlugin> + Send + Sync>;

/// Named plugin constructors
pub struct PluginRegistry {
    factories: BTreeMap<String, PluginFactory>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry").field("plugins", &self.names()).finish()
    }
}

impl PluginRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry with the plugins shipped in this binary
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(hardening::NAME, || Arc::new(hardening::WorkloadHardeningPlugin::new()));
        registry
    }

    /// Register a plugin constructor under `name`
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Arc<dyn AuditPlugin> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    /// Instantiate the plugin configured as `name`
    pub fn select(&self, name: &str) -> Result<Arc<dyn AuditPlugin>, ConfigError> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| ConfigError::UnknownPlugin {
                name: name.to_string(),
                available: self.names().join(", "),
            })
    }

    /// Registered plugin names in sorted order
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::owner::OwnerResolver;
    use crate::test_utils::{create_test_deployment, create_test_owned};
    use cluster_client::MockClusterClient;

    #[test]
    fn test_select_builtin() {
        let registry = PluginRegistry::builtin();
        let plugin = registry.select("workload-hardening").unwrap();
        assert_eq!(plugin.name(), "workload-hardening");
        assert_eq!(plugin.version(), hardening::VERSION);
    }

    #[test]
    fn test_select_unknown_lists_available() {
        let Err(err) = PluginRegistry::builtin().select("nope") else {
            panic!("unknown plugin was selected");
        };
        match err {
            ConfigError::UnknownPlugin { name, available } => {
                assert_eq!(name, "nope");
                assert_eq!(available, "workload-hardening");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_evidence_is_restricted_to_chain() {
        let mock = MockClusterClient::new();
        let deployment = ResourceRef::new("apps/v1", "Deployment", "ns", "app-1");
        mock.add_object(MockClusterClient::build_object(&deployment, vec![], Some(1), serde_json::json!({})));
        let logs = LogsReader::new(Arc::new(mock.clone()));
        let chain = OwnerChain::single(deployment.clone(), Some(1));
        let evidence = Evidence::new(&mock, &logs, &chain);

        assert!(evidence.object(&deployment).await.is_ok());

        let other = ResourceRef::new("v1", "Secret", "ns", "db-password");
        assert!(matches!(evidence.object(&other).await, Err(PluginError::Permanent(_))));

        // A Deployment has no logs of its own
        assert_eq!(evidence.logs(&LogOptions::default()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_vanished_chain_object_is_not_found() {
        let mock = MockClusterClient::new();
        let deployment = ResourceRef::new("apps/v1", "Deployment", "ns", "app-1");
        let logs = LogsReader::new(Arc::new(mock.clone()));
        let chain = OwnerChain::single(deployment.clone(), Some(1));
        let evidence = Evidence::new(&mock, &logs, &chain);

        assert!(matches!(evidence.object(&deployment).await, Err(PluginError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_logs_are_limited_to_the_subject() {
        let mock = MockClusterClient::new();
        let deployment = create_test_deployment(&mock, "ns", "app-1");
        let replicaset = create_test_owned(&mock, "apps/v1", "ReplicaSet", "app-1-5d4f", &[&deployment]);
        let pod = create_test_owned(&mock, "v1", "Pod", "app-1-5d4f-x2x9", &[&replicaset]);
        mock.set_logs("ns", "app-1-5d4f-x2x9", Some("app"), b"ready\n");
        let client: Arc<dyn ClusterClientTrait> = Arc::new(mock.clone());
        let logs = LogsReader::new(Arc::clone(&client));
        let options = LogOptions::for_container("app");

        // Observed through its pod, the Deployment subject still has no logs
        let resolver = OwnerResolver::new(Arc::clone(&client), vec!["Deployment".to_string()]);
        let chain = resolver.resolve(&pod).await.unwrap();
        assert!(chain.subject().same_object(&deployment));
        let evidence = Evidence::new(&mock, &logs, &chain);
        assert_eq!(evidence.logs(&options).await.unwrap(), None);

        // A bare pod is its own subject
        let bare = OwnerChain::single(pod.clone(), None);
        let evidence = Evidence::new(&mock, &logs, &bare);
        assert_eq!(evidence.logs(&options).await.unwrap().as_deref(), Some(&b"ready\n"[..]));
    }

    #[tokio::test]
    async fn test_evidence_read_failure_is_transient() {
        let mock = MockClusterClient::new();
        let deployment = ResourceRef::new("apps/v1", "Deployment", "ns", "app-1");
        mock.fail_object_reads(1);
        let logs = LogsReader::new(Arc::new(mock.clone()));
        let chain = OwnerChain::single(deployment.clone(), None);
        let evidence = Evidence::new(&mock, &logs, &chain);

        assert!(matches!(evidence.object(&deployment).await, Err(PluginError::Transient(_))));
    }
}
