//! Test utilities for unit testing the reconciler
//!
//! Builders for workloads in the mock cluster and stub plugins.

use crate::config::AuditConfig;
use crate::limiter::AdmissionLimiter;
use crate::owner::OwnerChain;
use crate::plugin::{AuditPlugin, AuditResult, Evidence, PluginError};
use crate::reconciler::Reconciler;
use async_trait::async_trait;
use cluster_client::MockClusterClient;
use crds::ResourceRef;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Pod spec used for every generated workload
pub fn pod_spec() -> serde_json::Value {
    json!({
        "containers": [{ "name": "app", "image": "app:1.0.0" }]
    })
}

/// Add a top-level Deployment with generation 1
pub fn create_test_deployment(mock: &MockClusterClient, namespace: &str, name: &str) -> ResourceRef {
    let deployment = ResourceRef::new("apps/v1", "Deployment", namespace, name).with_uid(format!("uid-{name}"));
    mock.add_object(MockClusterClient::build_object(
        &deployment,
        vec![],
        Some(1),
        json!({ "spec": { "template": { "spec": pod_spec() } } }),
    ));
    deployment
}

/// Add an object of `kind` controlled by `owners`
pub fn create_test_owned(
    mock: &MockClusterClient,
    api_version: &str,
    kind: &str,
    name: &str,
    owners: &[&ResourceRef],
) -> ResourceRef {
    let namespace = owners
        .first()
        .map_or("ns", |owner| owner.namespace_or_default());
    let reference = ResourceRef::new(api_version, kind, namespace, name).with_uid(format!("uid-{name}"));
    let data = if kind == "Pod" {
        json!({ "spec": pod_spec() })
    } else {
        json!({ "spec": { "template": { "spec": pod_spec() } } })
    };
    mock.add_object(MockClusterClient::build_object(
        &reference,
        owners.iter().map(|owner| MockClusterClient::controller_ref(owner)).collect(),
        Some(1),
        data,
    ));
    reference
}

/// Deployment → ReplicaSet → Pod; returns (pod, replicaset, deployment)
pub fn create_test_pod_chain(mock: &MockClusterClient, namespace: &str, app: &str) -> (ResourceRef, ResourceRef, ResourceRef) {
    let deployment = create_test_deployment(mock, namespace, app);
    let replicaset = create_test_owned(mock, "apps/v1", "ReplicaSet", &format!("{app}-5d4f"), &[&deployment]);
    let pod = create_test_owned(mock, "v1", "Pod", &format!("{app}-5d4f-x2x9"), &[&replicaset]);
    (pod, replicaset, deployment)
}

/// Configuration used by reconciler tests
pub fn test_config() -> AuditConfig {
    AuditConfig {
        plugin: StaticPlugin::NAME.to_string(),
        max_concurrent_audits: 1,
        audit_timeout: Duration::from_secs(5),
        ..AuditConfig::default()
    }
}

/// Build a reconciler over the mock cluster
pub fn create_test_reconciler(
    mock: &MockClusterClient,
    config: AuditConfig,
    plugin: Arc<dyn AuditPlugin>,
) -> Reconciler {
    let limiter = AdmissionLimiter::new(config.max_concurrent_audits);
    Reconciler::new(Arc::new(config), Arc::new(mock.clone()), limiter, plugin)
}

/// Plugin returning a fixed payload
#[derive(Debug)]
pub struct StaticPlugin {
    payload: serde_json::Value,
    calls: AtomicUsize,
}

impl StaticPlugin {
    pub const NAME: &'static str = "plugin-v1";
    pub const VERSION: &'static str = "1.0.0";

    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            payload,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuditPlugin for StaticPlugin {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn version(&self) -> &str {
        Self::VERSION
    }

    async fn audit(&self, subject: &ResourceRef, _chain: &OwnerChain, evidence: &Evidence<'_>) -> Result<AuditResult, PluginError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        evidence.object(subject).await?;
        Ok(AuditResult {
            payload: self.payload.clone(),
            plugin_version: Self::VERSION.to_string(),
        })
    }
}

/// Plugin that always fails with the given error
#[derive(Debug)]
pub struct FailingPlugin(pub PluginError);

#[async_trait]
impl AuditPlugin for FailingPlugin {
    fn name(&self) -> &str {
        StaticPlugin::NAME
    }

    fn version(&self) -> &str {
        StaticPlugin::VERSION
    }

    async fn audit(&self, _subject: &ResourceRef, _chain: &OwnerChain, _evidence: &Evidence<'_>) -> Result<AuditResult, PluginError> {
        Err(self.0.clone())
    }
}

/// Plugin that never completes
#[derive(Debug)]
pub struct BlockingPlugin;

#[async_trait]
impl AuditPlugin for BlockingPlugin {
    fn name(&self) -> &str {
        StaticPlugin::NAME
    }

    fn version(&self) -> &str {
        StaticPlugin::VERSION
    }

    async fn audit(&self, _subject: &ResourceRef, _chain: &OwnerChain, _evidence: &Evidence<'_>) -> Result<AuditResult, PluginError> {
        std::future::pending().await
    }
}
