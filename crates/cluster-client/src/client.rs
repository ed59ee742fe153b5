//! Kubernetes API client
//!
//! Implements `ClusterClientTrait` on top of a `kube::Client`. Objects of
//! arbitrary kinds are read through `DynamicObject` so the owner resolver can
//! walk any controller chain without compiled-in types.

use crate::cluster_trait::ClusterClientTrait;
use crate::error::ClusterError;
use crate::models::LogOptions;
use async_trait::async_trait;
use crds::{ConfigAuditReport, ResourceRef};
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::api::{Api, DeleteParams, DynamicObject, LogParams, PostParams};
use kube::core::{ApiResource, GroupVersionKind};
use kube::Client;
use tracing::debug;

/// Kubernetes API client
#[derive(Clone)]
pub struct ClusterClient {
    client: Client,
}

impl std::fmt::Debug for ClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterClient").finish_non_exhaustive()
    }
}

impl ClusterClient {
    /// Wrap an existing kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// The underlying kube client (used to build watchers)
    pub fn kube_client(&self) -> &Client {
        &self.client
    }

    /// Build a dynamic API for the kind named by a reference
    fn dynamic_api(&self, reference: &ResourceRef) -> Result<Api<DynamicObject>, ClusterError> {
        if reference.kind.is_empty() || reference.api_version.is_empty() {
            return Err(ClusterError::InvalidRequest(format!(
                "reference {} has no kind or apiVersion",
                reference
            )));
        }
        let (group, version) = reference
            .api_version
            .split_once('/')
            .unwrap_or(("", reference.api_version.as_str()));
        let gvk = GroupVersionKind::gvk(group, version, &reference.kind);
        let resource = ApiResource::from_gvk(&gvk);

        Ok(match &reference.namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        })
    }

    fn reports(&self, namespace: &str) -> Api<ConfigAuditReport> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn report_namespace(report: &ConfigAuditReport) -> Result<&str, ClusterError> {
    report
        .metadata
        .namespace
        .as_deref()
        .ok_or_else(|| ClusterError::InvalidRequest("ConfigAuditReport missing namespace".to_string()))
}

fn report_name(report: &ConfigAuditReport) -> Result<&str, ClusterError> {
    report
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| ClusterError::InvalidRequest("ConfigAuditReport missing name".to_string()))
}

#[async_trait]
impl ClusterClientTrait for ClusterClient {
    async fn get_object(&self, reference: &ResourceRef) -> Result<DynamicObject, ClusterError> {
        debug!("Fetching {}", reference);
        let api = self.dynamic_api(reference)?;
        Ok(api.get(&reference.name).await?)
    }

    async fn read_logs(&self, namespace: &str, pod: &str, options: &LogOptions) -> Result<Vec<u8>, ClusterError> {
        debug!("Reading logs of Pod {}/{} (container: {:?})", namespace, pod, options.container);
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = LogParams {
            container: options.container.clone(),
            tail_lines: options.tail_lines,
            limit_bytes: options.limit_bytes,
            previous: options.previous,
            since_seconds: options.since_seconds,
            ..LogParams::default()
        };
        let logs = api.logs(pod, &params).await?;
        Ok(logs.into_bytes())
    }

    async fn get_report(&self, namespace: &str, name: &str) -> Result<ConfigAuditReport, ClusterError> {
        Ok(self.reports(namespace).get(name).await?)
    }

    async fn create_report(&self, report: &ConfigAuditReport) -> Result<ConfigAuditReport, ClusterError> {
        let namespace = report_namespace(report)?;
        Ok(self.reports(namespace).create(&PostParams::default(), report).await?)
    }

    async fn replace_report(&self, report: &ConfigAuditReport) -> Result<ConfigAuditReport, ClusterError> {
        let namespace = report_namespace(report)?;
        let name = report_name(report)?;
        Ok(self
            .reports(namespace)
            .replace(name, &PostParams::default(), report)
            .await?)
    }

    async fn delete_report(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.reports(namespace).delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap, ClusterError> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, ClusterError> {
        let namespace = config_map
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| ClusterError::InvalidRequest("ConfigMap missing namespace".to_string()))?;
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), config_map).await?)
    }
}
