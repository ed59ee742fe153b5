//! ClusterClient trait for mocking
//!
//! This trait abstracts the Kubernetes API calls the controller makes so
//! reconcilers can be unit tested against an in-memory implementation.

use crate::error::ClusterError;
use crate::models::LogOptions;
use async_trait::async_trait;
use crds::{ConfigAuditReport, ResourceRef};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::DynamicObject;

/// Trait for cluster API operations
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait]
pub trait ClusterClientTrait: Send + Sync {
    // Generic object reads
    /// Fetch any object by reference (owner-chain traversal, plugin evidence)
    async fn get_object(&self, reference: &ResourceRef) -> Result<DynamicObject, ClusterError>;

    // Pod logs
    /// Read logs of a pod container
    async fn read_logs(&self, namespace: &str, pod: &str, options: &LogOptions) -> Result<Vec<u8>, ClusterError>;

    // ConfigAuditReport CRUD
    async fn get_report(&self, namespace: &str, name: &str) -> Result<ConfigAuditReport, ClusterError>;
    async fn create_report(&self, report: &ConfigAuditReport) -> Result<ConfigAuditReport, ClusterError>;
    /// Replace a report; `metadata.resourceVersion` must match the stored object
    async fn replace_report(&self, report: &ConfigAuditReport) -> Result<ConfigAuditReport, ClusterError>;
    async fn delete_report(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;

    // Operator configuration
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap, ClusterError>;
    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, ClusterError>;
}
