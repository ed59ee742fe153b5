//! Mock ClusterClient for unit testing
//!
//! Stores objects, logs, reports and config maps in memory. Reports carry a
//! `resourceVersion` that is checked on replace, so optimistic-concurrency
//! behaviour matches the API server. Failures can be injected per operation.

use crate::cluster_trait::ClusterClientTrait;
use crate::error::ClusterError;
use crate::models::LogOptions;
use async_trait::async_trait;
use crds::{ConfigAuditReport, ResourceRef};
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::DynamicObject;
use kube::core::TypeMeta;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

type ObjectKey = (String, String, String);
type NamespacedKey = (String, String);

/// Mock ClusterClient for testing
#[derive(Clone, Default)]
pub struct MockClusterClient {
    pub(crate) objects: Arc<Mutex<HashMap<ObjectKey, DynamicObject>>>,
    pub(crate) logs: Arc<Mutex<HashMap<(String, String, Option<String>), Vec<u8>>>>,
    pub(crate) reports: Arc<Mutex<HashMap<NamespacedKey, ConfigAuditReport>>>,
    pub(crate) config_maps: Arc<Mutex<HashMap<NamespacedKey, ConfigMap>>>,
    pub(crate) next_resource_version: Arc<Mutex<u64>>,
    // Failure injection
    pub(crate) object_read_failures: Arc<Mutex<usize>>,
    pub(crate) replace_conflicts: Arc<Mutex<usize>>,
    // Call counters
    pub(crate) object_reads: Arc<Mutex<usize>>,
    pub(crate) report_writes: Arc<Mutex<usize>>,
    pub(crate) write_conflicts: Arc<Mutex<usize>>,
}

impl std::fmt::Debug for MockClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockClusterClient").finish_non_exhaustive()
    }
}

fn object_key(reference: &ResourceRef) -> ObjectKey {
    (
        reference.kind.clone(),
        reference.namespace.clone().unwrap_or_default(),
        reference.name.clone(),
    )
}

impl MockClusterClient {
    /// Create an empty mock client
    pub fn new() -> Self {
        Self {
            next_resource_version: Arc::new(Mutex::new(1)),
            ..Self::default()
        }
    }

    /// Build a `DynamicObject` for a reference (for test setup)
    pub fn build_object(
        reference: &ResourceRef,
        owners: Vec<OwnerReference>,
        generation: Option<i64>,
        data: serde_json::Value,
    ) -> DynamicObject {
        DynamicObject {
            types: Some(TypeMeta {
                api_version: reference.api_version.clone(),
                kind: reference.kind.clone(),
            }),
            metadata: ObjectMeta {
                name: Some(reference.name.clone()),
                namespace: reference.namespace.clone(),
                uid: reference.uid.clone(),
                generation,
                owner_references: (!owners.is_empty()).then_some(owners),
                ..ObjectMeta::default()
            },
            data,
        }
    }

    /// Build a controller owner reference pointing at `owner` (for test setup)
    pub fn controller_ref(owner: &ResourceRef) -> OwnerReference {
        OwnerReference {
            api_version: owner.api_version.clone(),
            kind: owner.kind.clone(),
            name: owner.name.clone(),
            uid: owner.uid.clone().unwrap_or_default(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    /// Add an object to the mock store (for test setup)
    pub fn add_object(&self, object: DynamicObject) {
        let types = object.types.clone().unwrap_or_default();
        let key = (
            types.kind,
            object.metadata.namespace.clone().unwrap_or_default(),
            object.metadata.name.clone().unwrap_or_default(),
        );
        self.objects.lock().unwrap().insert(key, object);
    }

    /// Remove an object from the mock store
    pub fn remove_object(&self, reference: &ResourceRef) {
        self.objects.lock().unwrap().remove(&object_key(reference));
    }

    /// Set the logs returned for a pod container (for test setup)
    pub fn set_logs(&self, namespace: &str, pod: &str, container: Option<&str>, logs: &[u8]) {
        self.logs.lock().unwrap().insert(
            (namespace.to_string(), pod.to_string(), container.map(str::to_string)),
            logs.to_vec(),
        );
    }

    /// Add a config map (for test setup)
    pub fn add_config_map(&self, config_map: ConfigMap) {
        let key = (
            config_map.metadata.namespace.clone().unwrap_or_default(),
            config_map.metadata.name.clone().unwrap_or_default(),
        );
        self.config_maps.lock().unwrap().insert(key, config_map);
    }

    /// Make the next `count` object reads fail with a transport error
    pub fn fail_object_reads(&self, count: usize) {
        *self.object_read_failures.lock().unwrap() = count;
    }

    /// Make the next `count` report replaces fail with a conflict
    pub fn inject_replace_conflicts(&self, count: usize) {
        *self.replace_conflicts.lock().unwrap() = count;
    }

    /// Store a report as-is, keeping its resourceVersion (for test setup)
    pub fn add_report(&self, report: ConfigAuditReport) {
        let key = (
            report.metadata.namespace.clone().unwrap_or_default(),
            report.metadata.name.clone().unwrap_or_default(),
        );
        self.reports.lock().unwrap().insert(key, report);
    }

    /// All stored reports
    pub fn reports(&self) -> Vec<ConfigAuditReport> {
        self.reports.lock().unwrap().values().cloned().collect()
    }

    /// Stored config map, if any
    pub fn config_map(&self, namespace: &str, name: &str) -> Option<ConfigMap> {
        self.config_maps
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Number of `get_object` calls made so far
    pub fn object_reads(&self) -> usize {
        *self.object_reads.lock().unwrap()
    }

    /// Number of successful report creates and replaces
    pub fn report_writes(&self) -> usize {
        *self.report_writes.lock().unwrap()
    }

    /// Number of report creates and replaces rejected as AlreadyExists or Conflict
    pub fn write_conflicts(&self) -> usize {
        *self.write_conflicts.lock().unwrap()
    }

    fn conflict(&self, error: ClusterError) -> ClusterError {
        *self.write_conflicts.lock().unwrap() += 1;
        error
    }

    fn next_version(&self) -> String {
        let mut next = self.next_resource_version.lock().unwrap();
        let version = (*next).max(1);
        *next = version + 1;
        version.to_string()
    }
}

fn take_injected(counter: &Mutex<usize>) -> bool {
    let mut remaining = counter.lock().unwrap();
    if *remaining > 0 {
        *remaining -= 1;
        true
    } else {
        false
    }
}

fn report_key(report: &ConfigAuditReport) -> Result<NamespacedKey, ClusterError> {
    match (&report.metadata.namespace, &report.metadata.name) {
        (Some(ns), Some(name)) => Ok((ns.clone(), name.clone())),
        _ => Err(ClusterError::InvalidRequest(
            "ConfigAuditReport missing namespace or name".to_string(),
        )),
    }
}

#[async_trait]
impl ClusterClientTrait for MockClusterClient {
    async fn get_object(&self, reference: &ResourceRef) -> Result<DynamicObject, ClusterError> {
        *self.object_reads.lock().unwrap() += 1;
        if take_injected(&self.object_read_failures) {
            return Err(ClusterError::Kube(kube::Error::Service(Box::new(
                std::io::Error::other("injected transport failure"),
            ))));
        }
        self.objects
            .lock()
            .unwrap()
            .get(&object_key(reference))
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(format!("{} not found", reference)))
    }

    async fn read_logs(&self, namespace: &str, pod: &str, options: &LogOptions) -> Result<Vec<u8>, ClusterError> {
        self.logs
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), pod.to_string(), options.container.clone()))
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(format!("pods \"{}\" not found", pod)))
    }

    async fn get_report(&self, namespace: &str, name: &str) -> Result<ConfigAuditReport, ClusterError> {
        let found = self
            .reports
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned();
        // Let concurrent writers interleave between read and write like a real apiserver round trip
        tokio::task::yield_now().await;
        found.ok_or_else(|| ClusterError::NotFound(format!("configauditreports \"{}\" not found", name)))
    }

    async fn create_report(&self, report: &ConfigAuditReport) -> Result<ConfigAuditReport, ClusterError> {
        let key = report_key(report)?;
        let mut reports = self.reports.lock().unwrap();
        if reports.contains_key(&key) {
            return Err(self.conflict(ClusterError::AlreadyExists(format!(
                "configauditreports \"{}\" already exists",
                key.1
            ))));
        }
        let mut stored = report.clone();
        stored.metadata.resource_version = Some(self.next_version());
        reports.insert(key, stored.clone());
        *self.report_writes.lock().unwrap() += 1;
        Ok(stored)
    }

    async fn replace_report(&self, report: &ConfigAuditReport) -> Result<ConfigAuditReport, ClusterError> {
        let key = report_key(report)?;
        if take_injected(&self.replace_conflicts) {
            return Err(self.conflict(ClusterError::Conflict(format!(
                "Operation cannot be fulfilled on configauditreports \"{}\"",
                key.1
            ))));
        }
        let mut reports = self.reports.lock().unwrap();
        let current = reports
            .get(&key)
            .ok_or_else(|| ClusterError::NotFound(format!("configauditreports \"{}\" not found", key.1)))?;
        if current.metadata.resource_version != report.metadata.resource_version {
            return Err(self.conflict(ClusterError::Conflict(format!(
                "Operation cannot be fulfilled on configauditreports \"{}\": the object has been modified",
                key.1
            ))));
        }
        let mut stored = report.clone();
        stored.metadata.resource_version = Some(self.next_version());
        reports.insert(key, stored.clone());
        *self.report_writes.lock().unwrap() += 1;
        Ok(stored)
    }

    async fn delete_report(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.reports
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| ClusterError::NotFound(format!("configauditreports \"{}\" not found", name)))
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap, ClusterError> {
        self.config_map(namespace, name)
            .ok_or_else(|| ClusterError::NotFound(format!("configmaps \"{}\" not found", name)))
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, ClusterError> {
        let key = (
            config_map.metadata.namespace.clone().unwrap_or_default(),
            config_map.metadata.name.clone().unwrap_or_default(),
        );
        let mut config_maps = self.config_maps.lock().unwrap();
        if config_maps.contains_key(&key) {
            return Err(ClusterError::AlreadyExists(format!(
                "configmaps \"{}\" already exists",
                key.1
            )));
        }
        config_maps.insert(key, config_map.clone());
        Ok(config_map.clone())
    }
}
