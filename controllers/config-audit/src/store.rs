//! ConfigAuditReport persistence
//!
//! Reports are keyed by (subject, plugin name) and written with a
//! read-modify-write loop against `metadata.resourceVersion`. Conflicts and
//! create races re-read and retry up to `max_attempts` times; losing every
//! attempt surfaces as `ConflictExhausted`, which the reconciler retries.

use crate::error::FailureKind;
use chrono::{DateTime, Utc};
use cluster_client::{ClusterClientTrait, ClusterError};
use crds::{AuditResultRecord, ConfigAuditReport, ConfigAuditReportSpec, PluginIdentity, ResourceRef};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default number of write attempts per upsert
pub const DEFAULT_MAX_ATTEMPTS: usize = 3;

/// Identity of a report
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReportKey {
    pub subject: ResourceRef,
    pub plugin: String,
}

impl ReportKey {
    pub fn new(subject: ResourceRef, plugin: &str) -> Self {
        Self {
            subject,
            plugin: plugin.to_string(),
        }
    }

    /// Namespace the report lives in (the subject's)
    pub fn namespace(&self) -> &str {
        self.subject.namespace_or_default()
    }

    /// Deterministic object name
    pub fn name(&self) -> String {
        ConfigAuditReport::name_for(&self.subject, &self.plugin)
    }
}

/// Report store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("report {0} not found")]
    NotFound(String),

    /// Every attempt lost the optimistic-concurrency race
    #[error("report {name} still conflicting after {attempts} attempts")]
    ConflictExhausted { name: String, attempts: usize },

    /// Reports live next to their subject; cluster-scoped subjects have nowhere to go
    #[error("cannot store a report for {0}: subject is not namespaced")]
    InvalidReport(ResourceRef),

    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

impl StoreError {
    /// Retry classification for the reconciler
    pub fn kind(&self) -> FailureKind {
        match self {
            StoreError::InvalidReport(_) => FailureKind::Permanent,
            StoreError::Cluster(ClusterError::InvalidRequest(_)) => FailureKind::Permanent,
            _ => FailureKind::Retryable,
        }
    }
}

/// Build a fresh report object for `key`
pub fn build_report(
    key: &ReportKey,
    plugin_version: &str,
    subject_generation: Option<i64>,
    result: AuditResultRecord,
    now: DateTime<Utc>,
) -> ConfigAuditReport {
    let owner_references = key.subject.uid.as_ref().map(|uid| {
        vec![OwnerReference {
            api_version: key.subject.api_version.clone(),
            kind: key.subject.kind.clone(),
            name: key.subject.name.clone(),
            uid: uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(false),
        }]
    });

    ConfigAuditReport {
        metadata: ObjectMeta {
            name: Some(key.name()),
            namespace: key.subject.namespace.clone(),
            labels: Some(ConfigAuditReport::labels_for(&key.subject, &key.plugin)),
            owner_references,
            ..ObjectMeta::default()
        },
        spec: ConfigAuditReportSpec {
            subject: key.subject.clone(),
            plugin: PluginIdentity {
                name: key.plugin.clone(),
                version: plugin_version.to_string(),
            },
            subject_generation,
            created_at: now,
            updated_at: now,
            result,
        },
    }
}

/// Point the controller owner reference at `owner`
///
/// A subject recreated under the same name has a new uid; a reference to the
/// old uid would let the garbage collector delete the fresh report.
fn replace_controller_ref(metadata: &mut ObjectMeta, owner: OwnerReference) {
    let refs = metadata.owner_references.get_or_insert_with(Vec::new);
    refs.retain(|existing| existing.controller != Some(true) && existing.uid != owner.uid);
    refs.push(owner);
}

/// Reads and writes ConfigAuditReports
#[derive(Clone)]
pub struct ReportReadWriter {
    client: Arc<dyn ClusterClientTrait>,
    max_attempts: usize,
}

impl std::fmt::Debug for ReportReadWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportReadWriter")
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl ReportReadWriter {
    pub fn new(client: Arc<dyn ClusterClientTrait>) -> Self {
        Self {
            client,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Fetch the report for `key`
    pub async fn get(&self, key: &ReportKey) -> Result<ConfigAuditReport, StoreError> {
        let name = key.name();
        self.client.get_report(key.namespace(), &name).await.map_err(|e| match e {
            ClusterError::NotFound(_) => StoreError::NotFound(name),
            other => StoreError::Cluster(other),
        })
    }

    /// Delete the report for `key`
    pub async fn delete(&self, key: &ReportKey) -> Result<(), StoreError> {
        let name = key.name();
        self.client.delete_report(key.namespace(), &name).await.map_err(|e| match e {
            ClusterError::NotFound(_) => StoreError::NotFound(name.clone()),
            other => StoreError::Cluster(other),
        })?;
        info!("Deleted ConfigAuditReport {}/{}", key.namespace(), name);
        Ok(())
    }

    /// Create or replace the report for `key`
    ///
    /// The stored object keeps its metadata (labels, owner references added
    /// by others) and original `created_at`; spec fields are overwritten.
    pub async fn upsert(
        &self,
        key: &ReportKey,
        plugin_version: &str,
        subject_generation: Option<i64>,
        result: AuditResultRecord,
    ) -> Result<ConfigAuditReport, StoreError> {
        if key.subject.namespace.is_none() {
            return Err(StoreError::InvalidReport(key.subject.clone()));
        }

        let name = key.name();
        for attempt in 1..=self.max_attempts {
            let now = Utc::now();
            let desired = build_report(key, plugin_version, subject_generation, result.clone(), now);

            let outcome = match self.get(key).await {
                Err(StoreError::NotFound(_)) => self.client.create_report(&desired).await,
                Err(e) => return Err(e),
                Ok(existing) => {
                    let mut updated = existing;
                    updated.spec = ConfigAuditReportSpec {
                        created_at: updated.spec.created_at,
                        ..desired.spec
                    };
                    let labels = updated.metadata.labels.get_or_insert_with(Default::default);
                    labels.extend(desired.metadata.labels.unwrap_or_default());
                    if let Some(owner) = desired.metadata.owner_references.and_then(|refs| refs.into_iter().next()) {
                        replace_controller_ref(&mut updated.metadata, owner);
                    }
                    self.client.replace_report(&updated).await
                }
            };

            match outcome {
                Ok(stored) => {
                    debug!(attempt, "Stored ConfigAuditReport {}/{}", key.namespace(), name);
                    return Ok(stored);
                }
                Err(e) if e.is_conflict() => {
                    warn!(attempt, "Write conflict on ConfigAuditReport {}/{}: {}", key.namespace(), name, e);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(StoreError::ConflictExhausted {
            name,
            attempts: self.max_attempts,
        })
    }
}

#[cfg(test)]
#[path = "store_test.rs"]
mod store_test;
