//! ConfigAuditReport CRD
//!
//! Persisted result of auditing one workload with one plugin. Keyed by
//! (subject, plugin name); updates replace the report in place.

use crate::references::ResourceRef;
use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Label holding the audited subject's kind
pub const LABEL_RESOURCE_KIND: &str = "audit.microscaler.io/resource-kind";
/// Label holding the audited subject's name (omitted when not a valid label value)
pub const LABEL_RESOURCE_NAME: &str = "audit.microscaler.io/resource-name";
/// Label holding the plugin name that produced the report
pub const LABEL_PLUGIN: &str = "audit.microscaler.io/plugin";

/// Kubernetes object names are DNS subdomains
const MAX_OBJECT_NAME_LEN: usize = 253;
const MAX_LABEL_VALUE_LEN: usize = 63;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "audit.microscaler.io",
    version = "v1alpha1",
    kind = "ConfigAuditReport",
    namespaced,
    shortname = "configaudit",
    printcolumn = r#"{"name":"Subject","type":"string","jsonPath":".spec.subject.name"}"#,
    printcolumn = r#"{"name":"Plugin","type":"string","jsonPath":".spec.plugin.name"}"#,
    printcolumn = r#"{"name":"Outcome","type":"string","jsonPath":".spec.result.outcome"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ConfigAuditReportSpec {
    /// Top-level workload the report was produced for
    pub subject: ResourceRef,

    /// Plugin that produced the result
    pub plugin: PluginIdentity,

    /// `metadata.generation` of the subject when it was audited
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_generation: Option<i64>,

    /// When the report was first written
    pub created_at: DateTime<Utc>,

    /// When the report was last written
    pub updated_at: DateTime<Utc>,

    /// Audit outcome and plugin payload
    pub result: AuditResultRecord,
}

/// Name and semantic version of an audit plugin
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PluginIdentity {
    /// Registered plugin name
    pub name: String,

    /// Semantic version string
    pub version: String,
}

/// Outcome of one audit
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuditResultRecord {
    /// Whether the plugin produced a result
    pub outcome: AuditOutcome,

    /// Plugin-owned structured payload, opaque to the controller
    #[serde(default)]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub payload: serde_json::Value,

    /// Error message for failed audits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
/// Audit outcome
///
/// Serializes as PascalCase ("Succeeded", "Failed").
#[serde(rename_all = "PascalCase")]
pub enum AuditOutcome {
    /// The plugin produced a result payload
    #[default]
    Succeeded,

    /// The plugin rejected the subject; the error is recorded in the report
    Failed,
}

fn preserve_unknown_fields(_: &mut schemars::SchemaGenerator) -> schemars::Schema {
    schemars::json_schema!({
        "nullable": true,
        "x-kubernetes-preserve-unknown-fields": true
    })
}

impl ConfigAuditReport {
    /// Deterministic object name for the (subject, plugin) key
    ///
    /// `<kind>-<name>-<plugin>` in lower case, truncated to the object name
    /// limit.
    pub fn name_for(subject: &ResourceRef, plugin: &str) -> String {
        let mut name = format!("{}-{}-{}", subject.kind, subject.name, plugin).to_lowercase();
        if name.len() > MAX_OBJECT_NAME_LEN {
            name.truncate(MAX_OBJECT_NAME_LEN);
            while name.ends_with(['-', '.']) {
                name.pop();
            }
        }
        name
    }

    /// Labels attached to every report for a subject and plugin
    pub fn labels_for(subject: &ResourceRef, plugin: &str) -> std::collections::BTreeMap<String, String> {
        let mut labels = std::collections::BTreeMap::new();
        labels.insert(LABEL_RESOURCE_KIND.to_string(), subject.kind.clone());
        labels.insert(LABEL_PLUGIN.to_string(), plugin.to_string());
        if subject.name.len() <= MAX_LABEL_VALUE_LEN {
            labels.insert(LABEL_RESOURCE_NAME.to_string(), subject.name.clone());
        }
        labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_for_is_lowercase_and_keyed_by_plugin() {
        let subject = ResourceRef::new("apps/v1", "Deployment", "ns", "app-1");
        assert_eq!(
            ConfigAuditReport::name_for(&subject, "plugin-v1"),
            "deployment-app-1-plugin-v1"
        );
        assert_ne!(
            ConfigAuditReport::name_for(&subject, "plugin-v1"),
            ConfigAuditReport::name_for(&subject, "plugin-v2")
        );
    }

    #[test]
    fn test_name_for_truncates_long_names() {
        let subject = ResourceRef::new("apps/v1", "Deployment", "ns", &"a".repeat(260));
        let name = ConfigAuditReport::name_for(&subject, "workload-hardening");
        assert!(name.len() <= 253);
        assert!(name.starts_with("deployment-aaa"));
    }

    #[test]
    fn test_labels_skip_long_names() {
        let subject = ResourceRef::new("apps/v1", "Deployment", "ns", &"a".repeat(64));
        let labels = ConfigAuditReport::labels_for(&subject, "workload-hardening");
        assert!(!labels.contains_key(LABEL_RESOURCE_NAME));
        assert_eq!(labels.get(LABEL_RESOURCE_KIND).map(String::as_str), Some("Deployment"));
    }

    #[test]
    fn test_outcome_serializes_pascal_case() {
        let json = serde_json::to_string(&AuditOutcome::Failed).unwrap();
        assert_eq!(json, "\"Failed\"");
    }
}
