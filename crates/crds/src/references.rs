//! Kubernetes object references
//!
//! Identifies the object being audited (the subject) and every link of its
//! owner chain. Follows the Kubernetes `ObjectReference` shape with
//! apiVersion, kind, namespace, name and uid.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reference to a Kubernetes object observed by the controller
///
/// Immutable once observed. `uid` is optional because deletion
/// notifications only carry kind, namespace and name.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    /// API version of the referenced object (e.g., "apps/v1")
    pub api_version: String,

    /// Kind of the referenced object (e.g., "Deployment")
    pub kind: String,

    /// Namespace of the referenced object (None for cluster-scoped objects)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Name of the referenced object
    pub name: String,

    /// Unique identifier assigned by the API server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

impl ResourceRef {
    /// Create a namespaced reference without a uid
    pub fn new(api_version: &str, kind: &str, namespace: &str, name: &str) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            namespace: Some(namespace.to_string()),
            name: name.to_string(),
            uid: None,
        }
    }

    /// Attach the API server uid
    #[must_use]
    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = Some(uid.into());
        self
    }

    /// True when both references point at the same object.
    ///
    /// Kind, namespace and name must match; uids are compared only when
    /// both sides carry one.
    pub fn same_object(&self, other: &ResourceRef) -> bool {
        let uid_matches = match (&self.uid, &other.uid) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        };
        self.kind == other.kind
            && self.namespace == other.namespace
            && self.name == other.name
            && uid_matches
    }

    /// Namespace or the empty string for cluster-scoped objects
    pub fn namespace_or_default(&self) -> &str {
        self.namespace.as_deref().unwrap_or_default()
    }

    /// True for Pods, the only log-bearing kind
    pub fn is_pod(&self) -> bool {
        self.kind == "Pod"
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_object_ignores_missing_uid() {
        let observed = ResourceRef::new("apps/v1", "Deployment", "ns", "app-1").with_uid("abc");
        let deleted = ResourceRef::new("apps/v1", "Deployment", "ns", "app-1");
        assert!(observed.same_object(&deleted));
        assert!(deleted.same_object(&observed));
    }

    #[test]
    fn test_same_object_detects_recreated_object() {
        let old = ResourceRef::new("apps/v1", "Deployment", "ns", "app-1").with_uid("abc");
        let new = ResourceRef::new("apps/v1", "Deployment", "ns", "app-1").with_uid("def");
        assert!(!old.same_object(&new));
    }

    #[test]
    fn test_display() {
        let pod = ResourceRef::new("v1", "Pod", "ns", "pod-1");
        assert_eq!(pod.to_string(), "Pod ns/pod-1");
    }
}
