//! Cluster client errors

use thiserror::Error;

/// Errors that can occur when talking to the Kubernetes API
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Object does not exist (HTTP 404)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency check failed (HTTP 409 on update)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Object already exists (HTTP 409 on create)
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Invalid request (e.g., unknown kind, missing namespace)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Any other Kubernetes API or transport error
    #[error("Kubernetes error: {0}")]
    Kube(#[source] kube::Error),
}

impl ClusterError {
    /// True for `NotFound`
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound(_))
    }

    /// True for `Conflict` and `AlreadyExists`, which both mean "re-read and retry"
    pub fn is_conflict(&self) -> bool {
        matches!(self, ClusterError::Conflict(_) | ClusterError::AlreadyExists(_))
    }
}

impl From<kube::Error> for ClusterError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(response) if response.code == 404 => {
                ClusterError::NotFound(response.message)
            }
            kube::Error::Api(response) if response.code == 409 && response.reason == "AlreadyExists" => {
                ClusterError::AlreadyExists(response.message)
            }
            kube::Error::Api(response) if response.code == 409 => {
                ClusterError::Conflict(response.message)
            }
            other => ClusterError::Kube(other),
        }
    }
}
