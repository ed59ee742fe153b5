//! Controller-specific error types.
//!
//! Components surface coarse error kinds; only the reconciler decides
//! whether a failure is retried, terminal, or a benign skip.

use crate::config::ConfigError;
use crate::reconciler::Phase;
use cluster_client::ClusterError;
use kube::Error as KubeError;
use std::fmt;
use thiserror::Error;

/// How a failed reconcile cycle is treated by the work queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network, timeout or conflict exhaustion; requeue with backoff
    Retryable,
    /// Malformed input or ambiguous ownership; terminal for this cycle
    Permanent,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Retryable => write!(f, "retryable"),
            FailureKind::Permanent => write!(f, "permanent"),
        }
    }
}

/// A reconcile cycle that ended in `Failed(kind)`
#[derive(Debug, Error)]
#[error("{kind} failure during {}: {message}", .phase.map_or_else(|| "reconcile".to_string(), |p| p.to_string()))]
pub struct ReconcileError {
    /// Phase the cycle was in when it failed (None when cancelled from outside)
    pub phase: Option<Phase>,
    /// Retry classification
    pub kind: FailureKind,
    /// Human-readable cause
    pub message: String,
}

impl ReconcileError {
    /// Failure in a known phase
    pub fn new(phase: Phase, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            phase: Some(phase),
            kind,
            message: message.into(),
        }
    }

    /// Cycle aborted by cancellation or timeout
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self {
            phase: None,
            kind: FailureKind::Retryable,
            message: message.into(),
        }
    }

    /// True when the work queue should retry with backoff
    pub fn is_retryable(&self) -> bool {
        self.kind == FailureKind::Retryable
    }
}

/// Errors that can stop the config audit controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Cluster client error
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// Invalid operator configuration (fatal at startup)
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// Socket or listener error (health probes)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}
