//! Request models for the cluster client

/// Options for reading container logs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogOptions {
    /// Container to read; required for multi-container pods
    pub container: Option<String>,

    /// Only return the last N lines
    pub tail_lines: Option<i64>,

    /// Stop after this many bytes
    pub limit_bytes: Option<i64>,

    /// Read the previous (terminated) container instance
    pub previous: bool,

    /// Only return logs newer than this many seconds
    pub since_seconds: Option<i64>,
}

impl LogOptions {
    /// Options selecting a single container
    pub fn for_container(container: impl Into<String>) -> Self {
        Self {
            container: Some(container.into()),
            ..Self::default()
        }
    }
}
