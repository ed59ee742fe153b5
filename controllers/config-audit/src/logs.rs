//! Pod log retrieval for audit plugins

use cluster_client::{ClusterClientTrait, ClusterError, LogOptions};
use crds::ResourceRef;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Errors while reading logs
#[derive(Debug, Error)]
pub enum LogsError {
    /// Only pods have logs
    #[error("{0} is not a Pod")]
    NotAPod(ResourceRef),

    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

/// Reads container logs of pods
#[derive(Clone)]
pub struct LogsReader {
    client: Arc<dyn ClusterClientTrait>,
}

impl LogsReader {
    pub fn new(client: Arc<dyn ClusterClientTrait>) -> Self {
        Self { client }
    }

    /// Fetch logs for a pod; `Ok(None)` when the pod or container is gone
    pub async fn fetch_logs(&self, pod: &ResourceRef, options: &LogOptions) -> Result<Option<Vec<u8>>, LogsError> {
        if !pod.is_pod() {
            return Err(LogsError::NotAPod(pod.clone()));
        }
        match self.client.read_logs(pod.namespace_or_default(), &pod.name, options).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.is_not_found() => {
                debug!("No logs for {}: {}", pod, e);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster_client::MockClusterClient;

    #[tokio::test]
    async fn test_fetch_logs() {
        let mock = MockClusterClient::new();
        mock.set_logs("ns", "pod-1", Some("app"), b"started\n");
        let reader = LogsReader::new(Arc::new(mock));
        let pod = ResourceRef::new("v1", "Pod", "ns", "pod-1");

        let logs = reader.fetch_logs(&pod, &LogOptions::for_container("app")).await.unwrap();
        assert_eq!(logs.as_deref(), Some(&b"started\n"[..]));

        let missing = reader.fetch_logs(&pod, &LogOptions::for_container("sidecar")).await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_rejects_non_pods() {
        let reader = LogsReader::new(Arc::new(MockClusterClient::new()));
        let deployment = ResourceRef::new("apps/v1", "Deployment", "ns", "app-1");
        let err = reader.fetch_logs(&deployment, &LogOptions::default()).await.unwrap_err();
        assert!(matches!(err, LogsError::NotAPod(_)));
    }
}
