//! Cluster Access Client
//!
//! Narrow, mockable access to the cluster state the config audit controller
//! needs: generic object reads for owner-chain traversal, pod logs, CRUD over
//! `ConfigAuditReport` objects and the operator `ConfigMap`.
//!
//! # Example
//!
//! ```no_run
//! use cluster_client::{ClusterClient, ClusterClientTrait};
//! use crds::ResourceRef;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = ClusterClient::new(kube::Client::try_default().await?);
//!
//! // Fetch any namespaced object by reference
//! let subject = ResourceRef::new("apps/v1", "Deployment", "default", "nginx");
//! let object = client.get_object(&subject).await?;
//! println!("owners: {:?}", object.metadata.owner_references);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod models;
#[path = "trait.rs"]
pub mod cluster_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::ClusterClient;
pub use cluster_trait::ClusterClientTrait;
pub use error::ClusterError;
pub use models::*;
#[cfg(feature = "test-util")]
pub use mock::MockClusterClient;
