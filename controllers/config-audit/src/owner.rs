//! Owner chain resolution
//!
//! Walks `metadata.ownerReferences` upward from an observed object until it
//! reaches a top-level kind or an object without a controller owner. The
//! last link is the audit subject.
//!
//! Only owner references with `controller: true` are followed. An object
//! with more than one controller owner is ambiguous and never guessed at.
//! Traversal is bounded by `MAX_OWNER_DEPTH` hops and by a visited-uid set,
//! so malformed owner graphs terminate with an error.

use crate::error::FailureKind;
use cluster_client::{ClusterClientTrait, ClusterError};
use crds::ResourceRef;
use kube::api::DynamicObject;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument};

/// Maximum number of owner hops followed from the observed object
pub const MAX_OWNER_DEPTH: usize = 10;

/// Ordered owner chain, observed object first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerChain {
    observed: ResourceRef,
    owners: Vec<ResourceRef>,
    subject_generation: Option<i64>,
}

impl OwnerChain {
    /// Chain of a single object that is its own subject
    #[cfg(test)]
    pub fn single(observed: ResourceRef, generation: Option<i64>) -> Self {
        Self {
            observed,
            owners: Vec::new(),
            subject_generation: generation,
        }
    }

    /// All links, observed object first and subject last
    pub fn links(&self) -> impl Iterator<Item = &ResourceRef> {
        std::iter::once(&self.observed).chain(self.owners.iter())
    }

    pub fn observed(&self) -> &ResourceRef {
        &self.observed
    }

    /// Top-level owner (the audit subject)
    pub fn subject(&self) -> &ResourceRef {
        self.owners.last().unwrap_or(&self.observed)
    }

    /// `metadata.generation` of the subject when it was read
    pub fn subject_generation(&self) -> Option<i64> {
        self.subject_generation
    }

    /// True when `reference` names one of the links
    pub fn contains(&self, reference: &ResourceRef) -> bool {
        self.links().any(|link| link.same_object(reference))
    }

    /// The subject, if it is a Pod
    pub fn pod(&self) -> Option<&ResourceRef> {
        let subject = self.subject();
        subject.is_pod().then_some(subject)
    }

    /// Number of links including the observed object
    pub fn len(&self) -> usize {
        self.owners.len() + 1
    }
}

/// Owner resolution failures
#[derive(Debug, Error)]
pub enum ResolveError {
    /// A link disappeared; the object is being deleted
    #[error("{0} no longer exists")]
    NotFound(ResourceRef),

    #[error("{object} has {owners} controller owners")]
    AmbiguousOwner { object: ResourceRef, owners: usize },

    #[error("owner chain of {0} exceeds {MAX_OWNER_DEPTH} links")]
    DepthExceeded(ResourceRef),

    #[error("owner chain of {0} contains a cycle")]
    Cycle(ResourceRef),

    /// API errors other than not-found
    #[error("failed to read owner chain: {0}")]
    Transient(#[source] ClusterError),
}

impl ResolveError {
    /// Retry classification; `None` for a benign skip
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            ResolveError::NotFound(_) => None,
            ResolveError::Transient(_) => Some(FailureKind::Retryable),
            ResolveError::AmbiguousOwner { .. } | ResolveError::DepthExceeded(_) | ResolveError::Cycle(_) => {
                Some(FailureKind::Permanent)
            }
        }
    }
}

/// Resolves owner chains through the cluster API
pub struct OwnerResolver {
    client: Arc<dyn ClusterClientTrait>,
    top_level_kinds: Vec<String>,
}

impl std::fmt::Debug for OwnerResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnerResolver")
            .field("top_level_kinds", &self.top_level_kinds)
            .finish_non_exhaustive()
    }
}

impl OwnerResolver {
    pub fn new(client: Arc<dyn ClusterClientTrait>, top_level_kinds: Vec<String>) -> Self {
        Self { client, top_level_kinds }
    }

    fn is_top_level(&self, kind: &str) -> bool {
        self.top_level_kinds.iter().any(|k| k == kind)
    }

    async fn fetch(&self, reference: &ResourceRef) -> Result<DynamicObject, ResolveError> {
        let object = self.client.get_object(reference).await.map_err(|e| match e {
            ClusterError::NotFound(_) => ResolveError::NotFound(reference.clone()),
            other => ResolveError::Transient(other),
        })?;
        // A recreated object with the same name is not the one we were pointed at
        if let (Some(expected), Some(actual)) = (&reference.uid, &object.metadata.uid) {
            if expected != actual {
                return Err(ResolveError::NotFound(reference.clone()));
            }
        }
        Ok(object)
    }

    /// Resolve the owner chain of `observed`
    #[instrument(skip_all, fields(observed = %observed))]
    pub async fn resolve(&self, observed: &ResourceRef) -> Result<OwnerChain, ResolveError> {
        let mut links: Vec<ResourceRef> = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut current = observed.clone();

        let generation = loop {
            let object = self.fetch(&current).await?;
            let generation = object.metadata.generation;
            if current.uid.is_none() {
                current.uid.clone_from(&object.metadata.uid);
            }
            if let Some(uid) = &current.uid {
                if !visited.insert(uid.clone()) {
                    return Err(ResolveError::Cycle(observed.clone()));
                }
            }

            if self.is_top_level(&current.kind) {
                links.push(current);
                break generation;
            }

            let controllers: Vec<_> = object
                .metadata
                .owner_references
                .unwrap_or_default()
                .into_iter()
                .filter(|owner| owner.controller == Some(true))
                .collect();

            let namespace = current.namespace.clone();
            match controllers.as_slice() {
                [] => {
                    links.push(current);
                    break generation;
                }
                [owner] => {
                    if links.len() >= MAX_OWNER_DEPTH {
                        return Err(ResolveError::DepthExceeded(observed.clone()));
                    }
                    let next = ResourceRef {
                        api_version: owner.api_version.clone(),
                        kind: owner.kind.clone(),
                        namespace,
                        name: owner.name.clone(),
                        uid: (!owner.uid.is_empty()).then(|| owner.uid.clone()),
                    };
                    debug!("{} is controlled by {}", current, next);
                    links.push(current);
                    current = next;
                }
                many => {
                    return Err(ResolveError::AmbiguousOwner {
                        object: current,
                        owners: many.len(),
                    });
                }
            }
        };

        let mut links = links.into_iter();
        let observed = links.next().unwrap_or_else(|| observed.clone());
        Ok(OwnerChain {
            observed,
            owners: links.collect(),
            subject_generation: generation,
        })
    }
}

#[cfg(test)]
#[path = "owner_test.rs"]
mod owner_test;
