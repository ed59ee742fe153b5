//! Kubernetes resource watchers.
//!
//! One `kube_runtime::Controller` per audited kind drives the reconciler.
//! Objects are watched as `DynamicObject`s so a single code path serves
//! Pods, ReplicaSets and every top-level workload kind. The controller
//! handles reconnection, debouncing and per-object serialization; the
//! reconciler decides what each change means.

use crate::error::{ControllerError, ReconcileError};
use crate::reconciler::{EventType, Reconciler, TriggerEvent};
use crds::ResourceRef;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{Pod, ReplicationController};
use kube::api::{ApiResource, DynamicObject};
use kube::{Api, Client, ResourceExt};
use kube_runtime::controller::{Action, Config as ControllerConfig, Error as RuntimeError};
use kube_runtime::reflector::ObjectRef;
use kube_runtime::{Controller, watcher};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Debounce applied to bursts of changes for the same object
const DEBOUNCE: Duration = Duration::from_secs(5);

/// Kinds whose changes can trigger an audit
pub fn target_kinds() -> Vec<ApiResource> {
    vec![
        ApiResource::erase::<Pod>(&()),
        ApiResource::erase::<ReplicaSet>(&()),
        ApiResource::erase::<ReplicationController>(&()),
        ApiResource::erase::<Deployment>(&()),
        ApiResource::erase::<StatefulSet>(&()),
        ApiResource::erase::<DaemonSet>(&()),
        ApiResource::erase::<Job>(&()),
        ApiResource::erase::<CronJob>(&()),
    ]
}

/// Reference to a watched object
pub fn resource_ref(object: &DynamicObject, resource: &ApiResource) -> ResourceRef {
    ResourceRef {
        api_version: resource.api_version.clone(),
        kind: resource.kind.clone(),
        namespace: object.metadata.namespace.clone(),
        name: object.name_any(),
        uid: object.metadata.uid.clone(),
    }
}

fn deleted_ref(object: &ObjectRef<DynamicObject>, resource: &ApiResource) -> ResourceRef {
    ResourceRef {
        api_version: resource.api_version.clone(),
        kind: resource.kind.clone(),
        namespace: object.namespace.clone(),
        name: object.name.clone(),
        uid: None,
    }
}

struct WatchContext {
    reconciler: Arc<Reconciler>,
    resource: ApiResource,
    shutdown: CancellationToken,
}

async fn reconcile(object: Arc<DynamicObject>, ctx: Arc<WatchContext>) -> Result<Action, ReconcileError> {
    let observed = resource_ref(&object, &ctx.resource);
    if object.metadata.deletion_timestamp.is_some() {
        debug!("{} is being deleted, waiting for removal", observed);
        return Ok(Action::await_change());
    }

    let outcome = ctx.reconciler.reconcile_with_cancel(&observed, &ctx.shutdown).await?;
    Ok(match outcome.requeue_after() {
        Some(delay) => Action::requeue(delay),
        None => Action::await_change(),
    })
}

fn error_policy(object: Arc<DynamicObject>, error: &ReconcileError, ctx: Arc<WatchContext>) -> Action {
    let observed = resource_ref(&object, &ctx.resource);
    if error.is_retryable() {
        let delay = ctx.reconciler.next_backoff(&observed);
        debug!("Retrying {} in {}s", observed, delay.as_secs());
        Action::requeue(delay)
    } else {
        // Re-audited on the next change or scan
        Action::requeue(ctx.reconciler.config().scan_interval)
    }
}

/// Remove the report of a deleted object in the background
pub fn spawn_cleanup(reconciler: Arc<Reconciler>, subject: ResourceRef) -> JoinHandle<()> {
    tokio::spawn(async move {
        let event = TriggerEvent {
            event_type: EventType::Deleted,
            subject,
        };
        if let Err(e) = reconciler.handle(&event).await {
            warn!("Cleanup for deleted {} failed: {}", event.subject, e);
        }
    })
}

/// Watch one kind and reconcile its objects until `shutdown` is cancelled
pub async fn watch_kind(
    client: Client,
    resource: ApiResource,
    reconciler: Arc<Reconciler>,
    concurrency: u16,
    shutdown: CancellationToken,
) -> Result<(), ControllerError> {
    info!("Starting {} watcher", resource.kind);

    let api: Api<DynamicObject> = Api::all_with(client, &resource);
    let controller_config = ControllerConfig::default()
        .debounce(DEBOUNCE)
        .concurrency(concurrency);
    let ctx = Arc::new(WatchContext {
        reconciler: Arc::clone(&reconciler),
        resource: resource.clone(),
        shutdown: shutdown.clone(),
    });

    Controller::new_with(api, watcher::Config::default(), resource.clone())
        .with_config(controller_config)
        .graceful_shutdown_on(shutdown.cancelled_owned())
        .run(reconcile, error_policy, ctx)
        .for_each(|result| {
            let reconciler = Arc::clone(&reconciler);
            let resource = resource.clone();
            async move {
                match result {
                    Ok((object, _action)) => debug!("Reconciled {} {}", resource.kind, object.name),
                    // The object left the cache between trigger and reconcile: it was deleted
                    Err(RuntimeError::ObjectNotFound(object)) => {
                        spawn_cleanup(reconciler, deleted_ref(&object, &resource));
                    }
                    Err(RuntimeError::ReconcilerFailed(e, object)) => {
                        debug!("Reconcile of {} {} failed: {}", resource.kind, object.name, e);
                    }
                    Err(e) => error!("{} controller error: {}", resource.kind, e),
                }
            }
        })
        .await;

    info!("{} watcher stopped", resource.kind);
    Ok(())
}
