//! Watch cache for ConfigAuditReports.
//!
//! Mirrors every report in the cluster from a watch stream and fans change
//! events out to subscribers. Each subscriber has its own ordered queue and
//! drain task, so events for a key are delivered in the order they were
//! observed. A slow handler only delays its own queue.
//!
//! The initial list is buffered and swapped in when the watcher reports
//! `InitDone`; only then is the cache marked synced. Consumers must not
//! assume they have seen every report before `wait_for_sync` returns.

use crate::error::ControllerError;
use async_trait::async_trait;
use crds::ConfigAuditReport;
use futures::StreamExt;
use kube::{Api, ResourceExt};
use kube_runtime::{WatchStreamExt, watcher};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Change to a cached report
#[derive(Debug, Clone)]
pub enum ReportEvent {
    Created(Arc<ConfigAuditReport>),
    Updated {
        old: Arc<ConfigAuditReport>,
        new: Arc<ConfigAuditReport>,
    },
    Deleted(Arc<ConfigAuditReport>),
}

/// Receives report changes; every method defaults to a no-op
#[async_trait]
pub trait ReportEventHandler: Send + Sync {
    async fn on_created(&self, _report: &ConfigAuditReport) {}

    async fn on_updated(&self, _old: &ConfigAuditReport, _new: &ConfigAuditReport) {}

    async fn on_deleted(&self, _report: &ConfigAuditReport) {}
}

/// Handler that logs every change
#[derive(Debug, Default)]
pub struct LoggingHandler;

fn describe(report: &ConfigAuditReport) -> String {
    format!("{}/{}", report.namespace().unwrap_or_default(), report.name_any())
}

#[async_trait]
impl ReportEventHandler for LoggingHandler {
    async fn on_created(&self, report: &ConfigAuditReport) {
        info!("ConfigAuditReport has been created: {}", describe(report));
    }

    async fn on_updated(&self, _old: &ConfigAuditReport, new: &ConfigAuditReport) {
        info!("ConfigAuditReport has been updated: {}", describe(new));
    }

    async fn on_deleted(&self, report: &ConfigAuditReport) {
        info!("ConfigAuditReport has been deleted: {}", describe(report));
    }
}

type Entries = BTreeMap<String, Arc<ConfigAuditReport>>;

#[derive(Default)]
struct CacheState {
    entries: Entries,
    /// Initial list being collected between `Init` and `InitDone`
    pending: Option<Entries>,
    subscribers: Vec<mpsc::UnboundedSender<ReportEvent>>,
}

impl CacheState {
    fn broadcast(&mut self, event: &ReportEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Read-only mirror of ConfigAuditReports with change subscriptions
pub struct ReportCache {
    state: Mutex<CacheState>,
    synced: watch::Sender<bool>,
}

impl std::fmt::Debug for ReportCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportCache")
            .field("synced", &self.is_synced())
            .finish_non_exhaustive()
    }
}

fn cache_key(report: &ConfigAuditReport) -> String {
    describe(report)
}

impl ReportCache {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            synced: watch::Sender::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a handler. Reports already cached are replayed as `Created`.
    pub fn subscribe(&self, handler: Arc<dyn ReportEventHandler>) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        {
            let mut state = self.lock();
            for report in state.entries.values() {
                // Receiver is alive until the drain task starts
                let _ = tx.send(ReportEvent::Created(Arc::clone(report)));
            }
            state.subscribers.push(tx);
        }

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match &event {
                    ReportEvent::Created(report) => handler.on_created(report).await,
                    ReportEvent::Updated { old, new } => handler.on_updated(old, new).await,
                    ReportEvent::Deleted(report) => handler.on_deleted(report).await,
                }
            }
        })
    }

    /// Apply one watch event to the mirror
    pub fn apply(&self, event: watcher::Event<ConfigAuditReport>) {
        let mut state = self.lock();
        match event {
            watcher::Event::Init => {
                debug!("ConfigAuditReport cache relisting");
                state.pending = Some(Entries::new());
            }
            watcher::Event::InitApply(report) => {
                let key = cache_key(&report);
                state.pending.get_or_insert_with(Entries::new).insert(key, Arc::new(report));
            }
            watcher::Event::InitDone => {
                let Some(listed) = state.pending.take() else {
                    return;
                };
                let previous = std::mem::replace(&mut state.entries, listed);
                let mut events = Vec::new();
                for (key, report) in &state.entries {
                    match previous.get(key) {
                        None => events.push(ReportEvent::Created(Arc::clone(report))),
                        Some(old) if old.resource_version() != report.resource_version() => {
                            events.push(ReportEvent::Updated {
                                old: Arc::clone(old),
                                new: Arc::clone(report),
                            });
                        }
                        Some(_) => {}
                    }
                }
                for (key, report) in &previous {
                    if !state.entries.contains_key(key) {
                        events.push(ReportEvent::Deleted(Arc::clone(report)));
                    }
                }
                for event in &events {
                    state.broadcast(event);
                }
                let count = state.entries.len();
                drop(state);
                if !self.synced.send_replace(true) {
                    info!("ConfigAuditReport cache synced with {} reports", count);
                }
            }
            watcher::Event::Apply(report) => {
                let report = Arc::new(report);
                let previous = state.entries.insert(cache_key(&report), Arc::clone(&report));
                let event = match previous {
                    Some(old) if old.resource_version() == report.resource_version() => return,
                    Some(old) => ReportEvent::Updated { old, new: report },
                    None => ReportEvent::Created(report),
                };
                state.broadcast(&event);
            }
            watcher::Event::Delete(report) => {
                let key = cache_key(&report);
                let removed = state.entries.remove(&key).unwrap_or_else(|| Arc::new(report));
                state.broadcast(&ReportEvent::Deleted(removed));
            }
        }
    }

    /// Cached report by namespace and name
    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<ConfigAuditReport>> {
        self.lock().entries.get(&format!("{namespace}/{name}")).cloned()
    }

    /// All cached reports, ordered by namespace and name
    pub fn list(&self) -> Vec<Arc<ConfigAuditReport>> {
        self.lock().entries.values().cloned().collect()
    }

    /// True once the initial list has been applied
    pub fn is_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Wait until the initial list has been applied
    pub async fn wait_for_sync(&self) {
        let mut rx = self.synced.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait
        let _ = rx.wait_for(|synced| *synced).await;
    }

    /// Mirror reports from the cluster until the watch stream ends
    pub async fn run(self: Arc<Self>, api: Api<ConfigAuditReport>) -> Result<(), ControllerError> {
        info!("Starting ConfigAuditReport watcher");
        let mut stream = Box::pin(watcher(api, watcher::Config::default()).default_backoff());

        while let Some(result) = stream.next().await {
            match result {
                Ok(event) => self.apply(event),
                Err(e) => warn!("ConfigAuditReport watch error: {}", e),
            }
        }

        Err(ControllerError::Watch("ConfigAuditReport watch stream ended".to_string()))
    }
}

impl Default for ReportCache {
    fn default() -> Self {
        Self::new()
    }
}
