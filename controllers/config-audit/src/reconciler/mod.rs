//! Reconciliation state machine for config audits.
//!
//! One invocation moves through `Resolving → Admitting → Auditing →
//! Persisting → Done`, and may end in `Failed(kind)` from any phase:
//!
//! - `Resolving`: walk the owner chain to the subject. A vanished object is
//!   a stale event and ends the cycle without error. A subject whose report
//!   is still fresh (same generation, same plugin version, younger than the
//!   scan interval) is not audited again.
//! - `Admitting`: take a slot from the admission limiter. A full scope ends
//!   the cycle with a requeue after backoff.
//! - `Auditing`: run the configured plugin. Transient plugin errors fail
//!   the cycle as retryable; permanent ones are persisted as a failed audit.
//! - `Persisting`: upsert the report.
//!
//! The admission token is released on every path out of the machine,
//! including failures, cancellation and timeouts.

use crate::backoff::FibonacciBackoff;
use crate::config::AuditConfig;
use crate::error::{FailureKind, ReconcileError};
use crate::limiter::AdmissionLimiter;
use crate::logs::LogsReader;
use crate::owner::{OwnerChain, OwnerResolver};
use crate::plugin::{AuditPlugin, Evidence, PluginError};
use crate::store::{ReportKey, ReportReadWriter, StoreError};
use chrono::Utc;
use cluster_client::ClusterClientTrait;
use crds::{AuditOutcome, AuditResultRecord, ConfigAuditReport, ResourceRef};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Phase of one reconcile invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Resolving,
    Admitting,
    Auditing,
    Persisting,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Resolving => "Resolving",
            Phase::Admitting => "Admitting",
            Phase::Auditing => "Auditing",
            Phase::Persisting => "Persisting",
            Phase::Done => "Done",
        };
        f.write_str(name)
    }
}

/// Kind of change notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Created,
    Updated,
    Deleted,
}

/// Change notification from the cluster watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerEvent {
    pub event_type: EventType,
    pub subject: ResourceRef,
}

/// How a reconcile invocation reached `Done`
#[derive(Debug, Clone)]
pub enum ReconcileOutcome {
    /// A report was written
    Reported {
        report: Box<ConfigAuditReport>,
        requeue_after: Duration,
    },
    /// The existing report is still fresh
    UpToDate { requeue_after: Duration },
    /// Admission was denied; try again later
    Requeue { requeue_after: Duration },
    /// Nothing to do (object gone or out of scope)
    Skipped,
    /// Deletion handled; `existed` is false when there was no report
    Removed { existed: bool },
}

impl ReconcileOutcome {
    /// Delay before the subject should be reconciled again
    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            ReconcileOutcome::Reported { requeue_after, .. }
            | ReconcileOutcome::UpToDate { requeue_after }
            | ReconcileOutcome::Requeue { requeue_after } => Some(*requeue_after),
            ReconcileOutcome::Skipped | ReconcileOutcome::Removed { .. } => None,
        }
    }
}

/// Backoff state for a subject
#[derive(Debug, Clone)]
struct BackoffState {
    backoff: FibonacciBackoff,
    error_count: u32,
}

impl BackoffState {
    fn new() -> Self {
        Self {
            backoff: FibonacciBackoff::default(),
            error_count: 0,
        }
    }
}

/// Audits workloads and persists their reports.
pub struct Reconciler {
    config: Arc<AuditConfig>,
    client: Arc<dyn ClusterClientTrait>,
    resolver: OwnerResolver,
    limiter: AdmissionLimiter,
    logs: LogsReader,
    plugin: Arc<dyn AuditPlugin>,
    store: ReportReadWriter,
    /// Backoff per subject (display form of the observed reference)
    backoff_states: Mutex<HashMap<String, BackoffState>>,
}

impl fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconciler")
            .field("plugin", &self.plugin.name())
            .field("limiter", &self.limiter)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a new reconciler. `config` must already be loaded and validated.
    pub fn new(
        config: Arc<AuditConfig>,
        client: Arc<dyn ClusterClientTrait>,
        limiter: AdmissionLimiter,
        plugin: Arc<dyn AuditPlugin>,
    ) -> Self {
        Self {
            resolver: OwnerResolver::new(Arc::clone(&client), config.top_level_kinds.clone()),
            logs: LogsReader::new(Arc::clone(&client)),
            store: ReportReadWriter::new(Arc::clone(&client)),
            config,
            client,
            limiter,
            plugin,
            backoff_states: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &AuditConfig {
        &self.config
    }

    pub fn limiter(&self) -> &AdmissionLimiter {
        &self.limiter
    }

    /// Dispatch a change notification
    pub async fn handle(&self, event: &TriggerEvent) -> Result<ReconcileOutcome, ReconcileError> {
        match event.event_type {
            EventType::Created | EventType::Updated => self.reconcile(&event.subject).await,
            EventType::Deleted => self.cleanup(&event.subject).await,
        }
    }

    /// Run one reconcile cycle, bounded by the audit timeout and `cancel`
    pub async fn reconcile_with_cancel(
        &self,
        observed: &ResourceRef,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let timeout = self.config.audit_timeout;
        tokio::select! {
            () = cancel.cancelled() => {
                warn!("Reconcile of {} cancelled", observed);
                Err(ReconcileError::cancelled(format!("reconcile of {observed} cancelled")))
            }
            result = tokio::time::timeout(timeout, self.reconcile(observed)) => {
                result.unwrap_or_else(|_elapsed| {
                    warn!("Reconcile of {} timed out after {:?}", observed, timeout);
                    Err(ReconcileError::cancelled(format!(
                        "reconcile of {observed} timed out after {}s",
                        timeout.as_secs()
                    )))
                })
            }
        }
    }

    /// Run one reconcile cycle for an observed object
    #[instrument(skip_all, fields(observed = %observed))]
    pub async fn reconcile(&self, observed: &ResourceRef) -> Result<ReconcileOutcome, ReconcileError> {
        if !self.config.in_scope(observed.namespace.as_deref()) {
            debug!("{} is outside the target namespaces, skipping", observed);
            return Ok(ReconcileOutcome::Skipped);
        }

        // Resolving
        let chain = match self.resolver.resolve(observed).await {
            Ok(chain) => chain,
            Err(e) => {
                return match e.kind() {
                    None => {
                        debug!("Stale event for {}: {}", observed, e);
                        Ok(ReconcileOutcome::Skipped)
                    }
                    Some(kind) => Err(self.fail(observed, Phase::Resolving, kind, e.to_string())),
                };
            }
        };
        let subject = chain.subject().clone();
        debug!("Resolved {} to {} through {} links", chain.observed(), subject, chain.len());
        let key = ReportKey::new(subject.clone(), self.plugin.name());

        if let Some(remaining) = self.fresh_for(&key, &chain).await {
            debug!("Report for {} is up to date, next audit in {}s", subject, remaining.as_secs());
            self.reset_backoff(observed);
            return Ok(ReconcileOutcome::UpToDate {
                requeue_after: remaining,
            });
        }

        // Admitting
        let scope = self.config.scope_key(&subject);
        let token = match self.limiter.try_acquire(&scope) {
            Ok(token) => token,
            Err(denied) => {
                let requeue_after = self.next_backoff(observed);
                info!(
                    phase = %Phase::Admitting,
                    "Audit of {} deferred: {}; requeue in {}s",
                    subject,
                    denied,
                    requeue_after.as_secs()
                );
                return Ok(ReconcileOutcome::Requeue { requeue_after });
            }
        };

        // Auditing and Persisting hold the token; it is also released on drop
        let result = self.audit_and_persist(&key, &chain).await;
        self.limiter.release(&token);

        match result {
            Ok(None) => {
                debug!("{} vanished during the audit", subject);
                self.reset_backoff(observed);
                Ok(ReconcileOutcome::Skipped)
            }
            Ok(Some(report)) => {
                info!(
                    token = %token.id(),
                    scope = token.scope(),
                    active = self.limiter.active(token.scope()),
                    phase = %Phase::Done,
                    outcome = ?report.spec.result.outcome,
                    "Stored ConfigAuditReport {}/{} for {}",
                    key.namespace(),
                    key.name(),
                    subject
                );
                self.reset_backoff(observed);
                Ok(ReconcileOutcome::Reported {
                    report: Box::new(report),
                    requeue_after: self.config.scan_interval,
                })
            }
            Err((phase, kind, message)) => Err(self.fail(observed, phase, kind, message)),
        }
    }

    async fn audit_and_persist(
        &self,
        key: &ReportKey,
        chain: &OwnerChain,
    ) -> Result<Option<ConfigAuditReport>, (Phase, FailureKind, String)> {
        let subject = chain.subject();
        let evidence = Evidence::new(self.client.as_ref(), &self.logs, chain);

        let (version, record) = match self.plugin.audit(subject, chain, &evidence).await {
            Ok(result) => (
                result.plugin_version,
                AuditResultRecord {
                    outcome: AuditOutcome::Succeeded,
                    payload: result.payload,
                    error: None,
                },
            ),
            Err(PluginError::NotFound(message)) => {
                debug!("Evidence for {} is gone: {}", subject, message);
                return Ok(None);
            }
            Err(PluginError::Transient(message)) => {
                return Err((Phase::Auditing, FailureKind::Retryable, message));
            }
            Err(PluginError::Permanent(message)) => {
                warn!("Plugin {} rejected {}: {}", self.plugin.name(), subject, message);
                (
                    self.plugin.version().to_string(),
                    AuditResultRecord {
                        outcome: AuditOutcome::Failed,
                        payload: serde_json::Value::Null,
                        error: Some(message),
                    },
                )
            }
        };

        self.store
            .upsert(key, &version, chain.subject_generation(), record)
            .await
            .map(Some)
            .map_err(|e| (Phase::Persisting, e.kind(), e.to_string()))
    }

    /// Remaining freshness of the stored report, if it need not be re-audited
    async fn fresh_for(&self, key: &ReportKey, chain: &OwnerChain) -> Option<Duration> {
        let report = match self.store.get(key).await {
            Ok(report) => report,
            Err(StoreError::NotFound(_)) => return None,
            Err(e) => {
                warn!("Failed to read existing report for {}: {}", key.subject, e);
                return None;
            }
        };
        let spec = &report.spec;
        // Same name, new uid: the workload was recreated and never audited
        if !spec.subject.same_object(chain.subject()) {
            debug!("Report for {} belongs to a previous incarnation", chain.subject());
            return None;
        }
        if spec.result.outcome != AuditOutcome::Succeeded
            || spec.plugin.version != self.plugin.version()
            || spec.subject_generation != chain.subject_generation()
        {
            return None;
        }
        let age = (Utc::now() - spec.updated_at).to_std().unwrap_or_default();
        self.config.scan_interval.checked_sub(age).filter(|d| !d.is_zero())
    }

    /// Delete the report of a deleted subject. A missing report is not an error.
    #[instrument(skip_all, fields(subject = %subject))]
    pub async fn cleanup(&self, subject: &ResourceRef) -> Result<ReconcileOutcome, ReconcileError> {
        self.forget_backoff(subject);
        if subject.namespace.is_none() {
            return Ok(ReconcileOutcome::Removed { existed: false });
        }
        let key = ReportKey::new(subject.clone(), self.plugin.name());
        match self.store.delete(&key).await {
            Ok(()) => Ok(ReconcileOutcome::Removed { existed: true }),
            Err(StoreError::NotFound(_)) => {
                debug!("No report to clean up for {}", subject);
                Ok(ReconcileOutcome::Removed { existed: false })
            }
            Err(e) => Err(self.fail(subject, Phase::Persisting, e.kind(), e.to_string())),
        }
    }

    fn fail(&self, observed: &ResourceRef, phase: Phase, kind: FailureKind, message: String) -> ReconcileError {
        let err = ReconcileError::new(phase, kind, message);
        match kind {
            FailureKind::Retryable => warn!("Reconcile of {} failed: {}", observed, err),
            FailureKind::Permanent => error!("Reconcile of {} failed: {}", observed, err),
        }
        err
    }

    fn with_backoff<T>(&self, observed: &ResourceRef, f: impl FnOnce(&mut BackoffState) -> T) -> T {
        let mut states = self.backoff_states.lock().unwrap_or_else(PoisonError::into_inner);
        let state = states.entry(observed.to_string()).or_insert_with(BackoffState::new);
        f(state)
    }

    /// Next backoff delay for `observed`, advancing its sequence
    pub fn next_backoff(&self, observed: &ResourceRef) -> Duration {
        self.with_backoff(observed, |state| {
            state.error_count += 1;
            let delay = state.backoff.next_backoff();
            debug!("{} retry #{}, backoff {}s", observed, state.error_count, delay.as_secs());
            delay
        })
    }

    /// Reset backoff after a successful cycle
    pub fn reset_backoff(&self, observed: &ResourceRef) {
        let mut states = self.backoff_states.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(state) = states.get_mut(&observed.to_string()) {
            if state.error_count > 0 {
                debug!("{} recovered after {} retries", observed, state.error_count);
            }
            state.backoff.reset();
            state.error_count = 0;
        }
    }

    /// Forget the backoff state of a deleted object
    fn forget_backoff(&self, observed: &ResourceRef) {
        let mut states = self.backoff_states.lock().unwrap_or_else(PoisonError::into_inner);
        states.remove(&observed.to_string());
    }
}
