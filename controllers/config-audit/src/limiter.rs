//! Admission limiter
//!
//! Caps the number of audits running at once per scope (a namespace, or
//! `CLUSTER_SCOPE` when limiting cluster-wide). Admission never blocks: a
//! caller that is denied gets `Denied` back and must requeue the subject.
//!
//! Every granted `AdmissionToken` releases its slot exactly once, either via
//! `AdmissionLimiter::release` or when the token is dropped. Dropping covers
//! cancellation and panics in the audit path.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Admission was refused because the scope is at its limit
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("scope {scope:?} is at its audit limit ({active}/{limit})")]
pub struct Denied {
    /// Scope that was full
    pub scope: String,
    /// Active audits at the time of the request
    pub active: usize,
    /// Configured limit
    pub limit: usize,
}

#[derive(Debug)]
struct LimiterState {
    limit: usize,
    active: Mutex<HashMap<String, usize>>,
}

impl LimiterState {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, usize>> {
        // Counters stay consistent even if a holder panicked
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn decrement(&self, scope: &str) {
        let mut active = self.lock();
        match active.get_mut(scope) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                active.remove(scope);
            }
            None => warn!("Released admission for scope {:?} with no active audits", scope),
        }
    }
}

/// Non-blocking per-scope concurrency limiter
#[derive(Debug, Clone)]
pub struct AdmissionLimiter {
    state: Arc<LimiterState>,
}

impl AdmissionLimiter {
    /// Create a limiter admitting at most `limit` audits per scope
    pub fn new(limit: usize) -> Self {
        Self {
            state: Arc::new(LimiterState {
                limit: limit.max(1),
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Try to admit one audit in `scope`
    pub fn try_acquire(&self, scope: &str) -> Result<AdmissionToken, Denied> {
        let mut active = self.state.lock();
        let count = active.entry(scope.to_string()).or_insert(0);
        if *count >= self.state.limit {
            let denied = Denied {
                scope: scope.to_string(),
                active: *count,
                limit: self.state.limit,
            };
            debug!("{}", denied);
            return Err(denied);
        }
        *count += 1;

        let token = AdmissionToken {
            id: Uuid::new_v4(),
            scope: scope.to_string(),
            released: AtomicBool::new(false),
            state: Arc::clone(&self.state),
        };
        debug!(token = %token.id, "Admitted audit in scope {:?} ({}/{})", scope, *count, self.state.limit);
        Ok(token)
    }

    /// Release a token's slot. Releasing twice is a no-op.
    pub fn release(&self, token: &AdmissionToken) {
        if !Arc::ptr_eq(&self.state, &token.state) {
            warn!(token = %token.id, "Token was issued by a different limiter; ignoring release");
            return;
        }
        token.release();
    }

    /// Audits currently admitted in `scope`
    pub fn active(&self, scope: &str) -> usize {
        self.state.lock().get(scope).copied().unwrap_or(0)
    }

    /// Configured per-scope limit
    pub fn limit(&self) -> usize {
        self.state.limit
    }
}

/// Proof of admission for one audit
pub struct AdmissionToken {
    id: Uuid,
    scope: String,
    released: AtomicBool,
    state: Arc<LimiterState>,
}

impl AdmissionToken {
    /// Unique token id (for log correlation)
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Scope the token was admitted in
    pub fn scope(&self) -> &str {
        &self.scope
    }

    fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.state.decrement(&self.scope);
        debug!(token = %self.id, "Released audit admission in scope {:?}", self.scope);
    }
}

impl fmt::Debug for AdmissionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionToken")
            .field("id", &self.id)
            .field("scope", &self.scope)
            .field("released", &self.released.load(Ordering::Acquire))
            .finish()
    }
}

impl Drop for AdmissionToken {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_denies_at_limit() {
        let limiter = AdmissionLimiter::new(1);
        let token = limiter.try_acquire("ns").unwrap();

        let denied = limiter.try_acquire("ns").unwrap_err();
        assert_eq!(denied.active, 1);
        assert_eq!(denied.limit, 1);

        limiter.release(&token);
        assert_eq!(limiter.active("ns"), 0);
        assert!(limiter.try_acquire("ns").is_ok());
    }

    #[test]
    fn test_scopes_are_independent() {
        let limiter = AdmissionLimiter::new(1);
        let _a = limiter.try_acquire("team-a").unwrap();
        let _b = limiter.try_acquire("team-b").unwrap();
        assert!(limiter.try_acquire("team-a").is_err());
    }

    #[test]
    fn test_release_is_idempotent() {
        let limiter = AdmissionLimiter::new(2);
        let first = limiter.try_acquire("ns").unwrap();
        let _second = limiter.try_acquire("ns").unwrap();

        limiter.release(&first);
        limiter.release(&first);
        drop(first);
        assert_eq!(limiter.active("ns"), 1);
    }

    #[test]
    fn test_drop_releases() {
        let limiter = AdmissionLimiter::new(1);
        {
            let _token = limiter.try_acquire("ns").unwrap();
            assert_eq!(limiter.active("ns"), 1);
        }
        assert_eq!(limiter.active("ns"), 0);
    }

    #[test]
    fn test_foreign_token_is_ignored() {
        let a = AdmissionLimiter::new(1);
        let b = AdmissionLimiter::new(1);
        let token = a.try_acquire("ns").unwrap();

        b.release(&token);
        assert_eq!(a.active("ns"), 1);
    }

    #[tokio::test]
    async fn test_concurrent_acquire_never_exceeds_limit() {
        let limiter = AdmissionLimiter::new(3);
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.try_acquire("ns").ok() })
            })
            .collect();

        let mut granted = Vec::new();
        for handle in handles {
            if let Some(token) = handle.await.unwrap() {
                granted.push(token);
            }
        }
        assert_eq!(granted.len(), 3);
        assert_eq!(limiter.active("ns"), 3);

        granted.clear();
        assert_eq!(limiter.active("ns"), 0);
    }
}
