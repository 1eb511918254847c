//! Cookie-keyed leases with expiration, optional heartbeat timeout, and a
//! periodic sweeper.
//!
//! The lease table sits behind a single mutex; every check-then-remove is
//! one critical section. Listener callbacks always run after the lock is
//! released.

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::config::EngineConfig;
use crate::error::UnknownLeaseError;
use crate::telemetry;

/// Opaque lease identifier.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Cookie(pub Uuid);

impl Default for Cookie {
    fn default() -> Self {
        Self::new()
    }
}

impl Cookie {
    /// Create a new cookie using UUID v7.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A granted lease.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub cookie: Cookie,
    /// The lease ends once this instant has passed.
    pub expiration: DateTime<Utc>,
    /// Heartbeat bound, refreshed on every renewal.
    pub timeout: Option<DateTime<Utc>>,
    /// Number of successful renewals.
    pub renewals: u32,
}

/// Why a lease left the table.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum LeaseEnd {
    Expired,
    TimedOut,
    Cancelled,
}

impl LeaseEnd {
    pub fn as_str(self) -> &'static str {
        match self {
            LeaseEnd::Expired => "expired",
            LeaseEnd::TimedOut => "timed_out",
            LeaseEnd::Cancelled => "cancelled",
        }
    }
}

impl Display for LeaseEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notified whenever a lease is cancelled, expires, or times out.
/// Completed leases are removed silently.
pub trait LeaseListener<R>: Send + Sync {
    fn lease_ended(&self, cookie: Cookie, resource: &R, end: LeaseEnd);
}

/// Durations applied when granting and renewing leases.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeasePolicy {
    pub default_duration: Duration,
    pub max_duration: Duration,
    pub heartbeat_timeout: Option<Duration>,
}

impl Default for LeasePolicy {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl LeasePolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            default_duration: config.default_lease_duration(),
            max_duration: config.max_lease_duration(),
            heartbeat_timeout: config.lease_heartbeat_timeout(),
        }
    }

    fn clamp(&self, requested: Option<Duration>) -> Duration {
        requested
            .unwrap_or(self.default_duration)
            .min(self.max_duration)
    }
}

struct LeaseEntry<R> {
    lease: Lease,
    resource: R,
}

struct LeaseManagerInner<R> {
    table: Mutex<HashMap<Cookie, LeaseEntry<R>>>,
    listener: Option<Arc<dyn LeaseListener<R>>>,
    policy: LeasePolicy,
}

/// Grants and supervises leases over resources of type `R`.
pub struct LeaseManager<R> {
    inner: Arc<LeaseManagerInner<R>>,
}

impl<R> Clone for LeaseManager<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R> fmt::Debug for LeaseManager<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseManager")
            .field("resource", &std::any::type_name::<R>())
            .field("active", &self.inner.table.lock().len())
            .field("policy", &self.inner.policy)
            .finish()
    }
}

impl<R> LeaseManager<R>
where
    R: Clone + Send + Sync + 'static,
{
    pub fn new(policy: LeasePolicy) -> Self {
        Self::build(policy, None)
    }

    pub fn with_listener(policy: LeasePolicy, listener: Arc<dyn LeaseListener<R>>) -> Self {
        Self::build(policy, Some(listener))
    }

    fn build(policy: LeasePolicy, listener: Option<Arc<dyn LeaseListener<R>>>) -> Self {
        Self {
            inner: Arc::new(LeaseManagerInner {
                table: Mutex::new(HashMap::new()),
                listener,
                policy,
            }),
        }
    }

    pub fn policy(&self) -> LeasePolicy {
        self.inner.policy
    }

    /// Grant a lease on `resource` for `requested` (or the default),
    /// clamped to the maximum duration.
    pub fn new_lease(&self, resource: R, requested: Option<Duration>) -> Lease {
        let now = Utc::now();
        let granted = self.inner.policy.clamp(requested);
        let lease = Lease {
            cookie: Cookie::new(),
            expiration: add(now, granted),
            timeout: self.inner.policy.heartbeat_timeout.map(|t| add(now, t)),
            renewals: 0,
        };
        self.inner.table.lock().insert(
            lease.cookie,
            LeaseEntry {
                lease: lease.clone(),
                resource,
            },
        );
        tracing::debug!(cookie = %lease.cookie, granted_ms = granted.as_millis() as u64, "lease granted");
        lease
    }

    /// Extend a lease to now + `extension` (clamped to the maximum).
    /// Returns the new expiration.
    pub fn renew(
        &self,
        cookie: Cookie,
        extension: Duration,
    ) -> Result<DateTime<Utc>, UnknownLeaseError> {
        let now = Utc::now();
        let extension = self.inner.policy.clamp(Some(extension));
        let mut table = self.inner.table.lock();
        let entry = table.get_mut(&cookie).ok_or(UnknownLeaseError(cookie))?;
        entry.lease.expiration = add(now, extension);
        entry.lease.timeout = self.inner.policy.heartbeat_timeout.map(|t| add(now, t));
        entry.lease.renewals += 1;
        Ok(entry.lease.expiration)
    }

    /// Remove a lease and notify the listener.
    pub fn cancel(&self, cookie: Cookie) -> Result<(), UnknownLeaseError> {
        let entry = self
            .inner
            .table
            .lock()
            .remove(&cookie)
            .ok_or(UnknownLeaseError(cookie))?;
        self.notify(vec![(cookie, entry.resource, LeaseEnd::Cancelled)]);
        Ok(())
    }

    /// Cancel every cookie, reporting the ones that were unknown.
    pub fn cancel_all(
        &self,
        cookies: impl IntoIterator<Item = Cookie>,
    ) -> HashMap<Cookie, UnknownLeaseError> {
        let mut failures = HashMap::new();
        let mut ended = Vec::new();
        {
            let mut table = self.inner.table.lock();
            for cookie in cookies {
                match table.remove(&cookie) {
                    Some(entry) => ended.push((cookie, entry.resource, LeaseEnd::Cancelled)),
                    None => {
                        failures.insert(cookie, UnknownLeaseError(cookie));
                    }
                }
            }
        }
        self.notify(ended);
        failures
    }

    /// Remove a lease without notifying the listener. Returns whether it
    /// was still held.
    pub fn complete(&self, cookie: Cookie) -> bool {
        self.inner.table.lock().remove(&cookie).is_some()
    }

    pub fn get(&self, cookie: Cookie) -> Option<Lease> {
        self.inner.table.lock().get(&cookie).map(|e| e.lease.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every lease that has ended by `now` and notify the listener.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> Vec<(Cookie, LeaseEnd)> {
        let ended: Vec<(Cookie, R, LeaseEnd)> = {
            let mut table = self.inner.table.lock();
            let finished: Vec<(Cookie, LeaseEnd)> = table
                .iter()
                .filter_map(|(cookie, entry)| {
                    if now > entry.lease.expiration {
                        Some((*cookie, LeaseEnd::Expired))
                    } else if entry.lease.timeout.is_some_and(|t| now > t) {
                        Some((*cookie, LeaseEnd::TimedOut))
                    } else {
                        None
                    }
                })
                .collect();
            finished
                .into_iter()
                .filter_map(|(cookie, end)| {
                    table.remove(&cookie).map(|entry| (cookie, entry.resource, end))
                })
                .collect()
        };
        let report = ended.iter().map(|(c, _, end)| (*c, *end)).collect();
        self.notify(ended);
        report
    }

    pub fn sweep(&self) -> Vec<(Cookie, LeaseEnd)> {
        self.sweep_at(Utc::now())
    }

    /// Run [`LeaseManager::sweep`] every `interval` until `token` is
    /// cancelled.
    pub fn spawn_sweeper(&self, interval: Duration, token: CancelToken) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        let span = telemetry::lease_sweep_span(manager.len());
                        let _guard = span.enter();
                        let ended = manager.sweep();
                        if !ended.is_empty() {
                            tracing::debug!(ended = ended.len(), "lease sweep removed leases");
                        }
                    }
                }
            }
            tracing::debug!("lease sweeper stopped");
        })
    }

    fn notify(&self, ended: Vec<(Cookie, R, LeaseEnd)>) {
        for (cookie, resource, end) in ended {
            telemetry::record_lease_ended(end);
            tracing::info!(%cookie, end = %end, "lease ended");
            if let Some(listener) = &self.inner.listener {
                listener.lease_ended(cookie, &resource, end);
            }
        }
    }
}

fn add(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
