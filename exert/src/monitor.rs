//! Supervision of monitored exertions.
//!
//! The monitor grants each monitored exertion a lease and tracks its
//! state. The dispatcher holds a [`MonitorSession`] while the exertion runs
//! and renews the lease in the background. Losing the session leaves the
//! exertion SUSPENDED; if its lease then ends, the exertion is FAILED.
//! Cancelling a monitored exertion cancels its lease, which in turn
//! cancels the dispatch through the session's [`CancelToken`].
//!
//! Finished exertions stay queryable for a retention period, after which
//! the sweeper drops them.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cancel::CancelToken;
use crate::config::EngineConfig;
use crate::error::{MonitorError, UnknownLeaseError};
use crate::events::{EventBus, ExertionEventPayload};
use crate::exertion::ExertionId;
use crate::lease::{Cookie, LeaseEnd, LeaseListener, LeaseManager, LeasePolicy};
use crate::strategy::ExecState;
use crate::telemetry;

struct MonitorEntry {
    name: String,
    cookie: Cookie,
    state: ExecState,
    token: CancelToken,
    /// Set once the state is DONE or FAILED.
    settled_at: Option<DateTime<Utc>>,
}

impl MonitorEntry {
    fn settle(&mut self, state: ExecState) {
        self.state = state;
        if state.is_terminal() {
            self.settled_at = Some(Utc::now());
        }
    }
}

#[derive(Default)]
struct Registry {
    entries: Mutex<HashMap<ExertionId, MonitorEntry>>,
    events: Option<EventBus>,
}

impl Registry {
    fn emit(&self, id: ExertionId, payload: ExertionEventPayload) {
        if let Some(events) = &self.events {
            events.emit(id, None, payload);
        }
    }
}

impl LeaseListener<ExertionId> for Registry {
    fn lease_ended(&self, cookie: Cookie, id: &ExertionId, end: LeaseEnd) {
        let outcome = {
            let mut entries = self.entries.lock();
            match entries.get_mut(id) {
                Some(entry) if entry.cookie == cookie => {
                    let before = entry.state;
                    if !before.is_terminal() {
                        entry.settle(ExecState::Failed);
                        entry.token.cancel();
                    }
                    Some((entry.name.clone(), before))
                }
                _ => None,
            }
        };
        if let Some((name, before)) = outcome {
            tracing::warn!(exertion_id = %id, %name, %end, previous = %before, "monitored exertion lost its lease");
            self.emit(*id, ExertionEventPayload::LeaseEnded { cookie, end });
        }
    }
}

/// Registry of monitored exertions backed by a [`LeaseManager`].
#[derive(Clone)]
pub struct ExertionMonitor {
    leases: LeaseManager<ExertionId>,
    registry: Arc<Registry>,
    retention: Duration,
}

impl fmt::Debug for ExertionMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExertionMonitor")
            .field("monitored", &self.registry.entries.lock().len())
            .field("leases", &self.leases)
            .field("retention", &self.retention)
            .finish()
    }
}

impl ExertionMonitor {
    pub fn new(policy: LeasePolicy) -> Self {
        Self::build(policy, None)
    }

    pub fn with_events(policy: LeasePolicy, events: EventBus) -> Self {
        Self::build(policy, Some(events))
    }

    fn build(policy: LeasePolicy, events: Option<EventBus>) -> Self {
        let registry = Arc::new(Registry {
            entries: Mutex::new(HashMap::new()),
            events,
        });
        let leases = LeaseManager::with_listener(policy, registry.clone());
        Self {
            leases,
            registry,
            retention: EngineConfig::default().monitor_retention(),
        }
    }

    /// Keep finished exertions queryable for `retention` before pruning.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn leases(&self) -> &LeaseManager<ExertionId> {
        &self.leases
    }

    /// Grant a lease for `id` and start tracking it as RUNNING.
    pub fn register(&self, id: ExertionId, name: &str, token: CancelToken) -> MonitorSession {
        let lease = self.leases.new_lease(id, None);
        self.registry.entries.lock().insert(
            id,
            MonitorEntry {
                name: name.to_string(),
                cookie: lease.cookie,
                state: ExecState::Running,
                token: token.clone(),
                settled_at: None,
            },
        );
        tracing::debug!(exertion_id = %id, cookie = %lease.cookie, "exertion registered with monitor");
        MonitorSession {
            id,
            cookie: lease.cookie,
            token,
            monitor: self.clone(),
            finished: false,
        }
    }

    pub fn status(&self, id: ExertionId) -> Option<ExecState> {
        self.registry.entries.lock().get(&id).map(|e| e.state)
    }

    pub fn cookie(&self, id: ExertionId) -> Option<Cookie> {
        self.registry.entries.lock().get(&id).map(|e| e.cookie)
    }

    /// Number of exertions currently tracked, finished ones included.
    pub fn len(&self) -> usize {
        self.registry.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel the lease of a monitored exertion, cancelling its dispatch.
    pub fn cancel(&self, id: ExertionId) -> Result<(), MonitorError> {
        let cookie = self.cookie(id).ok_or(MonitorError::NotMonitored(id))?;
        self.leases.cancel(cookie)?;
        Ok(())
    }

    /// Re-establish a session for a SUSPENDED exertion whose lease is still
    /// live.
    pub fn resume(&self, id: ExertionId) -> Option<MonitorSession> {
        let mut entries = self.registry.entries.lock();
        let entry = entries.get_mut(&id)?;
        if entry.state != ExecState::Suspended || self.leases.get(entry.cookie).is_none() {
            return None;
        }
        entry.state = ExecState::Running;
        Some(MonitorSession {
            id,
            cookie: entry.cookie,
            token: entry.token.clone(),
            monitor: self.clone(),
            finished: false,
        })
    }

    /// Stop tracking `id`.
    pub fn forget(&self, id: ExertionId) {
        if let Some(entry) = self.registry.entries.lock().remove(&id) {
            self.leases.complete(entry.cookie);
        }
    }

    /// Drop finished exertions settled more than the retention period
    /// before `now`. Returns how many were dropped.
    pub fn prune_at(&self, now: DateTime<Utc>) -> usize {
        let retention = TimeDelta::from_std(self.retention).unwrap_or(TimeDelta::MAX);
        let cutoff = now.checked_sub_signed(retention).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut entries = self.registry.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| e.settled_at.map_or(true, |at| at > cutoff));
        before - entries.len()
    }

    pub fn prune(&self) -> usize {
        self.prune_at(Utc::now())
    }

    /// Sweep leases and prune finished exertions every `interval` until
    /// `token` is cancelled.
    pub fn spawn_sweeper(&self, interval: Duration, token: CancelToken) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        let span = telemetry::lease_sweep_span(monitor.leases.len());
                        let _guard = span.enter();
                        let ended = monitor.leases.sweep();
                        let pruned = monitor.prune();
                        if !ended.is_empty() || pruned > 0 {
                            tracing::debug!(ended = ended.len(), pruned, "monitor sweep");
                        }
                    }
                }
            }
            tracing::debug!("monitor sweeper stopped");
        })
    }

    fn finish(&self, id: ExertionId, cookie: Cookie, state: ExecState) {
        self.leases.complete(cookie);
        if let Some(entry) = self.registry.entries.lock().get_mut(&id) {
            if entry.cookie == cookie && !entry.state.is_terminal() {
                entry.settle(state);
            }
        }
    }

    fn suspend(&self, id: ExertionId, cookie: Cookie) {
        let suspended = {
            let mut entries = self.registry.entries.lock();
            match entries.get_mut(&id) {
                Some(entry) if entry.cookie == cookie && !entry.state.is_terminal() => {
                    // The lease may have ended before the session was dropped.
                    entry.settle(if self.leases.get(cookie).is_some() {
                        ExecState::Suspended
                    } else {
                        ExecState::Failed
                    });
                    entry.state == ExecState::Suspended
                }
                _ => false,
            }
        };
        if suspended {
            tracing::warn!(exertion_id = %id, "monitored exertion suspended");
            self.registry.emit(id, ExertionEventPayload::Suspended);
        }
    }
}

/// Held by the dispatcher while a monitored exertion runs.
///
/// Dropping a session without calling [`MonitorSession::finish`] suspends
/// the exertion.
pub struct MonitorSession {
    id: ExertionId,
    cookie: Cookie,
    token: CancelToken,
    monitor: ExertionMonitor,
    finished: bool,
}

impl fmt::Debug for MonitorSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorSession")
            .field("exertion_id", &self.id)
            .field("cookie", &self.cookie)
            .field("finished", &self.finished)
            .finish()
    }
}

impl MonitorSession {
    pub fn exertion_id(&self) -> ExertionId {
        self.id
    }

    pub fn cookie(&self) -> Cookie {
        self.cookie
    }

    /// Cancelled when the lease ends before the session finishes.
    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    pub fn renew(&self) -> Result<DateTime<Utc>, UnknownLeaseError> {
        let duration = self.monitor.leases.policy().default_duration;
        self.monitor.leases.renew(self.cookie, duration)
    }

    /// Renew the lease every `every` until the returned handle is stopped
    /// or a renewal fails.
    pub fn keep_alive(&self, every: Duration) -> Renewer {
        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
        let leases = self.monitor.leases.clone();
        let registry = self.monitor.registry.clone();
        let (id, cookie) = (self.id, self.cookie);
        let extension = leases.policy().default_duration;

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(every) => {}
                    _ = stop_rx.recv() => break,
                }
                match leases.renew(cookie, extension) {
                    Ok(_) => {
                        let renewals = leases.get(cookie).map(|l| l.renewals).unwrap_or_default();
                        registry.emit(id, ExertionEventPayload::LeaseRenewed { cookie, renewals });
                    }
                    Err(_) => {
                        tracing::trace!(%cookie, "lease renew skipped");
                        break;
                    }
                }
            }
        });
        Renewer { stop_tx, handle }
    }

    /// Complete the lease and record the final state.
    pub fn finish(mut self, state: ExecState) {
        self.finished = true;
        self.monitor.finish(self.id, self.cookie, state);
    }
}

impl Drop for MonitorSession {
    fn drop(&mut self) {
        if !self.finished {
            self.monitor.suspend(self.id, self.cookie);
        }
    }
}

/// Background lease renewal for one session.
#[derive(Debug)]
pub struct Renewer {
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl Renewer {
    pub async fn stop(self) {
        let _ = self.stop_tx.try_send(());
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn policy() -> LeasePolicy {
        LeasePolicy {
            default_duration: Duration::from_millis(1_000),
            max_duration: Duration::from_millis(5_000),
            heartbeat_timeout: None,
        }
    }

    #[test]
    fn test_finish_completes_silently() {
        let monitor = ExertionMonitor::new(policy());
        let id = ExertionId::new();
        let session = monitor.register(id, "t1", CancelToken::new());
        assert_eq!(monitor.status(id), Some(ExecState::Running));

        session.finish(ExecState::Done);
        assert_eq!(monitor.status(id), Some(ExecState::Done));
        assert!(monitor.leases().is_empty());
    }

    #[test]
    fn test_dropped_session_suspends_then_fails_on_expiry() {
        let monitor = ExertionMonitor::new(policy());
        let id = ExertionId::new();
        let session = monitor.register(id, "t1", CancelToken::new());
        let cookie = session.cookie();
        drop(session);
        assert_eq!(monitor.status(id), Some(ExecState::Suspended));

        let expiration = monitor.leases().get(cookie).unwrap().expiration;
        monitor
            .leases()
            .sweep_at(expiration + TimeDelta::milliseconds(1));
        assert_eq!(monitor.status(id), Some(ExecState::Failed));
    }

    #[test]
    fn test_resume_suspended() {
        let monitor = ExertionMonitor::new(policy());
        let id = ExertionId::new();
        drop(monitor.register(id, "t1", CancelToken::new()));

        let session = monitor.resume(id).unwrap();
        assert_eq!(monitor.status(id), Some(ExecState::Running));
        session.finish(ExecState::Done);
        assert!(monitor.resume(id).is_none());
    }

    #[test]
    fn test_cancel_propagates_to_token() {
        let monitor = ExertionMonitor::new(policy());
        let id = ExertionId::new();
        let token = CancelToken::new();
        let session = monitor.register(id, "t1", token.clone());

        monitor.cancel(id).unwrap();
        assert!(token.is_cancelled());
        assert!(session.token().is_cancelled());
        assert_eq!(monitor.status(id), Some(ExecState::Failed));

        // Finishing after the lease ended does not resurrect the exertion.
        session.finish(ExecState::Done);
        assert_eq!(monitor.status(id), Some(ExecState::Failed));
        let stranger = ExertionId::new();
        assert_eq!(monitor.cancel(stranger), Err(MonitorError::NotMonitored(stranger)));
    }

    #[test]
    fn test_finished_entries_pruned_after_retention() {
        let monitor = ExertionMonitor::new(policy()).with_retention(Duration::from_secs(60));
        let done = ExertionId::new();
        monitor.register(done, "t1", CancelToken::new()).finish(ExecState::Done);
        let suspended = ExertionId::new();
        drop(monitor.register(suspended, "t2", CancelToken::new()));
        assert_eq!(monitor.len(), 2);

        assert_eq!(monitor.prune(), 0);
        assert_eq!(monitor.status(done), Some(ExecState::Done));

        let later = Utc::now() + TimeDelta::seconds(61);
        assert_eq!(monitor.prune_at(later), 1);
        assert_eq!(monitor.status(done), None);
        // Suspended exertions wait for their lease instead.
        assert_eq!(monitor.status(suspended), Some(ExecState::Suspended));
    }

    #[tokio::test]
    async fn test_sweeper_empties_monitor() {
        let monitor = ExertionMonitor::new(policy()).with_retention(Duration::ZERO);
        for name in ["t1", "t2", "t3"] {
            monitor
                .register(ExertionId::new(), name, CancelToken::new())
                .finish(ExecState::Done);
        }
        assert_eq!(monitor.len(), 3);

        let token = CancelToken::new();
        let sweeper = monitor.spawn_sweeper(Duration::from_millis(5), token.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        sweeper.await.unwrap();

        assert!(monitor.is_empty());
        assert!(monitor.leases().is_empty());
    }

    #[tokio::test]
    async fn test_keep_alive_renews() {
        let monitor = ExertionMonitor::new(LeasePolicy {
            default_duration: Duration::from_millis(100),
            max_duration: Duration::from_millis(100),
            heartbeat_timeout: None,
        });
        let id = ExertionId::new();
        let session = monitor.register(id, "t1", CancelToken::new());
        let renewer = session.keep_alive(Duration::from_millis(20));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(monitor.leases().sweep().is_empty());
        assert!(monitor.leases().get(session.cookie()).unwrap().renewals > 0);

        renewer.stop().await;
        session.finish(ExecState::Done);
    }
}
