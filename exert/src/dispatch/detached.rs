//! Supervision of monitored pull work submitted without waiting.
//!
//! When a monitored exertion returns RUNNING because its envelopes were
//! published with `wait = false`, the dispatcher parks its monitor session
//! here. A watcher follows the envelopes in the space and the session
//! finishes once every envelope has an outcome: DONE if all of them are
//! DONE, FAILED otherwise. An envelope that is taken by
//! [`Dispatcher::retrieve`](super::Dispatcher::retrieve) records its own
//! outcome; one that disappears without a result counts as FAILED. If the
//! lease ends first, the remaining envelopes are withdrawn.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::Instant;

use super::Dispatcher;
use crate::cancel::CancelToken;
use crate::exertion::{Exertion, ExertionId};
use crate::monitor::{MonitorSession, Renewer};
use crate::space::ExertionSpace;
use crate::strategy::ExecState;

struct Detached {
    session: MonitorSession,
    renewer: Renewer,
    /// Outcome per published envelope, once known.
    outcomes: HashMap<ExertionId, Option<ExecState>>,
}

impl Detached {
    fn verdict(&self) -> Option<ExecState> {
        let mut verdict = ExecState::Done;
        for outcome in self.outcomes.values() {
            match outcome {
                None => return None,
                Some(ExecState::Done) => {}
                Some(_) => verdict = ExecState::Failed,
            }
        }
        Some(verdict)
    }
}

/// Parked sessions keyed by the monitored exertion's id.
#[derive(Default)]
pub(crate) struct DetachedSessions {
    sessions: Mutex<HashMap<ExertionId, Detached>>,
}

impl DetachedSessions {
    fn pending(&self, root: ExertionId) -> Option<Vec<ExertionId>> {
        self.sessions.lock().get(&root).map(|d| {
            d.outcomes
                .iter()
                .filter(|(_, outcome)| outcome.is_none())
                .map(|(id, _)| *id)
                .collect()
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.lock().len()
    }
}

/// Unfinished envelopes published for `exertion`.
fn published(exertion: &Exertion) -> Vec<ExertionId> {
    match exertion {
        Exertion::Task(task) if !task.header.control.state().is_terminal() => {
            vec![task.header.id]
        }
        Exertion::Job(job) => job.children.iter().flat_map(published).collect(),
        _ => Vec::new(),
    }
}

/// Keep `session` alive until the envelopes published for `exertion`
/// finish.
pub(crate) async fn detach(
    dispatcher: &Dispatcher,
    exertion: &Exertion,
    session: MonitorSession,
    renewer: Renewer,
) {
    let root = session.exertion_id();
    let ids = published(exertion);
    let Some(space) = dispatcher.inner.space.clone().filter(|_| !ids.is_empty()) else {
        tracing::warn!(exertion_id = %root, "nothing published to follow; monitor session failed");
        renewer.stop().await;
        session.finish(ExecState::Failed);
        return;
    };

    let token = session.token().clone();
    tracing::debug!(exertion_id = %root, envelopes = ids.len(), "monitor session detached");
    dispatcher.inner.detached.sessions.lock().insert(
        root,
        Detached {
            session,
            renewer,
            outcomes: ids.into_iter().map(|id| (id, None)).collect(),
        },
    );
    tokio::spawn(watch(dispatcher.clone(), space, root, token));
}

/// Record that envelope `id` ended in `state`. Finishes every parked
/// session this completes.
pub(crate) async fn record(dispatcher: &Dispatcher, id: ExertionId, state: ExecState) {
    let finished: Vec<(ExertionId, Detached, ExecState)> = {
        let mut sessions = dispatcher.inner.detached.sessions.lock();
        let mut roots = Vec::new();
        for (root, detached) in sessions.iter_mut() {
            match detached.outcomes.get_mut(&id) {
                Some(outcome) if outcome.is_none() => *outcome = Some(state),
                _ => continue,
            }
            if let Some(verdict) = detached.verdict() {
                roots.push((*root, verdict));
            }
        }
        roots
            .into_iter()
            .filter_map(|(root, verdict)| sessions.remove(&root).map(|d| (root, d, verdict)))
            .collect()
    };
    for (root, detached, verdict) in finished {
        conclude(root, detached, verdict).await;
    }
}

async fn abandon(dispatcher: &Dispatcher, root: ExertionId) {
    let removed = dispatcher.inner.detached.sessions.lock().remove(&root);
    if let Some(detached) = removed {
        conclude(root, detached, ExecState::Failed).await;
    }
}

async fn conclude(root: ExertionId, detached: Detached, state: ExecState) {
    tracing::debug!(exertion_id = %root, %state, "detached monitor session finished");
    detached.renewer.stop().await;
    detached.session.finish(state);
}

async fn watch(
    dispatcher: Dispatcher,
    space: Arc<dyn ExertionSpace>,
    root: ExertionId,
    token: CancelToken,
) {
    let poll = dispatcher.inner.config.poll_interval();
    let mut missing: HashMap<ExertionId, Instant> = HashMap::new();

    loop {
        let Some(pending) = dispatcher.inner.detached.pending(root) else {
            return;
        };
        for id in pending {
            match space.read(id).await {
                Ok(Some(envelope)) if envelope.is_terminal() => {
                    record(&dispatcher, id, envelope.state).await;
                }
                Ok(Some(_)) => {
                    missing.remove(&id);
                }
                // A retrieve that took the envelope records it right after;
                // give it one poll interval.
                Ok(None) => {
                    let since = *missing.entry(id).or_insert_with(Instant::now);
                    if since.elapsed() >= poll {
                        tracing::warn!(exertion_id = %id, "envelope vanished without a result");
                        record(&dispatcher, id, ExecState::Failed).await;
                    }
                }
                Err(err) => {
                    tracing::warn!(exertion_id = %id, error = ?err, "failed to read envelope");
                }
            }
        }

        tokio::select! {
            _ = token.cancelled() => {
                for id in dispatcher.inner.detached.pending(root).unwrap_or_default() {
                    if let Err(err) = space.withdraw(id).await {
                        tracing::warn!(exertion_id = %id, error = ?err, "failed to withdraw envelope");
                    }
                }
                abandon(&dispatcher, root).await;
                return;
            }
            _ = space.wait_for_change(poll) => {}
        }
    }
}
