//! The dispatcher: turns an exertion into an execution schedule.
//!
//! [`Dispatcher::exert`] never fails. Every step failure is recorded on the
//! returned exertion's control context, and compound exertions report their
//! children's faults as a status flip plus copied faults.

mod builder;
mod control;
mod detached;
mod graph;
mod pull;
mod push;
mod task;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::config::EngineConfig;
use crate::error::{DispatchError, ExertError};
use crate::events::{EventBus, ExertionEventPayload};
use crate::exertion::{Exertion, ExertionId};
use crate::monitor::ExertionMonitor;
use crate::provider::ProviderResolver;
use crate::space::ExertionSpace;
use crate::strategy::{AccessType, ExecState, Fault};
use crate::telemetry;

pub use builder::DispatcherBuilder;
pub use task::execute_task;

/// Context inherited by every exertion dispatched under one root.
#[derive(Clone, Debug)]
pub(crate) struct Scope {
    /// Access type forced by an enclosing compound.
    pub(crate) access: Option<AccessType>,
    /// Set under a PULL job submitted with `wait = false`: pull children
    /// are published and not awaited.
    pub(crate) no_wait: bool,
    pub(crate) cancel: CancelToken,
    pub(crate) correlation: Uuid,
}

impl Scope {
    fn root(cancel: CancelToken) -> Self {
        Self {
            access: None,
            no_wait: false,
            cancel,
            correlation: Uuid::now_v7(),
        }
    }
}

struct DispatcherInner {
    resolver: Arc<dyn ProviderResolver>,
    space: Option<Arc<dyn ExertionSpace>>,
    events: Option<EventBus>,
    monitor: Option<ExertionMonitor>,
    config: EngineConfig,
    detached: detached::DetachedSessions,
}

/// Push/pull dispatcher for tasks, jobs and control exertions.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("space_set", &self.inner.space.is_some())
            .field("events_set", &self.inner.events.is_some())
            .field("monitor_set", &self.inner.monitor.is_some())
            .field("detached_sessions", &self.inner.detached.len())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl Dispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn monitor(&self) -> Option<&ExertionMonitor> {
        self.inner.monitor.as_ref()
    }

    pub fn events(&self) -> Option<&EventBus> {
        self.inner.events.as_ref()
    }

    pub fn space(&self) -> Option<&Arc<dyn ExertionSpace>> {
        self.inner.space.as_ref()
    }

    /// Execute `exertion` and return it with its final state and results.
    pub async fn exert(&self, exertion: impl Into<Exertion>) -> Exertion {
        self.exert_with(exertion, CancelToken::new()).await
    }

    /// Like [`Dispatcher::exert`], stopping the scheduling of
    /// not-yet-started work once `cancel` fires.
    pub async fn exert_with(&self, exertion: impl Into<Exertion>, cancel: CancelToken) -> Exertion {
        self.dispatch(exertion.into(), Scope::root(cancel)).await
    }

    /// Take the result of a pull exertion submitted with `wait = false`.
    ///
    /// Returns `Ok(None)` while it is still pending.
    pub async fn retrieve(&self, id: ExertionId) -> Result<Option<Exertion>, DispatchError> {
        pull::retrieve(self, id).await
    }

    /// Wait up to `timeout` for the result of a pull exertion.
    pub async fn retrieve_within(&self, id: ExertionId, timeout: Duration) -> Result<Exertion, ExertError> {
        pull::retrieve_within(self, id, timeout).await
    }

    pub(crate) fn dispatch(&self, exertion: Exertion, scope: Scope) -> BoxFuture<'static, Exertion> {
        let this = self.clone();
        let (id, name, kind) = (exertion.id().to_string(), exertion.name().to_string(), exertion.kind());
        telemetry::instrument_dispatch(id, name, kind, async move {
            this.dispatch_inner(exertion, scope).await
        })
        .boxed()
    }

    async fn dispatch_inner(&self, mut exertion: Exertion, mut scope: Scope) -> Exertion {
        let id = exertion.id();
        let name = exertion.name().to_string();
        let access = self.effective_access(&exertion, &scope);
        self.emit(
            id,
            &scope,
            ExertionEventPayload::Submitted {
                name: name.clone(),
                kind: exertion.kind().to_string(),
                access,
            },
        );

        if scope.cancel.is_cancelled() {
            exertion.control_mut().fail(Fault::new(
                id,
                name.clone(),
                DispatchError::Cancelled { exertion: name.clone() },
            ));
            self.emit_finished(&exertion, &scope, Duration::ZERO);
            return exertion;
        }

        let session = match (&self.inner.monitor, exertion.strategy().monitored) {
            (Some(monitor), true) => {
                scope.cancel = scope.cancel.child();
                let session = monitor.register(id, &name, scope.cancel.clone());
                let every = self
                    .inner
                    .config
                    .renew_after(monitor.leases().policy().default_duration);
                let renewer = session.keep_alive(every);
                Some((session, renewer))
            }
            (None, true) => {
                tracing::warn!(exertion_id = %id, "monitored exertion dispatched without a monitor");
                None
            }
            _ => None,
        };

        let timing = telemetry::record_exertion_start(id.to_string(), exertion.kind());
        exertion.control_mut().start();
        self.emit(id, &scope, ExertionEventPayload::Started { name: name.clone() });

        let exec_time_requested = exertion.strategy().exec_time_requested;
        let mut exertion = match exertion {
            Exertion::Task(task) if access == AccessType::Pull => {
                pull::run(self, Exertion::Task(task), &scope).await
            }
            Exertion::Task(task) => Exertion::Task(task::execute_task(self.inner.resolver.as_ref(), task).await),
            Exertion::Job(job) => {
                let mut child_scope = scope.clone();
                if access == AccessType::Pull {
                    child_scope.access = Some(AccessType::Pull);
                    child_scope.no_wait |= !job.header.strategy.wait;
                }
                Exertion::Job(push::run(self, job, child_scope).await)
            }
            Exertion::If(cond) => Exertion::If(control::run_if(self, cond, scope.clone()).await),
            Exertion::While(lp) => Exertion::While(control::run_while(self, lp, scope.clone()).await),
        };

        let state = exertion.state();
        let elapsed = telemetry::record_exertion_end(timing, state);
        if exec_time_requested {
            exertion.control_mut().record_elapsed(elapsed);
        }

        if let Some((session, renewer)) = session {
            if state.is_terminal() {
                renewer.stop().await;
                session.finish(state);
            } else {
                detached::detach(self, &exertion, session, renewer).await;
            }
        }

        self.emit_finished(&exertion, &scope, elapsed);
        exertion
    }

    fn effective_access(&self, exertion: &Exertion, scope: &Scope) -> AccessType {
        if scope.access == Some(AccessType::Pull) {
            AccessType::Pull
        } else {
            exertion.strategy().access
        }
    }

    pub(crate) fn emit(&self, id: ExertionId, scope: &Scope, payload: ExertionEventPayload) {
        if let Some(events) = &self.inner.events {
            events.emit(id, Some(scope.correlation), payload);
        }
    }

    fn emit_finished(&self, exertion: &Exertion, scope: &Scope, elapsed: Duration) {
        let name = exertion.name().to_string();
        let payload = match exertion.state() {
            ExecState::Done => ExertionEventPayload::Completed {
                name,
                elapsed_ms: elapsed.as_millis() as u64,
            },
            ExecState::Failed => ExertionEventPayload::Failed {
                name,
                error: exertion
                    .exceptions()
                    .last()
                    .map(|f| f.error.to_string())
                    .unwrap_or_default(),
            },
            _ => return,
        };
        self.emit(exertion.id(), scope, payload);
    }
}
