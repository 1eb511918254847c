use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::Instrument;

use crate::cancel::CancelToken;
use crate::dispatch::execute_task;
use crate::error::DispatchError;
use crate::events::{EventBus, ExertionEventPayload};
use crate::exertion::Exertion;
use crate::provider::ProviderResolver;
use crate::space::{Envelope, EnvelopeTemplate, ExertionSpace};
use crate::strategy::{ExecState, Fault};
use crate::telemetry;

/// Configuration shared by the workers of one pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Prefix for worker ids; worker `i` is `{group}-w{i}`.
    pub group: String,
    /// Only claim envelopes for this capability.
    pub capability: Option<String>,
    /// Provider name this pool serves, for envelopes pinned to a provider.
    pub provider: Option<String>,
    /// Wait between claim attempts when the space is idle, in milliseconds.
    pub poll_interval_ms: u64,
    /// Bound on joining each worker during shutdown, in milliseconds.
    pub shutdown_timeout_ms: u64,
}

impl WorkerConfig {
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            ..Self::default()
        }
    }

    pub fn for_capability(mut self, capability: impl Into<String>) -> Self {
        self.capability = Some(capability.into());
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_shutdown_timeout(mut self, ms: u64) -> Self {
        self.shutdown_timeout_ms = ms;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn worker_id(&self, index: usize) -> String {
        format!("{}-w{}", self.group, index)
    }

    /// Template matching the INITIAL envelopes this pool may claim.
    pub fn template(&self) -> EnvelopeTemplate {
        let mut template = EnvelopeTemplate {
            capability: self.capability.clone(),
            ..EnvelopeTemplate::any()
        };
        if let Some(provider) = &self.provider {
            template = template.with_provider(provider.clone());
        }
        template.in_states(&[ExecState::Initial])
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            group: format!("worker-{}", std::process::id()),
            capability: None,
            provider: None,
            poll_interval_ms: 50,
            shutdown_timeout_ms: 30_000,
        }
    }
}

/// Everything one worker needs; cloned per worker.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub(crate) space: Arc<dyn ExertionSpace>,
    pub(crate) resolver: Arc<dyn ProviderResolver>,
    pub(crate) events: Option<EventBus>,
    pub(crate) template: EnvelopeTemplate,
    pub(crate) poll_interval: Duration,
}

pub(crate) async fn worker_loop(worker_id: String, ctx: WorkerContext, shutdown: CancelToken) {
    let capability = ctx.template.capability.clone().unwrap_or_else(|| "*".to_string());
    tracing::info!(%worker_id, %capability, "worker started");

    loop {
        if shutdown.is_cancelled() {
            tracing::info!(%worker_id, "worker shutting down");
            break;
        }

        let claimed = ctx
            .space
            .claim(&ctx.template, &worker_id)
            .instrument(telemetry::space_claim_span(&worker_id, &capability))
            .await;

        match claimed {
            Ok(Some(envelope)) => run_claimed(&worker_id, &ctx, envelope).await,
            Ok(None) => {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = ctx.space.wait_for_change(ctx.poll_interval) => {}
                }
            }
            Err(err) => {
                tracing::warn!(%worker_id, error = ?err, "claim failed");
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = tokio::time::sleep(ctx.poll_interval) => {}
                }
            }
        }
    }
}

/// Execute a claimed envelope and write the result back.
async fn run_claimed(worker_id: &str, ctx: &WorkerContext, mut envelope: Envelope) {
    let id = envelope.exertion_id;
    if let Some(events) = &ctx.events {
        events.emit(
            id,
            None,
            ExertionEventPayload::Claimed {
                worker_id: worker_id.to_string(),
            },
        );
    }
    tracing::debug!(%worker_id, exertion_id = %id, "envelope claimed");

    envelope.exertion = match envelope.exertion {
        Exertion::Task(task) => Exertion::Task(execute_task(ctx.resolver.as_ref(), task).await),
        mut other => {
            let err = DispatchError::InvalidComposition(format!(
                "{} '{}' cannot be executed by a space worker",
                other.kind(),
                other.name()
            ));
            let fault = Fault::new(id, other.name().to_string(), err);
            other.control_mut().fail(fault);
            other
        }
    };
    envelope.state = envelope.exertion.state();

    match ctx.space.complete(envelope).await {
        Ok(true) => tracing::debug!(%worker_id, exertion_id = %id, "result written"),
        Ok(false) => {
            tracing::debug!(%worker_id, exertion_id = %id, "envelope withdrawn; result discarded")
        }
        Err(err) => tracing::error!(%worker_id, exertion_id = %id, error = ?err, "failed to write result"),
    }
}
