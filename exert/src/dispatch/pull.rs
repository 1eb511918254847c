//! Pull dispatch: publish to the exertion space and wait for a worker.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::{detached, Dispatcher, Scope};
use crate::cancel::CancelToken;
use crate::error::{DispatchError, DispatchTimeoutError, ExertError};
use crate::events::ExertionEventPayload;
use crate::exertion::{Exertion, ExertionId};
use crate::space::{Envelope, EnvelopeTemplate, ExertionSpace};
use crate::strategy::{ExecState, Fault};

pub(crate) async fn run(dispatcher: &Dispatcher, mut exertion: Exertion, scope: &Scope) -> Exertion {
    let id = exertion.id();
    let name = exertion.name().to_string();

    let Some(space) = dispatcher.inner.space.clone() else {
        let err = DispatchError::NoSpace { exertion: name.clone() };
        exertion.control_mut().fail(Fault::new(id, name, err));
        return exertion;
    };

    let envelope = Envelope::new(exertion.clone());
    let capability = envelope.capability.clone();
    if let Err(err) = space.write(envelope).await {
        tracing::error!(exertion_id = %id, error = ?err, "failed to publish exertion");
        let err = DispatchError::Space(format!("{err:#}"));
        exertion.control_mut().fail(Fault::new(id, name, err));
        return exertion;
    }
    tracing::debug!(exertion_id = %id, %capability, "exertion published");
    dispatcher.emit(id, scope, ExertionEventPayload::Published { capability });

    if !exertion.strategy().wait || scope.no_wait {
        return exertion;
    }

    let timeout = dispatcher.inner.config.dispatch_timeout();
    match wait_for(dispatcher, &space, id, timeout, &scope.cancel).await {
        Ok(result) => result,
        Err(err) => {
            exertion.control_mut().fail(Fault::new(id, name, err));
            exertion
        }
    }
}

pub(crate) async fn retrieve(dispatcher: &Dispatcher, id: ExertionId) -> Result<Option<Exertion>, DispatchError> {
    let space = space(dispatcher, id)?;
    let taken = space
        .take(&EnvelopeTemplate::for_exertion(id))
        .await
        .map_err(space_error)?;
    let Some(envelope) = taken else {
        return Ok(None);
    };
    detached::record(dispatcher, id, envelope.state).await;
    Ok(Some(envelope.exertion))
}

pub(crate) async fn retrieve_within(
    dispatcher: &Dispatcher,
    id: ExertionId,
    timeout: Duration,
) -> Result<Exertion, ExertError> {
    let space = space(dispatcher, id)?;
    wait_for(dispatcher, &space, id, timeout, &CancelToken::new()).await
}

fn space(dispatcher: &Dispatcher, id: ExertionId) -> Result<Arc<dyn ExertionSpace>, DispatchError> {
    dispatcher
        .inner
        .space
        .clone()
        .ok_or_else(|| DispatchError::NoSpace { exertion: id.to_string() })
}

fn space_error(err: anyhow::Error) -> DispatchError {
    DispatchError::Space(format!("{err:#}"))
}

/// Poll the space for the terminal envelope of `id` until `timeout`.
///
/// On timeout or cancellation the envelope is withdrawn so no worker picks
/// it up later; a result that landed in the meantime still wins. Either
/// way the outcome is recorded for a detached monitor session.
async fn wait_for(
    dispatcher: &Dispatcher,
    space: &Arc<dyn ExertionSpace>,
    id: ExertionId,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<Exertion, ExertError> {
    let result = poll_result(dispatcher, space, id, timeout, cancel).await;
    let state = match &result {
        Ok(exertion) => exertion.state(),
        Err(_) => ExecState::Failed,
    };
    detached::record(dispatcher, id, state).await;
    result
}

async fn poll_result(
    dispatcher: &Dispatcher,
    space: &Arc<dyn ExertionSpace>,
    id: ExertionId,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<Exertion, ExertError> {
    let template = EnvelopeTemplate::for_exertion(id);
    let poll = dispatcher.inner.config.poll_interval();
    let started = Instant::now();
    let deadline = started + timeout;

    loop {
        let taken = space.take(&template).await.map_err(space_error)?;
        if let Some(envelope) = taken {
            tracing::debug!(exertion_id = %id, state = %envelope.state, "pull result taken");
            return Ok(envelope.exertion);
        }

        let now = Instant::now();
        if now >= deadline {
            let waited = now - started;
            return match space.withdraw(id).await.map_err(space_error)? {
                Some(envelope) if envelope.is_terminal() => Ok(envelope.exertion),
                withdrawn => {
                    let claimed = withdrawn.is_some_and(|e| e.state == ExecState::Running);
                    tracing::warn!(exertion_id = %id, ?waited, claimed, "pull dispatch timed out");
                    Err(DispatchTimeoutError {
                        exertion: id,
                        waited,
                        claimed,
                    }
                    .into())
                }
            };
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                return match space.withdraw(id).await.map_err(space_error)? {
                    Some(envelope) if envelope.is_terminal() => Ok(envelope.exertion),
                    _ => Err(DispatchError::Cancelled { exertion: id.to_string() }.into()),
                };
            }
            _ = space.wait_for_change(poll.min(deadline - now)) => {}
        }
    }
}
