use tracing::Instrument;

use crate::error::{ContextError, DispatchError, ExertError};
use crate::exertion::Task;
use crate::provider::ProviderResolver;
use crate::strategy::{ExecState, Fault};
use crate::telemetry;

/// Run every signature of `task` in order against its context.
///
/// The first failing signature stops the batch and is recorded as a fault.
/// Provider results are copied to the signature's return path, or the
/// context's when the signature has none.
pub async fn execute_task(resolver: &dyn ProviderResolver, mut task: Task) -> Task {
    if task.header.control.state() != ExecState::Running {
        task.header.control.start();
    }
    let id = task.header.id;

    for signature in task.signatures.clone() {
        let span = telemetry::task_span(id.to_string(), signature.to_string());
        let outcome = async {
            let provider = resolver.resolve(&signature)?;
            task.header
                .control
                .push_trace(format!("{signature} -> {}", provider.name()));

            let result = provider
                .invoke(&signature.selector, &mut task.context)
                .await
                .map_err(|err| invocation_error(&signature.to_string(), err))?;

            let return_path = signature
                .return_path
                .clone()
                .or_else(|| task.context.return_path().map(str::to_string));
            if let (Some(value), Some(path)) = (result, return_path) {
                task.context.set_value(&path, value)?;
            }
            Ok::<(), ExertError>(())
        }
        .instrument(span)
        .await;

        if let Err(error) = outcome {
            tracing::warn!(exertion_id = %id, %signature, %error, "task signature failed");
            let fault = Fault::new(id, task.header.name.clone(), error);
            task.header.control.fail(fault);
            return task;
        }
    }

    task.header.control.complete();
    task
}

/// Keep typed context errors raised by providers; wrap anything else.
fn invocation_error(signature: &str, err: anyhow::Error) -> ExertError {
    match err.downcast::<ContextError>() {
        Ok(context) => ExertError::Context(context),
        Err(err) => match err.downcast::<DispatchError>() {
            Ok(dispatch) => ExertError::Dispatch(dispatch),
            Err(err) => ExertError::Dispatch(DispatchError::Invocation {
                signature: signature.to_string(),
                message: format!("{err:#}"),
            }),
        },
    }
}
