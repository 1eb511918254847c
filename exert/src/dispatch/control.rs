//! If and While dispatch.

use super::{Dispatcher, Scope};
use crate::context::Context;
use crate::error::{DispatchError, ExertError};
use crate::exertion::{Exertion, Header, IfExertion, WhileExertion};
use crate::strategy::{ExecState, Fault};

pub(crate) async fn run_if(dispatcher: &Dispatcher, mut cond: IfExertion, scope: Scope) -> IfExertion {
    let taken = match cond.condition.evaluate(&cond.context) {
        Ok(taken) => taken,
        Err(err) => {
            fail(&mut cond.header, err);
            return cond;
        }
    };
    cond.taken = Some(taken);
    tracing::debug!(
        exertion = %cond.header.name,
        expression = %cond.condition.expression,
        taken,
        "condition evaluated"
    );

    if taken {
        let branch = cond.then_branch;
        cond.then_branch = Box::new(dispatcher.dispatch(*branch, scope).await);
        absorb(&mut cond.header, &mut cond.context, &cond.then_branch);
    } else if let Some(branch) = cond.else_branch.take() {
        let branch = dispatcher.dispatch(*branch, scope).await;
        absorb(&mut cond.header, &mut cond.context, &branch);
        cond.else_branch = Some(Box::new(branch));
    } else {
        cond.header.control.complete();
    }
    cond
}

pub(crate) async fn run_while(dispatcher: &Dispatcher, mut lp: WhileExertion, scope: Scope) -> WhileExertion {
    let limit = lp.max_iterations.or(dispatcher.inner.config.max_while_iterations);
    lp.iterations = 0;

    loop {
        // Variables bind to the body's context unless shared.
        match lp.condition.evaluate(lp.body.context()) {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => {
                fail(&mut lp.header, err);
                return lp;
            }
        }
        if let Some(limit) = limit.filter(|&limit| lp.iterations >= limit) {
            let err = DispatchError::IterationLimit {
                exertion: lp.header.name.clone(),
                limit,
            };
            fail(&mut lp.header, err);
            return lp;
        }
        if scope.cancel.is_cancelled() {
            let err = DispatchError::Cancelled {
                exertion: lp.body.name().to_string(),
            };
            fail(&mut lp.header, err);
            return lp;
        }

        if lp.iterations > 0 {
            lp.body.reset();
        }
        let body = lp.body;
        lp.body = Box::new(dispatcher.dispatch(*body, scope.clone()).await);
        if lp.body.state() != ExecState::Done {
            tracing::warn!(exertion = %lp.header.name, iteration = lp.iterations, "loop body failed");
            absorb(&mut lp.header, &mut lp.context, &lp.body);
            return lp;
        }
        lp.iterations += 1;

        for increment in &lp.increments {
            if let Err(err) = lp
                .condition
                .increment(&increment.variable, increment.amount, lp.body.context_mut())
            {
                fail(&mut lp.header, err);
                return lp;
            }
        }
    }

    tracing::debug!(exertion = %lp.header.name, iterations = lp.iterations, "loop finished");
    lp.context.merge_from(lp.body.context());
    lp.header.control.complete();
    lp
}

/// Take a finished child's outcome as the compound's own.
fn absorb(header: &mut Header, context: &mut Context, child: &Exertion) {
    header.control.extend_trace(child.control().trace().iter().cloned());
    if child.state() == ExecState::Done {
        context.merge_from(child.context());
        header.control.complete();
    } else {
        header.control.extend_faults(child.exceptions().iter().cloned());
        header.control.mark_failed();
    }
}

fn fail(header: &mut Header, err: impl Into<ExertError>) {
    let err = err.into();
    tracing::warn!(exertion = %header.name, %err, "control exertion failed");
    header.control.fail(Fault::new(header.id, header.name.clone(), err));
}
