//! Push dispatch of jobs: SEQ and PAR scheduling over a job's children.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::task::JoinSet;

use super::graph::{self, DependencyPlan};
use super::{Dispatcher, Scope};
use crate::error::{ContextError, DispatchError, ExertError};
use crate::exertion::{Exertion, ExertionId, Job, JobMapping};
use crate::strategy::{ExecState, FlowType, Fault};

pub(crate) async fn run(dispatcher: &Dispatcher, mut job: Job, scope: Scope) -> Job {
    let mappings = job.effective_mappings();
    let flow = job.header.strategy.flow;
    let checked = if scope.no_wait {
        check_no_wait(&job, &mappings)
    } else {
        Ok(())
    };
    let plan = match checked.and_then(|()| graph::plan(&job, &mappings, flow)) {
        Ok(plan) => plan,
        Err(err) => {
            tracing::warn!(job = %job.header.name, %err, "rejecting job composition");
            let fault = Fault::new(job.header.id, job.header.name.clone(), err);
            job.header.control.fail(fault);
            return job;
        }
    };

    let children = std::mem::take(&mut job.children);
    let mut run = Children::new(children, &mappings);
    match flow {
        FlowType::Seq => run.seq(dispatcher, &plan, &scope).await,
        FlowType::Par => run.par(dispatcher, &plan, &scope).await,
    }
    job.children = run.into_children();
    conclude(&mut job);
    job
}

/// A pull job that does not wait can only publish independent children:
/// nothing is around to move data between them or to evaluate a condition.
fn check_no_wait(job: &Job, mappings: &[JobMapping]) -> Result<(), DispatchError> {
    if !mappings.is_empty() {
        return Err(DispatchError::InvalidComposition(format!(
            "no-wait pull job '{}' cannot carry mappings",
            job.header.name
        )));
    }
    match job
        .children
        .iter()
        .find(|c| matches!(c, Exertion::If(_) | Exertion::While(_)))
    {
        Some(child) => Err(DispatchError::InvalidComposition(format!(
            "no-wait pull job '{}' cannot hold control exertion '{}'",
            job.header.name,
            child.name()
        ))),
        None => Ok(()),
    }
}

/// Copy child faults into the job, set its state and materialize its
/// context from the master child.
fn conclude(job: &mut Job) {
    if let Some(master) = job.master_index() {
        let master = &job.children[master];
        job.context.merge_from(master.context());
    }

    let trace: Vec<String> = job
        .children
        .iter()
        .flat_map(|c| c.control().trace().iter().cloned())
        .collect();
    job.header.control.extend_trace(trace);

    // Children published without waiting are still RUNNING.
    let unfinished = |c: &&Exertion| !matches!(c.state(), ExecState::Done | ExecState::Running);
    let faults: Vec<Fault> = job
        .children
        .iter()
        .filter(unfinished)
        .flat_map(|c| c.exceptions().iter().cloned())
        .collect();
    let failed = job.children.iter().any(|c| unfinished(&c));
    let published = job.children.iter().filter(|c| c.state() == ExecState::Running).count();

    if failed {
        job.header.control.extend_faults(faults);
        job.header.control.mark_failed();
    } else if published > 0 {
        tracing::debug!(job = %job.header.name, published, "job left running on published children");
        job.header.control.set_state(ExecState::Running);
    } else {
        job.header.control.complete();
    }
}

/// Children of one job while it runs.
struct Children<'m> {
    slots: Vec<Option<Exertion>>,
    names: Vec<String>,
    ids: Vec<ExertionId>,
    index: HashMap<ExertionId, usize>,
    mappings: &'m [JobMapping],
    mapping_errors: HashMap<usize, ContextError>,
    started: Vec<bool>,
}

impl<'m> Children<'m> {
    fn new(children: Vec<Exertion>, mappings: &'m [JobMapping]) -> Self {
        let names = children.iter().map(|c| c.name().to_string()).collect();
        let ids: Vec<ExertionId> = children.iter().map(Exertion::id).collect();
        let index = ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        let started = vec![false; children.len()];
        Self {
            slots: children.into_iter().map(Some).collect(),
            names,
            ids,
            index,
            mappings,
            mapping_errors: HashMap::new(),
            started,
        }
    }

    fn into_children(self) -> Vec<Exertion> {
        self.slots.into_iter().flatten().collect()
    }

    fn state(&self, i: usize) -> ExecState {
        self.slots[i]
            .as_ref()
            .map(Exertion::state)
            .unwrap_or(ExecState::Running)
    }

    async fn seq(&mut self, dispatcher: &Dispatcher, plan: &DependencyPlan, scope: &Scope) {
        for i in 0..self.slots.len() {
            self.started[i] = true;
            if let Some(&upstream) = plan.sources[i]
                .iter()
                .find(|&&s| self.state(s) != ExecState::Done)
            {
                self.abort_upstream(i, upstream);
                continue;
            }
            if scope.cancel.is_cancelled() {
                self.abort_cancelled(i);
                continue;
            }
            if self.fail_on_mapping_error(i) {
                continue;
            }
            let Some(child) = self.slots[i].take() else {
                continue;
            };
            let child = dispatcher.dispatch(child, scope.clone()).await;
            let done = child.state() == ExecState::Done;
            self.slots[i] = Some(child);
            if done {
                self.apply_mappings(i);
            }
        }
    }

    async fn par(&mut self, dispatcher: &Dispatcher, plan: &DependencyPlan, scope: &Scope) {
        let n = self.slots.len();
        let mut pending: Vec<usize> = plan.sources.iter().map(Vec::len).collect();
        let mut backups: Vec<Option<Exertion>> = vec![None; n];
        let mut running: JoinSet<(usize, Option<Exertion>)> = JoinSet::new();

        let mut ready: Vec<usize> = (0..n).filter(|&i| pending[i] == 0).collect();
        loop {
            for i in ready.drain(..) {
                if self.started[i] || scope.cancel.is_cancelled() {
                    continue;
                }
                self.started[i] = true;
                if self.fail_on_mapping_error(i) {
                    self.abort_dependents(i, plan);
                    continue;
                }
                let Some(child) = self.slots[i].take() else {
                    continue;
                };
                backups[i] = Some(child.clone());
                let fut = dispatcher.dispatch(child, scope.clone());
                running.spawn(async move { (i, AssertUnwindSafe(fut).catch_unwind().await.ok()) });
            }

            let Some(joined) = running.join_next().await else {
                break;
            };
            let (i, child) = match joined {
                Ok((i, Some(child))) => (i, child),
                Ok((i, None)) => {
                    tracing::error!(child = %self.names[i], "child dispatch panicked");
                    match self.panicked(i, backups[i].take()) {
                        Some(child) => (i, child),
                        None => continue,
                    }
                }
                Err(err) => {
                    tracing::error!(%err, "child dispatch task was lost");
                    continue;
                }
            };
            backups[i] = None;

            let done = child.state() == ExecState::Done;
            self.slots[i] = Some(child);
            if done {
                self.apply_mappings(i);
                for &d in &plan.dependents[i] {
                    pending[d] -= 1;
                    if pending[d] == 0 {
                        ready.push(d);
                    }
                }
            } else {
                self.abort_dependents(i, plan);
            }
        }

        // Lost tasks leave an empty slot; restore the pre-dispatch copy.
        for i in 0..n {
            if self.slots[i].is_none() {
                self.slots[i] = self.panicked(i, backups[i].take());
            }
        }
        for i in 0..n {
            if !self.started[i] {
                self.abort_cancelled(i);
            }
        }
    }

    fn panicked(&self, i: usize, backup: Option<Exertion>) -> Option<Exertion> {
        let mut child = backup?;
        child.control_mut().fail(Fault::new(
            self.ids[i],
            self.names[i].clone(),
            DispatchError::Invocation {
                signature: self.names[i].clone(),
                message: "dispatch panicked".to_string(),
            },
        ));
        Some(child)
    }

    /// Propagate a DONE child's mapped outputs into its destinations.
    fn apply_mappings(&mut self, from: usize) {
        let source_id = self.ids[from];
        for mapping in self.mappings.iter().filter(|m| m.from == source_id) {
            let Some(&to) = self.index.get(&mapping.to) else {
                continue;
            };
            let value = match self.slots[from].as_ref() {
                Some(source) => source.context().get(&mapping.from_path),
                None => continue,
            };
            let outcome = value.and_then(|value| match self.slots[to].as_mut() {
                Some(dest) => dest.context_mut().assign(&mapping.to_path, value),
                None => Ok(()),
            });
            match outcome {
                Ok(()) => tracing::debug!(
                    from = %self.names[from],
                    to = %self.names[to],
                    from_path = %mapping.from_path,
                    to_path = %mapping.to_path,
                    "mapping applied"
                ),
                Err(err) => {
                    self.mapping_errors.entry(to).or_insert(err);
                }
            }
        }
    }

    fn fail_on_mapping_error(&mut self, i: usize) -> bool {
        let Some(err) = self.mapping_errors.remove(&i) else {
            return false;
        };
        self.fail(i, err.into());
        true
    }

    fn abort_upstream(&mut self, i: usize, upstream: usize) {
        let err = DispatchError::UpstreamFailed {
            exertion: self.names[i].clone(),
            upstream: self.names[upstream].clone(),
        };
        self.fail(i, err.into());
    }

    fn abort_cancelled(&mut self, i: usize) {
        let err = DispatchError::Cancelled {
            exertion: self.names[i].clone(),
        };
        self.fail(i, err.into());
    }

    /// Fail every not-yet-started transitive dependent of `failed`.
    fn abort_dependents(&mut self, failed: usize, plan: &DependencyPlan) {
        let mut stack = vec![failed];
        while let Some(upstream) = stack.pop() {
            for &d in &plan.dependents[upstream] {
                if self.started[d] {
                    continue;
                }
                self.started[d] = true;
                self.abort_upstream(d, upstream);
                stack.push(d);
            }
        }
    }

    fn fail(&mut self, i: usize, error: ExertError) {
        let fault = Fault::new(self.ids[i], self.names[i].clone(), error);
        if let Some(child) = self.slots[i].as_mut() {
            tracing::debug!(child = %self.names[i], error = %fault.error, "child not started");
            child.control_mut().fail(fault);
        }
    }
}
