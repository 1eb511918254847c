//! Exertion types: tasks, jobs, and the If/While control exertions.
//!
//! Every exertion carries a [`Header`] (identity, strategy, runtime
//! state) and its own data [`Context`]. Compound exertions own their
//! children; dispatch consumes an exertion and hands back the updated
//! value.

use std::fmt::Display;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::{Context, ContextId};
use crate::control::Condition;
use crate::signature::Signature;
use crate::strategy::{ControlContext, ControlStrategy, ExecState, Fault};

/// Unique identifier for an exertion.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ExertionId(pub Uuid);

impl Default for ExertionId {
    fn default() -> Self {
        Self::new()
    }
}

impl ExertionId {
    /// Create a new exertion ID using UUID v7.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for ExertionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fields common to every exertion.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub id: ExertionId,
    pub name: String,
    /// Set when the exertion is added to a compound.
    pub parent_id: Option<ExertionId>,
    pub strategy: ControlStrategy,
    pub control: ControlContext,
}

impl Header {
    fn new(name: impl Into<String>) -> Self {
        Self {
            id: ExertionId::new(),
            name: name.into(),
            parent_id: None,
            strategy: ControlStrategy::default(),
            control: ControlContext::default(),
        }
    }
}

/// An elementary exertion: one or more signatures applied in order to a
/// single context.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub header: Header,
    /// Batch of operations; all run against the same context.
    pub signatures: Vec<Signature>,
    pub context: Context,
}

impl Task {
    pub fn new(name: impl Into<String>, signature: Signature, context: Context) -> Self {
        Self {
            header: Header::new(name),
            signatures: vec![signature],
            context,
        }
    }

    /// Append another operation to the batch.
    pub fn with_signature(mut self, signature: Signature) -> Self {
        self.signatures.push(signature);
        self
    }

    pub fn with_strategy(mut self, strategy: ControlStrategy) -> Self {
        self.header.strategy = strategy;
        self
    }
}

/// Data propagation between two children of the same job.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct JobMapping {
    pub from: ExertionId,
    pub from_path: String,
    pub to: ExertionId,
    pub to_path: String,
}

/// A compound exertion whose children run sequentially or in parallel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub header: Header,
    pub children: Vec<Exertion>,
    /// Child whose context becomes the job's result. Defaults to the last.
    pub master: Option<ExertionId>,
    pub mappings: Vec<JobMapping>,
    pub context: Context,
}

impl Job {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            context: Context::new(name.clone()),
            header: Header::new(name),
            children: Vec::new(),
            master: None,
            mappings: Vec::new(),
        }
    }

    pub fn with_child(mut self, child: impl Into<Exertion>) -> Self {
        self.add(child);
        self
    }

    /// Add a child, adopting it. Returns the child's id.
    pub fn add(&mut self, child: impl Into<Exertion>) -> ExertionId {
        let mut child = child.into();
        child.header_mut().parent_id = Some(self.header.id);
        let id = child.id();
        self.children.push(child);
        id
    }

    pub fn with_strategy(mut self, strategy: ControlStrategy) -> Self {
        self.header.strategy = strategy;
        self
    }

    pub fn with_master(mut self, master: ExertionId) -> Self {
        self.master = Some(master);
        self
    }

    /// Declare that `to_path` of `to` receives `from_path` of `from` once
    /// `from` is done.
    pub fn map(
        &mut self,
        from: ExertionId,
        from_path: impl Into<String>,
        to: ExertionId,
        to_path: impl Into<String>,
    ) {
        let mapping = JobMapping {
            from,
            from_path: from_path.into(),
            to,
            to_path: to_path.into(),
        };
        if !self.mappings.contains(&mapping) {
            self.mappings.push(mapping);
        }
    }

    pub fn with_mapping(
        mut self,
        from: ExertionId,
        from_path: impl Into<String>,
        to: ExertionId,
        to_path: impl Into<String>,
    ) -> Self {
        self.map(from, from_path, to, to_path);
        self
    }

    /// Job-level mappings plus those declared on children's contexts whose
    /// destination is another direct child. Context mappings pointing
    /// anywhere else are not this job's concern and are skipped.
    pub fn effective_mappings(&self) -> Vec<JobMapping> {
        let mut mappings = self.mappings.clone();
        for child in &self.children {
            for declared in child.context().mappings() {
                let Some(dest) = self.child_by_context(declared.to_context) else {
                    tracing::debug!(
                        job = %self.header.name,
                        child = %child.name(),
                        to_context = %declared.to_context,
                        "skipping mapping to a context outside this job"
                    );
                    continue;
                };
                let mapping = JobMapping {
                    from: child.id(),
                    from_path: declared.from_path.clone(),
                    to: dest.id(),
                    to_path: declared.to_path.clone(),
                };
                if !mappings.contains(&mapping) {
                    mappings.push(mapping);
                }
            }
        }
        mappings
    }

    /// Position of a direct child.
    pub fn index_of(&self, id: ExertionId) -> Option<usize> {
        self.children.iter().position(|c| c.id() == id)
    }

    /// Position of the master child.
    pub fn master_index(&self) -> Option<usize> {
        match self.master {
            Some(id) => self.index_of(id),
            None => self.children.len().checked_sub(1),
        }
    }

    fn child_by_context(&self, context: ContextId) -> Option<&Exertion> {
        self.children.iter().find(|c| c.context().id() == context)
    }
}

/// Runs one of two branches depending on a condition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IfExertion {
    pub header: Header,
    pub condition: Condition,
    pub then_branch: Box<Exertion>,
    pub else_branch: Option<Box<Exertion>>,
    /// Local scope for condition bindings; receives the taken branch's
    /// results.
    pub context: Context,
    /// Which branch ran, once evaluated.
    pub taken: Option<bool>,
}

impl IfExertion {
    pub fn new(
        name: impl Into<String>,
        condition: Condition,
        then_branch: impl Into<Exertion>,
    ) -> Self {
        let name = name.into();
        let header = Header::new(name.clone());
        let mut then_branch = then_branch.into();
        then_branch.header_mut().parent_id = Some(header.id);
        Self {
            context: Context::new(name),
            header,
            condition,
            then_branch: Box::new(then_branch),
            else_branch: None,
            taken: None,
        }
    }

    pub fn with_else(mut self, else_branch: impl Into<Exertion>) -> Self {
        let mut else_branch = else_branch.into();
        else_branch.header_mut().parent_id = Some(self.header.id);
        self.else_branch = Some(Box::new(else_branch));
        self
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }
}

/// Loop increment rule: `amount` is added to the value bound to
/// `variable`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Increment {
    pub variable: String,
    pub amount: f64,
}

/// Re-runs a body while a condition holds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WhileExertion {
    pub header: Header,
    pub condition: Condition,
    pub body: Box<Exertion>,
    /// Safety cap on iterations; the engine default applies when unset.
    pub max_iterations: Option<u64>,
    /// Applied to bound variables after every completed iteration.
    pub increments: Vec<Increment>,
    /// Completed iterations of the last run.
    pub iterations: u64,
    /// Receives the body's final results.
    pub context: Context,
}

impl WhileExertion {
    pub fn new(
        name: impl Into<String>,
        condition: Condition,
        body: impl Into<Exertion>,
    ) -> Self {
        let name = name.into();
        let header = Header::new(name.clone());
        let mut body = body.into();
        body.header_mut().parent_id = Some(header.id);
        Self {
            context: Context::new(name),
            header,
            condition,
            body: Box::new(body),
            max_iterations: None,
            increments: Vec::new(),
            iterations: 0,
        }
    }

    /// Add `amount` to the path bound to `variable` after each iteration.
    pub fn with_increment(mut self, variable: impl Into<String>, amount: f64) -> Self {
        self.increments.push(Increment {
            variable: variable.into(),
            amount,
        });
        self
    }

    pub fn with_max_iterations(mut self, limit: u64) -> Self {
        self.max_iterations = Some(limit);
        self
    }
}

/// A unit of work submitted to the dispatcher.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Exertion {
    Task(Task),
    Job(Job),
    If(IfExertion),
    While(WhileExertion),
}

impl Exertion {
    pub fn header(&self) -> &Header {
        match self {
            Exertion::Task(t) => &t.header,
            Exertion::Job(j) => &j.header,
            Exertion::If(i) => &i.header,
            Exertion::While(w) => &w.header,
        }
    }

    pub fn header_mut(&mut self) -> &mut Header {
        match self {
            Exertion::Task(t) => &mut t.header,
            Exertion::Job(j) => &mut j.header,
            Exertion::If(i) => &mut i.header,
            Exertion::While(w) => &mut w.header,
        }
    }

    pub fn context(&self) -> &Context {
        match self {
            Exertion::Task(t) => &t.context,
            Exertion::Job(j) => &j.context,
            Exertion::If(i) => &i.context,
            Exertion::While(w) => &w.context,
        }
    }

    pub fn context_mut(&mut self) -> &mut Context {
        match self {
            Exertion::Task(t) => &mut t.context,
            Exertion::Job(j) => &mut j.context,
            Exertion::If(i) => &mut i.context,
            Exertion::While(w) => &mut w.context,
        }
    }

    pub fn id(&self) -> ExertionId {
        self.header().id
    }

    pub fn name(&self) -> &str {
        &self.header().name
    }

    pub fn parent_id(&self) -> Option<ExertionId> {
        self.header().parent_id
    }

    pub fn strategy(&self) -> &ControlStrategy {
        &self.header().strategy
    }

    pub fn control(&self) -> &ControlContext {
        &self.header().control
    }

    pub fn control_mut(&mut self) -> &mut ControlContext {
        &mut self.header_mut().control
    }

    pub fn state(&self) -> ExecState {
        self.control().state()
    }

    pub fn exceptions(&self) -> &[Fault] {
        self.control().exceptions()
    }

    /// Label used in spans and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Exertion::Task(_) => "task",
            Exertion::Job(_) => "job",
            Exertion::If(_) => "if",
            Exertion::While(_) => "while",
        }
    }

    pub fn is_compound(&self) -> bool {
        !matches!(self, Exertion::Task(_))
    }

    /// Capability of the first signature, for tasks.
    pub fn capability(&self) -> Option<&str> {
        match self {
            Exertion::Task(t) => t.signatures.first().map(|s| s.capability.as_str()),
            _ => None,
        }
    }

    /// Depth-first search for an exertion by id, including `self`.
    pub fn find(&self, id: ExertionId) -> Option<&Exertion> {
        if self.id() == id {
            return Some(self);
        }
        match self {
            Exertion::Task(_) => None,
            Exertion::Job(j) => j.children.iter().find_map(|c| c.find(id)),
            Exertion::If(i) => i
                .then_branch
                .find(id)
                .or_else(|| i.else_branch.as_ref().and_then(|e| e.find(id))),
            Exertion::While(w) => w.body.find(id),
        }
    }

    /// Clear runtime state on this exertion and everything under it.
    pub fn reset(&mut self) {
        self.control_mut().reset();
        match self {
            Exertion::Task(_) => {}
            Exertion::Job(j) => j.children.iter_mut().for_each(Exertion::reset),
            Exertion::If(i) => {
                i.taken = None;
                i.then_branch.reset();
                if let Some(e) = i.else_branch.as_mut() {
                    e.reset();
                }
            }
            Exertion::While(w) => {
                w.iterations = 0;
                w.body.reset();
            }
        }
    }
}

impl From<Task> for Exertion {
    fn from(task: Task) -> Self {
        Exertion::Task(task)
    }
}

impl From<Job> for Exertion {
    fn from(job: Job) -> Self {
        Exertion::Job(job)
    }
}

impl From<IfExertion> for Exertion {
    fn from(exertion: IfExertion) -> Self {
        Exertion::If(exertion)
    }
}

impl From<WhileExertion> for Exertion {
    fn from(exertion: WhileExertion) -> Self {
        Exertion::While(exertion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;

    fn task(name: &str) -> Task {
        Task::new(
            name,
            Signature::new("Arithmetic", "add"),
            Context::new(name).with_output("result/y"),
        )
    }

    #[test]
    fn test_add_sets_parent() {
        let mut job = Job::new("job");
        let id = job.add(task("t1"));
        assert_eq!(job.children[0].parent_id(), Some(job.header.id));
        assert_eq!(job.index_of(id), Some(0));
    }

    #[test]
    fn test_master_defaults_to_last_child() {
        let t1 = task("t1");
        let t1_id = t1.header.id;
        let job = Job::new("job").with_child(t1).with_child(task("t2"));
        assert_eq!(job.master_index(), Some(1));

        let job = job.with_master(t1_id);
        assert_eq!(job.master_index(), Some(0));
        assert_eq!(Job::new("empty").master_index(), None);
    }

    #[test]
    fn test_effective_mappings_from_child_contexts() {
        let mut t1 = task("t1");
        let t2 = task("t2");
        let outsider = Context::new("outsider");
        t1.context.map("result/y", "arg/x1", &t2.context).unwrap();
        t1.context.map("result/y", "arg/x1", &outsider).unwrap();
        let (t1_id, t2_id) = (t1.header.id, t2.header.id);

        let job = Job::new("job")
            .with_child(t1)
            .with_child(t2)
            .with_mapping(t1_id, "result/y", t2_id, "arg/x1");

        let mappings = job.effective_mappings();
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].from, t1_id);
        assert_eq!(mappings[0].to, t2_id);
    }

    #[test]
    fn test_find_nested() {
        let t1 = task("t1");
        let id = t1.header.id;
        let inner = Job::new("inner").with_child(t1);
        let outer: Exertion = Job::new("outer").with_child(inner).into();
        assert_eq!(outer.find(id).map(Exertion::name), Some("t1"));
        assert!(outer.find(ExertionId::new()).is_none());
    }
}
