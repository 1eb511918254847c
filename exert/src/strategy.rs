//! Execution strategy and per-exertion runtime state.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ExertError;
use crate::exertion::ExertionId;

/// How an exertion reaches a provider.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum AccessType {
    /// Invoke a provider found in the registry directly.
    #[default]
    Push,
    /// Publish to the exertion space and wait for a worker to claim it.
    Pull,
}

/// Ordering of a job's children.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum FlowType {
    /// Children run one after another in declaration order.
    #[default]
    Seq,
    /// Children run concurrently, limited only by mapping dependencies.
    Par,
}

/// Lifecycle state of an exertion.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ExecState {
    #[default]
    Initial,
    Running,
    Done,
    Failed,
    /// Monitor session lost; becomes `Failed` when its lease ends.
    Suspended,
}

impl ExecState {
    /// `Done` or `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecState::Done | ExecState::Failed)
    }
}

impl std::fmt::Display for ExecState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ExecState::Initial => "initial",
            ExecState::Running => "running",
            ExecState::Done => "done",
            ExecState::Failed => "failed",
            ExecState::Suspended => "suspended",
        };
        f.write_str(label)
    }
}

/// Declared execution policy of an exertion.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ControlStrategy {
    pub access: AccessType,
    pub flow: FlowType,
    /// Register with the monitor and hold a renewed lease while running.
    pub monitored: bool,
    /// Block until the exertion is terminal. Pull only.
    pub wait: bool,
    /// Record wall-clock execution time in the control context.
    pub exec_time_requested: bool,
}

impl Default for ControlStrategy {
    fn default() -> Self {
        Self {
            access: AccessType::Push,
            flow: FlowType::Seq,
            monitored: false,
            wait: true,
            exec_time_requested: false,
        }
    }
}

impl ControlStrategy {
    pub fn pull() -> Self {
        Self {
            access: AccessType::Pull,
            ..Self::default()
        }
    }

    pub fn par() -> Self {
        Self {
            flow: FlowType::Par,
            ..Self::default()
        }
    }

    pub fn with_access(mut self, access: AccessType) -> Self {
        self.access = access;
        self
    }

    pub fn with_flow(mut self, flow: FlowType) -> Self {
        self.flow = flow;
        self
    }

    pub fn monitored(mut self, monitored: bool) -> Self {
        self.monitored = monitored;
        self
    }

    pub fn wait(mut self, wait: bool) -> Self {
        self.wait = wait;
        self
    }

    pub fn exec_time(mut self, requested: bool) -> Self {
        self.exec_time_requested = requested;
        self
    }
}

/// A failure recorded against an exertion.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Fault {
    /// Exertion the failure originated in.
    pub exertion_id: ExertionId,
    pub exertion_name: String,
    pub at: DateTime<Utc>,
    pub error: ExertError,
}

impl Fault {
    pub fn new(
        exertion_id: ExertionId,
        exertion_name: impl Into<String>,
        error: impl Into<ExertError>,
    ) -> Self {
        Self {
            exertion_id,
            exertion_name: exertion_name.into(),
            at: Utc::now(),
            error: error.into(),
        }
    }
}

/// Runtime state of one exertion: lifecycle, faults, and trace.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlContext {
    state: ExecState,
    exceptions: Vec<Fault>,
    trace: Vec<String>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    elapsed: Option<Duration>,
}

impl ControlContext {
    pub fn state(&self) -> ExecState {
        self.state
    }

    pub fn exceptions(&self) -> &[Fault] {
        &self.exceptions
    }

    /// Signatures and providers invoked, in order.
    pub fn trace(&self) -> &[String] {
        &self.trace
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// Wall-clock execution time, recorded only when requested.
    pub fn elapsed(&self) -> Option<Duration> {
        self.elapsed
    }

    pub fn start(&mut self) {
        self.state = ExecState::Running;
        self.started_at = Some(Utc::now());
        self.finished_at = None;
    }

    pub fn complete(&mut self) {
        self.finish(ExecState::Done);
    }

    pub fn fail(&mut self, fault: Fault) {
        self.exceptions.push(fault);
        self.finish(ExecState::Failed);
    }

    /// Mark failed without adding a fault (faults were already copied in).
    pub fn mark_failed(&mut self) {
        self.finish(ExecState::Failed);
    }

    pub fn suspend(&mut self) {
        if !self.state.is_terminal() {
            self.state = ExecState::Suspended;
        }
    }

    pub fn resume(&mut self) {
        if self.state == ExecState::Suspended {
            self.state = ExecState::Running;
        }
    }

    pub fn record_fault(&mut self, fault: Fault) {
        self.exceptions.push(fault);
    }

    pub fn extend_faults(&mut self, faults: impl IntoIterator<Item = Fault>) {
        self.exceptions.extend(faults);
    }

    pub fn push_trace(&mut self, entry: impl Into<String>) {
        self.trace.push(entry.into());
    }

    pub fn extend_trace(&mut self, entries: impl IntoIterator<Item = String>) {
        self.trace.extend(entries);
    }

    pub fn record_elapsed(&mut self, elapsed: Duration) {
        self.elapsed = Some(elapsed);
    }

    /// Return to `Initial`, keeping nothing. Used between loop iterations.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn set_state(&mut self, state: ExecState) {
        if state.is_terminal() {
            self.finish(state);
        } else {
            self.state = state;
        }
    }

    fn finish(&mut self, state: ExecState) {
        self.state = state;
        self.finished_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DispatchError;

    #[test]
    fn test_default_strategy() {
        let strategy = ControlStrategy::default();
        assert_eq!(strategy.access, AccessType::Push);
        assert_eq!(strategy.flow, FlowType::Seq);
        assert!(strategy.wait);
        assert!(!strategy.monitored);
    }

    #[test]
    fn test_fail_records_fault_and_state() {
        let mut control = ControlContext::default();
        control.start();
        assert_eq!(control.state(), ExecState::Running);

        control.fail(Fault::new(
            ExertionId::new(),
            "t1",
            DispatchError::InvalidComposition("bad".into()),
        ));
        assert_eq!(control.state(), ExecState::Failed);
        assert_eq!(control.exceptions().len(), 1);
        assert!(control.finished_at().is_some());
    }

    #[test]
    fn test_suspend_only_from_non_terminal() {
        let mut control = ControlContext::default();
        control.start();
        control.suspend();
        assert_eq!(control.state(), ExecState::Suspended);
        control.resume();
        assert_eq!(control.state(), ExecState::Running);

        control.complete();
        control.suspend();
        assert_eq!(control.state(), ExecState::Done);
    }
}
