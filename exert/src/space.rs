//! Exertion space: the shared store pull-dispatched tasks travel through.
//!
//! Submitters write envelopes; workers claim the ones matching their
//! template, run them, and write the results back; submitters then take
//! the terminal envelope out again.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::exertion::{Exertion, ExertionId};
use crate::strategy::ExecState;
use crate::telemetry;

/// A task in transit through the space.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub exertion_id: ExertionId,
    pub parent_id: Option<ExertionId>,
    pub capability: String,
    /// Restricts claiming to workers serving this provider name.
    pub provider: Option<String>,
    pub state: ExecState,
    pub exertion: Exertion,
    /// Worker that claimed the envelope.
    pub worker_id: Option<String>,
    pub written_at: DateTime<Utc>,
}

impl Envelope {
    /// Wrap an exertion for publication. Template fields come from its
    /// first signature.
    pub fn new(exertion: Exertion) -> Self {
        let (capability, provider) = match &exertion {
            Exertion::Task(task) => task
                .signatures
                .first()
                .map(|s| (s.capability.clone(), s.provider.clone()))
                .unwrap_or_default(),
            _ => (String::new(), None),
        };
        Self {
            exertion_id: exertion.id(),
            parent_id: exertion.parent_id(),
            capability,
            provider,
            state: ExecState::Initial,
            exertion,
            worker_id: None,
            written_at: Utc::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            ExecState::Done | ExecState::Failed | ExecState::Suspended
        )
    }
}

/// Matches envelopes by id, capability, provider and state. Unset fields
/// match anything, except that an envelope naming a provider only matches
/// a template naming the same provider or its exertion id.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeTemplate {
    pub exertion_id: Option<ExertionId>,
    pub capability: Option<String>,
    pub provider: Option<String>,
    pub states: Option<Vec<ExecState>>,
}

impl EnvelopeTemplate {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn for_capability(capability: impl Into<String>) -> Self {
        Self {
            capability: Some(capability.into()),
            ..Self::default()
        }
    }

    pub fn for_exertion(id: ExertionId) -> Self {
        Self {
            exertion_id: Some(id),
            ..Self::default()
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn in_states(mut self, states: &[ExecState]) -> Self {
        self.states = Some(states.to_vec());
        self
    }

    pub fn matches(&self, envelope: &Envelope) -> bool {
        if self.exertion_id.is_some_and(|id| id != envelope.exertion_id) {
            return false;
        }
        if self
            .capability
            .as_ref()
            .is_some_and(|c| *c != envelope.capability)
        {
            return false;
        }
        // Addressing by id bypasses the provider pin.
        if let (None, Some(required)) = (self.exertion_id, &envelope.provider) {
            if self.provider.as_ref() != Some(required) {
                return false;
            }
        }
        if let Some(states) = &self.states {
            if !states.contains(&envelope.state) {
                return false;
            }
        }
        true
    }
}

/// Shared store for pull dispatch.
///
/// Implementations must make `claim` atomic: of any number of concurrent
/// claimers, exactly one receives a given envelope.
#[async_trait]
pub trait ExertionSpace: Send + Sync {
    /// Store an envelope, replacing any with the same exertion id.
    async fn write(&self, envelope: Envelope) -> anyhow::Result<()>;

    /// Mark the oldest matching INITIAL envelope RUNNING for `worker_id`
    /// and return a copy.
    async fn claim(
        &self,
        template: &EnvelopeTemplate,
        worker_id: &str,
    ) -> anyhow::Result<Option<Envelope>>;

    /// Store a claimed envelope's result. Returns `false` if the envelope
    /// was withdrawn in the meantime; the result is then discarded.
    async fn complete(&self, envelope: Envelope) -> anyhow::Result<bool>;

    /// Remove and return a terminal envelope matching `template`.
    async fn take(&self, template: &EnvelopeTemplate) -> anyhow::Result<Option<Envelope>>;

    /// Copy of the envelope for `id`, without removing it.
    async fn read(&self, id: ExertionId) -> anyhow::Result<Option<Envelope>>;

    /// Remove the envelope for `id` in whatever state it is in.
    async fn withdraw(&self, id: ExertionId) -> anyhow::Result<Option<Envelope>>;

    async fn depth(&self) -> anyhow::Result<usize>;

    /// Wait until the space changes or `max` elapses.
    async fn wait_for_change(&self, max: Duration);
}

/// In-memory [`ExertionSpace`] guarded by a single mutex.
#[derive(Default)]
pub struct InMemorySpace {
    envelopes: Mutex<Vec<Envelope>>,
    changed: Notify,
}

impl std::fmt::Debug for InMemorySpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemorySpace")
            .field("depth", &self.envelopes.lock().len())
            .finish()
    }
}

impl InMemorySpace {
    pub fn new() -> Self {
        Self::default()
    }

    fn changed(&self, depth: usize) {
        telemetry::set_space_depth(depth);
        self.changed.notify_waiters();
    }
}

#[async_trait]
impl ExertionSpace for InMemorySpace {
    async fn write(&self, envelope: Envelope) -> anyhow::Result<()> {
        let depth = {
            let mut envelopes = self.envelopes.lock();
            envelopes.retain(|e| e.exertion_id != envelope.exertion_id);
            envelopes.push(envelope);
            envelopes.len()
        };
        self.changed(depth);
        Ok(())
    }

    async fn claim(
        &self,
        template: &EnvelopeTemplate,
        worker_id: &str,
    ) -> anyhow::Result<Option<Envelope>> {
        let claimed = {
            let mut envelopes = self.envelopes.lock();
            envelopes
                .iter_mut()
                .find(|e| e.state == ExecState::Initial && template.matches(e))
                .map(|e| {
                    e.state = ExecState::Running;
                    e.worker_id = Some(worker_id.to_string());
                    e.clone()
                })
        };
        if claimed.is_some() {
            self.changed.notify_waiters();
        }
        Ok(claimed)
    }

    async fn complete(&self, envelope: Envelope) -> anyhow::Result<bool> {
        let stored = {
            let mut envelopes = self.envelopes.lock();
            match envelopes
                .iter_mut()
                .find(|e| e.exertion_id == envelope.exertion_id)
            {
                Some(slot) => {
                    *slot = envelope;
                    true
                }
                None => false,
            }
        };
        if stored {
            self.changed.notify_waiters();
        }
        Ok(stored)
    }

    async fn take(&self, template: &EnvelopeTemplate) -> anyhow::Result<Option<Envelope>> {
        let (taken, depth) = {
            let mut envelopes = self.envelopes.lock();
            let position = envelopes
                .iter()
                .position(|e| e.is_terminal() && template.matches(e));
            (position.map(|i| envelopes.remove(i)), envelopes.len())
        };
        if taken.is_some() {
            self.changed(depth);
        }
        Ok(taken)
    }

    async fn read(&self, id: ExertionId) -> anyhow::Result<Option<Envelope>> {
        Ok(self
            .envelopes
            .lock()
            .iter()
            .find(|e| e.exertion_id == id)
            .cloned())
    }

    async fn withdraw(&self, id: ExertionId) -> anyhow::Result<Option<Envelope>> {
        let (removed, depth) = {
            let mut envelopes = self.envelopes.lock();
            let position = envelopes.iter().position(|e| e.exertion_id == id);
            (position.map(|i| envelopes.remove(i)), envelopes.len())
        };
        if removed.is_some() {
            self.changed(depth);
        }
        Ok(removed)
    }

    async fn depth(&self) -> anyhow::Result<usize> {
        Ok(self.envelopes.lock().len())
    }

    async fn wait_for_change(&self, max: Duration) {
        let _ = tokio::time::timeout(max, self.changed.notified()).await;
    }
}
