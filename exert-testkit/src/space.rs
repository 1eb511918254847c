use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use exert::{Envelope, EnvelopeTemplate, ExertionId, ExertionSpace, InMemorySpace};

/// [`InMemorySpace`] that counts calls, for asserting pull behavior.
#[derive(Debug, Default)]
pub struct CountingSpace {
    inner: InMemorySpace,
    writes: AtomicUsize,
    claims: AtomicUsize,
    completes: AtomicUsize,
    withdrawals: AtomicUsize,
}

impl CountingSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Successful claims only.
    pub fn claims(&self) -> usize {
        self.claims.load(Ordering::SeqCst)
    }

    pub fn completes(&self) -> usize {
        self.completes.load(Ordering::SeqCst)
    }

    /// Withdrawals that removed an envelope.
    pub fn withdrawals(&self) -> usize {
        self.withdrawals.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExertionSpace for CountingSpace {
    async fn write(&self, envelope: Envelope) -> anyhow::Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.write(envelope).await
    }

    async fn claim(
        &self,
        template: &EnvelopeTemplate,
        worker_id: &str,
    ) -> anyhow::Result<Option<Envelope>> {
        let claimed = self.inner.claim(template, worker_id).await?;
        if claimed.is_some() {
            self.claims.fetch_add(1, Ordering::SeqCst);
        }
        Ok(claimed)
    }

    async fn complete(&self, envelope: Envelope) -> anyhow::Result<bool> {
        self.completes.fetch_add(1, Ordering::SeqCst);
        self.inner.complete(envelope).await
    }

    async fn take(&self, template: &EnvelopeTemplate) -> anyhow::Result<Option<Envelope>> {
        self.inner.take(template).await
    }

    async fn read(&self, id: ExertionId) -> anyhow::Result<Option<Envelope>> {
        self.inner.read(id).await
    }

    async fn withdraw(&self, id: ExertionId) -> anyhow::Result<Option<Envelope>> {
        let removed = self.inner.withdraw(id).await?;
        if removed.is_some() {
            self.withdrawals.fetch_add(1, Ordering::SeqCst);
        }
        Ok(removed)
    }

    async fn depth(&self) -> anyhow::Result<usize> {
        self.inner.depth().await
    }

    async fn wait_for_change(&self, max: Duration) {
        self.inner.wait_for_change(max).await
    }
}
