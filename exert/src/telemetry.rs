//! Tracing spans and metric hooks.
//!
//! Every `record_*` helper logs through `tracing` and, with the `metrics`
//! feature, updates the matching Prometheus series.

use std::future::Future;
use std::time::{Duration, Instant};

use tracing::{info_span, Instrument, Span};
use tracing_subscriber::EnvFilter;

use crate::lease::LeaseEnd;
use crate::strategy::ExecState;

/// Install a `fmt` subscriber filtered by `RUST_LOG` (default `info`).
///
/// Returns an error if a global subscriber is already set.
pub fn init_tracing() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))
}

#[must_use]
pub fn dispatch_span(exertion_id: impl AsRef<str>, name: impl AsRef<str>, kind: &str) -> Span {
    info_span!(
        "exert.dispatch",
        exertion_id = %exertion_id.as_ref(),
        name = %name.as_ref(),
        kind = kind,
    )
}

#[must_use]
pub fn task_span(exertion_id: impl AsRef<str>, signature: impl AsRef<str>) -> Span {
    info_span!(
        "exert.task",
        exertion_id = %exertion_id.as_ref(),
        signature = %signature.as_ref(),
    )
}

#[must_use]
pub fn space_claim_span(worker_id: impl AsRef<str>, capability: impl AsRef<str>) -> Span {
    info_span!(
        "exert.space.claim",
        worker_id = %worker_id.as_ref(),
        capability = %capability.as_ref(),
    )
}

#[must_use]
pub fn lease_sweep_span(active: usize) -> Span {
    info_span!("exert.lease.sweep", active = active)
}

/// Attach a dispatch span to `future`.
pub fn instrument_dispatch<F>(
    exertion_id: impl AsRef<str>,
    name: impl AsRef<str>,
    kind: &str,
    future: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
{
    future.instrument(dispatch_span(exertion_id, name, kind))
}

/// Start timing an exertion. Pass the handle to [`record_exertion_end`].
pub fn record_exertion_start(exertion_id: impl AsRef<str>, kind: &'static str) -> TimingHandle {
    TimingHandle {
        exertion_id: exertion_id.as_ref().to_string(),
        kind,
        start: Instant::now(),
    }
}

/// Log and count an exertion reaching `state`. Returns the elapsed time.
///
/// Non-terminal states (a no-wait pull returning RUNNING) are logged at
/// debug level and not counted.
pub fn record_exertion_end(handle: TimingHandle, state: ExecState) -> Duration {
    let elapsed = handle.start.elapsed();
    if !state.is_terminal() {
        tracing::debug!(
            exertion_id = %handle.exertion_id,
            kind = handle.kind,
            state = %state,
            "exertion handed off before finishing"
        );
        return elapsed;
    }
    tracing::info!(
        exertion_id = %handle.exertion_id,
        kind = handle.kind,
        state = %state,
        elapsed_ms = elapsed.as_millis() as u64,
        "exertion finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_exertion_completed(
        handle.kind,
        &state.to_string(),
        elapsed.as_secs_f64(),
    );

    elapsed
}

pub fn record_lease_ended(end: LeaseEnd) {
    tracing::debug!(end = %end, "lease end recorded");

    #[cfg(feature = "metrics")]
    crate::metrics::record_lease_ended(end.as_str());
}

pub fn set_space_depth(depth: usize) {
    tracing::trace!(depth = depth, "space depth updated");

    #[cfg(feature = "metrics")]
    crate::metrics::set_space_depth(depth as f64);
}

/// Opaque timing handle for one exertion.
#[derive(Debug)]
pub struct TimingHandle {
    exertion_id: String,
    kind: &'static str,
    start: Instant,
}

impl TimingHandle {
    #[must_use]
    pub fn exertion_id(&self) -> &str {
        &self.exertion_id
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
