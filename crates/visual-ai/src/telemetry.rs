//! Telemetry metric names and the per-request observability event.
//!
//! Metrics go through the `metrics` facade; without a recorder installed by
//! the embedding service every call is a no-op. Each request also emits one
//! structured `tracing` event.
//!
//! # Labels
//!
//! - `provider`: provider id (e.g. "dinov2")
//! - `task`: task type (e.g. "stability_check")
//! - `outcome`: "ok" or the error kind

use std::time::Duration;

use crate::types::{ProviderId, TaskType, VisionError};

/// Total requests served by the orchestrator.
///
/// Labels: `provider`, `task`, `outcome`.
pub const REQUESTS_TOTAL: &str = "visual_ai_requests_total";

/// Request duration in seconds.
///
/// Labels: `provider`, `task`.
pub const REQUEST_DURATION_SECONDS: &str = "visual_ai_request_duration_seconds";

/// Total routing decisions that had to fall back.
///
/// Labels: `task`.
pub const FALLBACKS_TOTAL: &str = "visual_ai_routing_fallbacks_total";

pub(crate) fn outcome_label(result: Result<(), &VisionError>) -> &'static str {
    match result {
        Ok(()) => "ok",
        Err(e) => e.kind(),
    }
}

/// Emit the request event and metrics.
pub(crate) fn record_request(
    provider: Option<ProviderId>,
    task: TaskType,
    elapsed: Duration,
    outcome: &'static str,
) {
    let provider = provider.map(|p| p.as_str()).unwrap_or("none");

    tracing::info!(
        target: "visual_ai::request",
        provider,
        task = task.as_str(),
        elapsed_ms = elapsed.as_secs_f64() * 1000.0,
        outcome,
        "request completed"
    );

    metrics::counter!(REQUESTS_TOTAL,
        "provider" => provider,
        "task" => task.as_str(),
        "outcome" => outcome,
    )
    .increment(1);
    metrics::histogram!(REQUEST_DURATION_SECONDS,
        "provider" => provider,
        "task" => task.as_str(),
    )
    .record(elapsed.as_secs_f64());
}

pub(crate) fn record_fallback(task: TaskType) {
    metrics::counter!(FALLBACKS_TOTAL, "task" => task.as_str()).increment(1);
}
