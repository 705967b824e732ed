//! Model routing: pick the provider for a task.
//!
//! Rules apply in a fixed order:
//!
//! 1. An explicit override wins if that provider is available.
//! 2. Otherwise the task's preferred provider comes from [`ROUTING_TABLE`].
//! 3. If the preferred provider is missing, [`FALLBACK_RULES`] are tried in
//!    order, then any available provider (smallest id), then
//!    [`VisionError::NoProviderAvailable`].
//! 4. With a preferred provider in hand, multi-frame input upgrades to a
//!    sequence-capable provider when one is available.
//! 5. Healing validation that asks for high accuracy also upgrades to a
//!    sequence-capable provider.
//!
//! Routing is a pure function of its inputs. Latency never feeds into it.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::provider::{descriptor, Capability};
use crate::types::{ProviderId, TaskType, VisionError, VisionResult};

/// Preferred provider per task.
pub const ROUTING_TABLE: [(TaskType, ProviderId); 8] = [
    (TaskType::CompareSimple, ProviderId::Dinov2),
    (TaskType::CompareSequence, ProviderId::Vjepa2),
    (TaskType::StabilityCheck, ProviderId::Vjepa2),
    (TaskType::HealingValidation, ProviderId::Vjepa2),
    (TaskType::EmbeddingGeneration, ProviderId::Dinov2),
    (TaskType::TextSearch, ProviderId::Siglip),
    (TaskType::VisualRegression, ProviderId::Dinov2),
    (TaskType::ChangeAnalysis, ProviderId::Vjepa2),
];

/// Replace `from` with `to` when `from` is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackRule {
    pub from: ProviderId,
    pub to: ProviderId,
}

pub const FALLBACK_RULES: [FallbackRule; 2] = [
    // Loses sequence understanding.
    FallbackRule {
        from: ProviderId::Vjepa2,
        to: ProviderId::Dinov2,
    },
    // Loses text alignment.
    FallbackRule {
        from: ProviderId::Siglip,
        to: ProviderId::Dinov2,
    },
];

pub fn preferred_provider(task: TaskType) -> ProviderId {
    ROUTING_TABLE
        .iter()
        .find(|(t, _)| *t == task)
        .map(|(_, p)| *p)
        .unwrap_or(ProviderId::Dinov2)
}

/// Which rule settled the choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteReason {
    Explicit,
    Preferred,
    Fallback,
    AnyAvailable,
    MultiFrame,
    HighAccuracy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RoutingDecision {
    pub provider: ProviderId,
    pub preferred: ProviderId,
    pub reason: RouteReason,
}

impl RoutingDecision {
    pub fn is_fallback(&self) -> bool {
        matches!(self.reason, RouteReason::Fallback | RouteReason::AnyAvailable)
    }
}

/// Inputs to a routing decision, apart from availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteRequest {
    pub task: TaskType,
    pub explicit_override: Option<ProviderId>,
    pub frame_count: usize,
    pub needs_high_accuracy: bool,
}

impl RouteRequest {
    pub fn new(task: TaskType) -> Self {
        Self {
            task,
            explicit_override: None,
            frame_count: 1,
            needs_high_accuracy: false,
        }
    }

    pub fn with_override(mut self, provider: Option<ProviderId>) -> Self {
        self.explicit_override = provider;
        self
    }

    pub fn with_frames(mut self, frame_count: usize) -> Self {
        self.frame_count = frame_count;
        self
    }

    pub fn high_accuracy(mut self, needs_high_accuracy: bool) -> Self {
        self.needs_high_accuracy = needs_high_accuracy;
        self
    }
}

fn sequence_capable(available: &BTreeSet<ProviderId>) -> Option<ProviderId> {
    available
        .iter()
        .copied()
        .find(|id| descriptor(*id).has(Capability::Sequences))
}

/// Resolve the provider for `req` given what is currently loaded.
pub fn select(req: &RouteRequest, available: &BTreeSet<ProviderId>) -> VisionResult<RoutingDecision> {
    let preferred = preferred_provider(req.task);
    let decide = |provider, reason| RoutingDecision {
        provider,
        preferred,
        reason,
    };

    if let Some(explicit) = req.explicit_override {
        if available.contains(&explicit) {
            return Ok(decide(explicit, RouteReason::Explicit));
        }
        tracing::debug!("Requested provider {explicit} not available, routing automatically");
    }

    if !available.contains(&preferred) {
        if let Some(rule) = FALLBACK_RULES
            .iter()
            .find(|r| r.from == preferred && available.contains(&r.to))
        {
            tracing::warn!(
                "{} not available, falling back to {} for {}",
                rule.from,
                rule.to,
                req.task
            );
            return Ok(decide(rule.to, RouteReason::Fallback));
        }
        return match available.iter().next() {
            Some(&any) => {
                tracing::warn!("{preferred} not available, using {any} for {}", req.task);
                Ok(decide(any, RouteReason::AnyAvailable))
            }
            None => Err(VisionError::NoProviderAvailable),
        };
    }

    if let Some(seq) = sequence_capable(available) {
        if req.frame_count > 1 && seq != preferred {
            return Ok(decide(seq, RouteReason::MultiFrame));
        }
        if req.needs_high_accuracy && req.task == TaskType::HealingValidation && seq != preferred {
            return Ok(decide(seq, RouteReason::HighAccuracy));
        }
    }

    Ok(decide(preferred, RouteReason::Preferred))
}

/// Routing over a fixed availability set, captured once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelRouter {
    available: BTreeSet<ProviderId>,
}

impl ModelRouter {
    pub fn new(available: BTreeSet<ProviderId>) -> Self {
        Self { available }
    }

    pub fn available(&self) -> &BTreeSet<ProviderId> {
        &self.available
    }

    pub fn route(&self, req: &RouteRequest) -> VisionResult<RoutingDecision> {
        select(req, &self.available)
    }

    pub fn explain(&self, task: TaskType) -> String {
        explain(task, &self.available)
    }
}

/// One-line explanation of the default route for `task`.
pub fn explain(task: TaskType, available: &BTreeSet<ProviderId>) -> String {
    match select(&RouteRequest::new(task), available) {
        Ok(decision) => {
            let info = descriptor(decision.provider);
            format!(
                "{task} -> {} ({}): {}",
                decision.provider,
                info.license,
                info.best_for.join(", ")
            )
        }
        Err(e) => format!("{task} -> unroutable: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ids: &[ProviderId]) -> BTreeSet<ProviderId> {
        ids.iter().copied().collect()
    }

    fn all() -> BTreeSet<ProviderId> {
        set(&ProviderId::ALL)
    }

    fn subsets() -> Vec<BTreeSet<ProviderId>> {
        (0..8u8)
            .map(|mask| {
                ProviderId::ALL
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| mask & (1 << i) != 0)
                    .map(|(_, id)| *id)
                    .collect()
            })
            .collect()
    }

    #[test]
    fn test_table_defaults() {
        let avail = all();
        let route = |task| select(&RouteRequest::new(task), &avail).unwrap().provider;
        assert_eq!(route(TaskType::CompareSimple), ProviderId::Dinov2);
        assert_eq!(route(TaskType::StabilityCheck), ProviderId::Vjepa2);
        assert_eq!(route(TaskType::HealingValidation), ProviderId::Vjepa2);
        assert_eq!(route(TaskType::ChangeAnalysis), ProviderId::Vjepa2);
        assert_eq!(route(TaskType::TextSearch), ProviderId::Siglip);
        assert_eq!(route(TaskType::EmbeddingGeneration), ProviderId::Dinov2);
        assert_eq!(route(TaskType::VisualRegression), ProviderId::Dinov2);
    }

    #[test]
    fn test_explicit_override_always_wins_when_available() {
        for avail in subsets() {
            for task in TaskType::ALL {
                for &explicit in &avail {
                    for frames in [1, 5] {
                        let req = RouteRequest::new(task)
                            .with_override(Some(explicit))
                            .with_frames(frames)
                            .high_accuracy(true);
                        let d = select(&req, &avail).unwrap();
                        assert_eq!(d.provider, explicit);
                        assert_eq!(d.reason, RouteReason::Explicit);
                    }
                }
            }
        }
    }

    #[test]
    fn test_unavailable_override_routes_automatically() {
        let avail = set(&[ProviderId::Dinov2]);
        let req = RouteRequest::new(TaskType::CompareSimple).with_override(Some(ProviderId::Siglip));
        let d = select(&req, &avail).unwrap();
        assert_eq!(d.provider, ProviderId::Dinov2);
        assert_eq!(d.reason, RouteReason::Preferred);
    }

    #[test]
    fn test_sequence_tasks_fall_back_to_fast_encoder() {
        let avail = set(&[ProviderId::Dinov2, ProviderId::Siglip]);
        for task in [
            TaskType::CompareSequence,
            TaskType::StabilityCheck,
            TaskType::HealingValidation,
            TaskType::ChangeAnalysis,
        ] {
            let d = select(&RouteRequest::new(task).with_frames(4), &avail).unwrap();
            assert_eq!(d.provider, ProviderId::Dinov2);
            assert!(d.is_fallback());
        }
    }

    #[test]
    fn test_text_search_falls_back_to_fast_encoder() {
        let avail = set(&[ProviderId::Dinov2, ProviderId::Vjepa2]);
        let d = select(&RouteRequest::new(TaskType::TextSearch), &avail).unwrap();
        assert_eq!(d.provider, ProviderId::Dinov2);
        assert_eq!(d.reason, RouteReason::Fallback);
    }

    #[test]
    fn test_any_available_when_no_rule_applies() {
        let avail = set(&[ProviderId::Siglip]);
        let d = select(&RouteRequest::new(TaskType::StabilityCheck), &avail).unwrap();
        assert_eq!(d.provider, ProviderId::Siglip);
        assert_eq!(d.reason, RouteReason::AnyAvailable);

        let avail = set(&[ProviderId::Vjepa2]);
        let d = select(&RouteRequest::new(TaskType::CompareSimple), &avail).unwrap();
        assert_eq!(d.provider, ProviderId::Vjepa2);
    }

    #[test]
    fn test_empty_availability_fails() {
        let empty = BTreeSet::new();
        for task in TaskType::ALL {
            let req = RouteRequest::new(task).with_override(Some(ProviderId::Dinov2));
            assert!(matches!(
                select(&req, &empty),
                Err(VisionError::NoProviderAvailable)
            ));
        }
    }

    #[test]
    fn test_multi_frame_upgrades_to_sequence_provider() {
        let avail = all();
        let d = select(&RouteRequest::new(TaskType::CompareSimple).with_frames(3), &avail).unwrap();
        assert_eq!(d.provider, ProviderId::Vjepa2);
        assert_eq!(d.reason, RouteReason::MultiFrame);

        let d = select(&RouteRequest::new(TaskType::TextSearch).with_frames(2), &avail).unwrap();
        assert_eq!(d.provider, ProviderId::Vjepa2);
    }

    #[test]
    fn test_multi_frame_does_not_apply_after_fallback() {
        // Preferred siglip missing: fallback resolves first and wins.
        let avail = set(&[ProviderId::Dinov2, ProviderId::Vjepa2]);
        let d = select(&RouteRequest::new(TaskType::TextSearch).with_frames(5), &avail).unwrap();
        assert_eq!(d.provider, ProviderId::Dinov2);
    }

    #[test]
    fn test_high_accuracy_only_for_healing() {
        let avail = all();
        let d = select(
            &RouteRequest::new(TaskType::CompareSimple).high_accuracy(true),
            &avail,
        )
        .unwrap();
        assert_eq!(d.provider, ProviderId::Dinov2);

        let d = select(
            &RouteRequest::new(TaskType::HealingValidation).high_accuracy(true),
            &avail,
        )
        .unwrap();
        assert_eq!(d.provider, ProviderId::Vjepa2);
    }

    #[test]
    fn test_routing_is_deterministic() {
        for avail in subsets() {
            for task in TaskType::ALL {
                for explicit in [None, Some(ProviderId::Siglip)] {
                    for frames in [1, 2] {
                        for acc in [false, true] {
                            let req = RouteRequest::new(task)
                                .with_override(explicit)
                                .with_frames(frames)
                                .high_accuracy(acc);
                            let a = select(&req, &avail).ok();
                            let b = select(&req, &avail).ok();
                            assert_eq!(a, b);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_model_router_uses_captured_availability() {
        let router = ModelRouter::new(set(&[ProviderId::Dinov2]));
        let d = router.route(&RouteRequest::new(TaskType::StabilityCheck)).unwrap();
        assert_eq!(d.provider, ProviderId::Dinov2);
        assert!(router.explain(TaskType::TextSearch).starts_with("text_search -> dinov2"));
        assert!(ModelRouter::default()
            .route(&RouteRequest::new(TaskType::CompareSimple))
            .is_err());
    }

    #[test]
    fn test_explain() {
        let line = explain(TaskType::TextSearch, &all());
        assert!(line.starts_with("text_search -> siglip (Apache-2.0)"));
        assert!(explain(TaskType::TextSearch, &BTreeSet::new()).contains("unroutable"));
    }
}
