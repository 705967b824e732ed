//! Temporal reasoning over frame embeddings: stability onset, healing
//! validation, and change analysis.

use crate::similarity::embedding_similarity;
use crate::types::{
    ActivityLabel, ChangeAnalysis, ChangeMagnitude, ChangeType, Embedding, HealingOutcome,
    HealingVerdict, ProviderId, Severity, StabilityVerdict, VisionError, VisionResult,
};

/// Weight of the whole-transition similarity in a healing verdict.
pub const TRANSITION_WEIGHT: f32 = 0.3;
/// Weight of the final-state similarity in a healing verdict.
pub const FINAL_STATE_WEIGHT: f32 = 0.7;

/// Where a stability walk currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StabilityState {
    /// Last transition was below threshold (or nothing seen yet).
    Unsettled,
    /// One high-similarity transition in a row.
    Settling,
    /// At least two in a row; `since` is the transition index where the
    /// second one landed.
    Stable { since: usize },
}

/// Walks consecutive-pair similarities and tracks the current stable run.
///
/// A run becomes stable on its second qualifying transition. Any transition
/// below threshold drops back to `Unsettled` and forgets the onset, so only
/// the run the sequence ends on can report one.
#[derive(Debug, Clone)]
pub struct StabilityTracker {
    threshold: f32,
    state: StabilityState,
}

impl StabilityTracker {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            state: StabilityState::Unsettled,
        }
    }

    pub fn state(&self) -> StabilityState {
        self.state
    }

    /// Feed the similarity between frame `index` and frame `index + 1`.
    pub fn observe(&mut self, index: usize, similarity: f32) {
        // Closed lower bound: equal to threshold counts as stable.
        let high = similarity >= self.threshold;
        self.state = match (self.state, high) {
            (_, false) => StabilityState::Unsettled,
            (StabilityState::Unsettled, true) => StabilityState::Settling,
            (StabilityState::Settling, true) => StabilityState::Stable { since: index },
            (stable @ StabilityState::Stable { .. }, true) => stable,
        };
    }

    pub fn is_stable(&self) -> bool {
        matches!(self.state, StabilityState::Stable { .. })
    }

    pub fn stable_since(&self) -> Option<usize> {
        match self.state {
            StabilityState::Stable { since } => Some(since),
            _ => None,
        }
    }
}

impl ActivityLabel {
    /// Classify average motion (`1 - stability_score`).
    pub fn from_motion(motion: f32) -> Self {
        if motion < 0.02 {
            ActivityLabel::Static
        } else if motion < 0.10 {
            ActivityLabel::MinorMotion
        } else if motion < 0.30 {
            ActivityLabel::Animation
        } else {
            ActivityLabel::SignificantChange
        }
    }
}

/// Stability verdict from precomputed consecutive-pair similarities.
///
/// `frame_count` must be `similarities.len() + 1`.
pub fn stability_from_similarities(
    similarities: &[f32],
    frame_count: usize,
    threshold: f32,
) -> VisionResult<StabilityVerdict> {
    if frame_count == 0 {
        return Err(VisionError::InvalidInput(
            "Stability needs at least one frame".to_string(),
        ));
    }
    if similarities.len() + 1 != frame_count {
        return Err(VisionError::InvalidInput(format!(
            "{} similarities do not describe {frame_count} frames",
            similarities.len()
        )));
    }
    if frame_count == 1 {
        return Ok(StabilityVerdict {
            is_stable: true,
            stable_at_index: 0,
            stability_score: 1.0,
            activity_label: ActivityLabel::Static,
        });
    }

    let mut tracker = StabilityTracker::new(threshold);
    for (i, &sim) in similarities.iter().enumerate() {
        tracker.observe(i, sim);
    }

    let stability_score = similarities.iter().sum::<f32>() / similarities.len() as f32;

    Ok(StabilityVerdict {
        is_stable: tracker.is_stable(),
        stable_at_index: tracker.stable_since().unwrap_or(frame_count - 1),
        stability_score,
        activity_label: ActivityLabel::from_motion(1.0 - stability_score),
    })
}

/// Stability verdict for an ordered run of per-frame embeddings.
pub fn detect_stability(embeddings: &[Embedding], threshold: f32) -> VisionResult<StabilityVerdict> {
    let similarities = embeddings
        .windows(2)
        .map(|pair| embedding_similarity(&pair[0], &pair[1]))
        .collect::<VisionResult<Vec<_>>>()?;

    stability_from_similarities(&similarities, embeddings.len(), threshold)
}

/// Blend transition and final-state similarity into a healing verdict.
pub fn assess_healing(
    transition_similarity: f32,
    final_similarity: f32,
    threshold: f32,
    state_confidence: f32,
    model_used: ProviderId,
) -> HealingVerdict {
    let combined =
        TRANSITION_WEIGHT * transition_similarity + FINAL_STATE_WEIGHT * final_similarity;
    let is_valid = combined >= threshold;

    let outcome = if is_valid {
        HealingOutcome::Validated
    } else if final_similarity < threshold {
        HealingOutcome::FinalStateMismatch
    } else {
        HealingOutcome::TransitionDiverged
    };

    let explanation = match outcome {
        HealingOutcome::Validated => format!(
            "Healing validated: final state matches expected (similarity: {:.2}%)",
            combined * 100.0
        ),
        HealingOutcome::FinalStateMismatch => format!(
            "Healing failed: final state differs from expected (similarity: {:.2}%)",
            final_similarity * 100.0
        ),
        HealingOutcome::TransitionDiverged => format!(
            "Healing uncertain: transition differs but final state similar \
             (transition: {:.2}%, final: {:.2}%)",
            transition_similarity * 100.0,
            final_similarity * 100.0
        ),
    };

    HealingVerdict {
        is_valid,
        outcome,
        combined_similarity: combined,
        transition_similarity,
        final_similarity,
        state_confidence,
        explanation,
        model_used,
    }
}

/// What an action label implies about the change it should cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    /// click / submit / navigate / type: something should change.
    Interactive,
    /// hover: at most a moderate change.
    Passive,
    /// No label, or one we have no expectation for.
    Unspecified,
}

const INTERACTIVE_KEYWORDS: [&str; 4] = ["click", "submit", "navigate", "type"];
const PASSIVE_KEYWORDS: [&str; 1] = ["hover"];

impl ActionKind {
    pub fn classify(action: Option<&str>) -> Self {
        let Some(action) = action.map(str::trim).filter(|a| !a.is_empty()) else {
            return ActionKind::Unspecified;
        };
        let lower = action.to_lowercase();
        if INTERACTIVE_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
            ActionKind::Interactive
        } else if PASSIVE_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
            ActionKind::Passive
        } else {
            ActionKind::Unspecified
        }
    }

    pub fn expects(&self, magnitude: f32) -> bool {
        match self {
            ActionKind::Interactive => magnitude > 0.02,
            ActionKind::Passive => magnitude < 0.30,
            ActionKind::Unspecified => true,
        }
    }
}

impl ChangeMagnitude {
    pub fn from_magnitude(magnitude: f32) -> Self {
        if magnitude < 0.02 {
            ChangeMagnitude::None
        } else if magnitude < 0.10 {
            ChangeMagnitude::Cosmetic
        } else if magnitude < 0.30 {
            ChangeMagnitude::Content
        } else {
            ChangeMagnitude::Major
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ChangeMagnitude::None => "No significant visual change detected",
            ChangeMagnitude::Cosmetic => {
                "Minor visual changes (possible style or minor content update)"
            }
            ChangeMagnitude::Content => "Moderate visual changes (content or layout modification)",
            ChangeMagnitude::Major => "Major visual changes (significant content or page change)",
        }
    }

    pub fn tags(&self) -> &'static [&'static str] {
        match self {
            ChangeMagnitude::None => &[],
            ChangeMagnitude::Cosmetic => &["minor_style_change"],
            ChangeMagnitude::Content => &["content_change", "possible_layout_change"],
            ChangeMagnitude::Major => &["major_content_change", "possible_navigation"],
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            ChangeMagnitude::None => Severity::None,
            ChangeMagnitude::Cosmetic => Severity::Minor,
            ChangeMagnitude::Content => Severity::Moderate,
            ChangeMagnitude::Major => Severity::Major,
        }
    }

    pub fn change_type(&self) -> ChangeType {
        match self {
            ChangeMagnitude::None => ChangeType::None,
            ChangeMagnitude::Cosmetic => ChangeType::Style,
            ChangeMagnitude::Content | ChangeMagnitude::Major => ChangeType::Content,
        }
    }
}

/// Describe the change between two frames from their similarity.
///
/// Regions and the provider are left for the caller to attach.
pub fn assess_change(similarity: f32, action: Option<&str>, confidence: f32) -> ChangeAnalysis {
    let magnitude = 1.0 - similarity;
    let bucket = ChangeMagnitude::from_magnitude(magnitude);

    ChangeAnalysis {
        description: bucket.description().to_string(),
        tags: bucket.tags().iter().map(|t| t.to_string()).collect(),
        magnitude,
        bucket,
        expected: ActionKind::classify(action).expects(magnitude),
        confidence,
        severity: bucket.severity(),
        change_type: bucket.change_type(),
        changed_regions: Vec::new(),
        model_used: None,
    }
}
