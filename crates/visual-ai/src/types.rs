//! Core data types for embeddings, routing, and verdicts.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Identifier of an embedding provider.
///
/// The three providers trade capability for cost: `Dinov2` is the fast
/// single-frame encoder, `Vjepa2` models frame sequences, `Siglip` aligns
/// text with images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    Dinov2,
    Vjepa2,
    Siglip,
}

impl ProviderId {
    pub const ALL: [ProviderId; 3] = [ProviderId::Dinov2, ProviderId::Vjepa2, ProviderId::Siglip];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::Dinov2 => "dinov2",
            ProviderId::Vjepa2 => "vjepa2",
            ProviderId::Siglip => "siglip",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = VisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dinov2" => Ok(ProviderId::Dinov2),
            "vjepa2" => Ok(ProviderId::Vjepa2),
            "siglip" => Ok(ProviderId::Siglip),
            other => Err(VisionError::InvalidInput(format!("Unknown provider: {other}"))),
        }
    }
}

/// The kind of visual task a request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    CompareSimple,
    CompareSequence,
    StabilityCheck,
    HealingValidation,
    EmbeddingGeneration,
    TextSearch,
    VisualRegression,
    ChangeAnalysis,
}

impl TaskType {
    pub const ALL: [TaskType; 8] = [
        TaskType::CompareSimple,
        TaskType::CompareSequence,
        TaskType::StabilityCheck,
        TaskType::HealingValidation,
        TaskType::EmbeddingGeneration,
        TaskType::TextSearch,
        TaskType::VisualRegression,
        TaskType::ChangeAnalysis,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::CompareSimple => "compare_simple",
            TaskType::CompareSequence => "compare_sequence",
            TaskType::StabilityCheck => "stability_check",
            TaskType::HealingValidation => "healing_validation",
            TaskType::EmbeddingGeneration => "embedding_generation",
            TaskType::TextSearch => "text_search",
            TaskType::VisualRegression => "visual_regression",
            TaskType::ChangeAnalysis => "change_analysis",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = VisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        TaskType::ALL
            .into_iter()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| VisionError::InvalidInput(format!("Unknown task type: {s}")))
    }
}

/// An L2-normalized embedding tagged with the provider that produced it.
///
/// Embeddings from different providers live in different spaces and are
/// never comparable.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Embedding {
    provider: ProviderId,
    vector: Vec<f32>,
}

impl Embedding {
    /// Normalize `vector` and tag it with `provider`.
    ///
    /// Rejects empty, non-finite, and zero-norm vectors.
    pub fn new(provider: ProviderId, vector: Vec<f32>) -> VisionResult<Self> {
        if vector.is_empty() {
            return Err(VisionError::InvalidInput("Empty embedding vector".to_string()));
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(VisionError::InvalidInput(
                "Embedding contains non-finite values".to_string(),
            ));
        }

        let norm = vector
            .iter()
            .map(|v| (*v as f64) * (*v as f64))
            .sum::<f64>()
            .sqrt();
        if norm == 0.0 {
            return Err(VisionError::InvalidInput("Zero-norm embedding".to_string()));
        }

        let vector = vector.iter().map(|v| ((*v as f64) / norm) as f32).collect();
        Ok(Self { provider, vector })
    }

    pub fn provider(&self) -> ProviderId {
        self.provider
    }

    pub fn dim(&self) -> usize {
        self.vector.len()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.vector
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.vector
    }
}

/// A rectangular grid cell in source-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridCell {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl GridCell {
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// A grid cell flagged as changed (or matching), with its significance in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChangeRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub significance: f32,
}

impl ChangeRegion {
    pub fn from_cell(cell: GridCell, significance: f32) -> Self {
        Self {
            x: cell.x,
            y: cell.y,
            width: cell.width,
            height: cell.height,
            significance: significance.clamp(0.0, 1.0),
        }
    }
}

/// Qualitative band for image-image similarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityBand {
    NearlyIdentical,
    Similar,
    Differing,
    Dissimilar,
}

/// Qualitative band for text-image similarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextMatchBand {
    Strong,
    Moderate,
    Weak,
    None,
}

/// Result of comparing two frames or two sequences.
#[derive(Debug, Clone, Serialize)]
pub struct SimilarityVerdict {
    pub score: f32,
    pub band: SimilarityBand,
    pub is_match: bool,
    pub analysis: String,
    pub confidence: f32,
    pub model_used: ProviderId,
    pub changed_regions: Vec<ChangeRegion>,
}

/// Result of matching an image against a text description.
#[derive(Debug, Clone, Serialize)]
pub struct TextMatchVerdict {
    pub score: f32,
    pub band: TextMatchBand,
    pub analysis: String,
    pub model_used: ProviderId,
}

/// Motion classification derived from the average frame-to-frame change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityLabel {
    Static,
    MinorMotion,
    Animation,
    SignificantChange,
}

impl ActivityLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityLabel::Static => "static",
            ActivityLabel::MinorMotion => "minor_motion",
            ActivityLabel::Animation => "animation",
            ActivityLabel::SignificantChange => "significant_change",
        }
    }
}

/// Whether (and where) a frame sequence settled.
#[derive(Debug, Clone, Serialize)]
pub struct StabilityVerdict {
    pub is_stable: bool,
    pub stable_at_index: usize,
    pub stability_score: f32,
    pub activity_label: ActivityLabel,
}

/// Why a healing validation came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealingOutcome {
    /// Combined similarity cleared the threshold.
    Validated,
    /// The final state itself is off; the fix did not land.
    FinalStateMismatch,
    /// Final state is close but the transition diverged; needs inspection.
    TransitionDiverged,
}

/// Result of validating a self-healing fix.
#[derive(Debug, Clone, Serialize)]
pub struct HealingVerdict {
    pub is_valid: bool,
    pub outcome: HealingOutcome,
    pub combined_similarity: f32,
    pub transition_similarity: f32,
    pub final_similarity: f32,
    pub state_confidence: f32,
    pub explanation: String,
    pub model_used: ProviderId,
}

/// Bucketed magnitude of a visual change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeMagnitude {
    None,
    Cosmetic,
    Content,
    Major,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    None,
    Minor,
    Moderate,
    Major,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    None,
    Style,
    Content,
}

/// Explanation of what changed between two frames.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeAnalysis {
    pub description: String,
    pub tags: Vec<String>,
    pub magnitude: f32,
    pub bucket: ChangeMagnitude,
    pub expected: bool,
    pub confidence: f32,
    pub severity: Severity,
    pub change_type: ChangeType,
    pub changed_regions: Vec<ChangeRegion>,
    pub model_used: Option<ProviderId>,
}

/// A screen region matched against a text description.
#[derive(Debug, Clone, Serialize)]
pub struct FoundElement {
    pub region: ChangeRegion,
    pub confidence: f32,
    pub matched_description: String,
}

/// One pair of a batch comparison.
#[derive(Debug, Clone, Serialize)]
pub struct PairResult {
    pub pair_id: String,
    pub score: f32,
    pub is_match: bool,
    pub analysis: String,
}

/// Aggregate result of a batch comparison, in input order.
#[derive(Debug, Clone, Serialize)]
pub struct BatchVerdict {
    pub results: Vec<PairResult>,
    pub average_similarity: f32,
    pub matches: usize,
    pub mismatches: usize,
    pub model_used: ProviderId,
}

impl BatchVerdict {
    pub fn from_results(results: Vec<PairResult>, model_used: ProviderId) -> Self {
        let matches = results.iter().filter(|r| r.is_match).count();
        let average_similarity = if results.is_empty() {
            0.0
        } else {
            results.iter().map(|r| r.score).sum::<f32>() / results.len() as f32
        };
        Self {
            mismatches: results.len() - matches,
            results,
            average_similarity,
            matches,
            model_used,
        }
    }
}

/// A generated embedding as returned to callers.
#[derive(Debug, Clone, Serialize)]
pub struct EmbeddingOutput {
    pub embedding: Vec<f32>,
    pub embedding_dim: usize,
    pub model_used: ProviderId,
}

/// Errors that can occur in the visual decision layer.
#[derive(thiserror::Error, Debug)]
pub enum VisionError {
    #[error("No provider available")]
    NoProviderAvailable,

    #[error("Provider {provider} does not support {capability}")]
    UnsupportedCapability {
        provider: ProviderId,
        capability: &'static str,
    },

    #[error("Provider {provider} failed: {message}")]
    ProviderInternal { provider: ProviderId, message: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VisionError {
    /// Stable, machine-readable error class.
    pub fn kind(&self) -> &'static str {
        match self {
            VisionError::NoProviderAvailable => "no_provider_available",
            VisionError::UnsupportedCapability { .. } => "unsupported_capability",
            VisionError::ProviderInternal { .. } => "provider_internal_error",
            VisionError::InvalidInput(_) | VisionError::Image(_) | VisionError::Io(_) => {
                "invalid_input"
            }
        }
    }
}

/// Convenience result type.
pub type VisionResult<T> = Result<T, VisionError>;
