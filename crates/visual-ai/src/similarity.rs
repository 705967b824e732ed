//! Cosine similarity and qualitative banding for visual embeddings.

use crate::types::{Embedding, SimilarityBand, TextMatchBand, VisionError, VisionResult};

/// Compute cosine similarity between two vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (x, y) in a.iter().zip(b.iter()) {
        let x = *x as f64;
        let y = *y as f64;
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 {
        return 0.0;
    }

    (dot / denom) as f32
}

/// Cosine similarity between two embeddings from the same provider.
pub fn embedding_similarity(a: &Embedding, b: &Embedding) -> VisionResult<f32> {
    if a.provider() != b.provider() {
        tracing::warn!(
            "Refusing cross-provider comparison: {} vs {}",
            a.provider(),
            b.provider()
        );
        return Err(VisionError::InvalidInput(format!(
            "Cannot compare {} embedding with {} embedding",
            a.provider(),
            b.provider()
        )));
    }
    if a.dim() != b.dim() {
        return Err(VisionError::InvalidInput(format!(
            "Embedding dimensions differ: {} vs {}",
            a.dim(),
            b.dim()
        )));
    }
    Ok(cosine_similarity(a.as_slice(), b.as_slice()).clamp(-1.0, 1.0))
}

/// Band an image-image similarity.
pub fn classify(similarity: f32) -> SimilarityBand {
    if similarity > 0.95 {
        SimilarityBand::NearlyIdentical
    } else if similarity > 0.85 {
        SimilarityBand::Similar
    } else if similarity > 0.70 {
        SimilarityBand::Differing
    } else {
        SimilarityBand::Dissimilar
    }
}

/// Band a text-image similarity. These scores sit far lower than
/// image-image scores, so the cut points are separate.
pub fn classify_text_match(similarity: f32) -> TextMatchBand {
    if similarity > 0.30 {
        TextMatchBand::Strong
    } else if similarity > 0.20 {
        TextMatchBand::Moderate
    } else if similarity > 0.10 {
        TextMatchBand::Weak
    } else {
        TextMatchBand::None
    }
}

/// Closed lower bound: a score equal to the threshold matches.
pub fn is_match(score: f32, threshold: f32) -> bool {
    score >= threshold
}

impl SimilarityBand {
    pub fn frame_analysis(&self) -> &'static str {
        match self {
            SimilarityBand::NearlyIdentical => "Frames are nearly identical",
            SimilarityBand::Similar => "Frames are semantically similar with minor differences",
            SimilarityBand::Differing => "Frames have noticeable differences",
            SimilarityBand::Dissimilar => "Frames are significantly different",
        }
    }

    pub fn sequence_analysis(&self) -> &'static str {
        match self {
            SimilarityBand::NearlyIdentical => {
                "Sequences are semantically equivalent - same state transition"
            }
            SimilarityBand::Similar => "Sequences show similar transitions with minor variations",
            SimilarityBand::Differing => "Sequences differ but may represent related states",
            SimilarityBand::Dissimilar => {
                "Sequences represent significantly different state transitions"
            }
        }
    }
}

impl TextMatchBand {
    pub fn analysis(&self, description: &str) -> String {
        match self {
            TextMatchBand::Strong => format!("Strong match for '{description}'"),
            TextMatchBand::Moderate => format!("Moderate match for '{description}'"),
            TextMatchBand::Weak => format!("Weak match for '{description}'"),
            TextMatchBand::None => format!("No match for '{description}'"),
        }
    }
}
