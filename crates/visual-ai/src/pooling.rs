//! Sequence pooling for providers without native temporal modelling.
//!
//! A provider that only encodes single frames can still take part in
//! sequence tasks: each frame is encoded on its own and the per-frame
//! embeddings are collapsed into one order-aware embedding here.

use std::fmt::Debug;

use crate::types::{Embedding, VisionError, VisionResult};

/// Collapse an ordered run of same-provider embeddings into one.
pub trait SequencePooling: Send + Sync + Debug {
    fn pool(&self, embeddings: &[Embedding]) -> VisionResult<Embedding>;
}

/// Linear weight ramp from `start` (oldest frame) to `end` (newest),
/// normalised to sum to one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecencyWeighted {
    pub start: f32,
    pub end: f32,
}

impl Default for RecencyWeighted {
    fn default() -> Self {
        Self { start: 0.5, end: 1.0 }
    }
}

impl RecencyWeighted {
    /// Normalised weights for `n` frames.
    pub fn weights(&self, n: usize) -> Vec<f32> {
        let raw: Vec<f32> = match n {
            0 => return Vec::new(),
            1 => vec![self.start],
            _ => (0..n)
                .map(|i| self.start + (self.end - self.start) * i as f32 / (n - 1) as f32)
                .collect(),
        };
        let total: f32 = raw.iter().sum();
        if total <= 0.0 {
            return vec![1.0 / n as f32; n];
        }
        raw.iter().map(|w| w / total).collect()
    }
}

impl SequencePooling for RecencyWeighted {
    fn pool(&self, embeddings: &[Embedding]) -> VisionResult<Embedding> {
        weighted_sum(embeddings, &self.weights(embeddings.len()))
    }
}

/// Plain average; ignores order.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MeanPooling;

impl SequencePooling for MeanPooling {
    fn pool(&self, embeddings: &[Embedding]) -> VisionResult<Embedding> {
        let n = embeddings.len().max(1);
        weighted_sum(embeddings, &vec![1.0 / n as f32; embeddings.len()])
    }
}

fn weighted_sum(embeddings: &[Embedding], weights: &[f32]) -> VisionResult<Embedding> {
    let first = embeddings
        .first()
        .ok_or_else(|| VisionError::InvalidInput("Cannot pool an empty sequence".to_string()))?;

    let mut acc = vec![0.0f32; first.dim()];
    for (emb, w) in embeddings.iter().zip(weights) {
        if emb.provider() != first.provider() || emb.dim() != first.dim() {
            return Err(VisionError::InvalidInput(format!(
                "Cannot pool {} ({}d) with {} ({}d)",
                emb.provider(),
                emb.dim(),
                first.provider(),
                first.dim()
            )));
        }
        for (a, v) in acc.iter_mut().zip(emb.as_slice()) {
            *a += w * v;
        }
    }

    // Per-frame embeddings that cancel out mean the provider output degenerated.
    Embedding::new(first.provider(), acc).map_err(|e| VisionError::ProviderInternal {
        provider: first.provider(),
        message: format!("Pooled sequence embedding is degenerate: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProviderId;

    fn emb(v: Vec<f32>) -> Embedding {
        Embedding::new(ProviderId::Dinov2, v).unwrap()
    }

    #[test]
    fn test_weights_ramp() {
        let w = RecencyWeighted::default().weights(3);
        // raw 0.5, 0.75, 1.0 over 2.25
        assert!((w[0] - 0.5 / 2.25).abs() < 1e-6);
        assert!((w[2] - 1.0 / 2.25).abs() < 1e-6);
        assert!((w.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert_eq!(RecencyWeighted::default().weights(1), vec![1.0]);
    }

    #[test]
    fn test_recency_favours_latest_frame() {
        let seq = vec![emb(vec![1.0, 0.0]), emb(vec![0.0, 1.0])];
        let pooled = RecencyWeighted::default().pool(&seq).unwrap();
        assert!(pooled.as_slice()[1] > pooled.as_slice()[0]);

        let mean = MeanPooling.pool(&seq).unwrap();
        assert!((mean.as_slice()[0] - mean.as_slice()[1]).abs() < 1e-6);
    }

    #[test]
    fn test_single_frame_pool_is_identity() {
        let e = emb(vec![0.3, 0.4]);
        let pooled = RecencyWeighted::default().pool(std::slice::from_ref(&e)).unwrap();
        for (a, b) in pooled.as_slice().iter().zip(e.as_slice()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_pool_rejects_empty_and_mixed() {
        assert!(RecencyWeighted::default().pool(&[]).is_err());
        let mixed = vec![
            emb(vec![1.0, 0.0]),
            Embedding::new(ProviderId::Vjepa2, vec![1.0, 0.0]).unwrap(),
        ];
        assert!(matches!(MeanPooling.pool(&mixed), Err(VisionError::InvalidInput(_))));
    }

    #[test]
    fn test_cancelling_frames_are_a_provider_failure() {
        let seq = vec![emb(vec![1.0, 0.0]), emb(vec![-1.0, 0.0])];
        assert!(matches!(
            MeanPooling.pool(&seq),
            Err(VisionError::ProviderInternal { provider: ProviderId::Dinov2, .. })
        ));
    }
}
