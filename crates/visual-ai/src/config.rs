//! Per-request tuning knobs and their defaults.

use serde::{Deserialize, Serialize};

use crate::types::{VisionError, VisionResult};

pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.85;
pub const DEFAULT_STABILITY_THRESHOLD: f32 = 0.98;
pub const DEFAULT_GRID_SIZE: u32 = 8;
pub const DEFAULT_MAX_RESULTS: usize = 5;

/// Mean absolute channel difference above which a grid cell counts as changed.
///
/// Measured on raw channels scaled to [0, 1], before any model normalisation.
/// 0.1 is roughly a 26/255 average shift per channel; the same cut on an
/// ImageNet-normalised tensor would sit near 0.023 here.
pub const DEFAULT_PIXEL_THRESHOLD: f32 = 0.1;

/// Cosine dissimilarity above which a patch-feature cell counts as changed.
pub const DEFAULT_FEATURE_THRESHOLD: f32 = 0.15;

/// Thresholds supplied with each request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestSettings {
    pub similarity_threshold: f32,
    pub stability_threshold: f32,
    pub grid_size: u32,
    pub max_results: usize,
    /// Raw-channel scale, see [`DEFAULT_PIXEL_THRESHOLD`].
    pub pixel_threshold: f32,
    pub feature_threshold: f32,
}

impl Default for RequestSettings {
    fn default() -> Self {
        Self {
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            stability_threshold: DEFAULT_STABILITY_THRESHOLD,
            grid_size: DEFAULT_GRID_SIZE,
            max_results: DEFAULT_MAX_RESULTS,
            pixel_threshold: DEFAULT_PIXEL_THRESHOLD,
            feature_threshold: DEFAULT_FEATURE_THRESHOLD,
        }
    }
}

impl RequestSettings {
    /// Reject settings no request could be served with.
    pub fn validate(&self) -> VisionResult<()> {
        if self.grid_size == 0 {
            return Err(VisionError::InvalidInput(
                "grid_size must be positive".to_string(),
            ));
        }
        if self.max_results == 0 {
            return Err(VisionError::InvalidInput(
                "max_results must be positive".to_string(),
            ));
        }
        for (name, value) in [
            ("similarity_threshold", self.similarity_threshold),
            ("stability_threshold", self.stability_threshold),
        ] {
            if !(-1.0..=1.0).contains(&value) {
                return Err(VisionError::InvalidInput(format!(
                    "{name} must be within [-1, 1], got {value}"
                )));
            }
        }
        for (name, value) in [
            ("pixel_threshold", self.pixel_threshold),
            ("feature_threshold", self.feature_threshold),
        ] {
            if !(value > 0.0 && value <= 2.0) {
                return Err(VisionError::InvalidInput(format!(
                    "{name} must be within (0, 2], got {value}"
                )));
            }
        }
        Ok(())
    }
}
