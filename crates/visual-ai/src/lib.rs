//! Visual AI: routing, similarity, change detection, and temporal analysis
//! over pluggable visual embedding models.

pub mod config;
pub mod diff;
pub mod frame;
pub mod latency;
pub mod onnx;
pub mod orchestrator;
pub mod pooling;
pub mod provider;
pub mod router;
pub mod similarity;
pub mod telemetry;
pub mod temporal;
pub mod types;

pub use config::RequestSettings;
pub use diff::{detect_feature_changes, detect_pixel_changes, grid_cells, FeatureMap};
pub use frame::Frame;
pub use latency::{LatencyRecorder, LatencySummary, LATENCY_WINDOW};
pub use onnx::{OnnxImageEncoder, Preprocess, TextTokenizer, TextTower};
pub use orchestrator::{FramePair, HealingRequest, HealthReport, ProviderHealth, VisionOrchestrator};
pub use pooling::{MeanPooling, RecencyWeighted, SequencePooling};
pub use provider::{descriptor, Capability, EmbeddingProvider, ProviderDescriptor, ProviderSet};
pub use router::{select, ModelRouter, RouteReason, RouteRequest, RoutingDecision};
pub use similarity::{classify, classify_text_match, cosine_similarity, is_match};
pub use temporal::{assess_healing, detect_stability, StabilityState, StabilityTracker};
pub use types::*;
