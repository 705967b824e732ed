//! Request orchestration: route, encode, analyse, assemble a verdict.
//!
//! Every public operation is a function of its inputs and the provider set
//! fixed at construction. The only shared state is the latency window,
//! which is written after each successful request and never read back by
//! routing or scoring.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use crate::config::RequestSettings;
use crate::diff::{detect_feature_changes, detect_pixel_changes, grid_cells, rank_cells, FeatureMap};
use crate::frame::{require_frames, Frame};
use crate::latency::LatencyRecorder;
use crate::pooling::{RecencyWeighted, SequencePooling};
use crate::provider::{EmbeddingProvider, ProviderDescriptor, ProviderSet};
use crate::router::{ModelRouter, RouteRequest, RoutingDecision};
use crate::similarity::{classify, classify_text_match, embedding_similarity, is_match};
use crate::telemetry;
use crate::temporal;
use crate::types::{
    BatchVerdict, ChangeAnalysis, ChangeRegion, Embedding, EmbeddingOutput, FoundElement,
    HealingVerdict, PairResult, ProviderId, SimilarityVerdict, StabilityVerdict, TaskType,
    TextMatchVerdict, VisionError, VisionResult,
};

/// Confidence reported for single-frame comparisons.
const COMPARE_CONFIDENCE: f32 = 0.95;

/// Confidence in sequence-level verdicts, with and without native
/// sequence modelling.
const SEQUENCE_CONFIDENCE_NATIVE: f32 = 0.9;
const SEQUENCE_CONFIDENCE_POOLED: f32 = 0.75;

/// Confidence for change analysis, with and without native sequence modelling.
const CHANGE_CONFIDENCE_NATIVE: f32 = 0.85;
const CHANGE_CONFIDENCE_POOLED: f32 = 0.70;

/// Frames for a healing validation.
#[derive(Debug, Clone)]
pub struct HealingRequest {
    pub before: Vec<Frame>,
    pub after: Vec<Frame>,
    pub expected: Vec<Frame>,
    pub high_accuracy: bool,
}

impl HealingRequest {
    pub fn new(before: Vec<Frame>, after: Vec<Frame>, expected: Vec<Frame>) -> Self {
        Self {
            before,
            after,
            expected,
            high_accuracy: false,
        }
    }

    /// Split one recorded sequence at its midpoint into before and after.
    ///
    /// `expected` defaults to the after half.
    pub fn from_sequence(frames: Vec<Frame>, expected: Option<Vec<Frame>>) -> VisionResult<Self> {
        if frames.len() < 2 {
            return Err(VisionError::InvalidInput(format!(
                "Healing needs at least two frames to split, got {}",
                frames.len()
            )));
        }

        let mut before = frames;
        let after = before.split_off((before.len() / 2).max(1));
        let expected = expected.unwrap_or_else(|| after.clone());
        Ok(Self::new(before, after, expected))
    }

    pub fn high_accuracy(mut self, high_accuracy: bool) -> Self {
        self.high_accuracy = high_accuracy;
        self
    }

    fn check(&self) -> VisionResult<()> {
        require_frames(&self.before, "before")?;
        require_frames(&self.after, "after")?;
        require_frames(&self.expected, "expected")?;
        Ok(())
    }
}

/// One pair of a batch comparison.
#[derive(Debug, Clone)]
pub struct FramePair {
    pub pair_id: Option<String>,
    pub baseline: Frame,
    pub actual: Frame,
}

impl FramePair {
    pub fn new(baseline: Frame, actual: Frame) -> Self {
        Self {
            pair_id: None,
            baseline,
            actual,
        }
    }

    pub fn with_id(mut self, pair_id: impl Into<String>) -> Self {
        self.pair_id = Some(pair_id.into());
        self
    }

    /// The caller's id, or `pair_<index>`.
    pub fn id_or_index(&self, index: usize) -> String {
        self.pair_id
            .clone()
            .unwrap_or_else(|| format!("pair_{index}"))
    }
}

/// Health of one loaded provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    #[serde(flatten)]
    pub descriptor: ProviderDescriptor,
    pub observations: usize,
    pub avg_inference_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub providers: Vec<ProviderHealth>,
}

/// A provider bound for the duration of one request.
///
/// All encoder calls go through here so failures come back typed and
/// panics never cross the request boundary.
struct Encoder<'a> {
    provider: &'a dyn EmbeddingProvider,
    pooling: &'a dyn SequencePooling,
}

impl Encoder<'_> {
    fn id(&self) -> ProviderId {
        self.provider.id()
    }

    fn native_sequences(&self) -> bool {
        self.provider.native_sequences()
    }

    fn sequence_confidence(&self) -> f32 {
        if self.native_sequences() {
            SEQUENCE_CONFIDENCE_NATIVE
        } else {
            SEQUENCE_CONFIDENCE_POOLED
        }
    }

    fn guard<T>(&self, call: impl FnOnce() -> VisionResult<T>) -> VisionResult<T> {
        let provider = self.id();
        match catch_unwind(AssertUnwindSafe(call)) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e @ VisionError::UnsupportedCapability { .. }))
            | Ok(Err(e @ VisionError::ProviderInternal { .. })) => Err(e),
            Ok(Err(other)) => Err(VisionError::ProviderInternal {
                provider,
                message: other.to_string(),
            }),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!("Provider {provider} panicked: {message}");
                Err(VisionError::ProviderInternal { provider, message })
            }
        }
    }

    fn image(&self, frame: &Frame) -> VisionResult<Embedding> {
        self.guard(|| self.provider.encode_image(frame))
    }

    fn images(&self, frames: &[Frame]) -> VisionResult<Vec<Embedding>> {
        frames.iter().map(|f| self.image(f)).collect()
    }

    /// One embedding for an ordered run of frames, pooled when the
    /// provider has no temporal model of its own.
    fn sequence(&self, frames: &[Frame]) -> VisionResult<Embedding> {
        if self.native_sequences() {
            return self.guard(|| self.provider.encode_sequence(frames));
        }
        let per_frame = self.images(frames)?;
        self.pooling.pool(&per_frame)
    }

    fn text(&self, text: &str) -> VisionResult<Embedding> {
        self.guard(|| self.provider.encode_text(text))
    }

    fn image_with_patches(&self, frame: &Frame) -> VisionResult<(Embedding, FeatureMap)> {
        self.guard(|| self.provider.encode_image_with_patches(frame))
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "provider panicked".to_string()
    }
}

/// Pixel-grid regions. Frames of different sizes are first resampled to the
/// smaller of each side so both share one grid.
fn pixel_regions(a: &Frame, b: &Frame, settings: &RequestSettings) -> VisionResult<Vec<ChangeRegion>> {
    if a.dimensions() == b.dimensions() {
        return detect_pixel_changes(a, b, settings.grid_size, settings.pixel_threshold);
    }

    let width = a.width().min(b.width());
    let height = a.height().min(b.height());
    tracing::debug!(
        "Resampling {:?} and {:?} frames to {width}x{height} for region diff",
        a.dimensions(),
        b.dimensions()
    );
    detect_pixel_changes(
        &a.resized(width, height),
        &b.resized(width, height),
        settings.grid_size,
        settings.pixel_threshold,
    )
}

fn non_empty(text: &str, what: &str) -> VisionResult<()> {
    if text.trim().is_empty() {
        return Err(VisionError::InvalidInput(format!("Empty {what}")));
    }
    Ok(())
}

/// The visual decision layer's entry point.
pub struct VisionOrchestrator {
    providers: ProviderSet,
    router: ModelRouter,
    latency: Arc<LatencyRecorder>,
    pooling: Box<dyn SequencePooling>,
}

impl VisionOrchestrator {
    pub fn new(providers: ProviderSet) -> Self {
        let router = ModelRouter::new(providers.available());
        tracing::info!(
            "Visual AI ready with {} provider(s): {:?}",
            providers.len(),
            router.available()
        );
        Self {
            providers,
            router,
            latency: Arc::new(LatencyRecorder::default()),
            pooling: Box::new(RecencyWeighted::default()),
        }
    }

    /// Share a latency window with the embedding service.
    pub fn with_latency(mut self, latency: Arc<LatencyRecorder>) -> Self {
        self.latency = latency;
        self
    }

    /// Replace the pooling used for providers without native sequences.
    pub fn with_pooling(mut self, pooling: Box<dyn SequencePooling>) -> Self {
        self.pooling = pooling;
        self
    }

    pub fn router(&self) -> &ModelRouter {
        &self.router
    }

    pub fn latency(&self) -> &Arc<LatencyRecorder> {
        &self.latency
    }

    pub fn route(&self, req: &RouteRequest) -> VisionResult<RoutingDecision> {
        self.router.route(req)
    }

    /// Run one request: validate, route, call `op`, record the outcome.
    ///
    /// `check` is evaluated by the caller before any provider is touched.
    fn serve<T>(
        &self,
        req: RouteRequest,
        check: VisionResult<()>,
        op: impl FnOnce(&Encoder<'_>) -> VisionResult<T>,
    ) -> VisionResult<T> {
        let started = Instant::now();
        let mut chosen = None;

        let result = check.and_then(|()| {
            let decision = self.router.route(&req)?;
            if decision.is_fallback() {
                telemetry::record_fallback(req.task);
            }
            chosen = Some(decision.provider);

            let provider = self
                .providers
                .get(decision.provider)
                .ok_or(VisionError::NoProviderAvailable)?;
            let encoder = Encoder {
                provider: provider.as_ref(),
                pooling: self.pooling.as_ref(),
            };
            op(&encoder)
        });

        let elapsed = started.elapsed();
        if let (Ok(_), Some(provider)) = (&result, chosen) {
            self.latency.record(provider, elapsed);
        }
        if let Err(e) = &result {
            tracing::warn!("{} failed: {e}", req.task);
        }
        telemetry::record_request(
            chosen,
            req.task,
            elapsed,
            telemetry::outcome_label(result.as_ref().map(|_| ())),
        );
        result
    }

    /// Compare two frames. Changed regions are reported when they differ.
    pub fn compare(
        &self,
        baseline: &Frame,
        actual: &Frame,
        model: Option<ProviderId>,
        settings: &RequestSettings,
    ) -> VisionResult<SimilarityVerdict> {
        let req = RouteRequest::new(TaskType::CompareSimple).with_override(model);
        self.serve(req, settings.validate(), |enc| {
            self.compare_with(enc, baseline, actual, settings)
        })
    }

    fn compare_with(
        &self,
        enc: &Encoder<'_>,
        baseline: &Frame,
        actual: &Frame,
        settings: &RequestSettings,
    ) -> VisionResult<SimilarityVerdict> {
        let score = embedding_similarity(&enc.image(baseline)?, &enc.image(actual)?)?;
        let band = classify(score);
        let matched = is_match(score, settings.similarity_threshold);

        let changed_regions = if matched {
            Vec::new()
        } else {
            pixel_regions(baseline, actual, settings)?
        };

        Ok(SimilarityVerdict {
            score,
            band,
            is_match: matched,
            analysis: band.frame_analysis().to_string(),
            confidence: COMPARE_CONFIDENCE,
            model_used: enc.id(),
            changed_regions,
        })
    }

    /// Compare two frame sequences as wholes.
    pub fn compare_sequences(
        &self,
        a: &[Frame],
        b: &[Frame],
        model: Option<ProviderId>,
        settings: &RequestSettings,
    ) -> VisionResult<SimilarityVerdict> {
        let check = settings
            .validate()
            .and_then(|()| require_frames(a, "first sequence").map(|_| ()))
            .and_then(|()| require_frames(b, "second sequence").map(|_| ()));
        let req = RouteRequest::new(TaskType::CompareSequence)
            .with_override(model)
            .with_frames(a.len().max(b.len()));

        self.serve(req, check, |enc| {
            let score = embedding_similarity(&enc.sequence(a)?, &enc.sequence(b)?)?;
            let band = classify(score);
            Ok(SimilarityVerdict {
                score,
                band,
                is_match: is_match(score, settings.similarity_threshold),
                analysis: band.sequence_analysis().to_string(),
                confidence: enc.sequence_confidence(),
                model_used: enc.id(),
                changed_regions: Vec::new(),
            })
        })
    }

    /// Did a self-healing fix land the UI where it should be?
    pub fn validate_healing(
        &self,
        request: &HealingRequest,
        settings: &RequestSettings,
    ) -> VisionResult<HealingVerdict> {
        let check = settings.validate().and_then(|()| request.check());
        let req = RouteRequest::new(TaskType::HealingValidation)
            .with_frames(request.before.len() + request.after.len())
            .high_accuracy(request.high_accuracy);

        self.serve(req, check, |enc| {
            let (Some(last_after), Some(last_expected)) =
                (request.after.last(), request.expected.last())
            else {
                return Err(VisionError::InvalidInput("No frames provided".to_string()));
            };

            let transition: Vec<Frame> = request
                .before
                .iter()
                .chain(request.after.iter())
                .cloned()
                .collect();
            let transition_similarity =
                embedding_similarity(&enc.sequence(&transition)?, &enc.sequence(&request.expected)?)?;
            let final_similarity =
                embedding_similarity(&enc.image(last_after)?, &enc.image(last_expected)?)?;

            Ok(temporal::assess_healing(
                transition_similarity,
                final_similarity,
                settings.similarity_threshold,
                enc.sequence_confidence(),
                enc.id(),
            ))
        })
    }

    /// Has the UI stopped moving, and since which frame?
    pub fn detect_stability(
        &self,
        frames: &[Frame],
        settings: &RequestSettings,
    ) -> VisionResult<StabilityVerdict> {
        let check = settings
            .validate()
            .and_then(|()| require_frames(frames, "stability").map(|_| ()));
        let req = RouteRequest::new(TaskType::StabilityCheck).with_frames(frames.len());

        self.serve(req, check, |enc| {
            let embeddings = enc.images(frames)?;
            temporal::detect_stability(&embeddings, settings.stability_threshold)
        })
    }

    /// Grid regions of `frame` ranked against a text description.
    pub fn find_by_description(
        &self,
        frame: &Frame,
        description: &str,
        model: Option<ProviderId>,
        settings: &RequestSettings,
    ) -> VisionResult<Vec<FoundElement>> {
        let check = settings
            .validate()
            .and_then(|()| non_empty(description, "description"));
        let req = RouteRequest::new(TaskType::TextSearch).with_override(model);

        self.serve(req, check, |enc| {
            let query = enc.text(description)?;

            let mut cells = Vec::new();
            for cell in grid_cells(frame.width(), frame.height(), settings.grid_size) {
                let crop = frame.crop(&cell)?;
                cells.push((cell, enc.image(&crop)?));
            }

            let ranked = rank_cells(cells, &query, settings.max_results)?;
            Ok(ranked
                .into_iter()
                .map(|(cell, score)| FoundElement {
                    region: ChangeRegion::from_cell(cell, score),
                    confidence: score,
                    matched_description: description.to_string(),
                })
                .collect())
        })
    }

    /// How well does the whole frame match a text description?
    pub fn compare_with_description(
        &self,
        frame: &Frame,
        description: &str,
        model: Option<ProviderId>,
    ) -> VisionResult<TextMatchVerdict> {
        let req = RouteRequest::new(TaskType::TextSearch).with_override(model);
        self.serve(req, non_empty(description, "description"), |enc| {
            let query = enc.text(description)?;
            let score = embedding_similarity(&enc.image(frame)?, &query)?;
            let band = classify_text_match(score);
            Ok(TextMatchVerdict {
                score,
                band,
                analysis: band.analysis(description),
                model_used: enc.id(),
            })
        })
    }

    pub fn generate_embedding(
        &self,
        frame: &Frame,
        model: Option<ProviderId>,
    ) -> VisionResult<EmbeddingOutput> {
        let req = RouteRequest::new(TaskType::EmbeddingGeneration).with_override(model);
        self.serve(req, Ok(()), |enc| {
            let embedding = enc.image(frame)?;
            Ok(EmbeddingOutput {
                embedding_dim: embedding.dim(),
                model_used: embedding.provider(),
                embedding: embedding.into_vec(),
            })
        })
    }

    /// Compare one pair of a batch. Used by [`batch_compare`](Self::batch_compare)
    /// and by callers that fan pairs out themselves.
    pub fn compare_pair(
        &self,
        index: usize,
        pair: &FramePair,
        model: Option<ProviderId>,
        settings: &RequestSettings,
    ) -> VisionResult<PairResult> {
        let verdict = self.compare(&pair.baseline, &pair.actual, model, settings)?;
        Ok(PairResult {
            pair_id: pair.id_or_index(index),
            score: verdict.score,
            is_match: verdict.is_match,
            analysis: verdict.analysis,
        })
    }

    /// Compare every pair with one provider, results in input order.
    pub fn batch_compare(
        &self,
        pairs: &[FramePair],
        model: Option<ProviderId>,
        settings: &RequestSettings,
    ) -> VisionResult<BatchVerdict> {
        settings.validate()?;
        let decision = self
            .route(&RouteRequest::new(TaskType::CompareSimple).with_override(model))?;

        let results = pairs
            .iter()
            .enumerate()
            .map(|(i, pair)| self.compare_pair(i, pair, Some(decision.provider), settings))
            .collect::<VisionResult<Vec<_>>>()?;

        Ok(BatchVerdict::from_results(results, decision.provider))
    }

    /// What changed between two frames, and was it what `action` should cause?
    pub fn analyze_change(
        &self,
        before: &Frame,
        after: &Frame,
        action: Option<&str>,
        settings: &RequestSettings,
    ) -> VisionResult<ChangeAnalysis> {
        let req = RouteRequest::new(TaskType::ChangeAnalysis);
        self.serve(req, settings.validate(), |enc| {
            let confidence = if enc.native_sequences() {
                CHANGE_CONFIDENCE_NATIVE
            } else {
                CHANGE_CONFIDENCE_POOLED
            };

            // One forward pass per frame yields both the embedding and the
            // patch grid; without patches, fall back to the pixel grid.
            let (similarity, changed_regions) = match enc.image_with_patches(before) {
                Ok((emb_before, map_before)) => {
                    let (emb_after, map_after) = enc.image_with_patches(after)?;
                    (
                        embedding_similarity(&emb_before, &emb_after)?,
                        detect_feature_changes(
                            &map_before,
                            &map_after,
                            settings.grid_size,
                            settings.feature_threshold,
                        )?,
                    )
                }
                Err(VisionError::UnsupportedCapability { .. }) => (
                    embedding_similarity(&enc.image(before)?, &enc.image(after)?)?,
                    pixel_regions(before, after, settings)?,
                ),
                Err(e) => return Err(e),
            };

            let mut analysis = temporal::assess_change(similarity, action, confidence);
            analysis.changed_regions = changed_regions;
            analysis.model_used = Some(enc.id());
            Ok(analysis)
        })
    }

    /// Loaded providers with their recent latency.
    pub fn health(&self) -> HealthReport {
        let providers: Vec<ProviderHealth> = self
            .router
            .available()
            .iter()
            .map(|&id| {
                let summary = self.latency.summary(id);
                ProviderHealth {
                    descriptor: crate::provider::descriptor(id).clone(),
                    observations: summary.observations,
                    avg_inference_ms: summary.avg_ms,
                }
            })
            .collect();

        HealthReport {
            healthy: !providers.is_empty(),
            providers,
        }
    }
}

impl std::fmt::Debug for VisionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisionOrchestrator")
            .field("providers", &self.providers)
            .field("pooling", &self.pooling)
            .finish()
    }
}
