//! Image embedding provider backed by an ONNX Runtime vision model.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, TryLockError};

use ndarray::{Array2, Array3, Array4};
use ort::session::Session;
use ort::value::Tensor;

use crate::diff::FeatureMap;
use crate::frame::Frame;
use crate::provider::{unsupported, EmbeddingProvider};
use crate::types::{Embedding, ProviderId, VisionError, VisionResult};

/// Resize target and per-channel normalisation applied before inference.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Preprocess {
    pub size: u32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Preprocess {
    /// ImageNet statistics, as used by the DINOv2 and V-JEPA 2 exports.
    pub fn imagenet(size: u32) -> Self {
        Self {
            size,
            mean: [0.485, 0.456, 0.406],
            std: [0.229, 0.224, 0.225],
        }
    }

    /// SigLIP normalises every channel to [-1, 1].
    pub fn siglip(size: u32) -> Self {
        Self {
            size,
            mean: [0.5; 3],
            std: [0.5; 3],
        }
    }

    /// Input layout of the published export for each provider.
    pub fn for_provider(id: ProviderId) -> Self {
        match id {
            ProviderId::Dinov2 => Self::imagenet(224),
            ProviderId::Vjepa2 => Self::imagenet(384),
            ProviderId::Siglip => Self::siglip(384),
        }
    }
}

impl Default for Preprocess {
    fn default() -> Self {
        Self::imagenet(384)
    }
}

/// Resize `frame` and build a normalised NCHW tensor `[1, 3, size, size]`.
pub fn preprocess(frame: &Frame, prep: &Preprocess) -> Array4<f32> {
    let size = prep.size;
    let resized = image::imageops::resize(
        frame.pixels(),
        size,
        size,
        image::imageops::FilterType::Lanczos3,
    );

    let mut tensor = Array4::<f32>::zeros((1, 3, size as usize, size as usize));
    for y in 0..size {
        for x in 0..size {
            let pixel = resized.get_pixel(x, y);
            for c in 0..3usize {
                let val = pixel[c] as f32 / 255.0;
                tensor[[0, c, y as usize, x as usize]] = (val - prep.mean[c]) / prep.std[c];
            }
        }
    }
    tensor
}

/// Raw model output: shape plus row-major values.
struct ModelOutput {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl ModelOutput {
    fn extract(value: &ort::value::DynValue) -> Result<Self, ort::Error> {
        let view = value.try_extract_array::<f32>()?;
        Ok(Self {
            shape: view.shape().to_vec(),
            data: view.iter().copied().collect(),
        })
    }
}

/// A fixed set of interchangeable slots, each usable by one caller at a time.
///
/// Callers start at a rotating slot and take the first free one, so up to
/// `len()` runs proceed in parallel. When every slot is busy the caller
/// waits on its starting slot.
pub(crate) struct SessionPool<T> {
    slots: Vec<Mutex<T>>,
    next: AtomicUsize,
}

impl<T> SessionPool<T> {
    /// `slots` must not be empty.
    fn new(slots: Vec<T>) -> Self {
        Self {
            slots: slots.into_iter().map(Mutex::new).collect(),
            next: AtomicUsize::new(0),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// A free slot, or `None` if the slot waited on was poisoned.
    fn acquire(&self) -> Option<MutexGuard<'_, T>> {
        let n = self.slots.len();
        if n == 0 {
            return None;
        }
        let start = self.next.fetch_add(1, Ordering::Relaxed) % n;
        for offset in 0..n {
            match self.slots[(start + offset) % n].try_lock() {
                Ok(guard) => return Some(guard),
                Err(TryLockError::WouldBlock) | Err(TryLockError::Poisoned(_)) => continue,
            }
        }
        self.slots[start].lock().ok()
    }
}

fn build_sessions(id: ProviderId, path: &Path, count: usize) -> VisionResult<SessionPool<Session>> {
    if !path.exists() {
        return Err(VisionError::ProviderInternal {
            provider: id,
            message: format!("model not found at {}", path.display()),
        });
    }

    let count = count.max(1);
    tracing::info!("Loading {id} model from {} ({count} session(s))", path.display());

    let sessions = (0..count)
        .map(|_| {
            Session::builder()
                .and_then(|b| b.with_intra_threads(1))
                .and_then(|b| b.commit_from_file(path))
                .map_err(|e| VisionError::ProviderInternal {
                    provider: id,
                    message: format!("Failed to load ONNX model: {e}"),
                })
        })
        .collect::<VisionResult<Vec<_>>>()?;

    Ok(SessionPool::new(sessions))
}

/// Fixed-length token ids for a text encoder.
pub struct TextTokenizer {
    tokenizer: tokenizers::Tokenizer,
    max_len: usize,
    pad_id: i64,
}

impl TextTokenizer {
    /// SigLIP text towers are trained on 64 tokens padded with `</s>`.
    pub const SIGLIP_MAX_LEN: usize = 64;

    pub fn new(tokenizer: tokenizers::Tokenizer, max_len: usize) -> Self {
        let pad_id = tokenizer
            .get_padding()
            .map(|p| p.pad_id)
            .or_else(|| tokenizer.token_to_id("</s>"))
            .unwrap_or(0);
        Self {
            tokenizer,
            max_len: max_len.max(1),
            pad_id: pad_id as i64,
        }
    }

    /// Token ids truncated and padded to exactly `max_len`.
    pub fn ids(&self, text: &str) -> Result<Vec<i64>, String> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| format!("Tokenization failed: {e}"))?;
        let mut ids: Vec<i64> = encoding
            .get_ids()
            .iter()
            .take(self.max_len)
            .map(|&id| id as i64)
            .collect();
        ids.resize(self.max_len, self.pad_id);
        Ok(ids)
    }
}

/// The text half of a text-image model: an ONNX text encoder and its tokenizer.
pub struct TextTower {
    sessions: SessionPool<Session>,
    tokenizer: TextTokenizer,
}

impl TextTower {
    /// Load the text encoder at `model` with the `tokenizer.json` at `tokenizer`.
    pub fn load(
        id: ProviderId,
        model: &Path,
        tokenizer: &Path,
        sessions: usize,
    ) -> VisionResult<Self> {
        let tok = tokenizers::Tokenizer::from_file(tokenizer).map_err(|e| {
            VisionError::ProviderInternal {
                provider: id,
                message: format!("Failed to load tokenizer {}: {e}", tokenizer.display()),
            }
        })?;
        Ok(Self {
            sessions: build_sessions(id, model, sessions)?,
            tokenizer: TextTokenizer::new(tok, TextTokenizer::SIGLIP_MAX_LEN),
        })
    }
}

/// A single-frame vision encoder loaded from an ONNX file, optionally
/// paired with a text tower.
///
/// A `[1, D]` output is taken as the pooled embedding. A `[1, T, D]` output
/// is read as token features: the first token is the embedding, and when the
/// remaining tokens form a square grid they back [`EmbeddingProvider::encode_patches`].
///
/// Each session runs one inference at a time, so the encoder holds several
/// and concurrent requests spread across them.
pub struct OnnxImageEncoder {
    id: ProviderId,
    sessions: SessionPool<Session>,
    prep: Preprocess,
    text: Option<TextTower>,
}

impl OnnxImageEncoder {
    /// Load the model at `path` to serve as provider `id`, with `sessions`
    /// parallel sessions (at least one).
    pub fn load(id: ProviderId, path: &Path, prep: Preprocess, sessions: usize) -> VisionResult<Self> {
        let sessions = build_sessions(id, path, sessions)?;
        tracing::info!("{id} model loaded successfully");
        Ok(Self {
            id,
            sessions,
            prep,
            text: None,
        })
    }

    /// Serve `encode_text` through `tower`.
    pub fn with_text_tower(mut self, tower: TextTower) -> Self {
        tracing::info!("{} text tower attached", self.id);
        self.text = Some(tower);
        self
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn internal(&self, message: String) -> VisionError {
        VisionError::ProviderInternal {
            provider: self.id,
            message,
        }
    }

    fn run(&self, frame: &Frame) -> VisionResult<ModelOutput> {
        let input_tensor = Tensor::from_array(preprocess(frame, &self.prep))
            .map_err(|e| self.internal(format!("Failed to create input tensor: {e}")))?;

        let mut session = self
            .sessions
            .acquire()
            .ok_or_else(|| self.internal("ONNX session lock poisoned".to_string()))?;

        let outputs = session
            .run(ort::inputs![input_tensor])
            .map_err(|e| self.internal(format!("ONNX inference failed: {e}")))?;

        ModelOutput::extract(&outputs[0])
            .map_err(|e| self.internal(format!("Failed to extract output: {e}")))
    }

    fn embedding_from(&self, out: &ModelOutput) -> VisionResult<Embedding> {
        let vector = match out.shape.as_slice() {
            [1, d] => out.data[..*d].to_vec(),
            [1, _, d] => out.data[..*d].to_vec(),
            other => return Err(self.internal(format!("Unexpected output shape {other:?}"))),
        };
        Embedding::new(self.id, vector).map_err(|e| self.internal(e.to_string()))
    }

    fn patches_from(&self, out: &ModelOutput, frame: &Frame) -> VisionResult<FeatureMap> {
        let [1, tokens, dim] = out.shape.as_slice() else {
            return Err(unsupported(self.id, "encode_patches"));
        };
        let (tokens, dim) = (*tokens, *dim);

        // Patch tokens trail the CLS token and up to four register tokens.
        let grid = (tokens as f64).sqrt() as usize;
        if grid == 0 || tokens - grid * grid > 5 {
            return Err(self.internal(format!(
                "{tokens} tokens do not form a square patch grid"
            )));
        }

        let skip = (tokens - grid * grid) * dim;
        let features = Array3::from_shape_vec((grid, grid, dim), out.data[skip..].to_vec())
            .map_err(|e| self.internal(format!("Bad patch layout: {e}")))?;

        FeatureMap::new(features, frame.width(), frame.height())
    }

    fn run_text(&self, tower: &TextTower, text: &str) -> VisionResult<Embedding> {
        let ids = tower.tokenizer.ids(text).map_err(|e| self.internal(e))?;
        let input_ids = Array2::from_shape_vec((1, ids.len()), ids)
            .map_err(|e| self.internal(format!("Bad token layout: {e}")))?;
        let input_tensor = Tensor::from_array(input_ids)
            .map_err(|e| self.internal(format!("Failed to create token tensor: {e}")))?;

        let mut session = tower
            .sessions
            .acquire()
            .ok_or_else(|| self.internal("ONNX text session lock poisoned".to_string()))?;

        let outputs = session
            .run(ort::inputs![input_tensor])
            .map_err(|e| self.internal(format!("ONNX text inference failed: {e}")))?;

        // Text exports list the token states first; the pooled `[1, D]`
        // embedding is the one to use.
        for i in 0..outputs.len() {
            let out = ModelOutput::extract(&outputs[i])
                .map_err(|e| self.internal(format!("Failed to extract text output: {e}")))?;
            if let [1, d] = out.shape.as_slice() {
                return Embedding::new(self.id, out.data[..*d].to_vec())
                    .map_err(|e| self.internal(e.to_string()));
            }
        }
        Err(self.internal("Text model produced no pooled embedding".to_string()))
    }
}

impl EmbeddingProvider for OnnxImageEncoder {
    fn id(&self) -> ProviderId {
        self.id
    }

    fn encode_image(&self, frame: &Frame) -> VisionResult<Embedding> {
        let out = self.run(frame)?;
        self.embedding_from(&out)
    }

    fn encode_text(&self, text: &str) -> VisionResult<Embedding> {
        match &self.text {
            Some(tower) => self.run_text(tower, text),
            None => Err(unsupported(self.id, "encode_text")),
        }
    }

    fn encode_patches(&self, frame: &Frame) -> VisionResult<FeatureMap> {
        let out = self.run(frame)?;
        self.patches_from(&out, frame)
    }

    fn encode_image_with_patches(&self, frame: &Frame) -> VisionResult<(Embedding, FeatureMap)> {
        let out = self.run(frame)?;
        let patches = self.patches_from(&out, frame)?;
        Ok((self.embedding_from(&out)?, patches))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_model_is_an_error() {
        let result = OnnxImageEncoder::load(
            ProviderId::Dinov2,
            Path::new("/nonexistent/model.onnx"),
            Preprocess::default(),
            2,
        );
        assert!(matches!(
            result,
            Err(VisionError::ProviderInternal { provider: ProviderId::Dinov2, .. })
        ));
    }

    #[test]
    fn test_preprocess_per_provider() {
        assert_eq!(Preprocess::for_provider(ProviderId::Dinov2).size, 224);
        assert_eq!(Preprocess::for_provider(ProviderId::Siglip).mean, [0.5; 3]);
    }

    #[test]
    fn test_preprocess_normalizes_channels() {
        let prep = Preprocess::imagenet(8);
        let frame = Frame::solid(20, 10, [255, 0, 124]);
        let tensor = preprocess(&frame, &prep);
        assert_eq!(tensor.dim(), (1, 3, 8, 8));

        let red = (1.0 - prep.mean[0]) / prep.std[0];
        let green = (0.0 - prep.mean[1]) / prep.std[1];
        assert!((tensor[[0, 0, 3, 3]] - red).abs() < 1e-4);
        assert!((tensor[[0, 1, 3, 3]] - green).abs() < 1e-4);
    }

    #[test]
    fn test_missing_text_tower_is_an_error() {
        let result = TextTower::load(
            ProviderId::Siglip,
            Path::new("/nonexistent/siglip_text.onnx"),
            Path::new("/nonexistent/siglip_tokenizer.json"),
            1,
        );
        assert!(matches!(
            result,
            Err(VisionError::ProviderInternal { provider: ProviderId::Siglip, .. })
        ));
    }

    #[test]
    fn test_pool_hands_out_distinct_free_slots() {
        let pool = SessionPool::new(vec![0u32, 1, 2]);
        assert_eq!(pool.len(), 3);

        let first = pool.acquire().unwrap();
        let second = pool.acquire().unwrap();
        let third = pool.acquire().unwrap();
        let mut held = vec![*first, *second, *third];
        held.sort_unstable();
        assert_eq!(held, vec![0, 1, 2]);
        drop(second);

        // Only the released slot is free now.
        assert_eq!(*pool.acquire().unwrap(), held[1]);
    }

    #[test]
    fn test_pool_waits_when_every_slot_is_busy() {
        let pool = SessionPool::new(vec![7u32]);
        let guard = pool.acquire().unwrap();
        std::thread::scope(|scope| {
            let waiter = scope.spawn(|| *pool.acquire().unwrap());
            std::thread::sleep(std::time::Duration::from_millis(20));
            drop(guard);
            assert_eq!(waiter.join().unwrap(), 7);
        });
    }

    #[test]
    fn test_text_ids_are_padded_and_truncated() {
        let json = r#"{
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [],
            "normalizer": null,
            "pre_tokenizer": {"type": "Whitespace"},
            "post_processor": null,
            "decoder": null,
            "model": {
                "type": "WordLevel",
                "vocab": {"<unk>": 0, "</s>": 1, "red": 2, "button": 3},
                "unk_token": "<unk>"
            }
        }"#;
        let tokenizer = tokenizers::Tokenizer::from_bytes(json.as_bytes()).unwrap();

        let text = TextTokenizer::new(tokenizer.clone(), 4);
        assert_eq!(text.ids("red button").unwrap(), vec![2, 3, 1, 1]);
        assert_eq!(text.ids("red submit button").unwrap(), vec![2, 0, 3, 1]);

        let short = TextTokenizer::new(tokenizer, 2);
        assert_eq!(short.ids("red button red").unwrap(), vec![2, 3]);
    }
}
