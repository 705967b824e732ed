//! Embedding provider interface, static provider metadata, and the registry
//! of loaded providers.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;

use crate::diff::FeatureMap;
use crate::frame::Frame;
use crate::types::{Embedding, ProviderId, VisionError, VisionResult};

/// What a provider is good for. Drives routing upgrades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    Images,
    Sequences,
    TextImage,
}

/// Read-only metadata about a provider, fixed at build time.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderDescriptor {
    pub id: ProviderId,
    pub name: &'static str,
    pub license: &'static str,
    pub source: &'static str,
    pub best_for: &'static [&'static str],
    pub typical_latency_ms: u32,
    pub memory_mb: u32,
    pub capabilities: &'static [Capability],
}

impl ProviderDescriptor {
    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

pub static PROVIDERS: [ProviderDescriptor; 3] = [
    ProviderDescriptor {
        id: ProviderId::Dinov2,
        name: "DINOv2-giant",
        license: "Apache-2.0",
        source: "facebook/dinov2-giant",
        best_for: &["fast comparison", "embeddings", "visual regression"],
        typical_latency_ms: 50,
        memory_mb: 1500,
        capabilities: &[Capability::Images],
    },
    ProviderDescriptor {
        id: ProviderId::Vjepa2,
        name: "V-JEPA 2",
        license: "MIT + Apache-2.0",
        source: "facebook/vjepa2-vitg-fpc64-384",
        best_for: &["sequences", "stability", "self-healing", "state transitions"],
        typical_latency_ms: 150,
        memory_mb: 3000,
        capabilities: &[Capability::Images, Capability::Sequences],
    },
    ProviderDescriptor {
        id: ProviderId::Siglip,
        name: "SigLIP-large",
        license: "Apache-2.0",
        source: "google/siglip-large-patch16-384",
        best_for: &["text-to-image search", "semantic matching"],
        typical_latency_ms: 60,
        memory_mb: 1500,
        capabilities: &[Capability::Images, Capability::TextImage],
    },
];

pub fn descriptor(id: ProviderId) -> &'static ProviderDescriptor {
    match id {
        ProviderId::Dinov2 => &PROVIDERS[0],
        ProviderId::Vjepa2 => &PROVIDERS[1],
        ProviderId::Siglip => &PROVIDERS[2],
    }
}

pub(crate) fn unsupported(provider: ProviderId, capability: &'static str) -> VisionError {
    VisionError::UnsupportedCapability {
        provider,
        capability,
    }
}

/// A visual encoder. Calls are synchronous, may be slow, and may run
/// concurrently from many requests.
///
/// Only `encode_image` is mandatory; the rest report
/// [`VisionError::UnsupportedCapability`] unless overridden.
pub trait EmbeddingProvider: Send + Sync {
    fn id(&self) -> ProviderId;

    fn descriptor(&self) -> &'static ProviderDescriptor {
        descriptor(self.id())
    }

    fn encode_image(&self, frame: &Frame) -> VisionResult<Embedding>;

    /// Encode an ordered, non-empty run of frames as one embedding.
    fn encode_sequence(&self, _frames: &[Frame]) -> VisionResult<Embedding> {
        Err(unsupported(self.id(), "encode_sequence"))
    }

    fn encode_text(&self, _text: &str) -> VisionResult<Embedding> {
        Err(unsupported(self.id(), "encode_text"))
    }

    /// Patch-level embeddings for feature-mode change detection.
    fn encode_patches(&self, _frame: &Frame) -> VisionResult<FeatureMap> {
        Err(unsupported(self.id(), "encode_patches"))
    }

    /// Embedding and patch features together. Providers that get both from
    /// one forward pass should override this; the default runs two.
    fn encode_image_with_patches(&self, frame: &Frame) -> VisionResult<(Embedding, FeatureMap)> {
        let patches = self.encode_patches(frame)?;
        Ok((self.encode_image(frame)?, patches))
    }

    /// Whether `encode_sequence` models time itself. When false, sequences
    /// are pooled from per-frame embeddings instead.
    fn native_sequences(&self) -> bool {
        false
    }
}

/// The providers loaded in this process, keyed by id.
#[derive(Clone, Default)]
pub struct ProviderSet {
    providers: BTreeMap<ProviderId, Arc<dyn EmbeddingProvider>>,
}

impl ProviderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider, replacing any previous one with the same id.
    pub fn insert(&mut self, provider: Arc<dyn EmbeddingProvider>) {
        let id = provider.id();
        tracing::info!("Provider {id} registered ({})", provider.descriptor().name);
        self.providers.insert(id, provider);
    }

    pub fn with(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.insert(provider);
        self
    }

    pub fn get(&self, id: ProviderId) -> Option<Arc<dyn EmbeddingProvider>> {
        self.providers.get(&id).cloned()
    }

    /// The availability set the router chooses from.
    pub fn available(&self) -> BTreeSet<ProviderId> {
        self.providers.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl std::fmt::Debug for ProviderSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSet")
            .field("available", &self.available())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(ProviderId);

    impl EmbeddingProvider for Fixed {
        fn id(&self) -> ProviderId {
            self.0
        }

        fn encode_image(&self, _frame: &Frame) -> VisionResult<Embedding> {
            Embedding::new(self.0, vec![1.0, 0.0])
        }
    }

    #[test]
    fn test_descriptor_lookup_matches_id() {
        for id in ProviderId::ALL {
            assert_eq!(descriptor(id).id, id);
        }
        assert!(descriptor(ProviderId::Vjepa2).has(Capability::Sequences));
        assert!(!descriptor(ProviderId::Dinov2).has(Capability::Sequences));
        assert!(descriptor(ProviderId::Siglip).has(Capability::TextImage));
    }

    #[test]
    fn test_default_capabilities_unsupported() {
        let p = Fixed(ProviderId::Dinov2);
        assert!(matches!(
            p.encode_text("submit button"),
            Err(VisionError::UnsupportedCapability { capability: "encode_text", .. })
        ));
        assert!(p.encode_sequence(&[]).is_err());
        assert!(matches!(
            p.encode_image_with_patches(&Frame::solid(2, 2, [0, 0, 0])),
            Err(VisionError::UnsupportedCapability { capability: "encode_patches", .. })
        ));
        assert!(!p.native_sequences());
    }

    #[test]
    fn test_provider_set_availability() {
        let set = ProviderSet::new()
            .with(Arc::new(Fixed(ProviderId::Siglip)))
            .with(Arc::new(Fixed(ProviderId::Dinov2)));
        let ids: Vec<_> = set.available().into_iter().collect();
        assert_eq!(ids, vec![ProviderId::Dinov2, ProviderId::Siglip]);
        assert!(set.get(ProviderId::Vjepa2).is_none());
        assert_eq!(set.len(), 2);
    }
}
