//! Bounded worker pool over a shared orchestrator.
//!
//! Provider calls are synchronous and slow, so each job runs on the
//! blocking thread pool. A semaphore caps how many run at once.

use std::sync::Arc;

use tokio::sync::Semaphore;
use visual_ai::{
    descriptor, BatchVerdict, Capability, EmbeddingProvider, FramePair, OnnxImageEncoder,
    Preprocess, ProviderId, ProviderSet, RequestSettings, RouteRequest, TaskType, TextTower,
    VisionOrchestrator, VisionResult,
};

use crate::config::ServiceConfig;
use crate::error::{CliError, CliResult};

/// Load every configured provider whose model loads; log and skip the rest.
///
/// Each model gets one session per worker so concurrent jobs never queue
/// behind a single session.
pub fn load_providers(config: &ServiceConfig) -> ProviderSet {
    let mut set = ProviderSet::new();
    for &id in &config.models {
        let path = config.model_path(id);
        match OnnxImageEncoder::load(id, &path, Preprocess::for_provider(id), config.workers) {
            Ok(encoder) => {
                let encoder = attach_text_tower(config, id, encoder);
                set.insert(Arc::new(encoder) as Arc<dyn EmbeddingProvider>)
            }
            Err(e) => tracing::warn!("Provider {id} unavailable: {e}"),
        }
    }
    if set.is_empty() {
        tracing::warn!(
            "No providers loaded from {}; every request will fail",
            config.model_dir.display()
        );
    }
    set
}

/// Give a text-image provider its text tower when both files are installed.
fn attach_text_tower(config: &ServiceConfig, id: ProviderId, encoder: OnnxImageEncoder) -> OnnxImageEncoder {
    if !descriptor(id).has(Capability::TextImage) {
        return encoder;
    }

    let (model, tokenizer) = (config.text_model_path(id), config.tokenizer_path(id));
    if !model.exists() || !tokenizer.exists() {
        tracing::warn!(
            "{id} text tower not installed ({} / {}); text search disabled",
            model.display(),
            tokenizer.display()
        );
        return encoder;
    }

    match TextTower::load(id, &model, &tokenizer, config.workers) {
        Ok(tower) => encoder.with_text_tower(tower),
        Err(e) => {
            tracing::warn!("{id} text tower unavailable: {e}");
            encoder
        }
    }
}

#[derive(Clone)]
pub struct ValidationService {
    orchestrator: Arc<VisionOrchestrator>,
    permits: Arc<Semaphore>,
    workers: usize,
}

impl ValidationService {
    pub fn new(orchestrator: VisionOrchestrator, workers: usize) -> CliResult<Self> {
        if workers == 0 {
            return Err(CliError::Config("Worker pool needs at least one worker".to_string()));
        }
        tracing::debug!("Validation service ready with {workers} worker(s)");
        Ok(Self {
            orchestrator: Arc::new(orchestrator),
            permits: Arc::new(Semaphore::new(workers)),
            workers,
        })
    }

    /// Load providers per `config` and start the pool.
    pub fn from_config(config: &ServiceConfig) -> CliResult<Self> {
        Self::new(VisionOrchestrator::new(load_providers(config)), config.workers)
    }

    pub fn orchestrator(&self) -> &Arc<VisionOrchestrator> {
        &self.orchestrator
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run one job on the pool once a worker is free.
    pub async fn run<T, F>(&self, job: F) -> CliResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&VisionOrchestrator) -> VisionResult<T> + Send + 'static,
    {
        let _permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|e| CliError::Worker(e.to_string()))?;

        let orchestrator = Arc::clone(&self.orchestrator);
        let result = tokio::task::spawn_blocking(move || job(&orchestrator))
            .await
            .map_err(|e| CliError::Worker(format!("Worker task failed: {e}")))?;
        Ok(result?)
    }

    /// Compare every pair across the pool. Results keep input order.
    pub async fn batch_compare(
        &self,
        pairs: Vec<FramePair>,
        model: Option<ProviderId>,
        settings: RequestSettings,
    ) -> CliResult<BatchVerdict> {
        settings.validate()?;
        let decision = self
            .orchestrator
            .route(&RouteRequest::new(TaskType::CompareSimple).with_override(model))?;
        let provider = decision.provider;

        let handles: Vec<_> = pairs
            .into_iter()
            .enumerate()
            .map(|(i, pair)| {
                let svc = self.clone();
                tokio::spawn(async move {
                    svc.run(move |o| o.compare_pair(i, &pair, Some(provider), &settings))
                        .await
                })
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            let result = handle
                .await
                .map_err(|e| CliError::Worker(format!("Batch task failed: {e}")))??;
            results.push(result);
        }

        tracing::info!("Batch of {} pairs compared with {provider}", results.len());
        Ok(BatchVerdict::from_results(results, provider))
    }
}

impl std::fmt::Debug for ValidationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationService")
            .field("orchestrator", &self.orchestrator)
            .field("workers", &self.workers)
            .finish()
    }
}
