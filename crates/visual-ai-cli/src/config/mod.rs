//! Configuration loading and resolution.
//!
//! Each setting resolves as: explicit flag, then environment variable,
//! then default.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use clap::Args;
use visual_ai::{ProviderId, RequestSettings};

use crate::error::{CliError, CliResult};

pub const MODELS_ENV: &str = "VISUAL_AI_MODELS";
pub const MODEL_DIR_ENV: &str = "VISUAL_AI_MODEL_DIR";
pub const WORKERS_ENV: &str = "VISUAL_AI_WORKERS";

pub const DEFAULT_MODELS: &str = "dinov2,vjepa2";
pub const DEFAULT_WORKERS: usize = 4;

/// Resolved process configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub models: Vec<ProviderId>,
    pub model_dir: PathBuf,
    pub workers: usize,
}

impl ServiceConfig {
    pub fn resolve(
        models: Option<&str>,
        model_dir: Option<&str>,
        workers: Option<usize>,
    ) -> CliResult<Self> {
        Ok(Self {
            models: resolve_models(models)?,
            model_dir: resolve_model_dir(model_dir),
            workers: resolve_workers(workers)?,
        })
    }

    /// `<model_dir>/<id>.onnx`.
    pub fn model_path(&self, id: ProviderId) -> PathBuf {
        model_path(&self.model_dir, id)
    }

    /// `<model_dir>/<id>_text.onnx`, the text tower of a text-image model.
    pub fn text_model_path(&self, id: ProviderId) -> PathBuf {
        self.model_dir.join(format!("{id}_text.onnx"))
    }

    /// `<model_dir>/<id>_tokenizer.json`, the tokenizer for the text tower.
    pub fn tokenizer_path(&self, id: ProviderId) -> PathBuf {
        self.model_dir.join(format!("{id}_tokenizer.json"))
    }

    /// Configured providers whose model file is present.
    pub fn installed_models(&self) -> BTreeSet<ProviderId> {
        self.models
            .iter()
            .copied()
            .filter(|id| self.model_path(*id).exists())
            .collect()
    }
}

pub fn model_path(dir: &Path, id: ProviderId) -> PathBuf {
    dir.join(format!("{id}.onnx"))
}

/// Parse a comma-separated provider list, dropping duplicates.
pub fn parse_models(list: &str) -> CliResult<Vec<ProviderId>> {
    let mut models = Vec::new();
    for part in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let id: ProviderId = part
            .parse()
            .map_err(|e: visual_ai::VisionError| CliError::Config(e.to_string()))?;
        if !models.contains(&id) {
            models.push(id);
        }
    }
    if models.is_empty() {
        return Err(CliError::Config("No models configured".to_string()));
    }
    Ok(models)
}

pub fn resolve_models(explicit: Option<&str>) -> CliResult<Vec<ProviderId>> {
    if let Some(list) = explicit {
        return parse_models(list);
    }
    if let Ok(list) = std::env::var(MODELS_ENV) {
        return parse_models(&list);
    }
    parse_models(DEFAULT_MODELS)
}

pub fn resolve_model_dir(explicit: Option<&str>) -> PathBuf {
    if let Some(dir) = explicit {
        return PathBuf::from(dir);
    }

    if let Ok(dir) = std::env::var(MODEL_DIR_ENV) {
        return PathBuf::from(dir);
    }

    resolve_default_model_dir()
}

fn resolve_default_model_dir() -> PathBuf {
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string());

    PathBuf::from(format!("{home}/.visual-ai/models"))
}

pub fn parse_workers(value: &str) -> CliResult<usize> {
    match value.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(CliError::Config(format!(
            "Worker count must be a positive integer, got {value:?}"
        ))),
    }
}

pub fn resolve_workers(explicit: Option<usize>) -> CliResult<usize> {
    if let Some(n) = explicit {
        return parse_workers(&n.to_string());
    }
    if let Ok(value) = std::env::var(WORKERS_ENV) {
        return parse_workers(&value);
    }
    Ok(DEFAULT_WORKERS)
}

/// Per-request threshold flags, layered over [`RequestSettings::default`].
#[derive(Args, Debug, Clone, Default)]
pub struct SettingsArgs {
    /// Similarity threshold for a match.
    #[arg(long)]
    pub threshold: Option<f32>,

    /// Consecutive-frame similarity that counts as stable.
    #[arg(long)]
    pub stability_threshold: Option<f32>,

    /// Grid cells per side for region detection and text search.
    #[arg(long)]
    pub grid_size: Option<u32>,

    /// Maximum regions returned by text search.
    #[arg(long)]
    pub max_results: Option<usize>,

    /// Per-cell pixel difference that counts as changed.
    #[arg(long)]
    pub pixel_threshold: Option<f32>,

    /// Per-cell feature dissimilarity that counts as changed.
    #[arg(long)]
    pub feature_threshold: Option<f32>,
}

impl SettingsArgs {
    pub fn apply(&self) -> RequestSettings {
        let mut s = RequestSettings::default();
        if let Some(v) = self.threshold {
            s.similarity_threshold = v;
        }
        if let Some(v) = self.stability_threshold {
            s.stability_threshold = v;
        }
        if let Some(v) = self.grid_size {
            s.grid_size = v;
        }
        if let Some(v) = self.max_results {
            s.max_results = v;
        }
        if let Some(v) = self.pixel_threshold {
            s.pixel_threshold = v;
        }
        if let Some(v) = self.feature_threshold {
            s.feature_threshold = v;
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_models() {
        assert_eq!(
            parse_models("dinov2, SIGLIP,dinov2").unwrap(),
            vec![ProviderId::Dinov2, ProviderId::Siglip]
        );
        assert!(parse_models("dinov2,clip").is_err());
        assert!(parse_models(" , ").is_err());
    }

    #[test]
    fn test_explicit_flags_win() {
        let cfg = ServiceConfig::resolve(Some("siglip"), Some("/opt/models"), Some(2)).unwrap();
        assert_eq!(cfg.models, vec![ProviderId::Siglip]);
        assert_eq!(cfg.model_path(ProviderId::Siglip), PathBuf::from("/opt/models/siglip.onnx"));
        assert_eq!(cfg.workers, 2);
        assert_eq!(
            cfg.text_model_path(ProviderId::Siglip),
            PathBuf::from("/opt/models/siglip_text.onnx")
        );
        assert_eq!(
            cfg.tokenizer_path(ProviderId::Siglip),
            PathBuf::from("/opt/models/siglip_tokenizer.json")
        );
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(resolve_workers(Some(0)).is_err());
        assert!(parse_workers("four").is_err());
        assert_eq!(parse_workers(" 8 ").unwrap(), 8);
    }

    #[test]
    fn test_settings_overrides() {
        let args = SettingsArgs {
            threshold: Some(0.9),
            grid_size: Some(4),
            ..Default::default()
        };
        let s = args.apply();
        assert_eq!(s.similarity_threshold, 0.9);
        assert_eq!(s.grid_size, 4);
        assert_eq!(s.max_results, RequestSettings::default().max_results);
    }
}
