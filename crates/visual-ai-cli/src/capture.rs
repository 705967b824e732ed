//! Image sources: file paths and base64 `data:` URIs.

use std::path::Path;

use image::{DynamicImage, ImageFormat};
use visual_ai::Frame;

use crate::error::{CliError, CliResult};

fn source_error(source: &str, reason: impl std::fmt::Display) -> CliError {
    let shown = if source.chars().count() > 48 {
        format!("{}...", source.chars().take(48).collect::<String>())
    } else {
        source.to_string()
    };
    CliError::ImageSource {
        source_ref: shown,
        reason: reason.to_string(),
    }
}

/// Load an image from a file path.
pub fn load_from_file(path: &str) -> CliResult<DynamicImage> {
    if !Path::new(path).exists() {
        return Err(source_error(path, "file not found"));
    }
    image::open(path).map_err(|e| source_error(path, e))
}

/// Load an image from base64-encoded data.
pub fn load_from_base64(data: &str, mime: &str) -> CliResult<DynamicImage> {
    use base64::Engine;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|e| source_error(data, format!("Invalid base64: {e}")))?;

    let format = match mime {
        "image/png" => Some(ImageFormat::Png),
        "image/jpeg" | "image/jpg" => Some(ImageFormat::Jpeg),
        "image/webp" => Some(ImageFormat::WebP),
        "image/gif" => Some(ImageFormat::Gif),
        _ => None,
    };

    let img = if let Some(fmt) = format {
        image::load_from_memory_with_format(&bytes, fmt)
    } else {
        image::load_from_memory(&bytes)
    };
    img.map_err(|e| source_error(data, e))
}

/// Resolve `source` to a decoded frame.
///
/// `data:<mime>;base64,<payload>` is decoded inline; anything else is a
/// file path.
pub fn load_frame(source: &str) -> CliResult<Frame> {
    let img = match source.strip_prefix("data:") {
        Some(rest) => {
            let (header, payload) = rest
                .split_once(',')
                .ok_or_else(|| source_error(source, "data URI has no payload"))?;
            let mime = header
                .strip_suffix(";base64")
                .ok_or_else(|| source_error(source, "only base64 data URIs are supported"))?;
            load_from_base64(payload, mime)?
        }
        None => load_from_file(source)?,
    };

    tracing::debug!("Loaded {}x{} frame", img.width(), img.height());
    Ok(Frame::from_image(&img))
}

/// Load an ordered list of frames, failing on the first bad source.
pub fn load_frames(sources: &[String]) -> CliResult<Vec<Frame>> {
    sources.iter().map(|s| load_frame(s)).collect()
}
