//! Upload validation and pre-processing helpers.
//!
//! Uploaded bytes must actually decode as an image in an allowed format
//! before a job is created; the advisory client filename is sanitized into
//! a storage name. Oversized inputs are downscaled in memory only — the
//! stored original is never rewritten.

use std::io::Cursor;

use anyhow::{bail, Context, Result};
use image::{imageops::FilterType, ImageFormat};

/// Extension of a filename, lowercased, without the dot.
pub fn file_extension(filename: &str) -> Option<String> {
    let (_, ext) = filename.rsplit_once('.')?;
    if ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

pub fn extension_allowed(filename: &str, allowed: &[String]) -> bool {
    match file_extension(filename) {
        Some(ext) => allowed.iter().any(|allowed_ext| *allowed_ext == ext),
        None => false,
    }
}

/// Reduce a client-supplied filename to a safe storage name: the stem keeps
/// alphanumerics, `-` and `_`; the extension is lowercased. Degenerate names
/// become `unnamed.png`.
pub fn sanitize_filename(filename: &str) -> String {
    match filename.rsplit_once('.') {
        Some((stem, ext)) if !ext.is_empty() => {
            let clean_stem: String = stem
                .chars()
                .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
                .collect();
            let clean_stem = if clean_stem.is_empty() {
                "unnamed".to_string()
            } else {
                clean_stem
            };
            format!("{clean_stem}.{}", ext.to_ascii_lowercase())
        }
        _ => "unnamed.png".to_string(),
    }
}

/// Validate that the bytes decode as an image in one of the allowed formats.
/// Returns the detected format.
pub fn validate_image_bytes(bytes: &[u8], allowed: &[String]) -> Result<ImageFormat> {
    let format = image::guess_format(bytes).context("cannot identify image data")?;

    let format_allowed = allowed
        .iter()
        .any(|ext| format.extensions_str().contains(&ext.as_str()));
    if !format_allowed {
        bail!("unsupported image format: {format:?}");
    }

    image::load_from_memory_with_format(bytes, format)
        .with_context(|| format!("failed to decode {format:?} image"))?;

    Ok(format)
}

/// Downscale an image whose longest side exceeds `max_dimension`, returning
/// re-encoded PNG bytes. Returns `None` when no resize is needed (including
/// `max_dimension == 0`, which disables downscaling).
pub fn downscale_for_processing(bytes: &[u8], max_dimension: u32) -> Result<Option<Vec<u8>>> {
    if max_dimension == 0 {
        return Ok(None);
    }

    let img = image::load_from_memory(bytes).context("failed to decode image for downscaling")?;
    if img.width() <= max_dimension && img.height() <= max_dimension {
        return Ok(None);
    }

    let resized = img.resize(max_dimension, max_dimension, FilterType::Triangle);
    let mut out = Vec::new();
    resized
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .context("failed to re-encode downscaled image")?;

    Ok(Some(out))
}
