//! Background removal behind a trait seam.
//!
//! Handlers treat the remover as opaque: raw image bytes in, RGBA PNG bytes
//! out, any error is an opaque processing failure. The production
//! implementation runs a pretrained salient-object matting model (u2net
//! family) through `ort::Session`: normalize to a 1×3×320×320 tensor, run
//! the session, min-max the predicted matte, resize it back to the source
//! dimensions and apply it as the alpha channel.

use std::io::Cursor;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{ensure, Context, Result};
use image::{imageops::FilterType, DynamicImage, GrayImage, RgbaImage};
use ndarray::Array4;
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::Tensor,
};
use tracing::debug;

const MODEL_INPUT_SIZE: u32 = 320;
const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

pub trait BackgroundRemover: Send + Sync {
    /// Raw image bytes in, PNG bytes (with alpha) out.
    fn remove(&self, image_bytes: &[u8]) -> Result<Vec<u8>>;
}

pub struct OrtRemover {
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
}

impl OrtRemover {
    pub fn load(model_path: &Path) -> Result<Self> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .commit_from_file(model_path)
            .with_context(|| format!("Failed to load ONNX model: {}", model_path.display()))?;

        let input_name = session.inputs()[0].name().to_string();
        let output_name = session.outputs()[0].name().to_string();

        debug!(
            model = %model_path.display(),
            %input_name, %output_name,
            "Loaded background matting model"
        );

        Ok(Self {
            session: Mutex::new(session),
            input_name,
            output_name,
        })
    }
}

impl BackgroundRemover for OrtRemover {
    fn remove(&self, image_bytes: &[u8]) -> Result<Vec<u8>> {
        let img = image::load_from_memory(image_bytes).context("failed to decode input image")?;
        let input = preprocess(&img);

        let matte_flat: Vec<f32> = {
            let mut session = self.session.lock().unwrap();
            let input_tensor = Tensor::from_array(input)?;
            let outputs = session.run(ort::inputs![self.input_name.as_str() => &input_tensor])?;
            let matte_view = outputs[self.output_name.as_str()].try_extract_array::<f32>()?;
            matte_view.iter().copied().collect()
        };

        let side = MODEL_INPUT_SIZE as usize;
        ensure!(
            matte_flat.len() == side * side,
            "unexpected matte shape from model: {} values",
            matte_flat.len()
        );

        let matte = matte_to_gray(&matte_flat, MODEL_INPUT_SIZE);
        let rgba = apply_alpha_matte(&img, &matte);
        encode_png(&rgba)
    }
}

/// Resize to the model input size and normalize with ImageNet statistics,
/// NCHW layout.
fn preprocess(img: &DynamicImage) -> Array4<f32> {
    let resized = img
        .resize_exact(MODEL_INPUT_SIZE, MODEL_INPUT_SIZE, FilterType::Triangle)
        .to_rgb8();

    let side = MODEL_INPUT_SIZE as usize;
    let mut input = Array4::<f32>::zeros((1, 3, side, side));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for channel in 0..3 {
            input[[0, channel, y as usize, x as usize]] =
                (pixel[channel] as f32 / 255.0 - MEAN[channel]) / STD[channel];
        }
    }
    input
}

/// Min-max normalize the raw matte and quantize to an 8-bit gray image.
/// A flat matte (no dynamic range) maps to fully opaque.
fn matte_to_gray(matte: &[f32], side: u32) -> GrayImage {
    let min = matte.iter().copied().fold(f32::INFINITY, f32::min);
    let max = matte.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let range = max - min;

    let pixels: Vec<u8> = if range <= f32::EPSILON {
        vec![u8::MAX; matte.len()]
    } else {
        matte
            .iter()
            .map(|v| (((v - min) / range) * 255.0).round() as u8)
            .collect()
    };

    GrayImage::from_raw(side, side, pixels).expect("matte buffer matches dimensions")
}

/// Resize the matte to the source dimensions and install it as the alpha
/// channel.
fn apply_alpha_matte(original: &DynamicImage, matte: &GrayImage) -> RgbaImage {
    let resized_matte = image::imageops::resize(
        matte,
        original.width(),
        original.height(),
        FilterType::Triangle,
    );

    let mut out = original.to_rgba8();
    for (pixel, alpha) in out.pixels_mut().zip(resized_matte.pixels()) {
        pixel[3] = alpha[0];
    }
    out
}

fn encode_png(rgba: &RgbaImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    DynamicImage::ImageRgba8(rgba.clone())
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .context("failed to encode processed image")?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn preprocess_produces_normalized_nchw_tensor() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            4,
            4,
            Rgba([255, 255, 255, 255]),
        ));
        let tensor = preprocess(&img);

        let side = MODEL_INPUT_SIZE as usize;
        assert_eq!(tensor.shape(), &[1, 3, side, side]);

        // White resizes to white; channel 0 normalizes to (1 - mean) / std.
        let expected = (1.0 - MEAN[0]) / STD[0];
        assert!((tensor[[0, 0, 0, 0]] - expected).abs() < 1e-4);
    }

    #[test]
    fn matte_normalization_spans_full_range() {
        let matte = vec![0.2, 0.4, 0.6, 0.8];
        let gray = matte_to_gray(&matte, 2);

        let values: Vec<u8> = gray.pixels().map(|p| p[0]).collect();
        assert_eq!(values[0], 0);
        assert_eq!(values[3], 255);
        assert!(values[1] > values[0] && values[1] < values[2]);
    }

    #[test]
    fn flat_matte_maps_to_opaque() {
        let matte = vec![0.5; 4];
        let gray = matte_to_gray(&matte, 2);
        assert!(gray.pixels().all(|p| p[0] == u8::MAX));
    }

    #[test]
    fn alpha_matte_replaces_alpha_channel_only() {
        let original =
            DynamicImage::ImageRgba8(RgbaImage::from_pixel(2, 2, Rgba([10, 20, 30, 255])));
        let matte = GrayImage::from_raw(2, 2, vec![0, 85, 170, 255]).expect("matte");

        let out = apply_alpha_matte(&original, &matte);

        let alphas: Vec<u8> = out.pixels().map(|p| p[3]).collect();
        assert_eq!(alphas, vec![0, 85, 170, 255]);
        assert!(out.pixels().all(|p| p[0] == 10 && p[1] == 20 && p[2] == 30));
    }

    #[test]
    fn encode_png_roundtrips() {
        let rgba = RgbaImage::from_pixel(3, 3, Rgba([1, 2, 3, 128]));
        let bytes = encode_png(&rgba).expect("encode");

        let decoded = image::load_from_memory(&bytes).expect("decode");
        assert_eq!(decoded.width(), 3);
        assert_eq!(decoded.height(), 3);
        assert_eq!(decoded.to_rgba8().get_pixel(0, 0)[3], 128);
    }
}
