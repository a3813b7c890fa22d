//! Image preprocessing: crop, resize, grayscale, contrast.
//!
//! Accepts raw image bytes (PNG, JPEG, BMP, WebP) plus a crop
//! descriptor and produces the square working-canvas target the
//! optimizer scores against. Decode failures do not fail the job: the
//! preprocessor substitutes a deterministic gradient and reports a
//! warning so a human can see that their upload was unreadable.

use image::{imageops, DynamicImage, GrayImage, RgbImage};
use log::warn;

use crate::types::CropDescriptor;

/// Linear contrast slope applied after the histogram stretch.
const CONTRAST_GAIN: f32 = 1.3;
/// Linear contrast offset applied after the histogram stretch.
const CONTRAST_BIAS: f32 = -30.0;

/// Preprocessing output: the grayscale target, the RGB target when
/// color mode needs one, and an optional human-readable warning for the
/// progress stream.
#[derive(Debug)]
pub struct PreprocessOutput {
    /// Grayscale target, `edge x edge`, 255 = white.
    pub gray: GrayImage,
    /// RGB target of the same size; `Some` only when requested.
    pub rgb: Option<RgbImage>,
    /// Set when the input bytes could not be decoded and the fallback
    /// gradient was substituted.
    pub warning: Option<String>,
}

/// Decode, crop, and resize the source image to an `edge x edge`
/// working target.
///
/// The grayscale path applies the standard luminance conversion, a
/// full-range histogram stretch, and the fixed linear contrast curve
/// `v' = clamp(1.3 v - 30)`. The color path preserves RGB and skips
/// both contrast steps.
///
/// Malformed bytes never fail the job: the output is the deterministic
/// fallback gradient and `warning` describes the decode error.
#[must_use]
pub fn preprocess(
    bytes: &[u8],
    crop: CropDescriptor,
    edge: u32,
    want_rgb: bool,
) -> PreprocessOutput {
    let decoded = if bytes.is_empty() {
        Err("input image data is empty".to_owned())
    } else {
        image::load_from_memory(bytes).map_err(|e| e.to_string())
    };

    match decoded {
        Ok(img) => {
            let cropped = apply_crop(&img, crop);
            let rgb = cropped.to_rgb8();
            let resized = imageops::resize(&rgb, edge, edge, imageops::FilterType::Triangle);
            let mut gray = luminance(&resized);
            stretch_histogram(&mut gray);
            apply_contrast(&mut gray);
            PreprocessOutput {
                gray,
                rgb: want_rgb.then_some(resized),
                warning: None,
            }
        }
        Err(message) => {
            warn!("image decode failed, using fallback gradient: {message}");
            PreprocessOutput {
                gray: fallback_gradient(edge),
                rgb: want_rgb.then(|| fallback_gradient_rgb(edge)),
                warning: Some(format!("image decode failed: {message}")),
            }
        }
    }
}

/// Compute the square inner-crop rectangle and extract it.
///
/// The crop side is `min(W, H) / scale`; its centre is panned within
/// the slack left by the zoom according to the offsets. The rectangle
/// is clamped to the image bounds, so extreme offsets slide rather than
/// read out of range.
fn apply_crop(img: &DynamicImage, crop: CropDescriptor) -> DynamicImage {
    let (w, h) = (img.width() as f64, img.height() as f64);
    let scale = crop.scale.clamp(1.0, 3.0);
    let side = (w.min(h) / scale).max(1.0);

    let center_x = w / 2.0 + crop.offset_x.clamp(-1.0, 1.0) * (w - side) / 2.0;
    let center_y = h / 2.0 + crop.offset_y.clamp(-1.0, 1.0) * (h - side) / 2.0;

    let x = (center_x - side / 2.0).clamp(0.0, w - side);
    let y = (center_y - side / 2.0).clamp(0.0, h - side);

    img.crop_imm(x as u32, y as u32, side as u32, side as u32)
}

/// Rec. 601 luminance conversion, matching `image::DynamicImage::to_luma8`.
fn luminance(rgb: &RgbImage) -> GrayImage {
    GrayImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        let p = rgb.get_pixel(x, y).0;
        let l = 0.299 * f32::from(p[0]) + 0.587 * f32::from(p[1]) + 0.114 * f32::from(p[2]);
        image::Luma([l.round().clamp(0.0, 255.0) as u8])
    })
}

/// Auto-normalize intensities to the full `[0, 255]` range.
///
/// A constant image is left untouched (stretching it would amplify
/// nothing but noise).
fn stretch_histogram(gray: &mut GrayImage) {
    let mut lo = u8::MAX;
    let mut hi = u8::MIN;
    for p in gray.pixels() {
        lo = lo.min(p.0[0]);
        hi = hi.max(p.0[0]);
    }
    if hi <= lo {
        return;
    }
    let range = f32::from(hi - lo);
    for p in gray.pixels_mut() {
        p.0[0] = ((f32::from(p.0[0] - lo) / range) * 255.0).round() as u8;
    }
}

/// Fixed linear contrast curve `v' = clamp(1.3 v - 30)`.
fn apply_contrast(gray: &mut GrayImage) {
    for p in gray.pixels_mut() {
        let v = CONTRAST_GAIN.mul_add(f32::from(p.0[0]), CONTRAST_BIAS);
        p.0[0] = v.clamp(0.0, 255.0).round() as u8;
    }
}

/// Deterministic diagonal gradient used when the input cannot be
/// decoded. Top-left dark, bottom-right light.
#[must_use]
pub fn fallback_gradient(edge: u32) -> GrayImage {
    let denom = (2 * edge.saturating_sub(1)).max(1);
    GrayImage::from_fn(edge, edge, |x, y| {
        image::Luma([(((x + y) * 255) / denom) as u8])
    })
}

/// RGB rendition of [`fallback_gradient`], identical per channel.
#[must_use]
pub fn fallback_gradient_rgb(edge: u32) -> RgbImage {
    let gray = fallback_gradient(edge);
    RgbImage::from_fn(edge, edge, |x, y| {
        let v = gray.get_pixel(x, y).0[0];
        image::Rgb([v, v, v])
    })
}
