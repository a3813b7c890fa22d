//! Result assembly: metrics, color tallies, preview rendering.
//!
//! The stored preview is produced by replaying the final connection log
//! onto a fresh white canvas at the flat `thread_opacity`, so any
//! consumer holding `(connections, pins, thread_opacity)` can reproduce
//! it byte for byte. Copying the stage-scaled working canvas would not
//! have that property.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use image::{GrayImage, RgbImage};
use siphasher::sip::SipHasher;

use crate::composite;
use crate::raster::LineCache;
use crate::state::{palette_entry, ProgressState};
use crate::types::{
    AccuracyMetrics, ColorMode, GenerationParams, GenerationResult, Pin, TargetPlanes,
    ThreadColorCount, ThreadConnection,
};

/// Whole-image MSE and SSIM between two equally sized 8-bit planes.
///
/// SSIM is computed over a single whole-image window with the standard
/// constants, matching the per-line scorer's scale.
#[must_use]
pub fn global_mse_ssim(target: &[u8], canvas: &[u8]) -> (f64, f64) {
    let n = target.len().min(canvas.len()) as f64;
    if n == 0.0 {
        return (0.0, 1.0);
    }

    let mut sum_t = 0.0_f64;
    let mut sum_c = 0.0_f64;
    let mut sum_tt = 0.0_f64;
    let mut sum_cc = 0.0_f64;
    let mut sum_tc = 0.0_f64;
    let mut sq_err = 0.0_f64;
    for (&t, &c) in target.iter().zip(canvas) {
        let (t, c) = (f64::from(t), f64::from(c));
        sum_t += t;
        sum_c += c;
        sum_tt += t * t;
        sum_cc += c * c;
        sum_tc += t * c;
        sq_err += (t - c) * (t - c);
    }

    let mse = sq_err / n;
    let mean_t = sum_t / n;
    let mean_c = sum_c / n;
    let var_t = (sum_tt / n - mean_t * mean_t).max(0.0);
    let var_c = (sum_cc / n - mean_c * mean_c).max(0.0);
    let cov = sum_tc / n - mean_t * mean_c;

    let ssim = ((2.0 * mean_t * mean_c + crate::score::SSIM_C1)
        * (2.0 * cov + crate::score::SSIM_C2))
        / ((mean_t * mean_t + mean_c * mean_c + crate::score::SSIM_C1)
            * (var_t + var_c + crate::score::SSIM_C2));

    (mse, ssim)
}

/// The similarity percentage combining MSE and SSIM.
#[must_use]
pub fn similarity_pct(mse: f64, ssim: f64) -> f64 {
    (0.6 * (1.0 - mse / 65025.0) * 100.0 + 0.4 * ssim * 100.0).clamp(0.0, 100.0)
}

/// Interim accuracy of the working canvas, used for stage-end progress
/// snapshots. Color canvases are measured on their luminance.
#[must_use]
pub fn canvas_metrics(state: &ProgressState) -> AccuracyMetrics {
    let (mse, ssim) = match state.progress_rgb.as_ref() {
        Some(rgb) => {
            let luma = rgb_luma(rgb);
            global_mse_ssim(state.target_gray.as_raw(), &luma)
        }
        None => global_mse_ssim(state.target_gray.as_raw(), state.progress_gray.as_raw()),
    };
    AccuracyMetrics {
        mse,
        ssim,
        similarity_pct: similarity_pct(mse, ssim),
    }
}

fn rgb_luma(rgb: &RgbImage) -> Vec<u8> {
    rgb.pixels()
        .map(|p| {
            let l = 0.299 * f32::from(p.0[0]) + 0.587 * f32::from(p.0[1])
                + 0.114 * f32::from(p.0[2]);
            l.round().clamp(0.0, 255.0) as u8
        })
        .collect()
}

/// PNG-encode the current working canvas (gray or RGB).
#[must_use]
pub fn encode_canvas_png(state: &ProgressState) -> Vec<u8> {
    match state.progress_rgb.as_ref() {
        Some(rgb) => encode_png(rgb.as_raw(), state.edge, image::ExtendedColorType::Rgb8),
        None => encode_png(
            state.progress_gray.as_raw(),
            state.edge,
            image::ExtendedColorType::L8,
        ),
    }
}

fn encode_png(raw: &[u8], edge: u32, color: image::ExtendedColorType) -> Vec<u8> {
    let mut buf = Vec::new();
    let encoder = image::codecs::png::PngEncoder::new(&mut buf);
    // Encoding an in-memory buffer of known-good dimensions cannot
    // fail; an empty preview is the harmless degraded outcome.
    if image::ImageEncoder::write_image(encoder, raw, edge, edge, color).is_err() {
        buf.clear();
    }
    buf
}

/// Replay a connection log onto a fresh white canvas with each
/// connection's stored color at the flat `alpha`.
///
/// This is the preview contract: the stored preview must be
/// byte-reproducible from `(connections, pins, thread_opacity)` alone.
#[must_use]
pub fn replay_preview(
    pins: &[Pin],
    connections: &[ThreadConnection],
    edge: u32,
    width_px: u32,
    alpha: f32,
    mode: ColorMode,
) -> Vec<u8> {
    let n = (edge * edge) as usize;
    let mut density = vec![0.0_f32; n];
    let mut overdraw = vec![0_u16; n];
    let mut cache = LineCache::new();

    match mode {
        ColorMode::Monochrome => {
            let mut canvas = vec![255_u8; n];
            for c in connections {
                let pa = pins[c.from_pin as usize];
                let pb = pins[c.to_pin as usize];
                let px = cache.get_or_rasterize(&pa, &pb, width_px, edge, edge);
                composite::forward_mono(&mut canvas, &mut density, &mut overdraw, &px, alpha);
            }
            canvas
        }
        ColorMode::Color => {
            let mut canvas = vec![255_u8; n * 3];
            for c in connections {
                let pa = pins[c.from_pin as usize];
                let pb = pins[c.to_pin as usize];
                let px = cache.get_or_rasterize(&pa, &pb, width_px, edge, edge);
                let color = palette_entry(&c.color_hex);
                composite::forward_rgb(
                    &mut canvas,
                    &mut density,
                    &mut overdraw,
                    &px,
                    composite::thread_linear(color.rgb),
                    alpha,
                );
            }
            canvas
        }
    }
}

/// Tally connections per color, with integer percentages that sum to
/// exactly 100 (largest-count entry absorbs the rounding remainder).
#[must_use]
pub fn thread_color_counts(connections: &[ThreadConnection]) -> Vec<ThreadColorCount> {
    let mut counts: Vec<ThreadColorCount> = Vec::new();
    for c in connections {
        match counts.iter_mut().find(|t| t.color_hex == c.color_hex) {
            Some(t) => t.count += 1,
            None => counts.push(ThreadColorCount {
                color_hex: c.color_hex.clone(),
                color_name: c.color_name.clone(),
                count: 1,
                percentage: 0,
            }),
        }
    }
    if connections.is_empty() {
        return counts;
    }

    let total = connections.len() as f64;
    for t in &mut counts {
        t.percentage = (f64::from(t.count) / total * 100.0).round() as u32;
    }
    let sum: i64 = counts.iter().map(|t| i64::from(t.percentage)).sum();
    if sum != 100 {
        if let Some(largest) = counts.iter_mut().max_by_key(|t| t.count) {
            largest.percentage = (i64::from(largest.percentage) + (100 - sum)).max(0) as u32;
        }
    }
    counts
}

/// Assemble the final [`GenerationResult`] from a finished state.
#[must_use]
pub fn assemble(state: &ProgressState, params: &GenerationParams) -> GenerationResult {
    let edge = state.edge;
    let alpha = params.thread_opacity as f32;
    let raw = replay_preview(
        &state.pins,
        &state.connections,
        edge,
        state.width_px,
        alpha,
        params.color_mode,
    );

    let (preview_png, mse, ssim) = match params.color_mode {
        ColorMode::Monochrome => {
            let (mse, ssim) = global_mse_ssim(state.target_gray.as_raw(), &raw);
            (encode_png(&raw, edge, image::ExtendedColorType::L8), mse, ssim)
        }
        ColorMode::Color => {
            let luma: Vec<u8> = raw
                .chunks_exact(3)
                .map(|p| {
                    let l = 0.299 * f32::from(p[0]) + 0.587 * f32::from(p[1])
                        + 0.114 * f32::from(p[2]);
                    l.round().clamp(0.0, 255.0) as u8
                })
                .collect();
            let (mse, ssim) = global_mse_ssim(state.target_gray.as_raw(), &luma);
            (encode_png(&raw, edge, image::ExtendedColorType::Rgb8), mse, ssim)
        }
    };

    let created_at = Utc::now().to_rfc3339();
    let target = Some(TargetPlanes {
        edge,
        gray: state.target_gray.as_raw().clone(),
        rgb: state.target_rgb.as_ref().map(|t| t.as_raw().clone()),
    });

    GenerationResult {
        id: result_id(&created_at, state.connections.len(), params),
        created_at,
        pins: state.pins.clone(),
        total_threads: state.connections.len() as u32,
        connections: state.connections.clone(),
        params: params.clone(),
        preview_base64: BASE64.encode(&preview_png),
        thread_colors: thread_color_counts(&state.connections),
        accuracy: AccuracyMetrics {
            mse,
            ssim,
            similarity_pct: similarity_pct(mse, ssim),
        },
        target,
    }
}

/// Deterministic opaque result id: SipHash-2-4 over the creation time,
/// connection count, and serialized params.
fn result_id(created_at: &str, connections: usize, params: &GenerationParams) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = SipHasher::new();
    created_at.hash(&mut hasher);
    connections.hash(&mut hasher);
    serde_json::to_string(params).unwrap_or_default().hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Reconstruct the target images persisted inside a result.
#[must_use]
pub fn restore_target(planes: &TargetPlanes) -> Option<(GrayImage, Option<RgbImage>)> {
    let gray = GrayImage::from_raw(planes.edge, planes.edge, planes.gray.clone())?;
    let rgb = match planes.rgb.as_ref() {
        Some(raw) => Some(RgbImage::from_raw(planes.edge, planes.edge, raw.clone())?),
        None => None,
    };
    Some((gray, rgb))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::color::{BLACK, PALETTE};

    fn conn(from: u32, to: u32, color: &crate::color::ThreadColor) -> ThreadConnection {
        ThreadConnection {
            from_pin: from,
            to_pin: to,
            color_hex: color.hex.to_owned(),
            color_name: color.name.to_owned(),
        }
    }

    #[test]
    fn identical_planes_have_zero_mse_and_unit_ssim() {
        let plane = vec![77_u8; 64];
        let (mse, ssim) = global_mse_ssim(&plane, &plane);
        assert!(mse.abs() < f64::EPSILON);
        assert!((ssim - 1.0).abs() < 1e-9);
    }

    #[test]
    fn opposite_planes_have_maximal_mse() {
        let black = vec![0_u8; 64];
        let white = vec![255_u8; 64];
        let (mse, ssim) = global_mse_ssim(&black, &white);
        assert!((mse - 65025.0).abs() < f64::EPSILON);
        assert!(ssim < 0.1, "SSIM of inverted flats should be tiny, got {ssim}");
    }

    #[test]
    fn similarity_pct_is_clamped() {
        assert!((similarity_pct(0.0, 1.0) - 100.0).abs() < f64::EPSILON);
        assert!(similarity_pct(65025.0, -1.0).abs() < f64::EPSILON);
        let mid = similarity_pct(10_000.0, 0.5);
        assert!(mid > 0.0 && mid < 100.0);
    }

    #[test]
    fn replay_is_deterministic() {
        let pins = crate::pins::place_pins(crate::types::FrameType::Circular, 12, 64, 64, None);
        let connections = vec![conn(0, 5, &BLACK), conn(5, 9, &BLACK), conn(9, 2, &BLACK)];
        let a = replay_preview(&pins, &connections, 64, 1, 0.12, ColorMode::Monochrome);
        let b = replay_preview(&pins, &connections, 64, 1, 0.12, ColorMode::Monochrome);
        assert_eq!(a, b);
        assert!(a.iter().any(|&v| v < 255), "threads must darken the replay");
    }

    #[test]
    fn color_counts_partition_the_log() {
        let connections = vec![
            conn(0, 5, &PALETTE[0]),
            conn(5, 9, &PALETTE[1]),
            conn(9, 2, &PALETTE[1]),
            conn(2, 7, &PALETTE[3]),
        ];
        let counts = thread_color_counts(&connections);
        let total: u32 = counts.iter().map(|t| t.count).sum();
        assert_eq!(total, 4);
        let pct: u32 = counts.iter().map(|t| t.percentage).sum();
        assert_eq!(pct, 100);
        assert_eq!(counts.len(), 3);
    }

    #[test]
    fn color_counts_handle_empty_log() {
        assert!(thread_color_counts(&[]).is_empty());
    }

    #[test]
    fn percentages_absorb_rounding_drift() {
        // Three equal thirds round to 33 each; the largest entry
        // absorbs the missing 1.
        let connections = vec![
            conn(0, 5, &PALETTE[0]),
            conn(5, 9, &PALETTE[1]),
            conn(9, 2, &PALETTE[2]),
        ];
        let counts = thread_color_counts(&connections);
        let pct: u32 = counts.iter().map(|t| t.percentage).sum();
        assert_eq!(pct, 100);
    }

    #[test]
    fn restore_target_round_trips() {
        let planes = TargetPlanes {
            edge: 4,
            gray: (0..16).map(|v| v as u8).collect(),
            rgb: Some((0..48).map(|v| v as u8).collect()),
        };
        let (gray, rgb) = restore_target(&planes).unwrap();
        assert_eq!(gray.as_raw(), &planes.gray);
        assert_eq!(rgb.unwrap().as_raw(), planes.rgb.as_ref().unwrap());
    }

    #[test]
    fn restore_target_rejects_malformed_planes() {
        let planes = TargetPlanes {
            edge: 4,
            gray: vec![0; 3],
            rgb: None,
        };
        assert!(restore_target(&planes).is_none());
    }
}
