//! Perceptual and multi-resolution candidate scoring.
//!
//! The perceptual score simulates one thread's composite along its
//! pixel run and measures how much the run moves toward the target:
//! local SSIM and MSE improvement, an edge bonus, and smoothness and
//! overdraw penalties, combined with fixed weights. The
//! multi-resolution wrapper adds cheap structure estimates from the
//! pyramid mirrors and rejects clearly structure-destroying lines
//! before the full score is consulted.
//!
//! Scoring is read-only against shared state, which is what lets the
//! driver fan candidates out across a worker pool.

use crate::composite::simulate_mono;
use crate::edges::EdgePlanes;
use crate::faces::{RegionMask, FACE_BONUS_OVERLAP};
use crate::pyramid::{Mirror, Pyramid};
use crate::types::Pin;

/// SSIM stabilization constant `(0.01 * 255)^2`.
pub const SSIM_C1: f64 = 6.5025;
/// SSIM stabilization constant `(0.03 * 255)^2`.
pub const SSIM_C2: f64 = 58.5225;

/// Sentinel for lines that must never be selected.
pub const REJECT: f64 = -1.0e9;

/// Low-resolution MSE floor below which a line is rejected outright.
const LOW_RES_REJECT_THRESHOLD: f64 = -10.0;

/// Combination weights for the perceptual score.
const W_SSIM: f64 = 0.40;
const W_MSE: f64 = 0.25;
const W_EDGE: f64 = 0.20;
const W_SMOOTH: f64 = 0.10;
const W_OVERDRAW: f64 = 0.05;

/// Combination weights for the multi-resolution score.
const W_LOW: f64 = 0.2;
const W_MID: f64 = 0.3;
const W_FULL: f64 = 0.5;

/// Read-only planes and flags the scorers consult.
pub struct ScoreContext<'a> {
    /// Raw grayscale target bytes.
    pub target: &'a [u8],
    /// Raw grayscale progress bytes.
    pub current: &'a [u8],
    /// Density plane.
    pub density: &'a [f32],
    /// Overdraw counters.
    pub overdraw: &'a [u16],
    /// Edge planes.
    pub edges: &'a EdgePlanes,
    /// Region masks and policies.
    pub regions: &'a RegionMask,
    /// Pyramid mirrors.
    pub pyramid: &'a Pyramid,
    /// Pin layout.
    pub pins: &'a [Pin],
    /// Per-pin usage counts.
    pub pin_usage: &'a [u32],
    /// Canvas edge length.
    pub canvas_edge: u32,
    /// Whether edge terms participate.
    pub use_edges: bool,
    /// Whether the pin-fatigue multiplier participates.
    pub use_fatigue: bool,
}

/// Mean edge-tangent alignment between the target's edges and the line
/// direction, sampled at five evenly spaced points.
///
/// At each sample the edge-tangent unit vector is projected onto the
/// line direction and weighted by the local edge magnitude, so the
/// bonus favors threads that run *along* image structure rather than
/// across it.
#[must_use]
pub fn edge_alignment(edges: &EdgePlanes, from: &Pin, to: &Pin) -> f64 {
    let dx = f64::from(to.x) - f64::from(from.x);
    let dy = f64::from(to.y) - f64::from(from.y);
    let len = dx.hypot(dy);
    if len == 0.0 {
        return 0.0;
    }
    let (ux, uy) = (dx / len, dy / len);

    let mut sum = 0.0;
    for s in 0..5 {
        let t = (f64::from(s) + 0.5) / 5.0;
        let x = (f64::from(from.x) + t * dx).round() as u32;
        let y = (f64::from(from.y) + t * dy).round() as u32;
        if x >= edges.width || y >= edges.height {
            continue;
        }
        let i = (y * edges.width + x) as usize;
        let weight = f64::from(edges.magnitude[i]) / 255.0;
        let proj = f64::from(edges.tangent_x[i]) * ux + f64::from(edges.tangent_y[i]) * uy;
        sum += proj.abs() * weight;
    }
    sum / 5.0
}

/// Score one monochrome candidate line at full resolution.
///
/// Returns [`REJECT`] for an empty pixel run (coincident pins).
#[must_use]
pub fn perceptual_line_score(
    ctx: &ScoreContext<'_>,
    pixels: &[usize],
    from: u32,
    to: u32,
    alpha: f32,
) -> f64 {
    if pixels.is_empty() {
        return REJECT;
    }
    let n = pixels.len() as f64;

    // Single pass: simulate the composite and gather every raw sum the
    // terms need.
    let mut mse_gain = 0.0_f64;
    let mut edge_sum = 0.0_f64;
    let mut smooth_sum = 0.0_f64;
    let mut overdraw_sum = 0.0_f64;
    let mut face_pixels = 0_u32;
    let mut face_density_sum = 0.0_f64;

    // SSIM accumulators over (target, current) and (target, new).
    let mut sum_t = 0.0_f64;
    let mut sum_c = 0.0_f64;
    let mut sum_n = 0.0_f64;
    let mut sum_tt = 0.0_f64;
    let mut sum_cc = 0.0_f64;
    let mut sum_nn = 0.0_f64;
    let mut sum_tc = 0.0_f64;
    let mut sum_tn = 0.0_f64;

    let mut prev_new: Option<f64> = None;
    for &i in pixels {
        let t = f64::from(ctx.target[i]);
        let c = f64::from(ctx.current[i]);
        let new = f64::from(simulate_mono(ctx.current[i], alpha));

        mse_gain += (t - c) * (t - c) - (t - new) * (t - new);

        sum_t += t;
        sum_c += c;
        sum_n += new;
        sum_tt += t * t;
        sum_cc += c * c;
        sum_nn += new * new;
        sum_tc += t * c;
        sum_tn += t * new;

        edge_sum += f64::from(ctx.edges.magnitude[i]) / 255.0;

        if let Some(p) = prev_new {
            smooth_sum += (new - p).abs() / 255.0;
        }
        prev_new = Some(new);

        overdraw_sum += ((255.0 - c) / 255.0 - 0.5).max(0.0) * 2.0
            + f64::from(ctx.overdraw[i]) * 0.1;
        if ctx.density[i] > ctx.regions.overdraw_threshold(i) {
            overdraw_sum += 2.0;
        }

        if ctx.regions.face[i] {
            face_pixels += 1;
            face_density_sum += f64::from(ctx.density[i]);
        }
    }

    let ssim_before = ssim_from_sums(n, sum_t, sum_c, sum_tt, sum_cc, sum_tc);
    let ssim_after = ssim_from_sums(n, sum_t, sum_n, sum_tt, sum_nn, sum_tn);
    let ssim_term = (ssim_after - ssim_before) * 1000.0 / n;

    let mse_term = mse_gain / n;
    let edge_term = if ctx.use_edges {
        let (pa, pb) = (&ctx.pins[from as usize], &ctx.pins[to as usize]);
        edge_sum / n + edge_alignment(ctx.edges, pa, pb) * 5.0
    } else {
        0.0
    };
    let smooth_term = smooth_sum / n;
    let overdraw_term = overdraw_sum / n;

    let mut score = W_SSIM * ssim_term + W_MSE * mse_term + W_EDGE * edge_term
        - W_SMOOTH * smooth_term
        - W_OVERDRAW * overdraw_term;

    // Length preference: reward mid-length threads, discourage very
    // long ones.
    let length_ratio = n / (0.3 * f64::from(ctx.canvas_edge));
    if (0.2..1.2).contains(&length_ratio) {
        score *= 1.15;
    } else if length_ratio >= 1.5 {
        score *= 0.85;
    }

    if ctx.use_fatigue {
        let total = ctx.pin_usage[from as usize] + ctx.pin_usage[to as usize];
        let excess = f64::from(total.saturating_sub(50));
        score /= 1.005_f64.powf(excess);
    }

    // Face priority.
    let overlap = f64::from(face_pixels) / n;
    if overlap >= FACE_BONUS_OVERLAP {
        score += edge_term * overlap * 2.0;
    }
    if face_pixels > 0 && face_density_sum / f64::from(face_pixels) > 0.85 {
        score *= 0.3;
    }

    score
}

/// SSIM of two pixel populations from their raw sums.
fn ssim_from_sums(n: f64, sum_x: f64, sum_y: f64, sum_xx: f64, sum_yy: f64, sum_xy: f64) -> f64 {
    let mean_x = sum_x / n;
    let mean_y = sum_y / n;
    let var_x = (sum_xx / n - mean_x * mean_x).max(0.0);
    let var_y = (sum_yy / n - mean_y * mean_y).max(0.0);
    let cov = sum_xy / n - mean_x * mean_y;

    ((2.0 * mean_x * mean_y + SSIM_C1) * (2.0 * cov + SSIM_C2))
        / ((mean_x * mean_x + mean_y * mean_y + SSIM_C1) * (var_x + var_y + SSIM_C2))
}

/// Cheap structure estimate on one mirror: walk the scaled line and
/// accumulate the MSE improvement of the simulated blend, in 0–255
/// linear scale, normalized per sample.
///
/// The per-sample normalization keeps the rejection sentinel in
/// [`multires_line_score`] length- and mirror-resolution-invariant:
/// the threshold reads as "every sampled pixel worsens squared error
/// by this much", regardless of how long the candidate line is.
fn mirror_mse_score(
    target: &Mirror,
    progress: &Mirror,
    from: &Pin,
    to: &Pin,
    alpha: f32,
) -> f64 {
    let f = target.factor;
    let scale = |v: u16| u32::from(v) / f;
    let (x0, y0) = (scale(from.x).min(target.width - 1), scale(from.y).min(target.height - 1));
    let (x1, y1) = (scale(to.x).min(target.width - 1), scale(to.y).min(target.height - 1));

    let steps = x0.abs_diff(x1).max(y0.abs_diff(y1)).max(1);
    let mut sum = 0.0_f64;
    for s in 0..=steps {
        let t = f64::from(s) / f64::from(steps);
        let x = (f64::from(x0) + t * (f64::from(x1) - f64::from(x0))).round() as u32;
        let y = (f64::from(y0) + t * (f64::from(y1) - f64::from(y0))).round() as u32;
        let i = (y * target.width + x) as usize;
        let tv = f64::from(target.data[i]) * 255.0;
        let cv = f64::from(progress.data[i]) * 255.0;
        let nv = cv * f64::from(1.0 - alpha);
        sum += (tv - cv) * (tv - cv) - (tv - nv) * (tv - nv);
    }
    sum / f64::from(steps + 1)
}

/// Full multi-resolution score: `0.2 low + 0.3 mid + 0.5 perceptual`.
///
/// The low-resolution estimate acts as a gate: a line that clearly
/// destroys coarse structure is rejected before the mid and full
/// scores are computed.
#[must_use]
pub fn multires_line_score(
    ctx: &ScoreContext<'_>,
    pixels: &[usize],
    from: u32,
    to: u32,
    alpha: f32,
) -> f64 {
    if pixels.is_empty() {
        return REJECT;
    }
    let (pa, pb) = (&ctx.pins[from as usize], &ctx.pins[to as usize]);

    let low = mirror_mse_score(
        &ctx.pyramid.low_target,
        &ctx.pyramid.low_progress,
        pa,
        pb,
        alpha,
    );
    if low < LOW_RES_REJECT_THRESHOLD {
        return REJECT;
    }

    let mid = mirror_mse_score(
        &ctx.pyramid.mid_target,
        &ctx.pyramid.mid_progress,
        pa,
        pb,
        alpha,
    );
    let full = perceptual_line_score(ctx, pixels, from, to, alpha);

    W_LOW * low + W_MID * mid + W_FULL * full
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::edges::detect_edges;
    use crate::pins::place_pins;
    use crate::pyramid::Pyramid;
    use crate::raster::line_pixels;
    use crate::types::{FrameType, GrayImage, QualityPreset};

    struct Fixture {
        target: GrayImage,
        current: Vec<u8>,
        density: Vec<f32>,
        overdraw: Vec<u16>,
        edges: EdgePlanes,
        regions: RegionMask,
        pyramid: Pyramid,
        pins: Vec<Pin>,
        pin_usage: Vec<u32>,
    }

    impl Fixture {
        fn new(target: GrayImage) -> Self {
            let edge = target.width();
            let n = (edge * edge) as usize;
            let edges = detect_edges(&target);
            let pyramid = Pyramid::new(&target);
            let pins = place_pins(FrameType::Circular, 24, edge, edge, None);
            Self {
                current: vec![255; n],
                density: vec![0.0; n],
                overdraw: vec![0; n],
                edges,
                regions: RegionMask::none(edge, edge, QualityPreset::Balanced, 2),
                pyramid,
                pins: pins.clone(),
                pin_usage: vec![0; pins.len()],
                target,
            }
        }

        fn ctx(&self) -> ScoreContext<'_> {
            ScoreContext {
                target: self.target.as_raw(),
                current: &self.current,
                density: &self.density,
                overdraw: &self.overdraw,
                edges: &self.edges,
                regions: &self.regions,
                pyramid: &self.pyramid,
                pins: &self.pins,
                pin_usage: &self.pin_usage,
                canvas_edge: self.target.width(),
                use_edges: true,
                use_fatigue: false,
            }
        }

        fn line(&self, a: usize, b: usize) -> Vec<usize> {
            let (pa, pb) = (self.pins[a], self.pins[b]);
            line_pixels(
                (pa.x, pa.y),
                (pb.x, pb.y),
                1,
                self.target.width(),
                self.target.height(),
            )
        }
    }

    #[test]
    fn empty_run_is_rejected() {
        let fx = Fixture::new(GrayImage::from_pixel(64, 64, image::Luma([128])));
        assert!(perceptual_line_score(&fx.ctx(), &[], 0, 1, 0.12) <= REJECT);
        assert!(multires_line_score(&fx.ctx(), &[], 0, 1, 0.12) <= REJECT);
    }

    #[test]
    fn dark_target_rewards_threads_more_than_white_target() {
        // On a white canvas, darkening toward a black target is an
        // improvement; darkening a region that should stay white is
        // not.
        let dark = Fixture::new(GrayImage::from_pixel(64, 64, image::Luma([0])));
        let white = Fixture::new(GrayImage::from_pixel(64, 64, image::Luma([255])));
        let px_dark = dark.line(0, 12);
        let px_white = white.line(0, 12);
        let s_dark = perceptual_line_score(&dark.ctx(), &px_dark, 0, 12, 0.2);
        let s_white = perceptual_line_score(&white.ctx(), &px_white, 0, 12, 0.2);
        assert!(
            s_dark > s_white,
            "dark target should reward threads ({s_dark} vs {s_white})",
        );
    }

    #[test]
    fn second_pass_over_saturated_region_scores_lower() {
        let mut fx = Fixture::new(GrayImage::from_pixel(64, 64, image::Luma([0])));
        let px = fx.line(0, 12);
        let fresh = perceptual_line_score(&fx.ctx(), &px, 0, 12, 0.2);

        // Saturate the run: dark canvas, high density, high overdraw.
        for &i in &px {
            fx.current[i] = 5;
            fx.density[i] = 0.95;
            fx.overdraw[i] = 30;
        }
        let tired = perceptual_line_score(&fx.ctx(), &px, 0, 12, 0.2);
        assert!(
            tired < fresh,
            "overdrawn run must score lower ({tired} vs {fresh})",
        );
    }

    #[test]
    fn fatigue_multiplier_penalizes_hot_pins() {
        let mut fx = Fixture::new(GrayImage::from_pixel(64, 64, image::Luma([0])));
        let px = fx.line(0, 12);
        let mut ctx = fx.ctx();
        ctx.use_fatigue = true;
        let fresh = perceptual_line_score(&ctx, &px, 0, 12, 0.2);

        fx.pin_usage[0] = 80;
        fx.pin_usage[12] = 80;
        let mut ctx = fx.ctx();
        ctx.use_fatigue = true;
        let hot = perceptual_line_score(&ctx, &px, 0, 12, 0.2);
        assert!(hot < fresh, "fatigue must bite ({hot} vs {fresh})");
        assert!(hot > 0.0, "fatigue scales, it does not negate");
    }

    #[test]
    fn edge_alignment_prefers_lines_along_structure() {
        // Vertical stripe: vertical tangents. A vertical line through
        // the stripe aligns; a horizontal line crosses it.
        let target = GrayImage::from_fn(64, 64, |x, _| {
            if (28..36).contains(&x) {
                image::Luma([0])
            } else {
                image::Luma([255])
            }
        });
        let edges = detect_edges(&target);
        let vertical = edge_alignment(
            &edges,
            &Pin { index: 0, x: 29, y: 4 },
            &Pin { index: 1, x: 29, y: 60 },
        );
        let horizontal = edge_alignment(
            &edges,
            &Pin { index: 0, x: 4, y: 32 },
            &Pin { index: 1, x: 60, y: 32 },
        );
        assert!(
            vertical > horizontal,
            "along-structure alignment ({vertical}) must beat across ({horizontal})",
        );
    }

    #[test]
    fn multires_rejects_structure_destroying_lines() {
        // Pure-white target with an already-white canvas: any darkening
        // hurts low-res MSE badly at high opacity.
        let fx = Fixture::new(GrayImage::from_pixel(64, 64, image::Luma([255])));
        let px = fx.line(0, 12);
        let score = multires_line_score(&fx.ctx(), &px, 0, 12, 0.35);
        assert!(
            score <= REJECT,
            "darkening a white target should be rejected, got {score}",
        );
    }

    #[test]
    fn multires_accepts_structure_building_lines() {
        let fx = Fixture::new(GrayImage::from_pixel(64, 64, image::Luma([0])));
        let px = fx.line(0, 12);
        let score = multires_line_score(&fx.ctx(), &px, 0, 12, 0.2);
        assert!(score > 0.0, "helpful line should score positive, got {score}");
    }

    #[test]
    fn scoring_is_pure() {
        let fx = Fixture::new(GrayImage::from_fn(64, 64, |x, _| image::Luma([(x * 4) as u8])));
        let px = fx.line(3, 17);
        let a = multires_line_score(&fx.ctx(), &px, 3, 17, 0.12);
        let b = multires_line_score(&fx.ctx(), &px, 3, 17, 0.12);
        assert!((a - b).abs() < f64::EPSILON, "same inputs, same score");
    }
}
