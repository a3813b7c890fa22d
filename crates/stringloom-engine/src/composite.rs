//! Gamma-correct thread compositing.
//!
//! All blending happens in linear light (gamma 2.2). The monochrome
//! forward composite darkens by `L' = L * (1 - alpha)`; the colored
//! composite uses per-channel subtractive absorption. Reverse
//! composites invert the forward operation and are only trusted by
//! annealing and backtracking, which tolerate the clamped precision
//! loss on saturated pixels.
//!
//! Every forward step also advances the density plane with the
//! source-over rule `d' = d + alpha * (1 - d)` and bumps the overdraw
//! counter; reverts undo both.

use std::sync::OnceLock;

/// Display gamma assumed for the 8-bit canvases.
pub const GAMMA: f32 = 2.2;

fn linear_lut() -> &'static [f32; 256] {
    static LUT: OnceLock<[f32; 256]> = OnceLock::new();
    LUT.get_or_init(|| {
        let mut table = [0.0_f32; 256];
        for (i, slot) in table.iter_mut().enumerate() {
            *slot = (i as f32 / 255.0).powf(GAMMA);
        }
        table
    })
}

/// 8-bit intensity to linear light.
#[inline]
#[must_use]
pub fn to_linear(v: u8) -> f32 {
    linear_lut()[usize::from(v)]
}

/// Linear light back to 8-bit intensity (clamped, rounded).
#[inline]
#[must_use]
pub fn from_linear(l: f32) -> u8 {
    (l.clamp(0.0, 1.0).powf(1.0 / GAMMA) * 255.0).round() as u8
}

/// Linear-light representation of a thread color.
#[inline]
#[must_use]
pub fn thread_linear(rgb: [u8; 3]) -> [f32; 3] {
    [to_linear(rgb[0]), to_linear(rgb[1]), to_linear(rgb[2])]
}

/// The monochrome forward composite for a single pixel, without
/// touching any plane. Used by scoring simulations.
#[inline]
#[must_use]
pub fn simulate_mono(current: u8, alpha: f32) -> u8 {
    from_linear(to_linear(current) * (1.0 - alpha))
}

/// The colored subtractive composite for a single pixel, without
/// touching any plane.
#[inline]
#[must_use]
pub fn simulate_rgb(current: [u8; 3], thread_lin: [f32; 3], alpha: f32) -> [u8; 3] {
    let mut out = [0_u8; 3];
    for c in 0..3 {
        let absorb = (1.0 - thread_lin[c]) * alpha;
        out[c] = from_linear(to_linear(current[c]) * (1.0 - absorb));
    }
    out
}

/// Source-over density accumulation in linear space.
#[inline]
fn density_forward(d: f32, alpha: f32) -> f32 {
    (d + alpha * (1.0 - d)).clamp(0.0, 1.0)
}

/// Inverse of [`density_forward`], clamped.
#[inline]
fn density_reverse(d: f32, alpha: f32) -> f32 {
    if alpha >= 1.0 {
        0.0
    } else {
        ((d - alpha) / (1.0 - alpha)).clamp(0.0, 1.0)
    }
}

/// Apply a black thread along `pixels` to the monochrome canvas.
pub fn forward_mono(
    canvas: &mut [u8],
    density: &mut [f32],
    overdraw: &mut [u16],
    pixels: &[usize],
    alpha: f32,
) {
    for &i in pixels {
        canvas[i] = simulate_mono(canvas[i], alpha);
        density[i] = density_forward(density[i], alpha);
        overdraw[i] = overdraw[i].saturating_add(1);
    }
}

/// Undo [`forward_mono`]. Clamped; may drift on heavily darkened
/// pixels.
pub fn reverse_mono(
    canvas: &mut [u8],
    density: &mut [f32],
    overdraw: &mut [u16],
    pixels: &[usize],
    alpha: f32,
) {
    let gain = 1.0 / (1.0 - alpha).max(f32::EPSILON);
    for &i in pixels {
        canvas[i] = from_linear(to_linear(canvas[i]) * gain);
        density[i] = density_reverse(density[i], alpha);
        overdraw[i] = overdraw[i].saturating_sub(1);
    }
}

/// Apply a colored thread along `pixels` to the RGB canvas
/// (subtractive absorption per channel).
pub fn forward_rgb(
    canvas: &mut [u8],
    density: &mut [f32],
    overdraw: &mut [u16],
    pixels: &[usize],
    thread_lin: [f32; 3],
    alpha: f32,
) {
    for &i in pixels {
        let base = i * 3;
        for c in 0..3 {
            let absorb = (1.0 - thread_lin[c]) * alpha;
            canvas[base + c] = from_linear(to_linear(canvas[base + c]) * (1.0 - absorb));
        }
        density[i] = density_forward(density[i], alpha);
        overdraw[i] = overdraw[i].saturating_add(1);
    }
}

/// Undo [`forward_rgb`]. Clamped to `[0, 1]` per channel; saturated
/// pixels may not recover exactly.
pub fn reverse_rgb(
    canvas: &mut [u8],
    density: &mut [f32],
    overdraw: &mut [u16],
    pixels: &[usize],
    thread_lin: [f32; 3],
    alpha: f32,
) {
    for &i in pixels {
        let base = i * 3;
        for c in 0..3 {
            let absorb = (1.0 - thread_lin[c]) * alpha;
            let gain = 1.0 / (1.0 - absorb).max(f32::EPSILON);
            canvas[base + c] = from_linear((to_linear(canvas[base + c]) * gain).clamp(0.0, 1.0));
        }
        density[i] = density_reverse(density[i], alpha);
        overdraw[i] = overdraw[i].saturating_sub(1);
    }
}
