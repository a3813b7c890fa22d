//! Sobel edge pipeline: magnitude map and edge-tangent vectors.
//!
//! Produces the normalized edge-magnitude map used for candidate
//! bonuses plus a per-pixel unit vector tangent to the local edge
//! (`(-gy, gx) / |g|`), which candidate generation projects onto line
//! directions. The 3x3 Sobel uses a zero border: gradients in the
//! outermost pixel ring are zero.

use image::GrayImage;

/// Exponent applied to the normalized magnitude; values below one
/// strengthen mid-range peaks.
const MAGNITUDE_POWER: f32 = 0.7;

/// Edge magnitude and tangent planes for one target image.
#[derive(Debug, Clone)]
pub struct EdgePlanes {
    /// Canvas width in pixels.
    pub width: u32,
    /// Canvas height in pixels.
    pub height: u32,
    /// Normalized, power-curved magnitude in `[0, 255]`.
    pub magnitude: Vec<u8>,
    /// X component of the edge-tangent unit vector.
    pub tangent_x: Vec<f32>,
    /// Y component of the edge-tangent unit vector.
    pub tangent_y: Vec<f32>,
}

impl EdgePlanes {
    /// An all-zero plane set, used when edge detection is disabled.
    #[must_use]
    pub fn disabled(width: u32, height: u32) -> Self {
        let n = (width * height) as usize;
        Self {
            width,
            height,
            magnitude: vec![0; n],
            tangent_x: vec![0.0; n],
            tangent_y: vec![0.0; n],
        }
    }
}

/// Run the 3x3 Sobel operator and build the edge planes.
///
/// Magnitudes are normalized to `[0, 255]` across the image, then
/// power-curved with exponent 0.7. Tangents are unit vectors
/// perpendicular to the gradient; pixels with zero gradient carry a
/// zero tangent.
#[must_use]
pub fn detect_edges(gray: &GrayImage) -> EdgePlanes {
    let w = gray.width() as usize;
    let h = gray.height() as usize;
    let n = w * h;
    let data = gray.as_raw();

    let mut gx = vec![0.0_f32; n];
    let mut gy = vec![0.0_f32; n];
    let mut mag = vec![0.0_f32; n];
    let mut max_mag = 0.0_f32;

    // Zero border: only interior pixels get gradients.
    for y in 1..h.saturating_sub(1) {
        for x in 1..w.saturating_sub(1) {
            let px = |dx: isize, dy: isize| {
                f32::from(data[(y as isize + dy) as usize * w + (x as isize + dx) as usize])
            };
            let sx = px(1, -1) + 2.0 * px(1, 0) + px(1, 1)
                - px(-1, -1)
                - 2.0 * px(-1, 0)
                - px(-1, 1);
            let sy = px(-1, 1) + 2.0 * px(0, 1) + px(1, 1)
                - px(-1, -1)
                - 2.0 * px(0, -1)
                - px(1, -1);
            let i = y * w + x;
            gx[i] = sx;
            gy[i] = sy;
            mag[i] = sx.hypot(sy);
            max_mag = max_mag.max(mag[i]);
        }
    }

    let mut magnitude = vec![0_u8; n];
    let mut tangent_x = vec![0.0_f32; n];
    let mut tangent_y = vec![0.0_f32; n];

    if max_mag > 0.0 {
        for i in 0..n {
            if mag[i] > 0.0 {
                let norm = (mag[i] / max_mag).powf(MAGNITUDE_POWER);
                magnitude[i] = (norm * 255.0).round() as u8;
                // Tangent is the gradient rotated a quarter turn.
                tangent_x[i] = -gy[i] / mag[i];
                tangent_y[i] = gx[i] / mag[i];
            }
        }
    }

    EdgePlanes {
        width: gray.width(),
        height: gray.height(),
        magnitude,
        tangent_x,
        tangent_y,
    }
}
