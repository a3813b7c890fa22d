//! Multi-resolution mirrors of target and progress.
//!
//! Maintains 1/4- and 1/2-scale copies of both the target image and the
//! progress canvas for cheap structure scoring. Downsampling is a box
//! filter performed in linear light: averaging gamma-encoded bytes
//! produces darker-than-truth mirrors that mislead structure scoring,
//! so bytes are linearized first and the mirrors are kept linear.
//!
//! Mirrors are not continuously in sync with the full-resolution
//! canvas; the driver refreshes the progress mirrors on a cadence and
//! the scorer treats the small staleness as noise.

use image::GrayImage;

use crate::composite::to_linear;

/// One downsampled plane in linear light.
#[derive(Debug, Clone)]
pub struct Mirror {
    /// Mirror width in pixels.
    pub width: u32,
    /// Mirror height in pixels.
    pub height: u32,
    /// Row-major linear intensities in `[0, 1]`.
    pub data: Vec<f32>,
    /// Full-resolution pixels per mirror pixel along one axis.
    pub factor: u32,
}

impl Mirror {
    /// Box-downsample a grayscale canvas by `factor` in linear light.
    #[must_use]
    pub fn from_gray(src: &GrayImage, factor: u32) -> Self {
        let width = src.width().div_ceil(factor);
        let height = src.height().div_ceil(factor);
        let mut data = vec![0.0_f32; (width * height) as usize];

        for my in 0..height {
            for mx in 0..width {
                let x0 = mx * factor;
                let y0 = my * factor;
                let x1 = (x0 + factor).min(src.width());
                let y1 = (y0 + factor).min(src.height());
                let mut sum = 0.0;
                for y in y0..y1 {
                    for x in x0..x1 {
                        sum += to_linear(src.get_pixel(x, y).0[0]);
                    }
                }
                let count = ((x1 - x0) * (y1 - y0)) as f32;
                data[(my * width + mx) as usize] = sum / count;
            }
        }

        Self {
            width,
            height,
            data,
            factor,
        }
    }

    /// A solid-white mirror of the given full-resolution extent.
    #[must_use]
    pub fn white(full_width: u32, full_height: u32, factor: u32) -> Self {
        let width = full_width.div_ceil(factor);
        let height = full_height.div_ceil(factor);
        Self {
            width,
            height,
            data: vec![1.0; (width * height) as usize],
            factor,
        }
    }
}

/// The four mirrors the multi-resolution scorer consults.
#[derive(Debug, Clone)]
pub struct Pyramid {
    /// 1/4-scale target, computed once.
    pub low_target: Mirror,
    /// 1/2-scale target, computed once.
    pub mid_target: Mirror,
    /// 1/4-scale progress, refreshed on a cadence.
    pub low_progress: Mirror,
    /// 1/2-scale progress, refreshed on a cadence.
    pub mid_progress: Mirror,
}

/// Downsample factor of the low mirrors.
pub const LOW_FACTOR: u32 = 4;
/// Downsample factor of the mid mirrors.
pub const MID_FACTOR: u32 = 2;

impl Pyramid {
    /// Build target mirrors from the preprocessed target and start the
    /// progress mirrors at solid white (the canvas start state).
    #[must_use]
    pub fn new(target: &GrayImage) -> Self {
        Self {
            low_target: Mirror::from_gray(target, LOW_FACTOR),
            mid_target: Mirror::from_gray(target, MID_FACTOR),
            low_progress: Mirror::white(target.width(), target.height(), LOW_FACTOR),
            mid_progress: Mirror::white(target.width(), target.height(), MID_FACTOR),
        }
    }

    /// Recompute both progress mirrors from the current canvas.
    pub fn refresh_progress(&mut self, progress: &GrayImage) {
        self.low_progress = Mirror::from_gray(progress, LOW_FACTOR);
        self.mid_progress = Mirror::from_gray(progress, MID_FACTOR);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirror_dimensions_round_up() {
        let img = GrayImage::new(10, 10);
        let m = Mirror::from_gray(&img, 4);
        assert_eq!(m.width, 3);
        assert_eq!(m.height, 3);
        assert_eq!(m.data.len(), 9);
    }

    #[test]
    fn uniform_image_mirrors_to_its_linear_value() {
        let img = GrayImage::from_fn(8, 8, |_, _| image::Luma([128]));
        let m = Mirror::from_gray(&img, 2);
        let expected = to_linear(128);
        for &v in &m.data {
            assert!((v - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn linear_light_averaging_beats_byte_averaging() {
        // A checkerboard of black and white averages to 0.5 in linear
        // light. Byte-space averaging would give (0+255)/2 = 127.5,
        // which decodes to a much darker linear value (~0.22).
        let img = GrayImage::from_fn(8, 8, |x, y| {
            if (x + y) % 2 == 0 {
                image::Luma([0])
            } else {
                image::Luma([255])
            }
        });
        let m = Mirror::from_gray(&img, 2);
        for &v in &m.data {
            assert!(
                (v - 0.5).abs() < 1e-6,
                "linear box filter must average to 0.5, got {v}",
            );
        }
    }

    #[test]
    fn fresh_pyramid_progress_is_white() {
        let target = GrayImage::from_fn(16, 16, |x, _| image::Luma([(x * 16) as u8]));
        let p = Pyramid::new(&target);
        assert!(p.low_progress.data.iter().all(|&v| (v - 1.0).abs() < f32::EPSILON));
        assert!(p.mid_progress.data.iter().all(|&v| (v - 1.0).abs() < f32::EPSILON));
        assert_eq!(p.low_target.width, 4);
        assert_eq!(p.mid_target.width, 8);
    }

    #[test]
    fn refresh_tracks_the_canvas() {
        let target = GrayImage::from_fn(16, 16, |_, _| image::Luma([255]));
        let mut p = Pyramid::new(&target);
        let darkened = GrayImage::from_fn(16, 16, |_, _| image::Luma([64]));
        p.refresh_progress(&darkened);
        let expected = to_linear(64);
        assert!(p
            .low_progress
            .data
            .iter()
            .all(|&v| (v - expected).abs() < 1e-6));
    }
}
