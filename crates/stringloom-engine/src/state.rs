//! Single-owner mutable state for one generation job.
//!
//! Everything the optimizer mutates lives in one [`ProgressState`]
//! threaded through the driver by exclusive reference — canvases,
//! density, overdraw, the pyramid mirrors, pin usage, the line cache,
//! and the growing connection log. Two jobs never share a state; the
//! result assembler consumes it once at the end.

use std::sync::Arc;

use image::{GrayImage, RgbImage};

use crate::color::{target_lab_plane, ThreadColor};
use crate::composite;
use crate::edges::EdgePlanes;
use crate::faces::RegionMask;
use crate::pyramid::Pyramid;
use crate::raster::LineCache;
use crate::types::{Pin, ThreadConnection};

/// All mutable planes and bookkeeping for one job.
pub struct ProgressState {
    /// Canvas edge length (the canvas is square).
    pub edge: u32,
    /// Preprocessed grayscale target.
    pub target_gray: GrayImage,
    /// Preprocessed RGB target (color mode only).
    pub target_rgb: Option<RgbImage>,
    /// Memoized LAB plane of the RGB target (color mode only).
    pub target_lab: Option<Vec<[f32; 3]>>,
    /// Monochrome progress canvas; starts solid white.
    pub progress_gray: GrayImage,
    /// RGB progress canvas (color mode only); starts solid white.
    pub progress_rgb: Option<RgbImage>,
    /// Accumulated opacity per pixel in linear space, `[0, 1]`.
    pub density: Vec<f32>,
    /// Number of threads that have crossed each pixel.
    pub overdraw: Vec<u16>,
    /// Edge magnitude and tangent planes of the target.
    pub edges: EdgePlanes,
    /// Multi-resolution mirrors.
    pub pyramid: Pyramid,
    /// The immutable pin layout.
    pub pins: Vec<Pin>,
    /// Per-pin usage counters.
    pub pin_usage: Vec<u32>,
    /// Memoized rasterized lines.
    pub line_cache: LineCache,
    /// Face/body masks and region policies.
    pub regions: RegionMask,
    /// Rasterized thread thickness in pixels.
    pub width_px: u32,
    /// The pin the next thread departs from.
    pub current_pin: u32,
    /// Connection log in execution order.
    pub connections: Vec<ThreadConnection>,
    /// Opacity each connection was composited with, parallel to
    /// `connections`. Needed to revert stage-scaled composites.
    pub applied_alpha: Vec<f32>,
}

impl ProgressState {
    /// Build fresh state: white canvases, zero density and overdraw,
    /// edge planes computed from the target.
    #[must_use]
    pub fn new(
        target_gray: GrayImage,
        target_rgb: Option<RgbImage>,
        edges: EdgePlanes,
        pins: Vec<Pin>,
        regions: RegionMask,
        width_px: u32,
    ) -> Self {
        let edge = target_gray.width();
        let n = (edge * edge) as usize;
        let pyramid = Pyramid::new(&target_gray);
        let target_lab = target_rgb.as_ref().map(target_lab_plane);
        let progress_rgb = target_rgb
            .as_ref()
            .map(|_| RgbImage::from_pixel(edge, edge, image::Rgb([255, 255, 255])));
        let pin_count = pins.len();

        Self {
            edge,
            target_gray,
            target_rgb,
            target_lab,
            progress_gray: GrayImage::from_pixel(edge, edge, image::Luma([255])),
            progress_rgb,
            density: vec![0.0; n],
            overdraw: vec![0; n],
            edges,
            pyramid,
            pins,
            pin_usage: vec![0; pin_count],
            line_cache: LineCache::new(),
            regions,
            width_px,
            current_pin: 0,
            connections: Vec::new(),
            applied_alpha: Vec::new(),
        }
    }

    /// Number of pins on the frame.
    #[must_use]
    pub fn pin_count(&self) -> u32 {
        self.pins.len() as u32
    }

    /// Rasterize (or fetch) the pixel run between two pins by index.
    pub fn line(&mut self, a: u32, b: u32) -> Arc<Vec<usize>> {
        let pa = self.pins[a as usize];
        let pb = self.pins[b as usize];
        self.line_cache
            .get_or_rasterize(&pa, &pb, self.width_px, self.edge, self.edge)
    }

    /// Forward-composite one thread and append it to the log.
    ///
    /// Keeps `current_pin`, pin usage, and the parallel alpha record in
    /// sync with the connection log.
    pub fn apply_thread(&mut self, from: u32, to: u32, color: &ThreadColor, alpha: f32) {
        let pixels = self.line(from, to);
        self.composite_forward(&pixels, color, alpha);
        self.pin_usage[from as usize] += 1;
        self.pin_usage[to as usize] += 1;
        self.current_pin = to;
        self.connections.push(ThreadConnection {
            from_pin: from,
            to_pin: to,
            color_hex: color.hex.to_owned(),
            color_name: color.name.to_owned(),
        });
        self.applied_alpha.push(alpha);
    }

    /// Forward-composite a pixel run without touching the log. Used by
    /// refinement when re-applying a moved connection.
    pub fn composite_forward(&mut self, pixels: &[usize], color: &ThreadColor, alpha: f32) {
        match self.progress_rgb.as_mut() {
            Some(rgb) => composite::forward_rgb(
                rgb,
                &mut self.density,
                &mut self.overdraw,
                pixels,
                composite::thread_linear(color.rgb),
                alpha,
            ),
            None => composite::forward_mono(
                &mut self.progress_gray,
                &mut self.density,
                &mut self.overdraw,
                pixels,
                alpha,
            ),
        }
    }

    /// Reverse-composite a pixel run without touching the log.
    pub fn composite_reverse(&mut self, pixels: &[usize], color: &ThreadColor, alpha: f32) {
        match self.progress_rgb.as_mut() {
            Some(rgb) => composite::reverse_rgb(
                rgb,
                &mut self.density,
                &mut self.overdraw,
                pixels,
                composite::thread_linear(color.rgb),
                alpha,
            ),
            None => composite::reverse_mono(
                &mut self.progress_gray,
                &mut self.density,
                &mut self.overdraw,
                pixels,
                alpha,
            ),
        }
    }

    /// Revert the composite of the connection at `index`, leaving the
    /// log entry in place for the caller to rewrite or restore.
    pub fn revert_connection(&mut self, index: usize) {
        let c = self.connections[index].clone();
        let alpha = self.applied_alpha[index];
        let color = palette_entry(&c.color_hex);
        let pixels = self.line(c.from_pin, c.to_pin);
        self.composite_reverse(&pixels, &color, alpha);
        self.pin_usage[c.from_pin as usize] =
            self.pin_usage[c.from_pin as usize].saturating_sub(1);
        self.pin_usage[c.to_pin as usize] = self.pin_usage[c.to_pin as usize].saturating_sub(1);
    }

    /// Re-apply the connection at `index` (after `revert_connection`),
    /// optionally with rewritten endpoints already stored in the log.
    pub fn reapply_connection(&mut self, index: usize) {
        let c = self.connections[index].clone();
        let alpha = self.applied_alpha[index];
        let color = palette_entry(&c.color_hex);
        let pixels = self.line(c.from_pin, c.to_pin);
        self.composite_forward(&pixels, &color, alpha);
        self.pin_usage[c.from_pin as usize] += 1;
        self.pin_usage[c.to_pin as usize] += 1;
    }

    /// Refresh the pyramid's progress mirrors from the current canvas.
    ///
    /// Color mode mirrors the luminance of the RGB canvas; the mirrors
    /// are only consulted by scoring, never displayed.
    pub fn refresh_pyramid(&mut self) {
        match self.progress_rgb.as_ref() {
            Some(rgb) => {
                let luma = GrayImage::from_fn(self.edge, self.edge, |x, y| {
                    let p = rgb.get_pixel(x, y).0;
                    let l = 0.299 * f32::from(p[0])
                        + 0.587 * f32::from(p[1])
                        + 0.114 * f32::from(p[2]);
                    image::Luma([l.round().clamp(0.0, 255.0) as u8])
                });
                self.pyramid.refresh_progress(&luma);
            }
            None => self.pyramid.refresh_progress(&self.progress_gray),
        }
    }

    /// Bound line-cache memory: drop it once it exceeds the theoretical
    /// pin-pair maximum (which can only happen across thickness
    /// variants).
    pub fn bound_line_cache(&mut self) {
        let max = self.pins.len() * (self.pins.len().saturating_sub(1)) / 2;
        if self.line_cache.len() > max {
            self.line_cache.clear();
        }
    }
}

/// Look a palette entry up by hex, falling back to black.
///
/// The connection log only ever stores palette colors, so the fallback
/// is defensive bookkeeping for deserialized input, not a policy.
#[must_use]
pub fn palette_entry(hex: &str) -> ThreadColor {
    crate::color::PALETTE
        .iter()
        .copied()
        .find(|c| c.hex.eq_ignore_ascii_case(hex))
        .unwrap_or(crate::color::BLACK)
}
