//! Face-aware region weighting.
//!
//! Face detection itself is a black box behind the [`FaceDetector`]
//! trait; the engine consumes whatever box a detector returns and
//! builds boolean face/body masks plus the per-region policies
//! (min-skip floors and overdraw thresholds). When a configured
//! detector fails, a deterministic centred box is substituted silently;
//! when no detector is configured, no face handling takes place at all.

use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::pins::circular_distance;
use crate::types::{Pin, QualityPreset};

/// Axis-aligned face bounding box in working-canvas coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceBox {
    /// Left edge.
    pub x: f32,
    /// Top edge.
    pub y: f32,
    /// Box width.
    pub width: f32,
    /// Box height.
    pub height: f32,
}

impl FaceBox {
    fn contains(&self, px: f32, py: f32) -> bool {
        px >= self.x && px < self.x + self.width && py >= self.y && py < self.y + self.height
    }

    /// The box scaled about its centre.
    #[must_use]
    fn scaled(&self, sx: f32, sy: f32) -> Self {
        let cx = self.x + self.width / 2.0;
        let cy = self.y + self.height / 2.0;
        let w = self.width * sx;
        let h = self.height * sy;
        Self {
            x: cx - w / 2.0,
            y: cy - h / 2.0,
            width: w,
            height: h,
        }
    }
}

/// Black-box face detection seam.
///
/// Implementations run on the preprocessed working-canvas image (not
/// the original upload) so returned coordinates line up with every
/// other plane. Model loading is the implementor's concern; load
/// lazily once per process and share the model read-only across
/// concurrent jobs.
pub trait FaceDetector: Send + Sync {
    /// Detect the most prominent face, or `None` when detection fails
    /// or finds nothing.
    fn detect(&self, image: &GrayImage) -> Option<FaceBox>;
}

/// Deterministic centred fallback box: `(0.4W, 0.5H)` at
/// `(0.3W, 0.15H)`. Used when a configured detector fails.
#[must_use]
pub fn fallback_face_box(width: u32, height: u32) -> FaceBox {
    let w = width as f32;
    let h = height as f32;
    FaceBox {
        x: 0.3 * w,
        y: 0.15 * h,
        width: 0.4 * w,
        height: 0.5 * h,
    }
}

/// Pixel region classification, most-specific first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    /// Inside the (expanded) face box.
    Face,
    /// Inside the body box but outside the face box.
    Body,
    /// Everything else.
    Background,
}

/// Boolean face/body masks plus the per-region policies.
///
/// Built once per job from the detector output (or the fallback box)
/// and read-only afterwards. `RegionMask::none` produces the
/// no-face-configured variant where every pixel is background.
#[derive(Debug, Clone)]
pub struct RegionMask {
    width: u32,
    /// Per-pixel: inside the 1.1x-expanded face box.
    pub face: Vec<bool>,
    /// Per-pixel: inside the body box (which contains the face box).
    pub body: Vec<bool>,
    /// The detected (unexpanded) face box, when any.
    pub face_box: Option<FaceBox>,
    /// Min-skip floor for background-region pins; preset dependent.
    background_min_skip: u32,
    /// Caller-configured global min-skip floor.
    base_min_skip: u32,
}

/// Min-skip floor for pins in the face region.
const FACE_MIN_SKIP: u32 = 2;
/// Min-skip floor for pins in the body region.
const BODY_MIN_SKIP: u32 = 4;

/// Density threshold above which face/body pixels count as overdrawn.
const FACE_OVERDRAW_THRESHOLD: f32 = 0.80;
/// Density threshold above which background pixels count as overdrawn.
const BACKGROUND_OVERDRAW_THRESHOLD: f32 = 0.90;

/// A line is face-relevant above this overlap fraction.
pub const FACE_RELEVANT_OVERLAP: f64 = 0.05;
/// A line receives the full edge bonus multiplier above this overlap.
pub const FACE_BONUS_OVERLAP: f64 = 0.30;

impl RegionMask {
    /// Build masks from a face box. The face mask uses the box expanded
    /// by 1.1x; the body mask uses a box ~1.6x wider and 2.0x taller,
    /// anchored at the face top so it extends down over the torso.
    #[must_use]
    pub fn from_face(
        face: FaceBox,
        width: u32,
        height: u32,
        preset: QualityPreset,
        base_min_skip: u32,
    ) -> Self {
        let n = (width * height) as usize;
        let face_expanded = face.scaled(1.1, 1.1);
        let body_w = face.width * 1.6;
        let body_h = face.height * 2.0;
        let body = FaceBox {
            x: face.x + face.width / 2.0 - body_w / 2.0,
            y: face.y,
            width: body_w,
            height: body_h,
        };

        let mut face_mask = vec![false; n];
        let mut body_mask = vec![false; n];
        for y in 0..height {
            for x in 0..width {
                let i = (y * width + x) as usize;
                let (px, py) = (x as f32, y as f32);
                face_mask[i] = face_expanded.contains(px, py);
                body_mask[i] = face_mask[i] || body.contains(px, py);
            }
        }

        Self {
            width,
            face: face_mask,
            body: body_mask,
            face_box: Some(face),
            background_min_skip: background_min_skip(preset),
            base_min_skip,
        }
    }

    /// The no-face variant: every pixel is background.
    #[must_use]
    pub fn none(width: u32, height: u32, preset: QualityPreset, base_min_skip: u32) -> Self {
        let n = (width * height) as usize;
        Self {
            width,
            face: vec![false; n],
            body: vec![false; n],
            face_box: None,
            background_min_skip: background_min_skip(preset),
            base_min_skip,
        }
    }

    /// Classify a pixel index.
    #[must_use]
    pub fn region_of(&self, index: usize) -> Region {
        if self.face[index] {
            Region::Face
        } else if self.body[index] {
            Region::Body
        } else {
            Region::Background
        }
    }

    /// Classify a pin by its coordinates.
    #[must_use]
    pub fn region_of_pin(&self, pin: &Pin) -> Region {
        let i = usize::from(pin.y) * self.width as usize + usize::from(pin.x);
        self.region_of(i)
    }

    fn region_min_skip(&self, region: Region) -> u32 {
        match region {
            Region::Face => FACE_MIN_SKIP,
            Region::Body => BODY_MIN_SKIP,
            Region::Background => self.background_min_skip,
        }
    }

    /// Minimum modular pin distance required between `a` and `b` on a
    /// perimeter of `count` pins.
    ///
    /// If either endpoint falls in the face region the answer is the
    /// face floor (2); otherwise the stricter of the two endpoint
    /// policies. The caller-configured `min_pin_skip` is always a
    /// floor, and the whole rule is capped at `count / 2` — the largest
    /// modular distance that exists — so small frames (fewer pins than
    /// the background policy wants) remain usable.
    #[must_use]
    pub fn effective_min_skip(&self, a: &Pin, b: &Pin, count: u32) -> u32 {
        let ra = self.region_of_pin(a);
        let rb = self.region_of_pin(b);
        let policy = if ra == Region::Face || rb == Region::Face {
            FACE_MIN_SKIP
        } else {
            self.region_min_skip(ra).max(self.region_min_skip(rb))
        };
        policy.max(self.base_min_skip).min((count / 2).max(1))
    }

    /// Whether a pin pair satisfies the effective min-skip rule.
    #[must_use]
    pub fn pair_allowed(&self, a: &Pin, b: &Pin, count: u32) -> bool {
        a.index != b.index
            && circular_distance(a.index, b.index, count) >= self.effective_min_skip(a, b, count)
    }

    /// Density threshold above which a pixel counts as overdrawn.
    #[must_use]
    pub fn overdraw_threshold(&self, index: usize) -> f32 {
        match self.region_of(index) {
            Region::Face | Region::Body => FACE_OVERDRAW_THRESHOLD,
            Region::Background => BACKGROUND_OVERDRAW_THRESHOLD,
        }
    }

    /// Fraction of the given line pixels that fall in the face mask.
    #[must_use]
    pub fn line_face_overlap(&self, pixels: &[usize]) -> f64 {
        if pixels.is_empty() {
            return 0.0;
        }
        let hits = pixels.iter().filter(|&&i| self.face[i]).count();
        hits as f64 / pixels.len() as f64
    }

    /// Whether any face handling is active for this job.
    #[must_use]
    pub fn has_face(&self) -> bool {
        self.face_box.is_some()
    }
}

/// Background min-skip by quality preset.
const fn background_min_skip(preset: QualityPreset) -> u32 {
    match preset {
        QualityPreset::Fast => 6,
        QualityPreset::Balanced => 7,
        QualityPreset::High => 8,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pin(index: u32, x: u16, y: u16) -> Pin {
        Pin { index, x, y }
    }

    #[test]
    fn fallback_box_matches_documented_geometry() {
        let b = fallback_face_box(100, 200);
        assert!((b.x - 30.0).abs() < f32::EPSILON);
        assert!((b.y - 30.0).abs() < f32::EPSILON);
        assert!((b.width - 40.0).abs() < f32::EPSILON);
        assert!((b.height - 100.0).abs() < f32::EPSILON);
    }

    #[test]
    fn masks_nest_face_inside_body() {
        let face = FaceBox {
            x: 40.0,
            y: 30.0,
            width: 20.0,
            height: 30.0,
        };
        let mask = RegionMask::from_face(face, 100, 100, QualityPreset::Balanced, 2);
        for i in 0..mask.face.len() {
            if mask.face[i] {
                assert!(mask.body[i], "face pixel {i} must also be a body pixel");
            }
        }
        // Centre of the face box is Face, a point below it is Body,
        // a far corner is Background.
        assert_eq!(mask.region_of(45 * 100 + 50), Region::Face);
        assert_eq!(mask.region_of(75 * 100 + 50), Region::Body);
        assert_eq!(mask.region_of(5 * 100 + 5), Region::Background);
    }

    #[test]
    fn face_mask_is_expanded() {
        let face = FaceBox {
            x: 40.0,
            y: 40.0,
            width: 20.0,
            height: 20.0,
        };
        let mask = RegionMask::from_face(face, 100, 100, QualityPreset::Balanced, 2);
        // One pixel left of the raw box edge is inside the 1.1x
        // expansion.
        assert_eq!(mask.region_of(50 * 100 + 39), Region::Face);
    }

    #[test]
    fn effective_min_skip_uses_face_floor() {
        let face = FaceBox {
            x: 0.0,
            y: 0.0,
            width: 30.0,
            height: 30.0,
        };
        let mask = RegionMask::from_face(face, 100, 100, QualityPreset::High, 2);
        let in_face = pin(0, 10, 10);
        let in_bg = pin(50, 90, 90);
        // One endpoint in the face region wins the face floor even
        // against the background policy of 8.
        assert_eq!(mask.effective_min_skip(&in_face, &in_bg, 100), 2);
        // Two background endpoints use the preset policy.
        let bg2 = pin(60, 80, 95);
        assert_eq!(mask.effective_min_skip(&in_bg, &bg2, 100), 8);
    }

    #[test]
    fn configured_floor_wins_over_face_policy() {
        let face = FaceBox {
            x: 0.0,
            y: 0.0,
            width: 30.0,
            height: 30.0,
        };
        let mask = RegionMask::from_face(face, 100, 100, QualityPreset::Fast, 5);
        let a = pin(0, 10, 10);
        let b = pin(50, 12, 12);
        assert_eq!(mask.effective_min_skip(&a, &b, 100), 5);
    }

    #[test]
    fn background_skip_tracks_preset() {
        for (preset, expected) in [
            (QualityPreset::Fast, 6),
            (QualityPreset::Balanced, 7),
            (QualityPreset::High, 8),
        ] {
            let mask = RegionMask::none(50, 50, preset, 2);
            let a = pin(0, 1, 1);
            let b = pin(25, 48, 48);
            assert_eq!(mask.effective_min_skip(&a, &b, 100), expected);
        }
    }

    #[test]
    fn pair_allowed_rejects_self_and_close_pins() {
        let mask = RegionMask::none(50, 50, QualityPreset::Fast, 2);
        let a = pin(10, 1, 1);
        assert!(!mask.pair_allowed(&a, &a, 100));
        let near = pin(12, 2, 2);
        assert!(
            !mask.pair_allowed(&a, &near, 100),
            "distance 2 < background skip 6",
        );
        let far = pin(40, 48, 48);
        assert!(mask.pair_allowed(&a, &far, 100));
    }

    #[test]
    fn overdraw_threshold_by_region() {
        let face = FaceBox {
            x: 10.0,
            y: 10.0,
            width: 20.0,
            height: 20.0,
        };
        let mask = RegionMask::from_face(face, 64, 64, QualityPreset::Balanced, 2);
        let face_idx = 20 * 64 + 20;
        let bg_idx = 60 * 64 + 60;
        assert!((mask.overdraw_threshold(face_idx) - 0.80).abs() < f32::EPSILON);
        assert!((mask.overdraw_threshold(bg_idx) - 0.90).abs() < f32::EPSILON);
    }

    #[test]
    fn line_face_overlap_counts_fraction() {
        let face = FaceBox {
            x: 0.0,
            y: 0.0,
            width: 32.0,
            height: 64.0,
        };
        let mask = RegionMask::from_face(face, 64, 64, QualityPreset::Balanced, 2);
        // A horizontal row at y = 10: pixels 0..35 are inside the 1.1x
        // expansion (width 35.2), the rest outside.
        let row: Vec<usize> = (0..64).map(|x| 10 * 64 + x).collect();
        let overlap = mask.line_face_overlap(&row);
        assert!(
            (overlap - 36.0 / 64.0).abs() < 0.05,
            "expected roughly half overlap, got {overlap}",
        );
        assert!((mask.line_face_overlap(&[])).abs() < f64::EPSILON);
    }
}
