//! Pin placement on the frame perimeter.
//!
//! Pins are generated once per job and indexed `0..count` in perimeter
//! order, so adjacency in index space corresponds to geometric
//! adjacency. That property is load-bearing: the min-skip rule is
//! defined over modular index distance.

use crate::faces::FaceBox;
use crate::types::{FrameType, Pin};

/// Gap in pixels between the frame edge and the pin circle / pin rows.
const EDGE_MARGIN: f64 = 5.0;

/// Pin-density boost inside the face angular sector.
const FACE_DENSITY: f64 = 1.4;

/// Hard cap on face-bias overshoot: total pins never exceed
/// `requested + 15%`.
const OVERSHOOT_CAP: f64 = 0.15;

/// Modular index distance between two pins on a closed perimeter of
/// `count` pins.
#[must_use]
pub fn circular_distance(a: u32, b: u32, count: u32) -> u32 {
    let d = a.abs_diff(b) % count;
    d.min(count - d)
}

/// Place pins on the frame perimeter.
///
/// Circular frames put pins on a circle of radius
/// `min(W, H) / 2 - 5` about the canvas centre; with a face box the
/// face's angular sector receives ~1.4x pin density (total count may
/// overshoot by up to 15% and is re-indexed densely). Square and
/// rectangular frames divide the perimeter into four sides of
/// `count / 4` pins each, inset by the 5-pixel margin.
#[must_use]
pub fn place_pins(
    frame: FrameType,
    count: u32,
    width: u32,
    height: u32,
    face: Option<&FaceBox>,
) -> Vec<Pin> {
    match frame {
        FrameType::Circular => match face {
            Some(face) => circular_face_biased(count, width, height, face),
            None => circular_uniform(count, width, height),
        },
        FrameType::Square | FrameType::Rectangular => rectangular(count, width, height),
    }
}

fn pin_at_angle(index: u32, theta: f64, cx: f64, cy: f64, radius: f64) -> Pin {
    Pin {
        index,
        x: (cx + radius * theta.cos()).round().max(0.0) as u16,
        y: (cy + radius * theta.sin()).round().max(0.0) as u16,
    }
}

fn circular_uniform(count: u32, width: u32, height: u32) -> Vec<Pin> {
    let cx = f64::from(width) / 2.0;
    let cy = f64::from(height) / 2.0;
    let radius = f64::from(width.min(height)) / 2.0 - EDGE_MARGIN;

    (0..count)
        .map(|i| {
            let theta = std::f64::consts::TAU * f64::from(i) / f64::from(count);
            pin_at_angle(i, theta, cx, cy, radius)
        })
        .collect()
}

/// Circular layout with pin spacing compressed inside the face sector.
///
/// The face sector is the angular range subtended by the face centre
/// plus/minus `atan2(faceW / 2, radius)`. Pins inside it are packed at
/// ~1.4x the baseline density; the remainder of the circle keeps the
/// baseline spacing. The combined list is sorted by angle and densely
/// re-indexed, so perimeter ordering survives the merge.
fn circular_face_biased(count: u32, width: u32, height: u32, face: &FaceBox) -> Vec<Pin> {
    let cx = f64::from(width) / 2.0;
    let cy = f64::from(height) / 2.0;
    let radius = f64::from(width.min(height)) / 2.0 - EDGE_MARGIN;

    let face_cx = f64::from(face.x) + f64::from(face.width) / 2.0;
    let face_cy = f64::from(face.y) + f64::from(face.height) / 2.0;
    let sector_center = (face_cy - cy).atan2(face_cx - cx);
    let half_width = (f64::from(face.width) / 2.0).atan2(radius);

    let sector_fraction = (half_width * 2.0) / std::f64::consts::TAU;
    let total = f64::from(count);

    let mut n_face = (FACE_DENSITY * total * sector_fraction).round();
    let n_out = (total * (1.0 - sector_fraction)).round();
    // Cap the overshoot, then re-index densely rather than truncate.
    let cap = total * (1.0 + OVERSHOOT_CAP);
    if n_face + n_out > cap {
        n_face = (cap - n_out).max(0.0);
    }
    let n_face = n_face as u32;
    let n_out = n_out as u32;

    let mut angles = Vec::with_capacity((n_face + n_out) as usize);
    let sector_start = sector_center - half_width;
    for i in 0..n_face {
        let t = (f64::from(i) + 0.5) / f64::from(n_face.max(1));
        angles.push(normalize_angle(sector_start + t * half_width * 2.0));
    }
    let out_start = sector_center + half_width;
    let out_span = std::f64::consts::TAU - half_width * 2.0;
    for i in 0..n_out {
        let t = (f64::from(i) + 0.5) / f64::from(n_out.max(1));
        angles.push(normalize_angle(out_start + t * out_span));
    }

    angles.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    angles
        .into_iter()
        .enumerate()
        .map(|(i, theta)| pin_at_angle(i as u32, theta, cx, cy, radius))
        .collect()
}

fn normalize_angle(theta: f64) -> f64 {
    theta.rem_euclid(std::f64::consts::TAU)
}

/// Perimeter layout for square/rectangular frames: four sides, each
/// carrying `count / 4` equally spaced pins, walked clockwise from the
/// top-left corner so index order follows the perimeter.
fn rectangular(count: u32, width: u32, height: u32) -> Vec<Pin> {
    let per_side = count / 4;
    let left = EDGE_MARGIN;
    let top = EDGE_MARGIN;
    let right = f64::from(width) - EDGE_MARGIN;
    let bottom = f64::from(height) - EDGE_MARGIN;

    let mut pins = Vec::with_capacity((per_side * 4) as usize);
    let step = |i: u32| (f64::from(i) + 0.5) / f64::from(per_side.max(1));

    // Top edge, left to right.
    for i in 0..per_side {
        pins.push((left + step(i) * (right - left), top));
    }
    // Right edge, top to bottom.
    for i in 0..per_side {
        pins.push((right, top + step(i) * (bottom - top)));
    }
    // Bottom edge, right to left.
    for i in 0..per_side {
        pins.push((right - step(i) * (right - left), bottom));
    }
    // Left edge, bottom to top.
    for i in 0..per_side {
        pins.push((left, bottom - step(i) * (bottom - top)));
    }

    pins.into_iter()
        .enumerate()
        .map(|(i, (x, y))| Pin {
            index: i as u32,
            x: x.round().max(0.0) as u16,
            y: y.round().max(0.0) as u16,
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn circular_distance_wraps() {
        assert_eq!(circular_distance(0, 1, 100), 1);
        assert_eq!(circular_distance(0, 99, 100), 1);
        assert_eq!(circular_distance(10, 60, 100), 50);
        assert_eq!(circular_distance(5, 5, 100), 0);
        assert_eq!(circular_distance(95, 5, 100), 10);
    }

    #[test]
    fn circular_pins_sit_on_the_circle() {
        let pins = place_pins(FrameType::Circular, 120, 200, 200, None);
        assert_eq!(pins.len(), 120);
        let radius = 200.0 / 2.0 - 5.0;
        for p in &pins {
            let dx = f64::from(p.x) - 100.0;
            let dy = f64::from(p.y) - 100.0;
            let r = dx.hypot(dy);
            assert!(
                (r - radius).abs() <= 1.0,
                "pin {} at ({}, {}) is off-circle: r = {r}",
                p.index,
                p.x,
                p.y,
            );
        }
    }

    #[test]
    fn circular_pins_are_indexed_in_perimeter_order() {
        let pins = place_pins(FrameType::Circular, 90, 128, 128, None);
        for (i, p) in pins.iter().enumerate() {
            assert_eq!(p.index, i as u32);
        }
        // Consecutive pins are geometric neighbours: their chord length
        // is near 2 * r * sin(pi / n).
        let radius = 128.0 / 2.0 - 5.0;
        let expected = 2.0 * radius * (std::f64::consts::PI / 90.0).sin();
        for w in pins.windows(2) {
            let dx = f64::from(w[1].x) - f64::from(w[0].x);
            let dy = f64::from(w[1].y) - f64::from(w[0].y);
            let chord = dx.hypot(dy);
            assert!(
                (chord - expected).abs() < 2.5,
                "adjacent pins should be geometric neighbours, chord = {chord}, expected {expected}",
            );
        }
    }

    #[test]
    fn rectangular_distributes_evenly_across_sides() {
        let pins = place_pins(FrameType::Square, 60, 100, 100, None);
        assert_eq!(pins.len(), 60);
        let top = pins.iter().filter(|p| p.y == 5).count();
        let bottom = pins.iter().filter(|p| p.y == 95).count();
        let left = pins.iter().filter(|p| p.x == 5 && p.y != 5 && p.y != 95).count();
        let right = pins
            .iter()
            .filter(|p| p.x == 95 && p.y != 5 && p.y != 95)
            .count();
        assert_eq!(top, 15);
        assert_eq!(bottom, 15);
        assert_eq!(left, 15);
        assert_eq!(right, 15);
    }

    #[test]
    fn rectangular_respects_margin() {
        let pins = place_pins(FrameType::Rectangular, 100, 256, 256, None);
        for p in &pins {
            assert!(p.x >= 5 && p.x <= 251, "pin x {} breaches margin", p.x);
            assert!(p.y >= 5 && p.y <= 251, "pin y {} breaches margin", p.y);
        }
    }

    #[test]
    fn face_bias_densifies_the_face_sector() {
        let face = FaceBox {
            x: 90.0,
            y: 20.0,
            width: 80.0,
            height: 100.0,
        };
        let uniform = place_pins(FrameType::Circular, 200, 256, 256, None);
        let biased = place_pins(FrameType::Circular, 200, 256, 256, Some(&face));

        // Overshoot is bounded by 15%.
        assert!(biased.len() >= uniform.len());
        assert!(
            biased.len() as f64 <= 200.0 * 1.15 + 1.0,
            "overshoot cap breached: {} pins",
            biased.len(),
        );

        // Count pins whose angle lies inside the face sector for both
        // layouts; the biased layout must hold more.
        let radius = 256.0 / 2.0 - 5.0;
        let sector_center = (70.0 - 128.0_f64).atan2(130.0 - 128.0);
        let half = (40.0_f64).atan2(radius);
        let in_sector = |pins: &[Pin]| {
            pins.iter()
                .filter(|p| {
                    let theta = (f64::from(p.y) - 128.0).atan2(f64::from(p.x) - 128.0);
                    let mut d = (theta - sector_center).rem_euclid(std::f64::consts::TAU);
                    if d > std::f64::consts::PI {
                        d = std::f64::consts::TAU - d;
                    }
                    d <= half
                })
                .count()
        };
        assert!(
            in_sector(&biased) > in_sector(&uniform),
            "face sector should carry more pins ({} vs {})",
            in_sector(&biased),
            in_sector(&uniform),
        );
    }

    #[test]
    fn face_bias_keeps_dense_perimeter_indexing() {
        let face = FaceBox {
            x: 10.0,
            y: 10.0,
            width: 60.0,
            height: 60.0,
        };
        let pins = place_pins(FrameType::Circular, 150, 200, 200, Some(&face));
        for (i, p) in pins.iter().enumerate() {
            assert_eq!(p.index, i as u32, "indices must be dense after merge");
        }
    }
}
