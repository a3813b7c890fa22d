//! Line rasterization and the per-job line cache.
//!
//! Scoring touches the same pin-pair pixel runs thousands of times, so
//! rasterized lines are memoized under `(min_pin, max_pin, width_px)`.
//! The cache is purely a memo: a miss only costs time, never changes
//! output. Entries are `Arc`-shared so the candidate-scoring fan-out
//! can hold them without cloning pixel lists.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use crate::types::Pin;

/// Rasterize the Bresenham line between two pin coordinates, optionally
/// thickened perpendicular to the line.
///
/// Core Bresenham pixels are always present and appear in travel order
/// (the smoothness term walks this sequence). A thickness of `w` adds
/// perpendicular offsets up to `(w - 1) / 2` on each side, emitted
/// adjacent to their core pixel. Out-of-bounds offsets are dropped;
/// duplicates are emitted once.
#[must_use]
pub fn line_pixels(
    from: (u16, u16),
    to: (u16, u16),
    width_px: u32,
    canvas_w: u32,
    canvas_h: u32,
) -> Vec<usize> {
    let (x0, y0) = (i64::from(from.0), i64::from(from.1));
    let (x1, y1) = (i64::from(to.0), i64::from(to.1));

    let dx = (x1 - x0).abs();
    let dy = -(y1 - y0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let sy = if y0 < y1 { 1 } else { -1 };

    // Unit perpendicular for thickness offsets.
    let len = ((x1 - x0) as f64).hypot((y1 - y0) as f64);
    let (px, py) = if len > 0.0 {
        (-((y1 - y0) as f64) / len, (x1 - x0) as f64 / len)
    } else {
        (0.0, 0.0)
    };
    let half = (width_px.saturating_sub(1) / 2) as i64;

    let mut pixels = Vec::new();
    let mut seen = HashSet::new();
    let mut push = |x: i64, y: i64| {
        if x >= 0 && y >= 0 && x < i64::from(canvas_w) && y < i64::from(canvas_h) {
            let idx = (y * i64::from(canvas_w) + x) as usize;
            if seen.insert(idx) {
                pixels.push(idx);
            }
        }
    };

    let (mut x, mut y) = (x0, y0);
    let mut err = dx + dy;
    loop {
        push(x, y);
        for t in 1..=half {
            let ox = (px * t as f64).round() as i64;
            let oy = (py * t as f64).round() as i64;
            push(x + ox, y + oy);
            push(x - ox, y - oy);
        }
        if x == x1 && y == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x += sx;
        }
        if e2 <= dx {
            err += dx;
            y += sy;
        }
    }

    pixels
}

/// Memo cache for rasterized pin-pair lines.
///
/// Keys are direction-normalized (`min(a, b)`, `max(a, b)`), which is
/// sound because every scoring term over a pixel run is symmetric under
/// reversal. Entry count is bounded by `pin_count * (pin_count - 1) / 2`
/// per thickness; [`clear`](Self::clear) may be called at any
/// checkpoint to bound memory without affecting output.
#[derive(Debug, Default)]
pub struct LineCache {
    entries: HashMap<(u32, u32, u32), Arc<Vec<usize>>>,
}

impl LineCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the pixel run for a pin pair, rasterizing on miss.
    pub fn get_or_rasterize(
        &mut self,
        a: &Pin,
        b: &Pin,
        width_px: u32,
        canvas_w: u32,
        canvas_h: u32,
    ) -> Arc<Vec<usize>> {
        let key = (a.index.min(b.index), a.index.max(b.index), width_px);
        if let Some(hit) = self.entries.get(&key) {
            return Arc::clone(hit);
        }
        // Rasterize in normalized direction so both orientations share
        // one entry.
        let (lo, hi) = if a.index <= b.index { (a, b) } else { (b, a) };
        let pixels = Arc::new(line_pixels(
            (lo.x, lo.y),
            (hi.x, hi.y),
            width_px,
            canvas_w,
            canvas_h,
        ));
        self.entries.insert(key, Arc::clone(&pixels));
        pixels
    }

    /// Number of memoized lines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop all entries. Purely a memory bound; subsequent lookups
    /// re-rasterize.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pin(index: u32, x: u16, y: u16) -> Pin {
        Pin { index, x, y }
    }

    #[test]
    fn horizontal_line_covers_every_column() {
        let px = line_pixels((2, 5), (9, 5), 1, 16, 16);
        assert_eq!(px.len(), 8);
        for (i, &p) in px.iter().enumerate() {
            assert_eq!(p, 5 * 16 + 2 + i);
        }
    }

    #[test]
    fn endpoints_are_included() {
        let px = line_pixels((1, 1), (10, 7), 1, 16, 16);
        assert_eq!(px[0], 16 + 1);
        assert_eq!(*px.last().unwrap(), 7 * 16 + 10);
    }

    #[test]
    fn degenerate_line_is_one_pixel() {
        let px = line_pixels((4, 4), (4, 4), 1, 16, 16);
        assert_eq!(px, vec![4 * 16 + 4]);
    }

    #[test]
    fn diagonal_line_has_expected_length() {
        let px = line_pixels((0, 0), (9, 9), 1, 16, 16);
        assert_eq!(px.len(), 10);
    }

    #[test]
    fn thickness_widens_the_run() {
        let thin = line_pixels((2, 8), (13, 8), 1, 16, 16);
        let thick = line_pixels((2, 8), (13, 8), 3, 16, 16);
        // Width 3 = core row plus one row each side.
        assert_eq!(thick.len(), thin.len() * 3);
        assert!(thick.contains(&(7 * 16 + 5)));
        assert!(thick.contains(&(9 * 16 + 5)));
    }

    #[test]
    fn even_widths_round_down() {
        // Width 2 has half = 0: same pixels as width 1.
        let w1 = line_pixels((0, 0), (10, 3), 1, 16, 16);
        let w2 = line_pixels((0, 0), (10, 3), 2, 16, 16);
        assert_eq!(w1, w2);
    }

    #[test]
    fn out_of_bounds_offsets_are_dropped() {
        // A line along the top row with thickness cannot write above
        // row zero.
        let px = line_pixels((0, 0), (15, 0), 5, 16, 16);
        assert!(px.iter().all(|&p| p < 16 * 16));
    }

    #[test]
    fn no_duplicate_pixels() {
        let px = line_pixels((0, 0), (15, 11), 5, 16, 16);
        let mut sorted = px.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), px.len());
    }

    #[test]
    fn cache_is_direction_insensitive() {
        let mut cache = LineCache::new();
        let a = pin(3, 1, 1);
        let b = pin(9, 12, 7);
        let fwd = cache.get_or_rasterize(&a, &b, 1, 16, 16);
        let rev = cache.get_or_rasterize(&b, &a, 1, 16, 16);
        assert!(Arc::ptr_eq(&fwd, &rev), "both orientations share one entry");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn cache_distinguishes_thickness() {
        let mut cache = LineCache::new();
        let a = pin(0, 0, 0);
        let b = pin(5, 10, 10);
        let _ = cache.get_or_rasterize(&a, &b, 1, 16, 16);
        let _ = cache.get_or_rasterize(&a, &b, 3, 16, 16);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn clear_only_costs_recomputation() {
        let mut cache = LineCache::new();
        let a = pin(0, 2, 3);
        let b = pin(7, 11, 13);
        let before = cache.get_or_rasterize(&a, &b, 1, 16, 16);
        cache.clear();
        assert!(cache.is_empty());
        let after = cache.get_or_rasterize(&a, &b, 1, 16, 16);
        assert_eq!(*before, *after, "absence never changes output");
    }
}
