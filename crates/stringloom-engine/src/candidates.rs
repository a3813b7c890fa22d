//! Candidate end-pin generation.
//!
//! For the current pin, produces an ordered shortlist of end pins:
//! the best edge-aligned pins first, topped up with a true uniform
//! sample of the remaining valid pool so the optimizer never starves
//! on images whose edges mislead the alignment heuristic.

use rand::seq::index::sample;
use rand_pcg::Pcg32;

use crate::edges::EdgePlanes;
use crate::faces::{Region, RegionMask};
use crate::pins::circular_distance;
use crate::score::edge_alignment;
use crate::types::{Pin, QualityPreset};

/// Edge-guided shortlist size by preset.
const fn k_edge(preset: QualityPreset) -> usize {
    match preset {
        QualityPreset::Fast | QualityPreset::Balanced => 25,
        QualityPreset::High => 35,
    }
}

/// Random complement size by preset.
const fn k_random(preset: QualityPreset) -> usize {
    match preset {
        QualityPreset::Fast | QualityPreset::Balanced => 10,
        QualityPreset::High => 15,
    }
}

/// Whether a pin pair is valid during a stage.
///
/// The stage's min-skip seed raises the body/background policies but
/// never the face floor, so faces keep fine detail even in the
/// long-thread structure stage.
#[must_use]
pub fn stage_pair_allowed(
    regions: &RegionMask,
    pins: &[Pin],
    a: u32,
    b: u32,
    stage_min_skip: u32,
) -> bool {
    if a == b {
        return false;
    }
    let count = pins.len() as u32;
    let (pa, pb) = (&pins[a as usize], &pins[b as usize]);
    let mut required = regions.effective_min_skip(pa, pb, count);
    let face_involved = regions.region_of_pin(pa) == Region::Face
        || regions.region_of_pin(pb) == Region::Face;
    if !face_involved {
        required = required.max(stage_min_skip).min((count / 2).max(1));
    }
    circular_distance(a, b, count) >= required
}

/// Generate up to `k_edge + k_random` candidate end pins for `from`.
///
/// With edge guidance enabled, every valid pin is ranked by
/// [`edge_alignment`] and the top `K_edge` survive; `K_rand` more pins
/// are then drawn uniformly (Fisher–Yates partial sample) from the
/// remaining valid pool. With edge guidance disabled, the whole
/// shortlist is a uniform sample.
#[must_use]
pub fn generate_candidates(
    rng: &mut Pcg32,
    edges: &EdgePlanes,
    regions: &RegionMask,
    pins: &[Pin],
    from: u32,
    stage_min_skip: u32,
    preset: QualityPreset,
    use_edges: bool,
) -> Vec<u32> {
    let valid: Vec<u32> = (0..pins.len() as u32)
        .filter(|&b| stage_pair_allowed(regions, pins, from, b, stage_min_skip))
        .collect();
    if valid.is_empty() {
        return Vec::new();
    }

    let n_edge = k_edge(preset);
    let n_rand = k_random(preset);

    if !use_edges {
        let amount = (n_edge + n_rand).min(valid.len());
        return sample(rng, valid.len(), amount)
            .into_iter()
            .map(|i| valid[i])
            .collect();
    }

    let mut ranked: Vec<(u32, f64)> = valid
        .iter()
        .map(|&b| {
            let score = edge_alignment(edges, &pins[from as usize], &pins[b as usize]);
            (b, score)
        })
        .collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut shortlist: Vec<u32> = ranked.iter().take(n_edge).map(|&(b, _)| b).collect();

    let rest: Vec<u32> = ranked.iter().skip(n_edge).map(|&(b, _)| b).collect();
    if !rest.is_empty() {
        let amount = n_rand.min(rest.len());
        shortlist.extend(sample(rng, rest.len(), amount).into_iter().map(|i| rest[i]));
    }

    shortlist
}

/// Uniform random valid end pin, the degenerate-input fallback.
///
/// Returns `None` only when no valid pin exists at all, in which case
/// the driver skips the thread rather than deadlocking.
#[must_use]
pub fn fallback_pin(
    rng: &mut Pcg32,
    regions: &RegionMask,
    pins: &[Pin],
    from: u32,
    stage_min_skip: u32,
) -> Option<u32> {
    let valid: Vec<u32> = (0..pins.len() as u32)
        .filter(|&b| stage_pair_allowed(regions, pins, from, b, stage_min_skip))
        .collect();
    if valid.is_empty() {
        return None;
    }
    let pick = sample(rng, valid.len(), 1).index(0);
    Some(valid[pick])
}
