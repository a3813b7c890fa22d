//! Local refinement: replace the worst-scoring threads.
//!
//! After greedy generation, every connection is rescored at its placed
//! position against the current canvas; the lowest decile (capped at
//! 300) gets a replacement attempt. A replacement is a *junction move*:
//! the pin shared by a connection and its neighbour is the free
//! variable, both affected lines are reverted, the candidate junctions
//! are scored, and the best is re-composited in place. Moving the
//! junction (rather than an isolated endpoint) is what keeps the
//! winding physically continuous.
//!
//! Refinement is skipped in LAB-color mode, whose per-thread loop
//! already evaluated all four palette colors per candidate.

use std::sync::Arc;

use log::debug;
use rand::seq::index::sample;
use rand_pcg::Pcg32;
use rayon::prelude::*;

use crate::candidates::stage_pair_allowed;
use crate::driver::mono_ctx;
use crate::score::perceptual_line_score;
use crate::state::{palette_entry, ProgressState};
use crate::types::GenerationParams;

/// Fraction of connections eligible for replacement.
const WORST_FRACTION: f64 = 0.10;
/// Hard cap on replacement attempts.
const MAX_ATTEMPTS: usize = 300;
/// Candidate junction pins examined per attempt.
const MAX_CANDIDATES: usize = 50;

/// Rescore every placed connection and attempt to replace the lowest
/// decile. Returns the number of genuine replacements (junction
/// actually moved), which the caller reports through progress.
pub fn refine(state: &mut ProgressState, params: &GenerationParams, rng: &mut Pcg32) -> u32 {
    if state.progress_rgb.is_some() || state.connections.len() < 2 {
        return 0;
    }

    // Score every connection in context on the current canvas.
    let scores: Vec<(usize, f64)> = {
        let runs: Vec<(usize, Arc<Vec<usize>>)> = (0..state.connections.len())
            .map(|k| {
                let c = state.connections[k].clone();
                (k, state.line(c.from_pin, c.to_pin))
            })
            .collect();
        let ctx = mono_ctx(state, params);
        let mut scored: Vec<(usize, f64)> = runs
            .par_iter()
            .map(|(k, px)| {
                let c = &state.connections[*k];
                let alpha = state.applied_alpha[*k];
                (
                    *k,
                    perceptual_line_score(&ctx, px, c.from_pin, c.to_pin, alpha),
                )
            })
            .collect();
        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        scored
    };

    let take = ((state.connections.len() as f64 * WORST_FRACTION).ceil() as usize)
        .min(MAX_ATTEMPTS)
        .min(scores.len());

    let mut replaced = 0_u32;
    for &(k, _) in scores.iter().take(take) {
        if try_move_junction(state, params, rng, k, JunctionSide::To) {
            replaced += 1;
        } else if k > 0 && try_move_junction(state, params, rng, k, JunctionSide::From) {
            replaced += 1;
        }
    }

    debug!(
        "refinement: {} attempts, {} genuine replacements",
        take, replaced,
    );
    replaced
}

/// Which junction of connection `k` to move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JunctionSide {
    /// The pin shared with connection `k + 1` (or the free tail end).
    To,
    /// The pin shared with connection `k - 1`.
    From,
}

/// Attempt one junction move. Returns `true` when the junction pin
/// actually changed.
fn try_move_junction(
    state: &mut ProgressState,
    params: &GenerationParams,
    rng: &mut Pcg32,
    k: usize,
    side: JunctionSide,
) -> bool {
    // Identify the one or two connections sharing the junction.
    let (first, second) = match side {
        JunctionSide::To => {
            if k + 1 < state.connections.len() {
                (k, Some(k + 1))
            } else {
                (k, None)
            }
        }
        JunctionSide::From => (k - 1, Some(k)),
    };
    let current_junction = state.connections[first].to_pin;

    // The junction's fixed outer anchors.
    let anchor_a = state.connections[first].from_pin;
    let anchor_b = second.map(|s| state.connections[s].to_pin);

    let candidates = junction_candidates(state, params, rng, anchor_a, anchor_b, current_junction);
    if candidates.is_empty() {
        return false;
    }

    // Revert the affected composites (later connection first, matching
    // reverse order of application).
    if let Some(s) = second {
        state.revert_connection(s);
    }
    state.revert_connection(first);

    // Rasterize candidate runs, then score read-only.
    let alpha_first = state.applied_alpha[first];
    let alpha_second = second.map(|s| state.applied_alpha[s]);
    let runs: Vec<(u32, Arc<Vec<usize>>, Option<Arc<Vec<usize>>>)> = candidates
        .iter()
        .map(|&p| {
            let r1 = state.line(anchor_a, p);
            let r2 = anchor_b.map(|b| state.line(p, b));
            (p, r1, r2)
        })
        .collect();

    let best = {
        let ctx = mono_ctx(state, params);
        // Collect in candidate order before reducing so tied scores
        // resolve deterministically.
        let scored: Vec<(u32, f64)> = runs
            .par_iter()
            .map(|(p, r1, r2)| {
                let mut score = perceptual_line_score(&ctx, r1, anchor_a, *p, alpha_first);
                if let (Some(r2), Some(b), Some(alpha2)) = (r2, anchor_b, alpha_second) {
                    score += perceptual_line_score(&ctx, r2, *p, b, alpha2);
                }
                (*p, score)
            })
            .collect();
        scored
            .into_iter()
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
    };

    let new_junction = best.map_or(current_junction, |(p, _)| p);

    // Rewrite the log in place, then re-composite.
    state.connections[first].to_pin = new_junction;
    if let Some(s) = second {
        state.connections[s].from_pin = new_junction;
    }
    state.reapply_connection(first);
    if let Some(s) = second {
        state.reapply_connection(s);
    }
    if second.is_none() {
        // The tail junction is the winding's cursor.
        state.current_pin = new_junction;
    }

    new_junction != current_junction
}

/// Valid junction pins for the given anchors, capped at
/// [`MAX_CANDIDATES`] by uniform sampling. Always includes the current
/// junction so a move is never forced.
fn junction_candidates(
    state: &ProgressState,
    params: &GenerationParams,
    rng: &mut Pcg32,
    anchor_a: u32,
    anchor_b: Option<u32>,
    current: u32,
) -> Vec<u32> {
    let pins = &state.pins;
    let skip = params.min_pin_skip;
    let valid: Vec<u32> = (0..state.pin_count())
        .filter(|&p| {
            stage_pair_allowed(&state.regions, pins, anchor_a, p, skip)
                && anchor_b.is_none_or(|b| stage_pair_allowed(&state.regions, pins, p, b, skip))
        })
        .collect();

    let mut picked: Vec<u32> = if valid.len() > MAX_CANDIDATES {
        sample(rng, valid.len(), MAX_CANDIDATES)
            .into_iter()
            .map(|i| valid[i])
            .collect()
    } else {
        valid
    };
    if !picked.contains(&current)
        && stage_pair_allowed(&state.regions, pins, anchor_a, current, skip)
    {
        picked.push(current);
    }
    picked
}
