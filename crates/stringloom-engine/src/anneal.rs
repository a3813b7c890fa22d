//! Optional post-passes: simulated annealing, genetic refinement, and
//! tail backtracking.
//!
//! All three operate on the monochrome canvas only. Annealing proposes
//! random junction moves under a cooling Metropolis schedule; the
//! genetic pass evolves a small population of winding variants against
//! a rebuilt-canvas MSE fitness; backtracking trims a suffix of
//! no-longer-helpful threads. Reverse-composite drift introduced here
//! is repaired by the result assembler's final replay.

use log::debug;
use rand::Rng;
use rand_pcg::Pcg32;

use crate::candidates::stage_pair_allowed;
use crate::composite;
use crate::driver::mono_ctx;
use crate::result::global_mse_ssim;
use crate::score::perceptual_line_score;
use crate::state::{palette_entry, ProgressState};
use crate::types::{GenerationParams, ThreadConnection};

/// Annealing start temperature.
const START_TEMPERATURE: f64 = 150.0;
/// Multiplicative cooling per iteration.
const COOLING: f64 = 0.97;

/// Genetic population size.
const POPULATION: usize = 10;
/// Survivors kept each generation.
const SURVIVORS: usize = 5;
/// Per-thread mutation probability.
const MUTATION_RATE: f64 = 0.15;
/// Generations to run.
const GENERATIONS: usize = 30;

/// Threads inspected by tail backtracking.
const BACKTRACK_WINDOW: usize = 100;
/// SSIM improvement required to keep a thread removed.
const BACKTRACK_MIN_GAIN: f64 = 0.001;

/// Simulated annealing over junction moves.
///
/// Runs `min(0.2 N, 1000)` iterations with temperature starting at 150
/// and cooling by 0.97 per iteration. Each iteration reverts a random
/// connection (and its successor, which shares the moved junction),
/// scores the current junction against one random valid alternative,
/// and accepts the swap with probability `min(1, exp(delta / T))`.
pub fn simulated_annealing(state: &mut ProgressState, params: &GenerationParams, rng: &mut Pcg32) {
    if state.progress_rgb.is_some() || state.connections.len() < 2 {
        return;
    }
    let iterations = ((params.max_threads as f64 * 0.2) as u32).min(1000);
    let mut temperature = START_TEMPERATURE;
    let mut accepted = 0_u32;

    for _ in 0..iterations {
        let k = rng.random_range(0..state.connections.len());
        let has_successor = k + 1 < state.connections.len();
        let anchor_a = state.connections[k].from_pin;
        let anchor_b = has_successor.then(|| state.connections[k + 1].to_pin);
        let current = state.connections[k].to_pin;

        let Some(proposal) = random_junction(state, params, rng, anchor_a, anchor_b, current)
        else {
            temperature *= COOLING;
            continue;
        };

        if has_successor {
            state.revert_connection(k + 1);
        }
        state.revert_connection(k);

        let current_score = junction_score(state, params, k, anchor_a, anchor_b, current);
        let proposal_score = junction_score(state, params, k, anchor_a, anchor_b, proposal);
        let delta = proposal_score - current_score;
        let accept = delta > 0.0 || rng.random::<f64>() < (delta / temperature).exp();

        let junction = if accept { proposal } else { current };
        if accept {
            accepted += 1;
        }
        state.connections[k].to_pin = junction;
        if has_successor {
            state.connections[k + 1].from_pin = junction;
        }
        state.reapply_connection(k);
        if has_successor {
            state.reapply_connection(k + 1);
        } else {
            state.current_pin = junction;
        }

        temperature *= COOLING;
    }
    debug!("annealing: {accepted}/{iterations} proposals accepted");
}

/// One uniformly random valid junction pin different from `current`.
fn random_junction(
    state: &ProgressState,
    params: &GenerationParams,
    rng: &mut Pcg32,
    anchor_a: u32,
    anchor_b: Option<u32>,
    current: u32,
) -> Option<u32> {
    let valid: Vec<u32> = (0..state.pin_count())
        .filter(|&p| {
            p != current
                && stage_pair_allowed(&state.regions, &state.pins, anchor_a, p, params.min_pin_skip)
                && anchor_b.is_none_or(|b| {
                    stage_pair_allowed(&state.regions, &state.pins, p, b, params.min_pin_skip)
                })
        })
        .collect();
    if valid.is_empty() {
        None
    } else {
        Some(valid[rng.random_range(0..valid.len())])
    }
}

/// Combined perceptual score of the one or two lines meeting at a
/// junction, evaluated on the (reverted) canvas.
fn junction_score(
    state: &mut ProgressState,
    params: &GenerationParams,
    k: usize,
    anchor_a: u32,
    anchor_b: Option<u32>,
    junction: u32,
) -> f64 {
    let alpha_first = state.applied_alpha[k];
    let r1 = state.line(anchor_a, junction);
    let r2 = anchor_b.map(|b| (state.line(junction, b), state.applied_alpha[k + 1]));

    let ctx = mono_ctx(state, params);
    let mut score = perceptual_line_score(&ctx, &r1, anchor_a, junction, alpha_first);
    if let (Some((r2, alpha2)), Some(b)) = (r2, anchor_b) {
        score += perceptual_line_score(&ctx, &r2, junction, b, alpha2);
    }
    score
}

/// Genetic refinement of the full winding.
///
/// Evolves [`POPULATION`] variants of the connection log for
/// [`GENERATIONS`] generations. Fitness is `1e6 / (MSE + 1)` where MSE
/// is measured against a canvas rebuilt from the variant's connections.
/// Survivors persist unchanged; the rest are bred by one-point
/// crossover (with a continuity repair at the cut) and per-thread
/// junction mutation. The fittest variant replaces the winding and the
/// working canvas is rebuilt from it.
pub fn genetic_refinement(state: &mut ProgressState, params: &GenerationParams, rng: &mut Pcg32) {
    if state.progress_rgb.is_some() || state.connections.len() < 4 {
        return;
    }

    let mut population: Vec<Vec<ThreadConnection>> = Vec::with_capacity(POPULATION);
    population.push(state.connections.clone());
    while population.len() < POPULATION {
        let mut variant = state.connections.clone();
        mutate(state, params, rng, &mut variant);
        population.push(variant);
    }

    for generation in 0..GENERATIONS {
        let mut ranked: Vec<(f64, Vec<ThreadConnection>)> = population
            .drain(..)
            .map(|variant| (fitness(state, &variant), variant))
            .collect();
        ranked.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        if generation == GENERATIONS - 1 {
            population = ranked.into_iter().map(|(_, v)| v).collect();
            break;
        }

        let survivors: Vec<Vec<ThreadConnection>> = ranked
            .iter()
            .take(SURVIVORS)
            .map(|(_, v)| v.clone())
            .collect();
        population = survivors.clone();
        while population.len() < POPULATION {
            let a = &survivors[rng.random_range(0..survivors.len())];
            let b = &survivors[rng.random_range(0..survivors.len())];
            let mut child = crossover(rng, a, b);
            // The continuity repair at the cut can leave a degenerate
            // or skip-violating pair; such a child is discarded in
            // favor of a fresh mutant of the first parent.
            if !winding_valid(state, params, &child) {
                child = a.clone();
            }
            mutate(state, params, rng, &mut child);
            population.push(child);
        }
    }

    let fittest = population.swap_remove(0);
    debug!(
        "genetic refinement: adopting variant with fitness {:.3}",
        fitness(state, &fittest),
    );
    state.connections = fittest;
    rebuild_canvas(state);
}

/// `1e6 / (MSE + 1)` against a canvas rebuilt from the variant.
fn fitness(state: &mut ProgressState, variant: &[ThreadConnection]) -> f64 {
    let n = (state.edge * state.edge) as usize;
    let mut canvas = vec![255_u8; n];
    let mut density = vec![0.0_f32; n];
    let mut overdraw = vec![0_u16; n];
    let alphas = state.applied_alpha.clone();
    for (c, &alpha) in variant.iter().zip(alphas.iter()) {
        let px = state.line(c.from_pin, c.to_pin);
        composite::forward_mono(&mut canvas, &mut density, &mut overdraw, &px, alpha);
    }
    let (mse, _) = global_mse_ssim(state.target_gray.as_raw(), &canvas);
    1.0e6 / (mse + 1.0)
}

/// Whether every pair in a variant satisfies the min-skip rule.
fn winding_valid(
    state: &ProgressState,
    params: &GenerationParams,
    variant: &[ThreadConnection],
) -> bool {
    variant.iter().all(|c| {
        stage_pair_allowed(
            &state.regions,
            &state.pins,
            c.from_pin,
            c.to_pin,
            params.min_pin_skip,
        )
    })
}

/// One-point crossover with a continuity repair at the cut: the first
/// connection taken from `b` is re-anchored to the junction it now
/// follows.
fn crossover(
    rng: &mut Pcg32,
    a: &[ThreadConnection],
    b: &[ThreadConnection],
) -> Vec<ThreadConnection> {
    let cut = rng.random_range(1..a.len().min(b.len()));
    let mut child: Vec<ThreadConnection> = a[..cut].to_vec();
    let mut tail: Vec<ThreadConnection> = b[cut..].to_vec();
    if let (Some(last), Some(first)) = (child.last(), tail.first_mut()) {
        first.from_pin = last.to_pin;
    }
    child.append(&mut tail);
    child
}

/// Mutate junctions at [`MUTATION_RATE`], repairing the successor's
/// anchor so the winding stays continuous.
fn mutate(
    state: &ProgressState,
    params: &GenerationParams,
    rng: &mut Pcg32,
    variant: &mut [ThreadConnection],
) {
    for k in 0..variant.len() {
        if rng.random::<f64>() >= MUTATION_RATE {
            continue;
        }
        let anchor_a = variant[k].from_pin;
        let anchor_b = (k + 1 < variant.len()).then(|| variant[k + 1].to_pin);
        let current = variant[k].to_pin;
        let valid: Vec<u32> = (0..state.pin_count())
            .filter(|&p| {
                stage_pair_allowed(&state.regions, &state.pins, anchor_a, p, params.min_pin_skip)
                    && anchor_b.is_none_or(|bb| {
                        stage_pair_allowed(&state.regions, &state.pins, p, bb, params.min_pin_skip)
                    })
            })
            .collect();
        if valid.is_empty() {
            continue;
        }
        let junction = valid[rng.random_range(0..valid.len())];
        variant[k].to_pin = junction;
        if k + 1 < variant.len() {
            variant[k + 1].from_pin = junction;
        }
    }
}

/// Rebuild every mutable plane from the connection log.
///
/// Used after the genetic pass adopts a new winding, and cheap enough
/// to serve as the general drift repair.
pub fn rebuild_canvas(state: &mut ProgressState) {
    let n = (state.edge * state.edge) as usize;
    state.progress_gray = image::GrayImage::from_pixel(state.edge, state.edge, image::Luma([255]));
    if state.progress_rgb.is_some() {
        state.progress_rgb = Some(image::RgbImage::from_pixel(
            state.edge,
            state.edge,
            image::Rgb([255, 255, 255]),
        ));
    }
    state.density = vec![0.0; n];
    state.overdraw = vec![0; n];
    state.pin_usage = vec![0; state.pins.len()];

    let log: Vec<(ThreadConnection, f32)> = state
        .connections
        .iter()
        .cloned()
        .zip(state.applied_alpha.iter().copied())
        .collect();
    for (c, alpha) in &log {
        let px = state.line(c.from_pin, c.to_pin);
        let color = palette_entry(&c.color_hex);
        state.composite_forward(&px, &color, *alpha);
        state.pin_usage[c.from_pin as usize] += 1;
        state.pin_usage[c.to_pin as usize] += 1;
    }
    state.current_pin = state.connections.last().map_or(0, |c| c.to_pin);
    state.refresh_pyramid();
}

/// Tail backtracking: walk the last [`BACKTRACK_WINDOW`] connections
/// from the end, removing each while removal improves whole-image SSIM
/// by at least [`BACKTRACK_MIN_GAIN`]. Stops at the first keeper so
/// only a contiguous suffix is ever removed and the winding stays
/// continuous.
pub fn backtrack(state: &mut ProgressState) -> u32 {
    if state.progress_rgb.is_some() {
        return 0;
    }
    let mut removed = 0_u32;

    for _ in 0..BACKTRACK_WINDOW {
        if state.connections.is_empty() {
            break;
        }
        let k = state.connections.len() - 1;
        let (_, ssim_with) =
            global_mse_ssim(state.target_gray.as_raw(), state.progress_gray.as_raw());

        state.revert_connection(k);
        let (_, ssim_without) =
            global_mse_ssim(state.target_gray.as_raw(), state.progress_gray.as_raw());

        if ssim_without - ssim_with >= BACKTRACK_MIN_GAIN {
            state.connections.pop();
            state.applied_alpha.pop();
            state.current_pin = state.connections.last().map_or(0, |c| c.to_pin);
            removed += 1;
        } else {
            // Restore and stop: anything earlier is load-bearing.
            state.reapply_connection(k);
            break;
        }
    }
    if removed > 0 {
        debug!("backtracking removed {removed} tail threads");
    }
    removed
}
