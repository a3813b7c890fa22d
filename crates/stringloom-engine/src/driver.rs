//! The coarse-to-fine greedy stage driver.
//!
//! High-quality and color runs walk three stages (structure, mid
//! detail, fine detail) over one shared canvas: long threads with a
//! raised min-skip and boosted opacity first, then progressively finer
//! ones. Fast and balanced presets run a single pass with uniform
//! opacity. Each thread is chosen by fanning the candidate shortlist
//! across a worker pool — scoring is read-only against shared state —
//! and applying the single best candidate.
//!
//! Between threads the driver polls the cancellation flag, refreshes
//! the pyramid mirrors, and emits progress snapshots on their
//! respective cadences.

use std::sync::Arc;

use log::debug;
use rand_pcg::Pcg32;
use rayon::prelude::*;

use crate::candidates::{fallback_pin, generate_candidates};
use crate::color::{
    score_lab_line, LabScoreInputs, LabScoreUsage, ThreadColor, BLACK, PALETTE,
};
use crate::progress::{CancelFlag, ProgressSnapshot};
use crate::score::{multires_line_score, ScoreContext, REJECT};
use crate::state::ProgressState;
use crate::types::{ColorMode, EngineError, GenerationParams, QualityPreset};

/// One stage of the schedule.
#[derive(Debug, Clone)]
pub struct StagePlan {
    /// Label reported through progress snapshots.
    pub label: &'static str,
    /// Threads this stage places.
    pub thread_count: u32,
    /// Stage min-skip seed (raises non-face region policies).
    pub min_skip: u32,
    /// Composite opacity for this stage's threads.
    pub alpha: f32,
}

/// Build the stage schedule for a job.
///
/// Three-stage coarse-to-fine for the high preset and for color mode;
/// a single uniform pass otherwise.
#[must_use]
pub fn stage_plans(params: &GenerationParams, pin_count: u32) -> Vec<StagePlan> {
    let n = params.max_threads;
    let base_skip = params.min_pin_skip;
    let opacity = params.thread_opacity;

    let staged =
        params.quality_preset == QualityPreset::High || params.color_mode == ColorMode::Color;
    if !staged {
        return vec![StagePlan {
            label: "greedy",
            thread_count: n,
            min_skip: base_skip,
            alpha: opacity as f32,
        }];
    }

    let structure = (f64::from(n) * 0.25).round() as u32;
    let mid = (f64::from(n) * 0.35).round() as u32;
    let fine = n.saturating_sub(structure + mid);

    vec![
        StagePlan {
            label: "structure",
            thread_count: structure,
            min_skip: base_skip.max(pin_count / 6),
            alpha: (opacity * 1.3).min(0.5) as f32,
        },
        StagePlan {
            label: "mid detail",
            thread_count: mid,
            min_skip: base_skip.max(pin_count / 15),
            alpha: (opacity * 1.1).min(0.5) as f32,
        },
        StagePlan {
            label: "fine detail",
            thread_count: fine,
            min_skip: base_skip,
            alpha: (opacity * 0.8) as f32,
        },
    ]
}

/// Thread budget of the post-stage face refinement pass.
#[must_use]
pub fn face_pass_budget(max_threads: u32) -> u32 {
    (max_threads / 5).min(2000)
}

/// Run every stage (plus the face refinement pass when a face is
/// active) against the given state.
///
/// # Errors
///
/// Returns [`EngineError::Cancelled`] when the cancellation flag is
/// observed; the state is abandoned by the caller in that case.
pub fn drive(
    state: &mut ProgressState,
    params: &GenerationParams,
    rng: &mut Pcg32,
    on_progress: &(dyn Fn(ProgressSnapshot) + Sync),
    cancel: &CancelFlag,
) -> Result<(), EngineError> {
    let plans = stage_plans(params, state.pin_count());
    let face_budget = if state.regions.has_face() {
        face_pass_budget(params.max_threads)
    } else {
        0
    };
    let total_planned = params.max_threads + face_budget;

    let start_len = state.connections.len() as u32;
    let refresh_every = (params.max_threads / 150).max(1);
    let snapshot_every = (params.max_threads / 100).max(1);

    let mut exec = StageExec {
        params,
        on_progress,
        cancel,
        total_planned,
        start_len,
        refresh_every,
        snapshot_every,
        color_usage: initial_color_usage(state),
    };

    for plan in &plans {
        run_stage(state, &mut exec, rng, plan, FaceBias::Off)?;
        state.refresh_pyramid();
        state.bound_line_cache();
        emit_stage_end(state, &exec, plan.label);
    }

    if face_budget > 0 {
        let face_plan = StagePlan {
            label: "face refinement",
            thread_count: face_budget,
            min_skip: params.min_pin_skip,
            alpha: (params.thread_opacity * 0.7) as f32,
        };
        run_stage(state, &mut exec, rng, &face_plan, FaceBias::On)?;
        state.refresh_pyramid();
        emit_stage_end(state, &exec, face_plan.label);
    }

    Ok(())
}

/// Run one extension pass (continue-mode): a single greedy stage with
/// uniform opacity, reusing the shared cadence bookkeeping.
///
/// # Errors
///
/// Returns [`EngineError::Cancelled`] when the cancellation flag is
/// observed.
pub fn drive_extension(
    state: &mut ProgressState,
    params: &GenerationParams,
    additional: u32,
    rng: &mut Pcg32,
    on_progress: &(dyn Fn(ProgressSnapshot) + Sync),
    cancel: &CancelFlag,
) -> Result<(), EngineError> {
    let start_len = state.connections.len() as u32;
    let mut exec = StageExec {
        params,
        on_progress,
        cancel,
        total_planned: additional,
        start_len,
        refresh_every: (additional / 150).max(1),
        snapshot_every: (additional / 100).max(1),
        color_usage: initial_color_usage(state),
    };
    let plan = StagePlan {
        label: "continue",
        thread_count: additional,
        min_skip: params.min_pin_skip,
        alpha: params.thread_opacity as f32,
    };
    run_stage(state, &mut exec, rng, &plan, FaceBias::Off)?;
    state.refresh_pyramid();
    emit_stage_end(state, &exec, plan.label);
    Ok(())
}

/// Whether candidate selection is biased toward face-crossing lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FaceBias {
    Off,
    /// Prefer candidates whose midpoint pixel lies in the face mask
    /// and boost their scores by 1.5x.
    On,
}

/// Shared per-drive bookkeeping.
struct StageExec<'a> {
    params: &'a GenerationParams,
    on_progress: &'a (dyn Fn(ProgressSnapshot) + Sync),
    cancel: &'a CancelFlag,
    total_planned: u32,
    start_len: u32,
    refresh_every: u32,
    snapshot_every: u32,
    color_usage: [u32; PALETTE.len()],
}

fn initial_color_usage(state: &ProgressState) -> [u32; PALETTE.len()] {
    let mut usage = [0_u32; PALETTE.len()];
    for c in &state.connections {
        if let Some(i) = PALETTE.iter().position(|p| p.hex == c.color_hex) {
            usage[i] += 1;
        }
    }
    usage
}

fn run_stage(
    state: &mut ProgressState,
    exec: &mut StageExec<'_>,
    rng: &mut Pcg32,
    plan: &StagePlan,
    bias: FaceBias,
) -> Result<(), EngineError> {
    debug!(
        "stage `{}`: {} threads, min_skip {}, alpha {:.3}",
        plan.label, plan.thread_count, plan.min_skip, plan.alpha,
    );
    let mut accepted_score_sum = 0.0_f64;
    let mut placed_in_stage = 0_u32;

    for _ in 0..plan.thread_count {
        if exec.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        match place_one(state, exec, rng, plan, bias) {
            Some(score) => {
                accepted_score_sum += score;
                placed_in_stage += 1;
            }
            // No valid end pin exists from the current pin at this
            // stage's skip; nothing can change, so the stage ends
            // rather than spinning.
            None => {
                debug!("stage `{}`: no valid candidate, stage ends early", plan.label);
                break;
            }
        }

        let placed = state.connections.len() as u32 - exec.start_len;
        if placed % exec.refresh_every == 0 {
            state.refresh_pyramid();
        }
        if placed % exec.snapshot_every == 0 {
            (exec.on_progress)(ProgressSnapshot {
                current_thread: placed,
                total_threads: exec.total_planned,
                stage_label: plan.label.to_owned(),
                preview_png: Some(crate::result::encode_canvas_png(state)),
                accuracy: None,
            });
        }
    }

    if placed_in_stage > 0 {
        debug!(
            "stage `{}` done: {} placed, mean accepted score {:.4}, cache {} lines",
            plan.label,
            placed_in_stage,
            accepted_score_sum / f64::from(placed_in_stage),
            state.line_cache.len(),
        );
    }
    Ok(())
}

/// Place the single best thread from the current pin. Returns the
/// accepted score, or `None` when no valid end pin exists at all.
fn place_one(
    state: &mut ProgressState,
    exec: &mut StageExec<'_>,
    rng: &mut Pcg32,
    plan: &StagePlan,
    bias: FaceBias,
) -> Option<f64> {
    let from = state.current_pin;
    let params = exec.params;

    let candidate_pins = generate_candidates(
        rng,
        &state.edges,
        &state.regions,
        &state.pins,
        from,
        plan.min_skip,
        params.quality_preset,
        params.use_edge_detection,
    );

    // Rasterize every shortlisted run up front so the scoring fan-out
    // borrows shared state read-only.
    let mut runs: Vec<(u32, Arc<Vec<usize>>)> = candidate_pins
        .into_iter()
        .map(|b| {
            let px = state.line(from, b);
            (b, px)
        })
        .collect();

    if bias == FaceBias::On {
        // Face-relevant candidates: midpoint inside the face mask, or
        // enough of the run overlapping it.
        let face_runs: Vec<(u32, Arc<Vec<usize>>)> = runs
            .iter()
            .filter(|(_, px)| {
                px.get(px.len() / 2)
                    .is_some_and(|&mid| state.regions.face[mid])
                    || state.regions.line_face_overlap(px)
                        >= crate::faces::FACE_RELEVANT_OVERLAP
            })
            .cloned()
            .collect();
        if !face_runs.is_empty() {
            runs = face_runs;
        }
    }

    let boost = if bias == FaceBias::On { 1.5 } else { 1.0 };
    let best = pick_best(state, exec, &runs, from, plan.alpha).map(|(b, c, s)| (b, c, s * boost));

    match best {
        Some((to, color, score)) if score > REJECT => {
            record(exec, &color);
            state.apply_thread(from, to, &color, plan.alpha);
            Some(score)
        }
        // Everything was rejected (or the shortlist was empty): fall
        // back to a uniformly random valid pin so the winding stays
        // continuous even on degenerate input.
        _ => {
            let to = fallback_pin(rng, &state.regions, &state.pins, from, plan.min_skip)?;
            let color = match params.color_mode {
                ColorMode::Monochrome => BLACK,
                ColorMode::Color => least_used_color(&exec.color_usage),
            };
            record(exec, &color);
            state.apply_thread(from, to, &color, plan.alpha);
            Some(0.0)
        }
    }
}

fn record(exec: &mut StageExec<'_>, color: &ThreadColor) {
    if let Some(i) = PALETTE.iter().position(|p| p.hex == color.hex) {
        exec.color_usage[i] += 1;
    }
}

fn least_used_color(usage: &[u32; PALETTE.len()]) -> ThreadColor {
    let i = usage
        .iter()
        .enumerate()
        .min_by_key(|&(_, &u)| u)
        .map_or(0, |(i, _)| i);
    PALETTE[i]
}

/// Score every run (and, in color mode, every palette color per run)
/// in parallel and return the best `(pin, color, score)`.
fn pick_best(
    state: &ProgressState,
    exec: &StageExec<'_>,
    runs: &[(u32, Arc<Vec<usize>>)],
    from: u32,
    alpha: f32,
) -> Option<(u32, ThreadColor, f64)> {
    if runs.is_empty() {
        return None;
    }
    let params = exec.params;

    match (state.progress_rgb.as_ref(), state.target_lab.as_ref()) {
        (Some(rgb), Some(target_lab)) => {
            let inputs = LabScoreInputs {
                canvas: rgb.as_raw(),
                target_lab,
                edges: &state.edges,
                density: &state.density,
                overdraw: &state.overdraw,
                regions: &state.regions,
                use_edges: params.use_edge_detection,
            };
            let color_usage = exec.color_usage;
            let total_placed = state.connections.len() as u32;
            // Collect in candidate order, then reduce sequentially:
            // parallel max over tied scores would depend on the
            // reduction tree and break run-to-run determinism.
            let scored: Vec<(u32, ThreadColor, f64)> = runs
                .par_iter()
                .flat_map_iter(|(b, px)| {
                    let inputs = &inputs;
                    let pin_usage = state.pin_usage[*b as usize];
                    PALETTE.iter().enumerate().map(move |(ci, color)| {
                        let usage = LabScoreUsage {
                            to_pin_usage: pin_usage,
                            color_usage: color_usage[ci],
                            total_placed,
                        };
                        let score = score_lab_line(inputs, px, color, alpha, usage);
                        (*b, *color, score)
                    })
                })
                .collect();
            scored
                .into_iter()
                .max_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal))
        }
        _ => {
            let ctx = mono_ctx(state, params);
            let scored: Vec<(u32, ThreadColor, f64)> = runs
                .par_iter()
                .map(|(b, px)| {
                    (
                        *b,
                        BLACK,
                        multires_line_score(&ctx, px, from, *b, alpha),
                    )
                })
                .collect();
            scored
                .into_iter()
                .max_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal))
        }
    }
}

/// Assemble the read-only monochrome scoring view over the state.
pub(crate) fn mono_ctx<'a>(
    state: &'a ProgressState,
    params: &GenerationParams,
) -> ScoreContext<'a> {
    ScoreContext {
        target: state.target_gray.as_raw(),
        current: state.progress_gray.as_raw(),
        density: &state.density,
        overdraw: &state.overdraw,
        edges: &state.edges,
        regions: &state.regions,
        pyramid: &state.pyramid,
        pins: &state.pins,
        pin_usage: &state.pin_usage,
        canvas_edge: state.edge,
        use_edges: params.use_edge_detection,
        use_fatigue: params.use_pin_fatigue,
    }
}

fn emit_stage_end(state: &ProgressState, exec: &StageExec<'_>, label: &str) {
    let placed = state.connections.len() as u32 - exec.start_len;
    (exec.on_progress)(ProgressSnapshot {
        current_thread: placed,
        total_threads: exec.total_planned,
        stage_label: label.to_owned(),
        preview_png: Some(crate::result::encode_canvas_png(state)),
        accuracy: Some(crate::result::canvas_metrics(state)),
    });
}
