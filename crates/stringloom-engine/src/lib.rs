//! stringloom-engine: sans-IO string-art generation.
//!
//! Converts a raster image into an ordered sequence of pin-to-pin
//! thread connections that, wound around nails on a circular or
//! rectangular frame, reproduce the image:
//!
//! preprocess -> place pins -> edge pipeline -> region masks ->
//! coarse-to-fine greedy selection -> local refinement ->
//! optional annealing / genetic post-passes -> result assembly.
//!
//! This crate has **no I/O dependencies** — it operates on in-memory
//! byte slices, reports progress through a plain callback, and polls a
//! shared flag for cancellation. Thread/channel plumbing lives in
//! `stringloom-job`; file and terminal interaction in `stringloom-cli`.
//!
//! ```no_run
//! use stringloom_engine::{generate, GenerationParams};
//!
//! # fn run(png_bytes: Vec<u8>) -> Result<(), stringloom_engine::EngineError> {
//! let params = GenerationParams::default();
//! let result = generate(&png_bytes, &params)?;
//! println!("{} threads, {:.1}% similar", result.total_threads, result.accuracy.similarity_pct);
//! # Ok(())
//! # }
//! ```

pub mod anneal;
pub mod candidates;
pub mod color;
pub mod composite;
pub mod driver;
pub mod edges;
pub mod faces;
pub mod pins;
pub mod preprocess;
pub mod progress;
pub mod pyramid;
pub mod raster;
pub mod refine;
pub mod result;
pub mod resume;
pub mod score;
pub mod state;
pub mod types;

use log::info;
use rand::SeedableRng;
use rand_pcg::Pcg32;

pub use faces::{FaceBox, FaceDetector};
pub use progress::{CancelFlag, ProgressSnapshot};
pub use resume::continue_generation_with;
pub use types::{
    AccuracyMetrics, ColorMode, CropDescriptor, EngineError, FrameType, GenerationParams,
    GenerationResult, GrayImage, Pin, QualityPreset, RgbImage, ThreadColorCount, ThreadConnection,
};

/// Fixed RNG seed: all stochastic choices flow through one seeded
/// generator, so identical inputs produce identical results.
pub(crate) const RNG_SEED: u64 = 0x7374_726C_6F6F_6D; // "strloom"

/// Run one generation to completion with no progress reporting and no
/// cancellation.
///
/// # Errors
///
/// Returns [`EngineError::InvalidParams`] for structurally unusable
/// parameters. Decode failures do not error (the preprocessor
/// substitutes a deterministic gradient).
pub fn generate(
    image_bytes: &[u8],
    params: &GenerationParams,
) -> Result<GenerationResult, EngineError> {
    generate_with(
        image_bytes,
        params,
        None,
        &progress::sink_none,
        &CancelFlag::new(),
    )
}

/// Run one generation with an optional face detector, a progress
/// callback, and a cancellation flag.
///
/// Progress snapshots are emitted at least every `max_threads / 100`
/// threads, with a monotone thread counter; the connection log any
/// snapshot describes is a strict prefix of the final log.
///
/// # Errors
///
/// Returns [`EngineError::InvalidParams`] before any work for
/// structurally unusable parameters, and [`EngineError::Cancelled`]
/// when the flag is observed (partial state is discarded).
pub fn generate_with(
    image_bytes: &[u8],
    params: &GenerationParams,
    detector: Option<&dyn FaceDetector>,
    on_progress: &(dyn Fn(ProgressSnapshot) + Sync),
    cancel: &CancelFlag,
) -> Result<GenerationResult, EngineError> {
    params.validate_relaxed()?;
    let edge = params.canvas_edge();
    let want_rgb = params.color_mode == ColorMode::Color;

    let pre = preprocess::preprocess(image_bytes, params.image_crop, edge, want_rgb);
    if let Some(warning) = &pre.warning {
        // Recovered condition: surfaced through the progress stream,
        // not as an error.
        on_progress(ProgressSnapshot {
            current_thread: 0,
            total_threads: params.max_threads,
            stage_label: format!("preprocess: {warning}"),
            preview_png: None,
            accuracy: None,
        });
    }

    // A configured detector that fails falls back to the deterministic
    // centred box; no detector means no face handling at all.
    let face = detector.map(|d| {
        d.detect(&pre.gray)
            .unwrap_or_else(|| faces::fallback_face_box(edge, edge))
    });

    let pins = pins::place_pins(
        params.frame_type,
        params.pin_count,
        edge,
        edge,
        face.as_ref(),
    );
    let regions = match face {
        Some(face) => faces::RegionMask::from_face(
            face,
            edge,
            edge,
            params.quality_preset,
            params.min_pin_skip,
        ),
        None => faces::RegionMask::none(edge, edge, params.quality_preset, params.min_pin_skip),
    };
    let edge_planes = if params.use_edge_detection {
        edges::detect_edges(&pre.gray)
    } else {
        edges::EdgePlanes::disabled(edge, edge)
    };

    let mut state = state::ProgressState::new(
        pre.gray,
        pre.rgb,
        edge_planes,
        pins,
        regions,
        params.thread_width_px(),
    );
    let mut rng = Pcg32::seed_from_u64(RNG_SEED);

    driver::drive(&mut state, params, &mut rng, on_progress, cancel)?;

    // Post-passes (monochrome only; each guards internally).
    let replaced = refine::refine(&mut state, params, &mut rng);
    if replaced > 0 {
        on_progress(ProgressSnapshot {
            current_thread: state.connections.len() as u32,
            total_threads: state.connections.len() as u32,
            stage_label: format!("refinement: {replaced} threads replaced"),
            preview_png: Some(result::encode_canvas_png(&state)),
            accuracy: None,
        });
    }
    if params.use_simulated_annealing {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        anneal::simulated_annealing(&mut state, params, &mut rng);
    }
    if params.quality_preset == QualityPreset::High && params.color_mode == ColorMode::Monochrome {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        anneal::genetic_refinement(&mut state, params, &mut rng);
        anneal::backtrack(&mut state);
    }

    // Repair any reverse-composite drift before assembly so the canvas
    // is exactly the replay of the final log.
    anneal::rebuild_canvas(&mut state);

    let result = result::assemble(&state, params);
    info!(
        "generation complete: {} threads, mse {:.1}, ssim {:.3}, similarity {:.1}%",
        result.total_threads,
        result.accuracy.mse,
        result.accuracy.ssim,
        result.accuracy.similarity_pct,
    );
    Ok(result)
}

/// Replay an existing result and extend it with `additional` threads,
/// with no progress reporting and no cancellation.
///
/// # Errors
///
/// See [`continue_generation_with`].
pub fn continue_generation(
    previous: &GenerationResult,
    additional: u32,
) -> Result<GenerationResult, EngineError> {
    continue_generation_with(
        previous,
        additional,
        None,
        &progress::sink_none,
        &CancelFlag::new(),
    )
}
