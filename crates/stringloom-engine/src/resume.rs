//! Continue-from-result: replay an existing winding and extend it.
//!
//! Continuation rebuilds exact scoring state from the target planes
//! persisted inside the previous result — it never substitutes the
//! thread canvas as a scoring target. A result stripped of its planes
//! is refused with [`EngineError::MissingTarget`].

use log::debug;
use rand::SeedableRng;
use rand_pcg::Pcg32;

use crate::driver::drive_extension;
use crate::edges::{detect_edges, EdgePlanes};
use crate::faces::{fallback_face_box, FaceDetector, RegionMask};
use crate::progress::{CancelFlag, ProgressSnapshot};
use crate::state::{palette_entry, ProgressState};
use crate::types::{EngineError, GenerationResult};

/// Replay `previous` and extend it with `additional` threads.
///
/// The previous pin layout is reused verbatim (coordinates must match
/// the replayed lines), every stored connection is re-composited with
/// its stored color at the flat `thread_opacity`, and a single greedy
/// pass places the extra threads with the same scoring and policies.
/// The returned result chains the original connections and the new
/// ones.
///
/// # Errors
///
/// Returns [`EngineError::MissingTarget`] when the previous result
/// carries no usable target planes, [`EngineError::InvalidParams`] for
/// a zero extension, and [`EngineError::Cancelled`] when cancelled.
pub fn continue_generation_with(
    previous: &GenerationResult,
    additional: u32,
    detector: Option<&dyn FaceDetector>,
    on_progress: &(dyn Fn(ProgressSnapshot) + Sync),
    cancel: &CancelFlag,
) -> Result<GenerationResult, EngineError> {
    if additional == 0 {
        return Err(EngineError::InvalidParams {
            field: "additional_threads",
            message: "must be positive".to_owned(),
        });
    }
    let params = &previous.params;
    let planes = previous.target.as_ref().ok_or(EngineError::MissingTarget)?;
    let (target_gray, target_rgb) =
        crate::result::restore_target(planes).ok_or(EngineError::MissingTarget)?;
    let edge = target_gray.width();

    let edges = if params.use_edge_detection {
        detect_edges(&target_gray)
    } else {
        EdgePlanes::disabled(edge, edge)
    };
    let face = detector.map(|d| {
        d.detect(&target_gray)
            .unwrap_or_else(|| fallback_face_box(edge, edge))
    });
    let regions = match face {
        Some(face) => {
            RegionMask::from_face(face, edge, edge, params.quality_preset, params.min_pin_skip)
        }
        None => RegionMask::none(edge, edge, params.quality_preset, params.min_pin_skip),
    };

    let mut state = ProgressState::new(
        target_gray,
        target_rgb,
        edges,
        previous.pins.clone(),
        regions,
        params.thread_width_px(),
    );

    // Replay the stored winding at the flat opacity. This restores the
    // canvas, the density/overdraw planes, pin usage, and the cursor.
    let alpha = params.thread_opacity as f32;
    for c in &previous.connections {
        state.apply_thread(c.from_pin, c.to_pin, &palette_entry(&c.color_hex), alpha);
    }
    state.refresh_pyramid();
    debug!(
        "continue: replayed {} connections, extending by {additional}",
        previous.connections.len(),
    );

    let mut rng = Pcg32::seed_from_u64(crate::RNG_SEED ^ u64::from(additional));
    drive_extension(&mut state, params, additional, &mut rng, on_progress, cancel)?;

    Ok(crate::result::assemble(&state, params))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::progress::sink_none;
    use crate::types::GenerationParams;

    fn small_result(threads: u32) -> GenerationResult {
        let params = GenerationParams {
            pin_count: 24,
            max_threads: threads,
            frame_size: 200,
            ..GenerationParams::default()
        };
        // A gradient image exercises real scoring.
        let img = crate::types::RgbImage::from_fn(64, 64, |x, y| {
            let v = ((x * 3 + y) % 256) as u8;
            image::Rgb([v, v, v])
        });
        let mut buf = Vec::new();
        let encoder = image::codecs::png::PngEncoder::new(&mut buf);
        image::ImageEncoder::write_image(
            encoder,
            img.as_raw(),
            img.width(),
            img.height(),
            image::ExtendedColorType::Rgb8,
        )
        .unwrap();
        crate::generate(&buf, &params).unwrap()
    }

    #[test]
    fn continuation_chains_connections() {
        let first = small_result(20);
        let continued =
            continue_generation_with(&first, 10, None, &sink_none, &CancelFlag::new()).unwrap();

        assert_eq!(continued.connections.len(), 30);
        assert_eq!(
            &continued.connections[..20],
            &first.connections[..],
            "original connections must be preserved verbatim",
        );
        // Continuity across the boundary.
        assert_eq!(
            continued.connections[19].to_pin,
            continued.connections[20].from_pin,
        );
    }

    #[test]
    fn continuation_reuses_the_pin_layout() {
        let first = small_result(15);
        let continued =
            continue_generation_with(&first, 5, None, &sink_none, &CancelFlag::new()).unwrap();
        assert_eq!(continued.pins, first.pins);
    }

    #[test]
    fn stripped_target_is_refused() {
        let mut first = small_result(15);
        first.target = None;
        let err = continue_generation_with(&first, 5, None, &sink_none, &CancelFlag::new())
            .unwrap_err();
        assert!(matches!(err, EngineError::MissingTarget));
    }

    #[test]
    fn zero_extension_is_refused() {
        let first = small_result(15);
        let err = continue_generation_with(&first, 0, None, &sink_none, &CancelFlag::new())
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidParams {
                field: "additional_threads",
                ..
            }
        ));
    }

    #[test]
    fn continuation_preview_replays_from_connections() {
        let first = small_result(12);
        let continued =
            continue_generation_with(&first, 6, None, &sink_none, &CancelFlag::new()).unwrap();
        let edge = continued.params.canvas_edge();
        // The preview contract holds across continuation: re-replay and
        // re-encode must reproduce the stored preview.
        let replay = crate::result::replay_preview(
            &continued.pins,
            &continued.connections,
            edge,
            continued.params.thread_width_px(),
            continued.params.thread_opacity as f32,
            continued.params.color_mode,
        );
        let mut buf = Vec::new();
        let encoder = image::codecs::png::PngEncoder::new(&mut buf);
        image::ImageEncoder::write_image(
            encoder,
            &replay,
            edge,
            edge,
            image::ExtendedColorType::L8,
        )
        .unwrap();
        use base64::Engine as _;
        assert_eq!(
            continued.preview_base64,
            base64::engine::general_purpose::STANDARD.encode(&buf),
        );
    }
}
