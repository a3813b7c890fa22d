//! Shared types for the stringloom generation engine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Re-export `GrayImage` so downstream crates can reference raster data
/// without depending on `image` directly.
pub use image::GrayImage;

/// Re-export `RgbImage` for the color-mode canvas and target.
pub use image::RgbImage;

/// A nail on the physical frame.
///
/// Pins are created once by the pin placer and are immutable for the
/// rest of the job. `index` is the position in perimeter order; modular
/// distance between indices corresponds to geometric distance along the
/// frame edge, which is what min-skip constraints are defined over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pin {
    /// Position in perimeter order, `0..pin_count`.
    pub index: u32,
    /// Horizontal pixel coordinate on the working canvas.
    pub x: u16,
    /// Vertical pixel coordinate on the working canvas.
    pub y: u16,
}

/// One straight segment of thread from `from_pin` to `to_pin`.
///
/// Connections are appended strictly in execution order; later threads
/// overlay earlier ones, so the order is semantically meaningful and is
/// never rearranged. Local refinement mutates entries in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadConnection {
    /// Index of the pin the thread leaves from.
    pub from_pin: u32,
    /// Index of the pin the thread arrives at.
    pub to_pin: u32,
    /// Thread color as `#RRGGBB`.
    pub color_hex: String,
    /// Human-readable color name (e.g. `"black"`, `"cyan"`).
    pub color_name: String,
}

/// Shape of the physical frame the pins are mounted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameType {
    /// Pins on a circle inscribed in the working canvas.
    #[default]
    Circular,
    /// Pins on the four sides of the square canvas.
    Square,
    /// Pins on the four sides of the canvas bounds.
    ///
    /// The working canvas is always square after preprocessing, so this
    /// lays out identically to [`Square`](Self::Square); both variants
    /// are kept because callers distinguish them in their own UI.
    Rectangular,
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Circular => f.write_str("circular"),
            Self::Square => f.write_str("square"),
            Self::Rectangular => f.write_str("rectangular"),
        }
    }
}

/// Thread coloring policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorMode {
    /// A single black thread on a white canvas.
    #[default]
    Monochrome,
    /// LAB-interleaved CMYK+K: every candidate is evaluated with each
    /// palette color against one shared RGB canvas.
    Color,
}

impl fmt::Display for ColorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Monochrome => f.write_str("monochrome"),
            Self::Color => f.write_str("color"),
        }
    }
}

/// Quality preset selecting the stage-driver path.
///
/// `Fast` and `Balanced` run a single greedy pass with uniform opacity;
/// `High` (and any color-mode run) uses the three-stage coarse-to-fine
/// schedule plus the post-refinement passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityPreset {
    /// Fewest candidates per thread, single pass.
    Fast,
    /// Default candidate counts, single pass.
    #[default]
    Balanced,
    /// Most candidates, three-stage schedule, local refinement and the
    /// optional annealing/genetic post-passes.
    High,
}

impl fmt::Display for QualityPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fast => f.write_str("fast"),
            Self::Balanced => f.write_str("balanced"),
            Self::High => f.write_str("high"),
        }
    }
}

/// Inner-crop descriptor applied before resizing to the working canvas.
///
/// `scale` zooms into the image (1 = full frame, 3 = 3x zoom); the
/// offsets pan the crop window within the slack left by the zoom, each
/// in `[-1, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CropDescriptor {
    /// Zoom factor in `[1, 3]`.
    #[serde(default = "CropDescriptor::default_scale")]
    pub scale: f64,
    /// Horizontal pan in `[-1, 1]`.
    #[serde(default)]
    pub offset_x: f64,
    /// Vertical pan in `[-1, 1]`.
    #[serde(default)]
    pub offset_y: f64,
}

impl CropDescriptor {
    const fn default_scale() -> f64 {
        1.0
    }
}

impl Default for CropDescriptor {
    fn default() -> Self {
        Self {
            scale: 1.0,
            offset_x: 0.0,
            offset_y: 0.0,
        }
    }
}

/// Configuration for one generation job.
///
/// All fields have defaults matching the caller-facing parameter table;
/// omitted fields deserialize to those defaults so stored jobs keep
/// working when fields are added.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Pin layout shape.
    #[serde(default)]
    pub frame_type: FrameType,

    /// Number of pins on the frame perimeter, `[100, 800]`.
    #[serde(default = "GenerationParams::default_pin_count")]
    pub pin_count: u32,

    /// Nominal frame size in millimetres, `[200, 1000]`.
    ///
    /// Also bounds the working-canvas resolution: the canvas edge is
    /// `min(frame_size, 512)` pixels.
    #[serde(default = "GenerationParams::default_frame_size")]
    pub frame_size: u32,

    /// Physical thread width in millimetres, `[0.2, 1.5]`. Rasterized
    /// line thickness is `max(1, round(2 * thread_width))` pixels.
    #[serde(default = "GenerationParams::default_thread_width")]
    pub thread_width: f64,

    /// Per-thread opacity (linear-light density step), `[0.03, 0.35]`.
    #[serde(default = "GenerationParams::default_thread_opacity")]
    pub thread_opacity: f64,

    /// Monochrome black thread or LAB-interleaved CMYK+K.
    #[serde(default)]
    pub color_mode: ColorMode,

    /// Total threads to place, `[500, 50000]`.
    #[serde(default = "GenerationParams::default_max_threads")]
    pub max_threads: u32,

    /// Stage-driver path selection.
    #[serde(default)]
    pub quality_preset: QualityPreset,

    /// Whether the edge map participates in candidate generation and
    /// scoring.
    #[serde(default = "GenerationParams::default_true")]
    pub use_edge_detection: bool,

    /// Whether to run the simulated-annealing post-pass (monochrome
    /// only).
    #[serde(default)]
    pub use_simulated_annealing: bool,

    /// Whether heavily-used pins are penalized in scoring.
    #[serde(default)]
    pub use_pin_fatigue: bool,

    /// Minimum modular index distance between the two pins of one
    /// thread, `[1, 50]`. Region policies can only raise this floor.
    #[serde(default = "GenerationParams::default_min_pin_skip")]
    pub min_pin_skip: u32,

    /// Inner crop applied before resizing.
    #[serde(default)]
    pub image_crop: CropDescriptor,
}

impl GenerationParams {
    /// Default pin count.
    pub const DEFAULT_PIN_COUNT: u32 = 400;
    /// Default frame size in millimetres.
    pub const DEFAULT_FRAME_SIZE: u32 = 500;
    /// Default thread width in millimetres.
    pub const DEFAULT_THREAD_WIDTH: f64 = 0.4;
    /// Default per-thread opacity.
    pub const DEFAULT_THREAD_OPACITY: f64 = 0.12;
    /// Default total thread count.
    pub const DEFAULT_MAX_THREADS: u32 = 10_000;
    /// Default minimum pin skip.
    pub const DEFAULT_MIN_PIN_SKIP: u32 = 2;

    /// Hard bound on the working-canvas edge in pixels.
    pub const MAX_CANVAS_EDGE: u32 = 512;

    const fn default_pin_count() -> u32 {
        Self::DEFAULT_PIN_COUNT
    }
    const fn default_frame_size() -> u32 {
        Self::DEFAULT_FRAME_SIZE
    }
    const fn default_thread_width() -> f64 {
        Self::DEFAULT_THREAD_WIDTH
    }
    const fn default_thread_opacity() -> f64 {
        Self::DEFAULT_THREAD_OPACITY
    }
    const fn default_max_threads() -> u32 {
        Self::DEFAULT_MAX_THREADS
    }
    const fn default_min_pin_skip() -> u32 {
        Self::DEFAULT_MIN_PIN_SKIP
    }
    const fn default_true() -> bool {
        true
    }

    /// Edge length of the working canvas in pixels.
    #[must_use]
    pub fn canvas_edge(&self) -> u32 {
        self.frame_size.min(Self::MAX_CANVAS_EDGE)
    }

    /// Rasterized thread thickness in pixels.
    #[must_use]
    pub fn thread_width_px(&self) -> u32 {
        ((2.0 * self.thread_width).round() as u32).max(1)
    }

    /// Validate every field against its documented range.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidParams`] naming the first offending
    /// field. Validation happens before any work, so an invalid job
    /// fails without touching the image.
    pub fn validate(&self) -> Result<(), EngineError> {
        if !(100..=800).contains(&self.pin_count) {
            return Err(EngineError::InvalidParams {
                field: "pin_count",
                message: format!("must be in [100, 800], got {}", self.pin_count),
            });
        }
        if !(200..=1000).contains(&self.frame_size) {
            return Err(EngineError::InvalidParams {
                field: "frame_size",
                message: format!("must be in [200, 1000], got {}", self.frame_size),
            });
        }
        if !(0.2..=1.5).contains(&self.thread_width) {
            return Err(EngineError::InvalidParams {
                field: "thread_width",
                message: format!("must be in [0.2, 1.5], got {}", self.thread_width),
            });
        }
        if !(0.03..=0.35).contains(&self.thread_opacity) {
            return Err(EngineError::InvalidParams {
                field: "thread_opacity",
                message: format!("must be in [0.03, 0.35], got {}", self.thread_opacity),
            });
        }
        if !(500..=50_000).contains(&self.max_threads) {
            return Err(EngineError::InvalidParams {
                field: "max_threads",
                message: format!("must be in [500, 50000], got {}", self.max_threads),
            });
        }
        if !(1..=50).contains(&self.min_pin_skip) {
            return Err(EngineError::InvalidParams {
                field: "min_pin_skip",
                message: format!("must be in [1, 50], got {}", self.min_pin_skip),
            });
        }
        if !(1.0..=3.0).contains(&self.image_crop.scale) {
            return Err(EngineError::InvalidParams {
                field: "image_crop.scale",
                message: format!("must be in [1, 3], got {}", self.image_crop.scale),
            });
        }
        if !(-1.0..=1.0).contains(&self.image_crop.offset_x) {
            return Err(EngineError::InvalidParams {
                field: "image_crop.offset_x",
                message: format!("must be in [-1, 1], got {}", self.image_crop.offset_x),
            });
        }
        if !(-1.0..=1.0).contains(&self.image_crop.offset_y) {
            return Err(EngineError::InvalidParams {
                field: "image_crop.offset_y",
                message: format!("must be in [-1, 1], got {}", self.image_crop.offset_y),
            });
        }
        // A skip floor at or above half the pin count leaves no valid
        // pair at all.
        if self.min_pin_skip * 2 > self.pin_count {
            return Err(EngineError::InvalidParams {
                field: "min_pin_skip",
                message: format!(
                    "must be below pin_count / 2 ({}), got {}",
                    self.pin_count / 2,
                    self.min_pin_skip,
                ),
            });
        }
        Ok(())
    }

    /// Relaxed validation applied by the engine itself: only the
    /// constraints generation cannot survive without (at least 3 pins,
    /// at least 1 thread, a sane skip, positive opacity).
    ///
    /// The caller-facing range table in [`validate`](Self::validate) is
    /// for outer layers; keeping the engine permissive lets tools run
    /// tiny jobs (a dozen pins, a handful of threads) for smoke checks.
    pub fn validate_relaxed(&self) -> Result<(), EngineError> {
        if self.pin_count < 3 {
            return Err(EngineError::InvalidParams {
                field: "pin_count",
                message: format!("must be at least 3, got {}", self.pin_count),
            });
        }
        if self.max_threads == 0 {
            return Err(EngineError::InvalidParams {
                field: "max_threads",
                message: "must be positive".to_owned(),
            });
        }
        if self.min_pin_skip == 0 || self.min_pin_skip * 2 > self.pin_count {
            return Err(EngineError::InvalidParams {
                field: "min_pin_skip",
                message: format!(
                    "must be in [1, pin_count / 2], got {}",
                    self.min_pin_skip,
                ),
            });
        }
        if self.thread_opacity <= 0.0 || self.thread_opacity > 1.0 {
            return Err(EngineError::InvalidParams {
                field: "thread_opacity",
                message: format!("must be in (0, 1], got {}", self.thread_opacity),
            });
        }
        if self.frame_size == 0 {
            return Err(EngineError::InvalidParams {
                field: "frame_size",
                message: "must be positive".to_owned(),
            });
        }
        Ok(())
    }
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            frame_type: FrameType::default(),
            pin_count: Self::DEFAULT_PIN_COUNT,
            frame_size: Self::DEFAULT_FRAME_SIZE,
            thread_width: Self::DEFAULT_THREAD_WIDTH,
            thread_opacity: Self::DEFAULT_THREAD_OPACITY,
            color_mode: ColorMode::default(),
            max_threads: Self::DEFAULT_MAX_THREADS,
            quality_preset: QualityPreset::default(),
            use_edge_detection: true,
            use_simulated_annealing: false,
            use_pin_fatigue: false,
            min_pin_skip: Self::DEFAULT_MIN_PIN_SKIP,
            image_crop: CropDescriptor::default(),
        }
    }
}

/// Final accuracy measurements against the preprocessed target.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccuracyMetrics {
    /// Mean squared error over 8-bit intensities.
    pub mse: f64,
    /// Whole-image SSIM in `[-1, 1]`.
    pub ssim: f64,
    /// `clamp(0.6 * (1 - mse/65025) * 100 + 0.4 * ssim * 100, 0, 100)`.
    pub similarity_pct: f64,
}

/// Per-color thread tally in a finished result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadColorCount {
    /// Color as `#RRGGBB`.
    pub color_hex: String,
    /// Human-readable color name.
    pub color_name: String,
    /// Number of connections using this color.
    pub count: u32,
    /// Integer percentage of all connections; the list sums to 100.
    pub percentage: u32,
}

/// A persisted copy of the preprocessed target image.
///
/// Stored inside [`GenerationResult`] so continue-mode can rebuild exact
/// scoring state without the caller re-supplying the original upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetPlanes {
    /// Canvas edge length in pixels (the canvas is square).
    pub edge: u32,
    /// Grayscale target, row-major, `edge * edge` bytes.
    pub gray: Vec<u8>,
    /// RGB target, row-major, `edge * edge * 3` bytes. Present only for
    /// color-mode jobs.
    pub rgb: Option<Vec<u8>>,
}

/// Everything a finished generation produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    /// Opaque deterministic identifier for this result.
    pub id: String,
    /// Creation time, ISO-8601 UTC.
    pub created_at: String,
    /// Pin layout used for this result.
    pub pins: Vec<Pin>,
    /// Thread connections in execution order.
    pub connections: Vec<ThreadConnection>,
    /// `connections.len()`, kept separately for serialized consumers.
    pub total_threads: u32,
    /// The parameters the job ran with.
    pub params: GenerationParams,
    /// Base64-encoded PNG preview, byte-reproducible by replaying
    /// `connections` at `params.thread_opacity`.
    pub preview_base64: String,
    /// Per-color counts and percentages; percentages sum to 100.
    pub thread_colors: Vec<ThreadColorCount>,
    /// Final accuracy against the preprocessed target.
    pub accuracy: AccuracyMetrics,
    /// Preprocessed target planes, persisted for continue-mode.
    pub target: Option<TargetPlanes>,
}

/// Errors the engine can surface to callers.
///
/// Transient conditions (decode failure, face-detector failure,
/// degenerate candidates) are recovered internally and never appear
/// here; only job-fatal conditions do.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A parameter is outside its documented range. `field` names the
    /// offending parameter for the caller.
    #[error("invalid parameter `{field}`: {message}")]
    InvalidParams {
        /// The offending parameter name.
        field: &'static str,
        /// What was wrong with it.
        message: String,
    },

    /// The job's cancellation flag was observed. Partial state is
    /// discarded; this is a terminal state, not a failure of the input.
    #[error("generation cancelled")]
    Cancelled,

    /// Continue-mode was asked to extend a result whose preprocessed
    /// target planes were stripped. The engine refuses rather than
    /// silently substituting the thread canvas as a scoring target.
    #[error("result carries no persisted target image; cannot continue generation")]
    MissingTarget,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_params_are_valid() {
        GenerationParams::default().validate().unwrap();
    }

    #[test]
    fn default_params_match_parameter_table() {
        let p = GenerationParams::default();
        assert_eq!(p.frame_type, FrameType::Circular);
        assert_eq!(p.pin_count, 400);
        assert_eq!(p.frame_size, 500);
        assert!((p.thread_width - 0.4).abs() < f64::EPSILON);
        assert!((p.thread_opacity - 0.12).abs() < f64::EPSILON);
        assert_eq!(p.color_mode, ColorMode::Monochrome);
        assert_eq!(p.max_threads, 10_000);
        assert_eq!(p.quality_preset, QualityPreset::Balanced);
        assert!(p.use_edge_detection);
        assert!(!p.use_simulated_annealing);
        assert!(!p.use_pin_fatigue);
        assert_eq!(p.min_pin_skip, 2);
    }

    #[test]
    fn canvas_edge_is_capped() {
        let p = GenerationParams {
            frame_size: 1000,
            ..GenerationParams::default()
        };
        assert_eq!(p.canvas_edge(), 512);

        let p = GenerationParams {
            frame_size: 300,
            ..GenerationParams::default()
        };
        assert_eq!(p.canvas_edge(), 300);
    }

    #[test]
    fn thread_width_px_rounds_and_floors() {
        let mut p = GenerationParams::default();
        p.thread_width = 0.2;
        assert_eq!(p.thread_width_px(), 1); // round(0.4) = 0, floored to 1
        p.thread_width = 0.4;
        assert_eq!(p.thread_width_px(), 1);
        p.thread_width = 0.8;
        assert_eq!(p.thread_width_px(), 2);
        p.thread_width = 1.5;
        assert_eq!(p.thread_width_px(), 3);
    }

    #[test]
    fn validate_names_offending_field() {
        let p = GenerationParams {
            pin_count: 99,
            ..GenerationParams::default()
        };
        let err = p.validate().unwrap_err();
        assert!(
            matches!(err, EngineError::InvalidParams { field: "pin_count", .. }),
            "expected pin_count error, got {err:?}",
        );

        let p = GenerationParams {
            thread_opacity: 0.5,
            ..GenerationParams::default()
        };
        let err = p.validate().unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidParams {
                field: "thread_opacity",
                ..
            }
        ));
    }

    #[test]
    fn validate_rejects_unusable_skip() {
        let p = GenerationParams {
            pin_count: 100,
            min_pin_skip: 50,
            ..GenerationParams::default()
        };
        // skip 50 on 100 pins leaves exactly one candidate (the
        // antipode) in theory, but the floor rule demands strictly
        // below half.
        assert!(p.validate().is_err());
    }

    #[test]
    fn relaxed_validation_allows_scenario_sizes() {
        let p = GenerationParams {
            pin_count: 12,
            max_threads: 5,
            min_pin_skip: 2,
            frame_size: 200,
            ..GenerationParams::default()
        };
        p.validate_relaxed().unwrap();
        // The strict caller-facing ranges reject it.
        assert!(p.validate().is_err());
    }

    #[test]
    fn params_serde_round_trip() {
        let p = GenerationParams {
            color_mode: ColorMode::Color,
            quality_preset: QualityPreset::High,
            use_pin_fatigue: true,
            image_crop: CropDescriptor {
                scale: 1.5,
                offset_x: -0.25,
                offset_y: 0.75,
            },
            ..GenerationParams::default()
        };
        let json = serde_json::to_string(&p).unwrap();
        let back: GenerationParams = serde_json::from_str(&json).unwrap();
        assert_eq!(p, back);
    }

    #[test]
    fn params_deserialize_with_missing_fields() {
        // Stored jobs written before a field existed must keep loading.
        let json = r#"{"pin_count": 200, "color_mode": "color"}"#;
        let p: GenerationParams = serde_json::from_str(json).unwrap();
        assert_eq!(p.pin_count, 200);
        assert_eq!(p.color_mode, ColorMode::Color);
        assert_eq!(p.max_threads, GenerationParams::DEFAULT_MAX_THREADS);
        assert!((p.image_crop.scale - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn error_display_names_field() {
        let err = EngineError::InvalidParams {
            field: "pin_count",
            message: "must be in [100, 800], got 7".to_owned(),
        };
        assert_eq!(
            err.to_string(),
            "invalid parameter `pin_count`: must be in [100, 800], got 7",
        );
    }
}
