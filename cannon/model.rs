// cannon/model.rs

//! # Model Training and the Trained Model Artifact
//!
//! Training applies the per-pixel regression independently at every wavelength pixel,
//! sharing one design matrix, and stacks the results into a `CannonModel`. Pixels are
//! distributed across the rayon thread pool; each task produces its own
//! `Result<PixelFit, RegressionError>` and no task depends on another.
//!
//! A failed pixel either aborts training or is recorded and filled with NaN,
//! depending on `FailurePolicy`. Every fallback is visible in `CannonModel::status`.

use crate::data::TrainingSet;
use crate::labels::{build_label_vector, design_row, num_design_columns};
use crate::regression::{FitStatus, PixelFit, PixelSpectrum, RegressionError, ScatterGrid, regress};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use ndarray::{Array1, Array2, Array3, ArrayView1, Axis, s};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, IsTerminal, Write};
use thiserror::Error;

/// Custom error type for model training, loading, saving, and evaluation.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML model file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Pixel regression failed and the failure policy is Abort: {0}")]
    Regression(#[from] RegressionError),
    #[error("Invalid training configuration: {0}")]
    InvalidConfig(String),
    #[error(
        "Training set has {stars} stars, but a model with {columns} coefficients per pixel needs at least that many."
    )]
    InsufficientStars { stars: usize, columns: usize },
    #[error("Received {found} labels, but the model was trained on {expected}.")]
    MismatchedLabelCount { found: usize, expected: usize },
}

/// What to do when a pixel regression fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FailurePolicy {
    /// Stop training and return the failure of the lowest-indexed failed pixel.
    Abort,
    /// Fill the pixel with NaN, mark it `FitStatus::Failed`, and continue.
    #[default]
    RecordAndSkip,
}

/// Hyperparameters of a training run, saved alongside the model.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub scatter_grid: ScatterGrid,
    pub failure_policy: FailurePolicy,
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<(), ModelError> {
        let grid = &self.scatter_grid;
        if !(grid.ln_step > 0.0 && grid.ln_step.is_finite()) {
            return Err(ModelError::InvalidConfig(format!(
                "scatter grid step must be positive and finite, got {}",
                grid.ln_step
            )));
        }
        if !(grid.ln_min.is_finite() && grid.ln_max.is_finite() && grid.ln_min < grid.ln_max) {
            return Err(ModelError::InvalidConfig(format!(
                "scatter grid range [{}, {}) is empty or not finite",
                grid.ln_min, grid.ln_max
            )));
        }
        Ok(())
    }
}

/// A pixel whose regression failed under `FailurePolicy::RecordAndSkip`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PixelFailure {
    pub pixel: usize,
    pub reason: String,
}

/// Per-status pixel counts of a trained model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrainingSummary {
    pub converged: usize,
    pub lower_boundary: usize,
    pub upper_boundary: usize,
    pub degenerate_grid: usize,
    pub failed: usize,
}

impl TrainingSummary {
    pub fn from_status(status: &[FitStatus]) -> Self {
        let mut summary = Self::default();
        for s in status {
            match s {
                FitStatus::Converged => summary.converged += 1,
                FitStatus::LowerBoundary => summary.lower_boundary += 1,
                FitStatus::UpperBoundary => summary.upper_boundary += 1,
                FitStatus::DegenerateGrid => summary.degenerate_grid += 1,
                FitStatus::Failed => summary.failed += 1,
            }
        }
        summary
    }
}

/// The trained model: per-pixel stacks indexed by pixel, plus the label pivots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CannonModel {
    pub label_names: Vec<String>,
    /// Fit status per pixel.
    pub status: Vec<FitStatus>,
    /// Shape: `[nlabels]`.
    pub pivots: Array1<f64>,
    /// Standard deviation of each training label, 1 where it vanishes. Shape: `[nlabels]`.
    #[serde(default)]
    pub label_scales: Array1<f64>,
    /// Shape: `[npixels]`.
    pub wavelengths: Array1<f64>,
    /// Shape: `[npixels, ncolumns]`.
    pub coefficients: Array2<f64>,
    /// Shape: `[npixels, ncolumns, ncolumns]`.
    pub covariances: Array3<f64>,
    /// Shape: `[npixels]`.
    pub scatters: Array1<f64>,
    /// Weighted residuals. Shape: `[npixels, nstars]`.
    pub chis: Array2<f64>,
    /// `Σ χ² − Σ ln C⁻¹` per pixel. Shape: `[npixels]`.
    pub chisqs: Array1<f64>,
    pub config: TrainingConfig,
    #[serde(default)]
    pub failures: Vec<PixelFailure>,
}

impl CannonModel {
    pub fn num_pixels(&self) -> usize {
        self.coefficients.nrows()
    }

    pub fn num_labels(&self) -> usize {
        self.label_names.len()
    }

    pub fn summary(&self) -> TrainingSummary {
        TrainingSummary::from_status(&self.status)
    }

    /// Model flux at every pixel for one star's labels.
    pub fn predict_spectrum(&self, labels: ArrayView1<f64>) -> Result<Array1<f64>, ModelError> {
        if labels.len() != self.num_labels() {
            return Err(ModelError::MismatchedLabelCount {
                found: labels.len(),
                expected: self.num_labels(),
            });
        }
        let row = design_row(labels, self.pivots.view());
        Ok(self.coefficients.dot(&row))
    }

    /// Saves the trained model to a file in a human-readable TOML format.
    pub fn save(&self, path: &str) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Loads a trained model from a TOML file.
    pub fn load(path: &str) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let model = toml::from_str(&toml_string)?;
        Ok(model)
    }
}

/// The main entry point for model training.
pub fn train_model(
    training: &TrainingSet,
    config: &TrainingConfig,
) -> Result<CannonModel, ModelError> {
    config.validate()?;

    let nstars = training.num_stars();
    let npixels = training.num_pixels();
    let ncolumns = num_design_columns(training.num_labels());
    if nstars < ncolumns {
        return Err(ModelError::InsufficientStars {
            stars: nstars,
            columns: ncolumns,
        });
    }

    log::info!(
        "Starting model training: {} stars, {} labels, {} pixels, {} coefficients per pixel.",
        nstars,
        training.num_labels(),
        npixels,
        ncolumns
    );

    // 1. One design matrix, shared read-only by every pixel.
    let label_vector = build_label_vector(training.labels.view());
    let design = label_vector.design.view();

    // 2. Independent regression per pixel.
    let flux = &training.spectra.flux;
    let flux_err = &training.spectra.flux_err;
    let grid = config.scatter_grid;
    let pb = create_progress_bar(npixels as u64, "Fitting pixels");
    let results: Vec<Result<PixelFit, RegressionError>> = (0..npixels)
        .into_par_iter()
        .map(|pixel| {
            let spectrum = PixelSpectrum {
                pixel,
                flux: flux.column(pixel),
                flux_err: flux_err.column(pixel),
            };
            let result = regress(design, &spectrum, &grid);
            pb.inc(1);
            result
        })
        .collect();
    pb.finish_and_clear();

    // 3. Stack the per-pixel results in pixel order.
    let mut coefficients = Array2::from_elem((npixels, ncolumns), f64::NAN);
    let mut covariances = Array3::from_elem((npixels, ncolumns, ncolumns), f64::NAN);
    let mut scatters = Array1::from_elem(npixels, f64::NAN);
    let mut chis = Array2::from_elem((npixels, nstars), f64::NAN);
    let mut chisqs = Array1::from_elem(npixels, f64::NAN);
    let mut status = Vec::with_capacity(npixels);
    let mut failures = Vec::new();

    for (pixel, result) in results.into_iter().enumerate() {
        match result {
            Ok(fit) => {
                coefficients.row_mut(pixel).assign(&fit.coefficients);
                covariances
                    .slice_mut(s![pixel, .., ..])
                    .assign(&fit.covariance);
                chis.row_mut(pixel).assign(&fit.chi);
                scatters[pixel] = fit.scatter;
                chisqs[pixel] = fit.chisq;
                status.push(fit.status);
            }
            Err(e) => match config.failure_policy {
                FailurePolicy::Abort => {
                    log::error!("Aborting training: {e}");
                    return Err(ModelError::Regression(e));
                }
                FailurePolicy::RecordAndSkip => {
                    log::warn!("Skipping pixel {pixel}: {e}");
                    failures.push(PixelFailure {
                        pixel,
                        reason: e.to_string(),
                    });
                    status.push(FitStatus::Failed);
                }
            },
        }
    }

    let model = CannonModel {
        label_names: training.label_names.clone(),
        status,
        pivots: label_vector.pivots,
        label_scales: label_scales(training),
        wavelengths: training.spectra.wavelengths.clone(),
        coefficients,
        covariances,
        scatters,
        chis,
        chisqs,
        config: *config,
        failures,
    };
    log_summary(&model.summary(), npixels);
    Ok(model)
}

fn label_scales(training: &TrainingSet) -> Array1<f64> {
    training
        .labels
        .std_axis(Axis(0), 0.0)
        .mapv(|s| if s > 0.0 && s.is_finite() { s } else { 1.0 })
}

fn log_summary(summary: &TrainingSummary, npixels: usize) {
    log::info!(
        "Training complete: {} of {} pixels converged, {} at the lower scatter bound, {} at the upper scatter bound.",
        summary.converged,
        npixels,
        summary.lower_boundary,
        summary.upper_boundary
    );
    if summary.degenerate_grid > 0 {
        log::warn!(
            "{} pixels had a non-finite scatter objective and fell back to the largest grid scatter.",
            summary.degenerate_grid
        );
    }
    if summary.failed > 0 {
        log::warn!(
            "{} pixels failed to fit and were filled with NaN.",
            summary.failed
        );
    }
}

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) = ProgressStyle::with_template(
        "> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message(message.to_string());
    pb
}
