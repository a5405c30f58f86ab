// cannon/infer.rs

//! # Label Inference
//!
//! The second step of The Cannon: with the per-pixel coefficients and scatters held
//! fixed, find the labels of a new star whose model spectrum best matches its observed
//! flux. Each star is independent, so stars are fitted in parallel.
//!
//! For a star with flux `f`, errors `σ` and candidate labels `l`, the objective is
//!
//! ```text
//! χ²(l) = Σ_p (f_p − θ_p · x(l))² / (σ_p² + s_p²)
//! ```
//!
//! summed over the usable pixels `p`. It is minimized with BFGS from the training
//! pivots, in coordinates scaled by the spread of the training labels so that labels
//! of very different magnitude (temperatures and surface gravities, say) are
//! conditioned alike.

use crate::data::TestSet;
use crate::labels::{design_jacobian, design_row};
use crate::model::CannonModel;
use crate::munging::is_bad_pixel;
use crate::regression::FitStatus;
use ndarray::{Array1, Array2, ArrayView1, Axis};
use ndarray_linalg::Inverse;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use wolfe_bfgs::{Bfgs, BfgsError, BfgsSolution};

const WAVELENGTH_RTOL: f64 = 1e-9;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Test spectra have {found} pixels, but the model was trained on {expected}.")]
    PixelCountMismatch { found: usize, expected: usize },

    #[error(
        "Test spectra are sampled at {found} at pixel {pixel}, but the model expects {expected}."
    )]
    WavelengthMismatch {
        pixel: usize,
        found: f64,
        expected: f64,
    },

    #[error("Star '{star}' has no pixel that is both well-measured and fitted by the model.")]
    NoUsablePixels { star: String },

    #[error("Label optimization failed for star '{star}': {message}")]
    OptimizationFailed { star: String, message: String },

    #[error("Failed to write inferred labels: {0}")]
    IoError(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// Gradient-norm tolerance passed to BFGS.
    pub tolerance: f64,
    pub max_iterations: usize,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            tolerance: 1e-6,
            max_iterations: 500,
        }
    }
}

/// The inferred labels of one star.
#[derive(Debug, Clone)]
pub struct LabelFit {
    pub labels: Array1<f64>,
    /// Formal one-sigma errors from the curvature of χ² at the optimum. NaN when the
    /// curvature matrix cannot be inverted.
    pub label_errors: Array1<f64>,
    pub chisq: f64,
    pub num_pixels: usize,
    /// BFGS iterations, when the optimizer reported them. `None` when it stopped with
    /// an error that carries no iteration count.
    pub iterations: Option<usize>,
    /// Calls of the objective, counted whether or not BFGS converged.
    pub evaluations: usize,
    /// `false` when BFGS stopped early and the best point it visited was kept.
    pub converged: bool,
}

/// Inferred labels for a whole test set, in test-set order.
#[derive(Debug, Clone)]
pub struct InferredLabels {
    pub ids: Vec<String>,
    pub label_names: Vec<String>,
    pub fits: Vec<LabelFit>,
}

impl InferredLabels {
    /// Writes one row per star: id, labels, label errors, χ², pixel count, convergence flag.
    pub fn write_tsv(&self, path: &str) -> Result<(), InferenceError> {
        let mut file = BufWriter::new(File::create(path)?);

        let mut header = vec!["id".to_string()];
        header.extend(self.label_names.iter().cloned());
        header.extend(self.label_names.iter().map(|name| format!("{name}_err")));
        header.extend(["chisq", "num_pixels", "converged"].map(String::from));
        writeln!(file, "{}", header.join("\t"))?;

        for (id, fit) in self.ids.iter().zip(&self.fits) {
            let mut row = vec![id.clone()];
            row.extend(fit.labels.iter().map(|v| format!("{v:.6}")));
            row.extend(fit.label_errors.iter().map(|v| format!("{v:.6}")));
            row.push(format!("{:.6}", fit.chisq));
            row.push(fit.num_pixels.to_string());
            row.push(fit.converged.to_string());
            writeln!(file, "{}", row.join("\t"))?;
        }
        file.flush()?;
        Ok(())
    }
}

/// Infers labels for every star of `test`. Returns the failure of the first star
/// (in test-set order) that could not be fitted.
pub fn infer_labels(
    model: &CannonModel,
    test: &TestSet,
    config: &InferenceConfig,
) -> Result<InferredLabels, InferenceError> {
    check_sampling(model, test)?;

    let nstars = test.spectra.num_stars();
    log::info!(
        "Inferring {} labels for {} stars against a {}-pixel model.",
        model.num_labels(),
        nstars,
        model.num_pixels()
    );

    let results: Vec<Result<LabelFit, InferenceError>> = (0..nstars)
        .into_par_iter()
        .map(|star| {
            fit_star_labels(
                model,
                &test.ids[star],
                test.spectra.flux.row(star),
                test.spectra.flux_err.row(star),
                config,
            )
        })
        .collect();
    let fits = results.into_iter().collect::<Result<Vec<_>, _>>()?;

    let unconverged = fits.iter().filter(|f| !f.converged).count();
    if unconverged > 0 {
        log::warn!("{unconverged} of {nstars} stars stopped before BFGS converged.");
    }
    log::info!("Label inference complete.");

    Ok(InferredLabels {
        ids: test.ids.clone(),
        label_names: model.label_names.clone(),
        fits,
    })
}

fn check_sampling(model: &CannonModel, test: &TestSet) -> Result<(), InferenceError> {
    let expected = model.num_pixels();
    let found = test.spectra.num_pixels();
    if found != expected {
        return Err(InferenceError::PixelCountMismatch { found, expected });
    }
    for (pixel, (&w, &m)) in test
        .spectra
        .wavelengths
        .iter()
        .zip(model.wavelengths.iter())
        .enumerate()
    {
        if (w - m).abs() > WAVELENGTH_RTOL * m.abs().max(1.0) {
            return Err(InferenceError::WavelengthMismatch {
                pixel,
                found: w,
                expected: m,
            });
        }
    }
    Ok(())
}

/// Fits the labels of a single star.
pub fn fit_star_labels(
    model: &CannonModel,
    star: &str,
    flux: ArrayView1<f64>,
    flux_err: ArrayView1<f64>,
    config: &InferenceConfig,
) -> Result<LabelFit, InferenceError> {
    let objective = Arc::new(StarObjective::new(model, flux, flux_err));
    let num_pixels = objective.flux.len();
    if num_pixels == 0 {
        return Err(InferenceError::NoUsablePixels {
            star: star.to_string(),
        });
    }

    let start = Array1::zeros(model.num_labels());
    let (initial_cost, _) = objective.cost_and_grad(&start);
    if !initial_cost.is_finite() {
        return Err(InferenceError::OptimizationFailed {
            star: star.to_string(),
            message: format!("objective at the pivots is not finite: {initial_cost}"),
        });
    }

    // BFGS errors carry no point we can rely on, so keep the best one seen.
    let best: Arc<Mutex<(f64, Array1<f64>)>> = Arc::new(Mutex::new((initial_cost, start.clone())));
    let objective_for_closure = Arc::clone(&objective);
    let best_for_closure = Arc::clone(&best);
    let evaluations = Arc::new(AtomicUsize::new(0));
    let evaluations_for_closure = Arc::clone(&evaluations);
    let cost_and_grad = move |z: &Array1<f64>| -> (f64, Array1<f64>) {
        evaluations_for_closure.fetch_add(1, Ordering::Relaxed);
        let (cost, grad) = objective_for_closure.cost_and_grad(z);
        if cost.is_finite() {
            if let Ok(mut guard) = best_for_closure.lock() {
                if cost < guard.0 {
                    *guard = (cost, z.clone());
                }
            }
            (cost, grad)
        } else {
            (1e10, Array1::zeros(z.len()))
        }
    };

    let (scaled, iterations, converged) = match Bfgs::new(start, cost_and_grad)
        .with_tolerance(config.tolerance)
        .with_max_iterations(config.max_iterations)
        .run()
    {
        Ok(BfgsSolution {
            final_point,
            iterations,
            ..
        }) => (final_point, Some(iterations), true),
        Err(e) => {
            let iterations = match &e {
                BfgsError::MaxIterationsReached { last_solution }
                | BfgsError::LineSearchFailed { last_solution, .. } => {
                    Some(last_solution.iterations)
                }
                _ => None,
            };
            let fallback = best.lock().map(|guard| guard.1.clone()).map_err(|_| {
                InferenceError::OptimizationFailed {
                    star: star.to_string(),
                    message: format!("BFGS failed: {e:?}"),
                }
            })?;
            log::debug!("BFGS stopped early for star '{star}' ({e:?}); keeping the best point.");
            (fallback, iterations, false)
        }
    };

    let labels = objective.unscale(&scaled);
    if labels.iter().any(|v| !v.is_finite()) {
        return Err(InferenceError::OptimizationFailed {
            star: star.to_string(),
            message: format!("non-finite labels {labels}"),
        });
    }

    Ok(LabelFit {
        label_errors: objective.label_errors(labels.view()),
        chisq: objective.chisq(labels.view()),
        labels,
        num_pixels,
        iterations,
        evaluations: evaluations.load(Ordering::Relaxed),
        converged,
    })
}

/// The χ² surface of one star, restricted to its usable pixels.
struct StarObjective {
    /// Shape: `[nused, ncolumns]`.
    coefficients: Array2<f64>,
    flux: Array1<f64>,
    /// `1 / (σ² + s²)` per used pixel.
    weights: Array1<f64>,
    pivots: Array1<f64>,
    scales: Array1<f64>,
}

impl StarObjective {
    fn new(model: &CannonModel, flux: ArrayView1<f64>, flux_err: ArrayView1<f64>) -> Self {
        let used: Vec<usize> = (0..model.num_pixels())
            .filter(|&p| {
                model.status[p] != FitStatus::Failed
                    && model.scatters[p].is_finite()
                    && model.coefficients.row(p).iter().all(|c| c.is_finite())
                    && !is_bad_pixel(flux[p], flux_err[p])
            })
            .collect();

        let weights: Array1<f64> = used
            .iter()
            .map(|&p| 1.0 / (flux_err[p].powi(2) + model.scatters[p].powi(2)))
            .collect();
        let scales = if model.label_scales.len() == model.num_labels() {
            model.label_scales.clone()
        } else {
            Array1::ones(model.num_labels())
        };

        Self {
            coefficients: model.coefficients.select(Axis(0), &used),
            flux: used.iter().map(|&p| flux[p]).collect(),
            weights,
            pivots: model.pivots.clone(),
            scales,
        }
    }

    fn unscale(&self, z: &Array1<f64>) -> Array1<f64> {
        &self.pivots + &(z * &self.scales)
    }

    fn residuals(&self, labels: ArrayView1<f64>) -> Array1<f64> {
        let row = design_row(labels, self.pivots.view());
        &self.flux - &self.coefficients.dot(&row)
    }

    fn chisq(&self, labels: ArrayView1<f64>) -> f64 {
        let r = self.residuals(labels);
        (&self.weights * &r * &r).sum()
    }

    /// Mean weighted squared residual and its gradient in scaled coordinates.
    fn cost_and_grad(&self, z: &Array1<f64>) -> (f64, Array1<f64>) {
        let n = self.flux.len() as f64;
        let labels = self.unscale(z);
        let r = self.residuals(labels.view());
        let wr = &self.weights * &r;
        let cost = wr.dot(&r) / n;

        // d(model)/d(labels), shape [nused, nlabels]
        let derivative = self
            .coefficients
            .dot(&design_jacobian(labels.view(), self.pivots.view()));
        let grad = derivative.t().dot(&wr) * (-2.0 / n) * &self.scales;
        (cost, grad)
    }

    fn label_errors(&self, labels: ArrayView1<f64>) -> Array1<f64> {
        let nlabels = labels.len();
        let derivative = self
            .coefficients
            .dot(&design_jacobian(labels, self.pivots.view()));
        let weighted = &derivative * &self.weights.view().insert_axis(Axis(1));
        let curvature = derivative.t().dot(&weighted);
        match curvature.inv() {
            Ok(cov) => cov.diag().mapv(|v| if v >= 0.0 { v.sqrt() } else { f64::NAN }),
            Err(_) => Array1::from_elem(nlabels, f64::NAN),
        }
    }
}
