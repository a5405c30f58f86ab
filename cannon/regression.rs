// cannon/regression.rs

//! # Per-Pixel Regression with Intrinsic Scatter
//!
//! At a single wavelength pixel the flux of every training star is modelled as
//! `f_i = x_i · θ + noise`, where `x_i` is the star's label vector and the noise has
//! variance `σ_i² + s²`: the reported measurement error plus an intrinsic scatter `s`
//! shared by all stars at that pixel.
//!
//! For a fixed `s` the coefficients follow from weighted least squares. The scatter
//! itself is found by scanning a log-spaced grid for the minimum of
//! `Σ χ² − Σ ln C⁻¹` and refining the grid minimum with a parabola through its two
//! neighbours. Minima on the grid edge are accepted as-is and flagged in the result.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_linalg::error::LinalgError;
use ndarray_linalg::{Inverse, OperationNorm, Solve};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest tolerated `κ · ε` of the diagonally scaled normal matrix. Above it the
/// solution carries no reliable digits.
const CONDITION_TOL: f64 = 1e-2;

/// Failures of a single pixel regression.
#[derive(Error, Debug)]
pub enum RegressionError {
    #[error(
        "Singular regression at pixel {pixel} (scatter {scatter:.3e}, condition number {condition_number:.3e}): the weighted normal matrix could not be {operation}."
    )]
    SingularRegression {
        pixel: usize,
        scatter: f64,
        operation: &'static str,
        /// Condition number of the diagonally scaled normal matrix; infinite when it
        /// could not be computed.
        condition_number: f64,
        flux: Array1<f64>,
        flux_err: Array1<f64>,
        #[source]
        source: Option<LinalgError>,
    },

    #[error(
        "Regression at pixel {pixel} (scatter {scatter:.3e}) produced non-finite coefficients: {coefficients}"
    )]
    NonFiniteCoefficients {
        pixel: usize,
        scatter: f64,
        coefficients: Array1<f64>,
        flux: Array1<f64>,
        flux_err: Array1<f64>,
    },

    #[error(
        "Pixel {pixel} has {flux} flux values and {flux_err} flux errors, but the design matrix has {stars} rows."
    )]
    ShapeMismatch {
        pixel: usize,
        flux: usize,
        flux_err: usize,
        stars: usize,
    },
}

impl RegressionError {
    /// Index of the pixel the failure belongs to.
    pub fn pixel(&self) -> usize {
        match self {
            RegressionError::SingularRegression { pixel, .. }
            | RegressionError::NonFiniteCoefficients { pixel, .. }
            | RegressionError::ShapeMismatch { pixel, .. } => *pixel,
        }
    }
}

/// Log-spaced grid of trial scatter values: `ln_min, ln_min + ln_step, ...` strictly below `ln_max`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScatterGrid {
    pub ln_min: f64,
    pub ln_max: f64,
    pub ln_step: f64,
}

impl Default for ScatterGrid {
    fn default() -> Self {
        Self {
            ln_min: (1e-4_f64).ln(),
            ln_max: 0.0,
            ln_step: 0.5,
        }
    }
}

impl ScatterGrid {
    /// The grid points in log-scatter. Always contains at least `ln_min`.
    pub fn ln_values(&self) -> Vec<f64> {
        let mut values = vec![self.ln_min];
        if !(self.ln_step > 0.0 && self.ln_step.is_finite()) {
            return values;
        }
        let mut k = 1usize;
        loop {
            let v = self.ln_min + k as f64 * self.ln_step;
            if v >= self.ln_max {
                break;
            }
            values.push(v);
            k += 1;
        }
        values
    }
}

/// How the scatter of a pixel fit was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FitStatus {
    /// Interior grid minimum refined with a parabola.
    Converged,
    /// The objective was smallest at the lowest grid scatter.
    LowerBoundary,
    /// The objective was smallest at the highest grid scatter.
    UpperBoundary,
    /// Some grid evaluations were non-finite; the highest grid scatter was used.
    DegenerateGrid,
    /// The regression failed; every numeric output of the pixel is NaN.
    Failed,
}

/// Flux and flux errors of all training stars at one pixel.
#[derive(Debug, Clone, Copy)]
pub struct PixelSpectrum<'a> {
    pub pixel: usize,
    pub flux: ArrayView1<'a, f64>,
    pub flux_err: ArrayView1<'a, f64>,
}

/// Result of a weighted least-squares fit at a fixed scatter.
#[derive(Debug, Clone)]
pub struct FixedScatterFit {
    pub coefficients: Array1<f64>,
    /// `Xᵀ C⁻¹ X`, the inverse covariance of the coefficients.
    pub normal_matrix: Array2<f64>,
    /// `sqrt(C⁻¹) (f − X θ)` per star.
    pub chi: Array1<f64>,
    /// `Σ ln C⁻¹`.
    pub log_det_cinv: f64,
}

impl FixedScatterFit {
    /// The scatter objective `Σ χ² − Σ ln C⁻¹`.
    pub fn objective(&self) -> f64 {
        self.chi.dot(&self.chi) - self.log_det_cinv
    }
}

/// Final fit of one pixel.
#[derive(Debug, Clone)]
pub struct PixelFit {
    pub coefficients: Array1<f64>,
    pub covariance: Array2<f64>,
    pub chi: Array1<f64>,
    pub chisq: f64,
    pub scatter: f64,
    pub status: FitStatus,
}

/// Weighted least squares at a fixed intrinsic scatter.
pub fn regress_at_scatter(
    design: ArrayView2<f64>,
    spectrum: &PixelSpectrum,
    scatter: f64,
) -> Result<FixedScatterFit, RegressionError> {
    check_shapes(design, spectrum)?;
    let flux = spectrum.flux;
    let scatter_sq = scatter * scatter;

    let cinv = spectrum.flux_err.mapv(|e| 1.0 / (e * e + scatter_sq));
    let weighted_design = &design * &cinv.view().insert_axis(Axis(1));
    let normal_matrix = design.t().dot(&weighted_design);
    let projection = design.t().dot(&(&cinv * &flux));

    // LU only fails on an exact zero pivot; nearly dependent columns must be caught here.
    let condition_number = scaled_condition_number(&normal_matrix);
    if condition_number * f64::EPSILON > CONDITION_TOL {
        return Err(singular(spectrum, scatter, "solved", condition_number, None));
    }

    let coefficients = normal_matrix
        .solve(&projection)
        .map_err(|e| singular(spectrum, scatter, "solved", condition_number, Some(e)))?;

    if !coefficients.iter().all(|c| c.is_finite()) {
        return Err(RegressionError::NonFiniteCoefficients {
            pixel: spectrum.pixel,
            scatter,
            coefficients,
            flux: flux.to_owned(),
            flux_err: spectrum.flux_err.to_owned(),
        });
    }

    let residual = &flux - &design.dot(&coefficients);
    let chi = cinv.mapv(f64::sqrt) * residual;
    let log_det_cinv = cinv.mapv(f64::ln).sum();

    Ok(FixedScatterFit {
        coefficients,
        normal_matrix,
        chi,
        log_det_cinv,
    })
}

/// Fits one pixel, optimizing the intrinsic scatter over `grid`.
pub fn regress(
    design: ArrayView2<f64>,
    spectrum: &PixelSpectrum,
    grid: &ScatterGrid,
) -> Result<PixelFit, RegressionError> {
    let ln_scatters = grid.ln_values();
    let mut grid_fits = Vec::with_capacity(ln_scatters.len());
    for &ln_s in &ln_scatters {
        grid_fits.push(regress_at_scatter(design, spectrum, ln_s.exp())?);
    }
    let objective: Vec<f64> = grid_fits.iter().map(FixedScatterFit::objective).collect();

    let (fit, scatter, status) = match choose_scatter(&objective) {
        ScatterChoice::Degenerate => {
            let last = ln_scatters.len() - 1;
            log::debug!(
                "Pixel {}: non-finite scatter objective on the grid; using upper bound {:.3e}.",
                spectrum.pixel,
                ln_scatters[last].exp()
            );
            (
                grid_fits.swap_remove(last),
                ln_scatters[last].exp(),
                FitStatus::DegenerateGrid,
            )
        }
        ScatterChoice::Boundary { index, status } => (
            grid_fits.swap_remove(index),
            ln_scatters[index].exp(),
            status,
        ),
        ScatterChoice::Interior { index } => {
            let xs = [ln_scatters[index - 1], ln_scatters[index], ln_scatters[index + 1]];
            let ys = [objective[index - 1], objective[index], objective[index + 1]];
            match parabola_vertex(xs, ys) {
                Some(ln_s) => {
                    let scatter = ln_s.exp();
                    (
                        regress_at_scatter(design, spectrum, scatter)?,
                        scatter,
                        FitStatus::Converged,
                    )
                }
                // A flat triple has no vertex; the grid point is already the minimum.
                None => (
                    grid_fits.swap_remove(index),
                    ln_scatters[index].exp(),
                    FitStatus::Converged,
                ),
            }
        }
    };

    let covariance = fit
        .normal_matrix
        .inv()
        .map_err(|e| singular(spectrum, scatter, "inverted", f64::NAN, Some(e)))?;
    if !covariance.iter().all(|c| c.is_finite()) {
        return Err(singular(spectrum, scatter, "inverted", f64::NAN, None));
    }

    let chisq = fit.objective();
    Ok(PixelFit {
        coefficients: fit.coefficients,
        covariance,
        chi: fit.chi,
        chisq,
        scatter,
        status,
    })
}

/// Outcome of the grid scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScatterChoice {
    /// The minimum lies strictly inside the grid and can be refined.
    Interior { index: usize },
    /// The minimum lies on a grid edge and is accepted without refinement.
    Boundary { index: usize, status: FitStatus },
    /// At least one objective value is non-finite.
    Degenerate,
}

/// Decides how to treat a scanned objective curve. Ties resolve to the lowest index.
pub fn choose_scatter(objective: &[f64]) -> ScatterChoice {
    if objective.is_empty() || objective.iter().any(|v| !v.is_finite()) {
        return ScatterChoice::Degenerate;
    }

    let mut lowest = 0;
    for (i, &v) in objective.iter().enumerate().skip(1) {
        if v < objective[lowest] {
            lowest = i;
        }
    }

    if lowest == 0 {
        ScatterChoice::Boundary {
            index: lowest,
            status: FitStatus::LowerBoundary,
        }
    } else if lowest == objective.len() - 1 {
        ScatterChoice::Boundary {
            index: lowest,
            status: FitStatus::UpperBoundary,
        }
    } else {
        ScatterChoice::Interior { index: lowest }
    }
}

/// Abscissa of the vertex of the parabola through three points.
///
/// Returns `None` when the points are collinear or the curvature is not finite.
pub fn parabola_vertex(xs: [f64; 3], ys: [f64; 3]) -> Option<f64> {
    let slope_left = (ys[1] - ys[0]) / (xs[1] - xs[0]);
    let slope_right = (ys[2] - ys[1]) / (xs[2] - xs[1]);
    let a = (slope_right - slope_left) / (xs[2] - xs[0]);
    if a == 0.0 || !a.is_finite() {
        return None;
    }
    let b = slope_left - a * (xs[0] + xs[1]);
    let vertex = -b / (2.0 * a);
    vertex.is_finite().then_some(vertex)
}

fn check_shapes(design: ArrayView2<f64>, spectrum: &PixelSpectrum) -> Result<(), RegressionError> {
    let stars = design.nrows();
    if spectrum.flux.len() != stars || spectrum.flux_err.len() != stars {
        return Err(RegressionError::ShapeMismatch {
            pixel: spectrum.pixel,
            flux: spectrum.flux.len(),
            flux_err: spectrum.flux_err.len(),
            stars,
        });
    }
    Ok(())
}

/// One-norm condition number of `D^-1/2 A D^-1/2` with `D = diag(A)`.
///
/// The scaling removes the spread in magnitude between bias, linear and quadratic
/// columns, so only genuine near-dependence between labels is measured.
pub fn scaled_condition_number(normal_matrix: &Array2<f64>) -> f64 {
    let diag = normal_matrix.diag();
    if diag.iter().any(|&d| !(d > 0.0 && d.is_finite())) {
        return f64::INFINITY;
    }
    let inv_sqrt = diag.mapv(|d| 1.0 / d.sqrt());
    let scaled = Array2::from_shape_fn(normal_matrix.dim(), |(i, j)| {
        normal_matrix[[i, j]] * inv_sqrt[i] * inv_sqrt[j]
    });

    let (Ok(norm), Ok(inverse)) = (scaled.opnorm_one(), scaled.inv()) else {
        return f64::INFINITY;
    };
    match inverse.opnorm_one() {
        Ok(inverse_norm) if (norm * inverse_norm).is_finite() => norm * inverse_norm,
        _ => f64::INFINITY,
    }
}

fn singular(
    spectrum: &PixelSpectrum,
    scatter: f64,
    operation: &'static str,
    condition_number: f64,
    source: Option<LinalgError>,
) -> RegressionError {
    RegressionError::SingularRegression {
        pixel: spectrum.pixel,
        scatter,
        operation,
        condition_number,
        flux: spectrum.flux.to_owned(),
        flux_err: spectrum.flux_err.to_owned(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::build_label_vector;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array, array};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::Normal;

    fn random_labels(nstars: usize, nlabels: usize, seed: u64) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array2::from_shape_fn((nstars, nlabels), |_| rng.gen_range(-1.0..1.0))
    }

    fn spectrum<'a>(flux: &'a Array1<f64>, flux_err: &'a Array1<f64>) -> PixelSpectrum<'a> {
        PixelSpectrum {
            pixel: 7,
            flux: flux.view(),
            flux_err: flux_err.view(),
        }
    }

    #[test]
    fn grid_matches_log_spaced_range() {
        let values = ScatterGrid::default().ln_values();
        assert_eq!(values.len(), 19);
        assert_abs_diff_eq!(values[0], (1e-4_f64).ln(), epsilon = 1e-12);
        assert!(*values.last().unwrap() < 0.0);
        for pair in values.windows(2) {
            assert_abs_diff_eq!(pair[1] - pair[0], 0.5, epsilon = 1e-12);
        }
    }

    #[test]
    fn zero_scatter_with_unit_errors_is_ordinary_least_squares() {
        let lv = build_label_vector(random_labels(20, 2, 1).view());
        let truth = array![1.0, -0.2, 0.3, 0.05, -0.04, 0.02];
        let flux = lv.design.dot(&truth);
        let flux_err = Array1::ones(20);

        let fit = regress_at_scatter(lv.design.view(), &spectrum(&flux, &flux_err), 0.0).unwrap();

        let xtx = lv.design.t().dot(&lv.design);
        let ols = xtx.solve(&lv.design.t().dot(&flux)).unwrap();
        for ((c, o), t) in fit.coefficients.iter().zip(ols.iter()).zip(truth.iter()) {
            assert_abs_diff_eq!(*c, *o, epsilon = 1e-10);
            assert_abs_diff_eq!(*c, *t, epsilon = 1e-10);
        }
        assert!(fit.chi.iter().all(|c| c.abs() < 1e-10));
        assert_abs_diff_eq!(fit.log_det_cinv, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn weighted_normal_equations_hold() {
        let lv = build_label_vector(random_labels(30, 3, 2).view());
        let mut rng = StdRng::seed_from_u64(3);
        let flux = Array::from_shape_fn(30, |_| 1.0 + rng.gen_range(-0.2..0.2));
        let flux_err = Array::from_shape_fn(30, |_| rng.gen_range(0.01..0.1));
        let scatter = 0.03;

        let fit =
            regress_at_scatter(lv.design.view(), &spectrum(&flux, &flux_err), scatter).unwrap();

        let sqrt_cinv = flux_err.mapv(|e| (1.0 / (e * e + scatter * scatter)).sqrt());
        let gradient = lv.design.t().dot(&(&sqrt_cinv * &fit.chi));
        let scale = fit.normal_matrix.diag().iter().cloned().fold(0.0, f64::max);
        for g in gradient.iter() {
            assert!(g.abs() / scale < 1e-10, "normal equations violated: {g}");
        }
    }

    #[test]
    fn covariance_inverts_normal_matrix() {
        let lv = build_label_vector(random_labels(25, 2, 4).view());
        let mut rng = StdRng::seed_from_u64(5);
        let noise = Normal::new(0.0, 0.05).unwrap();
        let flux = Array::from_shape_fn(25, |_| 1.0 + rng.sample(noise));
        let flux_err = Array1::from_elem(25, 0.02);

        let fit = regress(
            lv.design.view(),
            &spectrum(&flux, &flux_err),
            &ScatterGrid::default(),
        )
        .unwrap();
        let refit = regress_at_scatter(lv.design.view(), &spectrum(&flux, &flux_err), fit.scatter)
            .unwrap();
        let product = refit.normal_matrix.dot(&fit.covariance);
        for ((i, j), v) in product.indexed_iter() {
            let expected = if i == j { 1.0 } else { 0.0 };
            assert_abs_diff_eq!(*v, expected, epsilon = 1e-8);
        }
    }

    #[test]
    fn noiseless_pixels_recover_generating_coefficients() {
        let labels = random_labels(12, 2, 6);
        let lv = build_label_vector(labels.view());
        let truths = [
            array![1.0, 0.1, -0.2, 0.03, 0.01, -0.02],
            array![0.8, -0.3, 0.0, 0.0, 0.05, 0.1],
            array![0.95, 0.02, 0.04, -0.06, 0.0, 0.01],
        ];
        let flux_err = Array1::from_elem(12, 0.01);

        for truth in &truths {
            let flux = lv.design.dot(truth);
            let fit = regress(
                lv.design.view(),
                &spectrum(&flux, &flux_err),
                &ScatterGrid::default(),
            )
            .unwrap();
            for (c, t) in fit.coefficients.iter().zip(truth.iter()) {
                assert_abs_diff_eq!(*c, *t, epsilon = 1e-9);
            }
            // No residual to absorb, so the objective prefers the smallest scatter.
            assert_eq!(fit.status, FitStatus::LowerBoundary);
            assert_abs_diff_eq!(fit.scatter, 1e-4, epsilon = 1e-12);
        }
    }

    #[test]
    fn intrinsic_scatter_is_recovered_in_the_interior() {
        let lv = build_label_vector(random_labels(200, 2, 8).view());
        let mut rng = StdRng::seed_from_u64(9);
        let noise = Normal::new(0.0, 0.1).unwrap();
        let flux = Array::from_shape_fn(200, |_| 1.0 + rng.sample(noise));
        let flux_err = Array1::from_elem(200, 0.01);

        let fit = regress(
            lv.design.view(),
            &spectrum(&flux, &flux_err),
            &ScatterGrid::default(),
        )
        .unwrap();
        assert_eq!(fit.status, FitStatus::Converged);
        assert!(fit.scatter > 0.07 && fit.scatter < 0.13, "scatter {}", fit.scatter);
        let expected = fit.chi.dot(&fit.chi)
            - flux_err
                .mapv(|e| (1.0 / (e * e + fit.scatter * fit.scatter)).ln())
                .sum();
        assert_abs_diff_eq!(fit.chisq, expected, epsilon = 1e-8);
    }

    #[test]
    fn larger_errors_never_raise_the_fitted_scatter() {
        let lv = build_label_vector(random_labels(60, 2, 10).view());
        let mut rng = StdRng::seed_from_u64(11);
        let noise = Normal::new(0.0, 0.1).unwrap();
        let flux = Array::from_shape_fn(60, |_| 1.0 + rng.sample(noise));
        let flux_err = Array1::from_elem(60, 0.05);
        let doubled = &flux_err * 2.0;
        let grid = ScatterGrid::default();

        let base = regress(lv.design.view(), &spectrum(&flux, &flux_err), &grid).unwrap();
        let wider = regress(lv.design.view(), &spectrum(&flux, &doubled), &grid).unwrap();
        assert!(
            wider.scatter <= base.scatter,
            "doubling errors raised scatter from {} to {}",
            base.scatter,
            wider.scatter
        );
    }

    #[test]
    fn monotonic_curves_stop_at_the_boundary() {
        let increasing = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(
            choose_scatter(&increasing),
            ScatterChoice::Boundary {
                index: 0,
                status: FitStatus::LowerBoundary
            }
        );

        let decreasing = [4.0, 3.0, 2.0, 1.0];
        assert_eq!(
            choose_scatter(&decreasing),
            ScatterChoice::Boundary {
                index: 3,
                status: FitStatus::UpperBoundary
            }
        );

        let flat = [2.0; 5];
        assert_eq!(
            choose_scatter(&flat),
            ScatterChoice::Boundary {
                index: 0,
                status: FitStatus::LowerBoundary
            }
        );
    }

    #[test]
    fn interior_and_degenerate_curves() {
        assert_eq!(
            choose_scatter(&[3.0, 1.0, 0.5, 2.0]),
            ScatterChoice::Interior { index: 2 }
        );
        assert_eq!(
            choose_scatter(&[3.0, f64::NAN, 0.5, 2.0]),
            ScatterChoice::Degenerate
        );
        assert_eq!(
            choose_scatter(&[3.0, 1.0, f64::INFINITY]),
            ScatterChoice::Degenerate
        );
    }

    #[test]
    fn vertex_of_exact_parabola() {
        let f = |x: f64| 2.0 * (x + 1.3) * (x + 1.3) - 4.0;
        let xs = [-2.0, -1.5, -1.0];
        let vertex = parabola_vertex(xs, [f(xs[0]), f(xs[1]), f(xs[2])]).unwrap();
        assert_abs_diff_eq!(vertex, -1.3, epsilon = 1e-12);
        assert!(parabola_vertex([0.0, 1.0, 2.0], [1.0, 1.0, 1.0]).is_none());
    }

    #[test]
    fn constant_label_makes_the_regression_singular() {
        let mut labels = random_labels(10, 2, 12);
        labels.column_mut(1).fill(3.5);
        let lv = build_label_vector(labels.view());
        let flux = Array1::ones(10);
        let flux_err = Array1::from_elem(10, 0.01);

        let err = regress_at_scatter(lv.design.view(), &spectrum(&flux, &flux_err), 0.01)
            .unwrap_err();
        match err {
            RegressionError::SingularRegression { pixel, scatter, .. } => {
                assert_eq!(pixel, 7);
                assert_abs_diff_eq!(scatter, 0.01);
            }
            other => panic!("Expected SingularRegression, got {other:?}"),
        }
    }

    #[test]
    fn collinear_labels_are_rejected_despite_nonzero_pivots() {
        // logg is an affine function of teff, so the centred columns agree only up to
        // rounding and LU factorization alone would succeed.
        let mut rng = StdRng::seed_from_u64(14);
        let teff = Array1::from_shape_fn(30, |_| rng.gen_range(4000.0..5000.0));
        let mut labels = Array2::zeros((30, 2));
        labels.column_mut(0).assign(&teff);
        labels.column_mut(1).assign(&teff.mapv(|t| 0.001 * t - 2.0));
        let lv = build_label_vector(labels.view());
        let flux = Array::from_shape_fn(30, |_| 1.0 + rng.gen_range(-0.05..0.05));
        let flux_err = Array1::from_elem(30, 0.01);

        let err = regress_at_scatter(lv.design.view(), &spectrum(&flux, &flux_err), 0.01)
            .unwrap_err();
        match err {
            RegressionError::SingularRegression {
                condition_number, ..
            } => assert!(condition_number * f64::EPSILON > CONDITION_TOL),
            other => panic!("Expected SingularRegression, got {other:?}"),
        }
        assert!(matches!(
            regress(lv.design.view(), &spectrum(&flux, &flux_err), &ScatterGrid::default()),
            Err(RegressionError::SingularRegression { pixel: 7, .. })
        ));
    }

    #[test]
    fn well_posed_fits_have_moderate_condition_numbers() {
        let lv = build_label_vector(random_labels(40, 3, 15).view());
        let flux_err = Array1::from_elem(40, 0.02);
        let cinv = flux_err.mapv(|e| 1.0 / (e * e));
        let weighted = &lv.design * &cinv.view().insert_axis(Axis(1));
        let normal_matrix = lv.design.t().dot(&weighted);
        let condition = scaled_condition_number(&normal_matrix);
        assert!(condition.is_finite() && condition >= 1.0);
        assert!(condition * f64::EPSILON < CONDITION_TOL);
        assert!(scaled_condition_number(&Array2::zeros((3, 3))).is_infinite());
    }

    #[test]
    fn non_finite_objective_falls_back_to_the_largest_grid_scatter() {
        let labels = random_labels(25, 2, 16);
        let lv = build_label_vector(labels.view());
        let truth = array![1.0, 0.1, -0.05, 0.02, 0.0, 0.01];
        let flux = lv.design.dot(&truth);
        let mut flux_err = Array1::from_elem(25, 0.01);
        // Zero weight for this star at every scatter, so ln C⁻¹ = -inf everywhere.
        flux_err[4] = f64::INFINITY;
        let grid = ScatterGrid::default();

        let fit = regress(lv.design.view(), &spectrum(&flux, &flux_err), &grid).unwrap();
        assert_eq!(fit.status, FitStatus::DegenerateGrid);
        let largest = grid.ln_values().last().copied().unwrap().exp();
        assert_abs_diff_eq!(fit.scatter, largest, epsilon = 1e-15);
        assert!(fit.coefficients.iter().all(|c| c.is_finite()));
        for (c, t) in fit.coefficients.iter().zip(truth.iter()) {
            assert_abs_diff_eq!(*c, *t, epsilon = 1e-9);
        }
        assert!(fit.covariance.iter().all(|c| c.is_finite()));
        assert_eq!(fit.chisq, f64::INFINITY);
    }

    #[test]
    fn scatter_beyond_the_grid_stops_at_the_upper_edge_unrefined() {
        let lv = build_label_vector(random_labels(200, 2, 17).view());
        let mut rng = StdRng::seed_from_u64(18);
        let noise = Normal::new(0.0, 0.5).unwrap();
        let flux = Array::from_shape_fn(200, |_| 1.0 + rng.sample(noise));
        let flux_err = Array1::from_elem(200, 0.01);
        let grid = ScatterGrid {
            ln_max: (0.05_f64).ln(),
            ..ScatterGrid::default()
        };

        let fit = regress(lv.design.view(), &spectrum(&flux, &flux_err), &grid).unwrap();
        assert_eq!(fit.status, FitStatus::UpperBoundary);
        let edge = grid.ln_values().last().copied().unwrap().exp();
        assert!(edge < 0.05);
        assert_abs_diff_eq!(fit.scatter, edge, epsilon = 1e-15);

        let at_edge =
            regress_at_scatter(lv.design.view(), &spectrum(&flux, &flux_err), edge).unwrap();
        for (a, b) in fit.coefficients.iter().zip(at_edge.coefficients.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
        }
        assert_abs_diff_eq!(fit.chisq, at_edge.objective(), epsilon = 1e-8);
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let lv = build_label_vector(random_labels(6, 1, 13).view());
        let flux = Array1::ones(5);
        let flux_err = Array1::ones(6);
        let err = regress_at_scatter(lv.design.view(), &spectrum(&flux, &flux_err), 0.0)
            .unwrap_err();
        assert!(matches!(err, RegressionError::ShapeMismatch { stars: 6, flux: 5, .. }));
        assert_eq!(err.pixel(), 7);
    }
}
