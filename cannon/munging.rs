//! Bad-pixel handling for raw spectra.
//!
//! A pixel is unusable when its flux is non-finite or exactly zero, or when its
//! reported error is non-finite or not positive. Such pixels keep their place in the
//! rectangular arrays but are given zero flux and a very large error, so they carry
//! effectively no weight in any regression.

use crate::data::Spectra;
use ndarray::{Array1, Array2, ArrayView2, Axis, Zip};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MungingConfig {
    /// Error assigned to masked pixels.
    pub large_error: f64,
}

impl Default for MungingConfig {
    fn default() -> Self {
        Self { large_error: 1e6 }
    }
}

pub fn is_bad_pixel(flux: f64, flux_err: f64) -> bool {
    !flux.is_finite() || flux == 0.0 || !flux_err.is_finite() || flux_err <= 0.0
}

/// `true` where a pixel is unusable. Shape matches the inputs.
pub fn bad_pixel_mask(flux: ArrayView2<f64>, flux_err: ArrayView2<f64>) -> Array2<bool> {
    let mut mask = Array2::from_elem(flux.dim(), false);
    Zip::from(&mut mask)
        .and(&flux)
        .and(&flux_err)
        .for_each(|m, &f, &e| *m = is_bad_pixel(f, e));
    mask
}

/// Replaces bad pixels in place and returns how many were masked.
pub fn mask_bad_pixels(spectra: &mut Spectra, config: &MungingConfig) -> usize {
    let mut masked = 0usize;
    Zip::from(&mut spectra.flux)
        .and(&mut spectra.flux_err)
        .for_each(|f, e| {
            if is_bad_pixel(*f, *e) {
                *f = 0.0;
                *e = config.large_error;
                masked += 1;
            }
        });
    let total = spectra.flux.len();
    if masked > 0 {
        log::info!(
            "Masked {masked} of {total} pixels ({:.2}%) as bad.",
            100.0 * masked as f64 / total.max(1) as f64
        );
    }
    masked
}

/// Inverse variances, zero for bad pixels.
pub fn inverse_variance(flux: ArrayView2<f64>, flux_err: ArrayView2<f64>) -> Array2<f64> {
    let mut ivar = Array2::zeros(flux.dim());
    Zip::from(&mut ivar)
        .and(&flux)
        .and(&flux_err)
        .for_each(|w, &f, &e| {
            if !is_bad_pixel(f, e) {
                *w = 1.0 / (e * e);
            }
        });
    ivar
}

/// Median of `flux / flux_err` over each star's good pixels; zero when none are good.
pub fn signal_to_noise(spectra: &Spectra) -> Array1<f64> {
    let snr: Vec<f64> = spectra
        .flux
        .axis_iter(Axis(0))
        .zip(spectra.flux_err.axis_iter(Axis(0)))
        .map(|(flux, err)| {
            let mut ratios: Vec<f64> = flux
                .iter()
                .zip(err.iter())
                .filter(|&(&f, &e)| !is_bad_pixel(f, e))
                .map(|(&f, &e)| f / e)
                .collect();
            median(&mut ratios).unwrap_or(0.0)
        })
        .collect();
    Array1::from_vec(snr)
}

fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    Some(if values.len() % 2 == 0 {
        0.5 * (values[mid - 1] + values[mid])
    } else {
        values[mid]
    })
}
