//! # Continuum Normalization
//!
//! Divides each spectrum by a smooth continuum so that flux values sit near unity.
//! Within every configured pixel segment, a Chebyshev polynomial in wavelength is
//! fitted by inverse-variance weighted least squares, using only pixels flagged as
//! continuum. Flux and flux errors are both divided by the fitted continuum.
//!
//! Pixels outside every segment, and pixels that come out of the division unusable,
//! are set to unit flux with a very large error.

use crate::data::Spectra;
use crate::munging::is_bad_pixel;
use ndarray::parallel::prelude::*;
use ndarray::{Array1, Array2, ArrayView1, Axis, s};
use ndarray_linalg::Solve;
use ndarray_linalg::error::LinalgError;
use polars::prelude::{CsvReadOptions, CsvReader, DataType, PolarsError, SerReader};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ContinuumError {
    #[error("Segment {start}..{stop} does not fit within a spectrum of {npixels} pixels.")]
    SegmentOutOfRange {
        start: usize,
        stop: usize,
        npixels: usize,
    },
    #[error("Continuum mask has {found} entries, but spectra have {expected} pixels.")]
    MaskLength { expected: usize, found: usize },
    #[error(
        "Star {star}, segment {start}..{stop}: only {found} usable continuum pixels, need at least {required}."
    )]
    TooFewContinuumPixels {
        star: usize,
        start: usize,
        stop: usize,
        found: usize,
        required: usize,
    },
    #[error("Star {star}, segment {start}..{stop}: continuum fit failed: {source}")]
    FitFailed {
        star: usize,
        start: usize,
        stop: usize,
        #[source]
        source: LinalgError,
    },
    #[error("Failed to read continuum pixel list: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("Failed to open continuum pixel list: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Continuum pixel index {index} is outside a spectrum of {npixels} pixels.")]
    PixelOutOfRange { index: i64, npixels: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuumConfig {
    /// Half-open pixel ranges fitted independently. Empty means the whole spectrum.
    pub segments: Vec<(usize, usize)>,
    /// Chebyshev polynomial degree.
    pub degree: usize,
    /// Error assigned to pixels without a usable normalized value.
    pub large_error: f64,
}

impl Default for ContinuumConfig {
    fn default() -> Self {
        Self {
            segments: Vec::new(),
            degree: 3,
            large_error: 1e6,
        }
    }
}

impl ContinuumConfig {
    /// The three APOGEE detector chips, with ~50 edge pixels discarded on each side.
    pub fn apogee() -> Self {
        Self {
            segments: vec![(371, 3192), (3697, 5997), (6461, 8255)],
            ..Self::default()
        }
    }

    fn resolved_segments(&self, npixels: usize) -> Result<Vec<(usize, usize)>, ContinuumError> {
        if self.segments.is_empty() {
            return Ok(vec![(0, npixels)]);
        }
        for &(start, stop) in &self.segments {
            if start >= stop || stop > npixels {
                return Err(ContinuumError::SegmentOutOfRange {
                    start,
                    stop,
                    npixels,
                });
            }
        }
        Ok(self.segments.clone())
    }
}

/// Chebyshev polynomials `T_0..=T_degree` evaluated at `x` (already mapped to [-1, 1]).
///
/// Shape: `[x.len(), degree + 1]`.
pub fn chebyshev_basis(x: ArrayView1<f64>, degree: usize) -> Array2<f64> {
    let mut basis = Array2::zeros((x.len(), degree + 1));
    for (i, &xi) in x.iter().enumerate() {
        basis[[i, 0]] = 1.0;
        if degree >= 1 {
            basis[[i, 1]] = xi;
        }
        for k in 2..=degree {
            basis[[i, k]] = 2.0 * xi * basis[[i, k - 1]] - basis[[i, k - 2]];
        }
    }
    basis
}

/// Maps wavelengths linearly onto [-1, 1].
fn to_window(wavelengths: ArrayView1<f64>) -> Array1<f64> {
    let lo = wavelengths.iter().cloned().fold(f64::INFINITY, f64::min);
    let hi = wavelengths.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let half_width = 0.5 * (hi - lo);
    if half_width <= 0.0 || !half_width.is_finite() {
        return Array1::zeros(wavelengths.len());
    }
    let center = 0.5 * (hi + lo);
    wavelengths.mapv(|w| (w - center) / half_width)
}

/// Normalizes every star in place. Returns the fitted continua, shape `[nstars, npixels]`.
///
/// `continuum_pixels[p]` marks pixel `p` as usable for the continuum fit.
pub fn normalize(
    spectra: &mut Spectra,
    continuum_pixels: &[bool],
    config: &ContinuumConfig,
) -> Result<Array2<f64>, ContinuumError> {
    let npixels = spectra.num_pixels();
    if continuum_pixels.len() != npixels {
        return Err(ContinuumError::MaskLength {
            expected: npixels,
            found: continuum_pixels.len(),
        });
    }
    let segments = config.resolved_segments(npixels)?;

    let wavelengths = spectra.wavelengths.view();
    let results: Vec<(Array1<f64>, Array1<f64>, Array1<f64>)> = spectra
        .flux
        .axis_iter(Axis(0))
        .into_par_iter()
        .zip(spectra.flux_err.axis_iter(Axis(0)).into_par_iter())
        .enumerate()
        .map(|(star, (flux, err))| {
            normalize_star(star, wavelengths, flux, err, continuum_pixels, &segments, config)
        })
        .collect::<Result<_, _>>()?;

    let mut continua = Array2::zeros((spectra.num_stars(), npixels));
    for (star, (flux, err, continuum)) in results.into_iter().enumerate() {
        spectra.flux.row_mut(star).assign(&flux);
        spectra.flux_err.row_mut(star).assign(&err);
        continua.row_mut(star).assign(&continuum);
    }
    log::info!(
        "Continuum-normalized {} spectra over {} segment(s).",
        spectra.num_stars(),
        segments.len()
    );
    Ok(continua)
}

fn normalize_star(
    star: usize,
    wavelengths: ArrayView1<f64>,
    flux: ArrayView1<f64>,
    err: ArrayView1<f64>,
    continuum_pixels: &[bool],
    segments: &[(usize, usize)],
    config: &ContinuumConfig,
) -> Result<(Array1<f64>, Array1<f64>, Array1<f64>), ContinuumError> {
    let npixels = flux.len();
    let mut norm_flux = Array1::from_elem(npixels, 1.0);
    let mut norm_err = Array1::from_elem(npixels, config.large_error);
    let mut continuum = Array1::zeros(npixels);

    for &(start, stop) in segments {
        let x = to_window(wavelengths.slice(s![start..stop]));
        let basis = chebyshev_basis(x.view(), config.degree);
        let seg_flux = flux.slice(s![start..stop]);
        let seg_err = err.slice(s![start..stop]);

        let weights: Array1<f64> = (start..stop)
            .map(|p| {
                let (f, e) = (flux[p], err[p]);
                if continuum_pixels[p] && !is_bad_pixel(f, e) {
                    1.0 / (e * e)
                } else {
                    0.0
                }
            })
            .collect();
        let usable = weights.iter().filter(|&&w| w > 0.0).count();
        if usable < config.degree + 1 {
            return Err(ContinuumError::TooFewContinuumPixels {
                star,
                start,
                stop,
                found: usable,
                required: config.degree + 1,
            });
        }

        let weighted_basis = &basis * &weights.view().insert_axis(Axis(1));
        let lhs = basis.t().dot(&weighted_basis);
        let rhs = weighted_basis.t().dot(&seg_flux.mapv(|f| if f.is_finite() { f } else { 0.0 }));
        let coeffs = lhs.solve(&rhs).map_err(|source| ContinuumError::FitFailed {
            star,
            start,
            stop,
            source,
        })?;
        let fitted = basis.dot(&coeffs);

        for (i, p) in (start..stop).enumerate() {
            continuum[p] = fitted[i];
            let f = seg_flux[i] / fitted[i];
            let e = seg_err[i] / fitted[i];
            if is_bad_pixel(f, e) {
                norm_flux[p] = 1.0;
                norm_err[p] = config.large_error;
            } else {
                norm_flux[p] = f;
                norm_err[p] = e;
            }
        }
    }

    Ok((norm_flux, norm_err, continuum))
}

/// Pixels whose ensemble median flux is within `flux_cut` of unity and whose
/// ensemble variance is below `variance_cut`. Intended for already-normalized spectra.
pub fn find_continuum_pixels(spectra: &Spectra, flux_cut: f64, variance_cut: f64) -> Vec<bool> {
    spectra
        .flux
        .axis_iter(Axis(1))
        .map(|column| {
            let mut values = column.to_vec();
            values.sort_by(|a, b| a.total_cmp(b));
            let n = values.len();
            let median = if n % 2 == 0 {
                0.5 * (values[n / 2 - 1] + values[n / 2])
            } else {
                values[n / 2]
            };
            let variance = column.var(0.0);
            (median - 1.0).abs() < flux_cut && variance < variance_cut
        })
        .collect()
}

/// Reads a list of continuum pixel indices, one per line with no header.
pub fn read_continuum_pixels(path: &str, npixels: usize) -> Result<Vec<bool>, ContinuumError> {
    let df = CsvReader::new(File::open(Path::new(path))?)
        .with_options(CsvReadOptions::default().with_has_header(false))
        .finish()?;

    let mut mask = vec![false; npixels];
    let Some(column) = df.get_columns().first() else {
        return Ok(mask);
    };
    let casted = column.cast(&DataType::Int64)?;
    for index in casted.i64()?.into_iter().flatten() {
        if index < 0 || index as usize >= npixels {
            return Err(ContinuumError::PixelOutOfRange { index, npixels });
        }
        mask[index as usize] = true;
    }
    log::info!(
        "Loaded {} continuum pixels from '{path}'.",
        mask.iter().filter(|&&c| c).count()
    );
    Ok(mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn sloped_spectra(npixels: usize) -> Spectra {
        let wavelengths = Array1::from_shape_fn(npixels, |p| 15000.0 + p as f64);
        let continuum = wavelengths.mapv(|w| 2.0 + 0.001 * (w - 15000.0));
        let mut flux = Array2::zeros((2, npixels));
        for star in 0..2 {
            let depth = if star == 0 { 0.8 } else { 0.6 };
            for p in 0..npixels {
                // Every fifth pixel carries an absorption line.
                let line = if p % 5 == 0 { depth } else { 1.0 };
                flux[[star, p]] = continuum[p] * line;
            }
        }
        let flux_err = Array2::from_elem((2, npixels), 0.01);
        Spectra::new(wavelengths, flux, flux_err).unwrap()
    }

    #[test]
    fn chebyshev_basis_matches_closed_form() {
        let x = Array1::from_vec(vec![-1.0, -0.3, 0.0, 0.5, 1.0]);
        let b = chebyshev_basis(x.view(), 3);
        for (i, &xi) in x.iter().enumerate() {
            assert_abs_diff_eq!(b[[i, 0]], 1.0);
            assert_abs_diff_eq!(b[[i, 1]], xi);
            assert_abs_diff_eq!(b[[i, 2]], 2.0 * xi * xi - 1.0, epsilon = 1e-14);
            assert_abs_diff_eq!(b[[i, 3]], 4.0 * xi.powi(3) - 3.0 * xi, epsilon = 1e-14);
        }
    }

    #[test]
    fn linear_continuum_is_removed() {
        let mut spectra = sloped_spectra(50);
        let mask: Vec<bool> = (0..50).map(|p| p % 5 != 0).collect();
        let continua = normalize(&mut spectra, &mask, &ContinuumConfig::default()).unwrap();

        for p in 0..50 {
            let expected = if p % 5 == 0 { 0.8 } else { 1.0 };
            assert_abs_diff_eq!(spectra.flux[[0, p]], expected, epsilon = 1e-8);
            assert_abs_diff_eq!(continua[[1, p]], 2.0 + 0.001 * p as f64, epsilon = 1e-8);
        }
        assert_abs_diff_eq!(spectra.flux_err[[0, 0]], 0.01 / 2.0, epsilon = 1e-9);
    }

    #[test]
    fn pixels_outside_segments_are_blanked() {
        let mut spectra = sloped_spectra(40);
        let mask = vec![true; 40];
        let config = ContinuumConfig {
            segments: vec![(5, 20), (25, 38)],
            ..ContinuumConfig::default()
        };
        normalize(&mut spectra, &mask, &config).unwrap();
        for p in [0, 4, 20, 24, 38, 39] {
            assert_abs_diff_eq!(spectra.flux[[0, p]], 1.0);
            assert_abs_diff_eq!(spectra.flux_err[[0, p]], 1e6);
        }
        assert!(spectra.flux_err[[0, 10]] < 1.0);
    }

    #[test]
    fn segment_validation_and_sparse_masks() {
        let mut spectra = sloped_spectra(20);
        let config = ContinuumConfig {
            segments: vec![(0, 30)],
            ..ContinuumConfig::default()
        };
        assert!(matches!(
            normalize(&mut spectra, &[true; 20], &config),
            Err(ContinuumError::SegmentOutOfRange { stop: 30, .. })
        ));

        let mut sparse = vec![false; 20];
        sparse[3] = true;
        sparse[7] = true;
        assert!(matches!(
            normalize(&mut spectra, &sparse, &ContinuumConfig::default()),
            Err(ContinuumError::TooFewContinuumPixels { found: 2, required: 4, .. })
        ));
    }

    #[test]
    fn continuum_pixels_are_found_in_flat_regions() {
        let mut spectra = sloped_spectra(30);
        let mask: Vec<bool> = (0..30).map(|p| p % 5 != 0).collect();
        normalize(&mut spectra, &mask, &ContinuumConfig::default()).unwrap();
        let found = find_continuum_pixels(&spectra, 1e-4, 0.005);
        assert_eq!(found, mask);
    }

    #[test]
    fn continuum_pixel_list_is_read() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "1\n4\n5").unwrap();
        file.flush().unwrap();
        let mask = read_continuum_pixels(file.path().to_str().unwrap(), 6).unwrap();
        assert_eq!(mask, vec![false, true, false, false, true, true]);

        assert!(matches!(
            read_continuum_pixels(file.path().to_str().unwrap(), 5),
            Err(ContinuumError::PixelOutOfRange { index: 5, .. })
        ));
    }
}
