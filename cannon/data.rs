//! # Data Loading and Validation Module
//!
//! Entry point for user-provided training and test data. Reads tab-separated label
//! and spectra tables, validates them, and produces the rectangular `ndarray`
//! structures consumed by the numerical core.
//!
//! - Label table: an `id` column plus one numeric column per label.
//! - Spectra table: `id`, `wavelength`, `flux`, `flux_err`, one row per star and
//!   pixel, with each star's pixels listed in wavelength order.
//!
//! Every star must be sampled on the same wavelength grid. Stars are ordered by `id`.
//! Flux values are not required to be finite here; bad pixels are handled by the
//! `munging` module.

use ndarray::{Array1, Array2, Array3, ArrayView1, Axis, s};
use polars::prelude::*;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// Relative tolerance when comparing wavelength grids between stars.
const WAVELENGTH_RTOL: f64 = 1e-9;

/// A comprehensive error type for all data loading and validation failures.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error("Missing or null values were found in the required column '{0}'.")]
    MissingValuesFound(String),
    #[error("Non-finite values (NaN or Infinity) were found in the label column '{0}'.")]
    NonFiniteValuesFound(String),
    #[error("Expected {expected} for {what}, found {found}.")]
    ShapeMismatch {
        what: &'static str,
        expected: String,
        found: String,
    },
    #[error(
        "Star '{id}' is not sampled on the common wavelength grid (first difference at pixel {pixel})."
    )]
    WavelengthMismatch { id: String, pixel: usize },
    #[error("Star '{0}' has labels but no spectrum.")]
    MissingSpectrum(String),
    #[error("Star '{0}' appears more than once in the label table.")]
    DuplicateStar(String),
    #[error("The input contains no stars.")]
    NoStars,
}

/// Spectra of a set of stars on a shared wavelength grid.
#[derive(Debug, Clone)]
pub struct Spectra {
    /// Shape: `[npixels]`.
    pub wavelengths: Array1<f64>,
    /// Shape: `[nstars, npixels]`.
    pub flux: Array2<f64>,
    /// Shape: `[nstars, npixels]`.
    pub flux_err: Array2<f64>,
}

impl Spectra {
    pub fn new(
        wavelengths: Array1<f64>,
        flux: Array2<f64>,
        flux_err: Array2<f64>,
    ) -> Result<Self, DataError> {
        if flux.ncols() != wavelengths.len() {
            return Err(shape_error(
                "flux columns",
                wavelengths.len(),
                flux.ncols(),
            ));
        }
        if flux_err.dim() != flux.dim() {
            return Err(DataError::ShapeMismatch {
                what: "flux errors",
                expected: format!("{:?}", flux.dim()),
                found: format!("{:?}", flux_err.dim()),
            });
        }
        Ok(Self {
            wavelengths,
            flux,
            flux_err,
        })
    }

    /// Builds spectra from an `[nstars, npixels, 3]` array of (wavelength, flux, flux_err).
    ///
    /// The wavelengths of the first star define the grid; every other star must match it.
    pub fn from_stacked(stacked: &Array3<f64>, ids: &[String]) -> Result<Self, DataError> {
        let (nstars, npixels, depth) = stacked.dim();
        if depth != 3 {
            return Err(shape_error("spectrum tuple width", 3, depth));
        }
        if nstars == 0 {
            return Err(DataError::NoStars);
        }
        if ids.len() != nstars {
            return Err(shape_error("star identifiers", nstars, ids.len()));
        }
        let wavelengths = stacked.slice(s![0, .., 0]).to_owned();
        for (star, id) in ids.iter().enumerate() {
            check_wavelengths(id, wavelengths.view(), stacked.slice(s![star, .., 0]))?;
        }
        let flux = stacked.slice(s![.., .., 1]).to_owned();
        let flux_err = stacked.slice(s![.., .., 2]).to_owned();
        debug_assert_eq!(flux.dim(), (nstars, npixels));
        Self::new(wavelengths, flux, flux_err)
    }

    pub fn num_stars(&self) -> usize {
        self.flux.nrows()
    }

    pub fn num_pixels(&self) -> usize {
        self.wavelengths.len()
    }
}

/// Reference stars with known labels, ready for model training.
#[derive(Debug, Clone)]
pub struct TrainingSet {
    pub ids: Vec<String>,
    pub label_names: Vec<String>,
    /// Shape: `[nstars, nlabels]`.
    pub labels: Array2<f64>,
    pub spectra: Spectra,
}

impl TrainingSet {
    pub fn new(
        ids: Vec<String>,
        label_names: Vec<String>,
        labels: Array2<f64>,
        spectra: Spectra,
    ) -> Result<Self, DataError> {
        if spectra.num_stars() == 0 {
            return Err(DataError::NoStars);
        }
        if ids.len() != spectra.num_stars() {
            return Err(shape_error("star identifiers", spectra.num_stars(), ids.len()));
        }
        if labels.nrows() != spectra.num_stars() {
            return Err(shape_error("label rows", spectra.num_stars(), labels.nrows()));
        }
        if labels.ncols() != label_names.len() {
            return Err(shape_error("label columns", label_names.len(), labels.ncols()));
        }
        for (k, name) in label_names.iter().enumerate() {
            if labels.column(k).iter().any(|v| !v.is_finite()) {
                return Err(DataError::NonFiniteValuesFound(name.clone()));
            }
        }
        Ok(Self {
            ids,
            label_names,
            labels,
            spectra,
        })
    }

    pub fn num_stars(&self) -> usize {
        self.spectra.num_stars()
    }

    pub fn num_labels(&self) -> usize {
        self.label_names.len()
    }

    pub fn num_pixels(&self) -> usize {
        self.spectra.num_pixels()
    }
}

/// Stars whose labels are to be inferred.
#[derive(Debug, Clone)]
pub struct TestSet {
    pub ids: Vec<String>,
    pub spectra: Spectra,
}

impl TestSet {
    pub fn new(ids: Vec<String>, spectra: Spectra) -> Result<Self, DataError> {
        if spectra.num_stars() == 0 {
            return Err(DataError::NoStars);
        }
        if ids.len() != spectra.num_stars() {
            return Err(shape_error("star identifiers", spectra.num_stars(), ids.len()));
        }
        Ok(Self { ids, spectra })
    }
}

/// Loads the label table and spectra and joins them by star `id`.
///
/// When `label_names` is `None`, every non-`id` column of the label table is used.
pub fn load_training_set(
    labels_path: &str,
    spectra_path: &str,
    label_names: Option<&[String]>,
) -> Result<TrainingSet, DataError> {
    let (ids, names, labels) = internal::load_label_table(labels_path, label_names)?;
    let table = internal::load_spectra_table(spectra_path)?;

    let index: HashMap<&str, usize> = table
        .ids
        .iter()
        .enumerate()
        .map(|(i, id)| (id.as_str(), i))
        .collect();

    let npixels = table.spectra.num_pixels();
    let mut flux = Array2::zeros((ids.len(), npixels));
    let mut flux_err = Array2::zeros((ids.len(), npixels));
    for (row, id) in ids.iter().enumerate() {
        let Some(&src) = index.get(id.as_str()) else {
            return Err(DataError::MissingSpectrum(id.clone()));
        };
        flux.row_mut(row).assign(&table.spectra.flux.row(src));
        flux_err.row_mut(row).assign(&table.spectra.flux_err.row(src));
    }

    log::info!(
        "Loaded training set: {} stars, {} labels {:?}, {} pixels.",
        ids.len(),
        names.len(),
        names,
        npixels
    );
    let spectra = Spectra::new(table.spectra.wavelengths, flux, flux_err)?;
    TrainingSet::new(ids, names, labels, spectra)
}

/// Loads spectra of stars with unknown labels.
pub fn load_test_set(spectra_path: &str) -> Result<TestSet, DataError> {
    let table = internal::load_spectra_table(spectra_path)?;
    log::info!(
        "Loaded test set: {} stars, {} pixels.",
        table.ids.len(),
        table.spectra.num_pixels()
    );
    TestSet::new(table.ids, table.spectra)
}

fn shape_error(what: &'static str, expected: usize, found: usize) -> DataError {
    DataError::ShapeMismatch {
        what,
        expected: expected.to_string(),
        found: found.to_string(),
    }
}

fn check_wavelengths(
    id: &str,
    reference: ArrayView1<f64>,
    candidate: ArrayView1<f64>,
) -> Result<(), DataError> {
    if candidate.len() != reference.len() {
        return Err(DataError::WavelengthMismatch {
            id: id.to_string(),
            pixel: reference.len().min(candidate.len()),
        });
    }
    for (pixel, (&a, &b)) in reference.iter().zip(candidate.iter()).enumerate() {
        if (a - b).abs() > WAVELENGTH_RTOL * a.abs().max(b.abs()) {
            return Err(DataError::WavelengthMismatch {
                id: id.to_string(),
                pixel,
            });
        }
    }
    Ok(())
}

/// Internal module for shared table reading logic.
mod internal {
    use super::*;

    pub(super) struct SpectraTable {
        pub ids: Vec<String>,
        pub spectra: Spectra,
    }

    fn read_tsv(path: &str) -> Result<DataFrame, DataError> {
        log::info!("Loading data from '{path}'");
        let df = CsvReader::new(File::open(Path::new(path))?)
            .with_options(
                CsvReadOptions::default()
                    .with_has_header(true)
                    .with_parse_options(CsvParseOptions::default().with_separator(b'\t')),
            )
            .finish()?;
        Ok(df)
    }

    fn require_columns(df: &DataFrame, required: &[String]) -> Result<(), DataError> {
        let present: HashSet<String> = df
            .get_column_names()
            .into_iter()
            .map(|s| s.to_string())
            .collect();
        for col_name in required {
            if !present.contains(col_name) {
                return Err(DataError::ColumnNotFound(col_name.clone()));
            }
        }
        Ok(())
    }

    fn extract_numeric_column(df: &DataFrame, column_name: &str) -> Result<Vec<f64>, DataError> {
        let series = df.column(column_name)?;
        if series.null_count() > 0 {
            return Err(DataError::MissingValuesFound(column_name.to_string()));
        }

        let casted = match series.cast(&DataType::Float64) {
            Ok(casted) => casted,
            Err(_) => {
                return Err(DataError::ColumnWrongType {
                    column_name: column_name.to_string(),
                    expected_type: "f64 (numeric)",
                    found_type: format!("{:?}", series.dtype()),
                });
            }
        };
        if casted.null_count() > 0 {
            return Err(DataError::ColumnWrongType {
                column_name: column_name.to_string(),
                expected_type: "f64 (numeric)",
                found_type: format!("{:?}", series.dtype()),
            });
        }

        let chunked = casted.f64()?.rechunk();
        Ok(chunked.into_no_null_iter().collect())
    }

    fn extract_id_column(df: &DataFrame) -> Result<Vec<String>, DataError> {
        let series = df.column("id")?;
        if series.null_count() > 0 {
            return Err(DataError::MissingValuesFound("id".to_string()));
        }
        let casted = series.cast(&DataType::String)?;
        let ids = casted
            .str()?
            .into_iter()
            .map(|v| v.unwrap_or_default().to_string())
            .collect();
        Ok(ids)
    }

    pub(super) fn load_label_table(
        path: &str,
        label_names: Option<&[String]>,
    ) -> Result<(Vec<String>, Vec<String>, Array2<f64>), DataError> {
        let df = read_tsv(path)?;
        require_columns(&df, &["id".to_string()])?;

        let names: Vec<String> = match label_names {
            Some(names) => names.to_vec(),
            None => df
                .get_column_names()
                .into_iter()
                .map(|s| s.to_string())
                .filter(|name| name != "id")
                .collect(),
        };
        require_columns(&df, &names)?;

        let ids = extract_id_column(&df)?;
        if ids.is_empty() {
            return Err(DataError::NoStars);
        }
        let mut seen = HashSet::with_capacity(ids.len());
        for id in &ids {
            if !seen.insert(id.as_str()) {
                return Err(DataError::DuplicateStar(id.clone()));
            }
        }

        let mut labels = Array2::zeros((ids.len(), names.len()));
        for (k, name) in names.iter().enumerate() {
            let values = extract_numeric_column(&df, name)?;
            if values.iter().any(|v| !v.is_finite()) {
                return Err(DataError::NonFiniteValuesFound(name.clone()));
            }
            labels.column_mut(k).assign(&Array1::from_vec(values));
        }

        // Stars are processed in identifier order.
        let mut order: Vec<usize> = (0..ids.len()).collect();
        order.sort_by(|&a, &b| ids[a].cmp(&ids[b]));
        let sorted_ids = order.iter().map(|&i| ids[i].clone()).collect();
        let sorted_labels = labels.select(Axis(0), &order);

        log::info!("Loaded {} labels: {:?}", names.len(), names);
        Ok((sorted_ids, names, sorted_labels))
    }

    pub(super) fn load_spectra_table(path: &str) -> Result<SpectraTable, DataError> {
        let df = read_tsv(path)?;
        let required: Vec<String> = ["id", "wavelength", "flux", "flux_err"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        require_columns(&df, &required)?;

        let row_ids = extract_id_column(&df)?;
        let wavelength = extract_numeric_column(&df, "wavelength")?;
        let flux = extract_numeric_column(&df, "flux")?;
        let flux_err = extract_numeric_column(&df, "flux_err")?;

        // Group rows by star, preserving the order of first appearance.
        let mut star_rows: Vec<(String, Vec<usize>)> = Vec::new();
        let mut position: HashMap<&str, usize> = HashMap::new();
        for (row, id) in row_ids.iter().enumerate() {
            match position.get(id.as_str()) {
                Some(&slot) => star_rows[slot].1.push(row),
                None => {
                    position.insert(id.as_str(), star_rows.len());
                    star_rows.push((id.clone(), vec![row]));
                }
            }
        }
        if star_rows.is_empty() {
            return Err(DataError::NoStars);
        }
        star_rows.sort_by(|a, b| a.0.cmp(&b.0));

        let reference: Array1<f64> = star_rows[0].1.iter().map(|&r| wavelength[r]).collect();
        let npixels = reference.len();
        let nstars = star_rows.len();
        let mut flux_matrix = Array2::zeros((nstars, npixels));
        let mut err_matrix = Array2::zeros((nstars, npixels));

        for (star, (id, rows)) in star_rows.iter().enumerate() {
            let waves: Array1<f64> = rows.iter().map(|&r| wavelength[r]).collect();
            check_wavelengths(id, reference.view(), waves.view())?;
            for (pixel, &r) in rows.iter().enumerate() {
                flux_matrix[[star, pixel]] = flux[r];
                err_matrix[[star, pixel]] = flux_err[r];
            }
        }

        let ids = star_rows.into_iter().map(|(id, _)| id).collect();
        Ok(SpectraTable {
            ids,
            spectra: Spectra::new(reference, flux_matrix, err_matrix)?,
        })
    }
}
