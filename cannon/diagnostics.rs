// cannon/diagnostics.rs

//! Post-training diagnostics.
//!
//! The quantities worth looking at after a training run (baseline spectrum, leading
//! coefficients, chi-squared distribution and per-star fits) are computed here and
//! handed to a `ReportSink`. What happens to them next is up to the sink; the
//! library ships `TsvReportSink`, which writes one TSV file per record.

use crate::data::TrainingSet;
use crate::labels::num_design_columns;
use crate::model::{CannonModel, ModelError};
use crate::munging::is_bad_pixel;
use ndarray::{ArrayView1, ArrayView2, s};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_HISTOGRAM_BINS: usize = 20;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to write diagnostic report: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Model evaluation failed: {0}")]
    Model(#[from] ModelError),
    #[error("Training set has {found} pixels, but the model has {expected}.")]
    PixelCountMismatch { found: usize, expected: usize },
}

/// Receives the diagnostics of a trained model.
pub trait ReportSink {
    /// The bias coefficient at every pixel.
    fn record_baseline_spectrum(
        &mut self,
        wavelengths: ArrayView1<f64>,
        baseline: ArrayView1<f64>,
    ) -> Result<(), ReportError>;

    /// The linear coefficient of each label at every pixel. Shape: `[npixels, nlabels]`.
    fn record_leading_coefficients(
        &mut self,
        wavelengths: ArrayView1<f64>,
        label_names: &[String],
        coefficients: ArrayView2<f64>,
    ) -> Result<(), ReportError>;

    /// `bin_edges` has one more entry than `counts`.
    fn record_chisq_histogram(
        &mut self,
        bin_edges: &[f64],
        counts: &[usize],
        dof: i64,
    ) -> Result<(), ReportError>;

    /// Observed flux is NaN where the pixel was bad.
    fn record_spectrum_fit(
        &mut self,
        star_id: &str,
        wavelengths: ArrayView1<f64>,
        observed: ArrayView1<f64>,
        fitted: ArrayView1<f64>,
    ) -> Result<(), ReportError>;
}

/// Runs every diagnostic on `model` and its training set.
pub fn model_diagnostics(
    training: &TrainingSet,
    model: &CannonModel,
    sink: &mut dyn ReportSink,
) -> Result<(), ReportError> {
    if training.num_pixels() != model.num_pixels() {
        return Err(ReportError::PixelCountMismatch {
            found: training.num_pixels(),
            expected: model.num_pixels(),
        });
    }
    let wavelengths = model.wavelengths.view();
    let nlabels = model.num_labels();

    sink.record_baseline_spectrum(wavelengths, model.coefficients.column(0))?;
    sink.record_leading_coefficients(
        wavelengths,
        &model.label_names,
        model.coefficients.slice(s![.., 1..1 + nlabels]),
    )?;

    let (edges, counts) = histogram(model.chisqs.view(), DEFAULT_HISTOGRAM_BINS);
    let dof = training.num_stars() as i64 - num_design_columns(nlabels) as i64;
    sink.record_chisq_histogram(&edges, &counts, dof)?;

    for (star, id) in training.ids.iter().enumerate() {
        let fitted = model.predict_spectrum(training.labels.row(star))?;
        let observed = ndarray::Zip::from(training.spectra.flux.row(star))
            .and(training.spectra.flux_err.row(star))
            .map_collect(|&f, &e| if is_bad_pixel(f, e) { f64::NAN } else { f });
        sink.record_spectrum_fit(id, wavelengths, observed.view(), fitted.view())?;
    }
    log::info!(
        "Recorded diagnostics for {} pixels and {} training stars.",
        model.num_pixels(),
        training.num_stars()
    );
    Ok(())
}

/// Equal-width histogram of the finite values. The last bin is closed on the right.
pub fn histogram(values: ArrayView1<f64>, bins: usize) -> (Vec<f64>, Vec<usize>) {
    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() || bins == 0 {
        return (Vec::new(), Vec::new());
    }
    let mut lo = finite.iter().copied().fold(f64::INFINITY, f64::min);
    let mut hi = finite.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if lo == hi {
        lo -= 0.5;
        hi += 0.5;
    }
    let width = (hi - lo) / bins as f64;
    let edges = (0..=bins).map(|i| lo + width * i as f64).collect();

    let mut counts = vec![0usize; bins];
    for v in finite {
        let bin = (((v - lo) / width) as usize).min(bins - 1);
        counts[bin] += 1;
    }
    (edges, counts)
}

/// Writes each record as a TSV file under one directory.
pub struct TsvReportSink {
    dir: PathBuf,
    /// Spectrum-fit file stems already written, so distinct ids never share a file.
    stems: HashSet<String>,
}

impl TsvReportSink {
    /// Creates `dir` (and a `spectrum_fits` subdirectory) if needed.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, ReportError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(dir.join("spectrum_fits"))?;
        Ok(Self {
            dir,
            stems: HashSet::new(),
        })
    }

    /// Sanitized stem for `id`, suffixed with `_1`, `_2`, ... if an earlier id already took it.
    fn unique_stem(&mut self, id: &str) -> String {
        let base = file_stem(id);
        let mut stem = base.clone();
        let mut k = 1;
        while self.stems.contains(&stem) {
            stem = format!("{base}_{k}");
            k += 1;
        }
        if stem != base {
            log::warn!("Spectrum fit of '{id}' collides with another id; writing it as {stem}.tsv.");
        }
        self.stems.insert(stem.clone());
        stem
    }

    fn create(&self, relative: impl AsRef<Path>) -> Result<BufWriter<File>, ReportError> {
        let path = self.dir.join(relative);
        log::debug!("Writing {}", path.display());
        Ok(BufWriter::new(File::create(path)?))
    }
}

impl ReportSink for TsvReportSink {
    fn record_baseline_spectrum(
        &mut self,
        wavelengths: ArrayView1<f64>,
        baseline: ArrayView1<f64>,
    ) -> Result<(), ReportError> {
        let mut file = self.create("baseline_spectrum.tsv")?;
        writeln!(file, "wavelength\ttheta_0")?;
        for (w, b) in wavelengths.iter().zip(baseline.iter()) {
            writeln!(file, "{w}\t{b}")?;
        }
        file.flush()?;
        Ok(())
    }

    fn record_leading_coefficients(
        &mut self,
        wavelengths: ArrayView1<f64>,
        label_names: &[String],
        coefficients: ArrayView2<f64>,
    ) -> Result<(), ReportError> {
        let mut file = self.create("leading_coefficients.tsv")?;
        writeln!(file, "wavelength\t{}", label_names.join("\t"))?;
        for (w, row) in wavelengths.iter().zip(coefficients.outer_iter()) {
            let values: Vec<String> = row.iter().map(|c| c.to_string()).collect();
            writeln!(file, "{w}\t{}", values.join("\t"))?;
        }
        file.flush()?;
        Ok(())
    }

    fn record_chisq_histogram(
        &mut self,
        bin_edges: &[f64],
        counts: &[usize],
        dof: i64,
    ) -> Result<(), ReportError> {
        let mut file = self.create("chisq_histogram.tsv")?;
        writeln!(file, "# dof = {dof}")?;
        writeln!(file, "bin_start\tbin_end\tcount")?;
        for (edge, count) in bin_edges.windows(2).zip(counts) {
            writeln!(file, "{}\t{}\t{count}", edge[0], edge[1])?;
        }
        file.flush()?;
        Ok(())
    }

    fn record_spectrum_fit(
        &mut self,
        star_id: &str,
        wavelengths: ArrayView1<f64>,
        observed: ArrayView1<f64>,
        fitted: ArrayView1<f64>,
    ) -> Result<(), ReportError> {
        let name = format!("spectrum_fits/{}.tsv", self.unique_stem(star_id));
        let mut file = self.create(name)?;
        writeln!(file, "# id = {star_id}")?;
        writeln!(file, "wavelength\tobserved\tfitted")?;
        for ((w, o), f) in wavelengths.iter().zip(observed.iter()).zip(fitted.iter()) {
            if o.is_finite() {
                writeln!(file, "{w}\t{o}\t{f}")?;
            }
        }
        file.flush()?;
        Ok(())
    }
}

fn file_stem(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
