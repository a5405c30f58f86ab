#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use cannon::continuum::{self, ContinuumConfig};
use cannon::data::{Spectra, load_test_set, load_training_set};
use cannon::diagnostics::{TsvReportSink, model_diagnostics};
use cannon::infer::{InferenceConfig, infer_labels};
use cannon::model::{CannonModel, FailurePolicy, TrainingConfig, train_model};
use cannon::munging::{MungingConfig, mask_bad_pixels, signal_to_noise};
use cannon::regression::ScatterGrid;
use clap::{Args, CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(
    name = "cannon",
    about = "Data-driven stellar labels from spectra",
    long_about = "Trains a quadratic-in-labels spectral model on stars with known labels, \
                 then transfers those labels to new spectra."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a spectral model from a labelled reference set
    #[command(about = "Train a spectral model (outputs: model.toml)")]
    Train(TrainArgs),

    /// Infer labels of new spectra with a trained model
    #[command(about = "Infer labels for new spectra (outputs: labels.tsv)")]
    Infer(InferArgs),
}

/// Options shared by both commands that prepare raw spectra.
#[derive(Args)]
struct PreprocessArgs {
    /// File of continuum pixel indices, one per line; enables continuum normalization
    #[arg(long, value_name = "PATH")]
    continuum_pixels: Option<String>,

    /// Pixel segments normalized independently, e.g. 371:3192,3697:5997
    #[arg(long, value_name = "START:STOP,...", value_parser = parse_segments, requires = "continuum_pixels")]
    segments: Option<Segments>,

    /// Chebyshev degree of the continuum fit
    #[arg(long, default_value = "3")]
    continuum_degree: usize,
}

/// Half-open pixel ranges given on the command line.
#[derive(Clone, Debug, PartialEq)]
struct Segments(Vec<(usize, usize)>);

#[derive(Args)]
struct TrainArgs {
    /// Path to the label TSV file with id,label1,label2,... columns
    #[arg(value_name = "LABELS")]
    labels_path: String,

    /// Path to the spectra TSV file with id,wavelength,flux,flux_err columns
    spectra: String,

    /// Comma-separated subset of label columns to train on (default: all)
    #[arg(long = "labels", value_name = "NAME,...", value_delimiter = ',')]
    label_names: Option<Vec<String>>,

    /// Where to write the trained model
    #[arg(long, default_value = "model.toml")]
    output: String,

    /// Natural log of the smallest intrinsic scatter on the search grid
    #[arg(long, default_value_t = ScatterGrid::default().ln_min, allow_negative_numbers = true)]
    ln_scatter_min: f64,

    /// Step between grid points in natural-log scatter
    #[arg(long, default_value_t = ScatterGrid::default().ln_step)]
    ln_scatter_step: f64,

    /// Stop at the first pixel that cannot be fitted instead of recording it
    #[arg(long)]
    abort_on_failure: bool,

    /// Directory for diagnostic TSV files (baseline, coefficients, chi-squared, fits)
    #[arg(long, value_name = "DIR")]
    report_dir: Option<PathBuf>,

    #[command(flatten)]
    preprocess: PreprocessArgs,
}

#[derive(Args)]
struct InferArgs {
    /// Path to the spectra TSV file with id,wavelength,flux,flux_err columns
    spectra: String,

    /// Path to a trained model file (.toml)
    #[arg(long)]
    model: String,

    /// Where to write the inferred labels
    #[arg(long, default_value = "labels.tsv")]
    output: String,

    /// Gradient-norm tolerance of the label optimizer
    #[arg(long, default_value_t = InferenceConfig::default().tolerance)]
    tolerance: f64,

    /// Iteration cap of the label optimizer
    #[arg(long, default_value_t = InferenceConfig::default().max_iterations)]
    max_iterations: usize,

    #[command(flatten)]
    preprocess: PreprocessArgs,
}

fn parse_segments(value: &str) -> Result<Segments, String> {
    value
        .split(',')
        .map(|segment| {
            let (start, stop) = segment
                .split_once(':')
                .ok_or_else(|| format!("segment '{segment}' is not of the form START:STOP"))?;
            let start = start
                .trim()
                .parse::<usize>()
                .map_err(|e| format!("bad segment start '{start}': {e}"))?;
            let stop = stop
                .trim()
                .parse::<usize>()
                .map_err(|e| format!("bad segment stop '{stop}': {e}"))?;
            Ok((start, stop))
        })
        .collect::<Result<Vec<_>, String>>()
        .map(Segments)
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Some(Commands::Train(args)) => train(args),
        Some(Commands::Infer(args)) => infer(args),
        None => {
            let _ = Cli::command().print_help();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

/// Masks bad pixels and, when continuum pixels are given, normalizes every star.
fn preprocess(
    spectra: &mut Spectra,
    args: &PreprocessArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let munging = MungingConfig::default();
    mask_bad_pixels(spectra, &munging);

    if let Some(path) = &args.continuum_pixels {
        let mask = continuum::read_continuum_pixels(path, spectra.num_pixels())?;
        let config = ContinuumConfig {
            segments: args
                .segments
                .as_ref()
                .map(|s| s.0.clone())
                .unwrap_or_default(),
            degree: args.continuum_degree,
            large_error: munging.large_error,
        };
        continuum::normalize(spectra, &mask, &config)?;
    }

    let snr = signal_to_noise(spectra);
    if !snr.is_empty() {
        log::info!(
            "Median per-star SNR ranges from {:.1} to {:.1}.",
            snr.iter().copied().fold(f64::INFINITY, f64::min),
            snr.iter().copied().fold(f64::NEG_INFINITY, f64::max)
        );
    }
    Ok(())
}

fn train(args: TrainArgs) -> Result<(), Box<dyn std::error::Error>> {
    println!(
        "Loading training set from: {} and {}",
        args.labels_path, args.spectra
    );
    let mut training = load_training_set(
        &args.labels_path,
        &args.spectra,
        args.label_names.as_deref(),
    )?;
    preprocess(&mut training.spectra, &args.preprocess)?;

    let config = TrainingConfig {
        scatter_grid: ScatterGrid {
            ln_min: args.ln_scatter_min,
            ln_step: args.ln_scatter_step,
            ..ScatterGrid::default()
        },
        failure_policy: if args.abort_on_failure {
            FailurePolicy::Abort
        } else {
            FailurePolicy::RecordAndSkip
        },
    };

    let model = train_model(&training, &config)?;
    model.save(&args.output)?;
    println!("Model saved to: {}", args.output);

    if let Some(dir) = &args.report_dir {
        let mut sink = TsvReportSink::new(dir)?;
        model_diagnostics(&training, &model, &mut sink)?;
        println!("Diagnostics written to: {}", dir.display());
    }
    Ok(())
}

fn infer(args: InferArgs) -> Result<(), Box<dyn std::error::Error>> {
    println!("Loading model from: {}", args.model);
    let model = CannonModel::load(&args.model)?;

    println!("Loading spectra from: {}", args.spectra);
    let mut test = load_test_set(&args.spectra)?;
    preprocess(&mut test.spectra, &args.preprocess)?;

    let config = InferenceConfig {
        tolerance: args.tolerance,
        max_iterations: args.max_iterations,
    };
    let inferred = infer_labels(&model, &test, &config)?;
    inferred.write_tsv(&args.output)?;
    println!("Inferred labels for {} stars saved to: {}", inferred.ids.len(), args.output);
    Ok(())
}
