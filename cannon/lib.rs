#![deny(dead_code)]
#![deny(unused_imports)]

//! # The Cannon
//!
//! Transfers stellar labels (effective temperature, surface gravity, metallicity, ...)
//! from a reference set of stars to new spectra. Training fits, independently at every
//! wavelength pixel, a flux model that is quadratic in the labels together with an
//! intrinsic scatter term. Inference then finds the labels that best reproduce a new
//! spectrum under the trained model.
//!
//! The numerical core (`labels`, `regression`) performs no I/O. File ingestion, model
//! persistence, masking, continuum normalization and reporting live in the surrounding
//! modules and hand plain `ndarray` structures to the core.

pub mod continuum;
pub mod data;
pub mod diagnostics;
pub mod infer;
pub mod labels;
pub mod model;
pub mod munging;
pub mod regression;
