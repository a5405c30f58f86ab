//! Construction of the label vector (design matrix) shared by every pixel regression.
//!
//! For a star with labels `l` and training pivots `p`, the label vector is
//!
//! ```text
//! [1, (l_0 - p_0), ..., (l_{n-1} - p_{n-1}), (l_i - p_i)(l_j - p_j) for i <= j]
//! ```
//!
//! with the quadratic terms taken from the upper triangle (diagonal included) of the
//! outer product of centered labels, in row-major order.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayViewMut1, Axis};

/// Pivots and design matrix for a training set.
#[derive(Debug, Clone)]
pub struct LabelVector {
    /// Column means of the reference labels. Shape: `[nlabels]`.
    pub pivots: Array1<f64>,
    /// Shape: `[nstars, num_design_columns(nlabels)]`.
    pub design: Array2<f64>,
}

/// Number of design columns for `nlabels` labels: bias, linear, and quadratic/cross terms.
pub fn num_design_columns(nlabels: usize) -> usize {
    1 + nlabels + nlabels * (nlabels + 1) / 2
}

/// Builds pivots and the design matrix from an `[nstars, nlabels]` label matrix.
///
/// Pure arithmetic: NaN labels propagate into the affected pivots and rows.
pub fn build_label_vector(labels: ArrayView2<f64>) -> LabelVector {
    let nlabels = labels.ncols();
    let pivots = labels
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::from_elem(nlabels, f64::NAN));

    let mut design = Array2::zeros((labels.nrows(), num_design_columns(nlabels)));
    for (star_labels, row) in labels.outer_iter().zip(design.outer_iter_mut()) {
        fill_design_row(star_labels, pivots.view(), row);
    }

    LabelVector { pivots, design }
}

/// Label vector of a single star relative to the given pivots.
pub fn design_row(labels: ArrayView1<f64>, pivots: ArrayView1<f64>) -> Array1<f64> {
    let mut row = Array1::zeros(num_design_columns(labels.len()));
    fill_design_row(labels, pivots, row.view_mut());
    row
}

fn fill_design_row(labels: ArrayView1<f64>, pivots: ArrayView1<f64>, mut row: ArrayViewMut1<f64>) {
    let nlabels = labels.len();
    let offsets = &labels - &pivots;

    row[0] = 1.0;
    for (k, &offset) in offsets.iter().enumerate() {
        row[1 + k] = offset;
    }
    let mut col = 1 + nlabels;
    for i in 0..nlabels {
        for j in i..nlabels {
            row[col] = offsets[i] * offsets[j];
            col += 1;
        }
    }
}

/// Derivative of the label vector with respect to each label.
///
/// Shape: `[num_design_columns(nlabels), nlabels]`. Entry `(c, k)` is `d x_c / d l_k`.
pub fn design_jacobian(labels: ArrayView1<f64>, pivots: ArrayView1<f64>) -> Array2<f64> {
    let nlabels = labels.len();
    let offsets = &labels - &pivots;
    let mut jac = Array2::zeros((num_design_columns(nlabels), nlabels));

    for k in 0..nlabels {
        jac[[1 + k, k]] = 1.0;
    }
    let mut col = 1 + nlabels;
    for i in 0..nlabels {
        for j in i..nlabels {
            // d(c_i c_j)/d l_k = delta_ik c_j + delta_jk c_i
            jac[[col, i]] += offsets[j];
            jac[[col, j]] += offsets[i];
            col += 1;
        }
    }
    jac
}

/// Human-readable names of the design columns, e.g. `["1", "teff", "teff*logg", ...]`.
pub fn design_column_names(label_names: &[String]) -> Vec<String> {
    let mut names = Vec::with_capacity(num_design_columns(label_names.len()));
    names.push("1".to_string());
    names.extend(label_names.iter().cloned());
    for i in 0..label_names.len() {
        for j in i..label_names.len() {
            names.push(format!("{}*{}", label_names[i], label_names[j]));
        }
    }
    names
}
