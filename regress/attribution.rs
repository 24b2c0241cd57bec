//! # Error Attribution
//!
//! Turns the coefficients of a fitted model into comparable per-predictor
//! importance scores: the fraction of residual variance that each selected
//! predictor explains on its own, measured by refitting without it.
//!
//! All design matrices here are sample-major, `[N samples x K predictors]`.
//!
//! Rank-deficient normal equations never raise. They resolve to an all-zero
//! coefficient vector (the null model), both for the primary fit and for every
//! leave-one-out refit.

use ndarray::{Array1, ArrayView1, ArrayView2, Axis};
use ndarray_linalg::{SVD, Solve};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AttributionError {
    #[error("Response has {found} samples, but the design matrix has {expected} rows.")]
    SampleCountMismatch { expected: usize, found: usize },

    #[error("Expected {expected} predictor entries, found {found}.")]
    PredictorCountMismatch { expected: usize, found: usize },
}

fn check_dims(
    x: ArrayView2<'_, f64>,
    y: ArrayView1<'_, f64>,
    per_predictor: Option<usize>,
) -> Result<(), AttributionError> {
    if y.len() != x.nrows() {
        return Err(AttributionError::SampleCountMismatch {
            expected: x.nrows(),
            found: y.len(),
        });
    }
    if let Some(found) = per_predictor {
        if found != x.ncols() {
            return Err(AttributionError::PredictorCountMismatch {
                expected: x.ncols(),
                found,
            });
        }
    }
    Ok(())
}

/// Numerical rank from the singular values, using the same cutoff as LAPACK
/// based rank estimators: `s_max * max(rows, cols) * eps`.
///
/// Returns `None` if the SVD itself fails.
pub fn matrix_rank(a: ArrayView2<'_, f64>) -> Option<usize> {
    if a.is_empty() {
        return Some(0);
    }
    let (_, singular, _) = a.as_standard_layout().svd(false, false).ok()?;
    let s_max = singular.iter().fold(0.0_f64, |acc, &s| acc.max(s));
    let tol = s_max * a.nrows().max(a.ncols()) as f64 * f64::EPSILON;
    Some(singular.iter().filter(|&&s| s > tol).count())
}

/// Solves `(XᵀX) β = Xᵀy`, or returns zeros when `XᵀX` is rank-deficient.
///
/// Rank is judged on the Gram matrix itself, so nearly collinear predictors
/// whose Gram matrix is numerically singular also give the null model.
pub fn solve_least_squares(x: ArrayView2<'_, f64>, y: ArrayView1<'_, f64>) -> Array1<f64> {
    let k = x.ncols();
    if k == 0 {
        return Array1::zeros(0);
    }

    let xtx = x.t().dot(&x);
    match matrix_rank(xtx.view()) {
        Some(rank) if rank == k => {}
        _ => return Array1::zeros(k),
    }

    let xty = x.t().dot(&y);
    match xtx.solve(&xty) {
        Ok(beta) if beta.iter().all(|b| b.is_finite()) => beta,
        Ok(_) | Err(_) => Array1::zeros(k),
    }
}

/// Estimates OLS coefficients from a subset of predictors.
///
/// `selected` is a `[K]` mask; unselected predictors receive a coefficient of
/// zero. `None` uses every predictor. Returns a `[K]` vector.
pub fn recalculate_betas_from_selected(
    x: ArrayView2<'_, f64>,
    y: ArrayView1<'_, f64>,
    selected: Option<&[bool]>,
) -> Result<Array1<f64>, AttributionError> {
    check_dims(x, y, selected.map(<[bool]>::len))?;

    let idx: Vec<usize> = match selected {
        Some(mask) => bool_to_index(mask),
        None => (0..x.ncols()).collect(),
    };

    let x_sel = x.select(Axis(1), &idx);
    let beta_hat = solve_least_squares(x_sel.view(), y);

    let mut betas = Array1::zeros(x.ncols());
    for (&j, &b) in idx.iter().zip(beta_hat.iter()) {
        betas[j] = b;
    }
    Ok(betas)
}

/// Scores how much residual variance each non-zero coefficient explains.
///
/// With a single selected predictor the score is `1 - ss_all / var(y)`. With
/// more, each predictor is dropped in turn, the rest are refit, and the score
/// is `1 - ss_all / ss_leaveout`; leave-out differences smaller than
/// `eps * n_selected` score zero.
pub fn predict_error_reduction(
    x: ArrayView2<'_, f64>,
    y: ArrayView1<'_, f64>,
    betas: ArrayView1<'_, f64>,
) -> Result<Array1<f64>, AttributionError> {
    check_dims(x, y, Some(betas.len()))?;

    let k = x.ncols();
    let pp_idx = index_of_nonzeros(betas);
    let mut error_reduction = Array1::zeros(k);
    if pp_idx.is_empty() {
        return Ok(error_reduction);
    }

    let ss_all = sigma_squared(x, y, betas);

    if pp_idx.len() == 1 {
        error_reduction[pp_idx[0]] = 1.0 - ss_all / variance(y, 1);
        return Ok(error_reduction);
    }

    let noise_floor = f64::EPSILON * pp_idx.len() as f64;

    for (pos, &lost) in pp_idx.iter().enumerate() {
        let leave_out: Vec<usize> = pp_idx
            .iter()
            .enumerate()
            .filter(|&(i, _)| i != pos)
            .map(|(_, &j)| j)
            .collect();

        let x_leaveout = x.select(Axis(1), &leave_out);
        let beta_hat = solve_least_squares(x_leaveout.view(), y);
        let ss_leaveout = sigma_squared(x_leaveout.view(), y, beta_hat.view());

        error_reduction[lost] = reduction_ratio(ss_all, ss_leaveout, noise_floor);
    }

    Ok(error_reduction)
}

fn reduction_ratio(ss_all: f64, ss_reference: f64, noise_floor: f64) -> f64 {
    if (ss_all - ss_reference).abs() < noise_floor {
        0.0
    } else {
        1.0 - ss_all / ss_reference
    }
}

/// Sample variance (`ddof = 1`) of the residuals `y - Xβ`.
pub fn sigma_squared(
    x: ArrayView2<'_, f64>,
    y: ArrayView1<'_, f64>,
    betas: ArrayView1<'_, f64>,
) -> f64 {
    let residuals = &y - &x.dot(&betas);
    variance(residuals.view(), 1)
}

pub fn variance(values: ArrayView1<'_, f64>, ddof: usize) -> f64 {
    let n = values.len();
    if n <= ddof {
        return f64::NAN;
    }
    let mean = values.sum() / n as f64;
    values.iter().map(|&v| (v - mean) * (v - mean)).sum::<f64>() / (n - ddof) as f64
}

pub fn index_of_nonzeros(values: ArrayView1<'_, f64>) -> Vec<usize> {
    values
        .iter()
        .enumerate()
        .filter(|&(_, &v)| v != 0.0)
        .map(|(i, _)| i)
        .collect()
}

pub fn bool_to_index(mask: &[bool]) -> Vec<usize> {
    mask.iter()
        .enumerate()
        .filter(|&(_, &keep)| keep)
        .map(|(i, _)| i)
        .collect()
}
