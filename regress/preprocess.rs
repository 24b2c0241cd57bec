//! # Preprocessing
//!
//! Standardization applied to predictor activity and response expression
//! before any per-gene model is fit. Every row is scaled along the sample axis
//! to zero mean and unit variance using `ddof` degrees-of-freedom correction.
//!
//! Zero-variance rule: a row whose sample standard deviation is zero (up to
//! `ZERO_VARIANCE_TOLERANCE` relative to its mean) scales to all zeros. Low
//! expression genes hit this routinely and must not poison the fit with NaN.
//!
//! Inputs are never mutated; every entry point returns freshly owned arrays.

use ndarray::parallel::prelude::*;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayViewMut1, Axis};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_DDOF: usize = 1;
pub const ZERO_VARIANCE_TOLERANCE: f64 = 1.0e-12;

/// Which per-gene preprocessing variant the engine applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreprocessMode {
    /// Standardize the predictor matrix as-is for every gene.
    Standard,
    /// Subtract the gene's own expression, weighted by its prior row, from the
    /// predictor activity before standardizing.
    RemoveCircularity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    /// Degrees-of-freedom correction for the standard deviation.
    pub ddof: usize,
    /// Also standardize the full response matrix at engine construction.
    pub scale_response: bool,
    pub mode: PreprocessMode,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            ddof: DEFAULT_DDOF,
            scale_response: false,
            mode: PreprocessMode::Standard,
        }
    }
}

#[derive(Error, Debug)]
pub enum PreprocessError {
    #[error("Response vector has {found} samples, but the predictor matrix has {expected}.")]
    SampleCountMismatch { expected: usize, found: usize },

    #[error("Prior row has {found} entries, but the predictor matrix has {expected} predictors.")]
    PredictorCountMismatch { expected: usize, found: usize },

    #[error("Received {predictors} predictor matrices but {responses} response matrices.")]
    TaskCountMismatch { predictors: usize, responses: usize },

    #[error("Task {task}: predictor matrix has {predictor_samples} samples, response matrix has {response_samples}.")]
    TaskSampleMismatch {
        task: usize,
        predictor_samples: usize,
        response_samples: usize,
    },
}

/// Standardizes a vector in place. Returns `false` when the zero-variance rule fired.
fn standardize_in_place(mut values: ArrayViewMut1<'_, f64>, ddof: usize) -> bool {
    let n = values.len();
    if n <= ddof {
        values.fill(0.0);
        return false;
    }
    let mean = values.sum() / n as f64;
    let ss = values.iter().map(|&v| (v - mean) * (v - mean)).sum::<f64>();
    let sd = (ss / (n - ddof) as f64).sqrt();

    if !sd.is_finite() || sd <= ZERO_VARIANCE_TOLERANCE * (1.0 + mean.abs()) {
        values.fill(0.0);
        return false;
    }
    values.mapv_inplace(|v| (v - mean) / sd);
    true
}

/// Z-scores one vector along its only axis.
pub fn scale_vector(values: ArrayView1<'_, f64>, ddof: usize) -> Array1<f64> {
    let mut out = values.to_owned();
    standardize_in_place(out.view_mut(), ddof);
    out
}

/// Z-scores every row of `matrix` along the sample (column) axis.
pub fn scale_rows(matrix: ArrayView2<'_, f64>, ddof: usize) -> Array2<f64> {
    let mut out = matrix.to_owned();
    let saturated = out
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .map(|row| usize::from(!standardize_in_place(row, ddof)))
        .sum::<usize>();
    if saturated > 0 {
        log::debug!(
            "{} of {} rows had zero variance and were scaled to zero",
            saturated,
            matrix.nrows()
        );
    }
    out
}

fn scale_rows_serial(matrix: ArrayView2<'_, f64>, ddof: usize) -> Array2<f64> {
    let mut out = matrix.to_owned();
    for row in out.axis_iter_mut(Axis(0)) {
        standardize_in_place(row, ddof);
    }
    out
}

/// Preprocesses a whole regression job at once.
///
/// `predictors[i]` is `[K x N_i]` and `responses[i]` is `[G x N_i]` for task
/// `i`; the single-task case passes slices of length one. Predictor rows are
/// always standardized, response rows only when `config.scale_response` is set.
pub fn full_preprocess(
    predictors: &[Array2<f64>],
    responses: &[Array2<f64>],
    config: &PreprocessConfig,
) -> Result<(Vec<Array2<f64>>, Vec<Array2<f64>>), PreprocessError> {
    if predictors.len() != responses.len() {
        return Err(PreprocessError::TaskCountMismatch {
            predictors: predictors.len(),
            responses: responses.len(),
        });
    }
    for (task, (x, y)) in predictors.iter().zip(responses.iter()).enumerate() {
        if x.ncols() != y.ncols() {
            return Err(PreprocessError::TaskSampleMismatch {
                task,
                predictor_samples: x.ncols(),
                response_samples: y.ncols(),
            });
        }
    }

    let scaled_x = predictors
        .iter()
        .map(|x| scale_rows(x.view(), config.ddof))
        .collect();

    let scaled_y = if config.scale_response {
        responses
            .iter()
            .map(|y| scale_rows(y.view(), config.ddof))
            .collect()
    } else {
        responses.to_vec()
    };

    Ok((scaled_x, scaled_y))
}

/// Rebuilds predictor activity without the influence of one gene.
///
/// `activity` is `[K x N]`, `expression` is the gene's `[N]` expression and
/// `prior_row` its `[K]` prior edges. Returns `activity - prior_row ⊗ expression`.
pub fn remove_gene_from_activity(
    activity: ArrayView2<'_, f64>,
    expression: ArrayView1<'_, f64>,
    prior_row: ArrayView1<'_, f64>,
) -> Result<Array2<f64>, PreprocessError> {
    let (k, n) = activity.dim();
    if expression.len() != n {
        return Err(PreprocessError::SampleCountMismatch {
            expected: n,
            found: expression.len(),
        });
    }
    if prior_row.len() != k {
        return Err(PreprocessError::PredictorCountMismatch {
            expected: k,
            found: prior_row.len(),
        });
    }

    let contribution = prior_row
        .insert_axis(Axis(1))
        .dot(&expression.insert_axis(Axis(0)));
    Ok(&activity - &contribution)
}

/// Preprocesses the data for one gene's regression.
///
/// Returns the standardized `[K x N]` predictor matrix and the standardized
/// response vector. Runs on worker threads, so it scales serially.
pub fn gene_preprocess(
    activity: ArrayView2<'_, f64>,
    expression: ArrayView1<'_, f64>,
    prior_row: ArrayView1<'_, f64>,
    gene: &str,
    config: &PreprocessConfig,
) -> Result<(Array2<f64>, Array1<f64>), PreprocessError> {
    let (k, n) = activity.dim();
    if expression.len() != n {
        return Err(PreprocessError::SampleCountMismatch {
            expected: n,
            found: expression.len(),
        });
    }
    if prior_row.len() != k {
        return Err(PreprocessError::PredictorCountMismatch {
            expected: k,
            found: prior_row.len(),
        });
    }

    let x = match config.mode {
        PreprocessMode::RemoveCircularity => {
            log::trace!("Removing self-contribution of {gene} from predictor activity");
            let fixed = remove_gene_from_activity(activity, expression, prior_row)?;
            scale_rows_serial(fixed.view(), config.ddof)
        }
        PreprocessMode::Standard => scale_rows_serial(activity, config.ddof),
    };

    Ok((x, scale_vector(expression, config.ddof)))
}
