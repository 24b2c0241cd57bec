//! Synthetic expression data matched to a real expression matrix.
//!
//! Used to build null-model networks: the simulated matrix keeps each gene's
//! overall abundance and each sample's depth but destroys any regulatory
//! signal. Expression is `[G genes x N samples]` and so is the output.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayViewMut1, Axis, s};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Binomial, Distribution, Normal};
use rayon::prelude::*;
use std::ops::Range;
use thiserror::Error;

use crate::types::{LabeledMatrix, MatrixError};

/// Samples simulated per unit of work for count data.
pub const COUNT_CHUNK: usize = 2000;
/// Genes simulated per unit of work for continuous data.
pub const FLOAT_CHUNK: usize = 200;

const PROBABILITY_TOLERANCE: f64 = 1e-8;

#[derive(Error, Debug)]
pub enum SimulationError {
    #[error("Expression matrix is empty ({genes} genes x {samples} samples).")]
    EmptyInput { genes: usize, samples: usize },
    #[error("Expression matrix contains non-finite values (NaN or Infinity).")]
    NonFiniteValues,
    #[error("Sample '{sample}' has total expression {total}; totals must be positive.")]
    NonPositiveTotal { sample: String, total: f64 },
    #[error("Gene sampling probabilities sum to {sum}, not 1.")]
    ProbabilityNotNormalized { sum: f64 },
    #[error("At least 2 samples are required to estimate gene deviations, found {0}.")]
    TooFewSamples(usize),
    #[error("Invalid sampling distribution: {0}")]
    Distribution(String),
    #[error(transparent)]
    Matrix(#[from] MatrixError),
}

/// Produces a random matrix with the same labels and summary statistics as
/// `expression`.
///
/// Whole-number, non-negative input is treated as counts: every sample keeps
/// its total count, redistributed over genes by a multinomial draw from the
/// depth-normalized gene abundances. Any other input is continuous: each gene
/// is drawn from a normal distribution with the gene's depth-normalized mean
/// and its sample standard deviation.
///
/// The result depends only on `expression` and `seed`, not on thread count.
pub fn make_data_noisy(
    expression: &LabeledMatrix,
    seed: u64,
) -> Result<LabeledMatrix, SimulationError> {
    let data = expression.view();
    let (genes, samples) = data.dim();
    if genes == 0 || samples == 0 {
        return Err(SimulationError::EmptyInput { genes, samples });
    }
    if data.iter().any(|v| !v.is_finite()) {
        return Err(SimulationError::NonFiniteValues);
    }

    let totals = data.sum_axis(Axis(0));
    let simulated = if is_count_data(data) {
        log::info!("Simulating integer count data for {genes} genes x {samples} samples");
        simulate_counts(data, totals.view(), expression.col_names(), seed)?
    } else {
        log::info!("Simulating float data for {genes} genes x {samples} samples");
        simulate_floats(data, totals.view(), expression.col_names(), seed)?
    };

    Ok(LabeledMatrix::new(
        simulated,
        expression.row_names().to_vec(),
        expression.col_names().to_vec(),
    )?)
}

fn is_count_data(data: ArrayView2<'_, f64>) -> bool {
    data.iter().all(|&v| v >= 0.0 && v.fract() == 0.0)
}

/// Per-gene abundance with every sample rescaled to the mean sample total.
fn normalized_profile(
    data: ArrayView2<'_, f64>,
    totals: ArrayView1<'_, f64>,
    sample_names: &[String],
    allow_empty_samples: bool,
) -> Result<Array1<f64>, SimulationError> {
    let mean_total = totals.mean().unwrap_or(0.0);
    let mut weights = Array1::<f64>::zeros(totals.len());
    for (n, &total) in totals.iter().enumerate() {
        if total > 0.0 {
            weights[n] = mean_total / total;
        } else if !(total == 0.0 && allow_empty_samples) {
            return Err(SimulationError::NonPositiveTotal {
                sample: sample_names[n].clone(),
                total,
            });
        }
    }
    Ok(data.dot(&weights))
}

fn chunk_ranges(total: usize, chunk: usize) -> Vec<Range<usize>> {
    (0..total)
        .step_by(chunk)
        .map(|start| start..(start + chunk).min(total))
        .collect()
}

/// One seed per chunk, drawn in chunk order from a single generator.
fn chunk_seeds(count: usize, seed: u64) -> Vec<u64> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count).map(|_| rng.r#gen::<u64>()).collect()
}

fn simulate_counts(
    data: ArrayView2<'_, f64>,
    totals: ArrayView1<'_, f64>,
    sample_names: &[String],
    seed: u64,
) -> Result<Array2<f64>, SimulationError> {
    let (genes, samples) = data.dim();
    let profile = normalized_profile(data, totals, sample_names, true)?;
    let probabilities = &profile / profile.sum();
    let sum = probabilities.sum();
    if !((sum - 1.0).abs() <= PROBABILITY_TOLERANCE) {
        return Err(SimulationError::ProbabilityNotNormalized { sum });
    }

    let ranges = chunk_ranges(samples, COUNT_CHUNK);
    let seeds = chunk_seeds(ranges.len(), seed);
    let blocks = ranges
        .clone()
        .into_par_iter()
        .zip(seeds)
        .map(|(range, chunk_seed)| -> Result<Array2<f64>, SimulationError> {
            let mut rng = StdRng::seed_from_u64(chunk_seed);
            let mut block = Array2::<f64>::zeros((genes, range.len()));
            for (j, n) in range.enumerate() {
                draw_multinomial(
                    totals[n] as u64,
                    probabilities.view(),
                    block.column_mut(j),
                    &mut rng,
                )?;
            }
            Ok(block)
        })
        .collect::<Result<Vec<_>, SimulationError>>()?;

    let mut out = Array2::<f64>::zeros((genes, samples));
    for (range, block) in ranges.into_iter().zip(blocks) {
        out.slice_mut(s![.., range]).assign(&block);
    }
    Ok(out)
}

/// Splits `total` draws over genes with a chain of conditional binomials.
fn draw_multinomial(
    total: u64,
    probabilities: ArrayView1<'_, f64>,
    mut out: ArrayViewMut1<'_, f64>,
    rng: &mut StdRng,
) -> Result<(), SimulationError> {
    let mut remaining = total;
    let mut mass = 1.0_f64;
    let last = probabilities.len().saturating_sub(1);
    for (g, &p) in probabilities.iter().enumerate() {
        if remaining == 0 {
            break;
        }
        let draw = if g == last || p >= mass {
            remaining
        } else {
            let conditional = (p / mass).clamp(0.0, 1.0);
            Binomial::new(remaining, conditional)
                .map_err(|e| SimulationError::Distribution(e.to_string()))?
                .sample(rng)
        };
        out[g] = draw as f64;
        remaining -= draw;
        mass -= p;
    }
    Ok(())
}

fn simulate_floats(
    data: ArrayView2<'_, f64>,
    totals: ArrayView1<'_, f64>,
    sample_names: &[String],
    seed: u64,
) -> Result<Array2<f64>, SimulationError> {
    let (genes, samples) = data.dim();
    if samples < 2 {
        return Err(SimulationError::TooFewSamples(samples));
    }
    let centers = normalized_profile(data, totals, sample_names, false)? / samples as f64;
    let deviations = data.std_axis(Axis(1), 1.0);

    let ranges = chunk_ranges(genes, FLOAT_CHUNK);
    let seeds = chunk_seeds(ranges.len(), seed);
    let blocks = ranges
        .clone()
        .into_par_iter()
        .zip(seeds)
        .map(|(range, chunk_seed)| -> Result<Array2<f64>, SimulationError> {
            let mut rng = StdRng::seed_from_u64(chunk_seed);
            let mut block = Array2::<f64>::zeros((range.len(), samples));
            for (i, g) in range.enumerate() {
                let normal = Normal::new(centers[g], deviations[g])
                    .map_err(|e| SimulationError::Distribution(e.to_string()))?;
                block
                    .row_mut(i)
                    .iter_mut()
                    .for_each(|v| *v = normal.sample(&mut rng));
            }
            Ok(block)
        })
        .collect::<Result<Vec<_>, SimulationError>>()?;

    let mut out = Array2::<f64>::zeros((genes, samples));
    for (range, block) in ranges.into_iter().zip(blocks) {
        out.slice_mut(s![range, ..]).assign(&block);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::numbered_labels;
    use ndarray::array;

    fn counts() -> LabeledMatrix {
        LabeledMatrix::new(
            array![
                [10.0, 0.0, 4.0, 7.0],
                [3.0, 12.0, 5.0, 0.0],
                [0.0, 1.0, 9.0, 30.0]
            ],
            numbered_labels("g", 3),
            numbered_labels("s", 4),
        )
        .unwrap()
    }

    #[test]
    fn counts_keep_sample_totals_and_labels() {
        let input = counts();
        let noisy = make_data_noisy(&input, 42).unwrap();
        assert_eq!(noisy.row_names(), input.row_names());
        assert_eq!(noisy.col_names(), input.col_names());
        assert_eq!(noisy.data().sum_axis(Axis(0)), input.data().sum_axis(Axis(0)));
        assert!(noisy.data().iter().all(|&v| v >= 0.0 && v.fract() == 0.0));
    }

    #[test]
    fn same_seed_same_matrix() {
        let input = counts();
        let a = make_data_noisy(&input, 9).unwrap();
        let b = make_data_noisy(&input, 9).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn float_data_is_redrawn() {
        let input = LabeledMatrix::new(
            array![[1.5, 2.5, 2.0, 3.1], [0.2, 0.1, 0.4, 0.3]],
            numbered_labels("g", 2),
            numbered_labels("s", 4),
        )
        .unwrap();
        let noisy = make_data_noisy(&input, 3).unwrap();
        assert_eq!(noisy.shape(), input.shape());
        assert_ne!(noisy.data(), input.data());
        assert!(noisy.data().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn empty_count_matrix_cannot_be_normalized() {
        let input = LabeledMatrix::zeros(numbered_labels("g", 2), numbered_labels("s", 3));
        assert!(matches!(
            make_data_noisy(&input, 1),
            Err(SimulationError::ProbabilityNotNormalized { .. })
        ));
    }

    #[test]
    fn float_data_needs_positive_totals() {
        let input = LabeledMatrix::new(
            array![[1.5, -2.5], [0.2, 0.1]],
            numbered_labels("g", 2),
            numbered_labels("s", 2),
        )
        .unwrap();
        assert!(matches!(
            make_data_noisy(&input, 1),
            Err(SimulationError::NonPositiveTotal { ref sample, .. }) if sample == "s1"
        ));
    }

    #[test]
    fn multinomial_draw_uses_every_count() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut out = Array1::<f64>::zeros(3);
        draw_multinomial(1000, array![0.2, 0.5, 0.3].view(), out.view_mut(), &mut rng).unwrap();
        assert_eq!(out.sum(), 1000.0);
        assert!(out[1] > out[0]);
    }
}
