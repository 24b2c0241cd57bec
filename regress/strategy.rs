//! Reference per-response regression algorithms.
//!
//! Both strategies consume the preprocessed design from
//! [`RegressionEngine::gene_problem`](crate::regression::RegressionEngine::gene_problem),
//! so circularity removal applies to them whenever it is configured.

use itertools::Itertools;
use ndarray::{Array1, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::attribution::{
    bool_to_index, predict_error_reduction, recalculate_betas_from_selected, solve_least_squares,
};
use crate::regression::{GeneProblem, PerGeneFit, RegressionError, RegressionStrategy};

pub const DEFAULT_MAX_CANDIDATES: usize = 10;
/// Exhaustive search visits `2^max_candidates` subsets per response.
pub const MAX_CANDIDATES_LIMIT: usize = 16;

/// Which built-in strategy a run uses.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegressionMethod {
    PriorOls,
    #[default]
    BestSubset,
}

/// Fits OLS on exactly the predictors the prior connects to the response.
#[derive(Debug, Default, Clone, Copy)]
pub struct PriorOls;

impl RegressionStrategy for PriorOls {
    fn name(&self) -> &str {
        "prior OLS"
    }

    fn fit_gene(&self, problem: &GeneProblem<'_>) -> Result<Option<PerGeneFit>, RegressionError> {
        let selected: Vec<bool> = problem.prior_row.iter().map(|&p| p != 0.0).collect();
        finish_fit(problem, selected).map(Some)
    }
}

/// Exhaustive BIC model selection over a bounded candidate set.
#[derive(Debug, Clone, Copy)]
pub struct BestSubset {
    max_candidates: usize,
}

impl Default for BestSubset {
    fn default() -> Self {
        Self {
            max_candidates: DEFAULT_MAX_CANDIDATES,
        }
    }
}

impl BestSubset {
    pub fn new(max_candidates: usize) -> Result<Self, RegressionError> {
        if max_candidates == 0 || max_candidates > MAX_CANDIDATES_LIMIT {
            return Err(RegressionError::InvalidParameter(format!(
                "max_candidates must be between 1 and {MAX_CANDIDATES_LIMIT}, got {max_candidates}"
            )));
        }
        Ok(Self { max_candidates })
    }

    pub fn max_candidates(&self) -> usize {
        self.max_candidates
    }

    /// Prior-supported predictors first, each group ordered by absolute
    /// association with the response. Constant predictors are never candidates.
    fn candidates(&self, problem: &GeneProblem<'_>) -> Vec<usize> {
        let x = problem.design.view();
        let association = x.t().dot(&problem.response).mapv(f64::abs);

        let mut supported = Vec::new();
        let mut others = Vec::new();
        for (k, column) in x.axis_iter(Axis(1)).enumerate() {
            if column.iter().all(|&v| v == 0.0) {
                continue;
            }
            if problem.prior_row[k] != 0.0 {
                supported.push(k);
            } else {
                others.push(k);
            }
        }

        let by_association = |a: &usize, b: &usize| association[*b].total_cmp(&association[*a]);
        supported.sort_by(by_association);
        others.sort_by(by_association);

        supported
            .into_iter()
            .chain(others)
            .take(self.max_candidates)
            .collect()
    }
}

impl RegressionStrategy for BestSubset {
    fn name(&self) -> &str {
        "best subset"
    }

    fn fit_gene(&self, problem: &GeneProblem<'_>) -> Result<Option<PerGeneFit>, RegressionError> {
        let x = problem.design.view();
        let y = problem.response.view();
        let n = problem.num_samples() as f64;
        let candidates = self.candidates(problem);

        let mut best_bic = bic(residual_sum_of_squares(y, None), n, 0);
        let mut best_subset: Vec<usize> = Vec::new();

        // Smaller subsets come first, so ties keep the sparser model.
        for subset in candidates.iter().copied().powerset().skip(1) {
            let x_sub = x.select(Axis(1), &subset);
            let beta = solve_least_squares(x_sub.view(), y);
            if beta.iter().all(|&b| b == 0.0) {
                continue;
            }
            let score = bic(
                residual_sum_of_squares(y, Some((x_sub.view(), beta.view()))),
                n,
                subset.len(),
            );
            if score < best_bic {
                best_bic = score;
                best_subset = subset;
            }
        }

        let mut selected = vec![false; problem.num_predictors()];
        for &k in &best_subset {
            selected[k] = true;
        }
        log::trace!(
            "{}: {} of {} candidates selected (BIC {:.4})",
            problem.gene,
            best_subset.len(),
            candidates.len(),
            best_bic
        );
        finish_fit(problem, selected).map(Some)
    }
}

/// Built-in strategies behind one type, picked from configuration.
#[derive(Debug, Clone, Copy)]
pub enum ConfiguredStrategy {
    PriorOls(PriorOls),
    BestSubset(BestSubset),
}

impl ConfiguredStrategy {
    pub fn from_method(
        method: RegressionMethod,
        max_candidates: usize,
    ) -> Result<Self, RegressionError> {
        Ok(match method {
            RegressionMethod::PriorOls => Self::PriorOls(PriorOls),
            RegressionMethod::BestSubset => Self::BestSubset(BestSubset::new(max_candidates)?),
        })
    }
}

impl RegressionStrategy for ConfiguredStrategy {
    fn name(&self) -> &str {
        match self {
            Self::PriorOls(s) => s.name(),
            Self::BestSubset(s) => s.name(),
        }
    }

    fn fit_gene(&self, problem: &GeneProblem<'_>) -> Result<Option<PerGeneFit>, RegressionError> {
        match self {
            Self::PriorOls(s) => s.fit_gene(problem),
            Self::BestSubset(s) => s.fit_gene(problem),
        }
    }
}

/// Refits OLS on `selected`, scores each coefficient and compacts the result.
fn finish_fit(
    problem: &GeneProblem<'_>,
    selected: Vec<bool>,
) -> Result<PerGeneFit, RegressionError> {
    let x = problem.design.view();
    let y = problem.response.view();
    let betas = recalculate_betas_from_selected(x, y, Some(&selected))
        .map_err(|e| problem.attribution_error(e))?;
    let scores =
        predict_error_reduction(x, y, betas.view()).map_err(|e| problem.attribution_error(e))?;

    let idx = bool_to_index(&selected);
    let betas_sel: Array1<f64> = betas.select(Axis(0), &idx);
    let scores_sel: Array1<f64> = scores.select(Axis(0), &idx);
    Ok(PerGeneFit::from_selected(
        problem.index,
        selected,
        betas_sel.view(),
        scores_sel.view(),
    ))
}

fn residual_sum_of_squares(
    y: ArrayView1<'_, f64>,
    fit: Option<(ArrayView2<'_, f64>, ArrayView1<'_, f64>)>,
) -> f64 {
    match fit {
        Some((x, beta)) => {
            let residuals = &y - &x.dot(&beta);
            residuals.dot(&residuals)
        }
        None => y.dot(&y),
    }
}

fn bic(rss: f64, n: f64, k: usize) -> f64 {
    n * (rss.max(f64::MIN_POSITIVE) / n).ln() + k as f64 * n.ln()
}
