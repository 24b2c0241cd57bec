//! # Base Regression Engine
//!
//! Owns one regression job: the preprocessed predictor activity `[K x N]`, the
//! response expression `[G x N]` and the prior `[G x K]` aligned to both. A
//! [`RegressionStrategy`] fits one model per response; the engine spreads those
//! fits over a [`ParallelMap`] in chunks and piles the sparse per-gene results
//! into dense `[G x K]` coefficient and importance matrices.

use std::fmt;
use std::ops::Range;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rayon::prelude::*;
use thiserror::Error;

use crate::attribution::AttributionError;
use crate::preprocess::{self, PreprocessConfig, PreprocessError};
use crate::types::{LabeledMatrix, MatrixError, NetworkEstimate};

/// Responses handed to one unit of parallel work.
pub const DEFAULT_CHUNK: usize = 25;

#[derive(Error, Debug)]
pub enum RegressionError {
    #[error("No model was produced by the regression method for response '{gene}'.")]
    MissingModel { gene: String },

    #[error("Regression produced {found} results for {expected} responses.")]
    ResultCountMismatch { expected: usize, found: usize },

    #[error("Fit result for response index {index} is malformed: {reason}")]
    MalformedFit { index: usize, reason: String },

    #[error(
        "Predictor matrix has {predictor_samples} samples but response matrix has {response_samples}."
    )]
    SampleCountMismatch {
        predictor_samples: usize,
        response_samples: usize,
    },

    #[error("At least {required} samples are required to fit, found {found}.")]
    TooFewSamples { required: usize, found: usize },

    #[error("Preprocessing failed: {0}")]
    Preprocess(#[from] PreprocessError),

    #[error("Preprocessing for response '{gene}' failed: {source}")]
    GenePreprocess {
        gene: String,
        #[source]
        source: PreprocessError,
    },

    #[error("Error attribution for response '{gene}' failed: {source}")]
    Attribution {
        gene: String,
        #[source]
        source: AttributionError,
    },

    #[error("Matrix construction failed: {0}")]
    Matrix(#[from] MatrixError),

    #[error("Invalid regression parameter: {0}")]
    InvalidParameter(String),

    #[error("Parallel map returned {found} chunk results for {expected} chunks.")]
    ChunkCountMismatch { expected: usize, found: usize },
}

/// The outcome of fitting one response variable.
///
/// `selected` is a mask over all K predictors; `betas` and `betas_rescaled`
/// hold one value per selected predictor, in predictor order.
#[derive(Debug, Clone, PartialEq)]
pub struct PerGeneFit {
    pub index: usize,
    pub selected: Vec<bool>,
    pub betas: Vec<f64>,
    pub betas_rescaled: Vec<f64>,
}

impl PerGeneFit {
    /// A fit with no selected predictors.
    pub fn null(index: usize, num_predictors: usize) -> Self {
        Self {
            index,
            selected: vec![false; num_predictors],
            betas: Vec::new(),
            betas_rescaled: Vec::new(),
        }
    }

    /// Builds a fit from a predictor mask and the compact per-selected vectors.
    pub fn from_selected(
        index: usize,
        selected: Vec<bool>,
        betas: ArrayView1<'_, f64>,
        betas_rescaled: ArrayView1<'_, f64>,
    ) -> Self {
        Self {
            index,
            selected,
            betas: betas.to_vec(),
            betas_rescaled: betas_rescaled.to_vec(),
        }
    }

    pub fn num_selected(&self) -> usize {
        self.selected.iter().filter(|&&s| s).count()
    }

    fn validate(&self, num_responses: usize, num_predictors: usize) -> Result<(), RegressionError> {
        let malformed = |reason: String| RegressionError::MalformedFit {
            index: self.index,
            reason,
        };
        if self.index >= num_responses {
            return Err(malformed(format!(
                "index is out of range for {num_responses} responses"
            )));
        }
        if self.selected.len() != num_predictors {
            return Err(malformed(format!(
                "selection mask has {} entries, expected {num_predictors}",
                self.selected.len()
            )));
        }
        let n_selected = self.num_selected();
        if self.betas.len() != n_selected || self.betas_rescaled.len() != n_selected {
            return Err(malformed(format!(
                "{n_selected} predictors selected but {} betas and {} rescaled betas supplied",
                self.betas.len(),
                self.betas_rescaled.len()
            )));
        }
        Ok(())
    }
}

pub type ChunkOutput = Result<Vec<Option<PerGeneFit>>, RegressionError>;

/// An ordered map over chunks of response indices.
///
/// Implementations may run chunks anywhere, but must return one output per
/// input chunk in input order.
pub trait ParallelMap: Send + Sync {
    fn map_chunks(
        &self,
        chunks: Vec<Range<usize>>,
        work: &(dyn Fn(Range<usize>) -> ChunkOutput + Sync),
    ) -> Vec<ChunkOutput>;
}

/// Runs every chunk on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalMap;

impl ParallelMap for LocalMap {
    fn map_chunks(
        &self,
        chunks: Vec<Range<usize>>,
        work: &(dyn Fn(Range<usize>) -> ChunkOutput + Sync),
    ) -> Vec<ChunkOutput> {
        chunks.into_iter().map(work).collect()
    }
}

/// Runs chunks on rayon, either on the global pool or a dedicated one.
#[derive(Default)]
pub struct RayonMap {
    pool: Option<rayon::ThreadPool>,
}

impl RayonMap {
    pub fn global() -> Self {
        Self { pool: None }
    }

    /// A dedicated pool with `threads` workers; zero defers to the global pool.
    pub fn with_threads(threads: usize) -> Result<Self, rayon::ThreadPoolBuildError> {
        if threads == 0 {
            return Ok(Self::global());
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()?;
        Ok(Self { pool: Some(pool) })
    }

    pub fn num_threads(&self) -> usize {
        match &self.pool {
            Some(pool) => pool.current_num_threads(),
            None => rayon::current_num_threads(),
        }
    }
}

impl fmt::Debug for RayonMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RayonMap")
            .field("threads", &self.num_threads())
            .finish()
    }
}

impl ParallelMap for RayonMap {
    fn map_chunks(
        &self,
        chunks: Vec<Range<usize>>,
        work: &(dyn Fn(Range<usize>) -> ChunkOutput + Sync),
    ) -> Vec<ChunkOutput> {
        let run = || chunks.into_par_iter().map(work).collect::<Vec<_>>();
        match &self.pool {
            Some(pool) => pool.install(run),
            None => run(),
        }
    }
}

/// Splits `0..total` into consecutive ranges of at most `chunk` indices.
pub fn chunk_ranges(total: usize, chunk: usize) -> Vec<Range<usize>> {
    let chunk = chunk.max(1);
    (0..total)
        .step_by(chunk)
        .map(|start| start..(start + chunk).min(total))
        .collect()
}

/// Everything a strategy needs to fit one response.
pub struct GeneProblem<'a> {
    pub index: usize,
    pub gene: &'a str,
    /// Preprocessed sample-major design, `[N x K]`.
    pub design: Array2<f64>,
    /// Preprocessed response, `[N]`.
    pub response: Array1<f64>,
    /// The response's prior row, `[K]`.
    pub prior_row: ArrayView1<'a, f64>,
}

impl GeneProblem<'_> {
    pub fn num_predictors(&self) -> usize {
        self.design.ncols()
    }

    pub fn num_samples(&self) -> usize {
        self.design.nrows()
    }

    pub fn attribution_error(&self, source: AttributionError) -> RegressionError {
        RegressionError::Attribution {
            gene: self.gene.to_string(),
            source,
        }
    }
}

/// A pluggable per-response regression algorithm.
pub trait RegressionStrategy: Sync {
    fn name(&self) -> &str;

    /// Fits one response. `Ok(None)` means the method could not produce a
    /// model, which aborts the whole run.
    fn fit_gene(&self, problem: &GeneProblem<'_>) -> Result<Option<PerGeneFit>, RegressionError>;

    /// Fits every response of `engine`, ordered by response index.
    fn regress(
        &self,
        engine: &RegressionEngine,
        mapper: &dyn ParallelMap,
    ) -> Result<Vec<Option<PerGeneFit>>, RegressionError> {
        let total = engine.num_responses();
        engine.dispatch(mapper, |index| {
            let problem = engine.gene_problem(index)?;
            log::trace!("Regression on {} [{} / {}]", problem.gene, index + 1, total);
            self.fit_gene(&problem)
        })
    }
}

/// Diagnostics reported after pileup.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PileupSummary {
    pub models: usize,
    pub mean_predictors: f64,
    pub null_models: usize,
}

impl PileupSummary {
    pub fn from_betas(betas: &LabeledMatrix) -> Self {
        let counts = betas.nonzero_per_row();
        let models = counts.len();
        let mean_predictors = if models == 0 {
            0.0
        } else {
            counts.iter().sum::<usize>() as f64 / models as f64
        };
        Self {
            models,
            mean_predictors,
            null_models: counts.iter().filter(|&&c| c == 0).count(),
        }
    }
}

impl fmt::Display for PileupSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} Models, {:.4} Preds per Model ({} Null)",
            self.models, self.mean_predictors, self.null_models
        )
    }
}

pub struct RegressionEngine {
    x: Array2<f64>,
    y: Array2<f64>,
    prior: Array2<f64>,
    tfs: Vec<String>,
    genes: Vec<String>,
    config: PreprocessConfig,
    chunk: usize,
}

impl RegressionEngine {
    /// Builds an engine over `predictors` `[K x N]`, `responses` `[G x N]` and a
    /// prior that is reindexed to `[G x K]` with missing edges set to zero.
    pub fn new(
        predictors: &LabeledMatrix,
        responses: &LabeledMatrix,
        prior: &LabeledMatrix,
        config: &PreprocessConfig,
    ) -> Result<Self, RegressionError> {
        if predictors.ncols() != responses.ncols() {
            return Err(RegressionError::SampleCountMismatch {
                predictor_samples: predictors.ncols(),
                response_samples: responses.ncols(),
            });
        }
        let required = (config.ddof + 1).max(2);
        if predictors.ncols() < required {
            return Err(RegressionError::TooFewSamples {
                required,
                found: predictors.ncols(),
            });
        }

        let tfs = predictors.row_names().to_vec();
        let genes = responses.row_names().to_vec();
        let prior = prior.reindex(&genes, &tfs).into_parts().0;

        let (mut xs, mut ys) = preprocess::full_preprocess(
            std::slice::from_ref(predictors.data()),
            std::slice::from_ref(responses.data()),
            config,
        )?;

        log::debug!(
            "Predictor matrix {:?} and response matrix {:?} ready",
            predictors.shape(),
            responses.shape()
        );

        Ok(Self {
            x: xs.remove(0),
            y: ys.remove(0),
            prior,
            tfs,
            genes,
            config: config.clone(),
            chunk: DEFAULT_CHUNK,
        })
    }

    pub fn with_chunk_size(mut self, chunk: usize) -> Self {
        self.chunk = chunk.max(1);
        self
    }

    pub fn num_predictors(&self) -> usize {
        self.tfs.len()
    }

    pub fn num_responses(&self) -> usize {
        self.genes.len()
    }

    pub fn num_samples(&self) -> usize {
        self.x.ncols()
    }

    pub fn predictor_names(&self) -> &[String] {
        &self.tfs
    }

    pub fn response_names(&self) -> &[String] {
        &self.genes
    }

    pub fn predictors(&self) -> ArrayView2<'_, f64> {
        self.x.view()
    }

    pub fn responses(&self) -> ArrayView2<'_, f64> {
        self.y.view()
    }

    pub fn prior(&self) -> ArrayView2<'_, f64> {
        self.prior.view()
    }

    /// Runs per-gene preprocessing and packages the result for a strategy.
    pub fn gene_problem(&self, index: usize) -> Result<GeneProblem<'_>, RegressionError> {
        let gene = self.genes[index].as_str();
        let prior_row = self.prior.row(index);
        let (x, y) = preprocess::gene_preprocess(
            self.x.view(),
            self.y.row(index),
            prior_row,
            gene,
            &self.config,
        )
        .map_err(|source| RegressionError::GenePreprocess {
            gene: gene.to_string(),
            source,
        })?;

        Ok(GeneProblem {
            index,
            gene,
            design: x.reversed_axes(),
            response: y,
            prior_row,
        })
    }

    /// Applies `fit` to every response index through `mapper`, one chunk of
    /// responses per unit of work, and flattens the results in response order.
    pub fn dispatch<F>(
        &self,
        mapper: &dyn ParallelMap,
        fit: F,
    ) -> Result<Vec<Option<PerGeneFit>>, RegressionError>
    where
        F: Fn(usize) -> Result<Option<PerGeneFit>, RegressionError> + Sync,
    {
        let chunks = chunk_ranges(self.num_responses(), self.chunk);
        let expected = chunks.len();
        log::debug!(
            "Dispatching {} responses in {} chunks of up to {}",
            self.num_responses(),
            expected,
            self.chunk
        );

        let work = |range: Range<usize>| -> ChunkOutput { range.map(&fit).collect() };
        let outputs = mapper.map_chunks(chunks, &work);
        if outputs.len() != expected {
            return Err(RegressionError::ChunkCountMismatch {
                expected,
                found: outputs.len(),
            });
        }

        let mut results = Vec::with_capacity(self.num_responses());
        for output in outputs {
            results.extend(output?);
        }
        Ok(results)
    }

    /// Fits every response with `strategy` and piles the results up.
    pub fn run<S>(
        &self,
        strategy: &S,
        mapper: &dyn ParallelMap,
    ) -> Result<NetworkEstimate, RegressionError>
    where
        S: RegressionStrategy + ?Sized,
    {
        log::debug!("Running {} regression", strategy.name());
        let results = strategy.regress(self, mapper)?;
        self.pileup_data(results)
    }

    /// Packs per-gene results into dense `[G x K]` beta and rescaled-beta matrices.
    pub fn pileup_data(
        &self,
        results: Vec<Option<PerGeneFit>>,
    ) -> Result<NetworkEstimate, RegressionError> {
        let (g, k) = (self.num_responses(), self.num_predictors());
        if results.len() != g {
            return Err(RegressionError::ResultCountMismatch {
                expected: g,
                found: results.len(),
            });
        }

        let mut betas = Array2::<f64>::zeros((g, k));
        let mut betas_rescale = Array2::<f64>::zeros((g, k));
        // With exactly G results, unique indices cover every row.
        let mut filled = vec![false; g];

        for (position, data) in results.into_iter().enumerate() {
            let data = data.ok_or_else(|| RegressionError::MissingModel {
                gene: self.genes[position].clone(),
            })?;
            data.validate(g, k)?;
            if std::mem::replace(&mut filled[data.index], true) {
                return Err(RegressionError::MalformedFit {
                    index: data.index,
                    reason: format!(
                        "response '{}' has more than one result",
                        self.genes[data.index]
                    ),
                });
            }

            let columns = data
                .selected
                .iter()
                .enumerate()
                .filter(|&(_, &s)| s)
                .map(|(j, _)| j);
            for ((j, &b), &r) in columns.zip(&data.betas).zip(&data.betas_rescaled) {
                betas[(data.index, j)] = b;
                betas_rescale[(data.index, j)] = r;
            }
        }

        let betas = LabeledMatrix::new(betas, self.genes.clone(), self.tfs.clone())?;
        let rescaled_betas =
            LabeledMatrix::new(betas_rescale, self.genes.clone(), self.tfs.clone())?;

        log::info!("Regression complete: {}", PileupSummary::from_betas(&betas));

        Ok(NetworkEstimate {
            betas,
            rescaled_betas,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::numbered_labels;
    use ndarray::array;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn toy_engine() -> RegressionEngine {
        let x = LabeledMatrix::new(
            array![[1.0, 2.0, 3.0, 4.0], [0.5, 0.1, 0.9, 0.2], [3.0, 1.0, 2.0, 0.0]],
            numbered_labels("tf", 3),
            numbered_labels("s", 4),
        )
        .unwrap();
        let y = LabeledMatrix::new(
            array![[1.0, 2.0, 2.5, 4.0], [0.0, 1.0, 0.0, 1.0]],
            numbered_labels("g", 2),
            numbered_labels("s", 4),
        )
        .unwrap();
        let prior = LabeledMatrix::zeros(numbered_labels("g", 2), numbered_labels("tf", 3));
        RegressionEngine::new(&x, &y, &prior, &PreprocessConfig::default()).unwrap()
    }

    /// Selects predictor `index % K` with fixed coefficient values.
    struct DiagonalStrategy;

    impl RegressionStrategy for DiagonalStrategy {
        fn name(&self) -> &str {
            "diagonal"
        }

        fn fit_gene(
            &self,
            problem: &GeneProblem<'_>,
        ) -> Result<Option<PerGeneFit>, RegressionError> {
            let k = problem.num_predictors();
            let mut selected = vec![false; k];
            selected[problem.index % k] = true;
            Ok(Some(PerGeneFit {
                index: problem.index,
                selected,
                betas: vec![problem.index as f64 + 1.0],
                betas_rescaled: vec![0.5],
            }))
        }
    }

    struct NoModelStrategy;

    impl RegressionStrategy for NoModelStrategy {
        fn name(&self) -> &str {
            "none"
        }

        fn fit_gene(
            &self,
            problem: &GeneProblem<'_>,
        ) -> Result<Option<PerGeneFit>, RegressionError> {
            Ok((problem.index == 0).then(|| PerGeneFit::null(0, problem.num_predictors())))
        }
    }

    #[test]
    fn chunk_ranges_cover_everything_in_order() {
        assert_eq!(chunk_ranges(7, 3), vec![0..3, 3..6, 6..7]);
        assert_eq!(chunk_ranges(0, 25), Vec::<Range<usize>>::new());
        assert_eq!(chunk_ranges(2, 0), vec![0..1, 1..2]);
    }

    #[test]
    fn run_piles_results_into_labeled_matrices() {
        let engine = toy_engine();
        let network = engine.run(&DiagonalStrategy, &LocalMap).unwrap();

        assert_eq!(network.betas.shape(), (2, 3));
        assert_eq!(network.betas.row_names(), engine.response_names());
        assert_eq!(network.betas.col_names(), engine.predictor_names());
        assert_eq!(network.betas.data(), &array![[1.0, 0.0, 0.0], [0.0, 2.0, 0.0]]);
        assert_eq!(
            network.rescaled_betas.data(),
            &array![[0.5, 0.0, 0.0], [0.0, 0.5, 0.0]]
        );
    }

    #[test]
    fn rayon_map_matches_local_map() {
        let engine = toy_engine().with_chunk_size(1);
        let local = engine.run(&DiagonalStrategy, &LocalMap).unwrap();
        let pooled = engine
            .run(&DiagonalStrategy, &RayonMap::with_threads(2).unwrap())
            .unwrap();
        assert_eq!(local, pooled);
    }

    #[test]
    fn missing_model_is_fatal() {
        let engine = toy_engine();
        let err = engine.run(&NoModelStrategy, &LocalMap).unwrap_err();
        assert!(matches!(err, RegressionError::MissingModel { ref gene } if gene == "g1"));
    }

    #[test]
    fn pileup_writes_by_explicit_index() {
        let engine = toy_engine();
        let results = vec![
            Some(PerGeneFit {
                index: 1,
                selected: vec![false, false, true],
                betas: vec![-3.0],
                betas_rescaled: vec![0.25],
            }),
            Some(PerGeneFit::null(0, 3)),
        ];
        let network = engine.pileup_data(results).unwrap();
        assert_eq!(network.betas.data(), &array![[0.0, 0.0, 0.0], [0.0, 0.0, -3.0]]);
        let summary = PileupSummary::from_betas(&network.betas);
        assert_eq!(summary.models, 2);
        assert_eq!(summary.null_models, 1);
        assert!((summary.mean_predictors - 0.5).abs() < 1e-12);
    }

    #[test]
    fn pileup_rejects_malformed_fits() {
        let engine = toy_engine();
        let wrong_mask = vec![
            Some(PerGeneFit {
                index: 0,
                selected: vec![true, true],
                betas: vec![1.0, 2.0],
                betas_rescaled: vec![0.1, 0.2],
            }),
            Some(PerGeneFit::null(1, 3)),
        ];
        assert!(matches!(
            engine.pileup_data(wrong_mask),
            Err(RegressionError::MalformedFit { index: 0, .. })
        ));

        let wrong_len = vec![
            Some(PerGeneFit::null(0, 3)),
            Some(PerGeneFit {
                index: 1,
                selected: vec![true, false, true],
                betas: vec![1.0],
                betas_rescaled: vec![0.1],
            }),
        ];
        assert!(matches!(
            engine.pileup_data(wrong_len),
            Err(RegressionError::MalformedFit { index: 1, .. })
        ));

        assert!(matches!(
            engine.pileup_data(vec![Some(PerGeneFit::null(0, 3))]),
            Err(RegressionError::ResultCountMismatch {
                expected: 2,
                found: 1
            })
        ));
    }

    #[test]
    fn pileup_rejects_duplicate_response_index() {
        let engine = toy_engine();
        let results = vec![
            Some(PerGeneFit {
                index: 0,
                selected: vec![true, false, false],
                betas: vec![1.0],
                betas_rescaled: vec![0.5],
            }),
            Some(PerGeneFit {
                index: 0,
                selected: vec![false, true, false],
                betas: vec![2.0],
                betas_rescaled: vec![0.5],
            }),
        ];
        let err = engine.pileup_data(results).unwrap_err();
        assert!(matches!(
            err,
            RegressionError::MalformedFit { index: 0, ref reason } if reason.contains("g0")
        ));
    }

    #[test]
    fn construction_rejects_sample_mismatch() {
        let x = LabeledMatrix::zeros(numbered_labels("tf", 2), numbered_labels("s", 4));
        let y = LabeledMatrix::zeros(numbered_labels("g", 1), numbered_labels("s", 3));
        let prior = LabeledMatrix::zeros(numbered_labels("g", 1), numbered_labels("tf", 2));
        let err = RegressionEngine::new(&x, &y, &prior, &PreprocessConfig::default())
            .err()
            .unwrap();
        assert!(matches!(
            err,
            RegressionError::SampleCountMismatch {
                predictor_samples: 4,
                response_samples: 3
            }
        ));
    }

    #[test]
    fn prior_is_aligned_to_engine_labels() {
        let x = LabeledMatrix::zeros(numbered_labels("tf", 2), numbered_labels("s", 3));
        let y = LabeledMatrix::zeros(numbered_labels("g", 2), numbered_labels("s", 3));
        let prior = LabeledMatrix::new(
            array![[7.0, 0.0, 9.0]],
            vec!["g1".to_string()],
            vec!["tf1".to_string(), "tf5".to_string(), "tf0".to_string()],
        )
        .unwrap();
        let engine = RegressionEngine::new(&x, &y, &prior, &PreprocessConfig::default()).unwrap();
        assert_eq!(engine.prior(), array![[0.0, 0.0], [9.0, 7.0]]);
    }

    #[test]
    fn custom_map_sees_every_chunk() {
        struct CountingMap(AtomicUsize);
        impl ParallelMap for CountingMap {
            fn map_chunks(
                &self,
                chunks: Vec<Range<usize>>,
                work: &(dyn Fn(Range<usize>) -> ChunkOutput + Sync),
            ) -> Vec<ChunkOutput> {
                self.0.fetch_add(chunks.len(), Ordering::SeqCst);
                chunks.into_iter().map(work).collect()
            }
        }

        let engine = toy_engine().with_chunk_size(1);
        let map = CountingMap(AtomicUsize::new(0));
        engine.run(&DiagonalStrategy, &map).unwrap();
        assert_eq!(map.0.load(Ordering::SeqCst), 2);
    }
}
