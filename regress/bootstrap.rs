//! # Bootstrap Orchestrator
//!
//! Sequences bootstrap iterations over one or several regression tasks. Each
//! iteration `i` gets the seed `base_seed + i`, which drives the sample
//! resampling and is handed to the workflow that fits the replicate. No random
//! state outlives an iteration, so two runs with the same inputs and base seed
//! are bit-identical.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

use crate::preprocess::PreprocessConfig;
use crate::progress::{BootstrapProgressObserver, BootstrapProgressStage};
use crate::regression::{
    DEFAULT_CHUNK, ParallelMap, RegressionEngine, RegressionError, RegressionStrategy,
};
use crate::types::{LabeledMatrix, NetworkEstimate};

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("Bootstrap {iteration}: regression failed: {source}")]
    Regression {
        iteration: usize,
        #[source]
        source: RegressionError,
    },

    #[error("Bootstrap {iteration}: sample index {index} is out of range for {num_samples} samples.")]
    SampleOutOfRange {
        iteration: usize,
        index: usize,
        num_samples: usize,
    },

    #[error("Bootstrap {iteration}: drew {found} sample indices, expected {expected}.")]
    SampleCountMismatch {
        iteration: usize,
        expected: usize,
        found: usize,
    },

    #[error("Bootstrap {iteration}: workflow returned {found} task results, expected {expected}.")]
    TaskCountMismatch {
        iteration: usize,
        expected: usize,
        found: usize,
    },
}

/// Draws one bootstrap index set over the sample axis.
pub trait Resampler {
    fn resample(&self, num_samples: usize, seed: u64) -> Vec<usize>;
}

/// Uniform sampling with replacement, `num_samples` draws.
#[derive(Debug, Default, Clone, Copy)]
pub struct UniformResampler;

impl Resampler for UniformResampler {
    fn resample(&self, num_samples: usize, seed: u64) -> Vec<usize> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..num_samples)
            .map(|_| rng.gen_range(0..num_samples))
            .collect()
    }
}

/// One single-task bootstrap replicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapIteration {
    pub index: usize,
    pub seed: u64,
    pub sample_indices: Vec<usize>,
}

/// One multitask bootstrap replicate, one index set per task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultitaskIteration {
    pub index: usize,
    pub seed: u64,
    pub sample_indices: Vec<Vec<usize>>,
}

/// Fits one replicate of a single-task workflow.
pub trait BootstrapFit {
    fn num_samples(&self) -> usize;
    fn run_bootstrap(
        &self,
        iteration: &BootstrapIteration,
    ) -> Result<NetworkEstimate, RegressionError>;
}

/// Fits one replicate of every task of a multitask workflow.
pub trait MultitaskBootstrapFit {
    /// Sample count of each task, in task order.
    fn task_sample_counts(&self) -> Vec<usize>;
    fn run_bootstrap(
        &self,
        iteration: &MultitaskIteration,
    ) -> Result<Vec<NetworkEstimate>, RegressionError>;
}

/// Per-iteration outputs of one task, indexed by bootstrap.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BootstrapResults {
    pub betas: Vec<LabeledMatrix>,
    pub rescaled_betas: Vec<LabeledMatrix>,
}

impl BootstrapResults {
    fn push(&mut self, network: NetworkEstimate) {
        self.betas.push(network.betas);
        self.rescaled_betas.push(network.rescaled_betas);
    }

    pub fn len(&self) -> usize {
        self.betas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.betas.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootstrapOrchestrator {
    pub num_bootstraps: usize,
    pub base_seed: u64,
}

impl BootstrapOrchestrator {
    pub fn new(num_bootstraps: usize, base_seed: u64) -> Self {
        Self {
            num_bootstraps,
            base_seed,
        }
    }

    pub fn iteration_seed(&self, index: usize) -> u64 {
        self.base_seed.wrapping_add(index as u64)
    }

    /// Runs every bootstrap of a single-task workflow in order.
    pub fn run_regression<F>(
        &self,
        fit: &F,
        resampler: &dyn Resampler,
        observer: &mut dyn BootstrapProgressObserver,
    ) -> Result<BootstrapResults, BootstrapError>
    where
        F: BootstrapFit + ?Sized,
    {
        let stage = BootstrapProgressStage::SingleTask;
        let num_samples = fit.num_samples();
        let mut results = BootstrapResults::default();
        observer.on_start(stage, self.num_bootstraps);

        for index in 0..self.num_bootstraps {
            log::info!("Bootstrap {} of {}", index + 1, self.num_bootstraps);
            let seed = self.iteration_seed(index);
            let sample_indices = resampler.resample(num_samples, seed);
            validate_sample(index, &sample_indices, num_samples)?;

            let iteration = BootstrapIteration {
                index,
                seed,
                sample_indices,
            };
            let network = fit
                .run_bootstrap(&iteration)
                .map_err(|source| BootstrapError::Regression {
                    iteration: index,
                    source,
                })?;
            results.push(network);
            observer.on_advance(stage, index + 1);
        }

        observer.on_finish(stage);
        Ok(results)
    }

    /// Runs every bootstrap of a multitask workflow in order.
    ///
    /// The output is task-major: one [`BootstrapResults`] per task, each with
    /// one entry per bootstrap.
    pub fn run_multitask_regression<F>(
        &self,
        fit: &F,
        resampler: &dyn Resampler,
        observer: &mut dyn BootstrapProgressObserver,
    ) -> Result<Vec<BootstrapResults>, BootstrapError>
    where
        F: MultitaskBootstrapFit + ?Sized,
    {
        let stage = BootstrapProgressStage::Multitask;
        let sample_counts = fit.task_sample_counts();
        let mut results = vec![BootstrapResults::default(); sample_counts.len()];
        observer.on_start(stage, self.num_bootstraps);

        for index in 0..self.num_bootstraps {
            log::info!("Bootstrap {} of {}", index + 1, self.num_bootstraps);
            let seed = self.iteration_seed(index);
            let mut sample_indices = Vec::with_capacity(sample_counts.len());
            for (task, &num_samples) in sample_counts.iter().enumerate() {
                let indices = resampler.resample(num_samples, task_seed(seed, task));
                validate_sample(index, &indices, num_samples)?;
                sample_indices.push(indices);
            }

            let iteration = MultitaskIteration {
                index,
                seed,
                sample_indices,
            };
            let networks = fit
                .run_bootstrap(&iteration)
                .map_err(|source| BootstrapError::Regression {
                    iteration: index,
                    source,
                })?;
            if networks.len() != results.len() {
                return Err(BootstrapError::TaskCountMismatch {
                    iteration: index,
                    expected: results.len(),
                    found: networks.len(),
                });
            }
            for (task_results, network) in results.iter_mut().zip(networks) {
                task_results.push(network);
            }
            observer.on_advance(stage, index + 1);
        }

        observer.on_finish(stage);
        Ok(results)
    }
}

/// Seed for one task's resampling within a multitask iteration.
pub fn task_seed(iteration_seed: u64, task: usize) -> u64 {
    iteration_seed.wrapping_add((task as u64) << 32)
}

fn validate_sample(
    iteration: usize,
    indices: &[usize],
    num_samples: usize,
) -> Result<(), BootstrapError> {
    if indices.len() != num_samples {
        return Err(BootstrapError::SampleCountMismatch {
            iteration,
            expected: num_samples,
            found: indices.len(),
        });
    }
    if let Some(&index) = indices.iter().find(|&&i| i >= num_samples) {
        return Err(BootstrapError::SampleOutOfRange {
            iteration,
            index,
            num_samples,
        });
    }
    Ok(())
}

/// The aligned inputs of one regression task.
#[derive(Debug, Clone, Copy)]
pub struct TaskInputs<'a> {
    pub predictors: &'a LabeledMatrix,
    pub responses: &'a LabeledMatrix,
    pub prior: &'a LabeledMatrix,
}

impl TaskInputs<'_> {
    fn num_samples(&self) -> usize {
        self.predictors.ncols()
    }

    fn fit_replicate<S>(
        &self,
        sample_indices: &[usize],
        config: &PreprocessConfig,
        strategy: &S,
        mapper: &dyn ParallelMap,
        chunk: usize,
    ) -> Result<NetworkEstimate, RegressionError>
    where
        S: RegressionStrategy + ?Sized,
    {
        let x = self.predictors.select_columns(sample_indices)?;
        let y = self.responses.select_columns(sample_indices)?;
        RegressionEngine::new(&x, &y, self.prior, config)?
            .with_chunk_size(chunk)
            .run(strategy, mapper)
    }
}

/// Refits the engine on each resampled replicate of one task.
pub struct SingleTaskWorkflow<'a, S> {
    inputs: TaskInputs<'a>,
    config: PreprocessConfig,
    strategy: S,
    mapper: &'a dyn ParallelMap,
    chunk: usize,
}

impl<'a, S: RegressionStrategy> SingleTaskWorkflow<'a, S> {
    pub fn new(
        inputs: TaskInputs<'a>,
        config: PreprocessConfig,
        strategy: S,
        mapper: &'a dyn ParallelMap,
    ) -> Self {
        Self {
            inputs,
            config,
            strategy,
            mapper,
            chunk: DEFAULT_CHUNK,
        }
    }

    pub fn with_chunk_size(mut self, chunk: usize) -> Self {
        self.chunk = chunk;
        self
    }
}

impl<S: RegressionStrategy> BootstrapFit for SingleTaskWorkflow<'_, S> {
    fn num_samples(&self) -> usize {
        self.inputs.num_samples()
    }

    fn run_bootstrap(
        &self,
        iteration: &BootstrapIteration,
    ) -> Result<NetworkEstimate, RegressionError> {
        log::debug!(
            "Fitting bootstrap {} with seed {}",
            iteration.index,
            iteration.seed
        );
        self.inputs.fit_replicate(
            &iteration.sample_indices,
            &self.config,
            &self.strategy,
            self.mapper,
            self.chunk,
        )
    }
}

/// Refits every task on its own resampled replicate, tasks in order.
pub struct MultitaskWorkflow<'a, S> {
    tasks: Vec<TaskInputs<'a>>,
    config: PreprocessConfig,
    strategy: S,
    mapper: &'a dyn ParallelMap,
    chunk: usize,
}

impl<'a, S: RegressionStrategy> MultitaskWorkflow<'a, S> {
    pub fn new(
        tasks: Vec<TaskInputs<'a>>,
        config: PreprocessConfig,
        strategy: S,
        mapper: &'a dyn ParallelMap,
    ) -> Self {
        Self {
            tasks,
            config,
            strategy,
            mapper,
            chunk: DEFAULT_CHUNK,
        }
    }

    pub fn with_chunk_size(mut self, chunk: usize) -> Self {
        self.chunk = chunk;
        self
    }
}

impl<S: RegressionStrategy> MultitaskBootstrapFit for MultitaskWorkflow<'_, S> {
    fn task_sample_counts(&self) -> Vec<usize> {
        self.tasks.iter().map(TaskInputs::num_samples).collect()
    }

    fn run_bootstrap(
        &self,
        iteration: &MultitaskIteration,
    ) -> Result<Vec<NetworkEstimate>, RegressionError> {
        self.tasks
            .iter()
            .zip(&iteration.sample_indices)
            .enumerate()
            .map(|(task, (inputs, indices))| {
                log::debug!(
                    "Fitting task {} of bootstrap {}",
                    task + 1,
                    iteration.index
                );
                inputs.fit_replicate(
                    indices,
                    &self.config,
                    &self.strategy,
                    self.mapper,
                    self.chunk,
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoopBootstrapProgress;
    use crate::types::numbered_labels;
    use ndarray::array;
    use std::cell::RefCell;

    fn stub_network(value: f64) -> NetworkEstimate {
        let betas = LabeledMatrix::new(
            array![[value]],
            numbered_labels("g", 1),
            numbered_labels("tf", 1),
        )
        .unwrap();
        NetworkEstimate {
            rescaled_betas: betas.clone(),
            betas,
        }
    }

    /// Records each iteration and returns its seed as the single coefficient.
    struct RecordingFit {
        samples: usize,
        seen: RefCell<Vec<BootstrapIteration>>,
    }

    impl BootstrapFit for RecordingFit {
        fn num_samples(&self) -> usize {
            self.samples
        }

        fn run_bootstrap(
            &self,
            iteration: &BootstrapIteration,
        ) -> Result<NetworkEstimate, RegressionError> {
            self.seen.borrow_mut().push(iteration.clone());
            Ok(stub_network(iteration.seed as f64))
        }
    }

    struct FixedResampler(Vec<usize>);

    impl Resampler for FixedResampler {
        fn resample(&self, _: usize, _: u64) -> Vec<usize> {
            self.0.clone()
        }
    }

    #[derive(Default)]
    struct CountingProgress {
        total: usize,
        advanced: Vec<usize>,
        finished: bool,
    }

    impl BootstrapProgressObserver for CountingProgress {
        fn on_start(&mut self, _: BootstrapProgressStage, total_bootstraps: usize) {
            self.total = total_bootstraps;
        }
        fn on_advance(&mut self, _: BootstrapProgressStage, completed_bootstraps: usize) {
            self.advanced.push(completed_bootstraps);
        }
        fn on_finish(&mut self, _: BootstrapProgressStage) {
            self.finished = true;
        }
    }

    #[test]
    fn seeds_are_base_plus_index() {
        let fit = RecordingFit {
            samples: 5,
            seen: RefCell::new(Vec::new()),
        };
        let mut progress = CountingProgress::default();
        let results = BootstrapOrchestrator::new(3, 40)
            .run_regression(&fit, &UniformResampler, &mut progress)
            .unwrap();

        let seeds: Vec<u64> = fit.seen.borrow().iter().map(|it| it.seed).collect();
        assert_eq!(seeds, vec![40, 41, 42]);
        assert_eq!(results.len(), 3);
        assert_eq!(results.betas[2].data()[(0, 0)], 42.0);
        assert_eq!(progress.total, 3);
        assert_eq!(progress.advanced, vec![1, 2, 3]);
        assert!(progress.finished);
    }

    #[test]
    fn seed_derivation_wraps() {
        let orchestrator = BootstrapOrchestrator::new(2, u64::MAX);
        assert_eq!(orchestrator.iteration_seed(0), u64::MAX);
        assert_eq!(orchestrator.iteration_seed(1), 0);
    }

    #[test]
    fn uniform_resampler_is_reproducible_and_in_range() {
        let a = UniformResampler.resample(50, 7);
        let b = UniformResampler.resample(50, 7);
        let c = UniformResampler.resample(50, 8);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 50);
        assert!(a.iter().all(|&i| i < 50));
        assert!(UniformResampler.resample(0, 7).is_empty());
    }

    #[test]
    fn out_of_range_samples_are_rejected() {
        let fit = RecordingFit {
            samples: 3,
            seen: RefCell::new(Vec::new()),
        };
        let err = BootstrapOrchestrator::new(1, 0)
            .run_regression(&fit, &FixedResampler(vec![0, 1, 3]), &mut NoopBootstrapProgress)
            .unwrap_err();
        assert!(matches!(
            err,
            BootstrapError::SampleOutOfRange {
                iteration: 0,
                index: 3,
                num_samples: 3
            }
        ));
        assert!(fit.seen.borrow().is_empty());

        let err = BootstrapOrchestrator::new(1, 0)
            .run_regression(&fit, &FixedResampler(vec![0, 1]), &mut NoopBootstrapProgress)
            .unwrap_err();
        assert!(matches!(err, BootstrapError::SampleCountMismatch { .. }));
    }

    struct TwoTaskFit;

    impl MultitaskBootstrapFit for TwoTaskFit {
        fn task_sample_counts(&self) -> Vec<usize> {
            vec![4, 6]
        }

        fn run_bootstrap(
            &self,
            iteration: &MultitaskIteration,
        ) -> Result<Vec<NetworkEstimate>, RegressionError> {
            Ok(iteration
                .sample_indices
                .iter()
                .enumerate()
                .map(|(task, _)| stub_network((iteration.index * 10 + task) as f64))
                .collect())
        }
    }

    #[test]
    fn multitask_output_is_task_major() {
        let results = BootstrapOrchestrator::new(3, 1)
            .run_multitask_regression(&TwoTaskFit, &UniformResampler, &mut NoopBootstrapProgress)
            .unwrap();
        assert_eq!(results.len(), 2);
        for (task, task_results) in results.iter().enumerate() {
            assert_eq!(task_results.len(), 3);
            for (b, betas) in task_results.betas.iter().enumerate() {
                assert_eq!(betas.data()[(0, 0)], (b * 10 + task) as f64);
            }
        }
    }

    #[test]
    fn task_seeds_differ_per_task() {
        assert_eq!(task_seed(5, 0), 5);
        assert_ne!(task_seed(5, 1), task_seed(5, 0));
        assert_ne!(task_seed(5, 1), task_seed(6, 0));
    }
}
