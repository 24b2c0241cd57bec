#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::error::Error;
use std::fs;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process;

use regnet::bootstrap::{BootstrapOrchestrator, SingleTaskWorkflow, TaskInputs, UniformResampler};
use regnet::config::RegnetConfig;
use regnet::io::{read_labeled_tsv, write_labeled_tsv};
use regnet::preprocess::PreprocessMode;
use regnet::progress::{BootstrapProgressObserver, BootstrapProgressStage};
use regnet::regression::RayonMap;
use regnet::simulate::make_data_noisy;
use regnet::strategy::{ConfiguredStrategy, RegressionMethod};
use regnet::types::LabeledMatrix;

type CliResult = Result<(), Box<dyn Error>>;

#[derive(Clone, Copy, ValueEnum)]
pub enum MethodCli {
    PriorOls,
    BestSubset,
}

impl From<MethodCli> for RegressionMethod {
    fn from(method: MethodCli) -> Self {
        match method {
            MethodCli::PriorOls => RegressionMethod::PriorOls,
            MethodCli::BestSubset => RegressionMethod::BestSubset,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
pub enum PreprocessCli {
    Standard,
    RemoveCircularity,
}

impl From<PreprocessCli> for PreprocessMode {
    fn from(mode: PreprocessCli) -> Self {
        match mode {
            PreprocessCli::Standard => PreprocessMode::Standard,
            PreprocessCli::RemoveCircularity => PreprocessMode::RemoveCircularity,
        }
    }
}

#[derive(Args)]
pub struct RunArgs {
    /// Predictor activity TSV, predictors as rows and samples as columns
    #[arg(long)]
    pub predictors: PathBuf,

    /// Response expression TSV, genes as rows and samples as columns
    #[arg(long)]
    pub responses: PathBuf,

    /// Prior network TSV, genes as rows and predictors as columns
    #[arg(long)]
    pub priors: PathBuf,

    /// TOML configuration file; flags below override its values
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long, value_enum)]
    pub method: Option<MethodCli>,

    /// Per-gene preprocessing variant
    #[arg(long, value_enum)]
    pub preprocess: Option<PreprocessCli>,

    #[arg(long, value_name = "N")]
    pub num_bootstraps: Option<usize>,

    /// Base seed; bootstrap i uses seed + i
    #[arg(long)]
    pub seed: Option<u64>,

    /// Worker threads for the per-gene sweep (0 uses all cores)
    #[arg(long)]
    pub threads: Option<usize>,

    /// Directory receiving betas_{i}.tsv and rescaled_betas_{i}.tsv
    #[arg(long, default_value = ".")]
    pub output_dir: PathBuf,
}

#[derive(Args)]
pub struct NoiseArgs {
    /// Expression TSV, genes as rows and samples as columns
    #[arg(long)]
    pub expression: PathBuf,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    #[arg(long)]
    pub output: PathBuf,
}

#[derive(Args)]
pub struct InitConfigArgs {
    #[arg(long, default_value = "regnet.toml")]
    pub output: PathBuf,
}

#[derive(Parser)]
#[command(
    name = "regnet",
    about = "Bootstrap regression for gene regulatory network inference",
    long_about = "Fits one sparse regression model per gene against transcription factor \
                 activity, guided by a prior network, and repeats the fit over bootstrap \
                 resamples of the samples."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run bootstrap network regression
    Run(RunArgs),
    /// Write a statistically matched random copy of an expression matrix
    Noise(NoiseArgs),
    /// Write the default configuration file
    InitConfig(InitConfigArgs),
}

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) = ProgressStyle::with_template(
        "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message(message.to_string());
    pb
}

/// Shows bootstrap progress as a terminal progress bar.
#[derive(Default)]
struct BarProgress {
    bar: Option<ProgressBar>,
}

impl BootstrapProgressObserver for BarProgress {
    fn on_start(&mut self, stage: BootstrapProgressStage, total_bootstraps: usize) {
        self.bar = Some(create_progress_bar(
            total_bootstraps as u64,
            stage.describe(),
        ));
    }

    fn on_advance(&mut self, stage: BootstrapProgressStage, completed_bootstraps: usize) {
        if let Some(bar) = &self.bar {
            bar.set_position(completed_bootstraps as u64);
            bar.set_message(format!("{stage}"));
        }
    }

    fn on_finish(&mut self, stage: BootstrapProgressStage) {
        if let Some(bar) = self.bar.take() {
            bar.finish_with_message(format!("{stage} complete"));
        }
    }
}

/// Reorders the response samples to match the predictor samples.
fn align_samples(
    predictors: &LabeledMatrix,
    responses: LabeledMatrix,
) -> Result<LabeledMatrix, Box<dyn Error>> {
    if predictors.col_names() == responses.col_names() {
        return Ok(responses);
    }
    if let Some(missing) = predictors
        .col_names()
        .iter()
        .find(|s| responses.col_position(s).is_none())
    {
        return Err(format!("sample '{missing}' is missing from the response matrix").into());
    }
    log::info!("Reordering response samples to match predictor samples");
    Ok(responses.reindex(responses.row_names(), predictors.col_names()))
}

fn load_config(args: &RunArgs) -> Result<RegnetConfig, Box<dyn Error>> {
    let mut config = match &args.config {
        Some(path) => RegnetConfig::load(path)?,
        None => RegnetConfig::default(),
    };
    if let Some(method) = args.method {
        config.regression.method = method.into();
    }
    if let Some(mode) = args.preprocess {
        config.preprocess.mode = mode.into();
    }
    if let Some(n) = args.num_bootstraps {
        config.bootstrap.num_bootstraps = n;
    }
    if let Some(seed) = args.seed {
        config.bootstrap.base_seed = seed;
    }
    if let Some(threads) = args.threads {
        config.threads = threads;
    }
    config.validate()?;
    Ok(config)
}

fn run(args: RunArgs) -> CliResult {
    let config = load_config(&args)?;

    let predictors = read_labeled_tsv(&args.predictors)?;
    let responses = align_samples(&predictors, read_labeled_tsv(&args.responses)?)?;
    let priors = read_labeled_tsv(&args.priors)?;
    log::info!(
        "Loaded {} predictors, {} genes, {} samples",
        predictors.nrows(),
        responses.nrows(),
        predictors.ncols()
    );

    let mapper = RayonMap::with_threads(config.threads)?;
    let strategy = ConfiguredStrategy::from_method(
        config.regression.method,
        config.regression.max_candidates,
    )?;
    log::info!(
        "Running {} bootstraps of {:?} regression on {} threads",
        config.bootstrap.num_bootstraps,
        config.regression.method,
        mapper.num_threads()
    );

    let inputs = TaskInputs {
        predictors: &predictors,
        responses: &responses,
        prior: &priors,
    };
    let workflow = SingleTaskWorkflow::new(inputs, config.preprocess.clone(), strategy, &mapper)
        .with_chunk_size(config.regression.chunk_size);
    let orchestrator =
        BootstrapOrchestrator::new(config.bootstrap.num_bootstraps, config.bootstrap.base_seed);
    let results =
        orchestrator.run_regression(&workflow, &UniformResampler, &mut BarProgress::default())?;

    fs::create_dir_all(&args.output_dir)?;
    for (i, (betas, rescaled)) in results
        .betas
        .iter()
        .zip(&results.rescaled_betas)
        .enumerate()
    {
        write_labeled_tsv(betas, &args.output_dir.join(format!("betas_{i}.tsv")))?;
        write_labeled_tsv(
            rescaled,
            &args.output_dir.join(format!("rescaled_betas_{i}.tsv")),
        )?;
    }
    config.save(&args.output_dir.join("regnet.toml"))?;
    log::info!(
        "Wrote {} bootstrap networks to {}",
        results.len(),
        args.output_dir.display()
    );
    Ok(())
}

fn noise(args: NoiseArgs) -> CliResult {
    let expression = read_labeled_tsv(&args.expression)?;
    let noisy = make_data_noisy(&expression, args.seed)?;
    write_labeled_tsv(&noisy, &args.output)?;
    log::info!("Wrote simulated expression to {}", args.output.display());
    Ok(())
}

fn init_config(output: &Path) -> CliResult {
    RegnetConfig::default().save(output)?;
    println!("Wrote default configuration to {}", output.display());
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Some(Commands::Run(args)) => run(args),
        Some(Commands::Noise(args)) => noise(args),
        Some(Commands::InitConfig(args)) => init_config(&args.output),
        None => Cli::command().print_help().map_err(Into::into),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        let mut source = e.source();
        while let Some(cause) = source {
            eprintln!("  caused by: {cause}");
            source = cause.source();
        }
        process::exit(1);
    }
}
