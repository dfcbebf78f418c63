#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::process;

use plstat::config::{AnalysisConfig, ConfigError};
use plstat::params::Snapshot;
use plstat::teststat::Evaluation;
use plstat::toys::{ToyError, ToySampler, create_progress_bar};

#[derive(Args)]
pub struct EvalArgs {
    /// Path to the analysis configuration (.toml)
    #[arg(value_name = "CONFIG")]
    pub config: PathBuf,

    /// Override the hypothesized POI value of a profile statistic
    #[arg(long)]
    pub hypothesis: Option<f64>,
}

#[derive(Args)]
pub struct ScanArgs {
    /// Path to the analysis configuration (.toml)
    #[arg(value_name = "CONFIG")]
    pub config: PathBuf,

    /// Comma-separated hypothesized POI values
    #[arg(long, value_delimiter = ',', required = true, allow_negative_numbers = true)]
    pub points: Vec<f64>,
}

#[derive(Args)]
pub struct ToysArgs {
    /// Path to the analysis configuration (.toml)
    #[arg(value_name = "CONFIG")]
    pub config: PathBuf,

    /// Number of pseudo-experiments (overrides [toys] in the configuration)
    #[arg(long)]
    pub toys: Option<usize>,

    /// Base seed (overrides [toys] in the configuration)
    #[arg(long)]
    pub seed: Option<u64>,

    /// Override the hypothesized POI value of a profile statistic
    #[arg(long)]
    pub hypothesis: Option<f64>,
}

#[derive(Parser)]
#[command(
    name = "plstat",
    about = "Profiled likelihood-ratio test statistics",
    long_about = "Evaluates profile-likelihood test statistics for a model and dataset described \
                 in a TOML analysis file, scans them over hypotheses, and builds their toy \
                 sampling distributions."
)]
struct Cli {
    /// Raise statistic verbosity and log level (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate the configured statistic on the configured data
    #[command(about = "Evaluate the test statistic once")]
    Eval(EvalArgs),

    /// Evaluate a profile statistic at several hypotheses in parallel
    #[command(about = "Scan the test statistic over POI values")]
    Scan(ScanArgs),

    /// Observed statistic, toy distribution and p-value
    #[command(about = "Build the toy sampling distribution and p-value")]
    Toys(ToysArgs),
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

fn load_config(path: &Path, verbose: u8) -> Result<AnalysisConfig, ConfigError> {
    let mut config = AnalysisConfig::from_path(path)?;
    config.verbosity = config.verbosity.max(i32::from(verbose));
    config.apply_minimizer_defaults();
    Ok(config)
}

fn print_evaluation(evaluation: &Evaluation) {
    println!("t = {:.6}", evaluation.value);
    println!(
        "  numerator NLL   = {:.6} ({})",
        evaluation.numerator.value, evaluation.numerator.status
    );
    println!(
        "  denominator NLL = {:.6} ({})",
        evaluation.denominator.value, evaluation.denominator.status
    );
    if !evaluation.is_valid() {
        println!("  warning: at least one fit did not converge; the value is used as is");
    }
}

fn run_eval(args: EvalArgs, verbose: u8) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&args.config, verbose)?;
    let data = config.load_data()?;
    println!(
        "Loaded {} entries from dataset '{}'",
        data.num_entries(),
        data.name()
    );

    let mut statistic = config.build_statistic(args.hypothesis)?;
    let evaluation = statistic.evaluate_detailed(&data, &Snapshot::default())?;
    print_evaluation(&evaluation);
    Ok(())
}

fn run_scan(args: ScanArgs, verbose: u8) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&args.config, verbose)?;
    let data = config.load_data()?;
    let null_poi = Snapshot::default();

    let results: Vec<Result<f64, ConfigError>> = args
        .points
        .par_iter()
        .map(|&point| {
            let mut statistic = config.build_statistic(Some(point))?;
            Ok(statistic.evaluate(&data, &null_poi)?)
        })
        .collect();

    println!("{:>14}  {:>14}", "hypothesis", "t");
    for (point, result) in args.points.iter().zip(results) {
        println!("{:>14.6}  {:>14.6}", point, result?);
    }
    Ok(())
}

fn run_toys(args: ToysArgs, verbose: u8) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&args.config, verbose)?;
    let data = config.load_data()?;
    let null_poi = Snapshot::default();

    let observed = config
        .build_statistic(args.hypothesis)?
        .evaluate(&data, &null_poi)?;
    println!("Observed t = {observed:.6}");

    let defaults = config.toys.clone().unwrap_or_default();
    let sampler = ToySampler::new(
        args.toys.unwrap_or(defaults.toys),
        args.seed.unwrap_or(defaults.seed),
    );
    let generation = config.toy_generation(args.hypothesis)?;

    let make = || -> Result<_, ToyError> {
        let generator = config
            .model
            .build()
            .map_err(|e| ToyError::Worker(e.to_string()))?;
        let statistic = config
            .build_statistic(args.hypothesis)
            .map_err(|e| ToyError::Worker(e.to_string()))?;
        Ok((generator, statistic))
    };

    let pb = create_progress_bar(sampler.toys as u64, "Running toys");
    let distribution = sampler.sample(make, &generation, &null_poi, Some(&pb))?;
    pb.finish_with_message("Toys complete");

    println!("Toys: {} (seed {})", distribution.len(), sampler.seed);
    println!(
        "  median t = {:.6}, 95% quantile = {:.6}",
        distribution.quantile(0.5),
        distribution.quantile(0.95)
    );
    println!("  p-value  = {:.6}", distribution.p_value(observed));
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    let Cli { verbose, command } = cli;
    init_logging(verbose);

    let result = match command {
        Some(Commands::Eval(args)) => run_eval(args, verbose),
        Some(Commands::Scan(args)) => run_scan(args, verbose),
        Some(Commands::Toys(args)) => run_toys(args, verbose),
        None => Cli::command()
            .print_help()
            .map(|()| println!())
            .map_err(|e| e.into()),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
