//! Pseudo-experiments: the sampling distribution of a test statistic.
//!
//! Toys run in parallel on the rayon pool. Models own their live parameters,
//! so every worker builds its own generator and statistic; nothing mutable is
//! shared between threads. Each toy seeds its own generator from the base seed
//! and its index, which makes the result independent of scheduling.

use crate::model::{ModelError, ProbabilityModel};
use crate::params::Snapshot;
use crate::teststat::{TestStatError, TestStatistic};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use itertools::Itertools;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rayon::prelude::*;
use std::io::IsTerminal;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ToyError {
    #[error("At least one toy is required.")]
    NoToys,

    #[error("Toy generation failed: {0}")]
    Model(#[from] ModelError),

    #[error("Test statistic evaluation failed: {0}")]
    Statistic(#[from] TestStatError),

    #[error("Worker setup failed: {0}")]
    Worker(String),
}

pub fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    let style = ProgressStyle::with_template(
        "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    )
    .map(|s| s.progress_chars("█▉▊▋▌▍▎▏  "))
    .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb.set_message(message.to_string());

    pb
}

/// Statistic values of an ensemble of toys, in toy order.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingDistribution {
    values: Vec<f64>,
}

impl SamplingDistribution {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Fraction of toys with a statistic at least as large as `observed`.
    pub fn p_value(&self, observed: f64) -> f64 {
        if self.values.is_empty() {
            return f64::NAN;
        }
        let tail = self.values.iter().filter(|&&t| t >= observed).count();
        tail as f64 / self.values.len() as f64
    }

    /// Empirical quantile, nearest-rank.
    pub fn quantile(&self, q: f64) -> f64 {
        if self.values.is_empty() {
            return f64::NAN;
        }
        let sorted: Vec<f64> = self
            .values
            .iter()
            .copied()
            .sorted_by(|a, b| a.total_cmp(b))
            .collect();
        let rank = (q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64).round() as usize;
        sorted[rank]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToySampler {
    pub toys: usize,
    pub seed: u64,
}

impl ToySampler {
    pub fn new(toys: usize, seed: u64) -> Self {
        Self { toys, seed }
    }

    fn toy_seed(&self, index: usize) -> u64 {
        self.seed
            .wrapping_add((index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15))
    }

    /// Generates `toys` datasets from the generator model at `generation`,
    /// draws fresh global observables for each, and evaluates the statistic.
    /// `make` is called once per rayon worker.
    pub fn sample<G, S, F>(
        &self,
        make: F,
        generation: &Snapshot,
        null_poi: &Snapshot,
        progress: Option<&ProgressBar>,
    ) -> Result<SamplingDistribution, ToyError>
    where
        G: ProbabilityModel,
        S: TestStatistic,
        F: Fn() -> Result<(G, S), ToyError> + Sync + Send,
    {
        if self.toys == 0 {
            return Err(ToyError::NoToys);
        }
        log::info!(
            "Generating {} toys with base seed {}",
            self.toys,
            self.seed
        );

        let values = (0..self.toys)
            .into_par_iter()
            .map_init(&make, |worker, index| {
                let result = match worker {
                    Ok((generator, statistic)) => {
                        self.run_toy(generator, statistic, generation, null_poi, index)
                    }
                    Err(e) => Err(ToyError::Worker(e.to_string())),
                };
                if let Some(pb) = progress {
                    pb.inc(1);
                }
                result
            })
            .collect::<Result<Vec<f64>, ToyError>>()?;

        Ok(SamplingDistribution::new(values))
    }

    fn run_toy<G: ProbabilityModel, S: TestStatistic>(
        &self,
        generator: &mut G,
        statistic: &mut S,
        generation: &Snapshot,
        null_poi: &Snapshot,
        index: usize,
    ) -> Result<f64, ToyError> {
        let mut rng = StdRng::seed_from_u64(self.toy_seed(index));
        generator.parameters_mut().assign(generation);
        let values = generator.parameters().values();

        let data = generator.generate(values.view(), &mut rng)?;
        let global_observables = generator.sample_global_observables(values.view(), &mut rng)?;
        statistic.set_global_observables(&global_observables);

        let t = statistic.evaluate(&data, null_poi)?;
        log::trace!("Toy {index}: t = {t}");
        Ok(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CountingModel, CountingNames, GaussianMeanModel};
    use crate::params::{Parameter, ParameterSet};
    use crate::teststat::ProfiledLikelihoodTestStat;

    fn gaussian() -> GaussianMeanModel {
        GaussianMeanModel::new(
            "gauss",
            "x",
            Parameter::new("mu", 0.0).with_range(-10.0, 10.0).unwrap().with_error(0.5),
            Parameter::new("sigma", 1.0).constant(),
        )
        .unwrap()
        .with_toy_entries(25)
    }

    fn make_gaussian(
        hypothesis: f64,
    ) -> impl Fn() -> Result<(GaussianMeanModel, ProfiledLikelihoodTestStat<GaussianMeanModel>), ToyError> + Sync + Send
    {
        move || {
            let model = gaussian();
            let mu = Parameter::new("mu", hypothesis)
                .with_range(-10.0, 10.0)
                .map_err(|e| ToyError::Worker(e.to_string()))?;
            let params = ParameterSet::from_parameters([mu]).map_err(|e| ToyError::Worker(e.to_string()))?;
            let stat = ProfiledLikelihoodTestStat::new(&["x"], model.clone(), None, &params, &[], &[], 0)?;
            Ok((model, stat))
        }
    }

    #[test]
    fn p_value_counts_the_upper_tail() {
        let dist = SamplingDistribution::new(vec![0.1, 0.5, 0.9, 2.0]);
        assert_eq!(dist.p_value(0.5), 0.75);
        assert_eq!(dist.p_value(3.0), 0.0);
        assert_eq!(dist.quantile(0.0), 0.1);
        assert_eq!(dist.quantile(1.0), 2.0);
    }

    #[test]
    fn zero_toys_is_an_error() {
        let sampler = ToySampler::new(0, 1);
        let result = sampler.sample(make_gaussian(1.0), &Snapshot::default(), &Snapshot::default(), None);
        assert!(matches!(result, Err(ToyError::NoToys)));
    }

    #[test]
    fn sampling_is_reproducible() {
        let generation = Snapshot::from_parameters([Parameter::new("mu", 1.0)]).unwrap();
        let sampler = ToySampler::new(8, 42);
        let first = sampler
            .sample(make_gaussian(1.0), &generation, &Snapshot::default(), None)
            .unwrap();
        let second = sampler
            .sample(make_gaussian(1.0), &generation, &Snapshot::default(), None)
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 8);
        assert!(first.values().iter().all(|t| t.is_finite() && *t >= -1e-6));
    }

    #[test]
    fn counting_toys_randomize_global_observables() {
        let make = || -> Result<(CountingModel, ProfiledLikelihoodTestStat<CountingModel>), ToyError> {
            let model = CountingModel::new("c", vec![3.0, 6.0], vec![20.0, 8.0], 0.1, CountingNames::default())?;
            let mut params = ParameterSet::new();
            params
                .insert(Parameter::new("r", 1.0).with_range(0.0, 20.0).map_err(|e| ToyError::Worker(e.to_string()))?)
                .map_err(|e| ToyError::Worker(e.to_string()))?;
            let stat = ProfiledLikelihoodTestStat::new(
                &["n"],
                model.clone(),
                Some(&["theta"]),
                &params,
                &["theta"],
                &["theta_obs"],
                0,
            )?;
            Ok((model, stat))
        };
        let generation = Snapshot::from_parameters([Parameter::new("r", 1.0), Parameter::new("theta", 0.0)]).unwrap();
        let dist = ToySampler::new(4, 3)
            .sample(make, &generation, &Snapshot::default(), None)
            .unwrap();
        assert_eq!(dist.len(), 4);
        assert!(dist.values().iter().all(|t| t.is_finite()));
    }
}
