//! Probability models, datasets and the constrained negative log-likelihood.
//!
//! All likelihood values in this module are given up to additive terms that do
//! not depend on any parameter (for example `ln(n!)` in a Poisson term). Test
//! statistics only ever use differences of NLLs over the same dataset, so those
//! terms cancel.

use crate::minimizer::Objective;
use crate::params::{Parameter, ParameterError, ParameterSet};
use ndarray::{Array1, Array2, ArrayView1};
use rand::RngCore;
use rand_distr::{Distribution, Normal, Poisson};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Dataset '{dataset}' has no observable named '{observable}'.")]
    MissingObservable { dataset: String, observable: String },

    #[error("Dataset '{0}' contains a non-finite entry.")]
    NonFiniteEntry(String),

    #[error("Dataset has {rows} entries but {weights} weights were supplied.")]
    WeightLength { rows: usize, weights: usize },

    #[error("Dataset has {columns} columns but {names} observable names were supplied.")]
    ColumnCount { columns: usize, names: usize },

    #[error("Model '{model}' cannot use dataset '{dataset}': {reason}")]
    IncompatibleData {
        model: String,
        dataset: String,
        reason: String,
    },

    #[error("Model '{model}' is misconfigured: {reason}")]
    InvalidModel { model: String, reason: String },

    #[error("Sampling failed: {0}")]
    Sampling(String),

    #[error("Parameter error: {0}")]
    Parameter(#[from] ParameterError),
}

/// Observed (or generated) entries: one row per entry, one column per observable.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    name: String,
    observables: Vec<String>,
    entries: Array2<f64>,
    weights: Option<Array1<f64>>,
}

impl Dataset {
    pub fn new(
        name: impl Into<String>,
        observables: Vec<String>,
        entries: Array2<f64>,
    ) -> Result<Self, ModelError> {
        let name = name.into();
        if entries.ncols() != observables.len() {
            return Err(ModelError::ColumnCount {
                columns: entries.ncols(),
                names: observables.len(),
            });
        }
        if entries.iter().any(|v| !v.is_finite()) {
            return Err(ModelError::NonFiniteEntry(name));
        }
        Ok(Self {
            name,
            observables,
            entries,
            weights: None,
        })
    }

    /// A single-observable dataset.
    pub fn from_column(
        name: impl Into<String>,
        observable: impl Into<String>,
        values: Vec<f64>,
    ) -> Result<Self, ModelError> {
        let n = values.len();
        let entries = Array2::from_shape_vec((n, 1), values).map_err(|e| {
            ModelError::Sampling(format!("could not shape column into a dataset: {e}"))
        })?;
        Self::new(name, vec![observable.into()], entries)
    }

    pub fn with_weights(mut self, weights: Array1<f64>) -> Result<Self, ModelError> {
        if weights.len() != self.entries.nrows() {
            return Err(ModelError::WeightLength {
                rows: self.entries.nrows(),
                weights: weights.len(),
            });
        }
        if weights.iter().any(|w| !w.is_finite()) {
            return Err(ModelError::NonFiniteEntry(self.name));
        }
        self.weights = Some(weights);
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn observables(&self) -> &[String] {
        &self.observables
    }

    pub fn num_entries(&self) -> usize {
        self.entries.nrows()
    }

    pub fn is_weighted(&self) -> bool {
        self.weights.is_some()
    }

    pub fn weight(&self, row: usize) -> f64 {
        self.weights.as_ref().map_or(1.0, |w| w[row])
    }

    pub fn sum_of_weights(&self) -> f64 {
        self.weights
            .as_ref()
            .map_or(self.entries.nrows() as f64, |w| w.sum())
    }

    pub fn column(&self, observable: &str) -> Result<ArrayView1<'_, f64>, ModelError> {
        let j = self
            .observables
            .iter()
            .position(|o| o == observable)
            .ok_or_else(|| ModelError::MissingObservable {
                dataset: self.name.clone(),
                observable: observable.to_string(),
            })?;
        Ok(self.entries.column(j))
    }

    /// Fails on the first of `observables` this dataset does not carry.
    pub fn require_observables(&self, observables: &[String]) -> Result<(), ModelError> {
        for o in observables {
            if !self.observables.contains(o) {
                return Err(ModelError::MissingObservable {
                    dataset: self.name.clone(),
                    observable: o.clone(),
                });
            }
        }
        Ok(())
    }
}

/// A penalty tying a nuisance parameter to its global observable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConstraintTerm {
    /// `global_observable ~ N(parameter, sigma)`
    Gaussian {
        parameter: String,
        global_observable: String,
        sigma: f64,
    },
    /// `global_observable ~ Pois(tau * parameter)`
    Poisson {
        parameter: String,
        global_observable: String,
        tau: f64,
    },
}

impl ConstraintTerm {
    pub fn parameter(&self) -> &str {
        match self {
            Self::Gaussian { parameter, .. } | Self::Poisson { parameter, .. } => parameter,
        }
    }

    pub fn global_observable(&self) -> &str {
        match self {
            Self::Gaussian {
                global_observable, ..
            }
            | Self::Poisson {
                global_observable, ..
            } => global_observable,
        }
    }

    pub fn nll(&self, theta: f64, gobs: f64) -> f64 {
        match *self {
            Self::Gaussian { sigma, .. } => {
                let z = (gobs - theta) / sigma;
                0.5 * z * z
            }
            Self::Poisson { tau, .. } => poisson_nll(gobs, tau * theta),
        }
    }

    fn sample(&self, theta: f64, rng: &mut dyn RngCore) -> Result<f64, ModelError> {
        match *self {
            Self::Gaussian { sigma, .. } => Normal::new(theta, sigma)
                .map(|d| d.sample(rng))
                .map_err(|e| ModelError::Sampling(e.to_string())),
            Self::Poisson { tau, .. } => sample_poisson(tau * theta, rng),
        }
    }

    fn check(&self, model: &str) -> Result<(), ModelError> {
        let ok = match *self {
            Self::Gaussian { sigma, .. } => sigma > 0.0 && sigma.is_finite(),
            Self::Poisson { tau, .. } => tau > 0.0 && tau.is_finite(),
        };
        if ok {
            Ok(())
        } else {
            Err(ModelError::InvalidModel {
                model: model.to_string(),
                reason: format!("constraint on '{}' needs a positive width", self.parameter()),
            })
        }
    }
}

/// `lambda - n ln(lambda)`, with the `0 * ln(0)` convention.
fn poisson_nll(n: f64, lambda: f64) -> f64 {
    if lambda > 0.0 {
        lambda - n * lambda.ln()
    } else if lambda == 0.0 && n == 0.0 {
        0.0
    } else {
        f64::INFINITY
    }
}

fn sample_poisson(lambda: f64, rng: &mut dyn RngCore) -> Result<f64, ModelError> {
    if lambda <= 0.0 {
        return Ok(0.0);
    }
    Poisson::new(lambda)
        .map(|d| d.sample(rng))
        .map_err(|e| ModelError::Sampling(e.to_string()))
}

/// A likelihood over a fixed set of observables, parameterized by a
/// [`ParameterSet`] that holds the model's live state.
pub trait ProbabilityModel {
    fn name(&self) -> &str;

    fn observables(&self) -> &[String];

    fn parameters(&self) -> &ParameterSet;

    fn parameters_mut(&mut self) -> &mut ParameterSet;

    /// Data term of `-ln L` at `values`, given in the order of [`Self::parameters`].
    /// Returns `+inf` outside the model's domain.
    fn nll(&self, data: &Dataset, values: ArrayView1<f64>) -> f64;

    fn constraint_terms(&self) -> &[ConstraintTerm] {
        &[]
    }

    /// Checks that `data` can be evaluated by this model.
    fn validate(&self, data: &Dataset) -> Result<(), ModelError> {
        data.require_observables(self.observables())
    }

    /// Draws a pseudo-dataset at `values`.
    fn generate(&self, values: ArrayView1<f64>, rng: &mut dyn RngCore) -> Result<Dataset, ModelError>;

    /// Draws a value for every global observable that has a constraint term,
    /// centred on the constrained parameter's value in `values`.
    fn sample_global_observables(
        &self,
        values: ArrayView1<f64>,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<(String, f64)>, ModelError> {
        let params = self.parameters();
        let mut drawn = Vec::with_capacity(self.constraint_terms().len());
        for term in self.constraint_terms() {
            let i = params
                .index_of(term.parameter())
                .ok_or_else(|| ParameterError::Missing(term.parameter().to_string()))?;
            drawn.push((term.global_observable().to_string(), term.sample(values[i], rng)?));
        }
        Ok(drawn)
    }

    /// Builds the NLL of `data`, including the constraint terms of every
    /// parameter named in `constrain`.
    fn create_nll<'a>(
        &'a self,
        data: &'a Dataset,
        constrain: &[String],
    ) -> Result<NegLogLikelihood<'a, Self>, ModelError>
    where
        Self: Sized,
    {
        NegLogLikelihood::new(self, data, constrain)
    }
}

impl<M: ProbabilityModel + ?Sized> ProbabilityModel for Box<M> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn observables(&self) -> &[String] {
        (**self).observables()
    }

    fn parameters(&self) -> &ParameterSet {
        (**self).parameters()
    }

    fn parameters_mut(&mut self) -> &mut ParameterSet {
        (**self).parameters_mut()
    }

    fn nll(&self, data: &Dataset, values: ArrayView1<f64>) -> f64 {
        (**self).nll(data, values)
    }

    fn constraint_terms(&self) -> &[ConstraintTerm] {
        (**self).constraint_terms()
    }

    fn validate(&self, data: &Dataset) -> Result<(), ModelError> {
        (**self).validate(data)
    }

    fn generate(&self, values: ArrayView1<f64>, rng: &mut dyn RngCore) -> Result<Dataset, ModelError> {
        (**self).generate(values, rng)
    }

    fn sample_global_observables(
        &self,
        values: ArrayView1<f64>,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<(String, f64)>, ModelError> {
        (**self).sample_global_observables(values, rng)
    }
}

/// Constrained NLL of one model on one dataset, as a pure function of the full
/// parameter vector.
pub struct NegLogLikelihood<'a, M: ProbabilityModel + ?Sized> {
    model: &'a M,
    data: &'a Dataset,
    /// `(parameter index, global observable index, term)`
    constraints: Vec<(usize, usize, ConstraintTerm)>,
}

impl<'a, M: ProbabilityModel + ?Sized> NegLogLikelihood<'a, M> {
    pub fn new(model: &'a M, data: &'a Dataset, constrain: &[String]) -> Result<Self, ModelError> {
        model.validate(data)?;
        let params = model.parameters();
        let mut constraints = Vec::new();
        for term in model.constraint_terms() {
            if !constrain.iter().any(|c| c == term.parameter()) {
                continue;
            }
            let pi = params
                .index_of(term.parameter())
                .ok_or_else(|| ParameterError::Missing(term.parameter().to_string()))?;
            let gi = params
                .index_of(term.global_observable())
                .ok_or_else(|| ParameterError::Missing(term.global_observable().to_string()))?;
            constraints.push((pi, gi, term.clone()));
        }
        log::trace!(
            "NLL for '{}' on '{}' with {} constraint term(s)",
            model.name(),
            data.name(),
            constraints.len()
        );
        Ok(Self {
            model,
            data,
            constraints,
        })
    }

    pub fn num_constraints(&self) -> usize {
        self.constraints.len()
    }

    /// Value at the model's current parameter values.
    pub fn current_value(&self) -> f64 {
        self.value(self.model.parameters().values().view())
    }
}

impl<M: ProbabilityModel + ?Sized> Objective for NegLogLikelihood<'_, M> {
    fn value(&self, point: ArrayView1<f64>) -> f64 {
        let penalty: f64 = self
            .constraints
            .iter()
            .map(|(pi, gi, term)| term.nll(point[*pi], point[*gi]))
            .sum();
        self.model.nll(self.data, point) + penalty
    }
}

/// `x ~ N(mean, sigma)` for a single observable.
#[derive(Debug, Clone)]
pub struct GaussianMeanModel {
    name: String,
    observables: Vec<String>,
    parameters: ParameterSet,
    toy_entries: usize,
}

impl GaussianMeanModel {
    /// `mean` and `sigma` become the model's two parameters, in that order.
    pub fn new(
        name: impl Into<String>,
        observable: impl Into<String>,
        mean: Parameter,
        sigma: Parameter,
    ) -> Result<Self, ModelError> {
        let name = name.into();
        // Written negated so that a NaN value is rejected too.
        if !(sigma.value() > 0.0 && sigma.max() > 0.0) {
            return Err(ModelError::InvalidModel {
                model: name,
                reason: format!(
                    "width parameter '{}' must be positive (value {}, max {})",
                    sigma.name(),
                    sigma.value(),
                    sigma.max()
                ),
            });
        }
        Ok(Self {
            name,
            observables: vec![observable.into()],
            parameters: ParameterSet::from_parameters([mean, sigma])?,
            toy_entries: 100,
        })
    }

    /// Number of entries drawn by [`ProbabilityModel::generate`].
    pub fn with_toy_entries(mut self, entries: usize) -> Self {
        self.toy_entries = entries;
        self
    }
}

impl ProbabilityModel for GaussianMeanModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn observables(&self) -> &[String] {
        &self.observables
    }

    fn parameters(&self) -> &ParameterSet {
        &self.parameters
    }

    fn parameters_mut(&mut self) -> &mut ParameterSet {
        &mut self.parameters
    }

    fn nll(&self, data: &Dataset, values: ArrayView1<f64>) -> f64 {
        let (mean, sigma) = (values[0], values[1]);
        if sigma <= 0.0 {
            return f64::INFINITY;
        }
        let Ok(x) = data.column(&self.observables[0]) else {
            return f64::INFINITY;
        };
        let ln_sigma = sigma.ln();
        x.iter()
            .enumerate()
            .map(|(i, &xi)| {
                let z = (xi - mean) / sigma;
                data.weight(i) * (0.5 * z * z + ln_sigma)
            })
            .sum()
    }

    fn generate(&self, values: ArrayView1<f64>, rng: &mut dyn RngCore) -> Result<Dataset, ModelError> {
        let normal =
            Normal::new(values[0], values[1]).map_err(|e| ModelError::Sampling(e.to_string()))?;
        let draws: Vec<f64> = (0..self.toy_entries).map(|_| normal.sample(rng)).collect();
        Dataset::from_column(format!("{}_toy", self.name), self.observables[0].clone(), draws)
    }
}

/// Names of the three parameters of a [`CountingModel`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CountingNames {
    pub poi: String,
    pub nuisance: String,
    pub global_observable: String,
}

impl Default for CountingNames {
    fn default() -> Self {
        Self {
            poi: "r".to_string(),
            nuisance: "theta".to_string(),
            global_observable: "theta_obs".to_string(),
        }
    }
}

/// Binned counting experiment:
/// `n_i ~ Pois(r * s_i + b_i * (1 + kappa)^theta)`, with `theta` constrained by
/// a unit Gaussian against the global observable.
#[derive(Debug, Clone)]
pub struct CountingModel {
    name: String,
    observables: Vec<String>,
    signal: Vec<f64>,
    background: Vec<f64>,
    ln_kappa: f64,
    parameters: ParameterSet,
    constraints: Vec<ConstraintTerm>,
}

impl CountingModel {
    /// Observed counts are read from the `n` column, one row per bin.
    pub const OBSERVABLE: &'static str = "n";

    pub fn new(
        name: impl Into<String>,
        signal: Vec<f64>,
        background: Vec<f64>,
        kappa: f64,
        names: CountingNames,
    ) -> Result<Self, ModelError> {
        let name = name.into();
        let invalid = |reason: String| ModelError::InvalidModel {
            model: name.clone(),
            reason,
        };
        if signal.is_empty() || signal.len() != background.len() {
            return Err(invalid(format!(
                "{} signal yields and {} background yields",
                signal.len(),
                background.len()
            )));
        }
        if background.iter().any(|&b| !(b > 0.0 && b.is_finite())) {
            return Err(invalid("background yields must be positive".to_string()));
        }
        if signal.iter().any(|&s| !(s >= 0.0 && s.is_finite())) {
            return Err(invalid("signal yields must be non-negative".to_string()));
        }
        if !(kappa > 0.0 && kappa.is_finite()) {
            return Err(invalid(format!("kappa must be positive (got {kappa})")));
        }

        let parameters = ParameterSet::from_parameters([
            Parameter::new(names.poi.clone(), 1.0)
                .with_range(0.0, 20.0)?
                .with_error(0.1),
            Parameter::new(names.nuisance.clone(), 0.0)
                .with_range(-5.0, 5.0)?
                .with_error(1.0),
            Parameter::new(names.global_observable.clone(), 0.0)
                .with_range(-5.0, 5.0)?
                .constant(),
        ])?;
        let constraint = ConstraintTerm::Gaussian {
            parameter: names.nuisance,
            global_observable: names.global_observable,
            sigma: 1.0,
        };
        constraint.check(&name)?;

        Ok(Self {
            name,
            observables: vec![Self::OBSERVABLE.to_string()],
            signal,
            background,
            ln_kappa: (1.0 + kappa).ln(),
            parameters,
            constraints: vec![constraint],
        })
    }

    pub fn num_bins(&self) -> usize {
        self.signal.len()
    }

    fn expected(&self, r: f64, theta: f64) -> impl Iterator<Item = f64> + '_ {
        let scale = (theta * self.ln_kappa).exp();
        self.signal
            .iter()
            .zip(self.background.iter())
            .map(move |(&s, &b)| r * s + b * scale)
    }
}

impl ProbabilityModel for CountingModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn observables(&self) -> &[String] {
        &self.observables
    }

    fn parameters(&self) -> &ParameterSet {
        &self.parameters
    }

    fn parameters_mut(&mut self) -> &mut ParameterSet {
        &mut self.parameters
    }

    fn nll(&self, data: &Dataset, values: ArrayView1<f64>) -> f64 {
        let Ok(counts) = data.column(Self::OBSERVABLE) else {
            return f64::INFINITY;
        };
        self.expected(values[0], values[1])
            .zip(counts.iter())
            .enumerate()
            .map(|(i, (lambda, &n))| data.weight(i) * poisson_nll(n, lambda))
            .sum()
    }

    fn constraint_terms(&self) -> &[ConstraintTerm] {
        &self.constraints
    }

    fn validate(&self, data: &Dataset) -> Result<(), ModelError> {
        data.require_observables(&self.observables)?;
        let incompatible = |reason: String| ModelError::IncompatibleData {
            model: self.name.clone(),
            dataset: data.name().to_string(),
            reason,
        };
        if data.num_entries() != self.num_bins() {
            return Err(incompatible(format!(
                "expected {} bins, found {} entries",
                self.num_bins(),
                data.num_entries()
            )));
        }
        if data.column(Self::OBSERVABLE)?.iter().any(|&n| n < 0.0) {
            return Err(incompatible("counts must be non-negative".to_string()));
        }
        Ok(())
    }

    fn generate(&self, values: ArrayView1<f64>, rng: &mut dyn RngCore) -> Result<Dataset, ModelError> {
        let counts = self
            .expected(values[0], values[1])
            .map(|lambda| sample_poisson(lambda, rng))
            .collect::<Result<Vec<f64>, ModelError>>()?;
        Dataset::from_column(format!("{}_toy", self.name), Self::OBSERVABLE, counts)
    }
}
