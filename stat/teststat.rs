// stat/teststat.rs

//! # Profiled Likelihood Test Statistics
//!
//! Two evaluators, both differences of profiled negative log-likelihoods:
//!
//! 1.  [`ProfiledLikelihoodRatioTestStat`] compares a null and an alternate model,
//!     each profiled from a stored parameter configuration. It leaves the fitted
//!     values in the models' live parameters; callers that need the old state
//!     back take and restore a snapshot themselves.
//!
//! 2.  [`ProfiledLikelihoodTestStat`] is the one-sided profile-likelihood ratio
//!     for one model and one parameter of interest: a fit with the POI floating
//!     in `[0, hypothesis]` against a fit with the POI fixed at the hypothesis.
//!     Every evaluation restores the model's parameters before returning.
//!
//! Both minimize with the cheapest strategy and log through `log`; verbosity 1
//! announces each profile fit, verbosity 2 also prints the fit results.

use crate::minimizer::{
    BfgsMinimizer, MinimizationOutcome, Minimizer, MinimizerError, MinimizerOptions, Strategy,
};
use crate::model::{Dataset, ModelError, ProbabilityModel};
use crate::params::{ParameterError, ParameterSet, Snapshot};
use crate::policy::{ConstraintPolicy, Pass, PolicyError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TestStatError {
    #[error("The parameter list is empty, so there is no parameter of interest.")]
    NoParameterOfInterest,

    #[error("Nuisance parameter '{0}' is not a parameter of any model.")]
    UnknownNuisance(String),

    #[error(
        "Got {params} global-observable-constrained parameters but {observables} global observables."
    )]
    GlobalObservableMismatch { params: usize, observables: usize },

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Minimization failed: {0}")]
    Minimizer(#[from] MinimizerError),

    #[error("Parameter error: {0}")]
    Parameter(#[from] ParameterError),

    #[error("Constraint policy error: {0}")]
    Policy(#[from] PolicyError),
}

/// Value of a test statistic together with the two fits it came from.
#[derive(Debug, Clone)]
pub struct Evaluation {
    /// `numerator.value - denominator.value`
    pub value: f64,
    pub numerator: MinimizationOutcome,
    pub denominator: MinimizationOutcome,
}

impl Evaluation {
    /// Whether both fits converged.
    pub fn is_valid(&self) -> bool {
        self.numerator.is_valid() && self.denominator.is_valid()
    }
}

pub trait TestStatistic {
    fn evaluate_detailed(
        &mut self,
        data: &Dataset,
        null_poi: &Snapshot,
    ) -> Result<Evaluation, TestStatError>;

    fn evaluate(&mut self, data: &Dataset, null_poi: &Snapshot) -> Result<f64, TestStatError> {
        self.evaluate_detailed(data, null_poi).map(|e| e.value)
    }

    /// Writes global-observable values into the live parameters of every model
    /// that has them. Names no model knows are ignored.
    fn set_global_observables(&mut self, values: &[(String, f64)]);
}

impl<T: TestStatistic + ?Sized> TestStatistic for Box<T> {
    fn evaluate_detailed(
        &mut self,
        data: &Dataset,
        null_poi: &Snapshot,
    ) -> Result<Evaluation, TestStatError> {
        (**self).evaluate_detailed(data, null_poi)
    }

    fn set_global_observables(&mut self, values: &[(String, f64)]) {
        (**self).set_global_observables(values)
    }
}

fn set_values_where_present(params: &mut ParameterSet, values: &[(String, f64)]) {
    for (name, value) in values {
        if let Some(p) = params.get_mut(name) {
            p.set_value(*value);
        }
    }
}

/// One profile fit: minimizes the constrained NLL from the model's current
/// parameters and writes the fitted values back.
fn profile<M: ProbabilityModel, Mz: Minimizer>(
    model: &mut M,
    data: &Dataset,
    constrain: &[String],
    minimizer: &Mz,
    verbosity: i32,
    hesse: bool,
) -> Result<MinimizationOutcome, TestStatError> {
    if verbosity > 0 {
        log::info!("Profiling likelihood for model '{}'", model.name());
    }
    let options = MinimizerOptions::default()
        .with_strategy(Strategy::Fast)
        .with_print_level(verbosity - 1)
        .with_hesse(hesse);

    let outcome = {
        let nll = model.create_nll(data, constrain)?;
        minimizer.minimize(model.parameters(), &nll, &options)?
    };
    if !outcome.is_valid() {
        log::debug!(
            "Fit of '{}' on '{}' ended with status {}; using value {} as is",
            model.name(),
            data.name(),
            outcome.status,
            outcome.value
        );
    }
    // Values only: errors from the verbosity-gated Hesse step must not reach
    // the start of the next fit.
    model.parameters_mut().set_values(outcome.point.view())?;
    Ok(outcome)
}

/// `NLL(null, profiled) - NLL(alt, profiled)`.
pub struct ProfiledLikelihoodRatioTestStat<N, A, Mz = BfgsMinimizer> {
    observables: Vec<String>,
    null_model: N,
    alt_model: A,
    nuisance_names: Vec<String>,
    nuisances: Snapshot,
    null_params: Snapshot,
    alt_params: Snapshot,
    verbosity: i32,
    minimizer: Mz,
}

impl<N: ProbabilityModel, A: ProbabilityModel> ProfiledLikelihoodRatioTestStat<N, A> {
    /// Nuisance parameters are captured as they are in the null model (or, for
    /// names only the alternate has, in the alternate model).
    pub fn new(
        observables: &[&str],
        null_model: N,
        alt_model: A,
        nuisances: Option<&[&str]>,
        null_params: &ParameterSet,
        alt_params: &ParameterSet,
        verbosity: i32,
    ) -> Result<Self, TestStatError> {
        let nuisance_names: Vec<String> = nuisances
            .unwrap_or_default()
            .iter()
            .map(|n| n.to_string())
            .collect();
        let mut captured = Vec::with_capacity(nuisance_names.len());
        for name in &nuisance_names {
            let p = null_model
                .parameters()
                .get(name)
                .or_else(|| alt_model.parameters().get(name))
                .ok_or_else(|| TestStatError::UnknownNuisance(name.clone()))?;
            captured.push(p.clone());
        }

        let stat = Self {
            observables: observables.iter().map(|o| o.to_string()).collect(),
            null_model,
            alt_model,
            nuisance_names,
            nuisances: Snapshot::from_parameters(captured)?,
            null_params: null_params.snapshot(),
            alt_params: alt_params.snapshot(),
            verbosity,
            minimizer: BfgsMinimizer,
        };
        log::debug!(
            "Likelihood-ratio statistic for '{}' vs '{}'; null configuration:\n{}alt configuration:\n{}",
            stat.null_model.name(),
            stat.alt_model.name(),
            stat.null_params,
            stat.alt_params
        );
        Ok(stat)
    }
}

impl<N, A, Mz> ProfiledLikelihoodRatioTestStat<N, A, Mz> {
    pub fn with_minimizer<Mz2: Minimizer>(self, minimizer: Mz2) -> ProfiledLikelihoodRatioTestStat<N, A, Mz2> {
        ProfiledLikelihoodRatioTestStat {
            observables: self.observables,
            null_model: self.null_model,
            alt_model: self.alt_model,
            nuisance_names: self.nuisance_names,
            nuisances: self.nuisances,
            null_params: self.null_params,
            alt_params: self.alt_params,
            verbosity: self.verbosity,
            minimizer,
        }
    }

    pub fn null_model(&self) -> &N {
        &self.null_model
    }

    pub fn alt_model(&self) -> &A {
        &self.alt_model
    }

    pub fn null_model_mut(&mut self) -> &mut N {
        &mut self.null_model
    }

    pub fn alt_model_mut(&mut self) -> &mut A {
        &mut self.alt_model
    }

    pub fn minimizer(&self) -> &Mz {
        &self.minimizer
    }

    pub fn verbosity(&self) -> i32 {
        self.verbosity
    }
}

impl<N: ProbabilityModel, A: ProbabilityModel, Mz: Minimizer> TestStatistic
    for ProfiledLikelihoodRatioTestStat<N, A, Mz>
{
    fn evaluate_detailed(
        &mut self,
        data: &Dataset,
        null_poi: &Snapshot,
    ) -> Result<Evaluation, TestStatError> {
        data.require_observables(&self.observables)?;

        let params = self.null_model.parameters_mut();
        params.assign(&self.nuisances);
        params.assign(&self.null_params);
        params.assign(null_poi);
        if self.verbosity > 1 {
            log::debug!(
                "Parameters of null model '{}' before the fit:\n{}",
                self.null_model.name(),
                self.null_model.parameters()
            );
        }
        let null_fit = profile(
            &mut self.null_model,
            data,
            &self.nuisance_names,
            &self.minimizer,
            self.verbosity,
            false,
        )?;

        let params = self.alt_model.parameters_mut();
        params.assign(&self.nuisances);
        params.assign(&self.alt_params);
        if self.verbosity > 1 {
            log::debug!(
                "Parameters of alt model '{}' before the fit:\n{}",
                self.alt_model.name(),
                self.alt_model.parameters()
            );
        }
        let alt_fit = profile(
            &mut self.alt_model,
            data,
            &self.nuisance_names,
            &self.minimizer,
            self.verbosity,
            false,
        )?;

        log::debug!(
            "Likelihood ratio on '{}': null = {:+.4}, alt = {:+.4}",
            data.name(),
            null_fit.value,
            alt_fit.value
        );
        Ok(Evaluation {
            value: null_fit.value - alt_fit.value,
            numerator: null_fit,
            denominator: alt_fit,
        })
    }

    fn set_global_observables(&mut self, values: &[(String, f64)]) {
        set_values_where_present(self.null_model.parameters_mut(), values);
        set_values_where_present(self.alt_model.parameters_mut(), values);
    }
}

/// One-sided profile-likelihood ratio `NLL(POI = hypothesis) - NLL(POI floating)`.
pub struct ProfiledLikelihoodTestStat<M, Mz = BfgsMinimizer> {
    observables: Vec<String>,
    model: M,
    nuisance_names: Vec<String>,
    snapshot: Snapshot,
    policy: ConstraintPolicy,
    verbosity: i32,
    minimizer: Mz,
}

impl<M: ProbabilityModel> ProfiledLikelihoodTestStat<M> {
    /// The first entry of `params` is the parameter of interest and its value
    /// is the hypothesis. `global_observable_params[i]` is pinned to
    /// `global_observables[i]` in every evaluation.
    pub fn new(
        observables: &[&str],
        model: M,
        nuisances: Option<&[&str]>,
        params: &ParameterSet,
        global_observable_params: &[&str],
        global_observables: &[&str],
        verbosity: i32,
    ) -> Result<Self, TestStatError> {
        let poi = params
            .first()
            .ok_or(TestStatError::NoParameterOfInterest)?
            .name()
            .to_string();
        model.parameters().find(&poi)?;

        let nuisance_names: Vec<&str> = nuisances.unwrap_or_default().to_vec();
        for name in &nuisance_names {
            if !model.parameters().contains(name) {
                return Err(TestStatError::UnknownNuisance(name.to_string()));
            }
        }
        let snapshot = params
            .snapshot()
            .with_floating(&poi)?
            .merged_with(&model.parameters().snapshot_of(nuisance_names.iter().copied())?);

        if global_observable_params.len() != global_observables.len() {
            return Err(TestStatError::GlobalObservableMismatch {
                params: global_observable_params.len(),
                observables: global_observables.len(),
            });
        }
        let mut policy = ConstraintPolicy::new(poi);
        for (&nuisance, &gobs) in global_observable_params.iter().zip(global_observables) {
            model.parameters().find(nuisance)?;
            model.parameters().find(gobs)?;
            policy = policy.with_ancillary(nuisance, gobs);
        }

        let stat = Self {
            observables: observables.iter().map(|o| o.to_string()).collect(),
            model,
            nuisance_names: nuisance_names.iter().map(|n| n.to_string()).collect(),
            snapshot,
            policy,
            verbosity,
            minimizer: BfgsMinimizer,
        };
        log::debug!(
            "Profile-likelihood statistic for '{}'; all parameters:\n{}snapshot:\n{}",
            stat.model.name(),
            stat.model.parameters(),
            stat.snapshot
        );
        Ok(stat)
    }
}

impl<M, Mz> ProfiledLikelihoodTestStat<M, Mz> {
    pub fn with_minimizer<Mz2: Minimizer>(self, minimizer: Mz2) -> ProfiledLikelihoodTestStat<M, Mz2> {
        ProfiledLikelihoodTestStat {
            observables: self.observables,
            model: self.model,
            nuisance_names: self.nuisance_names,
            snapshot: self.snapshot,
            policy: self.policy,
            verbosity: self.verbosity,
            minimizer,
        }
    }

    pub fn poi(&self) -> &str {
        self.policy.poi()
    }

    /// The hypothesized POI value held in the stored configuration.
    pub fn hypothesis(&self) -> Result<f64, TestStatError> {
        self.snapshot
            .get(self.policy.poi())
            .map(|p| p.value())
            .ok_or_else(|| ParameterError::Missing(self.policy.poi().to_string()).into())
    }

    /// Moves the hypothesis without touching the rest of the configuration.
    pub fn set_hypothesis(&mut self, value: f64) -> Result<(), TestStatError> {
        self.snapshot = self.snapshot.with_value(self.policy.poi(), value)?;
        Ok(())
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn minimizer(&self) -> &Mz {
        &self.minimizer
    }

    pub fn verbosity(&self) -> i32 {
        self.verbosity
    }
}

impl<M: ProbabilityModel, Mz: Minimizer> ProfiledLikelihoodTestStat<M, Mz> {
    fn profile_both(&mut self, data: &Dataset) -> Result<Evaluation, TestStatError> {
        let hypothesis = self.hypothesis()?;
        self.model.parameters_mut().assign(&self.snapshot);
        self.policy
            .apply(Pass::Free, hypothesis, self.model.parameters_mut())?;
        log::debug!(
            "Evaluating on '{}' at {} = {}; parameters before the free fit:\n{}",
            data.name(),
            self.policy.poi(),
            hypothesis,
            self.model.parameters()
        );

        let hesse = self.verbosity > 1;
        let denominator = profile(
            &mut self.model,
            data,
            &self.nuisance_names,
            &self.minimizer,
            self.verbosity,
            hesse,
        )?;

        self.policy
            .apply(Pass::Conditional, hypothesis, self.model.parameters_mut())?;
        let numerator = profile(
            &mut self.model,
            data,
            &self.nuisance_names,
            &self.minimizer,
            self.verbosity,
            hesse,
        )?;

        Ok(Evaluation {
            value: numerator.value - denominator.value,
            numerator,
            denominator,
        })
    }
}

impl<M: ProbabilityModel, Mz: Minimizer> TestStatistic for ProfiledLikelihoodTestStat<M, Mz> {
    /// `null_poi` is not used; the hypothesis is the stored POI value.
    fn evaluate_detailed(
        &mut self,
        data: &Dataset,
        null_poi: &Snapshot,
    ) -> Result<Evaluation, TestStatError> {
        if !null_poi.is_empty() {
            log::trace!("Ignoring caller POI values; hypothesis comes from the stored configuration");
        }
        data.require_observables(&self.observables)?;

        let initial_state = self.model.parameters().snapshot();
        let result = self.profile_both(data);
        self.model.parameters_mut().restore(&initial_state);
        result
    }

    fn set_global_observables(&mut self, values: &[(String, f64)]) {
        set_values_where_present(self.model.parameters_mut(), values);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::minimizer::{FitStatus, Objective};
    use crate::model::{CountingModel, CountingNames, GaussianMeanModel};
    use crate::params::Parameter;
    use approx::assert_abs_diff_eq;
    use std::cell::RefCell;

    /// Evaluates the objective at the start point and records the parameters
    /// and options it was handed.
    #[derive(Default)]
    struct RecordingMinimizer {
        calls: RefCell<Vec<ParameterSet>>,
        options: RefCell<Vec<MinimizerOptions>>,
    }

    impl Minimizer for RecordingMinimizer {
        fn minimize(
            &self,
            parameters: &ParameterSet,
            objective: &dyn Objective,
            options: &MinimizerOptions,
        ) -> Result<MinimizationOutcome, MinimizerError> {
            assert_eq!(options.strategy, Strategy::Fast);
            self.calls.borrow_mut().push(parameters.clone());
            self.options.borrow_mut().push(options.clone());
            let point = parameters.values();
            Ok(MinimizationOutcome {
                value: objective.value(point.view()),
                point,
                parameter_names: parameters.names().map(str::to_string).collect(),
                free_parameters: Vec::new(),
                covariance: None,
                status: FitStatus::Converged,
                iterations: Some(0),
                function_evals: 1,
                gradient_norm: 0.0,
            })
        }
    }

    fn gaussian() -> GaussianMeanModel {
        GaussianMeanModel::new(
            "gauss",
            "x",
            Parameter::new("mu", 1.0).with_range(-10.0, 20.0).unwrap().with_error(0.5),
            Parameter::new("sigma", 1.0).constant(),
        )
        .unwrap()
    }

    fn data_near(mean: f64) -> Dataset {
        let values = (0..20).map(|i| mean + 0.1 * (i as f64 - 9.5)).collect();
        Dataset::from_column("obs", "x", values).unwrap()
    }

    fn poi_at(value: f64) -> ParameterSet {
        let mut params = ParameterSet::from_parameters([gaussian().parameters().find("mu").unwrap().clone()]).unwrap();
        params.find_mut("mu").unwrap().set_value(value);
        params
    }

    fn counting_stat(hypothesis: f64) -> ProfiledLikelihoodTestStat<CountingModel, RecordingMinimizer> {
        counting_stat_at_verbosity(hypothesis, 0)
    }

    fn counting_stat_at_verbosity(
        hypothesis: f64,
        verbosity: i32,
    ) -> ProfiledLikelihoodTestStat<CountingModel, RecordingMinimizer> {
        let model = CountingModel::new("count", vec![4.0], vec![10.0], 0.2, CountingNames::default()).unwrap();
        let mut params = ParameterSet::from_parameters([model.parameters().find("r").unwrap().clone()]).unwrap();
        params.find_mut("r").unwrap().set_value(hypothesis);
        ProfiledLikelihoodTestStat::new(
            &["n"],
            model,
            Some(&["theta"]),
            &params,
            &["theta"],
            &["theta_obs"],
            verbosity,
        )
        .unwrap()
        .with_minimizer(RecordingMinimizer::default())
    }

    #[test]
    fn profile_statistic_restores_parameters() {
        let mut stat = counting_stat(2.0);
        stat.model_mut().parameters_mut().find_mut("theta_obs").unwrap().set_value(0.4);
        let before = stat.model().parameters().snapshot();
        let data = Dataset::from_column("d", "n", vec![12.0]).unwrap();
        stat.evaluate(&data, &Snapshot::default()).unwrap();
        assert_eq!(stat.model().parameters().snapshot(), before);
    }

    #[test]
    fn restores_parameters_on_error() {
        let mut stat = counting_stat(1.0);
        stat.set_hypothesis(-1.0).unwrap();
        let before = stat.model().parameters().snapshot();
        let data = Dataset::from_column("d", "n", vec![12.0]).unwrap();
        let err = stat.evaluate(&data, &Snapshot::default()).unwrap_err();
        assert!(matches!(err, TestStatError::Policy(PolicyError::EmptyPoiRange { .. })));
        assert_eq!(stat.model().parameters().snapshot(), before);
    }

    #[test]
    fn ancillary_substitution_precedes_both_fits() {
        let mut stat = counting_stat(2.0);
        stat.model_mut().parameters_mut().find_mut("theta_obs").unwrap().set_value(-0.8);
        let data = Dataset::from_column("d", "n", vec![12.0]).unwrap();
        stat.evaluate(&data, &Snapshot::default()).unwrap();

        let calls = stat.minimizer().calls.borrow();
        assert_eq!(calls.len(), 2);
        for call in calls.iter() {
            let theta = call.find("theta").unwrap();
            assert_eq!(theta.value(), -0.8);
            assert!(theta.is_constant());
        }
    }

    #[test]
    fn poi_range_follows_the_hypothesis() {
        let data = Dataset::from_column("d", "n", vec![12.0]).unwrap();

        let mut at_zero = counting_stat(0.0);
        at_zero.evaluate(&data, &Snapshot::default()).unwrap();
        let calls = at_zero.minimizer().calls.borrow();
        let free = calls[0].find("r").unwrap();
        assert!(!free.is_constant());
        assert_eq!(free.min(), 0.0);
        assert!(!free.has_max());
        let fixed = calls[1].find("r").unwrap();
        assert!(fixed.is_constant());
        assert_eq!(fixed.value(), 0.0);

        let mut at_three = counting_stat(3.0);
        at_three.evaluate(&data, &Snapshot::default()).unwrap();
        let calls = at_three.minimizer().calls.borrow();
        assert_eq!(calls[0].find("r").unwrap().max(), 3.0);
        assert_eq!(calls[1].find("r").unwrap().value(), 3.0);
    }

    #[test]
    fn profile_statistic_is_numerator_minus_denominator() {
        let mut stat = counting_stat(2.0);
        let data = Dataset::from_column("d", "n", vec![12.0]).unwrap();
        let eval = stat.evaluate_detailed(&data, &Snapshot::default()).unwrap();
        assert_eq!(eval.value, eval.numerator.value - eval.denominator.value);
        let calls = stat.minimizer().calls.borrow();
        assert!(calls[1].find("r").unwrap().is_constant());
        assert!(!calls[0].find("r").unwrap().is_constant());
    }

    #[test]
    fn verbosity_sets_print_level_and_hesse_of_profile_fits() {
        let data = Dataset::from_column("d", "n", vec![12.0]).unwrap();
        for verbosity in [0, 1, 2, 3] {
            let mut stat = counting_stat_at_verbosity(2.0, verbosity);
            stat.evaluate(&data, &Snapshot::default()).unwrap();
            let options = stat.minimizer().options.borrow();
            assert_eq!(options.len(), 2);
            for o in options.iter() {
                assert_eq!(o.print_level, verbosity - 1);
                assert_eq!(o.hesse, verbosity > 1);
            }
        }
    }

    #[test]
    fn ratio_statistic_never_requests_hesse() {
        let mut stat =
            ProfiledLikelihoodRatioTestStat::new(&["x"], gaussian(), gaussian(), None, &poi_at(1.0), &poi_at(2.0), 2)
                .unwrap()
                .with_minimizer(RecordingMinimizer::default());
        stat.evaluate(&data_near(2.0), &Snapshot::default()).unwrap();
        let options = stat.minimizer().options.borrow();
        assert_eq!(options.len(), 2);
        for o in options.iter() {
            assert_eq!(o.print_level, 1);
            assert!(!o.hesse);
        }
    }

    #[test]
    fn non_finite_start_is_reported_in_the_outcome() {
        let model = GaussianMeanModel::new(
            "gauss",
            "x",
            Parameter::new("mu", 1.0).with_range(-10.0, 20.0).unwrap(),
            Parameter::new("sigma", 1.0).constant(),
        )
        .unwrap();
        let mut stat = ProfiledLikelihoodTestStat::new(&["x"], model, None, &poi_at(1.0), &[], &[], 0).unwrap();
        // A width of zero makes every NLL evaluation infinite.
        stat.model_mut().parameters_mut().find_mut("sigma").unwrap().set_range(0.0, 1.0).unwrap();
        stat.model_mut().parameters_mut().find_mut("sigma").unwrap().set_value(0.0);

        let eval = stat.evaluate_detailed(&data_near(1.0), &Snapshot::default()).unwrap();
        assert_eq!(eval.denominator.status, FitStatus::NonFinite);
        assert_eq!(eval.numerator.status, FitStatus::NonFinite);
        assert!(!eval.is_valid());
        assert_eq!(stat.model().parameters().value("sigma").unwrap(), 0.0);
    }

    #[test]
    fn construction_rejects_unknown_names() {
        let model = gaussian();
        let params = poi_at(1.0);
        let unknown_nuisance =
            ProfiledLikelihoodTestStat::new(&["x"], model.clone(), Some(&["tau"]), &params, &[], &[], 0);
        assert!(matches!(unknown_nuisance, Err(TestStatError::UnknownNuisance(_))));

        let mismatched =
            ProfiledLikelihoodTestStat::new(&["x"], model.clone(), None, &params, &["mu"], &[], 0);
        assert!(matches!(
            mismatched,
            Err(TestStatError::GlobalObservableMismatch { params: 1, observables: 0 })
        ));

        let empty = ProfiledLikelihoodTestStat::new(&["x"], model, None, &ParameterSet::new(), &[], &[], 0);
        assert!(matches!(empty, Err(TestStatError::NoParameterOfInterest)));
    }

    #[test]
    fn ratio_statistic_applies_overrides_in_order() {
        let mut null_params = poi_at(2.0);
        null_params.insert(Parameter::new("sigma", 1.0).constant()).unwrap();
        let alt_params = poi_at(4.0);
        let null_poi = Snapshot::from_parameters([Parameter::new("mu", 3.0).constant()]).unwrap();

        let mut stat = ProfiledLikelihoodRatioTestStat::new(
            &["x"],
            gaussian(),
            gaussian(),
            None,
            &null_params,
            &alt_params,
            0,
        )
        .unwrap()
        .with_minimizer(RecordingMinimizer::default());
        stat.evaluate(&data_near(3.0), &null_poi).unwrap();

        let calls = stat.minimizer().calls.borrow();
        assert_eq!(calls[0].value("mu").unwrap(), 3.0);
        assert!(calls[0].find("mu").unwrap().is_constant());
        assert_eq!(calls[1].value("mu").unwrap(), 4.0);
    }

    #[test]
    fn ratio_statistic_sign_flips_with_roles() {
        let data = data_near(3.0);
        let (low, high) = (poi_at(0.5), poi_at(3.0));
        let mut forward =
            ProfiledLikelihoodRatioTestStat::new(&["x"], gaussian(), gaussian(), None, &low, &high, 0)
                .unwrap()
                .with_minimizer(RecordingMinimizer::default());
        let mut backward =
            ProfiledLikelihoodRatioTestStat::new(&["x"], gaussian(), gaussian(), None, &high, &low, 0)
                .unwrap()
                .with_minimizer(RecordingMinimizer::default());
        let empty = Snapshot::default();
        let a = forward.evaluate(&data, &empty).unwrap();
        let b = backward.evaluate(&data, &empty).unwrap();
        assert!(a > 0.0);
        assert_abs_diff_eq!(a, -b, epsilon = 1e-12);
    }

    #[test]
    fn ratio_statistic_leaves_fitted_values_behind() {
        let mut null_params = poi_at(0.0);
        null_params.find_mut("mu").unwrap().set_constant(true);
        let alt_params = poi_at(1.0);
        let mut stat =
            ProfiledLikelihoodRatioTestStat::new(&["x"], gaussian(), gaussian(), None, &null_params, &alt_params, 0)
                .unwrap();
        stat.evaluate(&data_near(5.0), &Snapshot::default()).unwrap();

        assert_eq!(stat.null_model().parameters().value("mu").unwrap(), 0.0);
        assert!(stat.null_model().parameters().find("mu").unwrap().is_constant());
        assert_abs_diff_eq!(stat.alt_model().parameters().value("mu").unwrap(), 5.0, epsilon = 1e-3);
    }

    #[test]
    fn unknown_ratio_nuisance_is_an_error() {
        let result = ProfiledLikelihoodRatioTestStat::new(
            &["x"],
            gaussian(),
            gaussian(),
            Some(&["theta"]),
            &poi_at(0.0),
            &poi_at(1.0),
            0,
        );
        assert!(matches!(result, Err(TestStatError::UnknownNuisance(_))));
    }

    #[test]
    fn missing_observable_in_data_is_an_error() {
        let mut stat = counting_stat(1.0);
        let data = Dataset::from_column("d", "m", vec![1.0]).unwrap();
        let err = stat.evaluate(&data, &Snapshot::default()).unwrap_err();
        assert!(matches!(err, TestStatError::Model(ModelError::MissingObservable { .. })));
    }

    #[test]
    fn set_hypothesis_moves_only_the_poi() {
        let mut stat = counting_stat(1.0);
        stat.set_hypothesis(4.5).unwrap();
        assert_eq!(stat.hypothesis().unwrap(), 4.5);
        assert_eq!(stat.poi(), "r");
    }
}
