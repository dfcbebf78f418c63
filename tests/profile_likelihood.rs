use approx::{assert_abs_diff_eq, assert_relative_eq};
use plstat::minimizer::FitStatus;
use plstat::model::{CountingModel, CountingNames, Dataset, GaussianMeanModel, ProbabilityModel};
use plstat::params::{Parameter, ParameterSet, Snapshot};
use plstat::teststat::{
    ProfiledLikelihoodRatioTestStat, ProfiledLikelihoodTestStat, TestStatError, TestStatistic,
};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

const N: usize = 50;

/// Seeded draws from N(5, 1), shifted so the sample mean is exactly 5.
fn data_with_mean_five() -> Dataset {
    let mut rng = StdRng::seed_from_u64(2024);
    let normal = Normal::new(5.0, 1.0).unwrap();
    let draws: Vec<f64> = (0..N).map(|_| normal.sample(&mut rng)).collect();
    let mean = draws.iter().sum::<f64>() / N as f64;
    let centred = draws.iter().map(|x| x - mean + 5.0).collect();
    Dataset::from_column("observed", "x", centred).unwrap()
}

fn gaussian(sigma_floating: bool) -> GaussianMeanModel {
    let mut sigma = Parameter::new("sigma", 1.0).with_range(0.2, 5.0).unwrap().with_error(0.1);
    sigma.set_constant(!sigma_floating);
    GaussianMeanModel::new(
        "gauss",
        "x",
        Parameter::new("mu", 1.0).with_range(-10.0, 20.0).unwrap().with_error(0.5),
        sigma,
    )
    .unwrap()
}

fn profile_stat(hypothesis: f64) -> ProfiledLikelihoodTestStat<GaussianMeanModel> {
    let model = gaussian(false);
    let poi = ParameterSet::from_parameters([model.parameters().find("mu").unwrap().clone()]).unwrap();
    let mut stat = ProfiledLikelihoodTestStat::new(&["x"], model, None, &poi, &[], &[], 0).unwrap();
    stat.set_hypothesis(hypothesis).unwrap();
    stat
}

#[test]
fn gaussian_statistic_is_large_at_zero_and_vanishes_at_the_truth() {
    let data = data_with_mean_five();

    let t_zero = profile_stat(0.0).evaluate(&data, &Snapshot::default()).unwrap();
    // NLL(0) - NLL(5) = n * 5^2 / 2 for unit width and sample mean 5.
    assert_relative_eq!(t_zero, 12.5 * N as f64, max_relative = 1e-4);

    let t_five = profile_stat(5.0).evaluate(&data, &Snapshot::default()).unwrap();
    assert_abs_diff_eq!(t_five, 0.0, epsilon = 1e-2);
}

#[test]
fn statistic_is_one_sided_above_zero() {
    let data = data_with_mean_five();
    let t = |h: f64| profile_stat(h).evaluate(&data, &Snapshot::default()).unwrap();

    // Below the best fit the free fit is capped at the hypothesis.
    assert_abs_diff_eq!(t(3.0), 0.0, epsilon = 1e-2);

    // Above it the statistic grows as n * (h - 5)^2 / 2.
    let (t6, t7) = (t(6.0), t(7.0));
    assert_relative_eq!(t6, 0.5 * N as f64, max_relative = 1e-3);
    assert_relative_eq!(t7, 2.0 * N as f64, max_relative = 1e-3);
}

#[test]
fn repeated_evaluations_are_identical() {
    let data = data_with_mean_five();
    let mut stat = profile_stat(2.0);
    let first = stat.evaluate(&data, &Snapshot::default()).unwrap();
    let second = stat.evaluate(&data, &Snapshot::default()).unwrap();
    assert_eq!(first.to_bits(), second.to_bits());
}

#[test]
fn verbosity_does_not_change_the_value() {
    let data = data_with_mean_five();
    let evaluate_at = |verbosity: i32| {
        let model = gaussian(true);
        let poi = ParameterSet::from_parameters([model.parameters().find("mu").unwrap().clone()]).unwrap();
        let mut stat =
            ProfiledLikelihoodTestStat::new(&["x"], model, Some(&["sigma"]), &poi, &[], &[], verbosity).unwrap();
        stat.set_hypothesis(6.0).unwrap();
        stat.evaluate_detailed(&data, &Snapshot::default()).unwrap()
    };

    let quiet = evaluate_at(0);
    let verbose = evaluate_at(2);
    assert_eq!(quiet.value.to_bits(), verbose.value.to_bits());
    assert!(quiet.denominator.covariance.is_none());
    assert!(verbose.denominator.covariance.is_some());
}

#[test]
fn profile_evaluation_restores_live_parameters() {
    let data = data_with_mean_five();
    let mut stat = profile_stat(3.0);
    {
        let params = stat.model_mut().parameters_mut();
        params.find_mut("mu").unwrap().set_value(-2.0);
        params.find_mut("mu").unwrap().set_constant(true);
        params.find_mut("sigma").unwrap().set_error(0.37);
    }
    let before = stat.model().parameters().snapshot();
    stat.evaluate(&data, &Snapshot::default()).unwrap();
    assert_eq!(stat.model().parameters().snapshot(), before);
}

#[test]
fn negative_hypothesis_is_rejected_and_state_kept() {
    let data = data_with_mean_five();
    let mut stat = profile_stat(1.0);
    stat.set_hypothesis(-0.5).unwrap();
    let before = stat.model().parameters().snapshot();
    assert!(matches!(
        stat.evaluate(&data, &Snapshot::default()),
        Err(TestStatError::Policy(_))
    ));
    assert_eq!(stat.model().parameters().snapshot(), before);
}

fn counting_stat(hypothesis: f64) -> ProfiledLikelihoodTestStat<CountingModel> {
    let model = CountingModel::new(
        "counting",
        vec![5.0, 10.0, 5.0],
        vec![40.0, 20.0, 10.0],
        0.1,
        CountingNames::default(),
    )
    .unwrap();
    let poi = ParameterSet::from_parameters([model.parameters().find("r").unwrap().clone()]).unwrap();
    let mut stat = ProfiledLikelihoodTestStat::new(
        &["n"],
        model,
        Some(&["theta"]),
        &poi,
        &["theta"],
        &["theta_obs"],
        0,
    )
    .unwrap();
    stat.set_hypothesis(hypothesis).unwrap();
    stat
}

#[test]
fn counting_excess_disfavors_background_only() {
    // Expected at r = 2: [50, 40, 20].
    let data = Dataset::from_column("observed", "n", vec![50.0, 40.0, 20.0]).unwrap();
    let mut at_zero = counting_stat(0.0);
    let eval = at_zero.evaluate_detailed(&data, &Snapshot::default()).unwrap();
    assert!(eval.value > 5.0, "t(0) = {}", eval.value);
    assert_eq!(eval.numerator.status, FitStatus::Converged);
    assert_eq!(eval.numerator.point[0], 0.0);

    let t_two = counting_stat(2.0).evaluate(&data, &Snapshot::default()).unwrap();
    assert_abs_diff_eq!(t_two, 0.0, epsilon = 1e-2);
}

#[test]
fn global_observables_steer_the_nuisance() {
    let data = Dataset::from_column("observed", "n", vec![50.0, 40.0, 20.0]).unwrap();
    let mut stat = counting_stat(2.0);
    let nominal = stat.evaluate_detailed(&data, &Snapshot::default()).unwrap();
    assert_eq!(nominal.denominator.point[1], 0.0);

    // The ancillary nuisance is pinned to whatever the global observable holds.
    stat.set_global_observables(&[("theta_obs".to_string(), 1.5)]);
    let shifted = stat.evaluate_detailed(&data, &Snapshot::default()).unwrap();
    assert_eq!(shifted.denominator.point[1], 1.5);
    assert_eq!(shifted.numerator.point[1], 1.5);
    assert!(shifted.value > nominal.value);
    assert_eq!(stat.model().parameters().value("theta").unwrap(), 0.0);
}

fn ratio_stat(null_mu: f64, alt_mu: f64) -> ProfiledLikelihoodRatioTestStat<GaussianMeanModel, GaussianMeanModel> {
    let mut null = gaussian(true).parameters().clone();
    null.find_mut("mu").unwrap().set_value(null_mu);
    null.find_mut("mu").unwrap().set_constant(true);
    let mut alt = gaussian(true).parameters().clone();
    alt.find_mut("mu").unwrap().set_value(alt_mu);
    alt.find_mut("mu").unwrap().set_constant(true);
    ProfiledLikelihoodRatioTestStat::new(&["x"], gaussian(true), gaussian(true), None, &null, &alt, 0).unwrap()
}

#[test]
fn ratio_statistic_flips_sign_when_roles_swap() {
    let data = data_with_mean_five();
    let forward = ratio_stat(4.0, 5.0).evaluate(&data, &Snapshot::default()).unwrap();
    let backward = ratio_stat(5.0, 4.0).evaluate(&data, &Snapshot::default()).unwrap();
    assert!(forward > 0.0);
    assert_abs_diff_eq!(forward, -backward, epsilon = 1e-9);
}

#[test]
fn ratio_statistic_keeps_fitted_state() {
    let data = data_with_mean_five();
    let mut stat = ratio_stat(4.0, 5.0);
    stat.evaluate(&data, &Snapshot::default()).unwrap();

    let fitted_sigma = stat.alt_model().parameters().value("sigma").unwrap();
    let variance = data
        .column("x")
        .unwrap()
        .iter()
        .map(|x| (x - 5.0) * (x - 5.0))
        .sum::<f64>()
        / N as f64;
    assert_relative_eq!(fitted_sigma, variance.sqrt(), max_relative = 1e-3);
    assert_eq!(stat.null_model().parameters().value("mu").unwrap(), 4.0);
}

#[test]
fn caller_poi_overrides_the_stored_null_configuration() {
    let data = data_with_mean_five();
    let null_poi = Snapshot::from_parameters([Parameter::new("mu", 5.0).constant()]).unwrap();
    let t = ratio_stat(4.0, 5.0).evaluate(&data, &null_poi).unwrap();
    assert_abs_diff_eq!(t, 0.0, epsilon = 1e-6);
}
