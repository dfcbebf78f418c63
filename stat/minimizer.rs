//! Minimizer adapter.
//!
//! The solver itself is the BFGS implementation from `wolfe_bfgs`. This module
//! turns a [`ParameterSet`] plus an objective over the full parameter vector into
//! an unconstrained problem over the free parameters, runs the solver under a
//! [`Strategy`], and reports the result as an explicit [`MinimizationOutcome`].
//! Solver failures do not become errors: they are reported in the outcome
//! together with the best point that was visited.

use crate::params::{ParameterError, ParameterSet};
use crate::transforms::BoundTransform;
use ndarray::{Array1, Array2, ArrayView1};
use ndarray_linalg::Inverse;
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::sync::RwLock;
use thiserror::Error;
use wolfe_bfgs::{Bfgs, BfgsError, BfgsSolution};

pub const DEFAULT_MINIMIZER_TYPE: &str = "WolfeBfgs";
pub const DEFAULT_MINIMIZER_ALGORITHM: &str = "bfgs";

/// Returned in place of a non-finite objective value so the line search can
/// back off instead of aborting.
const NON_FINITE_PENALTY: f64 = 1e10;

/// Relative step for forward differences, about `sqrt(f64::EPSILON)`.
const FORWARD_STEP: f64 = 1.5e-8;
/// Relative step for central differences, about `cbrt(f64::EPSILON)`.
const CENTRAL_STEP: f64 = 6.0e-6;
/// Relative step for the second-derivative stencil.
const HESSIAN_STEP: f64 = 1.0e-4;

static DEFAULT_MINIMIZER: RwLock<Option<(String, String)>> = RwLock::new(None);

/// Sets the process-wide minimizer type/algorithm used by [`MinimizerOptions::default`].
pub fn set_default_minimizer(minimizer_type: &str, algorithm: &str) {
    match DEFAULT_MINIMIZER.write() {
        Ok(mut guard) => *guard = Some((minimizer_type.to_string(), algorithm.to_string())),
        Err(poisoned) => {
            *poisoned.into_inner() = Some((minimizer_type.to_string(), algorithm.to_string()))
        }
    }
}

/// The process-wide minimizer type/algorithm pair.
pub fn default_minimizer() -> (String, String) {
    let stored = match DEFAULT_MINIMIZER.read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    };
    stored.unwrap_or_else(|| {
        (
            DEFAULT_MINIMIZER_TYPE.to_string(),
            DEFAULT_MINIMIZER_ALGORITHM.to_string(),
        )
    })
}

#[derive(Error, Debug)]
pub enum MinimizerError {
    #[error("Minimizer type '{minimizer_type}' with algorithm '{algorithm}' is not available.")]
    UnknownAlgorithm {
        minimizer_type: String,
        algorithm: String,
    },

    #[error("Parameter handling failed: {0}")]
    Parameter(#[from] ParameterError),
}

/// Cost/precision trade-off, numbered like MINUIT strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Strategy {
    /// Forward-difference gradients, no Hessian unless asked for.
    Fast,
    /// Central-difference gradients.
    Default,
    /// Central differences, tighter tolerance, Hessian always computed.
    Careful,
}

impl Strategy {
    pub fn level(self) -> u8 {
        match self {
            Self::Fast => 0,
            Self::Default => 1,
            Self::Careful => 2,
        }
    }

    fn central_differences(self) -> bool {
        !matches!(self, Self::Fast)
    }

    fn tolerance_scale(self) -> f64 {
        match self {
            Self::Careful => 0.1,
            Self::Fast | Self::Default => 1.0,
        }
    }
}

impl TryFrom<u8> for Strategy {
    type Error = String;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(Self::Fast),
            1 => Ok(Self::Default),
            2 => Ok(Self::Careful),
            other => Err(format!("strategy must be 0, 1 or 2 (got {other})")),
        }
    }
}

impl From<Strategy> for u8 {
    fn from(strategy: Strategy) -> u8 {
        strategy.level()
    }
}

/// Settings for one minimization.
#[derive(Debug, Clone, PartialEq)]
pub struct MinimizerOptions {
    pub minimizer_type: String,
    pub algorithm: String,
    pub strategy: Strategy,
    /// Values below 1 are silent; 1 logs a summary; 2 and above also logs the
    /// starting configuration.
    pub print_level: i32,
    /// Gradient-norm tolerance in internal coordinates.
    pub tolerance: f64,
    pub max_iterations: usize,
    /// Estimate the covariance from the Hessian at the minimum.
    pub hesse: bool,
}

impl Default for MinimizerOptions {
    fn default() -> Self {
        let (minimizer_type, algorithm) = default_minimizer();
        Self {
            minimizer_type,
            algorithm,
            strategy: Strategy::Default,
            print_level: 0,
            tolerance: 1e-4,
            max_iterations: 500,
            hesse: false,
        }
    }
}

impl MinimizerOptions {
    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_print_level(mut self, print_level: i32) -> Self {
        self.print_level = print_level;
        self
    }

    pub fn with_hesse(mut self, hesse: bool) -> Self {
        self.hesse = hesse;
        self
    }

    pub fn with_algorithm(mut self, minimizer_type: &str, algorithm: &str) -> Self {
        self.minimizer_type = minimizer_type.to_string();
        self.algorithm = algorithm.to_string();
        self
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }
}

/// A scalar function of the full parameter vector, in collection order.
pub trait Objective {
    fn value(&self, point: ArrayView1<f64>) -> f64;
}

impl<F> Objective for F
where
    F: Fn(ArrayView1<f64>) -> f64,
{
    fn value(&self, point: ArrayView1<f64>) -> f64 {
        self(point)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FitStatus {
    Converged,
    /// The solver stopped early; carries its message.
    SolverFailed(String),
    /// The objective is not finite at the start point; nothing was minimized.
    NonFinite,
}

impl fmt::Display for FitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Converged => f.write_str("converged"),
            Self::SolverFailed(reason) => write!(f, "failed ({reason})"),
            Self::NonFinite => f.write_str("non-finite objective"),
        }
    }
}

/// Result of one minimization.
#[derive(Debug, Clone)]
pub struct MinimizationOutcome {
    /// Objective value at `point`.
    pub value: f64,
    /// Full parameter vector at the reported minimum, in collection order.
    pub point: Array1<f64>,
    pub parameter_names: Vec<String>,
    /// Names of the floated parameters, in the order of `covariance`.
    pub free_parameters: Vec<String>,
    /// Covariance of the free parameters, when the Hessian was computed and
    /// could be inverted.
    pub covariance: Option<Array2<f64>>,
    pub status: FitStatus,
    /// Solver iterations; `None` when the solver stopped without reporting them.
    pub iterations: Option<usize>,
    pub function_evals: usize,
    /// Gradient norm at the minimum, in internal coordinates.
    pub gradient_norm: f64,
}

impl MinimizationOutcome {
    pub fn is_valid(&self) -> bool {
        self.status == FitStatus::Converged && self.value.is_finite()
    }

    /// Parabolic error of a free parameter.
    pub fn error(&self, name: &str) -> Option<f64> {
        let cov = self.covariance.as_ref()?;
        let i = self.free_parameters.iter().position(|n| n == name)?;
        Some(cov[[i, i]].max(0.0).sqrt())
    }

    /// Writes the fitted values, and errors where known, into `parameters`.
    pub fn apply_to(&self, parameters: &mut ParameterSet) -> Result<(), ParameterError> {
        parameters.set_values(self.point.view())?;
        for name in &self.free_parameters {
            if let Some(err) = self.error(name) {
                parameters.find_mut(name)?.set_error(err);
            }
        }
        Ok(())
    }
}

impl fmt::Display for MinimizationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let iterations = self
            .iterations
            .map_or_else(|| "unknown".to_string(), |n| n.to_string());
        writeln!(
            f,
            "  status = {}, min value = {:.8}, iterations = {}, calls = {}, |grad| = {:.3e}",
            self.status, self.value, iterations, self.function_evals, self.gradient_norm
        )?;
        for (name, value) in self.parameter_names.iter().zip(self.point.iter()) {
            match self.error(name) {
                Some(err) => writeln!(f, "    {name:<16} = {value:>12.6} +/- {err:.6}")?,
                None if self.free_parameters.contains(name) => {
                    writeln!(f, "    {name:<16} = {value:>12.6}")?
                }
                None => writeln!(f, "    {name:<16} = {value:>12.6} (fixed)")?,
            }
        }
        Ok(())
    }
}

/// Something that minimizes an [`Objective`] over the free parameters of a set.
pub trait Minimizer {
    fn minimize(
        &self,
        parameters: &ParameterSet,
        objective: &dyn Objective,
        options: &MinimizerOptions,
    ) -> Result<MinimizationOutcome, MinimizerError>;
}

/// Quasi-Newton minimizer backed by `wolfe_bfgs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BfgsMinimizer;

impl BfgsMinimizer {
    fn check_algorithm(options: &MinimizerOptions) -> Result<(), MinimizerError> {
        let minimizer_type = options.minimizer_type.to_ascii_lowercase();
        let algorithm = options.algorithm.to_ascii_lowercase();
        let type_ok = matches!(minimizer_type.as_str(), "wolfebfgs" | "bfgs");
        // Migrad is a variable-metric method as well, so configurations written
        // against it are served by the same solver.
        let algorithm_ok = matches!(algorithm.as_str(), "" | "bfgs" | "migrad");
        if type_ok && algorithm_ok {
            Ok(())
        } else {
            Err(MinimizerError::UnknownAlgorithm {
                minimizer_type: options.minimizer_type.clone(),
                algorithm: options.algorithm.clone(),
            })
        }
    }
}

impl Minimizer for BfgsMinimizer {
    fn minimize(
        &self,
        parameters: &ParameterSet,
        objective: &dyn Objective,
        options: &MinimizerOptions,
    ) -> Result<MinimizationOutcome, MinimizerError> {
        Self::check_algorithm(options)?;

        let problem = InternalProblem::new(parameters, objective);
        let parameter_names: Vec<String> = parameters.names().map(str::to_string).collect();
        let free_parameters: Vec<String> = problem
            .free
            .iter()
            .map(|&i| parameter_names[i].clone())
            .collect();

        if options.print_level >= 2 {
            log::info!("Minimizer start configuration:\n{parameters}");
        }

        let u0 = problem.start_point(parameters);
        let f0 = problem.raw_value(&u0);
        if !f0.is_finite() || problem.free.is_empty() {
            let status = if f0.is_finite() {
                log::trace!("No free parameters; evaluating objective once");
                FitStatus::Converged
            } else {
                log::warn!("Objective is {f0} at the start point; skipping the minimization");
                FitStatus::NonFinite
            };
            return Ok(MinimizationOutcome {
                value: f0,
                point: problem.external(&u0),
                parameter_names,
                free_parameters,
                covariance: None,
                status,
                iterations: Some(0),
                function_evals: 1,
                gradient_norm: 0.0,
            });
        }

        let central = options.strategy.central_differences();
        let tracker = BestPoint::new(u0.clone(), f0);
        let cost_and_grad = |u: &Array1<f64>| -> (f64, Array1<f64>) {
            let f = problem.value(u);
            tracker.offer(u, f);
            let grad = problem.gradient(u, f, central);
            tracker.count(if central { 1 + 2 * u.len() } else { 1 + u.len() });
            (f, grad)
        };

        let tolerance = options.tolerance * options.strategy.tolerance_scale();
        let (u_min, status, iterations) = match Bfgs::new(u0, cost_and_grad)
            .with_tolerance(tolerance)
            .with_max_iterations(options.max_iterations)
            .run()
        {
            Ok(BfgsSolution {
                final_point,
                iterations,
                ..
            }) => (final_point, FitStatus::Converged, Some(iterations)),
            Err(e) => {
                let (best_u, best_f) = tracker.best();
                log::warn!(
                    "BFGS did not converge ({e:?}); keeping best visited point with value {best_f:.8}"
                );
                let iterations = match &e {
                    BfgsError::MaxIterationsReached { last_solution } => Some(last_solution.iterations),
                    _ => None,
                };
                (best_u, FitStatus::SolverFailed(format!("{e:?}")), iterations)
            }
        };

        let value = problem.raw_value(&u_min);
        let gradient_norm = {
            let g = problem.gradient(&u_min, problem.value(&u_min), true);
            g.dot(&g).sqrt()
        };

        let covariance = if options.hesse || options.strategy == Strategy::Careful {
            problem.covariance(&u_min)
        } else {
            None
        };

        let outcome = MinimizationOutcome {
            value,
            point: problem.external(&u_min),
            parameter_names,
            free_parameters,
            covariance,
            status,
            iterations,
            function_evals: tracker.evaluations(),
            gradient_norm,
        };

        if options.print_level >= 1 {
            log::info!("Minimization result:\n{outcome}");
        }
        Ok(outcome)
    }
}

struct BestPoint {
    point: RefCell<(Array1<f64>, f64)>,
    evals: Cell<usize>,
}

impl BestPoint {
    fn new(u: Array1<f64>, f: f64) -> Self {
        Self {
            point: RefCell::new((u, f)),
            evals: Cell::new(1),
        }
    }

    fn offer(&self, u: &Array1<f64>, f: f64) {
        let mut best = self.point.borrow_mut();
        if f < best.1 || !best.1.is_finite() {
            *best = (u.clone(), f);
        }
    }

    fn count(&self, n: usize) {
        self.evals.set(self.evals.get() + n);
    }

    fn best(&self) -> (Array1<f64>, f64) {
        self.point.borrow().clone()
    }

    fn evaluations(&self) -> usize {
        self.evals.get()
    }
}

/// The objective seen through the internal coordinates of the free parameters.
struct InternalProblem<'a> {
    objective: &'a dyn Objective,
    base: Array1<f64>,
    free: Vec<usize>,
    transforms: Vec<BoundTransform>,
    steps: Vec<f64>,
}

impl<'a> InternalProblem<'a> {
    fn new(parameters: &ParameterSet, objective: &'a dyn Objective) -> Self {
        let mut free = Vec::new();
        let mut transforms = Vec::new();
        let mut steps = Vec::new();
        for (i, p) in parameters.iter().enumerate() {
            if p.is_constant() {
                continue;
            }
            free.push(i);
            transforms.push(BoundTransform::for_range(p.min(), p.max()));
            let step = if p.error() > 0.0 {
                p.error()
            } else {
                0.1 * p.value().abs().max(1.0)
            };
            steps.push(step);
        }
        Self {
            objective,
            base: parameters.values(),
            free,
            transforms,
            steps,
        }
    }

    fn start_point(&self, parameters: &ParameterSet) -> Array1<f64> {
        let values = parameters.values();
        self.free
            .iter()
            .zip(self.transforms.iter().zip(self.steps.iter()))
            .map(|(&i, (t, &step))| t.interior_start(values[i], step))
            .collect()
    }

    fn external(&self, u: &Array1<f64>) -> Array1<f64> {
        let mut x = self.base.clone();
        for ((&i, t), &ui) in self.free.iter().zip(self.transforms.iter()).zip(u.iter()) {
            x[i] = t.to_external(ui);
        }
        x
    }

    fn raw_value(&self, u: &Array1<f64>) -> f64 {
        self.objective.value(self.external(u).view())
    }

    fn value(&self, u: &Array1<f64>) -> f64 {
        let f = self.raw_value(u);
        if f.is_finite() {
            f
        } else {
            log::warn!("Non-finite objective value {f} encountered; substituting a large finite penalty");
            NON_FINITE_PENALTY
        }
    }

    fn gradient(&self, u: &Array1<f64>, f0: f64, central: bool) -> Array1<f64> {
        let mut grad = Array1::zeros(u.len());
        let mut probe = u.clone();
        for i in 0..u.len() {
            let ui = u[i];
            if central {
                let h = CENTRAL_STEP * ui.abs().max(1.0);
                probe[i] = ui + h;
                let fp = self.value(&probe);
                probe[i] = ui - h;
                let fm = self.value(&probe);
                grad[i] = (fp - fm) / (2.0 * h);
            } else {
                let h = FORWARD_STEP * ui.abs().max(1.0);
                probe[i] = ui + h;
                grad[i] = (self.value(&probe) - f0) / h;
            }
            probe[i] = ui;
        }
        grad
    }

    fn hessian(&self, u: &Array1<f64>) -> Array2<f64> {
        let n = u.len();
        let f0 = self.value(u);
        let h: Vec<f64> = u.iter().map(|&ui| HESSIAN_STEP * ui.abs().max(1.0)).collect();
        let mut hess = Array2::zeros((n, n));
        let mut probe = u.clone();
        for i in 0..n {
            probe[i] = u[i] + h[i];
            let fp = self.value(&probe);
            probe[i] = u[i] - h[i];
            let fm = self.value(&probe);
            probe[i] = u[i];
            hess[[i, i]] = (fp - 2.0 * f0 + fm) / (h[i] * h[i]);

            for j in (i + 1)..n {
                let mut corner = |si: f64, sj: f64| {
                    probe[i] = u[i] + si * h[i];
                    probe[j] = u[j] + sj * h[j];
                    let f = self.value(&probe);
                    probe[i] = u[i];
                    probe[j] = u[j];
                    f
                };
                let fpp = corner(1.0, 1.0);
                let fpm = corner(1.0, -1.0);
                let fmp = corner(-1.0, 1.0);
                let fmm = corner(-1.0, -1.0);
                let hij = (fpp - fpm - fmp + fmm) / (4.0 * h[i] * h[j]);
                hess[[i, j]] = hij;
                hess[[j, i]] = hij;
            }
        }
        hess
    }

    /// Covariance in external coordinates: `J H^-1 J` with `J = diag(dx/du)`.
    fn covariance(&self, u: &Array1<f64>) -> Option<Array2<f64>> {
        let hess = self.hessian(u);
        let inv = match hess.inv() {
            Ok(inv) => inv,
            Err(e) => {
                log::warn!("Hessian could not be inverted: {e}");
                return None;
            }
        };
        if inv.diag().iter().any(|&d| !(d.is_finite() && d >= 0.0)) {
            log::warn!("Hessian at the minimum is not positive definite; no covariance reported");
            return None;
        }
        let jac: Vec<f64> = self
            .transforms
            .iter()
            .zip(u.iter())
            .map(|(t, &ui)| t.derivative(ui))
            .collect();
        let n = jac.len();
        Some(Array2::from_shape_fn((n, n), |(i, j)| jac[i] * inv[[i, j]] * jac[j]))
    }
}
