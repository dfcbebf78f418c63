//! Which parameters are fixed, and to what, in each pass of a profile fit.

use crate::params::{ParameterError, ParameterSet};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PolicyError {
    #[error(
        "Hypothesized value {hypothesis} for '{poi}' is negative; the one-sided fit range [0, {hypothesis}] would be empty."
    )]
    EmptyPoiRange { poi: String, hypothesis: f64 },

    #[error("Parameter error: {0}")]
    Parameter(#[from] ParameterError),
}

/// The two fits of a profile-likelihood evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    /// POI floating inside its one-sided range (the denominator).
    Free,
    /// POI fixed at the hypothesis (the numerator).
    Conditional,
}

/// A single change to the live parameter set.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    /// Set the nuisance to the global observable's current value and fix it.
    FixToGlobalObservable {
        nuisance: String,
        global_observable: String,
    },
    FixToHypothesis { poi: String, value: f64 },
    FloatInRange { poi: String, min: f64, max: f64 },
}

impl Directive {
    pub fn apply(&self, params: &mut ParameterSet) -> Result<(), ParameterError> {
        match self {
            Self::FixToGlobalObservable {
                nuisance,
                global_observable,
            } => {
                let value = params.value(global_observable)?;
                let p = params.find_mut(nuisance)?;
                p.set_value(value);
                p.set_constant(true);
            }
            Self::FixToHypothesis { poi, value } => {
                let p = params.find_mut(poi)?;
                p.set_value(*value);
                p.set_constant(true);
            }
            Self::FloatInRange { poi, min, max } => {
                let p = params.find_mut(poi)?;
                p.set_range(*min, *max)?;
                p.set_constant(false);
            }
        }
        Ok(())
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FixToGlobalObservable {
                nuisance,
                global_observable,
            } => write!(f, "fix {nuisance} to {global_observable}"),
            Self::FixToHypothesis { poi, value } => write!(f, "fix {poi} = {value}"),
            Self::FloatInRange { poi, min, max } => write!(f, "float {poi} in [{min}, {max}]"),
        }
    }
}

/// Floating range of the POI for a hypothesis: `[0, hypothesis]`, or `[0, +inf)`
/// when the hypothesis is exactly zero.
pub fn poi_fit_range(poi: &str, hypothesis: f64) -> Result<(f64, f64), PolicyError> {
    if !(hypothesis >= 0.0) {
        return Err(PolicyError::EmptyPoiRange {
            poi: poi.to_string(),
            hypothesis,
        });
    }
    if hypothesis == 0.0 {
        Ok((0.0, f64::INFINITY))
    } else {
        Ok((0.0, hypothesis))
    }
}

/// A nuisance parameter pinned to a global observable.
#[derive(Debug, Clone, PartialEq)]
pub struct AncillaryPair {
    pub nuisance: String,
    pub global_observable: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConstraintPolicy {
    poi: String,
    ancillary: Vec<AncillaryPair>,
}

impl ConstraintPolicy {
    pub fn new(poi: impl Into<String>) -> Self {
        Self {
            poi: poi.into(),
            ancillary: Vec::new(),
        }
    }

    pub fn with_ancillary(
        mut self,
        nuisance: impl Into<String>,
        global_observable: impl Into<String>,
    ) -> Self {
        self.ancillary.push(AncillaryPair {
            nuisance: nuisance.into(),
            global_observable: global_observable.into(),
        });
        self
    }

    pub fn poi(&self) -> &str {
        &self.poi
    }

    pub fn ancillary(&self) -> &[AncillaryPair] {
        &self.ancillary
    }

    /// Directives for `pass`, in the order they are applied. Ancillary
    /// substitutions belong to the free pass and stay in effect for the
    /// conditional one.
    pub fn directives(&self, pass: Pass, hypothesis: f64) -> Result<Vec<Directive>, PolicyError> {
        let (min, max) = poi_fit_range(&self.poi, hypothesis)?;
        let directives = match pass {
            Pass::Free => self
                .ancillary
                .iter()
                .map(|pair| Directive::FixToGlobalObservable {
                    nuisance: pair.nuisance.clone(),
                    global_observable: pair.global_observable.clone(),
                })
                .chain(std::iter::once(Directive::FloatInRange {
                    poi: self.poi.clone(),
                    min,
                    max,
                }))
                .collect(),
            Pass::Conditional => vec![Directive::FixToHypothesis {
                poi: self.poi.clone(),
                value: hypothesis,
            }],
        };
        Ok(directives)
    }

    pub fn apply(
        &self,
        pass: Pass,
        hypothesis: f64,
        params: &mut ParameterSet,
    ) -> Result<(), PolicyError> {
        for directive in self.directives(pass, hypothesis)? {
            log::trace!("{pass:?} pass: {directive}");
            directive.apply(params)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Parameter;

    fn params() -> ParameterSet {
        ParameterSet::from_parameters([
            Parameter::new("r", 1.0).with_range(0.0, 20.0).unwrap(),
            Parameter::new("theta", 0.3).with_range(-5.0, 5.0).unwrap(),
            Parameter::new("theta_obs", -0.7).constant(),
        ])
        .unwrap()
    }

    #[test]
    fn zero_hypothesis_opens_the_upper_bound() {
        assert_eq!(poi_fit_range("r", 0.0).unwrap(), (0.0, f64::INFINITY));
        assert_eq!(poi_fit_range("r", 2.5).unwrap(), (0.0, 2.5));
    }

    #[test]
    fn negative_or_nan_hypothesis_is_rejected() {
        assert!(matches!(poi_fit_range("r", -1.0), Err(PolicyError::EmptyPoiRange { .. })));
        assert!(poi_fit_range("r", f64::NAN).is_err());
    }

    #[test]
    fn free_pass_pins_nuisances_then_floats_poi() {
        let policy = ConstraintPolicy::new("r").with_ancillary("theta", "theta_obs");
        let mut set = params();
        set.find_mut("r").unwrap().set_constant(true);
        policy.apply(Pass::Free, 3.0, &mut set).unwrap();

        let theta = set.find("theta").unwrap();
        assert_eq!(theta.value(), -0.7);
        assert!(theta.is_constant());

        let r = set.find("r").unwrap();
        assert!(!r.is_constant());
        assert_eq!((r.min(), r.max()), (0.0, 3.0));
    }

    #[test]
    fn conditional_pass_fixes_poi_at_hypothesis() {
        let policy = ConstraintPolicy::new("r");
        let mut set = params();
        policy.apply(Pass::Free, 0.0, &mut set).unwrap();
        assert!(!set.find("r").unwrap().has_max());
        policy.apply(Pass::Conditional, 0.0, &mut set).unwrap();
        let r = set.find("r").unwrap();
        assert_eq!(r.value(), 0.0);
        assert!(r.is_constant());
    }

    #[test]
    fn unknown_names_surface_as_parameter_errors() {
        let policy = ConstraintPolicy::new("mu");
        let err = policy.apply(Pass::Free, 1.0, &mut params()).unwrap_err();
        assert_eq!(err, PolicyError::Parameter(ParameterError::Missing("mu".to_string())));
    }
}
