//! Named fit parameters and immutable snapshots of their state.
//!
//! A [`ParameterSet`] is the live, mutable state of a model: every parameter has a
//! value, an error (used as the initial step and filled in with the fitted
//! uncertainty), a range that may be open on either side, and a constant flag.
//! A [`Snapshot`] is a frozen copy of the same information. Evaluation code
//! overlays snapshots onto a live set by name and rolls the set back afterwards.

use ahash::AHashMap;
use ndarray::{Array1, ArrayView1};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParameterError {
    #[error("Parameter '{0}' is not present in the collection.")]
    Missing(String),

    #[error("Parameter '{0}' appears more than once in the collection.")]
    Duplicate(String),

    #[error("Parameter '{name}' would have an empty range [{min}, {max}].")]
    EmptyRange { name: String, min: f64, max: f64 },

    #[error("Expected {expected} parameter values but received {found}.")]
    LengthMismatch { expected: usize, found: usize },
}

/// A single named parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    name: String,
    value: f64,
    error: f64,
    min: f64,
    max: f64,
    constant: bool,
}

impl Parameter {
    /// An unbounded, floating parameter.
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
            error: 0.0,
            min: f64::NEG_INFINITY,
            max: f64::INFINITY,
            constant: false,
        }
    }

    /// Sets the range and clamps the current value into it.
    pub fn with_range(mut self, min: f64, max: f64) -> Result<Self, ParameterError> {
        self.set_range(min, max)?;
        Ok(self)
    }

    pub fn with_error(mut self, error: f64) -> Self {
        self.error = error.abs();
        self
    }

    pub fn constant(mut self) -> Self {
        self.constant = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn error(&self) -> f64 {
        self.error
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn has_min(&self) -> bool {
        self.min.is_finite()
    }

    pub fn has_max(&self) -> bool {
        self.max.is_finite()
    }

    pub fn is_constant(&self) -> bool {
        self.constant
    }

    pub fn in_range(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    /// Sets the value, clipped to the current range.
    pub fn set_value(&mut self, value: f64) {
        let clipped = value.clamp(self.min, self.max);
        if clipped != value {
            log::debug!(
                "Value {} for '{}' clipped to range [{}, {}]",
                value,
                self.name,
                self.min,
                self.max
            );
        }
        self.value = clipped;
    }

    pub fn set_error(&mut self, error: f64) {
        self.error = error.abs();
    }

    pub fn set_constant(&mut self, constant: bool) {
        self.constant = constant;
    }

    pub fn set_min(&mut self, min: f64) -> Result<(), ParameterError> {
        self.set_range(min, self.max)
    }

    pub fn set_max(&mut self, max: f64) -> Result<(), ParameterError> {
        self.set_range(self.min, max)
    }

    /// Opens the range upwards.
    pub fn remove_max(&mut self) {
        self.max = f64::INFINITY;
    }

    /// Opens the range downwards.
    pub fn remove_min(&mut self) {
        self.min = f64::NEG_INFINITY;
    }

    pub fn set_range(&mut self, min: f64, max: f64) -> Result<(), ParameterError> {
        if min.is_nan() || max.is_nan() || min > max {
            return Err(ParameterError::EmptyRange {
                name: self.name.clone(),
                min,
                max,
            });
        }
        self.min = min;
        self.max = max;
        self.value = self.value.clamp(min, max);
        Ok(())
    }

    fn copy_state_from(&mut self, other: &Parameter) {
        self.value = other.value;
        self.error = other.error;
        self.min = other.min;
        self.max = other.max;
        self.constant = other.constant;
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<16} = {:>12.6} +/- {:<10.4e} [{}, {}]",
            self.name, self.value, self.error, self.min, self.max
        )?;
        if self.constant {
            f.write_str(" C")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Entries {
    items: Vec<Parameter>,
    index: AHashMap<String, usize>,
}

impl Entries {
    fn push(&mut self, parameter: Parameter) -> Result<(), ParameterError> {
        if self.index.contains_key(parameter.name()) {
            return Err(ParameterError::Duplicate(parameter.name().to_string()));
        }
        self.index
            .insert(parameter.name().to_string(), self.items.len());
        self.items.push(parameter);
        Ok(())
    }

    fn get(&self, name: &str) -> Option<&Parameter> {
        self.index.get(name).map(|&i| &self.items[i])
    }
}

/// The live, ordered parameter collection of a model.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSet {
    entries: Entries,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parameters<I>(parameters: I) -> Result<Self, ParameterError>
    where
        I: IntoIterator<Item = Parameter>,
    {
        let mut set = Self::new();
        for p in parameters {
            set.insert(p)?;
        }
        Ok(set)
    }

    pub fn insert(&mut self, parameter: Parameter) -> Result<(), ParameterError> {
        self.entries.push(parameter)
    }

    pub fn len(&self) -> usize {
        self.entries.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.entries.items.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.items.iter().map(Parameter::name)
    }

    pub fn first(&self) -> Option<&Parameter> {
        self.entries.items.first()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.index.contains_key(name)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.entries.index.get(name).copied()
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.entries.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Parameter> {
        let i = *self.entries.index.get(name)?;
        Some(&mut self.entries.items[i])
    }

    pub fn find(&self, name: &str) -> Result<&Parameter, ParameterError> {
        self.get(name)
            .ok_or_else(|| ParameterError::Missing(name.to_string()))
    }

    pub fn find_mut(&mut self, name: &str) -> Result<&mut Parameter, ParameterError> {
        self.get_mut(name)
            .ok_or_else(|| ParameterError::Missing(name.to_string()))
    }

    pub fn value(&self, name: &str) -> Result<f64, ParameterError> {
        self.find(name).map(Parameter::value)
    }

    /// Current values in collection order.
    pub fn values(&self) -> Array1<f64> {
        self.entries.items.iter().map(Parameter::value).collect()
    }

    /// Writes a full value vector back, clipping each entry to its range.
    pub fn set_values(&mut self, values: ArrayView1<f64>) -> Result<(), ParameterError> {
        if values.len() != self.len() {
            return Err(ParameterError::LengthMismatch {
                expected: self.len(),
                found: values.len(),
            });
        }
        for (p, &v) in self.entries.items.iter_mut().zip(values.iter()) {
            p.set_value(v);
        }
        Ok(())
    }

    pub fn free_count(&self) -> usize {
        self.entries.items.iter().filter(|p| !p.constant).count()
    }

    /// Copies value, error, range and constancy from every snapshot entry whose
    /// name is also in this set. Entries unknown to this set are ignored.
    pub fn assign(&mut self, source: &Snapshot) {
        for theirs in source.iter() {
            if let Some(mine) = self.get_mut(theirs.name()) {
                mine.copy_state_from(theirs);
            }
        }
    }

    /// Rolls the set back to a snapshot taken from it.
    pub fn restore(&mut self, snapshot: &Snapshot) {
        self.assign(snapshot);
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            entries: self.entries.clone(),
        }
    }

    /// Snapshot restricted to the given names, in the given order.
    pub fn snapshot_of<'a, I>(&self, names: I) -> Result<Snapshot, ParameterError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut entries = Entries::default();
        for name in names {
            entries.push(self.find(name)?.clone())?;
        }
        Ok(Snapshot { entries })
    }
}

impl fmt::Display for ParameterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for p in self.iter() {
            writeln!(f, "  {p}")?;
        }
        Ok(())
    }
}

impl From<ParameterSet> for Snapshot {
    fn from(set: ParameterSet) -> Self {
        Snapshot {
            entries: set.entries,
        }
    }
}

/// A frozen copy of parameter state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    entries: Entries,
}

impl Snapshot {
    pub fn from_parameters<I>(parameters: I) -> Result<Self, ParameterError>
    where
        I: IntoIterator<Item = Parameter>,
    {
        ParameterSet::from_parameters(parameters).map(Snapshot::from)
    }

    pub fn len(&self) -> usize {
        self.entries.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.entries.items.iter()
    }

    pub fn first(&self) -> Option<&Parameter> {
        self.entries.items.first()
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.index.contains_key(name)
    }

    /// Copy of this snapshot with `name` marked floating.
    pub fn with_floating(&self, name: &str) -> Result<Snapshot, ParameterError> {
        let mut entries = self.entries.clone();
        let i = *entries
            .index
            .get(name)
            .ok_or_else(|| ParameterError::Missing(name.to_string()))?;
        entries.items[i].constant = false;
        Ok(Snapshot { entries })
    }

    /// Copy of this snapshot with the value of `name` replaced. The value is
    /// stored as given, without clipping to the recorded range.
    pub fn with_value(&self, name: &str, value: f64) -> Result<Snapshot, ParameterError> {
        let mut entries = self.entries.clone();
        let i = *entries
            .index
            .get(name)
            .ok_or_else(|| ParameterError::Missing(name.to_string()))?;
        entries.items[i].value = value;
        Ok(Snapshot { entries })
    }

    /// Copy of this snapshot extended with the entries of `other` that it does
    /// not already hold.
    pub fn merged_with(&self, other: &Snapshot) -> Snapshot {
        let mut entries = self.entries.clone();
        for p in other.iter() {
            if !entries.index.contains_key(p.name()) {
                entries.index.insert(p.name().to_string(), entries.items.len());
                entries.items.push(p.clone());
            }
        }
        Snapshot { entries }
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for p in self.iter() {
            writeln!(f, "  {p}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_set() -> ParameterSet {
        ParameterSet::from_parameters([
            Parameter::new("mu", 1.0).with_range(-5.0, 5.0).unwrap(),
            Parameter::new("theta", 0.0).with_error(1.0),
            Parameter::new("theta_obs", 0.0).constant(),
        ])
        .unwrap()
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let result = ParameterSet::from_parameters([Parameter::new("a", 1.0), Parameter::new("a", 2.0)]);
        assert_eq!(result, Err(ParameterError::Duplicate("a".to_string())));
    }

    #[test]
    fn set_value_clips_to_range() {
        let mut p = Parameter::new("r", 0.5).with_range(0.0, 1.0).unwrap();
        p.set_value(3.0);
        assert_eq!(p.value(), 1.0);
        p.remove_max();
        p.set_value(3.0);
        assert_eq!(p.value(), 3.0);
        assert!(!p.has_max());
    }

    #[test]
    fn inverted_range_is_an_error() {
        let mut p = Parameter::new("r", 0.5);
        assert!(matches!(p.set_range(1.0, 0.0), Err(ParameterError::EmptyRange { .. })));
    }

    #[test]
    fn restore_undoes_value_range_and_constancy() {
        let mut set = sample_set();
        let before = set.snapshot();

        {
            let mu = set.find_mut("mu").unwrap();
            mu.set_range(0.0, 2.0).unwrap();
            mu.set_value(1.7);
            mu.set_constant(true);
        }
        set.find_mut("theta").unwrap().set_error(0.3);

        assert_ne!(set.snapshot(), before);
        set.restore(&before);
        assert_eq!(set.snapshot(), before);
    }

    #[test]
    fn later_assignments_win_on_shared_names() {
        let mut set = sample_set();
        let first = Snapshot::from_parameters([Parameter::new("mu", 2.0), Parameter::new("theta", 0.4)]).unwrap();
        let second = Snapshot::from_parameters([Parameter::new("mu", 3.0).constant()]).unwrap();

        set.assign(&first);
        set.assign(&second);

        assert_eq!(set.value("mu").unwrap(), 3.0);
        assert!(set.find("mu").unwrap().is_constant());
        assert_eq!(set.value("theta").unwrap(), 0.4);
    }

    #[test]
    fn assign_ignores_unknown_names() {
        let mut set = sample_set();
        let foreign = Snapshot::from_parameters([Parameter::new("unrelated", 9.0)]).unwrap();
        let before = set.snapshot();
        set.assign(&foreign);
        assert_eq!(set.snapshot(), before);
    }

    #[test]
    fn snapshot_is_independent_of_later_mutation() {
        let mut set = sample_set();
        let snap = set.snapshot();
        set.find_mut("mu").unwrap().set_value(4.0);
        assert_eq!(snap.get("mu").unwrap().value(), 1.0);
    }

    #[test]
    fn with_floating_clears_constant_flag() {
        let snap = Snapshot::from_parameters([Parameter::new("r", 1.0).constant()]).unwrap();
        let floating = snap.with_floating("r").unwrap();
        assert!(!floating.get("r").unwrap().is_constant());
        assert!(snap.get("r").unwrap().is_constant());
        assert!(snap.with_floating("missing").is_err());
    }

    #[test]
    fn with_value_does_not_clip() {
        let snap = Snapshot::from_parameters([Parameter::new("r", 1.0).with_range(0.0, 2.0).unwrap()]).unwrap();
        let moved = snap.with_value("r", 7.5).unwrap();
        assert_eq!(moved.get("r").unwrap().value(), 7.5);
        assert_eq!(moved.get("r").unwrap().max(), 2.0);
    }

    #[test]
    fn merged_with_keeps_existing_entries() {
        let a = Snapshot::from_parameters([Parameter::new("r", 1.0)]).unwrap();
        let b = Snapshot::from_parameters([Parameter::new("r", 5.0), Parameter::new("theta", 0.2)]).unwrap();
        let merged = a.merged_with(&b);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged.get("r").unwrap().value(), 1.0);
        assert_eq!(merged.first().unwrap().name(), "r");
    }

    #[test]
    fn set_values_checks_length() {
        let mut set = sample_set();
        let err = set.set_values(Array1::from(vec![1.0]).view()).unwrap_err();
        assert_eq!(err, ParameterError::LengthMismatch { expected: 3, found: 1 });
        set.set_values(Array1::from(vec![9.0, 0.5, 0.0]).view()).unwrap();
        assert_eq!(set.value("mu").unwrap(), 5.0);
    }
}
