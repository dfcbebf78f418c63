//! # Analysis Configuration
//!
//! A TOML file describes one analysis: the model, the observed data, the test
//! statistic and, optionally, a toy ensemble. Everything the command-line
//! driver does is built from an [`AnalysisConfig`].
//!
//! ```toml
//! verbosity = 1
//!
//! [model]
//! kind = "counting"
//! signal = [5.0, 10.0]
//! background = [50.0, 20.0]
//! kappa = 0.1
//!
//! [data]
//! values = [58.0, 27.0]
//!
//! [statistic]
//! kind = "profile"
//! poi = "r"
//! hypothesis = 1.0
//! nuisances = ["theta"]
//! global_observable_params = ["theta"]
//! global_observables = ["theta_obs"]
//! ```

use crate::minimizer::{self, DEFAULT_MINIMIZER_ALGORITHM, DEFAULT_MINIMIZER_TYPE};
use crate::model::{CountingModel, CountingNames, Dataset, GaussianMeanModel, ModelError, ProbabilityModel};
use crate::params::{Parameter, ParameterError, ParameterSet, Snapshot};
use crate::teststat::{
    ProfiledLikelihoodRatioTestStat, ProfiledLikelihoodTestStat, TestStatError, TestStatistic,
};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("Failed to serialize configuration to TOML: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),

    #[error("Failed to read CSV data: {0}")]
    Csv(#[from] csv::Error),

    #[error("Column '{column}' was not found in '{}'.", .path.display())]
    ColumnNotFound { path: PathBuf, column: String },

    #[error(
        "Value '{value}' in column '{column}' of '{}' (row {row}) is not a number.",
        .path.display()
    )]
    BadValue {
        path: PathBuf,
        column: String,
        row: usize,
        value: String,
    },

    #[error("The [data] section needs exactly one of 'values' or 'csv'.")]
    AmbiguousData,

    #[error("{0}")]
    Unsupported(String),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Parameter error: {0}")]
    Parameter(#[from] ParameterError),

    #[error("Test statistic error: {0}")]
    Statistic(#[from] TestStatError),
}

fn default_verbosity() -> i32 {
    0
}

fn default_model_name() -> String {
    "model".to_string()
}

fn default_data_name() -> String {
    "observed".to_string()
}

fn default_toy_entries() -> usize {
    100
}

fn default_toys() -> usize {
    1000
}

fn default_seed() -> u64 {
    12345
}

/// A parameter as written in the configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    pub value: f64,
    #[serde(default)]
    pub error: f64,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub constant: bool,
}

impl ParameterSpec {
    pub fn build(&self) -> Result<Parameter, ParameterError> {
        let mut p = Parameter::new(self.name.clone(), self.value)
            .with_range(
                self.min.unwrap_or(f64::NEG_INFINITY),
                self.max.unwrap_or(f64::INFINITY),
            )?
            .with_error(self.error);
        p.set_constant(self.constant);
        Ok(p)
    }
}

fn build_set(specs: &[ParameterSpec]) -> Result<ParameterSet, ParameterError> {
    ParameterSet::from_parameters(specs.iter().map(ParameterSpec::build).collect::<Result<Vec<_>, _>>()?)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelSpec {
    Gaussian {
        #[serde(default = "default_model_name")]
        name: String,
        observable: String,
        mean: ParameterSpec,
        sigma: ParameterSpec,
        #[serde(default = "default_toy_entries")]
        toy_entries: usize,
    },
    Counting {
        #[serde(default = "default_model_name")]
        name: String,
        signal: Vec<f64>,
        background: Vec<f64>,
        kappa: f64,
        #[serde(default)]
        names: CountingNames,
        /// Upper end of the POI range; the lower end is always 0.
        #[serde(default)]
        poi_max: Option<f64>,
    },
}

impl ModelSpec {
    /// A fresh model instance. Called once per worker for parallel work.
    pub fn build(&self) -> Result<Box<dyn ProbabilityModel>, ConfigError> {
        match self {
            Self::Gaussian {
                name,
                observable,
                mean,
                sigma,
                toy_entries,
            } => {
                let model =
                    GaussianMeanModel::new(name.clone(), observable.clone(), mean.build()?, sigma.build()?)?
                        .with_toy_entries(*toy_entries);
                Ok(Box::new(model))
            }
            Self::Counting {
                name,
                signal,
                background,
                kappa,
                names,
                poi_max,
            } => {
                let mut model = CountingModel::new(
                    name.clone(),
                    signal.clone(),
                    background.clone(),
                    *kappa,
                    names.clone(),
                )?;
                if let Some(max) = poi_max {
                    model.parameters_mut().find_mut(&names.poi)?.set_max(*max)?;
                }
                Ok(Box::new(model))
            }
        }
    }

    pub fn observable(&self) -> &str {
        match self {
            Self::Gaussian { observable, .. } => observable.as_str(),
            Self::Counting { .. } => CountingModel::OBSERVABLE,
        }
    }
}

/// Observed data: inline values for the model's observable, or a CSV file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSpec {
    #[serde(default = "default_data_name")]
    pub name: String,
    #[serde(default)]
    pub values: Option<Vec<f64>>,
    #[serde(default)]
    pub weights: Option<Vec<f64>>,
    /// Relative paths are resolved against the configuration file's directory.
    #[serde(default)]
    pub csv: Option<PathBuf>,
    /// CSV column holding the observable; defaults to the observable's name.
    #[serde(default)]
    pub column: Option<String>,
    #[serde(default)]
    pub weight_column: Option<String>,
}

impl DataSpec {
    pub fn load(&self, observable: &str, base_dir: &Path) -> Result<Dataset, ConfigError> {
        match (&self.values, &self.csv) {
            (Some(values), None) => {
                let data = Dataset::from_column(self.name.clone(), observable, values.clone())?;
                match &self.weights {
                    Some(w) => Ok(data.with_weights(Array1::from(w.clone()))?),
                    None => Ok(data),
                }
            }
            (None, Some(path)) => {
                let path = if path.is_absolute() {
                    path.clone()
                } else {
                    base_dir.join(path)
                };
                self.load_csv(&path, observable)
            }
            _ => Err(ConfigError::AmbiguousData),
        }
    }

    fn load_csv(&self, path: &Path, observable: &str) -> Result<Dataset, ConfigError> {
        let mut reader = csv::Reader::from_path(path)?;
        let headers = reader.headers()?.clone();
        let find = |column: &str| {
            headers
                .iter()
                .position(|h| h.trim() == column)
                .ok_or_else(|| ConfigError::ColumnNotFound {
                    path: path.to_path_buf(),
                    column: column.to_string(),
                })
        };
        let column = self.column.as_deref().unwrap_or(observable);
        let value_idx = find(column)?;
        let weight_idx = self.weight_column.as_deref().map(find).transpose()?;

        let parse = |record: &csv::StringRecord, idx: usize, name: &str, row: usize| {
            let raw = record.get(idx).unwrap_or("").trim();
            raw.parse::<f64>().map_err(|_| ConfigError::BadValue {
                path: path.to_path_buf(),
                column: name.to_string(),
                row,
                value: raw.to_string(),
            })
        };

        let mut values = Vec::new();
        let mut weights = Vec::new();
        for (row, record) in reader.records().enumerate() {
            let record = record?;
            values.push(parse(&record, value_idx, column, row + 1)?);
            if let (Some(idx), Some(name)) = (weight_idx, self.weight_column.as_deref()) {
                weights.push(parse(&record, idx, name, row + 1)?);
            }
        }
        log::info!("Read {} entries from {}", values.len(), path.display());

        let n = values.len();
        let entries = Array2::from_shape_vec((n, 1), values)
            .map_err(|e| ConfigError::Unsupported(format!("could not shape CSV data: {e}")))?;
        let data = Dataset::new(self.name.clone(), vec![observable.to_string()], entries)?;
        if weight_idx.is_some() {
            Ok(data.with_weights(Array1::from(weights))?)
        } else {
            Ok(data)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatisticSpec {
    /// One-sided profile likelihood for a single model.
    Profile {
        poi: String,
        hypothesis: f64,
        #[serde(default)]
        nuisances: Vec<String>,
        #[serde(default)]
        global_observable_params: Vec<String>,
        #[serde(default)]
        global_observables: Vec<String>,
    },
    /// Likelihood ratio of two configurations of the model.
    Ratio {
        null: Vec<ParameterSpec>,
        alt: Vec<ParameterSpec>,
        #[serde(default)]
        nuisances: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinimizerConfig {
    #[serde(rename = "type")]
    pub minimizer_type: String,
    pub algorithm: String,
}

impl Default for MinimizerConfig {
    fn default() -> Self {
        Self {
            minimizer_type: DEFAULT_MINIMIZER_TYPE.to_string(),
            algorithm: DEFAULT_MINIMIZER_ALGORITHM.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToysSpec {
    #[serde(default = "default_toys")]
    pub toys: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Generation values; parameters not listed keep the model's values.
    #[serde(default)]
    pub generate: Vec<ParameterSpec>,
}

impl Default for ToysSpec {
    fn default() -> Self {
        Self {
            toys: default_toys(),
            seed: default_seed(),
            generate: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default = "default_verbosity")]
    pub verbosity: i32,
    #[serde(default)]
    pub minimizer: MinimizerConfig,
    pub model: ModelSpec,
    pub data: DataSpec,
    pub statistic: StatisticSpec,
    #[serde(default)]
    pub toys: Option<ToysSpec>,
    #[serde(skip)]
    base_dir: PathBuf,
}

impl AnalysisConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&text)?;
        config.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        log::debug!("Loaded analysis configuration from {}", path.display());
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Registers the configured minimizer as the process-wide default.
    pub fn apply_minimizer_defaults(&self) {
        minimizer::set_default_minimizer(&self.minimizer.minimizer_type, &self.minimizer.algorithm);
    }

    pub fn load_data(&self) -> Result<Dataset, ConfigError> {
        self.data.load(self.model.observable(), &self.base_dir)
    }

    /// The configured statistic on fresh model instances. `hypothesis`
    /// overrides the configured POI value of a profile statistic.
    pub fn build_statistic(&self, hypothesis: Option<f64>) -> Result<Box<dyn TestStatistic>, ConfigError> {
        let observable = self.model.observable();
        match &self.statistic {
            StatisticSpec::Profile {
                poi,
                hypothesis: configured,
                nuisances,
                global_observable_params,
                global_observables,
            } => {
                let model = self.model.build()?;
                let params = ParameterSet::from_parameters([model.parameters().find(poi)?.clone()])?;
                let nuisances: Vec<&str> = nuisances.iter().map(String::as_str).collect();
                let gobs_params: Vec<&str> = global_observable_params.iter().map(String::as_str).collect();
                let gobs: Vec<&str> = global_observables.iter().map(String::as_str).collect();
                let mut stat = ProfiledLikelihoodTestStat::new(
                    &[observable],
                    model,
                    Some(nuisances.as_slice()),
                    &params,
                    &gobs_params,
                    &gobs,
                    self.verbosity,
                )?;
                stat.set_hypothesis(hypothesis.unwrap_or(*configured))?;
                Ok(Box::new(stat))
            }
            StatisticSpec::Ratio {
                null,
                alt,
                nuisances,
            } => {
                if hypothesis.is_some() {
                    return Err(ConfigError::Unsupported(
                        "hypothesis scans need a 'profile' statistic".to_string(),
                    ));
                }
                let nuisances: Vec<&str> = nuisances.iter().map(String::as_str).collect();
                let stat = ProfiledLikelihoodRatioTestStat::new(
                    &[observable],
                    self.model.build()?,
                    self.model.build()?,
                    Some(nuisances.as_slice()),
                    &build_set(null)?,
                    &build_set(alt)?,
                    self.verbosity,
                )?;
                Ok(Box::new(stat))
            }
        }
    }

    /// Generation configuration for toys; it is assigned over the generator
    /// model's own values. A profile statistic's POI is generated at the
    /// hypothesis unless listed explicitly.
    pub fn toy_generation(&self, hypothesis: Option<f64>) -> Result<Snapshot, ConfigError> {
        let specs = self
            .toys
            .as_ref()
            .map(|t| t.generate.as_slice())
            .unwrap_or_default();
        let mut set = build_set(specs)?;
        if let StatisticSpec::Profile {
            poi,
            hypothesis: configured,
            ..
        } = &self.statistic
        {
            if !set.contains(poi) {
                set.insert(Parameter::new(poi.clone(), hypothesis.unwrap_or(*configured)))?;
            }
        }
        Ok(set.snapshot())
    }
}
