use crate::mutator::Mutator;
use crate::recombinator::Recombinator;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: Box<toml::de::Error>,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Campaign identity and inputs.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CampaignSettings {
    /// Run directory; created by `init`, owned by the engine afterwards.
    pub dir: PathBuf,
    /// Directory (or single file) of initial seed inputs.
    pub seeds: PathBuf,
    /// Name of the format plug-in to parse seeds with, e.g. "png".
    pub format: String,
}

/// Knobs of the evolutionary engine. Every field has a sensible default;
/// an empty `[engine]` table is a valid configuration.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct EngineSettings {
    /// Corpus size cap (`N`).
    #[serde(default = "default_population_cap")]
    pub population_cap: usize,
    /// Trials per generation (`M`).
    #[serde(default = "default_trials_per_generation")]
    pub trials_per_generation: u64,
    /// Probability of picking the recombinator family for a trial.
    #[serde(default = "default_p_recomb")]
    pub p_recomb: f64,
    /// Multiplicative weight learning rate (`α`).
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    /// Lower bound an operator weight can decay to.
    #[serde(default = "default_min_weight")]
    pub min_weight: f64,
    /// Tournament size for parent selection.
    #[serde(default = "default_k_tournament")]
    pub k_tournament: usize,
    /// Per-trial wall clock budget.
    #[serde(default = "default_trial_timeout_ms")]
    pub trial_timeout_ms: u64,
    /// Extra time the tracer gets to flush after a timeout signal.
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
    /// Fraction of a payload a single mutator application may touch.
    #[serde(default = "default_mutation_budget")]
    pub mutation_budget: f64,
    /// Consecutive no-op variations tolerated before the trial is skipped.
    #[serde(default = "default_noop_retries")]
    pub noop_retries: u32,
    /// Consecutive tracer errors tolerated before the campaign aborts.
    #[serde(default = "default_failure_budget")]
    pub failure_budget: u32,
    /// Stop after this many generations (run forever when absent).
    #[serde(default)]
    pub generation_cap: Option<u64>,
    /// PRNG seed; fixed seeds make runs reproducible.
    #[serde(default)]
    pub seed: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            population_cap: default_population_cap(),
            trials_per_generation: default_trials_per_generation(),
            p_recomb: default_p_recomb(),
            alpha: default_alpha(),
            min_weight: default_min_weight(),
            k_tournament: default_k_tournament(),
            trial_timeout_ms: default_trial_timeout_ms(),
            grace_ms: default_grace_ms(),
            mutation_budget: default_mutation_budget(),
            noop_retries: default_noop_retries(),
            failure_budget: default_failure_budget(),
            generation_cap: None,
            seed: 0,
        }
    }
}

fn default_population_cap() -> usize {
    64
}
fn default_trials_per_generation() -> u64 {
    100
}
fn default_p_recomb() -> f64 {
    0.5
}
fn default_alpha() -> f64 {
    0.1
}
fn default_min_weight() -> f64 {
    0.01
}
fn default_k_tournament() -> usize {
    3
}
fn default_trial_timeout_ms() -> u64 {
    10_000
}
fn default_grace_ms() -> u64 {
    500
}
fn default_mutation_budget() -> f64 {
    0.05
}
fn default_noop_retries() -> u32 {
    8
}
fn default_failure_budget() -> u32 {
    10
}

/// How to launch the target.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TargetSettings {
    /// Target argv; `@@` is replaced by the input path.
    pub command: Vec<String>,
}

/// Optional initial operator weights, by operator name.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct WeightSettings {
    #[serde(default)]
    pub mutators: BTreeMap<String, f64>,
    #[serde(default)]
    pub recombinators: BTreeMap<String, f64>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ChoronzonConfig {
    pub campaign: CampaignSettings,
    #[serde(default)]
    pub engine: EngineSettings,
    pub target: TargetSettings,
    #[serde(default)]
    pub weights: WeightSettings,
}

impl ChoronzonConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: ChoronzonConfig =
            toml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source: Box::new(source),
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let engine = &self.engine;
        if self.target.command.is_empty() {
            return Err(ConfigError::Invalid(
                "target.command must name an executable".into(),
            ));
        }
        if engine.population_cap == 0 {
            return Err(ConfigError::Invalid("population-cap must be > 0".into()));
        }
        if engine.k_tournament == 0 {
            return Err(ConfigError::Invalid("k-tournament must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&engine.p_recomb) {
            return Err(ConfigError::Invalid(format!(
                "p-recomb must lie in [0, 1], got {}",
                engine.p_recomb
            )));
        }
        if !(0.0..1.0).contains(&engine.alpha) {
            return Err(ConfigError::Invalid(format!(
                "alpha must lie in [0, 1), got {}",
                engine.alpha
            )));
        }
        if !(0.0..=1.0).contains(&engine.mutation_budget) || engine.mutation_budget == 0.0 {
            return Err(ConfigError::Invalid(format!(
                "mutation-budget must lie in (0, 1], got {}",
                engine.mutation_budget
            )));
        }
        let known_mutators: Vec<&str> = Mutator::ALL.iter().map(|m| m.name()).collect();
        for name in self.weights.mutators.keys() {
            if !known_mutators.contains(&name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "unknown mutator in weights: {name}"
                )));
            }
        }
        let known_recombinators: Vec<&str> =
            Recombinator::ALL.iter().map(|r| r.name()).collect();
        for name in self.weights.recombinators.keys() {
            if !known_recombinators.contains(&name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "unknown recombinator in weights: {name}"
                )));
            }
        }
        Ok(())
    }
}
