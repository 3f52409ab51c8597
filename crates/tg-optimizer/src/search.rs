//! Search space definitions and parameter samplers.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use tg_types::{ParamValue, TgError, TgResult};

/// A single parameter dimension in the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    /// Hyperparameter name (e.g. "dropout_p").
    pub name: String,
    /// The kind of search range.
    pub kind: ParameterKind,
}

/// Describes how a parameter is sampled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterKind {
    /// Continuous uniform range [low, high].
    FloatRange { low: f64, high: f64 },
    /// Integer range [low, high] inclusive.
    IntRange { low: i64, high: i64 },
    /// Log-uniform range (sampled in log-space then exponentiated).
    LogUniform { low: f64, high: f64 },
    /// Categorical choices.
    Choice { values: Vec<ParamValue> },
}

impl ParameterKind {
    pub fn validate(&self, name: &str) -> TgResult<()> {
        let invalid = |reason: &str| {
            Err(TgError::Validation(format!(
                "invalid distribution for '{name}': {reason}"
            )))
        };
        match self {
            Self::FloatRange { low, high } | Self::LogUniform { low, high }
                if !(low.is_finite() && high.is_finite()) =>
            {
                invalid("bounds must be finite")
            }
            Self::FloatRange { low, high } if !(low <= high) => invalid("low > high"),
            Self::IntRange { low, high } if low > high => invalid("low > high"),
            Self::LogUniform { low, high } if !(*low > 0.0 && low <= high) => {
                invalid("bounds must be positive with low <= high")
            }
            Self::Choice { values } if values.is_empty() => invalid("no choices"),
            _ => Ok(()),
        }
    }

    pub fn contains(&self, value: &ParamValue) -> bool {
        match (self, value) {
            (Self::FloatRange { low, high } | Self::LogUniform { low, high }, value) => value
                .as_f64()
                .map_or(false, |v| v >= *low && v <= *high),
            (Self::IntRange { low, high }, ParamValue::Int(v)) => v >= low && v <= high,
            (Self::Choice { values }, value) => values.contains(value),
            _ => false,
        }
    }
}

/// The parameters suggested during one trial, in suggestion order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SearchSpace {
    pub parameters: Vec<ParameterDef>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_float(self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.with(name, ParameterKind::FloatRange { low, high })
    }

    pub fn add_int(self, name: impl Into<String>, low: i64, high: i64) -> Self {
        self.with(name, ParameterKind::IntRange { low, high })
    }

    pub fn add_log_uniform(self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.with(name, ParameterKind::LogUniform { low, high })
    }

    pub fn add_choice(self, name: impl Into<String>, values: Vec<ParamValue>) -> Self {
        self.with(name, ParameterKind::Choice { values })
    }

    fn with(mut self, name: impl Into<String>, kind: ParameterKind) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind,
        });
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParameterKind> {
        self.parameters
            .iter()
            .find(|p| p.name == name)
            .map(|p| &p.kind)
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }
}

/// Draws a value for one parameter of one trial.
pub trait Sampler: Send + std::fmt::Debug {
    fn sample(&mut self, name: &str, kind: &ParameterKind) -> ParamValue;

    /// Human-readable sampler name.
    fn name(&self) -> &str;
}

/// Independent random sampling, reproducible from a seed.
#[derive(Debug, Clone)]
pub struct RandomSampler {
    rng: ChaCha8Rng,
}

impl RandomSampler {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }
}

impl Sampler for RandomSampler {
    fn sample(&mut self, _name: &str, kind: &ParameterKind) -> ParamValue {
        match kind {
            ParameterKind::FloatRange { low, high } => {
                ParamValue::Float(self.rng.gen_range(*low..=*high))
            }
            ParameterKind::IntRange { low, high } => {
                ParamValue::Int(self.rng.gen_range(*low..=*high))
            }
            ParameterKind::LogUniform { low, high } => {
                let log_val: f64 = self.rng.gen_range(low.ln()..=high.ln());
                ParamValue::Float(log_val.exp().clamp(*low, *high))
            }
            ParameterKind::Choice { values } => {
                let idx = self.rng.gen_range(0..values.len());
                values[idx].clone()
            }
        }
    }

    fn name(&self) -> &str {
        "random"
    }
}
