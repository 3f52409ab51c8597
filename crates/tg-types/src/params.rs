use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::Path;

use crate::errors::{TgError, TgResult};

/// A scalar hyperparameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Bool(v) => serde_json::Value::Bool(*v),
            Self::Int(v) => serde_json::Value::from(*v),
            Self::Float(v) => serde_json::Value::from(*v),
            Self::Text(v) => serde_json::Value::String(v.clone()),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v}"),
        }
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

/// Training and search hyperparameters.
///
/// Every recognized key is a field; unknown keys in a params file are
/// rejected. `threshold` is derived by training and is absent until a run
/// or a search has produced one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Params {
    pub seed: u64,
    pub cuda: bool,
    pub shuffle: bool,
    /// Number of samples to use; `None` uses the full dataset
    pub subset: Option<u64>,
    pub min_freq: u32,
    pub lower: bool,
    pub char_level: bool,
    pub max_filter_size: u32,
    pub batch_size: u32,
    pub embedding_dim: u32,
    pub num_filters: u32,
    pub hidden_dim: u32,
    pub dropout_p: f64,
    pub lr: f64,
    pub num_epochs: u32,
    pub patience: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            seed: 1234,
            cuda: false,
            shuffle: true,
            subset: None,
            min_freq: 75,
            lower: true,
            char_level: true,
            max_filter_size: 10,
            batch_size: 128,
            embedding_dim: 128,
            num_filters: 128,
            hidden_dim: 128,
            dropout_p: 0.5,
            lr: 2e-4,
            num_epochs: 100,
            patience: 10,
            threshold: None,
        }
    }
}

impl Params {
    /// Read a params file
    pub fn load<P: AsRef<Path>>(path: P) -> TgResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw).map_err(|e| match e {
            TgError::Parse { message, .. } => TgError::parse(path.display(), message),
            other => other,
        })
    }

    pub fn from_json_str(raw: &str) -> TgResult<Self> {
        serde_json::from_str(raw).map_err(|e| TgError::parse("<params>", e))
    }

    /// Write the params file, replacing any existing one through a sibling
    /// temp file so readers never see a truncated file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> TgResult<()> {
        let path = path.as_ref();
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;

        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        file.write_all(serde_json::to_string_pretty(self)?.as_bytes())?;
        file.as_file().sync_all()?;
        file.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Override a single field by name
    pub fn set(&mut self, name: &str, value: &ParamValue) -> TgResult<()> {
        let mismatch = || {
            TgError::Validation(format!("parameter '{name}' cannot take value {value}"))
        };
        let uint = |value: &ParamValue| -> Option<u64> {
            value.as_i64().and_then(|v| u64::try_from(v).ok())
        };
        let small = |value: &ParamValue| -> Option<u32> {
            uint(value).and_then(|v| u32::try_from(v).ok())
        };

        match name {
            "seed" => self.seed = uint(value).ok_or_else(mismatch)?,
            "cuda" => self.cuda = value.as_bool().ok_or_else(mismatch)?,
            "shuffle" => self.shuffle = value.as_bool().ok_or_else(mismatch)?,
            "subset" => self.subset = Some(uint(value).ok_or_else(mismatch)?),
            "min_freq" => self.min_freq = small(value).ok_or_else(mismatch)?,
            "lower" => self.lower = value.as_bool().ok_or_else(mismatch)?,
            "char_level" => self.char_level = value.as_bool().ok_or_else(mismatch)?,
            "max_filter_size" => self.max_filter_size = small(value).ok_or_else(mismatch)?,
            "batch_size" => self.batch_size = small(value).ok_or_else(mismatch)?,
            "embedding_dim" => self.embedding_dim = small(value).ok_or_else(mismatch)?,
            "num_filters" => self.num_filters = small(value).ok_or_else(mismatch)?,
            "hidden_dim" => self.hidden_dim = small(value).ok_or_else(mismatch)?,
            "dropout_p" => self.dropout_p = value.as_f64().ok_or_else(mismatch)?,
            "lr" => self.lr = value.as_f64().ok_or_else(mismatch)?,
            "num_epochs" => self.num_epochs = small(value).ok_or_else(mismatch)?,
            "patience" => self.patience = small(value).ok_or_else(mismatch)?,
            "threshold" => self.threshold = Some(value.as_f64().ok_or_else(mismatch)?),
            _ => {
                return Err(TgError::Validation(format!(
                    "unknown parameter '{name}'"
                )))
            }
        }
        Ok(())
    }

    /// New parameter set with `overrides` applied field by field and the
    /// derived threshold added.
    pub fn merged(
        &self,
        overrides: &BTreeMap<String, ParamValue>,
        threshold: f64,
    ) -> TgResult<Self> {
        let mut merged = self.clone();
        for (name, value) in overrides {
            merged.set(name, value)?;
        }
        merged.threshold = Some(threshold);
        Ok(merged)
    }

    /// Flat, ordered key/value view used for logging and diffing
    pub fn to_map(&self) -> TgResult<BTreeMap<String, serde_json::Value>> {
        match serde_json::to_value(self)? {
            serde_json::Value::Object(map) => Ok(map.into_iter().collect()),
            _ => Err(TgError::Internal("params did not serialize to a mapping".into())),
        }
    }
}
