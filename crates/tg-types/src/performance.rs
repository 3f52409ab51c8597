use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::{TgError, TgResult};

/// Name of the aggregate slice inside `PerformanceReport::slices`
pub const OVERALL_SLICE: &str = "overall";

/// Precision/recall/f1 over a set of samples
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Metrics {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub num_samples: u64,
}

/// Outcome of the behavioral test suite
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BehavioralReport {
    pub score: f64,
    #[serde(default)]
    pub results: BehavioralResults,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BehavioralResults {
    pub passed: Vec<BehavioralCaseResult>,
    pub failed: Vec<BehavioralCaseResult>,
}

/// A single behavioral assertion as evaluated against a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehavioralCaseResult {
    pub kind: String,
    pub input: String,
    pub expected: Vec<String>,
    pub prediction: Vec<String>,
}

/// Performance report persisted as `performance.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PerformanceReport {
    pub overall: Metrics,
    #[serde(default)]
    pub class: BTreeMap<String, Metrics>,
    #[serde(default)]
    pub slices: BTreeMap<String, Metrics>,
    pub behavioral: BehavioralReport,
}

impl PerformanceReport {
    pub fn to_json(&self) -> TgResult<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Fixed set of run metrics logged to the tracking backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub best_val_loss: f64,
    pub behavioral_score: f64,
    pub slices_f1: f64,
}

impl MetricsSnapshot {
    pub const KEYS: [&'static str; 6] = [
        "precision",
        "recall",
        "f1",
        "best_val_loss",
        "behavioral_score",
        "slices_f1",
    ];

    /// Builds the snapshot; the report must carry an `overall` slice.
    pub fn from_performance(performance: &PerformanceReport, best_val_loss: f64) -> TgResult<Self> {
        let slices = performance.slices.get(OVERALL_SLICE).ok_or_else(|| {
            TgError::Validation(format!(
                "performance report has no '{OVERALL_SLICE}' slice"
            ))
        })?;

        Ok(Self {
            precision: performance.overall.precision,
            recall: performance.overall.recall,
            f1: performance.overall.f1,
            best_val_loss,
            behavioral_score: performance.behavioral.score,
            slices_f1: slices.f1,
        })
    }

    pub fn to_map(&self) -> BTreeMap<String, f64> {
        let values = [
            self.precision,
            self.recall,
            self.f1,
            self.best_val_loss,
            self.behavioral_score,
            self.slices_f1,
        ];
        Self::KEYS
            .iter()
            .zip(values)
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }
}
