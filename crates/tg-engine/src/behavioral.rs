//! Behavioral test suite and retroactive re-scoring of published runs.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use tg_data::ArtifactCodec;
use tg_types::{
    BehavioralCaseResult, BehavioralReport, BehavioralResults, Device, PerformanceReport,
    TgResult,
};

use crate::loader::{ArtifactBundleLoader, InferenceContext};

pub const BEHAVIORAL_METRIC: &str = "behavioral_score";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseKind {
    /// Perturbations that must not change the prediction
    Invariance,
    /// Changes that must move the prediction to the expected tags
    Directional,
    /// Simple inputs the model must get right
    MinimumFunctionality,
}

impl fmt::Display for CaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Invariance => "invariance",
            Self::Directional => "directional",
            Self::MinimumFunctionality => "minimum_functionality",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehavioralCase {
    pub kind: CaseKind,
    pub input: String,
    pub expected: Vec<String>,
}

impl BehavioralCase {
    fn new(kind: CaseKind, input: &str, expected: &[&str]) -> Self {
        Self {
            kind,
            input: input.to_string(),
            expected: expected.iter().map(|t| t.to_string()).collect(),
        }
    }
}

/// A fixed list of input/expected-tag assertions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehavioralSuite {
    pub cases: Vec<BehavioralCase>,
}

impl Default for BehavioralSuite {
    fn default() -> Self {
        use CaseKind::*;
        let nlp = ["natural-language-processing"];
        let cv = ["computer-vision"];
        Self {
            cases: vec![
                BehavioralCase::new(Invariance, "Transformers have revolutionized machine learning.", &nlp),
                BehavioralCase::new(Invariance, "Transformers have revolutionized the ML field.", &nlp),
                BehavioralCase::new(Invariance, "Transformers applied to natural language text.", &nlp),
                BehavioralCase::new(Directional, "ImageNet classification with convolutional networks.", &cv),
                BehavioralCase::new(Directional, "Semantic segmentation of images with CNNs.", &cv),
                BehavioralCase::new(Directional, "Named entity recognition on text documents.", &nlp),
                BehavioralCase::new(MinimumFunctionality, "Natural language processing is the next big wave.", &nlp),
                BehavioralCase::new(MinimumFunctionality, "Object detection with bounding boxes.", &cv),
                BehavioralCase::new(MinimumFunctionality, "MLOps tooling for model monitoring and deployment.", &["mlops"]),
            ],
        }
    }
}

impl BehavioralSuite {
    pub fn new(cases: Vec<BehavioralCase>) -> Self {
        Self { cases }
    }

    /// Run every case through `predict`; a case passes when the predicted tag
    /// set equals the expected one. Score is passed / total.
    pub fn evaluate<F>(&self, mut predict: F) -> TgResult<BehavioralReport>
    where
        F: FnMut(&[String]) -> TgResult<Vec<Vec<String>>>,
    {
        let inputs: Vec<String> = self.cases.iter().map(|c| c.input.clone()).collect();
        let predictions = predict(&inputs)?;

        let mut results = BehavioralResults::default();
        for (case, prediction) in self.cases.iter().zip(predictions) {
            let expected: BTreeSet<&str> = case.expected.iter().map(String::as_str).collect();
            let predicted: BTreeSet<&str> = prediction.iter().map(String::as_str).collect();
            let passed = expected == predicted;
            let result = BehavioralCaseResult {
                kind: case.kind.to_string(),
                input: case.input.clone(),
                expected: case.expected.clone(),
                prediction,
            };
            if passed {
                results.passed.push(result);
            } else {
                results.failed.push(result);
            }
        }

        let total = self.cases.len();
        let score = if total == 0 {
            0.0
        } else {
            results.passed.len() as f64 / total as f64
        };
        Ok(BehavioralReport { score, results })
    }

    /// Evaluate against a loaded run.
    pub fn evaluate_context(&self, ctx: &InferenceContext) -> TgResult<BehavioralReport> {
        self.evaluate(|texts| {
            Ok(ctx
                .predict(texts)?
                .into_iter()
                .map(|p| p.predicted_tags)
                .collect())
        })
    }
}

/// Re-scores a published run and rewrites only its performance report
#[derive(Debug, Clone)]
pub struct BehavioralReevaluator {
    loader: ArtifactBundleLoader,
    codec: ArtifactCodec,
    suite: Arc<BehavioralSuite>,
}

impl BehavioralReevaluator {
    pub fn new(loader: ArtifactBundleLoader) -> Self {
        Self::with_suite(loader, BehavioralSuite::default())
    }

    pub fn with_suite(loader: ArtifactBundleLoader, suite: BehavioralSuite) -> Self {
        Self {
            loader,
            codec: ArtifactCodec::new(),
            suite: Arc::new(suite),
        }
    }

    pub fn reevaluate(&self, run_id: &str) -> TgResult<PerformanceReport> {
        let ctx = self.loader.load(run_id, Device::Cpu)?;
        let behavioral = self.suite.evaluate_context(&ctx)?;

        let mut performance = ctx.performance;
        performance.behavioral = behavioral;

        let store = self.loader.store();
        let location = store.artifact_location(run_id)?;
        self.codec.write_performance(&performance, &location)?;
        store.log_metrics(
            run_id,
            &BTreeMap::from([(BEHAVIORAL_METRIC.to_string(), performance.behavioral.score)]),
        )?;

        info!(
            "Run {} behavioral score is now {:.3} ({} passed, {} failed)",
            run_id,
            performance.behavioral.score,
            performance.behavioral.results.passed.len(),
            performance.behavioral.results.failed.len()
        );
        Ok(performance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::RunRecorder;
    use crate::testing::{ConstantFactory, ScriptedTrainer};
    use tempfile::tempdir;
    use tg_data::{LocalRunStore, RunStore};
    use tg_types::Params;

    #[test]
    fn test_score_is_passed_over_total() {
        let suite = BehavioralSuite::new(vec![
            BehavioralCase::new(CaseKind::Invariance, "a", &["x"]),
            BehavioralCase::new(CaseKind::Directional, "b", &["y"]),
            BehavioralCase::new(CaseKind::MinimumFunctionality, "c", &["y", "x"]),
            BehavioralCase::new(CaseKind::MinimumFunctionality, "d", &[]),
        ]);
        let report = suite
            .evaluate(|texts| {
                Ok(texts
                    .iter()
                    .map(|_| vec!["x".to_string(), "y".to_string()])
                    .collect())
            })
            .unwrap();

        assert_eq!(report.score, 0.25);
        assert_eq!(report.results.passed.len(), 1);
        assert_eq!(report.results.passed[0].input, "c");
        assert_eq!(report.results.failed[0].kind, "invariance");
    }

    #[test]
    fn test_empty_suite_scores_zero() {
        let report = BehavioralSuite::new(vec![])
            .evaluate(|_| Ok(vec![]))
            .unwrap();
        assert_eq!(report.score, 0.0);
    }

    #[test]
    fn test_reevaluation_rewrites_only_performance() {
        let dir = tempdir().unwrap();
        let store: Arc<dyn RunStore> = Arc::new(LocalRunStore::open(dir.path()).unwrap());
        let record = RunRecorder::new(store.clone())
            .record("tags", "run", &mut ScriptedTrainer::default(), &Params::default())
            .unwrap();
        let location = record.artifact_location.clone();
        let untouched: Vec<Vec<u8>> = ["params.json", "label_encoder.json", "tokenizer.json", "model.bin"]
            .iter()
            .map(|f| std::fs::read(location.join(f)).unwrap())
            .collect();

        let loader = ArtifactBundleLoader::new(store.clone(), Arc::new(ConstantFactory));
        let reevaluator = BehavioralReevaluator::new(loader.clone());
        let performance = reevaluator.reevaluate(&record.run_id).unwrap();

        // constant model tags everything computer-vision + nlp
        assert_eq!(performance.behavioral.results.passed.len(), 0);
        assert_eq!(performance.behavioral.results.failed.len(), 9);
        assert_eq!(performance.overall.f1, record.metrics.f1);

        let reloaded = loader.load(&record.run_id, Device::Cpu).unwrap();
        assert_eq!(reloaded.performance, performance);
        for (file, before) in ["params.json", "label_encoder.json", "tokenizer.json", "model.bin"]
            .iter()
            .zip(untouched)
        {
            assert_eq!(std::fs::read(location.join(file)).unwrap(), before, "{file} changed");
        }
        assert_eq!(
            store.latest_metrics(&record.run_id).unwrap()[BEHAVIORAL_METRIC],
            0.0
        );
    }
}
