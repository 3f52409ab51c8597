//! Reconstruct inference-ready runs from their bundles.

use std::sync::Arc;

use serde::Serialize;

use tg_data::{ArtifactCodec, RunStore};
use tg_types::{
    ArtifactComponent, Device, MultiLabelEncoder, Params, PerformanceReport, RunId, TgError,
    TgResult, Tokenizer,
};

use crate::model::{apply_threshold, ModelFactory, TagModel};

/// Threshold used when a run's parameters carry none
pub const DEFAULT_THRESHOLD: f64 = 0.5;

/// A loaded run, usable without further I/O
#[derive(Debug)]
pub struct InferenceContext {
    pub run_id: RunId,
    pub params: Params,
    pub label_encoder: MultiLabelEncoder,
    pub tokenizer: Tokenizer,
    pub model: Box<dyn TagModel>,
    pub performance: PerformanceReport,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub input_text: String,
    pub predicted_tags: Vec<String>,
}

impl InferenceContext {
    pub fn threshold(&self) -> f64 {
        self.params.threshold.unwrap_or(DEFAULT_THRESHOLD)
    }

    /// Tag each text with the classes scoring at or above the threshold.
    pub fn predict<S: AsRef<str>>(&self, texts: &[S]) -> TgResult<Vec<Prediction>> {
        let prepared: Vec<String> = texts
            .iter()
            .map(|t| preprocess(t.as_ref(), self.params.lower))
            .collect();
        let sequences = self.tokenizer.texts_to_sequences(&prepared);
        let probabilities = self.model.predict_proba(&sequences)?;
        if probabilities.len() != texts.len() {
            return Err(TgError::Internal(format!(
                "model returned {} rows for {} inputs",
                probabilities.len(),
                texts.len()
            )));
        }

        let tags = self
            .label_encoder
            .decode(&apply_threshold(&probabilities, self.threshold()));
        Ok(texts
            .iter()
            .zip(tags)
            .map(|(text, predicted_tags)| Prediction {
                input_text: text.as_ref().to_string(),
                predicted_tags,
            })
            .collect())
    }
}

/// Lowercase (optionally) and keep only alphanumerics separated by single spaces.
pub fn preprocess(text: &str, lower: bool) -> String {
    let text = if lower {
        text.to_lowercase()
    } else {
        text.to_string()
    };
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone)]
pub struct ArtifactBundleLoader {
    store: Arc<dyn RunStore>,
    codec: ArtifactCodec,
    factory: Arc<dyn ModelFactory>,
}

impl ArtifactBundleLoader {
    pub fn new(store: Arc<dyn RunStore>, factory: Arc<dyn ModelFactory>) -> Self {
        Self {
            store,
            codec: ArtifactCodec::new(),
            factory,
        }
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    /// Load `run_id`, placing the model on `device`.
    pub fn load(&self, run_id: &str, device: Device) -> TgResult<InferenceContext> {
        let location = self.store.artifact_location(run_id)?;
        let bundle = self.codec.read(&location, device)?;

        let mut model = self.factory.initialize(
            &bundle.params,
            bundle.tokenizer.len(),
            bundle.label_encoder.len(),
            device,
        )?;
        model.load_state(&bundle.weights).map_err(|e| match e {
            e @ TgError::ArtifactCorruption { .. } => e,
            other => TgError::corruption(ArtifactComponent::Weights, other),
        })?;
        tracing::debug!("Loaded run {} on {}", run_id, device);

        Ok(InferenceContext {
            run_id: run_id.to_string(),
            params: bundle.params,
            label_encoder: bundle.label_encoder,
            tokenizer: bundle.tokenizer,
            model,
            performance: bundle.performance,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::RunRecorder;
    use crate::testing::{ConstantFactory, ScriptedTrainer, CLASSES};
    use tempfile::tempdir;
    use tg_data::LocalRunStore;

    fn recorded_run(dir: &std::path::Path) -> (ArtifactBundleLoader, String) {
        let store: Arc<dyn RunStore> = Arc::new(LocalRunStore::open(dir).unwrap());
        let record = RunRecorder::new(store.clone())
            .record("tags", "run", &mut ScriptedTrainer::default(), &Params::default())
            .unwrap();
        (
            ArtifactBundleLoader::new(store, Arc::new(ConstantFactory)),
            record.run_id,
        )
    }

    #[test]
    fn test_load_and_predict() {
        let dir = tempdir().unwrap();
        let (loader, run_id) = recorded_run(dir.path());

        let ctx = loader.load(&run_id, Device::Cpu).unwrap();
        assert_eq!(ctx.label_encoder.classes(), CLASSES);
        assert_eq!(ctx.threshold(), 0.5);

        let predictions = ctx.predict(&["Transfer learning with transformers"]).unwrap();
        assert_eq!(
            predictions,
            vec![Prediction {
                input_text: "Transfer learning with transformers".to_string(),
                predicted_tags: vec![
                    "computer-vision".to_string(),
                    "natural-language-processing".to_string()
                ],
            }]
        );
    }

    #[test]
    fn test_model_lands_on_requested_device() {
        let dir = tempdir().unwrap();
        let (loader, run_id) = recorded_run(dir.path());
        let ctx = loader.load(&run_id, Device::Cuda(0)).unwrap();
        assert_eq!(ctx.model.device(), Device::Cuda(0));
    }

    #[test]
    fn test_missing_weights_is_corruption() {
        let dir = tempdir().unwrap();
        let (loader, run_id) = recorded_run(dir.path());
        let location = loader.store().artifact_location(&run_id).unwrap();
        std::fs::remove_file(location.join("model.bin")).unwrap();

        let error = loader.load(&run_id, Device::Cpu).unwrap_err();
        assert_eq!(error.corrupted_component(), Some(ArtifactComponent::Weights));
        // the rest of the bundle is untouched
        assert!(location.join("params.json").exists());
        assert!(location.join("performance.json").exists());
    }

    #[test]
    fn test_mismatched_weights_is_corruption() {
        let dir = tempdir().unwrap();
        let (loader, run_id) = recorded_run(dir.path());
        let location = loader.store().artifact_location(&run_id).unwrap();
        std::fs::write(location.join("model.bin"), [1u8, 2]).unwrap();

        let error = loader.load(&run_id, Device::Cpu).unwrap_err();
        assert_eq!(error.corrupted_component(), Some(ArtifactComponent::Weights));
    }

    #[test]
    fn test_unknown_run_is_not_found() {
        let dir = tempdir().unwrap();
        let (loader, _) = recorded_run(dir.path());
        assert!(matches!(
            loader.load("0123456789abcdef", Device::Cpu),
            Err(TgError::RunNotFound { id }) if id == "0123456789abcdef"
        ));
    }

    #[test]
    fn test_preprocess() {
        assert_eq!(preprocess("Hello, World!  GANs", true), "hello world gans");
        assert_eq!(preprocess("Keep-Case", false), "Keep Case");
    }
}
