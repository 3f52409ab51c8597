//! Deterministic collaborators shared by the unit tests.

use std::collections::BTreeMap;

use tg_optimizer::{IntermediateReporter, PruneDecision};
use tg_types::{
    Device, Metrics, MultiLabelEncoder, Params, PerformanceReport, TgError, TgResult, Tokenizer,
    WeightBlob, OVERALL_SLICE,
};

use crate::model::{ModelFactory, TagModel};
use crate::training::{Trainer, TrainingArtifacts, TrainingRun};

pub const CLASSES: [&str; 3] = ["computer-vision", "mlops", "natural-language-processing"];

/// Predicts the same per-class probabilities for every input
#[derive(Debug, Clone)]
pub struct ConstantModel {
    num_classes: usize,
    probabilities: Vec<f64>,
    device: Device,
}

impl ConstantModel {
    pub fn new(probabilities: Vec<f64>) -> Self {
        Self {
            num_classes: probabilities.len(),
            probabilities,
            device: Device::Cpu,
        }
    }
}

impl TagModel for ConstantModel {
    fn predict_proba(&self, sequences: &[Vec<u32>]) -> TgResult<Vec<Vec<f64>>> {
        Ok(vec![self.probabilities.clone(); sequences.len()])
    }

    fn state_dict(&self) -> TgResult<WeightBlob> {
        let bytes = self
            .probabilities
            .iter()
            .map(|p| (p * 100.0).round() as u8)
            .collect();
        Ok(WeightBlob::new(bytes).on(self.device))
    }

    fn load_state(&mut self, weights: &WeightBlob) -> TgResult<()> {
        if weights.len() != self.num_classes {
            return Err(TgError::Validation(format!(
                "expected {} weights, got {}",
                self.num_classes,
                weights.len()
            )));
        }
        self.probabilities = weights.bytes.iter().map(|b| f64::from(*b) / 100.0).collect();
        self.device = weights.device;
        Ok(())
    }

    fn device(&self) -> Device {
        self.device
    }
}

#[derive(Debug, Default)]
pub struct ConstantFactory;

impl ModelFactory for ConstantFactory {
    fn initialize(
        &self,
        _params: &Params,
        _vocab_size: usize,
        num_classes: usize,
        device: Device,
    ) -> TgResult<Box<dyn TagModel>> {
        let mut model = ConstantModel::new(vec![0.0; num_classes]);
        model.device = device;
        Ok(Box::new(model))
    }
}

/// Trainer whose f1 is `dropout_p`, reporting a flat loss curve
#[derive(Debug, Clone)]
pub struct ScriptedTrainer {
    pub probabilities: Vec<f64>,
    pub fail_with: Option<String>,
    pub epochs: u64,
    pub calls: usize,
}

impl Default for ScriptedTrainer {
    fn default() -> Self {
        Self {
            probabilities: vec![0.9, 0.2, 0.7],
            fail_with: None,
            epochs: 3,
            calls: 0,
        }
    }
}

pub fn sample_performance(f1: f64) -> PerformanceReport {
    let metrics = Metrics {
        precision: 0.8,
        recall: 0.6,
        f1,
        num_samples: 10,
    };
    PerformanceReport {
        overall: metrics.clone(),
        class: CLASSES
            .iter()
            .map(|c| (c.to_string(), metrics.clone()))
            .collect(),
        slices: BTreeMap::from([
            (OVERALL_SLICE.to_string(), metrics.clone()),
            ("short_text".to_string(), metrics),
        ]),
        behavioral: Default::default(),
    }
}

impl Trainer for ScriptedTrainer {
    fn train(
        &mut self,
        params: &Params,
        reporter: &mut dyn IntermediateReporter,
    ) -> TgResult<TrainingRun> {
        self.calls += 1;
        if let Some(message) = &self.fail_with {
            return Err(TgError::upstream(std::io::Error::new(
                std::io::ErrorKind::Other,
                message.clone(),
            )));
        }

        for step in 0..self.epochs {
            if reporter.report(step, -(1.0 - params.dropout_p)) == PruneDecision::Prune {
                return Ok(TrainingRun::Pruned { step });
            }
        }

        let mut tokenizer = Tokenizer::new(false);
        tokenizer.fit_on_texts(&["transformers attention text", "convolution image pixels"], None);
        let mut used = params.clone();
        used.threshold = Some(0.5);

        Ok(TrainingRun::Finished(TrainingArtifacts {
            params: used,
            label_encoder: MultiLabelEncoder::fit(&[CLASSES.to_vec()]),
            tokenizer,
            model: Box::new(ConstantModel::new(self.probabilities.clone())),
            performance: sample_performance(params.dropout_p),
            loss: 1.0 - params.dropout_p,
        }))
    }
}
