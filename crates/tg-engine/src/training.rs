//! Training collaborator interface.

use tg_optimizer::{IntermediateReporter, PruneDecision};
use tg_types::{MultiLabelEncoder, Params, PerformanceReport, TgResult, Tokenizer};

use crate::model::TagModel;

/// Everything a finished training invocation hands back
#[derive(Debug)]
pub struct TrainingArtifacts {
    /// Parameters actually used, including the derived threshold
    pub params: Params,
    pub label_encoder: MultiLabelEncoder,
    pub tokenizer: Tokenizer,
    pub model: Box<dyn TagModel>,
    pub performance: PerformanceReport,
    /// Best validation loss
    pub loss: f64,
}

#[derive(Debug)]
pub enum TrainingRun {
    Finished(TrainingArtifacts),
    /// Stopped early at `step` because the reporter asked for it
    Pruned { step: u64 },
}

pub trait Trainer {
    /// Train with `params`, reporting per-epoch values to `reporter`.
    fn train(&mut self, params: &Params, reporter: &mut dyn IntermediateReporter)
        -> TgResult<TrainingRun>;
}

/// Reporter for standalone training runs; never prunes.
#[derive(Debug, Default, Clone)]
pub struct NoPruning {
    pub reported: Vec<(u64, f64)>,
}

impl IntermediateReporter for NoPruning {
    fn report(&mut self, step: u64, value: f64) -> PruneDecision {
        self.reported.push((step, value));
        PruneDecision::Continue
    }
}
