//! Tagifai run lifecycle: training, publishing, loading, comparison and
//! behavioral re-scoring of text-tagging models.

pub mod baseline;
pub mod behavioral;
pub mod compare;
pub mod loader;
pub mod model;
pub mod objective;
pub mod recorder;
pub mod training;

#[cfg(test)]
mod testing;

pub use baseline::{BaselineTrainer, LogisticFactory, LogisticModel};
pub use behavioral::{BehavioralCase, BehavioralReevaluator, BehavioralSuite, CaseKind, BEHAVIORAL_METRIC};
pub use compare::{ReleaseSource, ReportDiff, ReportSource, RunComparator, RunStoreSource, WORKSPACE_TAG};
pub use loader::{preprocess, ArtifactBundleLoader, InferenceContext, Prediction, DEFAULT_THRESHOLD};
pub use model::{apply_threshold, ModelFactory, TagModel};
pub use objective::TrainingObjective;
pub use recorder::{ActiveRun, BundleWriter, RunRecorder};
pub use training::{NoPruning, Trainer, TrainingArtifacts, TrainingRun};
