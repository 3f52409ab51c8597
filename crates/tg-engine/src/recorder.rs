//! Training runs committed as immutable artifact bundles.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use tg_data::{ArtifactBundle, ArtifactCodec, RunStore};
use tg_types::{MetricsSnapshot, Params, RunId, RunRecord, RunStatus, TgError, TgResult};

use crate::training::{NoPruning, Trainer, TrainingRun};

/// Writes a bundle into a directory
pub trait BundleWriter: Send + Sync + std::fmt::Debug {
    fn write_bundle(&self, bundle: &ArtifactBundle, dir: &Path) -> TgResult<()>;
}

impl BundleWriter for ArtifactCodec {
    fn write_bundle(&self, bundle: &ArtifactBundle, dir: &Path) -> TgResult<()> {
        self.write(bundle, dir)
    }
}

/// An open run; marked failed on drop unless finished.
#[derive(Debug)]
pub struct ActiveRun {
    store: Arc<dyn RunStore>,
    run_id: RunId,
    finished: bool,
}

impl ActiveRun {
    pub fn start(store: Arc<dyn RunStore>, experiment_name: &str, run_name: &str) -> TgResult<Self> {
        store.get_or_create_experiment(experiment_name)?;
        let run = store.create_run(experiment_name, run_name)?;
        info!("Run {} ({}) started in '{}'", run.run_id, run_name, experiment_name);
        Ok(Self {
            store,
            run_id: run.run_id,
            finished: false,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn finish(mut self, status: RunStatus) -> TgResult<()> {
        self.finished = true;
        self.store.finish_run(&self.run_id, status)
    }
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        warn!("Run {} ended without finishing; marking failed", self.run_id);
        if let Err(e) = self.store.finish_run(&self.run_id, RunStatus::Failed) {
            warn!("Could not mark run {} failed: {}", self.run_id, e);
        }
    }
}

/// Drives one training invocation and commits its outputs under a run id
#[derive(Debug, Clone)]
pub struct RunRecorder {
    store: Arc<dyn RunStore>,
    writer: Arc<dyn BundleWriter>,
}

impl RunRecorder {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self::with_writer(store, Arc::new(ArtifactCodec::new()))
    }

    pub fn with_writer(store: Arc<dyn RunStore>, writer: Arc<dyn BundleWriter>) -> Self {
        Self { store, writer }
    }

    /// Train with `params` and publish the resulting bundle.
    ///
    /// The bundle is written to a staging area and only published once every
    /// component is on disk. Trainer errors are returned unchanged.
    pub fn record<T: Trainer + ?Sized>(
        &self,
        experiment_name: &str,
        run_name: &str,
        trainer: &mut T,
        params: &Params,
    ) -> TgResult<RunRecord> {
        let run = ActiveRun::start(self.store.clone(), experiment_name, run_name)?;

        let artifacts = match trainer.train(params, &mut NoPruning::default())? {
            TrainingRun::Finished(artifacts) => artifacts,
            TrainingRun::Pruned { step } => {
                return Err(TgError::Internal(format!(
                    "standalone training stopped early at step {step}"
                )))
            }
        };

        let metrics = MetricsSnapshot::from_performance(&artifacts.performance, artifacts.loss)?;
        self.store.log_metrics(run.run_id(), &metrics.to_map())?;
        self.store
            .log_params(run.run_id(), &artifacts.params.to_map()?)?;

        let bundle = ArtifactBundle {
            weights: artifacts.model.state_dict()?,
            params: artifacts.params,
            label_encoder: artifacts.label_encoder,
            tokenizer: artifacts.tokenizer,
            performance: artifacts.performance,
        };

        let staging = self.store.stage_artifacts(run.run_id())?;
        self.writer.write_bundle(&bundle, staging.path())?;
        let artifact_location = self.store.publish_artifacts(staging)?;
        info!(
            "Published bundle for run {} at {}",
            run.run_id(),
            artifact_location.display()
        );

        let run_id = run.run_id().to_string();
        run.finish(RunStatus::Finished)?;

        Ok(RunRecord {
            run_id,
            experiment_name: experiment_name.to_string(),
            params: bundle.params,
            metrics,
            artifact_location,
        })
    }
}
