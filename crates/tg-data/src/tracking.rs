//! Run tracking backend.
//!
//! [`RunStore`] is the narrow interface the rest of the system uses to
//! create runs, log to them and resolve their artifact locations.
//! [`LocalRunStore`] keeps everything on the local filesystem:
//!
//! ```text
//! <root>/<experiment_id>/meta.json
//! <root>/<experiment_id>/<run_id>/meta.json
//! <root>/<experiment_id>/<run_id>/{params,metrics,tags}.json
//! <root>/<experiment_id>/<run_id>/artifacts/        (published bundle)
//! <root>/<experiment_id>/<run_id>/.staging-*/       (in-flight bundle)
//! ```

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use uuid::Uuid;

use tg_types::{ExperimentInfo, RunId, RunInfo, RunStatus, TgError, TgResult, TrackingError};

use crate::fsio::{read_json, write_json_atomic};

const META_FILE: &str = "meta.json";
const PARAMS_FILE: &str = "params.json";
const METRICS_FILE: &str = "metrics.json";
const TAGS_FILE: &str = "tags.json";
const ARTIFACTS_DIR: &str = "artifacts";
const STAGING_PREFIX: &str = ".staging-";

/// Scoped directory where a run's bundle is written before publication.
///
/// Dropping it without publishing removes the directory and everything in it.
#[derive(Debug)]
pub struct StagingArea {
    run_id: RunId,
    dir: TempDir,
}

impl StagingArea {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// Tracking backend: experiments, runs, params, metrics and artifacts
pub trait RunStore: Send + Sync + std::fmt::Debug {
    fn get_or_create_experiment(&self, name: &str) -> TgResult<ExperimentInfo>;

    fn get_experiment(&self, name: &str) -> TgResult<ExperimentInfo>;

    fn list_experiments(&self) -> TgResult<Vec<ExperimentInfo>>;

    /// Removes an experiment together with all of its runs.
    fn delete_experiment(&self, name: &str) -> TgResult<()>;

    /// Opens a new run in `experiment_name`, creating the experiment if needed.
    fn create_run(&self, experiment_name: &str, run_name: &str) -> TgResult<RunInfo>;

    fn get_run(&self, run_id: &str) -> TgResult<RunInfo>;

    fn list_runs(&self, experiment_name: &str) -> TgResult<Vec<RunInfo>>;

    fn log_params(&self, run_id: &str, params: &BTreeMap<String, serde_json::Value>)
        -> TgResult<()>;

    fn log_metrics(&self, run_id: &str, metrics: &BTreeMap<String, f64>) -> TgResult<()>;

    /// Latest value of every metric logged to the run.
    fn latest_metrics(&self, run_id: &str) -> TgResult<BTreeMap<String, f64>>;

    fn set_tags(&self, run_id: &str, tags: &BTreeMap<String, String>) -> TgResult<()>;

    fn stage_artifacts(&self, run_id: &str) -> TgResult<StagingArea>;

    /// Atomically makes a staged bundle the run's artifact location.
    fn publish_artifacts(&self, staging: StagingArea) -> TgResult<PathBuf>;

    /// Location of the run's published bundle; `RunNotFound` until one exists.
    fn artifact_location(&self, run_id: &str) -> TgResult<PathBuf>;

    fn finish_run(&self, run_id: &str, status: RunStatus) -> TgResult<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MetricPoint {
    value: f64,
    step: u64,
    timestamp: DateTime<Utc>,
}

/// Filesystem-backed run store
#[derive(Debug)]
pub struct LocalRunStore {
    root: PathBuf,
    experiments: RwLock<HashMap<String, ExperimentInfo>>,
    run_dirs: DashMap<RunId, PathBuf>,
}

impl LocalRunStore {
    /// Opens (or initialises) a store rooted at `root`.
    pub fn open<P: AsRef<Path>>(root: P) -> TgResult<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;

        let mut experiments = HashMap::new();
        for entry in std::fs::read_dir(&root)? {
            let path = entry?.path();
            let meta = path.join(META_FILE);
            if path.is_dir() && meta.exists() {
                let info: ExperimentInfo = read_meta(&meta)?;
                experiments.insert(info.name.clone(), info);
            }
        }
        tracing::debug!("Opened run store at {} with {} experiments", root.display(), experiments.len());

        Ok(Self {
            root,
            experiments: RwLock::new(experiments),
            run_dirs: DashMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn experiment_dir(&self, experiment_id: &str) -> PathBuf {
        self.root.join(experiment_id)
    }

    /// Directory of a run, scanning experiments on a cache miss
    fn run_dir(&self, run_id: &str) -> TgResult<PathBuf> {
        if let Some(dir) = self.run_dirs.get(run_id) {
            if dir.exists() {
                return Ok(dir.value().clone());
            }
        }
        self.run_dirs.remove(run_id);

        // run ids are generated by this store and never contain separators
        if run_id.is_empty() || run_id.contains(['/', '\\', '.']) {
            return Err(TgError::run_not_found(run_id));
        }

        let experiments: Vec<String> = self
            .experiments
            .read()
            .values()
            .map(|e| e.experiment_id.clone())
            .collect();
        for experiment_id in experiments {
            let candidate = self.experiment_dir(&experiment_id).join(run_id);
            if candidate.join(META_FILE).exists() {
                self.run_dirs.insert(run_id.to_string(), candidate.clone());
                return Ok(candidate);
            }
        }
        Err(TgError::run_not_found(run_id))
    }

    fn read_run(&self, run_id: &str) -> TgResult<(PathBuf, RunInfo)> {
        let dir = self.run_dir(run_id)?;
        let info = read_meta(&dir.join(META_FILE))?;
        Ok((dir, info))
    }

    fn require_running(&self, run_id: &str) -> TgResult<PathBuf> {
        let (dir, info) = self.read_run(run_id)?;
        if info.status != RunStatus::Running {
            return Err(TrackingError::RunNotActive {
                run_id: run_id.to_string(),
            }
            .into());
        }
        Ok(dir)
    }

    fn next_experiment_id(experiments: &HashMap<String, ExperimentInfo>) -> String {
        experiments
            .values()
            .filter_map(|e| e.experiment_id.parse::<u64>().ok())
            .max()
            .map_or(0, |max| max + 1)
            .to_string()
    }
}

fn read_meta<T: serde::de::DeserializeOwned>(path: &Path) -> TgResult<T> {
    read_json(path).map_err(|e| {
        TrackingError::CorruptMetadata {
            path: path.display().to_string(),
            message: e.to_string(),
        }
        .into()
    })
}

fn read_or_default<T: serde::de::DeserializeOwned + Default>(path: &Path) -> TgResult<T> {
    if path.exists() {
        read_meta(path)
    } else {
        Ok(T::default())
    }
}

impl RunStore for LocalRunStore {
    fn get_or_create_experiment(&self, name: &str) -> TgResult<ExperimentInfo> {
        if let Some(info) = self.experiments.read().get(name) {
            return Ok(info.clone());
        }

        let mut experiments = self.experiments.write();
        if let Some(info) = experiments.get(name) {
            return Ok(info.clone());
        }

        let info = ExperimentInfo {
            experiment_id: Self::next_experiment_id(&experiments),
            name: name.to_string(),
            created_at: Utc::now(),
        };
        let dir = self.experiment_dir(&info.experiment_id);
        std::fs::create_dir_all(&dir)?;
        write_json_atomic(&dir.join(META_FILE), &info)?;
        tracing::info!("Created experiment '{}' ({})", name, info.experiment_id);

        experiments.insert(name.to_string(), info.clone());
        Ok(info)
    }

    fn get_experiment(&self, name: &str) -> TgResult<ExperimentInfo> {
        self.experiments.read().get(name).cloned().ok_or_else(|| {
            TrackingError::ExperimentNotFound {
                name: name.to_string(),
            }
            .into()
        })
    }

    fn list_experiments(&self) -> TgResult<Vec<ExperimentInfo>> {
        let mut experiments: Vec<_> = self.experiments.read().values().cloned().collect();
        experiments.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        Ok(experiments)
    }

    fn delete_experiment(&self, name: &str) -> TgResult<()> {
        let info = self.experiments.write().remove(name).ok_or_else(|| {
            TgError::from(TrackingError::ExperimentNotFound {
                name: name.to_string(),
            })
        })?;
        let dir = self.experiment_dir(&info.experiment_id);
        self.run_dirs.retain(|_, run_dir| !run_dir.starts_with(&dir));
        std::fs::remove_dir_all(&dir)?;
        tracing::info!("Deleted experiment '{}'", name);
        Ok(())
    }

    fn create_run(&self, experiment_name: &str, run_name: &str) -> TgResult<RunInfo> {
        let experiment = self.get_or_create_experiment(experiment_name)?;
        let info = RunInfo {
            run_id: Uuid::new_v4().simple().to_string(),
            run_name: run_name.to_string(),
            experiment_id: experiment.experiment_id.clone(),
            experiment_name: experiment.name,
            status: RunStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
        };

        let dir = self.experiment_dir(&experiment.experiment_id).join(&info.run_id);
        std::fs::create_dir_all(&dir)?;
        write_json_atomic(&dir.join(META_FILE), &info)?;
        self.run_dirs.insert(info.run_id.clone(), dir);
        tracing::debug!("Created run {} ({}) in '{}'", info.run_id, run_name, experiment_name);
        Ok(info)
    }

    fn get_run(&self, run_id: &str) -> TgResult<RunInfo> {
        self.read_run(run_id).map(|(_, info)| info)
    }

    fn list_runs(&self, experiment_name: &str) -> TgResult<Vec<RunInfo>> {
        let experiment = self.get_experiment(experiment_name)?;
        let mut runs = Vec::new();
        for entry in std::fs::read_dir(self.experiment_dir(&experiment.experiment_id))? {
            let path = entry?.path();
            let meta = path.join(META_FILE);
            if path.is_dir() && meta.exists() {
                runs.push(read_meta::<RunInfo>(&meta)?);
            }
        }
        runs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(runs)
    }

    fn log_params(
        &self,
        run_id: &str,
        params: &BTreeMap<String, serde_json::Value>,
    ) -> TgResult<()> {
        let path = self.require_running(run_id)?.join(PARAMS_FILE);
        let mut logged: BTreeMap<String, serde_json::Value> = read_or_default(&path)?;
        logged.extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));
        write_json_atomic(&path, &logged)
    }

    fn log_metrics(&self, run_id: &str, metrics: &BTreeMap<String, f64>) -> TgResult<()> {
        // metrics may be appended after a run has finished
        let path = self.run_dir(run_id)?.join(METRICS_FILE);
        let mut history: BTreeMap<String, Vec<MetricPoint>> = read_or_default(&path)?;
        let now = Utc::now();
        for (key, value) in metrics {
            let points = history.entry(key.clone()).or_default();
            points.push(MetricPoint {
                value: *value,
                step: points.len() as u64,
                timestamp: now,
            });
        }
        write_json_atomic(&path, &history)
    }

    fn latest_metrics(&self, run_id: &str) -> TgResult<BTreeMap<String, f64>> {
        let path = self.run_dir(run_id)?.join(METRICS_FILE);
        let history: BTreeMap<String, Vec<MetricPoint>> = read_or_default(&path)?;
        Ok(history
            .into_iter()
            .filter_map(|(key, points)| points.last().map(|p| (key, p.value)))
            .collect())
    }

    fn set_tags(&self, run_id: &str, tags: &BTreeMap<String, String>) -> TgResult<()> {
        let path = self.run_dir(run_id)?.join(TAGS_FILE);
        let mut current: BTreeMap<String, String> = read_or_default(&path)?;
        current.extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        write_json_atomic(&path, &current)
    }

    fn stage_artifacts(&self, run_id: &str) -> TgResult<StagingArea> {
        let run_dir = self.require_running(run_id)?;
        let dir = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(&run_dir)?;
        tracing::debug!("Staging artifacts for run {} in {}", run_id, dir.path().display());
        Ok(StagingArea {
            run_id: run_id.to_string(),
            dir,
        })
    }

    fn publish_artifacts(&self, staging: StagingArea) -> TgResult<PathBuf> {
        let run_dir = self.require_running(&staging.run_id)?;
        let target = run_dir.join(ARTIFACTS_DIR);
        if target.exists() {
            return Err(TrackingError::AlreadyPublished {
                run_id: staging.run_id.clone(),
            }
            .into());
        }

        std::fs::rename(staging.path(), &target)?;
        // the TempDir now points at a path that no longer exists; dropping it is a no-op
        drop(staging);
        tracing::info!("Published artifacts to {}", target.display());
        Ok(target)
    }

    fn artifact_location(&self, run_id: &str) -> TgResult<PathBuf> {
        let target = self.run_dir(run_id)?.join(ARTIFACTS_DIR);
        if !target.is_dir() {
            tracing::debug!("Run {} has no published artifacts", run_id);
            return Err(TgError::run_not_found(run_id));
        }
        Ok(target)
    }

    fn finish_run(&self, run_id: &str, status: RunStatus) -> TgResult<()> {
        let (dir, mut info) = self.read_run(run_id)?;
        if info.status != RunStatus::Running {
            return Err(TrackingError::RunNotActive {
                run_id: run_id.to_string(),
            }
            .into());
        }
        info.status = status;
        info.finished_at = Some(Utc::now());
        write_json_atomic(&dir.join(META_FILE), &info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_experiments_get_sequential_ids_and_survive_reopen() {
        let root = tempdir().unwrap();
        {
            let store = LocalRunStore::open(root.path()).unwrap();
            assert_eq!(store.get_or_create_experiment("best").unwrap().experiment_id, "0");
            assert_eq!(store.get_or_create_experiment("optimization").unwrap().experiment_id, "1");
            assert_eq!(store.get_or_create_experiment("best").unwrap().experiment_id, "0");
        }

        let reopened = LocalRunStore::open(root.path()).unwrap();
        assert_eq!(reopened.list_experiments().unwrap().len(), 2);
        assert!(reopened.get_experiment("optimization").is_ok());
    }

    #[test]
    fn test_run_lifecycle_and_logging() {
        let root = tempdir().unwrap();
        let store = LocalRunStore::open(root.path()).unwrap();
        let run = store.create_run("best", "model").unwrap();
        assert_eq!(run.status, RunStatus::Running);

        let mut params = BTreeMap::new();
        params.insert("lr".to_string(), serde_json::json!(0.001));
        store.log_params(&run.run_id, &params).unwrap();

        let mut metrics = BTreeMap::new();
        metrics.insert("f1".to_string(), 0.5);
        store.log_metrics(&run.run_id, &metrics).unwrap();
        metrics.insert("f1".to_string(), 0.7);
        store.log_metrics(&run.run_id, &metrics).unwrap();

        store.finish_run(&run.run_id, RunStatus::Finished).unwrap();
        assert_eq!(store.get_run(&run.run_id).unwrap().status, RunStatus::Finished);
        assert_eq!(store.latest_metrics(&run.run_id).unwrap()["f1"], 0.7);

        // params are frozen once the run is finished
        assert!(store.log_params(&run.run_id, &params).is_err());
    }

    #[test]
    fn test_unknown_run_is_not_found() {
        let root = tempdir().unwrap();
        let store = LocalRunStore::open(root.path()).unwrap();
        store.get_or_create_experiment("best").unwrap();

        assert!(matches!(store.get_run("nope"), Err(TgError::RunNotFound { .. })));
        assert!(matches!(store.get_run("../0"), Err(TgError::RunNotFound { .. })));
    }

    #[test]
    fn test_run_resolves_after_reopen() {
        let root = tempdir().unwrap();
        let run_id = {
            let store = LocalRunStore::open(root.path()).unwrap();
            store.create_run("best", "model").unwrap().run_id
        };
        let store = LocalRunStore::open(root.path()).unwrap();
        assert_eq!(store.get_run(&run_id).unwrap().run_name, "model");
    }

    #[test]
    fn test_publish_makes_artifacts_resolvable() {
        let root = tempdir().unwrap();
        let store = LocalRunStore::open(root.path()).unwrap();
        let run = store.create_run("best", "model").unwrap();

        assert!(matches!(
            store.artifact_location(&run.run_id),
            Err(TgError::RunNotFound { .. })
        ));

        let staging = store.stage_artifacts(&run.run_id).unwrap();
        std::fs::write(staging.path().join("params.json"), "{}").unwrap();
        let location = store.publish_artifacts(staging).unwrap();

        assert_eq!(store.artifact_location(&run.run_id).unwrap(), location);
        assert!(location.join("params.json").exists());
    }

    #[test]
    fn test_dropped_staging_leaves_nothing_behind() {
        let root = tempdir().unwrap();
        let store = LocalRunStore::open(root.path()).unwrap();
        let run = store.create_run("best", "model").unwrap();

        let staging = store.stage_artifacts(&run.run_id).unwrap();
        let staged_path = staging.path().to_path_buf();
        std::fs::write(staged_path.join("params.json"), "{}").unwrap();
        drop(staging);

        assert!(!staged_path.exists());
        assert!(store.artifact_location(&run.run_id).is_err());
    }

    #[test]
    fn test_publish_twice_is_rejected() {
        let root = tempdir().unwrap();
        let store = LocalRunStore::open(root.path()).unwrap();
        let run = store.create_run("best", "model").unwrap();

        let first = store.stage_artifacts(&run.run_id).unwrap();
        store.publish_artifacts(first).unwrap();
        let second = store.stage_artifacts(&run.run_id).unwrap();
        assert!(matches!(
            store.publish_artifacts(second),
            Err(TgError::Tracking(TrackingError::AlreadyPublished { .. }))
        ));
    }

    #[test]
    fn test_delete_experiment_removes_runs() {
        let root = tempdir().unwrap();
        let store = LocalRunStore::open(root.path()).unwrap();
        let run = store.create_run("scratch", "model").unwrap();

        store.delete_experiment("scratch").unwrap();
        assert!(store.get_experiment("scratch").is_err());
        assert!(matches!(store.get_run(&run.run_id), Err(TgError::RunNotFound { .. })));
        assert!(store.delete_experiment("scratch").is_err());
    }
}
