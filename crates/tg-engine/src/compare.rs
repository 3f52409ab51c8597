//! Parameter and performance diffs between runs or release tags.

use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tg_data::{ArtifactCodec, RemoteClient, RunStore, Settings};
use tg_types::{DiffResult, TgError, TgResult};

/// Release tag that resolves to the local working copy
pub const WORKSPACE_TAG: &str = "workspace";

const RELEASE_PARAMS: &str = "config/params.json";
const RELEASE_PERFORMANCE: &str = "stores/model/performance.json";

/// Resolves an identifier to its params and performance mappings.
#[async_trait]
pub trait ReportSource: Send + Sync + std::fmt::Debug {
    async fn params(&self, id: &str) -> TgResult<Value>;

    async fn performance(&self, id: &str) -> TgResult<Value>;
}

/// Reads reports of published runs without rebuilding their models
#[derive(Debug, Clone)]
pub struct RunStoreSource {
    store: Arc<dyn RunStore>,
    codec: ArtifactCodec,
}

impl RunStoreSource {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self {
            store,
            codec: ArtifactCodec::new(),
        }
    }
}

#[async_trait]
impl ReportSource for RunStoreSource {
    async fn params(&self, id: &str) -> TgResult<Value> {
        let location = self.store.artifact_location(id)?;
        let params = self.codec.read_params(&location)?;
        Ok(serde_json::to_value(params)?)
    }

    async fn performance(&self, id: &str) -> TgResult<Value> {
        let location = self.store.artifact_location(id)?;
        self.codec.read_performance(&location)?.to_json()
    }
}

/// Reads reports committed at release tags, or locally for [`WORKSPACE_TAG`]
#[derive(Debug, Clone)]
pub struct ReleaseSource {
    client: RemoteClient,
    author: String,
    repo: String,
    local_params: PathBuf,
    local_performance: PathBuf,
}

impl ReleaseSource {
    pub fn new(client: RemoteClient, author: &str, repo: &str, settings: &Settings) -> Self {
        Self {
            client,
            author: author.to_string(),
            repo: repo.to_string(),
            local_params: settings.params_path(),
            local_performance: settings.performance_path(),
        }
    }

    /// `tag`, or the most recent release when absent.
    pub async fn resolve_tag(&self, tag: Option<&str>) -> TgResult<String> {
        match tag {
            Some(tag) => Ok(tag.to_string()),
            None => self.client.latest_tag(&self.author, &self.repo).await,
        }
    }

    /// The mapping stored in `file` at `tag`, exactly as committed.
    async fn fetch(&self, tag: &str, file: &str, local: &Path) -> TgResult<Value> {
        let value = if tag == WORKSPACE_TAG {
            let raw = std::fs::read_to_string(local)
                .map_err(|e| TgError::Config(format!("cannot read {}: {e}", local.display())))?;
            serde_json::from_str(&raw).map_err(|e| TgError::parse(local.display(), e))?
        } else {
            self.client
                .release_file(&self.author, &self.repo, tag, file)
                .await?
        };
        if !value.is_object() {
            return Err(TgError::parse(
                format!("{file}@{tag}"),
                "expected a JSON object",
            ));
        }
        Ok(value)
    }
}

#[async_trait]
impl ReportSource for ReleaseSource {
    async fn params(&self, id: &str) -> TgResult<Value> {
        self.fetch(id, RELEASE_PARAMS, &self.local_params).await
    }

    async fn performance(&self, id: &str) -> TgResult<Value> {
        self.fetch(id, RELEASE_PERFORMANCE, &self.local_performance)
            .await
    }
}

/// Params and performance differences, in that order
pub type ReportDiff = (DiffResult, DiffResult);

#[derive(Debug, Clone)]
pub struct RunComparator {
    source: Arc<dyn ReportSource>,
}

impl RunComparator {
    pub fn new(source: Arc<dyn ReportSource>) -> Self {
        Self { source }
    }

    /// Diff `a` against `b`, labeling each side by its identifier.
    pub async fn diff(&self, a: &str, b: &str) -> TgResult<ReportDiff> {
        let params_a = self.source.params(a).await?;
        let params_b = self.source.params(b).await?;
        let performance_a = self.source.performance(a).await?;
        let performance_b = self.source.performance(b).await?;

        Ok((
            DiffResult::between_values(&params_a, &params_b, a, b),
            DiffResult::between_values(&performance_a, &performance_b, a, b),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::RunRecorder;
    use crate::testing::ScriptedTrainer;
    use serde_json::json;
    use tempfile::tempdir;
    use tg_data::LocalRunStore;
    use tg_types::Params;

    fn two_runs(dir: &std::path::Path) -> (RunComparator, String, String) {
        let store: Arc<dyn RunStore> = Arc::new(LocalRunStore::open(dir).unwrap());
        let recorder = RunRecorder::new(store.clone());
        let base = Params::default();
        let mut tuned = base.clone();
        tuned.lr = 1e-3;
        tuned.dropout_p = 0.6;

        let a = recorder
            .record("tags", "a", &mut ScriptedTrainer::default(), &base)
            .unwrap();
        let b = recorder
            .record("tags", "b", &mut ScriptedTrainer::default(), &tuned)
            .unwrap();
        (
            RunComparator::new(Arc::new(RunStoreSource::new(store))),
            a.run_id,
            b.run_id,
        )
    }

    #[tokio::test]
    async fn test_diff_runs() {
        let dir = tempdir().unwrap();
        let (comparator, a, b) = two_runs(dir.path());

        let (params, performance) = comparator.diff(&a, &b).await.unwrap();
        let rendered = params.to_json();
        assert_eq!(rendered["changed"]["lr"][&a], json!(2e-4));
        assert_eq!(rendered["changed"]["lr"][&b], json!(1e-3));
        assert_eq!(params.changed.len(), 2);
        assert!(params.added.is_empty() && params.removed.is_empty());

        let rendered = performance.to_json();
        assert_eq!(rendered["changed"]["overall"]["changed"]["f1"][&b], json!(0.6));
    }

    #[tokio::test]
    async fn test_diff_is_symmetric_and_self_diff_is_empty() {
        let dir = tempdir().unwrap();
        let (comparator, a, b) = two_runs(dir.path());

        let (ab, _) = comparator.diff(&a, &b).await.unwrap();
        let (ba, _) = comparator.diff(&b, &a).await.unwrap();
        assert_eq!(ab.added, ba.removed);
        assert_eq!(ab.removed, ba.added);

        let (params, performance) = comparator.diff(&a, &a).await.unwrap();
        assert!(params.is_empty());
        assert!(performance.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_side_names_the_identifier() {
        let dir = tempdir().unwrap();
        let (comparator, a, _) = two_runs(dir.path());

        let error = comparator.diff(&a, "missing-run").await.unwrap_err();
        assert!(matches!(error, TgError::RunNotFound { id } if id == "missing-run"));
    }

    #[tokio::test]
    async fn test_workspace_tag_reads_local_files() {
        let dir = tempdir().unwrap();
        let settings = Settings::with_base_dir(dir.path());
        settings.ensure_dirs().unwrap();
        std::fs::write(settings.params_path(), r#"{"lr": 0.001}"#).unwrap();
        std::fs::write(settings.performance_path(), r#"{"overall": {"f1": 0.7}}"#).unwrap();

        let source = ReleaseSource::new(RemoteClient::new().unwrap(), "someone", "tagifai", &settings);
        let params = source.params(WORKSPACE_TAG).await.unwrap();
        assert_eq!(params, json!({"lr": 0.001}));
        assert_eq!(
            source.performance(WORKSPACE_TAG).await.unwrap()["overall"]["f1"],
            json!(0.7)
        );
        assert_eq!(source.resolve_tag(Some("v0.1")).await.unwrap(), "v0.1");
    }

    #[tokio::test]
    async fn test_release_params_diff_keeps_keys_as_committed() {
        let dir = tempdir().unwrap();
        let settings = Settings::with_base_dir(dir.path());
        settings.ensure_dirs().unwrap();
        let source = ReleaseSource::new(RemoteClient::new().unwrap(), "someone", "tagifai", &settings);

        std::fs::write(settings.params_path(), r#"{"lr": 0.1}"#).unwrap();
        let a = source.params(WORKSPACE_TAG).await.unwrap();
        std::fs::write(settings.params_path(), r#"{"lr": 0.2, "batch": 32, "stem": false}"#).unwrap();
        let b = source.params(WORKSPACE_TAG).await.unwrap();

        let diff = DiffResult::between_values(&a, &b, "A", "B").to_json();
        assert_eq!(diff["added"], json!({"batch": 32, "stem": false}));
        assert_eq!(diff["removed"], json!({}));
        assert_eq!(diff["changed"], json!({"lr": {"A": 0.1, "B": 0.2}}));
    }

    #[tokio::test]
    async fn test_release_file_must_be_a_mapping() {
        let dir = tempdir().unwrap();
        let settings = Settings::with_base_dir(dir.path());
        settings.ensure_dirs().unwrap();
        std::fs::write(settings.params_path(), "[1, 2]").unwrap();

        let source = ReleaseSource::new(RemoteClient::new().unwrap(), "someone", "tagifai", &settings);
        let error = source.params(WORKSPACE_TAG).await.unwrap_err();
        assert!(matches!(error, TgError::Parse { .. }), "{error:?}");
    }
}
