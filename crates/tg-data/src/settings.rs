//! Filesystem layout and environment configuration.

use std::path::{Path, PathBuf};

use tg_types::{TgError, TgResult};

pub const HOME_VAR: &str = "TAGIFAI_HOME";
pub const TRACKING_DIR_VAR: &str = "TAGIFAI_TRACKING_DIR";
pub const AUTHOR_VAR: &str = "TAGIFAI_AUTHOR";
pub const REPO_VAR: &str = "TAGIFAI_REPO";

/// Resolved paths and release coordinates for one command invocation
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub base_dir: PathBuf,
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
    pub features_dir: PathBuf,
    pub tracking_dir: PathBuf,
    pub author: Option<String>,
    pub repo: Option<String>,
}

impl Settings {
    /// Everything derived from `base_dir`, no release coordinates.
    pub fn with_base_dir<P: AsRef<Path>>(base_dir: P) -> Self {
        let base_dir = base_dir.as_ref().to_path_buf();
        Self {
            config_dir: base_dir.join("config"),
            data_dir: base_dir.join("data"),
            features_dir: base_dir.join("features"),
            tracking_dir: base_dir.join("stores").join("model"),
            base_dir,
            author: None,
            repo: None,
        }
    }

    pub fn from_env() -> TgResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Resolve settings through `lookup`; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> TgResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let base_dir = match get(HOME_VAR) {
            Some(home) => PathBuf::from(home),
            None => dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("tagifai"),
        };

        let mut settings = Self::with_base_dir(base_dir);
        if let Some(tracking) = get(TRACKING_DIR_VAR) {
            settings.tracking_dir = PathBuf::from(tracking);
        }
        settings.author = get(AUTHOR_VAR);
        settings.repo = get(REPO_VAR);

        if settings.tracking_dir.as_os_str().is_empty() {
            return Err(TgError::Config("tracking directory is empty".to_string()));
        }
        Ok(settings)
    }

    pub fn params_path(&self) -> PathBuf {
        self.config_dir.join("params.json")
    }

    pub fn projects_path(&self) -> PathBuf {
        self.data_dir.join("projects.json")
    }

    pub fn tags_path(&self) -> PathBuf {
        self.data_dir.join("tags.json")
    }

    pub fn features_path(&self) -> PathBuf {
        self.data_dir.join("features.json")
    }

    /// Local copy of the performance report tracked alongside `params.json`.
    pub fn performance_path(&self) -> PathBuf {
        self.base_dir
            .join("stores")
            .join("model")
            .join("performance.json")
    }

    /// Release coordinates, with explicit values taking precedence.
    pub fn release(&self, author: Option<&str>, repo: Option<&str>) -> TgResult<(String, String)> {
        let author = author
            .map(str::to_string)
            .or_else(|| self.author.clone())
            .ok_or_else(|| TgError::Config(format!("no release author; set {AUTHOR_VAR}")))?;
        let repo = repo
            .map(str::to_string)
            .or_else(|| self.repo.clone())
            .ok_or_else(|| TgError::Config(format!("no release repository; set {REPO_VAR}")))?;
        Ok((author, repo))
    }

    pub fn ensure_dirs(&self) -> TgResult<()> {
        for dir in [
            &self.config_dir,
            &self.data_dir,
            &self.features_dir,
            &self.tracking_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_paths_derive_from_home() {
        let settings = Settings::from_lookup(lookup(&[(HOME_VAR, "/srv/tagifai")])).unwrap();

        assert_eq!(settings.params_path(), PathBuf::from("/srv/tagifai/config/params.json"));
        assert_eq!(settings.tags_path(), PathBuf::from("/srv/tagifai/data/tags.json"));
        assert_eq!(settings.tracking_dir, PathBuf::from("/srv/tagifai/stores/model"));
        assert!(settings.author.is_none());
    }

    #[test]
    fn test_tracking_dir_override_and_blank_values() {
        let settings = Settings::from_lookup(lookup(&[
            (HOME_VAR, "/srv/tagifai"),
            (TRACKING_DIR_VAR, "/mnt/runs"),
            (AUTHOR_VAR, "  "),
        ]))
        .unwrap();

        assert_eq!(settings.tracking_dir, PathBuf::from("/mnt/runs"));
        assert!(settings.author.is_none());
    }

    #[test]
    fn test_release_prefers_explicit_values() {
        let settings = Settings::from_lookup(lookup(&[
            (HOME_VAR, "/srv/tagifai"),
            (AUTHOR_VAR, "env-author"),
            (REPO_VAR, "env-repo"),
        ]))
        .unwrap();

        assert_eq!(
            settings.release(Some("cli-author"), None).unwrap(),
            ("cli-author".to_string(), "env-repo".to_string())
        );
        assert!(Settings::with_base_dir("/x").release(None, None).is_err());
    }

    #[test]
    fn test_ensure_dirs_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::with_base_dir(dir.path());
        settings.ensure_dirs().unwrap();

        assert!(settings.config_dir.is_dir());
        assert!(settings.tracking_dir.is_dir());
    }
}
