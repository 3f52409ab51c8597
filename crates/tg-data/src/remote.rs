//! HTTP access to the tag catalogue and to published releases.

use reqwest::StatusCode;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use tg_types::{TgError, TgResult};

use crate::fsio::write_json_atomic;

pub const TAGS_URL: &str =
    "https://raw.githubusercontent.com/GokuMohandas/MadeWithML/main/datasets/tags.json";

const API_BASE: &str = "https://api.github.com";
const RAW_BASE: &str = "https://raw.githubusercontent.com";
const USER_AGENT: &str = concat!("tagifai/", env!("CARGO_PKG_VERSION"));

/// Thin JSON client shared by the catalogue download and release lookups
#[derive(Debug, Clone)]
pub struct RemoteClient {
    client: reqwest::Client,
    api_base: String,
    raw_base: String,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

impl RemoteClient {
    pub fn new() -> TgResult<Self> {
        Self::with_bases(API_BASE, RAW_BASE)
    }

    /// Client against alternative API and raw-content hosts.
    pub fn with_bases(api_base: &str, raw_base: &str) -> TgResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| TgError::Http(format!("failed to build client: {e}")))?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            raw_base: raw_base.trim_end_matches('/').to_string(),
        })
    }

    /// GET `url` as JSON; `None` on 404.
    pub async fn get_json_opt(&self, url: &str) -> TgResult<Option<serde_json::Value>> {
        tracing::debug!("GET {url}");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| TgError::Http(format!("request to {url} failed: {e}")))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => response
                .json()
                .await
                .map(Some)
                .map_err(|e| TgError::Http(format!("invalid JSON from {url}: {e}"))),
            status => Err(TgError::Http(format!("{url} returned {status}"))),
        }
    }

    pub async fn get_json(&self, url: &str) -> TgResult<serde_json::Value> {
        self.get_json_opt(url)
            .await?
            .ok_or_else(|| TgError::Http(format!("{url} returned 404 Not Found")))
    }

    /// Fetch the tag catalogue and store it at `destination`.
    pub async fn download_auxiliary_data(&self, url: &str, destination: &Path) -> TgResult<PathBuf> {
        let tags = self.get_json(url).await?;
        if !tags.is_array() {
            return Err(TgError::Validation(format!(
                "expected a list of tags from {url}"
            )));
        }
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)?;
        }
        write_json_atomic(destination, &tags)?;
        tracing::info!("Saved auxiliary data to {}", destination.display());
        Ok(destination.to_path_buf())
    }

    /// Name of the most recent release tag.
    pub async fn latest_tag(&self, author: &str, repo: &str) -> TgResult<String> {
        let url = format!("{}/repos/{author}/{repo}/tags", self.api_base);
        let tags = self
            .get_json_opt(&url)
            .await?
            .ok_or_else(|| TgError::run_not_found(format!("{author}/{repo}")))?;
        let tags: Vec<TagEntry> = serde_json::from_value(tags)?;
        tags.into_iter()
            .next()
            .map(|entry| entry.name)
            .ok_or_else(|| TgError::run_not_found(format!("{author}/{repo} has no tags")))
    }

    /// A JSON file of `repo` at `tag`; 404 is `RunNotFound` naming the tag.
    pub async fn release_file(
        &self,
        author: &str,
        repo: &str,
        tag: &str,
        file: &str,
    ) -> TgResult<serde_json::Value> {
        let url = format!("{}/{author}/{repo}/{tag}/{file}", self.raw_base);
        self.get_json_opt(&url)
            .await?
            .ok_or_else(|| TgError::run_not_found(tag))
    }
}
