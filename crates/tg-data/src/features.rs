//! Feature computation and the offline feature store.
//!
//! Features are derived from the raw project dump and the tag catalogue and
//! written to a single JSON file. The offline store answers point-in-time
//! queries against that file.

use chrono::NaiveDateTime;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::path::Path;

use tg_types::{TgError, TgResult};

use crate::fsio::write_json_atomic;

/// Label substituted for tags outside the catalogue or below `min_freq`
pub const OTHER_TAG: &str = "other";

const TIMESTAMP_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"];

pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw.trim(), format).ok())
}

fn de_timestamp<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDateTime, D::Error> {
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp '{raw}'")))
}

/// One entry of the raw project dump
#[derive(Debug, Clone, Deserialize)]
pub struct Project {
    pub id: u64,
    #[serde(deserialize_with = "de_timestamp")]
    pub created_on: NaiveDateTime,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// One entry of the tag catalogue
#[derive(Debug, Clone, Deserialize)]
pub struct TagInfo {
    pub tag: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub parents: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub id: u64,
    #[serde(deserialize_with = "de_timestamp")]
    pub created_on: NaiveDateTime,
    pub text: String,
    pub tags: Vec<String>,
}

/// Build feature rows from projects and the tag catalogue.
///
/// `text` is the title and description joined by a space. Tags outside the
/// catalogue, then tags occurring fewer than `min_freq` times, are replaced
/// by [`OTHER_TAG`]; each row keeps a tag at most once.
pub fn compute_features(projects: &[Project], catalogue: &[TagInfo], min_freq: u32) -> Vec<FeatureRow> {
    let known: HashSet<&str> = catalogue.iter().map(|t| t.tag.as_str()).collect();

    let in_catalogue: Vec<Vec<String>> = projects
        .iter()
        .map(|p| {
            p.tags
                .iter()
                .map(|tag| {
                    if known.contains(tag.as_str()) {
                        tag.clone()
                    } else {
                        OTHER_TAG.to_string()
                    }
                })
                .collect()
        })
        .collect();

    let mut counts: BTreeMap<&str, u32> = BTreeMap::new();
    for tags in &in_catalogue {
        for tag in tags {
            *counts.entry(tag.as_str()).or_default() += 1;
        }
    }

    projects
        .iter()
        .zip(&in_catalogue)
        .map(|(project, tags)| {
            let mut kept: Vec<String> = Vec::with_capacity(tags.len());
            for tag in tags {
                let tag = if counts.get(tag.as_str()).copied().unwrap_or(0) < min_freq {
                    OTHER_TAG
                } else {
                    tag.as_str()
                };
                if !kept.iter().any(|k| k == tag) {
                    kept.push(tag.to_string());
                }
            }
            FeatureRow {
                id: project.id,
                created_on: project.created_on,
                text: format!("{} {}", project.title, project.description),
                tags: kept,
            }
        })
        .collect()
}

fn read_list<T: serde::de::DeserializeOwned>(path: &Path) -> TgResult<Vec<T>> {
    let raw = std::fs::read_to_string(path)?;
    serde_json::from_str(&raw).map_err(|e| TgError::parse(path.display(), e))
}

/// Read `projects_path` and `tags_path`, compute features and write them to
/// `features_path`. Returns the number of rows written.
pub fn compute_features_from_files(
    projects_path: &Path,
    tags_path: &Path,
    features_path: &Path,
    min_freq: u32,
) -> TgResult<usize> {
    let projects: Vec<Project> = read_list(projects_path)?;
    let catalogue: Vec<TagInfo> = read_list(tags_path)?;
    let rows = compute_features(&projects, &catalogue, min_freq);

    if let Some(parent) = features_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    write_json_atomic(features_path, &rows)?;
    tracing::info!(
        "Computed {} feature rows from {} catalogue tags",
        rows.len(),
        catalogue.len()
    );
    Ok(rows.len())
}

/// Read a features file written by [`compute_features_from_files`].
pub fn load_features(path: &Path) -> TgResult<Vec<FeatureRow>> {
    read_list(path)
}

/// An entity to look up as of a point in time
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntityRow {
    pub id: u64,
    pub event_timestamp: NaiveDateTime,
}

/// Lookup result; features are `None` when no row existed at the timestamp
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoricalFeatures {
    pub id: u64,
    pub event_timestamp: NaiveDateTime,
    pub text: Option<String>,
    pub tags: Option<Vec<String>>,
}

pub trait FeatureStore: Send + Sync + std::fmt::Debug {
    /// For each entity, the latest row with `created_on <= event_timestamp`.
    fn get_historical_features(&self, entities: &[EntityRow]) -> TgResult<Vec<HistoricalFeatures>>;
}

/// File-backed store over a computed features file
#[derive(Debug)]
pub struct OfflineFeatureStore {
    rows: Vec<FeatureRow>,
}

impl OfflineFeatureStore {
    pub fn open<P: AsRef<Path>>(source: P) -> TgResult<Self> {
        Ok(Self {
            rows: load_features(source.as_ref())?,
        })
    }

    pub fn from_rows(rows: Vec<FeatureRow>) -> Self {
        Self { rows }
    }
}

impl FeatureStore for OfflineFeatureStore {
    fn get_historical_features(&self, entities: &[EntityRow]) -> TgResult<Vec<HistoricalFeatures>> {
        Ok(entities
            .iter()
            .map(|entity| {
                let latest = self
                    .rows
                    .iter()
                    .filter(|row| row.id == entity.id && row.created_on <= entity.event_timestamp)
                    .max_by_key(|row| row.created_on);
                HistoricalFeatures {
                    id: entity.id,
                    event_timestamp: entity.event_timestamp,
                    text: latest.map(|row| row.text.clone()),
                    tags: latest.map(|row| row.tags.clone()),
                }
            })
            .collect())
    }
}

/// Write lookup results as CSV with an `id,event_timestamp,text,tags` header.
pub fn write_csv<W: Write>(rows: &[HistoricalFeatures], writer: W) -> TgResult<()> {
    let csv_err = |e: csv::Error| TgError::Internal(format!("csv output failed: {e}"));

    let mut out = csv::Writer::from_writer(writer);
    out.write_record(["id", "event_timestamp", "text", "tags"])
        .map_err(csv_err)?;
    for row in rows {
        let tags = row.tags.as_ref().map(|t| t.join(",")).unwrap_or_default();
        out.write_record([
            row.id.to_string(),
            row.event_timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
            row.text.clone().unwrap_or_default(),
            tags,
        ])
        .map_err(csv_err)?;
    }
    out.flush()?;
    Ok(())
}
