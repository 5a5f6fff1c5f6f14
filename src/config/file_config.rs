use crate::merge::PolicyConfig;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

/// A dataset manifest: where a source's CSV files are and how each of its
/// entity batches merges into the catalog.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_path: Option<String>,
    pub source_name: Option<String>,
    /// RFC 3339 timestamp recorded as the ingestion time of every row.
    pub ingested_at: Option<String>,
    /// Base directory for relative entity `file` paths.
    pub data_dir: Option<String>,
    pub source_url: Option<String>,

    /// Keyed by table name: `artists`, `albums`, `tracks`.
    pub entities: BTreeMap<String, EntityManifest>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct EntityManifest {
    pub file: Option<String>,
    /// Batch columns to stage. Defaults to the CSV header.
    pub columns: Option<Vec<String>>,
    pub delimiter: Option<char>,
    pub policy: PolicyConfig,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse manifest: {:?}", path))
    }
}
