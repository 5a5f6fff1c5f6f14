mod file_config;

pub use file_config::{EntityManifest, FileConfig};

use crate::catalog_store::EntityType;
use crate::merge::{ConfigurationError, CsvIngestor, PolicyConfig, PolicyResolver, Provenance};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use tracing::debug;

/// Settings taken from the command line.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_path: Option<PathBuf>,
    pub source_name: Option<String>,
    pub ingested_at: Option<DateTime<Utc>>,
    /// Defaults to the manifest's directory.
    pub data_dir: Option<PathBuf>,
    /// Restrict the run to these entities. Empty means every manifest entity.
    pub only: Vec<EntityType>,
}

/// One entity batch to merge.
#[derive(Debug, Clone)]
pub struct EntityJob {
    pub entity: EntityType,
    pub file: PathBuf,
    pub columns: Option<Vec<String>>,
    pub delimiter: u8,
    pub policy: PolicyConfig,
}

impl EntityJob {
    pub fn ingestor(&self) -> CsvIngestor {
        CsvIngestor::new(&self.file).with_delimiter(self.delimiter)
    }

    /// Batch columns: the manifest's list, or the CSV header columns this
    /// entity knows about.
    pub fn batch_columns(&self, ingestor: &CsvIngestor) -> Result<Vec<String>> {
        if let Some(columns) = &self.columns {
            return Ok(columns.clone());
        }
        let (known, skipped): (Vec<String>, Vec<String>) = ingestor
            .header_columns()?
            .into_iter()
            .partition(|c| self.entity.column(c).is_some());
        if !skipped.is_empty() {
            debug!("Ignoring CSV columns {:?} for {}", skipped, self.entity);
        }
        Ok(known)
    }
}

#[derive(Debug, Clone)]
pub struct MergeConfig {
    pub db_path: PathBuf,
    pub provenance: Provenance,
    pub source_url: Option<String>,
    /// In dependency order: artists, albums, tracks.
    pub jobs: Vec<EntityJob>,
}

impl MergeConfig {
    /// Combine CLI settings with an optional manifest. TOML values override
    /// CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_path = file
            .db_path
            .map(PathBuf::from)
            .or_else(|| cli.db_path.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_path must be specified via --db or in the manifest")
            })?;

        let source_name = file
            .source_name
            .or_else(|| cli.source_name.clone())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "source_name must be specified via --source-name or in the manifest"
                )
            })?;
        if source_name.trim().is_empty() {
            bail!("source_name must not be empty");
        }

        let ingested_at = match file.ingested_at {
            Some(raw) => DateTime::parse_from_rfc3339(&raw)
                .with_context(|| format!("Invalid ingested_at timestamp: {}", raw))?
                .with_timezone(&Utc),
            None => cli.ingested_at.unwrap_or_else(Utc::now),
        };

        let data_dir = file
            .data_dir
            .map(PathBuf::from)
            .or_else(|| cli.data_dir.clone())
            .unwrap_or_default();

        let mut entities = Vec::with_capacity(file.entities.len());
        for (name, manifest) in file.entities {
            let entity = EntityType::from_table_name(&name)
                .ok_or(ConfigurationError::UnknownEntity(name.clone()))?;
            entities.push((entity, manifest));
        }
        entities.sort_by_key(|(entity, _)| *entity);

        let mut jobs = Vec::with_capacity(entities.len());
        for (entity, manifest) in entities {
            if !cli.only.is_empty() && !cli.only.contains(&entity) {
                continue;
            }
            let file = manifest
                .file
                .map(|f| data_dir.join(f))
                .ok_or_else(|| anyhow::anyhow!("No file given for {}", entity))?;
            let delimiter = match manifest.delimiter {
                None => b',',
                Some(c) if c.is_ascii() => c as u8,
                Some(c) => bail!("Delimiter for {} must be ASCII, got {:?}", entity, c),
            };
            jobs.push(EntityJob {
                entity,
                file,
                columns: manifest.columns,
                delimiter,
                policy: manifest.policy,
            });
        }

        if jobs.is_empty() {
            bail!("Nothing to merge: no entity batches selected");
        }

        Ok(MergeConfig {
            db_path,
            provenance: Provenance::new(source_name, ingested_at),
            source_url: file.source_url,
            jobs,
        })
    }

    /// Validate every job's policy up front.
    pub fn policy_resolver(&self) -> Result<PolicyResolver, ConfigurationError> {
        PolicyResolver::new(self.jobs.iter().map(|job| (job.entity, &job.policy)))
    }
}
