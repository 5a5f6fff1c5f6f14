//! Run-scoped staging tables and the ingestors that fill them.
//!
//! A staging table is a connection-local `TEMP` table named after its entity.
//! It is recreated when a run starts and dropped when the handle goes away, so
//! two runs on different connections never see each other's rows.

use super::error::{ConfigurationError, MergeError, StagingError};
use super::sql;
use crate::catalog_store::{BatchColumn, EntityType, IdentifierKind, ValueType};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub struct StagingTable<'c> {
    conn: &'c Connection,
    entity: EntityType,
    name: String,
    columns: Vec<&'static BatchColumn>,
}

impl<'c> StagingTable<'c> {
    /// Drop any leftover staging table for `entity` on this connection and
    /// create an empty one with exactly `columns`.
    pub fn create<S: AsRef<str>>(
        conn: &'c Connection,
        entity: EntityType,
        columns: &[S],
    ) -> Result<Self, MergeError> {
        let mut resolved: Vec<&'static BatchColumn> = Vec::with_capacity(columns.len());
        let mut seen = HashSet::new();
        for name in columns {
            let name = name.as_ref();
            let column = entity
                .column(name)
                .ok_or_else(|| ConfigurationError::UnknownColumn {
                    entity,
                    column: name.to_string(),
                })?;
            if !seen.insert(column.name) {
                return Err(ConfigurationError::DuplicateColumn {
                    entity,
                    column: name.to_string(),
                }
                .into());
            }
            resolved.push(column);
        }

        let name = format!("staging_{}", entity.table_name());
        let definitions = resolved
            .iter()
            .map(|c| format!("{} {}", c.name, c.value_type.sql_type().as_sql()))
            .collect::<Vec<_>>()
            .join(", ");

        conn.execute(&format!("DROP TABLE IF EXISTS temp.{name}"), [])?;
        conn.execute(&format!("CREATE TEMP TABLE {name} ({definitions})"), [])?;
        debug!("Created staging table {} ({})", name, definitions);

        Ok(StagingTable {
            conn,
            entity,
            name,
            columns: resolved,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entity(&self) -> EntityType {
        self.entity
    }

    pub fn connection(&self) -> &'c Connection {
        self.conn
    }

    pub fn columns(&self) -> &[&'static BatchColumn] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&'static str> {
        self.columns.iter().map(|c| c.name).collect()
    }

    pub fn row_count(&self) -> rusqlite::Result<usize> {
        let n: i64 = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", self.name), [], |r| {
                r.get(0)
            })?;
        Ok(n as usize)
    }

    /// Rows where every identifier in `keys` is null or empty.
    pub fn excluded_count(&self, keys: &[IdentifierKind]) -> rusqlite::Result<usize> {
        let n: i64 = self.conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {} s WHERE {} IS NULL",
                self.name,
                sql::identity("s", keys)
            ),
            [],
            |r| r.get(0),
        )?;
        Ok(n as usize)
    }

    /// Rows a merge keyed on `keys` acts on.
    pub fn effective_count(&self, keys: &[IdentifierKind]) -> rusqlite::Result<usize> {
        let n: i64 = self.conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM ({})",
                sql::effective_rows(&self.name, keys)
            ),
            [],
            |r| r.get(0),
        )?;
        Ok(n as usize)
    }

    /// Fill the table through `ingestor`. The load commits on its own, before
    /// any merge transaction opens.
    pub fn load(&self, ingestor: &mut dyn StagingIngestor) -> Result<usize, StagingError> {
        let loaded = ingestor.load(self)?;
        info!("Loaded {} rows into {}", loaded, self.name);
        Ok(loaded)
    }

    /// Insert rows aligned with [`StagingTable::columns`] in one transaction.
    pub fn insert_rows<I>(&self, rows: I) -> Result<usize, StagingError>
    where
        I: IntoIterator<Item = Vec<Value>>,
    {
        let placeholders = vec!["?"; self.columns.len()].join(", ");
        let tx = self.conn.unchecked_transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {} ({}) VALUES ({})",
                self.name,
                self.column_names().join(", "),
                placeholders
            ))?;
            for (row_number, row) in rows.into_iter().enumerate() {
                if row.len() != self.columns.len() {
                    return Err(StagingError::RowWidth {
                        row: row_number + 1,
                        found: row.len(),
                        expected: self.columns.len(),
                    });
                }
                stmt.execute(params_from_iter(row))?;
                inserted += 1;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }
}

impl Drop for StagingTable<'_> {
    fn drop(&mut self) {
        if let Err(e) = self
            .conn
            .execute(&format!("DROP TABLE IF EXISTS temp.{}", self.name), [])
        {
            warn!("Failed to drop staging table {}: {}", self.name, e);
        }
    }
}

/// Parse one raw text field for `column`. Empty fields are NULL.
pub fn parse_field(column: &BatchColumn, raw: &str, row: usize) -> Result<Value, StagingError> {
    if raw.is_empty() {
        return Ok(Value::Null);
    }
    let invalid = || StagingError::InvalidValue {
        row,
        column: column.name.to_string(),
        value: raw.to_string(),
    };
    match column.value_type {
        ValueType::Text | ValueType::TextList => Ok(Value::Text(raw.to_string())),
        ValueType::Integer => raw
            .trim()
            .parse::<i64>()
            .map(Value::Integer)
            .map_err(|_| invalid()),
        ValueType::Bool => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "t" | "1" | "yes" | "y" => Ok(Value::Integer(1)),
            "false" | "f" | "0" | "no" | "n" => Ok(Value::Integer(0)),
            _ => Err(invalid()),
        },
    }
}

// =============================================================================
// Ingestors
// =============================================================================

/// Loads one batch into a freshly created staging table.
pub trait StagingIngestor {
    fn load(&mut self, staging: &StagingTable<'_>) -> Result<usize, StagingError>;
}

/// In-memory rows, aligned with the staging columns.
#[derive(Debug, Clone, Default)]
pub struct RowsIngestor {
    rows: Vec<Vec<Value>>,
}

impl RowsIngestor {
    pub fn new(rows: Vec<Vec<Value>>) -> Self {
        RowsIngestor { rows }
    }
}

impl StagingIngestor for RowsIngestor {
    fn load(&mut self, staging: &StagingTable<'_>) -> Result<usize, StagingError> {
        staging.insert_rows(std::mem::take(&mut self.rows))
    }
}

/// CSV file with a header row. Columns are matched by header name; extra CSV
/// columns are ignored.
#[derive(Debug, Clone)]
pub struct CsvIngestor {
    path: PathBuf,
    delimiter: u8,
}

impl CsvIngestor {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        CsvIngestor {
            path: path.as_ref().to_path_buf(),
            delimiter: b',',
        }
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    fn csv_error(&self, source: csv::Error) -> StagingError {
        StagingError::Csv {
            path: self.path.display().to_string(),
            source,
        }
    }

    fn reader(&self) -> Result<csv::Reader<std::fs::File>, StagingError> {
        csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(true)
            .from_path(&self.path)
            .map_err(|e| self.csv_error(e))
    }

    /// Column names in the CSV header.
    pub fn header_columns(&self) -> Result<Vec<String>, StagingError> {
        let mut reader = self.reader()?;
        let headers = reader.headers().map_err(|e| self.csv_error(e))?;
        Ok(headers.iter().map(|h| h.trim().to_string()).collect())
    }
}

impl StagingIngestor for CsvIngestor {
    fn load(&mut self, staging: &StagingTable<'_>) -> Result<usize, StagingError> {
        let mut reader = self.reader()?;
        let headers = reader.headers().map_err(|e| self.csv_error(e))?.clone();

        let mut positions = Vec::with_capacity(staging.columns().len());
        for column in staging.columns() {
            let position = headers
                .iter()
                .position(|h| h.trim() == column.name)
                .ok_or_else(|| StagingError::MissingCsvColumn {
                    path: self.path.display().to_string(),
                    column: column.name.to_string(),
                })?;
            positions.push(position);
        }

        let mut rows = Vec::new();
        for (index, record) in reader.records().enumerate() {
            let record = record.map_err(|e| self.csv_error(e))?;
            let row_number = index + 1;
            let mut row = Vec::with_capacity(positions.len());
            for (column, position) in staging.columns().iter().zip(&positions) {
                let raw = record.get(*position).unwrap_or("");
                row.push(parse_field(column, raw, row_number)?);
            }
            rows.push(row);
        }
        staging.insert_rows(rows)
    }
}
