use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, UtcOffset};
use traffic_ingest_core::{
    truncate_to_minute, Entity, EntityId, IngestError, NaturalKey, TrafficRecord,
};

mod engine;
mod resolver;
mod schema;

pub use engine::{IngestState, IngestSummary, IngestionEngine, TrafficReceipt};
pub use schema::{SchemaBootstrapper, SchemaStatus, LATEST_SCHEMA_VERSION};

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Where an engine keeps its data: a SQLite database file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageTarget {
    pub path: PathBuf,
    pub busy_timeout: Duration,
}

impl StorageTarget {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), busy_timeout: DEFAULT_BUSY_TIMEOUT }
    }

    #[must_use]
    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }
}

pub struct SqliteStore {
    conn: Connection,
    path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open one connection to the target database and configure the runtime
    /// pragmas every writer relies on.
    ///
    /// # Errors
    /// Returns [`IngestError::Connection`] when the database cannot be opened
    /// or configured.
    pub fn open(target: &StorageTarget) -> Result<Self, IngestError> {
        let conn = Connection::open(&target.path).map_err(|err| {
            IngestError::Connection(format!(
                "failed to open sqlite database at {}: {err}",
                target.path.display()
            ))
        })?;

        conn.busy_timeout(target.busy_timeout)
            .map_err(|err| IngestError::Connection(format!("failed to set busy timeout: {err}")))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .map_err(|err| {
            IngestError::Connection(format!("failed to configure sqlite pragmas: {err}"))
        })?;

        Ok(Self { conn, path: target.path.clone() })
    }

    /// Database file this store was opened on.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Report current and target schema versions without creating anything.
    ///
    /// # Errors
    /// Returns [`IngestError::Schema`] when schema metadata cannot be read.
    pub fn schema_status(&self) -> Result<SchemaStatus, IngestError> {
        schema::schema_status(&self.conn)
    }

    /// Look up an entity id by natural key without creating it.
    ///
    /// # Errors
    /// Returns [`IngestError::Storage`] when the lookup fails.
    pub fn find_entity(&self, key: &NaturalKey) -> Result<Option<EntityId>, IngestError> {
        resolver::find_entity_id(&self.conn, key)
    }

    /// # Errors
    /// Returns [`IngestError::Storage`] when the count query fails.
    pub fn count_entities(&self) -> Result<u64, IngestError> {
        count_rows(&self.conn, "entities")
    }

    /// # Errors
    /// Returns [`IngestError::Storage`] when the count query fails.
    pub fn count_traffic(&self) -> Result<u64, IngestError> {
        count_rows(&self.conn, "traffic")
    }

    /// Load all entities in creation order with their surrogate ids.
    ///
    /// # Errors
    /// Returns [`IngestError::Storage`] when rows cannot be read.
    pub fn list_entities(&self) -> Result<Vec<Entity>, IngestError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, first_name, last_name, city, address
                 FROM entities
                 ORDER BY id ASC",
            )
            .map_err(storage_error("failed to prepare entity listing"))?;

        let rows = stmt
            .query_map([], |row| {
                let key = NaturalKey {
                    first_name: row.get(1)?,
                    last_name: row.get(2)?,
                    city: row.get(3)?,
                    address: row.get(4)?,
                };
                Ok(Entity::new(key).with_id(EntityId(row.get(0)?)))
            })
            .map_err(storage_error("failed to list entities"))?;

        let entities = rows
            .collect::<Result<Vec<_>, _>>()
            .map_err(storage_error("failed to decode entity row"))?;
        Ok(entities)
    }

    /// Load one entity's traffic ordered by minute.
    ///
    /// # Errors
    /// Returns [`IngestError::Storage`] when rows cannot be read or decoded.
    pub fn traffic_for_entity(&self, entity_id: EntityId) -> Result<Vec<TrafficRecord>, IngestError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT minute, loaded_bytes
                 FROM traffic
                 WHERE entity_id = ?1
                 ORDER BY minute ASC",
            )
            .map_err(storage_error("failed to prepare traffic listing"))?;

        let mut rows =
            stmt.query(params![entity_id.0]).map_err(storage_error("failed to list traffic"))?;
        let mut records = Vec::new();

        while let Some(row) = rows.next().map_err(storage_error("failed to read traffic row"))? {
            let minute_raw: String = row.get(0).map_err(storage_error("failed to read minute"))?;
            let loaded_bytes: i64 =
                row.get(1).map_err(storage_error("failed to read loaded_bytes"))?;
            records.push(TrafficRecord {
                entity_id,
                minute: parse_rfc3339(&minute_raw)?,
                loaded_bytes: u32::try_from(loaded_bytes).map_err(|_| {
                    IngestError::Storage(format!("loaded_bytes out of range: {loaded_bytes}"))
                })?,
            });
        }

        Ok(records)
    }

    /// Run quick-check, foreign-key-check, and schema status checks.
    ///
    /// # Errors
    /// Returns [`IngestError::Storage`] when any check query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport, IngestError> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .map_err(storage_error("failed to run PRAGMA quick_check"))?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .map_err(storage_error("failed to prepare PRAGMA foreign_key_check"))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ForeignKeyViolation {
                    table: row.get(0)?,
                    rowid: row.get(1)?,
                    parent: row.get(2)?,
                    fk_index: row.get(3)?,
                })
            })
            .map_err(storage_error("failed to run PRAGMA foreign_key_check"))?;
        let foreign_key_violations = rows
            .collect::<Result<Vec<_>, _>>()
            .map_err(storage_error("failed to decode foreign key violation"))?;

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }
}

fn count_rows(conn: &Connection, table: &str) -> Result<u64, IngestError> {
    let count = conn
        .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get::<_, i64>(0))
        .map_err(|err| IngestError::Storage(format!("failed to count rows in {table}: {err}")))?;
    u64::try_from(count)
        .map_err(|_| IngestError::Storage(format!("negative row count in {table}: {count}")))
}

pub(crate) fn storage_error(context: &'static str) -> impl Fn(rusqlite::Error) -> IngestError {
    move |err| IngestError::Storage(format!("{context}: {err}"))
}

pub(crate) fn schema_error(context: &'static str) -> impl Fn(rusqlite::Error) -> IngestError {
    move |err| IngestError::Schema(format!("{context}: {err}"))
}

pub(crate) fn transaction_error(context: &'static str) -> impl Fn(rusqlite::Error) -> IngestError {
    move |err| IngestError::Transaction(format!("{context}: {err}"))
}

pub(crate) fn now_rfc3339() -> Result<String, IngestError> {
    rfc3339(OffsetDateTime::now_utc())
}

pub(crate) fn rfc3339(value: OffsetDateTime) -> Result<String, IngestError> {
    value
        .format(&Rfc3339)
        .map_err(|err| IngestError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

/// Canonical stored form of a traffic minute: UTC, truncated to the minute.
pub(crate) fn minute_text(value: OffsetDateTime) -> Result<String, IngestError> {
    rfc3339(truncate_to_minute(value.to_offset(UtcOffset::UTC)))
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime, IngestError> {
    OffsetDateTime::parse(value, &Rfc3339)
        .map_err(|err| IngestError::Storage(format!("invalid RFC3339 timestamp {value}: {err}")))
}
