use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use rusqlite::{params, Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use traffic_ingest_core::IngestError;

use crate::{now_rfc3339, schema_error, SqliteStore};

pub const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS entities (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  first_name TEXT NOT NULL,
  last_name TEXT NOT NULL,
  city TEXT NOT NULL,
  address TEXT NOT NULL,
  created_at TEXT NOT NULL,
  UNIQUE(first_name, last_name, city, address)
);

CREATE TABLE IF NOT EXISTS traffic (
  record_id INTEGER PRIMARY KEY AUTOINCREMENT,
  minute TEXT NOT NULL,
  loaded_bytes INTEGER NOT NULL CHECK (loaded_bytes >= 0),
  entity_id INTEGER NOT NULL,
  UNIQUE(entity_id, minute),
  FOREIGN KEY (entity_id) REFERENCES entities(id)
);

CREATE INDEX IF NOT EXISTS idx_traffic_minute ON traffic(minute);
";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

/// Creates the storage structures once per engine.
///
/// Readiness is an atomic flag read on every call. Creation itself is
/// serialised by a lock so concurrent first callers perform a single attempt;
/// a failed attempt leaves the flag unset and the next caller retries.
#[derive(Debug, Default)]
pub struct SchemaBootstrapper {
    ready: AtomicBool,
    attempts: AtomicU64,
    creation: Mutex<()>,
}

impl SchemaBootstrapper {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// How many times creation has actually been attempted.
    #[must_use]
    pub fn creation_attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Ensure the schema exists, doing nothing once it is known to.
    ///
    /// # Errors
    /// Returns [`IngestError::Schema`] when creation fails; readiness stays
    /// false so the next call retries.
    pub fn ensure_schema(&self, store: &mut SqliteStore) -> Result<(), IngestError> {
        if self.is_ready() {
            return Ok(());
        }

        let _guard = self.creation.lock();
        if self.is_ready() {
            return Ok(());
        }

        let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        match apply_schema(&mut store.conn) {
            Ok(()) => {
                self.ready.store(true, Ordering::Release);
                tracing::info!(attempt, version = LATEST_SCHEMA_VERSION, "schema ready");
                Ok(())
            }
            Err(err) => {
                tracing::warn!(attempt, error = %err, "schema bootstrap failed");
                Err(err)
            }
        }
    }
}

fn apply_schema(conn: &mut Connection) -> Result<(), IngestError> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(schema_error("failed to start schema transaction"))?;

    tx.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
        .map_err(schema_error("failed to apply schema_migrations table"))?;

    let version = current_schema_version(&tx)?;
    if version > LATEST_SCHEMA_VERSION {
        return Err(IngestError::Schema(format!(
            "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
        )));
    }

    if version < 1 {
        tx.execute_batch(MIGRATION_001_SQL).map_err(schema_error("failed to apply migration v1"))?;
        record_schema_version(&tx, 1)?;
    }

    tx.commit().map_err(schema_error("failed to commit schema transaction"))?;
    Ok(())
}

pub(crate) fn schema_status(conn: &Connection) -> Result<SchemaStatus, IngestError> {
    let current_version = if table_exists(conn, "schema_migrations")? {
        current_schema_version(conn)?
    } else {
        0
    };
    let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
        ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
    } else {
        Vec::new()
    };

    Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool, IngestError> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .map_err(|err| {
            IngestError::Schema(format!("failed to check if table exists: {table_name}: {err}"))
        })?;
    Ok(exists == 1)
}

fn current_schema_version(conn: &Connection) -> Result<i64, IngestError> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
        row.get::<_, i64>(0)
    })
    .map_err(schema_error("failed to read current schema version"))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<(), IngestError> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .map_err(|err| {
        IngestError::Schema(format!("failed to record migration version {version}: {err}"))
    })?;
    Ok(())
}
