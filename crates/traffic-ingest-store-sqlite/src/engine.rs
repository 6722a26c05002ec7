use std::collections::BTreeSet;
use std::sync::Arc;

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use traffic_ingest_core::{Entity, EntityId, EntityTraffic, IngestError, NaturalKey, TrafficMap};

use crate::resolver::resolve_entity;
use crate::schema::SchemaBootstrapper;
use crate::{minute_text, storage_error, transaction_error, SqliteStore, StorageTarget};

/// Rows per multi-row insert statement; three bound values per row keeps
/// each statement under SQLite's default 999 parameter limit.
const MAX_ROWS_PER_INSERT: usize = 300;

/// Progress of a single `store_traffic` call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IngestState {
    Idle,
    SchemaChecked,
    EntityResolved,
    BatchInserted,
    Committed,
    RolledBack,
}

impl IngestState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::SchemaChecked => "schema_checked",
            Self::EntityResolved => "entity_resolved",
            Self::BatchInserted => "batch_inserted",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrafficReceipt {
    pub entity_id: EntityId,
    pub created_entity: bool,
    pub traffic_records: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestSummary {
    pub entities: usize,
    pub created_entities: usize,
    pub traffic_records: usize,
}

impl IngestSummary {
    fn record(&mut self, receipt: &TrafficReceipt) {
        self.entities += 1;
        if receipt.created_entity {
            self.created_entities += 1;
        }
        self.traffic_records += receipt.traffic_records;
    }
}

/// Persists entities and their traffic into one storage target.
///
/// Cloning is cheap and clones share the schema readiness state, so one
/// engine can be handed to several threads, each with its own
/// [`SqliteStore`].
#[derive(Debug, Clone)]
pub struct IngestionEngine {
    target: StorageTarget,
    schema: Arc<SchemaBootstrapper>,
}

impl IngestionEngine {
    #[must_use]
    pub fn new(target: StorageTarget) -> Self {
        Self { target, schema: Arc::new(SchemaBootstrapper::new()) }
    }

    #[must_use]
    pub fn target(&self) -> &StorageTarget {
        &self.target
    }

    #[must_use]
    pub fn schema(&self) -> &SchemaBootstrapper {
        &self.schema
    }

    /// # Errors
    /// Returns [`IngestError::Connection`] when the target cannot be opened.
    pub fn open_store(&self) -> Result<SqliteStore, IngestError> {
        SqliteStore::open(&self.target)
    }

    /// Create the storage structures ahead of the first ingestion.
    ///
    /// # Errors
    /// Returns [`IngestError::Validation`] when `store` belongs to another
    /// target, or [`IngestError::Schema`] when creation fails.
    pub fn ensure_schema(&self, store: &mut SqliteStore) -> Result<(), IngestError> {
        self.check_store(store)?;
        self.schema.ensure_schema(store)
    }

    /// Readiness is cached per target, so only stores opened on this
    /// engine's target may be used with it.
    fn check_store(&self, store: &SqliteStore) -> Result<(), IngestError> {
        if store.path() != self.target.path.as_path() {
            return Err(IngestError::Validation(format!(
                "store at {} does not belong to engine target {}",
                store.path().display(),
                self.target.path.display()
            )));
        }
        Ok(())
    }

    /// Resolve a natural key to its surrogate id in a transaction of its own.
    ///
    /// # Errors
    /// Returns [`IngestError::Conflict`] when the entity cannot be established,
    /// or the schema, storage, or transaction error that interrupted it.
    pub fn resolve(&self, store: &mut SqliteStore, key: &NaturalKey) -> Result<EntityId, IngestError> {
        key.validate()?;
        self.ensure_schema(store)?;

        let tx = begin_write(store)?;
        match resolve_entity(&tx, key) {
            Ok(resolution) => {
                tx.commit().map_err(transaction_error("failed to commit entity resolution"))?;
                Ok(resolution.id)
            }
            Err(err) => Err(roll_back(tx, err)),
        }
    }

    /// Store one entity's traffic atomically: either the entity row (when
    /// new) and every traffic row are committed, or nothing is.
    ///
    /// # Errors
    /// Returns [`IngestError::Validation`] before touching storage when the
    /// key is blank, two minutes collide after truncation, or `store` was
    /// opened on another target; otherwise the schema, conflict, storage, or
    /// transaction error that caused the rollback.
    pub fn store_traffic(
        &self,
        store: &mut SqliteStore,
        entity: &Entity,
        traffic: &TrafficMap,
    ) -> Result<TrafficReceipt, IngestError> {
        entity.key.validate()?;
        self.check_store(store)?;
        let rows = traffic_rows(traffic)?;

        let mut state = IngestState::Idle;
        if let Err(err) = self.schema.ensure_schema(store) {
            log_rolled_back(&entity.key, state, &err);
            return Err(err);
        }
        state = IngestState::SchemaChecked;
        tracing::debug!(entity = %entity.key, state = state.as_str(), "ingest transition");

        let tx = match begin_write(store) {
            Ok(tx) => tx,
            Err(err) => {
                log_rolled_back(&entity.key, state, &err);
                return Err(err);
            }
        };

        match write_traffic(&tx, &entity.key, &rows, &mut state) {
            Ok(receipt) => {
                if let Err(err) = tx.commit() {
                    let err = IngestError::Transaction(format!(
                        "failed to commit traffic for {}: {err}",
                        entity.key
                    ));
                    log_rolled_back(&entity.key, state, &err);
                    return Err(err);
                }
                tracing::debug!(
                    entity = %entity.key,
                    entity_id = %receipt.entity_id,
                    traffic_records = receipt.traffic_records,
                    state = IngestState::Committed.as_str(),
                    "ingest transition"
                );
                Ok(receipt)
            }
            Err(err) => {
                log_rolled_back(&entity.key, state, &err);
                Err(roll_back(tx, err))
            }
        }
    }

    /// Store every entity in order, each in its own transaction. Stops at
    /// the first failure; entities committed before it stay committed.
    ///
    /// # Errors
    /// Returns the first entity's failure unchanged.
    pub fn store_all(
        &self,
        store: &mut SqliteStore,
        batches: &[EntityTraffic],
    ) -> Result<IngestSummary, IngestError> {
        let mut summary = IngestSummary::default();

        for (index, batch) in batches.iter().enumerate() {
            match self.store_traffic(store, &batch.entity, &batch.traffic) {
                Ok(receipt) => summary.record(&receipt),
                Err(err) => {
                    tracing::warn!(
                        index,
                        committed = summary.entities,
                        remaining = batches.len() - index,
                        error = %err,
                        "ingestion aborted"
                    );
                    return Err(err);
                }
            }
        }

        tracing::info!(
            entities = summary.entities,
            created_entities = summary.created_entities,
            traffic_records = summary.traffic_records,
            "ingestion complete"
        );
        Ok(summary)
    }
}

fn begin_write(store: &mut SqliteStore) -> Result<Transaction<'_>, IngestError> {
    store
        .conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(transaction_error("failed to start write transaction"))
}

/// Roll back explicitly so a failing rollback is reported instead of being
/// swallowed by `Drop`.
fn roll_back(tx: Transaction<'_>, cause: IngestError) -> IngestError {
    match tx.rollback() {
        Ok(()) => cause,
        Err(err) => IngestError::Transaction(format!("rollback failed after \"{cause}\": {err}")),
    }
}

fn log_rolled_back(key: &NaturalKey, from: IngestState, err: &IngestError) {
    tracing::warn!(
        entity = %key,
        from = from.as_str(),
        state = IngestState::RolledBack.as_str(),
        error = %err,
        "ingest transition"
    );
}

fn traffic_rows(traffic: &TrafficMap) -> Result<Vec<(String, u32)>, IngestError> {
    let mut seen = BTreeSet::new();
    let mut rows = Vec::with_capacity(traffic.len());
    for (minute, load) in traffic {
        let text = minute_text(*minute)?;
        if !seen.insert(text.clone()) {
            return Err(IngestError::Validation(format!(
                "traffic contains more than one value for minute {text}"
            )));
        }
        rows.push((text, *load));
    }
    Ok(rows)
}

fn write_traffic(
    tx: &Transaction<'_>,
    key: &NaturalKey,
    rows: &[(String, u32)],
    state: &mut IngestState,
) -> Result<TrafficReceipt, IngestError> {
    let resolution = resolve_entity(tx, key)?;
    *state = IngestState::EntityResolved;
    tracing::debug!(
        entity = %key,
        entity_id = %resolution.id,
        created = resolution.created,
        state = state.as_str(),
        "ingest transition"
    );

    let inserted = insert_traffic_batch(tx, resolution.id, rows)?;
    *state = IngestState::BatchInserted;
    tracing::debug!(entity = %key, inserted, state = state.as_str(), "ingest transition");

    Ok(TrafficReceipt {
        entity_id: resolution.id,
        created_entity: resolution.created,
        traffic_records: inserted,
    })
}

fn insert_traffic_batch(
    tx: &Transaction<'_>,
    entity_id: EntityId,
    rows: &[(String, u32)],
) -> Result<usize, IngestError> {
    let mut inserted = 0;

    for chunk in rows.chunks(MAX_ROWS_PER_INSERT) {
        let mut sql = String::from("INSERT INTO traffic(minute, loaded_bytes, entity_id) VALUES ");
        let mut values = Vec::with_capacity(chunk.len() * 3);
        for (index, (minute, load)) in chunk.iter().enumerate() {
            if index > 0 {
                sql.push_str(", ");
            }
            let base = index * 3;
            sql.push_str(&format!("(?{}, ?{}, ?{})", base + 1, base + 2, base + 3));
            values.push(Value::Text(minute.clone()));
            values.push(Value::Integer(i64::from(*load)));
            values.push(Value::Integer(entity_id.0));
        }

        let mut stmt =
            tx.prepare_cached(&sql).map_err(storage_error("failed to prepare traffic insert"))?;
        inserted += stmt
            .execute(params_from_iter(values.iter()))
            .map_err(storage_error("failed to insert traffic batch"))?;
    }

    Ok(inserted)
}
