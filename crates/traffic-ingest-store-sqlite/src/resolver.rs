use rusqlite::{params, Connection, OptionalExtension};
use traffic_ingest_core::{EntityId, IngestError, NaturalKey};

use crate::{now_rfc3339, storage_error};

/// Outcome of resolving one natural key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Resolution {
    pub(crate) id: EntityId,
    pub(crate) created: bool,
}

/// Map a natural key to its surrogate id, inserting the row on first sight.
///
/// Runs inside the caller's write transaction. The insert defers to the
/// natural-key uniqueness constraint and is followed by exactly one re-read;
/// a miss on that re-read is a conflict, never a retry.
pub(crate) fn resolve_entity(
    conn: &Connection,
    key: &NaturalKey,
) -> Result<Resolution, IngestError> {
    if let Some(id) = find_entity_id(conn, key)? {
        return Ok(Resolution { id, created: false });
    }

    let inserted = conn
        .execute(
            "INSERT INTO entities(first_name, last_name, city, address, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(first_name, last_name, city, address) DO NOTHING",
            params![key.first_name, key.last_name, key.city, key.address, now_rfc3339()?],
        )
        .map_err(storage_error("failed to insert entity"))?;

    match find_entity_id(conn, key)? {
        Some(id) => {
            tracing::debug!(entity_id = %id, created = inserted == 1, "entity resolved after insert");
            Ok(Resolution { id, created: inserted == 1 })
        }
        None => Err(IngestError::Conflict(format!(
            "entity {key} is not readable after its insert"
        ))),
    }
}

pub(crate) fn find_entity_id(
    conn: &Connection,
    key: &NaturalKey,
) -> Result<Option<EntityId>, IngestError> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT id FROM entities
             WHERE first_name = ?1 AND last_name = ?2 AND city = ?3 AND address = ?4",
        )
        .map_err(storage_error("failed to prepare entity lookup"))?;

    let id = stmt
        .query_row(params![key.first_name, key.last_name, key.city, key.address], |row| {
            row.get::<_, i64>(0)
        })
        .optional()
        .map_err(storage_error("failed to look up entity"))?;

    Ok(id.map(EntityId))
}
