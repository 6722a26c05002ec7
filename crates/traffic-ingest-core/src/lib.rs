use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

mod identity;
mod params;
mod time_grid;
mod traffic;

pub use identity::{draw_distinct, IdentitySource, SeededIdentitySource, MAX_ENTITY_COUNT};
pub use params::{parse_view_date, IngestParams, MAX_PLANNED_RECORDS};
pub use time_grid::{minute_count, truncate_to_minute, TimeGrid, MAX_GRID_POINTS};
pub use traffic::{
    GeneratorConfig, TrafficGenerator, UniformTrafficGenerator, DEFAULT_MAX_LOAD_BYTES,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum IngestError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("schema error: {0}")]
    Schema(String),
    #[error("conflict error: {0}")]
    Conflict(String),
    #[error("transaction error: {0}")]
    Transaction(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl IngestError {
    /// Stable machine-readable name of the error kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Connection(_) => "connection",
            Self::Schema(_) => "schema",
            Self::Conflict(_) => "conflict",
            Self::Transaction(_) => "transaction",
            Self::Storage(_) => "storage",
        }
    }
}

/// Per-minute load in bytes, keyed by minute.
pub type TrafficMap = BTreeMap<OffsetDateTime, u32>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EntityId(pub i64);

impl Display for EntityId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Attributes that identify a subscriber in the real world.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NaturalKey {
    pub first_name: String,
    pub last_name: String,
    pub city: String,
    pub address: String,
}

impl NaturalKey {
    #[must_use]
    pub fn new(
        first_name: impl Into<String>,
        last_name: impl Into<String>,
        city: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            first_name: first_name.into(),
            last_name: last_name.into(),
            city: city.into(),
            address: address.into(),
        }
    }

    /// Reject keys with blank attributes.
    ///
    /// # Errors
    /// Returns [`IngestError::Validation`] naming the first blank attribute.
    pub fn validate(&self) -> Result<(), IngestError> {
        for (field, value) in [
            ("first_name", &self.first_name),
            ("last_name", &self.last_name),
            ("city", &self.city),
            ("address", &self.address),
        ] {
            if value.trim().is_empty() {
                return Err(IngestError::Validation(format!("{field} MUST NOT be blank")));
            }
        }
        Ok(())
    }
}

impl Display for NaturalKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}, {}, {}", self.first_name, self.last_name, self.city, self.address)
    }
}

/// A subscriber. Identity is the natural key; the surrogate id is only
/// known once the store has resolved it and never takes part in equality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub key: NaturalKey,
    pub id: Option<EntityId>,
}

impl Entity {
    #[must_use]
    pub fn new(key: NaturalKey) -> Self {
        Self { key, id: None }
    }

    #[must_use]
    pub fn with_id(mut self, id: EntityId) -> Self {
        self.id = Some(id);
        self
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Entity {}

impl Hash for Entity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

/// One entity together with the traffic to persist for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityTraffic {
    pub entity: Entity,
    pub traffic: TrafficMap,
}

/// A persisted traffic row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct TrafficRecord {
    pub entity_id: EntityId,
    #[serde(with = "time::serde::rfc3339")]
    pub minute: OffsetDateTime,
    pub loaded_bytes: u32,
}

/// Discretize the requested interval once, draw distinct entities, and assign
/// each of them its own traffic over the shared grid.
///
/// # Errors
/// Returns [`IngestError::Validation`] when the interval is inverted, the run
/// exceeds the planning limits, or the identity source cannot supply enough
/// distinct entities.
pub fn plan_batches<I, G>(
    params: &IngestParams,
    identities: &mut I,
    generator: &mut G,
) -> Result<Vec<EntityTraffic>, IngestError>
where
    I: IdentitySource + ?Sized,
    G: TrafficGenerator + ?Sized,
{
    params.check_limits()?;
    let grid = TimeGrid::discretize(params.start, params.end)?;
    let entities = draw_distinct(identities, params.entity_count)?;

    Ok(entities
        .into_iter()
        .map(|entity| {
            let traffic = generator.assign(grid.points());
            EntityTraffic { entity, traffic }
        })
        .collect())
}
