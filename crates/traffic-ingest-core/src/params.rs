use serde::{Deserialize, Serialize};
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

use crate::identity::check_entity_count;
use crate::time_grid::checked_minute_count;
use crate::{IngestError, TimeGrid};

/// Largest number of traffic rows (entities times minutes) one run may plan.
pub const MAX_PLANNED_RECORDS: usize = 10_000_000;

/// `dd.MM.yyyy HH:mm`, interpreted as UTC.
const VIEW_DATE_FORMAT: &[FormatItem<'static>] =
    format_description!("[day].[month].[year] [hour]:[minute]");

/// Validated parameters of one ingestion run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestParams {
    pub entity_count: usize,
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,
}

impl IngestParams {
    /// # Errors
    /// Returns [`IngestError::Validation`] when `entity_count` is zero,
    /// `start` goes after `end`, or the run exceeds the planning limits.
    pub fn new(
        entity_count: usize,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Self, IngestError> {
        if entity_count < 1 {
            return Err(IngestError::Validation("entity count is less than 1".to_string()));
        }
        if start > end {
            return Err(IngestError::Validation("start date goes after end date".to_string()));
        }
        let params = Self { entity_count, start, end };
        params.check_limits()?;
        Ok(params)
    }

    /// Reject runs whose entity count, grid, or total row count would be too
    /// large to plan in memory.
    pub(crate) fn check_limits(&self) -> Result<(), IngestError> {
        check_entity_count(self.entity_count)?;
        let minutes = checked_minute_count(self.start, self.end)?;
        match self.entity_count.checked_mul(minutes) {
            Some(records) if records <= MAX_PLANNED_RECORDS => Ok(()),
            _ => Err(IngestError::Validation(format!(
                "{} entities over {minutes} minutes exceed the limit of {MAX_PLANNED_RECORDS} \
                 traffic records",
                self.entity_count
            ))),
        }
    }

    /// Parse raw text parameters as entered by an operator.
    ///
    /// # Errors
    /// Returns [`IngestError::Validation`] when the count is not an integer
    /// of at least 1, a date does not match `dd.MM.yyyy HH:mm` or names a
    /// nonexistent calendar date, or the interval is inverted.
    pub fn parse(entity_count: &str, start: &str, end: &str) -> Result<Self, IngestError> {
        let count = entity_count.trim().parse::<i64>().map_err(|err| {
            IngestError::Validation(format!("entity count \"{entity_count}\" is not a number: {err}"))
        })?;
        let count = usize::try_from(count)
            .map_err(|_| IngestError::Validation("entity count is less than 1".to_string()))?;

        Self::new(count, parse_view_date(start)?, parse_view_date(end)?)
    }

    /// # Errors
    /// Propagates [`TimeGrid::discretize`] validation.
    pub fn grid(&self) -> Result<TimeGrid, IngestError> {
        TimeGrid::discretize(self.start, self.end)
    }
}

/// Strictly parse `dd.MM.yyyy HH:mm` into a UTC instant.
///
/// # Errors
/// Returns [`IngestError::Validation`] when the text does not match the
/// pattern exactly or is not a real date and time.
pub fn parse_view_date(raw: &str) -> Result<OffsetDateTime, IngestError> {
    if !matches_view_shape(raw) {
        return Err(IngestError::Validation(format!("\"{raw}\" date doesn't match the format")));
    }
    PrimitiveDateTime::parse(raw, VIEW_DATE_FORMAT)
        .map(PrimitiveDateTime::assume_utc)
        .map_err(|err| IngestError::Validation(format!("\"{raw}\" is not a valid date: {err}")))
}

fn matches_view_shape(raw: &str) -> bool {
    const SHAPE: &[u8] = b"dd.dd.dddd dd:dd";
    let bytes = raw.as_bytes();
    bytes.len() == SHAPE.len()
        && bytes.iter().zip(SHAPE).all(|(byte, expected)| match expected {
            b'd' => byte.is_ascii_digit(),
            other => byte == other,
        })
}
