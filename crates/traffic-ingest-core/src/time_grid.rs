use time::{Duration, OffsetDateTime};

use crate::IngestError;

const MINUTE_NANOS: i128 = 60_000_000_000;

/// Largest grid one interval may produce: two leap years of minutes.
pub const MAX_GRID_POINTS: usize = 2 * 366 * 24 * 60;

/// Minute-spaced instants covering `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeGrid {
    points: Vec<OffsetDateTime>,
}

impl TimeGrid {
    /// Split `[start, end)` into instants exactly one minute apart, beginning
    /// at `start`.
    ///
    /// # Errors
    /// Returns [`IngestError::Validation`] when `start` is after `end` or the
    /// interval spans more than [`MAX_GRID_POINTS`] minutes.
    pub fn discretize(start: OffsetDateTime, end: OffsetDateTime) -> Result<Self, IngestError> {
        if start > end {
            return Err(IngestError::Validation(format!(
                "interval start {start} goes after end {end}"
            )));
        }

        let mut points = Vec::with_capacity(checked_minute_count(start, end)?);
        let mut current = start;
        while current < end {
            points.push(current);
            match current.checked_add(Duration::MINUTE) {
                Some(next) => current = next,
                None => break,
            }
        }

        Ok(Self { points })
    }

    #[must_use]
    pub fn points(&self) -> &[OffsetDateTime] {
        &self.points
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    #[must_use]
    pub fn into_points(self) -> Vec<OffsetDateTime> {
        self.points
    }
}

/// Number of grid points for `[start, end)`: `ceil((end - start) / 60s)`,
/// zero for empty or inverted intervals.
#[must_use]
pub fn minute_count(start: OffsetDateTime, end: OffsetDateTime) -> usize {
    let span = (end - start).whole_nanoseconds();
    if span <= 0 {
        return 0;
    }
    let minutes = (span + MINUTE_NANOS - 1) / MINUTE_NANOS;
    usize::try_from(minutes).unwrap_or(usize::MAX)
}

/// [`minute_count`], rejected above [`MAX_GRID_POINTS`].
pub(crate) fn checked_minute_count(
    start: OffsetDateTime,
    end: OffsetDateTime,
) -> Result<usize, IngestError> {
    let count = minute_count(start, end);
    if count > MAX_GRID_POINTS {
        return Err(IngestError::Validation(format!(
            "interval {start} .. {end} spans {count} minutes, above the limit of {MAX_GRID_POINTS}"
        )));
    }
    Ok(count)
}

/// Drop seconds and sub-second precision.
#[must_use]
pub fn truncate_to_minute(value: OffsetDateTime) -> OffsetDateTime {
    value
        - Duration::seconds(i64::from(value.second()))
        - Duration::nanoseconds(i64::from(value.nanosecond()))
}
