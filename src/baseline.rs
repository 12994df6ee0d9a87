//! Baseline windows and calendar grouping of acquisition times.

use crate::error::CubeflowError;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use strum_macros::Display;
use time::OffsetDateTime;

/// Sliding baseline windows over a chronologically sorted sequence.
///
/// Each window holds `window_length` baseline acquisitions followed by the acquisition
/// compared against them, and consecutive windows slide by one. A sequence no longer
/// than `window_length` yields a single window holding the whole sequence.
pub fn generate_baseline<T: Clone>(
    sorted: &[T],
    window_length: usize,
) -> Result<Vec<Vec<T>>, CubeflowError> {
    if window_length == 0 {
        return Err(CubeflowError::invalid_argument(
            "window_length",
            "must be at least 1".to_string(),
        ));
    }
    if sorted.len() <= window_length {
        return Ok(vec![sorted.to_vec()]);
    }
    Ok((0..sorted.len() - window_length)
        .map(|start| sorted[start..=start + window_length].to_vec())
        .collect())
}

/// Calendar units used for grouping.
#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CalendarUnit {
    Year,
    Month,
}

impl CalendarUnit {
    /// The grouping key of a timestamp: the year, or the month number (1-12).
    pub fn key(self, timestamp: &OffsetDateTime) -> i32 {
        match self {
            Self::Year => timestamp.year(),
            Self::Month => u8::from(timestamp.month()) as i32,
        }
    }
}

/// Group timestamps by calendar unit, in key order.
///
/// With a filter, only the listed keys are kept; an empty filter keeps nothing.
pub fn group_by_calendar_unit(
    timestamps: &[OffsetDateTime],
    unit: CalendarUnit,
    filter: Option<&BTreeSet<i32>>,
) -> BTreeMap<i32, Vec<OffsetDateTime>> {
    let mut groups = BTreeMap::<i32, Vec<OffsetDateTime>>::new();
    for timestamp in timestamps {
        let key = unit.key(timestamp);
        if filter.map_or(true, |filter| filter.contains(&key)) {
            groups.entry(key).or_default().push(*timestamp);
        }
    }
    groups
}
