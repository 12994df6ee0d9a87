//! Data types and associated functions and methods

use crate::error::CubeflowError;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum_macros::Display;
use time::{Date, OffsetDateTime};
use uuid::Uuid;
use validator::{Validate, ValidationError};

/// A half-open interval `[min, max)` of a single coordinate axis.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(try_from = "(f64, f64)", into = "(f64, f64)")]
pub struct CoordinateRange {
    min: f64,
    max: f64,
}

impl CoordinateRange {
    /// Returns a new CoordinateRange, failing with [CubeflowError::InvalidRange] unless
    /// `min < max` and both bounds are finite.
    pub fn new(min: f64, max: f64) -> Result<Self, CubeflowError> {
        if !min.is_finite() || !max.is_finite() {
            return Err(CubeflowError::invalid_range(format!(
                "bounds ({}, {}) must be finite",
                min, max
            )));
        }
        if min >= max {
            return Err(CubeflowError::invalid_range(format!(
                "minimum {} is not less than maximum {}",
                min, max
            )));
        }
        Ok(Self { min, max })
    }

    /// Lower bound.
    pub fn min(&self) -> f64 {
        self.min
    }

    /// Upper bound.
    pub fn max(&self) -> f64 {
        self.max
    }

    /// Width of the range.
    pub fn extent(&self) -> f64 {
        self.max - self.min
    }

    /// Whether `value` lies within the closed range.
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

impl TryFrom<(f64, f64)> for CoordinateRange {
    type Error = CubeflowError;

    fn try_from((min, max): (f64, f64)) -> Result<Self, Self::Error> {
        Self::new(min, max)
    }
}

impl TryFrom<&[f64]> for CoordinateRange {
    type Error = CubeflowError;

    fn try_from(bounds: &[f64]) -> Result<Self, Self::Error> {
        match bounds {
            [min, max] => Self::new(*min, *max),
            _ => Err(CubeflowError::invalid_range(format!(
                "expected 2 bounds, got {}",
                bounds.len()
            ))),
        }
    }
}

impl From<CoordinateRange> for (f64, f64) {
    fn from(range: CoordinateRange) -> Self {
        (range.min, range.max)
    }
}

impl std::fmt::Display for CoordinateRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.min, self.max)
    }
}

/// A latitude band of a request, carrying the full request longitude range.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct GeographicChunk {
    pub longitude: CoordinateRange,
    pub latitude: CoordinateRange,
}

/// An ordered, non-empty run of acquisition times.
pub type TimeChunk = Vec<OffsetDateTime>;

/// Position of a chunk within a request's plan.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct ChunkId {
    /// Index into the geographic chunk list
    pub geo: usize,
    /// Index into the temporal chunk list
    pub time: usize,
}

impl std::fmt::Display for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.geo, self.time)
    }
}

/// Transient unit of chunk work owned by the dispatcher.
#[derive(Clone, Debug, PartialEq)]
pub struct ChunkUnit {
    pub request_id: Uuid,
    pub chunk_id: ChunkId,
    pub geographic: GeographicChunk,
    pub time_chunk: TimeChunk,
}

impl ChunkUnit {
    /// Number of scenes (acquisitions) covered by the unit.
    pub fn scene_count(&self) -> u64 {
        self.time_chunk.len() as u64
    }
}

/// Processing status of a request.
///
/// `Pending` is the only initial state; `Ok` and `Error` are terminal.
#[derive(Clone, Copy, Debug, Default, Deserialize, Display, Eq, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum RequestStatus {
    #[default]
    Pending,
    Ok,
    Error,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        self != Self::Pending
    }
}

/// Submission form as received from a client, before canonicalisation.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, Validate)]
#[serde(deny_unknown_fields)]
#[validate(schema(function = "validate_submission"))]
pub struct SubmissionForm {
    /// Satellite platform, e.g. `LANDSAT_8`
    #[validate(length(min = 1, message = "platform must not be empty"))]
    pub platform: String,
    /// Area the request is made against
    #[validate(length(min = 1, message = "area_id must not be empty"))]
    pub area_id: String,
    /// Start date, `YYYY-MM-DD` or `MM/DD/YYYY`
    pub time_start: String,
    /// End date, `YYYY-MM-DD` or `MM/DD/YYYY`
    pub time_end: String,
    #[validate(range(min = -90.0, max = 90.0, message = "latitude must be within [-90, 90]"))]
    pub latitude_min: f64,
    #[validate(range(min = -90.0, max = 90.0, message = "latitude must be within [-90, 90]"))]
    pub latitude_max: f64,
    #[validate(range(
        min = -180.0,
        max = 180.0,
        message = "longitude must be within [-180, 180]"
    ))]
    pub longitude_min: f64,
    #[validate(range(
        min = -180.0,
        max = 180.0,
        message = "longitude must be within [-180, 180]"
    ))]
    pub longitude_max: f64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Application specific fields. Lists are normalised during canonicalisation.
    #[serde(default)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Validate fields of a submission that depend on each other.
fn validate_submission(form: &SubmissionForm) -> Result<(), ValidationError> {
    if form.latitude_min >= form.latitude_max {
        let mut error = ValidationError::new("latitude_min must be less than latitude_max");
        error.add_param("latitude_min".into(), &form.latitude_min);
        error.add_param("latitude_max".into(), &form.latitude_max);
        return Err(error);
    }
    if form.longitude_min >= form.longitude_max {
        let mut error = ValidationError::new("longitude_min must be less than longitude_max");
        error.add_param("longitude_min".into(), &form.longitude_min);
        error.add_param("longitude_max".into(), &form.longitude_max);
        return Err(error);
    }
    Ok(())
}

/// Canonical parameters of a request.
///
/// Every field takes part in the request identity.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct RequestParameters {
    pub application: String,
    pub platform: String,
    pub product: String,
    pub area_id: String,
    pub time_start: Date,
    pub time_end: Date,
    pub latitude: CoordinateRange,
    pub longitude: CoordinateRange,
    pub title: String,
    pub description: String,
    pub extra: BTreeMap<String, String>,
}

/// Processing outcome of a request.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Outcome {
    pub status: RequestStatus,
    /// Human readable status message
    pub message: String,
    /// Flips from false to true exactly once, when the status leaves `PENDING`
    pub complete: bool,
    pub scenes_processed: u64,
    pub total_scenes: u64,
    /// Location of the final artifact, set once after the last merge
    pub result_path: Option<String>,
}

impl Outcome {
    /// Move out of `PENDING` into a terminal status.
    ///
    /// Returns false (and changes nothing) when the outcome is already terminal.
    pub fn finish(&mut self, status: RequestStatus, message: impl Into<String>) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.message = message.into();
        self.complete = true;
        true
    }
}

/// Descriptive metadata gathered while processing a request.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Metadata {
    pub scene_count: u64,
    pub pixel_count: u64,
    pub clean_pixel_count: u64,
    /// Clean pixels observed per acquisition date (`YYYY-MM-DD`)
    pub acquisitions: BTreeMap<String, u64>,
}

impl Metadata {
    /// Fold the metadata of another chunk into this one.
    pub fn combine(&mut self, other: &Metadata) {
        self.pixel_count += other.pixel_count;
        self.clean_pixel_count += other.clean_pixel_count;
        for (date, clean) in &other.acquisitions {
            *self.acquisitions.entry(date.clone()).or_default() += clean;
        }
        self.scene_count = self.acquisitions.len() as u64;
    }

    pub fn percentage_clean_pixels(&self) -> f64 {
        if self.pixel_count == 0 {
            0.0
        } else {
            100.0 * self.clean_pixel_count as f64 / self.pixel_count as f64
        }
    }
}

/// A request record: parameters, outcome and metadata composed into one entity.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct RequestRecord {
    pub id: Uuid,
    pub parameters: RequestParameters,
    pub outcome: Outcome,
    pub metadata: Metadata,
    #[serde(with = "time::serde::rfc3339")]
    pub execution_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub execution_end: Option<OffsetDateTime>,
}

impl RequestRecord {
    /// Returns a new pending record with a random id.
    pub fn new(parameters: RequestParameters) -> Self {
        Self {
            id: Uuid::new_v4(),
            parameters,
            outcome: Outcome::default(),
            metadata: Metadata::default(),
            execution_start: OffsetDateTime::now_utc(),
            execution_end: None,
        }
    }

    /// Finish the record, stamping the execution end time.
    pub fn finish(&mut self, status: RequestStatus, message: impl Into<String>) -> bool {
        let finished = self.outcome.finish(status, message);
        if finished {
            self.execution_end = Some(OffsetDateTime::now_utc());
        }
        finished
    }
}

/// Records with a stable identity.
pub trait Identifiable {
    fn id(&self) -> Uuid;
    fn application(&self) -> &str;
}

/// Records that report processing progress.
pub trait Progressable {
    fn status(&self) -> RequestStatus;
    fn is_complete(&self) -> bool;
    fn scenes_processed(&self) -> u64;
    fn total_scenes(&self) -> u64;

    /// Percentage of scenes processed, clamped to `[0, 100]`.
    fn progress(&self) -> u8 {
        let total = self.total_scenes().max(1) as f64;
        let percent = (100.0 * self.scenes_processed() as f64 / total).round();
        percent.clamp(0.0, 100.0) as u8
    }
}

/// Records with a human readable description.
pub trait Described {
    fn title(&self) -> &str;
    fn description(&self) -> &str;
}

impl Identifiable for RequestRecord {
    fn id(&self) -> Uuid {
        self.id
    }

    fn application(&self) -> &str {
        &self.parameters.application
    }
}

impl Progressable for RequestRecord {
    fn status(&self) -> RequestStatus {
        self.outcome.status
    }

    fn is_complete(&self) -> bool {
        self.outcome.complete
    }

    fn scenes_processed(&self) -> u64 {
        self.outcome.scenes_processed
    }

    fn total_scenes(&self) -> u64 {
        self.outcome.total_scenes
    }
}

impl Described for RequestRecord {
    fn title(&self) -> &str {
        &self.parameters.title
    }

    fn description(&self) -> &str {
        &self.parameters.description
    }
}

/// API view of a record.
#[derive(Debug, Deserialize, Serialize)]
pub struct RequestView {
    #[serde(flatten)]
    pub record: RequestRecord,
    pub progress: u8,
    /// Present on submission responses only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<bool>,
}

impl RequestView {
    pub fn new(record: RequestRecord, created: Option<bool>) -> Self {
        let progress = record.progress();
        Self {
            record,
            progress,
            created,
        }
    }
}
