//! Decomposition of requests into geographic and temporal chunks.

use crate::error::CubeflowError;
use crate::models::{ChunkId, ChunkUnit, CoordinateRange, GeographicChunk, RequestParameters, TimeChunk};
use crate::partition;

pub use crate::raster::{combine_geographic, combine_temporal};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Chunk sizes of an application.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct ChunkSizing {
    /// Area of a geographic chunk in square degrees
    pub geographic: f64,
    /// Acquisitions per temporal chunk, or all acquisitions in one chunk
    pub time: Option<usize>,
}

/// Split the area of a request into latitude bands.
///
/// The number of chunks is the request area divided by `chunk_size`, rounded up.
/// Every chunk keeps the full longitude range.
pub fn plan_geographic(
    longitude: &CoordinateRange,
    latitude: &CoordinateRange,
    chunk_size: f64,
) -> Result<Vec<GeographicChunk>, CubeflowError> {
    if !(chunk_size > 0.0) || !chunk_size.is_finite() {
        return Err(CubeflowError::invalid_argument(
            "chunk_size",
            format!("{} must be a positive number", chunk_size),
        ));
    }
    let area = longitude.extent() * latitude.extent();
    let count = partition::step_count(area, chunk_size);
    Ok(partition::partition_count(latitude, count)?
        .into_iter()
        .map(|latitude| GeographicChunk {
            longitude: *longitude,
            latitude,
        })
        .collect())
}

/// Split acquisition times into contiguous runs of `chunk_size`.
///
/// With no chunk size all times form a single chunk. Times are sorted ascending, or
/// descending when `reversed`.
pub fn plan_temporal(
    times: &[OffsetDateTime],
    chunk_size: Option<usize>,
    reversed: bool,
) -> Result<Vec<TimeChunk>, CubeflowError> {
    if times.is_empty() {
        return Ok(vec![]);
    }
    let size = chunk_size.unwrap_or(times.len());
    partition::group_contiguous(times, size, reversed)
}

/// Chunk plan of a request.
#[derive(Clone, Debug)]
pub struct ChunkPlan {
    pub geographic: Vec<GeographicChunk>,
    pub temporal: Vec<TimeChunk>,
    pub units: Vec<ChunkUnit>,
}

impl ChunkPlan {
    /// Number of chunk units the request expects.
    pub fn expected(&self) -> usize {
        self.units.len()
    }

    /// Number of scenes over all chunk units.
    pub fn total_scenes(&self) -> u64 {
        self.units.iter().map(ChunkUnit::scene_count).sum()
    }

    pub fn chunk_ids(&self) -> impl Iterator<Item = ChunkId> + '_ {
        self.units.iter().map(|unit| unit.chunk_id)
    }
}

/// Plan the cartesian product of geographic and temporal chunks of a request.
#[tracing::instrument(level = "DEBUG", skip(parameters, times))]
pub fn plan(
    request_id: Uuid,
    parameters: &RequestParameters,
    times: &[OffsetDateTime],
    sizing: ChunkSizing,
    reversed: bool,
) -> Result<ChunkPlan, CubeflowError> {
    let geographic = plan_geographic(
        &parameters.longitude,
        &parameters.latitude,
        sizing.geographic,
    )?;
    let temporal = plan_temporal(times, sizing.time, reversed)?;
    let units = geographic
        .iter()
        .enumerate()
        .flat_map(|(geo, geographic)| {
            temporal.iter().enumerate().map(move |(time, time_chunk)| ChunkUnit {
                request_id,
                chunk_id: ChunkId { geo, time },
                geographic: *geographic,
                time_chunk: time_chunk.clone(),
            })
        })
        .collect();
    Ok(ChunkPlan {
        geographic,
        temporal,
        units,
    })
}
