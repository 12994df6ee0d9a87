//! Most recent valid pixel mosaic.

use crate::apps::{surface_reflectance_product, SceneLoader};
use crate::error::CubeflowError;
use crate::identity::{normalize_extra, RequestKind};
use crate::models::{ChunkUnit, Metadata, RequestParameters};
use crate::planner::ChunkSizing;
use crate::raster::Raster;
use crate::registry::{Application, ChunkOutput};
use crate::resample::Resolution;

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use time::OffsetDateTime;

/// Composites scenes by taking, for every pixel, the most recent clear observation.
///
/// The optional `bands` field restricts the output to a subset of the loader's
/// measurements.
pub struct Mosaic {
    loader: Arc<dyn SceneLoader>,
    sizing: ChunkSizing,
    resolution: Option<Resolution>,
}

impl Mosaic {
    pub fn new(
        loader: Arc<dyn SceneLoader>,
        sizing: ChunkSizing,
        resolution: Option<Resolution>,
    ) -> Self {
        Self {
            loader,
            sizing,
            resolution,
        }
    }

    /// Load a scene, restricted to the requested bands.
    fn load(
        &self,
        parameters: &RequestParameters,
        unit: &ChunkUnit,
        time: OffsetDateTime,
    ) -> Result<Option<Raster>, CubeflowError> {
        let Some(mut scene) = self.loader.load(parameters, &unit.geographic, time)? else {
            return Ok(None);
        };
        if let Some(bands) = parameters.extra.get("bands") {
            scene.retain_bands(&bands.split(',').collect::<Vec<_>>())?;
        }
        Ok(Some(scene))
    }
}

impl RequestKind for Mosaic {
    fn id(&self) -> &str {
        "mosaic"
    }

    fn derive_product(&self, platform: &str, area_id: &str) -> Result<String, CubeflowError> {
        surface_reflectance_product(platform, area_id)
    }

    fn canonicalize_extra(
        &self,
        extra: &BTreeMap<String, Value>,
    ) -> Result<BTreeMap<String, String>, CubeflowError> {
        let extra = normalize_extra(extra, &["bands"])?;
        if let Some(bands) = extra.get("bands") {
            let measurements = self.loader.measurements();
            if let Some(unknown) = bands
                .split(',')
                .find(|band| !measurements.iter().any(|name| name == *band))
            {
                return Err(CubeflowError::invalid_argument(
                    "bands",
                    format!("no band named {}", unknown),
                ));
            }
        }
        Ok(extra)
    }
}

impl Application for Mosaic {
    fn chunk_sizing(&self) -> ChunkSizing {
        self.sizing
    }

    fn reverse_time(&self) -> bool {
        true
    }

    fn acquisition_dates(
        &self,
        parameters: &RequestParameters,
    ) -> Result<Vec<OffsetDateTime>, CubeflowError> {
        self.loader.acquisition_dates(parameters)
    }

    fn process_chunk(
        &self,
        parameters: &RequestParameters,
        unit: &ChunkUnit,
    ) -> Result<ChunkOutput, CubeflowError> {
        let no_data = self.no_data();
        let mut times = unit.time_chunk.clone();
        times.sort();

        let mut metadata = Metadata::default();
        let mut composite: Option<Raster> = None;
        for time in &times {
            let Some(scene) = self.load(parameters, unit, *time)? else {
                continue;
            };
            let (_, rows, columns) = scene.shape();
            let clean = scene
                .bands
                .values()
                .next()
                .map_or(0, |band| band.count_valid(no_data));
            metadata.pixel_count += (rows * columns) as u64;
            metadata.clean_pixel_count += clean;
            *metadata
                .acquisitions
                .entry(time.date().to_string())
                .or_default() += clean;
            composite = Some(match composite {
                Some(accumulated) => accumulated.overlay(&scene, no_data)?,
                None => scene,
            });
        }
        metadata.scene_count = metadata.acquisitions.len() as u64;

        // Stamp with the latest time of the chunk so that all geographic chunks agree.
        if let (Some(raster), Some(latest)) = (composite.as_mut(), times.last()) {
            raster.times = vec![latest.unix_timestamp()];
        }
        Ok(ChunkOutput {
            raster: composite,
            metadata,
        })
    }

    fn recombine_time(&self, accumulated: Raster, next: Raster) -> Result<Raster, CubeflowError> {
        let (older, newer) = if next.times >= accumulated.times {
            (accumulated, next)
        } else {
            (next, accumulated)
        };
        older.overlay(&newer, self.no_data())
    }

    fn output_resolution(&self) -> Option<Resolution> {
        self.resolution
    }

    fn no_data(&self) -> f64 {
        self.loader.no_data()
    }
}
