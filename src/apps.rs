//! Application implementations and the scene loading interface they build on.

pub mod anomaly;
pub mod mosaic;
pub mod synthetic;

use crate::cli::CommandLineArgs;
use crate::error::CubeflowError;
use crate::models::{GeographicChunk, RequestParameters};
use crate::planner::ChunkSizing;
use crate::raster::Raster;
use crate::registry::Registry;
use crate::resample::Resolution;

use std::sync::Arc;
use time::OffsetDateTime;

/// Source of satellite scenes.
pub trait SceneLoader: Send + Sync {
    /// Names of the bands of a scene.
    fn measurements(&self) -> Vec<String>;

    /// Acquisition times of scenes intersecting a request.
    fn acquisition_dates(
        &self,
        parameters: &RequestParameters,
    ) -> Result<Vec<OffsetDateTime>, CubeflowError>;

    /// Load the scene acquired at `time` over a geographic chunk.
    ///
    /// Returns `None` when the chunk contains no pixels.
    fn load(
        &self,
        parameters: &RequestParameters,
        chunk: &GeographicChunk,
        time: OffsetDateTime,
    ) -> Result<Option<Raster>, CubeflowError>;

    /// Value marking missing observations.
    fn no_data(&self) -> f64;
}

/// Product prefixes of supported platforms.
const PRODUCTS: [(&str, &str); 4] = [
    ("LANDSAT_5", "ls5_ledaps"),
    ("LANDSAT_7", "ls7_ledaps"),
    ("LANDSAT_8", "ls8_lasrc"),
    ("SENTINEL_2", "s2_l2a"),
];

/// Name of the surface reflectance product of a platform over an area.
pub fn surface_reflectance_product(platform: &str, area_id: &str) -> Result<String, CubeflowError> {
    let prefix = PRODUCTS
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(platform))
        .map(|(_, prefix)| prefix)
        .ok_or_else(|| {
            CubeflowError::invalid_argument("platform", format!("{} is not supported", platform))
        })?;
    Ok(format!("{}_{}", prefix, area_id))
}

/// Build the registry of applications from the command line arguments.
pub fn build_registry(args: &CommandLineArgs) -> Result<Registry, CubeflowError> {
    let loader: Arc<dyn SceneLoader> = Arc::new(synthetic::SyntheticLoader::new(
        args.loader_resolution,
        args.loader_revisit_days,
    )?);
    let sizing = ChunkSizing {
        geographic: args.mosaic_geographic_chunk_size,
        time: (args.mosaic_time_chunk_size > 0).then_some(args.mosaic_time_chunk_size),
    };
    let resolution = args.output_fraction.map(Resolution::Fractional);
    let mut registry = Registry::new();
    registry.register(Arc::new(mosaic::Mosaic::new(loader.clone(), sizing, resolution)))?;
    registry.register(Arc::new(anomaly::Anomaly::new(
        loader,
        args.anomaly_geographic_chunk_size,
        args.anomaly_baseline_length,
        resolution,
    )?))?;
    Ok(registry)
}
