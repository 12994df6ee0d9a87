//! NDVI anomaly of the latest scene against a seasonal baseline.

use crate::apps::{surface_reflectance_product, SceneLoader};
use crate::array;
use crate::baseline::{generate_baseline, group_by_calendar_unit, CalendarUnit};
use crate::error::CubeflowError;
use crate::identity::{normalize_extra, RequestKind};
use crate::models::{ChunkUnit, Metadata, RequestParameters};
use crate::planner::ChunkSizing;
use crate::raster::{Band, Raster};
use crate::registry::{Application, ChunkOutput};
use crate::resample::Resolution;

use ndarray::prelude::*;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use time::OffsetDateTime;

/// Bands of an anomaly output.
pub const SCENE_NDVI: &str = "scene_ndvi";
pub const BASELINE_NDVI: &str = "baseline_ndvi";
pub const NDVI_DIFFERENCE: &str = "ndvi_difference";
pub const NDVI_PERCENTAGE_CHANGE: &str = "ndvi_percentage_change";

/// Compares the NDVI of the latest scene of a request with the median NDVI of the scenes
/// before it.
///
/// The baseline is made of the `baseline_length` most recent earlier scenes, restricted to
/// the months listed in the optional `baseline_months` field (1 to 12). Every chunk unit holds
/// the whole baseline and the scene, so requests are only split geographically.
pub struct Anomaly {
    loader: Arc<dyn SceneLoader>,
    geographic_chunk_size: f64,
    baseline_length: usize,
    resolution: Option<Resolution>,
}

impl Anomaly {
    pub fn new(
        loader: Arc<dyn SceneLoader>,
        geographic_chunk_size: f64,
        baseline_length: usize,
        resolution: Option<Resolution>,
    ) -> Result<Self, CubeflowError> {
        if baseline_length == 0 {
            return Err(CubeflowError::invalid_argument(
                "baseline_length",
                "must be at least 1",
            ));
        }
        Ok(Self {
            loader,
            geographic_chunk_size,
            baseline_length,
            resolution,
        })
    }

    /// NDVI of the single time slice of a scene.
    fn ndvi(&self, scene: &Raster) -> Result<Array2<f64>, CubeflowError> {
        let band = |name: &str| {
            scene.bands.get(name).map(Band::to_float64).ok_or_else(|| {
                CubeflowError::shape_mismatch(format!("scene has no {} band", name))
            })
        };
        let red = band("red")?;
        let nir = band("nir")?;
        array::normalized_difference(
            &nir.index_axis(Axis(0), 0),
            &red.index_axis(Axis(0), 0),
            self.no_data(),
        )
    }
}

/// Months the baseline is restricted to, if any.
fn baseline_months(parameters: &RequestParameters) -> Result<Option<BTreeSet<i32>>, CubeflowError> {
    parameters
        .extra
        .get("baseline_months")
        .map(|months| parse_months(months))
        .transpose()
}

fn parse_months(months: &str) -> Result<BTreeSet<i32>, CubeflowError> {
    months
        .split(',')
        .map(|month| match month.trim().parse::<i32>() {
            Ok(month) if (1..=12).contains(&month) => Ok(month),
            _ => Err(CubeflowError::invalid_argument(
                "baseline_months",
                format!("{} is not a month number between 1 and 12", month),
            )),
        })
        .collect()
}

/// Record the clean pixels of one scene.
fn observe(metadata: &mut Metadata, scene: &Raster, time: OffsetDateTime, no_data: f64) {
    let (_, rows, columns) = scene.shape();
    let clean = scene.bands.get("red").map_or(0, |band| band.count_valid(no_data));
    metadata.pixel_count += (rows * columns) as u64;
    metadata.clean_pixel_count += clean;
    *metadata
        .acquisitions
        .entry(time.date().to_string())
        .or_default() += clean;
}

impl RequestKind for Anomaly {
    fn id(&self) -> &str {
        "ndvi_anomaly"
    }

    fn derive_product(&self, platform: &str, area_id: &str) -> Result<String, CubeflowError> {
        surface_reflectance_product(platform, area_id)
    }

    fn canonicalize_extra(
        &self,
        extra: &BTreeMap<String, Value>,
    ) -> Result<BTreeMap<String, String>, CubeflowError> {
        let mut extra = normalize_extra(extra, &["baseline_months"])?;
        if let Some(months) = extra.get_mut("baseline_months") {
            *months = parse_months(months)?
                .iter()
                .map(i32::to_string)
                .collect::<Vec<_>>()
                .join(",");
        }
        Ok(extra)
    }

    fn default_title(&self) -> &str {
        "NDVI Anomaly"
    }
}

impl Application for Anomaly {
    fn chunk_sizing(&self) -> ChunkSizing {
        ChunkSizing {
            geographic: self.geographic_chunk_size,
            time: None,
        }
    }

    fn reverse_time(&self) -> bool {
        true
    }

    /// The baseline window ending with the latest acquisition of the request.
    fn acquisition_dates(
        &self,
        parameters: &RequestParameters,
    ) -> Result<Vec<OffsetDateTime>, CubeflowError> {
        let mut acquisitions = self.loader.acquisition_dates(parameters)?;
        acquisitions.sort();
        let Some((scene, earlier)) = acquisitions.split_last() else {
            return Ok(vec![]);
        };

        let months = baseline_months(parameters)?;
        let mut candidates = group_by_calendar_unit(earlier, CalendarUnit::Month, months.as_ref())
            .into_values()
            .flatten()
            .collect::<Vec<_>>();
        candidates.sort();
        candidates.push(*scene);

        let window = generate_baseline(&candidates, self.baseline_length)?
            .pop()
            .unwrap_or_default();
        if window.len() < 2 {
            return Err(CubeflowError::invalid_argument(
                "baseline_months",
                format!("no baseline scenes precede the scene of {}", scene.date()),
            ));
        }
        Ok(window)
    }

    fn process_chunk(
        &self,
        parameters: &RequestParameters,
        unit: &ChunkUnit,
    ) -> Result<ChunkOutput, CubeflowError> {
        let no_data = self.no_data();
        let mut times = unit.time_chunk.clone();
        times.sort();
        let Some((scene_time, baseline_times)) = times.split_last() else {
            return Ok(ChunkOutput::default());
        };

        let mut metadata = Metadata::default();
        let mut baseline = Vec::with_capacity(baseline_times.len());
        for time in baseline_times {
            if let Some(scene) = self.loader.load(parameters, &unit.geographic, *time)? {
                observe(&mut metadata, &scene, *time, no_data);
                baseline.push(self.ndvi(&scene)?);
            }
        }
        let scene = self.loader.load(parameters, &unit.geographic, *scene_time)?;
        if let Some(scene) = &scene {
            observe(&mut metadata, scene, *scene_time, no_data);
        }
        metadata.scene_count = metadata.acquisitions.len() as u64;
        let Some(scene) = scene else {
            return Ok(ChunkOutput {
                raster: None,
                metadata,
            });
        };

        let scene_ndvi = self.ndvi(&scene)?;
        if let Some(other) = baseline.iter().find(|ndvi| ndvi.dim() != scene_ndvi.dim()) {
            return Err(CubeflowError::shape_mismatch(format!(
                "baseline scene has shape {:?}, latest scene has shape {:?}",
                other.dim(),
                scene_ndvi.dim()
            )));
        }
        let baseline_ndvi = Array2::from_shape_fn(scene_ndvi.dim(), |(y, x)| {
            array::nan_median(baseline.iter().map(|ndvi| ndvi[[y, x]]))
        });
        let difference = &scene_ndvi - &baseline_ndvi;
        let percentage_change = &difference / &baseline_ndvi;

        let band = |values: Array2<f64>| {
            let values = values.mapv(|value| if value.is_finite() { value } else { no_data });
            Band::Float64(values.insert_axis(Axis(0)))
        };
        let bands = BTreeMap::from([
            (SCENE_NDVI.to_string(), band(scene_ndvi)),
            (BASELINE_NDVI.to_string(), band(baseline_ndvi)),
            (NDVI_DIFFERENCE.to_string(), band(difference)),
            (NDVI_PERCENTAGE_CHANGE.to_string(), band(percentage_change)),
        ]);
        let raster = Raster::new(
            vec![scene_time.unix_timestamp()],
            scene.latitude,
            scene.longitude,
            bands,
        )?;
        Ok(ChunkOutput {
            raster: Some(raster),
            metadata,
        })
    }

    fn output_resolution(&self) -> Option<Resolution> {
        self.resolution
    }

    fn no_data(&self) -> f64 {
        self.loader.no_data()
    }
}
