//! Rescaling of rasters by nearest-neighbour lookup.

use crate::array;
use crate::error::CubeflowError;
use crate::partition;
use crate::raster::{Dimension, Raster};

use serde::{Deserialize, Serialize};

/// Target resolution of a rescale.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    /// Fraction of the original pixel count, in `(0, 1]`.
    /// Each spatial axis is scaled by the square root of the fraction.
    Fractional(f64),
    /// Absolute number of pixels along each spatial axis.
    Absolute { longitude: usize, latitude: usize },
}

/// How target coordinates are chosen along an axis.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Interpolation {
    /// Coordinates at evenly spaced indices
    Linear,
    /// Mean coordinate of each of `count` equal width bins
    Bin,
}

/// Resample a raster to `count` coordinates along one dimension.
///
/// Values are looked up from the nearest source coordinate, so band dtypes are preserved.
pub fn interpolate(
    raster: &Raster,
    dimension: Dimension,
    method: Interpolation,
    count: usize,
) -> Result<Raster, CubeflowError> {
    if count == 0 {
        return Err(CubeflowError::invalid_argument(
            "count",
            format!("cannot resample {} to zero coordinates", dimension),
        ));
    }
    let source = raster.coordinates(dimension);
    if source.is_empty() {
        return Ok(raster.clone());
    }
    let targets = match method {
        Interpolation::Linear => array::linspace_indices(source.len(), count)
            .into_iter()
            .map(|index| source[index])
            .collect::<Vec<_>>(),
        Interpolation::Bin => {
            let mut sorted = source.clone();
            sorted.sort_by(f64::total_cmp);
            let bins = partition::bin_intervals(&sorted, count)?;
            array::bin_means(&sorted, &bins)
        }
    };
    let indices = array::nearest_indices(&source, &targets)?;
    let mut result = raster.select(dimension, &indices);
    match dimension {
        Dimension::Time => result.times = targets.iter().map(|time| time.round() as i64).collect(),
        Dimension::Latitude => result.latitude = targets,
        Dimension::Longitude => result.longitude = targets,
    }
    Ok(result)
}

/// Scale `len` by `factor`, keeping at least one coordinate.
fn scaled(len: usize, factor: f64) -> usize {
    ((len as f64 * factor).round() as usize).max(1)
}

/// Rescale the spatial axes of a raster.
pub fn rescale(raster: &Raster, resolution: Resolution) -> Result<Raster, CubeflowError> {
    let (longitude, latitude) = match resolution {
        Resolution::Fractional(fraction) => {
            if !(fraction > 0.0 && fraction <= 1.0) {
                return Err(CubeflowError::invalid_argument(
                    "resolution",
                    format!("fraction {} must be within (0, 1]", fraction),
                ));
            }
            let factor = fraction.sqrt();
            (
                scaled(raster.longitude.len(), factor),
                scaled(raster.latitude.len(), factor),
            )
        }
        Resolution::Absolute {
            longitude,
            latitude,
        } => (longitude, latitude),
    };
    let raster = interpolate(raster, Dimension::Latitude, Interpolation::Linear, latitude)?;
    interpolate(&raster, Dimension::Longitude, Interpolation::Linear, longitude)
}
