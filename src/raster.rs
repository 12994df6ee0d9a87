//! Typed multi-band rasters and their recombination.

use crate::array::{self, Element};
use crate::error::CubeflowError;

use ndarray::prelude::*;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum_macros::Display;

/// Supported numerical data types
#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DType {
    /// [i32]
    Int32,
    /// [i64]
    Int64,
    /// [u32]
    Uint32,
    /// [u64]
    Uint64,
    /// [f32]
    Float32,
    /// [f64]
    Float64,
}

impl DType {
    /// Returns the size of the associated type in bytes.
    pub fn size_of(self) -> usize {
        match self {
            Self::Int32 => std::mem::size_of::<i32>(),
            Self::Int64 => std::mem::size_of::<i64>(),
            Self::Uint32 => std::mem::size_of::<u32>(),
            Self::Uint64 => std::mem::size_of::<u64>(),
            Self::Float32 => std::mem::size_of::<f32>(),
            Self::Float64 => std::mem::size_of::<f64>(),
        }
    }
}

/// Dimensions of a raster, in array axis order.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum Dimension {
    Time,
    Latitude,
    Longitude,
}

impl Dimension {
    pub fn axis(self) -> Axis {
        match self {
            Self::Time => Axis(0),
            Self::Latitude => Axis(1),
            Self::Longitude => Axis(2),
        }
    }
}

/// A single band: a `(time, latitude, longitude)` array of one numeric dtype.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "dtype", content = "values", rename_all = "lowercase")]
pub enum Band {
    Int32(Array3<i32>),
    Int64(Array3<i64>),
    Uint32(Array3<u32>),
    Uint64(Array3<u64>),
    Float32(Array3<f32>),
    Float64(Array3<f64>),
}

/// Array elements that can be stored in a [Band].
pub trait BandElement: Element {
    const DTYPE: DType;

    fn into_band(array: Array3<Self>) -> Band;

    fn as_array(band: &Band) -> Option<&Array3<Self>>;
}

macro_rules! band_element {
    ($type:ty, $variant:ident) => {
        impl BandElement for $type {
            const DTYPE: DType = DType::$variant;

            fn into_band(array: Array3<Self>) -> Band {
                Band::$variant(array)
            }

            fn as_array(band: &Band) -> Option<&Array3<Self>> {
                match band {
                    Band::$variant(array) => Some(array),
                    _ => None,
                }
            }
        }
    };
}

band_element!(i32, Int32);
band_element!(i64, Int64);
band_element!(u32, Uint32);
band_element!(u64, Uint64);
band_element!(f32, Float32);
band_element!(f64, Float64);

/// Evaluate an expression against the typed array inside a band.
macro_rules! with_array {
    ($band:expr, $array:ident => $body:expr) => {
        match $band {
            Band::Int32($array) => $body,
            Band::Int64($array) => $body,
            Band::Uint32($array) => $body,
            Band::Uint64($array) => $body,
            Band::Float32($array) => $body,
            Band::Float64($array) => $body,
        }
    };
}

/// Map the typed array inside a band to a new band of the same dtype.
macro_rules! map_array {
    ($band:expr, $array:ident => $body:expr) => {
        match $band {
            Band::Int32($array) => Band::Int32($body),
            Band::Int64($array) => Band::Int64($body),
            Band::Uint32($array) => Band::Uint32($body),
            Band::Uint64($array) => Band::Uint64($body),
            Band::Float32($array) => Band::Float32($body),
            Band::Float64($array) => Band::Float64($body),
        }
    };
}

/// Convert the runtime dtype into a concrete element type.
macro_rules! dispatch_dtype {
    ($dtype:expr, $func:ident($($arg:expr),*)) => {
        match $dtype {
            DType::Int32 => $func::<i32>($($arg),*),
            DType::Int64 => $func::<i64>($($arg),*),
            DType::Uint32 => $func::<u32>($($arg),*),
            DType::Uint64 => $func::<u64>($($arg),*),
            DType::Float32 => $func::<f32>($($arg),*),
            DType::Float64 => $func::<f64>($($arg),*),
        }
    };
}

fn typed<'a, T: BandElement>(band: &'a Band) -> Result<&'a Array3<T>, CubeflowError> {
    T::as_array(band).ok_or_else(|| {
        CubeflowError::shape_mismatch(format!(
            "band dtype {} does not match {}",
            band.dtype(),
            T::DTYPE
        ))
    })
}

fn concatenate_t<T: BandElement>(axis: Axis, bands: &[&Band]) -> Result<Band, CubeflowError> {
    let views = bands
        .iter()
        .map(|band| typed::<T>(band).map(|array| array.view()))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(T::into_band(ndarray::concatenate(axis, &views)?))
}

fn overlay_t<T: BandElement>(base: &Band, top: &Band, no_data: f64) -> Result<Band, CubeflowError> {
    let base = typed::<T>(base)?;
    let top = typed::<T>(top)?;
    Ok(T::into_band(array::overlay(&base.view(), &top.view(), no_data)?))
}

fn to_float64_t<T: Element>(array: &Array3<T>) -> Array3<f64> {
    array.mapv(|value| value.to_f64().unwrap_or(f64::NAN))
}

impl Band {
    pub fn dtype(&self) -> DType {
        match self {
            Self::Int32(_) => DType::Int32,
            Self::Int64(_) => DType::Int64,
            Self::Uint32(_) => DType::Uint32,
            Self::Uint64(_) => DType::Uint64,
            Self::Float32(_) => DType::Float32,
            Self::Float64(_) => DType::Float64,
        }
    }

    /// Returns the `(time, latitude, longitude)` shape.
    pub fn shape(&self) -> (usize, usize, usize) {
        with_array!(self, array => array.dim())
    }

    /// Returns a band built from the given indices along an axis.
    pub fn select(&self, axis: Axis, indices: &[usize]) -> Band {
        map_array!(self, array => array.select(axis, indices))
    }

    /// Concatenate bands of a single dtype along an axis.
    pub fn concatenate(axis: Axis, bands: &[&Band]) -> Result<Band, CubeflowError> {
        let first = bands
            .first()
            .ok_or_else(|| CubeflowError::shape_mismatch("no bands to concatenate"))?;
        dispatch_dtype!(first.dtype(), concatenate_t(axis, bands))
    }

    /// Returns this band with the valid values of `top` written over it.
    pub fn overlay(&self, top: &Band, no_data: f64) -> Result<Band, CubeflowError> {
        dispatch_dtype!(self.dtype(), overlay_t(self, top, no_data))
    }

    /// Number of valid observations in the band.
    pub fn count_valid(&self, no_data: f64) -> u64 {
        with_array!(self, array => array::count_valid(&array.view(), no_data))
    }

    /// Returns the values converted to `f64`. No-data values are kept as they are.
    pub fn to_float64(&self) -> Array3<f64> {
        with_array!(self, array => to_float64_t(array))
    }
}

/// A set of bands sharing `(time, latitude, longitude)` coordinates.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Raster {
    /// Acquisition times as unix seconds
    pub times: Vec<i64>,
    pub latitude: Vec<f64>,
    pub longitude: Vec<f64>,
    pub bands: BTreeMap<String, Band>,
}

impl Raster {
    /// Returns a new Raster, checking that every band matches the coordinates.
    pub fn new(
        times: Vec<i64>,
        latitude: Vec<f64>,
        longitude: Vec<f64>,
        bands: BTreeMap<String, Band>,
    ) -> Result<Self, CubeflowError> {
        let raster = Self {
            times,
            latitude,
            longitude,
            bands,
        };
        raster.check_shape()?;
        Ok(raster)
    }

    /// Checks that every band matches the shape given by the coordinates.
    ///
    /// Fields are public, so rasters built outside [Raster::new] are checked again before
    /// being combined.
    pub fn check_shape(&self) -> Result<(), CubeflowError> {
        let shape = self.shape();
        for (name, band) in &self.bands {
            if band.shape() != shape {
                return Err(CubeflowError::shape_mismatch(format!(
                    "band {} has shape {:?}, coordinates have shape {:?}",
                    name,
                    band.shape(),
                    shape
                )));
            }
        }
        Ok(())
    }

    /// Returns the `(time, latitude, longitude)` shape given by the coordinates.
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.times.len(), self.latitude.len(), self.longitude.len())
    }

    /// Coordinate values along a dimension.
    pub fn coordinates(&self, dimension: Dimension) -> Vec<f64> {
        match dimension {
            Dimension::Time => self.times.iter().map(|time| *time as f64).collect(),
            Dimension::Latitude => self.latitude.clone(),
            Dimension::Longitude => self.longitude.clone(),
        }
    }

    /// Returns a raster built from the given indices along a dimension.
    pub fn select(&self, dimension: Dimension, indices: &[usize]) -> Raster {
        let pick = |values: &[f64]| indices.iter().map(|i| values[*i]).collect::<Vec<_>>();
        let mut result = self.clone_coordinates();
        match dimension {
            Dimension::Time => result.times = indices.iter().map(|i| self.times[*i]).collect(),
            Dimension::Latitude => result.latitude = pick(&self.latitude),
            Dimension::Longitude => result.longitude = pick(&self.longitude),
        }
        result.bands = self
            .bands
            .par_iter()
            .map(|(name, band)| (name.clone(), band.select(dimension.axis(), indices)))
            .collect();
        result
    }

    /// Number of valid observations over all bands.
    pub fn count_valid(&self, no_data: f64) -> u64 {
        self.bands.values().map(|band| band.count_valid(no_data)).sum()
    }

    /// Returns this raster with the valid values of `top` written over it.
    ///
    /// The result takes the time coordinates of `top`.
    pub fn overlay(&self, top: &Raster, no_data: f64) -> Result<Raster, CubeflowError> {
        if self.latitude != top.latitude || self.longitude != top.longitude {
            return Err(CubeflowError::shape_mismatch(
                "spatial coordinates differ between rasters",
            ));
        }
        self.check_bands(top)?;
        let bands = self
            .bands
            .iter()
            .map(|(name, band)| Ok::<_, CubeflowError>((name.clone(), band.overlay(&top.bands[name], no_data)?)))
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        Raster::new(top.times.clone(), self.latitude.clone(), self.longitude.clone(), bands)
    }

    /// Keep only the named bands.
    pub fn retain_bands(&mut self, names: &[&str]) -> Result<(), CubeflowError> {
        if let Some(missing) = names.iter().find(|name| !self.bands.contains_key(**name)) {
            return Err(CubeflowError::invalid_argument(
                "bands",
                format!("no band named {}", missing),
            ));
        }
        self.bands.retain(|name, _| names.contains(&name.as_str()));
        Ok(())
    }

    fn clone_coordinates(&self) -> Raster {
        Raster {
            times: self.times.clone(),
            latitude: self.latitude.clone(),
            longitude: self.longitude.clone(),
            bands: BTreeMap::new(),
        }
    }

    /// Check that the bands of `other` have the same names and dtypes as ours.
    fn check_bands(&self, other: &Raster) -> Result<(), CubeflowError> {
        let ours = self.bands.iter().map(|(name, band)| (name, band.dtype()));
        let theirs = other.bands.iter().map(|(name, band)| (name, band.dtype()));
        if !ours.eq(theirs) {
            return Err(CubeflowError::shape_mismatch(format!(
                "band sets differ: {:?} and {:?}",
                self.band_summary(),
                other.band_summary()
            )));
        }
        Ok(())
    }

    fn band_summary(&self) -> Vec<String> {
        self.bands
            .iter()
            .map(|(name, band)| format!("{}:{}", name, band.dtype()))
            .collect()
    }

    /// Concatenate the bands of several rasters along an axis.
    fn concatenate_bands(
        chunks: &[Raster],
        axis: Axis,
    ) -> Result<BTreeMap<String, Band>, CubeflowError> {
        chunks[0]
            .bands
            .keys()
            .map(|name| {
                let bands = chunks
                    .iter()
                    .map(|chunk| &chunk.bands[name])
                    .collect::<Vec<_>>();
                Ok::<_, CubeflowError>((name.clone(), Band::concatenate(axis, &bands)?))
            })
            .collect()
    }
}

/// Combine rasters covering different latitude bands into one.
///
/// The latitude axis of the result is the ascending, deduplicated union of the chunk
/// latitudes. Where chunks overlap, the first chunk in input order wins.
pub fn combine_geographic(chunks: &[Raster]) -> Result<Raster, CubeflowError> {
    let first = chunks
        .first()
        .ok_or_else(|| CubeflowError::shape_mismatch("no chunks to combine"))?;
    first.check_shape()?;
    for chunk in &chunks[1..] {
        chunk.check_shape()?;
        if chunk.longitude != first.longitude {
            return Err(CubeflowError::shape_mismatch(
                "longitude coordinates differ between chunks",
            ));
        }
        if chunk.times != first.times {
            return Err(CubeflowError::shape_mismatch(
                "time coordinates differ between chunks",
            ));
        }
        first.check_bands(chunk)?;
    }

    // Rows in concatenation order; a stable sort keeps input order among equal latitudes.
    let mut rows = chunks
        .iter()
        .flat_map(|chunk| chunk.latitude.iter().copied())
        .enumerate()
        .collect::<Vec<_>>();
    rows.sort_by(|(_, a), (_, b)| a.total_cmp(b));
    rows.dedup_by(|(_, a), (_, b)| a == b);

    let indices = rows.iter().map(|(index, _)| *index).collect::<Vec<_>>();
    let combined = Raster {
        times: first.times.clone(),
        latitude: chunks
            .iter()
            .flat_map(|chunk| chunk.latitude.iter().copied())
            .collect(),
        longitude: first.longitude.clone(),
        bands: Raster::concatenate_bands(chunks, Dimension::Latitude.axis())?,
    };
    Ok(combined.select(Dimension::Latitude, &indices))
}

/// Combine rasters covering different times into one, ordered by time.
pub fn combine_temporal(chunks: &[Raster]) -> Result<Raster, CubeflowError> {
    let first = chunks
        .first()
        .ok_or_else(|| CubeflowError::shape_mismatch("no chunks to combine"))?;
    first.check_shape()?;
    for chunk in &chunks[1..] {
        chunk.check_shape()?;
        if chunk.latitude != first.latitude || chunk.longitude != first.longitude {
            return Err(CubeflowError::shape_mismatch(
                "spatial coordinates differ between chunks",
            ));
        }
        first.check_bands(chunk)?;
    }

    let mut times = chunks
        .iter()
        .flat_map(|chunk| chunk.times.iter().copied())
        .enumerate()
        .collect::<Vec<_>>();
    times.sort_by_key(|(_, time)| *time);

    let indices = times.iter().map(|(index, _)| *index).collect::<Vec<_>>();
    let combined = Raster {
        times: chunks
            .iter()
            .flat_map(|chunk| chunk.times.iter().copied())
            .collect(),
        latitude: first.latitude.clone(),
        longitude: first.longitude.clone(),
        bands: Raster::concatenate_bands(chunks, Dimension::Time.axis())?,
    };
    Ok(combined.select(Dimension::Time, &indices))
}
