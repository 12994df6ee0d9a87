//! A deterministic scene loader producing synthetic surface reflectance.

use crate::apps::SceneLoader;
use crate::error::CubeflowError;
use crate::models::{CoordinateRange, GeographicChunk, RequestParameters};
use crate::raster::{Band, Raster};

use ndarray::Array3;
use time::{Duration, OffsetDateTime};

/// Bands of a synthetic scene.
const MEASUREMENTS: [&str; 6] = ["blue", "green", "red", "nir", "swir1", "swir2"];

/// Value of cloudy pixels.
const NO_DATA: i32 = -9999;

/// Hour of day at which scenes are acquired.
const ACQUISITION_HOUR: i64 = 10;

/// Tolerance when snapping range bounds to the pixel grid.
const GRID_TOLERANCE: f64 = 1e-9;

/// Scenes on a global grid of `resolution` degrees, acquired every `revisit_days`
/// days since the unix epoch.
///
/// Pixel values depend only on the platform, pixel position and day, so adjacent
/// chunks agree on shared rows. Roughly a fifth of pixels are cloudy.
#[derive(Clone, Debug)]
pub struct SyntheticLoader {
    resolution: f64,
    revisit_days: i64,
}

impl SyntheticLoader {
    pub fn new(resolution: f64, revisit_days: i64) -> Result<Self, CubeflowError> {
        if !(resolution > 0.0) || !resolution.is_finite() {
            return Err(CubeflowError::invalid_argument(
                "resolution",
                format!("{} must be a positive number", resolution),
            ));
        }
        if revisit_days < 1 {
            return Err(CubeflowError::invalid_argument(
                "revisit_days",
                format!("{} must be at least 1", revisit_days),
            ));
        }
        Ok(Self {
            resolution,
            revisit_days,
        })
    }

    /// Grid indices and coordinates of the pixels within a closed range.
    fn axis(&self, range: &CoordinateRange) -> Vec<(i64, f64)> {
        let first = (range.min() / self.resolution - GRID_TOLERANCE).ceil() as i64;
        let last = (range.max() / self.resolution + GRID_TOLERANCE).floor() as i64;
        (first..=last)
            .map(|index| (index, index as f64 * self.resolution))
            .collect()
    }

    fn value(seed: u64, day: i64, row: i64, column: i64, band: usize) -> i32 {
        let pixel = mix(seed ^ mix(day as u64) ^ mix(row as u64).rotate_left(21) ^ mix(column as u64).rotate_left(42));
        if pixel % 5 == 0 {
            NO_DATA
        } else {
            100 + (mix(pixel ^ band as u64) % 5000) as i32
        }
    }
}

/// SplitMix64 finaliser.
fn mix(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e3779b97f4a7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d049bb133111eb);
    x ^ (x >> 31)
}

fn platform_seed(platform: &str) -> u64 {
    platform
        .bytes()
        .fold(0, |seed, byte| mix(seed ^ u64::from(byte)))
}

fn epoch_day(time: OffsetDateTime) -> i64 {
    time.unix_timestamp().div_euclid(86400)
}

impl SceneLoader for SyntheticLoader {
    fn measurements(&self) -> Vec<String> {
        MEASUREMENTS.iter().map(|name| name.to_string()).collect()
    }

    fn acquisition_dates(
        &self,
        parameters: &RequestParameters,
    ) -> Result<Vec<OffsetDateTime>, CubeflowError> {
        let start = epoch_day(parameters.time_start.midnight().assume_utc());
        let end = epoch_day(parameters.time_end.midnight().assume_utc());
        let first = start + (self.revisit_days - start.rem_euclid(self.revisit_days)) % self.revisit_days;
        Ok((first..=end)
            .step_by(self.revisit_days as usize)
            .map(|day| {
                OffsetDateTime::UNIX_EPOCH + Duration::days(day) + Duration::hours(ACQUISITION_HOUR)
            })
            .collect())
    }

    fn load(
        &self,
        parameters: &RequestParameters,
        chunk: &GeographicChunk,
        time: OffsetDateTime,
    ) -> Result<Option<Raster>, CubeflowError> {
        let latitude = self.axis(&chunk.latitude);
        let longitude = self.axis(&chunk.longitude);
        if latitude.is_empty() || longitude.is_empty() {
            return Ok(None);
        }
        let seed = platform_seed(&parameters.platform);
        let day = epoch_day(time);
        let bands = MEASUREMENTS
            .iter()
            .enumerate()
            .map(|(band, name)| {
                let values = Array3::from_shape_fn(
                    (1, latitude.len(), longitude.len()),
                    |(_, y, x)| Self::value(seed, day, latitude[y].0, longitude[x].0, band),
                );
                (name.to_string(), Band::Int32(values))
            })
            .collect();
        Raster::new(
            vec![time.unix_timestamp()],
            latitude.into_iter().map(|(_, coordinate)| coordinate).collect(),
            longitude.into_iter().map(|(_, coordinate)| coordinate).collect(),
            bands,
        )
        .map(Some)
    }

    fn no_data(&self) -> f64 {
        f64::from(NO_DATA)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils;

    use time::macros::{date, datetime};

    fn loader() -> SyntheticLoader {
        SyntheticLoader::new(0.25, 16).unwrap()
    }

    fn chunk(min: f64, max: f64) -> GeographicChunk {
        GeographicChunk {
            longitude: CoordinateRange::new(-1.0, 1.0).unwrap(),
            latitude: CoordinateRange::new(min, max).unwrap(),
        }
    }

    #[test]
    fn new_invalid() {
        assert!(SyntheticLoader::new(0.0, 16).is_err());
        assert!(SyntheticLoader::new(0.1, 0).is_err());
    }

    #[test]
    fn acquisition_dates_aligned() {
        let mut parameters = test_utils::get_test_parameters();
        parameters.time_start = date!(1970 - 01 - 01);
        parameters.time_end = date!(1970 - 02 - 15);
        let dates = loader().acquisition_dates(&parameters).unwrap();
        assert_eq!(
            vec![
                datetime!(1970-01-01 10:00 UTC),
                datetime!(1970-01-17 10:00 UTC),
                datetime!(1970-02-02 10:00 UTC),
            ],
            dates
        );
    }

    #[test]
    fn acquisition_dates_year() {
        let parameters = test_utils::get_test_parameters();
        let dates = loader().acquisition_dates(&parameters).unwrap();
        assert!(dates.len() == 22 || dates.len() == 23);
        assert!(dates.windows(2).all(|pair| pair[1] - pair[0] == Duration::days(16)));
        assert!(dates[0].date() >= parameters.time_start);
        assert!(dates[dates.len() - 1].date() <= parameters.time_end);
    }

    #[test]
    fn acquisition_dates_none() {
        let mut parameters = test_utils::get_test_parameters();
        parameters.time_start = date!(1970 - 01 - 02);
        parameters.time_end = date!(1970 - 01 - 05);
        assert!(loader().acquisition_dates(&parameters).unwrap().is_empty());
    }

    #[test]
    fn load_grid() {
        let parameters = test_utils::get_test_parameters();
        let raster = loader()
            .load(&parameters, &chunk(-1.0, 0.0), datetime!(2015-01-01 10:00 UTC))
            .unwrap()
            .unwrap();
        assert_eq!(vec![-1.0, -0.75, -0.5, -0.25, 0.0], raster.latitude);
        assert_eq!(9, raster.longitude.len());
        assert_eq!(6, raster.bands.len());
        assert_eq!((1, 5, 9), raster.bands["red"].shape());
    }

    #[test]
    fn load_empty_chunk() {
        let parameters = test_utils::get_test_parameters();
        let raster = loader()
            .load(&parameters, &chunk(0.05, 0.2), datetime!(2015-01-01 10:00 UTC))
            .unwrap();
        assert_eq!(None, raster);
    }

    #[test]
    fn load_deterministic_shared_rows() {
        let parameters = test_utils::get_test_parameters();
        let time = datetime!(2015-01-01 10:00 UTC);
        let low = loader().load(&parameters, &chunk(-1.0, 0.0), time).unwrap().unwrap();
        let high = loader().load(&parameters, &chunk(0.0, 1.0), time).unwrap().unwrap();
        assert_eq!(0.0, low.latitude[4]);
        assert_eq!(0.0, high.latitude[0]);
        assert_eq!(
            low.bands["nir"].select(ndarray::Axis(1), &[4]),
            high.bands["nir"].select(ndarray::Axis(1), &[0])
        );
    }

    #[test]
    fn load_has_clouds() {
        let parameters = test_utils::get_test_parameters();
        let loader = SyntheticLoader::new(0.05, 16).unwrap();
        let raster = loader
            .load(&parameters, &chunk(-1.0, 1.0), datetime!(2015-01-01 10:00 UTC))
            .unwrap()
            .unwrap();
        let pixels = 41 * 41;
        let clear = raster.bands["red"].count_valid(loader.no_data());
        assert!(clear < pixels && clear > pixels / 2, "{clear} of {pixels}");
    }
}
