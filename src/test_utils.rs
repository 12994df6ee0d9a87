use crate::apps::anomaly::Anomaly;
use crate::apps::mosaic::Mosaic;
use crate::apps::synthetic::SyntheticLoader;
use crate::cli::CommandLineArgs;
use crate::identity::RequestKind;
use crate::models::*;
use crate::planner::ChunkSizing;
use crate::raster::{Band, Raster};
use crate::registry::Application;

use clap::Parser;
use ndarray::Array3;
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;
use time::macros::date;

/// Create a SubmissionForm for a year of Landsat 7 over a small area.
pub(crate) fn get_test_form() -> SubmissionForm {
    SubmissionForm {
        platform: "LANDSAT_7".to_string(),
        area_id: "colombia".to_string(),
        time_start: "2015-01-01".to_string(),
        time_end: "2015-12-31".to_string(),
        latitude_min: -1.0,
        latitude_max: 1.0,
        longitude_min: -1.0,
        longitude_max: 1.0,
        title: None,
        description: None,
        extra: BTreeMap::new(),
    }
}

/// Create the RequestParameters that canonicalising [get_test_form] yields for a mosaic.
pub(crate) fn get_test_parameters() -> RequestParameters {
    RequestParameters {
        application: "mosaic".to_string(),
        platform: "LANDSAT_7".to_string(),
        product: "ls7_ledaps_colombia".to_string(),
        area_id: "colombia".to_string(),
        time_start: date!(2015 - 01 - 01),
        time_end: date!(2015 - 12 - 31),
        latitude: CoordinateRange::new(-1.0, 1.0).unwrap(),
        longitude: CoordinateRange::new(-1.0, 1.0).unwrap(),
        title: "Base Query".to_string(),
        description: "None".to_string(),
        extra: BTreeMap::new(),
    }
}

/// Create a Raster with an int32 "red" band and a float32 "nir" band.
///
/// Longitudes are spaced by half a degree from zero, so rasters with the same longitude count
/// share their longitude coordinates.
pub(crate) fn get_test_raster(
    times: &[i64],
    latitude: impl IntoIterator<Item = f64>,
    longitude_count: usize,
) -> Raster {
    let latitude = latitude.into_iter().collect::<Vec<_>>();
    let longitude = (0..longitude_count)
        .map(|i| i as f64 * 0.5)
        .collect::<Vec<_>>();
    let shape = (times.len(), latitude.len(), longitude.len());
    let red = Array3::from_shape_fn(shape, |(t, y, x)| (t * 100 + y * 10 + x) as i32);
    let nir = Array3::from_shape_fn(shape, |(t, y, x)| (t + y + x) as f32 / 10.0);
    let bands = BTreeMap::from([
        ("red".to_string(), Band::Int32(red)),
        ("nir".to_string(), Band::Float32(nir)),
    ]);
    Raster::new(times.to_vec(), latitude, longitude, bands).unwrap()
}

/// Create a coarse SyntheticLoader.
pub(crate) fn get_test_loader() -> SyntheticLoader {
    SyntheticLoader::new(0.25, 16).unwrap()
}

/// Create a Mosaic over [get_test_loader] with two geographic chunks per unit square request.
pub(crate) fn get_test_application() -> Arc<dyn Application> {
    let sizing = ChunkSizing {
        geographic: 2.0,
        time: Some(8),
    };
    let mosaic = Mosaic::new(Arc::new(get_test_loader()), sizing, None);
    debug_assert_eq!("mosaic", mosaic.id());
    Arc::new(mosaic)
}

/// Create an NDVI anomaly over [get_test_loader] with a four scene baseline.
pub(crate) fn get_test_anomaly() -> Arc<dyn Application> {
    let anomaly = Anomaly::new(Arc::new(get_test_loader()), 2.0, 4, None).unwrap();
    debug_assert_eq!("ndvi_anomaly", anomaly.id());
    Arc::new(anomaly)
}

/// Create CommandLineArgs for a small, fast deployment.
///
/// Results are written under the returned directory, which is removed when dropped.
pub(crate) fn get_test_args() -> (CommandLineArgs, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut args = CommandLineArgs::parse_from(["cubeflow"]);
    args.database_path = None;
    args.result_root = dir.path().display().to_string();
    args.worker_limit = Some(2);
    args.loader_resolution = 0.25;
    args.mosaic_geographic_chunk_size = 2.0;
    args.mosaic_time_chunk_size = 8;
    args.anomaly_geographic_chunk_size = 2.0;
    args.anomaly_baseline_length = 4;
    (args, dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_result_root_is_private() {
        let (first, first_dir) = get_test_args();
        let (second, _second_dir) = get_test_args();
        assert_ne!(first.result_root, second.result_root);
        assert!(std::path::Path::new(&first.result_root).is_dir());
        drop(first_dir);
        assert!(!std::path::Path::new(&first.result_root).exists());
    }
}
