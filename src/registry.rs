//! Applications and the registry they are looked up in.

use crate::error::CubeflowError;
use crate::identity::RequestKind;
use crate::models::{ChunkUnit, Metadata, RequestParameters};
use crate::planner::ChunkSizing;
use crate::raster::{combine_temporal, Raster};
use crate::resample::Resolution;

use hashbrown::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;

/// Output of processing one chunk unit.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChunkOutput {
    /// Processed raster, or `None` when the chunk holds no pixels
    pub raster: Option<Raster>,
    pub metadata: Metadata,
}

/// An application processes chunks of requests of its kind.
///
/// This forms the contract between the dispatcher and aggregator and the
/// processing algorithms.
pub trait Application: RequestKind {
    /// Chunk sizes used when planning requests.
    fn chunk_sizing(&self) -> ChunkSizing;

    /// Whether temporal chunks are planned newest first.
    fn reverse_time(&self) -> bool {
        false
    }

    /// Acquisition times available for a request.
    fn acquisition_dates(
        &self,
        parameters: &RequestParameters,
    ) -> Result<Vec<OffsetDateTime>, CubeflowError>;

    /// Process a single chunk unit.
    ///
    /// This is CPU bound and is run off the async runtime.
    fn process_chunk(
        &self,
        parameters: &RequestParameters,
        unit: &ChunkUnit,
    ) -> Result<ChunkOutput, CubeflowError>;

    /// Fold the merged output of a later temporal chunk into the accumulated output.
    fn recombine_time(&self, accumulated: Raster, next: Raster) -> Result<Raster, CubeflowError> {
        combine_temporal(&[accumulated, next])
    }

    /// Resolution the final output is rescaled to, if any.
    fn output_resolution(&self) -> Option<Resolution> {
        None
    }

    /// Value marking missing observations.
    fn no_data(&self) -> f64 {
        -9999.0
    }
}

/// Registry of applications, keyed by application id.
///
/// Populated at startup and read-only afterwards.
#[derive(Clone, Default)]
pub struct Registry {
    applications: HashMap<String, Arc<dyn Application>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an application under its id.
    pub fn register(&mut self, application: Arc<dyn Application>) -> Result<(), CubeflowError> {
        let id = application.id().to_string();
        if self.applications.contains_key(&id) {
            return Err(CubeflowError::invalid_argument(
                "application",
                format!("{} is already registered", id),
            ));
        }
        self.applications.insert(id, application);
        Ok(())
    }

    /// Look up an application.
    pub fn get(&self, id: &str) -> Result<Arc<dyn Application>, CubeflowError> {
        self.applications
            .get(id)
            .cloned()
            .ok_or_else(|| CubeflowError::UnknownApplication {
                application: id.to_string(),
            })
    }

    /// Registered application ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids = self.applications.keys().cloned().collect::<Vec<_>>();
        ids.sort();
        ids
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Application>> {
        self.applications.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils;

    #[test]
    fn register_and_get() {
        let mut registry = Registry::new();
        registry.register(test_utils::get_test_application()).unwrap();
        assert_eq!(vec!["mosaic".to_string()], registry.ids());
        assert_eq!("mosaic", registry.get("mosaic").unwrap().id());
        assert_eq!(1, registry.iter().count());
    }

    #[test]
    fn register_twice() {
        let mut registry = Registry::new();
        registry.register(test_utils::get_test_application()).unwrap();
        match registry.register(test_utils::get_test_application()).unwrap_err() {
            CubeflowError::InvalidArgument { reason, .. } => {
                assert_eq!("mosaic is already registered", reason)
            }
            err => panic!("unexpected error {:?}", err),
        }
    }

    #[test]
    fn get_unknown() {
        let registry = Registry::new();
        match registry.get("fractional_cover") {
            Err(CubeflowError::UnknownApplication { application }) => {
                assert_eq!("fractional_cover", application)
            }
            Err(err) => panic!("unexpected error {:?}", err),
            Ok(_) => panic!("expected error"),
        }
    }

    #[test]
    fn default_recombine_time() {
        let application = test_utils::get_test_application();
        let early = test_utils::get_test_raster(&[10], [0.0], 1);
        let late = test_utils::get_test_raster(&[20], [0.0], 1);
        // The mosaic overrides recombination; the default concatenates in time.
        struct Concatenating;
        impl RequestKind for Concatenating {
            fn id(&self) -> &str {
                "concatenating"
            }
        }
        impl Application for Concatenating {
            fn chunk_sizing(&self) -> ChunkSizing {
                ChunkSizing {
                    geographic: 1.0,
                    time: None,
                }
            }

            fn acquisition_dates(
                &self,
                _parameters: &RequestParameters,
            ) -> Result<Vec<OffsetDateTime>, CubeflowError> {
                Ok(vec![])
            }

            fn process_chunk(
                &self,
                _parameters: &RequestParameters,
                _unit: &ChunkUnit,
            ) -> Result<ChunkOutput, CubeflowError> {
                Ok(ChunkOutput::default())
            }
        }
        let combined = Concatenating.recombine_time(late.clone(), early.clone()).unwrap();
        assert_eq!(vec![10, 20], combined.times);
        assert_eq!(None, Concatenating.output_resolution());
        assert!(!Concatenating.reverse_time());
        let mosaic = application.recombine_time(late, early).unwrap();
        assert_eq!(vec![20], mosaic.times);
    }
}
