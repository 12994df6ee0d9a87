//! This crate provides cubeflow, a service that runs large satellite-imagery analysis requests
//! by splitting them into geographic and temporal chunks, processing the chunks on a pool of
//! workers and recombining the partial outputs into a single result.
//!
//! A request is identified by its canonical parameters, so resubmitting the same parameters
//! returns the existing request rather than computing it again. Request records and their
//! progress are kept in an embedded database, and finished results are written to disk as JSON
//! artifacts.
//!
//! cubeflow is built on top of a number of open source components.
//!
//! * [Tokio](tokio), the most popular asynchronous Rust runtime.
//! * [Axum](axum) web framework, built by the Tokio team, on top of the [hyper] HTTP library.
//! * [Serde](serde) performs (de)serialisation of JSON request data, records and artifacts.
//! * [sled] stores request records with transactional identity lookups.
//! * [ndarray] provides [NumPy](https://numpy.org)-like n-dimensional arrays used for raster
//!   data.
//! * [Rayon](rayon) optionally runs CPU-bound chunk work on a dedicated thread pool.

pub mod aggregator;
pub mod app;
pub mod app_state;
pub mod apps;
pub mod array;
pub mod baseline;
pub mod cli;
pub mod dispatcher;
pub mod error;
pub mod identity;
pub mod metrics;
pub mod models;
pub mod partition;
pub mod planner;
pub mod raster;
pub mod registry;
pub mod resample;
pub mod resource_manager;
pub mod server;
pub mod store;
#[cfg(test)]
pub mod test_utils;
pub mod tracing;
pub mod validated_json;
