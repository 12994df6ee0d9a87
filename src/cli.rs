//! Command Line Interface (CLI) arguments.

use clap::{Parser, Subcommand};

/// cubeflow command line interface
#[derive(Clone, Debug, Parser)]
#[command(version, about)]
pub struct CommandLineArgs {
    #[command(subcommand)]
    pub command: Option<Command>,
    /// The IP address on which the server should listen
    #[arg(long, default_value = "0.0.0.0", env = "CUBEFLOW_HOST")]
    pub host: String,
    /// The port to which the server should bind
    #[arg(long, default_value_t = 8080, env = "CUBEFLOW_PORT")]
    pub port: u16,
    /// Maximum time in seconds to wait for operations to complete upon receiving `ctrl+c` signal.
    #[arg(long, default_value_t = 60, env = "CUBEFLOW_SHUTDOWN_TIMEOUT")]
    pub graceful_shutdown_timeout: u64,
    /// Whether to enable sending traces to Jaeger.
    #[arg(long, default_value_t = false, env = "CUBEFLOW_ENABLE_JAEGER")]
    pub enable_jaeger: bool,
    /// Whether to use Rayon for execution of CPU-bound chunk work.
    #[arg(long, default_value_t = false, env = "CUBEFLOW_USE_RAYON")]
    pub use_rayon: bool,
    /// Maximum number of chunk units processed concurrently.
    /// Defaults to the number of CPUs minus one.
    #[arg(long, env = "CUBEFLOW_WORKER_LIMIT")]
    pub worker_limit: Option<usize>,
    /// Capacity of the chunk queue. Further units of a request wait in its feeder task.
    #[arg(long, default_value_t = 1024, env = "CUBEFLOW_QUEUE_CAPACITY")]
    pub queue_capacity: usize,
    /// Path to the request database. A temporary database is used if unset.
    #[arg(long, env = "CUBEFLOW_DATABASE_PATH")]
    pub database_path: Option<String>,
    /// Directory under which result artifacts are written.
    #[arg(long, default_value = "~/.local/share/cubeflow/results", env = "CUBEFLOW_RESULT_ROOT")]
    pub result_root: String,
    /// Pixel size in degrees of synthetic scenes.
    #[arg(long, default_value_t = 0.05, env = "CUBEFLOW_LOADER_RESOLUTION")]
    pub loader_resolution: f64,
    /// Days between synthetic acquisitions.
    #[arg(long, default_value_t = 16, env = "CUBEFLOW_LOADER_REVISIT_DAYS")]
    pub loader_revisit_days: i64,
    /// Area in square degrees of each geographic chunk of a mosaic.
    #[arg(long, default_value_t = 0.5, env = "CUBEFLOW_MOSAIC_GEOGRAPHIC_CHUNK_SIZE")]
    pub mosaic_geographic_chunk_size: f64,
    /// Acquisitions per temporal chunk of a mosaic. Zero puts all acquisitions in one chunk.
    #[arg(long, default_value_t = 5, env = "CUBEFLOW_MOSAIC_TIME_CHUNK_SIZE")]
    pub mosaic_time_chunk_size: usize,
    /// Area in square degrees of each geographic chunk of an NDVI anomaly.
    #[arg(long, default_value_t = 0.5, env = "CUBEFLOW_ANOMALY_GEOGRAPHIC_CHUNK_SIZE")]
    pub anomaly_geographic_chunk_size: f64,
    /// Maximum number of baseline scenes compared against the latest scene of an NDVI anomaly.
    #[arg(long, default_value_t = 8, env = "CUBEFLOW_ANOMALY_BASELINE_LENGTH")]
    pub anomaly_baseline_length: usize,
    /// Fraction of pixels kept when rescaling results, in (0, 1].
    #[arg(long, env = "CUBEFLOW_OUTPUT_FRACTION")]
    pub output_fraction: Option<f64>,
}

/// Subcommands. The server is run when none is given.
#[derive(Clone, Debug, PartialEq, Subcommand)]
pub enum Command {
    /// Serve the HTTP API
    Serve,
    /// Re-dispatch every incomplete request and wait for the queue to drain
    RunPending,
    /// Delete requests and results older than a number of days
    Purge {
        /// Minimum age in days of purged requests
        #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(i64).range(0..))]
        days: i64,
    },
}

impl CommandLineArgs {
    /// The subcommand to run.
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Serve)
    }

    /// Number of concurrent chunk workers.
    pub fn worker_limit(&self) -> usize {
        self.worker_limit
            .unwrap_or_else(|| num_cpus::get().saturating_sub(1))
            .max(1)
    }
}

/// Returns parsed command line arguments.
pub fn parse() -> CommandLineArgs {
    CommandLineArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let args = CommandLineArgs::try_parse_from(["cubeflow"]).unwrap();
        assert_eq!(Command::Serve, args.command());
        assert_eq!(8080, args.port);
        assert_eq!(5, args.mosaic_time_chunk_size);
        assert_eq!(8, args.anomaly_baseline_length);
        assert_eq!(None, args.output_fraction);
        assert!(args.worker_limit() >= 1);
    }

    #[test]
    fn purge() {
        let args = CommandLineArgs::try_parse_from(["cubeflow", "purge", "--days", "7"]).unwrap();
        assert_eq!(Command::Purge { days: 7 }, args.command());
    }

    #[test]
    fn purge_negative_days() {
        let err = CommandLineArgs::try_parse_from(["cubeflow", "purge", "--days=-1"]).unwrap_err();
        assert_eq!(clap::error::ErrorKind::ValueValidation, err.kind());
        assert!(CommandLineArgs::try_parse_from(["cubeflow", "purge", "--days", "-1"]).is_err());
        assert!(CommandLineArgs::try_parse_from(["cubeflow", "purge", "--days", "0"]).is_ok());
    }

    #[test]
    fn run_pending_with_options() {
        let args = CommandLineArgs::try_parse_from([
            "cubeflow",
            "--worker-limit",
            "3",
            "--use-rayon",
            "run-pending",
        ])
        .unwrap();
        assert_eq!(Command::RunPending, args.command());
        assert_eq!(3, args.worker_limit());
        assert!(args.use_rayon);
    }

    #[test]
    fn zero_worker_limit() {
        let args = CommandLineArgs::try_parse_from(["cubeflow", "--worker-limit", "0"]).unwrap();
        assert_eq!(1, args.worker_limit());
    }
}
