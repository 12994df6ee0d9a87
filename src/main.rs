//! This file defines the cubeflow binary entry point.

use cubeflow::app;
use cubeflow::app_state::{AppState, SharedAppState};
use cubeflow::cli::{self, Command, CommandLineArgs};
use cubeflow::metrics;
use cubeflow::server;
use cubeflow::tracing;

use std::process::exit;
use std::sync::Arc;

/// Application entry point
#[tokio::main]
async fn main() {
    let args = cli::parse();
    tracing::init_tracing(&args);
    metrics::register_metrics();
    let state = match AppState::new(&args) {
        Ok(state) => Arc::new(state),
        Err(err) => {
            ::tracing::error!("failed to initialise: {}", err);
            tracing::shutdown_tracing();
            exit(1)
        }
    };

    let succeeded = run(&args, state.clone()).await;
    let flushed = match state.store.flush() {
        Ok(()) => true,
        Err(err) => {
            ::tracing::error!("failed to flush request store: {}", err);
            false
        }
    };
    tracing::shutdown_tracing();
    if !(succeeded && flushed) {
        exit(1)
    }
}

/// Run the selected subcommand, returning whether it succeeded.
async fn run(args: &CommandLineArgs, state: SharedAppState) -> bool {
    match args.command() {
        Command::Serve => {
            let service = app::service(state);
            match server::serve(args, service).await {
                Ok(()) => true,
                Err(err) => {
                    ::tracing::error!("server failed: {}", err);
                    false
                }
            }
        }
        Command::RunPending => match state.dispatcher.run_pending().await {
            Ok(count) => {
                state.dispatcher.drain().await;
                ::tracing::info!("{} pending requests resubmitted", count);
                true
            }
            Err(err) => {
                ::tracing::error!("failed to resubmit pending requests: {}", err);
                false
            }
        },
        Command::Purge { days } => {
            match state
                .dispatcher
                .purge_older_than(time::Duration::days(days))
                .await
            {
                Ok(count) => {
                    ::tracing::info!("{} requests purged", count);
                    true
                }
                Err(err) => {
                    ::tracing::error!("failed to purge requests: {}", err);
                    false
                }
            }
        }
    }
}
