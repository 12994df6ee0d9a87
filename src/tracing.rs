//! Tracing (logging)

use crate::cli::CommandLineArgs;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initlialise tracing (logging)
///
/// Applies a filter based on the `RUST_LOG` environment variable, falling back to enable debug
/// logging for this crate and tower_http if not set.
/// Spans are exported to a Jaeger agent when enabled on the command line.
pub fn init_tracing(args: &CommandLineArgs) {
    let jaeger = args.enable_jaeger.then(|| {
        let tracer = opentelemetry_jaeger::new_agent_pipeline()
            .with_service_name("cubeflow")
            .install_batch(opentelemetry::runtime::Tokio)
            .expect("failed to install Jaeger trace pipeline");
        tracing_opentelemetry::layer().with_tracer(tracer)
    });
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cubeflow=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(jaeger)
        .init();
}

/// Flush and shut down trace export.
pub fn shutdown_tracing() {
    opentelemetry::global::shutdown_tracer_provider();
}
