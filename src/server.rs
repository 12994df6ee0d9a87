//! HTTP server lifecycle

use crate::cli;

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use axum::ServiceExt;
use axum_server::Handle;
use tokio::signal;

/// Returns the address the server binds to.
fn bind_address(args: &cli::CommandLineArgs) -> io::Result<SocketAddr> {
    let ip = args.host.parse::<IpAddr>().map_err(|err| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid listen address {}: {}", args.host, err),
        )
    })?;
    Ok(SocketAddr::new(ip, args.port))
}

/// Serve the cubeflow API until a shutdown signal is received.
///
/// In-flight connections get `graceful_shutdown_timeout` seconds to finish after the signal.
/// Chunk work already queued is not waited for here; incomplete requests are picked up again by
/// the `run-pending` command.
pub async fn serve(args: &cli::CommandLineArgs, service: crate::app::Service) -> io::Result<()> {
    let addr = bind_address(args)?;
    let handle = Handle::new();
    let grace = Duration::from_secs(args.graceful_shutdown_timeout);
    tokio::spawn(shutdown_on_signal(handle.clone(), grace));

    tracing::info!(%addr, "serving requests");
    axum_server::bind(addr)
        .handle(handle)
        .serve(service.into_make_service())
        .await?;
    tracing::info!("server stopped");
    Ok(())
}

/// Resolves when the process receives Ctrl-C or, on unix, SIGTERM.
async fn shutdown_requested() -> io::Result<&'static str> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => result.map(|_| "SIGINT"),
            _ = terminate.recv() => Ok("SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.map(|_| "ctrl-c")
    }
}

async fn shutdown_on_signal(handle: Handle, grace: Duration) {
    match shutdown_requested().await {
        Ok(signal) => tracing::info!(signal, ?grace, "shutting down"),
        Err(err) => tracing::error!("failed to listen for shutdown signals: {}", err),
    }
    handle.graceful_shutdown(Some(grace));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils;

    #[test]
    fn bind_address_ok() {
        let (mut args, _dir) = test_utils::get_test_args();
        args.host = "127.0.0.1".to_string();
        args.port = 9000;
        assert_eq!("127.0.0.1:9000", bind_address(&args).unwrap().to_string());
        args.host = "::1".to_string();
        assert_eq!("[::1]:9000", bind_address(&args).unwrap().to_string());
    }

    #[test]
    fn bind_address_invalid() {
        let (mut args, _dir) = test_utils::get_test_args();
        args.host = "not an address".to_string();
        let err = bind_address(&args).unwrap_err();
        assert_eq!(io::ErrorKind::InvalidInput, err.kind());
    }
}
