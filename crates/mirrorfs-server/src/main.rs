//! mirrorfs server binary
//!
//! Exports a directory read-only over Cap'n Proto RPC.
//!
//! ## Usage
//!
//! ```bash
//! mirrorfs-server /srv/export
//! mirrorfs-server /srv/export --listen 0.0.0.0:50000
//! ```
//!
//! There is no authentication on the transport. Bind to a trusted network.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use mirrorfs_server::constants::DEFAULT_LISTEN_ADDR;
#[cfg(feature = "telemetry")]
use mirrorfs_server::constants::SERVICE_NAME;
use mirrorfs_vfs::LocalBackend;

/// Export a directory tree read-only to mirrorfs clients.
#[derive(Parser, Debug)]
#[command(name = "mirrorfs-server")]
#[command(about = "Serve a directory read-only to mirrorfs-mount clients")]
struct Args {
    /// Directory to export; clients may only reach paths beneath it
    root: PathBuf,

    /// Address to listen on
    #[arg(long, default_value = DEFAULT_LISTEN_ADDR)]
    listen: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr));

    #[cfg(feature = "telemetry")]
    let _otel_guard = if mirrorfs_telemetry::otel_enabled() {
        match mirrorfs_telemetry::otel_layer(SERVICE_NAME) {
            Ok((otel_layer, guard)) => {
                registry.with(otel_layer).init();
                Some(guard)
            }
            Err(e) => {
                registry.init();
                tracing::warn!("OTel export disabled: {}", e);
                None
            }
        }
    } else {
        registry.init();
        None
    };
    #[cfg(not(feature = "telemetry"))]
    registry.init();

    let args = Args::parse();

    // Cap'n Proto RPC requires LocalSet for !Send types
    let local_set = tokio::task::LocalSet::new();
    let result = local_set.run_until(run(args)).await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let backend = LocalBackend::open(&args.root)
        .with_context(|| format!("invalid export root {}", args.root.display()))?;
    tracing::info!(root = %backend.root().display(), "Exporting");

    let listener = TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;

    tokio::select! {
        () = mirrorfs_server::serve(listener, Arc::new(backend)) => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, shutting down");
        }
    }

    Ok(())
}
