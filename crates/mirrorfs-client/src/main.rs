//! mirrorfs mount binary
//!
//! Mounts a directory exported by `mirrorfs-server` as a local read-only
//! filesystem.
//!
//! ## Usage
//!
//! ```bash
//! mirrorfs-mount 10.0.0.5:50000 /srv/export/photos /mnt/photos
//! mirrorfs-mount --attr-ttl 10 --allow-other host:50000 / /mnt/remote
//! ```
//!
//! Ctrl-C unmounts and exits.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use tokio::sync::oneshot;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "telemetry")]
use mirrorfs_client::constants::SERVICE_NAME;
use mirrorfs_client::{ActorHandle, MirrorFs, MountSession, connect_tcp, spawn_actor};

/// Mount a remote mirrorfs export.
#[derive(Parser, Debug)]
#[command(name = "mirrorfs-mount")]
#[command(about = "Mount a mirrorfs export as a local read-only filesystem")]
struct Args {
    /// Server address (host:port)
    server: String,

    /// Absolute path on the server to mount
    remote_root: PathBuf,

    /// Local directory to mount on
    mountpoint: PathBuf,

    /// Seconds the kernel may cache attributes and entries
    #[arg(long, default_value_t = 1)]
    attr_ttl: u64,

    /// Let other users access the mount (needs user_allow_other in fuse.conf)
    #[arg(long)]
    allow_other: bool,
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

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

#[tracing::instrument(skip_all, name = "mount.run", fields(server = %args.server))]
async fn run(args: Args) -> anyhow::Result<()> {
    if !args.remote_root.is_absolute() {
        bail!("remote root must be absolute: {}", args.remote_root.display());
    }
    let remote_root = args.remote_root.to_string_lossy().into_owned();

    let rpc = RpcThread::spawn(args.server.clone()).await?;

    let root_attr = rpc
        .handle
        .stat_entry(&remote_root)
        .await
        .with_context(|| format!("cannot stat {} on {}", remote_root, args.server))?;
    if !root_attr.is_dir() {
        bail!("{} on {} is not a directory", remote_root, args.server);
    }

    let session = MountSession::new(Arc::new(rpc.handle.clone()), &args.remote_root)
        .with_attr_ttl(Duration::from_secs(args.attr_ttl));
    let fs = MirrorFs::new(session, tokio::runtime::Handle::current());

    let mount = fs
        .spawn_mount(&args.mountpoint, args.allow_other)
        .with_context(|| format!("failed to mount on {}", args.mountpoint.display()))?;
    tracing::info!(
        remote = %remote_root,
        mountpoint = %args.mountpoint.display(),
        "Mounted"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    tracing::info!("Interrupted, unmounting");

    drop(mount);
    rpc.shutdown();
    Ok(())
}

// ============================================================================
// RPC Thread
// ============================================================================

/// Thread that owns the `!Send` Cap'n Proto connection.
///
/// Runs a single-threaded runtime with a `LocalSet`; the rest of the process
/// only ever sees the `Send + Sync` [`ActorHandle`].
struct RpcThread {
    handle: ActorHandle,
    stop: oneshot::Sender<()>,
    thread: thread::JoinHandle<()>,
}

impl RpcThread {
    /// Connect once up front so a bad address fails before mounting.
    async fn spawn(addr: String) -> anyhow::Result<Self> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop, stop_rx) = oneshot::channel::<()>();

        let thread = thread::Builder::new()
            .name("mirrorfs-rpc".into())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(anyhow::Error::from(e)));
                        return;
                    }
                };
                let local = tokio::task::LocalSet::new();
                local.block_on(&rt, async move {
                    let client = match connect_tcp(&addr).await {
                        Ok(client) => client,
                        Err(e) => {
                            let e = anyhow::Error::from(e).context(format!("cannot reach {}", addr));
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    tracing::info!(%addr, "Connected");

                    let handle = spawn_actor(addr, Some(client));
                    if ready_tx.send(Ok(handle)).is_err() {
                        return;
                    }
                    // Actor tasks run on this LocalSet until asked to stop.
                    let _ = stop_rx.await;
                    tracing::debug!("RPC thread exiting");
                });
            })
            .context("failed to spawn RPC thread")?;

        let handle = ready_rx
            .await
            .context("RPC thread exited during startup")??;
        Ok(Self {
            handle,
            stop,
            thread,
        })
    }

    fn shutdown(self) {
        drop(self.handle);
        let _ = self.stop.send(());
        if self.thread.join().is_err() {
            tracing::warn!("RPC thread panicked");
        }
    }
}
