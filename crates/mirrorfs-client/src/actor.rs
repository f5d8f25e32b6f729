//! Actor-based RPC bridge.
//!
//! Provides a `Send+Sync` [`ActorHandle`] that wraps Cap'n Proto's `!Send`
//! types. The actor runs in a `spawn_local` task, receiving commands from an
//! mpsc channel and running each one on its own local task, so a slow read
//! never queues a stat behind it.
//!
//! ```text
//!   ActorHandle (Send+Sync)     mpsc      RpcActor (spawn_local, !Send)
//!   ┌─────────────────────┐  ────────▶  ┌──────────────────────────────┐
//!   │ .getattr()          │             │ RpcClient (shared by tasks)  │
//!   │ .readdir()          │  ◀────────  │ lazy connect / reconnect     │
//!   │ .read_all()         │   oneshot   │ one spawn_local per command  │
//!   └─────────────────────┘             └──────────────────────────────┘
//! ```
//!
//! Failed calls are never retried. A call that fails because the transport
//! went away drops the connection so the next command reconnects.

use std::cell::RefCell;
use std::future::Future;
use std::path::Path;
use std::rc::Rc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::Instrument;

use mirrorfs_vfs::{DirEntry, FileAttr, StatFs, VfsError, VfsOps, VfsResult};

use crate::rpc::{RpcClient, RpcError};

// ============================================================================
// Error Type
// ============================================================================

/// Errors from the actor system.
#[derive(Debug, thiserror::Error)]
pub enum ActorError {
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),
    #[error("actor shut down")]
    Shutdown,
}

impl From<ActorError> for VfsError {
    fn from(e: ActorError) -> Self {
        match e {
            ActorError::Rpc(RpcError::NoResult) => VfsError::cancelled("call returned no result"),
            other => VfsError::remote(other.to_string()),
        }
    }
}

// ============================================================================
// Commands (internal)
// ============================================================================

type Reply<T> = oneshot::Sender<Result<T, ActorError>>;

/// Internal command sent from ActorHandle → RpcActor via mpsc.
enum RpcCommand {
    StatFs { path: String, reply: Reply<StatFs> },
    FileInfo { path: String, reply: Reply<FileAttr> },
    ReadDir { path: String, reply: Reply<Vec<DirEntry>> },
    ReadFile { path: String, reply: Reply<Vec<u8>> },
}

/// A command plus the caller's span, so the remote call joins its trace.
struct Envelope {
    command: RpcCommand,
    span: tracing::Span,
}

// ============================================================================
// ActorHandle (Send + Sync public API)
// ============================================================================

/// Send+Sync handle to an RPC actor running in a LocalSet.
///
/// Each method sends a command via mpsc and awaits the oneshot reply.
/// Dropping the returned future abandons the call and cancels the remote
/// request. The handle can be cloned and shared across threads.
#[derive(Clone)]
pub struct ActorHandle {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl ActorHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> RpcCommand,
    ) -> Result<T, ActorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Envelope {
                command: make(reply),
                span: tracing::Span::current(),
            })
            .map_err(|_| ActorError::Shutdown)?;
        rx.await.map_err(|_| ActorError::Shutdown)?
    }

    /// Filesystem statistics for the filesystem holding `path`.
    pub async fn stat_filesystem(&self, path: &str) -> Result<StatFs, ActorError> {
        let path = path.to_string();
        self.request(|reply| RpcCommand::StatFs { path, reply }).await
    }

    /// Stat one entry.
    pub async fn stat_entry(&self, path: &str) -> Result<FileAttr, ActorError> {
        let path = path.to_string();
        self.request(|reply| RpcCommand::FileInfo { path, reply }).await
    }

    /// List a directory.
    pub async fn list_directory(&self, path: &str) -> Result<Vec<DirEntry>, ActorError> {
        let path = path.to_string();
        self.request(|reply| RpcCommand::ReadDir { path, reply }).await
    }

    /// Read a whole file.
    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>, ActorError> {
        let path = path.to_string();
        self.request(|reply| RpcCommand::ReadFile { path, reply }).await
    }
}

fn path_str(path: &Path) -> VfsResult<&str> {
    path.to_str()
        .ok_or_else(|| VfsError::invalid_path(path.display().to_string()))
}

#[async_trait]
impl VfsOps for ActorHandle {
    async fn statfs(&self, path: &Path) -> VfsResult<StatFs> {
        Ok(self.stat_filesystem(path_str(path)?).await?)
    }

    async fn getattr(&self, path: &Path) -> VfsResult<FileAttr> {
        Ok(self.stat_entry(path_str(path)?).await?)
    }

    async fn readdir(&self, path: &Path) -> VfsResult<Vec<DirEntry>> {
        Ok(self.list_directory(path_str(path)?).await?)
    }

    async fn read_all(&self, path: &Path) -> VfsResult<Vec<u8>> {
        Ok(self.read_file(path_str(path)?).await?)
    }
}

// ============================================================================
// RpcActor (!Send, runs in LocalSet)
// ============================================================================

/// Held by the actor when connected.
struct ConnectionState {
    client: RpcClient,
    /// Bumped on every connect, so a stale failure can't drop a fresh connection.
    generation: u64,
}

type SharedConnection = Rc<RefCell<Option<ConnectionState>>>;

struct RpcActor {
    addr: String,
    /// Live connection state (None = disconnected, will reconnect)
    connection: SharedConnection,
    generation: u64,
}

impl RpcActor {
    fn new(addr: String, existing: Option<RpcClient>) -> Self {
        let connection = existing.map(|client| ConnectionState {
            client,
            generation: 0,
        });
        Self {
            addr,
            connection: Rc::new(RefCell::new(connection)),
            generation: 0,
        }
    }

    /// Ensure we have a live connection, reconnecting if needed.
    async fn ensure_connected(&mut self) -> Result<(RpcClient, u64), ActorError> {
        if let Some(conn) = self.connection.borrow().as_ref() {
            return Ok((conn.client.clone(), conn.generation));
        }

        tracing::info!("Actor connecting to {}", self.addr);

        let client = crate::connect_tcp(&self.addr)
            .await
            .map_err(|e| ActorError::ConnectionLost(format!("{}: {e}", self.addr)))?;

        self.generation += 1;
        *self.connection.borrow_mut() = Some(ConnectionState {
            client: client.clone(),
            generation: self.generation,
        });
        Ok((client, self.generation))
    }

    /// Process commands until the channel closes.
    ///
    /// Connecting is the only step done inline; the calls themselves run
    /// concurrently on their own local tasks.
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Envelope>) {
        while let Some(Envelope { command, span }) = rx.recv().await {
            let (client, generation) = match self.ensure_connected().await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!("{}", e);
                    command.fail(e);
                    continue;
                }
            };
            let connection = self.connection.clone();
            tokio::task::spawn_local(
                command
                    .execute(client, Disconnector { connection, generation })
                    .instrument(span),
            );
        }
        tracing::debug!("Actor shutting down: channel closed");
    }
}

/// Drops the shared connection if a call proves it dead.
struct Disconnector {
    connection: SharedConnection,
    generation: u64,
}

impl Disconnector {
    fn observe(&self, error: &RpcError) {
        if !error.is_disconnected() {
            return;
        }
        let mut connection = self.connection.borrow_mut();
        if connection.as_ref().map(|c| c.generation) == Some(self.generation) {
            tracing::warn!("RPC connection lost, will reconnect on next call: {}", error);
            *connection = None;
        }
    }
}

impl RpcCommand {
    fn fail(self, error: ActorError) {
        match self {
            RpcCommand::StatFs { reply, .. } => drop(reply.send(Err(error))),
            RpcCommand::FileInfo { reply, .. } => drop(reply.send(Err(error))),
            RpcCommand::ReadDir { reply, .. } => drop(reply.send(Err(error))),
            RpcCommand::ReadFile { reply, .. } => drop(reply.send(Err(error))),
        }
    }

    async fn execute(self, client: RpcClient, disconnector: Disconnector) {
        match self {
            RpcCommand::StatFs { path, reply } => {
                complete(reply, &disconnector, client.stat_filesystem(&path)).await
            }
            RpcCommand::FileInfo { path, reply } => {
                complete(reply, &disconnector, client.stat_entry(&path)).await
            }
            RpcCommand::ReadDir { path, reply } => {
                complete(reply, &disconnector, client.list_directory(&path)).await
            }
            RpcCommand::ReadFile { path, reply } => {
                complete(reply, &disconnector, client.read_file(&path)).await
            }
        }
    }
}

/// Run one call to completion, or abandon it once the caller stops waiting.
///
/// Abandoning drops the request promise, which cancels it on the server.
async fn complete<T>(
    mut reply: Reply<T>,
    disconnector: &Disconnector,
    call: impl Future<Output = Result<T, RpcError>>,
) {
    tokio::select! {
        _ = reply.closed() => {
            tracing::debug!("Caller went away, abandoning RPC");
        }
        result = call => {
            if let Err(e) = &result {
                disconnector.observe(e);
            }
            let _ = reply.send(result.map_err(ActorError::from));
        }
    }
}

// ============================================================================
// Public spawn function
// ============================================================================

/// Spawn an RPC actor in the current `LocalSet` context.
///
/// Returns a `Send+Sync` [`ActorHandle`] that can be shared across threads.
///
/// Must be called from within a `tokio::task::LocalSet` context because
/// Cap'n Proto RPC types are `!Send` and must stay on the spawning thread.
///
/// - `addr`: server address, used for the first connect (unless `existing`
///   is given) and for every reconnect
/// - `existing`: optional pre-connected client to avoid double-connect
pub fn spawn_actor(addr: String, existing: Option<RpcClient>) -> ActorHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let actor = RpcActor::new(addr, existing);
    tokio::task::spawn_local(actor.run(rx));
    ActorHandle { tx }
}
