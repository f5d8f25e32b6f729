//! mirrorfs client library
//!
//! Mounts a remote mirrorfs export as a local read-only filesystem:
//!
//! - [`rpc`] - Typed Cap'n Proto client; adapts wire records to VFS shapes
//! - [`actor`] - `Send + Sync` handle over the `!Send` RPC client
//! - [`inode`] - Kernel inode identifier ↔ remote path registry
//! - [`fs`] - Transport-agnostic filesystem operations ([`MountSession`])
//! - [`fuse`] - `fuser::Filesystem` adapter driving a [`MountSession`]

pub mod actor;
pub mod constants;
pub mod fs;
pub mod fuse;
pub mod inode;
pub mod rpc;

// Generated Cap'n Proto code
pub mod mirrorfs_capnp {
    include!(concat!(env!("OUT_DIR"), "/mirrorfs_capnp.rs"));
}

pub use actor::{ActorError, ActorHandle, spawn_actor};
pub use fs::{Dirent, FsError, MountSession, XattrReply};
pub use fuse::MirrorFs;
pub use inode::{InodeRecord, InodeTable};
pub use rpc::{RpcClient, RpcError};

/// Connect to a server over TCP and return an RPC client
///
/// Must be called within a `tokio::task::LocalSet` context.
pub async fn connect_tcp(addr: &str) -> Result<RpcClient, ConnectError> {
    use tokio::net::TcpStream;
    use tokio_util::compat::TokioAsyncReadCompatExt;

    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    let client = RpcClient::from_stream(stream.compat()).await?;
    Ok(client)
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
