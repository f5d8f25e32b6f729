//! Cap'n Proto RPC client for mirrorfs
//!
//! Provides a typed interface to the `MirrorFs` capability and adapts its
//! wire records into [`mirrorfs_vfs`] shapes, so nothing above this module
//! sees Cap'n Proto readers.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use capnp_rpc::{RpcSystem, rpc_twoparty_capnp, twoparty};
use futures::AsyncReadExt;

use mirrorfs_vfs::{DirEntry, FileAttr, FileType, StatFs};

use crate::mirrorfs_capnp::{dir_entry, file_info, mirror_fs, rpc_context, stat_fs};

/// RPC client wrapper
///
/// Holds the `MirrorFs` capability bootstrapped from the server. Cloning is
/// cheap and clones share the connection.
///
/// IMPORTANT: Must be created and used within a `tokio::task::LocalSet` context
/// because capnp-rpc's RpcSystem is not Send.
#[derive(Clone)]
pub struct RpcClient {
    fs: mirror_fs::Client,
}

impl RpcClient {
    /// Initialize RPC from any AsyncRead+AsyncWrite stream
    ///
    /// MUST be called within a `tokio::task::LocalSet::run_until()` context.
    pub async fn from_stream<S>(stream: S) -> Result<Self, RpcError>
    where
        S: futures::AsyncRead + futures::AsyncWrite + Unpin + 'static,
    {
        let (reader, writer) = stream.split();

        let rpc_network = Box::new(twoparty::VatNetwork::new(
            futures::io::BufReader::new(reader),
            futures::io::BufWriter::new(writer),
            rpc_twoparty_capnp::Side::Client,
            Default::default(),
        ));

        let mut rpc_system = RpcSystem::new(rpc_network, None);
        let fs: mirror_fs::Client = rpc_system.bootstrap(rpc_twoparty_capnp::Side::Server);

        // Spawn the RPC system to run in the background (requires LocalSet)
        tokio::task::spawn_local(async move {
            if let Err(e) = rpc_system.await {
                tracing::debug!("RPC system ended: {}", e);
            }
        });

        Ok(Self { fs })
    }

    /// Wrap an existing capability (e.g. an in-process server).
    pub fn from_capability(fs: mirror_fs::Client) -> Self {
        Self { fs }
    }

    /// Filesystem statistics for the filesystem holding `path`.
    pub async fn stat_filesystem(&self, path: &str) -> Result<StatFs, RpcError> {
        let mut request = self.fs.stat_fs_request();
        request.get().set_name(path);
        set_context(request.get().init_context());
        let response = request.send().promise.await?;
        let results = response.get()?;
        if !results.has_result() {
            return Err(RpcError::NoResult);
        }
        Ok(parse_stat_fs(results.get_result()?))
    }

    /// Stat one entry, following symlinks.
    pub async fn stat_entry(&self, path: &str) -> Result<FileAttr, RpcError> {
        let mut request = self.fs.file_info_request();
        request.get().set_name(path);
        set_context(request.get().init_context());
        let response = request.send().promise.await?;
        let results = response.get()?;
        if !results.has_result() {
            return Err(RpcError::NoResult);
        }
        parse_file_info(results.get_result()?)
    }

    /// List a directory, in the order the server sent it.
    pub async fn list_directory(&self, path: &str) -> Result<Vec<DirEntry>, RpcError> {
        let mut request = self.fs.read_dir_request();
        request.get().set_name(path);
        set_context(request.get().init_context());
        let response = request.send().promise.await?;
        let results = response.get()?;
        if !results.has_result() {
            return Err(RpcError::NoResult);
        }
        let entries = results.get_result()?;

        let mut result = Vec::with_capacity(entries.len() as usize);
        for entry in entries.iter() {
            result.push(parse_dir_entry(entry)?);
        }
        Ok(result)
    }

    /// Read the whole file. There is no ranged variant.
    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>, RpcError> {
        let mut request = self.fs.read_file_request();
        request.get().set_name(path);
        set_context(request.get().init_context());
        let response = request.send().promise.await?;
        let results = response.get()?;
        if !results.has_result() {
            return Err(RpcError::NoResult);
        }
        Ok(results.get_result()?.get_data()?.to_vec())
    }
}

// ============================================================================
// Wire → VFS adapters
// ============================================================================

fn set_context(mut builder: rpc_context::Builder<'_>) {
    let (traceparent, tracestate) = mirrorfs_telemetry::inject_trace_context();
    builder.set_traceparent(traceparent.as_str());
    builder.set_tracestate(tracestate.as_str());
}

fn parse_stat_fs(stat: stat_fs::Reader<'_>) -> StatFs {
    StatFs {
        blocks: stat.get_blocks(),
        bfree: stat.get_blocks_free(),
        bavail: stat.get_blocks_available(),
        files: stat.get_inodes(),
        ffree: stat.get_inodes_free(),
        bsize: stat.get_block_size(),
        iosize: stat.get_io_size(),
        namelen: stat.get_name_max(),
    }
}

/// Adapt a `FileInfo` record.
///
/// The explicit directory flag wins over the mode's type bits, so a server
/// that only fills `isDir` still produces a directory.
pub(crate) fn parse_file_info(info: file_info::Reader<'_>) -> Result<FileAttr, RpcError> {
    let mut attr = FileAttr::from_mode(
        info.get_name()?.to_string()?,
        info.get_size(),
        info.get_mode(),
        mtime_from_wire(info.get_mtime_secs(), info.get_mtime_nanos()),
        info.get_ino(),
    );
    if info.get_is_dir() {
        attr.kind = FileType::Directory;
    }
    Ok(attr)
}

pub(crate) fn parse_dir_entry(entry: dir_entry::Reader<'_>) -> Result<DirEntry, RpcError> {
    let name = entry.get_name()?.to_string()?;
    let kind = if entry.get_is_dir() {
        FileType::Directory
    } else {
        FileType::from_mode(entry.get_file_mode())
    };
    let mut attr = parse_file_info(entry.get_info()?)?;
    if attr.name.is_empty() {
        attr.name = name.clone();
    }
    Ok(DirEntry { name, kind, attr })
}

fn mtime_from_wire(secs: i64, nanos: u32) -> SystemTime {
    let nanos = Duration::from_nanos(u64::from(nanos.min(999_999_999)));
    let base = if secs >= 0 {
        UNIX_EPOCH.checked_add(Duration::from_secs(secs as u64))
    } else {
        UNIX_EPOCH.checked_sub(Duration::from_secs(secs.unsigned_abs()))
    };
    base.and_then(|t| t.checked_add(nanos)).unwrap_or(UNIX_EPOCH)
}

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("Cap'n Proto error: {0}")]
    Capnp(#[from] capnp::Error),
    #[error("UTF-8 error: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    /// The call completed but carried no result payload.
    #[error("call returned no result")]
    NoResult,
}

impl RpcError {
    /// True when the transport is gone and the next call should reconnect.
    pub fn is_disconnected(&self) -> bool {
        matches!(self, RpcError::Capnp(e) if e.kind == capnp::ErrorKind::Disconnected)
    }
}
