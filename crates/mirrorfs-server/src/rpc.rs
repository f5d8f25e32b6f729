//! Cap'n Proto RPC server implementation
//!
//! Implements the `MirrorFs` capability: four stateless, read-only calls
//! answered by a [`VfsOps`] backend (normally a [`LocalBackend`] confined to
//! the export root). Each call runs under an `rpc.request` span linked to
//! the caller's trace context.
//!
//! [`LocalBackend`]: mirrorfs_vfs::LocalBackend

#![allow(refining_impl_trait)]

use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use capnp::capability::Promise;
use capnp_rpc::pry;
use tracing::Instrument;

use mirrorfs_vfs::{DirEntry, FileAttr, StatFs, VfsError, VfsOps};

use crate::mirrorfs_capnp::{dir_entry, file_info, mirror_fs, rpc_context, stat_fs};

/// Server side of the `MirrorFs` interface.
///
/// Holds nothing but the backend; every call is answered from a fresh query.
pub struct MirrorFsImpl {
    backend: Arc<dyn VfsOps>,
}

impl MirrorFsImpl {
    pub fn new(backend: Arc<dyn VfsOps>) -> Self {
        Self { backend }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn vfs_err_to_capnp(e: VfsError) -> capnp::Error {
    capnp::Error::failed(format!("{}", e))
}

/// Helper to extract path string from capnp text reader
fn get_path_str(text: capnp::text::Reader<'_>) -> Result<String, capnp::Error> {
    text.to_str()
        .map(|s| s.to_owned())
        .map_err(|e| capnp::Error::failed(format!("invalid UTF-8: {}", e)))
}

/// Build the per-call span from the request's trace context.
///
/// A missing or malformed context yields an unlinked span rather than a
/// failed call.
fn call_span(context: capnp::Result<rpc_context::Reader<'_>>, method: &'static str) -> tracing::Span {
    let (traceparent, tracestate) = match context {
        Ok(ctx) => (
            ctx.get_traceparent()
                .ok()
                .and_then(|t| t.to_str().ok())
                .unwrap_or("")
                .to_owned(),
            ctx.get_tracestate()
                .ok()
                .and_then(|t| t.to_str().ok())
                .unwrap_or("")
                .to_owned(),
        ),
        Err(_) => (String::new(), String::new()),
    };
    mirrorfs_telemetry::extract_trace_context(&traceparent, &tracestate, method)
}

fn set_stat_fs(mut builder: stat_fs::Builder<'_>, stat: &StatFs) {
    builder.set_block_size(stat.bsize);
    builder.set_blocks(stat.blocks);
    builder.set_blocks_free(stat.bfree);
    builder.set_blocks_available(stat.bavail);
    builder.set_inodes(stat.files);
    builder.set_inodes_free(stat.ffree);
    builder.set_io_size(stat.iosize);
    builder.set_name_max(stat.namelen);
}

/// Helper to build a FileInfo result
fn set_file_info(mut builder: file_info::Builder<'_>, attr: &FileAttr) {
    builder.set_name(&attr.name);
    builder.set_size(attr.size);
    builder.set_mode(attr.mode());
    let (secs, nanos) = mtime_to_wire(attr.mtime);
    builder.set_mtime_secs(secs);
    builder.set_mtime_nanos(nanos);
    builder.set_is_dir(attr.is_dir());
    builder.set_ino(attr.ino);
}

/// Split a timestamp into whole seconds relative to the epoch (floored, so
/// negative before 1970) and a non-negative nanosecond remainder.
fn mtime_to_wire(mtime: SystemTime) -> (i64, u32) {
    match mtime.duration_since(UNIX_EPOCH) {
        Ok(after) => (after.as_secs() as i64, after.subsec_nanos()),
        Err(e) => {
            let before = e.duration();
            let secs = -(before.as_secs() as i64);
            match before.subsec_nanos() {
                0 => (secs, 0),
                n => (secs - 1, 1_000_000_000 - n),
            }
        }
    }
}

fn set_dir_entry(mut builder: dir_entry::Builder<'_>, entry: &DirEntry) {
    builder.set_name(&entry.name);
    builder.set_is_dir(entry.is_dir());
    builder.set_file_mode(entry.kind.mode_bits());
    set_file_info(builder.init_info(), &entry.attr);
}

// ============================================================================
// MirrorFs
// ============================================================================

impl mirror_fs::Server for MirrorFsImpl {
    fn stat_fs(
        self: Rc<Self>,
        params: mirror_fs::StatFsParams,
        mut results: mirror_fs::StatFsResults,
    ) -> Promise<(), capnp::Error> {
        let params = pry!(params.get());
        let path = pry!(params.get_name().and_then(get_path_str));
        let span = call_span(params.get_context(), "statFs");
        let backend = self.backend.clone();

        Promise::from_future(
            async move {
                tracing::debug!(path = %path, "statFs");
                let stat = backend
                    .statfs(Path::new(&path))
                    .await
                    .map_err(vfs_err_to_capnp)?;
                set_stat_fs(results.get().init_result(), &stat);
                Ok(())
            }
            .instrument(span),
        )
    }

    fn file_info(
        self: Rc<Self>,
        params: mirror_fs::FileInfoParams,
        mut results: mirror_fs::FileInfoResults,
    ) -> Promise<(), capnp::Error> {
        let params = pry!(params.get());
        let path = pry!(params.get_name().and_then(get_path_str));
        let span = call_span(params.get_context(), "fileInfo");
        let backend = self.backend.clone();

        Promise::from_future(
            async move {
                tracing::debug!(path = %path, "fileInfo");
                let attr = backend
                    .getattr(Path::new(&path))
                    .await
                    .map_err(vfs_err_to_capnp)?;
                set_file_info(results.get().init_result(), &attr);
                Ok(())
            }
            .instrument(span),
        )
    }

    fn read_dir(
        self: Rc<Self>,
        params: mirror_fs::ReadDirParams,
        mut results: mirror_fs::ReadDirResults,
    ) -> Promise<(), capnp::Error> {
        let params = pry!(params.get());
        let path = pry!(params.get_name().and_then(get_path_str));
        let span = call_span(params.get_context(), "readDir");
        let backend = self.backend.clone();

        Promise::from_future(
            async move {
                let entries = backend
                    .readdir(Path::new(&path))
                    .await
                    .map_err(vfs_err_to_capnp)?;
                tracing::debug!(path = %path, count = entries.len(), "readDir");
                let mut builder = results.get().init_result(entries.len() as u32);
                for (i, entry) in entries.iter().enumerate() {
                    set_dir_entry(builder.reborrow().get(i as u32), entry);
                }
                Ok(())
            }
            .instrument(span),
        )
    }

    fn read_file(
        self: Rc<Self>,
        params: mirror_fs::ReadFileParams,
        mut results: mirror_fs::ReadFileResults,
    ) -> Promise<(), capnp::Error> {
        let params = pry!(params.get());
        let path = pry!(params.get_name().and_then(get_path_str));
        let span = call_span(params.get_context(), "readFile");
        let backend = self.backend.clone();

        Promise::from_future(
            async move {
                let data = backend
                    .read_all(Path::new(&path))
                    .await
                    .map_err(vfs_err_to_capnp)?;
                tracing::debug!(path = %path, bytes = data.len(), "readFile");
                results.get().init_result().set_data(&data);
                Ok(())
            }
            .instrument(span),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_mtime_after_epoch() {
        let t = UNIX_EPOCH + Duration::new(1_700_000_000, 250);
        assert_eq!(mtime_to_wire(t), (1_700_000_000, 250));
        assert_eq!(mtime_to_wire(UNIX_EPOCH), (0, 0));
    }

    #[test]
    fn test_mtime_before_epoch_keeps_sign() {
        let whole = UNIX_EPOCH - Duration::from_secs(86_400);
        assert_eq!(mtime_to_wire(whole), (-86_400, 0));

        // 1.5s before the epoch is -2s plus 0.5s
        let fractional = UNIX_EPOCH - Duration::from_millis(1_500);
        assert_eq!(mtime_to_wire(fractional), (-2, 500_000_000));
    }
}
