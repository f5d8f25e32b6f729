//! `fuser::Filesystem` adapter.
//!
//! The kernel session thread calls into [`MirrorFs`] synchronously. Every
//! callback that needs the remote side clones the [`MountSession`] and moves
//! the reply onto the tokio runtime, so a slow remote call never stalls the
//! session loop.

use std::ffi::OsStr;
use std::path::Path;

use fuser::{
    BackgroundSession, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyXattr, Request,
};
use libc::c_int;
use tokio::runtime::Handle;

use crate::constants::FS_NAME;
use crate::fs::{MountSession, XattrReply, fill_dir, xattr_reply};

/// Read-only FUSE filesystem backed by a [`MountSession`].
pub struct MirrorFs {
    session: MountSession,
    runtime: Handle,
}

impl MirrorFs {
    pub fn new(session: MountSession, runtime: Handle) -> Self {
        Self { session, runtime }
    }

    /// Mount on a background thread. Dropping the returned session unmounts.
    pub fn spawn_mount(
        self,
        mountpoint: &Path,
        allow_other: bool,
    ) -> std::io::Result<BackgroundSession> {
        let mut options = vec![
            MountOption::RO,
            MountOption::NoDev,
            MountOption::NoSuid,
            MountOption::FSName(FS_NAME.to_string()),
            MountOption::Subtype(FS_NAME.to_string()),
        ];
        if allow_other {
            options.push(MountOption::AllowOther);
        }
        fuser::spawn_mount2(self, mountpoint, &options)
    }
}

impl Filesystem for MirrorFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        let root = self.session.table().root();
        tracing::info!(root = %root.path().display(), "FUSE session started");
        Ok(())
    }

    fn destroy(&mut self) {
        tracing::info!(inodes = self.session.table().len(), "FUSE session ended");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let session = self.session.clone();
        let name = name.to_os_string();
        self.runtime.spawn(async move {
            match session.lookup(parent, &name).await {
                Ok(attr) => reply.entry(&session.attr_ttl(), &attr, 0),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.session.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let session = self.session.clone();
        self.runtime.spawn(async move {
            match session.getattr(ino).await {
                Ok(attr) => reply.attr(&session.attr_ttl(), &attr),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.session.open(ino) {
            Ok(()) => reply.opened(0, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let session = self.session.clone();
        self.runtime.spawn(async move {
            match session.read(ino, offset, size).await {
                Ok(data) => reply.data(&data),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        empty_reply(self.session.release(ino), reply);
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        empty_reply(self.session.release(ino), reply);
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.session.open(ino) {
            Ok(()) => reply.opened(0, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let session = self.session.clone();
        self.runtime.spawn(async move {
            match session.readdir(ino, offset).await {
                Ok(entries) => {
                    let added = fill_dir(&entries, |entry| {
                        reply.add(entry.ino, entry.offset, entry.kind, &entry.name)
                    });
                    tracing::trace!(ino, added, total = entries.len(), "readdir reply");
                    reply.ok();
                }
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn releasedir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        empty_reply(self.session.release(ino), reply);
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let session = self.session.clone();
        self.runtime.spawn(async move {
            match session.statfs().await {
                Ok(stat) => reply.statfs(
                    stat.blocks,
                    stat.bfree,
                    stat.bavail,
                    stat.files,
                    stat.ffree,
                    stat.iosize,
                    stat.namelen,
                    stat.bsize,
                ),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn getxattr(&mut self, _req: &Request<'_>, _ino: u64, _name: &OsStr, size: u32, reply: ReplyXattr) {
        send_xattr(xattr_reply(size), reply);
    }

    fn listxattr(&mut self, _req: &Request<'_>, _ino: u64, size: u32, reply: ReplyXattr) {
        send_xattr(xattr_reply(size), reply);
    }
}

fn empty_reply(result: Result<(), crate::fs::FsError>, reply: ReplyEmpty) {
    match result {
        Ok(()) => reply.ok(),
        Err(e) => reply.error(e.errno()),
    }
}

fn send_xattr(answer: XattrReply, reply: ReplyXattr) {
    match answer {
        XattrReply::Size(size) => reply.size(size),
        XattrReply::Data(data) => reply.data(&data),
    }
}
