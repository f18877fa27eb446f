//! FUSE bridge.
//!
//! Adapts [`fuser::Filesystem`]'s inode-addressed callbacks onto the async
//! core. Callbacks run on fuser's dispatch thread and block on the tokio
//! runtime handle; open files live in a per-mount handle table keyed by the
//! kernel's file-handle number. Direct I/O is advertised on every open so
//! the page cache never serves data another mount may have changed, and
//! attr/entry TTLs are zero for the same reason.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::raw::c_int;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use fuser::{
    consts::FOPEN_DIRECT_IO, FileAttr, FileType, Filesystem, KernelConfig, MountOption,
    ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen,
    ReplyWrite, Request, TimeOrNow,
};
use tokio::runtime::Handle;
use tracing::debug;

use crate::config::Settings;
use crate::fs::codec::{EntryType, InodeAttr};
use crate::fs::errors::FsError;
use crate::fs::file::FileHandle;
use crate::fs::{Asdfs, SetAttrs};

const TTL: Duration = Duration::ZERO;

pub struct AsdMount {
    fs: Arc<Asdfs>,
    rt: Handle,
    handles: HashMap<u64, FileHandle>,
    next_fh: u64,
}

impl AsdMount {
    pub fn new(fs: Arc<Asdfs>, rt: Handle) -> Self {
        Self {
            fs,
            rt,
            handles: HashMap::new(),
            next_fh: 1,
        }
    }

    fn register(&mut self, handle: FileHandle) -> u64 {
        let fh = self.next_fh;
        self.next_fh += 1;
        self.handles.insert(fh, handle);
        fh
    }
}

fn entry_kind(entry_type: EntryType) -> FileType {
    match entry_type {
        EntryType::Directory => FileType::Directory,
        EntryType::File => FileType::RegularFile,
        EntryType::Symlink => FileType::Symlink,
    }
}

fn to_file_attr(attr: &InodeAttr) -> FileAttr {
    let atime = SystemTime::from(attr.atime);
    let mtime = SystemTime::from(attr.mtime);
    let ctime = SystemTime::from(attr.ctime);
    FileAttr {
        ino: attr.inode,
        size: attr.size,
        blocks: attr.blocks,
        atime,
        mtime,
        ctime,
        crtime: ctime,
        kind: entry_kind(attr.entry_type()),
        perm: (attr.mode & 0o7777) as u16,
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: attr.rdev,
        blksize: attr.block_size,
        flags: attr.flags,
    }
}

fn time_or_now(t: TimeOrNow) -> DateTime<Utc> {
    match t {
        TimeOrNow::SpecificTime(st) => st.into(),
        TimeOrNow::Now => Utc::now(),
    }
}

/// Entry names cross the boundary as UTF-8; anything else is a key the
/// store cannot hold.
fn name_str(name: &OsStr) -> Result<&str, FsError> {
    name.to_str().ok_or(FsError::Fault)
}

impl Filesystem for AsdMount {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        debug!("fuse session started");
        Ok(())
    }

    fn destroy(&mut self) {
        self.rt.block_on(self.fs.shutdown());
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let result = self.rt.block_on(async {
            let name = name_str(name)?;
            let entry = self.fs.lookup(parent, name).await?;
            match entry.entry_type {
                EntryType::Symlink => self.fs.symlink_attr(entry.inode).await,
                _ => self.fs.getattr(entry.inode).await,
            }
        });
        match result {
            Ok(attr) => reply.entry(&TTL, &to_file_attr(&attr), 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.rt.block_on(self.fs.getattr(ino)) {
            Ok(attr) => reply.attr(&TTL, &to_file_attr(&attr)),
            Err(e) => reply.error(e.errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let changes = SetAttrs {
            mode,
            uid,
            gid,
            size,
            atime: atime.map(time_or_now),
            mtime: mtime.map(time_or_now),
        };
        let result = self.rt.block_on(async {
            self.fs.setattr(ino, &changes).await?;
            self.fs.getattr(ino).await
        });
        match result {
            Ok(attr) => reply.attr(&TTL, &to_file_attr(&attr)),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        match self.rt.block_on(self.fs.readlink(ino)) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let (uid, gid) = (req.uid(), req.gid());
        let result = self.rt.block_on(async {
            let name = name_str(name)?;
            let inode = self.fs.mkdir(parent, name, mode, uid, gid).await?;
            self.fs.getattr(inode).await
        });
        match result {
            Ok(attr) => reply.entry(&TTL, &to_file_attr(&attr), 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = self.rt.block_on(async {
            self.fs.remove(parent, name_str(name)?).await
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = self.rt.block_on(async {
            self.fs.remove(parent, name_str(name)?).await
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let (uid, gid) = (req.uid(), req.gid());
        let result = self.rt.block_on(async {
            let name = name_str(link_name)?;
            let target = target.to_str().ok_or(FsError::Fault)?;
            let inode = self.fs.symlink(parent, name, target, uid, gid).await?;
            self.fs.symlink_attr(inode).await
        });
        match result {
            Ok(attr) => reply.entry(&TTL, &to_file_attr(&attr), 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let result = self.rt.block_on(async {
            self.fs
                .rename(parent, name_str(name)?, newparent, name_str(newname)?)
                .await
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let result = self.rt.block_on(async {
            self.fs.link(newparent, name_str(newname)?, ino).await?;
            self.fs.getattr(ino).await
        });
        match result {
            Ok(attr) => reply.entry(&TTL, &to_file_attr(&attr), 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.rt.block_on(self.fs.open(ino, flags)) {
            Ok(handle) => {
                let fh = self.register(handle);
                reply.opened(fh, FOPEN_DIRECT_IO);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(handle) = self.handles.get(&fh).copied() else {
            reply.error(libc::EBADF);
            return;
        };
        match self.rt.block_on(self.fs.read(handle, offset, size)) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(handle) = self.handles.get(&fh).copied() else {
            reply.error(libc::EBADF);
            return;
        };
        match self.rt.block_on(self.fs.write(handle, offset, data)) {
            Ok(written) => reply.written(written as u32),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.handles.remove(&fh);
        reply.ok();
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let entries = match self.rt.block_on(self.fs.readdir(ino)) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };
        for (i, entry) in entries.iter().enumerate().skip(offset as usize) {
            let next = (i + 1) as i64;
            if reply.add(entry.inode, next, entry_kind(entry.entry_type), &entry.name) {
                break;
            }
        }
        reply.ok();
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let (uid, gid) = (req.uid(), req.gid());
        let result = self.rt.block_on(async {
            let name = name_str(name)?;
            let inode = self.fs.create(parent, name, mode, flags, uid, gid).await?;
            let attr = self.fs.getattr(inode).await?;
            Ok::<_, FsError>((inode, attr))
        });
        match result {
            Ok((inode, attr)) => {
                let fh = self.register(FileHandle { inode, flags });
                reply.created(&TTL, &to_file_attr(&attr), 0, fh, FOPEN_DIRECT_IO);
            }
            Err(e) => reply.error(e.errno()),
        }
    }
}

/// Mount and serve until the kernel unmounts. Blocks the calling thread; run
/// it on the blocking pool so callbacks can block on the runtime.
pub fn serve(
    fs: Arc<Asdfs>,
    settings: &Settings,
    mountpoint: &Path,
    rt: Handle,
) -> anyhow::Result<()> {
    let mut options = vec![
        MountOption::FSName("asd".to_owned()),
        MountOption::Subtype("asdfs".to_owned()),
    ];
    if settings.mount_params.ro {
        options.push(MountOption::RO);
    } else if settings.mount_params.rw {
        options.push(MountOption::RW);
    }
    fuser::mount2(AsdMount::new(fs, rt), mountpoint, &options)?;
    Ok(())
}
