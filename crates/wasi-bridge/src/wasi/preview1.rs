//! The syscalls themselves. Every call takes a view over guest memory and
//! reports failures as an [`Errno`]; only `proc_exit` leaves the module.

use std::time::Duration;

use super::fd::*;
use super::{Errno, WasiCtx, WasiState};
use crate::memory::MemView;
use crate::vfs::{Inode, NodeKind, Vfs, VfsError};

type SysResult<T = ()> = Result<T, Errno>;

const CLOCK_REALTIME: u32 = 0;
const CLOCK_MONOTONIC: u32 = 1;
const CLOCK_PROCESS_CPUTIME: u32 = 2;
const CLOCK_THREAD_CPUTIME: u32 = 3;

const OFLAG_CREAT: u16 = 1 << 0;
const OFLAG_DIRECTORY: u16 = 1 << 1;
const OFLAG_EXCL: u16 = 1 << 2;
const OFLAG_TRUNC: u16 = 1 << 3;

const FSTFLAG_ATIM: u16 = 1 << 0;
const FSTFLAG_ATIM_NOW: u16 = 1 << 1;
const FSTFLAG_MTIM: u16 = 1 << 2;
const FSTFLAG_MTIM_NOW: u16 = 1 << 3;

const WHENCE_SET: u8 = 0;
const WHENCE_CUR: u8 = 1;
const WHENCE_END: u8 = 2;

const EVENTTYPE_CLOCK: u8 = 0;
const EVENTTYPE_FD_READ: u8 = 1;
const EVENTTYPE_FD_WRITE: u8 = 2;
const SUBCLOCKFLAG_ABSTIME: u16 = 1 << 0;

const SUBSCRIPTION_SIZE: u32 = 48;
const EVENT_SIZE: u32 = 32;
const FILESTAT_SIZE: usize = 64;
const DIRENT_SIZE: usize = 24;

/// `base + offset` in guest address space.
fn at(base: u32, offset: usize) -> SysResult<u32> {
    u32::try_from(offset)
        .ok()
        .and_then(|offset| base.checked_add(offset))
        .ok_or(Errno::Fault)
}

/// Drops the hold a closed descriptor had on its inode.
fn release(vfs: &mut Vfs, entry: Option<FdEntry>) {
    if let Some(ino) = entry.as_ref().and_then(FdEntry::ino) {
        vfs.close(ino);
    }
}

fn filetype(kind: NodeKind) -> u8 {
    match kind {
        NodeKind::File => FILETYPE_REGULAR_FILE,
        NodeKind::Directory => FILETYPE_DIRECTORY,
    }
}

fn write_filestat(mem: &mut MemView<'_>, ptr: u32, vfs: &Vfs, ino: Option<Inode>) -> SysResult {
    let mut buf = [0u8; FILESTAT_SIZE];
    match ino {
        Some(ino) => {
            let stat = vfs.stat(ino)?;
            buf[8..16].copy_from_slice(&stat.ino.to_le_bytes());
            buf[16] = filetype(stat.kind);
            buf[24..32].copy_from_slice(&stat.nlink.to_le_bytes());
            buf[32..40].copy_from_slice(&stat.size.to_le_bytes());
            buf[40..48].copy_from_slice(&stat.atim.to_le_bytes());
            buf[48..56].copy_from_slice(&stat.mtim.to_le_bytes());
            buf[56..64].copy_from_slice(&stat.ctim.to_le_bytes());
        }
        None => buf[16] = FILETYPE_CHARACTER_DEVICE,
    }
    mem.write(ptr, &buf)
}

fn write_strings(mem: &mut MemView<'_>, strings: &[String], ptrs: u32, buf: u32) -> SysResult {
    let mut offset = buf;
    for (i, s) in strings.iter().enumerate() {
        mem.write_u32(at(ptrs, i * 4)?, offset)?;
        mem.write(offset, s.as_bytes())?;
        let end = at(offset, s.len())?;
        mem.write_u8(end, 0)?;
        offset = at(end, 1)?;
    }
    Ok(())
}

fn write_sizes(mem: &mut MemView<'_>, strings: &[String], count: u32, size: u32) -> SysResult {
    let total: usize = strings.iter().map(|s| s.len() + 1).sum();
    mem.write_u32(count, u32::try_from(strings.len())?)?;
    mem.write_u32(size, u32::try_from(total)?)
}

/// Concatenates the buffers of a `ciovec` array.
fn gather(mem: &MemView<'_>, iovs: u32, iovs_len: u32) -> SysResult<Vec<u8>> {
    let mut data = Vec::new();
    for (ptr, len) in mem.read_iovecs(iovs, iovs_len)? {
        data.extend_from_slice(&mem.read(ptr, len)?);
    }
    Ok(data)
}

/// Fills the buffers of an `iovec` array from `vfs` starting at `offset`.
/// Stops at the first short read.
fn scatter_file(
    mem: &mut MemView<'_>,
    vfs: &mut Vfs,
    ino: Inode,
    mut offset: u64,
    iovecs: &[(u32, u32)],
) -> SysResult<u64> {
    let size = vfs.stat(ino)?.size;
    let mut total = 0u64;
    for &(ptr, len) in iovecs {
        let want = u64::from(len).min(size.saturating_sub(offset)) as usize;
        let mut buf = vec![0u8; want];
        let n = vfs.read_at(ino, offset, &mut buf)?;
        mem.write(ptr, &buf[..n])?;
        total += n as u64;
        offset += n as u64;
        if n < len as usize {
            break;
        }
    }
    Ok(total)
}

fn split_times(
    now: u64,
    atim: u64,
    mtim: u64,
    fst_flags: u16,
) -> SysResult<(Option<u64>, Option<u64>)> {
    let pick = |value: u64, set: u16, set_now: u16| {
        match (fst_flags & set != 0, fst_flags & set_now != 0) {
            (true, true) => Err(Errno::Inval),
            (true, false) => Ok(Some(value)),
            (false, true) => Ok(Some(now)),
            (false, false) => Ok(None),
        }
    };
    Ok((
        pick(atim, FSTFLAG_ATIM, FSTFLAG_ATIM_NOW)?,
        pick(mtim, FSTFLAG_MTIM, FSTFLAG_MTIM_NOW)?,
    ))
}

enum Subscription {
    Clock { id: u32, timeout: u64, abstime: bool },
    Fd { fd: u32, kind: u8 },
}

struct Event {
    userdata: u64,
    error: u16,
    kind: u8,
    nbytes: u64,
}

impl WasiCtx {
    pub(super) fn args_get(&self, mem: &mut MemView<'_>, argv: u32, argv_buf: u32) -> SysResult {
        write_strings(mem, &self.args, argv, argv_buf)
    }

    pub(super) fn args_sizes_get(&self, mem: &mut MemView<'_>, argc: u32, size: u32) -> SysResult {
        write_sizes(mem, &self.args, argc, size)
    }

    pub(super) fn environ_get(&self, mem: &mut MemView<'_>, environ: u32, buf: u32) -> SysResult {
        write_strings(mem, &self.env, environ, buf)
    }

    pub(super) fn environ_sizes_get(
        &self,
        mem: &mut MemView<'_>,
        count: u32,
        size: u32,
    ) -> SysResult {
        write_sizes(mem, &self.env, count, size)
    }

    fn now(&self, id: u32) -> SysResult<u64> {
        match id {
            CLOCK_REALTIME => Ok(self.clock.realtime()),
            CLOCK_MONOTONIC | CLOCK_PROCESS_CPUTIME | CLOCK_THREAD_CPUTIME => {
                Ok(self.clock.monotonic())
            }
            _ => Err(Errno::Inval),
        }
    }

    pub(super) fn clock_res_get(&self, mem: &mut MemView<'_>, id: u32, res: u32) -> SysResult {
        self.now(id)?;
        mem.write_u64(res, 1_000)
    }

    pub(super) fn clock_time_get(&self, mem: &mut MemView<'_>, id: u32, time: u32) -> SysResult {
        let now = self.now(id)?;
        mem.write_u64(time, now)
    }

    pub(super) fn fd_advise(&self, fd: u32) -> SysResult {
        match self.lock().fds.get(fd)?.kind {
            FdKind::File { .. } => Ok(()),
            _ => Err(Errno::Badf),
        }
    }

    pub(super) fn fd_allocate(&self, fd: u32, offset: u64, len: u64) -> SysResult {
        let mut guard = self.lock();
        let WasiState { vfs, fds, .. } = &mut *guard;
        let FdKind::File { ino, .. } = fds.get(fd)?.kind else {
            return Err(Errno::Badf);
        };
        let end = offset.checked_add(len).ok_or(Errno::Inval)?;
        if vfs.stat(ino)?.size < end {
            vfs.set_len(ino, end)?;
        }
        Ok(())
    }

    pub(super) fn fd_close(&self, fd: u32) -> SysResult {
        let mut guard = self.lock();
        let WasiState { vfs, fds, .. } = &mut *guard;
        release(vfs, Some(fds.remove(fd)?));
        Ok(())
    }

    /// `fd_sync` and `fd_datasync`: nothing is buffered, only the descriptor
    /// is checked.
    pub(super) fn fd_sync(&self, fd: u32) -> SysResult {
        self.lock().fds.get(fd).map(|_| ())
    }

    pub(super) fn fd_fdstat_get(&self, mem: &mut MemView<'_>, fd: u32, ptr: u32) -> SysResult {
        let entry = self.lock().fds.get(fd)?.clone();
        let mut buf = [0u8; 24];
        buf[0] = entry.filetype();
        buf[2..4].copy_from_slice(&entry.flags.to_le_bytes());
        buf[8..16].copy_from_slice(&entry.rights_base.to_le_bytes());
        buf[16..24].copy_from_slice(&entry.rights_inheriting.to_le_bytes());
        mem.write(ptr, &buf)
    }

    pub(super) fn fd_fdstat_set_flags(&self, fd: u32, flags: u16) -> SysResult {
        self.lock().fds.get_mut(fd)?.flags = flags;
        Ok(())
    }

    /// Rights can only be dropped, never gained.
    pub(super) fn fd_fdstat_set_rights(&self, fd: u32, base: u64, inheriting: u64) -> SysResult {
        let mut guard = self.lock();
        let entry = guard.fds.get_mut(fd)?;
        if base & !entry.rights_base != 0 || inheriting & !entry.rights_inheriting != 0 {
            return Err(Errno::Notcapable);
        }
        entry.rights_base = base;
        entry.rights_inheriting = inheriting;
        Ok(())
    }

    pub(super) fn fd_filestat_get(&self, mem: &mut MemView<'_>, fd: u32, ptr: u32) -> SysResult {
        let guard = self.lock();
        let ino = match guard.fds.get(fd)?.kind {
            FdKind::File { ino, .. } | FdKind::Dir { ino, .. } => Some(ino),
            _ => None,
        };
        write_filestat(mem, ptr, &guard.vfs, ino)
    }

    pub(super) fn fd_filestat_set_size(&self, fd: u32, size: u64) -> SysResult {
        let mut guard = self.lock();
        let WasiState { vfs, fds, .. } = &mut *guard;
        let entry = fds.get(fd)?;
        let FdKind::File { ino, .. } = entry.kind else {
            return Err(Errno::Badf);
        };
        entry.require(RIGHT_FD_WRITE)?;
        Ok(vfs.set_len(ino, size)?)
    }

    pub(super) fn fd_filestat_set_times(
        &self,
        fd: u32,
        atim: u64,
        mtim: u64,
        fst_flags: u16,
    ) -> SysResult {
        let mut guard = self.lock();
        let WasiState { vfs, fds, .. } = &mut *guard;
        let ino = match fds.get(fd)?.kind {
            FdKind::File { ino, .. } | FdKind::Dir { ino, .. } => ino,
            _ => return Err(Errno::Badf),
        };
        let (atim, mtim) = split_times(vfs.now(), atim, mtim, fst_flags)?;
        Ok(vfs.set_times(ino, atim, mtim)?)
    }

    pub(super) fn fd_pread(
        &self,
        mem: &mut MemView<'_>,
        fd: u32,
        iovs: u32,
        iovs_len: u32,
        offset: u64,
        nread: u32,
    ) -> SysResult {
        let iovecs = mem.read_iovecs(iovs, iovs_len)?;
        let mut guard = self.lock();
        let WasiState { vfs, fds, .. } = &mut *guard;
        let entry = fds.get(fd)?;
        entry.require(RIGHT_FD_READ)?;
        let n = match entry.kind {
            FdKind::File { ino, .. } => scatter_file(mem, vfs, ino, offset, &iovecs)?,
            FdKind::Dir { .. } => return Err(Errno::Isdir),
            _ => return Err(Errno::Spipe),
        };
        mem.write_u32(nread, u32::try_from(n)?)
    }

    pub(super) fn fd_pwrite(
        &self,
        mem: &mut MemView<'_>,
        fd: u32,
        iovs: u32,
        iovs_len: u32,
        offset: u64,
        nwritten: u32,
    ) -> SysResult {
        let data = gather(mem, iovs, iovs_len)?;
        let mut guard = self.lock();
        let WasiState { vfs, fds, .. } = &mut *guard;
        let entry = fds.get(fd)?;
        entry.require(RIGHT_FD_WRITE)?;
        let n = match entry.kind {
            FdKind::File { ino, .. } => vfs.write_at(ino, offset, &data)?,
            FdKind::Dir { .. } => return Err(Errno::Isdir),
            _ => return Err(Errno::Spipe),
        };
        mem.write_u32(nwritten, u32::try_from(n)?)
    }

    pub(super) fn fd_prestat_get(&self, mem: &mut MemView<'_>, fd: u32, ptr: u32) -> SysResult {
        let guard = self.lock();
        let FdKind::Dir {
            preopen: Some(name),
            ..
        } = &guard.fds.get(fd)?.kind
        else {
            return Err(Errno::Badf);
        };
        let mut buf = [0u8; 8];
        buf[4..8].copy_from_slice(&u32::try_from(name.len())?.to_le_bytes());
        mem.write(ptr, &buf)
    }

    pub(super) fn fd_prestat_dir_name(
        &self,
        mem: &mut MemView<'_>,
        fd: u32,
        path: u32,
        path_len: u32,
    ) -> SysResult {
        let guard = self.lock();
        let FdKind::Dir {
            preopen: Some(name),
            ..
        } = &guard.fds.get(fd)?.kind
        else {
            return Err(Errno::Badf);
        };
        if (path_len as usize) < name.len() {
            return Err(Errno::Nametoolong);
        }
        mem.write(path, name.as_bytes())
    }

    pub(super) fn fd_read(
        &self,
        mem: &mut MemView<'_>,
        fd: u32,
        iovs: u32,
        iovs_len: u32,
        nread: u32,
    ) -> SysResult {
        let iovecs = mem.read_iovecs(iovs, iovs_len)?;
        let mut guard = self.lock();
        let WasiState {
            vfs,
            fds,
            stdin,
            stdin_pos,
            ..
        } = &mut *guard;
        let entry = fds.get_mut(fd)?;
        entry.require(RIGHT_FD_READ)?;
        let n = match &mut entry.kind {
            FdKind::Stdin => {
                let mut total = 0;
                for &(ptr, len) in &iovecs {
                    let rest = &stdin[*stdin_pos..];
                    let n = rest.len().min(len as usize);
                    mem.write(ptr, &rest[..n])?;
                    *stdin_pos += n;
                    total += n as u64;
                    if n < len as usize {
                        break;
                    }
                }
                total
            }
            FdKind::File { ino, offset } => {
                let n = scatter_file(mem, vfs, *ino, *offset, &iovecs)?;
                *offset += n;
                n
            }
            FdKind::Dir { .. } => return Err(Errno::Isdir),
            _ => return Err(Errno::Badf),
        };
        mem.write_u32(nread, u32::try_from(n)?)
    }

    pub(super) fn fd_readdir(
        &self,
        mem: &mut MemView<'_>,
        fd: u32,
        buf: u32,
        buf_len: u32,
        cookie: u64,
        bufused: u32,
    ) -> SysResult {
        let guard = self.lock();
        let ino = match guard.fds.get(fd)?.kind {
            FdKind::Dir { ino, .. } => ino,
            _ => return Err(Errno::Notdir),
        };
        let vfs = &guard.vfs;
        let mut entries = vec![
            (".".to_string(), ino, NodeKind::Directory),
            ("..".to_string(), vfs.parent(ino)?, NodeKind::Directory),
        ];
        entries.extend(vfs.read_dir(ino)?.into_iter().map(|e| (e.name, e.ino, e.kind)));

        let buf_len = buf_len as usize;
        let mut out = Vec::new();
        let skip = usize::try_from(cookie).unwrap_or(usize::MAX);
        for (i, (name, ino, kind)) in entries.iter().enumerate().skip(skip) {
            if out.len() >= buf_len {
                break;
            }
            let mut header = [0u8; DIRENT_SIZE];
            header[0..8].copy_from_slice(&(i as u64 + 1).to_le_bytes());
            header[8..16].copy_from_slice(&ino.to_le_bytes());
            header[16..20].copy_from_slice(&u32::try_from(name.len())?.to_le_bytes());
            header[20] = filetype(*kind);
            out.extend_from_slice(&header);
            out.extend_from_slice(name.as_bytes());
        }
        // a full buffer tells the caller to come back with a larger one
        out.truncate(buf_len);
        mem.write(buf, &out)?;
        mem.write_u32(bufused, u32::try_from(out.len())?)
    }

    pub(super) fn fd_renumber(&self, from: u32, to: u32) -> SysResult {
        let mut guard = self.lock();
        let WasiState { vfs, fds, .. } = &mut *guard;
        release(vfs, fds.renumber(from, to)?);
        Ok(())
    }

    pub(super) fn fd_seek(
        &self,
        mem: &mut MemView<'_>,
        fd: u32,
        delta: i64,
        whence: u8,
        newoffset: u32,
    ) -> SysResult {
        let mut guard = self.lock();
        let WasiState { vfs, fds, .. } = &mut *guard;
        let FdKind::File { ino, offset } = &mut fds.get_mut(fd)?.kind else {
            return Err(Errno::Spipe);
        };
        let base = match whence {
            WHENCE_SET => 0,
            WHENCE_CUR => i128::from(*offset),
            WHENCE_END => i128::from(vfs.stat(*ino)?.size),
            _ => return Err(Errno::Inval),
        };
        let target = u64::try_from(base + i128::from(delta)).map_err(|_| Errno::Inval)?;
        *offset = target;
        mem.write_u64(newoffset, target)
    }

    pub(super) fn fd_tell(&self, mem: &mut MemView<'_>, fd: u32, ptr: u32) -> SysResult {
        let FdKind::File { offset, .. } = self.lock().fds.get(fd)?.kind else {
            return Err(Errno::Spipe);
        };
        mem.write_u64(ptr, offset)
    }

    pub(super) fn fd_write(
        &self,
        mem: &mut MemView<'_>,
        fd: u32,
        iovs: u32,
        iovs_len: u32,
        nwritten: u32,
    ) -> SysResult {
        let data = gather(mem, iovs, iovs_len)?;
        let mut guard = self.lock();
        let WasiState {
            vfs,
            fds,
            stdout,
            stderr,
            ..
        } = &mut *guard;
        let entry = fds.get_mut(fd)?;
        entry.require(RIGHT_FD_WRITE)?;
        let append = entry.flags & FDFLAG_APPEND != 0;
        match &mut entry.kind {
            FdKind::Stdout => stdout.write(&data)?,
            FdKind::Stderr => stderr.write(&data)?,
            FdKind::File { ino, offset } => {
                if append {
                    *offset = vfs.stat(*ino)?.size;
                }
                let n = vfs.write_at(*ino, *offset, &data)?;
                *offset += n as u64;
            }
            FdKind::Dir { .. } => return Err(Errno::Isdir),
            FdKind::Stdin => return Err(Errno::Badf),
        }
        mem.write_u32(nwritten, u32::try_from(data.len())?)
    }

    pub(super) fn path_create_directory(
        &self,
        mem: &mut MemView<'_>,
        fd: u32,
        path: u32,
        path_len: u32,
    ) -> SysResult {
        let path = mem.read_str(path, path_len)?;
        let mut guard = self.lock();
        let WasiState { vfs, fds, .. } = &mut *guard;
        let (parent, name) = vfs.resolve_parent(fds.get(fd)?.dir_ino()?, &path)?;
        vfs.create_dir(parent, &name)?;
        Ok(())
    }

    pub(super) fn path_filestat_get(
        &self,
        mem: &mut MemView<'_>,
        fd: u32,
        path: u32,
        path_len: u32,
        buf: u32,
    ) -> SysResult {
        let path = mem.read_str(path, path_len)?;
        let guard = self.lock();
        let ino = guard.vfs.resolve(guard.fds.get(fd)?.dir_ino()?, &path)?;
        write_filestat(mem, buf, &guard.vfs, Some(ino))
    }

    #[allow(clippy::too_many_arguments)]
    pub(super) fn path_filestat_set_times(
        &self,
        mem: &mut MemView<'_>,
        fd: u32,
        path: u32,
        path_len: u32,
        atim: u64,
        mtim: u64,
        fst_flags: u16,
    ) -> SysResult {
        let path = mem.read_str(path, path_len)?;
        let mut guard = self.lock();
        let WasiState { vfs, fds, .. } = &mut *guard;
        let ino = vfs.resolve(fds.get(fd)?.dir_ino()?, &path)?;
        let (atim, mtim) = split_times(vfs.now(), atim, mtim, fst_flags)?;
        Ok(vfs.set_times(ino, atim, mtim)?)
    }

    #[allow(clippy::too_many_arguments)]
    pub(super) fn path_open(
        &self,
        mem: &mut MemView<'_>,
        dirfd: u32,
        path: u32,
        path_len: u32,
        oflags: u16,
        rights_base: u64,
        rights_inheriting: u64,
        fdflags: u16,
        fd_ptr: u32,
    ) -> SysResult {
        let path = mem.read_str(path, path_len)?;
        let mut guard = self.lock();
        let WasiState { vfs, fds, .. } = &mut *guard;
        let dir = fds.get(dirfd)?;
        let base = dir.dir_ino()?;
        let rights_base = rights_base & dir.rights_inheriting;
        let rights_inheriting = rights_inheriting & dir.rights_inheriting;

        let ino = match vfs.resolve(base, &path) {
            Ok(_) if oflags & OFLAG_CREAT != 0 && oflags & OFLAG_EXCL != 0 => {
                return Err(Errno::Exist);
            }
            Ok(ino) => ino,
            Err(VfsError::NotFound(_)) if oflags & OFLAG_CREAT != 0 => {
                let (parent, name) = vfs.resolve_parent(base, &path)?;
                vfs.create_file(parent, &name)?
            }
            Err(err) => return Err(err.into()),
        };
        let entry = match vfs.kind(ino)? {
            NodeKind::Directory if oflags & OFLAG_TRUNC != 0 => return Err(Errno::Isdir),
            NodeKind::Directory => FdEntry::dir(ino, rights_base, rights_inheriting),
            NodeKind::File if oflags & OFLAG_DIRECTORY != 0 => return Err(Errno::Notdir),
            NodeKind::File => {
                if oflags & OFLAG_TRUNC != 0 {
                    vfs.set_len(ino, 0)?;
                }
                FdEntry::file(ino, rights_base, fdflags)
            }
        };
        vfs.open(ino)?;
        let fd = fds.insert(entry);
        if let Err(err) = mem.write_u32(fd_ptr, fd) {
            release(vfs, Some(fds.remove(fd)?));
            return Err(err);
        }
        log::trace!("path_open {path:?} -> fd {fd}");
        Ok(())
    }

    pub(super) fn path_readlink(
        &self,
        mem: &mut MemView<'_>,
        fd: u32,
        path: u32,
        path_len: u32,
    ) -> SysResult {
        let path = mem.read_str(path, path_len)?;
        let guard = self.lock();
        guard.vfs.resolve(guard.fds.get(fd)?.dir_ino()?, &path)?;
        // there are no symlinks
        Err(Errno::Inval)
    }

    pub(super) fn path_remove_directory(
        &self,
        mem: &mut MemView<'_>,
        fd: u32,
        path: u32,
        path_len: u32,
    ) -> SysResult {
        let path = mem.read_str(path, path_len)?;
        let mut guard = self.lock();
        let WasiState { vfs, fds, .. } = &mut *guard;
        let (parent, name) = vfs.resolve_parent(fds.get(fd)?.dir_ino()?, &path)?;
        Ok(vfs.remove_dir(parent, &name)?)
    }

    #[allow(clippy::too_many_arguments)]
    pub(super) fn path_rename(
        &self,
        mem: &mut MemView<'_>,
        old_fd: u32,
        old_path: u32,
        old_len: u32,
        new_fd: u32,
        new_path: u32,
        new_len: u32,
    ) -> SysResult {
        let old_path = mem.read_str(old_path, old_len)?;
        let new_path = mem.read_str(new_path, new_len)?;
        let mut guard = self.lock();
        let WasiState { vfs, fds, .. } = &mut *guard;
        let (old_parent, old_name) = vfs.resolve_parent(fds.get(old_fd)?.dir_ino()?, &old_path)?;
        let (new_parent, new_name) = vfs.resolve_parent(fds.get(new_fd)?.dir_ino()?, &new_path)?;
        Ok(vfs.rename(old_parent, &old_name, new_parent, &new_name)?)
    }

    pub(super) fn path_unlink_file(
        &self,
        mem: &mut MemView<'_>,
        fd: u32,
        path: u32,
        path_len: u32,
    ) -> SysResult {
        let path = mem.read_str(path, path_len)?;
        let mut guard = self.lock();
        let WasiState { vfs, fds, .. } = &mut *guard;
        let (parent, name) = vfs.resolve_parent(fds.get(fd)?.dir_ino()?, &path)?;
        Ok(vfs.unlink(parent, &name)?)
    }

    /// Descriptors are always ready. With no descriptor subscriptions the
    /// call sleeps until the earliest clock subscription fires.
    pub(super) fn poll_oneoff(
        &self,
        mem: &mut MemView<'_>,
        subs: u32,
        out: u32,
        nsubs: u32,
        nevents: u32,
    ) -> SysResult {
        if nsubs == 0 {
            return Err(Errno::Inval);
        }
        let mut parsed = Vec::with_capacity(nsubs as usize);
        for i in 0..nsubs {
            let base = subs
                .checked_add(i.checked_mul(SUBSCRIPTION_SIZE).ok_or(Errno::Fault)?)
                .ok_or(Errno::Fault)?;
            let userdata = mem.read_u64(base)?;
            let sub = match mem.read_u8(at(base, 8)?)? {
                EVENTTYPE_CLOCK => Subscription::Clock {
                    id: mem.read_u32(at(base, 16)?)?,
                    timeout: mem.read_u64(at(base, 24)?)?,
                    abstime: mem.read_u16(at(base, 40)?)? & SUBCLOCKFLAG_ABSTIME != 0,
                },
                kind @ (EVENTTYPE_FD_READ | EVENTTYPE_FD_WRITE) => Subscription::Fd {
                    fd: mem.read_u32(at(base, 16)?)?,
                    kind,
                },
                _ => return Err(Errno::Inval),
            };
            parsed.push((userdata, sub));
        }

        let mut events = Vec::new();
        {
            let guard = self.lock();
            for (userdata, sub) in &parsed {
                let Subscription::Fd { fd, kind } = sub else {
                    continue;
                };
                let (error, nbytes) = match guard.fds.get(*fd).map(|e| &e.kind) {
                    Ok(FdKind::Stdin) => (0, (guard.stdin.len() - guard.stdin_pos) as u64),
                    Ok(FdKind::File { ino, offset }) if *kind == EVENTTYPE_FD_READ => {
                        let size = guard.vfs.stat(*ino)?.size;
                        (0, size.saturating_sub(*offset))
                    }
                    Ok(_) => (0, 0),
                    Err(err) => (err as u16, 0),
                };
                events.push(Event {
                    userdata: *userdata,
                    error,
                    kind: *kind,
                    nbytes,
                });
            }
        }

        if events.is_empty() {
            let mut waits = Vec::new();
            for (userdata, sub) in &parsed {
                let Subscription::Clock {
                    id,
                    timeout,
                    abstime,
                } = sub
                else {
                    continue;
                };
                match self.now(*id) {
                    Ok(now) if *abstime => waits.push((*userdata, timeout.saturating_sub(now))),
                    Ok(_) => waits.push((*userdata, *timeout)),
                    Err(err) => events.push(Event {
                        userdata: *userdata,
                        error: err as u16,
                        kind: EVENTTYPE_CLOCK,
                        nbytes: 0,
                    }),
                }
            }
            if events.is_empty() {
                let earliest = waits.iter().map(|(_, wait)| *wait).min().unwrap_or(0);
                if earliest > 0 && self.clock.is_live() {
                    std::thread::sleep(Duration::from_nanos(earliest));
                }
                events.extend(
                    waits
                        .into_iter()
                        .filter(|(_, wait)| *wait <= earliest)
                        .map(|(userdata, _)| Event {
                            userdata,
                            error: 0,
                            kind: EVENTTYPE_CLOCK,
                            nbytes: 0,
                        }),
                );
            }
        }

        for (i, event) in events.iter().enumerate() {
            let mut buf = [0u8; EVENT_SIZE as usize];
            buf[0..8].copy_from_slice(&event.userdata.to_le_bytes());
            buf[8..10].copy_from_slice(&event.error.to_le_bytes());
            buf[10] = event.kind;
            buf[16..24].copy_from_slice(&event.nbytes.to_le_bytes());
            mem.write(at(out, i * EVENT_SIZE as usize)?, &buf)?;
        }
        mem.write_u32(nevents, u32::try_from(events.len())?)
    }

    pub(super) fn random_get(&self, mem: &mut MemView<'_>, buf: u32, len: u32) -> SysResult {
        let mut bytes = vec![0u8; len as usize];
        self.random.fill(&mut bytes);
        mem.write(buf, &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WasiConfig;
    use crate::vfs::VfsSnapshot;
    use crate::wasi::StdioMode;
    use crate::wasi::clock::ClockSource;

    const RIGHTS_RW: u64 = RIGHT_FD_READ | RIGHT_FD_WRITE | RIGHT_FD_SEEK | RIGHT_FD_TELL;

    fn ctx(fs: VfsSnapshot) -> WasiCtx {
        WasiCtx::new(&WasiConfig {
            fs,
            args: vec!["prog".into(), "--flag".into()],
            env: [("KEY".to_string(), "value".to_string())].into(),
            stdin: Some("input".into()),
            stdio: StdioMode::Capture,
            clock: ClockSource::Fixed { nanos: 77 },
            ..Default::default()
        })
        .unwrap()
    }

    struct Guest {
        bytes: Vec<u8>,
    }

    impl Guest {
        fn new() -> Self {
            Self {
                bytes: vec![0; 4096],
            }
        }

        fn mem(&mut self) -> MemView<'_> {
            MemView::exclusive(&mut self.bytes)
        }

        fn put(&mut self, ptr: u32, data: &[u8]) {
            self.mem().write(ptr, data).unwrap();
        }

        fn u32(&mut self, ptr: u32) -> u32 {
            self.mem().read_u32(ptr).unwrap()
        }

        fn u64(&mut self, ptr: u32) -> u64 {
            self.mem().read_u64(ptr).unwrap()
        }

        fn get(&mut self, ptr: u32, len: u32) -> Vec<u8> {
            self.mem().read(ptr, len).unwrap()
        }

        fn open(&mut self, ctx: &WasiCtx, path: &str, oflags: u16) -> Result<u32, Errno> {
            self.put(1000, path.as_bytes());
            ctx.path_open(
                &mut self.mem(),
                PREOPEN_FD,
                1000,
                path.len() as u32,
                oflags,
                RIGHTS_RW,
                0,
                0,
                900,
            )?;
            Ok(self.u32(900))
        }

        /// A single iovec at 16 pointing at `buf_ptr`/`len`.
        fn iovec(&mut self, buf_ptr: u32, len: u32) {
            self.put(16, &buf_ptr.to_le_bytes());
            self.put(20, &len.to_le_bytes());
        }
    }

    #[test]
    fn test_args_and_environ() {
        let ctx = ctx(VfsSnapshot::default());
        let mut guest = Guest::new();
        ctx.args_sizes_get(&mut guest.mem(), 0, 4).unwrap();
        assert_eq!((guest.u32(0), guest.u32(4)), (2, 12));

        ctx.args_get(&mut guest.mem(), 100, 200).unwrap();
        let first = guest.u32(100);
        let second = guest.u32(104);
        assert_eq!(guest.get(first, 5), b"prog\0");
        assert_eq!(guest.get(second, 7), b"--flag\0");

        ctx.environ_sizes_get(&mut guest.mem(), 0, 4).unwrap();
        assert_eq!((guest.u32(0), guest.u32(4)), (1, 10));
        ctx.environ_get(&mut guest.mem(), 300, 400).unwrap();
        let entry = guest.u32(300);
        assert_eq!(guest.get(entry, 10), b"KEY=value\0");
    }

    #[test]
    fn test_clock() {
        let ctx = ctx(VfsSnapshot::default());
        let mut guest = Guest::new();
        ctx.clock_time_get(&mut guest.mem(), CLOCK_REALTIME, 8).unwrap();
        assert_eq!(guest.u64(8), 77);
        assert_eq!(
            ctx.clock_time_get(&mut guest.mem(), 9, 8),
            Err(Errno::Inval)
        );
    }

    #[test]
    fn test_write_read_round_trip() {
        let ctx = ctx(VfsSnapshot::default().with_dir("/data"));
        let mut guest = Guest::new();
        let fd = guest.open(&ctx, "data/out.txt", OFLAG_CREAT).unwrap();
        assert_eq!(fd, 4);

        guest.put(2000, b"hello world");
        guest.iovec(2000, 11);
        ctx.fd_write(&mut guest.mem(), fd, 16, 1, 24).unwrap();
        assert_eq!(guest.u32(24), 11);

        ctx.fd_seek(&mut guest.mem(), fd, 0, WHENCE_SET, 32).unwrap();
        guest.iovec(3000, 64);
        ctx.fd_read(&mut guest.mem(), fd, 16, 1, 24).unwrap();
        assert_eq!(guest.u32(24), 11);
        assert_eq!(guest.get(3000, 11), b"hello world");

        // at end of file the read is empty, not an error
        ctx.fd_read(&mut guest.mem(), fd, 16, 1, 24).unwrap();
        assert_eq!(guest.u32(24), 0);

        ctx.fd_close(fd).unwrap();
        assert_eq!(ctx.fd_close(fd), Err(Errno::Badf));
        assert_eq!(ctx.with_vfs(|vfs| vfs.read_file("/data/out.txt")).unwrap(), b"hello world");
    }

    #[test]
    fn test_short_read_past_end() {
        let ctx = ctx(VfsSnapshot::default().with_file("/f", "abc"));
        let mut guest = Guest::new();
        let fd = guest.open(&ctx, "f", 0).unwrap();
        guest.iovec(2000, 100);
        ctx.fd_pread(&mut guest.mem(), fd, 16, 1, 1, 24).unwrap();
        assert_eq!(guest.u32(24), 2);
        assert_eq!(guest.get(2000, 2), b"bc");
        ctx.fd_pread(&mut guest.mem(), fd, 16, 1, 50, 24).unwrap();
        assert_eq!(guest.u32(24), 0);
    }

    #[test]
    fn test_open_errors() {
        let ctx = ctx(VfsSnapshot::default().with_file("/f", "abc").with_dir("/d"));
        let mut guest = Guest::new();
        assert_eq!(guest.open(&ctx, "missing", 0), Err(Errno::Noent));
        assert_eq!(
            guest.open(&ctx, "f", OFLAG_CREAT | OFLAG_EXCL),
            Err(Errno::Exist)
        );
        assert_eq!(guest.open(&ctx, "f", OFLAG_DIRECTORY), Err(Errno::Notdir));
        assert_eq!(guest.open(&ctx, "d", OFLAG_TRUNC), Err(Errno::Isdir));
        assert_eq!(guest.open(&ctx, "f/x", OFLAG_CREAT), Err(Errno::Notdir));
        assert_eq!(ctx.open_fds(), 4);
    }

    #[test]
    fn test_truncate_only_with_o_trunc() {
        let ctx = ctx(VfsSnapshot::default().with_file("/f", "abcdef"));
        let mut guest = Guest::new();
        let fd = guest.open(&ctx, "f", 0).unwrap();
        ctx.fd_close(fd).unwrap();
        assert_eq!(ctx.with_vfs(|vfs| vfs.read_file("/f")).unwrap(), b"abcdef");

        let fd = guest.open(&ctx, "f", OFLAG_TRUNC).unwrap();
        ctx.fd_close(fd).unwrap();
        assert_eq!(ctx.with_vfs(|vfs| vfs.read_file("/f")).unwrap(), b"");
    }

    #[test]
    fn test_append_flag() {
        let ctx = ctx(VfsSnapshot::default().with_file("/log", "a"));
        let mut guest = Guest::new();
        let fd = guest.open(&ctx, "log", 0).unwrap();
        ctx.fd_fdstat_set_flags(fd, FDFLAG_APPEND).unwrap();
        guest.put(2000, b"b");
        guest.iovec(2000, 1);
        ctx.fd_write(&mut guest.mem(), fd, 16, 1, 24).unwrap();
        assert_eq!(ctx.with_vfs(|vfs| vfs.read_file("/log")).unwrap(), b"ab");
    }

    #[test]
    fn test_stdio() {
        let ctx = ctx(VfsSnapshot::default());
        let mut guest = Guest::new();
        guest.put(2000, b"out");
        guest.iovec(2000, 3);
        ctx.fd_write(&mut guest.mem(), 1, 16, 1, 24).unwrap();
        ctx.fd_write(&mut guest.mem(), 2, 16, 1, 24).unwrap();
        assert_eq!(ctx.stdout(), b"out");
        assert_eq!(ctx.stderr(), b"out");

        guest.iovec(3000, 3);
        ctx.fd_read(&mut guest.mem(), 0, 16, 1, 24).unwrap();
        assert_eq!(guest.get(3000, 3), b"inp");
        guest.iovec(3000, 10);
        ctx.fd_read(&mut guest.mem(), 0, 16, 1, 24).unwrap();
        assert_eq!(guest.u32(24), 2);

        assert_eq!(
            ctx.fd_read(&mut guest.mem(), 1, 16, 1, 24),
            Err(Errno::Notcapable)
        );
        assert_eq!(
            ctx.fd_seek(&mut guest.mem(), 1, 0, WHENCE_SET, 32),
            Err(Errno::Spipe)
        );
    }

    #[test]
    fn test_bad_pointers_fault() {
        let ctx = ctx(VfsSnapshot::default().with_file("/f", "abc"));
        let mut guest = Guest::new();
        let fd = guest.open(&ctx, "f", 0).unwrap();
        guest.iovec(4095, 100);
        assert_eq!(
            ctx.fd_read(&mut guest.mem(), fd, 16, 1, 24),
            Err(Errno::Fault)
        );
        assert_eq!(
            ctx.fd_write(&mut guest.mem(), 1, 5000, 1, 24),
            Err(Errno::Fault)
        );
        assert_eq!(
            ctx.path_create_directory(&mut guest.mem(), PREOPEN_FD, 4095, 10),
            Err(Errno::Fault)
        );
    }

    #[test]
    fn test_prestat() {
        let ctx = ctx(VfsSnapshot::default());
        let mut guest = Guest::new();
        ctx.fd_prestat_get(&mut guest.mem(), PREOPEN_FD, 8).unwrap();
        assert_eq!(guest.get(8, 1), [0]);
        assert_eq!(guest.u32(12), 1);
        ctx.fd_prestat_dir_name(&mut guest.mem(), PREOPEN_FD, 100, 1)
            .unwrap();
        assert_eq!(guest.get(100, 1), b"/");
        assert_eq!(
            ctx.fd_prestat_get(&mut guest.mem(), 4, 8),
            Err(Errno::Badf)
        );
        assert_eq!(
            ctx.fd_prestat_get(&mut guest.mem(), 1, 8),
            Err(Errno::Badf)
        );
    }

    #[test]
    fn test_directories() {
        let ctx = ctx(VfsSnapshot::default());
        let mut guest = Guest::new();
        guest.put(1000, b"sub");
        ctx.path_create_directory(&mut guest.mem(), PREOPEN_FD, 1000, 3)
            .unwrap();
        assert_eq!(
            ctx.path_create_directory(&mut guest.mem(), PREOPEN_FD, 1000, 3),
            Err(Errno::Exist)
        );
        let fd = guest.open(&ctx, "sub/a", OFLAG_CREAT).unwrap();
        ctx.fd_close(fd).unwrap();

        ctx.path_filestat_get(&mut guest.mem(), PREOPEN_FD, 1000, 3, 500)
            .unwrap();
        assert_eq!(guest.get(516, 1), [FILETYPE_DIRECTORY]);

        let dir = guest.open(&ctx, "sub", OFLAG_DIRECTORY).unwrap();
        ctx.fd_readdir(&mut guest.mem(), dir, 2000, 512, 0, 24).unwrap();
        // ".", ".." and "a"
        assert_eq!(guest.u32(24) as usize, 3 * DIRENT_SIZE + 1 + 2 + 1);
        let third = 2000 + 2 * DIRENT_SIZE as u32 + 3;
        assert_eq!(guest.u64(third), 3);
        assert_eq!(guest.u32(third + 16), 1);
        assert_eq!(guest.get(third + DIRENT_SIZE as u32, 1), b"a");

        ctx.fd_readdir(&mut guest.mem(), dir, 2000, 512, 3, 24).unwrap();
        assert_eq!(guest.u32(24), 0);

        assert_eq!(
            ctx.path_remove_directory(&mut guest.mem(), PREOPEN_FD, 1000, 3),
            Err(Errno::Notempty)
        );
        guest.put(1100, b"sub/a");
        ctx.path_unlink_file(&mut guest.mem(), PREOPEN_FD, 1100, 5)
            .unwrap();
        ctx.path_remove_directory(&mut guest.mem(), PREOPEN_FD, 1000, 3)
            .unwrap();
    }

    #[test]
    fn test_rename_between_directories() {
        let ctx = ctx(VfsSnapshot::default().with_file("/a/x", "1").with_dir("/b"));
        let mut guest = Guest::new();
        guest.put(1000, b"a/x");
        guest.put(1100, b"b/y");
        ctx.path_rename(&mut guest.mem(), PREOPEN_FD, 1000, 3, PREOPEN_FD, 1100, 3)
            .unwrap();
        assert_eq!(ctx.with_vfs(|vfs| vfs.read_file("/b/y")).unwrap(), b"1");
        assert_eq!(
            ctx.path_rename(&mut guest.mem(), PREOPEN_FD, 1000, 3, PREOPEN_FD, 1100, 3),
            Err(Errno::Noent)
        );
    }

    #[test]
    fn test_filestat_and_times() {
        let ctx = ctx(VfsSnapshot::default().with_file("/f", "abcd"));
        let mut guest = Guest::new();
        let fd = guest.open(&ctx, "f", 0).unwrap();
        ctx.fd_filestat_set_times(fd, 5, 6, FSTFLAG_ATIM | FSTFLAG_MTIM)
            .unwrap();
        ctx.fd_filestat_get(&mut guest.mem(), fd, 100).unwrap();
        assert_eq!(guest.get(116, 1), [FILETYPE_REGULAR_FILE]);
        assert_eq!(guest.u64(132), 4);
        assert_eq!(guest.u64(140), 5);
        assert_eq!(guest.u64(148), 6);

        assert_eq!(
            ctx.fd_filestat_set_times(fd, 0, 0, FSTFLAG_ATIM | FSTFLAG_ATIM_NOW),
            Err(Errno::Inval)
        );

        ctx.fd_filestat_set_size(fd, 2).unwrap();
        ctx.fd_allocate(fd, 0, 8).unwrap();
        assert_eq!(ctx.with_vfs(|vfs| vfs.read_file("/f")).unwrap(), b"ab\0\0\0\0\0\0");
    }

    #[test]
    fn test_huge_offsets_and_sizes_are_errnos() {
        let ctx = ctx(VfsSnapshot::default());
        let mut guest = Guest::new();
        let fd = guest.open(&ctx, "f.txt", OFLAG_CREAT).unwrap();

        assert_eq!(ctx.fd_filestat_set_size(fd, u64::MAX), Err(Errno::Fbig));
        assert_eq!(ctx.fd_filestat_set_size(fd, (1 << 30) + 1), Err(Errno::Fbig));

        guest.put(2000, b"xy");
        guest.iovec(2000, 2);
        assert_eq!(
            ctx.fd_pwrite(&mut guest.mem(), fd, 16, 1, u64::MAX - 1, 24),
            Err(Errno::Fbig)
        );

        ctx.fd_seek(&mut guest.mem(), fd, i64::MAX, WHENCE_SET, 32).unwrap();
        assert_eq!(ctx.fd_write(&mut guest.mem(), fd, 16, 1, 24), Err(Errno::Fbig));

        assert_eq!(ctx.fd_allocate(fd, u64::MAX, 2), Err(Errno::Inval));
        assert_eq!(ctx.fd_allocate(fd, 1 << 30, 1), Err(Errno::Fbig));

        assert_eq!(ctx.with_vfs(|vfs| vfs.read_file("/f.txt")).unwrap(), b"");
    }

    #[test]
    fn test_unlinked_file_is_freed_on_close() {
        let ctx = ctx(VfsSnapshot::default());
        let mut guest = Guest::new();
        let baseline = ctx.with_vfs(|vfs| vfs.live_nodes());
        guest.put(1100, b"tmp");
        guest.put(2000, b"scratch");
        for _ in 0..10 {
            let fd = guest.open(&ctx, "tmp", OFLAG_CREAT | OFLAG_TRUNC).unwrap();
            guest.iovec(2000, 7);
            ctx.fd_write(&mut guest.mem(), fd, 16, 1, 24).unwrap();
            ctx.path_unlink_file(&mut guest.mem(), PREOPEN_FD, 1100, 3)
                .unwrap();

            // still readable through the descriptor
            guest.iovec(3000, 7);
            ctx.fd_pread(&mut guest.mem(), fd, 16, 1, 0, 24).unwrap();
            assert_eq!(guest.get(3000, 7), b"scratch");
            assert_eq!(ctx.with_vfs(|vfs| vfs.live_nodes()), baseline + 1);

            ctx.fd_close(fd).unwrap();
            assert_eq!(ctx.with_vfs(|vfs| vfs.live_nodes()), baseline);
        }
    }

    #[test]
    fn test_renumber_releases_the_replaced_file() {
        let ctx = ctx(VfsSnapshot::default().with_file("/a", "1").with_file("/b", "2"));
        let mut guest = Guest::new();
        let a = guest.open(&ctx, "a", 0).unwrap();
        let b = guest.open(&ctx, "b", 0).unwrap();
        guest.put(1100, b"b");
        ctx.path_unlink_file(&mut guest.mem(), PREOPEN_FD, 1100, 1)
            .unwrap();
        let live = ctx.with_vfs(|vfs| vfs.live_nodes());
        ctx.fd_renumber(a, b).unwrap();
        assert_eq!(ctx.with_vfs(|vfs| vfs.live_nodes()), live - 1);
        assert_eq!(ctx.open_fds(), 5);
    }

    #[test]
    fn test_fdstat_and_rights() {
        let ctx = ctx(VfsSnapshot::default().with_file("/f", ""));
        let mut guest = Guest::new();
        let fd = guest.open(&ctx, "f", 0).unwrap();
        ctx.fd_fdstat_get(&mut guest.mem(), fd, 64).unwrap();
        assert_eq!(guest.get(64, 1), [FILETYPE_REGULAR_FILE]);
        assert_eq!(guest.u64(72), RIGHTS_RW);

        ctx.fd_fdstat_set_rights(fd, RIGHT_FD_READ, 0).unwrap();
        assert_eq!(
            ctx.fd_fdstat_set_rights(fd, RIGHTS_RW, 0),
            Err(Errno::Notcapable)
        );
        guest.iovec(2000, 1);
        assert_eq!(
            ctx.fd_write(&mut guest.mem(), fd, 16, 1, 24),
            Err(Errno::Notcapable)
        );
    }

    #[test]
    fn test_seek_and_tell() {
        let ctx = ctx(VfsSnapshot::default().with_file("/f", "0123456789"));
        let mut guest = Guest::new();
        let fd = guest.open(&ctx, "f", 0).unwrap();
        ctx.fd_seek(&mut guest.mem(), fd, -3, WHENCE_END, 8).unwrap();
        assert_eq!(guest.u64(8), 7);
        ctx.fd_seek(&mut guest.mem(), fd, 1, WHENCE_CUR, 8).unwrap();
        ctx.fd_tell(&mut guest.mem(), fd, 8).unwrap();
        assert_eq!(guest.u64(8), 8);
        assert_eq!(
            ctx.fd_seek(&mut guest.mem(), fd, -1, WHENCE_SET, 8),
            Err(Errno::Inval)
        );
    }

    #[test]
    fn test_renumber_onto_stdout() {
        let ctx = ctx(VfsSnapshot::default().with_file("/f", ""));
        let mut guest = Guest::new();
        let fd = guest.open(&ctx, "f", 0).unwrap();
        ctx.fd_renumber(fd, 1).unwrap();
        guest.put(2000, b"redirected");
        guest.iovec(2000, 10);
        ctx.fd_write(&mut guest.mem(), 1, 16, 1, 24).unwrap();
        assert!(ctx.stdout().is_empty());
        assert_eq!(ctx.with_vfs(|vfs| vfs.read_file("/f")).unwrap(), b"redirected");
    }

    #[test]
    fn test_poll_oneoff() {
        let ctx = ctx(VfsSnapshot::default());
        let mut guest = Guest::new();

        // a relative clock subscription on a frozen clock fires immediately
        guest.put(0, &42u64.to_le_bytes());
        guest.put(8, &[EVENTTYPE_CLOCK]);
        guest.put(16, &CLOCK_MONOTONIC.to_le_bytes());
        guest.put(24, &1_000_000u64.to_le_bytes());
        ctx.poll_oneoff(&mut guest.mem(), 0, 1000, 1, 2000).unwrap();
        assert_eq!(guest.u32(2000), 1);
        assert_eq!(guest.u64(1000), 42);
        assert_eq!(guest.get(1010, 1), [EVENTTYPE_CLOCK]);

        // descriptor subscriptions win over clocks
        guest.put(48, &7u64.to_le_bytes());
        guest.put(56, &[EVENTTYPE_FD_READ]);
        guest.put(64, &0u32.to_le_bytes());
        ctx.poll_oneoff(&mut guest.mem(), 0, 1000, 2, 2000).unwrap();
        assert_eq!(guest.u32(2000), 1);
        assert_eq!(guest.u64(1000), 7);
        assert_eq!(guest.u64(1016), 5);

        assert_eq!(
            ctx.poll_oneoff(&mut guest.mem(), 0, 1000, 0, 2000),
            Err(Errno::Inval)
        );
        assert_eq!(
            ctx.poll_oneoff(&mut guest.mem(), u32::MAX - 7, 1000, 1, 2000),
            Err(Errno::Fault)
        );
    }

    #[test]
    fn test_random_get() {
        let ctx = WasiCtx::new(&WasiConfig {
            random: crate::wasi::clock::RandomSource::Seeded { seed: 1 },
            ..Default::default()
        })
        .unwrap();
        let mut guest = Guest::new();
        ctx.random_get(&mut guest.mem(), 0, 16).unwrap();
        assert_ne!(guest.get(0, 16), vec![0u8; 16]);
        assert_eq!(ctx.random_get(&mut guest.mem(), 4090, 16), Err(Errno::Fault));
    }
}
