//! Filesystem syscall handlers.
//!
//! Every handler validates its user pointers, takes the current task's
//! filesystem context, and walks the global VFS. Lock order is always
//! task `fs` lock first, then the VFS lock.

use alloc::sync::Arc;
use alloc::vec;

use norn_fs::file::OpenFlags;
use norn_fs::stat::{Stat, Statx};
use norn_fs::{FsError, Inode, InodeType, dirent};

use super::{resolve_base, userptr, with_vfs_mut};
use crate::task::{self, FsContext};

/// Per-call I/O ceiling; larger requests return short counts, which POSIX
/// permits.
const IO_CHUNK: usize = 64 * 1024;

/// `AT_EMPTY_PATH` for `newfstatat` / `statx`.
const AT_EMPTY_PATH: u32 = 0x1000;

fn with_fs<R>(f: impl FnOnce(&mut FsContext) -> R) -> R {
    task::with_current(|thread| f(&mut thread.fs.lock()))
}

/// Resolves `path` relative to `dirfd` and returns the target inode.
fn resolve_path_inode(
    fs: &mut FsContext,
    dirfd: i32,
    path: &str,
) -> Result<Arc<dyn Inode>, FsError> {
    let base = resolve_base(fs, dirfd, path)?;
    with_vfs_mut(|vfs| {
        let dentry = vfs.resolve(path, base)?;
        Ok(vfs.inode(dentry))
    })
}

/// `openat(dirfd, pathname, flags, mode)`.
pub fn sys_openat(dirfd: i32, path_ptr: u64, flags: u32, mode: u32) -> Result<i64, FsError> {
    // SAFETY: Syscall argument; validated and copied before use.
    let path = unsafe { userptr::read_cstr(path_ptr)? };
    let oflags = OpenFlags::from_bits_retain(flags);

    with_fs(|fs| {
        let base = resolve_base(fs, dirfd, &path)?;
        let dentry = with_vfs_mut(|vfs| match vfs.resolve(&path, base) {
            Ok(dentry) => Ok(dentry),
            Err(FsError::NotFound) if oflags.create() => {
                let (parent, name) = vfs.resolve_parent(&path, base)?;
                vfs.create_child(parent, name, InodeType::File, mode & 0o7777)
            }
            Err(e) => Err(e),
        })?;
        let inode = with_vfs_mut(|vfs| vfs.inode(dentry));
        if inode.inode_type() == InodeType::Directory && oflags.writable() {
            return Err(FsError::IsDirectory);
        }
        let fd = fs.fds.open(dentry, inode, oflags)?;
        Ok(i64::from(fd))
    })
}

/// `close(fd)`.
pub fn sys_close(fd: i32) -> Result<i64, FsError> {
    with_fs(|fs| {
        fs.fds.close(fd)?;
        Ok(0)
    })
}

/// `read(fd, buf, count)`.
pub fn sys_read(fd: i32, buf_ptr: u64, count: u64) -> Result<i64, FsError> {
    let len = usize::try_from(count).unwrap_or(usize::MAX).min(IO_CHUNK);
    with_fs(|fs| {
        let file = fs.fds.get_mut(fd)?;
        if !file.flags.readable() {
            return Err(FsError::InvalidArgument);
        }
        if len == 0 {
            return Ok(0);
        }
        let mut buf = vec![0u8; len];
        let read = file.inode.read(file.offset, &mut buf)?;
        if read > 0 {
            // SAFETY: Syscall argument; validated inside.
            unsafe { userptr::copy_to_user(buf_ptr, &buf[..read])? };
        }
        file.offset += read;
        Ok(read as i64)
    })
}

/// `write(fd, buf, count)`.
pub fn sys_write(fd: i32, buf_ptr: u64, count: u64) -> Result<i64, FsError> {
    let len = usize::try_from(count).unwrap_or(usize::MAX).min(IO_CHUNK);
    if len == 0 {
        return with_fs(|fs| {
            fs.fds.get(fd)?;
            Ok(0)
        });
    }
    // SAFETY: Syscall argument; validated and copied before use.
    let data = unsafe { userptr::copy_from_user(buf_ptr, len)? };
    with_fs(|fs| {
        let file = fs.fds.get_mut(fd)?;
        if !file.flags.writable() {
            return Err(FsError::InvalidArgument);
        }
        let written = file.inode.write(file.offset, &data)?;
        file.offset += written;
        Ok(written as i64)
    })
}

/// `getdents64(fd, dirp, count)`.
pub fn sys_getdents64(fd: i32, dirp: u64, count: u64) -> Result<i64, FsError> {
    let cap = usize::try_from(count).unwrap_or(usize::MAX).min(IO_CHUNK);
    with_fs(|fs| {
        let file = fs.fds.get_mut(fd)?;
        if file.inode.inode_type() != InodeType::Directory {
            return Err(FsError::NotDirectory);
        }
        let entries = file.inode.readdir()?;
        if file.offset >= entries.len() {
            return Ok(0);
        }
        let mut buf = vec![0u8; cap];
        let (written, consumed) = dirent::encode(&entries, file.offset, &mut buf);
        if written == 0 {
            // Not even one record fits.
            return Err(FsError::InvalidArgument);
        }
        // SAFETY: Syscall argument; validated inside.
        unsafe { userptr::copy_to_user(dirp, &buf[..written])? };
        file.offset += consumed;
        Ok(written as i64)
    })
}

/// `chdir(pathname)`.
pub fn sys_chdir(path_ptr: u64) -> Result<i64, FsError> {
    // SAFETY: Syscall argument; validated and copied before use.
    let path = unsafe { userptr::read_cstr(path_ptr)? };
    with_fs(|fs| {
        let base = resolve_base(fs, -100, &path)?;
        let dentry = with_vfs_mut(|vfs| {
            let dentry = vfs.resolve(&path, base)?;
            if vfs.inode(dentry).inode_type() != InodeType::Directory {
                return Err(FsError::NotDirectory);
            }
            Ok(dentry)
        })?;
        fs.cwd = dentry;
        Ok(0)
    })
}

/// `getcwd(buf, size)`. Returns 0 on success (not the buffer pointer).
pub fn sys_getcwd(buf_ptr: u64, size: u64) -> Result<i64, FsError> {
    with_fs(|fs| {
        let path = with_vfs_mut(|vfs| vfs.path_of(fs.cwd));
        let needed = path.len() + 1;
        if (size as usize) < needed {
            return Err(FsError::Overflow);
        }
        let mut out = path.into_bytes();
        out.push(0);
        // SAFETY: Syscall argument; validated inside.
        unsafe { userptr::copy_to_user(buf_ptr, &out)? };
        Ok(0)
    })
}

/// `fstat(fd, statbuf)`.
pub fn sys_fstat(fd: i32, stat_ptr: u64) -> Result<i64, FsError> {
    with_fs(|fs| {
        let file = fs.fds.get(fd)?;
        let stat = Stat::from_inode(&*file.inode);
        // SAFETY: Syscall argument; Stat is plain-old-data.
        unsafe { userptr::write_struct(stat_ptr, &stat)? };
        Ok(0)
    })
}

/// `newfstatat(dirfd, pathname, statbuf, flags)`.
pub fn sys_newfstatat(dirfd: i32, path_ptr: u64, stat_ptr: u64, flags: u32) -> Result<i64, FsError> {
    // SAFETY: Syscall argument; validated and copied before use.
    let path = unsafe { userptr::read_cstr(path_ptr)? };
    with_fs(|fs| {
        let inode = if path.is_empty() && flags & AT_EMPTY_PATH != 0 {
            fs.fds.get(dirfd)?.inode.clone()
        } else {
            resolve_path_inode(fs, dirfd, &path)?
        };
        let stat = Stat::from_inode(&*inode);
        // SAFETY: Syscall argument; Stat is plain-old-data.
        unsafe { userptr::write_struct(stat_ptr, &stat)? };
        Ok(0)
    })
}

/// `statx(dirfd, pathname, flags, mask, statxbuf)`.
///
/// The mask is accepted but Norn always fills `STATX_BASIC_STATS`.
pub fn sys_statx(
    dirfd: i32,
    path_ptr: u64,
    flags: u32,
    _mask: u32,
    statx_ptr: u64,
) -> Result<i64, FsError> {
    // SAFETY: Syscall argument; validated and copied before use.
    let path = unsafe { userptr::read_cstr(path_ptr)? };
    with_fs(|fs| {
        let inode = if path.is_empty() && flags & AT_EMPTY_PATH != 0 {
            fs.fds.get(dirfd)?.inode.clone()
        } else {
            resolve_path_inode(fs, dirfd, &path)?
        };
        let statx = Statx::from_inode(&*inode);
        // SAFETY: Syscall argument; Statx is plain-old-data.
        unsafe { userptr::write_struct(statx_ptr, &statx)? };
        Ok(0)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall::{self, dispatch_syscall, nr};
    use crate::task::Thread;
    use norn_core::arch::x86_64::structures::context::SyscallFrame;
    use norn_fs::stat::S_IFREG;

    /// Drives the dispatcher the way the entry trampoline does.
    fn call(number: u64, args: &[u64]) -> i64 {
        let mut frame: SyscallFrame = unsafe { core::mem::zeroed() };
        frame.orig_rax = number;
        frame.rax = u64::MAX;
        if let Some(&a) = args.first() {
            frame.rdi = a;
        }
        if let Some(&a) = args.get(1) {
            frame.rsi = a;
        }
        if let Some(&a) = args.get(2) {
            frame.rdx = a;
        }
        if let Some(&a) = args.get(3) {
            frame.r10 = a;
        }
        if let Some(&a) = args.get(4) {
            frame.r8 = a;
        }
        dispatch_syscall(number, &mut frame)
    }

    fn cstr(s: &str) -> Vec<u8> {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        bytes
    }

    /// Minimal CPIO newc builder for the boot archive.
    fn push_entry(out: &mut Vec<u8>, ino: u32, name: &str, mode: u32, data: &[u8]) {
        out.extend_from_slice(b"070701");
        for field in [
            ino,
            mode,
            0,
            0,
            1,
            0,
            data.len() as u32,
            0,
            0,
            0,
            0,
            name.len() as u32 + 1,
            0,
        ] {
            out.extend_from_slice(format!("{field:08X}").as_bytes());
        }
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        while out.len() % 4 != 0 {
            out.push(0);
        }
        out.extend_from_slice(data);
        while out.len() % 4 != 0 {
            out.push(0);
        }
    }

    fn boot_archive() -> Vec<u8> {
        let mut out = Vec::new();
        push_entry(&mut out, 1, ".", 0o040755, b"");
        push_entry(&mut out, 2, "dir1", 0o040755, b"");
        push_entry(&mut out, 3, "dir1/hello.txt", 0o100644, b"hello\n");
        push_entry(&mut out, 4, "init", 0o100755, b"a");
        push_entry(&mut out, 0, "TRAILER!!!", 0, b"");
        out
    }

    /// One linear scenario: the globals (VFS, current thread) are shared
    /// process state, so the end-to-end flows run in a single test.
    #[test]
    fn boot_to_user_scenarios() {
        syscall::vfs_init();
        assert_eq!(syscall::populate_root(&boot_archive()).unwrap(), 2);

        let thread = Arc::new(Thread::new(
            1,
            0,
            0,
            core::ptr::null_mut(),
            syscall::root_dentry(),
        ));
        syscall::install_stdio(&thread);
        task::set_current(thread);

        // ── Scenario: init writes one byte to stdout ────────────────────
        let msg = b"a";
        assert_eq!(call(nr::WRITE, &[1, msg.as_ptr() as u64, 1]), 1);

        // /init is reachable and holds exactly one byte.
        let path = cstr("/init");
        let fd = call(nr::OPENAT, &[-100i64 as u64, path.as_ptr() as u64, 0, 0]);
        assert!(fd >= 0);
        let mut byte = [0u8; 4];
        assert_eq!(call(nr::READ, &[fd as u64, byte.as_mut_ptr() as u64, 4]), 1);
        assert_eq!(byte[0], b'a');
        assert_eq!(call(nr::CLOSE, &[fd as u64]), 0);

        // ── Scenario: CPIO tree read back ───────────────────────────────
        let path = cstr("/dir1/hello.txt");
        let fd = call(nr::OPENAT, &[-100i64 as u64, path.as_ptr() as u64, 0, 0]);
        assert!(fd >= 0);
        let mut buf = [0u8; 32];
        assert_eq!(
            call(nr::READ, &[fd as u64, buf.as_mut_ptr() as u64, 32]),
            6
        );
        assert_eq!(&buf[..6], b"hello\n");
        // Offset advanced to 6: the next read hits EOF.
        assert_eq!(call(nr::READ, &[fd as u64, buf.as_mut_ptr() as u64, 32]), 0);

        // fstat and statx agree on the size and mode.
        let mut stat = [0u8; core::mem::size_of::<Stat>()];
        assert_eq!(call(nr::FSTAT, &[fd as u64, stat.as_mut_ptr() as u64]), 0);
        let size = i64::from_le_bytes(stat[48..56].try_into().unwrap());
        let mode = u32::from_le_bytes(stat[24..28].try_into().unwrap());
        assert_eq!(size, 6);
        assert_eq!(mode, S_IFREG | 0o644);

        let mut statx = [0u8; core::mem::size_of::<Statx>()];
        assert_eq!(
            call(
                nr::STATX,
                &[
                    -100i64 as u64,
                    path.as_ptr() as u64,
                    0,
                    0x7FF,
                    statx.as_mut_ptr() as u64,
                ],
            ),
            0
        );
        assert_eq!(u64::from_le_bytes(statx[40..48].try_into().unwrap()), 6);
        assert_eq!(call(nr::CLOSE, &[fd as u64]), 0);

        // newfstatat by path.
        assert_eq!(
            call(
                nr::NEWFSTATAT,
                &[-100i64 as u64, path.as_ptr() as u64, stat.as_mut_ptr() as u64, 0],
            ),
            0
        );

        // ── Scenario: /dev/null ─────────────────────────────────────────
        let path = cstr("/dev/null");
        let fd = call(nr::OPENAT, &[-100i64 as u64, path.as_ptr() as u64, 2, 0]);
        assert!(fd >= 0);
        assert_eq!(call(nr::READ, &[fd as u64, buf.as_mut_ptr() as u64, 32]), 0);
        let alphabet = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
        assert_eq!(
            call(nr::WRITE, &[fd as u64, alphabet.as_ptr() as u64, 26]),
            26
        );
        assert_eq!(call(nr::CLOSE, &[fd as u64]), 0);

        // ── Scenario: /dev/zero, opened twice ───────────────────────────
        let path = cstr("/dev/zero");
        let fd = call(nr::OPENAT, &[-100i64 as u64, path.as_ptr() as u64, 2, 0]);
        assert!(fd >= 0);
        let mut zeros = [0xAAu8; 64];
        assert_eq!(
            call(nr::READ, &[fd as u64, zeros.as_mut_ptr() as u64, 64]),
            64
        );
        assert!(zeros.iter().all(|&b| b == 0));
        let fd2 = call(nr::OPENAT, &[-100i64 as u64, path.as_ptr() as u64, 2, 0]);
        assert!(fd2 >= 0 && fd2 != fd);
        assert_eq!(call(nr::CLOSE, &[fd as u64]), 0);
        assert_eq!(call(nr::CLOSE, &[fd2 as u64]), 0);

        // ── Scenario: directory listing via getdents64 ──────────────────
        let path = cstr("/");
        let fd = call(nr::OPENAT, &[-100i64 as u64, path.as_ptr() as u64, 0, 0]);
        assert!(fd >= 0);
        let mut dents = [0u8; 512];
        let written = call(
            nr::GETDENTS64,
            &[fd as u64, dents.as_mut_ptr() as u64, 512],
        );
        assert!(written > 0);
        let names = parse_dirent_names(&dents[..written as usize]);
        assert_eq!(names, ["dev", "dir1", "init"]);
        // Stream is exhausted.
        assert_eq!(
            call(nr::GETDENTS64, &[fd as u64, dents.as_mut_ptr() as u64, 512]),
            0
        );
        assert_eq!(call(nr::CLOSE, &[fd as u64]), 0);

        // ── Scenario: chdir + getcwd + relative open ────────────────────
        let path = cstr("/dir1");
        assert_eq!(call(nr::CHDIR, &[path.as_ptr() as u64]), 0);
        let mut cwd = [0u8; 64];
        assert_eq!(call(nr::GETCWD, &[cwd.as_mut_ptr() as u64, 64]), 0);
        assert_eq!(&cwd[..6], b"/dir1\0");
        // Too-small buffer: ERANGE.
        assert_eq!(call(nr::GETCWD, &[cwd.as_mut_ptr() as u64, 3]), -34);

        let rel = cstr("hello.txt");
        let fd = call(nr::OPENAT, &[-100i64 as u64, rel.as_ptr() as u64, 0, 0]);
        assert!(fd >= 0);
        assert_eq!(call(nr::CLOSE, &[fd as u64]), 0);

        // ── Scenario: O_CREAT and error paths ───────────────────────────
        let newfile = cstr("created.txt");
        let fd = call(
            nr::OPENAT,
            &[-100i64 as u64, newfile.as_ptr() as u64, 0o101, 0o600],
        );
        assert!(fd >= 0);
        assert_eq!(call(nr::WRITE, &[fd as u64, msg.as_ptr() as u64, 1]), 1);
        assert_eq!(call(nr::CLOSE, &[fd as u64]), 0);

        let missing = cstr("/no/such/file");
        assert_eq!(
            call(nr::OPENAT, &[-100i64 as u64, missing.as_ptr() as u64, 0, 0]),
            -2
        );
        assert_eq!(call(nr::CLOSE, &[63]), -9);
        assert_eq!(call(9999, &[]), -38);
        assert_eq!(call(nr::EXIT, &[0]), 0);
    }

    fn parse_dirent_names(mut buf: &[u8]) -> Vec<String> {
        let mut names = Vec::new();
        while buf.len() >= 19 {
            let reclen = u16::from_le_bytes(buf[16..18].try_into().unwrap()) as usize;
            let name_end = buf[19..reclen]
                .iter()
                .position(|&b| b == 0)
                .map(|p| 19 + p)
                .unwrap_or(reclen);
            names.push(String::from_utf8(buf[19..name_end].to_vec()).unwrap());
            buf = &buf[reclen..];
        }
        names
    }
}
