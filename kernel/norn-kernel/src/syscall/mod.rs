//! System-call dispatch.
//!
//! `dispatch_syscall` is the only kernel entry reached from ring 3 (via
//! the SYSCALL trampoline). Numbers follow the Linux x86-64 table for the
//! POSIX subset Norn implements; unknown numbers return `-ENOSYS`.
//!
//! This module also owns the global VFS instance and the serial console
//! that backs stdout/stderr.

pub mod userptr;
pub mod vfs;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use norn_core::arch::x86_64::structures::context::SyscallFrame;
use norn_core::sync::SpinLock;
use norn_fs::dentry::DentryId;
use norn_fs::devfs::DevFs;
use norn_fs::file::OpenFlags;
use norn_fs::ramfs::RamFs;
use norn_fs::vfs::Vfs;
use norn_fs::{DirEntry, FileSystem, FsError, Inode, InodeType};

use crate::task::Thread;

/// Linux x86-64 syscall numbers for the implemented subset.
pub mod nr {
    /// `read`.
    pub const READ: u64 = 0;
    /// `write`.
    pub const WRITE: u64 = 1;
    /// `close`.
    pub const CLOSE: u64 = 3;
    /// `fstat`.
    pub const FSTAT: u64 = 5;
    /// `exit`.
    pub const EXIT: u64 = 60;
    /// `getcwd`.
    pub const GETCWD: u64 = 79;
    /// `chdir`.
    pub const CHDIR: u64 = 80;
    /// `getdents64`.
    pub const GETDENTS64: u64 = 217;
    /// `exit_group`.
    pub const EXIT_GROUP: u64 = 231;
    /// `openat`.
    pub const OPENAT: u64 = 257;
    /// `newfstatat`.
    pub const NEWFSTATAT: u64 = 262;
    /// `statx`.
    pub const STATX: u64 = 332;
}

/// `ENOSYS`, negated, for unknown numbers.
const MINUS_ENOSYS: i64 = -38;

/// The central dispatcher.
///
/// Reads the argument registers out of the caller's [`SyscallFrame`] and
/// routes to the handler; every error comes back errno-encoded (negative).
#[unsafe(no_mangle)]
pub extern "C" fn dispatch_syscall(nr_value: u64, frame: *mut SyscallFrame) -> i64 {
    // SAFETY: The entry trampoline passes the frame it built on the
    // kernel stack; host tests pass a stack-constructed frame.
    let frame = unsafe { &mut *frame };
    let (a0, a1, a2, a3, a4) = (frame.rdi, frame.rsi, frame.rdx, frame.r10, frame.r8);

    let result = match nr_value {
        nr::READ => vfs::sys_read(a0 as i32, a1, a2),
        nr::WRITE => vfs::sys_write(a0 as i32, a1, a2),
        nr::CLOSE => vfs::sys_close(a0 as i32),
        nr::FSTAT => vfs::sys_fstat(a0 as i32, a1),
        nr::GETCWD => vfs::sys_getcwd(a0, a1),
        nr::CHDIR => vfs::sys_chdir(a0),
        nr::GETDENTS64 => vfs::sys_getdents64(a0 as i32, a1, a2),
        nr::OPENAT => vfs::sys_openat(a0 as i32, a1, a2 as u32, a3 as u32),
        nr::NEWFSTATAT => vfs::sys_newfstatat(a0 as i32, a1, a2, a3 as u32),
        nr::STATX => vfs::sys_statx(a0 as i32, a1, a2 as u32, a3 as u32, a4),
        nr::EXIT | nr::EXIT_GROUP => exit_current(a0),
        _ => return MINUS_ENOSYS,
    };

    match result {
        Ok(value) => value,
        Err(e) => e.to_result(),
    }
}

/// `exit` / `exit_group`: Norn runs one init task; its exit ends the run.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn exit_current(status: u64) -> Result<i64, FsError> {
    norn_core::kinfo!("task: init exited with status {}", status);
    crate::halt_forever()
}

/// Host stand-in: report success so scenario tests can drive `exit`.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
fn exit_current(_status: u64) -> Result<i64, FsError> {
    Ok(0)
}

// ---------------------------------------------------------------------------
// Global VFS
// ---------------------------------------------------------------------------

/// The mounted filesystem tree.
static VFS: SpinLock<Option<Vfs>> = SpinLock::new(None);

/// Builds the VFS: ramfs root, devfs at `/dev` (with the serial console
/// registered).
///
/// # Panics
///
/// Panics on double initialization.
pub fn vfs_init() {
    let root_fs = Arc::new(RamFs::new());
    root_fs
        .root()
        .create("dev", InodeType::Directory, 0o755)
        .expect("fresh ramfs rejected /dev");

    let devfs = DevFs::new();
    devfs.register("console", Arc::new(SerialConsole));

    let mut vfs = Vfs::new(root_fs);
    vfs.mount("/dev", Arc::new(devfs)).expect("mount /dev failed");
    vfs.dump_mounts();

    let mut slot = VFS.lock();
    assert!(slot.is_none(), "VFS already initialized");
    *slot = Some(vfs);
}

/// Runs `f` against the global VFS.
///
/// # Panics
///
/// Panics if [`vfs_init`] has not run.
pub fn with_vfs_mut<R>(f: impl FnOnce(&mut Vfs) -> R) -> R {
    let mut vfs = VFS.lock();
    f(vfs.as_mut().expect("VFS not initialized"))
}

/// The root dentry (init's starting cwd).
pub fn root_dentry() -> DentryId {
    with_vfs_mut(|vfs| vfs.root())
}

/// Unpacks the initramfs into the root filesystem. Returns the file count.
pub fn populate_root(initrd: &[u8]) -> Result<usize, FsError> {
    let root = with_vfs_mut(|vfs| vfs.inode(vfs.root()));
    norn_fs::initramfs::unpack_cpio(initrd, &root)
}

/// Resolves an absolute path for kernel-internal use (init loading).
pub fn resolve_for_kernel(path: &str) -> Result<Arc<dyn Inode>, FsError> {
    with_vfs_mut(|vfs| {
        let dentry = vfs.resolve(path, vfs.root())?;
        Ok(vfs.inode(dentry))
    })
}

/// Wires stdin/stdout/stderr of a fresh task to `/dev/console`.
pub fn install_stdio(thread: &Arc<Thread>) {
    let (dentry, inode) = with_vfs_mut(|vfs| {
        let dentry = vfs
            .resolve("/dev/console", vfs.root())
            .expect("no /dev/console");
        (dentry, vfs.inode(dentry))
    });
    let mut fs = thread.fs.lock();
    for fd in 0..3 {
        fs.fds
            .insert_at(fd, dentry, inode.clone(), OpenFlags::RDWR);
    }
}

// ---------------------------------------------------------------------------
// Serial console node
// ---------------------------------------------------------------------------

/// `/dev/console`: writes go to the kernel log sink, reads return EOF
/// (Norn has no keyboard input path).
struct SerialConsole;

impl Inode for SerialConsole {
    fn ino(&self) -> u64 {
        4
    }

    fn inode_type(&self) -> InodeType {
        InodeType::File
    }

    fn mode(&self) -> u32 {
        0o620
    }

    fn size(&self) -> usize {
        0
    }

    fn read(&self, _offset: usize, _buf: &mut [u8]) -> Result<usize, FsError> {
        Ok(0)
    }

    fn write(&self, _offset: usize, buf: &[u8]) -> Result<usize, FsError> {
        match core::str::from_utf8(buf) {
            Ok(s) => norn_core::kprint!("{}", s),
            Err(_) => {
                for &byte in buf {
                    norn_core::kprint!("{}", byte as char);
                }
            }
        }
        Ok(buf.len())
    }

    fn lookup(&self, _name: &str) -> Result<Arc<dyn Inode>, FsError> {
        Err(FsError::NotDirectory)
    }

    fn create(&self, _name: &str, _t: InodeType, _mode: u32) -> Result<Arc<dyn Inode>, FsError> {
        Err(FsError::NotDirectory)
    }

    fn readdir(&self) -> Result<Vec<DirEntry>, FsError> {
        Err(FsError::NotDirectory)
    }
}

/// Resolves a `dirfd`-relative path start per `openat` rules.
pub(crate) fn resolve_base(
    fs: &crate::task::FsContext,
    dirfd: i32,
    path: &str,
) -> Result<DentryId, FsError> {
    const AT_FDCWD: i32 = -100;

    if norn_fs::path::is_absolute(path) {
        return Ok(root_dentry());
    }
    if dirfd == AT_FDCWD {
        return Ok(fs.cwd);
    }
    let fd = fs.fds.get(dirfd)?;
    if fd.inode.inode_type() != InodeType::Directory {
        return Err(FsError::NotDirectory);
    }
    Ok(fd.dentry)
}

/// Converts raw user-supplied bytes into a UTF-8 path.
pub(crate) fn to_path(raw: Vec<u8>) -> Result<String, FsError> {
    String::from_utf8(raw).map_err(|_| FsError::InvalidArgument)
}
