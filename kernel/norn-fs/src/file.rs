//! File descriptors and per-task descriptor tables.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use crate::dentry::DentryId;
use crate::{FsError, Inode};

bitflags::bitflags! {
    /// POSIX open flags (the subset Norn honors). `O_RDONLY` is the
    /// absence of both access-mode bits, so it has no named flag; use
    /// [`OpenFlags::readable`] / [`OpenFlags::writable`] instead of
    /// testing the mode bits directly.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// `O_WRONLY` (access-mode value 1).
        const WRONLY = 1;
        /// `O_RDWR` (access-mode value 2).
        const RDWR = 2;
        /// `O_CREAT`.
        const CREAT = 0o100;
        /// `O_DIRECTORY`.
        const DIRECTORY = 0o200000;
    }
}

/// Access-mode mask within the flag word.
const ACCMODE: u32 = 3;

impl OpenFlags {
    /// Whether reads are permitted.
    pub const fn readable(self) -> bool {
        matches!(self.bits() & ACCMODE, 0 | 2)
    }

    /// Whether writes are permitted.
    pub const fn writable(self) -> bool {
        matches!(self.bits() & ACCMODE, 1 | 2)
    }

    /// Whether the file should be created if absent.
    pub const fn create(self) -> bool {
        self.bits() & Self::CREAT.bits() != 0
    }
}

/// An open file description.
pub struct FileDescriptor {
    /// Dentry the file was opened through (for `openat` dirfd paths).
    pub dentry: DentryId,
    /// The inode.
    pub inode: Arc<dyn Inode>,
    /// Current read/write offset.
    pub offset: usize,
    /// Flags the file was opened with.
    pub flags: OpenFlags,
}

/// Highest fd number a task may have open (inclusive bound is
/// `MAX_FDS - 1`).
pub const MAX_FDS: i32 = 64;

/// Per-task file descriptor table.
pub struct FileDescriptorTable {
    fds: BTreeMap<i32, FileDescriptor>,
}

impl FileDescriptorTable {
    /// Creates an empty table.
    pub const fn new() -> Self {
        Self {
            fds: BTreeMap::new(),
        }
    }

    /// Opens a descriptor at the lowest free fd number.
    pub fn open(
        &mut self,
        dentry: DentryId,
        inode: Arc<dyn Inode>,
        flags: OpenFlags,
    ) -> Result<i32, FsError> {
        let fd = (0..MAX_FDS)
            .find(|fd| !self.fds.contains_key(fd))
            .ok_or(FsError::DescriptorFull)?;
        self.fds.insert(
            fd,
            FileDescriptor {
                dentry,
                inode,
                offset: 0,
                flags,
            },
        );
        Ok(fd)
    }

    /// Installs a descriptor at a specific fd number (stdio setup).
    pub fn insert_at(&mut self, fd: i32, dentry: DentryId, inode: Arc<dyn Inode>, flags: OpenFlags) {
        self.fds.insert(
            fd,
            FileDescriptor {
                dentry,
                inode,
                offset: 0,
                flags,
            },
        );
    }

    /// Closes a descriptor.
    pub fn close(&mut self, fd: i32) -> Result<(), FsError> {
        self.fds.remove(&fd).ok_or(FsError::BadFileDescriptor)?;
        Ok(())
    }

    /// Shared access to a descriptor.
    pub fn get(&self, fd: i32) -> Result<&FileDescriptor, FsError> {
        self.fds.get(&fd).ok_or(FsError::BadFileDescriptor)
    }

    /// Mutable access to a descriptor.
    pub fn get_mut(&mut self, fd: i32) -> Result<&mut FileDescriptor, FsError> {
        self.fds.get_mut(&fd).ok_or(FsError::BadFileDescriptor)
    }
}

impl Default for FileDescriptorTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ramfs::RamFs;
    use crate::{FileSystem, InodeType};

    fn file_inode() -> Arc<dyn Inode> {
        let fs = RamFs::new();
        fs.root().create("f", InodeType::File, 0o644).unwrap()
    }

    #[test]
    fn flags_access_modes() {
        // O_RDONLY is the empty access mode.
        assert!(OpenFlags::empty().readable());
        assert!(!OpenFlags::empty().writable());
        assert!(OpenFlags::WRONLY.writable());
        assert!(!OpenFlags::WRONLY.readable());
        assert!(OpenFlags::RDWR.readable() && OpenFlags::RDWR.writable());
        assert!((OpenFlags::CREAT | OpenFlags::WRONLY).create());
        assert!(!OpenFlags::RDWR.create());
        // Raw user flag words keep unknown bits without falsifying modes.
        let raw = OpenFlags::from_bits_retain(0o101);
        assert!(raw.create() && raw.writable() && !raw.readable());
    }

    #[test]
    fn lowest_free_fd_is_reused() {
        let mut table = FileDescriptorTable::new();
        let flags = OpenFlags::empty();
        let a = table.open(0, file_inode(), flags).unwrap();
        let b = table.open(0, file_inode(), flags).unwrap();
        let c = table.open(0, file_inode(), flags).unwrap();
        assert_eq!((a, b, c), (0, 1, 2));

        table.close(b).unwrap();
        assert_eq!(table.open(0, file_inode(), flags).unwrap(), 1);
    }

    #[test]
    fn close_unknown_is_bad_fd() {
        let mut table = FileDescriptorTable::new();
        assert_eq!(table.close(3), Err(FsError::BadFileDescriptor));
        assert!(table.get(0).is_err());
    }

    #[test]
    fn table_fills_up() {
        let mut table = FileDescriptorTable::new();
        let flags = OpenFlags::empty();
        for _ in 0..MAX_FDS {
            table.open(0, file_inode(), flags).unwrap();
        }
        assert_eq!(
            table.open(0, file_inode(), flags),
            Err(FsError::DescriptorFull)
        );
    }

    #[test]
    fn offset_is_per_descriptor() {
        let mut table = FileDescriptorTable::new();
        let inode = file_inode();
        let flags = OpenFlags::RDWR;
        let a = table.open(0, inode.clone(), flags).unwrap();
        let b = table.open(0, inode, flags).unwrap();
        table.get_mut(a).unwrap().offset = 10;
        assert_eq!(table.get(b).unwrap().offset, 0);
    }
}
