//! Virtual filesystem layer for the Norn kernel.
//!
//! Core abstractions ([`Inode`], [`FileSystem`], the dentry-based [`vfs`],
//! file descriptor tables) plus the in-memory filesystems (ramfs, devfs)
//! and the CPIO initramfs unpacker. Everything here is synchronous: Norn
//! kernel control flow is run-to-completion, so inode operations complete
//! before returning.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod dentry;
pub mod devfs;
pub mod dirent;
pub mod file;
pub mod initramfs;
pub mod path;
pub mod ramfs;
pub mod stat;
pub mod vfs;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

/// Filesystem errors. Each maps to a distinct POSIX errno at the syscall
/// boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// The name already exists.
    AlreadyExists,
    /// The file descriptor is not open.
    BadFileDescriptor,
    /// The descriptor table is full.
    DescriptorFull,
    /// Malformed argument (bad path, bad flags, bad archive).
    InvalidArgument,
    /// The operation needs a file but got a directory.
    IsDirectory,
    /// The operation needs a directory but got a file.
    NotDirectory,
    /// No such file or directory.
    NotFound,
    /// Allocation failure inside the filesystem.
    OutOfMemory,
    /// A result does not fit the supplied buffer.
    Overflow,
    /// The node does not implement this operation.
    Unimplemented,
}

impl FsError {
    /// The POSIX errno for this error.
    pub const fn errno(self) -> i64 {
        match self {
            Self::AlreadyExists => 17,      // EEXIST
            Self::BadFileDescriptor => 9,   // EBADF
            Self::DescriptorFull => 24,     // EMFILE
            Self::InvalidArgument => 22,    // EINVAL
            Self::IsDirectory => 21,        // EISDIR
            Self::NotDirectory => 20,       // ENOTDIR
            Self::NotFound => 2,            // ENOENT
            Self::OutOfMemory => 12,        // ENOMEM
            Self::Overflow => 34,           // ERANGE
            Self::Unimplemented => 38,      // ENOSYS
        }
    }

    /// The negated errno, as returned to user space.
    pub const fn to_result(self) -> i64 {
        -self.errno()
    }
}

impl core::fmt::Display for FsError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Self::AlreadyExists => "already exists",
            Self::BadFileDescriptor => "bad file descriptor",
            Self::DescriptorFull => "descriptor table full",
            Self::InvalidArgument => "invalid argument",
            Self::IsDirectory => "is a directory",
            Self::NotDirectory => "not a directory",
            Self::NotFound => "not found",
            Self::OutOfMemory => "out of memory",
            Self::Overflow => "result out of range",
            Self::Unimplemented => "unimplemented",
        };
        write!(f, "{name}")
    }
}

/// Inode type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeType {
    /// Regular file (device nodes report as files too).
    File,
    /// Directory.
    Directory,
}

/// A directory entry as produced by [`Inode::readdir`].
#[derive(Debug, Clone)]
pub struct DirEntry {
    /// Entry name (no path separators).
    pub name: String,
    /// Inode number.
    pub ino: u64,
    /// Entry type.
    pub inode_type: InodeType,
}

/// A filesystem instance (the superblock).
pub trait FileSystem: Send + Sync {
    /// Short filesystem type name ("ramfs", "devfs", ...).
    fn name(&self) -> &'static str;

    /// The root inode of this filesystem.
    fn root(&self) -> Arc<dyn Inode>;
}

/// A filesystem node.
///
/// Offsets are byte offsets from the start of the file; reads return the
/// number of bytes copied (0 = end of file).
pub trait Inode: Send + Sync {
    /// Inode number, unique within the owning filesystem.
    fn ino(&self) -> u64;

    /// Node type.
    fn inode_type(&self) -> InodeType;

    /// POSIX mode bits (permissions only; the type is in `inode_type`).
    fn mode(&self) -> u32;

    /// Owning user id.
    fn uid(&self) -> u32 {
        0
    }

    /// Owning group id.
    fn gid(&self) -> u32 {
        0
    }

    /// File size in bytes (0 for directories and device nodes).
    fn size(&self) -> usize;

    /// Reads up to `buf.len()` bytes starting at `offset`.
    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<usize, FsError>;

    /// Writes `buf` at `offset`, extending the file as needed.
    fn write(&self, offset: usize, buf: &[u8]) -> Result<usize, FsError>;

    /// Looks up a child by name (directories only).
    fn lookup(&self, name: &str) -> Result<Arc<dyn Inode>, FsError>;

    /// Creates a child (directories only).
    fn create(&self, name: &str, itype: InodeType, mode: u32) -> Result<Arc<dyn Inode>, FsError>;

    /// Lists the directory (directories only).
    fn readdir(&self) -> Result<Vec<DirEntry>, FsError>;

    /// Removes a child by name (directories only).
    fn unlink(&self, name: &str) -> Result<(), FsError> {
        let _ = name;
        Err(FsError::Unimplemented)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_is_distinct() {
        let all = [
            FsError::AlreadyExists,
            FsError::BadFileDescriptor,
            FsError::DescriptorFull,
            FsError::InvalidArgument,
            FsError::IsDirectory,
            FsError::NotDirectory,
            FsError::NotFound,
            FsError::OutOfMemory,
            FsError::Overflow,
            FsError::Unimplemented,
        ];
        for (i, a) in all.iter().enumerate() {
            assert!(a.errno() > 0);
            assert_eq!(a.to_result(), -a.errno());
            for b in &all[i + 1..] {
                assert_ne!(a.errno(), b.errno());
            }
        }
    }

    #[test]
    fn well_known_errnos() {
        assert_eq!(FsError::NotFound.errno(), 2);
        assert_eq!(FsError::BadFileDescriptor.errno(), 9);
        assert_eq!(FsError::Overflow.errno(), 34);
    }
}
