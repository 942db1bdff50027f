//! POSIX `stat` / `statx` structures.
//!
//! Byte-exact Linux x86-64 layouts: the user test program is built against
//! the standard C definitions, so the sizes and field offsets here are
//! load-bearing and pinned by tests.

use crate::{Inode, InodeType};

/// `S_IFREG`.
pub const S_IFREG: u32 = 0o100000;
/// `S_IFDIR`.
pub const S_IFDIR: u32 = 0o040000;

/// Returns the full `st_mode` value (type bits plus permissions).
pub fn mode_of(inode: &dyn Inode) -> u32 {
    let type_bits = match inode.inode_type() {
        InodeType::File => S_IFREG,
        InodeType::Directory => S_IFDIR,
    };
    type_bits | (inode.mode() & 0o7777)
}

/// Linux x86-64 `struct stat` (144 bytes).
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Stat {
    /// Containing device id.
    pub st_dev: u64,
    /// Inode number.
    pub st_ino: u64,
    /// Hard link count.
    pub st_nlink: u64,
    /// File type and permissions.
    pub st_mode: u32,
    /// Owner user id.
    pub st_uid: u32,
    /// Owner group id.
    pub st_gid: u32,
    __pad0: u32,
    /// Device id (special files).
    pub st_rdev: u64,
    /// Size in bytes.
    pub st_size: i64,
    /// Preferred I/O block size.
    pub st_blksize: i64,
    /// Number of 512-byte blocks.
    pub st_blocks: i64,
    /// Access time (seconds).
    pub st_atime: i64,
    /// Access time (nanoseconds).
    pub st_atime_nsec: i64,
    /// Modification time (seconds).
    pub st_mtime: i64,
    /// Modification time (nanoseconds).
    pub st_mtime_nsec: i64,
    /// Change time (seconds).
    pub st_ctime: i64,
    /// Change time (nanoseconds).
    pub st_ctime_nsec: i64,
    __unused: [i64; 3],
}

impl Stat {
    /// Fills a `Stat` from an inode. Norn has no timestamps or block
    /// devices, so those fields stay zero.
    pub fn from_inode(inode: &dyn Inode) -> Self {
        let size = inode.size() as i64;
        Self {
            st_ino: inode.ino(),
            st_nlink: 1,
            st_mode: mode_of(inode),
            st_uid: inode.uid(),
            st_gid: inode.gid(),
            st_size: size,
            st_blksize: 4096,
            st_blocks: (size + 511) / 512,
            ..Self::default()
        }
    }
}

/// `statx` timestamp (16 bytes).
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct StatxTimestamp {
    /// Seconds.
    pub tv_sec: i64,
    /// Nanoseconds.
    pub tv_nsec: u32,
    __reserved: i32,
}

/// `STATX_BASIC_STATS`: the mask bits Norn fills.
pub const STATX_BASIC_STATS: u32 = 0x7FF;

/// Linux `struct statx` (256 bytes).
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Statx {
    /// Mask of filled fields.
    pub stx_mask: u32,
    /// Preferred I/O block size.
    pub stx_blksize: u32,
    /// Extra file attributes.
    pub stx_attributes: u64,
    /// Hard link count.
    pub stx_nlink: u32,
    /// Owner user id.
    pub stx_uid: u32,
    /// Owner group id.
    pub stx_gid: u32,
    /// File type and permissions.
    pub stx_mode: u16,
    __spare0: u16,
    /// Inode number.
    pub stx_ino: u64,
    /// Size in bytes.
    pub stx_size: u64,
    /// Number of 512-byte blocks.
    pub stx_blocks: u64,
    /// Mask of supported attributes.
    pub stx_attributes_mask: u64,
    /// Access time.
    pub stx_atime: StatxTimestamp,
    /// Birth time.
    pub stx_btime: StatxTimestamp,
    /// Change time.
    pub stx_ctime: StatxTimestamp,
    /// Modification time.
    pub stx_mtime: StatxTimestamp,
    /// Device id major (special files).
    pub stx_rdev_major: u32,
    /// Device id minor (special files).
    pub stx_rdev_minor: u32,
    /// Containing device major.
    pub stx_dev_major: u32,
    /// Containing device minor.
    pub stx_dev_minor: u32,
    /// Mount id.
    pub stx_mnt_id: u64,
    /// Direct I/O memory alignment.
    pub stx_dio_mem_align: u32,
    /// Direct I/O offset alignment.
    pub stx_dio_offset_align: u32,
    __spare3: [u64; 12],
}

impl Statx {
    /// Fills a `Statx` from an inode.
    pub fn from_inode(inode: &dyn Inode) -> Self {
        let size = inode.size() as u64;
        Self {
            stx_mask: STATX_BASIC_STATS,
            stx_blksize: 4096,
            stx_nlink: 1,
            stx_uid: inode.uid(),
            stx_gid: inode.gid(),
            stx_mode: mode_of(inode) as u16,
            stx_ino: inode.ino(),
            stx_size: size,
            stx_blocks: size.div_ceil(512),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ramfs::RamFs;
    use crate::FileSystem;
    use core::mem::{offset_of, size_of};

    #[test]
    fn stat_is_144_bytes() {
        assert_eq!(size_of::<Stat>(), 144);
        assert_eq!(offset_of!(Stat, st_mode), 24);
        assert_eq!(offset_of!(Stat, st_size), 48);
        assert_eq!(offset_of!(Stat, st_atime), 72);
    }

    #[test]
    fn statx_is_256_bytes() {
        assert_eq!(size_of::<Statx>(), 256);
        assert_eq!(size_of::<StatxTimestamp>(), 16);
        assert_eq!(offset_of!(Statx, stx_ino), 32);
        assert_eq!(offset_of!(Statx, stx_atime), 64);
        assert_eq!(offset_of!(Statx, stx_rdev_major), 128);
    }

    #[test]
    fn stat_reflects_inode() {
        let fs = RamFs::new();
        let file = fs
            .root()
            .create("f", InodeType::File, 0o644)
            .unwrap();
        file.write(0, &[0u8; 1000]).unwrap();

        let stat = Stat::from_inode(&*file);
        assert_eq!(stat.st_size, 1000);
        assert_eq!(stat.st_mode, S_IFREG | 0o644);
        assert_eq!(stat.st_blocks, 2);
        assert_eq!(stat.st_ino, file.ino());

        let root_stat = Stat::from_inode(&*fs.root());
        assert_eq!(root_stat.st_mode & S_IFDIR, S_IFDIR);
    }

    #[test]
    fn statx_reflects_inode() {
        let fs = RamFs::new();
        let file = fs.root().create("g", InodeType::File, 0o600).unwrap();
        file.write(0, b"abc").unwrap();
        let stx = Statx::from_inode(&*file);
        assert_eq!(stx.stx_size, 3);
        assert_eq!(stx.stx_blocks, 1);
        assert_eq!(u32::from(stx.stx_mode), S_IFREG | 0o600);
        assert_eq!(stx.stx_mask, STATX_BASIC_STATS);
    }
}
