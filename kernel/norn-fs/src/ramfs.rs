//! In-memory filesystem backed by heap allocations.
//!
//! `RamFs` is the root filesystem: all data lives on the kernel heap and
//! every operation completes synchronously. The initramfs unpacker
//! populates it at boot.

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use norn_core::sync::SpinLock;

use crate::{DirEntry, FileSystem, FsError, Inode, InodeType};

/// A ramfs filesystem instance.
pub struct RamFs {
    root: Arc<RamInode>,
}

impl RamFs {
    /// Creates a new ramfs with an empty root directory.
    pub fn new() -> Self {
        let counter = Arc::new(AtomicU64::new(1));
        Self {
            root: Arc::new(RamInode {
                ino: counter.fetch_add(1, Ordering::Relaxed),
                itype: InodeType::Directory,
                mode: 0o755,
                data: SpinLock::new(Vec::new()),
                children: SpinLock::new(BTreeMap::new()),
                ino_counter: counter,
            }),
        }
    }
}

impl Default for RamFs {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystem for RamFs {
    fn name(&self) -> &'static str {
        "ramfs"
    }

    fn root(&self) -> Arc<dyn Inode> {
        self.root.clone()
    }
}

/// A ramfs inode (file or directory).
pub struct RamInode {
    /// Inode number within the filesystem.
    ino: u64,
    /// Node type.
    itype: InodeType,
    /// Permission bits.
    mode: u32,
    /// File contents (files only).
    data: SpinLock<Vec<u8>>,
    /// Child nodes (directories only).
    children: SpinLock<BTreeMap<String, Arc<RamInode>>>,
    /// Filesystem-wide inode number allocator.
    ino_counter: Arc<AtomicU64>,
}

impl Inode for RamInode {
    fn ino(&self) -> u64 {
        self.ino
    }

    fn inode_type(&self) -> InodeType {
        self.itype
    }

    fn mode(&self) -> u32 {
        self.mode
    }

    fn size(&self) -> usize {
        match self.itype {
            InodeType::File => self.data.lock().len(),
            InodeType::Directory => 0,
        }
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<usize, FsError> {
        if self.itype == InodeType::Directory {
            return Err(FsError::IsDirectory);
        }
        let data = self.data.lock();
        if offset >= data.len() {
            return Ok(0);
        }
        let available = &data[offset..];
        let to_copy = buf.len().min(available.len());
        buf[..to_copy].copy_from_slice(&available[..to_copy]);
        Ok(to_copy)
    }

    fn write(&self, offset: usize, buf: &[u8]) -> Result<usize, FsError> {
        if self.itype == InodeType::Directory {
            return Err(FsError::IsDirectory);
        }
        let mut data = self.data.lock();
        let end = offset.checked_add(buf.len()).ok_or(FsError::Overflow)?;
        if end > data.len() {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn lookup(&self, name: &str) -> Result<Arc<dyn Inode>, FsError> {
        if self.itype != InodeType::Directory {
            return Err(FsError::NotDirectory);
        }
        let children = self.children.lock();
        children
            .get(name)
            .cloned()
            .map(|n| n as Arc<dyn Inode>)
            .ok_or(FsError::NotFound)
    }

    fn create(&self, name: &str, itype: InodeType, mode: u32) -> Result<Arc<dyn Inode>, FsError> {
        if self.itype != InodeType::Directory {
            return Err(FsError::NotDirectory);
        }
        if name.is_empty() || name.contains('/') {
            return Err(FsError::InvalidArgument);
        }
        let mut children = self.children.lock();
        if children.contains_key(name) {
            return Err(FsError::AlreadyExists);
        }
        let inode = Arc::new(RamInode {
            ino: self.ino_counter.fetch_add(1, Ordering::Relaxed),
            itype,
            mode,
            data: SpinLock::new(Vec::new()),
            children: SpinLock::new(BTreeMap::new()),
            ino_counter: self.ino_counter.clone(),
        });
        children.insert(name.to_string(), inode.clone());
        Ok(inode)
    }

    fn readdir(&self) -> Result<Vec<DirEntry>, FsError> {
        if self.itype != InodeType::Directory {
            return Err(FsError::NotDirectory);
        }
        let children = self.children.lock();
        Ok(children
            .iter()
            .map(|(name, inode)| DirEntry {
                name: name.clone(),
                ino: inode.ino,
                inode_type: inode.itype,
            })
            .collect())
    }

    fn unlink(&self, name: &str) -> Result<(), FsError> {
        if self.itype != InodeType::Directory {
            return Err(FsError::NotDirectory);
        }
        let mut children = self.children.lock();
        children.remove(name).ok_or(FsError::NotFound)?;
        Ok(())
    }
}
