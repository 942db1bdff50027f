//! Device filesystem (`/dev`).
//!
//! Provides the virtual device nodes drivers register against:
//! - `/dev/null` -- reads return 0 bytes; writes succeed, reporting the
//!   requested length.
//! - `/dev/zero` -- reads fill the buffer with zeros; writes succeed.

use alloc::collections::BTreeMap;
use alloc::string::ToString;
use alloc::sync::Arc;
use alloc::vec::Vec;

use norn_core::sync::SpinLock;

use crate::{DirEntry, FileSystem, FsError, Inode, InodeType};

/// The devfs filesystem.
pub struct DevFs {
    root: Arc<DevFsRoot>,
}

impl DevFs {
    /// Creates a devfs with the standard device nodes.
    pub fn new() -> Self {
        let root = Arc::new(DevFsRoot {
            entries: SpinLock::new(BTreeMap::new()),
        });
        let fs = Self { root };
        fs.register("null", Arc::new(DevNull { ino: 2 }));
        fs.register("zero", Arc::new(DevZero { ino: 3 }));
        fs
    }

    /// Registers a device node. Drivers call this through the kernel's
    /// devfs facade.
    pub fn register(&self, name: &str, node: Arc<dyn Inode>) {
        self.root.entries.lock().insert(name.to_string(), node);
    }
}

impl Default for DevFs {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystem for DevFs {
    fn name(&self) -> &'static str {
        "devfs"
    }

    fn root(&self) -> Arc<dyn Inode> {
        self.root.clone()
    }
}

/// The devfs root directory.
struct DevFsRoot {
    entries: SpinLock<BTreeMap<alloc::string::String, Arc<dyn Inode>>>,
}

impl Inode for DevFsRoot {
    fn ino(&self) -> u64 {
        1
    }

    fn inode_type(&self) -> InodeType {
        InodeType::Directory
    }

    fn mode(&self) -> u32 {
        0o755
    }

    fn size(&self) -> usize {
        0
    }

    fn read(&self, _offset: usize, _buf: &mut [u8]) -> Result<usize, FsError> {
        Err(FsError::IsDirectory)
    }

    fn write(&self, _offset: usize, _buf: &[u8]) -> Result<usize, FsError> {
        Err(FsError::IsDirectory)
    }

    fn lookup(&self, name: &str) -> Result<Arc<dyn Inode>, FsError> {
        self.entries
            .lock()
            .get(name)
            .cloned()
            .ok_or(FsError::NotFound)
    }

    fn create(&self, _name: &str, _t: InodeType, _mode: u32) -> Result<Arc<dyn Inode>, FsError> {
        Err(FsError::Unimplemented)
    }

    fn readdir(&self) -> Result<Vec<DirEntry>, FsError> {
        Ok(self
            .entries
            .lock()
            .iter()
            .map(|(name, node)| DirEntry {
                name: name.clone(),
                ino: node.ino(),
                inode_type: node.inode_type(),
            })
            .collect())
    }
}

/// `/dev/null`.
struct DevNull {
    ino: u64,
}

impl Inode for DevNull {
    fn ino(&self) -> u64 {
        self.ino
    }

    fn inode_type(&self) -> InodeType {
        InodeType::File
    }

    fn mode(&self) -> u32 {
        0o666
    }

    fn size(&self) -> usize {
        0
    }

    fn read(&self, _offset: usize, _buf: &mut [u8]) -> Result<usize, FsError> {
        Ok(0)
    }

    fn write(&self, _offset: usize, buf: &[u8]) -> Result<usize, FsError> {
        // Discarded, but reported as fully written.
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

/// `/dev/zero`.
struct DevZero {
    ino: u64,
}

impl Inode for DevZero {
    fn ino(&self) -> u64 {
        self.ino
    }

    fn inode_type(&self) -> InodeType {
        InodeType::File
    }

    fn mode(&self) -> u32 {
        0o666
    }

    fn size(&self) -> usize {
        0
    }

    fn read(&self, _offset: usize, buf: &mut [u8]) -> Result<usize, FsError> {
        buf.fill(0);
        Ok(buf.len())
    }

    fn write(&self, _offset: usize, buf: &[u8]) -> Result<usize, FsError> {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_reads_eof_writes_succeed() {
        let fs = DevFs::new();
        let null = fs.root().lookup("null").unwrap();
        let mut buf = [0xAAu8; 64];
        assert_eq!(null.read(0, &mut buf).unwrap(), 0);
        assert_eq!(null.write(0, &[b'A'; 26]).unwrap(), 26);
    }

    #[test]
    fn zero_fills_and_accepts_writes() {
        let fs = DevFs::new();
        let zero = fs.root().lookup("zero").unwrap();
        let mut buf = [0xAAu8; 64];
        assert_eq!(zero.read(0, &mut buf).unwrap(), 64);
        assert!(buf.iter().all(|&b| b == 0));
        assert_eq!(zero.write(0, b"discard").unwrap(), 7);
    }

    #[test]
    fn second_open_path_works() {
        // Looking the node up twice hands out the same device.
        let fs = DevFs::new();
        let a = fs.root().lookup("zero").unwrap();
        let b = fs.root().lookup("zero").unwrap();
        assert_eq!(a.ino(), b.ino());
    }

    #[test]
    fn root_lists_devices() {
        let fs = DevFs::new();
        let entries = fs.root().readdir().unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["null", "zero"]);
    }

    #[test]
    fn unknown_device_not_found() {
        let fs = DevFs::new();
        assert!(matches!(fs.root().lookup("tty0"), Err(FsError::NotFound)));
    }
}
