//! CPIO initramfs unpacker.
//!
//! Iterates a CPIO newc/crc archive (parsed by `hadris-cpio`) and
//! materializes directories and regular files into a mounted root inode.
//! Intermediate directories are created as needed; the archive's `.` entry
//! is skipped and iteration ends at the `TRAILER!!!` marker.

use alloc::sync::Arc;
use alloc::vec;

use hadris_cpio::CpioReader;
use hadris_cpio::mode::FileType;
use hadris_io::Cursor;

use crate::{FsError, Inode, InodeType, path};

/// Default mode for unpacked directories.
const DIR_MODE: u32 = 0o755;
/// Default mode for unpacked files.
const FILE_MODE: u32 = 0o644;

/// Unpacks a CPIO newc/crc archive into `root`.
///
/// Returns the number of regular files created.
pub fn unpack_cpio(initrd: &[u8], root: &Arc<dyn Inode>) -> Result<usize, FsError> {
    let mut reader = CpioReader::new(Cursor::new(initrd));
    let mut name_buf = [0u8; 512];
    let mut file_count = 0;

    loop {
        let entry = reader
            .next_entry_with_buf(&mut name_buf)
            .map_err(|_| FsError::InvalidArgument)?;
        let Some(entry) = entry else {
            break;
        };

        let name = entry.name_str().unwrap_or("");
        let name = name.strip_prefix('/').unwrap_or(name);

        // Skip the archive's root entry and anything nameless.
        if name.is_empty() || name == "." {
            reader
                .skip_entry_data(&entry)
                .map_err(|_| FsError::InvalidArgument)?;
            continue;
        }

        match entry.file_type() {
            FileType::Directory => {
                ensure_directory(root, name)?;
                reader
                    .skip_entry_data(&entry)
                    .map_err(|_| FsError::InvalidArgument)?;
            }
            FileType::Regular => {
                let file_size = entry.file_size() as usize;

                let (parent, file_name) = match name.rsplit_once('/') {
                    Some((dir, file)) => (ensure_directory(root, dir)?, file),
                    None => (root.clone(), name),
                };

                let file_inode = parent.create(file_name, InodeType::File, FILE_MODE)?;

                if file_size > 0 {
                    let mut buf = vec![0u8; file_size];
                    reader
                        .read_entry_data(&entry, &mut buf)
                        .map_err(|_| FsError::InvalidArgument)?;
                    let written = file_inode.write(0, &buf)?;
                    if written != file_size {
                        return Err(FsError::InvalidArgument);
                    }
                } else {
                    reader
                        .skip_entry_data(&entry)
                        .map_err(|_| FsError::InvalidArgument)?;
                }

                file_count += 1;
            }
            _ => {
                // Symlinks and device nodes are not carried by the initramfs.
                reader
                    .skip_entry_data(&entry)
                    .map_err(|_| FsError::InvalidArgument)?;
            }
        }
    }

    Ok(file_count)
}

/// Walks `dir_path` below `root`, creating missing directories, and
/// returns the final directory inode.
fn ensure_directory(root: &Arc<dyn Inode>, dir_path: &str) -> Result<Arc<dyn Inode>, FsError> {
    let mut current = root.clone();
    for component in path::components(dir_path) {
        current = match current.lookup(component) {
            Ok(inode) => {
                if inode.inode_type() != InodeType::Directory {
                    return Err(FsError::NotDirectory);
                }
                inode
            }
            Err(FsError::NotFound) => current.create(component, InodeType::Directory, DIR_MODE)?,
            Err(e) => return Err(e),
        };
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ramfs::RamFs;
    use crate::FileSystem;
    use alloc::format;
    use alloc::vec::Vec;

    /// CPIO newc mode bits.
    const C_ISDIR: u32 = 0o040000;
    const C_ISREG: u32 = 0o100000;

    /// Appends one newc entry: 110-byte ASCII-hex header, NUL-terminated
    /// name padded to 4 bytes, data padded to 4 bytes.
    fn push_entry(out: &mut Vec<u8>, ino: u32, name: &str, mode: u32, data: &[u8]) {
        let name_size = name.len() + 1;
        out.extend_from_slice(b"070701");
        for field in [
            ino,
            mode,
            0, // uid
            0, // gid
            1, // nlink
            0, // mtime
            data.len() as u32,
            0, // dev_major
            0, // dev_minor
            0, // sdev_major
            0, // sdev_minor
            name_size as u32,
            0, // checksum (newc: always 0)
        ] {
            out.extend_from_slice(format!("{field:08X}").as_bytes());
        }
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        // Entries always start 4-aligned, so padding the buffer to a 4-byte
        // boundary after the name (and again after the data) matches the
        // newc alignment rule.
        while out.len() % 4 != 0 {
            out.push(0);
        }
        out.extend_from_slice(data);
        while out.len() % 4 != 0 {
            out.push(0);
        }
    }

    fn archive(entries: &[(&str, u32, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        for (i, (name, mode, data)) in entries.iter().enumerate() {
            push_entry(&mut out, i as u32 + 1, name, *mode, data);
        }
        push_entry(&mut out, 0, "TRAILER!!!", 0, &[]);
        out
    }

    #[test]
    fn unpacks_nested_tree() {
        let initrd = archive(&[
            (".", C_ISDIR | 0o755, b""),
            ("dir1", C_ISDIR | 0o755, b""),
            ("dir1/hello.txt", C_ISREG | 0o644, b"hello\n"),
        ]);

        let fs = RamFs::new();
        let root = fs.root();
        let count = unpack_cpio(&initrd, &root).unwrap();
        assert_eq!(count, 1);

        let dir = root.lookup("dir1").unwrap();
        assert_eq!(dir.inode_type(), InodeType::Directory);
        let file = dir.lookup("hello.txt").unwrap();
        assert_eq!(file.size(), 6);
        let mut buf = [0u8; 16];
        assert_eq!(file.read(0, &mut buf).unwrap(), 6);
        assert_eq!(&buf[..6], b"hello\n");
    }

    #[test]
    fn creates_missing_parent_directories() {
        // No explicit directory entries at all.
        let initrd = archive(&[("a/b/c.txt", C_ISREG | 0o644, b"x")]);
        let fs = RamFs::new();
        let root = fs.root();
        assert_eq!(unpack_cpio(&initrd, &root).unwrap(), 1);
        let c = root
            .lookup("a")
            .and_then(|a| a.lookup("b"))
            .and_then(|b| b.lookup("c.txt"))
            .unwrap();
        assert_eq!(c.size(), 1);
    }

    #[test]
    fn single_byte_init() {
        let initrd = archive(&[("init", C_ISREG | 0o755, b"a")]);
        let fs = RamFs::new();
        let root = fs.root();
        assert_eq!(unpack_cpio(&initrd, &root).unwrap(), 1);
        let init = root.lookup("init").unwrap();
        assert_eq!(init.size(), 1);
        let mut buf = [0u8; 4];
        assert_eq!(init.read(0, &mut buf).unwrap(), 1);
        assert_eq!(buf[0], b'a');
    }

    #[test]
    fn empty_files_are_created() {
        let initrd = archive(&[("empty", C_ISREG | 0o644, b"")]);
        let fs = RamFs::new();
        let root = fs.root();
        assert_eq!(unpack_cpio(&initrd, &root).unwrap(), 1);
        assert_eq!(root.lookup("empty").unwrap().size(), 0);
    }

    #[test]
    fn garbage_archive_is_invalid() {
        let fs = RamFs::new();
        let root = fs.root();
        assert_eq!(
            unpack_cpio(b"not a cpio archive at all.....", &root),
            Err(FsError::InvalidArgument)
        );
    }
}
