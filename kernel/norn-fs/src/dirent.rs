//! `getdents64` record encoding.
//!
//! Serializes [`DirEntry`] lists into the Linux `linux_dirent64` wire
//! format: a 19-byte fixed header followed by the NUL-terminated name,
//! with each record padded to 8-byte alignment.

use crate::{DirEntry, InodeType};

/// `d_type` value for a regular file.
pub const DT_REG: u8 = 8;
/// `d_type` value for a directory.
pub const DT_DIR: u8 = 4;

/// Size of the fixed `linux_dirent64` header (ino + off + reclen + type).
const HEADER_LEN: usize = 8 + 8 + 2 + 1;

/// Returns the record length for a name, including NUL and padding.
pub const fn record_len(name_len: usize) -> usize {
    (HEADER_LEN + name_len + 1).next_multiple_of(8)
}

/// Encodes directory entries starting at index `first` into `buf`.
///
/// Returns `(bytes_written, entries_consumed)`. Encoding stops at the
/// first entry that does not fit; if even that first entry does not fit,
/// `(0, 0)` is returned so the caller can report `EINVAL` or a short
/// directory stream.
pub fn encode(entries: &[DirEntry], first: usize, buf: &mut [u8]) -> (usize, usize) {
    let mut written = 0;
    let mut consumed = 0;

    for (i, entry) in entries.iter().enumerate().skip(first) {
        let reclen = record_len(entry.name.len());
        if written + reclen > buf.len() {
            break;
        }

        let d_type = match entry.inode_type {
            InodeType::File => DT_REG,
            InodeType::Directory => DT_DIR,
        };
        // d_off is the offset of the *next* record, i.e. the resume index.
        let d_off = (i + 1) as i64;

        let rec = &mut buf[written..written + reclen];
        rec[0..8].copy_from_slice(&entry.ino.to_le_bytes());
        rec[8..16].copy_from_slice(&d_off.to_le_bytes());
        rec[16..18].copy_from_slice(&(reclen as u16).to_le_bytes());
        rec[18] = d_type;
        rec[HEADER_LEN..HEADER_LEN + entry.name.len()].copy_from_slice(entry.name.as_bytes());
        // NUL terminator and alignment padding.
        for byte in &mut rec[HEADER_LEN + entry.name.len()..] {
            *byte = 0;
        }

        written += reclen;
        consumed += 1;
    }

    (written, consumed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;
    use alloc::vec;

    fn entry(name: &str, ino: u64, itype: InodeType) -> DirEntry {
        DirEntry {
            name: name.to_string(),
            ino,
            inode_type: itype,
        }
    }

    #[test]
    fn record_lengths_are_aligned() {
        assert_eq!(record_len(1), 24);
        assert_eq!(record_len(4), 24);
        assert_eq!(record_len(5), 32);
        assert_eq!(record_len(0) % 8, 0);
    }

    #[test]
    fn encodes_header_fields() {
        let entries = vec![entry("init", 7, InodeType::File)];
        let mut buf = [0u8; 64];
        let (written, consumed) = encode(&entries, 0, &mut buf);
        assert_eq!(consumed, 1);
        assert_eq!(written, record_len(4));

        assert_eq!(u64::from_le_bytes(buf[0..8].try_into().unwrap()), 7);
        assert_eq!(i64::from_le_bytes(buf[8..16].try_into().unwrap()), 1);
        assert_eq!(
            u16::from_le_bytes(buf[16..18].try_into().unwrap()) as usize,
            written
        );
        assert_eq!(buf[18], DT_REG);
        assert_eq!(&buf[19..24], b"init\0");
    }

    #[test]
    fn stops_when_buffer_is_full() {
        let entries = vec![
            entry("a", 1, InodeType::File),
            entry("b", 2, InodeType::Directory),
            entry("c", 3, InodeType::File),
        ];
        // Room for exactly two records.
        let mut buf = [0u8; 48];
        let (written, consumed) = encode(&entries, 0, &mut buf);
        assert_eq!(consumed, 2);
        assert_eq!(written, 48);

        // Resume from the third entry.
        let (written, consumed) = encode(&entries, 2, &mut buf);
        assert_eq!(consumed, 1);
        assert_eq!(written, 24);
        assert_eq!(buf[18], DT_REG);
    }

    #[test]
    fn tiny_buffer_encodes_nothing() {
        let entries = vec![entry("longname.txt", 1, InodeType::File)];
        let mut buf = [0u8; 16];
        assert_eq!(encode(&entries, 0, &mut buf), (0, 0));
    }
}
