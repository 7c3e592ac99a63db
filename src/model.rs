//! Defines the on-wire data model shared by snapshots and the signature cache.

use anyhow::bail;
use std::fs::Metadata as FsMetadata;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

/// Serialized length of a [`FileAttributes`] record.
pub const ATTR_LEN: usize = 36;

/// `lstat`-level attributes of one filesystem entry, laid out as a fixed
/// 36-byte little-endian record. A record of 36 zero bytes is the deletion
/// sentinel.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct FileAttributes {
    pub size: i64,
    pub mtime_nanos: i64,
    pub rdev: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

impl FileAttributes {
    pub fn from_metadata(meta: &FsMetadata) -> Self {
        Self {
            size: meta.size() as i64,
            mtime_nanos: meta.mtime() * 1_000_000_000 + meta.mtime_nsec(),
            rdev: meta.rdev(),
            mode: meta.mode(),
            uid: meta.uid(),
            gid: meta.gid(),
        }
    }

    pub fn serialize(&self) -> [u8; ATTR_LEN] {
        let mut buf = [0u8; ATTR_LEN];
        buf[0..8].copy_from_slice(&self.size.to_le_bytes());
        buf[8..16].copy_from_slice(&self.mtime_nanos.to_le_bytes());
        buf[16..24].copy_from_slice(&self.rdev.to_le_bytes());
        buf[24..28].copy_from_slice(&self.mode.to_le_bytes());
        buf[28..32].copy_from_slice(&self.uid.to_le_bytes());
        buf[32..36].copy_from_slice(&self.gid.to_le_bytes());
        buf
    }

    pub fn deserialize(buf: &[u8]) -> anyhow::Result<Self> {
        if buf.len() != ATTR_LEN {
            bail!("invalid attribute length: got:{} want:{}", buf.len(), ATTR_LEN);
        }
        Ok(Self {
            size: i64::from_le_bytes(buf[0..8].try_into().unwrap()),
            mtime_nanos: i64::from_le_bytes(buf[8..16].try_into().unwrap()),
            rdev: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            mode: u32::from_le_bytes(buf[24..28].try_into().unwrap()),
            uid: u32::from_le_bytes(buf[28..32].try_into().unwrap()),
            gid: u32::from_le_bytes(buf[32..36].try_into().unwrap()),
        })
    }

    /// Whether this record is the all-zero deletion sentinel.
    pub fn is_deleted(&self) -> bool {
        self.serialize() == [0u8; ATTR_LEN]
    }

    pub fn kind(&self) -> FileKind {
        FileKind::from_mode(self.mode)
    }

    /// Permission bits only (no file-type bits).
    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }
}

/// File kind extracted from the `S_IFMT` bits of a raw mode.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    NamedPipe,
    Socket,
    CharDevice,
    BlockDevice,
    Unknown,
}

impl FileKind {
    pub fn from_mode(mode: u32) -> Self {
        match mode & libc::S_IFMT {
            libc::S_IFREG => FileKind::Regular,
            libc::S_IFDIR => FileKind::Directory,
            libc::S_IFLNK => FileKind::Symlink,
            libc::S_IFIFO => FileKind::NamedPipe,
            libc::S_IFSOCK => FileKind::Socket,
            libc::S_IFCHR => FileKind::CharDevice,
            libc::S_IFBLK => FileKind::BlockDevice,
            _ => FileKind::Unknown,
        }
    }
}

/// One snapshot entry's identity: an absolute path plus its attributes.
///
/// On the wire the path is prefixed with its `u16` length, followed by the
/// 36-byte attribute record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub path: String,
    pub attrs: FileAttributes,
}

impl Metadata {
    /// Captures metadata for `path` without following symlinks.
    pub fn capture(path: &Path, meta: &FsMetadata, abs_path: String) -> anyhow::Result<Self> {
        if abs_path.len() > u16::MAX as usize {
            bail!("path too long for snapshot entry: {}", path.display());
        }
        Ok(Self {
            path: abs_path,
            attrs: FileAttributes::from_metadata(meta),
        })
    }

    /// A deletion record for `path`: all-zero attributes, no data body.
    pub fn deleted(path: String) -> Self {
        Self {
            path,
            attrs: FileAttributes::default(),
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let path = self.path.as_bytes();
        let mut buf = Vec::with_capacity(2 + path.len() + ATTR_LEN);
        buf.extend_from_slice(&(path.len() as u16).to_le_bytes());
        buf.extend_from_slice(path);
        buf.extend_from_slice(&self.attrs.serialize());
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(FileAttributes::default())]
    #[case(FileAttributes {
        size: 1 << 40,
        mtime_nanos: 1_700_000_000_123_456_789,
        rdev: 0x0801,
        mode: libc::S_IFREG | 0o644,
        uid: 1000,
        gid: 100,
    })]
    #[case(FileAttributes {
        size: -1,
        mtime_nanos: -1,
        rdev: u64::MAX,
        mode: u32::MAX,
        uid: u32::MAX,
        gid: u32::MAX,
    })]
    fn attribute_roundtrip(#[case] attrs: FileAttributes) {
        let bytes = attrs.serialize();
        assert_eq!(FileAttributes::deserialize(&bytes).unwrap(), attrs);
    }

    #[test]
    fn zero_record_is_deletion_sentinel() {
        let zero = FileAttributes::default();
        assert_eq!(zero.serialize(), [0u8; ATTR_LEN]);
        assert!(zero.is_deleted());

        let nonzero = FileAttributes {
            mode: libc::S_IFDIR | 0o755,
            ..FileAttributes::default()
        };
        assert!(!nonzero.is_deleted());
    }

    #[test]
    fn deserialize_rejects_wrong_length() {
        FileAttributes::deserialize(&[0u8; ATTR_LEN - 1]).unwrap_err();
        FileAttributes::deserialize(&[0u8; ATTR_LEN + 1]).unwrap_err();
    }

    #[rstest]
    #[case(libc::S_IFREG | 0o644, FileKind::Regular)]
    #[case(libc::S_IFDIR | 0o755, FileKind::Directory)]
    #[case(libc::S_IFLNK | 0o777, FileKind::Symlink)]
    #[case(libc::S_IFIFO | 0o600, FileKind::NamedPipe)]
    #[case(libc::S_IFSOCK | 0o600, FileKind::Socket)]
    #[case(libc::S_IFCHR | 0o600, FileKind::CharDevice)]
    #[case(libc::S_IFBLK | 0o600, FileKind::BlockDevice)]
    fn kind_from_mode(#[case] mode: u32, #[case] kind: FileKind) {
        assert_eq!(FileKind::from_mode(mode), kind);
    }

    #[test]
    fn metadata_serialization_layout() {
        let md = Metadata {
            path: "/src/a".to_owned(),
            attrs: FileAttributes {
                mode: libc::S_IFREG | 0o644,
                size: 5,
                ..FileAttributes::default()
            },
        };
        let bytes = md.serialize();
        assert_eq!(bytes.len(), 2 + 6 + ATTR_LEN);
        assert_eq!(&bytes[0..2], &6u16.to_le_bytes());
        assert_eq!(&bytes[2..8], b"/src/a");
        assert_eq!(&bytes[8..], &md.attrs.serialize());
    }
}
