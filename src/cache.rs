//! Implements the persistent signature cache.
//!
//! # Format
//! A cache file starts with a header:
//! * `version: u16`, `instance: u16` (little-endian)
//! * `hostname_len: u8` followed by the hostname bytes
//! * `timestamp_unix: u64`
//! * `num_sigs: u64`
//!
//! followed by `num_sigs` entries, each laid out as
//! `path_len: u16, path, sig_len: u64, sig`.
//!
//! The cache has two lifecycle roles. The *prior* cache from the previous
//! pass is opened read-only: one sequential scan builds an in-memory index
//! of `path -> (offset, length)` and individual signatures are then fetched
//! with positioned reads, so the full signature set never sits in memory.
//! The *in-progress* cache for the current pass is truncated and written
//! sequentially; each entry is written through as it is added and the entry
//! count is patched into the reserved header slot on close. The in-progress
//! file is atomically renamed over the production name once the backup
//! succeeds.

use anyhow::{bail, Context};
use fs_err as fs;
use std::collections::{HashMap, HashSet};
use std::io::{self, BufReader, Read, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use crate::delta::Signature;
use crate::wire::{read_u16, read_u64, read_u8};
use crate::{FORMAT_VERSION, IO_BUFFER_SIZE};

/// Production cache file name inside the destination directory.
pub const CACHE_FILE: &str = "sig.cache";
/// In-progress cache file name; renamed to [`CACHE_FILE`] on success.
pub const CACHE_FILE_INPROGRESS: &str = "sig.cache.inprogress";

/// Header length with an empty hostname; files shorter than this are
/// treated as absent (initial bootstrap).
const MIN_HEADER_LEN: u64 = 2 + 2 + 1 + 8 + 8;

#[derive(Debug, Clone)]
struct CacheHeader {
    version: u16,
    instance: u16,
    hostname: String,
    timestamp: u64,
}

/// Prior-pass cache opened for random signature reads.
pub struct ReadCache {
    file: fs::File,
    header: CacheHeader,
    index: HashMap<String, (u64, u64)>,
}

impl ReadCache {
    /// Opens the cache at `path` and scans its entry table.
    ///
    /// Returns `Ok(None)` when the file does not exist or is shorter than
    /// the minimal header, which callers treat as a bootstrap pass. A header
    /// that advertises more entries than the file contains is a hard error.
    pub fn open(path: &Path) -> anyhow::Result<Option<ReadCache>> {
        let file = match fs::File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if file.metadata()?.len() < MIN_HEADER_LEN {
            return Ok(None);
        }

        let mut reader = BufReader::with_capacity(IO_BUFFER_SIZE, file.file());
        let version = read_u16(&mut reader)?;
        let instance = read_u16(&mut reader)?;
        let hostname_len = read_u8(&mut reader)? as usize;
        let mut hostname = vec![0u8; hostname_len];
        reader.read_exact(&mut hostname)?;
        let hostname = String::from_utf8(hostname).context("cache hostname is not utf-8")?;
        let timestamp = read_u64(&mut reader)?;
        let num_sigs = read_u64(&mut reader)?;

        let mut offset = MIN_HEADER_LEN + hostname_len as u64;
        let mut index = HashMap::with_capacity(num_sigs as usize);
        for _ in 0..num_sigs {
            let path_len = read_u16(&mut reader)? as usize;
            let mut path = vec![0u8; path_len];
            reader.read_exact(&mut path)?;
            let path = String::from_utf8(path).context("cache path is not utf-8")?;
            let sig_len = read_u64(&mut reader)?;
            offset += 2 + path_len as u64 + 8;

            // Later entries for the same path shadow earlier ones.
            index.insert(path, (offset, sig_len));
            reader.seek_relative(sig_len as i64)?;
            offset += sig_len;
        }
        let file_len = reader.get_ref().metadata()?.len();
        if offset > file_len {
            bail!("cache entry table is truncated: need {offset} bytes, have {file_len}");
        }
        drop(reader);

        Ok(Some(ReadCache {
            file,
            header: CacheHeader {
                version,
                instance,
                hostname,
                timestamp,
            },
            index,
        }))
    }

    pub fn version(&self) -> u16 {
        self.header.version
    }

    pub fn instance(&self) -> u16 {
        self.header.instance
    }

    pub fn hostname(&self) -> &str {
        &self.header.hostname
    }

    pub fn timestamp(&self) -> u64 {
        self.header.timestamp
    }

    /// Snapshot of every path known to this cache.
    pub fn paths(&self) -> HashSet<String> {
        self.index.keys().cloned().collect()
    }

    /// Fetches the signature recorded for `path`. Returns an empty
    /// signature when the path is unknown.
    pub fn get(&self, path: &str) -> anyhow::Result<Signature> {
        let Some(&(offset, len)) = self.index.get(path) else {
            return Ok(Signature::default());
        };
        let mut buf = vec![0u8; len as usize];
        self.file.file().read_exact_at(&mut buf, offset)?;
        Ok(Signature::from_bytes(buf))
    }
}

/// In-progress cache being written by the current pass.
pub struct WriteCache {
    file: fs::File,
    path: PathBuf,
    hostname: String,
    timestamp: u64,
    instance: u16,
    num_sigs: u64,
    num_sigs_offset: u64,
}

impl WriteCache {
    /// Truncates `path` and writes a header with a zero entry count,
    /// remembering where the count lives so [`close`](Self::close) can
    /// patch it.
    pub fn create(
        path: &Path,
        hostname: &str,
        timestamp: u64,
        instance: u16,
    ) -> anyhow::Result<WriteCache> {
        if hostname.len() > u8::MAX as usize {
            bail!("hostname too long for cache header: {hostname:?}");
        }
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let mut header = Vec::with_capacity(MIN_HEADER_LEN as usize + hostname.len());
        header.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        header.extend_from_slice(&instance.to_le_bytes());
        header.push(hostname.len() as u8);
        header.extend_from_slice(hostname.as_bytes());
        header.extend_from_slice(&timestamp.to_le_bytes());
        let num_sigs_offset = header.len() as u64;
        header.extend_from_slice(&0u64.to_le_bytes());
        file.write_all(&header)?;

        Ok(WriteCache {
            file,
            path: path.to_path_buf(),
            hostname: hostname.to_owned(),
            timestamp,
            instance,
            num_sigs: 0,
            num_sigs_offset,
        })
    }

    pub fn instance(&self) -> u16 {
        self.instance
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Appends one entry, writing it through immediately. Duplicate paths
    /// are accepted; the last entry wins on reload.
    pub fn add(&mut self, path: &str, sig: &Signature) -> anyhow::Result<()> {
        if path.len() > u16::MAX as usize {
            bail!("path too long for cache entry: {path:?}");
        }
        let mut entry = Vec::with_capacity(2 + path.len() + 8 + sig.as_bytes().len());
        entry.extend_from_slice(&(path.len() as u16).to_le_bytes());
        entry.extend_from_slice(path.as_bytes());
        entry.extend_from_slice(&(sig.as_bytes().len() as u64).to_le_bytes());
        entry.extend_from_slice(sig.as_bytes());
        self.file.write_all(&entry)?;
        self.num_sigs += 1;
        Ok(())
    }

    /// Patches the entry count into the header and closes the file,
    /// returning its path so the caller can rename it into place.
    pub fn close(self) -> anyhow::Result<PathBuf> {
        self.file
            .file()
            .write_all_at(&self.num_sigs.to_le_bytes(), self.num_sigs_offset)?;
        Ok(self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::signature_of;

    fn sig(data: &[u8]) -> Signature {
        signature_of(data)
    }

    #[test]
    fn roundtrip_preserves_paths_and_signatures() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(CACHE_FILE_INPROGRESS);

        let mut cache = WriteCache::create(&path, "testhost", 1_700_000_000, 3)?;
        let entries = [
            ("/src/a", sig(b"alpha")),
            ("/src/b", sig(b"beta")),
            ("/src/c/d", sig(b"gamma")),
        ];
        for (p, s) in &entries {
            cache.add(p, s)?;
        }
        let written = cache.close()?;
        assert_eq!(written, path);

        let cache = ReadCache::open(&path)?.expect("cache should exist");
        assert_eq!(cache.version(), FORMAT_VERSION);
        assert_eq!(cache.instance(), 3);
        assert_eq!(cache.hostname(), "testhost");
        assert_eq!(cache.timestamp(), 1_700_000_000);
        assert_eq!(
            cache.paths(),
            entries.iter().map(|(p, _)| p.to_string()).collect()
        );
        for (p, s) in &entries {
            assert_eq!(&cache.get(p)?, s);
        }
        assert!(cache.get("/src/unknown")?.is_empty());
        Ok(())
    }

    #[test]
    fn duplicate_path_last_write_wins() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(CACHE_FILE_INPROGRESS);

        let mut cache = WriteCache::create(&path, "testhost", 0, 0)?;
        cache.add("/src/a", &sig(b"first"))?;
        cache.add("/src/a", &sig(b"second"))?;
        cache.close()?;

        let cache = ReadCache::open(&path)?.expect("cache should exist");
        assert_eq!(cache.get("/src/a")?, sig(b"second"));
        assert_eq!(cache.paths().len(), 1);
        Ok(())
    }

    #[test]
    fn missing_and_short_files_bootstrap_as_empty() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(ReadCache::open(&dir.path().join("nope"))?.is_none());

        let short = dir.path().join("short");
        fs::write(&short, [0u8; 4])?;
        assert!(ReadCache::open(&short)?.is_none());
        Ok(())
    }

    #[test]
    fn truncated_entry_table_is_fatal() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(CACHE_FILE_INPROGRESS);

        let mut cache = WriteCache::create(&path, "testhost", 0, 0)?;
        cache.add("/src/a", &sig(b"alpha"))?;
        cache.close()?;

        let full = fs::read(&path)?;
        fs::write(&path, &full[..full.len() - 3])?;
        // Header still advertises one entry, but its bytes are missing.
        assert!(ReadCache::open(&path).is_err());
        Ok(())
    }

    #[test]
    fn write_cache_truncates_leftover_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(CACHE_FILE_INPROGRESS);

        let mut cache = WriteCache::create(&path, "testhost", 0, 0)?;
        cache.add("/src/a", &sig(b"alpha"))?;
        cache.add("/src/b", &sig(b"beta"))?;
        cache.close()?;

        // A crashed pass leaves the file behind; reopening must start fresh.
        let cache = WriteCache::create(&path, "testhost", 0, 1)?;
        cache.close()?;

        let cache = ReadCache::open(&path)?.expect("cache should exist");
        assert_eq!(cache.instance(), 1);
        assert!(cache.paths().is_empty());
        Ok(())
    }
}
