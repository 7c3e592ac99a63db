//! Snapshot stream writer, reader, and directory listing.
//!
//! A snapshot file is a framed stream of entries, gzip-compressed and sealed
//! for a recipient public key:
//!
//! ```text
//! header:  version:u16
//!          hostname_len:u8, hostname
//!          timestamp_unix:u64
//!          increment:u16
//! entry*:  path_len:u16, path
//!          attrs:36 bytes
//!          data_len:u64
//!          data:data_len bytes
//! ```
//!
//! There is no terminator or entry count; parsers stop at a clean
//! end-of-stream on an entry boundary. Each open snapshot owns one
//! background thread running the encrypt (or decrypt) stage of the
//! pipeline, connected to the gzip stage through an in-memory pipe.

use anyhow::{bail, Context};
use chrono::{Local, TimeZone};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use fs_err as fs;
use fs_err::os::unix::fs::OpenOptionsExt;
use nix::unistd::{chown, Gid, Uid};
use rand::rngs::OsRng;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use tracing::warn;

use crate::envelope::{self, PublicKey, SecretKey};
use crate::model::{FileAttributes, Metadata, ATTR_LEN};
use crate::wire::{read_u16, read_u16_or_eof, read_u64, read_u8};
use crate::{pipe, FORMAT_VERSION, PIPE_BUFFER_SIZE};

/// Suffix of snapshot files inside the destination directory.
pub const SNAPSHOT_SUFFIX: &str = ".gz.enc";

/// Computes the file name of a snapshot:
/// `YYYYMMDDhhmm-<hostname>.<instance>.gz.enc`.
pub fn snapshot_file_name(
    hostname: &str,
    timestamp: u64,
    instance: u16,
) -> anyhow::Result<String> {
    let when = Local
        .timestamp_opt(timestamp as i64, 0)
        .single()
        .context("snapshot timestamp out of range")?;
    Ok(format!(
        "{}-{}.{}{}",
        when.format("%Y%m%d%H%M"),
        hostname,
        instance,
        SNAPSHOT_SUFFIX
    ))
}

/// Parsed snapshot stream header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub version: u16,
    pub hostname: String,
    pub timestamp: u64,
    pub increment: u16,
}

/// One parsed entry, up to (but not including) its data body. The caller
/// must consume exactly `data_len` body bytes before the next
/// [`SnapshotReader::read_entry`] call.
#[derive(Debug, Clone)]
pub struct Entry {
    pub metadata: Metadata,
    pub data_len: u64,
}

/// Writes one snapshot file: `entries -> gzip -> encrypt -> file`, the
/// encrypt stage running on a background thread behind an in-memory pipe.
pub struct SnapshotWriter {
    path: PathBuf,
    gz: Option<GzEncoder<pipe::Writer>>,
    task: Option<JoinHandle<io::Result<()>>>,
    owner: Option<(u32, u32)>,
    bytes_written: u64,
}

impl SnapshotWriter {
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        public_key: &PublicKey,
        owner: Option<(u32, u32)>,
        gz_level: Option<u32>,
        dir: &Path,
        hostname: &str,
        timestamp: u64,
        instance: u16,
    ) -> anyhow::Result<SnapshotWriter> {
        if hostname.len() > u8::MAX as usize {
            bail!("hostname too long for snapshot header: {hostname:?}");
        }

        let (env_header, key) = envelope::encapsulate(&mut OsRng, public_key);
        let path = dir.join(snapshot_file_name(hostname, timestamp, instance)?);
        let file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)?;

        let (writer, mut reader) = pipe::new(PIPE_BUFFER_SIZE);
        let task = thread::spawn(move || -> io::Result<()> {
            if let Err(e) = envelope::encrypt(file, &mut reader, &env_header, &key) {
                let kind = e.kind();
                let message = e.to_string();
                reader.disconnect_with_error(io::Error::new(kind, message.clone()));
                return Err(io::Error::new(kind, message));
            }
            Ok(())
        });

        let level = gz_level.map(Compression::new).unwrap_or_default();
        let mut gz = GzEncoder::new(writer, level);

        let mut header = Vec::with_capacity(2 + 1 + hostname.len() + 8 + 2);
        header.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        header.push(hostname.len() as u8);
        header.extend_from_slice(hostname.as_bytes());
        header.extend_from_slice(&timestamp.to_le_bytes());
        header.extend_from_slice(&instance.to_le_bytes());
        if let Err(e) = gz.write_all(&header) {
            drop(gz);
            let _ = task.join();
            fs::remove_file(&path).ok();
            return Err(e.into());
        }

        Ok(SnapshotWriter {
            path,
            gz: Some(gz),
            task: Some(task),
            owner,
            bytes_written: header.len() as u64,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Uncompressed payload bytes written so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Writes one entry, streaming `data_len` bytes from `data`. A reader
    /// that runs short is logged and the short count stands.
    pub fn add(
        &mut self,
        md: &Metadata,
        data: Option<&mut dyn Read>,
        data_len: u64,
    ) -> anyhow::Result<()> {
        let gz = self.gz.as_mut().expect("snapshot writer already closed");

        let entry = md.serialize();
        gz.write_all(&entry)?;
        gz.write_all(&data_len.to_le_bytes())?;
        self.bytes_written += entry.len() as u64 + 8;

        if let Some(data) = data {
            let copied = io::copy(&mut data.take(data_len), gz)?;
            self.bytes_written += copied;
            if copied != data_len {
                warn!(
                    path = %md.path,
                    advertised = data_len,
                    written = copied,
                    "entry changed size during write"
                );
            }
        }
        Ok(())
    }

    /// Flushes gzip, closes the pipe, waits for the encrypt stage, then
    /// fixes the file mode and ownership.
    pub fn close(mut self) -> anyhow::Result<()> {
        let gz = self.gz.take().expect("snapshot writer already closed");
        let writer = gz.finish()?;
        drop(writer);

        match self.task.take().expect("task joined twice").join() {
            Ok(result) => result?,
            Err(_) => bail!("snapshot encryption task panicked"),
        }

        fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o440))?;
        if let Some((uid, gid)) = self.owner {
            chown(
                self.path.as_path(),
                Some(Uid::from_raw(uid)),
                Some(Gid::from_raw(gid)),
            )
            .with_context(|| format!("chown {}", self.path.display()))?;
        }
        Ok(())
    }
}

/// Reads one snapshot file: `file -> decrypt -> gunzip -> entries`, the
/// decrypt stage running on a background thread behind an in-memory pipe.
pub struct SnapshotReader {
    header: SnapshotHeader,
    gz: GzDecoder<pipe::Reader>,
    task: JoinHandle<io::Result<()>>,
}

impl SnapshotReader {
    pub fn open(path: &Path, secret_key: &SecretKey) -> anyhow::Result<SnapshotReader> {
        let mut file = fs::File::open(path)?;
        let env_header = envelope::read_header(&mut file)?;
        let key = envelope::decapsulate(&env_header, secret_key);

        let (mut writer, reader) = pipe::new(PIPE_BUFFER_SIZE);
        let task = thread::spawn(move || -> io::Result<()> {
            if let Err(e) = envelope::decrypt(&mut writer, &mut file, &env_header, &key) {
                let kind = e.kind();
                let message = e.to_string();
                writer.disconnect_with_error(io::Error::new(kind, message.clone()));
                return Err(io::Error::new(kind, message));
            }
            Ok(())
        });

        let mut gz = GzDecoder::new(reader);
        let header = Self::read_stream_header(&mut gz)
            .with_context(|| format!("{}: malformed snapshot header", path.display()))?;

        Ok(SnapshotReader { header, gz, task })
    }

    fn read_stream_header(gz: &mut impl Read) -> anyhow::Result<SnapshotHeader> {
        let version = read_u16(gz)?;
        let hostname_len = read_u8(gz)? as usize;
        let mut hostname = vec![0u8; hostname_len];
        gz.read_exact(&mut hostname)?;
        let hostname = String::from_utf8(hostname).context("hostname is not utf-8")?;
        let timestamp = read_u64(gz)?;
        let increment = read_u16(gz)?;
        Ok(SnapshotHeader {
            version,
            hostname,
            timestamp,
            increment,
        })
    }

    pub fn header(&self) -> &SnapshotHeader {
        &self.header
    }

    /// Parses the next entry, or `None` at a clean end-of-stream.
    pub fn read_entry(&mut self) -> anyhow::Result<Option<Entry>> {
        let Some(path_len) = read_u16_or_eof(&mut self.gz)? else {
            return Ok(None);
        };
        let mut path = vec![0u8; path_len as usize];
        self.gz.read_exact(&mut path)?;
        let path = String::from_utf8(path).context("entry path is not utf-8")?;

        let mut attrs = [0u8; ATTR_LEN];
        self.gz.read_exact(&mut attrs)?;
        let attrs = FileAttributes::deserialize(&attrs)?;

        let data_len = read_u64(&mut self.gz)?;
        Ok(Some(Entry {
            metadata: Metadata { path, attrs },
            data_len,
        }))
    }

    /// Streaming access to the current entry's body. The caller must read
    /// it to the end to keep the parser aligned.
    pub fn body(&mut self, data_len: u64) -> impl Read + '_ {
        (&mut self.gz).take(data_len)
    }

    /// Reads the current entry's body fully into memory.
    pub fn read_body(&mut self, data_len: u64) -> anyhow::Result<Vec<u8>> {
        let mut body = vec![0u8; data_len as usize];
        self.gz.read_exact(&mut body)?;
        Ok(body)
    }

    /// Discards the current entry's body.
    pub fn skip_body(&mut self, data_len: u64) -> anyhow::Result<()> {
        let skipped = io::copy(&mut self.body(data_len), &mut io::sink())?;
        if skipped != data_len {
            bail!("stream ended inside an entry body");
        }
        Ok(())
    }

    /// Drains the remaining stream and waits for the decrypt stage.
    pub fn finish(self) -> anyhow::Result<()> {
        let SnapshotReader { gz, task, .. } = self;
        let mut reader = gz.into_inner();
        io::copy(&mut reader, &mut io::sink())?;
        drop(reader);
        match task.join() {
            Ok(result) => result?,
            Err(_) => bail!("snapshot decryption task panicked"),
        }
        Ok(())
    }
}

/// One snapshot file discovered in a directory, identified by the header
/// fields of its stream.
#[derive(Debug, Clone)]
pub struct IncrementalFile {
    pub hostname: String,
    pub timestamp: u64,
    pub increment: u16,
    pub path: PathBuf,
}

/// Enumerates the snapshot files under `dir`, sorted by increment.
///
/// Only the stream headers are decrypted. Two files carrying the same
/// `(hostname, timestamp, increment)` triple are a fatal inconsistency.
pub fn snapshot_list(secret_key: &SecretKey, dir: &Path) -> anyhow::Result<Vec<IncrementalFile>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("enc") {
            continue;
        }
        let reader = SnapshotReader::open(&path, secret_key)?;
        let header = reader.header().clone();
        reader.finish()?;
        files.push(IncrementalFile {
            hostname: header.hostname,
            timestamp: header.timestamp,
            increment: header.increment,
            path,
        });
    }

    let mut families: HashMap<(String, u64), HashMap<u16, PathBuf>> = HashMap::new();
    for file in &files {
        let family = families
            .entry((file.hostname.clone(), file.timestamp))
            .or_default();
        if let Some(previous) = family.insert(file.increment, file.path.clone()) {
            bail!(
                "increment '{}' found twice: {} {}",
                file.increment,
                previous.display(),
                file.path.display()
            );
        }
    }

    files.sort_by_key(|f| f.increment);
    Ok(files)
}
