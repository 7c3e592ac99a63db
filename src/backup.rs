//! This module implements the creation of incremental backups from local
//! filesystem trees.
//!
//! Each pass walks the configured source roots, compares every entry's
//! signature against the prior pass's signature cache, and emits only what
//! changed: full content for new files, rsync deltas against the cached
//! signature for modified ones, attribute-only entries for directories and
//! special files, and deletion records for paths that vanished. The pass is
//! written as a single snapshot file and the refreshed cache is renamed into
//! place on success.

use anyhow::{anyhow, Context};
use fs_err as fs;
use nix::unistd::{chown, geteuid, Gid, Group, Uid};
use regex::Regex;
use std::collections::HashSet;
use std::io::{Cursor, Read};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{error, info, warn};
use walkdir::WalkDir;

use crate::cache::{ReadCache, WriteCache, CACHE_FILE, CACHE_FILE_INPROGRESS};
use crate::delta::{self, Signature};
use crate::envelope::PublicKey;
use crate::model::{FileKind, Metadata};
use crate::snapshot::{SnapshotWriter, SNAPSHOT_SUFFIX};
use crate::{hostname, CancelToken, MEMORY_LIMIT};

pub struct Config {
    /// Roots to walk, in order.
    pub source_paths: Vec<PathBuf>,
    /// Compiled exclude patterns, matched against absolute paths.
    pub excludes: Vec<Regex>,
    /// Destination directory for snapshots and the signature cache.
    pub dest_dir: PathBuf,
    /// Maximum increments per family before resetting to a fresh level 0.
    pub max_intervals: u16,
    /// Recipient key snapshots are sealed for.
    pub public_key: PublicKey,
    /// Gzip level; `None` uses the library default.
    pub gz_level: Option<u32>,
    /// Group owning the output files; `None` leaves ownership alone.
    pub group: Option<String>,
}

/// Runs one backup pass.
pub fn run(ctx: &CancelToken, config: &Config) -> anyhow::Result<()> {
    let dest_dir = std::path::absolute(&config.dest_dir)?;
    let owner = match &config.group {
        Some(group) => Some((geteuid().as_raw(), lookup_group(group)?)),
        None => None,
    };

    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true).mode(0o750);
    builder.create(&dest_dir)?;
    if let Some((uid, gid)) = owner {
        chown(
            dest_dir.as_path(),
            Some(Uid::from_raw(uid)),
            Some(Gid::from_raw(gid)),
        )
        .with_context(|| format!("chown {}", dest_dir.display()))?;
    }

    let host = hostname()?;
    let sig_file = dest_dir.join(CACHE_FILE);
    let prior = ReadCache::open(&sig_file)?;

    // Level selection: continue the prior family while it has room,
    // otherwise start a fresh one and forget the prior signatures.
    let now = chrono::Utc::now().timestamp() as u64;
    let (timestamp, instance, prior) = match prior {
        Some(prior) if (prior.instance() as u32 + 1) < config.max_intervals as u32 => {
            (prior.timestamp(), prior.instance() + 1, Some(prior))
        }
        _ => (now, 0, None),
    };

    if instance == 0 {
        remove_old_snapshots(&dest_dir)?;
    }

    info!("----------  RUNNING LEVEL {instance} ({timestamp})  -----------");

    let candidates = prior.as_ref().map(|c| c.paths()).unwrap_or_default();
    let new_cache = WriteCache::create(
        &dest_dir.join(CACHE_FILE_INPROGRESS),
        &host,
        timestamp,
        instance,
    )?;
    let snapshot = SnapshotWriter::create(
        &config.public_key,
        owner,
        config.gz_level,
        &dest_dir,
        &host,
        timestamp,
        instance,
    )?;

    let start = Instant::now();
    let mut driver = Driver {
        ctx,
        config,
        dest_dir: dest_dir.clone(),
        prior,
        new_cache,
        snapshot,
        candidates,
        scratch: Scratch::default(),
        files_excluded: 0,
    };

    if let Err(e) = driver.perform_pass() {
        let snapshot_path = driver.snapshot.path().to_path_buf();
        // The in-progress cache is deliberately left behind for diagnosis.
        drop(driver);
        fs::remove_file(&snapshot_path).ok();
        return Err(e);
    }

    let Driver {
        prior,
        new_cache,
        snapshot,
        files_excluded,
        ..
    } = driver;

    let snapshot_path = snapshot.path().to_path_buf();
    let bytes_written = snapshot.bytes_written();
    if let Err(e) = snapshot.close() {
        fs::remove_file(&snapshot_path).ok();
        return Err(e);
    }

    let inprogress = new_cache.close()?;
    drop(prior);
    fs::rename(&inprogress, &sig_file)?;
    if let Some((uid, gid)) = owner {
        if let Err(e) = chown(
            sig_file.as_path(),
            Some(Uid::from_raw(uid)),
            Some(Gid::from_raw(gid)),
        ) {
            warn!("chown {}: {e}", sig_file.display());
        }
    }

    info!(
        "completed: duration:{:?} bytes written:{bytes_written} files-excluded:{files_excluded}",
        start.elapsed()
    );
    Ok(())
}

fn lookup_group(name: &str) -> anyhow::Result<u32> {
    let group = Group::from_name(name)?.ok_or_else(|| anyhow!("unknown group: {name}"))?;
    Ok(group.gid.as_raw())
}

/// Deletes every snapshot file in `dir` ahead of a fresh level-0 pass.
fn remove_old_snapshots(dir: &Path) -> anyhow::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if !name.to_string_lossy().ends_with(SNAPSHOT_SUFFIX) {
            continue;
        }
        let path = entry.path();
        info!("deleting {}", path.display());
        if let Err(e) = fs::remove_file(&path) {
            error!("{e}");
        }
    }
    Ok(())
}

/// Reusable buffers for file contents and generated deltas. Capacity
/// retained across entries is bounded; oversized buffers are replaced.
#[derive(Default)]
struct Scratch {
    data: Vec<u8>,
    delta: Vec<u8>,
}

impl Scratch {
    fn reclaim(&mut self) {
        if self.data.capacity() > MEMORY_LIMIT {
            self.data = Vec::new();
        }
        if self.delta.capacity() > MEMORY_LIMIT {
            self.delta = Vec::new();
        }
    }
}

struct Driver<'a> {
    ctx: &'a CancelToken,
    config: &'a Config,
    dest_dir: PathBuf,
    prior: Option<ReadCache>,
    new_cache: WriteCache,
    snapshot: SnapshotWriter,
    /// Paths from the prior cache not yet seen on this walk; whatever
    /// remains after the walk is emitted as deletions.
    candidates: HashSet<String>,
    scratch: Scratch,
    files_excluded: u64,
}

impl Driver<'_> {
    fn perform_pass(&mut self) -> anyhow::Result<()> {
        let config = self.config;
        for root in &config.source_paths {
            self.back_up_tree(root)?;
        }
        self.emit_deletions()
    }

    fn back_up_tree(&mut self, root: &Path) -> anyhow::Result<()> {
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("walk: {e}");
                    continue;
                }
            };
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(e) => {
                    warn!("walk: {e}");
                    continue;
                }
            };
            self.back_up_entry(entry.path(), &meta)?;
        }
        Ok(())
    }

    fn back_up_entry(&mut self, path: &Path, meta: &std::fs::Metadata) -> anyhow::Result<()> {
        self.ctx.check()?;
        self.scratch.reclaim();

        let abs = std::path::absolute(path)?;
        // Never back up the destination directory itself.
        if abs.starts_with(&self.dest_dir) {
            return Ok(());
        }
        let abs_str = abs.to_string_lossy().into_owned();

        if let Some(pattern) = self
            .config
            .excludes
            .iter()
            .find(|pattern| pattern.is_match(&abs_str))
        {
            info!("{abs_str:?}: excluding ({pattern})");
            self.files_excluded += 1;
            // Excluded paths are neither recorded nor reported as deleted.
            self.candidates.remove(&abs_str);
            return Ok(());
        }

        let md = Metadata::capture(&abs, meta, abs_str.clone())?;
        let prior_sig = match &self.prior {
            Some(cache) => cache.get(&abs_str)?,
            None => Signature::default(),
        };

        match md.attrs.kind() {
            FileKind::Socket => {
                info!("skipping socket file: {abs_str:?}");
                return Ok(());
            }
            FileKind::CharDevice
            | FileKind::BlockDevice
            | FileKind::NamedPipe
            | FileKind::Directory => {
                let sig = delta::entry_signature(&md.attrs, None);
                if sig != prior_sig {
                    if prior_sig.is_empty() {
                        info!("{abs_str:?}: new file");
                    } else {
                        info!("{abs_str:?}: changed");
                    }
                    self.snapshot.add(&md, None, 0)?;
                } else {
                    info!("{abs_str:?}: no change");
                }
                self.new_cache.add(&abs_str, &sig)?;
            }
            FileKind::Symlink => {
                let target = fs::read_link(&abs)?;
                let target = target.as_os_str().as_bytes();
                let sig = delta::entry_signature(&md.attrs, Some(target));
                if sig != prior_sig {
                    if prior_sig.is_empty() {
                        info!("{abs_str:?}: new file");
                        let mut reader = Cursor::new(target);
                        self.snapshot
                            .add(&md, Some(&mut reader), target.len() as u64)?;
                    } else {
                        info!("{abs_str:?}: changed");
                        self.scratch.delta.clear();
                        delta::delta(&prior_sig, target, &mut self.scratch.delta)?;
                        let mut reader = Cursor::new(self.scratch.delta.as_slice());
                        let data_len = self.scratch.delta.len() as u64;
                        self.snapshot.add(&md, Some(&mut reader), data_len)?;
                    }
                } else {
                    info!("{abs_str:?}: no change");
                }
                self.new_cache.add(&abs_str, &sig)?;
            }
            FileKind::Regular | FileKind::Unknown => {
                // Files commonly disappear mid-walk; a failed open is a
                // skip, not a fatal error. The path stays unrecorded.
                let mut file = match fs::File::open(&abs) {
                    Ok(file) => file,
                    Err(e) => {
                        error!("open: {e}");
                        return Ok(());
                    }
                };
                self.scratch.data.clear();
                file.read_to_end(&mut self.scratch.data)?;
                drop(file);

                let sig = delta::entry_signature(&md.attrs, Some(&self.scratch.data));
                if sig != prior_sig {
                    if prior_sig.is_empty() {
                        info!("{abs_str:?}: new file");
                        let data_len = self.scratch.data.len() as u64;
                        let mut reader = Cursor::new(self.scratch.data.as_slice());
                        self.snapshot.add(&md, Some(&mut reader), data_len)?;
                    } else {
                        info!("{abs_str:?}: changed");
                        self.scratch.delta.clear();
                        delta::delta(&prior_sig, &self.scratch.data, &mut self.scratch.delta)?;
                        let data_len = self.scratch.delta.len() as u64;
                        let mut reader = Cursor::new(self.scratch.delta.as_slice());
                        self.snapshot.add(&md, Some(&mut reader), data_len)?;
                    }
                } else {
                    info!("{abs_str:?}: no change");
                }
                self.new_cache.add(&abs_str, &sig)?;
            }
        }

        self.candidates.remove(&abs_str);
        Ok(())
    }

    /// Emits a deletion record for every prior-cache path the walk did not
    /// visit. Paths matching an exclude pattern are skipped, so excluding
    /// a previously backed-up path never reports it as deleted.
    fn emit_deletions(&mut self) -> anyhow::Result<()> {
        let candidates = std::mem::take(&mut self.candidates);
        for path in candidates {
            self.ctx.check()?;
            if self
                .config
                .excludes
                .iter()
                .any(|pattern| pattern.is_match(&path))
            {
                info!("{path:?}: excluded, not reporting deletion");
                continue;
            }
            info!("{path:?}: deleted");
            self.snapshot.add(&Metadata::deleted(path), None, 0)?;
        }
        Ok(())
    }
}
