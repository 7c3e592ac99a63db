//! This module implements restoring a snapshot family onto the local
//! filesystem.
//!
//! Increments are applied strictly in ascending order. Whether an entry
//! body is raw content or a delta is not marked in the stream: the restorer
//! decides by whether the destination path already exists, which is why the
//! order of application matters. Entries suppressed by the path filter still
//! have their bodies consumed to keep the parser aligned.

use anyhow::{bail, Context};
use chrono::{Local, TimeZone};
use fs_err as fs;
use fs_err::os::unix::fs::OpenOptionsExt;
use nix::sys::stat::Mode;
use nix::unistd::{chown, mkfifo, Gid, Uid};
use regex::Regex;
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

use crate::delta;
use crate::envelope::SecretKey;
use crate::model::{FileAttributes, FileKind};
use crate::snapshot::{snapshot_list, Entry, IncrementalFile, SnapshotReader};
use crate::CancelToken;

/// Restores increments `0..=level` of one snapshot family from `source_dir`
/// into `dest_dir`. A negative `level` applies every increment. When more
/// than one family is present the operator is prompted to pick one.
pub fn run(
    ctx: &CancelToken,
    secret_key: &SecretKey,
    source_dir: &Path,
    dest_dir: &Path,
    file_regex: Option<&Regex>,
    level: i32,
) -> anyhow::Result<()> {
    let listing = snapshot_list(secret_key, source_dir)?;
    if listing.is_empty() {
        bail!("no backups found");
    }

    let mut families: BTreeMap<(String, u64), Vec<IncrementalFile>> = BTreeMap::new();
    for file in listing {
        families
            .entry((file.hostname.clone(), file.timestamp))
            .or_default()
            .push(file);
    }

    let keys: Vec<(String, u64)> = families.keys().cloned().collect();
    let selected = if keys.len() > 1 {
        prompt_for_family(&keys)?
    } else {
        0
    };
    let family = &families[&keys[selected]];

    let max_level = family
        .iter()
        .map(|f| f.increment)
        .max()
        .expect("family is non-empty");
    let level = if level < 0 || level > i32::from(max_level) {
        max_level
    } else {
        level as u16
    };

    info!("Restoring to level {level}...");
    let start = Instant::now();

    for file in family {
        if file.increment > level {
            break;
        }
        ctx.check()?;

        info!("----------  APPLYING LEVEL {}  -----------", file.increment);
        info!("file: {:?}", file.path);

        let mut reader = SnapshotReader::open(&file.path, secret_key)?;
        let header = reader.header();
        if header.hostname != file.hostname
            || header.timestamp != file.timestamp
            || header.increment != file.increment
        {
            bail!(
                "{}: inconsistency: embedded header does not match listing",
                file.path.display()
            );
        }

        while let Some(entry) = reader.read_entry()? {
            ctx.check()?;
            apply_entry(&mut reader, &entry, dest_dir, file_regex)
                .with_context(|| format!("restoring {:?}", entry.metadata.path))?;
        }
        reader.finish()?;
    }

    info!("completed in {:?}", start.elapsed());
    Ok(())
}

fn prompt_for_family(keys: &[(String, u64)]) -> anyhow::Result<usize> {
    println!("snapshots:");
    for (index, (host, timestamp)) in keys.iter().enumerate() {
        let when = Local
            .timestamp_opt(*timestamp as i64, 0)
            .single()
            .context("snapshot timestamp out of range")?;
        println!("{index}: {host} {when}");
    }
    eprint!("enter id to restore: ");
    io::stderr().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    let id: usize = line.trim().parse().context("invalid id")?;
    if id >= keys.len() {
        bail!("invalid id '{id}'");
    }
    Ok(id)
}

/// Maps an absolute entry path underneath the destination root.
fn join_under(dest: &Path, entry_path: &str) -> PathBuf {
    let entry = Path::new(entry_path);
    dest.join(entry.strip_prefix("/").unwrap_or(entry))
}

fn apply_entry(
    reader: &mut SnapshotReader,
    entry: &Entry,
    dest: &Path,
    filter: Option<&Regex>,
) -> anyhow::Result<()> {
    let attrs = &entry.metadata.attrs;
    let extract = filter.map_or(true, |rx| rx.is_match(&entry.metadata.path));
    let target = join_under(dest, &entry.metadata.path);

    if attrs.is_deleted() {
        info!("{:?}: deleting file", target);
        fs::remove_file(&target)?;
        return Ok(());
    }

    match attrs.kind() {
        FileKind::Socket | FileKind::CharDevice | FileKind::BlockDevice => {
            reader.skip_body(entry.data_len)?;
            if extract {
                info!("{target:?}: unsupported file");
            }
        }
        FileKind::NamedPipe => {
            reader.skip_body(entry.data_len)?;
            if !extract {
                return Ok(());
            }
            ensure_parent(&target)?;
            mkfifo(&target, Mode::from_bits_truncate(0o600))
                .with_context(|| format!("mkfifo {}", target.display()))?;
            if let Err(e) = fs::set_permissions(
                &target,
                std::fs::Permissions::from_mode(attrs.permissions()),
            ) {
                fs::remove_file(&target).ok();
                return Err(e.into());
            }
            chown_logged(&target, attrs);
        }
        FileKind::Directory => {
            reader.skip_body(entry.data_len)?;
            if !extract {
                return Ok(());
            }
            let mut builder = std::fs::DirBuilder::new();
            builder.recursive(true).mode(attrs.permissions());
            builder.create(&target)?;
        }
        FileKind::Symlink => {
            let body = reader.read_body(entry.data_len)?;
            if !extract {
                return Ok(());
            }
            ensure_parent(&target)?;
            match fs::symlink_metadata(&target) {
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    info!("{target:?}: new symlink");
                    symlink_bytes(&body, &target)?;
                }
                Err(e) => return Err(e.into()),
                Ok(existing) => {
                    info!("{target:?}: patching [symlink]");
                    let basis = if existing.file_type().is_symlink() {
                        fs::read_link(&target)?.as_os_str().as_bytes().to_vec()
                    } else {
                        fs::read(&target)?
                    };
                    let patched = delta::patch(&basis, &body)?;
                    fs::remove_file(&target)?;
                    symlink_bytes(&patched, &target)?;
                }
            }
        }
        FileKind::Regular | FileKind::Unknown => {
            if !extract {
                reader.skip_body(entry.data_len)?;
                return Ok(());
            }
            ensure_parent(&target)?;
            let partial = partial_path(&target);
            if let Err(e) = materialize_regular(reader, entry, &target, &partial) {
                fs::remove_file(&partial).ok();
                return Err(e);
            }
        }
    }
    Ok(())
}

/// A snapshot's own parent-directory entries may have been suppressed by
/// the filter, or never emitted when a source root was a bare file, so
/// missing parents are created on demand.
fn ensure_parent(target: &Path) -> anyhow::Result<()> {
    let Some(parent) = target.parent() else {
        return Ok(());
    };
    if let Err(e) = fs::metadata(parent) {
        if e.kind() != io::ErrorKind::NotFound {
            return Err(e.into());
        }
        let mut builder = std::fs::DirBuilder::new();
        builder.recursive(true).mode(0o755);
        builder.create(parent)?;
    }
    Ok(())
}

fn partial_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

fn symlink_bytes(target_bytes: &[u8], link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(OsStr::from_bytes(target_bytes), link)
}

/// Streams a new file, or patches an existing one, into `partial`, then
/// renames it over `target` and fixes mode and ownership.
fn materialize_regular(
    reader: &mut SnapshotReader,
    entry: &Entry,
    target: &Path,
    partial: &Path,
) -> anyhow::Result<()> {
    let attrs = &entry.metadata.attrs;
    let mut tmp = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(partial)?;

    match fs::metadata(target) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!("{target:?}: new file");
            let copied = io::copy(&mut reader.body(entry.data_len), &mut tmp)?;
            if copied != entry.data_len {
                bail!("stream ended inside an entry body");
            }
        }
        Err(e) => return Err(e.into()),
        Ok(_) => {
            info!("{target:?}: patching");
            let body = reader.read_body(entry.data_len)?;
            let basis = fs::read(target)?;
            let patched = delta::patch(&basis, &body)?;
            tmp.write_all(&patched)?;
        }
    }
    drop(tmp);

    fs::rename(partial, target)?;
    fs::set_permissions(target, std::fs::Permissions::from_mode(attrs.permissions()))?;
    chown_logged(target, attrs);
    Ok(())
}

fn chown_logged(path: &Path, attrs: &FileAttributes) {
    if let Err(e) = chown(
        path,
        Some(Uid::from_raw(attrs.uid)),
        Some(Gid::from_raw(attrs.gid)),
    ) {
        warn!("chown {}: {e}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_paths_are_re_rooted_under_the_destination() {
        assert_eq!(
            join_under(Path::new("/restore"), "/src/a"),
            Path::new("/restore/src/a")
        );
        assert_eq!(
            join_under(Path::new("/restore"), "relative/b"),
            Path::new("/restore/relative/b")
        );
    }

    #[test]
    fn partial_files_sit_next_to_their_target() {
        assert_eq!(
            partial_path(Path::new("/restore/src/a")),
            Path::new("/restore/src/a.partial")
        );
    }
}
