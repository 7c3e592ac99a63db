use fs_err as fs;
use palimpsest::backup;
use palimpsest::cache::{ReadCache, CACHE_FILE, CACHE_FILE_INPROGRESS};
use palimpsest::delta;
use palimpsest::envelope::{generate_keypair, PublicKey, SecretKey};
use palimpsest::model::FileAttributes;
use palimpsest::snapshot::{snapshot_list, SnapshotReader};
use palimpsest::{restore, CancelToken};
use regex::Regex;
use std::path::{Path, PathBuf};
use tempfile::tempdir;

fn backup_config(sources: Vec<PathBuf>, dest: &Path, public_key: &PublicKey) -> backup::Config {
    backup::Config {
        source_paths: sources,
        excludes: Vec::new(),
        dest_dir: dest.to_path_buf(),
        max_intervals: 4,
        public_key: public_key.clone(),
        gz_level: None,
        group: None,
    }
}

/// Reads every entry (and body) of one snapshot file.
fn read_entries(
    path: &Path,
    secret: &SecretKey,
) -> anyhow::Result<Vec<(String, FileAttributes, Vec<u8>)>> {
    let mut reader = SnapshotReader::open(path, secret)?;
    let mut entries = Vec::new();
    while let Some(entry) = reader.read_entry()? {
        let body = reader.read_body(entry.data_len)?;
        entries.push((entry.metadata.path, entry.metadata.attrs, body));
    }
    reader.finish()?;
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(entries)
}

fn snapshot_with_increment(dest: &Path, secret: &SecretKey, increment: u16) -> PathBuf {
    let listing = snapshot_list(secret, dest).unwrap();
    listing
        .into_iter()
        .find(|f| f.increment == increment)
        .unwrap_or_else(|| panic!("no snapshot with increment {increment}"))
        .path
}

#[test]
fn incremental_backup_and_restore() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();

    let mut rng = rand::thread_rng();
    let (public, secret) = generate_keypair(&mut rng);

    let src = tempdir()?;
    let dest = tempdir()?;
    let file_a = src.path().join("a");
    let dir_b = src.path().join("b");
    fs::write(&file_a, "hello")?;
    fs::create_dir(&dir_b)?;

    let abs_a = file_a.to_str().unwrap().to_owned();
    let abs_b = dir_b.to_str().unwrap().to_owned();

    let ctx = CancelToken::new();
    let config = backup_config(vec![file_a.clone(), dir_b.clone()], dest.path(), &public);

    // Bootstrap pass: no prior cache, everything is new.
    backup::run(&ctx, &config)?;

    let cache = ReadCache::open(&dest.path().join(CACHE_FILE))?.expect("cache after first pass");
    assert_eq!(cache.instance(), 0);
    assert_eq!(
        cache.paths(),
        [abs_a.clone(), abs_b.clone()].into_iter().collect()
    );
    drop(cache);

    let listing = snapshot_list(&secret, dest.path())?;
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].increment, 0);
    let name = listing[0].path.file_name().unwrap().to_str().unwrap();
    let pattern = Regex::new(&format!(
        r"^\d{{12}}-{}\.0\.gz\.enc$",
        regex::escape(&palimpsest::hostname()?)
    ))?;
    assert!(pattern.is_match(name), "unexpected snapshot name {name}");

    let entries = read_entries(&listing[0].path, &secret)?;
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].0, abs_a);
    assert_eq!(entries[0].2, b"hello");
    assert_eq!(entries[1].0, abs_b);
    assert!(entries[1].2.is_empty());

    // Unchanged tree: a new increment with an empty body.
    backup::run(&ctx, &config)?;
    let cache = ReadCache::open(&dest.path().join(CACHE_FILE))?.expect("cache after second pass");
    assert_eq!(cache.instance(), 1);
    drop(cache);
    let snap1 = snapshot_with_increment(dest.path(), &secret, 1);
    assert!(read_entries(&snap1, &secret)?.is_empty());

    // Content change: exactly one entry, a delta against the prior content.
    fs::write(&file_a, "hellp")?;
    backup::run(&ctx, &config)?;
    let snap2 = snapshot_with_increment(dest.path(), &secret, 2);
    let entries = read_entries(&snap2, &secret)?;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].0, abs_a);
    assert_eq!(delta::patch(b"hello", &entries[0].2)?, b"hellp");

    // Deletion: one entry with the all-zero attribute sentinel.
    fs::remove_file(&file_a)?;
    backup::run(&ctx, &config)?;
    let snap3 = snapshot_with_increment(dest.path(), &secret, 3);
    let entries = read_entries(&snap3, &secret)?;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].0, abs_a);
    assert!(entries[0].1.is_deleted());
    assert!(entries[0].2.is_empty());

    // Filtered restore capped at level 2: only `a`, with the patched bytes.
    let filtered = tempdir()?;
    let only_a = Regex::new(&format!("^{}$", regex::escape(&abs_a)))?;
    restore::run(
        &ctx,
        &secret,
        dest.path(),
        filtered.path(),
        Some(&only_a),
        2,
    )?;
    let restored_a = filtered.path().join(abs_a.trim_start_matches('/'));
    assert_eq!(fs::read(&restored_a)?, b"hellp");
    let restored_b = filtered.path().join(abs_b.trim_start_matches('/'));
    assert!(!restored_b.exists());

    // Full restore: the level-3 deletion applies, so only `b` remains.
    let full = tempdir()?;
    restore::run(&ctx, &secret, dest.path(), full.path(), None, -1)?;
    let restored_a = full.path().join(abs_a.trim_start_matches('/'));
    let restored_b = full.path().join(abs_b.trim_start_matches('/'));
    assert!(!restored_a.exists());
    assert!(restored_b.is_dir());

    // Family reset: a fifth pass with max_intervals = 4 starts over at
    // level 0 and removes the four prior snapshot files first.
    let before: Vec<_> = snapshot_list(&secret, dest.path())?;
    assert_eq!(before.len(), 4);
    backup::run(&ctx, &config)?;
    let after = snapshot_list(&secret, dest.path())?;
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].increment, 0);
    let cache = ReadCache::open(&dest.path().join(CACHE_FILE))?.expect("cache after reset");
    assert_eq!(cache.instance(), 0);

    Ok(())
}

#[test]
fn symlink_tree_roundtrip() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();

    let mut rng = rand::thread_rng();
    let (public, secret) = generate_keypair(&mut rng);

    let src = tempdir()?;
    let dest = tempdir()?;
    fs::write(src.path().join("f"), "file contents")?;
    fs::create_dir(src.path().join("d"))?;
    std::os::unix::fs::symlink("f", src.path().join("l"))?;

    let ctx = CancelToken::new();
    let config = backup_config(vec![src.path().to_path_buf()], dest.path(), &public);
    backup::run(&ctx, &config)?;

    // Re-point the symlink; the second pass carries it as a delta.
    fs::remove_file(src.path().join("l"))?;
    std::os::unix::fs::symlink("d", src.path().join("l"))?;
    backup::run(&ctx, &config)?;

    let restored = tempdir()?;
    restore::run(&ctx, &secret, dest.path(), restored.path(), None, -1)?;

    let root = restored
        .path()
        .join(src.path().to_str().unwrap().trim_start_matches('/'));
    assert_eq!(fs::read(root.join("f"))?, b"file contents");
    assert!(root.join("d").is_dir());
    assert_eq!(fs::read_link(root.join("l"))?, Path::new("d"));
    Ok(())
}

#[test]
fn excluded_paths_are_never_recorded_or_emitted() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();

    let mut rng = rand::thread_rng();
    let (public, secret) = generate_keypair(&mut rng);

    let src = tempdir()?;
    let dest = tempdir()?;
    fs::write(src.path().join("keep"), "keep me")?;
    fs::write(src.path().join("skip.tmp"), "scratch")?;

    let ctx = CancelToken::new();
    let mut config = backup_config(vec![src.path().to_path_buf()], dest.path(), &public);
    config.excludes = vec![Regex::new(r"\.tmp$")?];

    backup::run(&ctx, &config)?;

    let cache = ReadCache::open(&dest.path().join(CACHE_FILE))?.expect("cache");
    let skipped = src.path().join("skip.tmp").to_str().unwrap().to_owned();
    assert!(!cache.paths().contains(&skipped));
    drop(cache);

    let snap0 = snapshot_with_increment(dest.path(), &secret, 0);
    assert!(read_entries(&snap0, &secret)?
        .iter()
        .all(|(path, _, _)| path != &skipped));

    // A second pass must not report the excluded path as deleted either.
    backup::run(&ctx, &config)?;
    let snap1 = snapshot_with_increment(dest.path(), &secret, 1);
    assert!(read_entries(&snap1, &secret)?.is_empty());
    Ok(())
}

#[test]
fn cancelled_pass_removes_snapshot_but_keeps_inprogress_cache() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();

    let mut rng = rand::thread_rng();
    let (public, _secret) = generate_keypair(&mut rng);

    let src = tempdir()?;
    let dest = tempdir()?;
    fs::write(src.path().join("a"), "hello")?;

    let ctx = CancelToken::new();
    ctx.cancel();
    let config = backup_config(vec![src.path().to_path_buf()], dest.path(), &public);
    backup::run(&ctx, &config).unwrap_err();

    let leftover_snapshots = fs::read_dir(dest.path())?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".gz.enc"))
        .count();
    assert_eq!(leftover_snapshots, 0);
    assert!(dest.path().join(CACHE_FILE_INPROGRESS).exists());
    assert!(!dest.path().join(CACHE_FILE).exists());
    Ok(())
}
