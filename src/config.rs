//! YAML configuration for the backup and restore commands.

use anyhow::Context;
use fs_err as fs;
use regex::Regex;
use serde::Deserialize;
use std::io::Read;
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Destination directory for snapshots and the signature cache.
    #[serde(default)]
    pub backuppath: Option<PathBuf>,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub restore: RestoreConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackupConfig {
    /// Group name owning the output files.
    #[serde(default)]
    pub group: Option<String>,
    /// Maximum increments per family before resetting to a new level 0.
    #[serde(default)]
    pub maxintervals: u16,
    /// Gzip level; unset uses the library default.
    #[serde(default)]
    pub gzlevel: Option<u32>,
    /// Path to the recipient public key file.
    #[serde(default)]
    pub pubkeyfile: Option<PathBuf>,
    /// Source roots to back up.
    #[serde(default)]
    pub paths: Vec<PathBuf>,
    /// Exclude patterns, matched as regexes against absolute paths.
    #[serde(default)]
    pub excludes: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RestoreConfig {
    /// Path to the passphrase-locked secret key file.
    #[serde(default)]
    pub secretfile: Option<PathBuf>,
}

impl Config {
    pub fn load(reader: impl Read) -> anyhow::Result<Self> {
        serde_yaml::from_reader(reader).map_err(anyhow::Error::from)
    }

    pub fn load_file(path: &Path) -> anyhow::Result<Self> {
        let file = fs::File::open(path)?;
        Self::load(file).with_context(|| format!("{}: malformed configuration", path.display()))
    }
}

impl BackupConfig {
    /// Compiles the exclude patterns once, up front.
    pub fn compiled_excludes(&self) -> anyhow::Result<Vec<Regex>> {
        self.excludes
            .iter()
            .map(|pattern| {
                Regex::new(pattern).with_context(|| format!("bad exclude pattern {pattern:?}"))
            })
            .collect()
    }
}
