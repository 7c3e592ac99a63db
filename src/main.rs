use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use palimpsest::config::Config;
use palimpsest::envelope::{self, SecretKey};
use palimpsest::model::FileKind;
use palimpsest::snapshot::SnapshotReader;
use palimpsest::{backup, restore, CancelToken};
use rand::rngs::OsRng;
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "palimpsest",
    about = "Encrypted, compressed, incremental file-tree backups"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "palimpsest.yaml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one backup pass over the configured source paths.
    Backup,
    /// Restore increments of one snapshot family into a directory.
    Restore(RestoreArgs),
    /// Generate a recipient keypair.
    Keygen(KeygenArgs),
    /// Print the header and entry table of one snapshot file.
    Cat(CatArgs),
}

#[derive(Debug, Args)]
struct RestoreArgs {
    /// Directory to restore into.
    dest: PathBuf,
    /// Only materialize entries whose original path matches this regex.
    regex: Option<String>,
    /// Highest increment to apply; -1 applies all of them.
    #[arg(default_value_t = -1, allow_hyphen_values = true)]
    level: i32,
}

#[derive(Debug, Args)]
struct KeygenArgs {
    /// Output base name; writes `<out>.pub` and `<out>.key`.
    out: PathBuf,
}

#[derive(Debug, Args)]
struct CatArgs {
    /// Snapshot file to inspect.
    file: PathBuf,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let ctx = CancelToken::new();

    match cli.command {
        Command::Backup => do_backup(&ctx, &cli.config),
        Command::Restore(args) => do_restore(&ctx, &cli.config, &args),
        Command::Keygen(args) => do_keygen(&args),
        Command::Cat(args) => do_cat(&cli.config, &args),
    }
}

fn do_backup(ctx: &CancelToken, config_path: &Path) -> anyhow::Result<()> {
    let config = Config::load_file(config_path)?;

    let Some(dest_dir) = config.backuppath else {
        bail!("backuppath not set");
    };
    if config.backup.group.is_none() {
        bail!("backup group not set");
    }
    if config.backup.paths.is_empty() {
        bail!("no paths to backup");
    }
    let Some(pubkeyfile) = &config.backup.pubkeyfile else {
        bail!("pubkeyfile not set");
    };
    let public_key = envelope::load_public_key(pubkeyfile)?;
    let excludes = config.backup.compiled_excludes()?;

    backup::run(
        ctx,
        &backup::Config {
            source_paths: config.backup.paths,
            excludes,
            dest_dir,
            max_intervals: config.backup.maxintervals,
            public_key,
            gz_level: config.backup.gzlevel,
            group: config.backup.group,
        },
    )
}

fn unlock_secret_key(config: &Config) -> anyhow::Result<SecretKey> {
    let Some(secretfile) = &config.restore.secretfile else {
        bail!("secretfile not set");
    };
    let passphrase = rpassword::prompt_password(format!("{secretfile:?} secret: "))?;
    envelope::load_secret_key(secretfile, passphrase.as_bytes())
}

fn do_restore(ctx: &CancelToken, config_path: &Path, args: &RestoreArgs) -> anyhow::Result<()> {
    let config = Config::load_file(config_path)?;
    let Some(source_dir) = &config.backuppath else {
        bail!("backuppath not set");
    };
    let file_regex = args
        .regex
        .as_deref()
        .map(Regex::new)
        .transpose()
        .context("bad path filter")?;

    let secret_key = unlock_secret_key(&config)?;
    restore::run(
        ctx,
        &secret_key,
        source_dir,
        &args.dest,
        file_regex.as_ref(),
        args.level,
    )
}

fn do_keygen(args: &KeygenArgs) -> anyhow::Result<()> {
    let passphrase = rpassword::prompt_password("passphrase: ")?;
    let confirm = rpassword::prompt_password("confirm passphrase: ")?;
    if passphrase != confirm {
        bail!("passphrases do not match");
    }

    let mut rng = OsRng;
    let (public_key, secret_key) = envelope::generate_keypair(&mut rng);

    let mut pub_path = args.out.as_os_str().to_owned();
    pub_path.push(".pub");
    let pub_path = PathBuf::from(pub_path);
    let mut key_path = args.out.as_os_str().to_owned();
    key_path.push(".key");
    let key_path = PathBuf::from(key_path);

    envelope::save_public_key(&pub_path, &public_key)?;
    envelope::save_secret_key(&mut rng, &key_path, &secret_key, passphrase.as_bytes())?;

    println!("wrote {}", pub_path.display());
    println!("wrote {}", key_path.display());
    Ok(())
}

fn do_cat(config_path: &Path, args: &CatArgs) -> anyhow::Result<()> {
    let config = Config::load_file(config_path)?;
    let secret_key = unlock_secret_key(&config)?;

    let mut reader = SnapshotReader::open(&args.file, &secret_key)?;
    let header = reader.header().clone();
    println!(" Hostname: {}", header.hostname);
    println!("Timestamp: {}", header.timestamp);
    println!("Increment: {}", header.increment);

    while let Some(entry) = reader.read_entry()? {
        if entry.metadata.attrs.is_deleted() {
            println!("{} (deleted)", entry.metadata.path);
        } else {
            println!(
                "{} kind:{:?} mode:{:o} size:{} data:{}",
                entry.metadata.path,
                FileKind::from_mode(entry.metadata.attrs.mode),
                entry.metadata.attrs.permissions(),
                entry.metadata.attrs.size,
                entry.data_len,
            );
        }
        reader.skip_body(entry.data_len)?;
    }
    reader.finish()
}
