//! lockbox: encrypt files at rest under per-file keys
//!
//! Commands:
//!   encrypt <id> <input>   - seal a file into the secure root
//!   decrypt <id> <ext>     - restore <id>.<ext> next to its artifact
//!   usage                  - bytes stored vs the configured ceiling
//!   prune [--keep N]       - keep only the newest N artifacts
//!   remove <id>            - delete an artifact, its metadata and its key
//!   config show            - display the active configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use lockbox_core::{FileIdentifier, LockboxConfig};
use lockbox_engine::{CryptoObserver, Engine, EngineBuilder, JobFailure};
use lockbox_secrets::{KeyStore, KeyringStore};

// ── CLI structure ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "lockbox",
    version,
    about = "Chunked file encryption at rest",
    long_about = "lockbox: encrypt files chunk by chunk with AES-256-GCM, one key per file held in the platform keychain"
)]
struct Cli {
    /// Path to lockbox.toml (default: $XDG_CONFIG_HOME/lockbox/config.toml)
    #[arg(long, short = 'c', env = "LOCKBOX_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides [log] level
    #[arg(long, env = "LOCKBOX_LOG")]
    log: Option<String>,

    /// Log format; overrides [log] format
    #[arg(long, env = "LOCKBOX_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Encrypt a file under a fresh key stored for IDENTIFIER
    Encrypt {
        /// Name of the logical document (no extension, no path separators)
        identifier: String,
        /// Plaintext file to encrypt
        input: PathBuf,
    },

    /// Decrypt IDENTIFIER into <secure root>/<IDENTIFIER>.<EXTENSION>
    Decrypt {
        identifier: String,
        /// Extension of the restored file, e.g. "pdf"
        extension: String,
    },

    /// Show storage used under the secure root
    Usage,

    /// Delete all but the newest artifacts (keys are kept)
    Prune {
        /// Artifacts to keep (default: [budget] retention_count)
        #[arg(long, short = 'k')]
        keep: Option<usize>,
    },

    /// Delete an artifact, its nonce/tag metadata and its key
    Remove { identifier: String },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let (config, found) = load_config(&config_path).await?;

    let level = cli.log.clone().unwrap_or_else(|| config.log.level.clone());
    let format = cli.log_format.clone().unwrap_or(match config.log.format.as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    });
    init_logging(&level, &format);
    if !found {
        warn!(
            "config file not found: {}  (using defaults)",
            config_path.display()
        );
    }

    match cli.command {
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &config_path, found),
        Commands::Encrypt { identifier, input } => {
            cmd_encrypt(&build_engine(&config)?, &identifier, &input).await
        }
        Commands::Decrypt {
            identifier,
            extension,
        } => cmd_decrypt(&build_engine(&config)?, &identifier, &extension).await,
        Commands::Usage => cmd_usage(&build_engine(&config)?).await,
        Commands::Prune { keep } => {
            let keep = keep.unwrap_or(config.budget.retention_count);
            cmd_prune(&build_engine(&config)?, keep).await
        }
        Commands::Remove { identifier } => cmd_remove(&build_engine(&config)?, &identifier).await,
    }
}

// ── Config loading ────────────────────────────────────────────────────────────

fn default_config_path() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
            PathBuf::from(home).join(".config")
        })
        .join("lockbox")
        .join("config.toml")
}

/// Returns the parsed config and whether the file existed.
async fn load_config(path: &Path) -> Result<(LockboxConfig, bool)> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config: {}", path.display()))?;
        let config = toml::from_str(&content)
            .with_context(|| format!("parsing config: {}", path.display()))?;
        Ok((config, true))
    } else {
        Ok((LockboxConfig::default(), false))
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // Logs go to stderr so they never interleave with command output
    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn build_engine(config: &LockboxConfig) -> Result<Engine> {
    let keys = KeyringStore::new(config.app.app_id.clone());
    if !keys.is_available() {
        warn!(app_id = %config.app.app_id, "platform keychain unavailable");
    }
    let keys: Arc<dyn KeyStore> = Arc::new(keys);
    EngineBuilder::from_config(config, keys)
        .build()
        .context("initializing cipher engine")
}

fn parse_identifier(raw: &str) -> Result<FileIdentifier> {
    raw.parse::<FileIdentifier>()
        .with_context(|| format!("'{raw}' cannot be used as a file identifier"))
}

// ── Progress display ──────────────────────────────────────────────────────────

const PROGRESS_STEPS: u64 = 1000;

fn make_progress_bar(prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(PROGRESS_STEPS);
    let style = ProgressStyle::with_template("{prefix:.bold} [{bar:40.cyan/blue}] {percent:>3}% {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-");
    pb.set_style(style);
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Drives a terminal progress bar from job notifications.
struct BarObserver {
    bar: ProgressBar,
}

impl BarObserver {
    fn new(prefix: &str) -> Self {
        Self {
            bar: make_progress_bar(prefix),
        }
    }

    fn set(&self, progress: f32) {
        self.bar
            .set_position((progress.clamp(0.0, 1.0) * PROGRESS_STEPS as f32) as u64);
    }

    fn fail(&self, failure: &JobFailure) {
        self.bar.abandon_with_message(failure.summary);
    }
}

impl CryptoObserver for BarObserver {
    fn encryption_started(&self, id: &FileIdentifier) {
        self.bar.set_message(id.to_string());
    }
    fn encryption_progress(&self, _id: &FileIdentifier, progress: f32) {
        self.set(progress);
    }
    fn encryption_finished(&self, _id: &FileIdentifier) {
        self.bar.finish_with_message("done");
    }
    fn encryption_failed(&self, _id: &FileIdentifier, failure: &JobFailure) {
        self.fail(failure);
    }

    fn decryption_started(&self, id: &FileIdentifier) {
        self.bar.set_message(id.to_string());
    }
    fn decryption_progress(&self, _id: &FileIdentifier, progress: f32) {
        self.set(progress);
    }
    fn decryption_finished(&self, _id: &FileIdentifier) {
        self.bar.finish_with_message("done");
    }
    fn decryption_failed(&self, _id: &FileIdentifier, failure: &JobFailure) {
        self.fail(failure);
    }
}

// ── `lockbox encrypt` ─────────────────────────────────────────────────────────

async fn cmd_encrypt(engine: &Engine, identifier: &str, input: &Path) -> Result<()> {
    let id = parse_identifier(identifier)?;
    let observer: Arc<dyn CryptoObserver> = Arc::new(BarObserver::new("encrypt"));

    let artifact = engine
        .encrypt(&id, input, Some(&observer))
        .await
        .with_context(|| format!("encrypting {}", input.display()))?;

    info!(file_id = %id, chunks = artifact.chunk_count(), "encryption complete");
    println!("  artifact: {}", artifact.path.display());
    println!("  chunks:   {}", artifact.chunk_count());
    Ok(())
}

// ── `lockbox decrypt` ─────────────────────────────────────────────────────────

async fn cmd_decrypt(engine: &Engine, identifier: &str, extension: &str) -> Result<()> {
    let id = parse_identifier(identifier)?;
    let observer: Arc<dyn CryptoObserver> = Arc::new(BarObserver::new("decrypt"));

    let output = engine
        .decrypt(&id, extension, Some(&observer))
        .await
        .with_context(|| format!("decrypting '{id}'"))?;

    println!("  output: {}", output.display());
    Ok(())
}

// ── `lockbox usage` ───────────────────────────────────────────────────────────

async fn cmd_usage(engine: &Engine) -> Result<()> {
    let usage = engine.usage().await.context("measuring secure root")?;
    let root = engine.secure_root()?;
    println!("  secure root: {}", root.path().display());
    println!(
        "  used:        {} / {} ({:.1}%)",
        fmt_bytes(usage.used),
        fmt_bytes(usage.ceiling),
        usage.fraction() * 100.0
    );
    Ok(())
}

// ── `lockbox prune` ───────────────────────────────────────────────────────────

async fn cmd_prune(engine: &Engine, keep: usize) -> Result<()> {
    let removed = engine.prune(keep).await.context("pruning secure root")?;
    if removed.is_empty() {
        println!("  nothing to prune (keeping {keep})");
    }
    for id in &removed {
        println!("  removed: {id}");
    }
    Ok(())
}

// ── `lockbox remove` ──────────────────────────────────────────────────────────

async fn cmd_remove(engine: &Engine, identifier: &str) -> Result<()> {
    let id = parse_identifier(identifier)?;
    engine
        .remove(&id)
        .await
        .with_context(|| format!("removing '{id}'"))?;
    println!("  removed: {id}");
    Ok(())
}

// ── `lockbox config show` ─────────────────────────────────────────────────────

fn cmd_config_show(config: &LockboxConfig, config_path: &Path, found: bool) -> Result<()> {
    if found {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!(
            "# Configuration: defaults (no file at {})",
            config_path.display()
        );
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

fn fmt_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
