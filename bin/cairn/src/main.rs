//! Cairn CLI - command-line interface for the Cairn file store.
//!
//! Provides commands for:
//! - Ingesting files and restoring them byte for byte
//! - Removing files and collecting unreferenced chunks
//! - Verifying stored files end to end
//! - Inspecting files, chunk layouts and store statistics

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cairn_cdc::ChunkingParams;
use cairn_core::FileId;
use cairn_store::{Engine, StoreConfig};
use clap::{Parser, Subcommand};
use tempfile::NamedTempFile;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Cairn content-addressed file store CLI.
#[derive(Parser)]
#[command(name = "cairn")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file path
    #[arg(short, long, default_value = "~/.cairn/config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize Cairn configuration
    Init {
        /// Force overwrite existing config
        #[arg(long)]
        force: bool,
    },

    /// Store one or more files
    Ingest {
        /// Files to store
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Rebuild a stored file
    Restore {
        /// File ID
        file_id: FileId,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Remove a file from the catalog
    Remove {
        /// File ID
        file_id: FileId,
    },

    /// Delete chunks no file references
    Gc,

    /// Check stored files against their digests
    Verify {
        /// File ID to verify
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        file_id: Option<FileId>,

        /// Verify every file in the catalog
        #[arg(long)]
        all: bool,
    },

    /// List stored files
    Ls,

    /// Show a file's metadata and chunk layout
    Info {
        /// File ID
        file_id: FileId,
    },

    /// Compare a local file against a stored one
    Diff {
        /// File ID
        file_id: FileId,

        /// Local file to compare
        path: PathBuf,
    },

    /// Show store statistics
    Stats,
}

/// Settings read from the configuration file.
#[derive(Debug, Clone, PartialEq)]
struct CliConfig {
    /// Store directory
    data_dir: PathBuf,
    /// Row lock wait in milliseconds
    lock_timeout_ms: u64,
    /// fsync payloads and WAL
    sync_writes: bool,
    /// Chunk sizes (min, target, max)
    chunk_sizes: (usize, usize, usize),
}

impl Default for CliConfig {
    fn default() -> Self {
        let chunking = ChunkingParams::default();
        Self {
            data_dir: PathBuf::from("~/.cairn/data"),
            lock_timeout_ms: StoreConfig::default().lock_timeout_ms,
            sync_writes: false,
            chunk_sizes: (chunking.min_size, chunking.avg_size, chunking.max_size),
        }
    }
}

impl CliConfig {
    fn store_config(&self) -> Result<StoreConfig> {
        let (min, target, max) = self.chunk_sizes;
        let chunking = ChunkingParams::new(min, target, max).context("Invalid chunking parameters")?;
        Ok(StoreConfig {
            chunking,
            lock_timeout_ms: self.lock_timeout_ms,
            sync_writes: self.sync_writes,
            ..StoreConfig::new(expand_tilde(&self.data_dir))
        })
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set up logging")?;

    if let Commands::Init { force } = cli.command {
        return cmd_init(&cli.config, force);
    }

    let config = load_config(&cli.config)?;
    let engine = Engine::open(config.store_config()?).context("Failed to open store")?;

    match cli.command {
        Commands::Init { .. } => Ok(()),
        Commands::Ingest { paths } => cmd_ingest(&engine, &paths),
        Commands::Restore { file_id, output } => cmd_restore(&engine, &file_id, output.as_deref()),
        Commands::Remove { file_id } => cmd_remove(&engine, &file_id),
        Commands::Gc => cmd_gc(&engine),
        Commands::Verify { file_id, all } => cmd_verify(&engine, file_id.as_ref(), all),
        Commands::Ls => cmd_ls(&engine),
        Commands::Info { file_id } => cmd_info(&engine, &file_id),
        Commands::Diff { file_id, path } => cmd_diff(&engine, &file_id, &path),
        Commands::Stats => cmd_stats(&engine),
    }
}

/// Load configuration from TOML file.
fn load_config(path: &Path) -> Result<CliConfig> {
    let path = expand_tilde(path);

    if !path.exists() {
        info!("No config file found at {:?}, using defaults", path);
        return Ok(CliConfig::default());
    }

    let content = std::fs::read_to_string(&path).context("Failed to read config file")?;
    parse_config(&content)
}

fn parse_config(content: &str) -> Result<CliConfig> {
    let toml: toml::Value = content.parse().context("Failed to parse config file")?;
    let mut config = CliConfig::default();

    if let Some(storage) = toml.get("storage") {
        if let Some(data_dir) = storage.get("data_dir").and_then(|v| v.as_str()) {
            config.data_dir = PathBuf::from(data_dir);
        }
        if let Some(timeout) = storage.get("lock_timeout_ms").and_then(|v| v.as_integer()) {
            config.lock_timeout_ms = u64::try_from(timeout).context("lock_timeout_ms must not be negative")?;
        }
        if let Some(sync) = storage.get("sync_writes").and_then(|v| v.as_bool()) {
            config.sync_writes = sync;
        }
    }

    if let Some(chunking) = toml.get("chunking") {
        let size = |key: &str| -> Result<Option<usize>> {
            chunking
                .get(key)
                .and_then(|v| v.as_integer())
                .map(|n| usize::try_from(n).with_context(|| format!("{key} must not be negative")))
                .transpose()
        };
        let (min, target, max) = &mut config.chunk_sizes;
        if let Some(n) = size("min_size")? {
            *min = n;
        }
        if let Some(n) = size("target_size")? {
            *target = n;
        }
        if let Some(n) = size("max_size")? {
            *max = n;
        }
    }

    Ok(config)
}

/// Expand ~ to home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

fn cmd_init(config_path: &Path, force: bool) -> Result<()> {
    let config_file = expand_tilde(config_path);

    if config_file.exists() && !force {
        anyhow::bail!("Configuration already exists at {:?}. Use --force to overwrite.", config_file);
    }

    if let Some(dir) = config_file.parent() {
        std::fs::create_dir_all(dir).context("Failed to create config directory")?;
    }

    let defaults = CliConfig::default();
    let (min, target, max) = defaults.chunk_sizes;
    let config_content = format!(
        r#"# Cairn Configuration

[storage]
# Store directory (metadata database and chunk payloads)
data_dir = "{}"
# How long a transaction waits for a row lock, in milliseconds
lock_timeout_ms = {}
# fsync every payload and metadata commit
sync_writes = {}

[chunking]
# Content-defined chunk sizes in bytes. Changing them only affects new ingests;
# identical content chunked with different sizes will not deduplicate.
min_size = {}
target_size = {}
max_size = {}
"#,
        defaults.data_dir.display(),
        defaults.lock_timeout_ms,
        defaults.sync_writes,
        min,
        target,
        max,
    );

    std::fs::write(&config_file, config_content).context("Failed to write config file")?;
    println!("Initialized Cairn configuration at {:?}", config_file);

    Ok(())
}

fn cmd_ingest(engine: &Engine, paths: &[PathBuf]) -> Result<()> {
    let results = engine.ingest_batch(paths);
    let mut failed = 0;

    for (path, result) in paths.iter().zip(results) {
        match result {
            Ok(report) => println!(
                "{}  {}  {} bytes, {} chunks ({} new, {} bytes new)",
                report.file_id,
                path.display(),
                report.size,
                report.chunks,
                report.new_chunks,
                report.new_bytes
            ),
            Err(e) => {
                eprintln!("Failed to ingest {}: {}", path.display(), e);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{} of {} files failed to ingest", failed, paths.len());
    }
    Ok(())
}

fn cmd_restore(engine: &Engine, file_id: &FileId, output: Option<&Path>) -> Result<()> {
    let Some(output_path) = output else {
        // Fully verified before anything reaches stdout
        let data = engine.restore(file_id).context("Failed to restore file")?;
        let mut stdout = io::stdout().lock();
        stdout.write_all(&data)?;
        stdout.flush()?;
        return Ok(());
    };

    let dir = match output_path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut temp = NamedTempFile::new_in(dir).context("Failed to create temporary file")?;
    let written = engine
        .restore_to(file_id, temp.as_file_mut())
        .context("Failed to restore file")?;
    temp.as_file().sync_all()?;
    temp.persist(output_path).context("Failed to write output file")?;

    println!("Restored {} bytes to {:?}", written, output_path);
    Ok(())
}

fn cmd_remove(engine: &Engine, file_id: &FileId) -> Result<()> {
    let file = engine.remove(file_id).context("Failed to remove file")?;
    println!("Removed {} ({})", file.id, file.path);
    println!("Run `cairn gc` to reclaim unreferenced chunks.");
    Ok(())
}

fn cmd_gc(engine: &Engine) -> Result<()> {
    let report = engine.run_gc().context("Garbage collection failed")?;

    println!("Garbage collection complete:");
    println!("  Chunks removed: {}", report.chunks_removed);
    println!("  Bytes reclaimed: {}", report.bytes_reclaimed);
    println!("  Orphan payloads removed: {}", report.payloads_removed);
    if report.stale_files_removed > 0 {
        println!("  Abandoned temp files removed: {}", report.stale_files_removed);
    }
    let skipped = report.skipped_pinned + report.skipped_referenced + report.skipped_busy;
    if skipped > 0 {
        println!("  Skipped (in use): {}", skipped);
    }
    Ok(())
}

fn cmd_verify(engine: &Engine, file_id: Option<&FileId>, all: bool) -> Result<()> {
    let ids: Vec<FileId> = match file_id {
        Some(id) if !all => vec![*id],
        _ => engine.list_files()?.into_iter().map(|f| f.id).collect(),
    };

    let mut failed = 0;
    for id in &ids {
        match engine.verify(id) {
            Ok(()) => println!("OK    {}", id),
            Err(e) => {
                warn!(file_id = %id, error = %e, "Verification failed");
                println!("FAIL  {}  {}", id, e);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{} of {} files failed verification", failed, ids.len());
    }
    Ok(())
}

fn cmd_ls(engine: &Engine) -> Result<()> {
    for file in engine.list_files()? {
        println!("{}  {:>12}  {}", file.id, file.size, file.path);
    }
    Ok(())
}

fn cmd_info(engine: &Engine, file_id: &FileId) -> Result<()> {
    let file = engine.file(file_id).context("Failed to read file")?;
    let sections = engine.sections_for(file_id)?;

    println!("File Information:");
    println!("  ID: {}", file.id);
    println!("  Name: {}", file.name);
    println!("  Path: {}", file.path);
    println!("  Size: {} bytes", file.size);
    println!("  Hash: {}", file.hash.to_hex());
    println!("  Chunks: {}", file.chunk_count);
    for section in &sections {
        println!(
            "    #{:<5} {:>12} +{:<8} {}",
            section.chunk_index, section.offset, section.size, section.digest
        );
    }
    Ok(())
}

fn cmd_diff(engine: &Engine, file_id: &FileId, path: &Path) -> Result<()> {
    let source = std::fs::File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    let changes = engine.diff(file_id, source).context("Failed to compare file")?;

    if changes.is_unchanged() {
        println!("{} is identical to {}", path.display(), file_id);
        return Ok(());
    }

    println!("Changes against {}:", file_id);
    println!("  Chunks: {}", changes.total_chunks);
    println!("  Changed indices: {:?}", changes.changed_indices);
    println!("  Chunks dropped: {}", changes.removed_chunks);
    println!("  New chunks: {} ({} bytes)", changes.new_chunks, changes.new_bytes);
    println!("  Size: {} bytes", changes.size);
    println!("  Hash: {}", changes.whole_file_hash.to_hex());
    Ok(())
}

fn cmd_stats(engine: &Engine) -> Result<()> {
    let stats = engine.stats()?;

    println!("Store: {:?}", engine.config().base_path);
    println!("  Files: {}", stats.files);
    println!("  Chunks: {}", stats.chunks);
    println!("  Stored bytes: {}", stats.stored_bytes);
    println!("  Logical bytes: {}", stats.logical_bytes);
    println!("  Dedup ratio: {:.2}", stats.dedup_ratio());
    Ok(())
}
