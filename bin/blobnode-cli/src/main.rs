//! blobnode CLI - operator command line interface
//!
//! Runs engine operations directly against a local data directory.

mod transfer;

use anyhow::{Context, Result, bail};
use blobnode_common::{EngineConfig, MetaBackend, NodeId};
use blobnode_storage::BlobEngine;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transfer::Selection;

#[derive(Parser, Debug)]
#[command(name = "blobnode")]
#[command(about = "blobnode storage engine CLI")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/blobnode/blobnode.toml", env = "BLOBNODE_CONFIG")]
    config: PathBuf,

    /// Data directory (overrides the config file)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Metadata backend (overrides the config file)
    #[arg(long, value_enum)]
    backend: Option<Backend>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Backend {
    Redb,
    Sqlite,
}

impl From<Backend> for MetaBackend {
    fn from(backend: Backend) -> Self {
        match backend {
            Backend::Redb => Self::Redb,
            Backend::Sqlite => Self::Sqlite,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Store a file (or stdin with `-`) under a path
    Put {
        path: String,
        source: PathBuf,
        /// Compression tag (0 none, 1 lz4, 2 zstd, 3-11 zlib)
        #[arg(long)]
        compress: Option<i32>,
    },
    /// Print the content of a path (or write it to a file)
    Get {
        path: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Delete a path
    Delete { path: String },
    /// Rename a path
    Rename { from: String, to: String },
    /// Check whether a path exists
    Exists { path: String },
    /// List paths by prefix, or by sequence range with --range START:LIMIT
    List {
        #[arg(default_value = "")]
        prefix: String,
        #[arg(long, conflicts_with = "prefix")]
        range: Option<String>,
    },
    /// Show space accounting of every node
    Nodes,
    /// Show space accounting of one node
    Frag { node: String },
    /// Compact a node, or every sealed node holding dead bytes with --all
    Defrag {
        node: Option<String>,
        #[arg(long, conflicts_with = "node")]
        all: bool,
    },
    /// Export metadata or file data as JSON lines
    Export {
        /// Sequence range START:LIMIT (metadata groups, or file data with --files)
        #[arg(long)]
        range: Option<String>,
        /// Export these paths' metadata
        #[arg(long, num_args = 1.., conflicts_with = "range")]
        paths: Vec<String>,
        /// Export decompressed file data instead of metadata
        #[arg(long, requires = "range")]
        files: bool,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Replay an export file
    Import {
        input: PathBuf,
        #[arg(long)]
        overwrite: bool,
    },
    /// Show engine counters
    Stats,
}

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct Config {
    #[serde(default)]
    engine: EngineConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
struct LoggingConfig {
    #[serde(default = "default_log_level")]
    level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("failed to parse config file {}", path.display()))
}

fn parse_node(value: &str) -> Result<NodeId> {
    NodeId::decode(value).with_context(|| format!("{value:?} is not a valid node id"))
}

fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = load_config(&args.config)?;

    // Merge CLI args with config file (CLI takes precedence)
    if let Some(dir) = args.data_dir {
        config.engine.data_dir = dir;
    }
    if let Some(backend) = args.backend {
        config.engine.meta_backend = backend.into();
    }
    let log_level = args.log_level.unwrap_or(config.logging.level);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let engine = BlobEngine::open(config.engine)?;
    let result = run(&engine, args.command);
    engine.close()?;
    result
}

fn run(engine: &BlobEngine, command: Commands) -> Result<()> {
    let stdout = std::io::stdout();
    match command {
        Commands::Put {
            path,
            source,
            compress,
        } => {
            let mut data = Vec::new();
            if source.as_os_str() == "-" {
                std::io::stdin().read_to_end(&mut data)?;
            } else {
                File::open(&source)
                    .with_context(|| format!("failed to open {}", source.display()))?
                    .read_to_end(&mut data)?;
            }
            match engine.append(&path, &data, compress)? {
                Some(seq) => println!("{path}: stored {} bytes (seq {seq})", data.len()),
                None => println!("{path}: stored {} bytes", data.len()),
            }
        }
        Commands::Get { path, output } => {
            let data = engine.get(&path)?;
            match output {
                Some(file) => std::fs::write(&file, &data)?,
                None => stdout.lock().write_all(&data)?,
            }
        }
        Commands::Delete { path } => {
            engine.delete(&path)?;
            println!("Deleted {path}");
        }
        Commands::Rename { from, to } => {
            engine.rename(&from, &to)?;
            println!("Renamed {from} -> {to}");
        }
        Commands::Exists { path } => {
            println!("{}", engine.exists(&path)?);
        }
        Commands::List { prefix, range } => {
            let entries = match range {
                Some(range) => {
                    let (start, limit) = transfer::parse_range(&range)?;
                    engine.list_by_range(start, limit)?
                }
                None => engine.list_by_prefix(&prefix)?,
            };
            for entry in entries {
                println!(
                    "{:>8}  {:>10}  {:>20}  {}",
                    entry.id,
                    entry.body.len(),
                    entry.timestamp,
                    entry.path
                );
            }
        }
        Commands::Nodes => {
            let active = engine.active_node();
            for node in engine.nodes() {
                if Some(node) == active {
                    println!("{node}  active  end={}", engine.node_end(node)?.unwrap_or(0));
                    continue;
                }
                let report = engine.fragmentation(node)?;
                println!(
                    "{node}  sealed  file={} committed={} reclaimable={} live={}",
                    report.file_size,
                    report.committed_size,
                    report.reclaimable_size,
                    report.live_size
                );
            }
        }
        Commands::Frag { node } => {
            let report = engine.fragmentation(parse_node(&node)?)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Defrag { node, all } => {
            if all {
                defrag_all(engine)?;
            } else {
                let Some(node) = node else {
                    bail!("give a node id or --all");
                };
                engine.defragment(parse_node(&node)?)?;
                println!("Compacted node {node}");
            }
        }
        Commands::Export {
            range,
            paths,
            files,
            output,
        } => {
            let selection = match (range, files) {
                (Some(range), files) => {
                    let (start, limit) = transfer::parse_range(&range)?;
                    if files {
                        Selection::Files { start, limit }
                    } else {
                        Selection::Range { start, limit }
                    }
                }
                (None, _) if !paths.is_empty() => Selection::Paths(paths),
                (None, _) => Selection::Full,
            };
            let count = match output {
                Some(file) => {
                    let mut out = BufWriter::new(File::create(&file)?);
                    transfer::export(engine, &selection, &mut out)?
                }
                None => transfer::export(engine, &selection, &mut stdout.lock())?,
            };
            info!("Exported {} records", count);
        }
        Commands::Import { input, overwrite } => {
            let reader = BufReader::new(
                File::open(&input).with_context(|| format!("failed to open {}", input.display()))?,
            );
            let summary = transfer::import(engine, reader, overwrite)?;
            println!("Applied {}, skipped {}", summary.applied, summary.skipped);
        }
        Commands::Stats => {
            println!("{}", serde_json::to_string_pretty(&engine.stats())?);
        }
    }
    Ok(())
}

/// Compact every sealed node that holds dead bytes
fn defrag_all(engine: &BlobEngine) -> Result<()> {
    let active = engine.active_node();
    for node in engine.nodes() {
        if Some(node) == active || engine.reclaimable(node)? == 0 {
            continue;
        }
        match engine.defragment(node) {
            Ok(()) => println!("Compacted node {node}"),
            Err(e) => warn!("Compaction of node {} failed: {}", node, e),
        }
    }
    Ok(())
}
