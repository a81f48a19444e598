//! stree CLI - Command line interface for state_tree
//!
//! Keeps a sparse merkle tree in a single store file. Named roots select which
//! version of the tree a command works on. Keys and values are hex.

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use state_tree::model::hex_serde;
use state_tree::{verify, Hash, ObjectStore, Proof, SparseMerkleTree, TreeConfig};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "stree")]
#[command(about = "An authenticated sparse key-value tree")]
#[command(version)]
struct Cli {
    /// Path to the store file
    #[arg(short, long, default_value = "state.smt")]
    database: PathBuf,

    /// Output format (json or text)
    #[arg(short, long, default_value = "json")]
    format: OutputFormat,

    /// Config file (defaults to the user config dir if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Named root to read and advance
    #[arg(short, long, default_value = "main")]
    root_ref: String,

    /// Log more (-v info, -vv debug, -vvv trace). RUST_LOG takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    Json,
    Text,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new store with an empty tree
    Init,

    /// Insert or overwrite one key
    Update {
        /// Key (hex)
        key: String,
        /// Value (hex)
        value: String,
    },

    /// Apply a JSON file of `[{"key": hex, "value": hex}, ...]` in one batch
    Batch {
        /// Path to the batch file
        file: PathBuf,
    },

    /// Remove a key
    Remove {
        /// Key (hex)
        key: String,
    },

    /// Get the value stored under a key
    Get {
        /// Key (hex)
        key: String,
    },

    /// Show the current root hash
    Root,

    /// Print a proof for one or more keys
    Prove {
        /// Keys (hex)
        #[arg(required = true)]
        keys: Vec<String>,
    },

    /// Check a proof file against a root
    Verify {
        /// Expected root hash (hex)
        #[arg(long)]
        root: String,
        /// Proof file as printed by `prove`
        #[arg(long)]
        proof: PathBuf,
        /// Keys the proof answers (hex)
        #[arg(required = true)]
        keys: Vec<String>,
    },

    /// Show store status
    Status,
}

#[derive(Deserialize)]
struct BatchEntry {
    #[serde(with = "hex_serde")]
    key: Vec<u8>,
    #[serde(with = "hex_serde")]
    value: Vec<u8>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = TreeConfig::resolve(cli.config.as_deref())?;

    match cli.command {
        Commands::Init => {
            let store = ObjectStore::create(&cli.database)?;
            store.set_ref(&cli.root_ref, Hash::EMPTY);
            store.sync()?;
            output(
                &cli.format,
                &serde_json::json!({
                    "status": "ok",
                    "message": format!("Created store at {}", cli.database.display()),
                    "root": Hash::EMPTY.to_hex()
                }),
            )?;
        }

        Commands::Update { key, value } => {
            let key = parse_hex(&key)?;
            let value = parse_hex(&value)?;
            let store = open_store(&cli.database, &config)?;
            let mut tree = open_tree(&store, &cli.root_ref, &config);
            tree.update(&key, &value)?;
            let root = commit(&store, &cli.root_ref, tree.root_hash(), &config)?;
            output(
                &cli.format,
                &serde_json::json!({
                    "status": "ok",
                    "root": root.to_hex()
                }),
            )?;
        }

        Commands::Batch { file } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let entries: Vec<BatchEntry> = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", file.display()))?;
            let count = entries.len();
            let (keys, values) = entries.into_iter().map(|e| (e.key, e.value)).unzip();

            let store = open_store(&cli.database, &config)?;
            let mut tree = open_tree(&store, &cli.root_ref, &config);
            tree.update_batch(keys, values)?;
            let root = commit(&store, &cli.root_ref, tree.root_hash(), &config)?;
            output(
                &cli.format,
                &serde_json::json!({
                    "status": "ok",
                    "updated": count,
                    "root": root.to_hex()
                }),
            )?;
        }

        Commands::Remove { key } => {
            let key = parse_hex(&key)?;
            let store = open_store(&cli.database, &config)?;
            let mut tree = open_tree(&store, &cli.root_ref, &config);
            tree.remove(&key)?;
            let root = commit(&store, &cli.root_ref, tree.root_hash(), &config)?;
            output(
                &cli.format,
                &serde_json::json!({
                    "status": "ok",
                    "root": root.to_hex()
                }),
            )?;
        }

        Commands::Get { key } => {
            let key_bytes = parse_hex(&key)?;
            let store = open_store(&cli.database, &config)?;
            let tree = open_tree(&store, &cli.root_ref, &config);
            match tree.get(&key_bytes)? {
                Some(value) => {
                    output(
                        &cli.format,
                        &serde_json::json!({
                            "key": key,
                            "value": hex::encode(value)
                        }),
                    )?;
                }
                None => {
                    output(
                        &cli.format,
                        &serde_json::json!({
                            "status": "error",
                            "message": format!("Key not found: {}", key)
                        }),
                    )?;
                    std::process::exit(1);
                }
            }
        }

        Commands::Root => {
            let store = open_store(&cli.database, &config)?;
            let tree = open_tree(&store, &cli.root_ref, &config);
            output(
                &cli.format,
                &serde_json::json!({
                    "ref": cli.root_ref,
                    "root": tree.root_hash().to_hex()
                }),
            )?;
        }

        Commands::Prove { keys } => {
            let keys = keys
                .iter()
                .map(|k| parse_hex(k))
                .collect::<anyhow::Result<Vec<_>>>()?;
            let store = open_store(&cli.database, &config)?;
            let tree = open_tree(&store, &cli.root_ref, &config);
            let proof = tree.generate_multi_proof(&keys)?;
            output(&cli.format, &serde_json::to_value(&proof)?)?;
        }

        Commands::Verify { root, proof, keys } => {
            let root = Hash::from_hex(root.trim_start_matches("0x"))
                .map_err(|_| anyhow::anyhow!("Invalid root hash: {}", root))?;
            let content = std::fs::read_to_string(&proof)
                .with_context(|| format!("Failed to read {}", proof.display()))?;
            let proof: Proof = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", proof.display()))?;
            let keys = keys
                .iter()
                .map(|k| parse_hex(k))
                .collect::<anyhow::Result<Vec<_>>>()?;

            let valid = verify(&keys, &proof, &root, config.key_length);
            output(&cli.format, &serde_json::json!({ "valid": valid }))?;
            if !valid {
                std::process::exit(1);
            }
        }

        Commands::Status => {
            let store = open_store(&cli.database, &config)?;
            let refs: serde_json::Map<_, _> = store
                .list_refs()
                .into_iter()
                .map(|(name, hash)| (name, serde_json::Value::from(hash.to_hex())))
                .collect();
            output(
                &cli.format,
                &serde_json::json!({
                    "database": cli.database.display().to_string(),
                    "ref": cli.root_ref,
                    "key_length": config.key_length,
                    "nodes": store.object_count(),
                    "refs": refs
                }),
            )?;
        }
    }

    Ok(())
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open_store(path: &Path, config: &TreeConfig) -> anyhow::Result<ObjectStore> {
    let store = ObjectStore::open_or_create(path)?.with_compression(config.compression_level);
    Ok(store)
}

fn open_tree<'a>(
    store: &'a ObjectStore,
    root_ref: &str,
    config: &TreeConfig,
) -> SparseMerkleTree<'a, ObjectStore> {
    let root = store.get_ref(root_ref).unwrap_or(Hash::EMPTY);
    // Other named roots may share nodes, pruning is done by `commit`
    SparseMerkleTree::from_config(store, root, config).with_pruning(false)
}

/// Point the named root at `root`, drop unreachable nodes and flush the store
fn commit(
    store: &ObjectStore,
    root_ref: &str,
    root: Hash,
    config: &TreeConfig,
) -> anyhow::Result<Hash> {
    store.set_ref(root_ref, root);
    if config.prune {
        collect_garbage(store, config)?;
    }
    store.sync()?;
    info!(root_ref, root = %root.short(), "committed root");
    Ok(root)
}

/// Mark every node reachable from a named root and drop the rest
fn collect_garbage(store: &ObjectStore, config: &TreeConfig) -> anyhow::Result<usize> {
    let mut live = HashSet::new();
    for (name, root) in store.list_refs() {
        let tree = SparseMerkleTree::new(store, config.key_length).with_root(root);
        let reachable = tree
            .reachable()
            .with_context(|| format!("Failed to walk root {}", name))?;
        live.extend(reachable);
    }

    let dropped = store.retain(&live);
    debug!(live = live.len(), dropped, "collected garbage");
    Ok(dropped)
}

fn parse_hex(s: &str) -> anyhow::Result<Vec<u8>> {
    hex::decode(s.trim_start_matches("0x")).with_context(|| format!("Invalid hex: {}", s))
}

fn output(format: &OutputFormat, value: &serde_json::Value) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string(value)?),
        OutputFormat::Text => println!("{}", serde_json::to_string_pretty(value)?),
    }
    Ok(())
}
