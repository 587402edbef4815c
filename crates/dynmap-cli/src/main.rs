//! Command-line interface for the dynamic mapper.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{debug, info, warn};

use dynmap_core::config::{env_vars, EngineConfig};
use dynmap_core::mapping::Mapping;
use dynmap_processor::{InMemoryPlatform, MappingEngine, PlatformClient, TransportMessage};
use dynmap_storage::{MappingStore, MemoryStateStore, RedbStateStore, StateStore};

const MAPPINGS_FILE: &str = "mappings.redb";
const STATE_FILE: &str = "state.redb";

/// Dynamic mapper - transform device payloads into platform objects.
#[derive(Parser, Debug)]
#[command(name = "dynmap")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Engine configuration file (TOML).
    #[arg(short, long, global = true, env = "DYNMAP_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate mapping definitions.
    Validate {
        /// JSON file holding a mapping or an array of mappings.
        path: PathBuf,
    },
    /// Run a payload through a mapping without sending anything.
    Test {
        /// JSON file holding the mapping.
        #[arg(short, long)]
        mapping: PathBuf,
        /// Topic the payload arrived on.
        #[arg(short, long)]
        topic: String,
        /// Payload text.
        #[arg(short, long, conflicts_with = "payload_file")]
        payload: Option<String>,
        /// Read the payload from a file.
        #[arg(long)]
        payload_file: Option<PathBuf>,
    },
    /// Store mappings in a data directory.
    Import {
        #[arg(short, long, env = "DYNMAP_DATA_DIR")]
        data_dir: PathBuf,
        path: PathBuf,
    },
    /// List stored mappings.
    List {
        #[arg(short, long, env = "DYNMAP_DATA_DIR")]
        data_dir: PathBuf,
    },
    /// Show or clear Smart Function state.
    State {
        #[arg(short, long, env = "DYNMAP_DATA_DIR")]
        data_dir: PathBuf,
        /// Only this mapping.
        #[arg(short, long)]
        mapping: Option<String>,
        /// Clear instead of show.
        #[arg(long, requires = "mapping")]
        clear: bool,
    },
    /// Process one message with the stored mappings against a live platform.
    Send {
        #[arg(short, long, env = "DYNMAP_DATA_DIR")]
        data_dir: PathBuf,
        /// Platform base URL.
        #[arg(long, env = "DYNMAP_PLATFORM_URL")]
        url: String,
        #[arg(long, env = "DYNMAP_PLATFORM_USER")]
        user: Option<String>,
        #[arg(long, env = "DYNMAP_PLATFORM_PASSWORD", hide_env_values = true)]
        password: Option<String>,
        #[arg(short, long)]
        topic: String,
        #[arg(short, long)]
        payload: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = match &args.config {
        Some(path) => {
            debug!(path = %path.display(), "Loading configuration file");
            EngineConfig::from_toml_file(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?
        }
        None => EngineConfig::from_env(),
    };
    debug!(
        script_timeout_ms = config.sandbox.timeout_ms,
        dispatch_workers = config.dispatch.workers,
        "Configuration loaded"
    );

    match args.command {
        Command::Validate { path } => validate(&path),
        Command::Test {
            mapping,
            topic,
            payload,
            payload_file,
        } => {
            let payload = match (payload, payload_file) {
                (Some(text), _) => text.into_bytes(),
                (None, Some(file)) => std::fs::read(&file)
                    .with_context(|| format!("Failed to read {}", file.display()))?,
                (None, None) => bail!("either --payload or --payload-file is required"),
            };
            let report = test_mapping(config, &mapping, &topic, payload).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Import { data_dir, path } => {
            let store = open_store(&data_dir)?;
            let mappings = read_mappings(&path)?;
            info!(count = mappings.len(), data_dir = %data_dir.display(), "Importing mappings");
            for mapping in mappings {
                let stored = store.upsert(mapping)?;
                println!("Imported {} ({})", stored.id, stored.mapping_topic);
            }
            Ok(())
        }
        Command::List { data_dir } => {
            let store = open_store(&data_dir)?;
            for mapping in store.list() {
                println!(
                    "{:<24} {:<9} {:<8} {:<12} {}",
                    mapping.id,
                    if mapping.is_inbound() { "inbound" } else { "outbound" },
                    if mapping.active { "active" } else { "inactive" },
                    mapping.target_api.name(),
                    mapping.mapping_topic
                );
            }
            Ok(())
        }
        Command::State {
            data_dir,
            mapping,
            clear,
        } => show_state(&data_dir, mapping.as_deref(), clear).await,
        Command::Send {
            data_dir,
            url,
            user,
            password,
            topic,
            payload,
        } => {
            let store = Arc::new(open_store(&data_dir)?);
            let mut client = PlatformClient::new(url);
            if let Some(user) = user {
                client = client.with_credentials(user, password.unwrap_or_default());
            }
            let client = Arc::new(client);
            let engine = MappingEngine::new(config, store, client.clone(), client);
            info!(topic = %topic, "Sending message");
            let outcomes = engine.process(TransportMessage::new(topic, payload.into_bytes())).await;
            if outcomes.is_empty() {
                warn!("No active mapping subscribed to this topic");
                println!("No active mapping subscribed to this topic");
            }
            println!("{}", serde_json::to_string_pretty(&outcomes)?);
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let json_logging = std::env::var(env_vars::LOG_JSON)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let default_level = if verbose { "dynmap=debug" } else { "dynmap=info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .compact()
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Mappings from a file holding one mapping or an array of them.
fn read_mappings(path: &Path) -> Result<Vec<Mapping>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    parse_mappings(&text).with_context(|| format!("Invalid mapping file {}", path.display()))
}

fn parse_mappings(text: &str) -> Result<Vec<Mapping>> {
    let value: Value = serde_json::from_str(text)?;
    let mappings = match value {
        Value::Array(items) => items
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<Mapping>, _>>()?,
        other => vec![serde_json::from_value(other)?],
    };
    Ok(mappings)
}

fn validate(path: &Path) -> Result<()> {
    let mappings = read_mappings(path)?;
    let mut failed = 0;
    for mapping in &mappings {
        match mapping.validate() {
            Ok(()) => println!("PASSED  {}", mapping.id),
            Err(e) => {
                failed += 1;
                println!("FAILED  {}: {}", mapping.id, e);
            }
        }
    }
    if failed > 0 {
        bail!("{} of {} mappings are invalid", failed, mappings.len());
    }
    Ok(())
}

/// Dry run against an empty in-memory platform.
async fn test_mapping(config: EngineConfig, path: &Path, topic: &str, payload: Vec<u8>) -> Result<Value> {
    let mut mappings = read_mappings(path)?;
    if mappings.len() != 1 {
        bail!("expected exactly one mapping in {}", path.display());
    }
    let mapping = mappings.remove(0);
    mapping.validate()?;
    info!(mapping = %mapping.id, topic = %topic, bytes = payload.len(), "Dry run");

    let store = Arc::new(MappingStore::memory(Arc::new(MemoryStateStore::new())));
    let platform = Arc::new(InMemoryPlatform::new());
    let engine = MappingEngine::new(config, store, platform.clone(), platform);
    let outcome = engine.test(&mapping, &TransportMessage::new(topic, payload)).await;
    Ok(serde_json::to_value(outcome)?)
}

fn open_store(data_dir: &Path) -> Result<MappingStore> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create {}", data_dir.display()))?;
    let state: Arc<dyn StateStore> = Arc::new(RedbStateStore::open(data_dir.join(STATE_FILE))?);
    Ok(MappingStore::open(data_dir.join(MAPPINGS_FILE), state)?)
}

async fn show_state(data_dir: &Path, mapping: Option<&str>, clear: bool) -> Result<()> {
    let store = open_store(data_dir)?;
    let state = store.state();

    if let (Some(id), true) = (mapping, clear) {
        let existed = state.clear(id).await?;
        println!("{}", if existed { "State cleared" } else { "No state stored" });
        return Ok(());
    }

    let ids = match mapping {
        Some(id) => vec![id.to_string()],
        None => state.mapping_ids().await?,
    };
    for id in ids {
        let current = state.load(&id).await?;
        println!("{}: {}", id, Value::Object(current));
    }
    Ok(())
}
