//! Command-line interface for the dynmap mapping gateway.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dynmap_core::config::env_vars;
use dynmap_core::{Direction, GatewayConfig};
use dynmap_engine::{
    DeviceIdentityResolver, InMemoryIdentityResolver, InboundProcessor, MappingRegistry,
};
use serde_json::Value;

/// dynmap - Map device messages onto platform documents.
#[derive(Parser, Debug)]
#[command(name = "dynmap")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Tenant to operate on (overrides the config file).
    #[arg(short, long, global = true)]
    tenant: Option<String>,

    /// Configuration file (TOML).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Validate a mapping file and check that all mappings fit in one tree.
    Validate {
        /// JSON file with an array of mappings.
        #[arg(required = true)]
        mappings: PathBuf,
    },
    /// Print the ids of the inbound mappings a topic resolves to.
    Resolve {
        /// JSON file with an array of mappings.
        #[arg(short, long)]
        mappings: PathBuf,
        /// Topic to resolve.
        topic: String,
    },
    /// Process one message and print the produced documents.
    Process {
        /// JSON file with an array of mappings.
        #[arg(short, long)]
        mappings: PathBuf,
        /// Topic the message arrived on.
        #[arg(long)]
        topic: String,
        /// Message payload.
        #[arg(long, conflicts_with = "payload_file")]
        payload: Option<String>,
        /// Read the message payload from a file.
        #[arg(long)]
        payload_file: Option<PathBuf>,
        /// JSON object mapping external ids to internal ids.
        #[arg(long)]
        identities: Option<PathBuf>,
    },
    /// Print the topic tree built from a mapping file.
    Tree {
        /// JSON file with an array of mappings.
        #[arg(required = true)]
        mappings: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let mut config = GatewayConfig::load_or_default(args.config.as_deref())?;
    if let Some(tenant) = args.tenant {
        config.tenant = tenant;
    }

    match args.command {
        Command::Validate { mappings } => run_validate(&config, &mappings),
        Command::Resolve { mappings, topic } => run_resolve(&config, &mappings, &topic),
        Command::Process {
            mappings,
            topic,
            payload,
            payload_file,
            identities,
        } => {
            let payload = match (payload, payload_file) {
                (Some(p), _) => p.into_bytes(),
                (None, Some(path)) => std::fs::read(&path)
                    .with_context(|| format!("Failed to read payload {}", path.display()))?,
                (None, None) => bail!("Either --payload or --payload-file is required"),
            };
            run_process(config, &mappings, &topic, &payload, identities.as_deref()).await
        }
        Command::Tree { mappings } => run_tree(&config, &mappings),
    }
}

fn init_logging(verbose: bool) {
    let json_logging = env_vars::parsed::<bool>(env_vars::LOG_JSON).unwrap_or(false);
    let default_level = if verbose { "dynmap=debug" } else { "dynmap=info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    // Logs go to stderr, stdout carries command output.
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
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .with_writer(std::io::stderr)
            .init();
    }
}

fn load_registry(config: &GatewayConfig, mappings: &Path) -> Result<MappingRegistry> {
    let registry = MappingRegistry::new();
    let report = registry
        .load_from_file(&config.tenant, mappings)
        .with_context(|| format!("Failed to load mappings from {}", mappings.display()))?;
    for (id, error) in &report.rejected {
        eprintln!("Skipped mapping {}: {}", id, error);
    }
    Ok(registry)
}

fn run_validate(config: &GatewayConfig, mappings: &Path) -> Result<()> {
    let registry = MappingRegistry::new();
    let report = registry
        .load_from_file(&config.tenant, mappings)
        .with_context(|| format!("Failed to load mappings from {}", mappings.display()))?;

    for id in &report.loaded {
        println!("{}: OK", id);
    }
    for (id, error) in &report.rejected {
        println!("{}: FAILED", id);
        println!("  {}", error);
    }
    println!();
    println!(
        "{} valid, {} invalid",
        report.loaded.len(),
        report.rejected.len()
    );

    if !report.is_complete() {
        bail!("Mapping validation failed");
    }
    Ok(())
}

fn run_resolve(config: &GatewayConfig, mappings: &Path, topic: &str) -> Result<()> {
    let registry = load_registry(config, mappings)?;
    let resolved = registry.resolve(&config.tenant, topic);
    if resolved.is_empty() {
        println!("No mapping for topic {}", topic);
        return Ok(());
    }
    for mapping in resolved {
        println!("{}\t{}\t{}", mapping.id, mapping.mapping_topic, mapping.name);
    }
    Ok(())
}

async fn run_process(
    config: GatewayConfig,
    mappings: &Path,
    topic: &str,
    payload: &[u8],
    identities: Option<&Path>,
) -> Result<()> {
    let registry = load_registry(&config, mappings)?;
    let identity: Arc<dyn DeviceIdentityResolver> = match identities {
        Some(path) => Arc::new(InMemoryIdentityResolver::load(path)?),
        None => Arc::new(InMemoryIdentityResolver::new()),
    };

    let tree = registry.tree(&config.tenant, Direction::Inbound);
    let processor = InboundProcessor::new(config, identity);
    let outcomes = processor.process(&tree, topic, payload).await;

    let report: Vec<Value> = outcomes.iter().map(|o| o.to_json()).collect();
    println!("{}", serde_json::to_string_pretty(&report)?);

    let failed = outcomes.iter().filter(|o| !o.is_ok()).count();
    if failed > 0 {
        bail!("{} of {} mappings failed", failed, outcomes.len());
    }
    Ok(())
}

fn run_tree(config: &GatewayConfig, mappings: &Path) -> Result<()> {
    let registry = load_registry(config, mappings)?;
    let tree = registry.tree(&config.tenant, Direction::Inbound);
    println!("Tenant: {} ({} mappings)", tree.tenant(), tree.mapping_count());
    for line in tree.dump() {
        println!("  {}", line);
    }
    Ok(())
}
