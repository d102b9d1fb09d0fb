//! Registry Composition CLI
//!
//! Composes per-entry registry source documents into a versioned snapshot
//! artifact, or validates them without writing anything.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use variant_registry::compose::{load_sources_dir, AnySchemaRef, ComposeDoc, Composer};
use variant_registry::config::DeliveryConfig;
use variant_registry::registry::{RegistrySnapshot, RegistryStore};

#[derive(Parser)]
#[command(name = "variant-compose")]
#[command(about = "Compose registry sources into a snapshot artifact")]
struct Cli {
    /// Path to a config file (variant.toml)
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compose sources and write the snapshot artifact
    Compose {
        /// Directory of per-entry JSON source documents
        #[arg(short, long)]
        sources: Option<PathBuf>,
        /// Compose document path
        #[arg(short, long)]
        doc: Option<PathBuf>,
        /// Output artifact path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Validate sources and the compose document without writing
    Validate {
        #[arg(short, long)]
        sources: Option<PathBuf>,
        #[arg(short, long)]
        doc: Option<PathBuf>,
    },

    /// Show a snapshot artifact's version, sources, and kinds
    Show {
        /// Snapshot artifact path
        artifact: PathBuf,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = DeliveryConfig::load_from(cli.config.as_deref())?;

    match cli.command {
        Commands::Compose { sources, doc, output } => {
            let sources_dir = sources.unwrap_or_else(|| config.registry.sources_dir.clone());
            let doc_path = doc.unwrap_or_else(|| config.registry.compose_doc.clone());
            let out_path = output.unwrap_or_else(|| config.registry.artifact_out.clone());

            let snapshot = compose(&config, &sources_dir, &doc_path)?;
            std::fs::write(&out_path, snapshot.to_artifact_json()?)?;

            println!("✅ composed {} ({} kinds)", snapshot.version_string(), snapshot.entries.len());
            println!("   checksum: {}", snapshot.checksum);
            println!("   artifact: {}", out_path.display());
        }

        Commands::Validate { sources, doc } => {
            let sources_dir = sources.unwrap_or_else(|| config.registry.sources_dir.clone());
            let doc_path = doc.unwrap_or_else(|| config.registry.compose_doc.clone());

            match compose(&config, &sources_dir, &doc_path) {
                Ok(snapshot) => {
                    println!("✅ valid - {} kinds would compose", snapshot.entries.len());
                    for kind in snapshot.kind_ids() {
                        println!("   {}", kind);
                    }
                }
                Err(e) => {
                    println!("❌ invalid: {}", e);
                    std::process::exit(1);
                }
            }
        }

        Commands::Show { artifact } => {
            let content = std::fs::read_to_string(&artifact)?;
            let snapshot = RegistrySnapshot::from_artifact_json(&content)?;
            println!("{}", snapshot.version_string());
            println!("  composed at: {}", snapshot.composed_at);
            println!("  checksum:    {}", snapshot.checksum);
            println!("  base:        {}", snapshot.sources.base);
            for ext in &snapshot.sources.extensions {
                println!("  extension:   {}", ext);
            }
            for kind in &snapshot.sources.overridden {
                println!("  overridden:  {}", kind);
            }
            println!("  kinds ({}):", snapshot.entries.len());
            for (kind, entry) in &snapshot.entries {
                println!("    {} ({} representations, {} rules)",
                    kind,
                    entry.allowed_representations.len(),
                    entry.transform_rules.len(),
                );
            }
        }
    }

    Ok(())
}

fn compose(
    config: &DeliveryConfig,
    sources_dir: &PathBuf,
    doc_path: &PathBuf,
) -> Result<std::sync::Arc<RegistrySnapshot>, Box<dyn std::error::Error>> {
    let sources = load_sources_dir(sources_dir)?;
    let doc = ComposeDoc::load(doc_path)?;
    let catalog = config.runner_catalog()?;

    let composer = Composer::new(Box::new(AnySchemaRef), catalog.operation_names());
    let store = RegistryStore::new();
    let snapshot = composer.compose_into(&store, &doc, &sources)?;
    Ok(snapshot)
}
