//! Offline Negotiation CLI
//!
//! Runs the variant resolver against a snapshot artifact and a JSON file
//! of available representations, printing the Resolution. Useful for
//! debugging registry rules without a running delivery service.

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use variant_registry::capability::{AcceptPattern, CapabilityStatement, Hints};
use variant_registry::media::MediaTypePattern;
use variant_registry::registry::{KindId, RegistrySnapshot};
use variant_registry::representation::Representation;
use variant_registry::resolver::{Resolution, VariantResolver};

#[derive(Parser)]
#[command(name = "variant-resolve")]
#[command(about = "Negotiate a representation against a snapshot artifact")]
struct Cli {
    /// Snapshot artifact path
    #[arg(short, long)]
    snapshot: PathBuf,

    /// Block kind id (vendor:kind)
    #[arg(short, long)]
    kind: String,

    /// JSON file holding an array of available representations
    #[arg(short, long)]
    representations: PathBuf,

    /// Accepted media-type patterns, most preferred first
    #[arg(short, long, value_delimiter = ',')]
    accept: Vec<String>,

    /// Target display width hint
    #[arg(long)]
    width: Option<u32>,

    /// Pixel density hint (dpi)
    #[arg(long)]
    density: Option<u32>,
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
    let content = std::fs::read_to_string(&cli.snapshot)?;
    let snapshot = RegistrySnapshot::from_artifact_json(&content)?;

    let kind = KindId::parse(&cli.kind)?;
    let entry = snapshot
        .entry(&kind)
        .ok_or_else(|| format!("kind '{}' not in {}", kind, snapshot.version_string()))?;

    let reps: Vec<Representation> =
        serde_json::from_str(&std::fs::read_to_string(&cli.representations)?)?;

    let accept = cli
        .accept
        .iter()
        .map(|p| MediaTypePattern::parse(p).map(AcceptPattern::new))
        .collect::<Result<Vec<_>, _>>()?;
    let capabilities = CapabilityStatement::new(accept).with_hints(Hints {
        target_width: cli.width,
        pixel_density: cli.density,
        network: None,
    });

    match VariantResolver::default().resolve(entry, &reps, &capabilities) {
        Resolution::Selected(rep) => {
            println!("✅ Selected");
            println!("{}", serde_json::to_string_pretty(&rep)?);
        }
        Resolution::NeedsTransform(request) => {
            println!("🔁 NeedsTransform");
            println!("{}", serde_json::to_string_pretty(&request)?);
        }
        Resolution::Unsatisfiable => {
            println!("❌ Unsatisfiable");
            std::process::exit(2);
        }
    }

    Ok(())
}
