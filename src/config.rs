//! Configuration for embedding the registry core
//!
//! Supports loading configuration from:
//! - Default values
//! - Config file (variant.toml)
//! - Environment variables (VARIANT_*)
//!
//! ## Example config file (variant.toml):
//! ```toml
//! [registry]
//! sources_dir = "./registry-sources"
//! compose_doc = "./registry-sources/compose.json"
//! artifact_out = "./snapshot.json"
//!
//! [transforms]
//! base_backoff_ms = 250
//! max_backoff_ms = 30000
//! max_output_bytes = 67108864
//!
//! [[runners]]
//! operation = "markdown-render"
//! tool_id = "cmark-sidecar"
//! tool_version = "1.4.2"
//! command = "/usr/local/bin/cmark-job"
//! ```

use config_crate::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Registry composition inputs and output
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Transform execution settings
    #[serde(default)]
    pub transforms: TransformConfig,

    /// Runner bindings: operation name → process to execute it
    #[serde(default)]
    pub runners: Vec<RunnerConfig>,
}

/// Registry composition configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Directory of per-entry JSON source documents
    #[serde(default = "default_sources_dir")]
    pub sources_dir: PathBuf,

    /// Path to the compose document
    #[serde(default = "default_compose_doc")]
    pub compose_doc: PathBuf,

    /// Where to write the snapshot artifact
    #[serde(default = "default_artifact_out")]
    pub artifact_out: PathBuf,
}

/// Transform execution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformConfig {
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Hard cap on runner output size
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: u64,
}

/// One runner binding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub operation: String,
    pub tool_id: String,
    pub tool_version: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

// Default value functions
fn default_sources_dir() -> PathBuf {
    PathBuf::from("./registry-sources")
}

fn default_compose_doc() -> PathBuf {
    PathBuf::from("./registry-sources/compose.json")
}

fn default_artifact_out() -> PathBuf {
    PathBuf::from("./snapshot.json")
}

fn default_base_backoff_ms() -> u64 {
    250
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_max_output_bytes() -> u64 {
    64 * 1024 * 1024
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            sources_dir: default_sources_dir(),
            compose_doc: default_compose_doc(),
            artifact_out: default_artifact_out(),
        }
    }
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            transforms: TransformConfig::default(),
            runners: Vec::new(),
        }
    }
}

impl DeliveryConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(None)
    }

    /// Load configuration from a specific file
    pub fn load_from(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        let config_locations = ["variant.toml", ".variant.toml", "config/variant.toml"];
        for location in config_locations {
            builder = builder.add_source(File::with_name(location).required(false));
        }

        // Load from XDG config directory
        if let Some(config_dir) = directories::ProjectDirs::from("dev", "familiar", "variant") {
            let xdg_config = config_dir.config_dir().join("variant.toml");
            if xdg_config.exists() {
                builder = builder.add_source(File::from(xdg_config).required(false));
            }
        }

        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        // Environment variables (VARIANT_*)
        builder = builder.add_source(
            Environment::with_prefix("VARIANT")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Save configuration to a file
    pub fn save(&self, path: &str) -> std::io::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Retry policy for the scheduler
    pub fn retry_policy(&self) -> crate::scheduler::RetryPolicy {
        crate::scheduler::RetryPolicy {
            base_backoff: std::time::Duration::from_millis(self.transforms.base_backoff_ms),
            max_backoff: std::time::Duration::from_millis(self.transforms.max_backoff_ms),
        }
    }

    /// Build the runner catalog from the configured bindings.
    ///
    /// Every configured runner is a native-process `CommandRunner`; sidecar
    /// and container deployments register their own `Runner` impls instead.
    pub fn runner_catalog(&self) -> Result<crate::runner::RunnerCatalog, semver::Error> {
        let mut catalog = crate::runner::RunnerCatalog::new();
        for r in &self.runners {
            let tool = crate::transform::ToolImage::parse(r.tool_id.clone(), &r.tool_version)?;
            let runner = crate::runner::CommandRunner::new(r.command.clone(), r.args.clone());
            catalog.register(r.operation.clone(), tool, std::sync::Arc::new(runner));
        }
        Ok(catalog)
    }
}
