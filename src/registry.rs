//! Registry entries, snapshots, and the atomically swapped store
//!
//! A snapshot is immutable once composed. The resolver and scheduler hold
//! read-only `Arc` references; recomposition installs a complete new
//! snapshot in one atomic pointer swap, and an old snapshot drops when the
//! last in-flight resolution releases it.

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::checksum::ContentHash;
use crate::media::MediaTypePattern;

/// Namespaced block kind identifier, `vendor:kind`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KindId {
    vendor: String,
    kind: String,
}

impl KindId {
    pub fn parse(input: &str) -> Result<Self, KindIdParseError> {
        let (vendor, kind) = input
            .split_once(':')
            .ok_or_else(|| KindIdParseError(input.to_string()))?;
        let valid = |s: &str| {
            !s.is_empty()
                && s.chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        };
        if !valid(vendor) || !valid(kind) {
            return Err(KindIdParseError(input.to_string()));
        }
        Ok(Self { vendor: vendor.to_string(), kind: kind.to_string() })
    }

    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }
}

impl fmt::Display for KindId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.vendor, self.kind)
    }
}

impl FromStr for KindId {
    type Err = KindIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for KindId {
    type Error = KindIdParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<KindId> for String {
    fn from(k: KindId) -> String {
        k.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid kind id: '{0}' (expected vendor:kind)")]
pub struct KindIdParseError(String);

/// One transform rule: how to produce the output pattern from an input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformRule {
    pub input: MediaTypePattern,
    pub output: MediaTypePattern,
    /// Operation name resolved against runner capabilities at compose time
    pub operation: String,
    /// Default options merged into the transform request
    #[serde(default)]
    pub default_options: serde_json::Value,
}

/// Events that invalidate cached variants for a kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationTrigger {
    PayloadHashChange,
    ToolVersionBump,
}

/// Per-kind caching and transform-execution policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachePolicy {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_invalidation")]
    pub invalidate_on: Vec<InvalidationTrigger>,
    /// Wall-time bound for one transform attempt
    #[serde(default = "default_timeout_secs")]
    pub transform_timeout_secs: u64,
    /// Attempt limit before a transform terminalizes as Failed
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_ttl_secs() -> u64 {
    86_400
}

fn default_invalidation() -> Vec<InvalidationTrigger> {
    vec![
        InvalidationTrigger::PayloadHashChange,
        InvalidationTrigger::ToolVersionBump,
    ]
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            invalidate_on: default_invalidation(),
            transform_timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
        }
    }
}

/// One registry entry per block kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub kind_id: KindId,
    pub schema_ref: String,
    /// Ordered media-type patterns this kind may serve
    pub allowed_representations: Vec<MediaTypePattern>,
    #[serde(default)]
    pub transform_rules: Vec<TransformRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sanitization_policy_ref: Option<String>,
    /// Ordered preference list consulted when negotiation fails outright
    #[serde(default)]
    pub fallback_policy: Vec<MediaTypePattern>,
    #[serde(default)]
    pub cache_policy: CachePolicy,
}

/// One registry source document: a named package of entries.
/// The package that first defines a kind id owns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrySource {
    pub id: String,
    pub entries: Vec<RegistryEntry>,
}

/// Provenance of a composed snapshot: which sources went in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSources {
    pub base: String,
    pub extensions: Vec<String>,
    /// Kind ids touched by the override pass
    pub overridden: Vec<String>,
}

/// Immutable composed registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    /// Monotonic version, allocated by the store on install
    pub version: u64,
    pub sources: SnapshotSources,
    pub composed_at: DateTime<Utc>,
    /// Hash over the canonical entry set, for byte-identity checks
    pub checksum: ContentHash,
    /// Entries keyed by kind id; BTreeMap keeps serialization canonical
    pub entries: BTreeMap<KindId, RegistryEntry>,
}

impl RegistrySnapshot {
    pub fn entry(&self, kind: &KindId) -> Option<&RegistryEntry> {
        self.entries.get(kind)
    }

    pub fn kind_ids(&self) -> impl Iterator<Item = &KindId> {
        self.entries.keys()
    }

    /// Recorded version string, e.g. `registry-v7`
    pub fn version_string(&self) -> String {
        format!("registry-v{}", self.version)
    }

    /// Serialize the snapshot artifact. Deterministic for fixed contents:
    /// entries live in a BTreeMap and all nested maps are key-sorted.
    pub fn to_artifact_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_artifact_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

/// Holder of the current snapshot. Readers get a cheap `Arc` clone; the
/// composer installs replacements atomically.
pub struct RegistryStore {
    current: ArcSwapOption<RegistrySnapshot>,
    next_version: AtomicU64,
}

impl RegistryStore {
    pub fn new() -> Self {
        Self {
            current: ArcSwapOption::const_empty(),
            next_version: AtomicU64::new(1),
        }
    }

    /// The currently installed snapshot, if any
    pub fn current(&self) -> Option<Arc<RegistrySnapshot>> {
        self.current.load_full()
    }

    /// Allocate the version a candidate snapshot would receive
    pub(crate) fn allocate_version(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::SeqCst)
    }

    /// Install a validated snapshot, replacing the previous one atomically
    pub(crate) fn install(&self, snapshot: RegistrySnapshot) -> Arc<RegistrySnapshot> {
        let arc = Arc::new(snapshot);
        self.current.store(Some(arc.clone()));
        arc
    }
}

impl Default for RegistryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_id_parse() {
        let k = KindId::parse("core:markdown").unwrap();
        assert_eq!(k.vendor(), "core");
        assert_eq!(k.kind(), "markdown");
        assert_eq!(k.to_string(), "core:markdown");
    }

    #[test]
    fn test_kind_id_rejects_malformed() {
        assert!(KindId::parse("markdown").is_err());
        assert!(KindId::parse(":markdown").is_err());
        assert!(KindId::parse("core:").is_err());
        assert!(KindId::parse("Core:Markdown").is_err());
    }

    #[test]
    fn test_store_starts_empty() {
        let store = RegistryStore::new();
        assert!(store.current().is_none());
    }
}
