//! Registry Composer
//!
//! Merges a base source with zero or more extension sources, applies an
//! explicit override pass, validates the result, and produces one immutable
//! `RegistrySnapshot`. Composition is all-or-nothing: any validation
//! failure discards the candidate and leaves the previously installed
//! snapshot in effect.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::checksum::ContentHash;
use crate::error::{CompositionError, SourceError};
use crate::registry::{
    CachePolicy, KindId, RegistryEntry, RegistrySnapshot, RegistrySource, RegistryStore,
    SnapshotSources,
};

/// The compose document: which sources to merge and how
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComposeDoc {
    pub base: String,
    #[serde(default)]
    pub extensions: Vec<String>,
    /// When present, only these kinds survive the prefilter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable: Option<Vec<KindId>>,
    /// Kinds dropped before merge
    #[serde(default)]
    pub disable: Vec<KindId>,
    /// Final pass: kind id → dotted field path → replacement value
    #[serde(default)]
    pub overrides: BTreeMap<KindId, BTreeMap<String, serde_json::Value>>,
}

impl ComposeDoc {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| SourceError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| SourceError::Json {
            path: path.display().to_string(),
            source,
        })
    }
}

/// Answers whether a schema reference is resolvable. The registry treats
/// schema refs as opaque identifiers; a storage collaborator owns the
/// actual documents.
pub trait SchemaResolver: Send + Sync {
    fn is_resolvable(&self, schema_ref: &str) -> bool;
}

/// Resolver backed by an explicit set of known refs
pub struct StaticSchemaRefs(pub BTreeSet<String>);

impl SchemaResolver for StaticSchemaRefs {
    fn is_resolvable(&self, schema_ref: &str) -> bool {
        self.0.contains(schema_ref)
    }
}

/// Resolver accepting any non-empty ref, for deployments where schema
/// documents are provisioned out of band
pub struct AnySchemaRef;

impl SchemaResolver for AnySchemaRef {
    fn is_resolvable(&self, schema_ref: &str) -> bool {
        !schema_ref.is_empty()
    }
}

/// The composer. Holds validation collaborators; `compose` itself is a
/// pure function of its inputs so identical inputs (including a fixed
/// version and timestamp) serialize byte-identically.
pub struct Composer {
    schema_resolver: Box<dyn SchemaResolver>,
    /// Operation names runners can execute, from the runner catalog
    known_operations: BTreeSet<String>,
}

impl Composer {
    pub fn new(schema_resolver: Box<dyn SchemaResolver>, known_operations: BTreeSet<String>) -> Self {
        Self { schema_resolver, known_operations }
    }

    /// Compose and install into a store. On failure the store keeps its
    /// previous snapshot.
    pub fn compose_into(
        &self,
        store: &RegistryStore,
        doc: &ComposeDoc,
        sources: &BTreeMap<String, RegistrySource>,
    ) -> Result<Arc<RegistrySnapshot>, CompositionError> {
        let version = store.allocate_version();
        let snapshot = self.compose(version, Utc::now(), doc, sources)?;
        info!(
            version = snapshot.version,
            kinds = snapshot.entries.len(),
            "installed registry snapshot"
        );
        Ok(store.install(snapshot))
    }

    /// Compose a candidate snapshot without touching any store
    pub fn compose(
        &self,
        version: u64,
        composed_at: DateTime<Utc>,
        doc: &ComposeDoc,
        sources: &BTreeMap<String, RegistrySource>,
    ) -> Result<RegistrySnapshot, CompositionError> {
        let base = sources
            .get(&doc.base)
            .ok_or_else(|| CompositionError::MissingSource(doc.base.clone()))?;

        // Prefilter, then merge base entries. A kind appearing twice in one
        // source is a duplicate even before extensions come into play.
        let mut entries: BTreeMap<KindId, RegistryEntry> = BTreeMap::new();
        let mut owners: BTreeMap<KindId, String> = BTreeMap::new();

        for entry in self.prefilter(doc, &base.entries) {
            if entries.contains_key(&entry.kind_id) {
                return Err(CompositionError::DuplicateKind(entry.kind_id.to_string()));
            }
            owners.insert(entry.kind_id.clone(), base.id.clone());
            entries.insert(entry.kind_id.clone(), entry);
        }

        for ext_id in &doc.extensions {
            let ext = sources
                .get(ext_id)
                .ok_or_else(|| CompositionError::MissingSource(ext_id.clone()))?;
            let mut seen_in_ext: BTreeSet<KindId> = BTreeSet::new();
            for entry in self.prefilter(doc, &ext.entries) {
                if !seen_in_ext.insert(entry.kind_id.clone()) {
                    return Err(CompositionError::DuplicateKind(entry.kind_id.to_string()));
                }
                match entries.get_mut(&entry.kind_id) {
                    None => {
                        debug!(kind = %entry.kind_id, source = %ext.id, "extension adds kind");
                        owners.insert(entry.kind_id.clone(), ext.id.clone());
                        entries.insert(entry.kind_id.clone(), entry);
                    }
                    Some(existing) => {
                        extend_entry(existing, &entry, &ext.id)?;
                    }
                }
            }
        }

        // Override pass: replace single fields by kind id + dotted path
        let mut overridden: Vec<String> = Vec::new();
        for (kind, fields) in &doc.overrides {
            let entry = entries
                .get_mut(kind)
                .ok_or_else(|| CompositionError::UnknownOverrideKind { kind: kind.to_string() })?;
            for (path, value) in fields {
                apply_override(entry, kind, path, value)?;
            }
            overridden.push(kind.to_string());
        }

        self.validate(&entries)?;

        let entries_value =
            serde_json::to_value(&entries).map_err(|e| CompositionError::InvalidOverridePath {
                kind: String::new(),
                path: String::new(),
                reason: e.to_string(),
            })?;
        let checksum = ContentHash::from_json(&entries_value);

        Ok(RegistrySnapshot {
            version,
            sources: SnapshotSources {
                base: base.id.clone(),
                extensions: doc.extensions.clone(),
                overridden,
            },
            composed_at,
            checksum,
            entries,
        })
    }

    fn prefilter<'a>(
        &self,
        doc: &'a ComposeDoc,
        entries: &'a [RegistryEntry],
    ) -> impl Iterator<Item = RegistryEntry> + 'a {
        entries
            .iter()
            .filter(move |e| match &doc.enable {
                Some(enable) => enable.contains(&e.kind_id),
                None => true,
            })
            .filter(move |e| !doc.disable.contains(&e.kind_id))
            .cloned()
    }

    fn validate(&self, entries: &BTreeMap<KindId, RegistryEntry>) -> Result<(), CompositionError> {
        for entry in entries.values() {
            if !self.schema_resolver.is_resolvable(&entry.schema_ref) {
                return Err(CompositionError::UnresolvedSchema(format!(
                    "{} -> {}",
                    entry.kind_id, entry.schema_ref
                )));
            }

            let patterns = entry
                .allowed_representations
                .iter()
                .chain(entry.fallback_policy.iter())
                .chain(entry.transform_rules.iter().map(|r| &r.input))
                .chain(entry.transform_rules.iter().map(|r| &r.output));
            for p in patterns {
                p.validate_params()
                    .map_err(|e| CompositionError::InvalidMediaType(e.to_string()))?;
            }

            for rule in &entry.transform_rules {
                if !rule.output.is_concrete() {
                    return Err(CompositionError::InvalidMediaType(format!(
                        "{}: transform output '{}' must name a concrete type",
                        entry.kind_id, rule.output
                    )));
                }
                if !self.known_operations.contains(&rule.operation) {
                    return Err(CompositionError::UnresolvedTransform(format!(
                        "{} -> {}",
                        entry.kind_id, rule.operation
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Merge an extension's entry into an existing one it does not own: it may
/// extend the representation and rule lists, nothing else.
fn extend_entry(
    existing: &mut RegistryEntry,
    extension: &RegistryEntry,
    source_id: &str,
) -> Result<(), CompositionError> {
    let not_owner = |field: &str| CompositionError::NotOwner {
        source_id: source_id.to_string(),
        kind: existing.kind_id.to_string(),
        field: field.to_string(),
    };

    if !extension.schema_ref.is_empty() && extension.schema_ref != existing.schema_ref {
        return Err(not_owner("schema_ref"));
    }
    if extension.sanitization_policy_ref.is_some()
        && extension.sanitization_policy_ref != existing.sanitization_policy_ref
    {
        return Err(not_owner("sanitization_policy_ref"));
    }
    if !extension.fallback_policy.is_empty()
        && extension.fallback_policy != existing.fallback_policy
    {
        return Err(not_owner("fallback_policy"));
    }
    if extension.cache_policy != CachePolicy::default()
        && extension.cache_policy != existing.cache_policy
    {
        return Err(not_owner("cache_policy"));
    }

    for pattern in &extension.allowed_representations {
        if !existing.allowed_representations.contains(pattern) {
            existing.allowed_representations.push(pattern.clone());
        }
    }
    for rule in &extension.transform_rules {
        if !existing.transform_rules.contains(rule) {
            existing.transform_rules.push(rule.clone());
        }
    }
    Ok(())
}

/// Replace one field of an entry, addressed by dotted path. The entry is
/// edited through its JSON form so any serializable field is reachable,
/// then deserialized back, which re-runs all field-level parsing.
fn apply_override(
    entry: &mut RegistryEntry,
    kind: &KindId,
    path: &str,
    value: &serde_json::Value,
) -> Result<(), CompositionError> {
    let invalid = |reason: &str| CompositionError::InvalidOverridePath {
        kind: kind.to_string(),
        path: path.to_string(),
        reason: reason.to_string(),
    };

    let mut root = serde_json::to_value(&*entry).map_err(|e| invalid(&e.to_string()))?;

    let segments: Vec<&str> = path.split('.').collect();
    if segments.is_empty() || segments.iter().any(|s| s.is_empty()) {
        return Err(invalid("empty path segment"));
    }
    if segments[0] == "kind_id" {
        return Err(invalid("kind_id cannot be overridden"));
    }

    let mut cursor = &mut root;
    for segment in &segments[..segments.len() - 1] {
        cursor = match cursor {
            serde_json::Value::Object(map) => map
                .get_mut(*segment)
                .ok_or_else(|| invalid(&format!("no field '{}'", segment)))?,
            serde_json::Value::Array(items) => {
                let idx: usize = segment
                    .parse()
                    .map_err(|_| invalid(&format!("'{}' is not an index", segment)))?;
                items
                    .get_mut(idx)
                    .ok_or_else(|| invalid(&format!("index {} out of bounds", idx)))?
            }
            _ => return Err(invalid(&format!("'{}' is not addressable", segment))),
        };
    }

    let last = segments[segments.len() - 1];
    match cursor {
        serde_json::Value::Object(map) => {
            if !map.contains_key(last) {
                return Err(invalid(&format!("no field '{}'", last)));
            }
            map.insert(last.to_string(), value.clone());
        }
        serde_json::Value::Array(items) => {
            let idx: usize = last
                .parse()
                .map_err(|_| invalid(&format!("'{}' is not an index", last)))?;
            if idx >= items.len() {
                return Err(invalid(&format!("index {} out of bounds", idx)));
            }
            items[idx] = value.clone();
        }
        _ => return Err(invalid(&format!("'{}' is not addressable", last))),
    }

    *entry = serde_json::from_value(root).map_err(|e| invalid(&e.to_string()))?;
    Ok(())
}

/// Load one registry source document
pub fn load_source_file(path: impl AsRef<Path>) -> Result<RegistrySource, SourceError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| SourceError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| SourceError::Json {
        path: path.display().to_string(),
        source,
    })
}

/// Collect all `*.json` source documents under a directory, keyed by id
pub fn load_sources_dir(
    dir: impl AsRef<Path>,
) -> Result<BTreeMap<String, RegistrySource>, SourceError> {
    let mut sources = BTreeMap::new();
    for entry in WalkDir::new(dir.as_ref()).into_iter().filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        // The compose document lives alongside the sources; it is not one.
        if path.file_name().and_then(|n| n.to_str()) == Some("compose.json") {
            continue;
        }
        let source = load_source_file(path)?;
        debug!(id = %source.id, path = %path.display(), "loaded registry source");
        sources.insert(source.id.clone(), source);
    }
    Ok(sources)
}
