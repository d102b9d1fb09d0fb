//! Transform requests, content-addressed keys, and job lifecycle

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::checksum::ContentHash;
use crate::error::RunnerError;
use crate::media::MediaType;
use crate::registry::KindId;
use crate::representation::Representation;

/// Identity of the tool executing an operation. Part of the transform key:
/// bumping the tool image produces new variants instead of serving stale
/// ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ToolImage {
    pub id: String,
    pub version: semver::Version,
}

impl ToolImage {
    pub fn new(id: impl Into<String>, version: semver::Version) -> Self {
        Self { id: id.into(), version }
    }

    pub fn parse(id: impl Into<String>, version: &str) -> Result<Self, semver::Error> {
        Ok(Self { id: id.into(), version: semver::Version::parse(version)? })
    }
}

impl fmt::Display for ToolImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.version)
    }
}

/// One source representation feeding a transform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub locator: String,
    pub content_hash: ContentHash,
}

/// A request to produce one target representation from source
/// representations. Carries execution policy (timeout, attempts) from the
/// kind's cache policy; policy is deliberately outside the transform key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformRequest {
    pub kind_id: KindId,
    pub sources: Vec<SourceRef>,
    pub operation: String,
    pub options: serde_json::Value,
    /// Concrete media type the transform produces
    pub output: MediaType,
    pub timeout_secs: u64,
    pub max_attempts: u32,
}

/// Deterministic content-addressed job identity.
///
/// Equal inputs always produce an equal key; equal keys are treated as the
/// same logical job. Derived from source hashes (sorted), operation,
/// canonicalized options, the output media type, and the tool image.
/// Request time and execution policy never participate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransformKey(ContentHash);

impl TransformKey {
    pub fn compute(request: &TransformRequest, tool: &ToolImage) -> Self {
        let mut source_hashes: Vec<String> = request
            .sources
            .iter()
            .map(|s| s.content_hash.to_string())
            .collect();
        source_hashes.sort();

        let material = serde_json::json!({
            "sources": source_hashes,
            "operation": request.operation,
            "options": request.options,
            "output": request.output.canonical(),
            "tool": tool.to_string(),
        });
        Self(ContentHash::from_json(&material))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for TransformKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of one transform job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
}

/// One unit of transform work, identified by its key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformJob {
    pub key: TransformKey,
    pub state: JobState,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    /// Present only when Succeeded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Representation>,
    /// Present only when Failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<RunnerError>,
}

impl TransformJob {
    pub fn queued(key: TransformKey) -> Self {
        Self {
            key,
            state: JobState::Queued,
            attempts: 0,
            created_at: Utc::now(),
            result: None,
            last_error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, JobState::Succeeded | JobState::Failed)
    }
}

// RunnerError carries no payload worth persisting beyond its message, so
// jobs serialize it through the Display form.
impl Serialize for RunnerError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RunnerError {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let msg = String::deserialize(deserializer)?;
        Ok(RunnerError::ToolFailure(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(options: serde_json::Value) -> TransformRequest {
        TransformRequest {
            kind_id: KindId::parse("core:markdown").unwrap(),
            sources: vec![SourceRef {
                locator: "/content/m1/blocks/b1/variants/text__markdown/abc".to_string(),
                content_hash: ContentHash::from("abc"),
            }],
            operation: "markdown-render".to_string(),
            options,
            output: MediaType::parse("text/html").unwrap(),
            timeout_secs: 30,
            max_attempts: 3,
        }
    }

    fn tool() -> ToolImage {
        ToolImage::parse("cmark-sidecar", "1.4.2").unwrap()
    }

    #[test]
    fn test_key_is_deterministic() {
        let r1 = request(serde_json::json!({"sanitize": true, "toc": false}));
        std::thread::sleep(std::time::Duration::from_millis(5));
        let r2 = request(serde_json::json!({"toc": false, "sanitize": true}));
        // different construction times and option order, same identity
        assert_eq!(TransformKey::compute(&r1, &tool()), TransformKey::compute(&r2, &tool()));
    }

    #[test]
    fn test_key_changes_with_inputs() {
        let base = request(serde_json::json!({}));
        let key = TransformKey::compute(&base, &tool());

        let mut other = base.clone();
        other.options = serde_json::json!({"toc": true});
        assert_ne!(key, TransformKey::compute(&other, &tool()));

        let mut other = base.clone();
        other.sources[0].content_hash = ContentHash::from("def");
        assert_ne!(key, TransformKey::compute(&other, &tool()));

        let bumped = ToolImage::parse("cmark-sidecar", "1.5.0").unwrap();
        assert_ne!(key, TransformKey::compute(&base, &bumped));
    }

    #[test]
    fn test_key_ignores_execution_policy() {
        let mut a = request(serde_json::json!({}));
        let mut b = request(serde_json::json!({}));
        a.timeout_secs = 5;
        b.timeout_secs = 500;
        a.max_attempts = 1;
        b.max_attempts = 10;
        assert_eq!(TransformKey::compute(&a, &tool()), TransformKey::compute(&b, &tool()));
    }

    #[test]
    fn test_key_ignores_source_order() {
        let mut a = request(serde_json::json!({}));
        a.sources.push(SourceRef {
            locator: "loc2".to_string(),
            content_hash: ContentHash::from("zzz"),
        });
        let mut b = a.clone();
        b.sources.reverse();
        assert_eq!(TransformKey::compute(&a, &tool()), TransformKey::compute(&b, &tool()));
    }
}
