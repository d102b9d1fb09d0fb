//! Representations: concrete renderable forms of a block's content
//!
//! A representation is immutable once created. Producing a new form of a
//! block's content always creates a new `Representation`, never edits an
//! existing one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checksum::ContentHash;
use crate::media::MediaType;

/// Where the payload lives. Explicit discriminator, exhaustive matching at
/// consumption sites.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum PayloadSource {
    /// Payload carried inline, base64-encoded
    Inline { data: String },
    /// Payload stored by a collaborator, addressed by locator
    External { locator: String },
}

impl PayloadSource {
    pub fn external(locator: impl Into<String>) -> Self {
        PayloadSource::External { locator: locator.into() }
    }

    /// The locator, when the payload is external
    pub fn locator(&self) -> Option<&str> {
        match self {
            PayloadSource::External { locator } => Some(locator),
            PayloadSource::Inline { .. } => None,
        }
    }
}

/// Tool identity recorded in provenance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ToolVersion {
    pub tool: String,
    pub version: semver::Version,
}

impl ToolVersion {
    pub fn new(tool: impl Into<String>, version: semver::Version) -> Self {
        Self { tool: tool.into(), version }
    }

    pub fn parse(tool: impl Into<String>, version: &str) -> Result<Self, semver::Error> {
        Ok(Self { tool: tool.into(), version: semver::Version::parse(version)? })
    }
}

impl std::fmt::Display for ToolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.tool, self.version)
    }
}

/// One concrete renderable form of a block's content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Representation {
    pub media_type: MediaType,
    pub payload: PayloadSource,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,

    /// Provenance. Mandatory on transform outputs; optional on authored
    /// source representations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<ContentHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_version: Option<ToolVersion>,
    pub created_at: DateTime<Utc>,
}

impl Representation {
    /// Create a minimal authored representation
    pub fn new(media_type: MediaType, payload: PayloadSource) -> Self {
        Self {
            media_type,
            payload,
            width: None,
            height: None,
            duration_ms: None,
            bytes: None,
            content_hash: None,
            generated_by: None,
            tool_version: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    pub fn with_content_hash(mut self, hash: ContentHash) -> Self {
        self.content_hash = Some(hash);
        self
    }

    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }

    /// Effective pixel width for fit ranking: the explicit field wins,
    /// falling back to the `width` media-type parameter.
    pub fn effective_width(&self) -> Option<u32> {
        self.width.or_else(|| self.media_type.numeric_param("width"))
    }

    /// Effective dpi for fit ranking, from the `dpi` media-type parameter
    pub fn effective_dpi(&self) -> Option<u32> {
        self.media_type.numeric_param("dpi")
    }

    /// Whether full provenance is present (hash, tool, timestamp)
    pub fn has_provenance(&self) -> bool {
        self.content_hash.is_some() && self.tool_version.is_some()
    }
}
