//! Content-addressed variant paths
//!
//! Storage collaborators persist variants at
//! `/content/{manifestId}/blocks/{blockId}/variants/{encodedMediaType}/{contentHash}`.
//! The core does not own storage; it only constructs and parses this
//! scheme to label completed representations and identify sources.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::checksum::ContentHash;
use crate::media::MediaType;

/// Address of one persisted variant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantPath {
    pub manifest_id: String,
    pub block_id: String,
    pub media_type: MediaType,
    pub content_hash: ContentHash,
}

impl VariantPath {
    pub fn new(
        manifest_id: impl Into<String>,
        block_id: impl Into<String>,
        media_type: MediaType,
        content_hash: ContentHash,
    ) -> Self {
        Self {
            manifest_id: manifest_id.into(),
            block_id: block_id.into(),
            media_type,
            content_hash,
        }
    }
}

impl fmt::Display for VariantPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "/content/{}/blocks/{}/variants/{}/{}",
            self.manifest_id,
            self.block_id,
            self.media_type.encode_path_segment(),
            self.content_hash
        )
    }
}

/// Variant path parsing failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VariantPathError {
    #[error("not a variant path: '{0}'")]
    Shape(String),

    #[error("bad media type segment in '{path}': {source}")]
    Media {
        path: String,
        #[source]
        source: crate::media::MediaTypeParseError,
    },
}

impl FromStr for VariantPath {
    type Err = VariantPathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let segments: Vec<&str> = s.split('/').collect();
        // ["", "content", m, "blocks", b, "variants", enc, hash]
        let shape_err = || VariantPathError::Shape(s.to_string());
        if segments.len() != 8
            || !segments[0].is_empty()
            || segments[1] != "content"
            || segments[3] != "blocks"
            || segments[5] != "variants"
        {
            return Err(shape_err());
        }
        let (manifest_id, block_id, enc, hash) =
            (segments[2], segments[4], segments[6], segments[7]);
        if manifest_id.is_empty() || block_id.is_empty() || hash.is_empty() {
            return Err(shape_err());
        }
        let media_type = MediaType::decode_path_segment(enc).map_err(|source| {
            VariantPathError::Media { path: s.to_string(), source }
        })?;
        Ok(Self {
            manifest_id: manifest_id.to_string(),
            block_id: block_id.to_string(),
            media_type,
            content_hash: ContentHash::from(hash),
        })
    }
}
