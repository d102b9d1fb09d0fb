//! Client capability statements
//!
//! One statement accompanies each delivery request: an ordered accept list
//! of media-type patterns (optionally weighted) plus sizing/network hints.

use serde::{Deserialize, Serialize};

use crate::media::{MediaType, MediaTypePattern};

/// One entry in the accept list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptPattern {
    pub pattern: MediaTypePattern,
    /// Optional preference weight. When any entry in an accept list carries
    /// a weight, ranking uses weights; otherwise list position wins.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
}

impl AcceptPattern {
    pub fn new(pattern: MediaTypePattern) -> Self {
        Self { pattern, weight: None }
    }

    pub fn weighted(pattern: MediaTypePattern, weight: f64) -> Self {
        Self { pattern, weight: Some(weight) }
    }
}

/// Coarse network class reported by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkClass {
    Slow,
    Typical,
    Fast,
}

/// Optional sizing and network hints
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hints {
    /// Target display width in CSS pixels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_width: Option<u32>,
    /// Device pixel density (dots per inch)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pixel_density: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkClass>,
}

/// A client's declared accepted media types and hints. Transient, one per
/// delivery request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityStatement {
    pub accept: Vec<AcceptPattern>,
    #[serde(default)]
    pub hints: Hints,
}

impl CapabilityStatement {
    pub fn new(accept: Vec<AcceptPattern>) -> Self {
        Self { accept, hints: Hints::default() }
    }

    /// Build a statement from plain pattern strings, unweighted
    pub fn from_accept(
        patterns: &[&str],
    ) -> Result<Self, crate::media::MediaTypeParseError> {
        let accept = patterns
            .iter()
            .map(|p| MediaTypePattern::parse(p).map(AcceptPattern::new))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(accept))
    }

    pub fn with_hints(mut self, hints: Hints) -> Self {
        self.hints = hints;
        self
    }

    /// Whether any accept entry carries an explicit weight
    pub fn is_weighted(&self) -> bool {
        self.accept.iter().any(|a| a.weight.is_some())
    }

    /// Index of the first accept pattern matching the media type, if any
    pub fn accept_position(&self, media: &MediaType) -> Option<usize> {
        self.accept.iter().position(|a| a.pattern.matches(media))
    }

    /// Best (highest) weight across accept patterns matching the media type
    pub fn accept_weight(&self, media: &MediaType) -> Option<f64> {
        self.accept
            .iter()
            .filter(|a| a.pattern.matches(media))
            .map(|a| a.weight.unwrap_or(1.0))
            .fold(None, |best, w| match best {
                Some(b) if b >= w => Some(b),
                _ => Some(w),
            })
    }
}
