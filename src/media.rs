//! Media types and media-type patterns
//!
//! A representation is identified by a base `type/subtype` plus an ordered
//! parameter set. Only a fixed set of parameter names is significant to
//! matching; patterns may wildcard the type and/or subtype and leave any
//! parameter unspecified.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// Parameter names significant to matching. A pattern carrying any other
/// parameter name fails composition-time validation.
pub const SIGNIFICANT_PARAMS: &[&str] = &["profile", "role", "dpi", "page", "width"];

fn token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9!#$&^_.+-]*$").expect("valid regex"))
}

fn is_token(s: &str) -> bool {
    token_re().is_match(s)
}

/// A concrete media type: `type/subtype` plus parameters.
///
/// Parameters are kept in a `BTreeMap` so the canonical string form (and
/// therefore every hash derived from it) is order-independent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MediaType {
    ty: String,
    subtype: String,
    params: BTreeMap<String, String>,
}

impl MediaType {
    /// Parse from a string like `image/png; dpi=96`
    pub fn parse(input: &str) -> Result<Self, MediaTypeParseError> {
        let (ty, subtype, params) = parse_parts(input)?;
        if ty == "*" || subtype == "*" {
            return Err(MediaTypeParseError::WildcardInConcreteType(input.to_string()));
        }
        Ok(Self { ty, subtype, params })
    }

    /// Base `type/subtype` without parameters
    pub fn essence(&self) -> String {
        format!("{}/{}", self.ty, self.subtype)
    }

    /// Get a parameter value
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(|s| s.as_str())
    }

    /// Get a parameter parsed as a number (for `dpi`, `width`, `page`)
    pub fn numeric_param(&self, name: &str) -> Option<u32> {
        self.param(name).and_then(|v| v.parse().ok())
    }

    /// Canonical string form: lowercase essence, parameters sorted by name
    pub fn canonical(&self) -> String {
        self.to_string()
    }

    /// Encode for use as a single path segment in variant paths.
    ///
    /// `image/png; dpi=96` becomes `image__png;dpi=96`. The encoding is
    /// reversible via [`MediaType::decode_path_segment`].
    pub fn encode_path_segment(&self) -> String {
        let mut out = format!("{}__{}", self.ty, self.subtype);
        for (k, v) in &self.params {
            out.push(';');
            out.push_str(k);
            out.push('=');
            out.push_str(v);
        }
        out
    }

    /// Decode a path segment produced by [`MediaType::encode_path_segment`]
    pub fn decode_path_segment(segment: &str) -> Result<Self, MediaTypeParseError> {
        let mut pieces = segment.split(';');
        let essence = pieces
            .next()
            .ok_or_else(|| MediaTypeParseError::Syntax(segment.to_string()))?;
        let essence = essence.replacen("__", "/", 1);
        let mut rebuilt = essence;
        for p in pieces {
            rebuilt.push_str("; ");
            rebuilt.push_str(p);
        }
        Self::parse(&rebuilt)
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ty, self.subtype)?;
        for (k, v) in &self.params {
            write!(f, "; {}={}", k, v)?;
        }
        Ok(())
    }
}

impl FromStr for MediaType {
    type Err = MediaTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for MediaType {
    type Error = MediaTypeParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<MediaType> for String {
    fn from(m: MediaType) -> String {
        m.to_string()
    }
}

/// A media-type pattern: `*` allowed for type and/or subtype, parameters
/// optional. An unspecified parameter is a wildcard on either side.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MediaTypePattern {
    ty: String,
    subtype: String,
    params: BTreeMap<String, String>,
}

impl MediaTypePattern {
    /// Parse from a string like `image/*` or `text/html; profile=embed`
    pub fn parse(input: &str) -> Result<Self, MediaTypeParseError> {
        let (ty, subtype, params) = parse_parts(input)?;
        if ty == "*" && subtype != "*" {
            return Err(MediaTypeParseError::Syntax(input.to_string()));
        }
        Ok(Self { ty, subtype, params })
    }

    /// Check the pattern against a concrete media type.
    ///
    /// The base type/subtype must be equal (or wildcarded), and every
    /// parameter the pattern specifies must be absent or equal on the
    /// concrete type.
    pub fn matches(&self, media: &MediaType) -> bool {
        if self.ty != "*" && self.ty != media.ty {
            return false;
        }
        if self.subtype != "*" && self.subtype != media.subtype {
            return false;
        }
        self.params.iter().all(|(k, v)| match media.params.get(k) {
            None => true,
            Some(actual) => actual == v,
        })
    }

    /// Whether this pattern names a concrete type (no wildcards).
    pub fn is_concrete(&self) -> bool {
        self.ty != "*" && self.subtype != "*"
    }

    /// Project the pattern to a concrete media type, if possible.
    ///
    /// Transform rules use this to describe the output they produce: a rule
    /// with a wildcard output cannot name its product and is rejected at
    /// composition time.
    pub fn to_concrete(&self) -> Option<MediaType> {
        if !self.is_concrete() {
            return None;
        }
        Some(MediaType {
            ty: self.ty.clone(),
            subtype: self.subtype.clone(),
            params: self.params.clone(),
        })
    }

    /// Composition-time validation: every parameter name must be recognized.
    pub fn validate_params(&self) -> Result<(), MediaTypeParseError> {
        for name in self.params.keys() {
            if !SIGNIFICANT_PARAMS.contains(&name.as_str()) {
                return Err(MediaTypeParseError::UnknownParameter {
                    pattern: self.to_string(),
                    name: name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Canonical string form
    pub fn canonical(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for MediaTypePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ty, self.subtype)?;
        for (k, v) in &self.params {
            write!(f, "; {}={}", k, v)?;
        }
        Ok(())
    }
}

impl FromStr for MediaTypePattern {
    type Err = MediaTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for MediaTypePattern {
    type Error = MediaTypeParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<MediaTypePattern> for String {
    fn from(m: MediaTypePattern) -> String {
        m.to_string()
    }
}

/// Media type parsing failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MediaTypeParseError {
    #[error("invalid media type syntax: '{0}'")]
    Syntax(String),

    #[error("wildcard not allowed in concrete media type: '{0}'")]
    WildcardInConcreteType(String),

    #[error("unrecognized parameter '{name}' in '{pattern}'")]
    UnknownParameter { pattern: String, name: String },
}

fn parse_parts(
    input: &str,
) -> Result<(String, String, BTreeMap<String, String>), MediaTypeParseError> {
    let mut pieces = input.split(';');
    let essence = pieces
        .next()
        .ok_or_else(|| MediaTypeParseError::Syntax(input.to_string()))?
        .trim();

    let (ty, subtype) = essence
        .split_once('/')
        .ok_or_else(|| MediaTypeParseError::Syntax(input.to_string()))?;
    let ty = ty.trim().to_ascii_lowercase();
    let subtype = subtype.trim().to_ascii_lowercase();
    if (ty != "*" && !is_token(&ty)) || (subtype != "*" && !is_token(&subtype)) {
        return Err(MediaTypeParseError::Syntax(input.to_string()));
    }
    // "__" is reserved: it stands in for "/" in path-segment encoding, so a
    // token containing it would make decoding ambiguous.
    if ty.contains("__") || subtype.contains("__") {
        return Err(MediaTypeParseError::Syntax(input.to_string()));
    }

    let mut params = BTreeMap::new();
    for piece in pieces {
        let piece = piece.trim();
        if piece.is_empty() {
            return Err(MediaTypeParseError::Syntax(input.to_string()));
        }
        let (k, v) = piece
            .split_once('=')
            .ok_or_else(|| MediaTypeParseError::Syntax(input.to_string()))?;
        let k = k.trim().to_ascii_lowercase();
        let v = v.trim().to_string();
        if !is_token(&k) || v.is_empty() || !is_token(&v) {
            return Err(MediaTypeParseError::Syntax(input.to_string()));
        }
        params.insert(k, v);
    }

    Ok((ty, subtype, params))
}
