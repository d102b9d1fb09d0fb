//! Content hashes for representations and transform identity

use sha2::{Digest, Sha256};
use serde::{Deserialize, Serialize};
use std::fmt;

/// SHA256 content hash, hex-encoded
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentHash(String);

impl ContentHash {
    /// Compute a hash from raw bytes
    pub fn from_bytes(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        Self(format!("{:x}", hash))
    }

    /// Compute a hash from a string
    pub fn from_text(content: &str) -> Self {
        Self::from_bytes(content.as_bytes())
    }

    /// Compute a hash from a JSON value in canonical form.
    ///
    /// serde_json maps are key-sorted by default, so serializing a `Value`
    /// yields a canonical byte sequence as long as the `preserve_order`
    /// feature stays off.
    pub fn from_json(value: &serde_json::Value) -> Self {
        let canonical = serde_json::to_string(value).unwrap_or_default();
        Self::from_text(&canonical)
    }

    /// Get the hex string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Verify that bytes match this hash
    pub fn verify(&self, data: &[u8]) -> bool {
        let computed = Self::from_bytes(data);
        self.0 == computed.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ContentHash {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ContentHash {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hash_deterministic() {
        let h1 = ContentHash::from_bytes(b"payload");
        let h2 = ContentHash::from_bytes(b"payload");
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_hash_differs_on_content() {
        assert_ne!(
            ContentHash::from_text("one"),
            ContentHash::from_text("two")
        );
    }

    #[test]
    fn test_json_hash_ignores_key_order() {
        let a = json!({"z": 1, "a": 2});
        let b = json!({"a": 2, "z": 1});
        assert_eq!(ContentHash::from_json(&a), ContentHash::from_json(&b));
    }

    #[test]
    fn test_verify() {
        let h = ContentHash::from_bytes(b"data");
        assert!(h.verify(b"data"));
        assert!(!h.verify(b"other"));
    }
}
