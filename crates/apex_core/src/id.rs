//! Identifiers for mediation entities.
//!
//! Source ids come from external configuration and are the only piece of a
//! source that carries state across calls. Request ids are UUIDs minted per
//! dispatch call for log correlation.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::sync::Arc;
use uuid::Uuid;

/// Winner id reported when no source produced the result.
pub const NO_WINNER: &str = "none";

/// Source identifier - names one demand source
///
/// Cheap to clone; the string is shared.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(Arc<str>);

impl SourceId {
    /// Create a source id from any string-like value
    #[must_use]
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    /// The placeholder id used when nothing won
    #[must_use]
    pub fn none() -> Self {
        Self::new(NO_WINNER)
    }

    /// Get as string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check whether this is the `none` placeholder
    #[must_use]
    pub fn is_none(&self) -> bool {
        &*self.0 == NO_WINNER
    }

    /// Check whether the id is blank
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SourceId {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

impl Borrow<str> for SourceId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for SourceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Request identifier - identifies a single dispatch call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Create a new random RequestId
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from UUID bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Get as UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "req_{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_source_id_display() {
        let id = SourceId::new("admob");
        assert_eq!(id.to_string(), "admob");
        assert_eq!(id.as_str(), "admob");
    }

    #[test]
    fn test_source_id_none() {
        assert!(SourceId::none().is_none());
        assert!(!SourceId::new("applovin").is_none());
        assert_eq!(SourceId::none().as_str(), NO_WINNER);
    }

    #[test]
    fn test_source_id_empty() {
        assert!(SourceId::new("   ").is_empty());
        assert!(!SourceId::new("unity").is_empty());
    }

    #[test]
    fn test_source_id_borrow_lookup() {
        let mut map = HashMap::new();
        map.insert(SourceId::new("vungle"), 1);
        assert_eq!(map.get("vungle"), Some(&1));
    }

    #[test]
    fn test_source_id_serde_transparent() {
        let id = SourceId::new("meta");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"meta\"");
        let back: SourceId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_request_id_unique() {
        let id1 = RequestId::new();
        let id2 = RequestId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_request_id_display() {
        let id = RequestId::from_bytes([0; 16]);
        assert!(id.to_string().starts_with("req_"));
    }
}
