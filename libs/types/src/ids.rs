//! Unique identifier types for stream entities
//!
//! Generated IDs use UUID v7 so they sort by creation time, which keeps
//! registry snapshots and batch ledgers in connection/creation order.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a subscriber session
///
/// Uses UUID v7, so a registry snapshot sorted by `SessionId` lists sessions
/// in connection order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Create a new SessionId with current timestamp
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Create from existing UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get inner UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a single tick-derived bar delta
///
/// Stable for the lifetime of the delta, so a re-delivered delta can be
/// recognised and skipped by the persistence sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeltaId(Uuid);

impl DeltaId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for DeltaId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeltaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a merged persistence batch
///
/// Assigned once when the batch is built and kept across retries; the store
/// uses it as the idempotency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(Uuid);

impl BatchId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Instrument symbol (e.g. "AAPL", "005930")
///
/// Stored trimmed and upper-cased so filters match regardless of how the
/// client typed the symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Symbol(String);

impl Symbol {
    /// Create a new Symbol
    ///
    /// # Panics
    /// Panics if the symbol is empty after trimming
    pub fn new(symbol: impl AsRef<str>) -> Self {
        Self::try_new(symbol).expect("Symbol must not be empty")
    }

    /// Try to create a Symbol, returning None if empty
    pub fn try_new(symbol: impl AsRef<str>) -> Option<Self> {
        let s = symbol.as_ref().trim();
        if s.is_empty() {
            None
        } else {
            Some(Self(s.to_uppercase()))
        }
    }

    /// Get the symbol string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for Symbol {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_new(&value).ok_or_else(|| "symbol must not be empty".to_string())
    }
}

impl From<Symbol> for String {
    fn from(symbol: Symbol) -> Self {
        symbol.0
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_creation() {
        let id1 = SessionId::new();
        let id2 = SessionId::new();
        assert_ne!(id1, id2, "SessionIds should be unique");
    }

    #[test]
    fn test_session_ids_sort_by_creation() {
        let first = SessionId::new();
        let second = SessionId::new();
        assert!(first < second);
    }

    #[test]
    fn test_delta_id_serialization() {
        let id = DeltaId::new();
        let json = serde_json::to_string(&id).unwrap();
        let deserialized: DeltaId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, deserialized);
    }

    #[test]
    fn test_symbol_normalization() {
        let symbol = Symbol::new("  aapl ");
        assert_eq!(symbol.as_str(), "AAPL");
        assert_eq!(symbol, Symbol::from("AAPL"));
    }

    #[test]
    fn test_symbol_try_new() {
        assert!(Symbol::try_new("MSFT").is_some());
        assert!(Symbol::try_new("   ").is_none());
    }

    #[test]
    #[should_panic(expected = "Symbol must not be empty")]
    fn test_symbol_empty_panics() {
        Symbol::new("");
    }

    #[test]
    fn test_symbol_serialization() {
        let symbol = Symbol::new("TSLA");
        let json = serde_json::to_string(&symbol).unwrap();
        assert_eq!(json, "\"TSLA\"");
    }

    #[test]
    fn test_symbol_deserialization_normalizes_and_rejects_empty() {
        let symbol: Symbol = serde_json::from_str("\" msft\"").unwrap();
        assert_eq!(symbol.as_str(), "MSFT");
        assert!(serde_json::from_str::<Symbol>("\"  \"").is_err());
    }
}
