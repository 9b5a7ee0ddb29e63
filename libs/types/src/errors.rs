//! Error types for the market event stream
//!
//! Comprehensive error taxonomy using thiserror. Only `ConfigError` is ever
//! fatal, and only at startup; every other error is absorbed by the component
//! that sees it and turned into a counter plus a log line.

use thiserror::Error;

/// Invalid numeric value
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValueError {
    #[error("Price must be positive: {0}")]
    NonPositivePrice(String),

    #[error("Volume must not be negative: {0}")]
    NegativeVolume(String),

    #[error("Not a decimal number: {0}")]
    Unparseable(String),

    #[error("Volume exceeds the accepted maximum: {0}")]
    VolumeTooLarge(String),

    #[error("Volume sum overflowed: {0} + {1}")]
    VolumeOverflow(String, String),
}

/// Failure to deliver a batch to a subscriber session
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Session transport closed")]
    Closed,

    #[error("Session outbound queue full")]
    Backpressure,

    #[error("Write exceeded deadline of {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Failed to encode batch: {0}")]
    Encode(String),
}

/// Failure while writing minute bars to the store
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Write rejected: {0}")]
    Rejected(String),
}

/// Invalid configuration, fatal at startup
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{field} out of range: {value} (allowed {min}..={max})")]
    OutOfRange {
        field: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },

    #[error("{field} ({value}) must not exceed {limit_field} ({limit})")]
    Exceeds {
        field: &'static str,
        value: u64,
        limit_field: &'static str,
        limit: u64,
    },

    #[error("Invalid value for {var}: {value}")]
    InvalidEnv { var: String, value: String },
}

/// Subscription registry errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("Session not registered: {session_id}")]
    UnknownSession { session_id: String },

    #[error("Session already registered: {session_id}")]
    AlreadyRegistered { session_id: String },

    #[error("Filter has {count} symbols, limit is {limit}")]
    FilterTooLarge { count: usize, limit: usize },
}

/// Inbound value rejected at the ingest boundary
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IngestError {
    #[error("Empty symbol")]
    EmptySymbol,

    #[error("Invalid value: {0}")]
    Value(#[from] ValueError),

    #[error("Timestamp out of range: {0}")]
    InvalidTimestamp(i64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::OutOfRange {
            field: "pool_size",
            value: 9,
            min: 1,
            max: 5,
        };
        assert_eq!(err.to_string(), "pool_size out of range: 9 (allowed 1..=5)");
    }

    #[test]
    fn test_transport_timeout_display() {
        let err = TransportError::Timeout { timeout_ms: 1000 };
        assert!(err.to_string().contains("1000ms"));
    }

    #[test]
    fn test_ingest_error_from_value_error() {
        let value_err = ValueError::NegativeVolume("-1".to_string());
        let ingest_err: IngestError = value_err.into();
        assert!(matches!(ingest_err, IngestError::Value(_)));
    }
}
