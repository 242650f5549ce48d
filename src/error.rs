//! Per-component error types (spec.md §7).
//!
//! Each component keeps its own error enum; only `SchemaError` ever
//! propagates to the process boundary (fatal at startup). Everything else
//! is recoverable and is logged/handled at the point it occurs.

use thiserror::Error;

/// Schema construction failures. Fatal at startup (spec.md §7).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("unknown wire type `{0}`")]
    UnknownWireType(String),
    #[error("duplicate pdu_id {0}")]
    DuplicatePduId(u8),
    #[error("pdu `{pdu}` has fixed_length {len}, exceeding 255")]
    FixedLengthOverflow { pdu: String, len: usize },
    #[error("pdu `{pdu}` references unknown sensor `{field}`")]
    UnknownSensorField { pdu: String, field: String },
    #[error("pdu `{0}` has no fields")]
    EmptyPdu(String),
    #[error("pdu `{0}`'s first field must be a u32 valid_bitfield")]
    MissingValidBitfield(String),
}

/// Frame codec errors (spec.md §4.2, §7). Recoverable: the ingestion
/// pipeline logs these and discards the remainder of the current buffer.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum CodecError {
    #[error("bad start byte")]
    Framing,
    #[error("unknown pdu_id {0}")]
    UnknownPdu(u8),
    #[error("buffer too short for declared pdu")]
    ShortFrame,
}

/// Transport lifecycle errors (spec.md §4.3, §7).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(#[from] std::io::Error),
    #[error("transport closed")]
    Closed,
}

/// Staging store errors (spec.md §4.5, §7).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown sensor `{0}`")]
    UnknownSensor(String),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Fan-out broker errors (spec.md §4.6, §7).
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("subscriber emit failed")]
    Emit,
    #[error("unknown subscriber")]
    UnknownSubscriber,
}

/// Query server errors, each mapped to the status code spec.md §4.7 names.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum QueryError {
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("unknown route `{0}`")]
    UnknownRoute(String),
    #[error("unsupported verb `{0}`")]
    UnknownVerb(String),
    #[error("unknown sensor group `{0}`")]
    UnknownGroup(String),
    #[error("store failure: {0}")]
    Internal(String),
}

impl QueryError {
    /// HTTP-shaped status code per spec.md §4.7.
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            QueryError::Malformed(_) => 400,
            QueryError::UnknownRoute(_) | QueryError::UnknownGroup(_) => 404,
            QueryError::UnknownVerb(_) => 501,
            QueryError::Internal(_) => 500,
        }
    }
}

/// Configuration load/validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("toml: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("schema: {0}")]
    Schema(#[from] SchemaError),
    #[error("missing required key `{0}`")]
    MissingKey(&'static str),
}
