//! Error types for DID conversion

use thiserror::Error;

/// Errors that can occur while loading catalogs or converting values
#[derive(Debug, Error)]
pub enum ConvError {
    /// DID not found in the catalog
    #[error("unknown DID: 0x{0:04X}")]
    UnknownDid(u16),

    /// Invalid DID string format
    #[error("invalid DID format: {0}")]
    InvalidDidFormat(String),

    /// Codec name not part of the closed codec family
    #[error("unknown codec: {0}")]
    UnknownCodec(String),

    /// Codec spec missing a required argument
    #[error("codec {codec} requires argument `{arg}`")]
    MissingArg { codec: &'static str, arg: &'static str },

    /// Codec spec carries an argument value outside its valid range
    #[error("invalid codec spec: {0}")]
    InvalidSpec(String),

    /// Data too short for the declared length
    #[error("data too short: expected {expected} bytes, got {actual}")]
    DataTooShort { expected: usize, actual: usize },

    /// Value cannot be decoded/encoded with this codec
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Value out of range for the target width
    #[error("value out of range: {value} does not fit {bytes} byte(s)")]
    ValueOutOfRange { value: f64, bytes: u8 },

    /// YAML parsing error
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for conversion operations
pub type ConvResult<T> = Result<T, ConvError>;

/// Parse a DID string (hex) to u16
///
/// Accepts formats: "018C", "0x018C", "0X018C", "018c"
pub fn parse_did(s: &str) -> ConvResult<u16> {
    let s = s.trim().trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(s, 16).map_err(|_| ConvError::InvalidDidFormat(s.to_string()))
}

/// Format a DID as hex string (uppercase, no prefix)
pub fn format_did(did: u16) -> String {
    format!("{:04X}", did)
}
