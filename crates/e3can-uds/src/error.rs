//! Adapter and channel errors

use thiserror::Error;

/// CAN channel errors
#[derive(Debug, Error, Clone)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("channel not supported: {0}")]
    Unsupported(String),
}

/// Errors surfaced by the adapter API
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("conversion error: {0}")]
    Conv(#[from] e3can_conv::ConvError),

    #[error("DID 0x{0:04X} is not writable")]
    NotWritable(u16),

    #[error("DID 0x{0:04X} is not in the catalog")]
    UnknownDid(u16),

    #[error("a session for rx id 0x{0:03X} already exists")]
    DuplicateSession(u16),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
