//! e3can-uds - ISO-TP/UDS session engine for Viessmann E3 devices
//!
//! Drives ReadDataByIdentifier and WriteDataByIdentifier exchanges over
//! single- and multi-frame ISO-TP transport on a raw CAN channel, one
//! session per device address pair.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Supervisor                            │
//! │  routes inbound frames by rx id, owns the sessions,          │
//! │  lazily spawns the SID-0x77 companion for write retries      │
//! │                                                              │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │ UdsSession (per device)                                │  │
//! │  │  ┌────────────┐ ┌───────────┐ ┌──────────────────────┐ │  │
//! │  │  │ queue +    │ │ ISO-TP /  │ │ DecodeSink           │ │  │
//! │  │  │ schedules  │→│ UDS state │→│ raw / json / tree    │ │  │
//! │  │  │ (40ms tick)│ │ machine   │ │ views via StateStore │ │  │
//! │  │  └────────────┘ └───────────┘ └──────────────────────┘ │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! │                          │                                   │
//! │                   ┌──────┴──────┐                            │
//! │                   │ CanChannel  │                            │
//! │                   │ (SocketCAN/ │                            │
//! │                   │  mock)      │                            │
//! │                   └─────────────┘                            │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod channel;
pub mod config;
pub mod error;
pub mod frame;
pub mod migrate;
pub mod session;
pub mod sink;
pub mod supervisor;

pub use channel::CanChannel;
pub use config::{AdapterConfig, ChannelConfig, DeviceConfig, ScheduleConfig};
pub use error::{AdapterError, ChannelError};
pub use frame::CanFrame;
pub use migrate::sync_catalog;
pub use session::{
    Command, CommandMode, ExchangeReport, Outcome, ReportCallback, SessionState, Statistics,
    UdsSession,
};
pub use sink::DecodeSink;
pub use supervisor::{FallbackRequest, Supervisor};

// Re-export for convenience
pub use e3can_core::{MemoryStore, OpMode, StateStore};
