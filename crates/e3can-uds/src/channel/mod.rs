//! CAN channel abstraction
//!
//! The engine owns no transport details beyond this contract: send one
//! 8-byte frame, subscribe to everything arriving on the bus. The channel
//! serializes writes internally; it is the only resource shared between
//! sessions.

pub mod mock;

#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub mod socketcan;

use tokio::sync::broadcast;

use crate::error::ChannelError;
use crate::frame::CanFrame;

/// A raw CAN channel.
///
/// `send` must be non-blocking: it is called from the session state machine
/// between two suspension points. Implementations buffer or fail fast.
pub trait CanChannel: Send + Sync {
    /// Queue one frame for transmission.
    fn send(&self, frame: CanFrame) -> Result<(), ChannelError>;

    /// Subscribe to inbound frames. Every subscriber sees every frame;
    /// filtering by identifier is the caller's job.
    fn subscribe(&self) -> broadcast::Receiver<CanFrame>;
}
