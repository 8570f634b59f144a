//! Mock CAN channel for tests and the demo daemon

use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::CanChannel;
use crate::error::ChannelError;
use crate::frame::CanFrame;

/// In-memory channel: records every sent frame and lets tests inject
/// inbound traffic.
pub struct MockChannel {
    sent: Mutex<Vec<CanFrame>>,
    outbound: broadcast::Sender<CanFrame>,
    inbound: broadcast::Sender<CanFrame>,
}

impl MockChannel {
    pub fn new() -> Self {
        let (outbound, _) = broadcast::channel(256);
        let (inbound, _) = broadcast::channel(256);
        Self {
            sent: Mutex::new(Vec::new()),
            outbound,
            inbound,
        }
    }

    /// Simulate a frame arriving from the bus.
    pub fn inject(&self, frame: CanFrame) {
        let _ = self.inbound.send(frame);
    }

    /// All frames sent so far, in order.
    pub fn sent(&self) -> Vec<CanFrame> {
        self.sent.lock().clone()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }

    /// Watch outbound frames as they are sent.
    pub fn watch_sent(&self) -> broadcast::Receiver<CanFrame> {
        self.outbound.subscribe()
    }
}

impl Default for MockChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl CanChannel for MockChannel {
    fn send(&self, frame: CanFrame) -> Result<(), ChannelError> {
        tracing::trace!(?frame, "mock send");
        self.sent.lock().push(frame);
        let _ = self.outbound.send(frame);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<CanFrame> {
        self.inbound.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_is_recorded_and_watchable() {
        let channel = MockChannel::new();
        let mut watch = channel.watch_sent();

        let frame = CanFrame::padded(0x680, &[0x03, 0x22, 0x01, 0x8C], 0x00);
        channel.send(frame).unwrap();

        assert_eq!(channel.sent(), vec![frame]);
        assert_eq!(watch.try_recv().unwrap(), frame);
    }

    #[test]
    fn test_inject_reaches_subscribers() {
        let channel = MockChannel::new();
        let mut rx = channel.subscribe();

        let frame = CanFrame::padded(0x690, &[0x05, 0x62, 0x01, 0x8C, 0xC2, 0x01], 0x55);
        channel.inject(frame);

        assert_eq!(rx.try_recv().unwrap(), frame);
    }
}
