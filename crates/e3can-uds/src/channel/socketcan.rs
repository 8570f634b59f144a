//! SocketCAN channel (Linux only)
//!
//! Bridges a raw `can0`-style interface to the [`CanChannel`] contract.
//! Frames with extended identifiers, RTR bit or fewer than 8 data bytes are
//! not part of the E3 protocol and are dropped at this layer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use socketcan::{CanSocket, EmbeddedFrame, Socket, StandardId};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::CanChannel;
use crate::error::ChannelError;
use crate::frame::CanFrame;

pub struct SocketCanChannel {
    tx_socket: Mutex<CanSocket>,
    inbound: broadcast::Sender<CanFrame>,
    listener: Mutex<Option<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
}

impl SocketCanChannel {
    /// Open the interface and start the background listener.
    pub fn open(interface: &str) -> Result<Self, ChannelError> {
        let tx_socket = CanSocket::open(interface).map_err(|e| {
            ChannelError::InvalidConfig(format!("cannot open {}: {}", interface, e))
        })?;

        let rx_socket = CanSocket::open(interface).map_err(|e| {
            ChannelError::InvalidConfig(format!("cannot open {}: {}", interface, e))
        })?;
        rx_socket
            .set_read_timeout(Duration::from_millis(100))
            .map_err(|e| ChannelError::InvalidConfig(format!("read timeout: {}", e)))?;

        let (inbound, _) = broadcast::channel(1024);
        let running = Arc::new(AtomicBool::new(true));

        let channel = Self {
            tx_socket: Mutex::new(tx_socket),
            inbound: inbound.clone(),
            listener: Mutex::new(None),
            running: running.clone(),
        };

        let handle = tokio::task::spawn_blocking(move || {
            while running.load(Ordering::SeqCst) {
                match rx_socket.read_frame() {
                    Ok(frame) => {
                        if let Some(converted) = convert_frame(&frame) {
                            let _ = inbound.send(converted);
                        }
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                    Err(e) => {
                        error!(?e, "SocketCAN read error");
                        std::thread::sleep(Duration::from_millis(100));
                    }
                }
            }
            debug!("SocketCAN listener stopped");
        });
        *channel.listener.lock() = Some(handle);

        Ok(channel)
    }
}

fn convert_frame(frame: &socketcan::CanFrame) -> Option<CanFrame> {
    let id = match frame.id() {
        socketcan::Id::Standard(std_id) => std_id.as_raw(),
        socketcan::Id::Extended(_) => return None,
    };
    let data = frame.data();
    if data.len() != 8 {
        warn!(id = format!("0x{:03X}", id), len = data.len(), "short CAN frame dropped");
        return None;
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(data);
    Some(CanFrame::new(id, bytes))
}

impl CanChannel for SocketCanChannel {
    fn send(&self, frame: CanFrame) -> Result<(), ChannelError> {
        let id = StandardId::new(frame.id)
            .ok_or_else(|| ChannelError::SendFailed(format!("bad CAN id 0x{:X}", frame.id)))?;
        let out = socketcan::CanFrame::new(id, &frame.data)
            .ok_or_else(|| ChannelError::SendFailed("frame construction failed".to_string()))?;
        self.tx_socket
            .lock()
            .write_frame(&out)
            .map_err(|e| ChannelError::SendFailed(e.to_string()))
    }

    fn subscribe(&self) -> broadcast::Receiver<CanFrame> {
        self.inbound.subscribe()
    }
}

impl Drop for SocketCanChannel {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }
    }
}
