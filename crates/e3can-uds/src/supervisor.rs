//! Session supervisor
//!
//! Owns every session on one CAN channel, keyed by receive identifier.
//! A single router task fans inbound frames out to sessions, which keeps
//! all state machine invocations serialized. Write retries over SID 0x77
//! arrive here as [`FallbackRequest`]s; the companion session for that
//! service is created lazily on first use.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use e3can_conv::{format_did, DidCatalog};
use e3can_core::StateStore;

use crate::channel::CanChannel;
use crate::config::{DeviceConfig, RX_ID_OFFSET};
use crate::error::AdapterError;
use crate::session::UdsSession;

/// A rejected write asking to be retried through the SID-0x77 session.
#[derive(Debug)]
pub struct FallbackRequest {
    /// Transmit id of the session whose write was rejected
    pub base_tx: u16,
    pub did: u16,
    pub payload: Vec<u8>,
}

struct SupervisorInner {
    channel: Arc<dyn CanChannel>,
    store: Arc<dyn StateStore>,
    state_prefix: String,
    sessions: RwLock<HashMap<u16, UdsSession>>,
    fallback_tx: mpsc::UnboundedSender<FallbackRequest>,
    fallback_rx: Mutex<Option<mpsc::UnboundedReceiver<FallbackRequest>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
    stopped: AtomicBool,
}

/// Handle to the supervisor. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl Supervisor {
    pub fn new(
        channel: Arc<dyn CanChannel>,
        store: Arc<dyn StateStore>,
        state_prefix: impl Into<String>,
    ) -> Self {
        let (fallback_tx, fallback_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(SupervisorInner {
                channel,
                store,
                state_prefix: state_prefix.into(),
                sessions: RwLock::new(HashMap::new()),
                fallback_tx,
                fallback_rx: Mutex::new(Some(fallback_rx)),
                tasks: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Register a device. Starts its session immediately when the
    /// supervisor is already running.
    pub fn add_device(
        &self,
        config: DeviceConfig,
        catalog: Arc<DidCatalog>,
    ) -> Result<UdsSession, AdapterError> {
        let rx_id = config.rx_id();
        let mut sessions = self.inner.sessions.write();
        if sessions.contains_key(&rx_id) {
            return Err(AdapterError::DuplicateSession(rx_id));
        }
        let session = UdsSession::with_fallback(
            config,
            self.inner.channel.clone(),
            catalog,
            self.inner.store.clone(),
            &self.inner.state_prefix,
            self.inner.fallback_tx.clone(),
        );
        sessions.insert(rx_id, session.clone());
        drop(sessions);

        if self.inner.running.load(Ordering::SeqCst) {
            session.start();
        }
        Ok(session)
    }

    /// Look a session up by its receive identifier.
    pub fn session(&self, rx_id: u16) -> Option<UdsSession> {
        self.inner.sessions.read().get(&rx_id).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.read().len()
    }

    /// Start the frame router, the retry handler and every session.
    pub fn start(&self) {
        let inner = &self.inner;
        if inner.stopped.load(Ordering::SeqCst) || inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(sessions = inner.sessions.read().len(), "supervisor starting");

        let mut frames = inner.channel.subscribe();
        let this = self.clone();
        let router = tokio::spawn(async move {
            loop {
                match frames.recv().await {
                    Ok(frame) => {
                        let session = this.inner.sessions.read().get(&frame.id).cloned();
                        if let Some(session) = session {
                            session.on_frame(frame);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "frame router lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("channel closed, frame router exiting");
                        break;
                    }
                }
            }
        });

        let taken = inner.fallback_rx.lock().take();
        let this = self.clone();
        let retry = tokio::spawn(async move {
            let Some(mut requests) = taken else { return };
            while let Some(req) = requests.recv().await {
                this.handle_fallback(req);
            }
        });

        inner.tasks.lock().extend([router, retry]);

        let sessions: Vec<UdsSession> = inner.sessions.read().values().cloned().collect();
        for session in sessions {
            session.start();
        }
    }

    /// Stop everything: router, retry handler, sessions with their
    /// schedules and timers. Idempotent.
    pub fn stop(&self) {
        let inner = &self.inner;
        if inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        inner.running.store(false, Ordering::SeqCst);
        info!("supervisor stopping");
        for task in inner.tasks.lock().drain(..) {
            task.abort();
        }
        let sessions: Vec<UdsSession> = inner.sessions.read().values().cloned().collect();
        for session in sessions {
            session.stop();
        }
    }

    fn handle_fallback(&self, req: FallbackRequest) {
        let inner = &self.inner;
        let Some(base) = self.session(req.base_tx + RX_ID_OFFSET) else {
            warn!(
                base_tx = format!("0x{:03X}", req.base_tx),
                "retry request for unknown session dropped"
            );
            return;
        };

        let companion_config = base.config().service77_companion();
        let companion_rx = companion_config.rx_id();
        let companion = match self.session(companion_rx) {
            Some(session) => session,
            None => {
                info!(
                    device = %companion_config.name,
                    tx = format!("0x{:03X}", companion_config.tx_id),
                    "spawning SID-0x77 companion session"
                );
                let session = UdsSession::with_fallback(
                    companion_config,
                    inner.channel.clone(),
                    base.catalog(),
                    inner.store.clone(),
                    &inner.state_prefix,
                    inner.fallback_tx.clone(),
                );
                if let Some(cb) = base.callback() {
                    session.set_callback(cb);
                }
                inner.sessions.write().insert(companion_rx, session.clone());
                if inner.running.load(Ordering::SeqCst) {
                    session.start();
                }
                session
            }
        };

        info!(
            device = %companion.name(),
            did = %format_did(req.did),
            "retrying write via SID 0x77"
        );
        companion.write_by_did_77(req.did, req.payload);
    }
}
