//! UDS device session
//!
//! One `UdsSession` drives a single logical device address pair
//! `(tx_id, rx_id = tx_id + 0x10)`: it owns the ISO-TP/UDS state machine,
//! a FIFO of pending commands, any number of periodic read schedules and a
//! statistics block. At most one exchange is in flight at a time; the queue
//! drains only while the engine is idle and the cool-down from the previous
//! exchange has elapsed.
//!
//! All state mutation happens under one short-held lock; the only
//! suspension points are timers (drain tick, schedule tick, timeout,
//! consecutive-frame pacing) and never inside the state machine body.

mod engine;
mod queue;
pub mod stats;

pub use stats::Statistics;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use e3can_conv::DidCatalog;
use e3can_core::{sanitize_id, OpMode, StateStore};

use crate::channel::CanChannel;
use crate::config::DeviceConfig;
use crate::error::AdapterError;
use crate::sink::DecodeSink;
use crate::supervisor::FallbackRequest;

/// Engine state; `Idle` is both initial and terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AwaitReadHead,
    AwaitReadCf,
    AwaitWriteFc,
    AwaitWriteAck,
}

/// What a queued command asks the engine to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandMode {
    Read,
    Write,
    Write77,
}

/// One queued exchange request.
#[derive(Debug, Clone)]
pub struct Command {
    pub mode: CommandMode,
    pub did: u16,
    /// Raw value bytes for writes; empty for reads.
    pub payload: Vec<u8>,
}

/// Outcome of one exchange, reported through the session callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Timeout,
    NegativeResponse { nrc: u8 },
    DidMismatch { responded: u16 },
    BadFrame,
    BadState,
}

impl Outcome {
    /// Minimum wait before the next exchange may start.
    pub fn cool_down(&self) -> Duration {
        match self {
            Outcome::Ok | Outcome::Timeout => Duration::ZERO,
            Outcome::NegativeResponse { .. } => Duration::from_millis(100),
            Outcome::DidMismatch { .. } => Duration::from_millis(1000),
            Outcome::BadFrame | Outcome::BadState => Duration::from_millis(2500),
        }
    }
}

/// Callback payload for one finished exchange.
#[derive(Debug, Clone)]
pub struct ExchangeReport {
    pub outcome: Outcome,
    pub did: u16,
    /// Sanitized publish id of the DID
    pub id: String,
    /// Payload length (received for reads, written for writes)
    pub len: usize,
    /// Decoded value for successful reads
    pub value: Option<Value>,
}

/// Session outcome callback.
pub type ReportCallback = Arc<dyn Fn(ExchangeReport) + Send + Sync>;

/// Transfer buffer of the in-flight exchange.
#[derive(Debug)]
pub(crate) struct Transfer {
    pub(crate) mode: CommandMode,
    pub(crate) did: u16,
    /// Declared receive length once the head frame arrived
    pub(crate) expected_len: usize,
    /// Received payload bytes
    pub(crate) rx: Vec<u8>,
    /// Message bytes still to send in consecutive frames
    pub(crate) tx_rest: Vec<u8>,
    /// Raw value bytes of a write, kept for the SID-0x77 retry
    pub(crate) value: Vec<u8>,
    /// Next expected/used consecutive-frame sequence counter
    pub(crate) seq: u8,
    pub(crate) started: Instant,
}

impl Transfer {
    pub(crate) fn read(did: u16) -> Self {
        Self {
            mode: CommandMode::Read,
            did,
            expected_len: 0,
            rx: Vec::new(),
            tx_rest: Vec::new(),
            value: Vec::new(),
            seq: 0,
            started: Instant::now(),
        }
    }

    pub(crate) fn write(mode: CommandMode, did: u16, value: Vec<u8>, tx_rest: Vec<u8>) -> Self {
        Self {
            mode,
            did,
            expected_len: 0,
            rx: Vec::new(),
            tx_rest,
            value,
            seq: 0,
            started: Instant::now(),
        }
    }
}

/// Mutable engine state, always manipulated under one lock.
pub(crate) struct Engine {
    pub(crate) state: SessionState,
    pub(crate) transfer: Option<Transfer>,
    /// Bumped when an exchange starts; stale timeout timers check it.
    pub(crate) generation: u64,
    pub(crate) cool_down_until: Option<Instant>,
    pub(crate) timeout_task: Option<JoinHandle<()>>,
}

impl Engine {
    fn new() -> Self {
        Self {
            state: SessionState::Idle,
            transfer: None,
            generation: 0,
            cool_down_until: None,
            timeout_task: None,
        }
    }
}

pub(crate) struct SessionInner {
    pub(crate) config: DeviceConfig,
    pub(crate) channel: Arc<dyn CanChannel>,
    pub(crate) sink: DecodeSink,
    pub(crate) engine: Mutex<Engine>,
    pub(crate) queue: Mutex<VecDeque<Command>>,
    pub(crate) stats: Mutex<Statistics>,
    pub(crate) op_mode: RwLock<OpMode>,
    pub(crate) callback: RwLock<Option<ReportCallback>>,
    pub(crate) fallback: Option<mpsc::UnboundedSender<FallbackRequest>>,
    pub(crate) drain_task: Mutex<Option<JoinHandle<()>>>,
    pub(crate) schedules: Mutex<HashMap<u32, JoinHandle<()>>>,
    pub(crate) stopped: AtomicBool,
    pub(crate) in_frame: AtomicBool,
}

/// Handle to one device session. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct UdsSession {
    pub(crate) inner: Arc<SessionInner>,
}

impl std::fmt::Debug for UdsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdsSession")
            .field("rx_id", &self.inner.config.rx_id())
            .finish_non_exhaustive()
    }
}

impl UdsSession {
    /// Build a session without the SID-0x77 retry channel (retries are then
    /// skipped with a log line).
    pub fn new(
        config: DeviceConfig,
        channel: Arc<dyn CanChannel>,
        catalog: Arc<DidCatalog>,
        store: Arc<dyn StateStore>,
        state_prefix: &str,
    ) -> Self {
        Self::build(config, channel, catalog, store, state_prefix, None)
    }

    pub(crate) fn with_fallback(
        config: DeviceConfig,
        channel: Arc<dyn CanChannel>,
        catalog: Arc<DidCatalog>,
        store: Arc<dyn StateStore>,
        state_prefix: &str,
        fallback: mpsc::UnboundedSender<FallbackRequest>,
    ) -> Self {
        Self::build(config, channel, catalog, store, state_prefix, Some(fallback))
    }

    fn build(
        config: DeviceConfig,
        channel: Arc<dyn CanChannel>,
        catalog: Arc<DidCatalog>,
        store: Arc<dyn StateStore>,
        state_prefix: &str,
        fallback: Option<mpsc::UnboundedSender<FallbackRequest>>,
    ) -> Self {
        let prefix = format!("{}.{}", state_prefix, sanitize_id(&config.name));
        let op_mode = config.op_mode;
        Self {
            inner: Arc::new(SessionInner {
                sink: DecodeSink::new(catalog, store, prefix),
                channel,
                config,
                engine: Mutex::new(Engine::new()),
                queue: Mutex::new(VecDeque::new()),
                stats: Mutex::new(Statistics::new()),
                op_mode: RwLock::new(op_mode),
                callback: RwLock::new(None),
                fallback,
                drain_task: Mutex::new(None),
                schedules: Mutex::new(HashMap::new()),
                stopped: AtomicBool::new(false),
                in_frame: AtomicBool::new(false),
            }),
        }
    }

    /// Spawn the queue drain and the configured schedules. Calling twice is
    /// a no-op, as is calling after `stop`.
    pub fn start(&self) {
        let inner = &self.inner;
        if inner.stopped.load(Ordering::SeqCst) {
            return;
        }
        let mut drain = inner.drain_task.lock();
        if drain.is_some() {
            return;
        }
        info!(
            device = %inner.config.name,
            tx = format!("0x{:03X}", inner.config.tx_id),
            rx = format!("0x{:03X}", inner.config.rx_id()),
            "session starting"
        );
        *drain = Some(queue::spawn_drain(self.clone()));

        let mut schedules = inner.schedules.lock();
        for sched in &inner.config.schedules {
            if let Some(old) = schedules.remove(&sched.period_s) {
                old.abort();
            }
            schedules.insert(
                sched.period_s,
                queue::spawn_schedule(self.clone(), sched.period_s, sched.dids.clone()),
            );
        }
    }

    /// Terminally stop the session: cancel the drain, all schedules and any
    /// armed timeout, and abandon the in-flight exchange without a callback.
    /// Idempotent.
    pub fn stop(&self) {
        let inner = &self.inner;
        if inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(device = %inner.config.name, "session stopping");
        if let Some(handle) = inner.drain_task.lock().take() {
            handle.abort();
        }
        for (_, handle) in inner.schedules.lock().drain() {
            handle.abort();
        }
        let mut eng = inner.engine.lock();
        if let Some(handle) = eng.timeout_task.take() {
            handle.abort();
        }
        eng.transfer = None;
        eng.state = SessionState::Idle;
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.inner.config
    }

    pub fn tx_id(&self) -> u16 {
        self.inner.config.tx_id
    }

    pub fn rx_id(&self) -> u16 {
        self.inner.config.rx_id()
    }

    pub fn catalog(&self) -> Arc<DidCatalog> {
        self.inner.sink.catalog_arc()
    }

    pub fn op_mode(&self) -> OpMode {
        *self.inner.op_mode.read()
    }

    pub fn set_op_mode(&self, mode: OpMode) {
        info!(device = %self.inner.config.name, %mode, "operation mode changed");
        *self.inner.op_mode.write() = mode;
    }

    pub fn set_callback(&self, callback: ReportCallback) {
        *self.inner.callback.write() = Some(callback);
    }

    pub fn callback(&self) -> Option<ReportCallback> {
        self.inner.callback.read().clone()
    }

    /// Enqueue a read for one DID.
    pub fn read_by_did(&self, did: u16) {
        self.push(Command {
            mode: CommandMode::Read,
            did,
            payload: Vec::new(),
        });
    }

    /// Enqueue reads for a batch of DIDs, in order.
    pub fn read_dids(&self, dids: &[u16]) {
        let mut queue = self.inner.queue.lock();
        for &did in dids {
            queue.push_back(Command {
                mode: CommandMode::Read,
                did,
                payload: Vec::new(),
            });
        }
    }

    /// Enqueue a write with pre-encoded value bytes.
    pub fn write_by_did(&self, did: u16, payload: Vec<u8>) {
        self.push(Command {
            mode: CommandMode::Write,
            did,
            payload,
        });
    }

    /// Enqueue a write over the vendor SID-0x77 service.
    pub fn write_by_did_77(&self, did: u16, payload: Vec<u8>) {
        self.push(Command {
            mode: CommandMode::Write77,
            did,
            payload,
        });
    }

    /// Encode a structured value through the catalog codec and enqueue the
    /// write. Rejects DIDs outside the writable set.
    pub fn write_value(&self, did: u16, value: &Value) -> Result<(), AdapterError> {
        let catalog = self.inner.sink.catalog();
        if !catalog.is_writable(did) {
            tracing::warn!(
                device = %self.inner.config.name,
                did = %e3can_conv::format_did(did),
                "write to non-writable DID rejected"
            );
            return Err(AdapterError::NotWritable(did));
        }
        let desc = catalog.get(did).ok_or(AdapterError::UnknownDid(did))?;
        let payload = desc.codec.encode(value)?;
        self.write_by_did(did, payload);
        Ok(())
    }

    /// Install (or replace) the schedule for a period. Period 0 fires once.
    pub fn add_schedule(&self, period_s: u32, dids: Vec<u16>) {
        let mut schedules = self.inner.schedules.lock();
        if let Some(old) = schedules.remove(&period_s) {
            old.abort();
        }
        schedules.insert(
            period_s,
            queue::spawn_schedule(self.clone(), period_s, dids),
        );
    }

    fn push(&self, cmd: Command) {
        self.inner.queue.lock().push_back(cmd);
    }

    /// Number of commands waiting in the queue.
    pub fn queued(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Current engine state.
    pub fn state(&self) -> SessionState {
        self.inner.engine.lock().state
    }

    /// Statistics snapshot as the JSON blob that gets published.
    pub fn stats_json(&self) -> Value {
        self.inner.stats.lock().to_json()
    }

    /// Publish statistics through the state store, rate-limited unless
    /// `force` is set.
    pub fn publish_stats(&self, force: bool) {
        let inner = &self.inner;
        let blob = {
            let mut stats = inner.stats.lock();
            if !stats.should_publish(force) {
                return;
            }
            stats.to_json()
        };
        inner
            .sink
            .store()
            .set(&format!("{}.info.statistics", inner.sink.prefix()), blob);
    }
}
