//! Queue drain and periodic schedules
//!
//! A 40 ms tick pops one command iff the engine is idle, the cool-down has
//! elapsed and the operation mode allows dispatch. Schedule loops enqueue
//! read batches; period 0 is a one-shot at startup.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use super::{Command, CommandMode, SessionState, UdsSession};

/// Queue drain cadence.
pub(crate) const DRAIN_TICK: Duration = Duration::from_millis(40);

pub(crate) fn spawn_drain(session: UdsSession) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(DRAIN_TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            let inner = &session.inner;
            if inner.stopped.load(Ordering::SeqCst) {
                return;
            }
            if !inner.op_mode.read().allows_dispatch() {
                continue;
            }
            if inner.queue.lock().is_empty() {
                continue;
            }
            let remaining = {
                let eng = inner.engine.lock();
                if eng.state != SessionState::Idle {
                    continue;
                }
                eng.cool_down_until
                    .map(|until| until.saturating_duration_since(Instant::now()))
                    .unwrap_or(Duration::ZERO)
            };
            if !remaining.is_zero() {
                // ready early: sleep out the rest of the cool-down
                tokio::time::sleep(remaining).await;
            }
            let cmd = { inner.queue.lock().pop_front() };
            if let Some(cmd) = cmd {
                session.dispatch(cmd);
            }
        }
    })
}

pub(crate) fn spawn_schedule(session: UdsSession, period_s: u32, dids: Vec<u16>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if period_s == 0 {
            debug!(
                device = %session.inner.config.name,
                count = dids.len(),
                "one-shot schedule fired"
            );
            enqueue_reads(&session, &dids);
            return;
        }
        let mut tick = tokio::time::interval(Duration::from_secs(period_s as u64));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // consume the tick that completes immediately
        tick.tick().await;
        loop {
            tick.tick().await;
            if session.inner.stopped.load(Ordering::SeqCst) {
                return;
            }
            debug!(
                device = %session.inner.config.name,
                period_s,
                count = dids.len(),
                "schedule tick"
            );
            enqueue_reads(&session, &dids);
        }
    })
}

fn enqueue_reads(session: &UdsSession, dids: &[u16]) {
    let mut queue = session.inner.queue.lock();
    for &did in dids {
        queue.push_back(Command {
            mode: CommandMode::Read,
            did,
            payload: Vec::new(),
        });
    }
}
