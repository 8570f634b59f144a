//! The ISO-TP/UDS exchange state machine
//!
//! Frame layout notes, with `d` the 8 data bytes of a frame:
//!
//! - read request:    `[03 22 did_hi did_lo 00 00 00 00]`
//! - SF read reply:   `[len+3 62 did_hi did_lo v..]`
//! - FF read reply:   `[1L LL 62 did_hi did_lo v0 v1 v2]`, total = LLL - 3
//! - CF:              `[2N v..7]`, N = 1..F wrapping F -> 0
//! - FC:              `[30 00 ST ..]`
//! - write request:   `[n+3 2E did_hi did_lo v..]` or FF/CF for n > 4
//! - write ack:       `[03 6E did_hi did_lo ..]`
//! - negative:        `[03 7F sid nrc ..]`
//! - 0x77 write:      message `77 43 01 82 did_lo did_hi B0+n v..`,
//!   framed with length field (n + 6) + 3, padded with 0x55
//! - 0x77 confirm:    `[04 77 .. .. 44 ..]`

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, error, info, trace, warn};

use e3can_conv::format_did;
use e3can_core::OpMode;

use crate::error::ChannelError;
use crate::frame::{
    next_seq, pci, sid, CanFrame, FLOW_CONTROL_FRAME, PAD_77, SEQ_FIRST, WRITE77_COMPLETION,
    WRITE77_CONFIRM_LEN, WRITE77_PREFIX,
};

use super::{
    Command, CommandMode, Engine, ExchangeReport, Outcome, SessionState, Transfer, UdsSession,
};
use crate::supervisor::FallbackRequest;

impl UdsSession {
    /// Inbound frame entry point. Serialized by construction (the
    /// supervisor router is a single task); a re-entrant call is counted
    /// as an overlap and dropped.
    pub fn on_frame(&self, frame: CanFrame) {
        let inner = &self.inner;
        if inner.stopped.load(Ordering::SeqCst) {
            return;
        }
        if frame.id != inner.config.rx_id() {
            return;
        }
        if inner.in_frame.swap(true, Ordering::SeqCst) {
            let count = inner.stats.lock().record_overlap();
            if count == 1 || count % 100 == 0 {
                warn!(device = %inner.config.name, count, "re-entrant inbound frame dropped");
            }
            return;
        }
        let report = self.handle_frame(frame);
        inner.in_frame.store(false, Ordering::SeqCst);
        if let Some(report) = report {
            self.deliver(report);
        }
    }

    fn handle_frame(&self, frame: CanFrame) -> Option<ExchangeReport> {
        let mut eng = self.inner.engine.lock();
        match eng.state {
            SessionState::Idle => {
                // A frame after completion and before the next command is a
                // late straggler from the bus, not an error.
                trace!(device = %self.inner.config.name, ?frame, "frame while idle dropped");
                None
            }
            SessionState::AwaitReadHead => self.on_read_head(&mut eng, &frame),
            SessionState::AwaitReadCf => self.on_read_cf(&mut eng, &frame),
            SessionState::AwaitWriteFc => self.on_write_fc(&mut eng, &frame),
            SessionState::AwaitWriteAck => self.on_write_ack(&mut eng, &frame),
        }
    }

    /// Pop-and-transmit for one command. Called by the queue drain with the
    /// engine idle and the cool-down elapsed.
    pub(crate) fn dispatch(&self, cmd: Command) {
        let inner = &self.inner;
        let op_mode = *inner.op_mode.read();
        if op_mode == OpMode::Service77 && cmd.mode != CommandMode::Write77 {
            warn!(
                device = %inner.config.name,
                did = %format_did(cmd.did),
                "non-0x77 command dropped in service77 mode"
            );
            return;
        }

        inner.stats.lock().record_started();

        let tx_id = inner.config.tx_id;
        let mut eng = inner.engine.lock();
        debug_assert_eq!(eng.state, SessionState::Idle);

        let sent = match cmd.mode {
            CommandMode::Read => {
                debug!(device = %inner.config.name, did = %format_did(cmd.did), "read");
                eng.transfer = Some(Transfer::read(cmd.did));
                eng.state = SessionState::AwaitReadHead;
                inner.channel.send(CanFrame::padded(
                    tx_id,
                    &[0x03, sid::READ, (cmd.did >> 8) as u8, cmd.did as u8],
                    0x00,
                ))
            }
            CommandMode::Write => {
                debug!(
                    device = %inner.config.name,
                    did = %format_did(cmd.did),
                    len = cmd.payload.len(),
                    "write"
                );
                let mut msg = Vec::with_capacity(cmd.payload.len() + 3);
                msg.push(sid::WRITE);
                msg.extend_from_slice(&cmd.did.to_be_bytes());
                msg.extend_from_slice(&cmd.payload);
                let declared = msg.len();
                self.start_write(&mut eng, cmd, msg, declared, 0x00)
            }
            CommandMode::Write77 => {
                debug!(
                    device = %inner.config.name,
                    did = %format_did(cmd.did),
                    len = cmd.payload.len(),
                    "write via 0x77"
                );
                let n = cmd.payload.len();
                let mut msg = Vec::with_capacity(n + 7);
                msg.push(sid::VENDOR_WRITE);
                msg.extend_from_slice(&WRITE77_PREFIX);
                msg.push(cmd.did as u8);
                msg.push((cmd.did >> 8) as u8);
                msg.push(0xB0 + n as u8);
                msg.extend_from_slice(&cmd.payload);
                // the encapsulated block (n + 6 bytes) counts as the
                // did + value payload, so the length field is (n + 6) + 3
                let declared = msg.len() + 2;
                self.start_write(&mut eng, cmd, msg, declared, PAD_77)
            }
        };

        match sent {
            Ok(()) => self.arm_timeout(&mut eng),
            Err(e) => self.channel_failure(&mut eng, e),
        }
    }

    fn start_write(
        &self,
        eng: &mut Engine,
        cmd: Command,
        msg: Vec<u8>,
        declared: usize,
        pad: u8,
    ) -> Result<(), ChannelError> {
        let tx_id = self.inner.config.tx_id;
        if msg.len() <= 7 {
            let mut bytes = Vec::with_capacity(msg.len() + 1);
            bytes.push(declared as u8);
            bytes.extend_from_slice(&msg);
            eng.transfer = Some(Transfer::write(cmd.mode, cmd.did, cmd.payload, Vec::new()));
            eng.state = SessionState::AwaitWriteAck;
            self.inner.channel.send(CanFrame::padded(tx_id, &bytes, pad))
        } else {
            let mut bytes = Vec::with_capacity(8);
            bytes.push(0x10 | ((declared >> 8) as u8 & 0x0F));
            bytes.push(declared as u8);
            bytes.extend_from_slice(&msg[..6]);
            eng.transfer = Some(Transfer::write(
                cmd.mode,
                cmd.did,
                cmd.payload,
                msg[6..].to_vec(),
            ));
            eng.state = SessionState::AwaitWriteFc;
            self.inner.channel.send(CanFrame::padded(tx_id, &bytes, pad))
        }
    }

    fn on_read_head(&self, eng: &mut Engine, frame: &CanFrame) -> Option<ExchangeReport> {
        let d = &frame.data;
        let did = match eng.transfer.as_ref() {
            Some(t) => t.did,
            None => return Some(self.finish(eng, Outcome::BadState, None)),
        };

        if d[0] == 0x03 && d[1] == sid::NEGATIVE && d[2] == sid::READ {
            warn!(
                device = %self.inner.config.name,
                did = %format_did(did),
                nrc = format!("0x{:02X}", d[3]),
                "negative response to read"
            );
            return Some(self.finish(eng, Outcome::NegativeResponse { nrc: d[3] }, None));
        }

        if d[0] >> 4 == pci::SINGLE && d[1] == sid::READ_REPLY {
            let len = (d[0] as usize).saturating_sub(3);
            if len > 4 {
                return Some(self.finish(eng, Outcome::BadFrame, None));
            }
            let responded = u16::from_be_bytes([d[2], d[3]]);
            if responded != did {
                warn!(
                    device = %self.inner.config.name,
                    requested = %format_did(did),
                    responded = %format_did(responded),
                    "single-frame reply for wrong DID"
                );
                return Some(self.finish(eng, Outcome::DidMismatch { responded }, None));
            }
            let payload = d[4..4 + len].to_vec();
            return Some(self.complete_read(eng, payload));
        }

        if d[0] >> 4 == pci::FIRST && d[2] == sid::READ_REPLY {
            let total = ((((d[0] & 0x0F) as usize) << 8) | d[1] as usize).saturating_sub(3);
            let responded = u16::from_be_bytes([d[3], d[4]]);
            if responded != did {
                warn!(
                    device = %self.inner.config.name,
                    requested = %format_did(did),
                    responded = %format_did(responded),
                    "first frame for wrong DID"
                );
                return Some(self.finish(eng, Outcome::DidMismatch { responded }, None));
            }
            let done = match eng.transfer.as_mut() {
                Some(t) => {
                    t.expected_len = total;
                    t.rx.extend_from_slice(&d[5..8]);
                    t.seq = SEQ_FIRST;
                    t.rx.len() >= total
                }
                None => return Some(self.finish(eng, Outcome::BadState, None)),
            };
            if done {
                let payload = take_payload(eng);
                return Some(self.complete_read(eng, payload));
            }
            eng.state = SessionState::AwaitReadCf;
            let fc = CanFrame::new(self.inner.config.tx_id, FLOW_CONTROL_FRAME);
            if let Err(e) = self.inner.channel.send(fc) {
                self.channel_failure(eng, e);
            }
            return None;
        }

        Some(self.finish(eng, Outcome::BadFrame, None))
    }

    fn on_read_cf(&self, eng: &mut Engine, frame: &CanFrame) -> Option<ExchangeReport> {
        enum Step {
            BadSeq(u8),
            Partial,
            Done(Vec<u8>),
        }

        let d = &frame.data;
        let step = match eng.transfer.as_mut() {
            None => return Some(self.finish(eng, Outcome::BadState, None)),
            Some(t) => {
                if d[0] != t.seq {
                    Step::BadSeq(t.seq)
                } else {
                    t.seq = next_seq(t.seq);
                    t.rx.extend_from_slice(&d[1..8]);
                    if t.rx.len() >= t.expected_len {
                        let mut payload = std::mem::take(&mut t.rx);
                        payload.truncate(t.expected_len);
                        Step::Done(payload)
                    } else {
                        Step::Partial
                    }
                }
            }
        };

        match step {
            Step::BadSeq(expected) => {
                warn!(
                    device = %self.inner.config.name,
                    expected = format!("0x{:02X}", expected),
                    got = format!("0x{:02X}", d[0]),
                    "consecutive frame out of sequence"
                );
                Some(self.finish(eng, Outcome::BadFrame, None))
            }
            Step::Partial => None,
            Step::Done(payload) => Some(self.complete_read(eng, payload)),
        }
    }

    fn on_write_fc(&self, eng: &mut Engine, frame: &CanFrame) -> Option<ExchangeReport> {
        let d = &frame.data;
        if d[0] != 0x30 || d[1] != 0x00 {
            warn!(device = %self.inner.config.name, ?frame, "expected flow control");
            return Some(self.finish(eng, Outcome::BadFrame, None));
        }

        // Separation Time outside the sane window (0 included) falls back
        // to 50 ms.
        let st_ms: u64 = if (20..=127).contains(&d[2]) {
            d[2] as u64
        } else {
            50
        };

        let (pad, rest) = match eng.transfer.as_mut() {
            None => return Some(self.finish(eng, Outcome::BadState, None)),
            Some(t) => {
                let pad = if t.mode == CommandMode::Write77 { PAD_77 } else { 0x00 };
                (pad, std::mem::take(&mut t.tx_rest))
            }
        };

        // Pre-build the consecutive frames so the pacing task owns no
        // session state beyond the generation check.
        let tx_id = self.inner.config.tx_id;
        let mut frames = Vec::with_capacity(rest.len().div_ceil(7));
        let mut seq = SEQ_FIRST;
        for chunk in rest.chunks(7) {
            let mut bytes = Vec::with_capacity(chunk.len() + 1);
            bytes.push(seq);
            bytes.extend_from_slice(chunk);
            frames.push(CanFrame::padded(tx_id, &bytes, pad));
            seq = next_seq(seq);
        }

        let generation = eng.generation;
        let session = self.clone();
        tokio::spawn(async move {
            let st = Duration::from_millis(st_ms);
            for frame in frames {
                tokio::time::sleep(st).await;
                if session.inner.stopped.load(Ordering::SeqCst) {
                    return;
                }
                if let Err(e) = session.inner.channel.send(frame) {
                    error!(device = %session.inner.config.name, error = %e, "consecutive frame send failed");
                    return;
                }
            }
            let mut eng = session.inner.engine.lock();
            if eng.generation == generation && eng.state == SessionState::AwaitWriteFc {
                eng.state = SessionState::AwaitWriteAck;
            }
        });

        None
    }

    fn on_write_ack(&self, eng: &mut Engine, frame: &CanFrame) -> Option<ExchangeReport> {
        let d = &frame.data;
        let (mode, did) = match eng.transfer.as_ref() {
            None => return Some(self.finish(eng, Outcome::BadState, None)),
            Some(t) => (t.mode, t.did),
        };

        if mode == CommandMode::Write77 {
            // Only the confirmation carrying the completion marker addresses
            // this exchange; other SID-0x77 frames on the bus belong to
            // unrelated clients.
            if d[0] == WRITE77_CONFIRM_LEN && d[1] == sid::VENDOR_WRITE && d[4] == WRITE77_COMPLETION
            {
                debug!(device = %self.inner.config.name, did = %format_did(did), "0x77 write confirmed");
                return Some(self.finish(eng, Outcome::Ok, None));
            }
            trace!(device = %self.inner.config.name, ?frame, "unrelated SID-0x77 traffic ignored");
            return None;
        }

        if d[0] == 0x03 && d[1] == sid::WRITE_REPLY {
            let responded = u16::from_be_bytes([d[2], d[3]]);
            if responded == did {
                debug!(device = %self.inner.config.name, did = %format_did(did), "write acknowledged");
                return Some(self.finish(eng, Outcome::Ok, None));
            }
            return Some(self.finish(eng, Outcome::DidMismatch { responded }, None));
        }

        if d[0] == 0x03 && d[1] == sid::NEGATIVE && d[2] == sid::WRITE {
            warn!(
                device = %self.inner.config.name,
                did = %format_did(did),
                nrc = format!("0x{:02X}", d[3]),
                "negative response to write"
            );
            return Some(self.finish(eng, Outcome::NegativeResponse { nrc: d[3] }, None));
        }

        Some(self.finish(eng, Outcome::BadFrame, None))
    }

    /// Decode and (mode permitting) publish a completed read.
    fn complete_read(&self, eng: &mut Engine, payload: Vec<u8>) -> ExchangeReport {
        let did = eng.transfer.as_ref().map(|t| t.did).unwrap_or_default();
        let op_mode = *self.inner.op_mode.read();
        let (id, value) = if op_mode.publishes() {
            self.inner.sink.publish(did, &payload)
        } else {
            self.inner.sink.decode_only(did, &payload)
        };
        debug!(
            device = %self.inner.config.name,
            did = %format_did(did),
            id = %id,
            len = payload.len(),
            "read complete"
        );
        self.finish(eng, Outcome::Ok, Some((id, payload.len(), value)))
    }

    /// Close the in-flight exchange: release the engine, apply the
    /// cool-down, update statistics, trigger the SID-0x77 retry where it
    /// applies, and build the callback report.
    fn finish(
        &self,
        eng: &mut Engine,
        outcome: Outcome,
        read: Option<(String, usize, Option<Value>)>,
    ) -> ExchangeReport {
        let inner = &self.inner;
        let transfer = eng.transfer.take();
        if let Some(handle) = eng.timeout_task.take() {
            handle.abort();
        }
        eng.state = SessionState::Idle;
        eng.cool_down_until = Some(Instant::now() + outcome.cool_down());

        let did = transfer.as_ref().map(|t| t.did).unwrap_or_default();

        {
            let mut stats = inner.stats.lock();
            match &outcome {
                Outcome::Ok => {
                    let elapsed = transfer
                        .as_ref()
                        .map(|t| t.started.elapsed())
                        .unwrap_or_default();
                    stats.record_ok(elapsed);
                }
                Outcome::Timeout => stats.record_timeout(did),
                Outcome::NegativeResponse { .. } => stats.record_negative(did),
                Outcome::DidMismatch { .. } | Outcome::BadFrame | Outcome::BadState => {
                    stats.record_bad_protocol(did)
                }
            }
        }
        self.publish_stats(false);

        // One automatic retry over SID 0x77 for rejected plain writes.
        if let (Outcome::NegativeResponse { nrc }, Some(t)) = (&outcome, transfer.as_ref()) {
            if t.mode == CommandMode::Write && *inner.op_mode.read() == OpMode::Normal {
                match &inner.fallback {
                    Some(fallback) => {
                        info!(
                            device = %inner.config.name,
                            did = %format_did(did),
                            nrc = format!("0x{:02X}", nrc),
                            "write rejected, retrying via SID 0x77"
                        );
                        let _ = fallback.send(FallbackRequest {
                            base_tx: inner.config.tx_id,
                            did,
                            payload: t.value.clone(),
                        });
                    }
                    None => {
                        debug!(device = %inner.config.name, "no supervisor, SID-0x77 retry skipped");
                    }
                }
            }
        }

        let (id, len, value) = match read {
            Some((id, len, value)) => (id, len, value),
            None => {
                let len = transfer
                    .as_ref()
                    .map(|t| if t.value.is_empty() { t.rx.len() } else { t.value.len() })
                    .unwrap_or(0);
                (inner.sink.symbolic_id(did), len, None)
            }
        };

        ExchangeReport {
            outcome,
            did,
            id,
            len,
            value,
        }
    }

    fn deliver(&self, report: ExchangeReport) {
        let cb = self.inner.callback.read().clone();
        if let Some(cb) = cb {
            cb(report);
        }
    }

    /// Arm the per-exchange timeout and bump the generation so stale timers
    /// cannot fire into a later exchange.
    fn arm_timeout(&self, eng: &mut Engine) {
        eng.generation = eng.generation.wrapping_add(1);
        let generation = eng.generation;
        let timeout = Duration::from_millis(self.inner.config.timeout_ms);
        let session = self.clone();
        eng.timeout_task = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            session.on_timeout(generation);
        }));
    }

    fn on_timeout(&self, generation: u64) {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return;
        }
        let report = {
            let mut eng = self.inner.engine.lock();
            if eng.generation != generation || eng.state == SessionState::Idle {
                return;
            }
            warn!(
                device = %self.inner.config.name,
                did = eng.transfer.as_ref().map(|t| format_did(t.did)).unwrap_or_default(),
                "exchange timed out"
            );
            self.finish(&mut eng, Outcome::Timeout, None)
        };
        self.deliver(report);
    }

    /// A lost channel stops the session; the abandoned exchange fires no
    /// callback.
    fn channel_failure(&self, eng: &mut Engine, err: ChannelError) {
        error!(
            device = %self.inner.config.name,
            error = %err,
            "CAN channel failure, stopping session"
        );
        if let Some(handle) = eng.timeout_task.take() {
            handle.abort();
        }
        eng.transfer = None;
        eng.state = SessionState::Idle;
        self.inner.stopped.store(true, Ordering::SeqCst);
    }
}

fn take_payload(eng: &mut Engine) -> Vec<u8> {
    match eng.transfer.as_mut() {
        Some(t) => {
            let mut payload = std::mem::take(&mut t.rx);
            payload.truncate(t.expected_len);
            payload
        }
        None => Vec::new(),
    }
}
