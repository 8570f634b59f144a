//! Per-session exchange statistics

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

/// Statistics are published at most this often, unless forced.
pub const MIN_PUBLISH_INTERVAL: Duration = Duration::from_millis(5000);

/// Counters and reply-time aggregates for one session.
#[derive(Debug, Default)]
pub struct Statistics {
    cnt_total: u32,
    cnt_ok: u32,
    cnt_negative_resp: u32,
    cnt_timeout: u32,
    cnt_bad_protocol: u32,
    cnt_overlap: u32,
    per_did_failures: HashMap<u16, u32>,
    reply_min_ms: Option<u64>,
    reply_max_ms: Option<u64>,
    reply_sum_ms: u64,
    last_publish: Option<Instant>,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// An exchange left the queue and hit the wire.
    pub fn record_started(&mut self) {
        self.cnt_total += 1;
    }

    pub fn record_ok(&mut self, reply: Duration) {
        self.cnt_ok += 1;
        let ms = reply.as_millis() as u64;
        self.reply_min_ms = Some(self.reply_min_ms.map_or(ms, |m| m.min(ms)));
        self.reply_max_ms = Some(self.reply_max_ms.map_or(ms, |m| m.max(ms)));
        self.reply_sum_ms += ms;
    }

    pub fn record_timeout(&mut self, did: u16) {
        self.cnt_timeout += 1;
        *self.per_did_failures.entry(did).or_insert(0) += 1;
    }

    pub fn record_negative(&mut self, did: u16) {
        self.cnt_negative_resp += 1;
        *self.per_did_failures.entry(did).or_insert(0) += 1;
    }

    pub fn record_bad_protocol(&mut self, did: u16) {
        self.cnt_bad_protocol += 1;
        *self.per_did_failures.entry(did).or_insert(0) += 1;
    }

    /// Count a dropped re-entrant inbound frame; returns the new total so
    /// the caller can decide whether to log.
    pub fn record_overlap(&mut self) -> u32 {
        self.cnt_overlap += 1;
        self.cnt_overlap
    }

    pub fn overlap_count(&self) -> u32 {
        self.cnt_overlap
    }

    pub fn ok_count(&self) -> u32 {
        self.cnt_ok
    }

    pub fn timeout_count(&self) -> u32 {
        self.cnt_timeout
    }

    pub fn failures_for(&self, did: u16) -> u32 {
        self.per_did_failures.get(&did).copied().unwrap_or(0)
    }

    /// Whether a publish is due; updates the throttle timestamp when it is.
    pub fn should_publish(&mut self, force: bool) -> bool {
        let due = force
            || self
                .last_publish
                .map_or(true, |t| t.elapsed() >= MIN_PUBLISH_INTERVAL);
        if due {
            self.last_publish = Some(Instant::now());
        }
        due
    }

    /// Snapshot as a JSON blob for the state store.
    pub fn to_json(&self) -> Value {
        let mean = if self.cnt_ok > 0 {
            Some(self.reply_sum_ms / self.cnt_ok as u64)
        } else {
            None
        };
        let failures: serde_json::Map<String, Value> = self
            .per_did_failures
            .iter()
            .map(|(did, n)| (format!("{:04X}", did), json!(n)))
            .collect();

        json!({
            "ts": chrono::Utc::now().to_rfc3339(),
            "cnt_total": self.cnt_total,
            "cnt_ok": self.cnt_ok,
            "cnt_negative_resp": self.cnt_negative_resp,
            "cnt_timeout": self.cnt_timeout,
            "cnt_bad_protocol": self.cnt_bad_protocol,
            "cnt_overlap": self.cnt_overlap,
            "per_did_failures": failures,
            "reply_time": {
                "min_ms": self.reply_min_ms,
                "max_ms": self.reply_max_ms,
                "mean_ms": mean,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_time_aggregates() {
        let mut stats = Statistics::new();
        stats.record_started();
        stats.record_ok(Duration::from_millis(40));
        stats.record_started();
        stats.record_ok(Duration::from_millis(60));

        let blob = stats.to_json();
        assert_eq!(blob["cnt_total"], json!(2));
        assert_eq!(blob["cnt_ok"], json!(2));
        assert_eq!(blob["reply_time"]["min_ms"], json!(40));
        assert_eq!(blob["reply_time"]["max_ms"], json!(60));
        assert_eq!(blob["reply_time"]["mean_ms"], json!(50));
    }

    #[test]
    fn test_per_did_failures() {
        let mut stats = Statistics::new();
        stats.record_timeout(0x018C);
        stats.record_timeout(0x018C);
        stats.record_negative(0x0256);

        assert_eq!(stats.failures_for(0x018C), 2);
        assert_eq!(stats.failures_for(0x0256), 1);
        assert_eq!(stats.to_json()["per_did_failures"]["018C"], json!(2));
    }

    #[test]
    fn test_publish_throttle() {
        let mut stats = Statistics::new();
        assert!(stats.should_publish(false));
        // within the interval only a forced publish goes through
        assert!(!stats.should_publish(false));
        assert!(stats.should_publish(true));
    }
}
