//! Supervisor tests: frame routing and the SID-0x77 write retry path

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

use e3can_conv::DidCatalog;
use e3can_core::MemoryStore;
use e3can_uds::channel::mock::MockChannel;
use e3can_uds::{CanFrame, DeviceConfig, ExchangeReport, Outcome, Supervisor};

const TX: u16 = 0x680;
const RX: u16 = 0x690;
const TX77: u16 = 0x682;
const RX77: u16 = 0x692;

const CATALOG: &str = r#"
meta: { version: "0.6.2" }
dids:
  "0x018C":
    id: FlowTempSensor
    codec: int
    len: 2
    args: { signed: true, scale: 0.1, byte_order: little }
  "0x01A8":
    id: DomesticHotWaterSetpoint
    codec: int
    len: 2
    args: { scale: 0.1 }
writable:
  - "0x01A8"
"#;

struct Harness {
    channel: Arc<MockChannel>,
    supervisor: Supervisor,
    sent: broadcast::Receiver<CanFrame>,
    reports: mpsc::UnboundedReceiver<ExchangeReport>,
}

impl Harness {
    fn new() -> Self {
        let channel = Arc::new(MockChannel::new());
        let store = Arc::new(MemoryStore::new());
        let catalog = Arc::new(DidCatalog::from_yaml(CATALOG).unwrap());

        let supervisor = Supervisor::new(channel.clone(), store, "e3can");
        let session = supervisor
            .add_device(DeviceConfig::new("vitocal", TX), catalog)
            .unwrap();

        let (report_tx, reports) = mpsc::unbounded_channel();
        session.set_callback(Arc::new(move |report| {
            let _ = report_tx.send(report);
        }));

        let sent = channel.watch_sent();
        supervisor.start();

        Self {
            channel,
            supervisor,
            sent,
            reports,
        }
    }

    async fn next_sent(&mut self) -> CanFrame {
        timeout(Duration::from_secs(2), self.sent.recv())
            .await
            .expect("no outbound frame within 2s")
            .expect("outbound watch closed")
    }

    async fn next_report(&mut self) -> ExchangeReport {
        timeout(Duration::from_secs(2), self.reports.recv())
            .await
            .expect("no report within 2s")
            .expect("report channel closed")
    }
}

#[tokio::test]
async fn test_routing_by_rx_id() {
    let mut h = Harness::new();

    let session = h.supervisor.session(RX).unwrap();
    session.read_by_did(0x018C);

    let req = h.next_sent().await;
    assert_eq!(req.id, TX);

    // frames for other identifiers are ignored by the router
    h.channel.inject(CanFrame::new(0x555, [0x05, 0x62, 0x01, 0x8C, 0xC2, 0x01, 0x55, 0x55]));
    // the addressed frame completes the exchange
    h.channel.inject(CanFrame::new(RX, [0x05, 0x62, 0x01, 0x8C, 0xC2, 0x01, 0x55, 0x55]));

    let report = h.next_report().await;
    assert_eq!(report.outcome, Outcome::Ok);
    assert_eq!(report.value, Some(json!(45)));
}

#[tokio::test]
async fn test_negative_write_retries_via_0x77() {
    let mut h = Harness::new();

    let session = h.supervisor.session(RX).unwrap();
    session.write_by_did(0x01A8, vec![0x1E, 0x00]);

    let req = h.next_sent().await;
    assert_eq!(req.id, TX);
    assert_eq!(req.data, [0x05, 0x2E, 0x01, 0xA8, 0x1E, 0x00, 0x00, 0x00]);

    // device rejects: requestOutOfRange
    h.channel
        .inject(CanFrame::new(RX, [0x03, 0x7F, 0x2E, 0x31, 0x55, 0x55, 0x55, 0x55]));

    let report = h.next_report().await;
    assert_eq!(report.outcome, Outcome::NegativeResponse { nrc: 0x31 });

    // the supervisor spawns the companion session and re-issues the write
    // over SID 0x77: encapsulated block 43 01 82 A8 01 B2 + 2 value bytes,
    // length field (2 + 6) + 3 = 0x0B
    let ff = h.next_sent().await;
    assert_eq!(ff.id, TX77);
    assert_eq!(ff.data, [0x10, 0x0B, 0x77, 0x43, 0x01, 0x82, 0xA8, 0x01]);

    assert!(h.supervisor.session(RX77).is_some());

    // flow control with ST = 0x28 (40 ms)
    h.channel
        .inject(CanFrame::new(RX77, [0x30, 0x00, 0x28, 0x00, 0x00, 0x00, 0x00, 0x00]));

    let cf = h.next_sent().await;
    assert_eq!(cf.id, TX77);
    assert_eq!(cf.data, [0x21, 0xB2, 0x1E, 0x00, 0x55, 0x55, 0x55, 0x55]);

    tokio::time::sleep(Duration::from_millis(50)).await;

    // a foreign 0x77 frame without the completion marker is ignored
    h.channel
        .inject(CanFrame::new(RX77, [0x04, 0x77, 0x01, 0x00, 0x00, 0x55, 0x55, 0x55]));
    // the confirmation carries 0x44 at data[4]
    h.channel
        .inject(CanFrame::new(RX77, [0x04, 0x77, 0xA8, 0x01, 0x44, 0x55, 0x55, 0x55]));

    let report = h.next_report().await;
    assert_eq!(report.outcome, Outcome::Ok);
    assert_eq!(report.did, 0x01A8);
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let h = Harness::new();

    h.supervisor.stop();
    h.supervisor.stop();

    // the registry survives; pushes are still accepted on a stopped session
    let session = h.supervisor.session(RX).expect("session still registered");
    session.read_by_did(0x018C);
    assert_eq!(session.queued(), 1);
}

#[tokio::test]
async fn test_duplicate_device_rejected() {
    let channel = Arc::new(MockChannel::new());
    let store = Arc::new(MemoryStore::new());
    let catalog = Arc::new(DidCatalog::from_yaml(CATALOG).unwrap());

    let supervisor = Supervisor::new(channel, store, "e3can");
    supervisor
        .add_device(DeviceConfig::new("vitocal", TX), catalog.clone())
        .unwrap();

    let err = supervisor
        .add_device(DeviceConfig::new("clone", TX), catalog)
        .unwrap_err();
    assert!(matches!(
        err,
        e3can_uds::AdapterError::DuplicateSession(id) if id == RX
    ));
}
