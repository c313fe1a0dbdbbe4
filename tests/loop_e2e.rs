//! End-to-end tests for the augmentation loop over loopback UDP.
//!
//! These tests verify the complete flow:
//! 1. A fake worker sends CONFIG and receives CONFIGOK
//! 2. A caller submits an auction via `augment()`
//! 3. The worker receives the AUGMENT frame and replies RESPONSE
//! 4. The caller's callback fires with the merged augmentations
//!
//! # Running with tracing
//!
//! ```bash
//! RUST_LOG=augur=debug cargo test --features tracing e2e -- --nocapture
//! ```

use std::net::UdpSocket as StdUdpSocket;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::channel;
use std::sync::{Arc, Once};
use std::time::Duration;

use minstant::Instant;
use serial_test::serial;

use augur::auction::{AgentConfig, Auction, AugmentationInfo, AuctionId, BidderGroup, PotentialBidder};
use augur::compact::CompactVec;
use augur::metrics::CountingSink;
use augur::net::Endpoint;
use augur::protocol::{decode_parts, encode_parts};
use augur::runtime::{AugmentationLoop, LoopConfig};

static INIT_TRACING: Once = Once::new();

fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        augur::init_tracing();
    });
}

/// A scripted augmentor worker on a plain std socket.
struct FakeWorker {
    socket: StdUdpSocket,
    loop_addr: Endpoint,
}

impl FakeWorker {
    fn connect(loop_addr: Endpoint) -> Self {
        let socket = StdUdpSocket::bind("127.0.0.1:0").expect("bind worker socket");
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("set read timeout");
        Self { socket, loop_addr }
    }

    fn send(&self, parts: &[&[u8]]) {
        let mut buf = Vec::new();
        encode_parts(parts, &mut buf);
        self.socket
            .send_to(&buf, self.loop_addr.as_socket_addr())
            .expect("send frame");
    }

    fn recv(&self) -> Vec<Vec<u8>> {
        let mut buf = [0u8; 64 * 1024];
        let (len, _from) = self.socket.recv_from(&mut buf).expect("worker recv");
        decode_parts(&buf[..len])
            .expect("well-formed frame")
            .into_iter()
            .map(<[u8]>::to_vec)
            .collect()
    }

    /// Registers with the loop and waits for the CONFIGOK acknowledgement.
    fn register(&self, name: &str, max_in_flight: &str) {
        self.send(&[b"CONFIG", b"1.0", name.as_bytes(), max_in_flight.as_bytes()]);
        let reply = self.recv();
        assert_eq!(reply[0], b"CONFIGOK");
    }
}

fn info_requiring(id: u64, augmentors: &[&str]) -> Arc<AugmentationInfo> {
    let mut group: BidderGroup = CompactVec::new();
    group.push(PotentialBidder {
        agent: "agent-1".to_string(),
        config: Arc::new(AgentConfig {
            augmentors: augmentors.iter().map(|s| s.to_string()).collect(),
        }),
    });
    Arc::new(AugmentationInfo {
        auction: Auction::new(AuctionId::from(id), r#"{"imp":[]}"#, "openrtb"),
        potential_groups: vec![group],
    })
}

fn started_loop(sink: &Arc<CountingSink>) -> AugmentationLoop {
    let mut aug_loop = AugmentationLoop::new(
        LoopConfig::default(),
        Arc::clone(sink) as Arc<dyn augur::metrics::EventSink>,
    );
    aug_loop
        .bind_augmentors(Endpoint::localhost(0))
        .expect("bind loop socket");
    aug_loop.start().expect("start loop");
    aug_loop
}

/// Polls a condition until it holds or the deadline passes.
fn wait_for(mut cond: impl FnMut() -> bool, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[test]
#[serial]
fn e2e_config_augment_response_callback() {
    init_test_tracing();

    let sink = Arc::new(CountingSink::new());
    let mut aug_loop = started_loop(&sink);
    let loop_addr = aug_loop.local_addr().unwrap();

    let worker = FakeWorker::connect(loop_addr);
    worker.register("geo", "10");

    let info = info_requiring(1, &["geo"]);
    let (done_tx, done_rx) = channel();
    aug_loop.augment(
        Arc::clone(&info),
        Instant::now() + Duration::from_secs(2),
        move |finished| {
            done_tx.send(finished).expect("report completion");
        },
    );

    // Worker side: one AUGMENT frame.
    let frame = worker.recv();
    assert_eq!(frame[0], b"AUGMENT");
    assert_eq!(frame[1], b"1.0");
    assert_eq!(frame[2], b"geo");
    assert_eq!(frame[3], b"1");
    assert_eq!(frame[4], b"openrtb");
    let agents = augur::protocol::decode_agent_set(&frame[6]).expect("agent set decodes");
    assert!(agents.contains("agent-1"));

    // Echo the send timestamp back in the RESPONSE.
    worker.send(&[
        b"RESPONSE",
        b"1.0",
        &frame[7],
        b"1",
        b"geo",
        br#"{"tags":["x"]}"#,
    ]);

    let finished = done_rx
        .recv_timeout(Duration::from_secs(3))
        .expect("callback fired");
    let merged = finished.auction.augmentations();
    assert!(merged["geo"].get("").unwrap().tags.contains("x"));

    aug_loop.sleep_until_idle();
    assert_eq!(aug_loop.num_augmenting(), 0);
    assert_eq!(sink.counter("augmentation.request"), 1);
    assert_eq!(sink.counter("augmentation.response"), 1);

    aug_loop.shutdown();
}

#[test]
#[serial]
fn e2e_timeout_fires_callback_and_counts_expiry() {
    init_test_tracing();

    let sink = Arc::new(CountingSink::new());
    let mut aug_loop = started_loop(&sink);
    let loop_addr = aug_loop.local_addr().unwrap();

    let worker = FakeWorker::connect(loop_addr);
    worker.register("geo", "10");

    let fired = Arc::new(AtomicUsize::new(0));
    let fired_clone = Arc::clone(&fired);
    let info = info_requiring(7, &["geo"]);
    aug_loop.augment(
        Arc::clone(&info),
        Instant::now() + Duration::from_millis(30),
        move |_finished| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        },
    );

    // The worker sees the AUGMENT frame but never answers.
    let frame = worker.recv();
    assert_eq!(frame[0], b"AUGMENT");

    wait_for(|| fired.load(Ordering::SeqCst) == 1, "expiry callback");
    assert!(info.auction.augmentations().is_empty());
    assert_eq!(sink.counter("augmentor.geo.expiredTooLate"), 1);
    assert_eq!(aug_loop.num_augmenting(), 0);

    // A response arriving after expiry is counted as unknown, no callback.
    worker.send(&[b"RESPONSE", b"1.0", &frame[7], b"7", b"geo", b"null"]);
    wait_for(
        || sink.counter("augmentation.unknown") == 1,
        "late response accounting",
    );
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    aug_loop.shutdown();
}

#[test]
#[serial]
fn e2e_load_balances_across_instances() {
    init_test_tracing();

    let sink = Arc::new(CountingSink::new());
    let mut aug_loop = started_loop(&sink);
    let loop_addr = aug_loop.local_addr().unwrap();

    let worker_a = FakeWorker::connect(loop_addr);
    let worker_b = FakeWorker::connect(loop_addr);
    worker_a.register("geo", "1");
    worker_b.register("geo", "1");

    let fired = Arc::new(AtomicUsize::new(0));
    for id in [1u64, 2] {
        let fired_clone = Arc::clone(&fired);
        aug_loop.augment(
            info_requiring(id, &["geo"]),
            Instant::now() + Duration::from_millis(200),
            move |_finished| {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            },
        );
    }

    // Each instance has budget 1, so each sees exactly one AUGMENT.
    let frame_a = worker_a.recv();
    let frame_b = worker_b.recv();
    assert_eq!(frame_a[0], b"AUGMENT");
    assert_eq!(frame_b[0], b"AUGMENT");

    // Both entries expire unanswered; the dispatcher survives and the
    // callbacks fire exactly once each.
    wait_for(|| fired.load(Ordering::SeqCst) == 2, "both expiries");

    aug_loop.shutdown();
}
