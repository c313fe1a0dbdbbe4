//! Message loop integration.
//!
//! A single loop thread owns every dispatcher mutation. It multiplexes:
//! the MPSC inbox of freshly built entries, the disconnection queue, the
//! augmentor UDP socket, and the periodic expiry/stats timers. Producer
//! threads only build entries against the published snapshot and push them
//! onto the inbox.
//!
//! Callbacks always fire with no dispatcher lock held, so `on_finished`
//! may call straight back into the loop.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use minstant::Instant;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use thiserror::Error;

use crate::auction::{AuctionId, AugmentationInfo};
use crate::dispatch::{compute_dispatch_set, Dispatcher, Entry, IdleGate, OnFinished};
use crate::directory::SnapshotReader;
use crate::metrics::EventSink;
use crate::net::{Endpoint, UdpSocket};
use crate::sync::mpsc;
use crate::trace::{debug, info, warn};

const SOCKET: Token = Token(0);
const WAKER: Token = Token(1);

/// Tuning knobs for the augmentation loop.
pub struct LoopConfig {
    /// Capacity of the entry inbox. Producers block when it fills; the
    /// size makes that a load-shedding signal, not a steady state.
    pub inbox_capacity: usize,
    /// Capacity of the disconnection notice queue.
    pub disconnection_capacity: usize,
    /// Cadence of the expiry sweep (and the poll timeout).
    pub expiry_interval: Duration,
    /// Cadence of the in-flight gauge pass.
    pub stats_interval: Duration,
    /// In-flight budget for CONFIG frames that omit one.
    pub default_max_in_flight: u32,
    /// When set, instances silent for this long are disconnected. The
    /// default leaves lost instances to worker reconnection, matching the
    /// expire-naturally policy.
    pub worker_timeout: Option<Duration>,
    /// Receive buffer requested on the augmentor socket.
    pub socket_recv_buffer: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            inbox_capacity: 65_536,
            disconnection_capacity: 1_024,
            expiry_interval: Duration::from_millis(1),
            stats_interval: Duration::from_millis(977),
            default_max_in_flight: 3_000,
            worker_timeout: None,
            socket_recv_buffer: 2 * 1024 * 1024,
        }
    }
}

/// Errors starting the augmentation loop.
#[derive(Debug, Error)]
pub enum LoopError {
    /// Transport bind failure; fatal at startup.
    #[error("error while binding augmentation endpoint {endpoint}: {source}")]
    Bind {
        endpoint: Endpoint,
        source: io::Error,
    },
    /// `start()` called before `bind_augmentors()` (or twice).
    #[error("augmentor endpoint not bound")]
    NotBound,
    /// Poller setup failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

struct Disconnection {
    addr: Endpoint,
    augmentor: Option<String>,
}

/// The augmentation dispatcher's public handle.
///
/// `augment()` is callable from any thread; everything else follows the
/// single-loop-thread model described in the crate docs.
pub struct AugmentationLoop {
    config: LoopConfig,
    core: Arc<Mutex<Dispatcher>>,
    sink: Arc<dyn EventSink>,
    snapshot: SnapshotReader,
    idle_gate: Arc<IdleGate>,
    inbox_tx: mpsc::Producer<Entry>,
    inbox_rx: Option<mpsc::Consumer<Entry>>,
    disconnect_tx: mpsc::Producer<Disconnection>,
    disconnect_rx: Option<mpsc::Consumer<Disconnection>>,
    socket: Option<UdpSocket>,
    local_addr: Option<Endpoint>,
    waker: Option<Arc<Waker>>,
    shutdown_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl AugmentationLoop {
    #[must_use]
    pub fn new(config: LoopConfig, sink: Arc<dyn EventSink>) -> Self {
        let dispatcher = Dispatcher::new(Arc::clone(&sink), config.default_max_in_flight);
        let snapshot = dispatcher.snapshot_reader();
        let idle_gate = dispatcher.idle_gate();
        let (inbox_tx, inbox_rx) = mpsc::channel(config.inbox_capacity);
        let (disconnect_tx, disconnect_rx) = mpsc::channel(config.disconnection_capacity);

        Self {
            config,
            core: Arc::new(Mutex::new(dispatcher)),
            sink,
            snapshot,
            idle_gate,
            inbox_tx,
            inbox_rx: Some(inbox_rx),
            disconnect_tx,
            disconnect_rx: Some(disconnect_rx),
            socket: None,
            local_addr: None,
            waker: None,
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    /// Binds the augmentor bus socket.
    ///
    /// # Errors
    ///
    /// Fails with [`LoopError::Bind`] on address conflict or permission
    /// problems. Returns the bound address (useful with port 0).
    pub fn bind_augmentors(&mut self, endpoint: Endpoint) -> Result<Endpoint, LoopError> {
        let socket = UdpSocket::bind(endpoint).map_err(|source| LoopError::Bind {
            endpoint,
            source,
        })?;
        if let Err(_err) = socket.set_recv_buffer_size(self.config.socket_recv_buffer) {
            // The kernel may clamp this; not fatal.
            warn!(error = %_err, "could not size augmentor socket receive buffer");
        }
        let local = socket.local_addr().map_err(|source| LoopError::Bind {
            endpoint,
            source,
        })?;
        info!(%local, "augmentor bus bound");
        self.socket = Some(socket);
        self.local_addr = Some(local);
        Ok(local)
    }

    /// The bound augmentor bus address, once bound.
    #[must_use]
    pub fn local_addr(&self) -> Option<Endpoint> {
        self.local_addr
    }

    /// Starts the loop thread.
    ///
    /// # Errors
    ///
    /// Fails with [`LoopError::NotBound`] unless [`bind_augmentors`] ran
    /// first, or with an I/O error if the poller cannot be created.
    ///
    /// [`bind_augmentors`]: AugmentationLoop::bind_augmentors
    ///
    /// # Panics
    ///
    /// Panics if the loop thread cannot be spawned.
    pub fn start(&mut self) -> Result<(), LoopError> {
        let mut socket = self.socket.take().ok_or(LoopError::NotBound)?;
        let inbox = self.inbox_rx.take().ok_or(LoopError::NotBound)?;
        let disconnections = self.disconnect_rx.take().ok_or(LoopError::NotBound)?;

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut socket, SOCKET, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        self.waker = Some(Arc::clone(&waker));

        let mut loop_thread = LoopThread {
            core: Arc::clone(&self.core),
            inbox,
            disconnections,
            socket,
            poll,
            events: Events::with_capacity(64),
            recv_buf: vec![0u8; 64 * 1024].into_boxed_slice(),
            expiry_interval: self.config.expiry_interval,
            stats_interval: self.config.stats_interval,
            worker_timeout: self.config.worker_timeout,
            shutdown: Arc::clone(&self.shutdown_flag),
        };

        let handle = thread::Builder::new()
            .name("augur-loop".into())
            .spawn(move || {
                info!("augmentation loop started");
                loop_thread.run();
                info!("augmentation loop exiting");
            })
            .expect("failed to spawn loop thread");
        self.handle = Some(handle);
        Ok(())
    }

    /// Queues one auction for augmentation. Thread-safe.
    ///
    /// When no required augmentor is registered the callback fires
    /// synchronously on this thread; otherwise the entry rides the inbox
    /// and the callback fires on the loop thread, exactly once, by the
    /// deadline at the latest.
    pub fn augment(
        &self,
        info: Arc<AugmentationInfo>,
        timeout: Instant,
        on_finished: impl FnOnce(Arc<AugmentationInfo>) + Send + 'static,
    ) {
        let on_finished: OnFinished = Box::new(on_finished);

        let needed = info.required_augmentors();

        let dispatch = if needed.is_empty() {
            Default::default()
        } else {
            // Snapshot read: no dispatcher lock on this path.
            let snapshot = self.snapshot.load();
            compute_dispatch_set(&needed, &snapshot, self.sink.as_ref())
        };

        if dispatch.is_empty() {
            // No augmentors required or none available: run straight away.
            on_finished(info);
            return;
        }

        let entry = Entry::new(info, dispatch, timeout, on_finished);
        // Ordering matters: the gate must see the entry as queued before
        // the loop thread can possibly drain it.
        self.idle_gate.enqueued();

        // Inbox back-pressure is the one place augment() may block.
        if self
            .inbox_tx
            .push_blocking(entry, mpsc::Timeout::Infinite)
            .is_err()
        {
            unreachable!("infinite push cannot time out");
        }

        if let Some(waker) = &self.waker {
            let _ = waker.wake();
        }
    }

    /// Reports a worker address as gone (service-discovery hook). Drained
    /// on the loop thread into the disconnection sweep.
    pub fn notify_disconnection(&self, addr: Endpoint, augmentor: Option<String>) {
        let notice = Disconnection { addr, augmentor };
        if self.disconnect_tx.push(notice).is_err() {
            warn!(%addr, "disconnection queue full, dropping notice");
        }
        if let Some(waker) = &self.waker {
            let _ = waker.wake();
        }
    }

    /// Loop-thread-consistent membership test.
    #[must_use]
    pub fn currently_augmenting(&self, id: &AuctionId) -> bool {
        self.core.lock().currently_augmenting(id)
    }

    /// Current count of pending entries.
    #[must_use]
    pub fn num_augmenting(&self) -> usize {
        self.core.lock().num_augmenting()
    }

    /// Parks until the deadline index is empty and nothing just dispatched
    /// is still in flight. Test and shutdown helper.
    pub fn sleep_until_idle(&self) {
        self.idle_gate.wait_idle();
    }

    /// Stops the message loop, then the transport. Entries still pending
    /// are not force-expired; their callbacks may never fire.
    pub fn shutdown(&mut self) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
        if let Some(waker) = &self.waker {
            let _ = waker.wake();
        }
        if let Some(handle) = self.handle.take() {
            debug!("waiting for loop thread to exit");
            let _ = handle.join();
        }
    }
}

impl Drop for AugmentationLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// State owned by the loop thread.
struct LoopThread {
    core: Arc<Mutex<Dispatcher>>,
    inbox: mpsc::Consumer<Entry>,
    disconnections: mpsc::Consumer<Disconnection>,
    socket: UdpSocket,
    poll: Poll,
    events: Events,
    recv_buf: Box<[u8]>,
    expiry_interval: Duration,
    stats_interval: Duration,
    worker_timeout: Option<Duration>,
    shutdown: Arc<AtomicBool>,
}

impl LoopThread {
    fn run(&mut self) {
        let mut last_stats = Instant::now();

        while !self.shutdown.load(Ordering::Relaxed) {
            if let Err(err) = self.poll.poll(&mut self.events, Some(self.expiry_interval)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!(error = %err, "poll failed, stopping loop");
                break;
            }

            self.drain_disconnections();
            self.drain_inbox();
            self.drain_socket();

            let completions = self.core.lock().check_expiries(Instant::now());
            for completion in completions {
                completion.fire();
            }

            let now = Instant::now();
            if now.duration_since(last_stats) >= self.stats_interval {
                last_stats = now;
                let mut core = self.core.lock();
                core.record_stats();
                if let Some(timeout) = self.worker_timeout {
                    core.reap_stale_instances(now, timeout);
                }
            }
        }
    }

    fn drain_disconnections(&mut self) {
        while let Some(notice) = self.disconnections.pop() {
            self.core
                .lock()
                .do_disconnection(notice.addr, notice.augmentor.as_deref());
        }
    }

    fn drain_inbox(&mut self) {
        while let Some(entry) = self.inbox.pop() {
            self.core
                .lock()
                .do_augmentation(entry, &mut self.socket, Instant::now());
        }
    }

    fn drain_socket(&mut self) {
        loop {
            let received = self.socket.try_recv_from(&mut self.recv_buf);
            match received {
                Ok(Some((len, from))) => {
                    let completion = {
                        let mut core = self.core.lock();
                        let (socket, buf) = (&mut self.socket, &self.recv_buf[..len]);
                        core.handle_worker_frame(from, buf, socket, Instant::now())
                    };
                    if let Some(completion) = completion {
                        completion.fire();
                    }
                }
                Ok(None) => break,
                Err(_err) => {
                    warn!(error = %_err, "augmentor socket receive failed");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auction::Auction;
    use crate::metrics::CountingSink;
    use std::sync::atomic::AtomicUsize;

    fn empty_info(id: u64) -> Arc<AugmentationInfo> {
        Arc::new(AugmentationInfo {
            auction: Auction::new(AuctionId::from(id), "{}", "openrtb"),
            potential_groups: Vec::new(),
        })
    }

    #[test]
    fn augment_with_no_groups_fires_synchronously() {
        let sink = Arc::new(CountingSink::new());
        let aug_loop = AugmentationLoop::new(LoopConfig::default(), sink);

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        aug_loop.augment(
            empty_info(1),
            Instant::now() + Duration::from_millis(10),
            move |_info| {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            },
        );

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(aug_loop.num_augmenting(), 0);
    }

    #[test]
    fn augment_with_unregistered_augmentors_fires_synchronously() {
        use crate::auction::{AgentConfig, BidderGroup, PotentialBidder};
        use crate::compact::CompactVec;

        let sink = Arc::new(CountingSink::new());
        let aug_loop = AugmentationLoop::new(LoopConfig::default(), sink);

        let mut group: BidderGroup = CompactVec::new();
        group.push(PotentialBidder {
            agent: "a".to_string(),
            config: Arc::new(AgentConfig {
                augmentors: ["geo".to_string()].into_iter().collect(),
            }),
        });
        let info = Arc::new(AugmentationInfo {
            auction: Auction::new(AuctionId::from(2), "{}", "openrtb"),
            potential_groups: vec![group],
        });

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        aug_loop.augment(
            info,
            Instant::now() + Duration::from_millis(10),
            move |_info| {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            },
        );

        // "geo" is required but nobody registered it: synchronous callback,
        // nothing enqueued.
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(aug_loop.num_augmenting(), 0);
    }

    #[test]
    fn start_before_bind_fails() {
        let sink = Arc::new(CountingSink::new());
        let mut aug_loop = AugmentationLoop::new(LoopConfig::default(), sink);
        assert!(matches!(aug_loop.start(), Err(LoopError::NotBound)));
    }

    #[test]
    fn bind_conflict_reports_bind_error() {
        let sink = Arc::new(CountingSink::new());
        let mut first =
            AugmentationLoop::new(LoopConfig::default(), Arc::clone(&sink) as Arc<dyn EventSink>);
        let addr = first.bind_augmentors(Endpoint::localhost(0)).unwrap();

        let mut second = AugmentationLoop::new(LoopConfig::default(), sink);
        assert!(matches!(
            second.bind_augmentors(addr),
            Err(LoopError::Bind { .. })
        ));
    }

    #[test]
    fn sleep_until_idle_returns_when_nothing_pending() {
        let sink = Arc::new(CountingSink::new());
        let aug_loop = AugmentationLoop::new(LoopConfig::default(), sink);
        aug_loop.sleep_until_idle();
    }
}
