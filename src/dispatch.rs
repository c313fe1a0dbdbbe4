//! Dispatch core: the augment / response / expire / disconnect / config
//! state machine.
//!
//! All mutation happens on the loop thread under the runtime's core lock.
//! Handlers never invoke caller callbacks themselves — they hand back
//! [`Completion`]s which the runtime fires after releasing the lock, so a
//! callback that re-enters the dispatcher cannot deadlock.
//!
//! Per-entry lifecycle:
//!
//! ```text
//! queued --inbox drain--> pending --last response--> completed
//!                            |
//!                            +------deadline--------> expired
//! ```
//!
//! `completed` and `expired` both fire the caller's callback exactly once;
//! the callback is owned by the entry and consumed when it fires, so a
//! second invocation is unrepresentable.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use minstant::Instant;
use parking_lot::{Condvar, Mutex};

use crate::auction::{AugmentationInfo, AugmentationList, AugmentationParseError, AuctionId};
use crate::deadline::DeadlineIndex;
use crate::directory::{AugmentorSnapshot, Directory, SnapshotReader};
use crate::metrics::EventSink;
use crate::net::{Endpoint, Transport};
use crate::protocol::{self, ConfigFrame, ResponseFrame, WorkerMessage};
use crate::trace::{debug, info, warn};

/// Completion callback, invoked exactly once with the caller's info.
pub type OnFinished = Box<dyn FnOnce(Arc<AugmentationInfo>) + Send>;

/// Per-auction bookkeeping record.
pub struct Entry {
    pub info: Arc<AugmentationInfo>,
    /// Augmentor names still expected to respond.
    pub outstanding: BTreeSet<String>,
    /// Absolute deadline.
    pub timeout: Instant,
    on_finished: OnFinished,
}

impl Entry {
    #[must_use]
    pub fn new(
        info: Arc<AugmentationInfo>,
        outstanding: BTreeSet<String>,
        timeout: Instant,
        on_finished: OnFinished,
    ) -> Self {
        Self {
            info,
            outstanding,
            timeout,
            on_finished,
        }
    }

    fn into_completion(self) -> Completion {
        Completion {
            info: self.info,
            on_finished: self.on_finished,
        }
    }
}

/// A callback ready to fire, detached from all dispatcher state.
///
/// Fire these after releasing the core lock.
pub struct Completion {
    info: Arc<AugmentationInfo>,
    on_finished: OnFinished,
}

impl Completion {
    pub fn fire(self) {
        (self.on_finished)(self.info);
    }
}

/// Parks `sleep_until_idle` callers until the index drains and no
/// just-dispatched entry is still sitting on the inbox.
pub(crate) struct IdleGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

struct GateState {
    idle: bool,
    /// Entries pushed onto the inbox but not yet drained into the index.
    /// While nonzero, an expiry sweep on a momentarily empty index must
    /// not flip the gate back to idle.
    queued: usize,
}

impl IdleGate {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                idle: true,
                queued: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// An entry was pushed onto the inbox.
    pub(crate) fn enqueued(&self) {
        let mut state = self.state.lock();
        state.queued += 1;
        state.idle = false;
    }

    /// An entry left the inbox and reached the dispatcher. Saturating so
    /// entries handed to the dispatcher directly stay accounted for.
    pub(crate) fn drained(&self) {
        let mut state = self.state.lock();
        state.queued = state.queued.saturating_sub(1);
        state.idle = false;
    }

    /// The index drained; wakes parked waiters unless entries are still
    /// queued.
    pub(crate) fn set_idle(&self) {
        let mut state = self.state.lock();
        if state.queued == 0 {
            state.idle = true;
            self.cond.notify_all();
        }
    }

    pub(crate) fn wait_idle(&self) {
        let mut state = self.state.lock();
        while !state.idle {
            self.cond.wait(&mut state);
        }
    }

    #[cfg(test)]
    pub(crate) fn is_idle(&self) -> bool {
        self.state.lock().idle
    }
}

/// Computes `needed ∩ registered` by a single linear merge of two
/// name-sorted sequences, recording request counters for each match.
#[must_use]
pub fn compute_dispatch_set(
    needed: &BTreeSet<String>,
    snapshot: &AugmentorSnapshot,
    sink: &dyn EventSink,
) -> BTreeSet<String> {
    let mut dispatch = BTreeSet::new();
    let mut required = needed.iter().peekable();
    let mut available = snapshot.names().peekable();

    loop {
        match (required.peek(), available.peek()) {
            (Some(req), Some(avail)) => match req.as_str().cmp(avail) {
                Ordering::Equal => {
                    sink.record_hit("augmentation.request");
                    sink.record_hit(&format!("augmentor.{req}.request"));
                    dispatch.insert((*req).clone());
                    required.next();
                    available.next();
                }
                // Required augmentor is not available.
                Ordering::Less => {
                    required.next();
                }
                // Available augmentor is not required.
                Ordering::Greater => {
                    available.next();
                }
            },
            _ => break,
        }
    }

    dispatch
}

/// Loop-thread dispatcher state: the worker directory, the deadline index
/// of in-flight auctions, and the idle gate.
pub struct Dispatcher {
    directory: Directory,
    augmenting: DeadlineIndex<AuctionId, Entry>,
    idle_gate: Arc<IdleGate>,
    default_max_in_flight: u32,
    sink: Arc<dyn EventSink>,
    encode_buf: Vec<u8>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(sink: Arc<dyn EventSink>, default_max_in_flight: u32) -> Self {
        Self {
            directory: Directory::new(),
            augmenting: DeadlineIndex::new(),
            idle_gate: Arc::new(IdleGate::new()),
            default_max_in_flight,
            sink,
            encode_buf: Vec::with_capacity(512),
        }
    }

    /// Read handle for hot-path snapshot access.
    #[must_use]
    pub fn snapshot_reader(&self) -> SnapshotReader {
        self.directory.reader()
    }

    pub(crate) fn idle_gate(&self) -> Arc<IdleGate> {
        Arc::clone(&self.idle_gate)
    }

    /// Number of auctions currently pending.
    #[must_use]
    pub fn num_augmenting(&self) -> usize {
        self.augmenting.len()
    }

    /// Membership test against the deadline index.
    #[must_use]
    pub fn currently_augmenting(&self, id: &AuctionId) -> bool {
        self.augmenting.contains(id)
    }

    #[must_use]
    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    /// Routes one inbound worker datagram. Malformed frames are counted
    /// and dropped; they never produce a completion or an error upstream.
    pub fn handle_worker_frame(
        &mut self,
        addr: Endpoint,
        bytes: &[u8],
        transport: &mut dyn Transport,
        now: Instant,
    ) -> Option<Completion> {
        match protocol::parse_worker_message(bytes) {
            Ok(WorkerMessage::Config(frame)) => {
                self.do_config(addr, &frame, transport, now);
                None
            }
            Ok(WorkerMessage::Response(frame)) => self.do_response(addr, &frame, now),
            Err(_err) => {
                warn!(%addr, error = %_err, "dropping malformed augmentor frame");
                self.sink.record_hit("augmentation.protocolError");
                None
            }
        }
    }

    /// Drains one entry from the inbox into the pending state.
    ///
    /// Duplicate auction ids are counted and dropped — the entry's callback
    /// never fires; the original entry's callback still will.
    pub fn do_augmentation(
        &mut self,
        entry: Entry,
        transport: &mut dyn Transport,
        now: Instant,
    ) {
        let id = entry.info.auction.id.clone();

        // The entry is off the inbox either way — duplicates included.
        self.idle_gate.drained();

        if self.augmenting.contains(&id) {
            warn!(auction = %id, "duplicate auction id detected");
            self.sink.record_hit("duplicateAuction");
            return;
        }

        let outstanding = entry.outstanding.clone();
        let info = Arc::clone(&entry.info);
        let timeout = entry.timeout;
        self.augmenting
            .insert(id.clone(), entry, timeout)
            .expect("membership checked above");

        // The agent set rides along on every AUGMENT frame.
        let agents = info.agents();

        for name in &outstanding {
            let Some(instance_addr) = self.directory.pick_instance(name) else {
                // Stays outstanding; the entry expires naturally.
                self.sink
                    .record_hit(&format!("augmentor.{name}.noAvailableInstances"));
                continue;
            };

            self.sink.record_hit(&format!(
                "augmentor.{name}.instances.{instance_addr}.requests"
            ));

            let encoded = protocol::encode_augment(
                name,
                &id,
                &info.auction.request_format,
                &info.auction.request,
                &agents,
                protocol::unix_time_secs(),
                &mut self.encode_buf,
            );
            if let Err(_err) = encoded {
                warn!(augmentor = %name, error = %_err, "failed to encode AUGMENT frame");
                continue;
            }

            if let Err(_err) = transport.send_frame(instance_addr, &self.encode_buf) {
                // Lost frames surface as timeouts, never as caller errors.
                warn!(augmentor = %name, dest = %instance_addr, error = %_err,
                      "failed to send AUGMENT frame");
            }
        }

        self.sink
            .record_level("requestTimeMs", elapsed_ms(now, Instant::now()));
    }

    /// Handles a RESPONSE frame. Returns the completion when the
    /// entry's outstanding set drains.
    pub fn do_response(
        &mut self,
        addr: Endpoint,
        frame: &ResponseFrame,
        now: Instant,
    ) -> Option<Completion> {
        self.sink.record_hit("augmentation.response");

        let augmentor = frame.augmentor.as_str();

        let parse_started = Instant::now();
        let list = if frame.is_null_payload() {
            AugmentationList::default()
        } else {
            let parsed = serde_json::from_str::<serde_json::Value>(&frame.payload)
                .map_err(AugmentationParseError::from)
                .and_then(AugmentationList::from_json);
            match parsed {
                Ok(list) => list,
                Err(_err) => {
                    debug!(augmentor, error = %_err, "augmentor payload failed to parse");
                    self.sink.record_hit(&format!(
                        "augmentor.{augmentor}.responseParsingExceptions"
                    ));
                    AugmentationList::default()
                }
            }
        };
        self.sink.record_level(
            "responseParseTimeMs",
            elapsed_ms(parse_started, Instant::now()),
        );

        self.sink.record_outcome(
            &format!("augmentor.{augmentor}.timeTakenMs"),
            (protocol::unix_time_secs() - frame.start_time_secs) * 1000.0,
        );
        self.sink.record_outcome(
            &format!("augmentor.{augmentor}.responseLengthBytes"),
            frame.payload.len() as f64,
        );

        self.directory.settle_response(augmentor, addr, now);

        let Some(entry) = self.augmenting.get_mut(&frame.auction_id) else {
            // Late or post-expiry response.
            self.sink.record_hit("augmentation.unknown");
            self.sink
                .record_hit(&format!("augmentor.{augmentor}.instances.{addr}.unknown"));
            return None;
        };

        let outcome = if frame.is_null_payload() {
            "nullResponse"
        } else {
            "validResponse"
        };
        self.sink
            .record_hit(&format!("augmentor.{augmentor}.instances.{addr}.{outcome}"));

        entry.info.auction.merge_augmentation(augmentor, list);

        entry.outstanding.remove(augmentor);
        if entry.outstanding.is_empty() {
            let entry = self
                .augmenting
                .remove(&frame.auction_id)
                .expect("entry present above");
            return Some(entry.into_completion());
        }
        None
    }

    /// Expires every entry whose deadline passed. Runs on the 1 ms
    /// tick; flips the idle gate when the index drains.
    pub fn check_expiries(&mut self, now: Instant) -> Vec<Completion> {
        let mut completions = Vec::new();

        if self.augmenting.earliest().is_some_and(|dl| dl <= now) {
            let sink = Arc::clone(&self.sink);
            self.augmenting.expire(now, |_id, entry| {
                for name in &entry.outstanding {
                    sink.record_hit(&format!("augmentor.{name}.expiredTooLate"));
                }
                debug!(auction = %_id, "auction expired before all augmentors responded");
                completions.push(entry.into_completion());
            });
        }

        if self.augmenting.is_empty() {
            self.idle_gate.set_idle();
        }

        completions
    }

    /// Registers a worker instance and acknowledges with CONFIGOK.
    pub fn do_config(
        &mut self,
        addr: Endpoint,
        frame: &ConfigFrame,
        transport: &mut dyn Transport,
        now: Instant,
    ) {
        let name = frame.augmentor.as_str();
        let max_in_flight = frame.resolved_max_in_flight(self.default_max_in_flight);

        // First-seen status must be read before the disconnection sweep:
        // re-registering the sole instance transiently empties the record.
        let already_configured = self.directory.get(name).is_some();

        // A reconnecting instance replaces its prior registration.
        self.do_disconnection(addr, Some(name));

        self.directory.configure(name, addr, max_in_flight, now);
        if !already_configured {
            self.sink.record_hit(&format!("augmentor.{name}.configured"));
        }
        self.sink
            .record_hit(&format!("augmentor.{name}.instances.{addr}.configured"));
        info!(augmentor = %name, %addr, max_in_flight, "augmentor instance configured");

        protocol::encode_config_ok(&mut self.encode_buf);
        if let Err(_err) = transport.send_frame(addr, &self.encode_buf) {
            warn!(%addr, error = %_err, "failed to send CONFIGOK");
        }
    }

    /// Removes the instance(s) at `addr`. In-flight auctions that
    /// referenced them are left to expire naturally.
    pub fn do_disconnection(&mut self, addr: Endpoint, name: Option<&str>) {
        for removed in self.directory.disconnect(addr, name) {
            info!(augmentor = %removed.augmentor, addr = %removed.addr,
                  "augmentor instance disconnected");
            self.sink.record_hit(&format!(
                "augmentor.{}.instances.{}.disconnected",
                removed.augmentor, removed.addr
            ));
        }
    }

    /// Periodic gauge pass (~1 s cadence): per-augmentor in-flight totals.
    pub fn record_stats(&self) {
        for (name, total) in self.directory.in_flight_totals() {
            self.sink
                .record_level(&format!("augmentor.{name}.numInFlight"), f64::from(total));
        }
    }

    /// Optional liveness reaper: disconnects instances silent for longer
    /// than `timeout`.
    pub fn reap_stale_instances(&mut self, now: Instant, timeout: Duration) {
        let cutoff = now - timeout;
        for stale in self.directory.stale_instances(cutoff) {
            warn!(augmentor = %stale.augmentor, addr = %stale.addr,
                  "reaping silent augmentor instance");
            self.do_disconnection(stale.addr, Some(&stale.augmentor));
        }
    }
}

fn elapsed_ms(from: Instant, to: Instant) -> f64 {
    if to <= from {
        return 0.0;
    }
    to.duration_since(from).as_secs_f64() * 1000.0
}
