//! Worker directory and snapshot publisher.
//!
//! The directory maps augmentor name → live instances and is mutated only
//! on the loop thread. After every mutation it publishes a fresh immutable
//! snapshot of the augmentor names; hot-path readers (`augment()` callers)
//! clone an `Arc` to the current snapshot and iterate it without taking
//! any dispatcher lock. The superseded snapshot is reclaimed when its last
//! reader drops the `Arc`.

use std::collections::BTreeMap;
use std::sync::Arc;

use minstant::Instant;
use parking_lot::RwLock;

use crate::compact::CompactVec;
use crate::net::Endpoint;

/// A specific transport address serving an augmentor.
#[derive(Debug, Clone)]
pub struct AugmentorInstance {
    pub addr: Endpoint,
    /// Upper bound on concurrently outstanding requests.
    pub max_in_flight: u32,
    /// Requests sent but not yet answered. Mutated only on the loop thread;
    /// expiry does not decrement (late responses settle the account).
    pub num_in_flight: u32,
    /// Last time this instance sent us anything.
    pub last_seen: Instant,
}

/// A named augmentor and its instances.
///
/// Invariant: `instances` is never empty — an augmentor whose last
/// instance disconnects is removed from the directory.
#[derive(Debug, Clone)]
pub struct AugmentorInfo {
    pub name: String,
    pub instances: CompactVec<AugmentorInstance, 2>,
}

impl AugmentorInfo {
    fn find_instance(&mut self, addr: Endpoint) -> Option<&mut AugmentorInstance> {
        self.instances.iter_mut().find(|i| i.addr == addr)
    }
}

/// One row of the published snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub name: String,
    pub num_instances: usize,
}

/// Immutable, name-sorted view of the directory.
#[derive(Debug, Default)]
pub struct AugmentorSnapshot {
    entries: Vec<SnapshotEntry>,
}

impl AugmentorSnapshot {
    /// Entries sorted by augmentor name.
    #[must_use]
    pub fn entries(&self) -> &[SnapshotEntry] {
        &self.entries
    }

    /// Augmentor names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries
            .binary_search_by(|e| e.name.as_str().cmp(name))
            .is_ok()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Cloneable read handle to the published snapshot.
///
/// `load()` swaps an `Arc` out from under a pointer lock held for the
/// duration of a refcount bump; readers then iterate their own copy with
/// no lock at all.
#[derive(Clone)]
pub struct SnapshotReader {
    current: Arc<RwLock<Arc<AugmentorSnapshot>>>,
}

impl SnapshotReader {
    /// The snapshot as of the most recent publish.
    #[must_use]
    pub fn load(&self) -> Arc<AugmentorSnapshot> {
        Arc::clone(&self.current.read())
    }
}

/// What a disconnection sweep removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedInstance {
    pub augmentor: String,
    pub addr: Endpoint,
}

/// Mutable augmentor registry. Loop-thread only.
pub struct Directory {
    augmentors: BTreeMap<String, AugmentorInfo>,
    current: Arc<RwLock<Arc<AugmentorSnapshot>>>,
}

impl Directory {
    #[must_use]
    pub fn new() -> Self {
        Self {
            augmentors: BTreeMap::new(),
            current: Arc::new(RwLock::new(Arc::new(AugmentorSnapshot::default()))),
        }
    }

    /// Hands out a read handle for hot-path snapshot access.
    #[must_use]
    pub fn reader(&self) -> SnapshotReader {
        SnapshotReader {
            current: Arc::clone(&self.current),
        }
    }

    /// Number of registered augmentors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.augmentors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.augmentors.is_empty()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&AugmentorInfo> {
        self.augmentors.get(name)
    }

    /// Registers an instance for `name` and publishes a fresh snapshot.
    ///
    /// Callers re-registering a known address must disconnect it first so
    /// a reconnecting worker replaces rather than duplicates itself (the
    /// dispatch layer's CONFIG handler does exactly that).
    pub fn configure(&mut self, name: &str, addr: Endpoint, max_in_flight: u32, now: Instant) {
        let info = self
            .augmentors
            .entry(name.to_string())
            .or_insert_with(|| AugmentorInfo {
                name: name.to_string(),
                instances: CompactVec::new(),
            });
        info.instances.push(AugmentorInstance {
            addr,
            max_in_flight,
            num_in_flight: 0,
            last_seen: now,
        });

        self.publish();
    }

    /// Removes every instance at `addr` (optionally restricted to one
    /// augmentor). Augmentors left with no instances are dropped. Publishes
    /// if anything changed; in-flight auctions referencing removed
    /// instances expire naturally.
    pub fn disconnect(&mut self, addr: Endpoint, name: Option<&str>) -> Vec<RemovedInstance> {
        let removed = self.remove_instances(addr, name);
        if !removed.is_empty() {
            self.publish();
        }
        removed
    }

    fn remove_instances(&mut self, addr: Endpoint, name: Option<&str>) -> Vec<RemovedInstance> {
        let mut removed = Vec::new();
        let mut to_erase = Vec::new();

        for (aug_name, info) in &mut self.augmentors {
            if let Some(only) = name {
                if aug_name != only {
                    continue;
                }
            }

            if let Some(pos) = info.instances.iter().position(|i| i.addr == addr) {
                info.instances.remove(pos);
                removed.push(RemovedInstance {
                    augmentor: aug_name.clone(),
                    addr,
                });
            }

            if info.instances.is_empty() {
                to_erase.push(aug_name.clone());
            }
        }

        for name in to_erase {
            self.augmentors.remove(&name);
        }

        removed
    }

    /// Picks the least-loaded available instance of `name` and charges one
    /// in-flight unit to it.
    ///
    /// Among instances with spare budget the one with strictly minimal
    /// `num_in_flight` wins; ties break toward the earliest-registered.
    /// Returns `None` when every instance is at its limit (or the name is
    /// unknown).
    pub fn pick_instance(&mut self, name: &str) -> Option<Endpoint> {
        let info = self.augmentors.get_mut(name)?;

        let mut pick: Option<usize> = None;
        let mut min_in_flight = u32::MAX;
        for (i, instance) in info.instances.iter().enumerate() {
            if instance.num_in_flight >= min_in_flight {
                continue;
            }
            if instance.num_in_flight >= instance.max_in_flight {
                continue;
            }
            pick = Some(i);
            min_in_flight = instance.num_in_flight;
        }

        let i = pick?;
        info.instances[i].num_in_flight += 1;
        Some(info.instances[i].addr)
    }

    /// Settles one in-flight unit for `(name, addr)` after a response.
    /// No-op if the instance has since disconnected.
    pub fn settle_response(&mut self, name: &str, addr: Endpoint, now: Instant) {
        if let Some(info) = self.augmentors.get_mut(name) {
            if let Some(instance) = info.find_instance(addr) {
                instance.num_in_flight = instance.num_in_flight.saturating_sub(1);
                instance.last_seen = now;
            }
        }
    }

    /// Sums in-flight counts per augmentor, for the periodic stats pass.
    #[must_use]
    pub fn in_flight_totals(&self) -> Vec<(String, u32)> {
        self.augmentors
            .iter()
            .map(|(name, info)| {
                let total = info.instances.iter().map(|i| i.num_in_flight).sum();
                (name.clone(), total)
            })
            .collect()
    }

    /// Instances silent since before `cutoff`, for the optional liveness
    /// reaper.
    #[must_use]
    pub fn stale_instances(&self, cutoff: Instant) -> Vec<RemovedInstance> {
        let mut stale = Vec::new();
        for info in self.augmentors.values() {
            for instance in &info.instances {
                if instance.last_seen < cutoff {
                    stale.push(RemovedInstance {
                        augmentor: info.name.clone(),
                        addr: instance.addr,
                    });
                }
            }
        }
        stale
    }

    /// Rebuilds and publishes the snapshot. BTreeMap iteration already
    /// yields names in sorted order.
    fn publish(&mut self) {
        let entries = self
            .augmentors
            .values()
            .map(|info| SnapshotEntry {
                name: info.name.clone(),
                num_instances: info.instances.len(),
            })
            .collect();
        *self.current.write() = Arc::new(AugmentorSnapshot { entries });
    }
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}
