//! Auction-side data model: ids, bidder fan-out lists, and the mergeable
//! augmentation payloads workers send back.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::compact::CompactVec;

/// Opaque auction identifier.
///
/// Hashable, equality-comparable, totally ordered; round-trips through its
/// string form on the wire.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AuctionId(String);

impl AuctionId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AuctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AuctionId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

impl From<u64> for AuctionId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

/// One enrichment result: a set of tags plus free-form data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Augmentation {
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl Augmentation {
    /// Folds `other` into `self`: tags are unioned; data objects are merged
    /// key-wise with `other` winning conflicts. Merging an identical value
    /// is a no-op.
    pub fn merge_with(&mut self, other: Augmentation) {
        self.tags.extend(other.tags);
        match (&mut self.data, other.data) {
            (_, Value::Null) => {}
            (Value::Object(mine), Value::Object(theirs)) => {
                for (k, v) in theirs {
                    mine.insert(k, v);
                }
            }
            (slot, theirs) => *slot = theirs,
        }
    }
}

/// Augmentor payload decode failure.
#[derive(Debug, Error)]
pub enum AugmentationParseError {
    #[error("augmentation payload must be a JSON object")]
    NotObject,
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Augmentations keyed by account.
///
/// A bare `{"tags": ..., "data": ...}` object is shorthand for a single
/// entry under the default (empty) account.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AugmentationList(BTreeMap<String, Augmentation>);

impl AugmentationList {
    /// Decodes a worker payload.
    ///
    /// # Errors
    ///
    /// Fails if the payload is not a JSON object or an entry does not have
    /// the tags/data shape.
    pub fn from_json(value: Value) -> Result<Self, AugmentationParseError> {
        let Value::Object(map) = value else {
            return Err(AugmentationParseError::NotObject);
        };

        if map.keys().all(|k| k == "tags" || k == "data") {
            let aug: Augmentation = serde_json::from_value(Value::Object(map))?;
            let mut out = BTreeMap::new();
            out.insert(String::new(), aug);
            return Ok(Self(out));
        }

        let mut out = BTreeMap::new();
        for (account, entry) in map {
            out.insert(account, serde_json::from_value(entry)?);
        }
        Ok(Self(out))
    }

    /// Merges `other` account-wise. Commutative on disjoint accounts and
    /// idempotent on identical inputs.
    pub fn merge_with(&mut self, other: AugmentationList) {
        for (account, aug) in other.0 {
            match self.0.get_mut(&account) {
                Some(existing) => existing.merge_with(aug),
                None => {
                    self.0.insert(account, aug);
                }
            }
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn get(&self, account: &str) -> Option<&Augmentation> {
        self.0.get(account)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Augmentation)> {
        self.0.iter()
    }
}

/// Per-agent configuration: the augmentors this bidder requires.
#[derive(Debug, Clone, Default)]
pub struct AgentConfig {
    pub augmentors: CompactVec<String, 4>,
}

/// A bidder that may participate in the auction.
#[derive(Debug, Clone)]
pub struct PotentialBidder {
    pub agent: String,
    pub config: Arc<AgentConfig>,
}

/// One group of potential bidders.
pub type BidderGroup = CompactVec<PotentialBidder, 4>;

/// The auction handle carried through augmentation.
///
/// The augmentation map is behind a mutex: the loop thread merges into it
/// while producer threads hold the surrounding `Arc`.
#[derive(Debug)]
pub struct Auction {
    pub id: AuctionId,
    /// Raw bid request payload forwarded to augmentors.
    pub request: String,
    /// Format tag for the request payload (e.g. `"openrtb"`).
    pub request_format: String,
    augmentations: Mutex<BTreeMap<String, AugmentationList>>,
}

impl Auction {
    #[must_use]
    pub fn new(id: AuctionId, request: impl Into<String>, request_format: impl Into<String>) -> Self {
        Self {
            id,
            request: request.into(),
            request_format: request_format.into(),
            augmentations: Mutex::new(BTreeMap::new()),
        }
    }

    /// Merges a worker response into this auction under `augmentor`.
    pub fn merge_augmentation(&self, augmentor: &str, list: AugmentationList) {
        let mut map = self.augmentations.lock();
        map.entry(augmentor.to_string()).or_default().merge_with(list);
    }

    /// Copies out the merged augmentations.
    #[must_use]
    pub fn augmentations(&self) -> BTreeMap<String, AugmentationList> {
        self.augmentations.lock().clone()
    }
}

/// Everything the dispatcher needs to augment one auction.
#[derive(Debug)]
pub struct AugmentationInfo {
    pub auction: Auction,
    pub potential_groups: Vec<BidderGroup>,
}

impl AugmentationInfo {
    /// Set union of augmentor names required by any bidder in any group.
    #[must_use]
    pub fn required_augmentors(&self) -> BTreeSet<String> {
        let mut needed = BTreeSet::new();
        for group in &self.potential_groups {
            for bidder in group {
                for name in &bidder.config.augmentors {
                    needed.insert(name.clone());
                }
            }
        }
        needed
    }

    /// Set of agent identifiers across all groups, as shipped in AUGMENT
    /// frames.
    #[must_use]
    pub fn agents(&self) -> BTreeSet<String> {
        let mut agents = BTreeSet::new();
        for group in &self.potential_groups {
            for bidder in group {
                agents.insert(bidder.agent.clone());
            }
        }
        agents
    }
}
