//! Deadline-driven augmentation dispatcher for a real-time bidding router.
//!
//! For each incoming auction the dispatcher works out which enrichment
//! workers ("augmentors") need to be consulted, fans an AUGMENT request out
//! to one instance of each over a datagram bus, merges the responses back
//! into the auction, and fires the caller's completion callback exactly
//! once — at the caller's deadline at the latest.
//!
//! # Architecture
//!
//! ```text
//! [caller threads] --augment()--> [MPSC inbox] --> [loop thread]
//!                                                       |
//!                                    UDP bus <--> CONFIG/RESPONSE/AUGMENT
//!                                                       |
//!                                             [deadline index, 1ms tick]
//! ```
//!
//! A single loop thread owns all mutable dispatcher state. Producer threads
//! only touch the lock-free inbox and an immutable snapshot of the worker
//! directory.

pub mod auction;
pub mod compact;
pub mod deadline;
pub mod directory;
pub mod dispatch;
pub mod metrics;
pub mod net;
pub mod protocol;
pub mod runtime;
pub mod sync;

mod trace;

pub use trace::init_tracing;

pub use auction::{AuctionId, AugmentationInfo, AugmentationList};
pub use dispatch::OnFinished;
pub use runtime::{AugmentationLoop, LoopConfig, LoopError};
