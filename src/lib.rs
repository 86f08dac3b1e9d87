/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A Rust implementation of chained HotStuff Byzantine fault tolerant state machine replication,
//! extended with tree-based vote aggregation.
//!
//! A fixed set of `n >= 3f + 1` replicas agrees on a totally ordered log of opaque command
//! hashes while tolerating up to `f` Byzantine replicas. Proposals flow down a deterministic
//! [tree overlay](crate::tree) rooted at the proposer's aggregation root, and votes flow back up
//! it: each internal node combines its subtree's partial signatures into one partial quorum
//! certificate before forwarding, reducing the leader's fan-in from `O(n)` to `O(fanout)`.
//!
//! Start a replica with [`Replica::start`](crate::replica::Replica::start), providing a
//! [`Network`](crate::networking::Network) implementation, a
//! [`Pacemaker`](crate::pacemaker::Pacemaker), and [event
//! handlers](crate::event_bus::EventHandlers); then feed it command hashes with
//! [`submit_command`](crate::replica::Replica::submit_command).

pub(crate) mod algorithm;

pub(crate) mod command_queue;

pub mod consensus;

pub(crate) mod crypto_pool;

pub mod event_bus;

pub mod events;

pub(crate) mod fetch;

pub mod logging;

pub mod networking;

pub mod pacemaker;

pub mod replica;

pub(crate) mod storage;

pub mod tree;

pub mod types;

// Re-exports
pub use event_bus::EventHandlers;
pub use networking::Network;
pub use pacemaker::{Pacemaker, RoundRobinPacemaker, StaticPacemaker};
pub use replica::{Configuration, Replica};
