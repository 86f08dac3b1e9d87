/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that start a replica, as well as [the type](Replica) which keeps the replica alive.
//!
//! A process participating in replication is called a 'replica'. Each replica is uniquely
//! identified by the position of its Ed25519 public key in the canonically ordered bootstrap
//! profile, shared by all replicas; that position doubles as the replica's place in the
//! [vote aggregation tree](crate::tree).
//!
//! ## Threads
//!
//! [`Replica::start`] spawns:
//! 1. The **poller** thread, which moves raw frames off the [`Network`] provider.
//! 2. The **algorithm** thread, which owns all protocol state (see [algorithm](crate::algorithm)).
//! 3. The **event bus** thread, which runs [event handlers](crate::event_bus::EventHandlers).
//! 4. The **crypto pool** workers, which verify signatures (see
//!    [crypto_pool](crate::crypto_pool)).
//!
//! Dropping the `Replica` shuts all of them down.
//!
//! ## Submitting commands
//!
//! [`Replica::submit_command`] hands an opaque command hash to the replication engine together
//! with a callback that fires with the command's [`Finality`](crate::types::basic::Finality) once
//! it commits. Only the current proposer batches submissions into blocks; other replicas register
//! the callback and rely on the proposer learning the command through the embedding application's
//! own dissemination.

use std::sync::mpsc::{self, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::algorithm::start_algorithm;
use crate::command_queue::{CommandQueue, DecisionCallback};
use crate::consensus::aggregation::VoteAggregator;
use crate::consensus::protocol::{ConsensusConfiguration, ConsensusCore};
use crate::crypto_pool::CryptoPool;
use crate::event_bus::{start_event_bus, EventHandlers};
use crate::fetch::FetchEngine;
use crate::networking::{start_polling, Network, SenderHandle};
use crate::pacemaker::Pacemaker;
use crate::storage::BlockStore;
use crate::tree::TreeOverlay;
use crate::types::basic::{CryptoHash, ReplicaID};
use crate::types::block::Block;
use crate::types::keypair::Keypair;
use crate::types::replica_set::ReplicaSet;

/// Parameters that define the behaviour of a replica.
pub struct Configuration {
    /// This replica's position in the bootstrap profile.
    pub id: ReplicaID,

    /// This replica's signing keypair. Its verifying key must sit at position `id` of
    /// `replica_set`.
    pub keypair: Keypair,

    /// The verifying keys of all replicas, in canonical order.
    pub replica_set: ReplicaSet,

    /// Branching factor of the vote aggregation tree. `fanout >= n` degenerates to a star.
    pub fanout: usize,

    /// Number of command hashes batched into one proposal.
    pub blk_size: usize,

    /// Number of worker threads verifying signatures.
    pub verifier_threads: usize,

    /// How long to wait for a `RespBlock` before retrying a fetch with a rotated source.
    pub fetch_retry_timeout: Duration,
}

/// A running replica. Dropping this value stops all of the replica's threads.
pub struct Replica {
    poller: Option<JoinHandle<()>>,
    poller_shutdown: Sender<()>,
    algorithm: Option<JoinHandle<()>>,
    algorithm_shutdown: Sender<()>,
    event_bus: Option<JoinHandle<()>>,
    event_bus_shutdown: Sender<()>,
    cmd_sender: Sender<(CryptoHash, DecisionCallback)>,
}

impl Replica {
    /// Start a replica with the given configuration, network provider, pacemaker, and event
    /// handlers.
    pub fn start(
        config: Configuration,
        mut network: impl Network,
        pacemaker: impl Pacemaker,
        handlers: EventHandlers,
    ) -> Replica {
        let n = config.replica_set.len();
        let tree = TreeOverlay::build(n, config.fanout, config.id);
        network.init_overlay(tree.parent(), tree.children());

        let genesis = Block::genesis();
        let genesis_hash = genesis.hash;

        let (poller_shutdown, poller_shutdown_receiver) = mpsc::channel();
        let (poller, msg_receiver) = start_polling(network.clone(), poller_shutdown_receiver);

        let (event_publisher, event_subscriber) = mpsc::channel();
        let (event_bus_shutdown, event_bus_shutdown_receiver) = mpsc::channel();
        let event_bus = start_event_bus(handlers, event_subscriber, event_bus_shutdown_receiver);

        let (verification_sender, verification_receiver) = mpsc::channel();
        let crypto = CryptoPool::new(
            config.verifier_threads,
            config.replica_set.clone(),
            verification_sender,
        );

        let core = ConsensusCore::new(
            ConsensusConfiguration {
                id: config.id,
                keypair: config.keypair.clone(),
            },
            genesis_hash,
        );
        let store = BlockStore::new(genesis);
        let fetch = FetchEngine::new(
            config.id,
            n,
            genesis_hash,
            config.fetch_retry_timeout,
            Some(event_publisher.clone()),
        );
        let aggregator = VoteAggregator::new(
            config.id,
            config.keypair,
            config.replica_set.clone(),
            &tree,
        );
        let queue = CommandQueue::new(config.id, config.blk_size);

        let (cmd_sender, cmd_receiver) = mpsc::channel();
        let (algorithm_shutdown, algorithm_shutdown_receiver) = mpsc::channel();
        let algorithm = start_algorithm(
            config.id,
            n,
            tree,
            core,
            store,
            fetch,
            aggregator,
            queue,
            pacemaker,
            SenderHandle::new(network),
            crypto,
            msg_receiver,
            verification_receiver,
            cmd_receiver,
            algorithm_shutdown_receiver,
            Some(event_publisher),
        );

        Replica {
            poller: Some(poller),
            poller_shutdown,
            algorithm: Some(algorithm),
            algorithm_shutdown,
            event_bus: Some(event_bus),
            event_bus_shutdown,
            cmd_sender,
        }
    }

    /// Submit a command hash for replication. `callback` fires with the command's finality once
    /// the command commits — or immediately with an empty finality if the command is already
    /// waiting for a decision.
    pub fn submit_command(
        &self,
        cmd_hash: CryptoHash,
        callback: impl FnOnce(crate::types::basic::Finality) + Send + 'static,
    ) {
        // A send failure means the replica has stopped; the callback will never fire.
        let _ = self.cmd_sender.send((cmd_hash, Box::new(callback)));
    }
}

impl Drop for Replica {
    fn drop(&mut self) {
        // Safety: the algorithm thread reads from the poller and publishes to the event bus, so
        // it is stopped first, then the poller, then the event bus.
        let _ = self.algorithm_shutdown.send(());
        let _ = self.algorithm.take().unwrap().join();

        let _ = self.poller_shutdown.send(());
        let _ = self.poller.take().unwrap().join();

        let _ = self.event_bus_shutdown.send(());
        let _ = self.event_bus.take().unwrap().join();
    }
}
