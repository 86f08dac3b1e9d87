/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Asynchronous block fetching and topologically ordered delivery.
//!
//! The [`FetchEngine`] tracks two kinds of pending work, both keyed by block hash and both
//! deduplicated — concurrent requests for the same hash share one entry:
//!
//! 1. **Fetches**: the block's bytes are missing. A [`ReqBlock`] is sent to a candidate peer (the
//!    hinted source, else rotating through the peer list on timeout) until a [`RespBlock`] or a
//!    relayed [`Proposal`](crate::consensus::messages::Proposal) supplies the block.
//! 2. **Deliveries**: the block is (or is being) fetched, and becomes *delivered* once all of its
//!    delivery preconditions hold: the proposer signature verifies, the justify QC verifies and
//!    its certified block is fetched, and every parent is itself delivered.
//!
//! Delivery is the suspension point of the protocol: handlers that need a delivered block park a
//! [`DeliveryWaiter`] continuation here and the [algorithm](crate::algorithm) loop resumes it
//! when the pipeline completes. Signature checks run on the [crypto pool](crate::crypto_pool);
//! their outcomes re-enter through [`on_verification`](FetchEngine::on_verification).
//!
//! A verification failure rejects the delivery: the task and its waiters are dropped, a warning
//! is logged, and the block is never marked delivered. Fetch timeouts are never fatal; they
//! rotate the source and retry.

use std::collections::{HashMap, HashSet};
use std::sync::mpsc::Sender;
use std::time::{Duration, Instant, SystemTime};

use crate::consensus::messages::{Proposal, ReqBlock};
use crate::crypto_pool::{CryptoPool, VerificationJob};
use crate::events::{DeliverBlockEvent, Event};
use crate::networking::{Network, SenderHandle};
use crate::storage::{BlockStore, StorageError};
use crate::types::basic::{CryptoHash, ReplicaID};
use crate::types::certificates::QuorumCertificate;

/// A continuation parked on a block's delivery, resumed by the algorithm loop when the block is
/// delivered.
pub(crate) enum DeliveryWaiter {
    /// Process the proposal carrying this block.
    Proposal(Proposal),

    /// A quorum certificate formed for this block before the block itself was delivered; finish
    /// QC processing.
    QcFinish(QuorumCertificate),
}

/// A block that completed delivery, together with the continuations that were waiting on it.
pub(crate) type Delivered = (CryptoHash, Vec<DeliveryWaiter>);

struct FetchContext {
    cursor: usize,
    last_request: Instant,
    /// Doubles on every retry, up to [`MAX_BACKOFF_FACTOR`] times the configured timeout.
    timeout: Duration,
}

const MAX_BACKOFF_FACTOR: u32 = 8;

struct DeliveryTask {
    /// The peer that caused this delivery; missing pieces are requested from it first.
    source: ReplicaID,
    pipeline_started: bool,
    sig_pending: bool,
    justify_pending: bool,
    /// The justify QC's certified block, while it is still being fetched.
    justify_fetch: Option<CryptoHash>,
    missing_parents: HashSet<CryptoHash>,
    waiters: Vec<DeliveryWaiter>,
}

impl DeliveryTask {
    fn ready(&self) -> bool {
        self.pipeline_started
            && !self.sig_pending
            && !self.justify_pending
            && self.justify_fetch.is_none()
            && self.missing_parents.is_empty()
    }
}

pub(crate) struct FetchEngine {
    /// Peers to rotate fetches through (every replica except the local one).
    peers: Vec<ReplicaID>,
    genesis_hash: CryptoHash,
    retry_timeout: Duration,
    fetch_waiting: HashMap<CryptoHash, FetchContext>,
    delivery_waiting: HashMap<CryptoHash, DeliveryTask>,
    /// Delivery tasks blocked on a parent's delivery, keyed by the parent.
    deliver_dependents: HashMap<CryptoHash, Vec<CryptoHash>>,
    /// Delivery tasks blocked on a justify block's fetch, keyed by the justify block.
    fetch_dependents: HashMap<CryptoHash, Vec<CryptoHash>>,
    event_publisher: Option<Sender<Event>>,
    delivered_total: u64,
    delivered_window: u64,
}

impl FetchEngine {
    pub(crate) fn new(
        id: ReplicaID,
        n: usize,
        genesis_hash: CryptoHash,
        retry_timeout: Duration,
        event_publisher: Option<Sender<Event>>,
    ) -> FetchEngine {
        let peers = (0..n as u8)
            .map(ReplicaID::new)
            .filter(|peer| *peer != id)
            .collect();
        FetchEngine {
            peers,
            genesis_hash,
            retry_timeout,
            fetch_waiting: HashMap::new(),
            delivery_waiting: HashMap::new(),
            deliver_dependents: HashMap::new(),
            fetch_dependents: HashMap::new(),
            event_publisher,
            delivered_total: 0,
            delivered_window: 0,
        }
    }

    /// Total number of blocks this engine has delivered.
    pub(crate) fn delivered_total(&self) -> u64 {
        self.delivered_total
    }

    /// Number of blocks delivered since the last call, for windowed statistics.
    pub(crate) fn take_delivered_window(&mut self) -> u64 {
        std::mem::take(&mut self.delivered_window)
    }

    /// Number of pending fetch entries.
    pub(crate) fn fetches_waiting(&self) -> usize {
        self.fetch_waiting.len()
    }

    /// Number of pending delivery tasks.
    pub(crate) fn deliveries_waiting(&self) -> usize {
        self.delivery_waiting.len()
    }

    /// Request that the block identified by `hash` become delivered, parking `waiter` on the
    /// delivery.
    ///
    /// If the block is already delivered the waiter is handed straight back in the returned
    /// completions. Otherwise the waiter joins the (single) pending delivery task for `hash`,
    /// fetching the block first if necessary.
    pub(crate) fn deliver<N: Network>(
        &mut self,
        hash: CryptoHash,
        source: ReplicaID,
        waiter: Option<DeliveryWaiter>,
        store: &mut BlockStore,
        sender: &mut SenderHandle<N>,
        pool: &CryptoPool,
    ) -> Result<Vec<Delivered>, StorageError> {
        if store.is_blk_delivered(&hash) {
            return Ok(vec![(hash, waiter.into_iter().collect())]);
        }

        if let Some(task) = self.delivery_waiting.get_mut(&hash) {
            task.waiters.extend(waiter);
            return Ok(Vec::new());
        }

        self.delivery_waiting.insert(
            hash,
            DeliveryTask {
                source,
                pipeline_started: false,
                sig_pending: false,
                justify_pending: false,
                justify_fetch: None,
                missing_parents: HashSet::new(),
                waiters: waiter.into_iter().collect(),
            },
        );

        if store.is_blk_fetched(&hash) {
            self.start_pipeline(hash, store, sender, pool)?;
        } else {
            self.request_fetch(hash, Some(source), sender);
        }
        Ok(Vec::new())
    }

    /// Send a `ReqBlock` for `hash` unless one is already in flight.
    fn request_fetch<N: Network>(
        &mut self,
        hash: CryptoHash,
        source: Option<ReplicaID>,
        sender: &mut SenderHandle<N>,
    ) {
        if self.fetch_waiting.contains_key(&hash) || self.peers.is_empty() {
            return;
        }
        let cursor = source
            .and_then(|peer| self.peers.iter().position(|p| *p == peer))
            .unwrap_or(0);
        let peer = self.peers[cursor];
        self.fetch_waiting.insert(
            hash,
            FetchContext {
                cursor,
                last_request: Instant::now(),
                timeout: self.retry_timeout,
            },
        );
        sender.send(
            peer,
            &ReqBlock {
                blk_hashes: vec![hash],
            }
            .into(),
        );
    }

    /// Note that the block identified by `blk_hash` is now in the store (it arrived in a
    /// `RespBlock` or inside a relayed proposal), clear its fetch entry, and advance every
    /// delivery task that was waiting for these bytes.
    pub(crate) fn on_block_fetched<N: Network>(
        &mut self,
        blk_hash: CryptoHash,
        store: &mut BlockStore,
        sender: &mut SenderHandle<N>,
        pool: &CryptoPool,
    ) -> Result<Vec<Delivered>, StorageError> {
        self.fetch_waiting.remove(&blk_hash);

        let mut delivered = Vec::new();

        // The delivery task for this block itself can start its pipeline.
        if self
            .delivery_waiting
            .get(&blk_hash)
            .is_some_and(|task| !task.pipeline_started)
        {
            self.start_pipeline(blk_hash, store, sender, pool)?;
        }

        // Tasks waiting for this block as their justify block are unblocked.
        if let Some(dependents) = self.fetch_dependents.remove(&blk_hash) {
            for dependent in dependents {
                if let Some(task) = self.delivery_waiting.get_mut(&dependent) {
                    if task.justify_fetch == Some(blk_hash) {
                        task.justify_fetch = None;
                    }
                }
                self.try_complete(dependent, store, &mut delivered)?;
            }
        }

        Ok(delivered)
    }

    /// Queue the verification work and ancestor deliveries for a freshly fetched block.
    fn start_pipeline<N: Network>(
        &mut self,
        hash: CryptoHash,
        store: &mut BlockStore,
        sender: &mut SenderHandle<N>,
        pool: &CryptoPool,
    ) -> Result<(), StorageError> {
        let (proposer, signature, justify, parents) = {
            let block = store.expect_blk(&hash)?;
            (
                block.proposer,
                block.signature,
                block.justify.clone(),
                block.parents.clone(),
            )
        };

        let source = match self.delivery_waiting.get_mut(&hash) {
            Some(task) => {
                task.pipeline_started = true;
                task.sig_pending = true;
                task.source
            }
            None => return Ok(()),
        };

        pool.submit(VerificationJob::ProposerSignature {
            blk_hash: hash,
            proposer,
            signature,
        });

        match justify {
            None => {
                // Only the genesis block has no justify, and genesis is never re-delivered.
                self.reject(hash, "block without justify");
                return Ok(());
            }
            Some(qc) if qc.is_genesis() => {
                // A signature-less QC is only acceptable as the genesis QC itself.
                if qc.obj_hash != self.genesis_hash {
                    self.reject(hash, "forged genesis justify");
                    return Ok(());
                }
            }
            Some(qc) => {
                let justify_obj = qc.obj_hash;
                if let Some(task) = self.delivery_waiting.get_mut(&hash) {
                    task.justify_pending = true;
                }
                pool.submit(VerificationJob::JustifyQc {
                    blk_hash: hash,
                    qc,
                });
                if !store.is_blk_fetched(&justify_obj) {
                    if let Some(task) = self.delivery_waiting.get_mut(&hash) {
                        task.justify_fetch = Some(justify_obj);
                    }
                    self.fetch_dependents
                        .entry(justify_obj)
                        .or_default()
                        .push(hash);
                    self.request_fetch(justify_obj, Some(source), sender);
                }
            }
        }

        for parent in parents {
            if !store.is_blk_delivered(&parent) {
                if let Some(task) = self.delivery_waiting.get_mut(&hash) {
                    task.missing_parents.insert(parent);
                }
                self.deliver_dependents.entry(parent).or_default().push(hash);
                let _ = self.deliver(parent, source, None, store, sender, pool)?;
            }
        }

        Ok(())
    }

    /// Fold a verification outcome from the crypto pool into the pipeline.
    pub(crate) fn on_verification(
        &mut self,
        job: &VerificationJob,
        ok: bool,
        store: &mut BlockStore,
    ) -> Result<Vec<Delivered>, StorageError> {
        let mut delivered = Vec::new();
        match job {
            VerificationJob::ProposerSignature { blk_hash, .. } => {
                if !ok {
                    self.reject(*blk_hash, "invalid proposer signature");
                    return Ok(delivered);
                }
                if let Some(task) = self.delivery_waiting.get_mut(blk_hash) {
                    task.sig_pending = false;
                }
                self.try_complete(*blk_hash, store, &mut delivered)?;
            }
            VerificationJob::JustifyQc { blk_hash, .. } => {
                if !ok {
                    self.reject(*blk_hash, "invalid justify certificate");
                    return Ok(delivered);
                }
                if let Some(task) = self.delivery_waiting.get_mut(blk_hash) {
                    task.justify_pending = false;
                }
                self.try_complete(*blk_hash, store, &mut delivered)?;
            }
            VerificationJob::VoteSignature { .. } => {
                // Routed to the vote aggregator by the algorithm loop, not here.
            }
        }
        Ok(delivered)
    }

    /// If every precondition of `hash`'s delivery holds, mark it delivered, collect its waiters,
    /// and cascade into tasks that were waiting on `hash` as a parent.
    fn try_complete(
        &mut self,
        hash: CryptoHash,
        store: &mut BlockStore,
        delivered: &mut Vec<Delivered>,
    ) -> Result<(), StorageError> {
        match self.delivery_waiting.get(&hash) {
            Some(task) if task.ready() => (),
            _ => return Ok(()),
        }

        store.mark_delivered(&hash)?;
        let task = self
            .delivery_waiting
            .remove(&hash)
            .expect("task presence was just checked");
        self.delivered_total += 1;
        self.delivered_window += 1;
        Event::DeliverBlock(DeliverBlockEvent {
            timestamp: SystemTime::now(),
            block: hash,
            height: store.blk_height(&hash)?,
        })
        .publish(&self.event_publisher);
        delivered.push((hash, task.waiters));

        if let Some(dependents) = self.deliver_dependents.remove(&hash) {
            for dependent in dependents {
                if let Some(task) = self.delivery_waiting.get_mut(&dependent) {
                    task.missing_parents.remove(&hash);
                }
                self.try_complete(dependent, store, delivered)?;
            }
        }
        Ok(())
    }

    /// Drop the delivery task for `hash` and everything parked on it.
    fn reject(&mut self, hash: CryptoHash, reason: &str) {
        if self.delivery_waiting.remove(&hash).is_some() {
            log::warn!("rejecting delivery of {}: {}", hash, reason);
        }
    }

    /// Retry fetches whose current (backed-off) timeout has elapsed, rotating to the next
    /// candidate peer. Never fatal: retries continue until the block arrives.
    pub(crate) fn tick<N: Network>(&mut self, now: Instant, sender: &mut SenderHandle<N>) {
        if self.peers.is_empty() {
            return;
        }
        let max_timeout = self.retry_timeout * MAX_BACKOFF_FACTOR;
        for (hash, context) in self.fetch_waiting.iter_mut() {
            if now.duration_since(context.last_request) >= context.timeout {
                context.cursor = (context.cursor + 1) % self.peers.len();
                context.last_request = now;
                context.timeout = (context.timeout * 2).min(max_timeout);
                sender.send(
                    self.peers[context.cursor],
                    &ReqBlock {
                        blk_hashes: vec![*hash],
                    }
                    .into(),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::messages::ConsensusMessage;
    use crate::types::basic::{BlockHeight, ReplicaID};
    use crate::types::block::Block;
    use crate::types::keypair::Keypair;
    use crate::types::replica_set::ReplicaSet;
    use borsh::BorshDeserialize;
    use ed25519_dalek::SigningKey;
    use rand_core::OsRng;
    use std::sync::mpsc;
    use std::sync::{Arc, Mutex};

    /// A network that records every frame sent through it.
    #[derive(Clone)]
    struct RecordingNetwork {
        sent: Arc<Mutex<Vec<(ReplicaID, ConsensusMessage)>>>,
    }

    impl RecordingNetwork {
        fn new() -> RecordingNetwork {
            RecordingNetwork {
                sent: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn req_block_count(&self) -> usize {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, msg)| matches!(msg, ConsensusMessage::ReqBlock(_)))
                .count()
        }
    }

    impl Network for RecordingNetwork {
        fn init_overlay(&mut self, _parent: Option<ReplicaID>, _children: &[ReplicaID]) {}

        fn send(&mut self, peer: ReplicaID, message: Vec<u8>) {
            let msg = ConsensusMessage::try_from_slice(&message).unwrap();
            self.sent.lock().unwrap().push((peer, msg));
        }

        fn recv(&mut self) -> Option<(ReplicaID, Vec<u8>)> {
            None
        }
    }

    fn fixture() -> (
        FetchEngine,
        BlockStore,
        SenderHandle<RecordingNetwork>,
        RecordingNetwork,
        CryptoPool,
        Keypair,
        CryptoHash,
    ) {
        let mut csprg = OsRng {};
        let keypairs: Vec<Keypair> = (0..4)
            .map(|_| Keypair::new(SigningKey::generate(&mut csprg)))
            .collect();
        let replica_set = ReplicaSet::new(keypairs.iter().map(|kp| kp.verifying_key()).collect());
        let genesis = Block::genesis();
        let genesis_hash = genesis.hash;
        let store = BlockStore::new(genesis);
        let engine = FetchEngine::new(
            ReplicaID::new(1),
            4,
            genesis_hash,
            Duration::from_millis(100),
            None,
        );
        let network = RecordingNetwork::new();
        let sender = SenderHandle::new(network.clone());
        let (results_tx, _results_rx) = mpsc::channel();
        let pool = CryptoPool::new(1, replica_set, results_tx);
        (
            engine,
            store,
            sender,
            network,
            pool,
            keypairs[0].clone(),
            genesis_hash,
        )
    }

    /// A block whose justify is the (true) genesis QC: structurally valid without any QC
    /// verification, whatever its parent.
    fn block_at(
        height: u32,
        parent: CryptoHash,
        genesis_hash: CryptoHash,
        keypair: &Keypair,
        cmd: u8,
    ) -> Block {
        Block::new(
            BlockHeight::new(height),
            vec![parent],
            QuorumCertificate::genesis(genesis_hash),
            vec![CryptoHash::new([cmd; 32])],
            ReplicaID::new(0),
            keypair,
        )
    }

    #[test]
    fn concurrent_deliveries_of_children_send_one_req_block() {
        let (mut engine, mut store, mut sender, network, pool, keypair, genesis_hash) = fixture();

        // Bx is unknown; two of its children arrive concurrently.
        let bx = block_at(1, genesis_hash, genesis_hash, &keypair, 1);
        let child_a = block_at(2, bx.hash, genesis_hash, &keypair, 2);
        let child_b = block_at(2, bx.hash, genesis_hash, &keypair, 3);

        for child in [&child_a, &child_b] {
            store.add_blk(child.clone());
            let delivered = engine
                .deliver(
                    child.hash,
                    ReplicaID::new(0),
                    None,
                    &mut store,
                    &mut sender,
                    &pool,
                )
                .unwrap();
            assert!(delivered.is_empty());
        }

        // Both children depend on Bx, but exactly one ReqBlock left the engine. (The children's
        // justify here is the genesis QC, so no justify fetch competes with the parent fetch.)
        assert_eq!(network.req_block_count(), 1);
        assert_eq!(engine.fetches_waiting(), 1);
        assert_eq!(engine.deliveries_waiting(), 3);
    }

    #[test]
    fn delivery_completes_bottom_up_once_verifications_land() {
        let (mut engine, mut store, mut sender, _network, pool, keypair, genesis_hash) = fixture();

        let b1 = block_at(1, genesis_hash, genesis_hash, &keypair, 1);
        let b2 = block_at(2, b1.hash, genesis_hash, &keypair, 2);

        // b2 arrives first; b1 is fetched later.
        store.add_blk(b2.clone());
        engine
            .deliver(b2.hash, ReplicaID::new(0), None, &mut store, &mut sender, &pool)
            .unwrap();

        store.add_blk(b1.clone());
        engine
            .on_block_fetched(b1.hash, &mut store, &mut sender, &pool)
            .unwrap();

        // Simulate the pool results: proposer signatures of both blocks verify. b1's result
        // delivers b1; b2's result delivers b2 (its last missing precondition fell when b1
        // cascaded out of its missing-parents set).
        let mut all_delivered: Vec<CryptoHash> = Vec::new();
        for hash in [b1.hash, b2.hash] {
            let delivered = engine
                .on_verification(
                    &VerificationJob::ProposerSignature {
                        blk_hash: hash,
                        proposer: ReplicaID::new(0),
                        signature: b1.signature,
                    },
                    true,
                    &mut store,
                )
                .unwrap();
            all_delivered.extend(delivered.into_iter().map(|(h, _)| h));
        }
        assert_eq!(all_delivered, vec![b1.hash, b2.hash]);

        assert!(store.is_blk_delivered(&b1.hash));
        assert!(store.is_blk_delivered(&b2.hash));
        assert_eq!(engine.deliveries_waiting(), 0);
    }

    #[test]
    fn invalid_proposer_signature_rejects_the_delivery() {
        let (mut engine, mut store, mut sender, _network, pool, keypair, genesis_hash) = fixture();

        let b1 = block_at(1, genesis_hash, genesis_hash, &keypair, 1);
        store.add_blk(b1.clone());
        engine
            .deliver(b1.hash, ReplicaID::new(0), None, &mut store, &mut sender, &pool)
            .unwrap();

        let delivered = engine
            .on_verification(
                &VerificationJob::ProposerSignature {
                    blk_hash: b1.hash,
                    proposer: ReplicaID::new(0),
                    signature: b1.signature,
                },
                false,
                &mut store,
            )
            .unwrap();

        assert!(delivered.is_empty());
        assert!(!store.is_blk_delivered(&b1.hash));
        assert_eq!(engine.deliveries_waiting(), 0);
    }
}
