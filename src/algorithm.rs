/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The protocol event loop: a single thread that owns all consensus state and routes every input
//! through typed handlers.
//!
//! All mutation of [`ConsensusCore`], [`VoteAggregator`], [`FetchEngine`], and [`BlockStore`]
//! happens on this thread. The loop drains four input channels:
//! 1. Raw message frames from the [poller](crate::networking::start_polling) — parsed here, after
//!    the admission check (postponed parse), and dispatched to one handler per message type.
//! 2. Verification outcomes from the [crypto pool](crate::crypto_pool) — resumed into the fetch
//!    pipeline (proposer signatures, justify QCs) or the vote aggregator (vote signatures).
//! 3. Command submissions from [`Replica::submit_command`](crate::replica::Replica).
//! 4. The shutdown signal.
//!
//! Handlers that need a block delivered park a continuation in the fetch engine; the loop resumes
//! it when the delivery completes. Handlers re-check their thresholds and flags on resumption,
//! since the world can advance between suspension and resumption.
//!
//! Errors follow the taxonomy in the crate doc: malformed frames and unknown peers are dropped
//! silently, invalid signatures drop the offending item with a warning, and protocol errors
//! (an invalid aggregate from a trusted subtree, a commit that would fork the executed chain,
//! storage corruption) terminate the loop — and with it, the replica.

use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use borsh::BorshDeserialize;

use crate::command_queue::{CommandQueue, DecisionCallback, EnqueueOutcome};
use crate::consensus::aggregation::{AggregationOutcome, InvalidAggregate, VoteAggregator};
use crate::consensus::messages::{
    ConsensusMessage, Proposal, ReqBlock, RespBlock, Vote, VoteRelay,
};
use crate::consensus::protocol::{ConsensusCore, ConsensusError, QcOutcome};
use crate::crypto_pool::{CryptoPool, VerificationJob, VerificationOutcome};
use crate::events::*;
use crate::fetch::{Delivered, DeliveryWaiter, FetchEngine};
use crate::networking::{Network, SenderHandle};
use crate::pacemaker::Pacemaker;
use crate::storage::{BlockStore, StorageError};
use crate::tree::TreeOverlay;
use crate::types::basic::{CryptoHash, Finality, ReplicaID};
use crate::types::certificates::QuorumCertificate;

/// How many inputs to drain from one channel before giving the other channels a turn.
const DRAIN_LIMIT: usize = 64;

/// How often the loop logs its statistics summary.
const STATS_INTERVAL: Duration = Duration::from_secs(10);

/// The fatal failure modes of the event loop.
#[derive(Debug)]
pub enum AlgorithmError {
    Storage(StorageError),
    Consensus(ConsensusError),

    /// An aggregate formed out of a trusted subtree's partials failed verification.
    InvalidAggregate { blk_hash: CryptoHash },
}

impl From<StorageError> for AlgorithmError {
    fn from(value: StorageError) -> Self {
        AlgorithmError::Storage(value)
    }
}

impl From<ConsensusError> for AlgorithmError {
    fn from(value: ConsensusError) -> Self {
        AlgorithmError::Consensus(value)
    }
}

impl From<InvalidAggregate> for AlgorithmError {
    fn from(value: InvalidAggregate) -> Self {
        AlgorithmError::InvalidAggregate {
            blk_hash: value.blk_hash,
        }
    }
}

/// Windowed and lifetime counters, reported to the log every [`STATS_INTERVAL`].
struct Statistics {
    fetched: u64,
    decided: u64,
    proposed: u64,
    part_fetched: u64,
    part_decided: u64,
    part_proposed: u64,
    last_report: Instant,
}

impl Statistics {
    fn new() -> Statistics {
        Statistics {
            fetched: 0,
            decided: 0,
            proposed: 0,
            part_fetched: 0,
            part_decided: 0,
            part_proposed: 0,
            last_report: Instant::now(),
        }
    }

    fn on_fetched(&mut self) {
        self.fetched += 1;
        self.part_fetched += 1;
    }

    fn on_decided(&mut self) {
        self.decided += 1;
        self.part_decided += 1;
    }

    fn on_proposed(&mut self) {
        self.proposed += 1;
        self.part_proposed += 1;
    }
}

pub(crate) struct Algorithm<N: Network, P: Pacemaker> {
    id: ReplicaID,
    replica_count: usize,
    tree: TreeOverlay,
    core: ConsensusCore,
    store: BlockStore,
    fetch: FetchEngine,
    aggregator: VoteAggregator,
    queue: CommandQueue,
    pacemaker: P,
    sender: SenderHandle<N>,
    crypto: CryptoPool,
    msg_receiver: Receiver<(ReplicaID, Vec<u8>)>,
    verification_receiver: Receiver<VerificationOutcome>,
    cmd_receiver: Receiver<(CryptoHash, DecisionCallback)>,
    shutdown_signal: Receiver<()>,
    event_publisher: Option<Sender<Event>>,
    stats: Statistics,
}

/// Spawn the algorithm thread.
#[allow(clippy::too_many_arguments)]
pub(crate) fn start_algorithm<N: Network, P: Pacemaker>(
    id: ReplicaID,
    replica_count: usize,
    tree: TreeOverlay,
    core: ConsensusCore,
    store: BlockStore,
    fetch: FetchEngine,
    aggregator: VoteAggregator,
    queue: CommandQueue,
    pacemaker: P,
    sender: SenderHandle<N>,
    crypto: CryptoPool,
    msg_receiver: Receiver<(ReplicaID, Vec<u8>)>,
    verification_receiver: Receiver<VerificationOutcome>,
    cmd_receiver: Receiver<(CryptoHash, DecisionCallback)>,
    shutdown_signal: Receiver<()>,
    event_publisher: Option<Sender<Event>>,
) -> JoinHandle<()> {
    let mut algorithm = Algorithm {
        id,
        replica_count,
        tree,
        core,
        store,
        fetch,
        aggregator,
        queue,
        pacemaker,
        sender,
        crypto,
        msg_receiver,
        verification_receiver,
        cmd_receiver,
        shutdown_signal,
        event_publisher,
        stats: Statistics::new(),
    };
    thread::spawn(move || {
        if let Err(err) = algorithm.execute() {
            log::error!("fatal protocol error, stopping replica: {:?}", err);
        }
    })
}

impl<N: Network, P: Pacemaker> Algorithm<N, P> {
    fn execute(&mut self) -> Result<(), AlgorithmError> {
        loop {
            match self.shutdown_signal.try_recv() {
                Ok(()) => return Ok(()),
                Err(TryRecvError::Empty) => (),
                Err(TryRecvError::Disconnected) => return Ok(()),
            }

            let mut worked = false;

            for _ in 0..DRAIN_LIMIT {
                match self.msg_receiver.try_recv() {
                    Ok((origin, frame)) => {
                        worked = true;
                        self.on_frame(origin, frame)?;
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return Ok(()),
                }
            }

            for _ in 0..DRAIN_LIMIT {
                match self.verification_receiver.try_recv() {
                    Ok(outcome) => {
                        worked = true;
                        self.on_verification_outcome(outcome)?;
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return Ok(()),
                }
            }

            for _ in 0..DRAIN_LIMIT {
                match self.cmd_receiver.try_recv() {
                    Ok((cmd_hash, callback)) => {
                        worked = true;
                        self.on_command(cmd_hash, callback)?;
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return Ok(()),
                }
            }

            self.fetch.tick(Instant::now(), &mut self.sender);
            self.maybe_report_stats();

            if !worked {
                thread::sleep(Duration::from_millis(1));
            }
        }
    }

    /// Admit, parse, and dispatch one raw frame. Unknown peers and malformed frames are dropped
    /// silently.
    fn on_frame(&mut self, origin: ReplicaID, frame: Vec<u8>) -> Result<(), AlgorithmError> {
        if origin.as_index() >= self.replica_count || origin == self.id {
            return Ok(());
        }
        let message = match ConsensusMessage::try_from_slice(&frame) {
            Ok(message) => message,
            Err(_) => {
                log::debug!("dropping malformed frame from {}", origin);
                return Ok(());
            }
        };
        match message {
            ConsensusMessage::Propose(proposal) => self.on_propose_msg(origin, proposal),
            ConsensusMessage::Vote(vote) => self.on_vote_msg(origin, vote),
            ConsensusMessage::ReqBlock(req) => self.on_req_block(origin, req),
            ConsensusMessage::RespBlock(resp) => self.on_resp_block(origin, resp),
            ConsensusMessage::VoteRelay(relay) => self.on_vote_relay_msg(origin, relay),
        }
    }

    fn on_propose_msg(
        &mut self,
        origin: ReplicaID,
        proposal: Proposal,
    ) -> Result<(), AlgorithmError> {
        Event::ReceiveProposal(ReceiveProposalEvent {
            timestamp: SystemTime::now(),
            origin,
            proposal: proposal.clone(),
        })
        .publish(&self.event_publisher);

        // 1. Relay down the tree before doing any local work, so the pipeline fans out.
        let relay_msg: ConsensusMessage = proposal.clone().into();
        for child in self.tree.children().to_vec() {
            self.sender.send(child, &relay_msg);
        }

        // 2. The proposal carries the block: store it and resume anything waiting on its bytes.
        let blk_hash = proposal.block.hash;
        self.insert_block_if_new(&proposal.block);
        let delivered = self
            .fetch
            .on_block_fetched(blk_hash, &mut self.store, &mut self.sender, &self.crypto)?;
        self.process_deliveries(delivered)?;

        // 3. Park the proposal on the block's delivery.
        let delivered = self.fetch.deliver(
            blk_hash,
            origin,
            Some(DeliveryWaiter::Proposal(proposal)),
            &mut self.store,
            &mut self.sender,
            &self.crypto,
        )?;
        self.process_deliveries(delivered)
    }

    fn on_vote_msg(&mut self, origin: ReplicaID, vote: Vote) -> Result<(), AlgorithmError> {
        Event::ReceiveVote(ReceiveVoteEvent {
            timestamp: SystemTime::now(),
            origin,
            vote: vote.clone(),
        })
        .publish(&self.event_publisher);

        // Idempotent short-circuit: once this replica's relay is sent or the quorum formed,
        // further votes are dropped before costing verification work.
        if self.aggregator.is_done(&vote.blk_hash) {
            return Ok(());
        }

        let blk_hash = vote.blk_hash;
        let outcome = self.aggregator.seed(blk_hash)?;
        self.handle_aggregation(blk_hash, origin, outcome)?;

        self.crypto.submit(VerificationJob::VoteSignature { vote });

        // Make sure this replica eventually delivers the block being voted on.
        let delivered = self.fetch.deliver(
            blk_hash,
            origin,
            None,
            &mut self.store,
            &mut self.sender,
            &self.crypto,
        )?;
        self.process_deliveries(delivered)
    }

    fn on_vote_relay_msg(
        &mut self,
        origin: ReplicaID,
        relay: VoteRelay,
    ) -> Result<(), AlgorithmError> {
        Event::ReceiveVoteRelay(ReceiveVoteRelayEvent {
            timestamp: SystemTime::now(),
            origin,
            relay: relay.clone(),
        })
        .publish(&self.event_publisher);

        if self.aggregator.is_done(&relay.blk_hash) {
            return Ok(());
        }

        let blk_hash = relay.blk_hash;
        let outcome = self.aggregator.on_relay(&relay)?;
        self.handle_aggregation(blk_hash, origin, outcome)?;

        let delivered = self.fetch.deliver(
            blk_hash,
            origin,
            None,
            &mut self.store,
            &mut self.sender,
            &self.crypto,
        )?;
        self.process_deliveries(delivered)
    }

    fn on_req_block(&mut self, origin: ReplicaID, req: ReqBlock) -> Result<(), AlgorithmError> {
        let blocks: Vec<_> = req
            .blk_hashes
            .iter()
            .filter_map(|hash| self.store.find_blk(hash).cloned())
            .collect();
        if !blocks.is_empty() {
            self.sender.send(origin, &RespBlock { blocks }.into());
        }
        Ok(())
    }

    fn on_resp_block(&mut self, _origin: ReplicaID, resp: RespBlock) -> Result<(), AlgorithmError> {
        for block in resp.blocks {
            let blk_hash = block.hash;
            self.insert_block_if_new(&block);
            let delivered = self.fetch.on_block_fetched(
                blk_hash,
                &mut self.store,
                &mut self.sender,
                &self.crypto,
            )?;
            self.process_deliveries(delivered)?;
        }
        Ok(())
    }

    fn insert_block_if_new(&mut self, block: &crate::types::block::Block) {
        if !self.store.is_blk_fetched(&block.hash) {
            self.store.add_blk(block.clone());
            self.stats.on_fetched();
            Event::InsertBlock(InsertBlockEvent {
                timestamp: SystemTime::now(),
                block: block.clone(),
            })
            .publish(&self.event_publisher);
        }
    }

    /// Resume the continuations of completed deliveries.
    fn process_deliveries(&mut self, delivered: Vec<Delivered>) -> Result<(), AlgorithmError> {
        for (_blk_hash, waiters) in delivered {
            for waiter in waiters {
                match waiter {
                    DeliveryWaiter::Proposal(proposal) => self.on_proposal_delivered(proposal)?,
                    DeliveryWaiter::QcFinish(qc) => self.finish_qc(qc)?,
                }
            }
        }
        Ok(())
    }

    /// A proposal's block (and justify chain) finished delivery: apply the voting rule, vote if
    /// it passes, and fold the proposal's justify into the consensus state.
    fn on_proposal_delivered(&mut self, proposal: Proposal) -> Result<(), AlgorithmError> {
        let vote = self.core.on_receive_proposal(&proposal, &self.store)?;

        if let Some(vote) = vote {
            self.do_vote(proposal.proposer, vote)?;
        }

        if let Some(justify) = proposal.block.justify.clone() {
            let outcome = self.core.process_qc(&justify, &mut self.store)?;
            self.apply_qc_outcome(outcome)?;
        }

        self.pacemaker.on_receive_proposal(&proposal.block);
        Ok(())
    }

    /// Cast this replica's vote: leaves send it to their tree parent, internal nodes (and the
    /// root, under rotating proposers) seed their own aggregator with it.
    fn do_vote(&mut self, proposer: ReplicaID, vote: Vote) -> Result<(), AlgorithmError> {
        let _ = self.pacemaker.beat_resp(proposer);

        match self.tree.parent() {
            Some(parent) if self.tree.is_leaf() => {
                Event::Vote(VoteEvent {
                    timestamp: SystemTime::now(),
                    vote: vote.clone(),
                })
                .publish(&self.event_publisher);
                self.sender.send(parent, &vote.into());
            }
            _ => {
                let blk_hash = vote.blk_hash;
                let outcome = self.aggregator.seed(blk_hash)?;
                self.handle_aggregation(blk_hash, proposer, outcome)?;
            }
        }
        Ok(())
    }

    fn on_verification_outcome(
        &mut self,
        outcome: VerificationOutcome,
    ) -> Result<(), AlgorithmError> {
        match &outcome.job {
            VerificationJob::VoteSignature { vote } => {
                if !outcome.ok {
                    log::warn!("dropping invalid vote from {}", vote.voter);
                    return Ok(());
                }
                if self.aggregator.is_done(&vote.blk_hash) {
                    return Ok(());
                }
                let blk_hash = vote.blk_hash;
                let aggregation = self.aggregator.on_vote(vote)?;
                self.handle_aggregation(blk_hash, vote.voter, aggregation)
            }
            job => {
                if !outcome.ok {
                    if let VerificationJob::ProposerSignature { blk_hash, proposer, .. } = job {
                        log::warn!(
                            "invalid proposer signature from {} on block {}",
                            proposer,
                            blk_hash
                        );
                    }
                }
                let delivered = self.fetch.on_verification(job, outcome.ok, &mut self.store)?;
                self.process_deliveries(delivered)
            }
        }
    }

    /// Act on an aggregation threshold being crossed.
    fn handle_aggregation(
        &mut self,
        blk_hash: CryptoHash,
        origin: ReplicaID,
        outcome: AggregationOutcome,
    ) -> Result<(), AlgorithmError> {
        match outcome {
            AggregationOutcome::Pending => Ok(()),
            AggregationOutcome::Relay(cert) => {
                let parent = match self.tree.parent() {
                    Some(parent) => parent,
                    // Unreachable in practice: the root's aggregator yields Quorum, not Relay.
                    None => return Ok(()),
                };
                let relay = VoteRelay { blk_hash, cert };
                Event::RelayVote(RelayVoteEvent {
                    timestamp: SystemTime::now(),
                    relay: relay.clone(),
                })
                .publish(&self.event_publisher);
                self.sender.send(parent, &relay.into());
                Ok(())
            }
            AggregationOutcome::Quorum(qc) => {
                Event::CollectQC(CollectQCEvent {
                    timestamp: SystemTime::now(),
                    quorum_certificate: qc.clone(),
                })
                .publish(&self.event_publisher);

                // The certified block is usually delivered already (the root proposed it); if
                // not, finish the QC once it is.
                let delivered = self.fetch.deliver(
                    blk_hash,
                    origin,
                    Some(DeliveryWaiter::QcFinish(qc)),
                    &mut self.store,
                    &mut self.sender,
                    &self.crypto,
                )?;
                self.process_deliveries(delivered)
            }
        }
    }

    /// A full QC formed for a delivered block: fold it into the consensus state, notify the
    /// pacemaker, and keep the pipeline moving.
    fn finish_qc(&mut self, qc: QuorumCertificate) -> Result<(), AlgorithmError> {
        let block = self.store.expect_blk(&qc.obj_hash)?.clone();

        // Decided before folding the QC in: when this QC is the one that commits the payload,
        // one more (empty) block still goes out so the other replicas observe the QC chain that
        // commits it.
        let keep_pipelining = self.core.payload_pending();

        let outcome = self.core.process_qc(&qc, &mut self.store)?;
        self.apply_qc_outcome(outcome)?;

        self.pacemaker.on_qc_finish(&block);
        self.maybe_pipeline_next(keep_pipelining)
    }

    /// Turn a [`QcOutcome`] into events, pacemaker notifications, and decision callbacks.
    fn apply_qc_outcome(&mut self, outcome: QcOutcome) -> Result<(), AlgorithmError> {
        if outcome.hqc_updated {
            let hqc = self.core.hqc().clone();
            let hqc_block = self.store.expect_blk(&hqc.obj_hash)?.clone();
            self.pacemaker.on_hqc_update(&hqc_block);
            Event::UpdateHighestQC(UpdateHighestQCEvent {
                timestamp: SystemTime::now(),
                highest_qc: hqc,
            })
            .publish(&self.event_publisher);
        }

        if let Some(locked) = outcome.locked {
            Event::UpdateLockedBlock(UpdateLockedBlockEvent {
                timestamp: SystemTime::now(),
                block: locked,
            })
            .publish(&self.event_publisher);
        }

        for (block, finalities) in outcome.committed {
            Event::CommitBlock(CommitBlockEvent {
                timestamp: SystemTime::now(),
                block: block.hash,
                height: block.height,
            })
            .publish(&self.event_publisher);
            self.pacemaker.on_consensus(&block);
            for finality in finalities {
                self.do_decide(finality);
            }
        }
        Ok(())
    }

    fn do_decide(&mut self, finality: Finality) {
        self.stats.on_decided();
        Event::Decide(DecideEvent {
            timestamp: SystemTime::now(),
            finality,
        })
        .publish(&self.event_publisher);
        self.queue.resolve(finality);
    }

    fn on_command(
        &mut self,
        cmd_hash: CryptoHash,
        callback: DecisionCallback,
    ) -> Result<(), AlgorithmError> {
        // Resubmission of a command that already committed is answered from the command cache.
        if let Some(blk_hash) = self.store.cached_cmd(&cmd_hash).copied() {
            let block = self.store.expect_blk(&blk_hash)?;
            let cmd_idx = block
                .commands
                .iter()
                .position(|cmd| *cmd == cmd_hash)
                .unwrap_or(0) as u32;
            callback(Finality {
                replica: self.id,
                decision: 1,
                cmd_idx,
                blk_height: block.height,
                cmd_hash,
                blk_hash,
            });
            return Ok(());
        }

        let is_proposer = self.pacemaker.get_proposer() == self.id;
        match self.queue.enqueue(cmd_hash, callback, is_proposer) {
            EnqueueOutcome::BatchReady => {
                if self.pacemaker.beat() == self.id {
                    let commands = self.queue.drain_batch();
                    self.propose(commands)?;
                }
                Ok(())
            }
            EnqueueOutcome::Buffered | EnqueueOutcome::Duplicate => Ok(()),
        }
    }

    /// After a QC finishes: keep proposing (possibly empty) blocks while commands are buffered or
    /// a payload-carrying block was still above `b_exec` when the QC arrived, so the three-chain
    /// rule keeps advancing and reaches every replica.
    fn maybe_pipeline_next(&mut self, keep_pipelining: bool) -> Result<(), AlgorithmError> {
        if self.pacemaker.get_proposer() != self.id {
            return Ok(());
        }
        let commands = self.queue.drain_batch();
        if commands.is_empty() && !keep_pipelining {
            return Ok(());
        }
        if self.pacemaker.beat() == self.id {
            self.propose(commands)?;
        }
        Ok(())
    }

    fn propose(&mut self, commands: Vec<CryptoHash>) -> Result<(), AlgorithmError> {
        let parents = self.pacemaker.get_parents();
        let proposal = self.core.on_propose(commands, parents, &mut self.store)?;
        self.stats.on_proposed();

        Event::InsertBlock(InsertBlockEvent {
            timestamp: SystemTime::now(),
            block: proposal.block.clone(),
        })
        .publish(&self.event_publisher);
        Event::Propose(ProposeEvent {
            timestamp: SystemTime::now(),
            proposal: proposal.clone(),
        })
        .publish(&self.event_publisher);

        // The proposer's own proposal is its implicit vote.
        let blk_hash = proposal.block.hash;
        let outcome = self.aggregator.seed(blk_hash)?;
        self.handle_aggregation(blk_hash, self.id, outcome)?;

        // Disseminate: down the tree from the root; a non-root proposer cannot use the tree and
        // sends to everyone.
        let message: ConsensusMessage = proposal.into();
        if self.tree.is_root() {
            for child in self.tree.children().to_vec() {
                self.sender.send(child, &message);
            }
        } else {
            for peer in (0..self.replica_count as u8).map(ReplicaID::new) {
                if peer != self.id {
                    self.sender.send(peer, &message);
                }
            }
        }
        Ok(())
    }

    fn maybe_report_stats(&mut self) {
        if self.stats.last_report.elapsed() < STATS_INTERVAL {
            return;
        }
        self.stats.last_report = Instant::now();
        log::debug!(
            "stats: blocks={}, cmd_cache={}, fetch_waiting={}, delivery_waiting={}, decision_waiting={}",
            self.store.blk_count(),
            self.store.cmd_cache_size(),
            self.fetch.fetches_waiting(),
            self.fetch.deliveries_waiting(),
            self.queue.decisions_waiting(),
        );
        log::debug!(
            "stats (10s): fetched={}, delivered={}, decided={}, proposed={} (totals: {}, {}, {}, {})",
            std::mem::take(&mut self.stats.part_fetched),
            self.fetch.take_delivered_window(),
            std::mem::take(&mut self.stats.part_decided),
            std::mem::take(&mut self.stats.part_proposed),
            self.stats.fetched,
            self.fetch.delivered_total(),
            self.stats.decided,
            self.stats.proposed,
        );
    }
}
