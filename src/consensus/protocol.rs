/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The replica's consensus state machine: the voting rule, highest-QC tracking, and the
//! three-chain commit rule.
//!
//! [`ConsensusCore`] owns the four pieces of per-replica protocol state — `b_lock`, `b_exec`,
//! `hqc`, and `vheight` — and exposes three entry points to the [algorithm](crate::algorithm)
//! loop:
//! 1. [`on_receive_proposal`](ConsensusCore::on_receive_proposal): apply the safety rule to a
//!    delivered proposal and produce a [`Vote`] if it passes.
//! 2. [`process_qc`](ConsensusCore::process_qc): fold a newly formed or newly observed QC into the
//!    state — raise `hqc`, move the lock, and commit blocks per the three-chain rule.
//! 3. [`on_propose`](ConsensusCore::on_propose): build, store, and self-deliver a new block
//!    justified by the current `hqc` (the leader's implicit vote).
//!
//! The methods mutate nothing outside the core and the [`BlockStore`]; sending, aggregation, and
//! pacemaker notifications stay in the algorithm loop.

use crate::storage::{BlockStore, StorageError};
use crate::types::basic::{BlockHeight, CryptoHash, Finality, ReplicaID};
use crate::types::block::Block;
use crate::types::certificates::QuorumCertificate;
use crate::types::keypair::Keypair;

use super::messages::{Proposal, Vote};

/// Immutable parameters of the consensus state machine.
#[derive(Clone)]
pub(crate) struct ConsensusConfiguration {
    pub(crate) id: ReplicaID,
    pub(crate) keypair: Keypair,
}

/// The ways in which consensus state transitions can fail. All variants are fatal: they indicate
/// either storage corruption or a safety violation that must stop the replica.
#[derive(Debug)]
pub enum ConsensusError {
    Storage(StorageError),

    /// A block chosen for commit does not extend the last executed block. Committing it would
    /// fork the committed chain.
    SafetyViolation { block: CryptoHash },
}

impl From<StorageError> for ConsensusError {
    fn from(value: StorageError) -> Self {
        ConsensusError::Storage(value)
    }
}

/// State updates triggered by [`ConsensusCore::process_qc`], for the algorithm loop to turn into
/// events, pacemaker notifications, and decision callbacks.
#[derive(Default)]
pub(crate) struct QcOutcome {
    /// `hqc` was replaced by the processed QC.
    pub(crate) hqc_updated: bool,

    /// `b_lock` moved to this block.
    pub(crate) locked: Option<CryptoHash>,

    /// Blocks committed by this QC, in ascending height order, each with the [`Finality`] reports
    /// for its commands.
    pub(crate) committed: Vec<(Block, Vec<Finality>)>,
}

pub(crate) struct ConsensusCore {
    config: ConsensusConfiguration,
    b_lock: CryptoHash,
    b_lock_height: BlockHeight,
    b_exec: CryptoHash,
    b_exec_height: BlockHeight,
    hqc: QuorumCertificate,
    hqc_height: BlockHeight,
    vheight: BlockHeight,

    /// Height of the highest block seen carrying commands. While this exceeds
    /// `b_exec_height`, the proposer keeps pipelining (possibly empty) blocks so the
    /// three-chain rule can reach the payload.
    payload_height: BlockHeight,
}

impl ConsensusCore {
    /// Create the consensus state machine with every pointer at the genesis block.
    pub(crate) fn new(config: ConsensusConfiguration, genesis_hash: CryptoHash) -> ConsensusCore {
        ConsensusCore {
            config,
            b_lock: genesis_hash,
            b_lock_height: BlockHeight::new(0),
            b_exec: genesis_hash,
            b_exec_height: BlockHeight::new(0),
            hqc: QuorumCertificate::genesis(genesis_hash),
            hqc_height: BlockHeight::new(0),
            vheight: BlockHeight::new(0),
            payload_height: BlockHeight::new(0),
        }
    }

    /// Apply the voting rule to a delivered proposal, returning a [`Vote`] iff the proposal is
    /// safe to vote for. Refusal is silent.
    ///
    /// The rule: vote iff `b.height > vheight` **and** (`b` extends `b_lock` or the justified
    /// block is higher than `b_lock`). The second disjunct is the liveness clause that lets a
    /// replica abandon a lock the rest of the network has moved past.
    ///
    /// # Preconditions
    ///
    /// `proposal.block` and its justify chain are delivered.
    pub(crate) fn on_receive_proposal(
        &mut self,
        proposal: &Proposal,
        store: &BlockStore,
    ) -> Result<Option<Vote>, ConsensusError> {
        let block = &proposal.block;
        let justified_height = match block.justify_obj_hash() {
            Some(justified) => store.blk_height(&justified)?,
            // Only the genesis block has no justify, and it is never proposed.
            None => return Ok(None),
        };

        if !block.commands.is_empty() && block.height > self.payload_height {
            self.payload_height = block.height;
        }

        let safe = block.height > self.vheight
            && (store.extends(&block.hash, &self.b_lock)? || justified_height > self.b_lock_height);
        if !safe {
            return Ok(None);
        }

        self.vheight = block.height;
        Ok(Some(Vote::new(
            &self.config.keypair,
            self.config.id,
            block.hash,
        )))
    }

    /// Fold a newly formed or newly observed QC into the consensus state.
    ///
    /// Raises `hqc` if the certified block is higher, then evaluates the three-chain rule: with
    /// `b3` the certified block, `b2 = b3.justify.block`, `b1 = b2.justify.block` and
    /// `b0 = b1.justify.block`, two consecutive direct-parent links (`b2` → `b1` → `b0`) lock
    /// `b1` and commit `b0` together with its unexecuted ancestors, in ascending height order.
    ///
    /// # Preconditions
    ///
    /// The certified block is delivered, and the QC has either been collected locally from
    /// verified partials or arrived inside a block whose justify was verified during delivery.
    pub(crate) fn process_qc(
        &mut self,
        qc: &QuorumCertificate,
        store: &mut BlockStore,
    ) -> Result<QcOutcome, ConsensusError> {
        let mut outcome = QcOutcome::default();

        let b3 = store.expect_blk(&qc.obj_hash)?;
        let b3_height = b3.height;

        // 1-chain: monotone hqc.
        if b3_height > self.hqc_height {
            self.hqc = qc.clone();
            self.hqc_height = b3_height;
            outcome.hqc_updated = true;
        }

        // Walk the justify chain: b3 -> b2 -> b1 -> b0.
        let b2_hash = match b3.justify_obj_hash() {
            Some(h) => h,
            None => return Ok(outcome),
        };
        let b2 = store.expect_blk(&b2_hash)?;
        let b1_hash = match b2.justify_obj_hash() {
            Some(h) => h,
            None => return Ok(outcome),
        };
        let b2_parent = b2.parent().copied();
        let b1 = store.expect_blk(&b1_hash)?;
        let b1_height = b1.height;
        let b0_hash = match b1.justify_obj_hash() {
            Some(h) => h,
            None => return Ok(outcome),
        };
        let b1_parent = b1.parent().copied();

        // Two consecutive direct-parent links in the QC chain.
        if b2_parent != Some(b1_hash) || b1_parent != Some(b0_hash) {
            return Ok(outcome);
        }

        // 2-chain: lock b1.
        if b1_height > self.b_lock_height {
            self.b_lock = b1_hash;
            self.b_lock_height = b1_height;
            outcome.locked = Some(b1_hash);
        }

        // 3-chain: commit b0 and its unexecuted ancestors.
        outcome.committed = self.commit(b0_hash, store)?;
        Ok(outcome)
    }

    /// Commit `target` and every ancestor of it that has not been executed yet, in ascending
    /// height order. Advances `b_exec` and fills the command cache.
    fn commit(
        &mut self,
        target: CryptoHash,
        store: &mut BlockStore,
    ) -> Result<Vec<(Block, Vec<Finality>)>, ConsensusError> {
        let target_height = store.blk_height(&target)?;
        if target_height <= self.b_exec_height {
            return Ok(Vec::new());
        }
        if !store.extends(&target, &self.b_exec)? {
            return Err(ConsensusError::SafetyViolation { block: target });
        }

        // Collect the branch from target down to (exclusive) b_exec, then execute it oldest
        // first.
        let mut branch = Vec::new();
        let mut cursor = target;
        while cursor != self.b_exec {
            let block = store.expect_blk(&cursor)?;
            cursor = *block
                .parent()
                .ok_or(StorageError::BlockExpectedButNotFound { block: cursor })?;
            branch.push(block.clone());
        }
        branch.reverse();

        let mut committed = Vec::with_capacity(branch.len());
        for block in branch {
            let finalities: Vec<Finality> = block
                .commands
                .iter()
                .enumerate()
                .map(|(cmd_idx, cmd_hash)| Finality {
                    replica: self.config.id,
                    decision: 1,
                    cmd_idx: cmd_idx as u32,
                    blk_height: block.height,
                    cmd_hash: *cmd_hash,
                    blk_hash: block.hash,
                })
                .collect();
            for cmd_hash in &block.commands {
                store.cache_cmd(*cmd_hash, block.hash);
            }
            self.b_exec = block.hash;
            self.b_exec_height = block.height;
            committed.push((block, finalities));
        }
        Ok(committed)
    }

    /// Build a new block carrying `commands` on top of `parents` (the first entry is the primary
    /// parent), justified by the current `hqc`, and record it as delivered — proposing counts as
    /// an implicit vote, so `vheight` advances to the new block's height.
    pub(crate) fn on_propose(
        &mut self,
        commands: Vec<CryptoHash>,
        parents: Vec<CryptoHash>,
        store: &mut BlockStore,
    ) -> Result<Proposal, ConsensusError> {
        let primary = parents
            .first()
            .ok_or(StorageError::BlockExpectedButNotFound {
                block: CryptoHash::new([0u8; 32]),
            })?;
        let height = store.blk_height(primary)? + 1;

        let block = Block::new(
            height,
            parents.clone(),
            self.hqc.clone(),
            commands,
            self.config.id,
            &self.config.keypair,
        );

        store.add_blk(block.clone());
        store.mark_delivered(&block.hash)?;

        self.vheight = height;
        if !block.commands.is_empty() && height > self.payload_height {
            self.payload_height = height;
        }

        Ok(Proposal {
            proposer: self.config.id,
            block,
        })
    }

    /// Whether some block carrying commands is above `b_exec`. While true, a finished QC beats
    /// the proposer into the next (possibly empty) block so the three-chain rule can reach the
    /// payload; once false, the chain quiesces.
    pub(crate) fn payload_pending(&self) -> bool {
        self.payload_height > self.b_exec_height
    }

    /// The QC on the highest block this replica has observed.
    pub(crate) fn hqc(&self) -> &QuorumCertificate {
        &self.hqc
    }

    #[cfg(test)]
    pub(crate) fn b_exec(&self) -> CryptoHash {
        self.b_exec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand_core::OsRng;

    fn core_and_store() -> (ConsensusCore, BlockStore, Keypair, CryptoHash) {
        let mut csprg = OsRng {};
        let keypair = Keypair::new(SigningKey::generate(&mut csprg));
        let genesis = Block::genesis();
        let genesis_hash = genesis.hash;
        let core = ConsensusCore::new(
            ConsensusConfiguration {
                id: ReplicaID::new(0),
                keypair: keypair.clone(),
            },
            genesis_hash,
        );
        (core, BlockStore::new(genesis), keypair, genesis_hash)
    }

    /// A QC "collected" for tests: partials are not checked by the core.
    fn qc_on(hash: CryptoHash) -> QuorumCertificate {
        QuorumCertificate::new(hash, 4)
    }

    fn extend(
        store: &mut BlockStore,
        parent: CryptoHash,
        justify: QuorumCertificate,
        commands: Vec<CryptoHash>,
        keypair: &Keypair,
    ) -> Block {
        let height = store.blk_height(&parent).unwrap() + 1;
        let block = Block::new(
            height,
            vec![parent],
            justify,
            commands,
            ReplicaID::new(0),
            keypair,
        );
        store.add_blk(block.clone());
        store.mark_delivered(&block.hash).unwrap();
        block
    }

    #[test]
    fn three_chain_commits_exactly_on_the_fourth_qc() {
        let (mut core, mut store, keypair, genesis_hash) = core_and_store();

        let cmd = CryptoHash::new([1u8; 32]);
        let b1 = extend(
            &mut store,
            genesis_hash,
            QuorumCertificate::genesis(genesis_hash),
            vec![cmd],
            &keypair,
        );
        let b2 = extend(&mut store, b1.hash, qc_on(b1.hash), Vec::new(), &keypair);
        let b3 = extend(&mut store, b2.hash, qc_on(b2.hash), Vec::new(), &keypair);
        let b4 = extend(&mut store, b3.hash, qc_on(b3.hash), Vec::new(), &keypair);

        // QCs up to and including the one on B3 commit nothing above genesis.
        for hash in [b1.hash, b2.hash, b3.hash] {
            let outcome = core.process_qc(&qc_on(hash), &mut store).unwrap();
            assert!(outcome.committed.is_empty());
        }
        assert_eq!(core.b_exec(), genesis_hash);

        // The QC on B4 locks B2 and commits B1.
        let outcome = core.process_qc(&qc_on(b4.hash), &mut store).unwrap();
        assert_eq!(outcome.locked, Some(b2.hash));
        assert_eq!(outcome.committed.len(), 1);
        let (committed_block, finalities) = &outcome.committed[0];
        assert_eq!(committed_block.hash, b1.hash);
        assert_eq!(finalities.len(), 1);
        assert_eq!(finalities[0].cmd_hash, cmd);
        assert_eq!(finalities[0].decision, 1);
        assert_eq!(core.b_exec(), b1.hash);
        assert_eq!(store.cached_cmd(&cmd), Some(&b1.hash));
    }

    #[test]
    fn hqc_height_is_monotone() {
        let (mut core, mut store, keypair, genesis_hash) = core_and_store();
        let b1 = extend(
            &mut store,
            genesis_hash,
            QuorumCertificate::genesis(genesis_hash),
            Vec::new(),
            &keypair,
        );
        let b2 = extend(&mut store, b1.hash, qc_on(b1.hash), Vec::new(), &keypair);

        assert!(core.process_qc(&qc_on(b2.hash), &mut store).unwrap().hqc_updated);
        assert_eq!(core.hqc().obj_hash, b2.hash);

        // A lower QC arriving later must not lower hqc.
        assert!(!core.process_qc(&qc_on(b1.hash), &mut store).unwrap().hqc_updated);
        assert_eq!(core.hqc().obj_hash, b2.hash);
    }

    #[test]
    fn refuses_to_vote_twice_at_the_same_height() {
        let (mut core, mut store, keypair, genesis_hash) = core_and_store();

        let b1 = extend(
            &mut store,
            genesis_hash,
            QuorumCertificate::genesis(genesis_hash),
            vec![CryptoHash::new([1u8; 32])],
            &keypair,
        );
        let proposal = Proposal {
            proposer: ReplicaID::new(0),
            block: b1.clone(),
        };
        assert!(core.on_receive_proposal(&proposal, &store).unwrap().is_some());

        // A conflicting block at the same height, different commands.
        let b1_prime = extend(
            &mut store,
            genesis_hash,
            QuorumCertificate::genesis(genesis_hash),
            vec![CryptoHash::new([2u8; 32])],
            &keypair,
        );
        let conflicting = Proposal {
            proposer: ReplicaID::new(0),
            block: b1_prime,
        };
        assert!(core.on_receive_proposal(&conflicting, &store).unwrap().is_none());

        // But a block extending the chain at the next height is votable.
        let b2 = extend(&mut store, b1.hash, qc_on(b1.hash), Vec::new(), &keypair);
        let next = Proposal {
            proposer: ReplicaID::new(0),
            block: b2,
        };
        assert!(core.on_receive_proposal(&next, &store).unwrap().is_some());
    }

    #[test]
    fn payload_pending_tracks_uncommitted_commands() {
        let (mut core, mut store, _keypair, genesis_hash) = core_and_store();
        assert!(!core.payload_pending());

        let proposal = core
            .on_propose(
                vec![CryptoHash::new([1u8; 32])],
                vec![genesis_hash],
                &mut store,
            )
            .unwrap();
        assert!(core.payload_pending());

        // Pipeline three empty blocks, each justified by the QC on its parent; committing the
        // payload block quiesces the core.
        let b1 = proposal.block;
        let _ = core.process_qc(&qc_on(b1.hash), &mut store).unwrap();
        let b2 = core.on_propose(Vec::new(), vec![b1.hash], &mut store).unwrap().block;
        let _ = core.process_qc(&qc_on(b2.hash), &mut store).unwrap();
        let b3 = core.on_propose(Vec::new(), vec![b2.hash], &mut store).unwrap().block;
        let _ = core.process_qc(&qc_on(b3.hash), &mut store).unwrap();
        let b4 = core.on_propose(Vec::new(), vec![b3.hash], &mut store).unwrap().block;
        assert!(core.payload_pending());

        let outcome = core.process_qc(&qc_on(b4.hash), &mut store).unwrap();
        assert_eq!(outcome.committed[0].0.hash, b1.hash);
        assert!(!core.payload_pending());
    }
}
