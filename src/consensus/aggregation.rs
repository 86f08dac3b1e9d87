/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Per-block accumulation of partial signatures into quorum certificates.
//!
//! Each replica runs one [`VoteAggregator`], which lazily keeps one `self_qc` accumulator per
//! block hash. What happens when an accumulator reaches its threshold depends on the replica's
//! position in the [tree overlay](crate::tree):
//!
//! - An **internal node** is responsible for one partial signature from each of its transitive
//!   descendants plus its own. At `descendant_count + 1` partials it verifies the aggregate and
//!   hands back [`AggregationOutcome::Relay`] — one [`VoteRelay`](super::messages::VoteRelay) for
//!   its tree parent — then ignores further votes and relays for that block.
//! - The **root** collects votes and relays until `nmajority` partials are present, verifies, and
//!   hands back [`AggregationOutcome::Quorum`] — a full QC ready for
//!   [`process_qc`](super::protocol::ConsensusCore::process_qc).
//!
//! Individual [`Vote`] signatures are verified on the [crypto pool](crate::crypto_pool) before
//! they reach this module. Partials inside a relayed QC are *not* individually verified — an
//! honest subtree only forwards aggregates it has verified — which is why a failed aggregate
//! verification here is a fatal protocol error rather than a droppable message.

use std::collections::HashMap;

use crate::tree::TreeOverlay;
use crate::types::basic::{CryptoHash, ReplicaID};
use crate::types::certificates::{CertificateError, QuorumCertificate};
use crate::types::keypair::Keypair;
use crate::types::replica_set::ReplicaSet;

use super::messages::{Vote, VoteRelay};

/// What an accumulator update produced.
pub(crate) enum AggregationOutcome {
    /// The threshold has not been reached (or was already reached earlier and the input was
    /// dropped).
    Pending,

    /// Internal node: the subtree's aggregate is complete and verified; forward it to the tree
    /// parent.
    Relay(QuorumCertificate),

    /// Root: a full quorum certificate has formed.
    Quorum(QuorumCertificate),
}

/// Fatal aggregation failure: an aggregate this replica formed out of a trusted subtree's
/// partials did not verify.
#[derive(Debug)]
pub struct InvalidAggregate {
    pub blk_hash: CryptoHash,
}

struct AggregationState {
    self_qc: QuorumCertificate,
    /// Internal node: the relay has been sent. Root: the quorum was handed to consensus. Either
    /// way, further votes and relays for this block are dropped.
    done: bool,
}

pub(crate) struct VoteAggregator {
    id: ReplicaID,
    keypair: Keypair,
    replica_set: ReplicaSet,
    is_root: bool,
    threshold: usize,
    states: HashMap<CryptoHash, AggregationState>,
}

impl VoteAggregator {
    pub(crate) fn new(
        id: ReplicaID,
        keypair: Keypair,
        replica_set: ReplicaSet,
        tree: &TreeOverlay,
    ) -> VoteAggregator {
        let is_root = tree.is_root();
        let threshold = if is_root {
            replica_set.nmajority()
        } else {
            tree.descendant_count() + 1
        };
        VoteAggregator {
            id,
            keypair,
            replica_set,
            is_root,
            threshold,
            states: HashMap::new(),
        }
    }

    /// Ensure an accumulator exists for `blk_hash`, seeded with this replica's own partial
    /// signature, and evaluate the threshold.
    ///
    /// Called when this replica votes for a block (leaders on propose, internal nodes on their
    /// own vote) and lazily on the first vote or relay received for a block — the block itself
    /// may not be delivered yet.
    pub(crate) fn seed(
        &mut self,
        blk_hash: CryptoHash,
    ) -> Result<AggregationOutcome, InvalidAggregate> {
        let n = self.replica_set.len();
        let id = self.id;
        let keypair = &self.keypair;
        let state = self.states.entry(blk_hash).or_insert_with(|| {
            let mut self_qc = QuorumCertificate::new(blk_hash, n);
            let signature = keypair.sign(&blk_hash.bytes());
            // A fresh slot can't conflict.
            let _ = self_qc.add_part(id, signature);
            AggregationState {
                self_qc,
                done: false,
            }
        });
        Self::try_finish(state, self.threshold, self.is_root, &self.replica_set)
    }

    /// Whether the accumulator for `blk_hash` has already produced its relay or quorum. Used to
    /// short-circuit before queueing signature verification work.
    pub(crate) fn is_done(&self, blk_hash: &CryptoHash) -> bool {
        self.states
            .get(blk_hash)
            .map(|state| state.done)
            .unwrap_or(false)
    }

    /// Fold a verified [`Vote`] into the accumulator for its block.
    pub(crate) fn on_vote(&mut self, vote: &Vote) -> Result<AggregationOutcome, InvalidAggregate> {
        let _ = self.seed(vote.blk_hash)?;
        let threshold = self.threshold;
        let is_root = self.is_root;
        let state = self
            .states
            .get_mut(&vote.blk_hash)
            .expect("seed inserted the state");
        if state.done {
            return Ok(AggregationOutcome::Pending);
        }
        let cert = vote.cert();
        if let Err(CertificateError::ConflictingPartial { replica }) =
            state.self_qc.add_part(cert.replica, cert.signature)
        {
            log::warn!("dropping conflicting vote from {} for {}", replica, vote.blk_hash);
            return Ok(AggregationOutcome::Pending);
        }
        Self::try_finish(state, threshold, is_root, &self.replica_set)
    }

    /// Merge a relayed partial QC into the accumulator for its block.
    ///
    /// The relay's partials are trusted until the aggregate check at threshold. A relay whose
    /// partials conflict with already-collected ones is discarded whole.
    pub(crate) fn on_relay(
        &mut self,
        relay: &VoteRelay,
    ) -> Result<AggregationOutcome, InvalidAggregate> {
        let _ = self.seed(relay.blk_hash)?;
        let threshold = self.threshold;
        let is_root = self.is_root;
        let state = self
            .states
            .get_mut(&relay.blk_hash)
            .expect("seed inserted the state");
        if state.done {
            return Ok(AggregationOutcome::Pending);
        }
        if let Err(err) = state.self_qc.merge_quorum(&relay.cert) {
            log::warn!(
                "dropping vote relay for {}: merge rejected ({:?})",
                relay.blk_hash,
                err
            );
            return Ok(AggregationOutcome::Pending);
        }
        Self::try_finish(state, threshold, is_root, &self.replica_set)
    }

    fn try_finish(
        state: &mut AggregationState,
        threshold: usize,
        is_root: bool,
        replica_set: &ReplicaSet,
    ) -> Result<AggregationOutcome, InvalidAggregate> {
        if state.done || !state.self_qc.has_n(threshold) {
            return Ok(AggregationOutcome::Pending);
        }
        if !state.self_qc.verify(replica_set) {
            return Err(InvalidAggregate {
                blk_hash: state.self_qc.obj_hash,
            });
        }
        state.done = true;
        if is_root {
            Ok(AggregationOutcome::Quorum(state.self_qc.clone()))
        } else {
            Ok(AggregationOutcome::Relay(state.self_qc.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::basic::ReplicaID;
    use ed25519_dalek::SigningKey;
    use rand_core::OsRng;

    fn keypairs(n: usize) -> Vec<Keypair> {
        let mut csprg = OsRng {};
        (0..n)
            .map(|_| Keypair::new(SigningKey::generate(&mut csprg)))
            .collect()
    }

    fn replica_set(kps: &[Keypair]) -> ReplicaSet {
        ReplicaSet::new(kps.iter().map(|kp| kp.verifying_key()).collect())
    }

    fn vote(kps: &[Keypair], voter: usize, blk_hash: CryptoHash) -> Vote {
        Vote::new(&kps[voter], ReplicaID::new(voter as u8), blk_hash)
    }

    #[test]
    fn internal_node_relays_its_subtree_exactly_once() {
        // Replica 1 in the n = 13, fanout = 3 tree: children 4, 5, 6, threshold 4.
        let kps = keypairs(13);
        let tree = TreeOverlay::build(13, 3, ReplicaID::new(1));
        let mut aggregator = VoteAggregator::new(
            ReplicaID::new(1),
            kps[1].clone(),
            replica_set(&kps),
            &tree,
        );

        let blk_hash = CryptoHash::new([5u8; 32]);
        assert!(matches!(
            aggregator.seed(blk_hash).unwrap(),
            AggregationOutcome::Pending
        ));
        assert!(matches!(
            aggregator.on_vote(&vote(&kps, 4, blk_hash)).unwrap(),
            AggregationOutcome::Pending
        ));
        assert!(matches!(
            aggregator.on_vote(&vote(&kps, 5, blk_hash)).unwrap(),
            AggregationOutcome::Pending
        ));

        let outcome = aggregator.on_vote(&vote(&kps, 6, blk_hash)).unwrap();
        match outcome {
            AggregationOutcome::Relay(qc) => {
                // Exactly the subtree's partials plus the aggregator's own.
                assert_eq!(qc.count(), 4);
                for voter in [1usize, 4, 5, 6] {
                    assert!(qc.signatures.get(voter).is_some());
                }
            }
            _ => panic!("expected a relay at threshold"),
        }

        // Idempotence: later votes for the block are dropped.
        assert!(aggregator.is_done(&blk_hash));
        assert!(matches!(
            aggregator.on_vote(&vote(&kps, 4, blk_hash)).unwrap(),
            AggregationOutcome::Pending
        ));
    }

    #[test]
    fn root_forms_a_quorum_from_votes_and_relays() {
        // Root of the n = 13, fanout = 3 tree: nmajority = 9.
        let kps = keypairs(13);
        let tree = TreeOverlay::build(13, 3, ReplicaID::new(0));
        let mut aggregator = VoteAggregator::new(
            ReplicaID::new(0),
            kps[0].clone(),
            replica_set(&kps),
            &tree,
        );

        let blk_hash = CryptoHash::new([6u8; 32]);
        let _ = aggregator.seed(blk_hash).unwrap();

        // Two subtree relays of four partials each: 1 + 4 + 4 = 9 = nmajority.
        for (agg_id, members) in [(1usize, [4usize, 5, 6]), (2, [7, 8, 9])] {
            let mut cert = QuorumCertificate::new(blk_hash, 13);
            cert.add_part(
                ReplicaID::new(agg_id as u8),
                kps[agg_id].sign(&blk_hash.bytes()),
            )
            .unwrap();
            for member in members {
                cert.add_part(
                    ReplicaID::new(member as u8),
                    kps[member].sign(&blk_hash.bytes()),
                )
                .unwrap();
            }
            let outcome = aggregator
                .on_relay(&VoteRelay { blk_hash, cert })
                .unwrap();
            match (agg_id, outcome) {
                (1, AggregationOutcome::Pending) => (),
                (2, AggregationOutcome::Quorum(qc)) => {
                    assert_eq!(qc.count(), 9);
                    assert!(qc.has_n(9));
                }
                _ => panic!("unexpected outcome"),
            }
        }
    }

    #[test]
    fn corrupted_relay_aggregate_is_fatal() {
        let kps = keypairs(13);
        let tree = TreeOverlay::build(13, 3, ReplicaID::new(1));
        let mut aggregator = VoteAggregator::new(
            ReplicaID::new(1),
            kps[1].clone(),
            replica_set(&kps),
            &tree,
        );

        let blk_hash = CryptoHash::new([8u8; 32]);
        let _ = aggregator.seed(blk_hash).unwrap();
        let _ = aggregator.on_vote(&vote(&kps, 4, blk_hash)).unwrap();
        let _ = aggregator.on_vote(&vote(&kps, 5, blk_hash)).unwrap();

        // A relay carrying garbage for replica 6 crosses the threshold; the aggregate check
        // must fail hard.
        let mut cert = QuorumCertificate::new(blk_hash, 13);
        cert.add_part(
            ReplicaID::new(6),
            crate::types::basic::SignatureBytes::new([1u8; 64]),
        )
        .unwrap();
        assert!(aggregator
            .on_relay(&VoteRelay { blk_hash, cert })
            .is_err());
    }
}
