/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Pluggable proposer-selection and beat-timing policy.
//!
//! The consensus core consumes the [`Pacemaker`] as a capability set, not a base class: who
//! proposes, when the proposer beats into its next batch, and which parents a new proposal should
//! extend are all policy questions answered here. View-change and synchronization logic beyond
//! this contract lives entirely in implementations.
//!
//! Two canonical implementations are provided:
//! - [`StaticPacemaker`]: replica 0 — the aggregation root — proposes forever. The intended
//!   pairing with a tree overlay, whose vote flow converges on the root.
//! - [`RoundRobinPacemaker`]: the proposer rotates over the replica set each time a QC finishes.
//!   Intended for `fanout >= n` (star) deployments, where any replica can collect votes directly.

use crate::types::basic::{CryptoHash, ReplicaID};
use crate::types::block::Block;

/// Proposer-selection and beat-timing policy consumed by the consensus core.
///
/// `beat` and `beat_resp` are invoked by the algorithm loop at the points where a batch is ready
/// and where a vote is about to be sent, respectively; both return the proposer the decision is
/// based on. The `on_*` notifications keep the pacemaker's view of the chain current — in
/// particular [`on_hqc_update`](Pacemaker::on_hqc_update) is what lets
/// [`get_parents`](Pacemaker::get_parents) answer without access to storage.
pub trait Pacemaker: Send + 'static {
    /// The replica currently expected to propose.
    fn get_proposer(&self) -> ReplicaID;

    /// Leader-side: a batch of commands is ready. Returns the proposer for the batch; the local
    /// replica proposes iff it is that proposer.
    fn beat(&mut self) -> ReplicaID;

    /// Follower-side: about to vote on a proposal from `proposer`. Returns the replica the vote
    /// is for.
    fn beat_resp(&mut self, proposer: ReplicaID) -> ReplicaID;

    /// A block was committed.
    fn on_consensus(&mut self, _block: &Block) {}

    /// A proposal was received and processed.
    fn on_receive_proposal(&mut self, _block: &Block) {}

    /// A quorum certificate finished forming for `block` at the aggregation root.
    fn on_qc_finish(&mut self, _block: &Block) {}

    /// The highest QC moved to `block`.
    fn on_hqc_update(&mut self, _block: &Block) {}

    /// The parents a new proposal should extend, highest (primary) first.
    fn get_parents(&self) -> Vec<CryptoHash>;
}

/// A pacemaker with a fixed proposer: replica 0, the aggregation root.
pub struct StaticPacemaker {
    hqc_tail: CryptoHash,
}

impl StaticPacemaker {
    pub fn new(genesis_hash: CryptoHash) -> StaticPacemaker {
        StaticPacemaker {
            hqc_tail: genesis_hash,
        }
    }
}

impl Pacemaker for StaticPacemaker {
    fn get_proposer(&self) -> ReplicaID {
        ReplicaID::new(0)
    }

    fn beat(&mut self) -> ReplicaID {
        ReplicaID::new(0)
    }

    fn beat_resp(&mut self, _proposer: ReplicaID) -> ReplicaID {
        ReplicaID::new(0)
    }

    fn on_hqc_update(&mut self, block: &Block) {
        self.hqc_tail = block.hash;
    }

    fn get_parents(&self) -> Vec<CryptoHash> {
        vec![self.hqc_tail]
    }
}

/// A pacemaker that rotates the proposer across the replica set every time a QC finishes.
pub struct RoundRobinPacemaker {
    n: usize,
    proposer: ReplicaID,
    hqc_tail: CryptoHash,
}

impl RoundRobinPacemaker {
    pub fn new(n: usize, genesis_hash: CryptoHash) -> RoundRobinPacemaker {
        RoundRobinPacemaker {
            n,
            proposer: ReplicaID::new(0),
            hqc_tail: genesis_hash,
        }
    }
}

impl Pacemaker for RoundRobinPacemaker {
    fn get_proposer(&self) -> ReplicaID {
        self.proposer
    }

    fn beat(&mut self) -> ReplicaID {
        self.proposer
    }

    fn beat_resp(&mut self, _proposer: ReplicaID) -> ReplicaID {
        self.proposer
    }

    fn on_qc_finish(&mut self, _block: &Block) {
        self.proposer = ReplicaID::new(((self.proposer.as_index() + 1) % self.n) as u8);
    }

    fn on_hqc_update(&mut self, block: &Block) {
        self.hqc_tail = block.hash;
    }

    fn get_parents(&self) -> Vec<CryptoHash> {
        vec![self.hqc_tail]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_rotates_on_qc_finish() {
        let genesis = Block::genesis();
        let mut pacemaker = RoundRobinPacemaker::new(3, genesis.hash);
        assert_eq!(pacemaker.get_proposer(), ReplicaID::new(0));
        pacemaker.on_qc_finish(&genesis);
        assert_eq!(pacemaker.get_proposer(), ReplicaID::new(1));
        pacemaker.on_qc_finish(&genesis);
        pacemaker.on_qc_finish(&genesis);
        assert_eq!(pacemaker.get_proposer(), ReplicaID::new(0));
    }
}
