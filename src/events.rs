/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Notifications that are emitted when significant things happen in the local replica.
//!
//! ## Event enum
//!
//! Significant occurrences in the replica include inserting or delivering a block, proposing,
//! voting, collecting a quorum certificate, and committing. Each corresponds to a variant of the
//! [event enum](Event), whose inner struct stores a summary of the occurrence, always including a
//! timestamp of when it happened.
//!
//! ## Registering event handlers
//!
//! Library users can register event handler closures through
//! [`EventHandlers`](crate::event_bus::EventHandlers), which the event bus thread calls whenever
//! the matching variant is published. Default handlers that log events out as CSV lines can be
//! enabled when constructing the handlers; they are defined in [logging](crate::logging).
//!
//! ## Timing
//!
//! Events are always emitted **after** the corresponding occurrence is completed. For example,
//! [`DeliverBlockEvent`] is emitted only after the block's delivery flag is set in storage.

use std::sync::mpsc::Sender;
use std::time::SystemTime;

use crate::consensus::messages::{Proposal, Vote, VoteRelay};
use crate::types::basic::{BlockHeight, CryptoHash, Finality, ReplicaID};
use crate::types::block::Block;
use crate::types::certificates::QuorumCertificate;

/// Enumerates all events defined for the library.
pub enum Event {
    // Events that change block storage state.
    InsertBlock(InsertBlockEvent),
    DeliverBlock(DeliverBlockEvent),
    UpdateHighestQC(UpdateHighestQCEvent),
    UpdateLockedBlock(UpdateLockedBlockEvent),
    CommitBlock(CommitBlockEvent),
    Decide(DecideEvent),

    // Events that involve sending a message.
    Propose(ProposeEvent),
    Vote(VoteEvent),
    RelayVote(RelayVoteEvent),

    // Events that involve receiving a message.
    ReceiveProposal(ReceiveProposalEvent),
    ReceiveVote(ReceiveVoteEvent),
    ReceiveVoteRelay(ReceiveVoteRelayEvent),

    // Aggregation events.
    CollectQC(CollectQCEvent),
}

impl Event {
    /// Publish this event on the event publisher channel (if the channel is defined).
    pub fn publish(self, event_publisher: &Option<Sender<Event>>) {
        if let Some(event_publisher) = event_publisher {
            let _ = event_publisher.send(self);
        }
    }
}

/// A new block was inserted into block storage (fetched, not necessarily delivered yet).
pub struct InsertBlockEvent {
    pub timestamp: SystemTime,
    pub block: Block,
}

/// A block, identifiable by its hash, completed delivery: its proposer signature and justify QC
/// verified, and all of its ancestors are delivered.
pub struct DeliverBlockEvent {
    pub timestamp: SystemTime,
    pub block: CryptoHash,
    pub height: BlockHeight,
}

/// The highest quorum certificate known to this replica was updated.
pub struct UpdateHighestQCEvent {
    pub timestamp: SystemTime,
    pub highest_qc: QuorumCertificate,
}

/// The locked block moved up.
pub struct UpdateLockedBlockEvent {
    pub timestamp: SystemTime,
    pub block: CryptoHash,
}

/// A block, identifiable by its hash, was committed.
pub struct CommitBlockEvent {
    pub timestamp: SystemTime,
    pub block: CryptoHash,
    pub height: BlockHeight,
}

/// A committed command was handed to the state machine.
pub struct DecideEvent {
    pub timestamp: SystemTime,
    pub finality: Finality,
}

/// This replica proposed a block and sent it down the tree.
pub struct ProposeEvent {
    pub timestamp: SystemTime,
    pub proposal: Proposal,
}

/// This replica voted for a block and sent the vote to its tree parent.
pub struct VoteEvent {
    pub timestamp: SystemTime,
    pub vote: Vote,
}

/// This replica aggregated its subtree's votes and relayed the partial QC to its tree parent.
pub struct RelayVoteEvent {
    pub timestamp: SystemTime,
    pub relay: VoteRelay,
}

/// A proposal was received.
pub struct ReceiveProposalEvent {
    pub timestamp: SystemTime,
    pub origin: ReplicaID,
    pub proposal: Proposal,
}

/// A vote was received.
pub struct ReceiveVoteEvent {
    pub timestamp: SystemTime,
    pub origin: ReplicaID,
    pub vote: Vote,
}

/// A vote relay was received.
pub struct ReceiveVoteRelayEvent {
    pub timestamp: SystemTime,
    pub origin: ReplicaID,
    pub relay: VoteRelay,
}

/// A full quorum certificate formed at this replica.
pub struct CollectQCEvent {
    pub timestamp: SystemTime,
    pub quorum_certificate: QuorumCertificate,
}
