/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Structured messages that are sent between replicas.
//!
//! The protocol involves five types of messages:
//! 1. [`Proposal`]: sent by the leader down the aggregation tree, proposing to extend the block
//!    DAG with the contained block.
//! 2. [`Vote`]: sent by a leaf (or a replica whose subtree has only itself) up to its tree parent,
//!    carrying the sender's partial signature over the block hash.
//! 3. [`ReqBlock`]: sent to a peer believed to have a block that the sender is missing.
//! 4. [`RespBlock`]: the answer to a `ReqBlock`, carrying every requested block the responder has.
//! 5. [`VoteRelay`]: sent by an internal tree node to its parent once its subtree's votes have
//!    been aggregated into one partial quorum certificate.
//!
//! # Wire format
//!
//! Messages travel as the borsh encoding of [`ConsensusMessage`]: a one-byte variant discriminant
//! (the opcode, in the declaration order below) followed by the variant's fields in little-endian
//! with `u32`-length-prefixed sequences. Framing is the transport's concern. Parsing is postponed:
//! the poller hands raw frames to the algorithm thread, which deserializes only after the peer
//! admission check.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::basic::{CryptoHash, ReplicaID, SignatureBytes};
use crate::types::block::Block;
use crate::types::certificates::{PartialCertificate, QuorumCertificate};
use crate::types::keypair::Keypair;

#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub enum ConsensusMessage {
    Propose(Proposal),
    Vote(Vote),
    ReqBlock(ReqBlock),
    RespBlock(RespBlock),
    VoteRelay(VoteRelay),
}

impl From<Proposal> for ConsensusMessage {
    fn from(proposal: Proposal) -> Self {
        ConsensusMessage::Propose(proposal)
    }
}

impl From<Vote> for ConsensusMessage {
    fn from(vote: Vote) -> Self {
        ConsensusMessage::Vote(vote)
    }
}

impl From<ReqBlock> for ConsensusMessage {
    fn from(req: ReqBlock) -> Self {
        ConsensusMessage::ReqBlock(req)
    }
}

impl From<RespBlock> for ConsensusMessage {
    fn from(resp: RespBlock) -> Self {
        ConsensusMessage::RespBlock(resp)
    }
}

impl From<VoteRelay> for ConsensusMessage {
    fn from(relay: VoteRelay) -> Self {
        ConsensusMessage::VoteRelay(relay)
    }
}

/// Sent by the leader of a batch down the aggregation tree, proposing to extend the block DAG
/// with `block`. Recipients forward the proposal to their own children before starting delivery.
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub struct Proposal {
    pub proposer: ReplicaID,
    pub block: Block,
}

/// A single replica's vote for a block, sent to its tree parent.
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub struct Vote {
    pub blk_hash: CryptoHash,
    pub voter: ReplicaID,
    pub signature: SignatureBytes,
}

impl Vote {
    /// Create a `Vote` for `blk_hash` by signing it with `keypair`.
    pub fn new(keypair: &Keypair, voter: ReplicaID, blk_hash: CryptoHash) -> Vote {
        let cert = PartialCertificate::sign(keypair, voter, blk_hash);
        Vote {
            blk_hash,
            voter,
            signature: cert.signature,
        }
    }

    /// This vote's signature share as a [`PartialCertificate`].
    pub(crate) fn cert(&self) -> PartialCertificate {
        PartialCertificate {
            obj_hash: self.blk_hash,
            replica: self.voter,
            signature: self.signature,
        }
    }
}

/// A request for the blocks identified by `blk_hashes`.
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub struct ReqBlock {
    pub blk_hashes: Vec<CryptoHash>,
}

/// The answer to a [`ReqBlock`]: every requested block the responder had fetched. Requested
/// blocks the responder is missing are omitted; the requester retries elsewhere.
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub struct RespBlock {
    pub blocks: Vec<Block>,
}

/// An already-aggregated partial quorum certificate covering one subtree's votes for the block
/// identified by `blk_hash`, sent by the subtree's root to its tree parent.
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub struct VoteRelay {
    pub blk_hash: CryptoHash,
    pub cert: QuorumCertificate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcodes_match_the_declaration_order() {
        let req = ConsensusMessage::ReqBlock(ReqBlock {
            blk_hashes: vec![CryptoHash::new([1u8; 32])],
        });
        let bytes = req.try_to_vec().unwrap();
        assert_eq!(bytes[0], 0x02);

        let relay = ConsensusMessage::VoteRelay(VoteRelay {
            blk_hash: CryptoHash::new([2u8; 32]),
            cert: QuorumCertificate::new(CryptoHash::new([2u8; 32]), 4),
        });
        let bytes = relay.try_to_vec().unwrap();
        assert_eq!(bytes[0], 0x04);
    }
}
