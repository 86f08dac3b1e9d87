/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types that exist only to store bytes, and do not have any major "active" behavior.

use std::fmt::{self, Debug, Display, Formatter};
use std::ops::{Add, AddAssign, Sub};

use borsh::{BorshDeserialize, BorshSerialize};

/// Number that uniquely identifies a replica.
///
/// Replicas are numbered `0..n-1` in the canonical order of the bootstrap profile. Replica `0` is
/// the root of the [vote aggregation tree](crate::tree).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct ReplicaID(u8);

impl ReplicaID {
    /// Create a new `ReplicaID` with an `int` value.
    pub const fn new(int: u8) -> Self {
        Self(int)
    }

    /// Get the `u8` value of this `ReplicaID`.
    pub const fn int(&self) -> u8 {
        self.0
    }

    /// Get this `ReplicaID` as a position into the canonically ordered replica set.
    pub const fn as_index(&self) -> usize {
        self.0 as usize
    }
}

impl Display for ReplicaID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl Debug for ReplicaID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// Height of a block in the block DAG.
///
/// Starts at 0 for the [genesis block](crate::types::block::Block::genesis), and increases by 1
/// for every level of blocks connected by primary-parent links.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct BlockHeight(u32);

impl BlockHeight {
    /// Create a new `BlockHeight` with an `int` inner value.
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    /// Get the inner `u32` value of this `BlockHeight`.
    pub const fn int(&self) -> u32 {
        self.0
    }
}

impl Display for BlockHeight {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl AddAssign<u32> for BlockHeight {
    fn add_assign(&mut self, rhs: u32) {
        self.0.add_assign(rhs)
    }
}

impl Add<u32> for BlockHeight {
    type Output = BlockHeight;
    fn add(self, rhs: u32) -> Self::Output {
        BlockHeight::new(self.0.add(rhs))
    }
}

impl Sub<BlockHeight> for BlockHeight {
    type Output = u32;
    fn sub(self, rhs: BlockHeight) -> Self::Output {
        self.0 - rhs.0
    }
}

/// 32-byte cryptographic hash.
///
/// `CryptoHash`-es are encountered in two contexts:
/// 1. Block hashes: always SHA256 hashes computed by
///    [`Block::compute_hash`](crate::types::block::Block::compute_hash).
/// 2. Command hashes: opaque to the library. Any 32-byte cryptographic hash provided by the
///    library user is acceptable.
#[derive(Clone, Copy, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub struct CryptoHash([u8; 32]);

impl CryptoHash {
    /// Create a new `CryptoHash` wrapping `bytes`.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 32]` value of this `CryptoHash`.
    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }
}

impl Display for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Debug for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Ed25519 digital signature.
///
/// Produced using the [`ed25519_dalek`] crate, whose main definitions are re-exported from the
/// [`keypair`](super::keypair) module.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct SignatureBytes([u8; 64]);

impl SignatureBytes {
    /// Create a new `SignatureBytes` wrapping `bytes`.
    pub(crate) const fn new(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 64]` value of this `SignatureBytes`.
    pub const fn bytes(&self) -> [u8; 64] {
        self.0
    }
}

/// Report handed to the state machine (and to the submitter's decision callback) when a command
/// reaches finality.
///
/// A `decision` of 1 indicates that the command was committed in the block identified by
/// `blk_hash` at position `cmd_idx`. A `decision` of 0 is the empty finality returned to
/// duplicate submissions of a command that is already waiting for a decision.
#[derive(Clone, Copy, BorshDeserialize, BorshSerialize)]
pub struct Finality {
    pub replica: ReplicaID,
    pub decision: i8,
    pub cmd_idx: u32,
    pub blk_height: BlockHeight,
    pub cmd_hash: CryptoHash,
    pub blk_hash: CryptoHash,
}

impl Finality {
    /// The empty `Finality` handed to duplicate submissions of `cmd_hash`.
    pub(crate) fn empty(replica: ReplicaID, cmd_hash: CryptoHash) -> Finality {
        Finality {
            replica,
            decision: 0,
            cmd_idx: 0,
            blk_height: BlockHeight::new(0),
            cmd_hash,
            blk_hash: CryptoHash::new([0u8; 32]),
        }
    }
}
