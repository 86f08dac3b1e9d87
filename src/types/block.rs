/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for the 'block' type and its methods.

use std::io;

use borsh::{BorshDeserialize, BorshSerialize};
pub use sha2::Sha256 as CryptoHasher;
use sha2::Digest;

use super::basic::{BlockHeight, CryptoHash, ReplicaID, SignatureBytes};
use super::certificates::QuorumCertificate;
use super::keypair::Keypair;

/// A content-addressed record extending the block DAG.
///
/// A block references its ancestors through `parents` (the first entry is the "primary" parent,
/// whose chain carries heights and the commit rule) and justifies its extension of the DAG with
/// `justify`, a quorum certificate for an ancestor. Blocks are immutable after creation.
///
/// # Content addressing
///
/// `hash` is computed over `parents`, `height`, the justified block's hash, `commands`, and
/// `proposer` — see [`compute_hash`](Self::compute_hash). It is **not** part of the wire format:
/// deserialization recomputes it, so a block's identity can never be forged by a peer.
///
/// `justify` is `None` only for the [genesis block](Self::genesis); every proposed block carries
/// `Some` QC (the QC justifying the first proposed block is the signature-less
/// [genesis QC](QuorumCertificate::genesis)).
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Block {
    pub height: BlockHeight,
    pub hash: CryptoHash,
    pub parents: Vec<CryptoHash>,
    pub justify: Option<QuorumCertificate>,
    pub commands: Vec<CryptoHash>,
    pub proposer: ReplicaID,
    pub signature: SignatureBytes,
}

impl Block {
    /// Create a new block proposed by `proposer`, signing its content hash with `keypair`.
    pub fn new(
        height: BlockHeight,
        parents: Vec<CryptoHash>,
        justify: QuorumCertificate,
        commands: Vec<CryptoHash>,
        proposer: ReplicaID,
        keypair: &Keypair,
    ) -> Block {
        let hash = Block::compute_hash(&parents, height, Some(&justify.obj_hash), &commands, proposer);
        let signature = keypair.sign(&hash.bytes());
        Block {
            height,
            hash,
            parents,
            justify: Some(justify),
            commands,
            proposer,
            signature,
        }
    }

    /// The deterministic genesis block: height 0, no parents, no justify, no commands.
    ///
    /// Every replica inserts this block as fetched and delivered on startup, and initializes
    /// `b_lock`, `b_exec`, and `hqc` to it.
    pub fn genesis() -> Block {
        let parents = Vec::new();
        let commands = Vec::new();
        let proposer = ReplicaID::new(0);
        let hash = Block::compute_hash(&parents, BlockHeight::new(0), None, &commands, proposer);
        Block {
            height: BlockHeight::new(0),
            hash,
            parents,
            justify: None,
            commands,
            proposer,
            signature: SignatureBytes::new([0u8; 64]),
        }
    }

    /// Compute the content hash of a block from its fields.
    pub fn compute_hash(
        parents: &Vec<CryptoHash>,
        height: BlockHeight,
        justify_obj_hash: Option<&CryptoHash>,
        commands: &Vec<CryptoHash>,
        proposer: ReplicaID,
    ) -> CryptoHash {
        let mut hasher = CryptoHasher::new();
        hasher.update(parents.try_to_vec().unwrap());
        hasher.update(height.try_to_vec().unwrap());
        hasher.update(justify_obj_hash.try_to_vec().unwrap());
        hasher.update(commands.try_to_vec().unwrap());
        hasher.update(proposer.try_to_vec().unwrap());
        CryptoHash::new(hasher.finalize().into())
    }

    /// The primary parent of this block, if any.
    pub fn parent(&self) -> Option<&CryptoHash> {
        self.parents.first()
    }

    /// The hash of the block this block's `justify` certifies, if any.
    pub fn justify_obj_hash(&self) -> Option<CryptoHash> {
        self.justify.as_ref().map(|qc| qc.obj_hash)
    }

    pub fn is_genesis(&self) -> bool {
        self.justify.is_none()
    }
}

impl BorshSerialize for Block {
    fn serialize<W: io::Write>(&self, writer: &mut W) -> io::Result<()> {
        self.height.serialize(writer)?;
        self.parents.serialize(writer)?;
        self.justify.serialize(writer)?;
        self.commands.serialize(writer)?;
        self.proposer.serialize(writer)?;
        self.signature.serialize(writer)
    }
}

impl BorshDeserialize for Block {
    fn deserialize_reader<R: io::Read>(reader: &mut R) -> io::Result<Block> {
        let height = BlockHeight::deserialize_reader(reader)?;
        let parents = Vec::<CryptoHash>::deserialize_reader(reader)?;
        let justify = Option::<QuorumCertificate>::deserialize_reader(reader)?;
        let commands = Vec::<CryptoHash>::deserialize_reader(reader)?;
        let proposer = ReplicaID::deserialize_reader(reader)?;
        let signature = SignatureBytes::deserialize_reader(reader)?;
        let hash = Block::compute_hash(
            &parents,
            height,
            justify.as_ref().map(|qc| &qc.obj_hash),
            &commands,
            proposer,
        );
        Ok(Block {
            height,
            hash,
            parents,
            justify,
            commands,
            proposer,
            signature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand_core::OsRng;

    #[test]
    fn genesis_is_deterministic() {
        assert_eq!(Block::genesis().hash, Block::genesis().hash);
    }

    #[test]
    fn wire_roundtrip_recomputes_the_hash() {
        let mut csprg = OsRng {};
        let keypair = Keypair::new(SigningKey::generate(&mut csprg));
        let genesis = Block::genesis();
        let block = Block::new(
            BlockHeight::new(1),
            vec![genesis.hash],
            QuorumCertificate::genesis(genesis.hash),
            vec![CryptoHash::new([1u8; 32])],
            ReplicaID::new(0),
            &keypair,
        );

        let bytes = block.try_to_vec().unwrap();
        let decoded = Block::try_from_slice(&bytes).unwrap();
        assert_eq!(decoded.hash, block.hash);
        assert_eq!(decoded, block);
    }

    #[test]
    fn hash_covers_the_commands() {
        let mut csprg = OsRng {};
        let keypair = Keypair::new(SigningKey::generate(&mut csprg));
        let genesis = Block::genesis();
        let mk = |cmds: Vec<CryptoHash>| {
            Block::new(
                BlockHeight::new(1),
                vec![genesis.hash],
                QuorumCertificate::genesis(genesis.hash),
                cmds,
                ReplicaID::new(0),
                &keypair,
            )
        };
        let a = mk(vec![CryptoHash::new([1u8; 32])]);
        let b = mk(vec![CryptoHash::new([2u8; 32])]);
        assert_ne!(a.hash, b.hash);
    }
}
