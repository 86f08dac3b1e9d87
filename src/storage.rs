/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! In-memory content-addressed block storage and the block DAG queries built on it.
//!
//! The store is owned and mutated exclusively by the [algorithm](crate::algorithm) thread. Blocks
//! are keyed by their content hash and are never evicted; pruning is a concern of the embedding
//! process. A block moves through two flags:
//! 1. **fetched** — the block's bytes are present in the store, and
//! 2. **delivered** — additionally, every parent and the block certified by the block's `justify`
//!    are delivered, and the proposer signature has been verified.
//!
//! Other subsystems hold blocks by hash and resolve them through the store, which keeps the DAG
//! free of ownership cycles.

use std::collections::HashMap;

use crate::types::basic::{BlockHeight, CryptoHash};
use crate::types::block::Block;

/// The ways in which block storage accesses can fail.
#[derive(Debug, PartialEq, Eq)]
pub enum StorageError {
    /// A block that the protocol state implies must be in the store was not found.
    BlockExpectedButNotFound { block: CryptoHash },

    /// An attempt was made to mark a block delivered before one of its dependencies.
    DependencyNotDelivered {
        block: CryptoHash,
        dependency: CryptoHash,
    },
}

struct BlockEntry {
    block: Block,
    delivered: bool,
}

/// Content-addressed map of block hash to block, plus the command cache.
pub(crate) struct BlockStore {
    blocks: HashMap<CryptoHash, BlockEntry>,
    cmd_cache: HashMap<CryptoHash, CryptoHash>,
}

impl BlockStore {
    /// Create a store seeded with `genesis`, inserted as fetched and delivered.
    pub(crate) fn new(genesis: Block) -> BlockStore {
        let mut blocks = HashMap::new();
        blocks.insert(
            genesis.hash,
            BlockEntry {
                block: genesis,
                delivered: true,
            },
        );
        BlockStore {
            blocks,
            cmd_cache: HashMap::new(),
        }
    }

    /// Insert `block` into the store, marking it fetched. Inserting a block that is already
    /// present is a no-op (equal hashes imply identical contents).
    pub(crate) fn add_blk(&mut self, block: Block) -> CryptoHash {
        let hash = block.hash;
        self.blocks.entry(hash).or_insert(BlockEntry {
            block,
            delivered: false,
        });
        hash
    }

    pub(crate) fn find_blk(&self, hash: &CryptoHash) -> Option<&Block> {
        self.blocks.get(hash).map(|entry| &entry.block)
    }

    /// Like [`find_blk`](Self::find_blk), but a miss is an error.
    pub(crate) fn expect_blk(&self, hash: &CryptoHash) -> Result<&Block, StorageError> {
        self.find_blk(hash)
            .ok_or(StorageError::BlockExpectedButNotFound { block: *hash })
    }

    pub(crate) fn is_blk_fetched(&self, hash: &CryptoHash) -> bool {
        self.blocks.contains_key(hash)
    }

    pub(crate) fn is_blk_delivered(&self, hash: &CryptoHash) -> bool {
        self.blocks
            .get(hash)
            .map(|entry| entry.delivered)
            .unwrap_or(false)
    }

    /// Mark `hash` delivered.
    ///
    /// Enforces the delivery-order invariant: every parent and the block certified by `justify`
    /// must already be delivered.
    pub(crate) fn mark_delivered(&mut self, hash: &CryptoHash) -> Result<(), StorageError> {
        let (parents, justify_obj) = {
            let block = self.expect_blk(hash)?;
            (block.parents.clone(), block.justify_obj_hash())
        };
        for parent in &parents {
            if !self.is_blk_delivered(parent) {
                return Err(StorageError::DependencyNotDelivered {
                    block: *hash,
                    dependency: *parent,
                });
            }
        }
        if let Some(justify_obj) = justify_obj {
            if !self.is_blk_delivered(&justify_obj) {
                return Err(StorageError::DependencyNotDelivered {
                    block: *hash,
                    dependency: justify_obj,
                });
            }
        }
        self.blocks
            .get_mut(hash)
            .ok_or(StorageError::BlockExpectedButNotFound { block: *hash })?
            .delivered = true;
        Ok(())
    }

    pub(crate) fn blk_height(&self, hash: &CryptoHash) -> Result<BlockHeight, StorageError> {
        Ok(self.expect_blk(hash)?.height)
    }

    /// Whether `descendant` extends `ancestor` through primary-parent links.
    ///
    /// A block extends itself.
    pub(crate) fn extends(
        &self,
        descendant: &CryptoHash,
        ancestor: &CryptoHash,
    ) -> Result<bool, StorageError> {
        let ancestor_height = self.blk_height(ancestor)?;
        let mut cursor = *descendant;
        loop {
            if cursor == *ancestor {
                return Ok(true);
            }
            let block = self.expect_blk(&cursor)?;
            if block.height <= ancestor_height {
                return Ok(false);
            }
            match block.parent() {
                Some(parent) => cursor = *parent,
                None => return Ok(false),
            }
        }
    }

    /// Record that `cmd_hash` was committed in the block identified by `blk_hash`.
    pub(crate) fn cache_cmd(&mut self, cmd_hash: CryptoHash, blk_hash: CryptoHash) {
        self.cmd_cache.insert(cmd_hash, blk_hash);
    }

    /// The hash of the block in which `cmd_hash` was committed, if it was.
    pub(crate) fn cached_cmd(&self, cmd_hash: &CryptoHash) -> Option<&CryptoHash> {
        self.cmd_cache.get(cmd_hash)
    }

    pub(crate) fn blk_count(&self) -> usize {
        self.blocks.len()
    }

    pub(crate) fn cmd_cache_size(&self) -> usize {
        self.cmd_cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::basic::ReplicaID;
    use crate::types::certificates::QuorumCertificate;
    use crate::types::keypair::Keypair;
    use ed25519_dalek::SigningKey;
    use rand_core::OsRng;

    fn child_of(parent: &Block, keypair: &Keypair) -> Block {
        Block::new(
            parent.height + 1,
            vec![parent.hash],
            QuorumCertificate::genesis(parent.hash),
            Vec::new(),
            ReplicaID::new(0),
            keypair,
        )
    }

    #[test]
    fn delivery_requires_delivered_parents() {
        let mut csprg = OsRng {};
        let keypair = Keypair::new(SigningKey::generate(&mut csprg));
        let genesis = Block::genesis();
        let b1 = child_of(&genesis, &keypair);
        let b2 = child_of(&b1, &keypair);

        let mut store = BlockStore::new(genesis);
        store.add_blk(b1.clone());
        store.add_blk(b2.clone());

        assert_eq!(
            store.mark_delivered(&b2.hash),
            Err(StorageError::DependencyNotDelivered {
                block: b2.hash,
                dependency: b1.hash,
            })
        );

        store.mark_delivered(&b1.hash).unwrap();
        store.mark_delivered(&b2.hash).unwrap();
        assert!(store.is_blk_delivered(&b2.hash));
    }

    #[test]
    fn extends_walks_the_primary_parent_chain() {
        let mut csprg = OsRng {};
        let keypair = Keypair::new(SigningKey::generate(&mut csprg));
        let genesis = Block::genesis();
        let genesis_hash = genesis.hash;
        let b1 = child_of(&genesis, &keypair);
        let b2 = child_of(&b1, &keypair);
        // A sibling of b1 on a conflicting branch.
        let b1_prime = Block::new(
            BlockHeight::new(1),
            vec![genesis_hash],
            QuorumCertificate::genesis(genesis_hash),
            vec![CryptoHash::new([9u8; 32])],
            ReplicaID::new(0),
            &keypair,
        );

        let mut store = BlockStore::new(genesis);
        store.add_blk(b1.clone());
        store.add_blk(b2.clone());
        store.add_blk(b1_prime.clone());

        assert!(store.extends(&b2.hash, &b1.hash).unwrap());
        assert!(store.extends(&b2.hash, &genesis_hash).unwrap());
        assert!(store.extends(&b1.hash, &b1.hash).unwrap());
        assert!(!store.extends(&b2.hash, &b1_prime.hash).unwrap());
        assert!(!store.extends(&b1.hash, &b2.hash).unwrap());
    }
}
