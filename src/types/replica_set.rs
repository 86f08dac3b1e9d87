/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The fixed, canonically ordered set of replicas and its quorum arithmetic.

use ed25519_dalek::VerifyingKey;

use super::basic::ReplicaID;

/// The set of replicas participating in consensus, in canonical order.
///
/// The position of a verifying key in the bootstrap profile is the replica's [`ReplicaID`], and
/// every replica must be configured with the same ordering. Membership is fixed for the lifetime
/// of the replica.
///
/// # Quorum arithmetic
///
/// For `n` replicas the set tolerates `f = (n - 1) / 3` Byzantine replicas, and a quorum
/// certificate requires [`nmajority`](Self::nmajority)` = 2f + 1` partial signatures. With fewer
/// than 4 replicas, `f` is 0 and the set cannot tolerate any failure.
#[derive(Clone)]
pub struct ReplicaSet {
    verifying_keys: Vec<VerifyingKey>,
}

impl ReplicaSet {
    /// Create a new `ReplicaSet` from verifying keys in canonical order.
    pub fn new(verifying_keys: Vec<VerifyingKey>) -> ReplicaSet {
        ReplicaSet { verifying_keys }
    }

    /// The number of replicas in this set.
    pub fn len(&self) -> usize {
        self.verifying_keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.verifying_keys.is_empty()
    }

    /// Get the verifying key of the replica identified by `replica`, if it is in the set.
    pub fn verifying_key(&self, replica: ReplicaID) -> Option<&VerifyingKey> {
        self.verifying_keys.get(replica.as_index())
    }

    /// Get the `ReplicaID` of the replica with the given verifying key, if it is in the set.
    pub fn position(&self, verifying_key: &VerifyingKey) -> Option<ReplicaID> {
        self.verifying_keys
            .iter()
            .position(|vk| vk == verifying_key)
            .map(|pos| ReplicaID::new(pos as u8))
    }

    /// Check whether `replica` identifies a member of this set.
    pub fn contains(&self, replica: ReplicaID) -> bool {
        replica.as_index() < self.verifying_keys.len()
    }

    /// The number of Byzantine replicas this set tolerates: `f = (n - 1) / 3`.
    pub fn nfaulty(&self) -> usize {
        self.verifying_keys.len().saturating_sub(1) / 3
    }

    /// The quorum threshold `2f + 1`.
    pub fn nmajority(&self) -> usize {
        2 * self.nfaulty() + 1
    }

    /// Iterate over the `ReplicaID`s of this set in canonical order.
    pub fn ids(&self) -> impl Iterator<Item = ReplicaID> {
        (0..self.verifying_keys.len() as u8).map(ReplicaID::new)
    }
}
