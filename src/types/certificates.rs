/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Partial certificates and quorum certificates over block hashes.
//!
//! A [`PartialCertificate`] is a single replica's signature share on a block hash. A
//! [`QuorumCertificate`] accumulates partial certificates, keyed by replica position, until they
//! form evidence that a quorum of replicas voted for the block. QCs are also the unit that
//! internal nodes of the [aggregation tree](crate::tree) relay upward: a below-quorum QC carrying
//! the partial signatures of one subtree.
//!
//! # Aggregation carrier
//!
//! Ed25519 signatures do not combine into a single aggregate, so the "aggregated" form of a QC is
//! the sealed [`SignatureSet`] itself: [`verify`](QuorumCertificate::verify) checks every present
//! partial against `obj_hash`. A pairing-based backend would replace `verify` with a combine step
//! and a single pairing check without changing any call site.

use borsh::{BorshDeserialize, BorshSerialize};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use super::basic::{CryptoHash, ReplicaID, SignatureBytes};
use super::keypair::Keypair;
use super::replica_set::ReplicaSet;

/// A single replica's signature share on a block hash.
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub struct PartialCertificate {
    pub obj_hash: CryptoHash,
    pub replica: ReplicaID,
    pub signature: SignatureBytes,
}

impl PartialCertificate {
    /// Create a `PartialCertificate` for `obj_hash` by signing it with `keypair`.
    pub(crate) fn sign(keypair: &Keypair, replica: ReplicaID, obj_hash: CryptoHash) -> Self {
        Self {
            obj_hash,
            replica,
            signature: keypair.sign(&obj_hash.bytes()),
        }
    }

    /// Verify that `signature` is a signature over `obj_hash` by `verifying_key`.
    pub(crate) fn is_correct(&self, verifying_key: &VerifyingKey) -> bool {
        let signature = Signature::from_bytes(&self.signature.bytes());
        verifying_key
            .verify(&self.obj_hash.bytes(), &signature)
            .is_ok()
    }
}

/// An ordered list of optional [`SignatureBytes`], one slot per replica in the canonical order of
/// the [`ReplicaSet`].
///
/// A `SignatureSet` created using [`new`](Self::new) initially contains `vec![None; len]`. As
/// signatures are collected, `None`s are replaced with `Some(signature_bytes)`. The slot position
/// identifies the signer, so the set doubles as the partials bitmap of the wire format.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct SignatureSet(Vec<Option<SignatureBytes>>);

impl SignatureSet {
    /// Create a new `SignatureSet` initially containing `len` `None`s.
    pub(crate) fn new(len: usize) -> Self {
        Self(vec![None; len])
    }

    /// Create the empty `SignatureSet` carried by the genesis QC.
    pub(crate) const fn genesis() -> Self {
        Self(Vec::new())
    }

    /// Get a reference to the `Option<SignatureBytes>` at position `pos`.
    pub fn get(&self, pos: usize) -> &Option<SignatureBytes> {
        &self.0[pos]
    }

    pub(crate) fn set(&mut self, pos: usize, signature: Option<SignatureBytes>) {
        self.0[pos] = signature
    }

    /// Get an iterator over the `Option<SignatureBytes>`s in this `SignatureSet`.
    pub fn iter(&self) -> std::slice::Iter<'_, Option<SignatureBytes>> {
        self.0.iter()
    }

    /// The number of replica slots (not the number of collected signatures).
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The number of collected signatures.
    pub fn count(&self) -> usize {
        self.0.iter().filter(|sig| sig.is_some()).count()
    }
}

/// The ways in which combining partial certificates can fail.
///
/// Both variants indicate equivocation or corruption inside a subtree that is trusted to be
/// honest, and callers treat them as fatal protocol errors.
#[derive(Debug, PartialEq, Eq)]
pub enum CertificateError {
    /// Two different signatures from the same replica were offered for the same block hash.
    ConflictingPartial { replica: ReplicaID },

    /// A merge was attempted between certificates over different block hashes.
    ObjectMismatch,
}

/// Evidence that a set of replicas signed a block hash.
///
/// A `QuorumCertificate` starts out empty and accumulates [`PartialCertificate`]s through
/// [`add_part`](Self::add_part) and [`merge_quorum`](Self::merge_quorum). Whether the certificate
/// is a full quorum ([`nmajority`](ReplicaSet::nmajority) partials) or an intermediate aggregate
/// (a subtree's worth of partials) is a property of where it sits in the aggregation tree, tested
/// with [`has_n`](Self::has_n).
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct QuorumCertificate {
    pub obj_hash: CryptoHash,
    pub signatures: SignatureSet,
}

impl QuorumCertificate {
    /// Create a new, empty `QuorumCertificate` over `obj_hash` with one signature slot per
    /// replica in a set of `n`.
    pub(crate) fn new(obj_hash: CryptoHash, n: usize) -> QuorumCertificate {
        QuorumCertificate {
            obj_hash,
            signatures: SignatureSet::new(n),
        }
    }

    /// The QC that justifies the genesis block. Carries no signatures.
    pub fn genesis(obj_hash: CryptoHash) -> QuorumCertificate {
        QuorumCertificate {
            obj_hash,
            signatures: SignatureSet::genesis(),
        }
    }

    /// Whether this is a genesis QC (no signature slots).
    pub fn is_genesis(&self) -> bool {
        self.signatures.is_empty()
    }

    /// Add a partial signature from `replica`.
    ///
    /// Adding the same signature twice is a no-op. Adding a *different* signature for a replica
    /// whose slot is already filled fails with [`CertificateError::ConflictingPartial`].
    pub(crate) fn add_part(
        &mut self,
        replica: ReplicaID,
        signature: SignatureBytes,
    ) -> Result<(), CertificateError> {
        match self.signatures.get(replica.as_index()) {
            None => {
                self.signatures.set(replica.as_index(), Some(signature));
                Ok(())
            }
            Some(existing) if *existing == signature => Ok(()),
            Some(_) => Err(CertificateError::ConflictingPartial { replica }),
        }
    }

    /// Merge the partials of `other` into this certificate.
    ///
    /// The result is the union of both signature sets keyed by replica position. Duplicate
    /// partials from the same replica must be identical; a disagreement rejects the whole merge,
    /// leaving this certificate unchanged.
    pub(crate) fn merge_quorum(
        &mut self,
        other: &QuorumCertificate,
    ) -> Result<(), CertificateError> {
        if self.obj_hash != other.obj_hash || self.signatures.len() != other.signatures.len() {
            return Err(CertificateError::ObjectMismatch);
        }
        for (pos, signature) in other.signatures.iter().enumerate() {
            if let (Some(theirs), Some(ours)) = (signature, self.signatures.get(pos)) {
                if theirs != ours {
                    return Err(CertificateError::ConflictingPartial {
                        replica: ReplicaID::new(pos as u8),
                    });
                }
            }
        }
        for (pos, signature) in other.signatures.iter().enumerate() {
            if signature.is_some() && self.signatures.get(pos).is_none() {
                self.signatures.set(pos, *signature);
            }
        }
        Ok(())
    }

    /// Whether at least `n` partial signatures have been collected.
    pub fn has_n(&self, n: usize) -> bool {
        self.signatures.count() >= n
    }

    /// The number of collected partial signatures.
    pub fn count(&self) -> usize {
        self.signatures.count()
    }

    /// Verify the aggregate: check that every present partial is a correct signature over
    /// `obj_hash` by the replica in the corresponding slot of `replica_set`.
    ///
    /// Does not check any quorum threshold; thresholds depend on the verifier's position in the
    /// aggregation tree and are tested separately with [`has_n`](Self::has_n).
    pub(crate) fn verify(&self, replica_set: &ReplicaSet) -> bool {
        if self.signatures.len() != replica_set.len() {
            return false;
        }
        for (pos, signature) in self.signatures.iter().enumerate() {
            if let Some(signature) = signature {
                let verifying_key = match replica_set.verifying_key(ReplicaID::new(pos as u8)) {
                    Some(vk) => vk,
                    None => return false,
                };
                let signature = Signature::from_bytes(&signature.bytes());
                if verifying_key
                    .verify(&self.obj_hash.bytes(), &signature)
                    .is_err()
                {
                    return false;
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand_core::OsRng;

    fn keypairs(n: usize) -> Vec<Keypair> {
        let mut csprg = OsRng {};
        (0..n)
            .map(|_| Keypair::new(SigningKey::generate(&mut csprg)))
            .collect()
    }

    #[test]
    fn adding_a_partial_twice_is_idempotent() {
        let kps = keypairs(4);
        let obj_hash = CryptoHash::new([7u8; 32]);
        let mut qc = QuorumCertificate::new(obj_hash, 4);

        let part = PartialCertificate::sign(&kps[1], ReplicaID::new(1), obj_hash);
        qc.add_part(part.replica, part.signature).unwrap();
        qc.add_part(part.replica, part.signature).unwrap();

        assert_eq!(qc.count(), 1);
    }

    #[test]
    fn conflicting_partial_is_rejected() {
        let kps = keypairs(4);
        let obj_hash = CryptoHash::new([7u8; 32]);
        let mut qc = QuorumCertificate::new(obj_hash, 4);

        qc.add_part(ReplicaID::new(1), kps[1].sign(&obj_hash.bytes()))
            .unwrap();
        // A second, different "signature" from the same replica.
        let forged = SignatureBytes::new([0u8; 64]);
        assert_eq!(
            qc.add_part(ReplicaID::new(1), forged),
            Err(CertificateError::ConflictingPartial {
                replica: ReplicaID::new(1)
            })
        );
    }

    #[test]
    fn merge_takes_the_union_of_partials() {
        let kps = keypairs(4);
        let obj_hash = CryptoHash::new([9u8; 32]);

        let mut left = QuorumCertificate::new(obj_hash, 4);
        left.add_part(ReplicaID::new(0), kps[0].sign(&obj_hash.bytes()))
            .unwrap();
        left.add_part(ReplicaID::new(1), kps[1].sign(&obj_hash.bytes()))
            .unwrap();

        let mut right = QuorumCertificate::new(obj_hash, 4);
        right
            .add_part(ReplicaID::new(1), kps[1].sign(&obj_hash.bytes()))
            .unwrap();
        right
            .add_part(ReplicaID::new(3), kps[3].sign(&obj_hash.bytes()))
            .unwrap();

        left.merge_quorum(&right).unwrap();
        assert_eq!(left.count(), 3);

        let replica_set = ReplicaSet::new(kps.iter().map(|kp| kp.verifying_key()).collect());
        assert!(left.verify(&replica_set));
    }

    #[test]
    fn verify_fails_on_a_bad_partial() {
        let kps = keypairs(4);
        let obj_hash = CryptoHash::new([3u8; 32]);
        let replica_set = ReplicaSet::new(kps.iter().map(|kp| kp.verifying_key()).collect());

        let mut qc = QuorumCertificate::new(obj_hash, 4);
        qc.add_part(ReplicaID::new(0), kps[0].sign(&obj_hash.bytes()))
            .unwrap();
        // A signature by replica 2 placed in replica 1's slot.
        qc.add_part(ReplicaID::new(1), kps[2].sign(&obj_hash.bytes()))
            .unwrap();

        assert!(!qc.verify(&replica_set));
    }
}
