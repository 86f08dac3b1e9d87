/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Background verification of signatures and quorum certificates.
//!
//! Signature verification is the only CPU-bound work the protocol does, so it is the only work
//! that leaves the [algorithm](crate::algorithm) thread. Jobs are closures over read-only copies
//! of the data to verify; workers never touch protocol state. Outcomes return to the algorithm
//! thread over a channel and re-enter the event loop like any other input.

use std::sync::mpsc::Sender;
use std::sync::Arc;

use ed25519_dalek::{Signature, Verifier};
use threadpool::ThreadPool;

use crate::consensus::messages::Vote;
use crate::types::basic::{CryptoHash, ReplicaID, SignatureBytes};
use crate::types::certificates::QuorumCertificate;
use crate::types::replica_set::ReplicaSet;

/// A unit of verification work.
pub(crate) enum VerificationJob {
    /// Verify a block proposer's signature over the block's content hash. Gates delivery.
    ProposerSignature {
        blk_hash: CryptoHash,
        proposer: ReplicaID,
        signature: SignatureBytes,
    },

    /// Verify a block's justify QC: every partial correct and a quorum of them present. Gates
    /// delivery of the justifying block's child.
    JustifyQc {
        blk_hash: CryptoHash,
        qc: QuorumCertificate,
    },

    /// Verify a single vote's partial signature. Gates admission into the vote aggregator.
    VoteSignature { vote: Vote },
}

/// The result of a [`VerificationJob`], echoing the job back so the event loop can resume the
/// continuation that was waiting on it.
pub(crate) struct VerificationOutcome {
    pub(crate) job: VerificationJob,
    pub(crate) ok: bool,
}

/// A fixed pool of worker threads executing [`VerificationJob`]s.
pub(crate) struct CryptoPool {
    workers: ThreadPool,
    replica_set: Arc<ReplicaSet>,
    results: Sender<VerificationOutcome>,
}

impl CryptoPool {
    pub(crate) fn new(
        nworkers: usize,
        replica_set: ReplicaSet,
        results: Sender<VerificationOutcome>,
    ) -> CryptoPool {
        CryptoPool {
            workers: ThreadPool::new(nworkers.max(1)),
            replica_set: Arc::new(replica_set),
            results,
        }
    }

    /// Queue `job` for verification. The outcome arrives on the results channel.
    pub(crate) fn submit(&self, job: VerificationJob) {
        let replica_set = self.replica_set.clone();
        let results = self.results.clone();
        self.workers.execute(move || {
            let ok = verify(&job, &replica_set);
            // The receiver disappearing means the replica is shutting down.
            let _ = results.send(VerificationOutcome { job, ok });
        });
    }
}

fn verify(job: &VerificationJob, replica_set: &ReplicaSet) -> bool {
    match job {
        VerificationJob::ProposerSignature {
            blk_hash,
            proposer,
            signature,
        } => match replica_set.verifying_key(*proposer) {
            Some(verifying_key) => {
                let signature = Signature::from_bytes(&signature.bytes());
                verifying_key.verify(&blk_hash.bytes(), &signature).is_ok()
            }
            None => false,
        },
        VerificationJob::JustifyQc { qc, .. } => {
            qc.has_n(replica_set.nmajority()) && qc.verify(replica_set)
        }
        VerificationJob::VoteSignature { vote } => match replica_set.verifying_key(vote.voter) {
            Some(verifying_key) => vote.cert().is_correct(verifying_key),
            None => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::keypair::Keypair;
    use ed25519_dalek::SigningKey;
    use rand_core::OsRng;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn outcomes_return_over_the_channel() {
        let mut csprg = OsRng {};
        let keypairs: Vec<Keypair> = (0..4)
            .map(|_| Keypair::new(SigningKey::generate(&mut csprg)))
            .collect();
        let replica_set = ReplicaSet::new(keypairs.iter().map(|kp| kp.verifying_key()).collect());

        let (results_tx, results_rx) = mpsc::channel();
        let pool = CryptoPool::new(2, replica_set, results_tx);

        let blk_hash = CryptoHash::new([4u8; 32]);
        pool.submit(VerificationJob::VoteSignature {
            vote: Vote::new(&keypairs[2], ReplicaID::new(2), blk_hash),
        });
        pool.submit(VerificationJob::VoteSignature {
            // Signed with the wrong key for the claimed voter.
            vote: Vote::new(&keypairs[3], ReplicaID::new(2), blk_hash),
        });

        let mut oks = Vec::new();
        for _ in 0..2 {
            let outcome = results_rx.recv_timeout(Duration::from_secs(5)).unwrap();
            oks.push(outcome.ok);
        }
        oks.sort();
        assert_eq!(oks, vec![false, true]);
    }
}
