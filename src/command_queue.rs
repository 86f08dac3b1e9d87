/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Buffering of submitted command hashes into proposal-sized batches, and the registry of
//! decision callbacks.
//!
//! Every submission registers its callback under the command hash; the callback fires with a
//! [`Finality`] when the command commits. Submitting a hash that is already waiting resolves the
//! *new* callback immediately with an empty finality. Only the current proposer buffers hashes
//! for batching — on every other replica a submission registers the callback and stops.

use std::collections::{HashMap, VecDeque};

use crate::types::basic::{CryptoHash, Finality, ReplicaID};

/// Called exactly once with the command's finality.
pub type DecisionCallback = Box<dyn FnOnce(Finality) + Send>;

/// What [`CommandQueue::enqueue`] did with a submission.
pub(crate) enum EnqueueOutcome {
    /// The command was buffered and the buffer reached `blk_size`: time to beat.
    BatchReady,

    /// The command was buffered (proposer) or registered only (non-proposer).
    Buffered,

    /// The command was already waiting; the new callback was resolved with an empty finality.
    Duplicate,
}

pub(crate) struct CommandQueue {
    id: ReplicaID,
    blk_size: usize,
    decision_waiting: HashMap<CryptoHash, DecisionCallback>,
    buffer: VecDeque<CryptoHash>,
}

impl CommandQueue {
    pub(crate) fn new(id: ReplicaID, blk_size: usize) -> CommandQueue {
        CommandQueue {
            id,
            blk_size: blk_size.max(1),
            decision_waiting: HashMap::new(),
            buffer: VecDeque::new(),
        }
    }

    /// Register a submission. `is_proposer` decides whether the hash also enters the batch
    /// buffer.
    pub(crate) fn enqueue(
        &mut self,
        cmd_hash: CryptoHash,
        callback: DecisionCallback,
        is_proposer: bool,
    ) -> EnqueueOutcome {
        if self.decision_waiting.contains_key(&cmd_hash) {
            callback(Finality::empty(self.id, cmd_hash));
            return EnqueueOutcome::Duplicate;
        }
        self.decision_waiting.insert(cmd_hash, callback);

        if !is_proposer {
            return EnqueueOutcome::Buffered;
        }

        self.buffer.push_back(cmd_hash);
        if self.buffer.len() >= self.blk_size {
            EnqueueOutcome::BatchReady
        } else {
            EnqueueOutcome::Buffered
        }
    }

    /// Drain up to `blk_size` buffered hashes for the next proposal. May return fewer — or none,
    /// when a QC-finish-triggered beat pipelines an empty block.
    pub(crate) fn drain_batch(&mut self) -> Vec<CryptoHash> {
        let take = self.buffer.len().min(self.blk_size);
        self.buffer.drain(..take).collect()
    }

    /// Resolve the decision callback waiting on `finality.cmd_hash`, if any.
    pub(crate) fn resolve(&mut self, finality: Finality) {
        if let Some(callback) = self.decision_waiting.remove(&finality.cmd_hash) {
            callback(finality);
        }
    }

    pub(crate) fn decisions_waiting(&self) -> usize {
        self.decision_waiting.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recording_callback(sink: &Arc<Mutex<Vec<Finality>>>) -> DecisionCallback {
        let sink = sink.clone();
        Box::new(move |finality| sink.lock().unwrap().push(finality))
    }

    #[test]
    fn duplicate_submission_resolves_immediately_with_empty_finality() {
        let mut queue = CommandQueue::new(ReplicaID::new(0), 2);
        let sink = Arc::new(Mutex::new(Vec::new()));
        let cmd = CryptoHash::new([1u8; 32]);

        assert!(matches!(
            queue.enqueue(cmd, recording_callback(&sink), true),
            EnqueueOutcome::Buffered
        ));
        assert!(matches!(
            queue.enqueue(cmd, recording_callback(&sink), true),
            EnqueueOutcome::Duplicate
        ));

        let resolved = sink.lock().unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].decision, 0);
        assert_eq!(resolved[0].cmd_hash, cmd);
    }

    #[test]
    fn batch_is_ready_at_blk_size_and_drains_exactly_blk_size() {
        let mut queue = CommandQueue::new(ReplicaID::new(0), 2);
        let sink = Arc::new(Mutex::new(Vec::new()));

        let cmds: Vec<CryptoHash> = (0..3).map(|i| CryptoHash::new([i; 32])).collect();
        assert!(matches!(
            queue.enqueue(cmds[0], recording_callback(&sink), true),
            EnqueueOutcome::Buffered
        ));
        assert!(matches!(
            queue.enqueue(cmds[1], recording_callback(&sink), true),
            EnqueueOutcome::BatchReady
        ));
        assert!(matches!(
            queue.enqueue(cmds[2], recording_callback(&sink), true),
            EnqueueOutcome::Buffered
        ));

        assert_eq!(queue.drain_batch(), vec![cmds[0], cmds[1]]);
        assert_eq!(queue.drain_batch(), vec![cmds[2]]);
        assert!(queue.drain_batch().is_empty());
    }

    #[test]
    fn non_proposer_registers_but_does_not_buffer() {
        let mut queue = CommandQueue::new(ReplicaID::new(1), 1);
        let sink = Arc::new(Mutex::new(Vec::new()));
        let cmd = CryptoHash::new([7u8; 32]);

        assert!(matches!(
            queue.enqueue(cmd, recording_callback(&sink), false),
            EnqueueOutcome::Buffered
        ));
        assert!(queue.drain_batch().is_empty());
        assert_eq!(queue.decisions_waiting(), 1);

        // The callback still resolves on commit.
        queue.resolve(Finality {
            replica: ReplicaID::new(1),
            decision: 1,
            cmd_idx: 0,
            blk_height: crate::types::basic::BlockHeight::new(1),
            cmd_hash: cmd,
            blk_hash: CryptoHash::new([9u8; 32]),
        });
        assert_eq!(sink.lock().unwrap().len(), 1);
        assert_eq!(queue.decisions_waiting(), 0);
    }
}
