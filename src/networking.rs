/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Trait for pluggable peer-to-peer (P2P) networking, and the poller thread that moves raw
//! frames off it.
//!
//! Main trait: [`Network`].
//!
//! # Postponed parsing
//!
//! The network provider hands over complete frames as raw bytes, attributed to the replica that
//! sent them. Frames are deserialized on the [algorithm](crate::algorithm) thread only after the
//! admission checks pass, so a spamming peer costs parsing work only for messages that would be
//! processed anyway.
//!
//! # Connection policy
//!
//! Connection management is entirely the provider's concern. Providers are told the replica's
//! tree neighborhood through [`init_overlay`](Network::init_overlay) — production transports are
//! expected to whitelist TLS certificate hashes from the bootstrap profile and dial only the
//! parent and children after a randomized delay, while test networks may connect everyone to
//! everyone. `recv` must only ever attribute a frame to a replica whose identity the transport
//! has authenticated.

use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread::{self, JoinHandle};

use borsh::BorshSerialize;

use crate::consensus::messages::ConsensusMessage;
use crate::types::basic::ReplicaID;

/// Trait for pluggable peer-to-peer (P2P) networking.
pub trait Network: Clone + Send + 'static {
    /// Inform the network provider of this replica's position in the tree overlay on wake-up.
    /// Only the parent and children need to be dialed.
    fn init_overlay(&mut self, parent: Option<ReplicaID>, children: &[ReplicaID]);

    /// Send a frame to the specified peer without blocking. Sends to unreachable peers may be
    /// silently dropped; the protocol's fetch retries tolerate loss.
    fn send(&mut self, peer: ReplicaID, message: Vec<u8>);

    /// Receive a frame from any peer. Returns immediately with `None` if no frame is available.
    fn recv(&mut self) -> Option<(ReplicaID, Vec<u8>)>;
}

/// A cloneable handle for serializing and sending [`ConsensusMessage`]s.
#[derive(Clone)]
pub(crate) struct SenderHandle<N: Network> {
    network: N,
}

impl<N: Network> SenderHandle<N> {
    pub(crate) fn new(network: N) -> SenderHandle<N> {
        SenderHandle { network }
    }

    pub(crate) fn send(&mut self, peer: ReplicaID, message: &ConsensusMessage) {
        let bytes = message
            .try_to_vec()
            .expect("in-memory serialization cannot fail");
        self.network.send(peer, bytes);
    }
}

/// Spawn the poller thread, which polls the [`Network`] for frames and forwards them to the
/// algorithm thread's receiver.
pub(crate) fn start_polling<N: Network>(
    mut network: N,
    shutdown_signal: Receiver<()>,
) -> (JoinHandle<()>, Receiver<(ReplicaID, Vec<u8>)>) {
    let (to_algorithm, algorithm_receiver) = mpsc::channel();

    let poller_thread = thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("poller thread disconnected from main thread")
            }
        }

        if let Some((origin, frame)) = network.recv() {
            // The algorithm thread going away means shutdown is in progress.
            if to_algorithm.send((origin, frame)).is_err() {
                return;
            }
        } else {
            thread::yield_now()
        }
    });

    (poller_thread, algorithm_receiver)
}
