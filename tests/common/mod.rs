/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Shared test harness: a channel-backed mock network, a replica wrapper that records events,
//! and polling helpers.
//!
//! The mock network connects every replica to every other replica with mpsc channels and ignores
//! the overlay hint — in tests the overlay discipline is exercised by the replicas themselves,
//! which only ever address their tree neighbors. Stubs the test keeps (instead of handing to a
//! replica) double as scripted peers: the test can read the frames addressed to that replica and
//! inject frames under its identity.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, Once};
use std::thread;
use std::time::{Duration, Instant};

use borsh::{BorshDeserialize, BorshSerialize};
use ed25519_dalek::SigningKey;
use log::LevelFilter;
use rand_core::OsRng;

use kauri_rs::consensus::messages::ConsensusMessage;
use kauri_rs::event_bus::EventHandlers;
use kauri_rs::networking::Network;
use kauri_rs::pacemaker::StaticPacemaker;
use kauri_rs::replica::{Configuration, Replica};
use kauri_rs::types::basic::{CryptoHash, Finality, ReplicaID};
use kauri_rs::types::block::Block;
use kauri_rs::types::keypair::Keypair;
use kauri_rs::types::replica_set::ReplicaSet;

static LOGGER_INIT: Once = Once::new();

/// Set up a logger that logs all log messages with level Debug and above.
pub fn setup_logger() {
    LOGGER_INIT.call_once(|| {
        fern::Dispatch::new()
            .format(|out, message, record| {
                out.finish(format_args!("[{}][{}] {}", record.target(), record.level(), message))
            })
            .level(LevelFilter::Debug)
            .chain(std::io::stdout())
            .apply()
            .unwrap();
    });
}

/// Generate `n` keypairs and the matching canonically ordered replica set.
pub fn keypairs_and_set(n: usize) -> (Vec<Keypair>, ReplicaSet) {
    let mut csprg = OsRng {};
    let keypairs: Vec<Keypair> = (0..n)
        .map(|_| Keypair::new(SigningKey::generate(&mut csprg)))
        .collect();
    let replica_set = ReplicaSet::new(keypairs.iter().map(|kp| kp.verifying_key()).collect());
    (keypairs, replica_set)
}

/// A channel-backed [`Network`] connecting all replicas to each other.
#[derive(Clone)]
pub struct NetworkStub {
    id: ReplicaID,
    senders: HashMap<u8, Sender<(ReplicaID, Vec<u8>)>>,
    receiver: Arc<Mutex<Receiver<(ReplicaID, Vec<u8>)>>>,
}

impl NetworkStub {
    /// Read one frame addressed to this stub's replica and parse it. Used by scripted peers.
    pub fn try_recv_msg(&self) -> Option<(ReplicaID, ConsensusMessage)> {
        let (origin, frame) = self.receiver.lock().unwrap().try_recv().ok()?;
        let message = ConsensusMessage::try_from_slice(&frame).expect("mock peers send valid frames");
        Some((origin, message))
    }

    /// Inject `message` into `peer`'s inbox under this stub's identity. Used by scripted peers.
    pub fn send_msg(&mut self, peer: ReplicaID, message: &ConsensusMessage) {
        self.send(peer, message.try_to_vec().unwrap());
    }
}

impl Network for NetworkStub {
    fn init_overlay(&mut self, _parent: Option<ReplicaID>, _children: &[ReplicaID]) {}

    fn send(&mut self, peer: ReplicaID, message: Vec<u8>) {
        if let Some(sender) = self.senders.get(&peer.int()) {
            let _ = sender.send((self.id, message));
        }
    }

    fn recv(&mut self) -> Option<(ReplicaID, Vec<u8>)> {
        self.receiver.lock().unwrap().try_recv().ok()
    }
}

/// Create one connected [`NetworkStub`] per replica.
pub fn mock_network(n: usize) -> Vec<NetworkStub> {
    let mut senders = HashMap::new();
    let mut receivers = Vec::new();
    for i in 0..n {
        let (tx, rx) = mpsc::channel();
        senders.insert(i as u8, tx);
        receivers.push(rx);
    }
    receivers
        .into_iter()
        .enumerate()
        .map(|(i, receiver)| NetworkStub {
            id: ReplicaID::new(i as u8),
            senders: senders.clone(),
            receiver: Arc::new(Mutex::new(receiver)),
        })
        .collect()
}

/// A running replica plus recordings of the events the tests assert on.
pub struct Node {
    pub replica: Replica,
    committed: Arc<Mutex<Vec<CommittedRecord>>>,
    decided: Arc<Mutex<Vec<Finality>>>,
    delivered: Arc<Mutex<Vec<CryptoHash>>>,
    relays: Arc<Mutex<Vec<CryptoHash>>>,
    proposals: Arc<Mutex<u32>>,
}

/// One commit observed at a node: the block, its height, and how many proposals the node had
/// made when the commit happened.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CommittedRecord {
    pub block: CryptoHash,
    pub height: u32,
    pub proposals_at_commit: u32,
}

impl Node {
    pub fn start(
        id: usize,
        keypair: Keypair,
        replica_set: ReplicaSet,
        network: NetworkStub,
        fanout: usize,
        blk_size: usize,
    ) -> Node {
        let committed = Arc::new(Mutex::new(Vec::new()));
        let decided = Arc::new(Mutex::new(Vec::new()));
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let relays = Arc::new(Mutex::new(Vec::new()));
        let proposals = Arc::new(Mutex::new(0u32));

        let handlers = {
            let committed = committed.clone();
            let decided = decided.clone();
            let delivered = delivered.clone();
            let relays = relays.clone();
            let proposals_for_commits = proposals.clone();
            let proposals_for_proposes = proposals.clone();
            EventHandlers::new(true)
                .with_commit_block_handler(Box::new(move |event| {
                    committed.lock().unwrap().push(CommittedRecord {
                        block: event.block,
                        height: event.height.int(),
                        proposals_at_commit: *proposals_for_commits.lock().unwrap(),
                    })
                }))
                .with_decide_handler(Box::new(move |event| {
                    decided.lock().unwrap().push(event.finality)
                }))
                .with_deliver_block_handler(Box::new(move |event| {
                    delivered.lock().unwrap().push(event.block)
                }))
                .with_relay_vote_handler(Box::new(move |event| {
                    relays.lock().unwrap().push(event.relay.blk_hash)
                }))
                .with_propose_handler(Box::new(move |_| {
                    *proposals_for_proposes.lock().unwrap() += 1
                }))
        };

        let replica = Replica::start(
            Configuration {
                id: ReplicaID::new(id as u8),
                keypair,
                replica_set,
                fanout,
                blk_size,
                verifier_threads: 2,
                fetch_retry_timeout: Duration::from_secs(30),
            },
            network,
            StaticPacemaker::new(Block::genesis().hash),
            handlers,
        );

        Node {
            replica,
            committed,
            decided,
            delivered,
            relays,
            proposals,
        }
    }

    pub fn committed(&self) -> Vec<CommittedRecord> {
        self.committed.lock().unwrap().clone()
    }

    pub fn decided_cmds(&self) -> Vec<CryptoHash> {
        self.decided.lock().unwrap().iter().map(|f| f.cmd_hash).collect()
    }

    pub fn delivered(&self) -> Vec<CryptoHash> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn relays_for(&self, blk_hash: &CryptoHash) -> usize {
        self.relays.lock().unwrap().iter().filter(|h| *h == blk_hash).count()
    }

    pub fn proposal_count(&self) -> u32 {
        *self.proposals.lock().unwrap()
    }
}

/// Poll `condition` until it holds, panicking after `timeout`.
pub fn wait_until(timeout: Duration, what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !condition() {
        if Instant::now() > deadline {
            panic!("timed out waiting for: {}", what);
        }
        thread::sleep(Duration::from_millis(50));
    }
}
