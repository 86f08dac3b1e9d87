/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them when building the
//! replica's [event handlers](crate::event_bus::EventHandlers::new).
//!
//! Logging goes through the [log](https://docs.rs/log/latest/log/) crate. To get these messages
//! printed onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least two values. The first two values
//! are always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//!
//! The rest of the values differ depending on the kind of event. Block and command hashes are
//! printed as the first seven characters of their Base64 encoding.

use std::time::SystemTime;

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};

use crate::events::*;

// Names of each event in PascalCase for printing:
pub const INSERT_BLOCK: &str = "InsertBlock";
pub const DELIVER_BLOCK: &str = "DeliverBlock";
pub const UPDATE_HIGHEST_QC: &str = "UpdateHighestQC";
pub const UPDATE_LOCKED_BLOCK: &str = "UpdateLockedBlock";
pub const COMMIT_BLOCK: &str = "CommitBlock";
pub const DECIDE: &str = "Decide";

pub const PROPOSE: &str = "Propose";
pub const VOTE: &str = "Vote";
pub const RELAY_VOTE: &str = "RelayVote";

pub const RECEIVE_PROPOSAL: &str = "ReceiveProposal";
pub const RECEIVE_VOTE: &str = "ReceiveVote";
pub const RECEIVE_VOTE_RELAY: &str = "ReceiveVoteRelay";

pub const COLLECT_QC: &str = "CollectQC";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for InsertBlockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &InsertBlockEvent| {
            log::info!(
                "{}, {}, {}, {}",
                INSERT_BLOCK,
                secs_since_unix_epoch(event.timestamp),
                first_seven_base64_chars(&event.block.hash.bytes()),
                event.block.height
            )
        })
    }
}

impl Logger for DeliverBlockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &DeliverBlockEvent| {
            log::info!(
                "{}, {}, {}, {}",
                DELIVER_BLOCK,
                secs_since_unix_epoch(event.timestamp),
                first_seven_base64_chars(&event.block.bytes()),
                event.height
            )
        })
    }
}

impl Logger for UpdateHighestQCEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &UpdateHighestQCEvent| {
            log::info!(
                "{}, {}, {}, {}",
                UPDATE_HIGHEST_QC,
                secs_since_unix_epoch(event.timestamp),
                first_seven_base64_chars(&event.highest_qc.obj_hash.bytes()),
                event.highest_qc.count()
            )
        })
    }
}

impl Logger for UpdateLockedBlockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &UpdateLockedBlockEvent| {
            log::info!(
                "{}, {}, {}",
                UPDATE_LOCKED_BLOCK,
                secs_since_unix_epoch(event.timestamp),
                first_seven_base64_chars(&event.block.bytes())
            )
        })
    }
}

impl Logger for CommitBlockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &CommitBlockEvent| {
            log::info!(
                "{}, {}, {}, {}",
                COMMIT_BLOCK,
                secs_since_unix_epoch(event.timestamp),
                first_seven_base64_chars(&event.block.bytes()),
                event.height
            )
        })
    }
}

impl Logger for DecideEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &DecideEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                DECIDE,
                secs_since_unix_epoch(event.timestamp),
                first_seven_base64_chars(&event.finality.cmd_hash.bytes()),
                first_seven_base64_chars(&event.finality.blk_hash.bytes()),
                event.finality.blk_height
            )
        })
    }
}

impl Logger for ProposeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ProposeEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                PROPOSE,
                secs_since_unix_epoch(event.timestamp),
                event.proposal.proposer,
                first_seven_base64_chars(&event.proposal.block.hash.bytes()),
                event.proposal.block.height
            )
        })
    }
}

impl Logger for VoteEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &VoteEvent| {
            log::info!(
                "{}, {}, {}, {}",
                VOTE,
                secs_since_unix_epoch(event.timestamp),
                event.vote.voter,
                first_seven_base64_chars(&event.vote.blk_hash.bytes())
            )
        })
    }
}

impl Logger for RelayVoteEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &RelayVoteEvent| {
            log::info!(
                "{}, {}, {}, {}",
                RELAY_VOTE,
                secs_since_unix_epoch(event.timestamp),
                first_seven_base64_chars(&event.relay.blk_hash.bytes()),
                event.relay.cert.count()
            )
        })
    }
}

impl Logger for ReceiveProposalEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ReceiveProposalEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                RECEIVE_PROPOSAL,
                secs_since_unix_epoch(event.timestamp),
                event.origin,
                first_seven_base64_chars(&event.proposal.block.hash.bytes()),
                event.proposal.block.height
            )
        })
    }
}

impl Logger for ReceiveVoteEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ReceiveVoteEvent| {
            log::info!(
                "{}, {}, {}, {}",
                RECEIVE_VOTE,
                secs_since_unix_epoch(event.timestamp),
                event.origin,
                first_seven_base64_chars(&event.vote.blk_hash.bytes())
            )
        })
    }
}

impl Logger for ReceiveVoteRelayEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ReceiveVoteRelayEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                RECEIVE_VOTE_RELAY,
                secs_since_unix_epoch(event.timestamp),
                event.origin,
                first_seven_base64_chars(&event.relay.blk_hash.bytes()),
                event.relay.cert.count()
            )
        })
    }
}

impl Logger for CollectQCEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &CollectQCEvent| {
            log::info!(
                "{}, {}, {}, {}",
                COLLECT_QC,
                secs_since_unix_epoch(event.timestamp),
                first_seven_base64_chars(&event.quorum_certificate.obj_hash.bytes()),
                event.quorum_certificate.count()
            )
        })
    }
}

fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let base64_string = STANDARD_NO_PAD.encode(bytes);
    base64_string.chars().take(7).collect()
}

fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("timestamp predates the unix epoch")
        .as_secs()
}
