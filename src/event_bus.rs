/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Thread that receives events emitted by the [algorithm](crate::algorithm) thread and passes
//! them to event handlers.
//!
//! When the thread receives a message containing an [event](crate::events::Event), it triggers
//! the execution of all handlers defined for the contained event type, where the handlers for
//! each event type are stored in [`EventHandlers`].
//!
//! A replica's instance of `EventHandlers` contains:
//! 1. The handlers provided upon building the replica, and
//! 2. If logging was enabled in [`EventHandlers::new`], the default logging handlers defined in
//!    [logging](crate::logging).

use std::sync::mpsc::{Receiver, TryRecvError};
use std::thread::{self, JoinHandle};

use crate::events::*;
use crate::logging::Logger;

/// Pointer to a handler closure, parametrised by the argument (for our use case, event) type.
pub type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

/// Stores the two optional handlers enabled for an event type that implements the [`Logger`]
/// trait, namely one logging handler, defined in [`logging`](crate::logging), and one
/// user-defined handler.
pub(crate) struct HandlerPair<T: Logger> {
    user_defined_handler: Option<HandlerPtr<T>>,
    logging_handler: Option<HandlerPtr<T>>,
}

impl<T: Logger> HandlerPair<T> {
    fn new(log: bool) -> HandlerPair<T> {
        HandlerPair {
            user_defined_handler: None,
            logging_handler: if log { Some(T::get_logger()) } else { None },
        }
    }

    fn fire(&self, event: &T) {
        if let Some(handler) = &self.logging_handler {
            handler(event)
        }
        if let Some(handler) = &self.user_defined_handler {
            handler(event)
        }
    }
}

/// Stores the user-defined and optional logging handlers for each pre-defined event type from
/// [events](crate::events).
///
/// Create with [`new`](Self::new) and attach user handlers with the `with_*` methods.
pub struct EventHandlers {
    pub(crate) insert_block: HandlerPair<InsertBlockEvent>,
    pub(crate) deliver_block: HandlerPair<DeliverBlockEvent>,
    pub(crate) update_highest_qc: HandlerPair<UpdateHighestQCEvent>,
    pub(crate) update_locked_block: HandlerPair<UpdateLockedBlockEvent>,
    pub(crate) commit_block: HandlerPair<CommitBlockEvent>,
    pub(crate) decide: HandlerPair<DecideEvent>,
    pub(crate) propose: HandlerPair<ProposeEvent>,
    pub(crate) vote: HandlerPair<VoteEvent>,
    pub(crate) relay_vote: HandlerPair<RelayVoteEvent>,
    pub(crate) receive_proposal: HandlerPair<ReceiveProposalEvent>,
    pub(crate) receive_vote: HandlerPair<ReceiveVoteEvent>,
    pub(crate) receive_vote_relay: HandlerPair<ReceiveVoteRelayEvent>,
    pub(crate) collect_qc: HandlerPair<CollectQCEvent>,
}

impl EventHandlers {
    /// Create handlers for every event type. If `log` is true, the default logging handlers are
    /// attached.
    pub fn new(log: bool) -> EventHandlers {
        EventHandlers {
            insert_block: HandlerPair::new(log),
            deliver_block: HandlerPair::new(log),
            update_highest_qc: HandlerPair::new(log),
            update_locked_block: HandlerPair::new(log),
            commit_block: HandlerPair::new(log),
            decide: HandlerPair::new(log),
            propose: HandlerPair::new(log),
            vote: HandlerPair::new(log),
            relay_vote: HandlerPair::new(log),
            receive_proposal: HandlerPair::new(log),
            receive_vote: HandlerPair::new(log),
            receive_vote_relay: HandlerPair::new(log),
            collect_qc: HandlerPair::new(log),
        }
    }

    pub fn with_insert_block_handler(mut self, handler: HandlerPtr<InsertBlockEvent>) -> Self {
        self.insert_block.user_defined_handler = Some(handler);
        self
    }

    pub fn with_deliver_block_handler(mut self, handler: HandlerPtr<DeliverBlockEvent>) -> Self {
        self.deliver_block.user_defined_handler = Some(handler);
        self
    }

    pub fn with_update_highest_qc_handler(
        mut self,
        handler: HandlerPtr<UpdateHighestQCEvent>,
    ) -> Self {
        self.update_highest_qc.user_defined_handler = Some(handler);
        self
    }

    pub fn with_update_locked_block_handler(
        mut self,
        handler: HandlerPtr<UpdateLockedBlockEvent>,
    ) -> Self {
        self.update_locked_block.user_defined_handler = Some(handler);
        self
    }

    pub fn with_commit_block_handler(mut self, handler: HandlerPtr<CommitBlockEvent>) -> Self {
        self.commit_block.user_defined_handler = Some(handler);
        self
    }

    pub fn with_decide_handler(mut self, handler: HandlerPtr<DecideEvent>) -> Self {
        self.decide.user_defined_handler = Some(handler);
        self
    }

    pub fn with_propose_handler(mut self, handler: HandlerPtr<ProposeEvent>) -> Self {
        self.propose.user_defined_handler = Some(handler);
        self
    }

    pub fn with_vote_handler(mut self, handler: HandlerPtr<VoteEvent>) -> Self {
        self.vote.user_defined_handler = Some(handler);
        self
    }

    pub fn with_relay_vote_handler(mut self, handler: HandlerPtr<RelayVoteEvent>) -> Self {
        self.relay_vote.user_defined_handler = Some(handler);
        self
    }

    pub fn with_receive_proposal_handler(
        mut self,
        handler: HandlerPtr<ReceiveProposalEvent>,
    ) -> Self {
        self.receive_proposal.user_defined_handler = Some(handler);
        self
    }

    pub fn with_receive_vote_handler(mut self, handler: HandlerPtr<ReceiveVoteEvent>) -> Self {
        self.receive_vote.user_defined_handler = Some(handler);
        self
    }

    pub fn with_receive_vote_relay_handler(
        mut self,
        handler: HandlerPtr<ReceiveVoteRelayEvent>,
    ) -> Self {
        self.receive_vote_relay.user_defined_handler = Some(handler);
        self
    }

    pub fn with_collect_qc_handler(mut self, handler: HandlerPtr<CollectQCEvent>) -> Self {
        self.collect_qc.user_defined_handler = Some(handler);
        self
    }
}

/// Spawn the event bus thread.
pub(crate) fn start_event_bus(
    handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("event bus thread disconnected from main thread")
            }
        }

        match event_subscriber.try_recv() {
            Ok(event) => match event {
                Event::InsertBlock(ev) => handlers.insert_block.fire(&ev),
                Event::DeliverBlock(ev) => handlers.deliver_block.fire(&ev),
                Event::UpdateHighestQC(ev) => handlers.update_highest_qc.fire(&ev),
                Event::UpdateLockedBlock(ev) => handlers.update_locked_block.fire(&ev),
                Event::CommitBlock(ev) => handlers.commit_block.fire(&ev),
                Event::Decide(ev) => handlers.decide.fire(&ev),
                Event::Propose(ev) => handlers.propose.fire(&ev),
                Event::Vote(ev) => handlers.vote.fire(&ev),
                Event::RelayVote(ev) => handlers.relay_vote.fire(&ev),
                Event::ReceiveProposal(ev) => handlers.receive_proposal.fire(&ev),
                Event::ReceiveVote(ev) => handlers.receive_vote.fire(&ev),
                Event::ReceiveVoteRelay(ev) => handlers.receive_vote_relay.fire(&ev),
                Event::CollectQC(ev) => handlers.collect_qc.fire(&ev),
            },
            Err(TryRecvError::Empty) => thread::yield_now(),
            Err(TryRecvError::Disconnected) => return,
        }
    })
}
