/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The consensus subprotocol: proposal handling and voting, tree-based vote aggregation, and the
//! wire messages both travel in.

pub mod messages;

pub(crate) mod aggregation;

pub(crate) mod protocol;
