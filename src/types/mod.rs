/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of the library's data types.

pub mod basic;

pub mod block;

pub mod certificates;

pub mod keypair;

pub mod replica_set;
