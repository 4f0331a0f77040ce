/*
 *
 *  *
 *  *      Copyright (c) 2018-2025, SnackCloud All rights reserved.
 *  *
 *  *   Redistribution and use in source and binary forms, with or without
 *  *   modification, are permitted provided that the following conditions are met:
 *  *
 *  *   Redistributions of source code must retain the above copyright notice,
 *  *   this list of conditions and the following disclaimer.
 *  *   Redistributions in binary form must reproduce the above copyright
 *  *   notice, this list of conditions and the following disclaimer in the
 *  *   documentation and/or other materials provided with the distribution.
 *  *   Neither the name of the www.snackcloud.cn developer nor the names of its
 *  *   contributors may be used to endorse or promote products derived from
 *  *   this software without specific prior written permission.
 *  *   Author: SnackCloud
 *  *
 *
 */
//! Redlock distributed mutual exclusion over independent Redis nodes.
//!
//! A lock is held once a majority of nodes accepted it within the time
//! left after subtracting the acquisition time and a clock drift budget.
//! Releases that cannot reach a node are queued on the other nodes and
//! replayed when it comes back.

mod config;
mod errors;
mod util;
mod scripts;
mod connection;
mod lock;
mod connectivity;
mod queue;
mod client;

pub use config::*;
pub use errors::*;
pub use util::*;
pub use connection::*;
pub use lock::*;
pub use connectivity::*;
pub use queue::*;
pub use client::*;
