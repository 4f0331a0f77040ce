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
mod quorum;
mod retry;

pub use quorum::*;
pub use retry::*;

use std::time::Duration;

/// A lock held on a quorum of nodes.
///
/// `value` is the only credential needed to renew or release it. The handle
/// is never updated; `renew` returns a fresh one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    pub resource: String,
    pub value: String,
    /// Safe remaining duration measured from the end of the acquisition
    pub validity: Duration,
}

impl Lock {
    pub fn validity_ms(&self) -> u64 {
        self.validity.as_millis() as u64
    }
}

/// The per-node write a quorum pass dispatches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeOp {
    /// Set if absent with expiry
    Acquire,
    /// Extend expiry if the stored token matches
    Renew,
}
