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
use std::time::Duration;
use parking_lot::RwLock;
use tokio::time::sleep;
use tracing::debug;

use crate::errors::RedlockResult;
use crate::lock::{Lock, NodeOp, QuorumCoordinator};
use crate::random_backoff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first one
    pub max_retries: u32,
    /// Upper bound of the uniform random backoff
    pub retry_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_wait: Duration::from_millis(100),
        }
    }
}

/// Wraps acquisition with bounded, randomly spaced retries. Every attempt
/// is a fresh acquisition with its own token and clock.
pub struct RetryScheduler {
    policy: RwLock<RetryPolicy>,
    debug: bool,
}

impl RetryScheduler {
    pub fn new(policy: RetryPolicy, debug: bool) -> Self {
        Self {
            policy: RwLock::new(policy),
            debug,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        *self.policy.read()
    }

    pub fn set_retry(&self, max_retries: u32, retry_wait: Duration) {
        *self.policy.write() = RetryPolicy { max_retries, retry_wait };
    }

    pub async fn lock(&self, coordinator: &QuorumCoordinator, resource: &str, ttl: Duration) -> RedlockResult<Lock> {
        let policy = self.policy();
        let mut remaining = policy.max_retries;

        loop {
            match coordinator.acquire(resource, None, ttl, NodeOp::Acquire).await {
                Ok(lock) => return Ok(lock),
                Err(e) if e.is_acquisition_failure() && remaining > 0 => {
                    remaining -= 1;
                    let delay = random_backoff(policy.retry_wait);
                    if self.debug {
                        debug!("Retrying lock on {} in {:?} ({} retries left): {}", resource, delay, remaining, e);
                    }
                    sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
