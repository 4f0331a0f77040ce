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
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use rand::Rng;
use uuid::Uuid;

pub fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

/// Lock token: caller identity, timestamp and random entropy.
pub fn get_lock_id(caller_id: &str) -> String {
    format!("{}_{}_{}", caller_id, unix_millis(), Uuid::new_v4().simple())
}

/// Candidate identity offered to a node during queue identity negotiation.
pub fn get_server_id() -> String {
    format!("{}_{}", unix_millis(), Uuid::new_v4().simple())
}

pub fn num_milliseconds(duration: &Duration) -> u64 {
    duration.as_millis() as u64
}

pub fn calculate_quorum(n: usize) -> usize {
    n / 2 + 1
}

/// Remaining safe lock duration in milliseconds. May be negative.
pub fn validity_millis(ttl: Duration, elapsed: Duration, drift: Duration) -> i64 {
    ttl.as_millis() as i64 - elapsed.as_millis() as i64 - drift.as_millis() as i64
}

/// Uniform backoff in `[0, max_wait)`.
pub fn random_backoff(max_wait: Duration) -> Duration {
    let max_ms = num_milliseconds(&max_wait);
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..max_ms))
}
