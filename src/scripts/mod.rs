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
use once_cell::sync::Lazy;
use redis::Script;

/// Delete the record only if it still holds the caller's token
pub static UNLOCK_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(r#"
        local key = KEYS[1]
        local token = ARGV[1]

        if redis.call('get', key) == token then
            return redis.call('del', key)
        end

        return 0
    "#)
});

/// Renewal script
pub static RENEW_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(r#"
        local key = KEYS[1]
        local token = ARGV[1]
        local new_ttl = ARGV[2]

        if redis.call('get', key) == token then
            return redis.call('pexpire', key, new_ttl)
        end

        return 0
    "#)
});

/// Set the node identity if absent, otherwise return the one already stored.
/// Concurrent callers all converge on the winner's value.
pub static SERVER_ID_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(r#"
        local key = KEYS[1]
        local candidate = ARGV[1]

        local current = redis.call('get', key)
        if current then
            return current
        end

        redis.call('set', key, candidate)
        return candidate
    "#)
});

/// Append a queue entry and refresh the queue expiry
pub static ENQUEUE_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(r#"
        local key = KEYS[1]
        local item = ARGV[1]
        local ttl = ARGV[2]

        local length = redis.call('rpush', key, item)
        redis.call('expire', key, ttl)
        return length
    "#)
});
