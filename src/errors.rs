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
use redis::RedisError;
use thiserror::Error;

pub type RedlockResult<T> = std::result::Result<T, RedlockError>;

#[derive(Error, Debug)]
pub enum RedlockError {
    #[error("Redis error: {0}")]
    RedisError(#[from] RedisError),

    #[error("No redis servers provided")]
    NoServerError,

    /// Timeout or connection failure on a single node. Only costs that node's vote.
    #[error("Node unreachable: {0}")]
    NodeUnreachable(String),

    /// The conditional write found an existing record on a single node.
    #[error("Resource already locked: {0}")]
    RecordLocked(String),

    #[error("Could not lock resource {resource}: {successes} of {quorum} required nodes approved")]
    QuorumNotReached {
        resource: String,
        successes: usize,
        quorum: usize,
    },

    #[error("Could not lock resource {resource}: validity window consumed ({validity_ms} ms left)")]
    ValidityExpired { resource: String, validity_ms: i64 },

    /// Token mismatch or absent record on a single node during renewal.
    #[error("Renewal rejected for resource: {0}")]
    RenewRejected(String),

    #[error("Could not negotiate server identity for node {0}")]
    ServerIdentityConflict(String),

    #[error("Connection pool error: {0}")]
    PoolError(String),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("Async runtime error: {0}")]
    AsyncError(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

impl RedlockError {
    /// Whether this is one of the aggregate acquisition failures a caller may retry.
    pub fn is_acquisition_failure(&self) -> bool {
        matches!(
            self,
            RedlockError::QuorumNotReached { .. } | RedlockError::ValidityExpired { .. }
        )
    }
}

impl From<deadpool::managed::PoolError<RedisError>> for RedlockError {
    fn from(err: deadpool::managed::PoolError<RedisError>) -> Self {
        match err {
            deadpool::managed::PoolError::Backend(e) => RedlockError::RedisError(e),
            other => RedlockError::PoolError(other.to_string()),
        }
    }
}

impl From<deadpool::managed::BuildError> for RedlockError {
    fn from(err: deadpool::managed::BuildError) -> Self {
        RedlockError::PoolError(err.to_string())
    }
}

impl From<tokio::task::JoinError> for RedlockError {
    fn from(err: tokio::task::JoinError) -> Self {
        RedlockError::AsyncError(err.to_string())
    }
}

impl From<serde_json::Error> for RedlockError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            RedlockError::DeserializationError(err.to_string())
        } else {
            RedlockError::SerializationError(err.to_string())
        }
    }
}
