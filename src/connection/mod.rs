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
mod memory_node;
mod redis_node;

pub use memory_node::*;
pub use redis_node::*;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{watch, Mutex as TokioMutex, MutexGuard};

use crate::errors::{RedlockError, RedlockResult};

/// Capabilities a storage node must offer. Every compare-and-act operation
/// must be atomic on the node itself.
#[async_trait]
pub trait LockNode: Send + Sync {
    fn address(&self) -> &str;

    /// Set only if absent, with expiry. True iff it set.
    async fn conditional_set(&self, key: &str, value: &str, ttl: Duration) -> RedlockResult<bool>;

    /// Delete only if the stored value equals `expected`. True iff deleted.
    async fn compare_delete(&self, key: &str, expected: &str) -> RedlockResult<bool>;

    /// Extend the expiry only if the stored value equals `expected`.
    async fn compare_extend(&self, key: &str, expected: &str, ttl: Duration) -> RedlockResult<bool>;

    /// Store `candidate` if the key is absent, otherwise return what is stored.
    async fn get_or_set_identity(&self, key: &str, candidate: &str) -> RedlockResult<String>;

    async fn exists(&self, key: &str) -> RedlockResult<bool>;

    async fn get(&self, key: &str) -> RedlockResult<Option<String>>;

    /// Append to a list and refresh the list expiry.
    async fn list_append(&self, key: &str, item: &str, ttl: Duration) -> RedlockResult<()>;

    async fn list_range(&self, key: &str) -> RedlockResult<Vec<String>>;

    async fn list_length(&self, key: &str) -> RedlockResult<usize>;

    /// Remove one occurrence of each item from a list. The key goes away once empty.
    async fn list_remove(&self, key: &str, items: &[String]) -> RedlockResult<()>;

    async fn delete(&self, key: &str) -> RedlockResult<()>;

    /// Reachability signal. A `true` publish is a ready event, `false` an end event.
    fn reachability(&self) -> watch::Receiver<bool>;

    async fn close(&self);
}

#[derive(Debug, Clone, Default)]
pub struct NodeState {
    pub identity: Option<String>,
    pub reachable: bool,
}

#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub index: usize,
    pub address: String,
    pub identity: Option<String>,
    pub reachable: bool,
}

/// Runtime handle of one node inside a Redlock instance
pub struct NodeHandle {
    index: usize,
    node: Arc<dyn LockNode>,
    timeout: Duration,
    state: Mutex<NodeState>,
    poll_guard: TokioMutex<()>,
}

impl NodeHandle {
    pub fn new(index: usize, node: Arc<dyn LockNode>, timeout: Duration) -> Self {
        Self {
            index,
            node,
            timeout,
            state: Mutex::new(NodeState::default()),
            poll_guard: TokioMutex::new(()),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn node(&self) -> &Arc<dyn LockNode> {
        &self.node
    }

    pub fn address(&self) -> &str {
        self.node.address()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn identity(&self) -> Option<String> {
        self.state.lock().identity.clone()
    }

    /// Records the identity unless one is already set; returns the identity in effect.
    pub fn adopt_identity(&self, identity: String) -> String {
        let mut state = self.state.lock();
        state.identity.get_or_insert(identity).clone()
    }

    pub fn is_reachable(&self) -> bool {
        self.state.lock().reachable
    }

    /// Returns the previous reachability.
    pub fn set_reachable(&self, reachable: bool) -> bool {
        std::mem::replace(&mut self.state.lock().reachable, reachable)
    }

    pub fn status(&self) -> NodeStatus {
        let state = self.state.lock();
        NodeStatus {
            index: self.index,
            address: self.node.address().to_string(),
            identity: state.identity.clone(),
            reachable: state.reachable,
        }
    }

    /// Held while this node's recovery queue is being drained.
    pub fn try_poll_guard(&self) -> Option<MutexGuard<'_, ()>> {
        self.poll_guard.try_lock().ok()
    }

    /// Run one node operation bounded by `min(node timeout, limit)`.
    /// A timeout is reported as the node being unreachable.
    pub async fn call<T, F>(&self, limit: Duration, operation: F) -> RedlockResult<T>
    where
        F: Future<Output = RedlockResult<T>>,
    {
        let bound = self.timeout.min(limit);
        match tokio::time::timeout(bound, operation).await {
            Ok(result) => result,
            Err(_) => Err(RedlockError::NodeUnreachable(format!(
                "{} (timed out after {:?})",
                self.address(),
                bound
            ))),
        }
    }
}
