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
use std::sync::Arc;
use std::time::Duration;
use futures::future::join_all;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::connection::NodeHandle;
use crate::errors::{RedlockError, RedlockResult};
use crate::lock::{Lock, NodeOp};
use crate::queue::{QueueCommand, UnlockQueue};
use crate::{calculate_quorum, get_lock_id, validity_millis};

/// Fans one logical operation out to every node and decides on the
/// aggregate. Per-node errors only cost that node's vote.
pub struct QuorumCoordinator {
    nodes: Vec<Arc<NodeHandle>>,
    quorum: usize,
    drift: Duration,
    caller_id: String,
    queue: Arc<UnlockQueue>,
    runtime: Handle,
    debug: bool,
}

impl QuorumCoordinator {
    pub fn new(
        nodes: Vec<Arc<NodeHandle>>,
        drift: Duration,
        caller_id: String,
        queue: Arc<UnlockQueue>,
        runtime: Handle,
        debug: bool,
    ) -> Self {
        let quorum = calculate_quorum(nodes.len());
        Self {
            nodes,
            quorum,
            drift,
            caller_id,
            queue,
            runtime,
            debug,
        }
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    pub fn nodes(&self) -> &[Arc<NodeHandle>] {
        &self.nodes
    }

    /// One quorum pass. Waits for every node to answer or time out before
    /// deciding, since the validity window depends on the slowest node.
    ///
    /// A failed `Acquire` pass releases whatever it managed to write, in the
    /// background. A failed `Renew` pass leaves existing records untouched.
    pub async fn acquire(
        &self,
        resource: &str,
        value: Option<&str>,
        ttl: Duration,
        op: NodeOp,
    ) -> RedlockResult<Lock> {
        if resource.is_empty() {
            return Err(RedlockError::InvalidOperation("Resource name cannot be empty".to_string()));
        }
        if ttl.is_zero() {
            return Err(RedlockError::InvalidOperation("Lock ttl must be positive".to_string()));
        }

        let value = match value {
            Some(value) => value.to_string(),
            None => get_lock_id(&self.caller_id),
        };
        let start_time = Instant::now();

        let votes = join_all(
            self.nodes
                .iter()
                .map(|handle| self.vote(handle, op, resource, &value, ttl)),
        )
        .await;

        let elapsed = start_time.elapsed();
        let successes = votes.iter().filter(|vote| vote.is_ok()).count();
        let validity_ms = validity_millis(ttl, elapsed, self.drift);

        if self.debug {
            debug!("Time spent on {:?} of {}: {:?}", op, resource, elapsed);
            debug!("{} of {} servers approve, quorum {}", successes, self.nodes.len(), self.quorum);
        }

        if op == NodeOp::Renew {
            queue_failed(&self.nodes, &self.queue, &votes, QueueCommand::Renew, resource, &value).await;
        }

        if successes >= self.quorum && validity_ms > 0 {
            return Ok(Lock {
                resource: resource.to_string(),
                value,
                validity: Duration::from_millis(validity_ms as u64),
            });
        }

        if op == NodeOp::Acquire {
            self.spawn_release(resource, &value);
        }

        if successes < self.quorum {
            Err(RedlockError::QuorumNotReached {
                resource: resource.to_string(),
                successes,
                quorum: self.quorum,
            })
        } else {
            Err(RedlockError::ValidityExpired {
                resource: resource.to_string(),
                validity_ms,
            })
        }
    }

    /// Best-effort compare-and-delete on every node. Never fails; nodes that
    /// could not be reached get the release queued for later replay.
    pub async fn release(&self, resource: &str, value: &str) {
        release_on(&self.nodes, &self.queue, self.debug, resource, value).await
    }

    /// Runs `release` as its own task and returns at once. Awaiting the
    /// handle is optional.
    pub fn spawn_release(&self, resource: &str, value: &str) -> JoinHandle<()> {
        let nodes = self.nodes.clone();
        let queue = self.queue.clone();
        let debug = self.debug;
        let resource = resource.to_string();
        let value = value.to_string();
        self.runtime
            .spawn(async move { release_on(&nodes, &queue, debug, &resource, &value).await })
    }

    async fn vote(
        &self,
        handle: &NodeHandle,
        op: NodeOp,
        resource: &str,
        value: &str,
        ttl: Duration,
    ) -> RedlockResult<()> {
        let node = handle.node();
        let result = match op {
            NodeOp::Acquire => handle
                .call(ttl, node.conditional_set(resource, value, ttl))
                .await
                .and_then(|set| if set { Ok(()) } else { Err(RedlockError::RecordLocked(resource.to_string())) }),
            NodeOp::Renew => handle
                .call(ttl, node.compare_extend(resource, value, ttl))
                .await
                .and_then(|extended| if extended { Ok(()) } else { Err(RedlockError::RenewRejected(resource.to_string())) }),
        };

        if let Err(e) = &result {
            if self.debug {
                debug!("Failed to {:?} {} on {}: {}", op, resource, handle.address(), e);
            }
        }
        result
    }
}

async fn release_on(nodes: &[Arc<NodeHandle>], queue: &UnlockQueue, debug: bool, resource: &str, value: &str) {
    let results = join_all(nodes.iter().map(|handle| {
        handle.call(handle.timeout(), handle.node().compare_delete(resource, value))
    }))
    .await;

    if debug {
        let released = results.iter().filter(|r| matches!(r, Ok(true))).count();
        debug!("Released {} on {} of {} servers", resource, released, nodes.len());
    }

    queue_failed(nodes, queue, &results, QueueCommand::Unlock, resource, value).await;
}

/// Queue the operation for every node that failed at the transport level.
/// Token mismatches are final answers and are not queued.
async fn queue_failed<T>(
    nodes: &[Arc<NodeHandle>],
    queue: &UnlockQueue,
    results: &[RedlockResult<T>],
    command: QueueCommand,
    resource: &str,
    value: &str,
) {
    let failed = nodes
        .iter()
        .zip(results)
        .filter(|(_, result)| matches!(result, Err(e) if is_node_failure(e)))
        .map(|(handle, _)| handle);

    for handle in failed {
        queue.enqueue(handle, command, resource, value).await;
    }
}

fn is_node_failure(err: &RedlockError) -> bool {
    !matches!(
        err,
        RedlockError::RecordLocked(_) | RedlockError::RenewRejected(_) | RedlockError::InvalidOperation(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;
    use crate::connection::{LockNode, MemoryNode};

    struct Cluster {
        nodes: Vec<Arc<MemoryNode>>,
        coordinator: QuorumCoordinator,
    }

    fn cluster(count: usize, drift: Duration) -> Cluster {
        let nodes: Vec<Arc<MemoryNode>> = (0..count)
            .map(|i| Arc::new(MemoryNode::new(&format!("node-{}", i))))
            .collect();
        let handles: Vec<Arc<NodeHandle>> = nodes
            .iter()
            .enumerate()
            .map(|(i, node)| {
                let handle = NodeHandle::new(i, node.clone() as Arc<dyn LockNode>, Duration::from_secs(1));
                handle.set_reachable(true);
                Arc::new(handle)
            })
            .collect();
        let queue = Arc::new(UnlockQueue::new(handles.clone(), Duration::from_secs(3600), true, false));
        let coordinator =
            QuorumCoordinator::new(handles, drift, "tester".to_string(), queue, Handle::current(), true);
        Cluster { nodes, coordinator }
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        for _ in 0..300 {
            if condition() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_tolerates_minority_failure() {
        let cluster = cluster(3, Duration::from_millis(100));
        cluster.nodes[2].set_reachable(false);

        let lock = cluster
            .coordinator
            .acquire("res", None, Duration::from_millis(1000), NodeOp::Acquire)
            .await
            .unwrap();

        assert_eq!(lock.resource, "res");
        assert!(lock.value.starts_with("tester_"));
        assert_eq!(lock.validity, Duration::from_millis(900));
        assert_eq!(cluster.nodes[0].record("res"), Some(lock.value.clone()));
        assert_eq!(cluster.nodes[1].record("res"), Some(lock.value.clone()));
        assert_eq!(cluster.nodes[2].record("res"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quorum_not_reached_releases_partial_writes() {
        let cluster = cluster(3, Duration::from_millis(100));
        cluster.nodes[1].set_reachable(false);
        cluster.nodes[2].set_reachable(false);

        let result = cluster
            .coordinator
            .acquire("res", Some("token"), Duration::from_millis(1000), NodeOp::Acquire)
            .await;

        match result {
            Err(RedlockError::QuorumNotReached { successes, quorum, .. }) => {
                assert_eq!(successes, 1);
                assert_eq!(quorum, 2);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        wait_until(|| cluster.nodes[0].record("res").is_none()).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_validity_expired_releases_records() {
        let cluster = cluster(1, Duration::from_millis(100));
        cluster.nodes[0].set_latency(Duration::from_millis(200));

        let result = cluster
            .coordinator
            .acquire("res", None, Duration::from_millis(250), NodeOp::Acquire)
            .await;

        match result {
            Err(RedlockError::ValidityExpired { validity_ms, .. }) => assert!(validity_ms <= 0),
            other => panic!("unexpected result: {:?}", other),
        }
        wait_until(|| cluster.nodes[0].record("res").is_none()).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_wedged_node_is_bounded_by_ttl() {
        let cluster = cluster(3, Duration::from_millis(10));
        cluster.nodes[2].set_latency(Duration::from_secs(30));

        let start = Instant::now();
        let lock = cluster
            .coordinator
            .acquire("res", None, Duration::from_millis(500), NodeOp::Acquire)
            .await;

        // The slow node is cut off at the ttl, which leaves nothing of the window
        assert!(matches!(lock, Err(RedlockError::ValidityExpired { .. })));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_acquire_does_not_wait_for_cleanup() {
        let cluster = cluster(3, Duration::from_millis(100));
        cluster.nodes[1].conditional_set("res", "theirs", Duration::from_secs(60)).await.unwrap();
        cluster.nodes[2].set_latency(Duration::from_secs(60));

        let start = Instant::now();
        let result = cluster
            .coordinator
            .acquire("res", Some("mine"), Duration::from_secs(10), NodeOp::Acquire)
            .await;

        assert!(matches!(result, Err(RedlockError::QuorumNotReached { successes: 1, .. })));
        // Only the vote on the wedged node is waited for, not the cleanup after it
        assert!(start.elapsed() < Duration::from_millis(1500));

        wait_until(|| cluster.nodes[0].record("res").is_none()).await;
        assert_eq!(cluster.nodes[1].record("res").as_deref(), Some("theirs"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_release_returns_at_once() {
        let cluster = cluster(3, Duration::from_millis(100));
        let lock = cluster
            .coordinator
            .acquire("res", None, Duration::from_secs(30), NodeOp::Acquire)
            .await
            .unwrap();
        cluster.nodes[2].set_latency(Duration::from_secs(60));

        let start = Instant::now();
        let release = cluster.coordinator.spawn_release("res", &lock.value);
        assert_eq!(start.elapsed(), Duration::ZERO);

        release.await.unwrap();
        assert_eq!(cluster.nodes[0].record("res"), None);
        assert_eq!(cluster.nodes[1].record("res"), None);
    }

    #[tokio::test]
    async fn test_renew_extends_only_matching_token() {
        let cluster = cluster(3, Duration::from_millis(100));
        let lock = cluster
            .coordinator
            .acquire("res", None, Duration::from_millis(1000), NodeOp::Acquire)
            .await
            .unwrap();

        let renewed = cluster
            .coordinator
            .acquire("res", Some(&lock.value), Duration::from_secs(60), NodeOp::Renew)
            .await
            .unwrap();
        assert_eq!(renewed.value, lock.value);
        assert!(cluster.nodes[0].ttl_remaining("res").unwrap() > Duration::from_secs(30));

        let rejected = cluster
            .coordinator
            .acquire("res", Some("someone-else"), Duration::from_secs(60), NodeOp::Renew)
            .await;
        assert!(matches!(rejected, Err(RedlockError::QuorumNotReached { successes: 0, .. })));

        // A failed renewal leaves the holder's records in place
        for node in &cluster.nodes {
            assert_eq!(node.record("res"), Some(lock.value.clone()));
        }
    }

    #[tokio::test]
    async fn test_release_with_foreign_token_is_noop() {
        let cluster = cluster(3, Duration::from_millis(100));
        let lock = cluster
            .coordinator
            .acquire("res", None, Duration::from_secs(10), NodeOp::Acquire)
            .await
            .unwrap();

        cluster.coordinator.release("res", "not-the-token").await;
        cluster.coordinator.release("missing", "not-the-token").await;
        for node in &cluster.nodes {
            assert_eq!(node.record("res"), Some(lock.value.clone()));
        }

        cluster.coordinator.release("res", &lock.value).await;
        for node in &cluster.nodes {
            assert_eq!(node.record("res"), None);
        }
    }

    #[tokio::test]
    async fn test_rejects_invalid_arguments() {
        let cluster = cluster(1, Duration::from_millis(100));
        assert!(matches!(
            cluster.coordinator.acquire("", None, Duration::from_secs(1), NodeOp::Acquire).await,
            Err(RedlockError::InvalidOperation(_))
        ));
        assert!(matches!(
            cluster.coordinator.acquire("res", None, Duration::ZERO, NodeOp::Acquire).await,
            Err(RedlockError::InvalidOperation(_))
        ));
        assert_eq!(cluster.nodes[0].set_calls(), 0);
    }
}
