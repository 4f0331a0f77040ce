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
use std::sync::{Arc, Weak};
use std::time::Duration;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::RedlockConfig;
use crate::connection::{LockNode, NodeHandle, NodeStatus, RedisNode};
use crate::connectivity::{ConnectivityTracker, RedlockEvent};
use crate::errors::{RedlockError, RedlockResult};
use crate::lock::{Lock, NodeOp, QuorumCoordinator, RetryPolicy, RetryScheduler};
use crate::queue::UnlockQueue;

const EVENT_CAPACITY: usize = 16;

/// Distributed lock over a set of independent nodes.
///
/// Cloning is cheap and every clone drives the same nodes. Background tasks
/// stop when the last clone is dropped or `close` is called.
#[derive(Clone)]
pub struct Redlock {
    inner: Arc<RedlockInner>,
}

struct RedlockInner {
    config: RedlockConfig,
    nodes: Vec<Arc<NodeHandle>>,
    coordinator: QuorumCoordinator,
    retry: RetryScheduler,
    queue: Arc<UnlockQueue>,
    tracker: Mutex<ConnectivityTracker>,
    events: broadcast::Sender<RedlockEvent>,
    runtime: Handle,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Redlock {
    /// Connects to every configured Redis server.
    pub async fn connect(config: RedlockConfig) -> RedlockResult<Self> {
        config.validate()?;

        let mut nodes: Vec<Arc<dyn LockNode>> = Vec::with_capacity(config.servers.len());
        for server in &config.servers {
            let node = RedisNode::connect(server, &config).await?;
            nodes.push(node);
        }

        Self::with_nodes(nodes, config)
    }

    /// Builds an instance over already constructed nodes. `config.servers`
    /// only contributes per-node timeouts here.
    pub fn with_nodes(nodes: Vec<Arc<dyn LockNode>>, config: RedlockConfig) -> RedlockResult<Self> {
        if nodes.is_empty() {
            return Err(RedlockError::NoServerError);
        }
        let runtime = Handle::try_current()
            .map_err(|e| RedlockError::AsyncError(format!("Redlock needs a tokio runtime: {}", e)))?;

        let handles: Vec<Arc<NodeHandle>> = nodes
            .into_iter()
            .enumerate()
            .map(|(index, node)| {
                let timeout = config
                    .servers
                    .get(index)
                    .and_then(|server| server.timeout)
                    .unwrap_or(config.request_timeout);
                Arc::new(NodeHandle::new(index, node, timeout))
            })
            .collect();

        let queue = Arc::new(UnlockQueue::new(
            handles.clone(),
            config.queue_ttl,
            !config.disable_unlock_queue,
            config.debug,
        ));
        let coordinator = QuorumCoordinator::new(
            handles.clone(),
            config.drift,
            config.caller_id(),
            queue.clone(),
            runtime.clone(),
            config.debug,
        );
        let retry = RetryScheduler::new(
            RetryPolicy {
                max_retries: config.retry_count,
                retry_wait: config.retry_delay,
            },
            config.debug,
        );
        let tracker = ConnectivityTracker::new(coordinator.quorum());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let inner = Arc::new(RedlockInner {
            config,
            nodes: handles,
            coordinator,
            retry,
            queue,
            tracker: Mutex::new(tracker),
            events,
            runtime,
            tasks: Mutex::new(Vec::new()),
        });

        let mut tasks = Vec::with_capacity(inner.nodes.len() * 2);
        for handle in &inner.nodes {
            let mut reachability = handle.node().reachability();
            let reachable = *reachability.borrow_and_update();
            inner.apply(handle.index(), reachable);

            tasks.push(inner.runtime.spawn(watch_reachability(
                Arc::downgrade(&inner),
                handle.index(),
                reachability,
            )));
            tasks.push(inner.runtime.spawn(poll_periodically(
                inner.queue.clone(),
                handle.clone(),
                inner.config.queue_poll_interval,
                inner.config.debug,
            )));
        }
        inner.tasks.lock().extend(tasks);

        Ok(Self { inner })
    }

    /// Acquires `resource` for `ttl`, retrying with random backoff.
    pub async fn lock(&self, resource: &str, ttl: Duration) -> RedlockResult<Lock> {
        self.inner.retry.lock(&self.inner.coordinator, resource, ttl).await
    }

    /// Extends a held lock to a fresh `ttl`. A single pass, never retried.
    pub async fn renew(&self, resource: &str, value: &str, ttl: Duration) -> RedlockResult<Lock> {
        self.inner
            .coordinator
            .acquire(resource, Some(value), ttl, NodeOp::Renew)
            .await
    }

    /// Releases the lock on every node holding `value`. Nodes that cannot be
    /// reached get the release queued and replayed once they are back.
    ///
    /// Returns as soon as the release is dispatched. The handle resolves once
    /// every node answered or timed out and failures were queued.
    pub fn unlock(&self, resource: &str, value: &str) -> JoinHandle<()> {
        self.inner.coordinator.spawn_release(resource, value)
    }

    pub fn set_retry(&self, max_retries: u32, retry_wait: Duration) {
        self.inner.retry.set_retry(max_retries, retry_wait);
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.inner.retry.policy()
    }

    /// Connect and disconnect events, emitted as the reachable node count
    /// crosses the quorum.
    pub fn subscribe(&self) -> broadcast::Receiver<RedlockEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.tracker.lock().is_connected()
    }

    pub fn quorum(&self) -> usize {
        self.inner.coordinator.quorum()
    }

    pub fn node_status(&self) -> Vec<NodeStatus> {
        self.inner.nodes.iter().map(|handle| handle.status()).collect()
    }

    pub fn config(&self) -> &RedlockConfig {
        &self.inner.config
    }

    /// Drains the recovery queue of every reachable node now instead of
    /// waiting for the next periodic poll. Returns the replayed entry count.
    pub async fn poll_queues(&self) -> usize {
        let mut replayed = 0;
        for handle in self.inner.nodes.iter().filter(|handle| handle.is_reachable()) {
            match self.inner.queue.poll(handle).await {
                Ok(count) => replayed += count,
                Err(e) => {
                    if self.inner.config.debug {
                        debug!("Queue poll for {} failed: {}", handle.address(), e);
                    }
                }
            }
        }
        replayed
    }

    /// Stops the background tasks and closes every node.
    pub async fn close(&self) {
        self.inner.abort_tasks();
        for handle in &self.inner.nodes {
            handle.node().close().await;
        }
        info!("Redlock closed {} nodes", self.inner.nodes.len());
    }
}

impl RedlockInner {
    fn apply(&self, index: usize, reachable: bool) {
        let Some(handle) = self.nodes.get(index) else {
            return;
        };

        let (was_reachable, event) = self.tracker.lock().observe(handle, reachable);
        if was_reachable != reachable && self.config.debug {
            debug!("Server {} reachable: {}", handle.address(), reachable);
        }
        if let Some(event) = event {
            info!("Redlock {:?}", event);
            // No subscribers is fine
            let _ = self.events.send(event);
        }

        if !was_reachable && reachable {
            let queue = self.queue.clone();
            let handle = handle.clone();
            let debug = self.config.debug;
            self.runtime.spawn(async move {
                match queue.poll(&handle).await {
                    Ok(0) => {}
                    Ok(count) => {
                        if debug {
                            debug!("Recovered {} queued releases for {}", count, handle.address());
                        }
                    }
                    Err(e) => warn!("Queue poll for {} failed after reconnect: {}", handle.address(), e),
                }
            });
        }
    }

    fn abort_tasks(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for RedlockInner {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

async fn watch_reachability(inner: Weak<RedlockInner>, index: usize, mut reachability: watch::Receiver<bool>) {
    while reachability.changed().await.is_ok() {
        let reachable = *reachability.borrow_and_update();
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.apply(index, reachable);
    }
}

async fn poll_periodically(queue: Arc<UnlockQueue>, node: Arc<NodeHandle>, period: Duration, debug: bool) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if !node.is_reachable() {
            continue;
        }
        if let Err(e) = queue.poll(&node).await {
            if debug {
                debug!("Queue poll for {} failed: {}", node.address(), e);
            }
        }
    }
}
