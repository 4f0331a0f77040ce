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
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::connection::NodeHandle;
use crate::errors::{RedlockError, RedlockResult};
use crate::get_server_id;

/// Key holding a node's queue identity
pub const SERVER_ID_KEY: &str = "redlock:server-id";
const QUEUE_KEY_PREFIX: &str = "redlock:queue:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueCommand {
    Unlock,
    Renew,
}

/// A release that could not reach its node when it was issued
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub command: QueueCommand,
    pub resource: String,
    pub value: String,
}

impl QueueEntry {
    pub fn encode(&self) -> RedlockResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> RedlockResult<Self> {
        serde_json::from_str(raw).map_err(|e| RedlockError::DeserializationError(e.to_string()))
    }
}

pub fn queue_key(identity: &str) -> String {
    format!("{}{}", QUEUE_KEY_PREFIX, identity)
}

/// Releases that failed against one node are written, keyed by that node's
/// identity, to every other reachable node. When the node comes back the
/// queues of all holders are replayed against it and the replayed items removed.
///
/// Delivery is at-least-once. Replaying a release whose record is gone or
/// belongs to another token is a no-op on the node.
pub struct UnlockQueue {
    nodes: Vec<Arc<NodeHandle>>,
    ttl: Duration,
    enabled: bool,
    debug: bool,
}

impl UnlockQueue {
    pub fn new(nodes: Vec<Arc<NodeHandle>>, ttl: Duration, enabled: bool, debug: bool) -> Self {
        Self {
            nodes,
            ttl,
            enabled,
            debug,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Negotiates the node's identity if it has none yet. Racing clients all
    /// end up with whichever candidate reached the node first.
    pub async fn ensure_identity(&self, node: &NodeHandle) -> RedlockResult<String> {
        if let Some(identity) = node.identity() {
            return Ok(identity);
        }

        let candidate = get_server_id();
        let negotiated = node
            .call(node.timeout(), node.node().get_or_set_identity(SERVER_ID_KEY, &candidate))
            .await
            .map_err(|e| match e {
                RedlockError::NodeUnreachable(_) => e,
                other => {
                    warn!("Could not set id for {}, unlocks not queued for it: {}", node.address(), other);
                    RedlockError::ServerIdentityConflict(node.address().to_string())
                }
            })?;

        let identity = node.adopt_identity(negotiated);
        if self.debug {
            debug!("Got server id {} for {}", identity, node.address());
        }
        Ok(identity)
    }

    /// Records `command` for `target` on every other reachable node.
    pub async fn enqueue(&self, target: &NodeHandle, command: QueueCommand, resource: &str, value: &str) {
        if !self.enabled {
            return;
        }

        let Some(identity) = target.identity() else {
            warn!("No server id for {}, dropping queued {:?} of {}", target.address(), command, resource);
            return;
        };

        let entry = QueueEntry {
            command,
            resource: resource.to_string(),
            value: value.to_string(),
        };
        let item = match entry.encode() {
            Ok(item) => item,
            Err(e) => {
                warn!("Could not encode queue entry for {}: {}", resource, e);
                return;
            }
        };

        let key = queue_key(&identity);
        let holders: Vec<&Arc<NodeHandle>> = self
            .nodes
            .iter()
            .filter(|node| node.index() != target.index() && node.is_reachable())
            .collect();

        if holders.is_empty() {
            warn!("No reachable server to hold queued {:?} of {} for {}", command, resource, target.address());
            return;
        }

        let results = join_all(holders.iter().map(|holder| {
            holder.call(holder.timeout(), holder.node().list_append(&key, &item, self.ttl))
        }))
        .await;

        let stored = results.iter().filter(|result| result.is_ok()).count();
        if self.debug {
            for (holder, result) in holders.iter().zip(&results) {
                if let Err(e) = result {
                    debug!("Could not add item to queue {} on {}: {}", key, holder.address(), e);
                }
            }
        }
        if stored == 0 {
            warn!("Queued {:?} of {} for {} was not stored anywhere", command, resource, target.address());
        } else if self.debug {
            debug!("Queued {:?} of {} for {} on {} servers", command, resource, target.address(), stored);
        }
    }

    /// Replays the recovery queue of `node`, returning how many entries were
    /// replayed. Entries stay queued if a replay cannot reach the node.
    ///
    /// Every holder is read, since an append may have reached only some of
    /// them. Afterwards each holder drops exactly the items read from it, so
    /// entries appended during the pass survive for the next one.
    pub async fn poll(&self, node: &NodeHandle) -> RedlockResult<usize> {
        let Some(_guard) = node.try_poll_guard() else {
            return Ok(0);
        };
        if !node.is_reachable() {
            return Ok(0);
        }

        let identity = self.ensure_identity(node).await?;
        let key = queue_key(&identity);

        let candidates: Vec<&Arc<NodeHandle>> = self.nodes.iter().filter(|n| n.is_reachable()).collect();
        let found = join_all(candidates.iter().map(|holder| {
            holder.call(holder.timeout(), holder.node().exists(&key))
        }))
        .await;
        let holders: Vec<&Arc<NodeHandle>> = candidates
            .into_iter()
            .zip(found)
            .filter(|(_, exists)| matches!(exists, Ok(true)))
            .map(|(holder, _)| holder)
            .collect();

        if holders.is_empty() {
            return Ok(0);
        }
        if self.debug {
            debug!("Got {} servers with unlock queue for {}", holders.len(), key);
        }

        let reads = join_all(holders.iter().map(|holder| self.read_queue(holder, &key))).await;

        let mut seen = HashSet::new();
        let mut pending = Vec::new();
        let mut read_from = Vec::with_capacity(holders.len());
        for (holder, read) in holders.iter().zip(reads) {
            match read {
                Ok(items) => {
                    pending.extend(items.iter().filter(|raw| seen.insert((*raw).clone())).cloned());
                    read_from.push((*holder, items));
                }
                Err(e) => {
                    if self.debug {
                        debug!("Could not read queue {} on {}: {}", key, holder.address(), e);
                    }
                }
            }
        }

        let mut replayed = 0;
        for raw in &pending {
            let entry = match QueueEntry::decode(raw) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Could not parse queued item from {}: {}", key, e);
                    continue;
                }
            };
            node.call(node.timeout(), node.node().compare_delete(&entry.resource, &entry.value))
                .await?;
            replayed += 1;
        }

        let removed = join_all(read_from.iter().map(|(holder, items)| {
            holder.call(holder.timeout(), holder.node().list_remove(&key, items))
        }))
        .await;
        for ((holder, _), result) in read_from.iter().zip(&removed) {
            if let Err(e) = result {
                if self.debug {
                    debug!("Could not clear queue {} on {}: {}", key, holder.address(), e);
                }
            }
        }

        if replayed > 0 {
            info!("Replayed {} queued releases on {}", replayed, node.address());
        }
        Ok(replayed)
    }

    async fn read_queue(&self, holder: &NodeHandle, key: &str) -> RedlockResult<Vec<String>> {
        let length = holder.call(holder.timeout(), holder.node().list_length(key)).await?;
        if length == 0 {
            return Ok(Vec::new());
        }
        holder.call(holder.timeout(), holder.node().list_range(key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;
    use crate::connection::{LockNode, MemoryNode};

    struct Fixture {
        nodes: Vec<Arc<MemoryNode>>,
        handles: Vec<Arc<NodeHandle>>,
        queue: UnlockQueue,
    }

    fn fixture(count: usize) -> Fixture {
        let nodes: Vec<Arc<MemoryNode>> = (0..count)
            .map(|i| Arc::new(MemoryNode::new(&format!("n{}", i))))
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
        let queue = UnlockQueue::new(handles.clone(), Duration::from_secs(3600), true, true);
        Fixture { nodes, handles, queue }
    }

    #[test]
    fn test_entry_encoding() {
        let entry = QueueEntry {
            command: QueueCommand::Unlock,
            resource: "res".to_string(),
            value: "token".to_string(),
        };
        let raw = entry.encode().unwrap();
        assert_eq!(raw, r#"{"command":"unlock","resource":"res","value":"token"}"#);
        assert_eq!(QueueEntry::decode(&raw).unwrap(), entry);
        assert!(matches!(QueueEntry::decode("{not json"), Err(RedlockError::DeserializationError(_))));
    }

    #[tokio::test]
    async fn test_identity_negotiation_is_shared() {
        let f = fixture(1);
        let identity = f.queue.ensure_identity(&f.handles[0]).await.unwrap();

        // A second client negotiating against the same node adopts the first identity
        let other = NodeHandle::new(0, f.nodes[0].clone() as Arc<dyn LockNode>, Duration::from_secs(1));
        let other_queue = UnlockQueue::new(Vec::new(), Duration::from_secs(60), true, false);
        assert_eq!(other_queue.ensure_identity(&other).await.unwrap(), identity);
    }

    #[tokio::test]
    async fn test_enqueue_replicates_to_reachable_nodes() {
        let f = fixture(3);
        let identity = f.queue.ensure_identity(&f.handles[2]).await.unwrap();
        f.handles[1].set_reachable(false);

        f.queue.enqueue(&f.handles[2], QueueCommand::Unlock, "res", "token").await;

        let key = queue_key(&identity);
        assert_eq!(f.nodes[0].list_items(&key).len(), 1);
        assert!(f.nodes[1].list_items(&key).is_empty());
        assert!(f.nodes[2].list_items(&key).is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_partial_failure_without_debug() {
        let f = fixture(3);
        let quiet = UnlockQueue::new(f.handles.clone(), Duration::from_secs(60), true, false);
        let identity = quiet.ensure_identity(&f.handles[2]).await.unwrap();
        // Tracked as reachable, but the append to it fails
        f.nodes[1].set_reachable(false);

        quiet.enqueue(&f.handles[2], QueueCommand::Unlock, "res", "token").await;

        let key = queue_key(&identity);
        assert_eq!(f.nodes[0].list_items(&key).len(), 1);
        assert!(f.nodes[1].list_items(&key).is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_without_identity_is_dropped() {
        let f = fixture(3);
        f.queue.enqueue(&f.handles[2], QueueCommand::Unlock, "res", "token").await;
        assert!(f.nodes[0].list_items(&queue_key("anything")).is_empty());
    }

    #[tokio::test]
    async fn test_poll_replays_and_clears() {
        let f = fixture(3);
        let identity = f.queue.ensure_identity(&f.handles[2]).await.unwrap();
        f.nodes[2].conditional_set("res", "token", Duration::from_secs(60)).await.unwrap();
        f.nodes[2].conditional_set("other", "theirs", Duration::from_secs(60)).await.unwrap();

        f.queue.enqueue(&f.handles[2], QueueCommand::Unlock, "res", "token").await;
        f.queue.enqueue(&f.handles[2], QueueCommand::Renew, "other", "mine").await;

        let replayed = f.queue.poll(&f.handles[2]).await.unwrap();
        assert_eq!(replayed, 2);
        assert_eq!(f.nodes[2].record("res"), None);
        // Foreign token is left alone
        assert_eq!(f.nodes[2].record("other").as_deref(), Some("theirs"));

        let key = queue_key(&identity);
        assert!(f.nodes[0].list_items(&key).is_empty());
        assert!(f.nodes[1].list_items(&key).is_empty());

        assert_eq!(f.queue.poll(&f.handles[2]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_poll_drops_malformed_entries() {
        let f = fixture(2);
        let identity = f.queue.ensure_identity(&f.handles[1]).await.unwrap();
        let key = queue_key(&identity);
        f.nodes[1].conditional_set("res", "token", Duration::from_secs(60)).await.unwrap();

        f.nodes[0].list_append(&key, "garbage", Duration::from_secs(60)).await.unwrap();
        f.queue.enqueue(&f.handles[1], QueueCommand::Unlock, "res", "token").await;

        assert_eq!(f.queue.poll(&f.handles[1]).await.unwrap(), 1);
        assert_eq!(f.nodes[1].record("res"), None);
        assert!(f.nodes[0].list_items(&key).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_append_during_poll_survives() {
        let f = fixture(3);
        let identity = f.queue.ensure_identity(&f.handles[2]).await.unwrap();
        let key = queue_key(&identity);
        f.nodes[2].conditional_set("a", "ta", Duration::from_secs(60)).await.unwrap();
        f.nodes[2].conditional_set("b", "tb", Duration::from_secs(60)).await.unwrap();
        f.queue.enqueue(&f.handles[2], QueueCommand::Unlock, "a", "ta").await;

        f.nodes[0].set_latency(Duration::from_millis(20));
        f.nodes[1].set_latency(Duration::from_millis(20));

        // exists at 20ms, length at 40ms, range at 60ms, removal at 80ms.
        // The second release lands on both holders at 65ms.
        let (replayed, _) = tokio::join!(f.queue.poll(&f.handles[2]), async {
            sleep(Duration::from_millis(45)).await;
            f.queue.enqueue(&f.handles[2], QueueCommand::Unlock, "b", "tb").await;
        });

        assert_eq!(replayed.unwrap(), 1);
        assert_eq!(f.nodes[2].record("a"), None);
        assert_eq!(f.nodes[2].record("b").as_deref(), Some("tb"));
        assert_eq!(f.nodes[0].list_items(&key).len(), 1);
        assert_eq!(f.nodes[1].list_items(&key).len(), 1);

        assert_eq!(f.queue.poll(&f.handles[2]).await.unwrap(), 1);
        assert_eq!(f.nodes[2].record("b"), None);
        assert!(f.nodes[0].list_items(&key).is_empty());
        assert!(f.nodes[1].list_items(&key).is_empty());
    }

    #[tokio::test]
    async fn test_poll_reads_every_holder() {
        let f = fixture(3);
        let identity = f.queue.ensure_identity(&f.handles[2]).await.unwrap();
        let key = queue_key(&identity);
        f.nodes[2].conditional_set("a", "ta", Duration::from_secs(60)).await.unwrap();
        f.nodes[2].conditional_set("b", "tb", Duration::from_secs(60)).await.unwrap();

        // Each release reached only one of the two holders
        let a = QueueEntry { command: QueueCommand::Unlock, resource: "a".to_string(), value: "ta".to_string() };
        let b = QueueEntry { command: QueueCommand::Unlock, resource: "b".to_string(), value: "tb".to_string() };
        f.nodes[0].list_append(&key, &a.encode().unwrap(), Duration::from_secs(60)).await.unwrap();
        f.nodes[1].list_append(&key, &b.encode().unwrap(), Duration::from_secs(60)).await.unwrap();

        assert_eq!(f.queue.poll(&f.handles[2]).await.unwrap(), 2);
        assert_eq!(f.nodes[2].record("a"), None);
        assert_eq!(f.nodes[2].record("b"), None);
        assert!(f.nodes[0].list_items(&key).is_empty());
        assert!(f.nodes[1].list_items(&key).is_empty());
    }

    #[tokio::test]
    async fn test_failed_replay_keeps_queue() {
        let f = fixture(2);
        let identity = f.queue.ensure_identity(&f.handles[1]).await.unwrap();
        f.queue.enqueue(&f.handles[1], QueueCommand::Unlock, "res", "token").await;

        // Tracked as reachable, but the node itself is down again
        f.nodes[1].set_reachable(false);
        assert!(f.queue.poll(&f.handles[1]).await.is_err());
        assert_eq!(f.nodes[0].list_items(&queue_key(&identity)).len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_queue_records_nothing() {
        let f = fixture(2);
        let identity = f.queue.ensure_identity(&f.handles[1]).await.unwrap();
        let disabled = UnlockQueue::new(f.handles.clone(), Duration::from_secs(60), false, false);

        disabled.enqueue(&f.handles[1], QueueCommand::Unlock, "res", "token").await;
        assert!(f.nodes[0].list_items(&queue_key(&identity)).is_empty());
    }
}
