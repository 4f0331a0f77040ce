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
use crate::connection::NodeHandle;

/// Aggregate reachability of the node set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedlockEvent {
    /// A quorum of nodes became reachable
    Connect,
    /// Reachable nodes dropped below the quorum
    Disconnect,
}

/// Reducer over per-node reachability transitions. Edge-triggered: an
/// event is produced only when the reachable count crosses the quorum.
#[derive(Debug)]
pub struct ConnectivityTracker {
    quorum: usize,
    reachable_count: usize,
    connected: bool,
}

impl ConnectivityTracker {
    pub fn new(quorum: usize) -> Self {
        Self {
            quorum,
            reachable_count: 0,
            connected: false,
        }
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    pub fn reachable_count(&self) -> usize {
        self.reachable_count
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn transition(&mut self, was_reachable: bool, reachable: bool) -> Option<RedlockEvent> {
        match (was_reachable, reachable) {
            (false, true) => {
                self.reachable_count += 1;
                if self.reachable_count == self.quorum {
                    self.connected = true;
                    return Some(RedlockEvent::Connect);
                }
                None
            }
            (true, false) => {
                self.reachable_count = self.reachable_count.saturating_sub(1);
                if self.reachable_count + 1 == self.quorum {
                    self.connected = false;
                    return Some(RedlockEvent::Disconnect);
                }
                None
            }
            _ => None,
        }
    }

    /// Applies a ready (`true`) or end (`false`) event of one node.
    /// Returns whether the node was reachable before, and the aggregate event if any.
    pub fn observe(&mut self, node: &NodeHandle, reachable: bool) -> (bool, Option<RedlockEvent>) {
        let was_reachable = node.set_reachable(reachable);
        (was_reachable, self.transition(was_reachable, reachable))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use crate::connection::MemoryNode;

    fn handles(count: usize) -> Vec<NodeHandle> {
        (0..count)
            .map(|i| NodeHandle::new(i, Arc::new(MemoryNode::new(&format!("n{}", i))), Duration::from_secs(1)))
            .collect()
    }

    #[test]
    fn test_three_nodes_edge_triggered() {
        let nodes = handles(3);
        let mut tracker = ConnectivityTracker::new(2);

        assert_eq!(tracker.observe(&nodes[0], true), (false, None));
        assert_eq!(tracker.observe(&nodes[1], true), (false, Some(RedlockEvent::Connect)));
        assert!(tracker.is_connected());

        // Third node and repeated ready events stay silent
        assert_eq!(tracker.observe(&nodes[2], true), (false, None));
        assert_eq!(tracker.observe(&nodes[0], true), (true, None));
        assert_eq!(tracker.reachable_count(), 3);

        assert_eq!(tracker.observe(&nodes[2], false), (true, None));
        assert_eq!(tracker.observe(&nodes[1], false), (true, Some(RedlockEvent::Disconnect)));
        assert!(!tracker.is_connected());

        // Already below quorum
        assert_eq!(tracker.observe(&nodes[0], false), (true, None));
        assert_eq!(tracker.observe(&nodes[0], false), (false, None));
        assert_eq!(tracker.reachable_count(), 0);
    }

    #[test]
    fn test_reconnect_emits_again() {
        let mut tracker = ConnectivityTracker::new(1);
        assert_eq!(tracker.transition(false, true), Some(RedlockEvent::Connect));
        assert_eq!(tracker.transition(true, false), Some(RedlockEvent::Disconnect));
        assert_eq!(tracker.transition(false, true), Some(RedlockEvent::Connect));
        assert_eq!(tracker.transition(true, true), None);
    }
}
