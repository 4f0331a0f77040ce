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
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};

use crate::connection::LockNode;
use crate::errors::{RedlockError, RedlockResult};

enum StoredValue {
    Value(String),
    List(VecDeque<String>),
}

struct StoredEntry {
    data: StoredValue,
    expires_at: Option<Instant>,
}

impl StoredEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }
}

/// In-process lock node with key expiry, injectable latency and a
/// reachability switch. Data survives while the node is unreachable,
/// the way a partitioned Redis keeps its keys.
pub struct MemoryNode {
    address: String,
    entries: Mutex<HashMap<String, StoredEntry>>,
    latency: Mutex<Duration>,
    reachable: watch::Sender<bool>,
    set_calls: AtomicUsize,
}

impl MemoryNode {
    /// A reachable node
    pub fn new(address: &str) -> Self {
        Self::with_reachability(address, true)
    }

    /// A node that starts down
    pub fn unreachable(address: &str) -> Self {
        Self::with_reachability(address, false)
    }

    fn with_reachability(address: &str, reachable: bool) -> Self {
        let (tx, _) = watch::channel(reachable);
        Self {
            address: address.to_string(),
            entries: Mutex::new(HashMap::new()),
            latency: Mutex::new(Duration::ZERO),
            reachable: tx,
            set_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Publishes a ready (`true`) or end (`false`) event, even if nothing changed.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.send_modify(|current| *current = reachable);
    }

    pub fn is_up(&self) -> bool {
        *self.reachable.borrow()
    }

    /// Number of conditional set calls received, reachable or not.
    pub fn set_calls(&self) -> usize {
        self.set_calls.load(Ordering::SeqCst)
    }

    /// Stored string value, bypassing latency and reachability.
    pub fn record(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock();
        match Self::live(&mut entries, key) {
            Some(StoredEntry { data: StoredValue::Value(value), .. }) => Some(value.clone()),
            _ => None,
        }
    }

    /// Remaining time to live of a key, bypassing latency and reachability.
    pub fn ttl_remaining(&self, key: &str) -> Option<Duration> {
        let mut entries = self.entries.lock();
        Self::live(&mut entries, key)
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// List content, bypassing latency and reachability.
    pub fn list_items(&self, key: &str) -> Vec<String> {
        let mut entries = self.entries.lock();
        match Self::live(&mut entries, key) {
            Some(StoredEntry { data: StoredValue::List(items), .. }) => items.iter().cloned().collect(),
            _ => Vec::new(),
        }
    }

    fn live<'a>(entries: &'a mut HashMap<String, StoredEntry>, key: &str) -> Option<&'a mut StoredEntry> {
        let now = Instant::now();
        if entries.get(key).map(|entry| entry.is_expired(now)).unwrap_or(false) {
            entries.remove(key);
        }
        entries.get_mut(key)
    }

    async fn enter(&self) -> RedlockResult<()> {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            sleep(latency).await;
        }
        if self.is_up() {
            Ok(())
        } else {
            Err(RedlockError::NodeUnreachable(self.address.clone()))
        }
    }

    fn wrong_type(&self, key: &str) -> RedlockError {
        RedlockError::InvalidOperation(format!("{}: key {} holds the wrong kind of value", self.address, key))
    }
}

#[async_trait]
impl LockNode for MemoryNode {
    fn address(&self) -> &str {
        &self.address
    }

    async fn conditional_set(&self, key: &str, value: &str, ttl: Duration) -> RedlockResult<bool> {
        self.set_calls.fetch_add(1, Ordering::SeqCst);
        self.enter().await?;

        let mut entries = self.entries.lock();
        if Self::live(&mut entries, key).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            StoredEntry {
                data: StoredValue::Value(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn compare_delete(&self, key: &str, expected: &str) -> RedlockResult<bool> {
        self.enter().await?;

        let mut entries = self.entries.lock();
        let matches = matches!(
            Self::live(&mut entries, key),
            Some(StoredEntry { data: StoredValue::Value(value), .. }) if value == expected
        );
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }

    async fn compare_extend(&self, key: &str, expected: &str, ttl: Duration) -> RedlockResult<bool> {
        self.enter().await?;

        let mut entries = self.entries.lock();
        match Self::live(&mut entries, key) {
            Some(entry) => match &entry.data {
                StoredValue::Value(value) if value == expected => {
                    entry.expires_at = Some(Instant::now() + ttl);
                    Ok(true)
                }
                _ => Ok(false),
            },
            None => Ok(false),
        }
    }

    async fn get_or_set_identity(&self, key: &str, candidate: &str) -> RedlockResult<String> {
        self.enter().await?;

        let mut entries = self.entries.lock();
        if let Some(entry) = Self::live(&mut entries, key) {
            return match &entry.data {
                StoredValue::Value(value) => Ok(value.clone()),
                StoredValue::List(_) => Err(self.wrong_type(key)),
            };
        }
        entries.insert(
            key.to_string(),
            StoredEntry {
                data: StoredValue::Value(candidate.to_string()),
                expires_at: None,
            },
        );
        Ok(candidate.to_string())
    }

    async fn exists(&self, key: &str) -> RedlockResult<bool> {
        self.enter().await?;
        let mut entries = self.entries.lock();
        Ok(Self::live(&mut entries, key).is_some())
    }

    async fn get(&self, key: &str) -> RedlockResult<Option<String>> {
        self.enter().await?;
        let mut entries = self.entries.lock();
        match Self::live(&mut entries, key) {
            Some(StoredEntry { data: StoredValue::Value(value), .. }) => Ok(Some(value.clone())),
            Some(_) => Err(self.wrong_type(key)),
            None => Ok(None),
        }
    }

    async fn list_append(&self, key: &str, item: &str, ttl: Duration) -> RedlockResult<()> {
        self.enter().await?;

        let mut entries = self.entries.lock();
        let expires_at = Some(Instant::now() + ttl);
        match Self::live(&mut entries, key) {
            Some(entry) => match &mut entry.data {
                StoredValue::List(items) => {
                    items.push_back(item.to_string());
                    entry.expires_at = expires_at;
                    Ok(())
                }
                StoredValue::Value(_) => Err(self.wrong_type(key)),
            },
            None => {
                entries.insert(
                    key.to_string(),
                    StoredEntry {
                        data: StoredValue::List(VecDeque::from([item.to_string()])),
                        expires_at,
                    },
                );
                Ok(())
            }
        }
    }

    async fn list_range(&self, key: &str) -> RedlockResult<Vec<String>> {
        self.enter().await?;
        let mut entries = self.entries.lock();
        match Self::live(&mut entries, key) {
            Some(StoredEntry { data: StoredValue::List(items), .. }) => Ok(items.iter().cloned().collect()),
            Some(_) => Err(self.wrong_type(key)),
            None => Ok(Vec::new()),
        }
    }

    async fn list_length(&self, key: &str) -> RedlockResult<usize> {
        self.enter().await?;
        let mut entries = self.entries.lock();
        match Self::live(&mut entries, key) {
            Some(StoredEntry { data: StoredValue::List(items), .. }) => Ok(items.len()),
            Some(_) => Err(self.wrong_type(key)),
            None => Ok(0),
        }
    }

    async fn list_remove(&self, key: &str, items: &[String]) -> RedlockResult<()> {
        self.enter().await?;
        let mut entries = self.entries.lock();
        let emptied = match Self::live(&mut entries, key) {
            Some(StoredEntry { data: StoredValue::List(stored), .. }) => {
                for item in items {
                    if let Some(position) = stored.iter().position(|existing| existing == item) {
                        stored.remove(position);
                    }
                }
                stored.is_empty()
            }
            Some(_) => return Err(self.wrong_type(key)),
            None => false,
        };
        if emptied {
            entries.remove(key);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> RedlockResult<()> {
        self.enter().await?;
        self.entries.lock().remove(key);
        Ok(())
    }

    fn reachability(&self) -> watch::Receiver<bool> {
        self.reachable.subscribe()
    }

    async fn close(&self) {
        self.set_reachable(false);
    }
}
