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
use async_trait::async_trait;
use deadpool::managed::Metrics;
use deadpool::Runtime;
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{RedlockConfig, ServerConfig};
use crate::connection::LockNode;
use crate::errors::{RedlockError, RedlockResult};
use crate::{num_milliseconds, scripts};

type NodePool = deadpool::managed::Pool<NodeConnectionManager>;
type PooledConnection = deadpool::managed::Object<NodeConnectionManager>;

/// Creates and recycles multiplexed connections to a single node
pub struct NodeConnectionManager {
    client: Client,
}

#[async_trait]
impl deadpool::managed::Manager for NodeConnectionManager {
    type Type = MultiplexedConnection;
    type Error = RedisError;

    async fn create(&self) -> Result<Self::Type, Self::Error> {
        self.client.get_multiplexed_async_connection().await
    }

    async fn recycle(&self, conn: &mut Self::Type, _metrics: &Metrics) -> deadpool::managed::RecycleResult<Self::Error> {
        // Check that the connection is still valid
        match redis::cmd("PING").query_async::<String>(conn).await {
            Ok(pong) if pong == "PONG" => Ok(()),
            Ok(_) => Err(deadpool::managed::RecycleError::Message("Invalid PONG response".into())),
            Err(e) => Err(deadpool::managed::RecycleError::Backend(e)),
        }
    }
}

/// One Redis server taking part in the quorum
pub struct RedisNode {
    address: String,
    pool: NodePool,
    request_timeout: Duration,
    reachable: watch::Sender<bool>,
    probe: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl RedisNode {
    /// Builds the connection pool and starts the health probe. The node
    /// reports itself reachable after the first successful PING.
    pub async fn connect(server: &ServerConfig, config: &RedlockConfig) -> RedlockResult<Arc<Self>> {
        let client = Client::open(server.url().as_str())?;
        let request_timeout = server.timeout.unwrap_or(config.request_timeout);

        let pool = deadpool::managed::Pool::builder(NodeConnectionManager { client })
            .max_size(config.pool_size as usize)
            .timeouts(deadpool::managed::Timeouts {
                wait: Some(config.connection_timeout),
                create: Some(config.connection_timeout),
                recycle: Some(request_timeout),
            })
            .runtime(Runtime::Tokio1)
            .build()?;

        let (reachable, _) = watch::channel(false);
        let node = Arc::new(Self {
            address: server.address(),
            pool,
            request_timeout,
            reachable,
            probe: parking_lot::Mutex::new(None),
        });

        node.start_probe(config.health_check_interval);
        info!("Redis node {} registered", node.address);
        Ok(node)
    }

    fn start_probe(self: &Arc<Self>, period: Duration) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(node) = weak.upgrade() else { break };
                let healthy = node.health_check().await;
                node.publish(healthy);
            }
        });
        *self.probe.lock() = Some(handle);
    }

    pub async fn health_check(&self) -> bool {
        let ping = async {
            let mut conn = self.pool.get().await.map_err(RedlockError::from)?;
            let pong: String = redis::cmd("PING").query_async(&mut *conn).await?;
            Ok::<bool, RedlockError>(pong == "PONG")
        };
        match timeout(self.request_timeout, ping).await {
            Ok(Ok(healthy)) => healthy,
            Ok(Err(e)) => {
                debug!("Health check failed for {}: {}", self.address, e);
                false
            }
            Err(_) => false,
        }
    }

    fn publish(&self, healthy: bool) {
        let changed = self.reachable.send_if_modified(|current| {
            if *current != healthy {
                *current = healthy;
                true
            } else {
                false
            }
        });
        if changed {
            if healthy {
                info!("Redis node {} is ready", self.address);
            } else {
                warn!("Redis node {} connection ended", self.address);
            }
        }
    }

    async fn connection(&self) -> RedlockResult<PooledConnection> {
        match self.pool.get().await {
            Ok(conn) => Ok(conn),
            Err(e) => {
                self.publish(false);
                Err(RedlockError::NodeUnreachable(format!("{}: {}", self.address, e)))
            }
        }
    }

    /// Connection-level failures flip the node to unreachable right away
    /// instead of waiting for the next probe.
    fn observe<T>(&self, result: redis::RedisResult<T>) -> RedlockResult<T> {
        result.map_err(|e| {
            if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
                self.publish(false);
                RedlockError::NodeUnreachable(format!("{}: {}", self.address, e))
            } else {
                RedlockError::RedisError(e)
            }
        })
    }
}

#[async_trait]
impl LockNode for RedisNode {
    fn address(&self) -> &str {
        &self.address
    }

    async fn conditional_set(&self, key: &str, value: &str, ttl: Duration) -> RedlockResult<bool> {
        let mut conn = self.connection().await?;
        let reply: Option<String> = self.observe(
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .arg("PX")
                .arg(num_milliseconds(&ttl))
                .query_async(&mut *conn)
                .await,
        )?;
        Ok(reply.is_some())
    }

    async fn compare_delete(&self, key: &str, expected: &str) -> RedlockResult<bool> {
        let mut conn = self.connection().await?;
        let deleted: i64 = self.observe(
            scripts::UNLOCK_SCRIPT
                .key(key)
                .arg(expected)
                .invoke_async(&mut *conn)
                .await,
        )?;
        Ok(deleted > 0)
    }

    async fn compare_extend(&self, key: &str, expected: &str, ttl: Duration) -> RedlockResult<bool> {
        let mut conn = self.connection().await?;
        let extended: i64 = self.observe(
            scripts::RENEW_SCRIPT
                .key(key)
                .arg(expected)
                .arg(num_milliseconds(&ttl))
                .invoke_async(&mut *conn)
                .await,
        )?;
        Ok(extended > 0)
    }

    async fn get_or_set_identity(&self, key: &str, candidate: &str) -> RedlockResult<String> {
        let mut conn = self.connection().await?;
        let identity: Option<String> = self.observe(
            scripts::SERVER_ID_SCRIPT
                .key(key)
                .arg(candidate)
                .invoke_async(&mut *conn)
                .await,
        )?;
        identity.ok_or_else(|| RedlockError::ServerIdentityConflict(self.address.clone()))
    }

    async fn exists(&self, key: &str) -> RedlockResult<bool> {
        let mut conn = self.connection().await?;
        let count: i64 = self.observe(redis::cmd("EXISTS").arg(key).query_async(&mut *conn).await)?;
        Ok(count > 0)
    }

    async fn get(&self, key: &str) -> RedlockResult<Option<String>> {
        let mut conn = self.connection().await?;
        self.observe(redis::cmd("GET").arg(key).query_async(&mut *conn).await)
    }

    async fn list_append(&self, key: &str, item: &str, ttl: Duration) -> RedlockResult<()> {
        let mut conn = self.connection().await?;
        let _length: i64 = self.observe(
            scripts::ENQUEUE_SCRIPT
                .key(key)
                .arg(item)
                .arg(ttl.as_secs().max(1))
                .invoke_async(&mut *conn)
                .await,
        )?;
        Ok(())
    }

    async fn list_range(&self, key: &str) -> RedlockResult<Vec<String>> {
        let mut conn = self.connection().await?;
        self.observe(
            redis::cmd("LRANGE")
                .arg(key)
                .arg(0)
                .arg(-1)
                .query_async(&mut *conn)
                .await,
        )
    }

    async fn list_length(&self, key: &str) -> RedlockResult<usize> {
        let mut conn = self.connection().await?;
        self.observe(redis::cmd("LLEN").arg(key).query_async(&mut *conn).await)
    }

    async fn list_remove(&self, key: &str, items: &[String]) -> RedlockResult<()> {
        if items.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        for item in items {
            pipe.cmd("LREM").arg(key).arg(1).arg(item).ignore();
        }
        let mut conn = self.connection().await?;
        let _: () = self.observe(pipe.query_async(&mut *conn).await)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> RedlockResult<()> {
        let mut conn = self.connection().await?;
        let _deleted: i64 = self.observe(redis::cmd("DEL").arg(key).query_async(&mut *conn).await)?;
        Ok(())
    }

    fn reachability(&self) -> watch::Receiver<bool> {
        self.reachable.subscribe()
    }

    async fn close(&self) {
        if let Some(probe) = self.probe.lock().take() {
            probe.abort();
        }
        self.pool.close();
        self.publish(false);
    }
}

impl Drop for RedisNode {
    fn drop(&mut self) {
        if let Some(probe) = self.probe.lock().take() {
            probe.abort();
        }
    }
}
