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
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::{RedlockError, RedlockResult};

/// One independent Redis node taking part in the quorum
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Per-node request timeout, overrides `RedlockConfig::request_timeout`
    pub timeout: Option<Duration>,
    pub password: Option<String>,
    pub database: Option<i64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            timeout: None,
            password: None,
            database: None,
        }
    }
}

impl ServerConfig {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_password(mut self, password: &str) -> Self {
        self.password = Some(password.to_string());
        self
    }

    pub fn with_database(mut self, db: i64) -> Self {
        self.database = Some(db);
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn url(&self) -> String {
        let auth = match &self.password {
            Some(password) => format!(":{}@", password),
            None => String::new(),
        };
        match self.database {
            Some(db) => format!("redis://{}{}:{}/{}", auth, self.host, self.port, db),
            None => format!("redis://{}{}:{}", auth, self.host, self.port),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedlockConfig {
    /// Nodes taking part in the quorum
    pub servers: Vec<ServerConfig>,
    /// Caller identity used as the lock token prefix, defaults to the host name
    pub id: Option<String>,
    /// Clock drift budget subtracted from every validity window
    pub drift: Duration,
    /// Do not record releases that failed to reach a node
    pub disable_unlock_queue: bool,
    /// How long a queued release survives on a node
    pub queue_ttl: Duration,
    /// Verbose per-attempt diagnostics
    pub debug: bool,
    /// Lock acquisition retries after the first attempt
    pub retry_count: u32,
    /// Upper bound of the random backoff between attempts
    pub retry_delay: Duration,
    /// Default per-node request timeout
    pub request_timeout: Duration,
    /// Period of the recovery queue poll for each reachable node
    pub queue_poll_interval: Duration,
    /// Period of the node health probe
    pub health_check_interval: Duration,
    /// Connection pool size per node
    pub pool_size: u32,
    /// Connection timeout time
    pub connection_timeout: Duration,
}

impl Default for RedlockConfig {
    fn default() -> Self {
        Self {
            servers: vec![ServerConfig::default()],
            id: None,
            drift: Duration::from_millis(100),
            disable_unlock_queue: false,
            queue_ttl: Duration::from_secs(3600),
            debug: false,
            retry_count: 3,
            retry_delay: Duration::from_millis(100),
            request_timeout: Duration::from_secs(1),
            queue_poll_interval: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(1),
            pool_size: 4,
            connection_timeout: Duration::from_secs(3),
        }
    }
}

impl RedlockConfig {
    pub fn new(servers: Vec<ServerConfig>) -> Self {
        Self {
            servers,
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn with_drift(mut self, drift: Duration) -> Self {
        self.drift = drift;
        self
    }

    pub fn with_unlock_queue(mut self, enabled: bool) -> Self {
        self.disable_unlock_queue = !enabled;
        self
    }

    pub fn with_queue_ttl(mut self, ttl: Duration) -> Self {
        self.queue_ttl = ttl;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_retry(mut self, count: u32, delay: Duration) -> Self {
        self.retry_count = count;
        self.retry_delay = delay;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_queue_poll_interval(mut self, interval: Duration) -> Self {
        self.queue_poll_interval = interval;
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn with_pool_size(mut self, size: u32) -> Self {
        self.pool_size = size;
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// The caller identity, falling back to the host name.
    pub fn caller_id(&self) -> String {
        match &self.id {
            Some(id) => id.clone(),
            None => hostname::get()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "redlock".to_string()),
        }
    }

    pub fn validate(&self) -> RedlockResult<()> {
        if self.servers.is_empty() {
            return Err(RedlockError::NoServerError);
        }
        if self.pool_size == 0 {
            return Err(RedlockError::ConfigError("Pool size cannot be zero".to_string()));
        }
        if self.request_timeout.is_zero() {
            return Err(RedlockError::ConfigError("Request timeout cannot be zero".to_string()));
        }
        if self.queue_poll_interval.is_zero() || self.health_check_interval.is_zero() {
            return Err(RedlockError::ConfigError("Poll intervals cannot be zero".to_string()));
        }
        for server in &self.servers {
            if server.host.is_empty() {
                return Err(RedlockError::ConfigError("Server host cannot be empty".to_string()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RedlockConfig::default();
        assert_eq!(config.drift, Duration::from_millis(100));
        assert_eq!(config.queue_ttl, Duration::from_secs(3600));
        assert_eq!(config.retry_count, 3);
        assert_eq!(config.retry_delay, Duration::from_millis(100));
        assert!(!config.disable_unlock_queue);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_servers() {
        let config = RedlockConfig::new(Vec::new());
        assert!(matches!(config.validate(), Err(RedlockError::NoServerError)));

        let config = RedlockConfig::default().with_pool_size(0);
        assert!(matches!(config.validate(), Err(RedlockError::ConfigError(_))));
    }

    #[test]
    fn test_server_url() {
        let server = ServerConfig::new("10.0.0.1", 6380);
        assert_eq!(server.url(), "redis://10.0.0.1:6380");
        assert_eq!(server.address(), "10.0.0.1:6380");

        let server = server.with_password("secret").with_database(2);
        assert_eq!(server.url(), "redis://:secret@10.0.0.1:6380/2");
    }

    #[test]
    fn test_caller_id() {
        let config = RedlockConfig::default().with_id("worker-7");
        assert_eq!(config.caller_id(), "worker-7");
        assert!(!RedlockConfig::default().caller_id().is_empty());
    }
}
