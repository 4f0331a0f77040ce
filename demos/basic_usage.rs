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
use std::time::Duration;
use redlock::{Redlock, RedlockConfig, RedlockEvent, RedlockResult, ServerConfig};

#[tokio::main]
async fn main() -> RedlockResult<()> {
    // 1. Three independent Redis servers
    let config = RedlockConfig::new(vec![
        ServerConfig::new("127.0.0.1", 6379),
        ServerConfig::new("127.0.0.1", 6380),
        ServerConfig::new("127.0.0.1", 6381).with_timeout(Duration::from_millis(500)),
    ])
    .with_retry(5, Duration::from_millis(200))
    .with_debug(true);

    // 2. Connect and watch the aggregate connectivity
    let redlock = Redlock::connect(config).await?;
    let mut events = redlock.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                RedlockEvent::Connect => println!("Quorum reachable"),
                RedlockEvent::Disconnect => println!("Quorum lost"),
            }
        }
    });

    // 3. Acquire, extend and release
    let lock = redlock.lock("demo:resource", Duration::from_secs(10)).await?;
    println!("Locked {} for {:?}", lock.resource, lock.validity);

    // Execute protected code
    let lock = redlock.renew(&lock.resource, &lock.value, Duration::from_secs(20)).await?;
    println!("Renewed, valid for {:?}", lock.validity);

    // Dispatched in the background; await the handle to wait for every node
    redlock.unlock(&lock.resource, &lock.value).await?;

    for status in redlock.node_status() {
        println!("{} reachable={} id={:?}", status.address, status.reachable, status.identity);
    }

    redlock.close().await;
    Ok(())
}
