// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Shared setup for peer integration tests: peers on one in-memory broker.

#![allow(dead_code)]

use parley::{MemoryBroker, Peer, PeerConfig, RequestContext};
use std::sync::Once;
use std::time::Duration;
use tracing_subscriber::FmtSubscriber;

static INIT: Once = Once::new();

pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = FmtSubscriber::builder()
            .with_env_filter("parley=debug")
            .with_test_writer()
            .try_init();
    });
}

pub fn test_config() -> PeerConfig {
    PeerConfig {
        default_timeout_ms: 2_000,
        command_workers: 4,
        session_workers: 4,
        ..Default::default()
    }
}

pub async fn start_peer(broker: &MemoryBroker) -> Peer {
    init_tracing();
    Peer::builder()
        .broker(broker.clone())
        .config(test_config())
        .build()
        .await
        .expect("peer should start")
}

/// Two peers sharing one broker.
pub async fn start_pair() -> (MemoryBroker, Peer, Peer) {
    let broker = MemoryBroker::new();
    let a = start_peer(&broker).await;
    let b = start_peer(&broker).await;
    (broker, a, b)
}

pub fn ctx() -> RequestContext {
    RequestContext::with_timeout(Duration::from_secs(5))
}

/// Poll `condition` until it holds, panicking after five seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
