// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-peer table of foreign session caches.
//!
//! Unused caches are evicted by a two-generation sweep: each tick marks every
//! catalog, and a catalog that is still marked at the next tick has not been
//! used for a whole interval and is dropped.

use super::{Catalog, Client, RemoteRevision};
use crate::session::{Revision, RevisionStore, SessionError};
use async_trait::async_trait;
use dashmap::DashMap;
use parley_common::{Ref, SessionId};
use parley_runtime::service::{self, Machine, ServiceHandle, Signals};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

const TARGET: &str = "parley::session";

type Catalogs = Arc<DashMap<SessionId, Arc<Catalog>>>;

pub struct Store {
    client: Arc<Client>,
    catalogs: Catalogs,
    handle: ServiceHandle,
}

impl Store {
    /// Start the store and its prune timer.
    pub fn start(client: Arc<Client>, prune_interval: Duration) -> Arc<Self> {
        let catalogs: Catalogs = Arc::new(DashMap::new());
        let pruner = Pruner {
            catalogs: catalogs.clone(),
            interval: prune_interval,
        };
        let handle = service::spawn(
            "remote-store",
            Signals::new(),
            pruner,
            PrunerState::Running,
        );
        Arc::new(Self {
            client,
            catalogs,
            handle,
        })
    }

    pub fn handle(&self) -> &ServiceHandle {
        &self.handle
    }

    /// The cache of session `id`, created on first use.
    pub fn catalog(&self, id: SessionId) -> Arc<Catalog> {
        let catalog = self
            .catalogs
            .entry(id)
            .or_insert_with(|| Arc::new(Catalog::new(id, self.client.clone())))
            .clone();
        catalog.touch();
        catalog
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.catalogs.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.catalogs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.catalogs.is_empty()
    }

    /// Run one sweep now. Returns the number of evicted caches.
    pub fn prune(&self) -> usize {
        sweep(&self.catalogs)
    }
}

impl RevisionStore for Store {
    fn get_revision(&self, reference: Ref) -> Result<Arc<dyn Revision>, SessionError> {
        Ok(Arc::new(RemoteRevision::new(
            self.catalog(reference.id),
            reference,
        )))
    }
}

fn sweep(catalogs: &DashMap<SessionId, Arc<Catalog>>) -> usize {
    let before = catalogs.len();
    catalogs.retain(|_, catalog| !catalog.mark());
    let evicted = before.saturating_sub(catalogs.len());
    if evicted > 0 {
        debug!(target: TARGET, evicted, remaining = catalogs.len(), "pruned session caches");
    }
    evicted
}

#[derive(Debug)]
enum PrunerState {
    Running,
}

struct Pruner {
    catalogs: Catalogs,
    interval: Duration,
}

#[async_trait]
impl Machine for Pruner {
    type State = PrunerState;

    async fn run_state(
        &mut self,
        state: PrunerState,
        signals: &Signals,
    ) -> anyhow::Result<Option<PrunerState>> {
        match state {
            PrunerState::Running => {
                let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        biased;
                        _ = signals.graceful() => return Ok(None),
                        _ = ticker.tick() => {
                            sweep(&self.catalogs);
                        }
                    }
                }
            }
        }
    }

    async fn finalize(&mut self, result: anyhow::Result<()>) -> anyhow::Result<()> {
        self.catalogs.clear();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, ChannelManager, ChannelPool, MemoryBroker};
    use crate::command::Invoker;
    use parley_common::PeerId;

    fn store(interval: Duration) -> Arc<Store> {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let pool = ChannelPool::new(ChannelManager::new(broker.clone()), 2);
        let invoker =
            Invoker::start(PeerId::new(1, 1), &broker, pool, Duration::from_secs(1)).unwrap();
        Store::start(Arc::new(Client::new(invoker)), interval)
    }

    #[tokio::test]
    async fn test_untouched_cache_evicted_after_two_sweeps() {
        let store = store(Duration::from_secs(3600));
        let a = PeerId::new(2, 2).session(1);
        let b = PeerId::new(2, 2).session(2);
        store.get_revision(a.at(0)).unwrap();
        store.get_revision(b.at(0)).unwrap();

        assert_eq!(store.prune(), 0);
        // touched between sweeps
        store.catalog(b);
        assert_eq!(store.prune(), 1);
        assert!(!store.contains(&a));
        assert!(store.contains(&b));

        assert_eq!(store.prune(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_prunes() {
        let store = store(Duration::from_secs(10));
        store.catalog(PeerId::new(2, 2).session(1));

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(store.len(), 1);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(store.len(), 0);

        store.handle().graceful_stop();
        store.handle().wait().await.unwrap();
    }
}
