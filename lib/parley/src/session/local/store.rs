// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use super::Catalog;
use crate::session::{ClosedRevision, Revision, RevisionStore, SessionError};
use dashmap::DashMap;
use parley_common::{PeerId, Ref, SessionId};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;

/// Catalogs of the sessions this peer owns. A catalog leaves the store when
/// its session is closed.
pub struct Store {
    peer_id: PeerId,
    catalogs: Arc<DashMap<SessionId, Arc<Catalog>>>,
    next_seq: AtomicU32,
    runtime: Handle,
}

impl Store {
    pub fn new(peer_id: PeerId, runtime: Handle) -> Self {
        Self {
            peer_id,
            catalogs: Arc::new(DashMap::new()),
            // seq 0 is the peer's own identity
            next_seq: AtomicU32::new(1),
            runtime,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Runtime that session watchers are spawned on.
    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    /// Create the catalog of a new session.
    pub fn create(&self) -> Arc<Catalog> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let catalog = Catalog::new(self.peer_id.session(seq));
        self.catalogs.insert(catalog.id(), catalog.clone());

        let catalogs = Arc::downgrade(&self.catalogs);
        let watched = catalog.clone();
        self.runtime.spawn(async move {
            watched.closed().await;
            if let Some(catalogs) = catalogs.upgrade() {
                catalogs.remove(&watched.id());
            }
            tracing::debug!(target: "parley::session", session = %watched.id(), "session closed");
        });
        catalog
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<Catalog>> {
        self.catalogs.get(id).map(|c| c.value().clone())
    }

    pub fn len(&self) -> usize {
        self.catalogs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.catalogs.is_empty()
    }

    /// Close every session.
    pub fn close_all(&self) {
        let catalogs: Vec<Arc<Catalog>> =
            self.catalogs.iter().map(|c| c.value().clone()).collect();
        for catalog in catalogs {
            catalog.close();
            self.catalogs.remove(&catalog.id());
        }
    }
}

impl RevisionStore for Store {
    fn get_revision(&self, reference: Ref) -> Result<Arc<dyn Revision>, SessionError> {
        match self.get(&reference.id) {
            Some(catalog) => Ok(Arc::new(catalog.at(reference.rev)?)),
            None => Ok(Arc::new(ClosedRevision::new(reference))),
        }
    }
}
