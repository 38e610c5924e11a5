// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use super::{Attr, AttrTable, Revision, RevisionStore, SessionError};
use async_trait::async_trait;
use parley_common::{PeerId, Ref, RequestContext};
use std::sync::Arc;

/// A revision of a session that no longer exists, or that this peer cannot
/// reach. Every operation fails with [`SessionError::NotFound`].
#[derive(Debug, Clone, Copy)]
pub struct ClosedRevision {
    reference: Ref,
}

impl ClosedRevision {
    pub fn new(reference: Ref) -> Self {
        Self { reference }
    }

    fn not_found(&self) -> SessionError {
        SessionError::NotFound(self.reference.id)
    }
}

#[async_trait]
impl Revision for ClosedRevision {
    fn reference(&self) -> Ref {
        self.reference
    }

    async fn refresh(&self, _ctx: &RequestContext) -> Result<Arc<dyn Revision>, SessionError> {
        Err(self.not_found())
    }

    async fn get(&self, _ctx: &RequestContext, _ns: &str, _key: &str) -> Result<Attr, SessionError> {
        Err(self.not_found())
    }

    async fn get_many(
        &self,
        _ctx: &RequestContext,
        _ns: &str,
        _keys: &[&str],
    ) -> Result<AttrTable, SessionError> {
        Err(self.not_found())
    }

    async fn get_all(&self, _ctx: &RequestContext, _ns: &str) -> Result<AttrTable, SessionError> {
        Err(self.not_found())
    }

    async fn update(
        &self,
        _ctx: &RequestContext,
        _ns: &str,
        _attrs: &[Attr],
    ) -> Result<Arc<dyn Revision>, SessionError> {
        Err(self.not_found())
    }

    async fn clear(
        &self,
        _ctx: &RequestContext,
        _ns: &str,
    ) -> Result<Arc<dyn Revision>, SessionError> {
        Err(self.not_found())
    }

    async fn destroy(&self, _ctx: &RequestContext) -> Result<(), SessionError> {
        Err(self.not_found())
    }
}

/// Routes a reference to the store responsible for its owning peer: local
/// sessions to the local store, everything else to the remote store.
pub struct Aggregator {
    peer_id: PeerId,
    local: Option<Arc<dyn RevisionStore>>,
    remote: Option<Arc<dyn RevisionStore>>,
}

impl Aggregator {
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            local: None,
            remote: None,
        }
    }

    pub fn with_local(mut self, store: Arc<dyn RevisionStore>) -> Self {
        self.local = Some(store);
        self
    }

    pub fn with_remote(mut self, store: Arc<dyn RevisionStore>) -> Self {
        self.remote = Some(store);
        self
    }
}

impl RevisionStore for Aggregator {
    fn get_revision(&self, reference: Ref) -> Result<Arc<dyn Revision>, SessionError> {
        let store = if reference.id.peer == self.peer_id {
            self.local.as_ref()
        } else {
            self.remote.as_ref()
        };
        match store {
            Some(store) => store.get_revision(reference),
            None => Ok(Arc::new(ClosedRevision::new(reference))),
        }
    }
}
