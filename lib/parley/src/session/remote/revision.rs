// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use super::Catalog;
use crate::session::{Attr, AttrTable, Revision, SessionError};
use async_trait::async_trait;
use parley_common::{namespace, Ref, RequestContext};
use std::sync::Arc;

/// A view of a session owned by another peer.
#[derive(Debug, Clone)]
pub struct RemoteRevision {
    catalog: Arc<Catalog>,
    reference: Ref,
}

impl RemoteRevision {
    pub fn new(catalog: Arc<Catalog>, reference: Ref) -> Self {
        Self { catalog, reference }
    }

    fn view(&self, reference: Ref) -> Arc<dyn Revision> {
        Arc::new(Self::new(self.catalog.clone(), reference))
    }
}

#[async_trait]
impl Revision for RemoteRevision {
    fn reference(&self) -> Ref {
        self.reference
    }

    async fn refresh(&self, ctx: &RequestContext) -> Result<Arc<dyn Revision>, SessionError> {
        let head = self.catalog.head(ctx).await?;
        Ok(self.view(head))
    }

    async fn get(&self, ctx: &RequestContext, ns: &str, key: &str) -> Result<Attr, SessionError> {
        namespace::validate(ns)?;
        let attrs = self
            .catalog
            .fetch(ctx, self.reference.rev, ns, &[key])
            .await?;
        Ok(attrs.get(key))
    }

    async fn get_many(
        &self,
        ctx: &RequestContext,
        ns: &str,
        keys: &[&str],
    ) -> Result<AttrTable, SessionError> {
        namespace::validate(ns)?;
        self.catalog.fetch(ctx, self.reference.rev, ns, keys).await
    }

    async fn get_all(&self, ctx: &RequestContext, ns: &str) -> Result<AttrTable, SessionError> {
        namespace::validate(ns)?;
        self.catalog.fetch_all(ctx, self.reference.rev, ns).await
    }

    async fn update(
        &self,
        ctx: &RequestContext,
        ns: &str,
        attrs: &[Attr],
    ) -> Result<Arc<dyn Revision>, SessionError> {
        let reference = self
            .catalog
            .try_update(ctx, self.reference.rev, ns, attrs)
            .await?;
        Ok(self.view(reference))
    }

    async fn clear(
        &self,
        ctx: &RequestContext,
        ns: &str,
    ) -> Result<Arc<dyn Revision>, SessionError> {
        let reference = self.catalog.try_clear(ctx, self.reference.rev, ns).await?;
        Ok(self.view(reference))
    }

    async fn destroy(&self, ctx: &RequestContext) -> Result<(), SessionError> {
        self.catalog.try_destroy(ctx, self.reference.rev).await
    }
}
