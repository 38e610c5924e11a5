// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use super::catalog::{read_all_at, read_at, Catalog, Namespaces};
use crate::session::{Attr, AttrTable, Diff, Revision, SessionError};
use async_trait::async_trait;
use parley_common::{namespace, Ref, RequestContext};
use std::sync::Arc;
use tracing::debug;

/// A view of a locally owned session. Holds the attribute snapshot taken when
/// the view was created.
#[derive(Debug, Clone)]
pub struct LocalRevision {
    catalog: Arc<Catalog>,
    reference: Ref,
    snapshot: Arc<Namespaces>,
}

impl LocalRevision {
    pub(crate) fn new(catalog: Arc<Catalog>, reference: Ref, snapshot: Arc<Namespaces>) -> Self {
        Self {
            catalog,
            reference,
            snapshot,
        }
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.catalog.is_closed() {
            return Err(SessionError::NotFound(self.reference.id));
        }
        Ok(())
    }

    fn view(&self, reference: Ref) -> Result<Arc<dyn Revision>, SessionError> {
        Ok(Arc::new(self.catalog.at(reference.rev)?))
    }
}

#[async_trait]
impl Revision for LocalRevision {
    fn reference(&self) -> Ref {
        self.reference
    }

    async fn refresh(&self, _ctx: &RequestContext) -> Result<Arc<dyn Revision>, SessionError> {
        self.ensure_open()?;
        Ok(Arc::new(self.catalog.head()))
    }

    async fn get(&self, _ctx: &RequestContext, ns: &str, key: &str) -> Result<Attr, SessionError> {
        namespace::validate(ns)?;
        self.ensure_open()?;
        read_at(&self.snapshot, self.reference, ns, key)
    }

    async fn get_many(
        &self,
        _ctx: &RequestContext,
        ns: &str,
        keys: &[&str],
    ) -> Result<AttrTable, SessionError> {
        namespace::validate(ns)?;
        self.ensure_open()?;
        keys.iter()
            .map(|key| read_at(&self.snapshot, self.reference, ns, key))
            .collect()
    }

    async fn get_all(&self, _ctx: &RequestContext, ns: &str) -> Result<AttrTable, SessionError> {
        namespace::validate(ns)?;
        self.ensure_open()?;
        read_all_at(&self.snapshot, self.reference, ns)
    }

    async fn update(
        &self,
        _ctx: &RequestContext,
        ns: &str,
        attrs: &[Attr],
    ) -> Result<Arc<dyn Revision>, SessionError> {
        namespace::validate(ns)?;
        let mut diff = Diff::new();
        let reference = self
            .catalog
            .try_update(self.reference, ns, attrs, Some(&mut diff))?;
        if !diff.is_empty() {
            debug!(target: "parley::session", %reference, %diff, "update");
        }
        self.view(reference)
    }

    async fn clear(
        &self,
        _ctx: &RequestContext,
        ns: &str,
    ) -> Result<Arc<dyn Revision>, SessionError> {
        namespace::validate(ns)?;
        let mut diff = Diff::new();
        let reference = self
            .catalog
            .try_clear(self.reference, ns, Some(&mut diff))?;
        if !diff.is_empty() {
            debug!(target: "parley::session", %reference, %diff, "clear");
        }
        self.view(reference)
    }

    async fn destroy(&self, _ctx: &RequestContext) -> Result<(), SessionError> {
        self.catalog.try_destroy(self.reference)
    }
}
