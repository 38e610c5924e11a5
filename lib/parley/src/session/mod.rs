// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Revisioned session attributes.
//!
//! Every session owns a catalog of namespaced attributes on the peer that
//! created it. Each effective change produces a new revision; writers must
//! name the revision they saw (compare-and-swap on [`Ref`]), so concurrent
//! writers never silently overwrite each other.
//!
//! A [`Revision`] is a read-only view of a session at one revision. Views of
//! local sessions read the owner's catalog directly; views of sessions owned
//! by other peers go through a per-session cache that only hits the network
//! when it cannot prove the answer locally.

mod attr;
mod error;
mod handle;
pub mod local;
pub mod remote;
mod revisions;

pub use attr::{Attr, AttrMeta, AttrTable, Diff, DiffEntry};
pub use error::SessionError;
pub use handle::Session;
pub use revisions::{Aggregator, ClosedRevision};

use async_trait::async_trait;
use parley_common::{Ref, RequestContext};
use std::sync::Arc;

/// Namespace of the remote session protocol.
pub const SESSION_NAMESPACE: &str = "_sess";

/// A session as seen at one revision. Views never change; operations that
/// write return a view of the resulting revision.
#[async_trait]
pub trait Revision: std::fmt::Debug + Send + Sync + 'static {
    fn reference(&self) -> Ref;

    /// A view of the latest revision of the same session.
    async fn refresh(&self, ctx: &RequestContext) -> Result<Arc<dyn Revision>, SessionError>;

    async fn get(&self, ctx: &RequestContext, ns: &str, key: &str) -> Result<Attr, SessionError>;

    async fn get_many(
        &self,
        ctx: &RequestContext,
        ns: &str,
        keys: &[&str],
    ) -> Result<AttrTable, SessionError>;

    async fn get_all(&self, ctx: &RequestContext, ns: &str) -> Result<AttrTable, SessionError>;

    async fn update(
        &self,
        ctx: &RequestContext,
        ns: &str,
        attrs: &[Attr],
    ) -> Result<Arc<dyn Revision>, SessionError>;

    async fn clear(&self, ctx: &RequestContext, ns: &str)
        -> Result<Arc<dyn Revision>, SessionError>;

    async fn destroy(&self, ctx: &RequestContext) -> Result<(), SessionError>;
}

/// Resolves session references to revision views.
pub trait RevisionStore: Send + Sync + 'static {
    fn get_revision(&self, reference: Ref) -> Result<Arc<dyn Revision>, SessionError>;
}
