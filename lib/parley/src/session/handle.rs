// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use super::{local, Revision, SessionError};
use crate::command::{AsyncHandler, Invoker};
use crate::notify::{Constraint, Listener, NotificationHandler, Notifier};
use parley_common::{MessageId, Payload, RequestContext, SessionId};
use std::sync::Arc;

/// A session owned by this peer.
///
/// Every message a session sends is identified by the session's current
/// revision, so receivers always see the sender as of the moment it sent.
#[derive(Clone)]
pub struct Session {
    catalog: Arc<local::Catalog>,
    invoker: Arc<Invoker>,
    notifier: Arc<Notifier>,
    listener: Arc<Listener>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Session").field(&self.catalog.reference()).finish()
    }
}

impl Session {
    pub(crate) fn new(
        catalog: Arc<local::Catalog>,
        invoker: Arc<Invoker>,
        notifier: Arc<Notifier>,
        listener: Arc<Listener>,
    ) -> Self {
        Self {
            catalog,
            invoker,
            notifier,
            listener,
        }
    }

    pub fn id(&self) -> SessionId {
        self.catalog.id()
    }

    pub fn current_revision(&self) -> Arc<dyn Revision> {
        Arc::new(self.catalog.head())
    }

    /// Call `command` on any peer listening on `ns` and wait for the answer.
    pub async fn call(
        &self,
        ctx: &RequestContext,
        ns: &str,
        command: &str,
        payload: Payload,
    ) -> Result<Payload, SessionError> {
        let id = self.catalog.next_message_id()?;
        Ok(self
            .invoker
            .call_balanced(ctx, id, ns, command, payload)
            .await?)
    }

    /// Send `command` to any peer listening on `ns`. The answer goes to the
    /// handler installed with [`set_async_handler`](Self::set_async_handler).
    pub fn call_async(
        &self,
        ctx: &RequestContext,
        ns: &str,
        command: &str,
        payload: Payload,
    ) -> Result<MessageId, SessionError> {
        let id = self.catalog.next_message_id()?;
        self.invoker
            .call_balanced_async(ctx, id, ns, command, payload)?;
        Ok(id)
    }

    pub fn set_async_handler(
        &self,
        handler: Option<Arc<dyn AsyncHandler>>,
    ) -> Result<(), SessionError> {
        if self.catalog.is_closed() {
            return Err(SessionError::NotFound(self.id()));
        }
        Ok(self.invoker.set_async_handler(self.id(), handler)?)
    }

    /// Send `command` to any peer listening on `ns` without waiting for an
    /// answer.
    pub fn execute(
        &self,
        ctx: &RequestContext,
        ns: &str,
        command: &str,
        payload: Payload,
    ) -> Result<MessageId, SessionError> {
        let id = self.catalog.next_message_id()?;
        self.invoker.execute_balanced(ctx, id, ns, command, payload)?;
        Ok(id)
    }

    /// Send `command` to every peer listening on `ns`.
    pub fn execute_many(
        &self,
        ctx: &RequestContext,
        ns: &str,
        command: &str,
        payload: Payload,
    ) -> Result<MessageId, SessionError> {
        let id = self.catalog.next_message_id()?;
        self.invoker.execute_multicast(ctx, id, ns, command, payload)?;
        Ok(id)
    }

    /// Notify one session.
    pub fn notify(
        &self,
        target: SessionId,
        ns: &str,
        kind: &str,
        payload: Payload,
    ) -> Result<MessageId, SessionError> {
        let id = self.catalog.next_message_id()?;
        self.notifier.notify_unicast(id, target, ns, kind, payload)?;
        Ok(id)
    }

    /// Notify every session listening on `ns` that satisfies `constraint`.
    pub fn notify_many(
        &self,
        constraint: &Constraint,
        ns: &str,
        kind: &str,
        payload: Payload,
    ) -> Result<MessageId, SessionError> {
        let id = self.catalog.next_message_id()?;
        self.notifier
            .notify_multicast(id, constraint, ns, kind, payload)?;
        Ok(id)
    }

    /// Receive notifications on `ns`. Returns `false` if this replaced a
    /// handler.
    pub fn listen(
        &self,
        ns: &str,
        handler: Arc<dyn NotificationHandler>,
    ) -> Result<bool, SessionError> {
        if self.catalog.is_closed() {
            return Err(SessionError::NotFound(self.id()));
        }
        self.listener.listen(self.id(), ns, handler)
    }

    pub fn unlisten(&self, ns: &str) -> bool {
        self.listener.unlisten(self.id(), ns)
    }

    /// Close the session and drop its handlers. Idempotent.
    pub fn destroy(&self) {
        self.catalog.close();
        self.listener.unlisten_all(self.id());
        let _ = self.invoker.set_async_handler(self.id(), None);
    }

    pub fn is_closed(&self) -> bool {
        self.catalog.is_closed()
    }

    /// Resolves once the session is closed, by [`destroy`](Self::destroy),
    /// by a remote peer, or by the peer stopping.
    pub async fn done(&self) {
        self.catalog.closed().await
    }
}
