// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use super::{
    command, AttrsResponse, ClearRequest, DestroyRequest, FetchRequest, UpdateRequest,
};
use crate::command::{CallError, Invoker};
use crate::session::{Attr, SessionError, SESSION_NAMESPACE};
use parley_common::{MessageId, Payload, PeerId, Ref, RequestContext, Rev};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Sends remote session requests to owning peers.
///
/// Requests are made on behalf of this peer rather than of a session, so their
/// message ids come from the reserved session 0.
pub struct Client {
    invoker: Arc<Invoker>,
    seq: AtomicU32,
}

impl Client {
    pub fn new(invoker: Arc<Invoker>) -> Self {
        Self {
            invoker,
            seq: AtomicU32::new(0),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.invoker.peer_id()
    }

    fn message_id(&self) -> MessageId {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        self.invoker.peer_id().session(0).at(0).message(seq)
    }

    async fn call<Req: Serialize + Sync, Resp: DeserializeOwned>(
        &self,
        ctx: &RequestContext,
        owner: PeerId,
        command: &str,
        request: &Req,
    ) -> Result<Resp, CallError> {
        let payload = Payload::encode(request).map_err(|e| CallError::Protocol(e.to_string()))?;
        let reply = self
            .invoker
            .call_unicast(ctx, self.message_id(), owner, SESSION_NAMESPACE, command, payload)
            .await?;
        reply.decode().map_err(|e| CallError::Protocol(e.to_string()))
    }

    pub(crate) async fn fetch(
        &self,
        ctx: &RequestContext,
        reference: Ref,
        ns: &str,
        keys: Vec<String>,
        all: bool,
    ) -> Result<AttrsResponse, SessionError> {
        let request = FetchRequest {
            seq: reference.id.seq,
            rev: reference.rev,
            namespace: ns.to_string(),
            keys,
            all,
        };
        self.call(ctx, reference.id.peer, command::FETCH, &request)
            .await
            .map_err(|e| SessionError::from_call(e, reference, ns, SessionError::StaleFetch))
    }

    pub(crate) async fn update(
        &self,
        ctx: &RequestContext,
        reference: Ref,
        ns: &str,
        attrs: Vec<Attr>,
    ) -> Result<AttrsResponse, SessionError> {
        let request = UpdateRequest {
            seq: reference.id.seq,
            rev: reference.rev,
            namespace: ns.to_string(),
            attrs,
        };
        self.call(ctx, reference.id.peer, command::UPDATE, &request)
            .await
            .map_err(|e| SessionError::from_call(e, reference, ns, SessionError::StaleUpdate))
    }

    pub(crate) async fn clear(
        &self,
        ctx: &RequestContext,
        reference: Ref,
        ns: &str,
    ) -> Result<Rev, SessionError> {
        let request = ClearRequest {
            seq: reference.id.seq,
            rev: reference.rev,
            namespace: ns.to_string(),
        };
        let response: AttrsResponse = self
            .call(ctx, reference.id.peer, command::CLEAR, &request)
            .await
            .map_err(|e| SessionError::from_call(e, reference, ns, SessionError::StaleUpdate))?;
        Ok(response.rev)
    }

    pub(crate) async fn destroy(
        &self,
        ctx: &RequestContext,
        reference: Ref,
    ) -> Result<(), SessionError> {
        let request = DestroyRequest {
            seq: reference.id.seq,
            rev: reference.rev,
        };
        let _: AttrsResponse = self
            .call(ctx, reference.id.peer, command::DESTROY, &request)
            .await
            .map_err(|e| SessionError::from_call(e, reference, "", SessionError::StaleUpdate))?;
        Ok(())
    }
}
