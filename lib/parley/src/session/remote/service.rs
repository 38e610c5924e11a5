// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Owner side of the remote session protocol.

use super::{
    command, AttrsResponse, ClearRequest, DestroyRequest, FetchRequest, UpdateRequest,
};
use crate::command::{CommandHandler, Request, Response};
use crate::session::{local, AttrMeta, Diff, SessionError};
use anyhow::anyhow;
use async_trait::async_trait;
use parley_common::{namespace, Payload, RequestContext, SessionId};
use std::sync::Arc;
use tracing::debug;

const TARGET: &str = "parley::session";

/// Serves reads and writes of local sessions to other peers.
pub struct SessionService {
    sessions: Arc<local::Store>,
}

impl SessionService {
    pub fn new(sessions: Arc<local::Store>) -> Self {
        Self { sessions }
    }

    fn catalog(&self, seq: u32) -> Result<Arc<local::Catalog>, SessionError> {
        let id = SessionId::new(self.sessions.peer_id(), seq);
        match self.sessions.get(&id) {
            Some(catalog) if !catalog.is_closed() => Ok(catalog),
            _ => Err(SessionError::NotFound(id)),
        }
    }

    fn fetch(&self, request: FetchRequest) -> Result<AttrsResponse, SessionError> {
        let catalog = self.catalog(request.seq)?;
        let (reference, snapshot) = catalog.attrs();
        let table = snapshot.get(&request.namespace);
        let attrs: Vec<AttrMeta> = if request.all {
            table.map(|t| t.values().cloned().collect()).unwrap_or_default()
        } else {
            request
                .keys
                .iter()
                .map(|key| {
                    table
                        .and_then(|t| t.get(key))
                        .cloned()
                        .unwrap_or_else(|| AttrMeta::absent(key))
                })
                .collect()
        };
        Ok(AttrsResponse {
            rev: reference.rev,
            attrs,
        })
    }

    fn update(&self, request: UpdateRequest) -> Result<AttrsResponse, SessionError> {
        namespace::validate(&request.namespace)?;
        let catalog = self.catalog(request.seq)?;
        let mut diff = Diff::new();
        let reference = catalog.try_update(
            catalog.id().at(request.rev),
            &request.namespace,
            &request.attrs,
            Some(&mut diff),
        )?;
        if !diff.is_empty() {
            debug!(target: TARGET, %reference, %diff, "remote update");
        }
        Ok(AttrsResponse {
            rev: reference.rev,
            attrs: diff.iter().map(|entry| entry.meta.clone()).collect(),
        })
    }

    fn clear(&self, request: ClearRequest) -> Result<AttrsResponse, SessionError> {
        namespace::validate(&request.namespace)?;
        let catalog = self.catalog(request.seq)?;
        let mut diff = Diff::new();
        let reference = catalog.try_clear(
            catalog.id().at(request.rev),
            &request.namespace,
            Some(&mut diff),
        )?;
        if !diff.is_empty() {
            debug!(target: TARGET, %reference, %diff, "remote clear");
        }
        Ok(AttrsResponse {
            rev: reference.rev,
            attrs: Vec::new(),
        })
    }

    fn destroy(&self, request: DestroyRequest) -> Result<AttrsResponse, SessionError> {
        let catalog = self.catalog(request.seq)?;
        let reference = catalog.id().at(request.rev);
        catalog.try_destroy(reference)?;
        debug!(target: TARGET, %reference, "remote destroy");
        Ok(AttrsResponse {
            rev: request.rev,
            attrs: Vec::new(),
        })
    }

    fn dispatch(&self, command: &str, payload: &Payload) -> anyhow::Result<Payload> {
        let result = match command {
            command::FETCH => self.fetch(payload.decode()?),
            command::UPDATE => self.update(payload.decode()?),
            command::CLEAR => self.clear(payload.decode()?),
            command::DESTROY => self.destroy(payload.decode()?),
            other => return Err(anyhow!("unknown session command '{other}'")),
        };
        match result {
            Ok(response) => Ok(Payload::encode(&response)?),
            Err(err) => match err.to_failure() {
                Some(failure) => Err(failure.into()),
                None => Err(err.into()),
            },
        }
    }
}

#[async_trait]
impl CommandHandler for SessionService {
    async fn handle(&self, _ctx: RequestContext, request: Request, response: Response) {
        match self.dispatch(&request.command, &request.payload) {
            Ok(payload) => response.done(payload),
            Err(err) => response.error(err),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Attr;
    use parley_common::PeerId;

    fn service() -> (SessionService, Arc<local::Catalog>) {
        let sessions = Arc::new(local::Store::new(
            PeerId::new(5, 5),
            tokio::runtime::Handle::current(),
        ));
        let catalog = sessions.create();
        (SessionService::new(sessions), catalog)
    }

    fn encode<T: serde::Serialize>(value: &T) -> Payload {
        Payload::encode(value).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_reports_absent_keys() {
        let (service, catalog) = service();
        catalog
            .try_update(catalog.reference(), "ns", &[Attr::new("a", "1")], None)
            .unwrap();

        let request = FetchRequest {
            seq: catalog.id().seq,
            rev: 1,
            namespace: "ns".into(),
            keys: vec!["a".into(), "b".into()],
            all: false,
        };
        let reply: AttrsResponse = service
            .dispatch(command::FETCH, &encode(&request))
            .unwrap()
            .decode()
            .unwrap();
        assert_eq!(reply.rev, 1);
        assert_eq!(reply.attrs[0].attr.value, "1");
        assert_eq!(reply.attrs[1], AttrMeta::absent("b"));
    }

    #[tokio::test]
    async fn test_stale_update_maps_to_failure() {
        let (service, catalog) = service();
        catalog
            .try_update(catalog.reference(), "ns", &[Attr::new("a", "1")], None)
            .unwrap();

        let request = UpdateRequest {
            seq: catalog.id().seq,
            rev: 0,
            namespace: "ns".into(),
            attrs: vec![Attr::new("a", "2")],
        };
        let err = service
            .dispatch(command::UPDATE, &encode(&request))
            .unwrap_err();
        let failure = err.downcast::<crate::command::Failure>().unwrap();
        assert_eq!(failure.kind, "stale");
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let (service, _catalog) = service();
        let request = DestroyRequest { seq: 42, rev: 0 };
        let err = service
            .dispatch(command::DESTROY, &encode(&request))
            .unwrap_err();
        let failure = err.downcast::<crate::command::Failure>().unwrap();
        assert_eq!(failure.kind, "not-found");
    }
}
