// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Cache of one foreign session.
//!
//! Every cached attribute remembers the owner's revision at the time it was
//! fetched. A cached value answers a read at revision `rev` when it is known to
//! be the value at `rev`: the attribute is immutable, or it was fetched at or
//! after `rev` and has not changed since `rev`. If the cache already proves
//! that the attribute changed after `rev`, the read fails without asking the
//! owner.
//!
//! The lock is never held across a network call. Whatever the owner tells us
//! is folded back in afterwards by [`Catalog::update_state`] and the merge of
//! returned metadata.

use super::Client;
use crate::session::{Attr, AttrMeta, AttrTable, SessionError};
use parking_lot::RwLock;
use parley_common::{namespace, Ref, RequestContext, Rev, SessionId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::trace;

const TARGET: &str = "parley::session";

#[derive(Debug, Clone)]
struct Entry {
    meta: AttrMeta,
    fetched_at: Rev,
}

#[derive(Debug, Default)]
struct State {
    highest_rev: Rev,
    closed: bool,
    cache: HashMap<String, HashMap<String, Entry>>,
}

enum Lookup {
    Resolved(Attr),
    Stale,
    Miss,
}

fn lookup(entry: Option<&Entry>, rev: Rev, key: &str) -> Lookup {
    let Some(entry) = entry else {
        return Lookup::Miss;
    };
    let meta = &entry.meta;
    if meta.created_at > rev {
        Lookup::Resolved(Attr::empty(key))
    } else if meta.updated_at > rev {
        Lookup::Stale
    } else if meta.attr.is_immutable() || entry.fetched_at >= rev {
        Lookup::Resolved(meta.attr.clone())
    } else {
        Lookup::Miss
    }
}

pub struct Catalog {
    id: SessionId,
    client: Arc<Client>,
    state: RwLock<State>,
    marked: AtomicBool,
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("Catalog")
            .field("id", &self.id)
            .field("highest_rev", &state.highest_rev)
            .field("closed", &state.closed)
            .finish()
    }
}

impl Catalog {
    pub fn new(id: SessionId, client: Arc<Client>) -> Self {
        Self {
            id,
            client,
            state: RwLock::new(State::default()),
            marked: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The highest revision the owner is known to have reached.
    pub fn highest_rev(&self) -> Rev {
        self.state.read().highest_rev
    }

    pub fn is_closed(&self) -> bool {
        self.state.read().closed
    }

    /// Number of cached attributes.
    pub fn cached(&self) -> usize {
        self.state.read().cache.values().map(HashMap::len).sum()
    }

    pub(crate) fn touch(&self) {
        self.marked.store(false, Ordering::Relaxed);
    }

    /// Mark the catalog for eviction. Returns `true` if it was already marked
    /// and has not been used since.
    pub(crate) fn mark(&self) -> bool {
        self.marked.swap(true, Ordering::Relaxed)
    }

    /// Fold the outcome of a remote call into the cache state.
    pub fn update_state(&self, outcome: Result<Rev, &SessionError>) {
        let mut state = self.state.write();
        match outcome {
            Ok(rev) => state.highest_rev = state.highest_rev.max(rev),
            Err(SessionError::NotFound(_)) => state.closed = true,
            Err(_) => {}
        }
    }

    fn ensure_open(&self, state: &State) -> Result<(), SessionError> {
        if state.closed {
            return Err(SessionError::NotFound(self.id));
        }
        Ok(())
    }

    fn ensure_current(&self, state: &State, reference: Ref) -> Result<(), SessionError> {
        self.ensure_open(state)?;
        if state.highest_rev > reference.rev {
            return Err(SessionError::StaleUpdate(reference));
        }
        Ok(())
    }

    fn merge(&self, ns: &str, metas: &[AttrMeta], fetched_at: Rev) {
        let mut state = self.state.write();
        let table = state.cache.entry(ns.to_string()).or_default();
        for meta in metas {
            match table.get_mut(&meta.attr.key) {
                Some(entry) if entry.fetched_at > fetched_at => {}
                Some(entry) => {
                    entry.meta = meta.clone();
                    entry.fetched_at = fetched_at;
                }
                None => {
                    table.insert(
                        meta.attr.key.clone(),
                        Entry {
                            meta: meta.clone(),
                            fetched_at,
                        },
                    );
                }
            }
        }
    }

    /// The owner's current revision.
    pub async fn head(&self, ctx: &RequestContext) -> Result<Ref, SessionError> {
        self.touch();
        let reference = {
            let state = self.state.read();
            self.ensure_open(&state)?;
            self.id.at(state.highest_rev)
        };
        let result = self
            .client
            .fetch(ctx, reference, "", Vec::new(), false)
            .await;
        self.update_state(result.as_ref().map(|r| r.rev));
        Ok(self.id.at(result?.rev))
    }

    /// Read `keys` of `ns` as of `rev`.
    pub async fn fetch(
        &self,
        ctx: &RequestContext,
        rev: Rev,
        ns: &str,
        keys: &[&str],
    ) -> Result<AttrTable, SessionError> {
        self.touch();
        let reference = self.id.at(rev);
        let mut attrs = AttrTable::new();
        let mut missing = Vec::new();
        {
            let state = self.state.read();
            self.ensure_open(&state)?;
            let table = state.cache.get(ns);
            for key in keys {
                match lookup(table.and_then(|t| t.get(*key)), rev, key) {
                    Lookup::Resolved(attr) => attrs.insert(attr),
                    Lookup::Stale => return Err(SessionError::StaleFetch(reference)),
                    Lookup::Miss => missing.push(key.to_string()),
                }
            }
        }
        if missing.is_empty() {
            trace!(target: TARGET, %reference, ns, "served from cache");
            return Ok(attrs);
        }

        let result = self.client.fetch(ctx, reference, ns, missing, false).await;
        self.update_state(result.as_ref().map(|r| r.rev));
        let response = result?;
        if response.rev < rev {
            return Err(SessionError::FutureRevision(reference));
        }
        self.merge(ns, &response.attrs, response.rev);

        for meta in &response.attrs {
            if meta.created_at > rev {
                attrs.insert(Attr::empty(&meta.attr.key));
            } else if meta.updated_at > rev {
                return Err(SessionError::StaleFetch(reference));
            } else {
                attrs.insert(meta.attr.clone());
            }
        }
        Ok(attrs)
    }

    /// Read all of `ns` as of `rev`. Always asks the owner, since the cache
    /// cannot know about keys it has never seen.
    pub async fn fetch_all(
        &self,
        ctx: &RequestContext,
        rev: Rev,
        ns: &str,
    ) -> Result<AttrTable, SessionError> {
        self.touch();
        let reference = self.id.at(rev);
        self.ensure_open(&self.state.read())?;

        let result = self.client.fetch(ctx, reference, ns, Vec::new(), true).await;
        self.update_state(result.as_ref().map(|r| r.rev));
        let response = result?;
        if response.rev < rev {
            return Err(SessionError::FutureRevision(reference));
        }
        self.merge(ns, &response.attrs, response.rev);

        let mut attrs = AttrTable::new();
        for meta in &response.attrs {
            if meta.created_at > rev {
                continue;
            }
            if meta.updated_at > rev {
                return Err(SessionError::StaleFetch(reference));
            }
            attrs.insert(meta.attr.clone());
        }
        Ok(attrs)
    }

    /// Apply `attrs` to `ns` on the owner if `rev` is its current revision.
    pub async fn try_update(
        &self,
        ctx: &RequestContext,
        rev: Rev,
        ns: &str,
        attrs: &[Attr],
    ) -> Result<Ref, SessionError> {
        self.touch();
        namespace::validate(ns)?;
        let reference = self.id.at(rev);
        let mut send: Vec<Attr> = Vec::new();
        {
            let state = self.state.read();
            self.ensure_current(&state, reference)?;
            let table = state.cache.get(ns);
            let mut frozen = Vec::new();
            for attr in attrs {
                let known = table
                    .and_then(|t| t.get(&attr.key))
                    .filter(|e| e.meta.attr.is_immutable() || e.fetched_at >= rev)
                    .map(|e| &e.meta.attr);
                match known {
                    Some(current) if current.is_same(attr) => {}
                    Some(current) if current.is_immutable() => frozen.push(attr.key.clone()),
                    _ => send.push(attr.clone()),
                }
            }
            if !frozen.is_empty() {
                return Err(SessionError::FrozenAttributes {
                    reference,
                    namespace: ns.to_string(),
                    keys: frozen,
                });
            }
        }
        if send.is_empty() {
            return Ok(reference);
        }

        let result = self.client.update(ctx, reference, ns, send).await;
        self.update_state(result.as_ref().map(|r| r.rev));
        let response = result?;
        self.merge(ns, &response.attrs, response.rev);
        Ok(self.id.at(response.rev))
    }

    /// Empty every value of `ns` on the owner if `rev` is its current revision.
    pub async fn try_clear(
        &self,
        ctx: &RequestContext,
        rev: Rev,
        ns: &str,
    ) -> Result<Ref, SessionError> {
        self.touch();
        namespace::validate(ns)?;
        let reference = self.id.at(rev);
        {
            let state = self.state.read();
            self.ensure_current(&state, reference)?;
            let frozen: Vec<String> = state
                .cache
                .get(ns)
                .map(|t| {
                    t.values()
                        .filter(|e| e.meta.attr.is_immutable())
                        .map(|e| e.meta.attr.key.clone())
                        .collect()
                })
                .unwrap_or_default();
            if !frozen.is_empty() {
                return Err(SessionError::FrozenAttributes {
                    reference,
                    namespace: ns.to_string(),
                    keys: frozen,
                });
            }
        }

        let result = self.client.clear(ctx, reference, ns).await;
        self.update_state(result.as_ref().copied());
        let next = result?;

        if next > rev {
            let mut state = self.state.write();
            if let Some(table) = state.cache.get_mut(ns) {
                // entries fetched before `rev` may hide a value that was just cleared
                table.retain(|_, e| e.fetched_at >= rev);
                for entry in table.values_mut() {
                    if !entry.meta.attr.is_empty() {
                        entry.meta.attr.value.clear();
                        entry.meta.updated_at = next;
                    }
                    entry.fetched_at = entry.fetched_at.max(next);
                }
            }
        }
        Ok(self.id.at(next))
    }

    /// Destroy the session on the owner if `rev` is its current revision.
    pub async fn try_destroy(&self, ctx: &RequestContext, rev: Rev) -> Result<(), SessionError> {
        self.touch();
        let reference = self.id.at(rev);
        self.ensure_current(&self.state.read(), reference)?;

        let result = self.client.destroy(ctx, reference).await;
        self.update_state(result.as_ref().map(|_| rev));
        result?;
        self.state.write().closed = true;
        Ok(())
    }
}
