// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The authoritative attribute catalog of a locally owned session.
//!
//! All state sits behind one read/write lock. Writers copy the attribute map,
//! apply their change and swap the new map in, so readers that took a
//! snapshot keep seeing exactly the revision they asked for.

use super::revision::LocalRevision;
use crate::session::{Attr, AttrMeta, AttrTable, Diff, SessionError};
use parking_lot::RwLock;
use parley_common::{MessageId, Ref, Rev, SessionId};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Namespace -> key -> attribute.
pub type Namespaces = HashMap<String, BTreeMap<String, AttrMeta>>;

struct State {
    reference: Ref,
    attrs: Arc<Namespaces>,
    seq: u32,
    is_closed: bool,
}

pub struct Catalog {
    id: SessionId,
    state: RwLock<State>,
    closed: CancellationToken,
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("Catalog")
            .field("reference", &state.reference)
            .field("is_closed", &state.is_closed)
            .finish()
    }
}

impl Catalog {
    pub fn new(id: SessionId) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: RwLock::new(State {
                reference: id.at(0),
                attrs: Arc::new(Namespaces::new()),
                seq: 0,
                is_closed: false,
            }),
            closed: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn reference(&self) -> Ref {
        self.state.read().reference
    }

    /// A view of the current revision.
    pub fn head(self: &Arc<Self>) -> LocalRevision {
        let state = self.state.read();
        LocalRevision::new(self.clone(), state.reference, state.attrs.clone())
    }

    /// A view of a past or current revision.
    pub fn at(self: &Arc<Self>, rev: Rev) -> Result<LocalRevision, SessionError> {
        let state = self.state.read();
        if rev > state.reference.rev {
            return Err(SessionError::FutureRevision(self.id.at(rev)));
        }
        Ok(LocalRevision::new(
            self.clone(),
            self.id.at(rev),
            state.attrs.clone(),
        ))
    }

    /// The current revision together with its attributes.
    pub fn attrs(&self) -> (Ref, Arc<Namespaces>) {
        let state = self.state.read();
        (state.reference, state.attrs.clone())
    }

    /// Current attributes of one namespace, for constraint matching.
    pub fn namespace(&self, ns: &str) -> AttrTable {
        let state = self.state.read();
        state
            .attrs
            .get(ns)
            .map(|table| table.values().map(|m| m.attr.clone()).collect())
            .unwrap_or_default()
    }

    /// Apply `attrs` to `ns` if `reference` is the current revision.
    ///
    /// Attributes that would not change anything are skipped; if nothing is
    /// left the revision stays the same. Otherwise the revision advances by
    /// exactly one and the effective changes are appended to `diff`.
    pub fn try_update(
        &self,
        reference: Ref,
        ns: &str,
        attrs: &[Attr],
        mut diff: Option<&mut Diff>,
    ) -> Result<Ref, SessionError> {
        let mut state = self.state.write();
        self.check(&state, reference)?;

        let next = reference.rev + 1;
        let before = state.attrs.get(ns);
        let mut table = before.cloned().unwrap_or_default();
        let mut touched: Vec<&str> = Vec::new();
        let mut frozen = Vec::new();
        for attr in attrs {
            let current = table.get(&attr.key);
            let unchanged = match current {
                Some(current) => current.attr.is_same(attr),
                None => attr.is_empty() && !attr.is_frozen,
            };
            if unchanged {
                continue;
            }
            if current.is_some_and(|m| m.attr.is_immutable()) {
                frozen.push(attr.key.clone());
                continue;
            }
            match table.get_mut(&attr.key) {
                Some(meta) => {
                    meta.attr = attr.clone();
                    meta.updated_at = next;
                }
                None => {
                    table.insert(
                        attr.key.clone(),
                        AttrMeta {
                            attr: attr.clone(),
                            created_at: next,
                            updated_at: next,
                        },
                    );
                }
            }
            if !touched.contains(&attr.key.as_str()) {
                touched.push(&attr.key);
            }
        }

        if !frozen.is_empty() {
            return Err(SessionError::FrozenAttributes {
                reference,
                namespace: ns.to_string(),
                keys: frozen,
            });
        }
        if touched.is_empty() {
            return Ok(reference);
        }

        if let Some(diff) = diff.as_deref_mut() {
            for key in &touched {
                if let Some(meta) = table.get(*key) {
                    let is_created = before.map_or(true, |t| !t.contains_key(*key));
                    diff.push(ns, meta.clone(), is_created);
                }
            }
        }
        let mut namespaces = (*state.attrs).clone();
        namespaces.insert(ns.to_string(), table);

        Ok(self.advance(&mut state, namespaces))
    }

    /// Empty every non-empty attribute of `ns` if `reference` is the current
    /// revision. Fails if the namespace holds an immutable attribute.
    pub fn try_clear(
        &self,
        reference: Ref,
        ns: &str,
        mut diff: Option<&mut Diff>,
    ) -> Result<Ref, SessionError> {
        let mut state = self.state.write();
        self.check(&state, reference)?;

        let Some(table) = state.attrs.get(ns) else {
            return Ok(reference);
        };
        let frozen: Vec<String> = table
            .values()
            .filter(|m| m.attr.is_immutable())
            .map(|m| m.attr.key.clone())
            .collect();
        if !frozen.is_empty() {
            return Err(SessionError::FrozenAttributes {
                reference,
                namespace: ns.to_string(),
                keys: frozen,
            });
        }
        if table.values().all(|m| m.attr.is_empty()) {
            return Ok(reference);
        }

        let next = reference.rev + 1;
        let mut namespaces = (*state.attrs).clone();
        if let Some(table) = namespaces.get_mut(ns) {
            for meta in table.values_mut().filter(|m| !m.attr.is_empty()) {
                meta.attr.value.clear();
                meta.updated_at = next;
                if let Some(diff) = diff.as_deref_mut() {
                    diff.push(ns, meta.clone(), false);
                }
            }
        }

        Ok(self.advance(&mut state, namespaces))
    }

    /// Close the session if `reference` is the current revision.
    pub fn try_destroy(&self, reference: Ref) -> Result<(), SessionError> {
        let mut state = self.state.write();
        self.check(&state, reference)?;
        state.is_closed = true;
        drop(state);
        self.closed.cancel();
        Ok(())
    }

    /// Close the session unconditionally. Idempotent.
    pub fn close(&self) {
        self.state.write().is_closed = true;
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.state.read().is_closed
    }

    /// Resolves once the session is closed.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }

    /// A message id that has not been used before. Ids are scoped to the
    /// current revision and restart when it advances.
    pub fn next_message_id(&self) -> Result<MessageId, SessionError> {
        let mut state = self.state.write();
        if state.is_closed {
            return Err(SessionError::NotFound(self.id));
        }
        state.seq += 1;
        Ok(state.reference.message(state.seq))
    }

    fn check(&self, state: &State, reference: Ref) -> Result<(), SessionError> {
        if state.is_closed || reference.id != self.id {
            return Err(SessionError::NotFound(reference.id));
        }
        if reference.rev != state.reference.rev {
            return Err(SessionError::StaleUpdate(reference));
        }
        Ok(())
    }

    fn advance(&self, state: &mut State, namespaces: Namespaces) -> Ref {
        state.attrs = Arc::new(namespaces);
        state.reference.rev += 1;
        state.seq = 0;
        state.reference
    }
}

/// Read `key` of `ns` as of `rev` from a snapshot.
pub(crate) fn read_at(
    snapshot: &Namespaces,
    reference: Ref,
    ns: &str,
    key: &str,
) -> Result<Attr, SessionError> {
    match snapshot.get(ns).and_then(|t| t.get(key)) {
        Some(meta) if meta.created_at > reference.rev => Ok(Attr::empty(key)),
        Some(meta) if meta.updated_at > reference.rev => Err(SessionError::StaleFetch(reference)),
        Some(meta) => Ok(meta.attr.clone()),
        None => Ok(Attr::empty(key)),
    }
}

/// Read every attribute of `ns` visible at `rev`.
pub(crate) fn read_all_at(
    snapshot: &Namespaces,
    reference: Ref,
    ns: &str,
) -> Result<AttrTable, SessionError> {
    let Some(table) = snapshot.get(ns) else {
        return Ok(AttrTable::new());
    };
    let mut attrs = AttrTable::new();
    for meta in table.values() {
        if meta.created_at > reference.rev {
            continue;
        }
        if meta.updated_at > reference.rev {
            return Err(SessionError::StaleFetch(reference));
        }
        attrs.insert(meta.attr.clone());
    }
    Ok(attrs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_common::PeerId;

    fn catalog() -> Arc<Catalog> {
        Catalog::new(PeerId::new(7, 7).session(1))
    }

    #[test]
    fn test_update_bumps_revision_once() {
        let catalog = catalog();
        let r0 = catalog.reference();
        let r1 = catalog
            .try_update(r0, "ns", &[Attr::new("a", "1"), Attr::new("b", "2")], None)
            .unwrap();
        assert_eq!(r1.rev, r0.rev + 1);

        // all no-op
        let same = catalog
            .try_update(r1, "ns", &[Attr::new("a", "1"), Attr::empty("c")], None)
            .unwrap();
        assert_eq!(same, r1);
        assert_eq!(catalog.reference(), r1);
    }

    #[test]
    fn test_stale_update() {
        let catalog = catalog();
        let r0 = catalog.reference();
        catalog.try_update(r0, "ns", &[Attr::new("a", "1")], None).unwrap();
        let err = catalog
            .try_update(r0, "ns", &[Attr::new("a", "2")], None)
            .unwrap_err();
        assert!(matches!(err, SessionError::StaleUpdate(r) if r == r0));
    }

    #[test]
    fn test_frozen_attribute() {
        let catalog = catalog();
        let r1 = catalog
            .try_update(catalog.reference(), "ns", &[Attr::frozen("a", "1")], None)
            .unwrap();

        assert_eq!(
            catalog
                .try_update(r1, "ns", &[Attr::frozen("a", "1")], None)
                .unwrap(),
            r1
        );
        let err = catalog
            .try_update(r1, "ns", &[Attr::new("a", "2")], None)
            .unwrap_err();
        match err {
            SessionError::FrozenAttributes { keys, namespace, .. } => {
                assert_eq!(keys, vec!["a"]);
                assert_eq!(namespace, "ns");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(catalog.reference(), r1);
    }

    #[test]
    fn test_freeze_applies_within_batch() {
        let catalog = catalog();
        let r0 = catalog.reference();
        let err = catalog
            .try_update(r0, "ns", &[Attr::frozen("a", "1"), Attr::new("a", "2")], None)
            .unwrap_err();
        assert!(
            matches!(&err, SessionError::FrozenAttributes { keys, .. } if keys == &["a".to_string()])
        );
        assert_eq!(catalog.reference(), r0);
        assert!(catalog.namespace("ns").get("a").is_empty());
    }

    #[test]
    fn test_batch_applies_in_order() {
        let catalog = catalog();
        let mut diff = Diff::new();
        let r1 = catalog
            .try_update(
                catalog.reference(),
                "ns",
                &[Attr::new("a", "1"), Attr::new("b", "1"), Attr::empty("a")],
                Some(&mut diff),
            )
            .unwrap();
        assert_eq!(r1.rev, 1);

        let (_, attrs) = catalog.attrs();
        let table = &attrs["ns"];
        let a = &table["a"];
        assert!(a.attr.is_empty());
        assert_eq!((a.created_at, a.updated_at), (1, 1));
        assert_eq!(table["b"].attr.value, "1");

        let entries: Vec<_> = diff
            .iter()
            .map(|e| (e.meta.attr.key.as_str(), e.meta.attr.value.as_str(), e.is_created))
            .collect();
        assert_eq!(entries, vec![("a", "", true), ("b", "1", true)]);
    }

    #[test]
    fn test_mixed_update_logs_effective_changes() {
        let catalog = catalog();
        let r1 = catalog
            .try_update(catalog.reference(), "ns", &[Attr::new("a", "1")], None)
            .unwrap();
        let mut diff = Diff::new();
        let r2 = catalog
            .try_update(
                r1,
                "ns",
                &[Attr::new("a", "1"), Attr::new("b", "2")],
                Some(&mut diff),
            )
            .unwrap();
        assert_eq!(r2.rev, 2);
        assert_eq!(diff.to_string(), "{ns::+b=2}");
    }

    #[test]
    fn test_clear_empties_values() {
        let catalog = catalog();
        let r1 = catalog
            .try_update(
                catalog.reference(),
                "ns",
                &[Attr::new("a", "1"), Attr::frozen("b", "")],
                None,
            )
            .unwrap();
        let mut diff = Diff::new();
        let r2 = catalog.try_clear(r1, "ns", Some(&mut diff)).unwrap();
        assert_eq!(r2.rev, 2);
        assert_eq!(diff.to_string(), "{ns::-a}");
        assert!(catalog.namespace("ns").get("a").is_empty());

        // nothing left to clear
        assert_eq!(catalog.try_clear(r2, "ns", None).unwrap(), r2);
    }

    #[test]
    fn test_clear_refuses_immutable() {
        let catalog = catalog();
        let r1 = catalog
            .try_update(catalog.reference(), "ns", &[Attr::frozen("a", "1")], None)
            .unwrap();
        assert!(matches!(
            catalog.try_clear(r1, "ns", None),
            Err(SessionError::FrozenAttributes { .. })
        ));
    }

    #[test]
    fn test_views_are_snapshots() {
        let catalog = catalog();
        let r1 = catalog
            .try_update(catalog.reference(), "ns", &[Attr::new("a", "1")], None)
            .unwrap();
        let (_, before) = catalog.attrs();
        catalog.try_update(r1, "ns", &[Attr::new("a", "2")], None).unwrap();

        assert_eq!(read_at(&before, r1, "ns", "a").unwrap().value, "1");
        let (_, after) = catalog.attrs();
        assert!(matches!(
            read_at(&after, r1, "ns", "a"),
            Err(SessionError::StaleFetch(_))
        ));
    }

    #[test]
    fn test_message_ids_restart_per_revision() {
        let catalog = catalog();
        let r0 = catalog.reference();
        assert_eq!(catalog.next_message_id().unwrap(), r0.message(1));
        assert_eq!(catalog.next_message_id().unwrap(), r0.message(2));

        let r1 = catalog.try_update(r0, "ns", &[Attr::new("a", "1")], None).unwrap();
        assert_eq!(catalog.next_message_id().unwrap(), r1.message(1));
    }

    #[test]
    fn test_destroy_and_close() {
        let catalog = catalog();
        let r0 = catalog.reference();
        catalog.try_update(r0, "ns", &[Attr::new("a", "1")], None).unwrap();
        assert!(matches!(
            catalog.try_destroy(r0),
            Err(SessionError::StaleUpdate(_))
        ));
        catalog.try_destroy(catalog.reference()).unwrap();
        assert!(catalog.is_closed());
        assert!(catalog.next_message_id().unwrap_err().is_not_found());

        catalog.close();
        assert!(catalog.is_closed());
    }

    #[test]
    fn test_future_revision() {
        let catalog = catalog();
        assert!(matches!(
            catalog.at(5),
            Err(SessionError::FutureRevision(r)) if r.rev == 5
        ));
    }
}
