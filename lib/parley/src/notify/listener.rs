// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Inbound notification routing.
//!
//! The listener consumes this peer's notification queue and hands each
//! notification to the handlers of the sessions it is meant for. The peer is
//! bound to a namespace for multicast delivery while at least one of its
//! sessions listens on it.

use super::{decode, Audience, Notification, NotificationHandler};
use crate::broker::{Binding, Broker, Delivery, Source, Subscription, TransportError};
use crate::command::CallError;
use crate::session::{local, RevisionStore, SessionError};

use async_trait::async_trait;
use parking_lot::Mutex;
use parley_common::{namespace, PeerId, SessionId};
use parley_runtime::service::{self, Machine, ServiceHandle, Signals};
use parley_runtime::Stopped;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};

const TARGET: &str = "parley::notify";

#[derive(Default)]
struct Registry {
    sessions: HashMap<SessionId, HashMap<String, Arc<dyn NotificationHandler>>>,
    /// Number of sessions listening per namespace.
    namespaces: HashMap<String, usize>,
}

pub struct Listener {
    peer_id: PeerId,
    broker: Arc<dyn Broker>,
    registry: Arc<Mutex<Registry>>,
    tracker: TaskTracker,
    handle: ServiceHandle,
}

impl Listener {
    /// Subscribe to this peer's notification queue and start routing.
    pub fn start(
        peer_id: PeerId,
        broker: Arc<dyn Broker>,
        sessions: Arc<local::Store>,
        revisions: Arc<dyn RevisionStore>,
        workers: usize,
    ) -> Result<Arc<Self>, TransportError> {
        let notifications = broker.subscribe(Source::Notifications(peer_id))?;
        let registry = Arc::new(Mutex::new(Registry::default()));
        let tracker = TaskTracker::new();

        let dispatch = DispatchLoop {
            peer_id,
            broker: broker.clone(),
            notifications,
            registry: registry.clone(),
            sessions,
            revisions,
            tracker: tracker.clone(),
            limiter: Arc::new(Semaphore::new(workers.max(1))),
        };
        let handle = service::spawn("listener", Signals::new(), dispatch, LoopState::Running);

        Ok(Arc::new(Self {
            peer_id,
            broker,
            registry,
            tracker,
            handle,
        }))
    }

    pub fn handle(&self) -> &ServiceHandle {
        &self.handle
    }

    /// Number of notification handlers currently running.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Route notifications on `ns` for `session` to `handler`. Returns `false`
    /// if this replaced an existing handler.
    pub fn listen(
        &self,
        session: SessionId,
        ns: &str,
        handler: Arc<dyn NotificationHandler>,
    ) -> Result<bool, SessionError> {
        namespace::validate(ns)?;
        if !self.handle.phase().accepts_new_work() {
            return Err(Stopped.into());
        }

        let mut registry = self.registry.lock();
        let handlers = registry.sessions.entry(session).or_default();
        if handlers.insert(ns.to_string(), handler).is_some() {
            trace!(target: TARGET, %session, namespace = ns, "replaced notification handler");
            return Ok(false);
        }

        let count = registry.namespaces.entry(ns.to_string()).or_insert(0);
        *count += 1;
        if *count == 1 {
            if let Err(e) = self
                .broker
                .bind(self.peer_id, Binding::Notifications(ns.to_string()))
            {
                registry.namespaces.remove(ns);
                if let Some(handlers) = registry.sessions.get_mut(&session) {
                    handlers.remove(ns);
                }
                return Err(SessionError::Call(CallError::Transport(e)));
            }
        }
        debug!(target: TARGET, %session, namespace = ns, "listening for notifications");
        Ok(true)
    }

    /// Stop routing notifications on `ns` to `session`. Returns `false` if it
    /// was not listening.
    pub fn unlisten(&self, session: SessionId, ns: &str) -> bool {
        let mut registry = self.registry.lock();
        let removed = match registry.sessions.get_mut(&session) {
            Some(handlers) => {
                let removed = handlers.remove(ns).is_some();
                if handlers.is_empty() {
                    registry.sessions.remove(&session);
                }
                removed
            }
            None => false,
        };
        if removed {
            self.release(&mut registry, ns);
        }
        removed
    }

    /// Remove every handler of `session`. Returns how many were removed.
    pub fn unlisten_all(&self, session: SessionId) -> usize {
        let mut registry = self.registry.lock();
        let Some(handlers) = registry.sessions.remove(&session) else {
            return 0;
        };
        for ns in handlers.keys() {
            self.release(&mut registry, ns);
        }
        handlers.len()
    }

    fn release(&self, registry: &mut Registry, ns: &str) {
        let Some(count) = registry.namespaces.get_mut(ns) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            registry.namespaces.remove(ns);
            if let Err(e) = self
                .broker
                .unbind(self.peer_id, Binding::Notifications(ns.to_string()))
            {
                warn!(target: TARGET, namespace = ns, error = %e, "failed to unbind namespace");
            }
        }
    }
}

#[derive(Debug)]
enum LoopState {
    Running,
    Draining,
}

struct DispatchLoop {
    peer_id: PeerId,
    broker: Arc<dyn Broker>,
    notifications: Subscription,
    registry: Arc<Mutex<Registry>>,
    sessions: Arc<local::Store>,
    revisions: Arc<dyn RevisionStore>,
    tracker: TaskTracker,
    limiter: Arc<Semaphore>,
}

impl DispatchLoop {
    fn dispatch(&self, delivery: Delivery) {
        let header = match decode(&delivery.message) {
            Ok(header) => header,
            Err(e) => {
                warn!(target: TARGET, peer = %self.peer_id, error = %e, "rejecting malformed notification");
                delivery.reject();
                return;
            }
        };
        let source = match self.revisions.get_revision(header.id.reference) {
            Ok(source) => source,
            Err(e) => {
                warn!(target: TARGET, id = %header.id, error = %e, "rejecting notification from unresolvable source");
                delivery.reject();
                return;
            }
        };

        let ns = header.namespace.as_str();
        let candidates: Vec<(SessionId, Arc<dyn NotificationHandler>)> = {
            let registry = self.registry.lock();
            match &header.audience {
                Audience::Session(target) => registry
                    .sessions
                    .get(target)
                    .and_then(|handlers| handlers.get(ns))
                    .map(|handler| vec![(*target, handler.clone())])
                    .unwrap_or_default(),
                Audience::Matching(_) => registry
                    .sessions
                    .iter()
                    .filter_map(|(id, handlers)| handlers.get(ns).map(|h| (*id, h.clone())))
                    .collect(),
            }
        };

        let (constraint, is_multicast) = match header.audience {
            Audience::Session(_) => (None, false),
            Audience::Matching(constraint) => (Some(constraint), true),
        };

        let mut delivered = 0;
        for (target, handler) in candidates {
            if let Some(constraint) = &constraint {
                let matches = self
                    .sessions
                    .get(&target)
                    .is_some_and(|catalog| constraint.matches(&catalog.namespace(ns)));
                if !matches {
                    continue;
                }
            }
            let notification = Notification {
                id: header.id,
                source: source.clone(),
                target,
                namespace: header.namespace.clone(),
                kind: header.kind.clone(),
                payload: delivery.message.payload.clone(),
                constraint: constraint.clone(),
                is_multicast,
            };
            let limiter = self.limiter.clone();
            self.tracker.spawn(async move {
                let _permit = limiter.acquire_owned().await;
                handler.handle(notification).await;
            });
            delivered += 1;
        }
        trace!(target: TARGET, id = %header.id, namespace = ns, delivered, "routed notification");
        delivery.ack();
    }
}

#[async_trait]
impl Machine for DispatchLoop {
    type State = LoopState;

    async fn run_state(
        &mut self,
        state: LoopState,
        signals: &Signals,
    ) -> anyhow::Result<Option<LoopState>> {
        match state {
            LoopState::Running => loop {
                tokio::select! {
                    biased;
                    _ = signals.forceful() => return Ok(None),
                    Some(delivery) = self.notifications.recv() => self.dispatch(delivery),
                    _ = signals.graceful() => return Ok(Some(LoopState::Draining)),
                }
            },
            LoopState::Draining => {
                self.tracker.close();
                tokio::select! {
                    _ = signals.forceful() => {}
                    _ = self.tracker.wait() => {}
                }
                Ok(None)
            }
        }
    }

    async fn finalize(&mut self, result: anyhow::Result<()>) -> anyhow::Result<()> {
        self.tracker.close();
        let mut registry = self.registry.lock();
        for ns in registry.namespaces.keys() {
            let _ = self
                .broker
                .unbind(self.peer_id, Binding::Notifications(ns.clone()));
        }
        registry.namespaces.clear();
        registry.sessions.clear();
        result
    }
}
