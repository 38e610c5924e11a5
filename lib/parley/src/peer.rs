// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! A participant on the broker.
//!
//! A [`Peer`] owns every component: the channel pool, the local and remote
//! session stores, the invoker, the command server (with the remote session
//! service registered on `_sess`), the notifier and the listener. It is itself
//! a service whose children stop in order:
//!
//! - graceful stop drains the server first, so no handler is left running,
//!   then drains the invoker, the listener and the remote store;
//! - forceful stop stops every child at once.
//!
//! The peer completes after every child has completed and every local session
//! has been closed.

use crate::broker::{Broker, ChannelManager, ChannelPool, TransportError};
use crate::command::{CallError, CommandHandler, Invoker, Server, ServerError};
use crate::notify::{Listener, Notifier};
use crate::session::{
    local, remote, Aggregator, Revision, RevisionStore, Session, SessionError, SESSION_NAMESPACE,
};

use async_trait::async_trait;
use futures::future::{join_all, select_all};
use parley_common::{PeerId, Ref};
use parley_runtime::service::{self, Machine, ServiceHandle, Signals};
use parley_runtime::{ConfigError, PeerConfig, Stopped};
use std::sync::Arc;
use tokio::runtime::{Handle, TryCurrentError};
use tracing::{debug, info, warn};

const TARGET: &str = "parley::peer";

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("peer requires a broker")]
    MissingBroker,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Call(#[from] CallError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error("peer must be built within a tokio runtime: {0}")]
    Runtime(#[from] TryCurrentError),
}

#[derive(Default)]
pub struct PeerBuilder {
    broker: Option<Arc<dyn Broker>>,
    config: Option<PeerConfig>,
    id: Option<PeerId>,
}

impl PeerBuilder {
    pub fn broker(mut self, broker: impl Broker) -> Self {
        self.broker = Some(Arc::new(broker));
        self
    }

    pub fn shared_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Use `config` instead of loading it from the environment.
    pub fn config(mut self, config: PeerConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn id(mut self, id: PeerId) -> Self {
        self.id = Some(id);
        self
    }

    /// Start every component and the peer itself.
    pub async fn build(self) -> Result<Peer, PeerError> {
        let broker = self.broker.ok_or(PeerError::MissingBroker)?;
        let runtime = Handle::try_current()?;
        let config = match self.config {
            Some(config) => PeerConfig::extract_from(config)?,
            None => PeerConfig::from_env()?,
        };
        let id = self.id.unwrap_or_else(PeerId::generate);

        let pool = ChannelPool::new(ChannelManager::new(broker.clone()), config.channel_pool_size);
        let sessions = Arc::new(local::Store::new(id, runtime));
        let mut started = StartGuard::default();

        let invoker = Invoker::start(id, &broker, pool.clone(), config.default_timeout())?;
        started.push(invoker.handle());

        let client = Arc::new(remote::Client::new(invoker.clone()));
        let remote = remote::Store::start(client, config.prune_interval());
        started.push(remote.handle());

        let revisions: Arc<dyn RevisionStore> = Arc::new(
            Aggregator::new(id)
                .with_local(sessions.clone())
                .with_remote(remote.clone()),
        );

        let server = Server::start(
            id,
            broker.clone(),
            pool.clone(),
            revisions.clone(),
            config.command_workers,
        )?;
        started.push(server.handle());

        let listener = Listener::start(
            id,
            broker.clone(),
            sessions.clone(),
            revisions.clone(),
            config.session_workers,
        )?;
        started.push(listener.handle());

        server
            .listen_internal(
                SESSION_NAMESPACE,
                Arc::new(remote::SessionService::new(sessions.clone())),
            )
            .await?;

        let supervisor = Supervisor {
            server: server.clone(),
            invoker: invoker.clone(),
            listener: listener.clone(),
            remote: remote.clone(),
            sessions: sessions.clone(),
        };
        let handle = service::spawn("peer", Signals::new(), supervisor, PeerState::Running);
        started.disarm();

        info!(target: TARGET, peer = %id, product = %config.product, "peer started");
        Ok(Peer {
            inner: Arc::new(PeerInner {
                id,
                config,
                sessions,
                invoker,
                remote,
                revisions,
                server,
                notifier: Arc::new(Notifier::new(pool)),
                listener,
                handle,
            }),
        })
    }
}

/// Stops already started components if building the peer fails.
#[derive(Default)]
struct StartGuard(Vec<ServiceHandle>);

impl StartGuard {
    fn push(&mut self, handle: &ServiceHandle) {
        self.0.push(handle.clone());
    }

    fn disarm(mut self) {
        self.0.clear();
    }
}

impl Drop for StartGuard {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.stop();
        }
    }
}

#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

struct PeerInner {
    id: PeerId,
    config: PeerConfig,
    sessions: Arc<local::Store>,
    invoker: Arc<Invoker>,
    remote: Arc<remote::Store>,
    revisions: Arc<dyn RevisionStore>,
    server: Arc<Server>,
    notifier: Arc<Notifier>,
    listener: Arc<Listener>,
    handle: ServiceHandle,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.inner.id)
            .field("phase", &self.inner.handle.phase())
            .finish()
    }
}

impl Peer {
    pub fn builder() -> PeerBuilder {
        PeerBuilder::default()
    }

    pub fn id(&self) -> PeerId {
        self.inner.id
    }

    pub fn config(&self) -> &PeerConfig {
        &self.inner.config
    }

    /// Create a new session owned by this peer. May be called from any
    /// thread; the session's tasks run on the runtime the peer was built on.
    pub fn session(&self) -> Result<Session, SessionError> {
        if !self.inner.handle.phase().accepts_new_work() {
            return Err(Stopped.into());
        }
        let catalog = self.inner.sessions.create();
        let id = catalog.id();

        let watched = catalog.clone();
        let invoker = self.inner.invoker.clone();
        let listener = self.inner.listener.clone();
        self.inner.sessions.runtime().spawn(async move {
            watched.closed().await;
            listener.unlisten_all(id);
            let _ = invoker.set_async_handler(id, None);
        });

        debug!(target: TARGET, session = %id, "session created");
        Ok(Session::new(
            catalog,
            self.inner.invoker.clone(),
            self.inner.notifier.clone(),
            self.inner.listener.clone(),
        ))
    }

    /// A view of any session, local or remote, at `reference`.
    pub fn revision(&self, reference: Ref) -> Result<Arc<dyn Revision>, SessionError> {
        self.inner.revisions.get_revision(reference)
    }

    /// Handle commands on `ns`. Returns `false` if this replaced a handler.
    pub async fn listen(
        &self,
        ns: &str,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<bool, ServerError> {
        self.inner.server.listen(ns, handler).await
    }

    pub async fn unlisten(&self, ns: &str) -> Result<bool, ServerError> {
        self.inner.server.unlisten(ns).await
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.inner.server
    }

    pub fn invoker(&self) -> &Arc<Invoker> {
        &self.inner.invoker
    }

    pub fn listener(&self) -> &Arc<Listener> {
        &self.inner.listener
    }

    pub fn local_sessions(&self) -> &Arc<local::Store> {
        &self.inner.sessions
    }

    pub fn remote_sessions(&self) -> &Arc<remote::Store> {
        &self.inner.remote
    }

    pub fn handle(&self) -> &ServiceHandle {
        &self.inner.handle
    }

    pub fn stop(&self) {
        self.inner.handle.stop();
    }

    pub fn graceful_stop(&self) {
        self.inner.handle.graceful_stop();
    }

    pub async fn done(&self) {
        self.inner.handle.done().await
    }

    pub fn err(&self) -> Option<Arc<anyhow::Error>> {
        self.inner.handle.err()
    }

    pub async fn wait(&self) -> Result<(), Arc<anyhow::Error>> {
        self.inner.handle.wait().await
    }
}

#[derive(Debug)]
enum PeerState {
    Running,
    Draining,
    Stopping,
}

struct Supervisor {
    server: Arc<Server>,
    invoker: Arc<Invoker>,
    listener: Arc<Listener>,
    remote: Arc<remote::Store>,
    sessions: Arc<local::Store>,
}

impl Supervisor {
    fn children(&self) -> [&ServiceHandle; 4] {
        [
            self.server.handle(),
            self.invoker.handle(),
            self.listener.handle(),
            self.remote.handle(),
        ]
    }
}

#[async_trait]
impl Machine for Supervisor {
    type State = PeerState;

    async fn run_state(
        &mut self,
        state: PeerState,
        signals: &Signals,
    ) -> anyhow::Result<Option<PeerState>> {
        match state {
            PeerState::Running => {
                let children = self.children();
                let any_done = select_all(children.iter().map(|h| Box::pin(h.done())));
                tokio::select! {
                    biased;
                    _ = signals.forceful() => Ok(Some(PeerState::Stopping)),
                    _ = signals.graceful() => Ok(Some(PeerState::Draining)),
                    (_, index, _) = any_done => {
                        warn!(target: TARGET, component = children[index].name(), "component stopped unexpectedly");
                        Ok(Some(PeerState::Stopping))
                    }
                }
            }
            PeerState::Draining => {
                let server = self.server.handle();
                server.graceful_stop();
                tokio::select! {
                    biased;
                    _ = signals.forceful() => return Ok(Some(PeerState::Stopping)),
                    _ = server.done() => {}
                }

                let rest = [
                    self.invoker.handle(),
                    self.listener.handle(),
                    self.remote.handle(),
                ];
                for child in rest {
                    child.graceful_stop();
                }
                tokio::select! {
                    biased;
                    _ = signals.forceful() => Ok(Some(PeerState::Stopping)),
                    _ = join_all(rest.iter().map(|h| h.done())) => Ok(None),
                }
            }
            PeerState::Stopping => {
                let children = self.children();
                for child in children {
                    child.stop();
                }
                join_all(children.iter().map(|h| h.done())).await;
                Ok(None)
            }
        }
    }

    async fn finalize(&mut self, result: anyhow::Result<()>) -> anyhow::Result<()> {
        self.sessions.close_all();
        let failed = self
            .children()
            .into_iter()
            .find_map(|h| h.err().map(|e| (h.name(), e)));
        match (result, failed) {
            (Ok(()), Some((name, e))) => Err(anyhow::anyhow!("{name} failed: {e}")),
            (result, _) => result,
        }
    }
}
