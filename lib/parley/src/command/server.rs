// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Inbound command dispatch.
//!
//! The server consumes this peer's direct command queue plus one balanced
//! queue per namespace it listens on. Handlers are kept in a [`DashMap`] so
//! that re-registering a namespace only swaps the handler; subscriptions are
//! changed by the dispatch loop through its mailbox.
//!
//! Each valid request runs on its own task with a context that carries the
//! request deadline and is cancelled by a forceful stop. A handler that
//! returns without closing its [`Response`] has its request redelivered when
//! it arrived on a balanced queue, and abandoned otherwise.

use super::failure::{CommandError, Failure};
use super::protocol::{self, Outcome, ReplyMode, RequestHeader, ResponseHeader};
use crate::broker::{
    self, Binding, Broker, ChannelPool, Delivery, Destination, Source, TransportError,
};
use crate::session::{Revision, RevisionStore};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::BoxStream;
use parley_common::{namespace, MessageId, NamespaceError, Payload, PeerId, RequestContext};
use parley_runtime::service::{self, Machine, Mailbox, Poster, ServiceHandle, Signals};
use parley_runtime::Stopped;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Semaphore};
use tokio::time::Instant;
use tokio_stream::{StreamExt, StreamMap};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};

const TARGET: &str = "parley::server";

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Namespace(#[from] NamespaceError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Stopped(#[from] Stopped),
}

/// A command request as seen by a handler.
pub struct Request {
    pub id: MessageId,
    /// The calling session at the revision the request was sent from.
    pub source: Arc<dyn Revision>,
    pub namespace: String,
    pub command: String,
    pub payload: Payload,
    pub is_multicast: bool,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("namespace", &self.namespace)
            .field("command", &self.command)
            .field("payload", &self.payload)
            .field("is_multicast", &self.is_multicast)
            .finish()
    }
}

/// Handles commands for one namespace.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: RequestContext, request: Request, response: Response);
}

struct CommandHandlerFn<F>(F);

#[async_trait]
impl<F, Fut> CommandHandler for CommandHandlerFn<F>
where
    F: Fn(RequestContext, Request, Response) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, ctx: RequestContext, request: Request, response: Response) {
        (self.0)(ctx, request, response).await
    }
}

/// Wrap a closure as a [`CommandHandler`].
pub fn command_handler<F, Fut>(f: F) -> Arc<dyn CommandHandler>
where
    F: Fn(RequestContext, Request, Response) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(CommandHandlerFn(f))
}

/// The answer to one request. Closing it more than once has no effect.
#[derive(Clone)]
pub struct Response {
    inner: Arc<ResponseInner>,
}

struct ResponseInner {
    header: ResponseHeader,
    pool: Arc<ChannelPool>,
    closed: AtomicBool,
}

impl Response {
    pub(crate) fn new(pool: Arc<ChannelPool>, request: &RequestHeader) -> Self {
        Self {
            inner: Arc::new(ResponseInner {
                header: ResponseHeader {
                    id: request.id,
                    namespace: request.namespace.clone(),
                    command: request.command.clone(),
                    reply: request.reply,
                },
                pool,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Whether the caller is waiting for an answer.
    pub fn is_required(&self) -> bool {
        self.inner.header.reply != ReplyMode::None
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Answer with a payload.
    pub fn done(&self, payload: Payload) -> bool {
        self.finish(Outcome::Success(payload))
    }

    /// Answer with an application-defined failure.
    pub fn fail(&self, kind: impl Into<String>, message: impl Into<String>) -> Failure {
        let failure = Failure::new(kind, message);
        self.finish(Outcome::Failure(failure.clone()));
        failure
    }

    /// Answer with an error. A [`Failure`] is sent as such; anything else is
    /// reported as an opaque command error.
    pub fn error(&self, err: impl Into<anyhow::Error>) -> bool {
        let err = err.into();
        match err.downcast::<Failure>() {
            Ok(failure) => self.finish(Outcome::Failure(failure)),
            Err(err) => self.finish(Outcome::Error(CommandError(err.to_string()))),
        }
    }

    /// Answer with an empty payload. Returns `false` if already closed.
    pub fn close(&self) -> bool {
        self.finish(Outcome::Success(Payload::empty()))
    }

    fn finish(&self, outcome: Outcome) -> bool {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            debug!(target: TARGET, id = %self.inner.header.id, "response already closed");
            return false;
        }
        if self.is_required() {
            let header = &self.inner.header;
            let message = protocol::encode_response(header, outcome);
            if let Err(e) =
                broker::publish(&self.inner.pool, &Destination::Reply(header.id.peer()), message)
            {
                warn!(target: TARGET, id = %header.id, error = %e, "failed to send response");
            }
        }
        true
    }
}

enum ServerCommand {
    Subscribe {
        namespace: String,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
    Unsubscribe {
        namespace: String,
        reply: oneshot::Sender<()>,
    },
}

type Handlers = Arc<DashMap<String, Arc<dyn CommandHandler>>>;

pub struct Server {
    peer_id: PeerId,
    handlers: Handlers,
    poster: Poster<ServerCommand>,
    tracker: TaskTracker,
    handle: ServiceHandle,
}

impl Server {
    /// Subscribe to this peer's command queue and start dispatching.
    pub fn start(
        peer_id: PeerId,
        broker: Arc<dyn Broker>,
        pool: Arc<ChannelPool>,
        revisions: Arc<dyn RevisionStore>,
        workers: usize,
    ) -> Result<Arc<Self>, ServerError> {
        let direct = broker.subscribe(Source::PeerCommands(peer_id))?;
        let signals = Signals::new();
        let (poster, mailbox) = service::mailbox(&signals);
        let handlers: Handlers = Arc::new(DashMap::new());
        let tracker = TaskTracker::new();

        let mut feeds = StreamMap::new();
        feeds.insert(Feed::Direct, direct.into_stream());

        let dispatch = DispatchLoop {
            peer_id,
            broker,
            pool,
            revisions,
            mailbox,
            feeds,
            bound: HashSet::new(),
            handlers: handlers.clone(),
            tracker: tracker.clone(),
            shutdown: signals.forceful_token(),
            limiter: Arc::new(Semaphore::new(workers.max(1))),
        };
        let handle = service::spawn("server", signals, dispatch, LoopState::Running);

        Ok(Arc::new(Self {
            peer_id,
            handlers,
            poster,
            tracker,
            handle,
        }))
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn handle(&self) -> &ServiceHandle {
        &self.handle
    }

    /// Number of requests currently being handled.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Start handling commands for `namespace`. Returns `true` if this added a
    /// namespace, `false` if it replaced the handler of an existing one.
    pub async fn listen(
        &self,
        ns: &str,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<bool, ServerError> {
        namespace::validate(ns)?;
        self.listen_internal(ns, handler).await
    }

    /// Like [`listen`](Self::listen) but allows reserved namespaces.
    pub async fn listen_internal(
        &self,
        ns: &str,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<bool, ServerError> {
        namespace::validate_internal(ns)?;
        if self.handlers.insert(ns.to_string(), handler).is_some() {
            return Ok(false);
        }

        let (tx, rx) = oneshot::channel();
        let posted = self.poster.post_before_drain(ServerCommand::Subscribe {
            namespace: ns.to_string(),
            reply: tx,
        });
        let result = match posted {
            Ok(()) => match rx.await {
                Ok(result) => result.map_err(ServerError::from),
                Err(_) => Err(Stopped.into()),
            },
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            self.handlers.remove(ns);
            return Err(e);
        }
        debug!(target: TARGET, peer = %self.peer_id, namespace = ns, "listening");
        Ok(true)
    }

    /// Stop handling commands for `namespace`. Returns `false` if it was not
    /// being handled.
    pub async fn unlisten(&self, ns: &str) -> Result<bool, ServerError> {
        if self.handlers.remove(ns).is_none() {
            return Ok(false);
        }
        let (tx, rx) = oneshot::channel();
        self.poster.post(ServerCommand::Unsubscribe {
            namespace: ns.to_string(),
            reply: tx,
        })?;
        let _ = rx.await;
        debug!(target: TARGET, peer = %self.peer_id, namespace = ns, "stopped listening");
        Ok(true)
    }

    pub fn is_listening(&self, ns: &str) -> bool {
        self.handlers.contains_key(ns)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Feed {
    Direct,
    Balanced(String),
}

#[derive(Debug)]
enum LoopState {
    Running,
    Draining,
}

struct DispatchLoop {
    peer_id: PeerId,
    broker: Arc<dyn Broker>,
    pool: Arc<ChannelPool>,
    revisions: Arc<dyn RevisionStore>,
    mailbox: Mailbox<ServerCommand>,
    feeds: StreamMap<Feed, BoxStream<'static, Delivery>>,
    bound: HashSet<String>,
    handlers: Handlers,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    limiter: Arc<Semaphore>,
}

impl DispatchLoop {
    fn apply(&mut self, command: ServerCommand) {
        match command {
            ServerCommand::Subscribe { namespace, reply } => {
                let _ = reply.send(self.subscribe(namespace));
            }
            ServerCommand::Unsubscribe { namespace, reply } => {
                self.feeds.remove(&Feed::Balanced(namespace.clone()));
                self.unbind(&namespace);
                let _ = reply.send(());
            }
        }
    }

    fn subscribe(&mut self, namespace: String) -> Result<(), TransportError> {
        let subscription = self
            .broker
            .subscribe(Source::BalancedCommands(namespace.clone()))?;
        self.broker
            .bind(self.peer_id, Binding::Commands(namespace.clone()))?;
        self.bound.insert(namespace.clone());
        self.feeds
            .insert(Feed::Balanced(namespace), subscription.into_stream());
        Ok(())
    }

    fn unbind(&mut self, namespace: &str) {
        if self.bound.remove(namespace) {
            if let Err(e) = self
                .broker
                .unbind(self.peer_id, Binding::Commands(namespace.to_string()))
            {
                warn!(target: TARGET, namespace, error = %e, "failed to unbind namespace");
            }
        }
    }

    fn unbind_all(&mut self) {
        let namespaces: Vec<String> = self.bound.iter().cloned().collect();
        for namespace in namespaces {
            self.unbind(&namespace);
        }
    }

    fn dispatch(&self, feed: Feed, delivery: Delivery) {
        let header = match protocol::decode_request(&delivery.message) {
            Ok(header) => header,
            Err(e) => {
                warn!(target: TARGET, peer = %self.peer_id, error = %e, "rejecting malformed request");
                delivery.reject();
                return;
            }
        };

        if header.deadline <= Instant::now() {
            debug!(target: TARGET, id = %header.id, "ignoring expired request");
            delivery.ack();
            return;
        }

        let source = match self.revisions.get_revision(header.id.reference) {
            Ok(source) => source,
            Err(e) => {
                warn!(target: TARGET, id = %header.id, error = %e, "rejecting request from unresolvable source");
                delivery.reject();
                return;
            }
        };

        let balanced = matches!(feed, Feed::Balanced(_)) && !header.multicast;
        let Some(handler) = self
            .handlers
            .get(&header.namespace)
            .map(|h| h.value().clone())
        else {
            debug!(target: TARGET, id = %header.id, namespace = %header.namespace, "no handler for namespace");
            delivery.nack(balanced);
            return;
        };

        let ctx = RequestContext::with_token(self.shutdown.child_token()).deadline(header.deadline);
        let response = Response::new(self.pool.clone(), &header);
        let request = Request {
            id: header.id,
            source,
            namespace: header.namespace,
            command: header.command,
            payload: delivery.message.payload.clone(),
            is_multicast: header.multicast,
        };
        let limiter = self.limiter.clone();

        trace!(target: TARGET, id = %request.id, namespace = %request.namespace, command = %request.command, "dispatching request");
        self.tracker.spawn(async move {
            let _permit = limiter.acquire_owned().await;
            let id = request.id;
            handler.handle(ctx, request, response.clone()).await;

            if response.is_closed() {
                delivery.ack();
            } else if balanced {
                warn!(target: TARGET, %id, "handler did not close response, requeueing request");
                delivery.nack(true);
            } else {
                warn!(target: TARGET, %id, "handler did not close response, abandoning request");
                delivery.reject();
            }
        });
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
                    Some(command) = self.mailbox.recv() => self.apply(command),
                    Some((feed, delivery)) = self.feeds.next(), if !self.feeds.is_empty() => {
                        self.dispatch(feed, delivery)
                    }
                    _ = signals.graceful() => return Ok(Some(LoopState::Draining)),
                }
            },
            LoopState::Draining => {
                debug!(target: TARGET, peer = %self.peer_id, in_flight = self.tracker.len(), "draining");
                self.feeds.clear();
                self.unbind_all();
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
        self.feeds.clear();
        self.unbind_all();
        self.tracker.close();
        self.handlers.clear();
        for command in self.mailbox.drain() {
            if let ServerCommand::Subscribe { reply, .. } = command {
                let _ = reply.send(Err(TransportError::Closed));
            }
        }
        result
    }
}
