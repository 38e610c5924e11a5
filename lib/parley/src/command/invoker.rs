// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Outbound command calls and response correlation.
//!
//! Every blocking call registers a reply slot, keyed by [`MessageId`], with a
//! single dispatch loop that also consumes this peer's reply queue. The
//! pending table is owned by that loop and changed only through its mailbox,
//! so it needs no lock. A caller that stops waiting (cancellation, deadline,
//! or a dropped future) deregisters its slot, so abandoned calls do not leak.
//!
//! Responses to async calls carry no slot; they are routed by the session id
//! encoded in the message id to a per-session [`AsyncHandler`] and run on a
//! background task.
//!
//! On graceful stop the loop refuses new calls and keeps resolving responses
//! until every pending call has settled. On forceful stop every waiter gets
//! [`CallError::Canceled`].

use super::failure::CallError;
use super::protocol::{self, RequestHeader, ReplyMode};
use crate::broker::{self, Broker, ChannelPool, Delivery, Destination, Source, Subscription};

use async_trait::async_trait;
use parley_common::{namespace, MessageId, Payload, PeerId, RequestContext, SessionId};
use parley_runtime::service::{self, Machine, Mailbox, Poster, ServiceHandle, Signals};
use parley_runtime::Stopped;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};

const TARGET: &str = "parley::invoker";

/// Response to an async call.
#[derive(Debug)]
pub struct AsyncResponse {
    pub id: MessageId,
    pub namespace: String,
    pub command: String,
    pub result: Result<Payload, CallError>,
}

/// Receives responses to async calls made by one session.
#[async_trait]
pub trait AsyncHandler: Send + Sync + 'static {
    async fn handle(&self, response: AsyncResponse);
}

struct AsyncHandlerFn<F>(F);

#[async_trait]
impl<F, Fut> AsyncHandler for AsyncHandlerFn<F>
where
    F: Fn(AsyncResponse) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, response: AsyncResponse) {
        (self.0)(response).await
    }
}

/// Wrap a closure as an [`AsyncHandler`].
pub fn async_handler<F, Fut>(f: F) -> Arc<dyn AsyncHandler>
where
    F: Fn(AsyncResponse) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(AsyncHandlerFn(f))
}

type ReplySlot = oneshot::Sender<Result<Payload, CallError>>;

enum InvokerCommand {
    Register { id: MessageId, reply: ReplySlot },
    Deregister { id: MessageId },
    SetAsyncHandler {
        session: SessionId,
        handler: Option<Arc<dyn AsyncHandler>>,
    },
    PendingCalls { reply: oneshot::Sender<usize> },
}

pub struct Invoker {
    peer_id: PeerId,
    poster: Poster<InvokerCommand>,
    pool: Arc<ChannelPool>,
    default_timeout: Duration,
    forceful: CancellationToken,
    handle: ServiceHandle,
}

impl Invoker {
    /// Subscribe to this peer's reply queue and start the dispatch loop.
    pub fn start(
        peer_id: PeerId,
        broker: &Arc<dyn Broker>,
        pool: Arc<ChannelPool>,
        default_timeout: Duration,
    ) -> Result<Arc<Self>, CallError> {
        let replies = broker.subscribe(Source::Replies(peer_id))?;
        let signals = Signals::new();
        let (poster, mailbox) = service::mailbox(&signals);
        let forceful = signals.forceful_token();

        let dispatch = DispatchLoop {
            peer_id,
            mailbox,
            replies,
            pending: HashMap::new(),
            handlers: HashMap::new(),
            tracker: TaskTracker::new(),
        };
        let handle = service::spawn("invoker", signals, dispatch, LoopState::Running);

        Ok(Arc::new(Self {
            peer_id,
            poster,
            pool,
            default_timeout,
            forceful,
            handle,
        }))
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn handle(&self) -> &ServiceHandle {
        &self.handle
    }

    /// Call a command on one specific peer and wait for its response.
    pub async fn call_unicast(
        &self,
        ctx: &RequestContext,
        id: MessageId,
        target: PeerId,
        namespace: &str,
        command: &str,
        payload: Payload,
    ) -> Result<Payload, CallError> {
        self.call(ctx, id, Destination::Peer(target), namespace, command, payload)
            .await
    }

    /// Call a command on any peer listening on `namespace` and wait for its
    /// response.
    pub async fn call_balanced(
        &self,
        ctx: &RequestContext,
        id: MessageId,
        namespace: &str,
        command: &str,
        payload: Payload,
    ) -> Result<Payload, CallError> {
        self.call(
            ctx,
            id,
            Destination::Balanced(namespace.to_string()),
            namespace,
            command,
            payload,
        )
        .await
    }

    /// Send a balanced request whose response goes to the session's async
    /// handler. Errors only reflect send failure.
    pub fn call_balanced_async(
        &self,
        ctx: &RequestContext,
        id: MessageId,
        namespace: &str,
        command: &str,
        payload: Payload,
    ) -> Result<(), CallError> {
        self.send(
            ctx,
            id,
            Destination::Balanced(namespace.to_string()),
            namespace,
            command,
            payload,
            ReplyMode::Uncorrelated,
        )
    }

    /// Send a balanced request that expects no response.
    pub fn execute_balanced(
        &self,
        ctx: &RequestContext,
        id: MessageId,
        namespace: &str,
        command: &str,
        payload: Payload,
    ) -> Result<(), CallError> {
        self.send(
            ctx,
            id,
            Destination::Balanced(namespace.to_string()),
            namespace,
            command,
            payload,
            ReplyMode::None,
        )
    }

    /// Send a request to every peer listening on `namespace`, expecting no
    /// response.
    pub fn execute_multicast(
        &self,
        ctx: &RequestContext,
        id: MessageId,
        namespace: &str,
        command: &str,
        payload: Payload,
    ) -> Result<(), CallError> {
        self.send(
            ctx,
            id,
            Destination::Multicast(namespace.to_string()),
            namespace,
            command,
            payload,
            ReplyMode::None,
        )
    }

    /// Install (or with `None`, remove) the handler for async responses to
    /// calls made by `session`.
    pub fn set_async_handler(
        &self,
        session: SessionId,
        handler: Option<Arc<dyn AsyncHandler>>,
    ) -> Result<(), Stopped> {
        self.poster
            .post(InvokerCommand::SetAsyncHandler { session, handler })
    }

    /// Number of blocking calls still waiting for a response.
    pub async fn pending_calls(&self) -> Result<usize, Stopped> {
        let (tx, rx) = oneshot::channel();
        self.poster.post(InvokerCommand::PendingCalls { reply: tx })?;
        rx.await.map_err(|_| Stopped)
    }

    fn deadline(&self, ctx: &RequestContext) -> Instant {
        ctx.get_deadline()
            .unwrap_or_else(|| Instant::now() + self.default_timeout)
    }

    async fn call(
        &self,
        ctx: &RequestContext,
        id: MessageId,
        to: Destination,
        namespace: &str,
        command: &str,
        payload: Payload,
    ) -> Result<Payload, CallError> {
        namespace::validate_internal(namespace)?;
        if let Some(e) = ctx.err() {
            return Err(e.into());
        }

        let (tx, rx) = oneshot::channel();
        self.poster
            .post_before_drain(InvokerCommand::Register { id, reply: tx })?;
        let guard = SlotGuard {
            poster: self.poster.clone(),
            id,
            armed: true,
        };

        let request = RequestHeader {
            id,
            namespace: namespace.to_string(),
            command: command.to_string(),
            deadline: self.deadline(ctx),
            reply: ReplyMode::Correlated,
            multicast: false,
        };
        broker::publish(&self.pool, &to, protocol::encode_request(&request, payload))?;
        trace!(target: TARGET, %id, namespace, command, "sent call");

        tokio::select! {
            reply = rx => {
                guard.disarm();
                reply.unwrap_or(Err(CallError::Canceled))
            }
            _ = ctx.token().cancelled() => Err(CallError::Canceled),
            _ = tokio::time::sleep_until(request.deadline) => Err(CallError::DeadlineExceeded),
            _ = self.forceful.cancelled() => Err(CallError::Canceled),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn send(
        &self,
        ctx: &RequestContext,
        id: MessageId,
        to: Destination,
        namespace: &str,
        command: &str,
        payload: Payload,
        reply: ReplyMode,
    ) -> Result<(), CallError> {
        namespace::validate_internal(namespace)?;
        if !self.handle.phase().accepts_new_work() {
            return Err(Stopped.into());
        }
        let request = RequestHeader {
            id,
            namespace: namespace.to_string(),
            command: command.to_string(),
            deadline: self.deadline(ctx),
            reply,
            multicast: matches!(to, Destination::Multicast(_)),
        };
        broker::publish(&self.pool, &to, protocol::encode_request(&request, payload))?;
        trace!(target: TARGET, %id, namespace, command, reply = %reply, "sent request");
        Ok(())
    }
}

/// Deregisters a reply slot when the waiting call goes away without a reply.
struct SlotGuard {
    poster: Poster<InvokerCommand>,
    id: MessageId,
    armed: bool,
}

impl SlotGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.poster.post(InvokerCommand::Deregister { id: self.id });
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
    mailbox: Mailbox<InvokerCommand>,
    replies: Subscription,
    pending: HashMap<MessageId, ReplySlot>,
    handlers: HashMap<SessionId, Arc<dyn AsyncHandler>>,
    tracker: TaskTracker,
}

impl DispatchLoop {
    fn apply(&mut self, command: InvokerCommand) {
        match command {
            InvokerCommand::Register { id, reply } => {
                if self.pending.insert(id, reply).is_some() {
                    warn!(target: TARGET, %id, "replaced pending call with duplicate message id");
                }
            }
            InvokerCommand::Deregister { id } => {
                if self.pending.remove(&id).is_some() {
                    trace!(target: TARGET, %id, "abandoned call");
                }
            }
            InvokerCommand::SetAsyncHandler { session, handler } => match handler {
                Some(h) => {
                    self.handlers.insert(session, h);
                }
                None => {
                    self.handlers.remove(&session);
                }
            },
            InvokerCommand::PendingCalls { reply } => {
                let _ = reply.send(self.pending.len());
            }
        }
    }

    fn deliver(&mut self, delivery: Delivery) {
        let (response, outcome) = match protocol::decode_response(&delivery.message) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(target: TARGET, peer = %self.peer_id, error = %e, "dropping malformed response");
                delivery.reject();
                return;
            }
        };
        delivery.ack();

        match response.reply {
            ReplyMode::Correlated => match self.pending.remove(&response.id) {
                Some(slot) => {
                    let _ = slot.send(outcome.into_result());
                }
                None => {
                    debug!(target: TARGET, id = %response.id, "discarding response to abandoned call")
                }
            },
            ReplyMode::Uncorrelated => match self.handlers.get(&response.id.session()) {
                Some(handler) => {
                    let handler = handler.clone();
                    let response = AsyncResponse {
                        id: response.id,
                        namespace: response.namespace,
                        command: response.command,
                        result: outcome.into_result(),
                    };
                    self.tracker.spawn(async move { handler.handle(response).await });
                }
                None => {
                    debug!(target: TARGET, id = %response.id, "no async handler for response")
                }
            },
            ReplyMode::None => {
                debug!(target: TARGET, id = %response.id, "ignoring unsolicited response")
            }
        }
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
                    delivery = self.replies.recv() => match delivery {
                        Some(d) => self.deliver(d),
                        None => anyhow::bail!("reply queue for {} closed", self.peer_id),
                    },
                    _ = signals.graceful() => {
                        debug!(target: TARGET, pending = self.pending.len(), "draining pending calls");
                        return Ok(Some(LoopState::Draining));
                    }
                }
            },
            LoopState::Draining => {
                while !self.pending.is_empty() {
                    tokio::select! {
                        biased;
                        _ = signals.forceful() => return Ok(None),
                        Some(command) = self.mailbox.recv() => self.apply(command),
                        Some(d) = self.replies.recv() => self.deliver(d),
                    }
                }
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
        for (_, slot) in self.pending.drain() {
            let _ = slot.send(Err(CallError::Canceled));
        }
        self.handlers.clear();
        self.tracker.close();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{ChannelManager, Message, MemoryBroker};
    use crate::command::protocol::{Outcome, ResponseHeader};

    struct Fixture {
        broker: MemoryBroker,
        invoker: Arc<Invoker>,
        pool: Arc<ChannelPool>,
        caller: SessionId,
        target: PeerId,
        inbox: Subscription,
    }

    fn fixture(timeout: Duration) -> Fixture {
        let broker = MemoryBroker::new();
        let dyn_broker: Arc<dyn Broker> = Arc::new(broker.clone());
        let pool = ChannelPool::new(ChannelManager::new(dyn_broker.clone()), 4);
        let peer = PeerId::new(1, 1);
        let target = PeerId::new(2, 2);
        let inbox = broker.subscribe(Source::PeerCommands(target)).unwrap();
        let invoker = Invoker::start(peer, &dyn_broker, pool.clone(), timeout).unwrap();
        Fixture {
            broker,
            invoker,
            pool,
            caller: peer.session(1),
            target,
            inbox,
        }
    }

    fn reply(pool: &Arc<ChannelPool>, request: &Message, outcome: Outcome) {
        let header = protocol::decode_request(request).unwrap();
        let response = ResponseHeader {
            id: header.id,
            namespace: header.namespace,
            command: header.command,
            reply: header.reply,
        };
        broker::publish(
            pool,
            &Destination::Reply(header.id.peer()),
            protocol::encode_response(&response, outcome),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_unicast_call_resolves() {
        let Fixture {
            broker,
            invoker,
            pool,
            caller,
            target,
            inbox,
        } = fixture(Duration::from_secs(5));
        let id = caller.at(0).message(1);

        let responder = async move {
            let d = inbox.recv().await.unwrap();
            reply(&pool, &d.message, Outcome::Success(Payload::from("pong")));
            d.ack();
        };
        let ctx = RequestContext::background();
        let (result, _) = tokio::join!(
            invoker.call_unicast(&ctx, id, target, "ping", "ping", Payload::from("ping")),
            responder
        );
        assert_eq!(result.unwrap(), Payload::from("pong"));
        assert_eq!(invoker.pending_calls().await.unwrap(), 0);
        assert_eq!(broker.command_count(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_call_releases_slot() {
        let Fixture {
            invoker,
            caller,
            target,
            inbox,
            ..
        } = fixture(Duration::from_secs(30));
        let ctx = RequestContext::background();
        let id = caller.at(0).message(1);

        let canceller = {
            let ctx = ctx.clone();
            async move {
                let _request = inbox.recv().await.unwrap();
                ctx.cancel();
            }
        };
        let (result, _) = tokio::join!(
            invoker.call_unicast(&ctx, id, target, "ns", "cmd", Payload::empty()),
            canceller
        );
        assert!(matches!(result, Err(CallError::Canceled)));
        assert_eq!(invoker.pending_calls().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dropped_call_releases_slot() {
        let Fixture {
            invoker,
            caller,
            target,
            inbox,
            ..
        } = fixture(Duration::from_secs(30));
        let ctx = RequestContext::background();
        let call = invoker.call_unicast(&ctx, caller.at(0).message(1), target, "ns", "cmd", Payload::empty());
        let dropped = tokio::time::timeout(Duration::from_millis(20), call).await;
        assert!(dropped.is_err());
        let _request = inbox.recv().await.unwrap();
        assert_eq!(invoker.pending_calls().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_default_timeout_applies() {
        let Fixture {
            invoker,
            caller,
            target,
            inbox,
            ..
        } = fixture(Duration::from_millis(50));
        let id = caller.at(0).message(1);
        let result = invoker
            .call_unicast(&RequestContext::background(), id, target, "ns", "cmd", Payload::empty())
            .await;
        assert!(matches!(result, Err(CallError::DeadlineExceeded)));
        assert_eq!(invoker.pending_calls().await.unwrap(), 0);

        let request = inbox.recv().await.unwrap();
        let header = protocol::decode_request(&request.message).unwrap();
        assert_eq!(header.reply, ReplyMode::Correlated);
        assert_eq!(header.id, id);
    }

    #[tokio::test]
    async fn test_async_response_routed_by_session() {
        let Fixture {
            broker,
            invoker,
            pool,
            caller,
            ..
        } = fixture(Duration::from_secs(5));
        let (tx, rx) = flume::unbounded();
        invoker
            .set_async_handler(
                caller,
                Some(async_handler(move |response: AsyncResponse| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(response);
                    }
                })),
            )
            .unwrap();

        let balanced = broker
            .subscribe(Source::BalancedCommands("jobs".into()))
            .unwrap();
        let id = caller.at(3).message(1);
        invoker
            .call_balanced_async(&RequestContext::background(), id, "jobs", "run", Payload::empty())
            .unwrap();

        let request = balanced.recv().await.unwrap();
        reply(
            &pool,
            &request.message,
            Outcome::Failure(crate::command::Failure::new("busy", "try later")),
        );

        let response = tokio::time::timeout(Duration::from_secs(1), rx.recv_async())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.id, id);
        assert_eq!(response.command, "run");
        assert!(response.result.unwrap_err().is_failure_type("busy"));
    }

    #[tokio::test]
    async fn test_execute_sends_without_reply() {
        let Fixture {
            broker,
            invoker,
            caller,
            ..
        } = fixture(Duration::from_secs(5));
        let balanced = broker
            .subscribe(Source::BalancedCommands("jobs".into()))
            .unwrap();
        invoker
            .execute_balanced(&RequestContext::background(), caller.at(0).message(1), "jobs", "run", Payload::empty())
            .unwrap();
        let request = balanced.recv().await.unwrap();
        let header = protocol::decode_request(&request.message).unwrap();
        assert_eq!(header.reply, ReplyMode::None);
        assert!(!header.multicast);
    }

    #[tokio::test]
    async fn test_forceful_stop_cancels_waiters() {
        let Fixture {
            invoker,
            caller,
            target,
            inbox,
            ..
        } = fixture(Duration::from_secs(30));
        let id = caller.at(0).message(1);
        let call = {
            let invoker = invoker.clone();
            tokio::spawn(async move {
                invoker
                    .call_unicast(&RequestContext::background(), id, target, "ns", "cmd", Payload::empty())
                    .await
            })
        };

        let _request = inbox.recv().await.unwrap();
        invoker.handle().stop();
        let result = call.await.unwrap();
        assert!(matches!(result, Err(CallError::Canceled)));
        invoker.handle().done().await;
    }

    #[tokio::test]
    async fn test_graceful_stop_waits_for_pending_call() {
        let Fixture {
            invoker,
            pool,
            caller,
            target,
            inbox,
            ..
        } = fixture(Duration::from_secs(30));
        let id = caller.at(0).message(1);
        let call = {
            let invoker = invoker.clone();
            tokio::spawn(async move {
                invoker
                    .call_unicast(&RequestContext::background(), id, target, "ns", "cmd", Payload::empty())
                    .await
            })
        };

        let request = inbox.recv().await.unwrap();
        invoker.handle().graceful_stop();

        let refused = invoker
            .call_unicast(
                &RequestContext::background(),
                caller.at(0).message(2),
                target,
                "ns",
                "cmd",
                Payload::empty(),
            )
            .await;
        assert!(matches!(refused, Err(CallError::Stopped(_))));
        assert!(!invoker.handle().is_done());

        reply(&pool, &request.message, Outcome::Success(Payload::from("late")));
        assert_eq!(call.await.unwrap().unwrap(), Payload::from("late"));
        invoker.handle().wait().await.unwrap();
    }
}
