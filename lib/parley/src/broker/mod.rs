// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Message broker abstraction.
//!
//! Components never talk to a concrete transport. They publish [`Message`]s to
//! a [`Destination`] through a pooled [`Channel`], and consume [`Delivery`]s
//! from a [`Subscription`] on a [`Source`]. The topology is AMQP-like:
//!
//! - every peer has a direct command queue, a reply queue and a notification
//!   queue;
//! - every namespace has a balanced command queue shared by all peers that
//!   listen on it (competing consumers);
//! - multicast commands and notifications are copied to the direct queues of
//!   the peers bound to the namespace.

pub mod memory;

pub use memory::MemoryBroker;

use parley_common::{Payload, PeerId};
use parley_runtime::{Manage, Pool};
use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("broker is closed")]
    Closed,

    #[error("no route to {0}")]
    NoRoute(String),

    #[error("channel is closed")]
    ChannelClosed,

    #[error("transport error: {0}")]
    Other(String),
}

/// Where a message is published.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    /// Command request for one specific peer.
    Peer(PeerId),
    /// Command request for any one peer listening on the namespace.
    Balanced(String),
    /// Command request for every peer listening on the namespace.
    Multicast(String),
    /// Command response for the peer that sent the request.
    Reply(PeerId),
    /// Notification for sessions owned by one peer.
    NotifyPeer(PeerId),
    /// Notification for every peer listening on the namespace.
    NotifyMulticast(String),
}

/// What a subscription consumes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Source {
    PeerCommands(PeerId),
    BalancedCommands(String),
    Replies(PeerId),
    Notifications(PeerId),
}

/// Namespace bindings that route multicast traffic to a peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Binding {
    Commands(String),
    Notifications(String),
}

/// A message: string headers plus an opaque payload.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub headers: HashMap<String, String>,
    pub payload: Payload,
}

impl Message {
    pub fn new(payload: Payload) -> Self {
        Self {
            headers: HashMap::new(),
            payload,
        }
    }

    pub fn with_header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.headers.insert(key.to_string(), value.into());
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}

/// Settles a delivery with the broker.
pub trait Acknowledger: Send + Sync {
    fn ack(&self);
    fn nack(&self, message: Message, requeue: bool);
}

/// A message received from a subscription. Dropping an unsettled delivery
/// acknowledges it.
pub struct Delivery {
    pub message: Message,
    pub redelivered: bool,
    acker: Option<Box<dyn Acknowledger>>,
}

impl Delivery {
    pub fn new(message: Message, redelivered: bool, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            message,
            redelivered,
            acker: Some(acker),
        }
    }

    pub fn ack(mut self) {
        if let Some(acker) = self.acker.take() {
            acker.ack();
        }
    }

    /// Negative acknowledgement. With `requeue` the message is offered again,
    /// possibly to another consumer, and flagged as redelivered.
    pub fn nack(mut self, requeue: bool) {
        if let Some(acker) = self.acker.take() {
            acker.nack(self.message.clone(), requeue);
        }
    }

    /// Negative acknowledgement without requeue.
    pub fn reject(self) {
        self.nack(false)
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if let Some(acker) = self.acker.take() {
            acker.ack();
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// A stream of deliveries. Dropping it detaches the consumer.
pub struct Subscription {
    rx: flume::Receiver<Delivery>,
    _guard: Option<Box<dyn Send + Sync>>,
}

impl Subscription {
    pub fn new(rx: flume::Receiver<Delivery>) -> Self {
        Self { rx, _guard: None }
    }

    /// Attach a value that lives as long as the subscription, e.g. a consumer
    /// registration that is released on drop.
    pub fn with_guard(mut self, guard: impl Send + Sync + 'static) -> Self {
        self._guard = Some(Box::new(guard));
        self
    }

    pub async fn recv(&self) -> Option<Delivery> {
        self.rx.recv_async().await.ok()
    }

    pub fn into_stream(self) -> BoxStream<'static, Delivery> {
        let Subscription { rx, _guard } = self;
        rx.into_stream()
            .map(move |d| {
                let _ = &_guard;
                d
            })
            .boxed()
    }
}

/// Publishing side of a broker connection.
pub trait Channel: Send + Sync {
    fn publish(&self, to: &Destination, message: Message) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;
}

pub trait Broker: Send + Sync + 'static {
    fn open_channel(&self) -> Result<Box<dyn Channel>, TransportError>;

    fn subscribe(&self, source: Source) -> Result<Subscription, TransportError>;

    /// Route multicast traffic for `binding` to `peer`. Returns `false` when
    /// the binding already existed.
    fn bind(&self, peer: PeerId, binding: Binding) -> Result<bool, TransportError>;

    /// Returns `false` when there was no such binding.
    fn unbind(&self, peer: PeerId, binding: Binding) -> Result<bool, TransportError>;
}

/// Opens broker channels for the [`ChannelPool`].
pub struct ChannelManager {
    broker: Arc<dyn Broker>,
}

impl ChannelManager {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }
}

impl Manage for ChannelManager {
    type Resource = Box<dyn Channel>;
    type Error = TransportError;

    fn create(&self) -> Result<Self::Resource, Self::Error> {
        self.broker.open_channel()
    }

    fn is_reusable(&self, channel: &Self::Resource) -> bool {
        channel.is_open()
    }
}

pub type ChannelPool = Pool<ChannelManager>;

/// Publish through a pooled channel. A channel that fails is discarded.
pub fn publish(
    pool: &Arc<ChannelPool>,
    to: &Destination,
    message: Message,
) -> Result<(), TransportError> {
    let channel = pool.get()?;
    match channel.publish(to, message) {
        Ok(()) => Ok(()),
        Err(e) => {
            channel.discard();
            Err(e)
        }
    }
}
