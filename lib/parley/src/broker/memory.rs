// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-process broker.
//!
//! Queues are unbounded flume channels, so several subscribers on one queue
//! compete for messages. Direct queues (peer commands, replies and
//! notifications) only exist once their owner has subscribed; publishing to a
//! missing one fails with [`TransportError::NoRoute`]. Balanced namespace
//! queues are created on first use and hold messages until a consumer arrives.

use super::{
    Acknowledger, Binding, Broker, Channel, Delivery, Destination, Message, Source,
    Subscription, TransportError,
};
use parking_lot::Mutex;
use parley_common::PeerId;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    closed: AtomicBool,
    queues: Mutex<HashMap<Source, Queue>>,
    bindings: Mutex<HashMap<Binding, HashSet<PeerId>>>,
    published: AtomicUsize,
    commands: AtomicUsize,
}

#[derive(Clone)]
struct Queue {
    tx: flume::Sender<Delivery>,
    rx: flume::Receiver<Delivery>,
}

impl Queue {
    fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self { tx, rx }
    }

    fn push(&self, message: Message, redelivered: bool) -> Result<(), TransportError> {
        let acker = Box::new(MemoryAcker {
            tx: self.tx.clone(),
        });
        self.tx
            .send(Delivery::new(message, redelivered, acker))
            .map_err(|_| TransportError::Closed)
    }
}

struct MemoryAcker {
    tx: flume::Sender<Delivery>,
}

impl Acknowledger for MemoryAcker {
    fn ack(&self) {}

    fn nack(&self, message: Message, requeue: bool) {
        if requeue {
            let acker = Box::new(MemoryAcker {
                tx: self.tx.clone(),
            });
            let _ = self.tx.send(Delivery::new(message, true, acker));
        }
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of messages published.
    pub fn publish_count(&self) -> usize {
        self.inner.published.load(Ordering::SeqCst)
    }

    /// Number of command requests published (unicast, balanced or multicast).
    pub fn command_count(&self) -> usize {
        self.inner.commands.load(Ordering::SeqCst)
    }

    /// Messages waiting in a queue.
    pub fn queued(&self, source: &Source) -> usize {
        self.inner
            .queues
            .lock()
            .get(source)
            .map(|q| q.rx.len())
            .unwrap_or(0)
    }

    /// Close the broker. Channels stop accepting messages and queues are
    /// released once drained.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.queues.lock().clear();
        self.inner.bindings.lock().clear();
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn declared(&self, source: &Source) -> Result<Queue, TransportError> {
        self.inner
            .queues
            .lock()
            .get(source)
            .cloned()
            .ok_or_else(|| TransportError::NoRoute(format!("{source:?}")))
    }

    fn declare(&self, source: Source) -> Queue {
        self.inner
            .queues
            .lock()
            .entry(source)
            .or_insert_with(Queue::new)
            .clone()
    }

    fn bound(&self, binding: &Binding) -> Vec<PeerId> {
        self.inner
            .bindings
            .lock()
            .get(binding)
            .map(|peers| peers.iter().copied().collect())
            .unwrap_or_default()
    }

    fn route(&self, to: &Destination, message: Message) -> Result<(), TransportError> {
        match to {
            Destination::Peer(peer) => self
                .declared(&Source::PeerCommands(*peer))?
                .push(message, false),
            Destination::Balanced(ns) => self
                .declare(Source::BalancedCommands(ns.clone()))
                .push(message, false),
            Destination::Multicast(ns) => {
                for peer in self.bound(&Binding::Commands(ns.clone())) {
                    if let Ok(queue) = self.declared(&Source::PeerCommands(peer)) {
                        queue.push(message.clone(), false)?;
                    }
                }
                Ok(())
            }
            Destination::Reply(peer) => self
                .declared(&Source::Replies(*peer))?
                .push(message, false),
            Destination::NotifyPeer(peer) => self
                .declared(&Source::Notifications(*peer))?
                .push(message, false),
            Destination::NotifyMulticast(ns) => {
                for peer in self.bound(&Binding::Notifications(ns.clone())) {
                    if let Ok(queue) = self.declared(&Source::Notifications(peer)) {
                        queue.push(message.clone(), false)?;
                    }
                }
                Ok(())
            }
        }
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
}

impl Channel for MemoryChannel {
    fn publish(&self, to: &Destination, message: Message) -> Result<(), TransportError> {
        if self.broker.is_closed() {
            return Err(TransportError::ChannelClosed);
        }
        let inner = &self.broker.inner;
        inner.published.fetch_add(1, Ordering::SeqCst);
        if matches!(
            to,
            Destination::Peer(_) | Destination::Balanced(_) | Destination::Multicast(_)
        ) {
            inner.commands.fetch_add(1, Ordering::SeqCst);
        }
        self.broker.route(to, message)
    }

    fn is_open(&self) -> bool {
        !self.broker.is_closed()
    }
}

impl Broker for MemoryBroker {
    fn open_channel(&self) -> Result<Box<dyn Channel>, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        Ok(Box::new(MemoryChannel {
            broker: self.clone(),
        }))
    }

    fn subscribe(&self, source: Source) -> Result<Subscription, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        Ok(Subscription::new(self.declare(source).rx))
    }

    fn bind(&self, peer: PeerId, binding: Binding) -> Result<bool, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        Ok(self
            .inner
            .bindings
            .lock()
            .entry(binding)
            .or_default()
            .insert(peer))
    }

    fn unbind(&self, peer: PeerId, binding: Binding) -> Result<bool, TransportError> {
        let mut bindings = self.inner.bindings.lock();
        let Some(peers) = bindings.get_mut(&binding) else {
            return Ok(false);
        };
        let removed = peers.remove(&peer);
        if peers.is_empty() {
            bindings.remove(&binding);
        }
        Ok(removed)
    }
}
