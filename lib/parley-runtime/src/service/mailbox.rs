// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Typed command queue into a service's run loop.
//!
//! Commands posted here are executed serially by the loop that owns the
//! [`Mailbox`], so state touched only from that loop needs no lock.

use super::{Signals, Stopped};

/// Create a mailbox whose poster refuses commands once `signals` stop.
pub fn mailbox<C>(signals: &Signals) -> (Poster<C>, Mailbox<C>) {
    let (tx, rx) = flume::unbounded();
    (
        Poster {
            tx,
            signals: signals.clone(),
        },
        Mailbox { rx },
    )
}

pub struct Poster<C> {
    tx: flume::Sender<C>,
    signals: Signals,
}

impl<C> Clone for Poster<C> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            signals: self.signals.clone(),
        }
    }
}

impl<C> Poster<C> {
    /// Post a command that may still run while the service drains.
    pub fn post(&self, command: C) -> Result<(), Stopped> {
        if !self.signals.phase().accepts_drain_work() {
            return Err(Stopped);
        }
        self.tx.send(command).map_err(|_| Stopped)
    }

    /// Post a command that must not start once draining has begun.
    pub fn post_before_drain(&self, command: C) -> Result<(), Stopped> {
        if !self.signals.phase().accepts_new_work() {
            return Err(Stopped);
        }
        self.tx.send(command).map_err(|_| Stopped)
    }
}

pub struct Mailbox<C> {
    rx: flume::Receiver<C>,
}

impl<C> Mailbox<C> {
    /// Next command, or `None` once every poster is gone.
    pub async fn recv(&self) -> Option<C> {
        self.rx.recv_async().await.ok()
    }

    pub fn try_recv(&self) -> Option<C> {
        self.rx.try_recv().ok()
    }

    /// Everything currently queued.
    pub fn drain(&self) -> Vec<C> {
        self.rx.drain().collect()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
