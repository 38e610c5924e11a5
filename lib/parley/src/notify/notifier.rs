// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use super::{encode, Audience, Constraint, NotificationHeader};
use crate::broker::{self, ChannelPool, Destination};
use crate::command::CallError;
use parley_common::{namespace, MessageId, Payload, SessionId};
use std::sync::Arc;
use tracing::trace;

/// Sends notifications. Sends never wait for delivery; errors only reflect a
/// failure to hand the message to the broker.
pub struct Notifier {
    pool: Arc<ChannelPool>,
}

impl Notifier {
    pub fn new(pool: Arc<ChannelPool>) -> Self {
        Self { pool }
    }

    /// Notify one session.
    pub fn notify_unicast(
        &self,
        id: MessageId,
        target: SessionId,
        ns: &str,
        kind: &str,
        payload: Payload,
    ) -> Result<(), CallError> {
        self.send(
            Destination::NotifyPeer(target.peer),
            id,
            ns,
            kind,
            Audience::Session(target),
            payload,
        )
    }

    /// Notify every session listening on `ns` whose attributes satisfy
    /// `constraint`.
    pub fn notify_multicast(
        &self,
        id: MessageId,
        constraint: &Constraint,
        ns: &str,
        kind: &str,
        payload: Payload,
    ) -> Result<(), CallError> {
        self.send(
            Destination::NotifyMulticast(ns.to_string()),
            id,
            ns,
            kind,
            Audience::Matching(constraint.clone()),
            payload,
        )
    }

    fn send(
        &self,
        to: Destination,
        id: MessageId,
        ns: &str,
        kind: &str,
        audience: Audience,
        payload: Payload,
    ) -> Result<(), CallError> {
        namespace::validate(ns)?;
        let notification = NotificationHeader {
            id,
            namespace: ns.to_string(),
            kind: kind.to_string(),
            audience,
        };
        broker::publish(&self.pool, &to, encode(&notification, payload))?;
        trace!(target: "parley::notify", %id, namespace = ns, kind, "sent notification");
        Ok(())
    }
}
