// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! One-way notifications between sessions.
//!
//! A notification is sent either to one session, or to every session listening
//! on a namespace whose attributes in that namespace satisfy a [`Constraint`].
//! Notifications travel on each peer's notification queue; the [`Listener`]
//! routes them to per-session handlers.

mod listener;
mod notifier;

pub use listener::Listener;
pub use notifier::Notifier;

use crate::broker::Message;
use crate::command::protocol::{self, header, ProtocolError};
use crate::session::{AttrTable, Revision};
use async_trait::async_trait;
use parley_common::{MessageId, Payload, SessionId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// A conjunction of `key = value` terms matched against a session's
/// attributes in the notification namespace. Unset keys compare as empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint(BTreeMap<String, String>);

impl Constraint {
    /// The constraint every session satisfies.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn matches(&self, attrs: &AttrTable) -> bool {
        self.0
            .iter()
            .all(|(key, value)| attrs.value(key) == value)
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("*");
        }
        for (i, (key, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" && ")?;
            }
            write!(f, "{key} = {value:?}")?;
        }
        Ok(())
    }
}

/// A notification as delivered to a handler.
#[derive(Clone)]
pub struct Notification {
    pub id: MessageId,
    /// The sending session at the revision the notification was sent from.
    pub source: Arc<dyn Revision>,
    /// The receiving session.
    pub target: SessionId,
    pub namespace: String,
    pub kind: String,
    pub payload: Payload,
    pub constraint: Option<Constraint>,
    pub is_multicast: bool,
}

impl fmt::Debug for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notification")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("namespace", &self.namespace)
            .field("kind", &self.kind)
            .field("payload", &self.payload)
            .field("constraint", &self.constraint)
            .finish()
    }
}

#[async_trait]
pub trait NotificationHandler: Send + Sync + 'static {
    async fn handle(&self, notification: Notification);
}

struct NotificationHandlerFn<F>(F);

#[async_trait]
impl<F, Fut> NotificationHandler for NotificationHandlerFn<F>
where
    F: Fn(Notification) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, notification: Notification) {
        (self.0)(notification).await
    }
}

/// Wrap a closure as a [`NotificationHandler`].
pub fn notification_handler<F, Fut>(f: F) -> Arc<dyn NotificationHandler>
where
    F: Fn(Notification) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(NotificationHandlerFn(f))
}

/// Who a notification is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Audience {
    Session(SessionId),
    Matching(Constraint),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct NotificationHeader {
    pub id: MessageId,
    pub namespace: String,
    pub kind: String,
    pub audience: Audience,
}

pub(crate) fn encode(notification: &NotificationHeader, payload: Payload) -> Message {
    let message = Message::new(payload)
        .with_header(header::MESSAGE_ID, notification.id.to_string())
        .with_header(header::NAMESPACE, notification.namespace.as_str())
        .with_header(header::NOTIFICATION_TYPE, notification.kind.as_str());
    match &notification.audience {
        Audience::Session(target) => message.with_header(header::TARGET, target.to_string()),
        Audience::Matching(constraint) => message
            .with_header(header::MULTICAST, "true")
            .with_header(
                header::CONSTRAINT,
                serde_json::to_string(constraint).unwrap_or_default(),
            ),
    }
}

pub(crate) fn decode(message: &Message) -> Result<NotificationHeader, ProtocolError> {
    let id = protocol::message_id(message)?;
    let namespace = protocol::required(message, header::NAMESPACE)?.to_string();
    let kind = protocol::required(message, header::NOTIFICATION_TYPE)?.to_string();
    let audience = if message.header(header::MULTICAST) == Some("true") {
        let raw = protocol::required(message, header::CONSTRAINT)?;
        let constraint = serde_json::from_str(raw).map_err(|_| ProtocolError::Invalid {
            header: header::CONSTRAINT,
            value: raw.to_string(),
        })?;
        Audience::Matching(constraint)
    } else {
        let raw = protocol::required(message, header::TARGET)?;
        let target = raw.parse().map_err(|_| ProtocolError::Invalid {
            header: header::TARGET,
            value: raw.to_string(),
        })?;
        Audience::Session(target)
    };
    Ok(NotificationHeader {
        id,
        namespace,
        kind,
        audience,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Attr;
    use parley_common::PeerId;

    #[test]
    fn test_constraint_matching() {
        let attrs: AttrTable = [Attr::new("role", "leader"), Attr::new("zone", "a")]
            .into_iter()
            .collect();
        assert!(Constraint::any().matches(&attrs));
        assert!(Constraint::any().with("role", "leader").matches(&attrs));
        assert!(!Constraint::any()
            .with("role", "leader")
            .with("zone", "b")
            .matches(&attrs));
        // unset keys compare as empty
        assert!(Constraint::any().with("missing", "").matches(&attrs));
        assert_eq!(
            Constraint::any().with("a", "1").with("b", "2").to_string(),
            r#"a = "1" && b = "2""#
        );
    }

    #[test]
    fn test_header_round_trip() {
        let id = PeerId::new(1, 1).session(2).at(3).message(4);
        for audience in [
            Audience::Session(PeerId::new(9, 9).session(1)),
            Audience::Matching(Constraint::any().with("role", "leader")),
        ] {
            let notification = NotificationHeader {
                id,
                namespace: "chat".into(),
                kind: "joined".into(),
                audience,
            };
            let message = encode(&notification, Payload::empty());
            assert_eq!(decode(&message).unwrap(), notification);
        }
    }

    #[test]
    fn test_missing_target() {
        let message = Message::new(Payload::empty())
            .with_header(header::MESSAGE_ID, PeerId::new(1, 1).session(1).at(0).message(1).to_string())
            .with_header(header::NAMESPACE, "chat")
            .with_header(header::NOTIFICATION_TYPE, "joined");
        assert_eq!(decode(&message), Err(ProtocolError::Missing(header::TARGET)));
    }
}
