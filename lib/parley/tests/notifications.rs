// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

mod common;

use common::{ctx, start_pair};
use parley::notify::NotificationHandler;
use parley::{notification_handler, Attr, Constraint, Notification, Payload, Session};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn forward(tx: &mpsc::UnboundedSender<Notification>) -> Arc<dyn NotificationHandler> {
    let tx = tx.clone();
    notification_handler(move |notification| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(notification);
        }
    })
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Notification>) -> Notification {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("notification not delivered in time")
        .expect("channel closed")
}

async fn set_role(session: &Session, role: &str) {
    session
        .current_revision()
        .update(&ctx(), "chat", &[Attr::new("role", role)])
        .await
        .unwrap();
}

#[tokio::test]
async fn test_unicast_notification() {
    let (_broker, a, b) = start_pair().await;
    let sender = a.session().unwrap();
    let receiver = b.session().unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    assert!(receiver.listen("chat", forward(&tx)).unwrap());
    assert!(!receiver.listen("chat", forward(&tx)).unwrap());

    let id = sender
        .notify(receiver.id(), "chat", "hello", Payload::new("hi there"))
        .unwrap();

    let notification = next(&mut rx).await;
    assert_eq!(notification.id, id);
    assert_eq!(notification.target, receiver.id());
    assert_eq!(notification.kind, "hello");
    assert_eq!(notification.payload.as_bytes(), b"hi there");
    assert_eq!(notification.source.reference().id, sender.id());
    assert!(!notification.is_multicast);
    assert!(notification.constraint.is_none());
}

#[tokio::test]
async fn test_multicast_honours_constraint() {
    let (_broker, a, b) = start_pair().await;
    let sender = a.session().unwrap();
    let leader = b.session().unwrap();
    let follower = b.session().unwrap();
    set_role(&leader, "leader").await;
    set_role(&follower, "follower").await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    leader.listen("chat", forward(&tx)).unwrap();
    follower.listen("chat", forward(&tx)).unwrap();

    let constraint = Constraint::any().with("role", "leader");
    sender
        .notify_many(&constraint, "chat", "elect", Payload::empty())
        .unwrap();

    let notification = next(&mut rx).await;
    assert_eq!(notification.target, leader.id());
    assert!(notification.is_multicast);
    assert_eq!(notification.constraint, Some(constraint));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());

    sender
        .notify_many(&Constraint::any(), "chat", "announce", Payload::empty())
        .unwrap();
    let mut targets = vec![next(&mut rx).await.target, next(&mut rx).await.target];
    targets.sort_by_key(|id| id.seq);
    assert_eq!(targets, vec![leader.id(), follower.id()]);
}

#[tokio::test]
async fn test_unlisten_stops_delivery() {
    let (_broker, a, b) = start_pair().await;
    let sender = a.session().unwrap();
    let receiver = b.session().unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    receiver.listen("chat", forward(&tx)).unwrap();
    assert!(receiver.unlisten("chat"));
    assert!(!receiver.unlisten("chat"));

    sender
        .notify_many(&Constraint::any(), "chat", "announce", Payload::empty())
        .unwrap();
    sender
        .notify(receiver.id(), "chat", "hello", Payload::empty())
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_destroyed_session_drops_handlers() {
    let (_broker, a, b) = start_pair().await;
    let sender = a.session().unwrap();
    let receiver = b.session().unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    receiver.listen("chat", forward(&tx)).unwrap();
    receiver.destroy();
    assert!(receiver.listen("chat", forward(&tx)).unwrap_err().is_not_found());

    sender
        .notify(receiver.id(), "chat", "hello", Payload::empty())
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
}
