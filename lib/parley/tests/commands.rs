// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

mod common;

use common::{ctx, start_pair, start_peer, wait_until};
use parley::{
    async_handler, command_handler, AsyncResponse, CallError, ContextError, Payload,
    RequestContext, SessionError,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[tokio::test]
async fn test_call_round_trip() {
    let (_broker, a, b) = start_pair().await;
    a.listen(
        "echo",
        command_handler(|_ctx, request, response| async move {
            response.done(request.payload);
        }),
    )
    .await
    .unwrap();

    let session = b.session().unwrap();
    let reply = session
        .call(&ctx(), "echo", "say", Payload::new("hello"))
        .await
        .unwrap();
    assert_eq!(reply.as_bytes(), b"hello");
    assert_eq!(b.invoker().pending_calls().await.unwrap(), 0);
}

#[tokio::test]
async fn test_failure_reaches_caller() {
    let (_broker, a, b) = start_pair().await;
    a.listen(
        "jobs",
        command_handler(|_ctx, _request, response| async move {
            response.fail("busy", "try again later");
        }),
    )
    .await
    .unwrap();

    let session = b.session().unwrap();
    let err = session
        .call(&ctx(), "jobs", "run", Payload::empty())
        .await
        .unwrap_err();
    match err {
        SessionError::Call(call) => {
            assert!(call.is_failure_type("busy"));
            assert_eq!(call.failure().unwrap().message, "try again later");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_handler_error_is_opaque() {
    let (_broker, a, b) = start_pair().await;
    a.listen(
        "jobs",
        command_handler(|_ctx, _request, response| async move {
            response.error(anyhow::anyhow!("disk full"));
        }),
    )
    .await
    .unwrap();

    let session = b.session().unwrap();
    let err = session
        .call(&ctx(), "jobs", "run", Payload::empty())
        .await
        .unwrap_err();
    assert!(
        matches!(&err, SessionError::Call(CallError::Command(e)) if e.0.contains("disk full")),
        "unexpected error: {err:?}"
    );
}

#[tokio::test]
async fn test_balanced_request_is_redelivered() {
    let (_broker, a, b) = start_pair().await;
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    a.listen(
        "work",
        command_handler(move |_ctx, _request, response| {
            let counter = counter.clone();
            async move {
                // walk away from the first delivery
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    return;
                }
                response.done(Payload::new("done"));
            }
        }),
    )
    .await
    .unwrap();

    let session = b.session().unwrap();
    let reply = session
        .call(&ctx(), "work", "do", Payload::empty())
        .await
        .unwrap();
    assert_eq!(reply.as_bytes(), b"done");
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_unicast_request_is_abandoned() {
    let (_broker, a, b) = start_pair().await;
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    a.listen(
        "work",
        command_handler(move |_ctx, _request, _response| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }),
    )
    .await
    .unwrap();

    let id = b.id().session(0).at(0).message(1_000);
    let result = b
        .invoker()
        .call_unicast(
            &RequestContext::with_timeout(Duration::from_millis(300)),
            id,
            a.id(),
            "work",
            "do",
            Payload::empty(),
        )
        .await;
    assert!(matches!(result, Err(CallError::DeadlineExceeded)));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(b.invoker().pending_calls().await.unwrap(), 0);
}

#[tokio::test]
async fn test_graceful_stop_drains_running_handlers() {
    let (_broker, a, b) = start_pair().await;
    a.listen(
        "slow",
        command_handler(|_ctx, _request, response| async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            response.done(Payload::new("finished"));
        }),
    )
    .await
    .unwrap();

    let session = b.session().unwrap();
    let call = tokio::spawn(async move {
        session
            .call(&ctx(), "slow", "wait", Payload::empty())
            .await
    });

    let server = a.server().clone();
    wait_until(|| server.in_flight() == 1).await;
    a.graceful_stop();

    let reply = call.await.unwrap().unwrap();
    assert_eq!(reply.as_bytes(), b"finished");
    a.done().await;
    assert!(a.err().is_none());
    assert!(a.session().is_err());
}

#[tokio::test]
async fn test_forceful_stop_cancels_handlers() {
    let (_broker, a, b) = start_pair().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    a.listen(
        "slow",
        command_handler(move |ctx, _request, response| {
            let tx = tx.clone();
            async move {
                let reason = ctx.done().await;
                let _ = tx.send(reason);
                response.close();
            }
        }),
    )
    .await
    .unwrap();

    let session = b.session().unwrap();
    session
        .execute(&ctx(), "slow", "wait", Payload::empty())
        .unwrap();

    let server = a.server().clone();
    wait_until(|| server.in_flight() == 1).await;
    a.stop();
    a.done().await;

    let reason = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reason, ContextError::Canceled);
}

#[tokio::test]
async fn test_async_responses_reach_session_handler() {
    let (_broker, a, b) = start_pair().await;
    a.listen(
        "echo",
        command_handler(|_ctx, request, response| async move {
            response.done(request.payload);
        }),
    )
    .await
    .unwrap();

    let session = b.session().unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel::<AsyncResponse>();
    session
        .set_async_handler(Some(async_handler(move |response| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(response);
            }
        })))
        .unwrap();

    let id = session
        .call_async(&ctx(), "echo", "say", Payload::new("later"))
        .unwrap();
    let response = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.id, id);
    assert_eq!(response.command, "say");
    assert_eq!(response.result.unwrap().as_bytes(), b"later");
}

#[tokio::test]
async fn test_multicast_reaches_every_listener() {
    let (broker, a, b) = start_pair().await;
    let c = start_peer(&broker).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    for peer in [&a, &c] {
        let tx = tx.clone();
        let me = peer.id();
        peer.listen(
            "fanout",
            command_handler(move |_ctx, request, response| {
                let tx = tx.clone();
                async move {
                    assert!(request.is_multicast);
                    assert!(!response.is_required());
                    let _ = tx.send(me);
                    response.close();
                }
            }),
        )
        .await
        .unwrap();
    }

    let session = b.session().unwrap();
    session
        .execute_many(&ctx(), "fanout", "ping", Payload::empty())
        .unwrap();

    let mut seen = Vec::new();
    for _ in 0..2 {
        let peer = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        seen.push(peer);
    }
    seen.sort();
    let mut expected = vec![a.id(), c.id()];
    expected.sort();
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn test_listen_replaces_handler() {
    let (_broker, a, b) = start_pair().await;
    let first = a
        .listen(
            "greet",
            command_handler(|_ctx, _request, response| async move {
                response.done(Payload::new("one"));
            }),
        )
        .await
        .unwrap();
    let second = a
        .listen(
            "greet",
            command_handler(|_ctx, _request, response| async move {
                response.done(Payload::new("two"));
            }),
        )
        .await
        .unwrap();
    assert!(first);
    assert!(!second);

    let session = b.session().unwrap();
    let reply = session
        .call(&ctx(), "greet", "hi", Payload::empty())
        .await
        .unwrap();
    assert_eq!(reply.as_bytes(), b"two");

    assert!(a.unlisten("greet").await.unwrap());
    assert!(!a.unlisten("greet").await.unwrap());
    assert!(a.listen("_private", command_handler(|_, _, r| async move { r.close(); })).await.is_err());
}
