// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Two peers on an in-memory broker: one owns a session, the other reads and
//! updates it remotely, calls a command and sends a notification.
//!
//! Run with `PARLEY_LOG=debug` to see the session diffs.

use parley::{
    command_handler, logging, notification_handler, Attr, MemoryBroker, Payload, Peer,
    RequestContext,
};
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let broker = MemoryBroker::new();
    let owner = Peer::builder().broker(broker.clone()).build().await?;
    let visitor = Peer::builder().broker(broker.clone()).build().await?;

    owner
        .listen(
            "greeter",
            command_handler(|_ctx, request, response| async move {
                let name = request
                    .source
                    .get(&RequestContext::background(), "profile", "name")
                    .await
                    .map(|attr| attr.value)
                    .unwrap_or_default();
                response.done(Payload::new(format!("hello {name}")));
            }),
        )
        .await?;

    let session = owner.session()?;
    session.listen(
        "inbox",
        notification_handler(|notification| async move {
            tracing::info!(kind = %notification.kind, from = %notification.source.reference(), "notified");
        }),
    )?;

    let ctx = RequestContext::with_timeout(Duration::from_secs(5));
    let first = session
        .current_revision()
        .update(&ctx, "profile", &[Attr::new("name", "ada"), Attr::frozen("id", "7")])
        .await?;

    let remote = visitor.revision(first.reference())?;
    let attrs = remote.get_all(&ctx, "profile").await?;
    tracing::info!(%attrs, "visitor read");

    let second = remote
        .update(&ctx, "profile", &[Attr::new("name", "grace")])
        .await?;
    tracing::info!(reference = %second.reference(), "visitor updated");

    let caller = visitor.session()?;
    caller
        .current_revision()
        .update(&ctx, "profile", &[Attr::new("name", "linus")])
        .await?;
    let reply = caller.call(&ctx, "greeter", "greet", Payload::empty()).await?;
    tracing::info!(reply = %String::from_utf8_lossy(reply.as_bytes()), "greeted");

    caller.notify(session.id(), "inbox", "ping", Payload::empty())?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    visitor.graceful_stop();
    owner.graceful_stop();
    visitor.wait().await.map_err(|e| anyhow::anyhow!("{e}"))?;
    owner.wait().await.map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(())
}
