// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Revisioned sessions and command correlation over a message broker.
//!
//! A [`Peer`] connects to a [`Broker`](broker::Broker) and owns sessions.
//! Each [`Session`] carries namespaced, revisioned attributes that any peer
//! can read or update through a [`Revision`]; sessions exchange commands
//! (unicast, load balanced or multicast) and one-way notifications.

pub mod broker;
pub mod command;
pub mod notify;
pub mod peer;
pub mod session;

pub use broker::MemoryBroker;
pub use command::{
    async_handler, command_handler, AsyncResponse, CallError, Failure, Request, Response,
};
pub use notify::{notification_handler, Constraint, Notification};
pub use peer::{Peer, PeerBuilder, PeerError};
pub use session::{Attr, AttrMeta, AttrTable, Revision, Session, SessionError};

pub use parley_common::{
    ContextError, MessageId, Payload, PeerId, Ref, RequestContext, Rev, SessionId,
};
pub use parley_runtime::{logging, PeerConfig};
