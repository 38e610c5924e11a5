// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Request/response commands over the broker.
//!
//! The [`Invoker`] sends requests and correlates their responses; the
//! [`Server`] dispatches inbound requests to per-namespace handlers.

mod failure;
pub mod invoker;
pub mod protocol;
pub mod server;

pub use failure::{CallError, CommandError, Failure};
pub use invoker::{async_handler, AsyncHandler, AsyncResponse, Invoker};
pub use server::{command_handler, CommandHandler, Request, Response, Server, ServerError};
