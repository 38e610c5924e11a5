// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Shared vocabulary for parley crates: identities, payloads, request
//! contexts and namespace rules.

pub mod context;
pub mod ident;
pub mod namespace;
pub mod payload;

pub use context::{ContextError, RequestContext};
pub use ident::{MessageId, ParseIdError, PeerId, Ref, Rev, SessionId};
pub use namespace::NamespaceError;
pub use payload::{Payload, PayloadError};
