// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Runtime building blocks shared by parley components: the service
//! lifecycle, typed mailboxes, a bounded resource pool, configuration and
//! logging.

pub mod config;
pub mod logging;
pub mod pool;
pub mod service;

pub use config::{ConfigError, PeerConfig};
pub use pool::{Manage, Pool, Pooled};
pub use service::{
    mailbox, Machine, Mailbox, Phase, Poster, ServiceHandle, Signals, Stopped,
};
