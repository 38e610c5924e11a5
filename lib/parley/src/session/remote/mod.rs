// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Sessions owned by other peers.
//!
//! Reads and writes are unicast commands to the owner on the `_sess`
//! namespace. Each foreign session gets a [`Catalog`] that caches what has
//! been learned about it, tagged with the revision at which it was fetched;
//! the cache is never invalidated by the owner, it only answers questions
//! whose answer cannot have changed.

mod catalog;
mod client;
mod revision;
mod service;
mod store;

pub use catalog::Catalog;
pub use client::Client;
pub use revision::RemoteRevision;
pub use service::SessionService;
pub use store::Store;

use super::{Attr, AttrMeta};
use parley_common::Rev;
use serde::{Deserialize, Serialize};

pub(crate) mod command {
    pub const FETCH: &str = "fetch";
    pub const UPDATE: &str = "update";
    pub const CLEAR: &str = "clear";
    pub const DESTROY: &str = "destroy";
}

/// Reads `keys` of `namespace`, or the whole namespace with `all`. No keys
/// and no `all` only asks for the current revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct FetchRequest {
    pub seq: u32,
    pub rev: Rev,
    pub namespace: String,
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub all: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct UpdateRequest {
    pub seq: u32,
    pub rev: Rev,
    pub namespace: String,
    pub attrs: Vec<Attr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ClearRequest {
    pub seq: u32,
    pub rev: Rev,
    pub namespace: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct DestroyRequest {
    pub seq: u32,
    pub rev: Rev,
}

/// The owner's revision, with attribute metadata for fetch and update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct AttrsResponse {
    pub rev: Rev,
    #[serde(default)]
    pub attrs: Vec<AttrMeta>,
}
