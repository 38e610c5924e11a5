// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Sessions owned by this peer.

mod catalog;
mod revision;
mod store;

pub use catalog::{Catalog, Namespaces};
pub use revision::LocalRevision;
pub use store::Store;
