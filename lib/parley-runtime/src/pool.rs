// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Bounded pool of reusable resources.
//!
//! Resources are created lazily by a [`Manage`] implementation. A checked-out
//! resource is wrapped in a [`Pooled`] guard that hands it back on drop, unless
//! it was discarded or the manager reports it is no longer usable. At most
//! `capacity` idle resources are retained; extras are dropped.
//!
//! The pool is an explicit object shared by `Arc`; components that need one
//! receive it at construction.

use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Creates and health-checks pooled resources.
pub trait Manage: Send + Sync + 'static {
    type Resource: Send + 'static;
    type Error;

    fn create(&self) -> Result<Self::Resource, Self::Error>;

    /// Whether a returned resource may be handed out again.
    fn is_reusable(&self, _resource: &Self::Resource) -> bool {
        true
    }
}

pub struct Pool<M: Manage> {
    manager: M,
    idle: Mutex<Vec<M::Resource>>,
    capacity: usize,
}

impl<M: Manage> Pool<M> {
    pub fn new(manager: M, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            manager,
            idle: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        })
    }

    /// Check out an idle resource, or create a new one.
    pub fn get(self: &Arc<Self>) -> Result<Pooled<M>, M::Error> {
        let resource = loop {
            let candidate = self.idle.lock().pop();
            match candidate {
                Some(r) if self.manager.is_reusable(&r) => break r,
                Some(_) => continue,
                None => break self.manager.create()?,
            }
        };
        Ok(Pooled {
            pool: self.clone(),
            resource: Some(resource),
        })
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn manager(&self) -> &M {
        &self.manager
    }

    fn put(&self, resource: M::Resource) {
        if !self.manager.is_reusable(&resource) {
            return;
        }
        let mut idle = self.idle.lock();
        if idle.len() < self.capacity {
            idle.push(resource);
        }
    }
}

/// A checked-out resource; returned to its pool on drop.
pub struct Pooled<M: Manage> {
    pool: Arc<Pool<M>>,
    resource: Option<M::Resource>,
}

impl<M: Manage> Pooled<M> {
    /// Drop the resource instead of returning it, e.g. after an error left it
    /// in an unknown state.
    pub fn discard(mut self) {
        self.resource.take();
    }
}

impl<M: Manage> Deref for Pooled<M> {
    type Target = M::Resource;

    fn deref(&self) -> &Self::Target {
        self.resource.as_ref().expect("pooled resource present until drop")
    }
}

impl<M: Manage> DerefMut for Pooled<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.resource.as_mut().expect("pooled resource present until drop")
    }
}

impl<M: Manage> Drop for Pooled<M> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            self.pool.put(resource);
        }
    }
}
