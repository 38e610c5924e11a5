// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::command::{CallError, Failure};
use parley_common::{NamespaceError, Payload, Ref, SessionId};
use parley_runtime::Stopped;

/// Failure kinds used by the remote session protocol.
pub(crate) mod kind {
    pub const NOT_FOUND: &str = "not-found";
    pub const STALE: &str = "stale";
    pub const FROZEN: &str = "frozen";
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("session {0} not found")]
    NotFound(SessionId),

    #[error("{0} is not the current revision")]
    StaleUpdate(Ref),

    #[error("attributes changed after {0}")]
    StaleFetch(Ref),

    #[error("{reference}: frozen attributes {keys:?} in '{namespace}'")]
    FrozenAttributes {
        reference: Ref,
        namespace: String,
        keys: Vec<String>,
    },

    #[error("revision {0} does not exist yet")]
    FutureRevision(Ref),

    #[error(transparent)]
    Call(#[from] CallError),

    #[error(transparent)]
    Namespace(#[from] NamespaceError),
}

impl From<Stopped> for SessionError {
    fn from(e: Stopped) -> Self {
        SessionError::Call(e.into())
    }
}

impl SessionError {
    /// Stale errors succeed when retried against a newer revision.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SessionError::StaleUpdate(_) | SessionError::StaleFetch(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SessionError::NotFound(_))
    }

    /// The wire form of this error, for errors that have one.
    pub(crate) fn to_failure(&self) -> Option<Failure> {
        let failure = match self {
            SessionError::NotFound(_) => Failure::new(kind::NOT_FOUND, self.to_string()),
            SessionError::StaleUpdate(_) | SessionError::StaleFetch(_) => {
                Failure::new(kind::STALE, self.to_string())
            }
            SessionError::FrozenAttributes { keys, .. } => {
                let payload = Payload::encode(keys).ok()?;
                Failure::new(kind::FROZEN, self.to_string()).with_payload(payload)
            }
            _ => return None,
        };
        Some(failure)
    }

    /// Rebuild a typed error from a remote call made on behalf of `reference`.
    /// `stale` builds the variant that fits the operation.
    pub(crate) fn from_call(
        err: CallError,
        reference: Ref,
        namespace: &str,
        stale: fn(Ref) -> SessionError,
    ) -> Self {
        let Some(failure) = err.failure() else {
            return SessionError::Call(err);
        };
        match failure.kind.as_str() {
            kind::NOT_FOUND => SessionError::NotFound(reference.id),
            kind::STALE => stale(reference),
            kind::FROZEN => SessionError::FrozenAttributes {
                reference,
                namespace: namespace.to_string(),
                keys: failure.payload.decode().unwrap_or_default(),
            },
            _ => SessionError::Call(err),
        }
    }
}
