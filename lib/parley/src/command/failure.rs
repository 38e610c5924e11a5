// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Errors produced by command calls.
//!
//! A handler can answer a request in three ways: a payload, an
//! application-defined [`Failure`] (typed by a short string such as
//! `"not-found"`), or an opaque [`CommandError`]. Failures are part of a
//! command's contract; command errors mean the handler broke.

use crate::broker::TransportError;
use parley_common::{ContextError, NamespaceError, Payload};
use parley_runtime::Stopped;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Failure {
    pub kind: String,
    pub message: String,
    pub payload: Payload,
}

impl Failure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            payload: Payload::empty(),
        }
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }
}

/// An unexpected error reported by a remote handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("command error: {0}")]
pub struct CommandError(pub String);

#[derive(Debug, Clone, thiserror::Error)]
pub enum CallError {
    #[error(transparent)]
    Failure(#[from] Failure),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("call canceled")]
    Canceled,

    #[error("call deadline exceeded")]
    DeadlineExceeded,

    #[error(transparent)]
    Stopped(#[from] Stopped),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Namespace(#[from] NamespaceError),

    #[error("malformed message: {0}")]
    Protocol(String),
}

impl From<ContextError> for CallError {
    fn from(e: ContextError) -> Self {
        match e {
            ContextError::Canceled => CallError::Canceled,
            ContextError::DeadlineExceeded => CallError::DeadlineExceeded,
        }
    }
}

impl CallError {
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            CallError::Failure(f) => Some(f),
            _ => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.failure().is_some()
    }

    pub fn is_failure_type(&self, kind: &str) -> bool {
        self.failure().is_some_and(|f| f.kind == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_type_predicate() {
        let err = CallError::from(Failure::new("stale", "revision is out of date"));
        assert!(err.is_failure());
        assert!(err.is_failure_type("stale"));
        assert!(!err.is_failure_type("frozen"));
        assert_eq!(err.to_string(), "stale: revision is out of date");

        let err = CallError::from(CommandError("boom".into()));
        assert!(!err.is_failure());
    }

    #[test]
    fn test_context_errors_map() {
        assert!(matches!(
            CallError::from(ContextError::Canceled),
            CallError::Canceled
        ));
        assert!(matches!(
            CallError::from(ContextError::DeadlineExceeded),
            CallError::DeadlineExceeded
        ));
    }
}
