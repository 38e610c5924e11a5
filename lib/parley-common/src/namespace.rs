// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Namespace name rules.
//!
//! Namespaces partition both command handlers and session attributes. Names
//! starting with an underscore are reserved for internal use.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NamespaceError {
    #[error("namespace must not be empty")]
    Empty,

    #[error("namespace '{0}' is reserved")]
    Reserved(String),

    #[error("namespace '{0}' contains invalid characters")]
    InvalidCharacters(String),
}

/// Validate a namespace supplied by application code.
pub fn validate(ns: &str) -> Result<(), NamespaceError> {
    validate_internal(ns)?;
    if ns.starts_with('_') {
        return Err(NamespaceError::Reserved(ns.to_string()));
    }
    Ok(())
}

/// Validate a namespace used by the library itself; reserved names are allowed.
pub fn validate_internal(ns: &str) -> Result<(), NamespaceError> {
    if ns.is_empty() {
        return Err(NamespaceError::Empty);
    }
    if !ns
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'))
    {
        return Err(NamespaceError::InvalidCharacters(ns.to_string()));
    }
    Ok(())
}
