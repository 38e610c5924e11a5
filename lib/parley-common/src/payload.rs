// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Opaque application payloads carried by commands and notifications.

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("failed to encode payload: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode payload: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Message body. Typed values are encoded as JSON.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Payload(Bytes);

impl Payload {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn empty() -> Self {
        Self(Bytes::new())
    }

    /// Encode a serializable value.
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Self, PayloadError> {
        serde_json::to_vec(value)
            .map(|v| Self(Bytes::from(v)))
            .map_err(PayloadError::Encode)
    }

    /// Decode the payload into a typed value.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, PayloadError> {
        serde_json::from_slice(&self.0).map_err(PayloadError::Decode)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Bytes::from(bytes))
    }
}

impl From<&'static str> for Payload {
    fn from(s: &'static str) -> Self {
        Self(Bytes::from_static(s.as_bytes()))
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Self(Bytes::from(s))
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Payload")
            .field(&format_args!("len={}", self.0.len()))
            .finish()
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) if s.len() <= 64 => write!(f, "{s}"),
            _ => write!(f, "<{} bytes>", self.0.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Greeting {
        name: String,
        count: u32,
    }

    #[test]
    fn test_typed_payload() {
        let value = Greeting {
            name: "world".to_string(),
            count: 2,
        };
        let payload = Payload::encode(&value).unwrap();
        assert!(!payload.is_empty());
        assert_eq!(payload.decode::<Greeting>().unwrap(), value);
    }

    #[test]
    fn test_decode_error() {
        let payload = Payload::from("not json");
        assert!(matches!(
            payload.decode::<Greeting>(),
            Err(PayloadError::Decode(_))
        ));
    }

    #[test]
    fn test_display_truncates_binary() {
        assert_eq!(Payload::from("hi").to_string(), "hi");
        let binary = Payload::from(vec![0xff; 4]);
        assert_eq!(binary.to_string(), "<4 bytes>");
    }
}
