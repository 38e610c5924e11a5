// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Header layout of command requests and responses.

use super::failure::{CallError, CommandError, Failure};
use crate::broker::Message;
use parley_common::context::{deadline_from_unix_millis, deadline_to_unix_millis};
use parley_common::{MessageId, Payload};
use std::fmt;
use tokio::time::Instant;

pub mod header {
    pub const MESSAGE_ID: &str = "message-id";
    pub const NAMESPACE: &str = "namespace";
    pub const COMMAND: &str = "command";
    pub const DEADLINE: &str = "deadline";
    pub const REPLY: &str = "reply";
    pub const MULTICAST: &str = "multicast";
    pub const OUTCOME: &str = "outcome";
    pub const FAILURE_TYPE: &str = "failure-type";
    pub const FAILURE_MESSAGE: &str = "failure-message";
    pub const NOTIFICATION_TYPE: &str = "notification-type";
    pub const TARGET: &str = "target";
    pub const CONSTRAINT: &str = "constraint";
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("missing header '{0}'")]
    Missing(&'static str),

    #[error("invalid header '{header}': '{value}'")]
    Invalid { header: &'static str, value: String },
}

impl From<ProtocolError> for CallError {
    fn from(e: ProtocolError) -> Self {
        CallError::Protocol(e.to_string())
    }
}

/// How, if at all, the caller expects to be answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyMode {
    /// A blocking call waits for the response by message id.
    Correlated,
    /// The response is routed to the session's async handler.
    Uncorrelated,
    /// Fire and forget.
    None,
}

impl ReplyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplyMode::Correlated => "correlated",
            ReplyMode::Uncorrelated => "uncorrelated",
            ReplyMode::None => "none",
        }
    }

    fn parse(value: &str) -> Result<Self, ProtocolError> {
        match value {
            "correlated" => Ok(ReplyMode::Correlated),
            "uncorrelated" => Ok(ReplyMode::Uncorrelated),
            "none" => Ok(ReplyMode::None),
            _ => Err(ProtocolError::Invalid {
                header: header::REPLY,
                value: value.to_string(),
            }),
        }
    }
}

impl fmt::Display for ReplyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    pub id: MessageId,
    pub namespace: String,
    pub command: String,
    pub deadline: Instant,
    pub reply: ReplyMode,
    pub multicast: bool,
}

pub fn encode_request(request: &RequestHeader, payload: Payload) -> Message {
    let mut message = Message::new(payload)
        .with_header(header::MESSAGE_ID, request.id.to_string())
        .with_header(header::NAMESPACE, request.namespace.as_str())
        .with_header(header::COMMAND, request.command.as_str())
        .with_header(
            header::DEADLINE,
            deadline_to_unix_millis(request.deadline).to_string(),
        )
        .with_header(header::REPLY, request.reply.as_str());
    if request.multicast {
        message = message.with_header(header::MULTICAST, "true");
    }
    message
}

pub fn decode_request(message: &Message) -> Result<RequestHeader, ProtocolError> {
    let id = message_id(message)?;
    let namespace = required(message, header::NAMESPACE)?.to_string();
    let command = required(message, header::COMMAND)?.to_string();
    let raw = required(message, header::DEADLINE)?;
    let millis = raw.parse::<u64>().map_err(|_| ProtocolError::Invalid {
        header: header::DEADLINE,
        value: raw.to_string(),
    })?;
    let reply = ReplyMode::parse(required(message, header::REPLY)?)?;
    Ok(RequestHeader {
        id,
        namespace,
        command,
        deadline: deadline_from_unix_millis(millis),
        reply,
        multicast: message.header(header::MULTICAST) == Some("true"),
    })
}

/// How a handler answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success(Payload),
    Failure(Failure),
    Error(CommandError),
}

impl Outcome {
    pub fn into_result(self) -> Result<Payload, CallError> {
        match self {
            Outcome::Success(payload) => Ok(payload),
            Outcome::Failure(f) => Err(CallError::Failure(f)),
            Outcome::Error(e) => Err(CallError::Command(e)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHeader {
    pub id: MessageId,
    pub namespace: String,
    pub command: String,
    pub reply: ReplyMode,
}

pub fn encode_response(response: &ResponseHeader, outcome: Outcome) -> Message {
    let base = |payload: Payload| {
        Message::new(payload)
            .with_header(header::MESSAGE_ID, response.id.to_string())
            .with_header(header::NAMESPACE, response.namespace.as_str())
            .with_header(header::COMMAND, response.command.as_str())
            .with_header(header::REPLY, response.reply.as_str())
    };
    match outcome {
        Outcome::Success(payload) => base(payload).with_header(header::OUTCOME, "success"),
        Outcome::Failure(f) => base(f.payload)
            .with_header(header::OUTCOME, "failure")
            .with_header(header::FAILURE_TYPE, f.kind)
            .with_header(header::FAILURE_MESSAGE, f.message),
        Outcome::Error(e) => base(Payload::from(e.0)).with_header(header::OUTCOME, "error"),
    }
}

pub fn decode_response(message: &Message) -> Result<(ResponseHeader, Outcome), ProtocolError> {
    let response = ResponseHeader {
        id: message_id(message)?,
        namespace: required(message, header::NAMESPACE)?.to_string(),
        command: required(message, header::COMMAND)?.to_string(),
        reply: ReplyMode::parse(required(message, header::REPLY)?)?,
    };
    let outcome = match required(message, header::OUTCOME)? {
        "success" => Outcome::Success(message.payload.clone()),
        "failure" => {
            let kind = required(message, header::FAILURE_TYPE)?;
            if kind.is_empty() {
                return Err(ProtocolError::Invalid {
                    header: header::FAILURE_TYPE,
                    value: String::new(),
                });
            }
            Outcome::Failure(
                Failure::new(kind, message.header(header::FAILURE_MESSAGE).unwrap_or(""))
                    .with_payload(message.payload.clone()),
            )
        }
        "error" => Outcome::Error(CommandError(
            String::from_utf8_lossy(message.payload.as_bytes()).into_owned(),
        )),
        other => {
            return Err(ProtocolError::Invalid {
                header: header::OUTCOME,
                value: other.to_string(),
            })
        }
    };
    Ok((response, outcome))
}

pub fn message_id(message: &Message) -> Result<MessageId, ProtocolError> {
    let raw = required(message, header::MESSAGE_ID)?;
    raw.parse().map_err(|_| ProtocolError::Invalid {
        header: header::MESSAGE_ID,
        value: raw.to_string(),
    })
}

pub fn required<'a>(message: &'a Message, key: &'static str) -> Result<&'a str, ProtocolError> {
    match message.header(key) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ProtocolError::Missing(key)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_common::PeerId;
    use std::time::Duration;

    fn id() -> MessageId {
        PeerId::new(10, 20).session(1).at(2).message(3)
    }

    #[tokio::test]
    async fn test_request_headers() {
        let request = RequestHeader {
            id: id(),
            namespace: "orders".into(),
            command: "place".into(),
            deadline: Instant::now() + Duration::from_secs(5),
            reply: ReplyMode::Correlated,
            multicast: false,
        };
        let message = encode_request(&request, Payload::from("{}"));
        assert_eq!(message.header(header::REPLY), Some("correlated"));

        let decoded = decode_request(&message).unwrap();
        assert_eq!(decoded.id, request.id);
        assert_eq!(decoded.namespace, "orders");
        assert!(!decoded.multicast);
    }

    #[test]
    fn test_request_missing_namespace() {
        let message = Message::new(Payload::empty())
            .with_header(header::MESSAGE_ID, id().to_string())
            .with_header(header::COMMAND, "place");
        assert_eq!(
            decode_request(&message),
            Err(ProtocolError::Missing(header::NAMESPACE))
        );
    }

    #[test]
    fn test_request_bad_message_id() {
        let message = Message::new(Payload::empty()).with_header(header::MESSAGE_ID, "nope");
        assert!(matches!(
            decode_request(&message),
            Err(ProtocolError::Invalid { header: "message-id", .. })
        ));
    }

    #[test]
    fn test_failure_response() {
        let response = ResponseHeader {
            id: id(),
            namespace: "_sess".into(),
            command: "update".into(),
            reply: ReplyMode::Correlated,
        };
        let message = encode_response(
            &response,
            Outcome::Failure(Failure::new("frozen", "attribute a is frozen")),
        );
        let (header, outcome) = decode_response(&message).unwrap();
        assert_eq!(header, response);
        let err = outcome.into_result().unwrap_err();
        assert!(err.is_failure_type("frozen"));
    }

    #[test]
    fn test_error_response_carries_message() {
        let response = ResponseHeader {
            id: id(),
            namespace: "ns".into(),
            command: "cmd".into(),
            reply: ReplyMode::Uncorrelated,
        };
        let message = encode_response(&response, Outcome::Error(CommandError("boom".into())));
        let (_, outcome) = decode_response(&message).unwrap();
        assert_eq!(outcome, Outcome::Error(CommandError("boom".into())));
    }
}
