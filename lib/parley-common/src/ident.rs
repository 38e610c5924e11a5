// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Identity types for peers, sessions, revisions and messages.
//!
//! Every identity has a stable textual form that round trips through
//! [`Display`](fmt::Display) and [`FromStr`]:
//!
//! | type        | form                     | example              |
//! |-------------|--------------------------|----------------------|
//! | [`PeerId`]    | `<CLOCK-HEX>-<RAND-HEX4>` | `18C2F3A1B04-01A3`   |
//! | [`SessionId`] | `<peer>.<seq>`            | `18C2F3A1B04-01A3.7` |
//! | [`Ref`]       | `<session>@<rev>`         | `...-01A3.7@12`      |
//! | [`MessageId`] | `<ref>#<seq>`             | `...-01A3.7@12#3`    |

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Session revision. Increases by exactly one for every effective change.
pub type Rev = u32;

/// Errors produced when parsing an identity from its textual form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseIdError {
    #[error("invalid peer id '{0}'")]
    Peer(String),

    #[error("invalid session id '{0}'")]
    Session(String),

    #[error("invalid session ref '{0}'")]
    Ref(String),

    #[error("invalid message id '{0}'")]
    Message(String),
}

/// Identifies a peer on the network.
///
/// `clock` is the wall-clock time (milliseconds) at which the peer started and
/// `rand` is a non-zero random discriminator for peers started in the same
/// millisecond.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId {
    pub clock: u64,
    pub rand: u16,
}

impl PeerId {
    pub fn new(clock: u64, rand: u16) -> Self {
        Self { clock, rand }
    }

    /// Generate a fresh peer id from the current time and random bits.
    pub fn generate() -> Self {
        let clock = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let bytes = uuid::Uuid::new_v4().into_bytes();
        let rand = u16::from_be_bytes([bytes[0], bytes[1]]).max(1);
        Self { clock, rand }
    }

    /// A peer id with both components zero is never generated.
    pub fn is_zero(&self) -> bool {
        self.clock == 0 && self.rand == 0
    }

    /// The session id with the given sequence number on this peer.
    pub fn session(&self, seq: u32) -> SessionId {
        SessionId { peer: *self, seq }
    }

    /// Short form used in log lines.
    pub fn short_string(&self) -> String {
        format!("{:04X}", self.rand)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}-{:04X}", self.clock, self.rand)
    }
}

impl FromStr for PeerId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseIdError::Peer(s.to_string());
        let (clock, rand) = s.split_once('-').ok_or_else(err)?;
        if rand.len() != 4 {
            return Err(err());
        }
        let clock = u64::from_str_radix(clock, 16).map_err(|_| err())?;
        let rand = u16::from_str_radix(rand, 16).map_err(|_| err())?;
        Ok(Self { clock, rand })
    }
}

/// Identifies a session. Sequence `0` is reserved for traffic that the peer
/// sends on its own behalf; user sessions start at `1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId {
    pub peer: PeerId,
    pub seq: u32,
}

impl SessionId {
    pub fn new(peer: PeerId, seq: u32) -> Self {
        Self { peer, seq }
    }

    /// A reference to this session at the given revision.
    pub fn at(&self, rev: Rev) -> Ref {
        Ref { id: *self, rev }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.peer, self.seq)
    }
}

impl FromStr for SessionId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseIdError::Session(s.to_string());
        let (peer, seq) = s.rsplit_once('.').ok_or_else(err)?;
        Ok(Self {
            peer: peer.parse().map_err(|_| err())?,
            seq: seq.parse().map_err(|_| err())?,
        })
    }
}

/// A session at a specific revision; the unit of optimistic concurrency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Ref {
    pub id: SessionId,
    pub rev: Rev,
}

impl Ref {
    /// The message id with the given per-revision sequence number.
    pub fn message(&self, seq: u32) -> MessageId {
        MessageId { reference: *self, seq }
    }

    /// The same session at a different revision.
    pub fn at(&self, rev: Rev) -> Ref {
        Ref { id: self.id, rev }
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.rev)
    }
}

impl FromStr for Ref {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseIdError::Ref(s.to_string());
        let (id, rev) = s.rsplit_once('@').ok_or_else(err)?;
        Ok(Self {
            id: id.parse().map_err(|_| err())?,
            rev: rev.parse().map_err(|_| err())?,
        })
    }
}

/// Identifies a single message sent on behalf of a session revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId {
    pub reference: Ref,
    pub seq: u32,
}

impl MessageId {
    pub fn session(&self) -> SessionId {
        self.reference.id
    }

    pub fn peer(&self) -> PeerId {
        self.reference.id.peer
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.reference, self.seq)
    }
}

impl FromStr for MessageId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseIdError::Message(s.to_string());
        let (reference, seq) = s.rsplit_once('#').ok_or_else(err)?;
        Ok(Self {
            reference: reference.parse().map_err(|_| err())?,
            seq: seq.parse().map_err(|_| err())?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_generated_peer_id_round_trips() {
        let id = PeerId::generate();
        assert!(!id.is_zero());
        assert_ne!(id.rand, 0);
        assert_eq!(id.to_string().parse::<PeerId>().unwrap(), id);
    }

    #[test]
    fn test_message_id_display_and_parse() {
        let peer = PeerId::new(0x18C2F3A1B04, 0x01A3);
        let id = peer.session(7).at(12).message(3);

        let text = id.to_string();
        assert_eq!(text, "18C2F3A1B04-01A3.7@12#3");
        assert_eq!(text.parse::<MessageId>().unwrap(), id);
        assert_eq!(id.session(), peer.session(7));
        assert_eq!(id.peer(), peer);
    }

    #[test]
    fn test_peer_id_pads_rand() {
        assert_eq!(PeerId::new(1, 2).to_string(), "1-0002");
    }

    #[rstest]
    #[case("")]
    #[case("ABC")]
    #[case("ABC-1")]
    #[case("XYZ-0001")]
    #[case("ABC-00001")]
    fn test_invalid_peer_ids(#[case] input: &str) {
        assert!(input.parse::<PeerId>().is_err());
    }

    #[rstest]
    #[case("1-0002")]
    #[case("1-0002.x@1")]
    #[case("1-0002.1@")]
    #[case("1-0002.1@1#")]
    fn test_invalid_message_ids(#[case] input: &str) {
        assert!(matches!(
            input.parse::<MessageId>(),
            Err(ParseIdError::Message(_))
        ));
    }

    #[test]
    fn test_ref_at_keeps_session() {
        let r = PeerId::new(1, 2).session(3).at(4);
        assert_eq!(r.at(9).id, r.id);
        assert_eq!(r.at(9).rev, 9);
        assert_eq!(r.to_string().parse::<Ref>().unwrap(), r);
    }
}
