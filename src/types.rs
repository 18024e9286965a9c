//! Core identifier and signaling payload types.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier of a call.
///
/// Generated locally when placing a call, or taken verbatim from an inbound
/// invite. The raw string ordering is also the glare tie-break: when two
/// invites collide in a room, the lexicographically smaller id wins.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random call id (32 uppercase hex chars).
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut bytes);
        Self(hex::encode_upper(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of the room a call is signaled in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a user on the messaging service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether the call was placed locally or received from a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// Why a call reached its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallEndReason {
    /// The remote party hung up an established or ringing call.
    RemoteHangup,
    /// The local user hung up.
    LocalHangup,
    /// The remote party declined the call.
    Rejected,
    /// Nobody answered within the invite lifetime.
    InviteTimeout,
    /// The media stack failed to initialize or lost connectivity.
    MediaError,
    /// Another of the user's own devices answered first.
    AnsweredElsewhere,
    /// The call lost a glare tie-break and was replaced by its twin.
    Replaced,
    /// The manager was shut down while the call was live.
    Shutdown,
}

impl CallEndReason {
    /// Wire-level reason string carried on hangup/reject events.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RemoteHangup => "remote_hangup",
            Self::LocalHangup => "user_hangup",
            Self::Rejected => "rejected",
            Self::InviteTimeout => "invite_timeout",
            Self::MediaError => "media_error",
            Self::AnsweredElsewhere => "answered_elsewhere",
            Self::Replaced => "replaced",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Kind of a session description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// A session description exchanged during call setup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A connectivity candidate proposed for the media path.
///
/// The candidate string follows RFC 5245; the SDP association fields are
/// optional because some peers omit them for trickle candidates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none", default)]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }

    pub fn with_sdp_mid(mut self, sdp_mid: impl Into<String>) -> Self {
        self.sdp_mid = Some(sdp_mid.into());
        self
    }

    pub fn with_sdp_m_line_index(mut self, index: u16) -> Self {
        self.sdp_m_line_index = Some(index);
        self
    }
}
