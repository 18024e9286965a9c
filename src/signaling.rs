//! Signaling event definitions and wire codec.
//!
//! Signaling events are protocol-level messages (invite, candidates, answer,
//! hangup, ...) carried by the messaging transport as typed JSON bodies,
//! distinct from media traffic. Inbound bodies are validated here; a missing
//! call id or an empty description is rejected as malformed rather than
//! allowed to reach the state machine.

use crate::error::CallError;
use crate::types::{CallId, IceCandidate, SessionDescription};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Protocol version carried on every event. Mismatched versions from peers
/// are tolerated, not rejected.
pub const SIGNALING_VERSION: &str = "1";

/// The signaling event kinds used for call control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalingType {
    /// Initial call offer. Creates the remote session when first seen.
    Invite,
    /// Trickled connectivity candidates.
    Candidates,
    /// Call accepted by the callee.
    Answer,
    /// Caller's choice among answers from multiple callee devices.
    SelectAnswer,
    /// Call ended by either party.
    Hangup,
    /// Call declined by the callee.
    Reject,
    /// Mid-call description exchange (e.g. hold).
    Negotiate,
}

impl SignalingType {
    pub const ALL: [SignalingType; 7] = [
        Self::Invite,
        Self::Candidates,
        Self::Answer,
        Self::SelectAnswer,
        Self::Hangup,
        Self::Reject,
        Self::Negotiate,
    ];

    /// Event type tag used on the wire.
    pub const fn tag_name(&self) -> &'static str {
        match self {
            Self::Invite => "invite",
            Self::Candidates => "candidates",
            Self::Answer => "answer",
            Self::SelectAnswer => "select_answer",
            Self::Hangup => "hangup",
            Self::Reject => "reject",
            Self::Negotiate => "negotiate",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "invite" => Some(Self::Invite),
            "candidates" => Some(Self::Candidates),
            "answer" => Some(Self::Answer),
            "select_answer" => Some(Self::SelectAnswer),
            "hangup" => Some(Self::Hangup),
            "reject" => Some(Self::Reject),
            "negotiate" => Some(Self::Negotiate),
            _ => None,
        }
    }

    /// Whether this kind affects the call lifecycle directly.
    pub const fn is_critical(&self) -> bool {
        matches!(
            self,
            Self::Invite | Self::Answer | Self::Hangup | Self::Reject
        )
    }
}

impl fmt::Display for SignalingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag_name())
    }
}

fn default_version() -> String {
    SIGNALING_VERSION.to_string()
}

const fn default_lifetime_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteContent {
    pub call_id: CallId,
    #[serde(default = "default_version")]
    pub version: String,
    /// How long the invite is valid for, in milliseconds. An invite older
    /// than this rings only for the residual time.
    #[serde(rename = "lifetime", default = "default_lifetime_ms")]
    pub lifetime_ms: u64,
    pub offer: SessionDescription,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidatesContent {
    pub call_id: CallId,
    #[serde(default = "default_version")]
    pub version: String,
    pub candidates: Vec<IceCandidate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerContent {
    pub call_id: CallId,
    #[serde(default = "default_version")]
    pub version: String,
    /// Identifies which of the callee's devices produced this answer.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub party_id: Option<String>,
    pub answer: SessionDescription,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectAnswerContent {
    pub call_id: CallId,
    #[serde(default = "default_version")]
    pub version: String,
    pub selected_party_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HangupContent {
    pub call_id: CallId,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectContent {
    pub call_id: CallId,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiateContent {
    pub call_id: CallId,
    #[serde(default = "default_version")]
    pub version: String,
    pub description: SessionDescription,
}

/// A signaling event in wire form: a type tag plus a JSON body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingEvent {
    pub event_type: String,
    pub content: Value,
}

/// A decoded, validated signaling event body.
#[derive(Debug, Clone)]
pub enum SignalContent {
    Invite(InviteContent),
    Candidates(CandidatesContent),
    Answer(AnswerContent),
    SelectAnswer(SelectAnswerContent),
    Hangup(HangupContent),
    Reject(RejectContent),
    Negotiate(NegotiateContent),
}

impl SignalContent {
    pub fn signal_type(&self) -> SignalingType {
        match self {
            Self::Invite(_) => SignalingType::Invite,
            Self::Candidates(_) => SignalingType::Candidates,
            Self::Answer(_) => SignalingType::Answer,
            Self::SelectAnswer(_) => SignalingType::SelectAnswer,
            Self::Hangup(_) => SignalingType::Hangup,
            Self::Reject(_) => SignalingType::Reject,
            Self::Negotiate(_) => SignalingType::Negotiate,
        }
    }

    pub fn call_id(&self) -> &CallId {
        match self {
            Self::Invite(c) => &c.call_id,
            Self::Candidates(c) => &c.call_id,
            Self::Answer(c) => &c.call_id,
            Self::SelectAnswer(c) => &c.call_id,
            Self::Hangup(c) => &c.call_id,
            Self::Reject(c) => &c.call_id,
            Self::Negotiate(c) => &c.call_id,
        }
    }

    pub fn invite(call_id: CallId, offer: SessionDescription, lifetime_ms: u64) -> Self {
        Self::Invite(InviteContent {
            call_id,
            version: default_version(),
            lifetime_ms,
            offer,
        })
    }

    pub fn candidates(call_id: CallId, candidates: Vec<IceCandidate>) -> Self {
        Self::Candidates(CandidatesContent {
            call_id,
            version: default_version(),
            candidates,
        })
    }

    pub fn answer(call_id: CallId, answer: SessionDescription, party_id: Option<String>) -> Self {
        Self::Answer(AnswerContent {
            call_id,
            version: default_version(),
            party_id,
            answer,
        })
    }

    pub fn select_answer(call_id: CallId, selected_party_id: String) -> Self {
        Self::SelectAnswer(SelectAnswerContent {
            call_id,
            version: default_version(),
            selected_party_id,
        })
    }

    pub fn hangup(call_id: CallId, reason: Option<String>) -> Self {
        Self::Hangup(HangupContent {
            call_id,
            version: default_version(),
            reason,
        })
    }

    pub fn reject(call_id: CallId, reason: Option<String>) -> Self {
        Self::Reject(RejectContent {
            call_id,
            version: default_version(),
            reason,
        })
    }

    pub fn negotiate(call_id: CallId, description: SessionDescription) -> Self {
        Self::Negotiate(NegotiateContent {
            call_id,
            version: default_version(),
            description,
        })
    }

    /// Encode into wire form. Serialization of these bodies cannot fail.
    pub fn encode(&self) -> SignalingEvent {
        let (event_type, content) = match self {
            Self::Invite(c) => (SignalingType::Invite, serde_json::to_value(c)),
            Self::Candidates(c) => (SignalingType::Candidates, serde_json::to_value(c)),
            Self::Answer(c) => (SignalingType::Answer, serde_json::to_value(c)),
            Self::SelectAnswer(c) => (SignalingType::SelectAnswer, serde_json::to_value(c)),
            Self::Hangup(c) => (SignalingType::Hangup, serde_json::to_value(c)),
            Self::Reject(c) => (SignalingType::Reject, serde_json::to_value(c)),
            Self::Negotiate(c) => (SignalingType::Negotiate, serde_json::to_value(c)),
        };
        SignalingEvent {
            event_type: event_type.tag_name().to_string(),
            content: content.unwrap_or(Value::Null),
        }
    }

    /// Decode and validate a wire event.
    ///
    /// Returns `Ok(None)` for unknown event types: late additions to the
    /// protocol must be ignored, not treated as fatal.
    pub fn decode(event: &SignalingEvent) -> Result<Option<Self>, CallError> {
        let Some(signal_type) = SignalingType::from_tag(&event.event_type) else {
            return Ok(None);
        };

        let malformed = |e: serde_json::Error| {
            CallError::MalformedSignaling(format!("{}: {}", signal_type, e))
        };

        let content = match signal_type {
            SignalingType::Invite => {
                let c: InviteContent =
                    serde_json::from_value(event.content.clone()).map_err(malformed)?;
                require_sdp(signal_type, &c.offer)?;
                Self::Invite(c)
            }
            SignalingType::Candidates => {
                let c: CandidatesContent =
                    serde_json::from_value(event.content.clone()).map_err(malformed)?;
                if c.candidates.iter().any(|cand| cand.candidate.is_empty()) {
                    return Err(CallError::MalformedSignaling(
                        "candidates: empty candidate data".into(),
                    ));
                }
                Self::Candidates(c)
            }
            SignalingType::Answer => {
                let c: AnswerContent =
                    serde_json::from_value(event.content.clone()).map_err(malformed)?;
                require_sdp(signal_type, &c.answer)?;
                Self::Answer(c)
            }
            SignalingType::SelectAnswer => {
                let c: SelectAnswerContent =
                    serde_json::from_value(event.content.clone()).map_err(malformed)?;
                if c.selected_party_id.is_empty() {
                    return Err(CallError::MalformedSignaling(
                        "select_answer: empty selected_party_id".into(),
                    ));
                }
                Self::SelectAnswer(c)
            }
            SignalingType::Hangup => Self::Hangup(
                serde_json::from_value(event.content.clone()).map_err(malformed)?,
            ),
            SignalingType::Reject => Self::Reject(
                serde_json::from_value(event.content.clone()).map_err(malformed)?,
            ),
            SignalingType::Negotiate => {
                let c: NegotiateContent =
                    serde_json::from_value(event.content.clone()).map_err(malformed)?;
                require_sdp(signal_type, &c.description)?;
                Self::Negotiate(c)
            }
        };

        if content.call_id().is_empty() {
            return Err(CallError::MalformedSignaling(format!(
                "{}: empty call_id",
                signal_type
            )));
        }

        Ok(Some(content))
    }
}

fn require_sdp(
    signal_type: SignalingType,
    description: &SessionDescription,
) -> Result<(), CallError> {
    if description.sdp.is_empty() {
        return Err(CallError::MalformedSignaling(format!(
            "{}: empty session description",
            signal_type
        )));
    }
    Ok(())
}
