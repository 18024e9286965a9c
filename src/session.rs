//! Call session state machine.

use crate::media::MediaSession;
use crate::types::{CallDirection, CallEndReason, CallId, IceCandidate, RoomId, UserId};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Current state of a call session.
///
/// Outgoing calls walk `Fledgling → WaitLocalMedia → CreateOffer →
/// InviteSent → Answered → Connecting → Connected`; incoming calls enter at
/// `Ringing` and join the same path at `Answered`. `Ended` is the only
/// terminal state and records why it was reached.
#[derive(Debug, Clone, Serialize, Default)]
pub enum CallState {
    /// Outgoing call created, media not yet requested.
    #[default]
    Fledgling,
    /// Waiting for the media stack to produce local media.
    WaitLocalMedia,
    /// Local media ready, producing the offer description.
    CreateOffer,
    /// Invite emitted, waiting for the remote answer.
    InviteSent { invite_sent_at: DateTime<Utc> },
    /// Incoming call ringing locally.
    Ringing { received_at: DateTime<Utc> },
    /// Accepted by the remote (outgoing) or by the local user (incoming).
    Answered { answered_at: DateTime<Utc> },
    /// Media stack negotiating connectivity.
    Connecting { answered_at: DateTime<Utc> },
    /// Media path established.
    Connected {
        connected_at: DateTime<Utc>,
        on_hold: bool,
    },
    /// Call over.
    Ended {
        reason: CallEndReason,
        ended_at: DateTime<Utc>,
        duration_secs: Option<i64>,
    },
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended { .. })
    }

    pub fn is_ringing(&self) -> bool {
        matches!(self, Self::Ringing { .. })
    }

    pub fn can_answer(&self) -> bool {
        matches!(self, Self::Ringing { .. })
    }

    pub fn can_reject(&self) -> bool {
        matches!(self, Self::Ringing { .. })
    }

    /// Whether the outgoing invite has not been emitted yet. An invite that
    /// failed to send leaves the session here so the user can retry.
    pub fn is_pre_invite(&self) -> bool {
        matches!(
            self,
            Self::Fledgling | Self::WaitLocalMedia | Self::CreateOffer
        )
    }
}

/// State transitions applied by the manager.
#[derive(Debug, Clone)]
pub enum CallTransition {
    /// Media stack readiness requested for an outgoing call.
    MediaRequested,
    /// Local media/connectivity description is ready.
    LocalMediaReady,
    /// The invite event was accepted by the transport.
    InviteSent,
    /// The remote party answered our invite.
    RemoteAnswered,
    /// The local user accepted an incoming call.
    LocalAnswered,
    /// The media stack started connectivity negotiation.
    ConnectStarted,
    /// First working media path.
    MediaConnected,
    /// Hold flag flipped on an established call.
    HoldChanged { on_hold: bool },
    /// Terminal transition, valid from any non-terminal state.
    Terminated { reason: CallEndReason },
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}

/// Cloneable public snapshot of a call session.
///
/// Returned by manager lookups and carried on "new call" notifications. The
/// session itself stays inside the registry because it owns the media
/// handle.
#[derive(Debug, Clone, Serialize)]
pub struct Call {
    pub call_id: CallId,
    pub room_id: RoomId,
    pub direction: CallDirection,
    pub is_video: bool,
    pub state: CallState,
    pub created_at: DateTime<Utc>,
}

/// One call attempt or established call.
///
/// Owns the media session handle exclusively; the handle is released by the
/// manager before the session leaves the registry.
pub struct CallSession {
    pub call_id: CallId,
    pub room_id: RoomId,
    /// Peer that placed the call (incoming only; outgoing calls learn the
    /// answering party from the answer event).
    pub remote_user: Option<UserId>,
    pub direction: CallDirection,
    pub is_video: bool,
    pub state: CallState,
    pub created_at: DateTime<Utc>,
    /// Party id of the device whose answer we selected.
    pub answered_party_id: Option<String>,
    /// Remote candidates received before the media session could accept
    /// them. Flushed exactly once, in arrival order.
    pending_remote_candidates: Vec<IceCandidate>,
    /// Local candidates gathered before the invite/answer went out.
    pending_local_candidates: Vec<IceCandidate>,
    remote_description_set: bool,
    /// Whether our own invite/answer event has been emitted, i.e. the peer
    /// can associate candidate events with this call.
    signaling_sent: bool,
    /// Offer produced but not yet successfully emitted. Kept so a failed
    /// invite send can be retried without regenerating the description.
    pub(crate) pending_offer: Option<crate::types::SessionDescription>,
    pub(crate) media: Option<Box<dyn MediaSession>>,
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSession")
            .field("call_id", &self.call_id)
            .field("room_id", &self.room_id)
            .field("direction", &self.direction)
            .field("is_video", &self.is_video)
            .field("state", &self.state)
            .field("buffered_candidates", &self.pending_remote_candidates.len())
            .finish()
    }
}

impl CallSession {
    pub fn new_outgoing(
        call_id: CallId,
        room_id: RoomId,
        is_video: bool,
        media: Box<dyn MediaSession>,
    ) -> Self {
        Self {
            call_id,
            room_id,
            remote_user: None,
            direction: CallDirection::Outgoing,
            is_video,
            state: CallState::Fledgling,
            created_at: Utc::now(),
            answered_party_id: None,
            pending_remote_candidates: Vec::new(),
            pending_local_candidates: Vec::new(),
            remote_description_set: false,
            signaling_sent: false,
            pending_offer: None,
            media: Some(media),
        }
    }

    pub fn new_incoming(
        call_id: CallId,
        room_id: RoomId,
        remote_user: UserId,
        is_video: bool,
        media: Box<dyn MediaSession>,
    ) -> Self {
        Self {
            call_id,
            room_id,
            remote_user: Some(remote_user),
            direction: CallDirection::Incoming,
            is_video,
            state: CallState::Ringing {
                received_at: Utc::now(),
            },
            created_at: Utc::now(),
            answered_party_id: None,
            pending_remote_candidates: Vec::new(),
            pending_local_candidates: Vec::new(),
            // The manager applies the invite's offer to the media session
            // right after construction and drains the buffer then.
            remote_description_set: false,
            signaling_sent: false,
            pending_offer: None,
            media: Some(media),
        }
    }

    pub fn snapshot(&self) -> Call {
        Call {
            call_id: self.call_id.clone(),
            room_id: self.room_id.clone(),
            direction: self.direction,
            is_video: self.is_video,
            state: self.state.clone(),
            created_at: self.created_at,
        }
    }

    /// Apply a state transition. Returns an error if the pair is invalid.
    pub fn apply_transition(
        &mut self,
        transition: CallTransition,
    ) -> Result<(), InvalidTransition> {
        let new_state = match (&self.state, transition) {
            (CallState::Fledgling, CallTransition::MediaRequested) => CallState::WaitLocalMedia,
            (CallState::WaitLocalMedia, CallTransition::LocalMediaReady) => CallState::CreateOffer,
            (CallState::CreateOffer, CallTransition::InviteSent) => CallState::InviteSent {
                invite_sent_at: Utc::now(),
            },
            (CallState::InviteSent { .. }, CallTransition::RemoteAnswered) => CallState::Answered {
                answered_at: Utc::now(),
            },
            (CallState::Ringing { .. }, CallTransition::LocalAnswered) => CallState::Answered {
                answered_at: Utc::now(),
            },
            (CallState::Answered { answered_at }, CallTransition::ConnectStarted) => {
                CallState::Connecting {
                    answered_at: *answered_at,
                }
            }
            (CallState::Connecting { .. }, CallTransition::MediaConnected) => {
                CallState::Connected {
                    connected_at: Utc::now(),
                    on_hold: false,
                }
            }
            (CallState::Connected { connected_at, .. }, CallTransition::HoldChanged { on_hold }) => {
                CallState::Connected {
                    connected_at: *connected_at,
                    on_hold,
                }
            }
            (CallState::Connected { connected_at, .. }, CallTransition::Terminated { reason }) => {
                let duration = Utc::now()
                    .signed_duration_since(*connected_at)
                    .num_seconds();
                CallState::Ended {
                    reason,
                    ended_at: Utc::now(),
                    duration_secs: Some(duration),
                }
            }
            (current, CallTransition::Terminated { reason }) if !current.is_terminal() => {
                CallState::Ended {
                    reason,
                    ended_at: Utc::now(),
                    duration_secs: None,
                }
            }
            (current, transition) => {
                return Err(InvalidTransition {
                    current_state: format!("{:?}", current),
                    attempted: format!("{:?}", transition),
                });
            }
        };
        self.state = new_state;
        Ok(())
    }

    /// Whether the media session currently accepts remote candidates.
    pub fn accepts_remote_candidates(&self) -> bool {
        self.remote_description_set && !self.state.is_terminal()
    }

    /// Queue remote candidates until the media session can take them.
    pub fn buffer_remote_candidates(&mut self, candidates: Vec<IceCandidate>) {
        if self.state.is_terminal() {
            return;
        }
        self.pending_remote_candidates.extend(candidates);
    }

    /// Mark the remote description applied and drain the buffer, in arrival
    /// order. Subsequent candidate events bypass the buffer.
    pub fn mark_remote_description_set(&mut self) -> Vec<IceCandidate> {
        self.remote_description_set = true;
        std::mem::take(&mut self.pending_remote_candidates)
    }

    pub fn mark_signaling_sent(&mut self) {
        self.signaling_sent = true;
    }

    pub fn signaling_sent(&self) -> bool {
        self.signaling_sent
    }

    /// Hold back a locally gathered candidate until our invite/answer is out.
    pub fn buffer_local_candidate(&mut self, candidate: IceCandidate) {
        self.pending_local_candidates.push(candidate);
    }

    pub fn take_local_candidates(&mut self) -> Vec<IceCandidate> {
        std::mem::take(&mut self.pending_local_candidates)
    }
}
