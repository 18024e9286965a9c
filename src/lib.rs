//! Call signaling orchestration over a room-based messaging transport.
//!
//! This crate manages the lifecycle of one-to-one voice and video calls
//! whose signaling (invites, answers, ICE candidates, hangups) travels as
//! events in the rooms of a federated messaging service. It owns call state
//! and signaling only; media capture and transport belong to a pluggable
//! media stack behind the [`CallStack`] trait, and event delivery to the
//! room belongs to a [`SignalingBus`] implementation.
//!
//! The entry point is [`CallManager`]:
//!
//! - [`CallManager::place_call`] starts an outgoing call in a room.
//! - [`CallManager::handle_signal`] feeds inbound room events in.
//! - [`CallManager::subscribe_new_calls`] notifies about every new call,
//!   outgoing and incoming, exactly once.
//! - [`CallManager::answer`] / [`CallManager::reject`] /
//!   [`CallManager::hangup`] act on a live call.

mod bus;
mod error;
mod manager;
mod media;
mod registry;
mod session;
mod signaling;
mod turn;
mod types;


pub use bus::{BusError, InboundSignal, SignalingBus};
pub use error::CallError;
pub use manager::{CallManager, CallManagerConfig};
pub use media::{CallStack, MediaConnectionState, MediaError, MediaEvent, MediaSession};
pub use session::{Call, CallState, CallTransition, InvalidTransition};
pub use signaling::{
    AnswerContent, CandidatesContent, HangupContent, InviteContent, NegotiateContent,
    RejectContent, SIGNALING_VERSION, SelectAnswerContent, SignalContent, SignalingEvent,
    SignalingType,
};
pub use turn::{
    TurnConfig, TurnCredentialProvider, TurnCredentialSource, TurnCredentials, TurnError,
};
pub use types::{
    CallDirection, CallEndReason, CallId, IceCandidate, RoomId, SdpType, SessionDescription,
    UserId,
};
