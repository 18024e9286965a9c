//! Media stack capability abstraction.
//!
//! The actual media engine (codec negotiation, ICE, transport) lives behind
//! these traits. Variants correspond to different underlying engines,
//! selected at configuration time when constructing the manager.

use crate::turn::TurnConfig;
use crate::types::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("media stack unavailable: {0}")]
    Unavailable(String),

    #[error("media operation failed: {0}")]
    Failed(String),
}

/// Connectivity state reported by a media session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaConnectionState {
    /// Negotiation started, probing candidate pairs.
    Checking,
    /// A working media path is established.
    Connected,
    /// Connectivity was lost or could not be established.
    Failed,
    /// The session was torn down.
    Closed,
}

/// Asynchronous event pushed by a media session.
///
/// Events are delivered on the channel handed to
/// [`CallStack::create_session`] and marshaled onto the manager's serialized
/// context before touching call state.
#[derive(Debug, Clone)]
pub enum MediaEvent {
    /// A locally gathered connectivity candidate to signal to the peer.
    LocalCandidate(IceCandidate),
    ConnectionState(MediaConnectionState),
}

/// Pluggable media engine.
#[async_trait]
pub trait CallStack: Send + Sync {
    /// Create a media session for one call.
    ///
    /// `events` receives candidates and connectivity changes for the
    /// session's whole lifetime; implementations drop the sender when the
    /// session is terminated.
    async fn create_session(
        &self,
        video: bool,
        turn: TurnConfig,
        events: mpsc::UnboundedSender<MediaEvent>,
    ) -> Result<Box<dyn MediaSession>, MediaError>;
}

/// One call's media-engine session. Owned exclusively by its call session.
#[async_trait]
pub trait MediaSession: Send + Sync {
    async fn generate_offer(&mut self) -> Result<SessionDescription, MediaError>;

    async fn generate_answer(&mut self) -> Result<SessionDescription, MediaError>;

    async fn set_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), MediaError>;

    async fn add_remote_candidates(
        &mut self,
        candidates: Vec<IceCandidate>,
    ) -> Result<(), MediaError>;

    /// Release the underlying resources. Must be safe to call once the call
    /// reaches a terminal state; further calls on the handle are not made.
    async fn terminate(&mut self);
}
