//! Call-related error types.

use crate::types::{CallId, RoomId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("call not found: {0}")]
    NotFound(CallId),

    #[error("room already has a live call: {0}")]
    RoomBusy(RoomId),

    #[error("call already exists: {0}")]
    AlreadyExists(CallId),

    #[error("media stack unavailable: {0}")]
    NoMediaCapability(String),

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] crate::session::InvalidTransition),

    #[error("malformed signaling event: {0}")]
    MalformedSignaling(String),

    #[error("signaling send failed: {0}")]
    TransportSend(String),

    #[error("call manager is closed")]
    Closed,
}
