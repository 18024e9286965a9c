//! Event-bus seam to the messaging transport.
//!
//! The transport owns room membership, encryption and retry/backoff; this
//! crate only needs to hand it outbound signaling events and be fed inbound
//! ones tagged with their room and sender.

use crate::signaling::SignalingEvent;
use crate::types::{RoomId, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("event send failed: {0}")]
    Send(String),
}

/// Outbound half of the transport.
#[async_trait]
pub trait SignalingBus: Send + Sync {
    /// Send a signaling event into a room. Retries and backoff are the
    /// transport's concern; an error here means the send was not accepted.
    async fn send(&self, room_id: &RoomId, event: SignalingEvent) -> Result<(), BusError>;
}

/// An inbound signaling event as delivered by the transport.
#[derive(Debug, Clone)]
pub struct InboundSignal {
    pub room_id: RoomId,
    pub sender: UserId,
    /// Origin timestamp stamped by the sending server. Used to age invites
    /// against their lifetime; the transport gives no ordering guarantee.
    pub origin_ts: DateTime<Utc>,
    pub event: SignalingEvent,
}
