//! Call manager: the single entry point for call lifecycle, routing and
//! discovery.
//!
//! Inbound signaling and local actions are serialized through the manager's
//! registry lock; media-stack callbacks arrive on per-session channels and
//! are marshaled back here before touching any call state. Completions that
//! arrive after a call ended find no registry entry and become no-ops.

use crate::bus::{InboundSignal, SignalingBus};
use crate::error::CallError;
use crate::media::{CallStack, MediaConnectionState, MediaEvent};
use crate::registry::CallRegistry;
use crate::session::{Call, CallSession, CallState, CallTransition, InvalidTransition};
use crate::signaling::{
    AnswerContent, CandidatesContent, HangupContent, InviteContent, NegotiateContent,
    RejectContent, SelectAnswerContent, SignalContent,
};
use crate::turn::{TurnCredentialProvider, TurnCredentialSource};
use crate::types::{CallDirection, CallEndReason, CallId, IceCandidate, RoomId, UserId};
use chrono::Utc;
use log::{debug, info, warn};
use rand::RngCore;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{RwLock, broadcast, mpsc};

const NEW_CALL_CHANNEL_CAPACITY: usize = 16;

/// Configuration for the call manager.
#[derive(Debug, Clone)]
pub struct CallManagerConfig {
    /// STUN host substituted when no managed TURN credentials are available.
    pub fallback_stun_host: String,
    /// Validity window attached to outgoing invites, and the ring timeout
    /// for both directions.
    pub invite_lifetime: Duration,
}

impl Default for CallManagerConfig {
    fn default() -> Self {
        Self {
            fallback_stun_host: "stun:stun.l.google.com:19302".to_string(),
            invite_lifetime: Duration::from_secs(30),
        }
    }
}

/// Manages the set of live calls and their signaling.
pub struct CallManager {
    our_user: UserId,
    /// Distinguishes this device's answers from other devices of the same
    /// user in select_answer events.
    party_id: String,
    config: CallManagerConfig,
    bus: Arc<dyn SignalingBus>,
    stack: Arc<dyn CallStack>,
    turn: TurnCredentialProvider,
    calls: RwLock<CallRegistry>,
    new_calls: broadcast::Sender<Call>,
    closed: AtomicBool,
}

impl CallManager {
    pub fn new(
        our_user: UserId,
        bus: Arc<dyn SignalingBus>,
        stack: Arc<dyn CallStack>,
        turn_source: Arc<dyn TurnCredentialSource>,
        config: CallManagerConfig,
    ) -> Arc<Self> {
        let mut bytes = [0u8; 4];
        rand::rng().fill_bytes(&mut bytes);
        let turn = TurnCredentialProvider::new(turn_source, config.fallback_stun_host.clone());
        Arc::new(Self {
            our_user,
            party_id: hex::encode(bytes),
            config,
            bus,
            stack,
            turn,
            calls: RwLock::new(CallRegistry::new()),
            new_calls: broadcast::channel(NEW_CALL_CHANNEL_CAPACITY).0,
            closed: AtomicBool::new(false),
        })
    }

    pub fn our_user(&self) -> &UserId {
        &self.our_user
    }

    pub fn party_id(&self) -> &str {
        &self.party_id
    }

    pub fn turn(&self) -> &TurnCredentialProvider {
        &self.turn
    }

    /// Subscribe to "new call" notifications. Fired exactly once per created
    /// session, outgoing and incoming alike.
    pub fn subscribe_new_calls(&self) -> broadcast::Receiver<Call> {
        self.new_calls.subscribe()
    }

    pub async fn call_with_id(&self, call_id: &CallId) -> Option<Call> {
        self.calls.read().await.get(call_id).map(|s| s.snapshot())
    }

    pub async fn call_in_room(&self, room_id: &RoomId) -> Option<Call> {
        self.calls
            .read()
            .await
            .get_in_room(room_id)
            .map(|s| s.snapshot())
    }

    pub async fn active_calls(&self) -> Vec<Call> {
        self.calls
            .read()
            .await
            .sessions()
            .map(|s| s.snapshot())
            .collect()
    }

    /// Place a voice or video call into a room.
    ///
    /// Fails with `RoomBusy` if the room already holds a live call and with
    /// `NoMediaCapability` if the media stack cannot produce a session. A
    /// TURN refresh is attempted opportunistically; its failure only demotes
    /// the session to the fallback STUN host. A transport send failure is
    /// returned to the caller with the session parked pre-invite; see
    /// [`CallManager::retry_invite`].
    pub async fn place_call(
        self: &Arc<Self>,
        room_id: RoomId,
        video: bool,
    ) -> Result<Call, CallError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CallError::Closed);
        }
        if let Some(existing) = self.calls.read().await.call_id_in_room(&room_id) {
            debug!("Room {} already has call {}", room_id, existing);
            return Err(CallError::RoomBusy(room_id));
        }

        let turn = self.turn.config().await;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let media = self
            .stack
            .create_session(video, turn, events_tx)
            .await
            .map_err(|e| CallError::NoMediaCapability(e.to_string()))?;

        let call_id = CallId::generate();
        let mut session = CallSession::new_outgoing(call_id.clone(), room_id.clone(), video, media);
        let snapshot = session.snapshot();

        {
            let mut calls = self.calls.write().await;
            // close() may have run while the media session was being
            // created; a session registered now would outlive shutdown.
            if self.closed.load(Ordering::SeqCst) {
                drop(calls);
                if let Some(mut media) = session.media.take() {
                    media.terminate().await;
                }
                return Err(CallError::Closed);
            }
            if let Err((mut session, err)) = calls.insert(session) {
                if let Some(mut media) = session.media.take() {
                    media.terminate().await;
                }
                return Err(err);
            }
        }

        info!(
            "Placing {} call {} in room {}",
            if video { "video" } else { "voice" },
            call_id,
            room_id
        );
        let _ = self.new_calls.send(snapshot);
        self.spawn_media_pump(call_id.clone(), events_rx);

        self.drive_outgoing(&call_id).await
    }

    /// Advance a fresh outgoing call up to the emitted invite.
    ///
    /// A media failure ends the session and is reported through the returned
    /// snapshot's state; only a transport send failure surfaces as an error.
    async fn drive_outgoing(self: &Arc<Self>, call_id: &CallId) -> Result<Call, CallError> {
        let (room_id, invite) = {
            let mut calls = self.calls.write().await;
            let session = calls.get_mut(call_id).ok_or_else(|| {
                CallError::NotFound(call_id.clone())
            })?;

            session.apply_transition(CallTransition::MediaRequested)?;

            let Some(media) = session.media.as_mut() else {
                return Err(CallError::NoMediaCapability("media session released".into()));
            };
            let offer = match media.generate_offer().await {
                Ok(offer) => offer,
                Err(e) => {
                    warn!("Offer generation failed for call {}: {}", call_id, e);
                    drop(calls);
                    let ended = self
                        .terminate_call(call_id, CallEndReason::MediaError, None)
                        .await;
                    return ended.ok_or_else(|| CallError::NotFound(call_id.clone()));
                }
            };

            session.apply_transition(CallTransition::LocalMediaReady)?;
            session.pending_offer = Some(offer.clone());
            (
                session.room_id.clone(),
                SignalContent::invite(
                    call_id.clone(),
                    offer,
                    self.config.invite_lifetime.as_millis() as u64,
                ),
            )
        };

        self.emit_invite(call_id, &room_id, invite).await
    }

    /// Re-emit a parked invite after a transport send failure.
    pub async fn retry_invite(self: &Arc<Self>, call_id: &CallId) -> Result<Call, CallError> {
        let (room_id, invite) = {
            let calls = self.calls.read().await;
            let session = calls
                .get(call_id)
                .ok_or_else(|| CallError::NotFound(call_id.clone()))?;
            let Some(offer) = session.pending_offer.clone() else {
                return Err(CallError::InvalidTransition(InvalidTransition {
                    current_state: format!("{:?}", session.state),
                    attempted: "retry_invite".to_string(),
                }));
            };
            (
                session.room_id.clone(),
                SignalContent::invite(
                    call_id.clone(),
                    offer,
                    self.config.invite_lifetime.as_millis() as u64,
                ),
            )
        };

        self.emit_invite(call_id, &room_id, invite).await
    }

    async fn emit_invite(
        self: &Arc<Self>,
        call_id: &CallId,
        room_id: &RoomId,
        invite: SignalContent,
    ) -> Result<Call, CallError> {
        // The session stays in its pre-send state on failure; the transport
        // collaborator owns retries of accepted sends, we only re-emit on an
        // explicit retry_invite.
        self.bus
            .send(room_id, invite.encode())
            .await
            .map_err(|e| CallError::TransportSend(e.to_string()))?;

        let (snapshot, gathered) = {
            let mut calls = self.calls.write().await;
            let session = calls
                .get_mut(call_id)
                .ok_or_else(|| CallError::NotFound(call_id.clone()))?;
            session.apply_transition(CallTransition::InviteSent)?;
            session.pending_offer = None;
            session.mark_signaling_sent();
            (session.snapshot(), session.take_local_candidates())
        };

        self.send_candidates(call_id, room_id, gathered).await;
        self.spawn_invite_timeout(call_id.clone());
        Ok(snapshot)
    }

    /// Accept an incoming call that is ringing locally.
    pub async fn answer(self: &Arc<Self>, call_id: &CallId) -> Result<Call, CallError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CallError::Closed);
        }

        let (room_id, answer) = {
            let mut calls = self.calls.write().await;
            let session = calls
                .get_mut(call_id)
                .ok_or_else(|| CallError::NotFound(call_id.clone()))?;

            // A failed answer send leaves the session in Answered with the
            // event unsent; answering again retries the emission.
            let resend = matches!(session.state, CallState::Answered { .. })
                && !session.signaling_sent();
            if !session.state.can_answer() && !resend {
                return Err(CallError::InvalidTransition(InvalidTransition {
                    current_state: format!("{:?}", session.state),
                    attempted: "LocalAnswered".to_string(),
                }));
            }
            if !resend {
                session.apply_transition(CallTransition::LocalAnswered)?;
            }

            let Some(media) = session.media.as_mut() else {
                return Err(CallError::NoMediaCapability("media session released".into()));
            };
            let description = match media.generate_answer().await {
                Ok(d) => d,
                Err(e) => {
                    warn!("Answer generation failed for call {}: {}", call_id, e);
                    drop(calls);
                    self.terminate_call(
                        call_id,
                        CallEndReason::MediaError,
                        Some(SignalContent::hangup(
                            call_id.clone(),
                            Some(CallEndReason::MediaError.as_str().to_string()),
                        )),
                    )
                    .await;
                    return Err(CallError::NoMediaCapability(e.to_string()));
                }
            };

            (
                session.room_id.clone(),
                SignalContent::answer(
                    call_id.clone(),
                    description,
                    Some(self.party_id.clone()),
                ),
            )
        };

        self.bus
            .send(&room_id, answer.encode())
            .await
            .map_err(|e| CallError::TransportSend(e.to_string()))?;

        let (snapshot, gathered) = {
            let mut calls = self.calls.write().await;
            let session = calls
                .get_mut(call_id)
                .ok_or_else(|| CallError::NotFound(call_id.clone()))?;
            session.mark_signaling_sent();
            (session.snapshot(), session.take_local_candidates())
        };

        info!("Answered call {}", call_id);
        self.send_candidates(call_id, &room_id, gathered).await;
        Ok(snapshot)
    }

    /// Decline an incoming call that is ringing locally.
    pub async fn reject(self: &Arc<Self>, call_id: &CallId) -> Result<(), CallError> {
        {
            let calls = self.calls.read().await;
            let session = calls
                .get(call_id)
                .ok_or_else(|| CallError::NotFound(call_id.clone()))?;
            if !session.state.can_reject() {
                return Err(CallError::InvalidTransition(InvalidTransition {
                    current_state: format!("{:?}", session.state),
                    attempted: "LocalRejected".to_string(),
                }));
            }
        }

        self.terminate_call(
            call_id,
            CallEndReason::Rejected,
            Some(SignalContent::reject(call_id.clone(), None)),
        )
        .await;
        Ok(())
    }

    /// Hang up a call in any non-terminal state.
    pub async fn hangup(self: &Arc<Self>, call_id: &CallId) -> Result<(), CallError> {
        if self.calls.read().await.get(call_id).is_none() {
            return Err(CallError::NotFound(call_id.clone()));
        }
        self.terminate_call(
            call_id,
            CallEndReason::LocalHangup,
            Some(SignalContent::hangup(
                call_id.clone(),
                Some(CallEndReason::LocalHangup.as_str().to_string()),
            )),
        )
        .await;
        Ok(())
    }

    /// Put an established call on hold, or resume it.
    ///
    /// Signaled to the peer as a negotiate event carrying a fresh
    /// description.
    pub async fn hold(self: &Arc<Self>, call_id: &CallId, on_hold: bool) -> Result<Call, CallError> {
        let (room_id, negotiate, snapshot) = {
            let mut calls = self.calls.write().await;
            let session = calls
                .get_mut(call_id)
                .ok_or_else(|| CallError::NotFound(call_id.clone()))?;
            session.apply_transition(CallTransition::HoldChanged { on_hold })?;

            let Some(media) = session.media.as_mut() else {
                return Err(CallError::NoMediaCapability("media session released".into()));
            };
            let description = media
                .generate_offer()
                .await
                .map_err(|e| CallError::NoMediaCapability(e.to_string()))?;
            (
                session.room_id.clone(),
                SignalContent::negotiate(call_id.clone(), description),
                session.snapshot(),
            )
        };

        if let Err(e) = self.bus.send(&room_id, negotiate.encode()).await {
            // The peer was never told; put the flag back.
            let mut calls = self.calls.write().await;
            if let Some(session) = calls.get_mut(call_id) {
                let _ = session.apply_transition(CallTransition::HoldChanged { on_hold: !on_hold });
            }
            return Err(CallError::TransportSend(e.to_string()));
        }
        Ok(snapshot)
    }

    /// Single ingress for inbound signaling events.
    ///
    /// Events for unknown call ids are discarded as stale except invites,
    /// which create an incoming session. Malformed events are logged and
    /// rejected locally; unknown event types are ignored.
    pub async fn handle_signal(self: &Arc<Self>, signal: InboundSignal) {
        if self.closed.load(Ordering::SeqCst) {
            debug!("Manager closed, dropping inbound {}", signal.event.event_type);
            return;
        }

        let content = match SignalContent::decode(&signal.event) {
            Ok(Some(content)) => content,
            Ok(None) => {
                debug!("Ignoring unknown signaling event type {}", signal.event.event_type);
                return;
            }
            Err(e) => {
                warn!("Dropping malformed signaling event: {}", e);
                self.end_malformed_target(&signal).await;
                return;
            }
        };

        debug!(
            "Inbound {} for call {} from {}",
            content.signal_type(),
            content.call_id(),
            signal.sender
        );

        match content {
            SignalContent::Invite(c) => self.handle_invite(signal, c).await,
            SignalContent::Candidates(c) => self.handle_candidates(c).await,
            SignalContent::Answer(c) => self.handle_answer(signal, c).await,
            SignalContent::SelectAnswer(c) => self.handle_select_answer(c).await,
            SignalContent::Hangup(c) => self.handle_hangup(c).await,
            SignalContent::Reject(c) => self.handle_reject(c).await,
            SignalContent::Negotiate(c) => self.handle_negotiate(c).await,
        }
    }

    /// Stop the manager. Calls in progress are ended with reason `Shutdown`.
    /// Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let sessions = self.calls.write().await.drain();
        for mut session in sessions {
            let _ = session.apply_transition(CallTransition::Terminated {
                reason: CallEndReason::Shutdown,
            });
            if let Some(mut media) = session.media.take() {
                media.terminate().await;
            }
            let hangup = SignalContent::hangup(
                session.call_id.clone(),
                Some(CallEndReason::Shutdown.as_str().to_string()),
            );
            if let Err(e) = self.bus.send(&session.room_id, hangup.encode()).await {
                debug!("Shutdown hangup for {} not sent: {}", session.call_id, e);
            }
        }
        info!("Call manager closed");
    }

    // ---- inbound event handling ----

    async fn handle_invite(self: &Arc<Self>, signal: InboundSignal, content: InviteContent) {
        let call_id = content.call_id.clone();

        if self.calls.read().await.get(&call_id).is_some() {
            debug!("Duplicate invite for call {}, ignoring", call_id);
            return;
        }

        // Invites placed by another of our own devices come back to us over
        // the room; they must not ring here.
        if signal.sender == self.our_user {
            debug!("Ignoring our own invite echo for call {}", call_id);
            return;
        }

        // Age the invite against its lifetime; the transport redelivers and
        // reorders, so very old invites are routine.
        let lifetime = Duration::from_millis(content.lifetime_ms);
        let age = Utc::now()
            .signed_duration_since(signal.origin_ts)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if age >= lifetime {
            debug!(
                "Invite for call {} expired {:?} ago, ignoring",
                call_id,
                age - lifetime
            );
            return;
        }
        let ring_for = lifetime - age;

        // Room occupancy and glare, decided under the registry lock.
        enum Occupancy {
            Free,
            Glare { ours: CallId },
            Busy,
        }
        let occupancy = {
            let calls = self.calls.read().await;
            match calls.get_in_room(&signal.room_id) {
                None => Occupancy::Free,
                Some(existing)
                    if existing.direction == CallDirection::Outgoing
                        && matches!(
                            existing.state,
                            CallState::Fledgling
                                | CallState::WaitLocalMedia
                                | CallState::CreateOffer
                                | CallState::InviteSent { .. }
                        ) =>
                {
                    Occupancy::Glare {
                        ours: existing.call_id.clone(),
                    }
                }
                Some(_) => Occupancy::Busy,
            }
        };

        match occupancy {
            Occupancy::Free => {}
            Occupancy::Glare { ours } => {
                // Both sides invited each other concurrently. The
                // lexicographically smaller call id wins deterministically on
                // both ends.
                if call_id < ours {
                    info!(
                        "Glare in room {}: remote call {} wins over {}",
                        signal.room_id, call_id, ours
                    );
                    self.terminate_call(
                        &ours,
                        CallEndReason::Replaced,
                        Some(SignalContent::hangup(
                            ours.clone(),
                            Some(CallEndReason::Replaced.as_str().to_string()),
                        )),
                    )
                    .await;
                    // Fall through and ring the winning invite.
                } else {
                    info!(
                        "Glare in room {}: our call {} wins over {}",
                        signal.room_id, ours, call_id
                    );
                    let reject = SignalContent::reject(
                        call_id.clone(),
                        Some(CallEndReason::Replaced.as_str().to_string()),
                    );
                    if let Err(e) = self.bus.send(&signal.room_id, reject.encode()).await {
                        warn!("Glare reject for call {} not sent: {}", call_id, e);
                    }
                    return;
                }
            }
            Occupancy::Busy => {
                info!(
                    "Invite for call {} in busy room {}, rejecting",
                    call_id, signal.room_id
                );
                let reject = SignalContent::reject(call_id.clone(), Some("busy".to_string()));
                if let Err(e) = self.bus.send(&signal.room_id, reject.encode()).await {
                    warn!("Busy reject for call {} not sent: {}", call_id, e);
                }
                return;
            }
        }

        let is_video = sdp_has_video(&content.offer.sdp);
        let turn = self.turn.config().await;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let media = match self.stack.create_session(is_video, turn, events_tx).await {
            Ok(media) => media,
            Err(e) => {
                warn!("No media capability for incoming call {}: {}", call_id, e);
                let reject = SignalContent::reject(
                    call_id.clone(),
                    Some(CallEndReason::MediaError.as_str().to_string()),
                );
                if let Err(e) = self.bus.send(&signal.room_id, reject.encode()).await {
                    warn!("Media reject for call {} not sent: {}", call_id, e);
                }
                return;
            }
        };

        let mut session = CallSession::new_incoming(
            call_id.clone(),
            signal.room_id.clone(),
            signal.sender.clone(),
            is_video,
            media,
        );

        if let Some(media) = session.media.as_mut()
            && let Err(e) = media.set_remote_description(content.offer).await
        {
            warn!("Remote offer rejected by media stack for call {}: {}", call_id, e);
            if let Some(mut media) = session.media.take() {
                media.terminate().await;
            }
            let reject = SignalContent::reject(
                call_id.clone(),
                Some(CallEndReason::MediaError.as_str().to_string()),
            );
            if let Err(e) = self.bus.send(&signal.room_id, reject.encode()).await {
                warn!("Media reject for call {} not sent: {}", call_id, e);
            }
            return;
        }
        session.mark_remote_description_set();

        let snapshot = session.snapshot();
        {
            let mut calls = self.calls.write().await;
            // Same shutdown race as placement: the manager may have closed
            // while the media session was being created.
            if self.closed.load(Ordering::SeqCst) {
                drop(calls);
                debug!("Manager closed, dropping incoming call {}", call_id);
                if let Some(mut media) = session.media.take() {
                    media.terminate().await;
                }
                return;
            }
            if let Err((mut session, err)) = calls.insert(session) {
                // Lost a race for the room between the occupancy check and
                // the insert.
                warn!("Dropping incoming call {}: {}", session.call_id, err);
                if let Some(mut media) = session.media.take() {
                    media.terminate().await;
                }
                return;
            }
        }

        info!(
            "Incoming {} call {} ringing in room {} (rings for {:?})",
            if is_video { "video" } else { "voice" },
            call_id,
            signal.room_id,
            ring_for
        );
        let _ = self.new_calls.send(snapshot);
        self.spawn_media_pump(call_id.clone(), events_rx);
        self.spawn_ring_timeout(call_id, ring_for);
    }

    async fn handle_candidates(self: &Arc<Self>, content: CandidatesContent) {
        let mut calls = self.calls.write().await;
        let Some(session) = calls.get_mut(&content.call_id) else {
            debug!("Candidates for unknown call {}, discarding", content.call_id);
            return;
        };

        if session.accepts_remote_candidates() {
            if let Some(media) = session.media.as_mut()
                && let Err(e) = media.add_remote_candidates(content.candidates).await
            {
                warn!("Media stack rejected candidates for call {}: {}", content.call_id, e);
            }
        } else {
            session.buffer_remote_candidates(content.candidates);
        }
    }

    async fn handle_answer(self: &Arc<Self>, signal: InboundSignal, content: AnswerContent) {
        let call_id = content.call_id.clone();

        enum Outcome {
            None,
            SelectAnswer { room_id: RoomId, party_id: String },
            AnsweredElsewhere,
            MediaFailed,
        }

        let outcome = {
            let mut calls = self.calls.write().await;
            let Some(session) = calls.get_mut(&call_id) else {
                debug!("Answer for unknown call {}, discarding", call_id);
                return;
            };

            match session.direction {
                CallDirection::Outgoing => {
                    if !matches!(session.state, CallState::InviteSent { .. }) {
                        debug!(
                            "Answer for call {} in state {:?}, ignoring",
                            call_id, session.state
                        );
                        Outcome::None
                    } else if let Err(e) =
                        session.apply_transition(CallTransition::RemoteAnswered)
                    {
                        debug!("Answer for call {}: {}", call_id, e);
                        Outcome::None
                    } else {
                        session.answered_party_id = content.party_id.clone();
                        let Some(media) = session.media.as_mut() else {
                            return;
                        };
                        match media.set_remote_description(content.answer).await {
                            Ok(()) => {
                                let buffered = session.mark_remote_description_set();
                                if !buffered.is_empty()
                                    && let Some(media) = session.media.as_mut()
                                    && let Err(e) = media.add_remote_candidates(buffered).await
                                {
                                    warn!(
                                        "Buffered candidates rejected for call {}: {}",
                                        call_id, e
                                    );
                                }
                                info!("Call {} answered by remote", call_id);
                                match content.party_id {
                                    Some(party_id) => Outcome::SelectAnswer {
                                        room_id: session.room_id.clone(),
                                        party_id,
                                    },
                                    None => Outcome::None,
                                }
                            }
                            Err(e) => {
                                warn!(
                                    "Remote answer rejected by media stack for call {}: {}",
                                    call_id, e
                                );
                                Outcome::MediaFailed
                            }
                        }
                    }
                }
                CallDirection::Incoming => {
                    // An answer from another of our own devices to a call we
                    // are still ringing for means it was picked up there.
                    if signal.sender == self.our_user && session.state.is_ringing() {
                        Outcome::AnsweredElsewhere
                    } else {
                        debug!("Ignoring answer for incoming call {}", call_id);
                        Outcome::None
                    }
                }
            }
        };

        match outcome {
            Outcome::None => {}
            Outcome::SelectAnswer { room_id, party_id } => {
                let select = SignalContent::select_answer(call_id.clone(), party_id);
                if let Err(e) = self.bus.send(&room_id, select.encode()).await {
                    warn!("select_answer for call {} not sent: {}", call_id, e);
                }
            }
            Outcome::AnsweredElsewhere => {
                info!("Call {} answered on another device", call_id);
                self.terminate_call(&call_id, CallEndReason::AnsweredElsewhere, None)
                    .await;
            }
            Outcome::MediaFailed => {
                self.terminate_call(
                    &call_id,
                    CallEndReason::MediaError,
                    Some(SignalContent::hangup(
                        call_id.clone(),
                        Some(CallEndReason::MediaError.as_str().to_string()),
                    )),
                )
                .await;
            }
        }
    }

    async fn handle_select_answer(self: &Arc<Self>, content: SelectAnswerContent) {
        let ended_elsewhere = {
            let calls = self.calls.read().await;
            match calls.get(&content.call_id) {
                Some(session) => {
                    session.direction == CallDirection::Incoming
                        && content.selected_party_id != self.party_id
                }
                None => {
                    debug!(
                        "select_answer for unknown call {}, discarding",
                        content.call_id
                    );
                    false
                }
            }
        };

        if ended_elsewhere {
            info!(
                "Caller selected another device's answer for call {}",
                content.call_id
            );
            self.terminate_call(&content.call_id, CallEndReason::AnsweredElsewhere, None)
                .await;
        }
    }

    async fn handle_hangup(self: &Arc<Self>, content: HangupContent) {
        if self.calls.read().await.get(&content.call_id).is_none() {
            debug!("Hangup for unknown call {}, discarding", content.call_id);
            return;
        }
        let reason = match content.reason.as_deref() {
            Some("replaced") => CallEndReason::Replaced,
            Some("invite_timeout") => CallEndReason::InviteTimeout,
            _ => CallEndReason::RemoteHangup,
        };
        self.terminate_call(&content.call_id, reason, None).await;
    }

    async fn handle_reject(self: &Arc<Self>, content: RejectContent) {
        if self.calls.read().await.get(&content.call_id).is_none() {
            debug!("Reject for unknown call {}, discarding", content.call_id);
            return;
        }
        let reason = match content.reason.as_deref() {
            Some("replaced") => CallEndReason::Replaced,
            _ => CallEndReason::Rejected,
        };
        self.terminate_call(&content.call_id, reason, None).await;
    }

    async fn handle_negotiate(self: &Arc<Self>, content: NegotiateContent) {
        let mut calls = self.calls.write().await;
        let Some(session) = calls.get_mut(&content.call_id) else {
            debug!("Negotiate for unknown call {}, discarding", content.call_id);
            return;
        };
        if let Some(media) = session.media.as_mut()
            && let Err(e) = media.set_remote_description(content.description).await
        {
            warn!(
                "Negotiate description rejected for call {}: {}",
                content.call_id, e
            );
        }
    }

    /// A malformed event naming a live call ends that call; otherwise the
    /// event is just dropped.
    async fn end_malformed_target(self: &Arc<Self>, signal: &InboundSignal) {
        let Some(raw_id) = signal
            .event
            .content
            .get("call_id")
            .and_then(|v| v.as_str())
        else {
            return;
        };
        let call_id = CallId::new(raw_id);
        if self.calls.read().await.get(&call_id).is_some() {
            warn!("Ending call {} after malformed signaling", call_id);
            self.terminate_call(&call_id, CallEndReason::MediaError, None)
                .await;
        }
    }

    // ---- media stack events ----

    fn spawn_media_pump(
        self: &Arc<Self>,
        call_id: CallId,
        mut events: mpsc::UnboundedReceiver<MediaEvent>,
    ) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                manager.handle_media_event(&call_id, event).await;
            }
        });
    }

    async fn handle_media_event(self: &Arc<Self>, call_id: &CallId, event: MediaEvent) {
        match event {
            MediaEvent::LocalCandidate(candidate) => {
                let outbound = {
                    let mut calls = self.calls.write().await;
                    let Some(session) = calls.get_mut(call_id) else {
                        // Gathering completed after the call ended.
                        return;
                    };
                    if session.signaling_sent() {
                        Some((session.room_id.clone(), vec![candidate]))
                    } else {
                        session.buffer_local_candidate(candidate);
                        None
                    }
                };
                if let Some((room_id, candidates)) = outbound {
                    self.send_candidates(call_id, &room_id, candidates).await;
                }
            }
            MediaEvent::ConnectionState(state) => {
                self.handle_connection_state(call_id, state).await;
            }
        }
    }

    async fn handle_connection_state(
        self: &Arc<Self>,
        call_id: &CallId,
        state: MediaConnectionState,
    ) {
        match state {
            MediaConnectionState::Checking => {
                let mut calls = self.calls.write().await;
                let Some(session) = calls.get_mut(call_id) else {
                    return;
                };
                if matches!(session.state, CallState::Answered { .. })
                    && let Err(e) = session.apply_transition(CallTransition::ConnectStarted)
                {
                    debug!("Connect start for call {}: {}", call_id, e);
                }
            }
            MediaConnectionState::Connected => {
                let mut calls = self.calls.write().await;
                let Some(session) = calls.get_mut(call_id) else {
                    return;
                };
                // Some stacks report connected without an explicit checking
                // phase.
                if matches!(session.state, CallState::Answered { .. }) {
                    let _ = session.apply_transition(CallTransition::ConnectStarted);
                }
                if matches!(session.state, CallState::Connecting { .. }) {
                    if session.apply_transition(CallTransition::MediaConnected).is_ok() {
                        info!("Call {} connected", call_id);
                    }
                }
            }
            MediaConnectionState::Failed => {
                if self.calls.read().await.get(call_id).is_none() {
                    return;
                }
                warn!("Media path failed for call {}", call_id);
                self.terminate_call(
                    call_id,
                    CallEndReason::MediaError,
                    Some(SignalContent::hangup(
                        call_id.clone(),
                        Some(CallEndReason::MediaError.as_str().to_string()),
                    )),
                )
                .await;
            }
            MediaConnectionState::Closed => {
                // Normal after our own terminate; anything else means the
                // stack tore the session down underneath us.
                if self.calls.read().await.get(call_id).is_some() {
                    warn!("Media session closed unexpectedly for call {}", call_id);
                    self.terminate_call(call_id, CallEndReason::MediaError, None)
                        .await;
                }
            }
        }
    }

    // ---- timers ----

    fn spawn_invite_timeout(self: &Arc<Self>, call_id: CallId) {
        let manager = Arc::clone(self);
        let lifetime = self.config.invite_lifetime;
        tokio::spawn(async move {
            tokio::time::sleep(lifetime).await;
            let still_waiting = matches!(
                manager.calls.read().await.get(&call_id).map(|s| &s.state),
                Some(CallState::InviteSent { .. })
            );
            if still_waiting {
                info!("Call {} not answered within {:?}", call_id, lifetime);
                manager
                    .terminate_call(
                        &call_id,
                        CallEndReason::InviteTimeout,
                        Some(SignalContent::hangup(
                            call_id.clone(),
                            Some(CallEndReason::InviteTimeout.as_str().to_string()),
                        )),
                    )
                    .await;
            }
        });
    }

    fn spawn_ring_timeout(self: &Arc<Self>, call_id: CallId, ring_for: Duration) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(ring_for).await;
            let still_ringing = matches!(
                manager.calls.read().await.get(&call_id).map(|s| &s.state),
                Some(CallState::Ringing { .. })
            );
            if still_ringing {
                info!("Incoming call {} expired unanswered", call_id);
                // The caller times out on its own; no hangup is signaled.
                manager
                    .terminate_call(&call_id, CallEndReason::InviteTimeout, None)
                    .await;
            }
        });
    }

    // ---- teardown ----

    /// Remove a session from both indices, release its media handle and
    /// optionally emit a final signaling event. Returns the terminal
    /// snapshot, or `None` if the call was already gone.
    async fn terminate_call(
        &self,
        call_id: &CallId,
        reason: CallEndReason,
        signal: Option<SignalContent>,
    ) -> Option<Call> {
        let mut session = {
            let mut calls = self.calls.write().await;
            calls.remove(call_id)?
        };

        let _ = session.apply_transition(CallTransition::Terminated { reason });
        if let Some(mut media) = session.media.take() {
            media.terminate().await;
        }
        let snapshot = session.snapshot();

        if let Some(content) = signal
            && let Err(e) = self.bus.send(&session.room_id, content.encode()).await
        {
            warn!("Final signaling for call {} not sent: {}", call_id, e);
        }

        info!("Call {} ended: {:?}", call_id, reason);
        Some(snapshot)
    }

    async fn send_candidates(
        &self,
        call_id: &CallId,
        room_id: &RoomId,
        candidates: Vec<IceCandidate>,
    ) {
        if candidates.is_empty() {
            return;
        }
        let event = SignalContent::candidates(call_id.clone(), candidates);
        if let Err(e) = self.bus.send(room_id, event.encode()).await {
            warn!("Candidates for call {} not sent: {}", call_id, e);
        }
    }
}

/// Video calls are recognized by a video media section in the offer.
fn sdp_has_video(sdp: &str) -> bool {
    sdp.lines().any(|line| line.starts_with("m=video"))
}
