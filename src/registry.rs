//! Call registry: the manager's index of live sessions.
//!
//! Every live session appears under exactly one call id, and a room holds at
//! most one live session at a time. Entries leave both indices together when
//! a session reaches its terminal state; nothing else removes them.

use crate::error::CallError;
use crate::session::CallSession;
use crate::types::{CallId, RoomId};
use std::collections::HashMap;

#[derive(Default)]
pub struct CallRegistry {
    by_call: HashMap<CallId, CallSession>,
    by_room: HashMap<RoomId, CallId>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session under both indices.
    ///
    /// Fails with `RoomBusy` if the room already holds a live session and
    /// `AlreadyExists` on a duplicate call id; the caller keeps the session
    /// either way (it is handed back inside the error path by not being
    /// consumed before the checks pass).
    pub fn insert(&mut self, session: CallSession) -> Result<(), (CallSession, CallError)> {
        if self.by_call.contains_key(&session.call_id) {
            let id = session.call_id.clone();
            return Err((session, CallError::AlreadyExists(id)));
        }
        if self.by_room.contains_key(&session.room_id) {
            let room = session.room_id.clone();
            return Err((session, CallError::RoomBusy(room)));
        }

        self.by_room
            .insert(session.room_id.clone(), session.call_id.clone());
        self.by_call.insert(session.call_id.clone(), session);
        Ok(())
    }

    pub fn get(&self, call_id: &CallId) -> Option<&CallSession> {
        self.by_call.get(call_id)
    }

    pub fn get_mut(&mut self, call_id: &CallId) -> Option<&mut CallSession> {
        self.by_call.get_mut(call_id)
    }

    pub fn get_in_room(&self, room_id: &RoomId) -> Option<&CallSession> {
        self.by_room.get(room_id).and_then(|id| self.by_call.get(id))
    }

    pub fn call_id_in_room(&self, room_id: &RoomId) -> Option<&CallId> {
        self.by_room.get(room_id)
    }

    /// Remove a session from both indices atomically.
    pub fn remove(&mut self, call_id: &CallId) -> Option<CallSession> {
        let session = self.by_call.remove(call_id)?;
        self.by_room.remove(&session.room_id);
        Some(session)
    }

    /// Drain every session, clearing both indices.
    pub fn drain(&mut self) -> Vec<CallSession> {
        self.by_room.clear();
        self.by_call.drain().map(|(_, s)| s).collect()
    }

    pub fn sessions(&self) -> impl Iterator<Item = &CallSession> {
        self.by_call.values()
    }

    pub fn len(&self) -> usize {
        self.by_call.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_call.is_empty()
    }
}
