//! Two-way room membership index.

use std::collections::{BTreeSet, HashMap};

use tidal_core::SessionId;

/// Room to members and member to rooms, kept in step.
///
/// Empty rooms and member entries are removed as soon as they empty out.
#[derive(Debug, Default)]
pub struct RoomIndex {
    rooms: HashMap<String, BTreeSet<SessionId>>,
    sessions: HashMap<SessionId, BTreeSet<String>>,
}

impl RoomIndex {
    /// Add a membership. Returns `false` if it already existed.
    pub fn insert(&mut self, room: &str, session: &SessionId) -> bool {
        let added = self
            .rooms
            .entry(room.to_owned())
            .or_default()
            .insert(session.clone());
        let _ = self
            .sessions
            .entry(session.clone())
            .or_default()
            .insert(room.to_owned());
        added
    }

    /// Drop a membership. Returns `false` if it did not exist.
    pub fn remove(&mut self, room: &str, session: &SessionId) -> bool {
        let removed = match self.rooms.get_mut(room) {
            Some(members) => {
                let removed = members.remove(session);
                if members.is_empty() {
                    let _ = self.rooms.remove(room);
                }
                removed
            }
            None => false,
        };
        if let Some(rooms) = self.sessions.get_mut(session) {
            let _ = rooms.remove(room);
            if rooms.is_empty() {
                let _ = self.sessions.remove(session);
            }
        }
        removed
    }

    /// Drop every membership of `session`, returning the rooms it was in.
    pub fn remove_all(&mut self, session: &SessionId) -> BTreeSet<String> {
        let rooms = self.sessions.remove(session).unwrap_or_default();
        for room in &rooms {
            if let Some(members) = self.rooms.get_mut(room) {
                let _ = members.remove(session);
                if members.is_empty() {
                    let _ = self.rooms.remove(room);
                }
            }
        }
        rooms
    }

    /// Rooms `session` is in.
    pub fn rooms_of(&self, session: &SessionId) -> BTreeSet<String> {
        self.sessions.get(session).cloned().unwrap_or_default()
    }

    /// Members of `room`.
    pub fn members_of(&self, room: &str) -> BTreeSet<SessionId> {
        self.rooms.get(room).cloned().unwrap_or_default()
    }

    /// Whether `session` belongs to any room.
    pub fn contains_session(&self, session: &SessionId) -> bool {
        self.sessions.contains_key(session)
    }

    /// Number of non-empty rooms.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
