//! In-process room membership and fan-out.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use parking_lot::RwLock;
use tidal_core::{Event, SessionId};
use tracing::{debug, warn};

use super::BroadcastAdaptor;
use super::index::RoomIndex;
use crate::errors::TransportError;
use crate::metrics::{BROADCAST_DROPS_TOTAL, BROADCAST_RECIPIENTS_TOTAL};
use crate::transport::ConnectionHandle;

/// Lifetime dropped frames after which a slow member is disconnected.
const MAX_TOTAL_DROPS: u64 = 100;

#[derive(Default)]
struct Membership {
    index: RoomIndex,
    handles: HashMap<SessionId, ConnectionHandle>,
}

/// Room membership held in memory, delivering straight to member connections.
///
/// Membership changes and snapshot reads happen under one lock; frames are
/// queued after the lock is released.
#[derive(Default)]
pub struct LocalAdaptor {
    state: RwLock<Membership>,
}

impl LocalAdaptor {
    /// Empty adaptor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member. Returns `false` if it was already in the room.
    pub fn add(&self, room: &str, member: ConnectionHandle) -> bool {
        let mut state = self.state.write();
        let added = state.index.insert(room, member.id());
        let _ = state.handles.entry(member.id().clone()).or_insert(member);
        added
    }

    /// Remove a member from one room. Returns `false` if it was not there.
    pub fn remove(&self, room: &str, session: &SessionId) -> bool {
        let mut state = self.state.write();
        let removed = state.index.remove(room, session);
        if !state.index.contains_session(session) {
            let _ = state.handles.remove(session);
        }
        removed
    }

    /// Remove a member from every room, returning the rooms it left.
    pub fn remove_all(&self, session: &SessionId) -> BTreeSet<String> {
        let mut state = self.state.write();
        let _ = state.handles.remove(session);
        state.index.remove_all(session)
    }

    /// Queue an encoded frame for every member of `room` except `exclude`.
    ///
    /// Returns how many members accepted the frame. Members that are closed
    /// are skipped; members over the drop limit are disconnected.
    pub fn deliver(&self, room: &str, frame: &Arc<String>, exclude: Option<&SessionId>) -> usize {
        let recipients: Vec<ConnectionHandle> = {
            let state = self.state.read();
            state
                .index
                .members_of(room)
                .iter()
                .filter(|id| Some(*id) != exclude)
                .filter_map(|id| state.handles.get(id).cloned())
                .collect()
        };

        let mut delivered = 0;
        for member in &recipients {
            match member.send(Arc::clone(frame)) {
                Ok(()) => delivered += 1,
                Err(TransportError::Backpressure) => {
                    counter!(BROADCAST_DROPS_TOTAL).increment(1);
                    let drops = member.drop_count();
                    if drops >= MAX_TOTAL_DROPS {
                        warn!(session_id = %member.id(), room, drops, "disconnecting slow client");
                        member.close();
                    } else {
                        warn!(session_id = %member.id(), room, total_drops = drops, "outbound buffer full, frame dropped");
                    }
                }
                Err(err) => {
                    debug!(session_id = %member.id(), room, error = %err, "skipping closed member");
                }
            }
        }
        counter!(BROADCAST_RECIPIENTS_TOTAL).increment(delivered as u64);
        debug!(room, recipients = recipients.len(), delivered, "room broadcast");
        delivered
    }

    /// Rooms `session` is in.
    pub fn rooms_of(&self, session: &SessionId) -> BTreeSet<String> {
        self.state.read().index.rooms_of(session)
    }

    /// Members of `room`.
    pub fn members_of(&self, room: &str) -> BTreeSet<SessionId> {
        self.state.read().index.members_of(room)
    }

    /// Number of non-empty rooms.
    pub fn room_count(&self) -> usize {
        self.state.read().index.room_count()
    }
}

/// Encode an event once for fan-out.
pub(crate) fn encode_frame(event: &Event) -> Option<Arc<String>> {
    match event.encode() {
        Ok(frame) => Some(Arc::new(frame)),
        Err(e) => {
            warn!(event = %event.name, error = %e, "failed to encode event");
            None
        }
    }
}

#[async_trait]
impl BroadcastAdaptor for LocalAdaptor {
    async fn join(&self, room: &str, member: ConnectionHandle) {
        let _ = self.add(room, member);
    }

    async fn leave(&self, room: &str, session: &SessionId) {
        let _ = self.remove(room, session);
    }

    async fn leave_all(&self, session: &SessionId) {
        let _ = self.remove_all(session);
    }

    async fn send(&self, room: &str, event: &Event, exclude: Option<&SessionId>) -> usize {
        match encode_frame(event) {
            Some(frame) => self.deliver(room, &frame, exclude),
            None => 0,
        }
    }

    async fn rooms(&self, session: &SessionId) -> BTreeSet<String> {
        self.rooms_of(session)
    }

    async fn members(&self, room: &str) -> BTreeSet<SessionId> {
        self.members_of(room)
    }
}
