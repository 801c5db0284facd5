//! Room membership and room-scoped delivery.
//!
//! A [`BroadcastAdaptor`] is the single source of truth for which sessions
//! are in which rooms of a namespace. [`LocalAdaptor`] keeps everything in
//! process; [`ClusterAdaptor`] mirrors membership and fans broadcasts out to
//! other nodes over a [`ClusterBus`](crate::bus::ClusterBus).

use std::collections::BTreeSet;

use async_trait::async_trait;
use tidal_core::{Event, SessionId};

use crate::transport::ConnectionHandle;

pub mod cluster;
pub mod index;
pub mod local;

pub use cluster::{ClusterAdaptor, ClusterMessage};
pub use index::RoomIndex;
pub use local::LocalAdaptor;

/// Membership and delivery backend for one namespace.
///
/// Implementations must tolerate concurrent calls for the same session and
/// room; every operation is atomic with respect to the others.
#[async_trait]
pub trait BroadcastAdaptor: Send + Sync {
    /// Add the session behind `member` to `room`. Joining twice is a no-op.
    async fn join(&self, room: &str, member: ConnectionHandle);

    /// Remove `session` from `room`. Unknown pairs are ignored.
    async fn leave(&self, room: &str, session: &SessionId);

    /// Remove `session` from every room.
    async fn leave_all(&self, session: &SessionId);

    /// Deliver `event` to every member of `room` except `exclude`.
    ///
    /// Returns the number of local recipients the frame was queued for.
    /// Delivery to one recipient never waits on another.
    async fn send(&self, room: &str, event: &Event, exclude: Option<&SessionId>) -> usize;

    /// Rooms `session` belongs to.
    async fn rooms(&self, session: &SessionId) -> BTreeSet<String>;

    /// Sessions in `room`.
    async fn members(&self, room: &str) -> BTreeSet<SessionId>;
}
