//! # tidal-core
//!
//! Shared vocabulary for the tidal event server crates:
//!
//! - **Branded IDs**: [`SessionId`] and [`NodeId`] as newtypes for type safety
//! - **Event frames**: [`Event`] and the JSON array codec spoken over the wire
//! - **Logging**: `tracing` subscriber setup and log capture for tests

#![deny(unsafe_code)]

pub mod event;
pub mod ids;
pub mod logging;

pub use event::{Event, EventCodecError};
pub use ids::{NodeId, SessionId};
