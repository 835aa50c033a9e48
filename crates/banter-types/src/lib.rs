//! Wire types shared by the hub, the REST API and the storage layer.

pub mod api;
pub mod events;
pub mod models;

/// Room every connection joins on connect unless configured otherwise.
pub const DEFAULT_ROOM: &str = "general";
