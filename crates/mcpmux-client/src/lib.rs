//! Upstream MCP client for the mcpmux hub.
//!
//! One [`UpstreamClient`] per configured server. The client owns its
//! transport exclusively, performs the version-negotiating handshake, keeps
//! the pending-request correlation map, and pulls the server's capability
//! catalogs. A single background dispatch task is the sole consumer of the
//! transport's receive side; responses are routed to waiting callers through
//! oneshot channels, notifications and disconnects surface on the event
//! channel handed in at construction.

mod client;
mod error;
mod handshake;
mod pending;

pub use client::{
    Catalog, ClientConfig, ClientEvent, ConnectionState, DEFAULT_MAX_IN_FLIGHT, HandshakeQuirks,
    PendingCall, UpstreamClient,
};
pub use error::ClientError;
