//! mcpmux: a multiplexing hub for the Model Context Protocol.
//!
//! One hub process aggregates many upstream MCP servers (child-process
//! stdio, streamable HTTP, SSE) and presents their union of tools,
//! resources, and prompts to downstream clients as a single MCP endpoint
//! over LSP-framed stdio and streamable HTTP/SSE.
//!
//! Component map:
//! - [`config`]: validated server entries, activation/idle policy, quirks
//! - [`lifecycle`]: per-server state machine, activation dedup, idle engine
//! - [`registry`]: collision-checked public names, per-server purge
//! - [`router`]: downstream dispatch, id translation, deadlines,
//!   cancellation
//! - [`session`]: TTL-bounded downstream sessions
//! - [`fanout`]: progress-token routing onto per-client event streams
//! - [`hub`]: facade wiring everything, startup/shutdown ordering
//! - [`http`] / [`stdio`]: the two downstream endpoints

pub mod cli;
pub mod config;
pub mod error;
pub mod fanout;
pub mod http;
pub mod hub;
pub mod lifecycle;
pub mod registry;
pub mod router;
pub mod session;
pub mod stdio;

pub use config::{ActivationPolicy, HubConfig, HubSettings, ServerConfig};
pub use error::HubError;
pub use hub::Hub;
pub use lifecycle::{ActivationSource, LifecycleManager, ServerState};
pub use registry::Registry;
pub use router::Router;
