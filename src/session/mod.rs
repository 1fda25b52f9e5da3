//! Who the tunnel talks to
//!
//! - Peer registry for the server role (registry)
//! - Connection supervisor for the client role (supervisor)

pub mod registry;
pub mod supervisor;

pub use registry::{Peer, PeerRegistry, TouchOutcome};
pub use supervisor::{ConnectionState, ConnectionSupervisor, RetryPolicy};
