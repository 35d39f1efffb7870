//! Front-end transports: the streamable-HTTP listener (with deprecated SSE
//! endpoints, liveness and metrics), the stdio front-end, and the runtime
//! that wires both to the shared control plane.

pub mod auth;
pub mod http;
pub mod run;
pub mod service;
pub mod stdio;

pub use run::{RuntimeOptions, run};
pub use service::{RelaySession, SharedState};
