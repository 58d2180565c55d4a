//! Multi-agent orchestration on top of keel sessions.
//!
//! Agents declare outgoing edges of three kinds: `handoff` (transfer
//! control, the caller does not resume), `router` (the agent names a
//! destination at runtime through a tool call), and `advisor`
//! (fire-and-forget consultation whose output is appended as extra context,
//! the caller always resumes). Handoff and router edges form the control
//! graph and are validated for cycles at build time; advisor edges never
//! transfer control and are excluded from that check.

pub mod errors;
pub mod graph;
pub mod runtime;

pub use errors::*;
pub use graph::*;
pub use runtime::*;
