//! Session engine for keel.
//!
//! One `Session` drives a multi-turn conversation loop against a model
//! provider: it enforces a token/context budget through the context guard,
//! bounds concurrent tool execution through the tool queue manager, recovers
//! structure (tool calls, META blocks, the final report) from free-form model
//! text through the transport, and classifies failures into retryable and
//! fatal kinds. Every request and tool execution leaves an accounting entry.

pub mod abort;
pub mod accounting;
pub mod config;
pub mod events;
pub mod guard;
pub mod queue;
pub mod session;
pub mod tools;
pub mod transport;

pub use abort::*;
pub use accounting::*;
pub use config::*;
pub use events::*;
pub use guard::*;
pub use queue::*;
pub use session::*;
pub use tools::*;
pub use transport::*;
