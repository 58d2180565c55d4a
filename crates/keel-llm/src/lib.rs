//! Model-provider contract for the keel session engine.
//!
//! This crate defines the boundary the session runner talks through: turn
//! request/result types, the `ModelProvider` trait and registry, the LLM
//! error taxonomy with retryability classification, and the tokenizer
//! contract used by the context guard. Concrete HTTP providers plug in from
//! the outside; the core behaves identically regardless of which one is
//! registered.

pub mod errors;
pub mod provider;
pub mod tokenizer;
pub mod types;

pub use errors::*;
pub use provider::*;
pub use tokenizer::*;
pub use types::*;
