//! Cache store contract for the keel session engine, plus the in-memory
//! reference implementation. Entries are content-addressed and expire by
//! TTL; stores additionally enforce a capacity bound by evicting the oldest
//! entries at write time.

pub mod memory;
pub mod store;
pub mod types;

pub use memory::*;
pub use store::*;
pub use types::*;
