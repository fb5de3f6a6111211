pub mod error;
pub mod memory;
pub mod r#trait;

pub use error::SpoolError;
pub use memory::{MemoryQueue, TestQueue};
pub use r#trait::MailQueue;

/// Queue the inbound accept path enqueues into.
pub const INBOUND: &str = "inbound";
