//! Repository implementations for database operations

pub mod lock;
pub mod outbox;
pub mod purchase;

pub use lock::*;
pub use outbox::*;
pub use purchase::*;
