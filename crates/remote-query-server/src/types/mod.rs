//! Wire messages and error types used by the server and client.

pub mod error;
pub mod message;

pub use error::*;
pub use message::*;
