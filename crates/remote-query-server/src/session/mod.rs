//! Dataset sessions.

pub mod manager;

pub use manager::{DataSession, Dataset};
