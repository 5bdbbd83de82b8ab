//! Transports carrying the line-framed protocol.

pub mod framing;
pub mod socket;
pub mod stdio;

pub use socket::SocketTransport;
pub use stdio::StdioTransport;
