//! The sequenced streaming protocol: executing side and querying side.

pub mod client;
pub mod cursor;
pub mod handler;

pub use client::RemoteQueryClient;
pub use cursor::{Connection, Connector, CursorState, StreamCursor, TcpConnector};
pub use handler::{ConnectionState, ProtocolHandler};
