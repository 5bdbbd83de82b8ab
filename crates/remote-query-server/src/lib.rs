//! Server, client and CLI plumbing for remote queries: the sequenced
//! streaming protocol over line-framed JSON.

pub mod config;
pub mod dsl;
pub mod protocol;
pub mod repl;
pub mod session;
pub mod transport;
pub mod types;

pub use config::{resolve_addr, resolve_data_path};
pub use protocol::{ProtocolHandler, RemoteQueryClient, StreamCursor, TcpConnector};
pub use session::DataSession;
pub use transport::{SocketTransport, StdioTransport};
