//! JSON-RPC front end for the browser supervisor
//!
//! 1. [`transport`] / [`channel`] - newline-framed messages over stdio or TCP
//! 2. [`protocol`] - envelopes and error codes
//! 3. [`server`] - dispatch, tool execution, background loops

pub mod channel;
pub mod config;
pub mod error;
pub mod health;
pub mod protocol;
pub mod server;
pub mod transport;

pub use channel::{ChannelConfig, ChannelError, ChannelStats, ConnectionChannel};
pub use config::Config;
pub use error::{Result, ServerError};
pub use protocol::{Incoming, Notification, RequestId, Response, RpcError};
pub use server::{ProtocolServer, ServerSettings};
pub use transport::{StdioTransport, StreamTransport, TcpTransport, Transport};
