//! CDP (Chrome DevTools Protocol) Client Implementation
//!
//! Core principle: Single WebSocket connection, multiplexed sessions.

pub mod client;
pub mod protocol;
pub mod session;

pub use client::{CDPClient, CDPError, ClientOptions};
pub use protocol::{CDPEvent, CDPRequest, CDPResponse, TargetId};
pub use session::{CDPSession, Evaluation};
