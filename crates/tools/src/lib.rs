//! Tools callable over the protocol server
//!
//! The server only knows the [`Tool`] trait and the [`ToolRegistry`]. The
//! browser tools in [`browser_tools`] adapt supervisor operations to it.

pub mod browser_tools;
pub mod error;
pub mod registry;
pub mod schema;
pub mod tool;

pub use browser_tools::{register_browser_tools, BrowserToolContext};
pub use error::{Result, ToolError};
pub use registry::{ToolDescriptor, ToolRegistry};
pub use schema::{PropertySchema, PropertyType, ToolSchema};
pub use tool::{Content, Tool, ToolArguments, ToolResponse};
