//! Browser supervision over the Chrome DevTools Protocol
//!
//! Layers, bottom up:
//!
//! 1. [`cdp`] - WebSocket client and per-target sessions
//! 2. [`launcher`] / [`chrome`] - find or fetch a binary, spawn it, connect
//! 3. [`driver`] - the `Browser`/`Page` traits the supervisor is written against
//! 4. [`supervisor`] - one browser, many pages, health checks, restarts

pub mod cdp;
pub mod chrome;
pub mod driver;
pub mod error;
pub mod events;
pub mod launcher;
pub mod page;
pub mod reachability;
pub mod script;
pub mod supervisor;
pub mod util;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use cdp::{CDPClient, CDPError, CDPSession};
pub use chrome::{ChromeBrowser, ChromeLauncher};
pub use driver::{Browser, BrowserLauncher, Page, PageInfo};
pub use error::{BrowserError, LaunchError, Result};
pub use events::{EventBus, SupervisorEvent};
pub use launcher::{start_browser, BinarySteps, BrowserFetcher, LaunchConfig, SystemBinaries};
pub use page::{PageId, PageSnapshot, Screenshot, ScriptOutcome};
pub use supervisor::{BrowserState, BrowserSupervisor, ProcessInfo, SupervisorConfig};
