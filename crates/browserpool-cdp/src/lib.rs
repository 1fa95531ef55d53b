//! Minimal Chrome DevTools Protocol client for browserpool.
//!
//! Connects to a Chrome/Chromium instance launched with
//! `--remote-debugging-port` and exposes only the surface the session pool
//! needs: navigation, JavaScript evaluation, pre-navigation script
//! injection, cookie installation and user-agent override.
//!
//! ```text
//! ┌─────────────────┐    WebSocket     ┌──────────────────┐
//! │   browserpool   │ ◄──────────────► │  Chrome (worker  │
//! │   (this crate)  │       CDP        │   profile dir)   │
//! └─────────────────┘                  └──────────────────┘
//! ```
//!
//! One [`CdpClient`] is created per launched browser process; pages are
//! attached as [`PageHandle`]s. The client owns the WebSocket receive loop
//! and a pending-request table keyed by command id.

mod client;
mod error;
mod page;
mod protocol;

pub use client::CdpClient;
pub use error::CdpError;
pub use page::PageHandle;
pub use protocol::{BrowserVersion, CookieParam, PageInfo, TargetInfo};
