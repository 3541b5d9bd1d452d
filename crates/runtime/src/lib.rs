//! Headless runtime - browser process, transports, and protocol correlation
//!
//! This crate provides the low-level infrastructure for driving a headless
//! browser over its remote debugging protocol:
//!
//! - **Browser**: launching and tearing down the browser child process
//! - **Transport**: framed JSON duplex over a websocket or an OS pipe pair
//! - **Connection**: request/response correlation and serial event dispatch
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐
//! │headless-core │  Sessions, bindings, run server
//! └──────┬───────┘
//!        │
//! ┌──────▼───────┐
//! │   runtime    │  This crate
//! │  ┌─────────┐ │
//! │  │  Conn   │ │  id correlation + event dispatch
//! │  └─────────┘ │
//! │  ┌─────────┐ │
//! │  │  Trans  │ │  websocket / NUL-pipe framing
//! │  └─────────┘ │
//! │  ┌─────────┐ │
//! │  │ Browser │ │  child process + debug endpoint
//! │  └─────────┘ │
//! └──────────────┘
//! ```
//!
//! The connection is deliberately unaware of sessions beyond scoping frames
//! by their `sessionId`; everything target-shaped lives in `headless-core`.

pub mod browser;
pub mod connection;
pub mod error;
pub mod port;
pub mod transport;

pub use browser::{Browser, DEFAULT_BROWSER_ARGS};
pub use connection::{Connection, EventHandler};
pub use error::{Error, Result};
pub use port::free_port;
pub use transport::{PipeTransport, TransportParts, TransportReceiver, TransportSender, WebSocketTransport};
