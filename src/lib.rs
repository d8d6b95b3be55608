//! `qmp-session` - Async QMP client session engine.
//!
//! QMP is QEMU's line-delimited JSON control protocol. This crate provides:
//! - a session state machine (`Idle → Connecting → Connected → Running →
//!   Disconnecting → Idle`) over Unix or TCP sockets, in either connect or
//!   accept role
//! - the greeting + `qmp_capabilities` handshake, enabling `oob` when offered
//! - concurrent `execute` calls correlated to replies by id, in any order
//! - a subscribable event stream that never stalls message routing
//! - deterministic teardown: every outstanding call is interrupted, the cause
//!   is recorded, background tasks are joined
//!
//! ## Quick start (Unix socket)
//!
//! ```no_run
//! use qmp_session::{Client, Endpoint};
//! # async fn demo() -> qmp_session::Result<()> {
//! let client = Client::new();
//! client.connect(Endpoint::unix("/var/run/qemu-server/100.qmp")).await?;
//!
//! let status: serde_json::Value = client.execute("query-status", Option::<()>::None).await?;
//! println!("status = {status}");
//!
//! // Subscribe to events:
//! let mut events = client.events();
//! if let Ok(ev) = events.recv().await {
//!     println!("event: {}", ev.name);
//! }
//!
//! client.disconnect().await;
//! # Ok(()) }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod cancel;
mod client;
mod event_stream;
mod pending;
mod session;
mod transport;

pub mod codec;
pub mod error;
pub mod message;
pub mod types;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use cancel::CancelToken;
pub use client::{CallOptions, Client, ClientBuilder, ConnectOptions, ID_PREFIX};
pub use error::{Error, ErrorKind, Result};
pub use event_stream::EventStream;
pub use message::{Message, MessageKind};
pub use session::{DisconnectReason, Runstate};
pub use transport::{AsyncQmpStream, Endpoint, Listener, QmpStream};
