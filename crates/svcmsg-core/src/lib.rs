//! svcmsg Core - local IPC substrate for named services.
//!
//! A server process registers named services and serves them over loopback
//! TCP. Clients resolve a service by name through a per-user namespace
//! database, open a connection (one server-side OSB per connection) and
//! exchange PUT, GET and PUTGET messages with it. Services can answer
//! synchronously inside their callback or defer and answer later from any
//! task, and can push pulses back to their clients.
//!
//! # Example
//!
//! ```rust,no_run
//! use svcmsg_core::services::EchoService;
//! use svcmsg_core::{ConnectOptions, Connection, Server, ServerConfig, ServiceConfig};
//!
//! #[tokio::main]
//! async fn main() -> svcmsg_core::Result<()> {
//!     let mut server = Server::new(ServerConfig::default());
//!     server.register(ServiceConfig::new("echo"), EchoService)?;
//!     let _handle = server.start().await?;
//!
//!     let conn = Connection::open("echo", None, ConnectOptions::default()).await?;
//!     let reply = conn.putget("ping", 16).await?;
//!     assert_eq!(reply.payload.as_ref(), b"pong");
//!     conn.close().await?;
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod client;
pub mod config;
pub mod error;
pub mod message;
pub mod namespace;
pub mod protocol;
pub mod server;
pub mod services;

pub use cancel::{CancellationToken, CancelledError};
pub use client::{ConnectOptions, Connection, MsgIdGenerator, Response};
pub use config::{
    ClockSource, IpcConfig, NamespaceConfig, NamespacePath, OpenFlags, ServerConfig, ServerFlags,
    ServiceFlags, TimeoutPolicy,
};
pub use error::{status, Result, SvcError};
pub use message::{MsgId, MsgType, NotifyKind, NotifyOutcome, ObjectRef, PeerCredentials, Pulse};
pub use namespace::{Namespace, ServiceEntry};
pub use server::{
    CloseReason, Notifier, OpenContext, PermissionManager, ReleasePolicy, ReplyContext,
    ReplyOutcome, ReplyToken, Request, Server, ServerHandle, ServerStats, ServiceConfig,
    ServiceHandler, ServiceId,
};
