//! Warden: process-supervision control fabric over a Unix socket.
//!
//! A single local supervisor and a fleet of worker processes share one
//! newline-delimited JSON channel per worker. Either side can issue
//! multiplexed calls (request, optional streaming intermediates, one
//! terminal response) at the other over the same connection:
//!
//! - [`protocol`] frames one JSON object per line.
//! - [`call`] holds per-request state and its response queue.
//! - [`connection`] multiplexes concurrent calls over one stream, in both
//!   directions, and routes inbound requests to a [`dispatch::Dispatch`]
//!   target.
//! - [`server`] accepts workers, registers them under connection ids,
//!   proxies `forward` calls between peers, and drives [`monitor`]s.
//! - [`worker`] keeps a worker attached through reconnects and hosts the
//!   [`diagnostics`] operations.
//! - [`endpoint`] and [`config`] bind the socket and load settings.
//!
//! Trust is filesystem permissions on the socket; there is no
//! authentication or encryption on the channel.

pub mod call;
pub mod client;
pub mod config;
pub mod connection;
pub mod diagnostics;
pub mod dispatch;
pub mod endpoint;
pub mod monitor;
pub mod protocol;
pub mod server;
pub mod worker;

pub use call::{Call, CallError};
pub use client::Client;
pub use config::WardenConfig;
pub use connection::{Connection, Role};
pub use dispatch::Dispatch;
pub use endpoint::Endpoint;
pub use monitor::Monitor;
pub use monitor::memory::MemoryMonitor;
pub use protocol::Message;
pub use server::Server;
pub use worker::Worker;
