//! Async client library that ships structured telemetry records to a remote
//! ingestion endpoint with at-least-once delivery.
//!
//! Records are sequenced into an acknowledgement buffer, streamed over a
//! persistent message-framed connection, and retained until the peer confirms
//! receipt. Transient disconnects are handled by reconnecting with backoff
//! and replaying every unacked record in order; the peer is expected to
//! tolerate the resulting duplicates.
//!
//! # Architecture
//!
//! | Module      | Responsibility                                        |
//! |-------------|-------------------------------------------------------|
//! | `buffer`    | Sequencing, retention, backpressure, replay            |
//! | `transport` | Framed connect/read/write with per-call deadlines      |
//! | `session`   | Sender and receiver loops, reconnect controller        |
//! | `protocol`  | JSON wire frames (header, data, control)               |
//! | `client`    | Public surface: `connect`, `ship`, `close`, `backlog`  |
//!
//! Producers hand records to the client and relinquish ownership; the buffer
//! owns each record from admission until the peer acks it. Backpressure is
//! the blocking `ship` call — when the buffer is full, admissions wait until
//! an ack frees a slot or the caller's deadline passes.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use serde_json::json;
//! use uplink::{Client, ClientOptions, Identity};
//!
//! #[tokio::main]
//! async fn main() -> uplink::Result<()> {
//!     let client = Client::connect(ClientOptions {
//!         identity: Identity {
//!             oid: "org-id".into(),
//!             installation_key: "installation-key".into(),
//!             ..Default::default()
//!         },
//!         destination: "tcp://ingest.example.com:7000".into(),
//!         hostname: "edge-01".into(),
//!         platform: "linux".into(),
//!         architecture: "x86_64".into(),
//!         ..Default::default()
//!     })
//!     .await?;
//!
//!     client.ship(json!({"some": "payload"}), Duration::from_secs(1)).await?;
//!     client.close().await;
//!     Ok(())
//! }
//! ```

pub mod buffer;
mod client;
mod error;
mod latch;
pub mod protocol;
mod session;
pub mod transport;

pub use buffer::{AckBuffer, AckBufferOptions, Hook, DEFAULT_CAPACITY};
pub use client::{Client, ClientOptions, DebugLogFn, Identity};
pub use error::{Result, UplinkError};
pub use protocol::{ConnectionHeader, ControlMessage, ControlVerb, DataMessage, Frame};
pub use session::ClientState;
pub use transport::{Connector, FramedTransport, TcpConnector, Transport};
