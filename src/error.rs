//! Error types for the uplink client.
//!
//! All errors implement the `std::error::Error` trait and carry structured
//! context. The taxonomy follows how errors propagate:
//!
//! - **Per-record errors** ([`AdmissionTimeout`](UplinkError::AdmissionTimeout),
//!   [`Closed`](UplinkError::Closed)) are returned to the producer, which may
//!   retry or drop the record.
//! - **Session errors** ([`Io`](UplinkError::Io), [`Timeout`](UplinkError::Timeout),
//!   [`Malformed`](UplinkError::Malformed)) are absorbed by the reconnect
//!   controller and never reach the caller.
//! - **Client-lifecycle errors** ([`Open`](UplinkError::Open),
//!   [`Config`](UplinkError::Config)) surface from construction.
//!
//! [`UnexpectedAck`](UplinkError::UnexpectedAck) is special: the receiver logs
//! it at debug level and keeps the connection alive, since a server replaying
//! stale state is not a reason to tear down.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for uplink operations.
pub type Result<T, E = UplinkError> = std::result::Result<T, E>;

/// Main error type for uplink operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum UplinkError {
    /// `ship` exceeded its caller-supplied deadline before buffer space freed up.
    #[error("record not admitted within {timeout:?}")]
    AdmissionTimeout { timeout: Duration },

    /// The client has been closed; no further records are accepted.
    #[error("client is closed")]
    Closed,

    /// The peer acknowledged a sequence number that is not currently in flight.
    #[error(
        "unexpected acked sequence number {seq} (oldest unacked: {first_seq}, delivered: {delivered})"
    )]
    UnexpectedAck { seq: u64, first_seq: u64, delivered: u64 },

    /// Opening the transport failed (resolution, connect, or header handshake).
    #[error("failed to open transport to {url}: {reason}")]
    Open {
        url: String,
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// I/O failure on an established transport.
    #[error("transport i/o error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// A transport read or write did not complete within its deadline.
    #[error("operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    /// The peer sent a frame that could not be decoded.
    #[error("malformed frame: {details}")]
    Malformed { details: String },

    /// Invalid client options.
    #[error("invalid configuration: {reason}")]
    Config { reason: String },
}

impl UplinkError {
    /// Returns whether this error is potentially recoverable through retry.
    ///
    /// Session-level errors are retryable (the reconnect controller does
    /// exactly that); configuration and close errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            UplinkError::AdmissionTimeout { .. } => true,
            UplinkError::Open { .. } => true,
            UplinkError::Io { .. } => true,
            UplinkError::Timeout { .. } => true,
            UplinkError::UnexpectedAck { .. } => true,
            UplinkError::Closed => false,
            UplinkError::Malformed { .. } => false,
            UplinkError::Config { .. } => false,
        }
    }

    /// Helper constructor for transport open failures.
    pub fn open_failed(url: impl Into<String>, reason: impl Into<String>) -> Self {
        UplinkError::Open { url: url.into(), reason: reason.into(), source: None }
    }

    /// Helper constructor for transport open failures with an underlying cause.
    pub fn open_failed_with_source(
        url: impl Into<String>,
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        UplinkError::Open { url: url.into(), reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for transport I/O errors.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        UplinkError::Io { context: context.into(), source }
    }

    /// Helper constructor for malformed frames.
    pub fn malformed(details: impl Into<String>) -> Self {
        UplinkError::Malformed { details: details.into() }
    }

    /// Helper constructor for configuration errors.
    pub fn config(reason: impl Into<String>) -> Self {
        UplinkError::Config { reason: reason.into() }
    }
}
