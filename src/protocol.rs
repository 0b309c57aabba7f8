//! Wire types for the uplink protocol.
//!
//! Every frame on the wire is a single JSON object. The client sends a
//! [`ConnectionHeader`] as the first frame after connecting, then
//! [`DataMessage`] frames; the server answers with [`ControlMessage`] frames.
//! There is no envelope: frames are distinguished by their fields, which is
//! why [`Frame`] deserializes untagged.

use serde::{Deserialize, Serialize};

/// A single telemetry record in flight.
///
/// Producers construct one with a payload (and optional metadata) and hand it
/// to the client. `seq_num` and `ack_requested` belong to the
/// acknowledgement buffer: they are stamped exactly once at admission and must
/// not be set by the producer.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DataMessage {
    /// Monotonic sequence number, assigned at buffer admission (starting at 1).
    #[serde(default)]
    pub seq_num: u64,

    /// Asks the peer to acknowledge this sequence number.
    ///
    /// Set by the buffer at the configured ack stride, never by the producer.
    #[serde(default)]
    pub ack_requested: bool,

    /// Opaque structured payload.
    pub payload: serde_json::Value,

    /// Producer-side capture time, milliseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_ms: Option<u64>,

    /// Free-form record category hint for the ingestion side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
}

impl DataMessage {
    /// Create a record from a payload, leaving all metadata unset.
    pub fn new(payload: serde_json::Value) -> Self {
        Self { payload, ..Default::default() }
    }
}

/// Verb of a server-to-client control frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlVerb {
    /// Acknowledge receipt of everything up to and including `seq_num`.
    #[serde(rename = "ACK")]
    Ack,

    /// Ask the client to tear down and re-establish the connection.
    #[serde(rename = "RECONNECT")]
    Reconnect,
}

/// A control frame from the peer. Dispatched by the receiver loop, never stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlMessage {
    pub verb: ControlVerb,

    /// Present for `ACK`, absent for `RECONNECT`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq_num: Option<u64>,
}

impl ControlMessage {
    /// An `ACK` frame for the given sequence number.
    pub fn ack(seq_num: u64) -> Self {
        Self { verb: ControlVerb::Ack, seq_num: Some(seq_num) }
    }

    /// A `RECONNECT` frame.
    pub fn reconnect() -> Self {
        Self { verb: ControlVerb::Reconnect, seq_num: None }
    }
}

/// Identification frame sent once per transport open, before any data.
///
/// Immutable for the lifetime of the session; the reconnect controller
/// rewrites the same header on every new transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionHeader {
    /// Organization id.
    pub oid: String,

    /// Installation key authorizing this client.
    pub installation_key: String,

    /// Optional stable sensor id for this host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_id: Option<String>,

    pub hostname: String,

    /// Platform tag, e.g. `linux` or `windows`.
    pub platform: String,

    /// Architecture tag, e.g. `x86_64`.
    pub architecture: String,

    /// Capability hints for the ingestion side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<String>>,
}

/// Any frame that can appear on the wire.
///
/// Variant order matters for untagged deserialization: control frames are the
/// only ones with a `verb`, data frames the only ones with a `payload`, so the
/// three shapes never overlap.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Frame {
    Control(ControlMessage),
    Data(DataMessage),
    Header(ConnectionHeader),
}
