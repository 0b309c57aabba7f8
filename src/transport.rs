//! Framed transport adapter.
//!
//! A narrow seam between the session runtime and the network: open a
//! bidirectional message-framed channel, then read and write typed frames
//! under per-call deadlines. The [`Transport`] and [`Connector`] traits keep
//! the seam injectable so the session runtime can be driven by an in-memory
//! transport in tests.
//!
//! The shipped implementation is length-delimited JSON over TCP. Framing
//! stays in the codec; this module only maps frames to protocol types and
//! deadlines to errors.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, trace};

use crate::error::{Result, UplinkError};
use crate::protocol::{ConnectionHeader, ControlMessage, DataMessage, Frame};

/// Upper bound on a single frame; anything larger is a protocol violation.
const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// Default deadline for each transport connect attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// An established bidirectional message-framed channel.
///
/// Reads and writes are independently serialized: the receiver loop owns
/// reads, while data and control writes from any task funnel through one
/// internal writer lock.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Read one frame, waiting up to `deadline`.
    async fn read_message(&self, deadline: Duration) -> Result<Frame>;

    /// Write a data frame within `deadline`.
    async fn write_data(&self, msg: &DataMessage, deadline: Duration) -> Result<()>;

    /// Write a control frame within `deadline`.
    async fn write_control(&self, msg: &ControlMessage, deadline: Duration) -> Result<()>;

    /// Write the connection header within `deadline`. Always the first frame
    /// after open.
    async fn write_header(&self, header: &ConnectionHeader, deadline: Duration) -> Result<()>;

    /// Close the channel. Idempotent; in-flight calls fail with an I/O error.
    async fn close(&self);
}

/// Factory for transports, one per (re)connection attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>>;
}

/// TCP connector producing [`FramedTransport`]s.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        let connect_timeout = if connect_timeout.is_zero() {
            DEFAULT_CONNECT_TIMEOUT
        } else {
            connect_timeout
        };
        Self { connect_timeout }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

/// Accepts `host:port` or `tcp://host:port`.
fn host_port(url: &str) -> Result<&str> {
    match url.split_once("://") {
        None => Ok(url),
        Some(("tcp", rest)) => Ok(rest),
        Some((scheme, _)) => {
            Err(UplinkError::open_failed(url, format!("unsupported scheme {scheme:?}")))
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>> {
        let addr = host_port(url)?;
        debug!(%url, "opening transport");

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                UplinkError::open_failed(
                    url,
                    format!("connect timed out after {:?}", self.connect_timeout),
                )
            })?
            .map_err(|e| {
                UplinkError::open_failed_with_source(url, "connect failed", Box::new(e))
            })?;
        stream.set_nodelay(true).ok();

        Ok(Box::new(FramedTransport::new(stream)))
    }
}

/// Length-delimited JSON frames over a TCP stream.
pub struct FramedTransport {
    reader: Mutex<FramedRead<OwnedReadHalf, LengthDelimitedCodec>>,
    writer: Mutex<FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>>,
    closed: AtomicBool,
}

impl FramedTransport {
    pub fn new(stream: TcpStream) -> Self {
        let codec = || {
            LengthDelimitedCodec::builder().max_frame_length(MAX_FRAME_LEN).new_codec()
        };
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: Mutex::new(FramedRead::new(read_half, codec())),
            writer: Mutex::new(FramedWrite::new(write_half, codec())),
            closed: AtomicBool::new(false),
        }
    }

    async fn write_frame<T: Serialize + Sync>(&self, frame: &T, deadline: Duration) -> Result<()> {
        let encoded = serde_json::to_vec(frame)
            .map_err(|e| UplinkError::malformed(format!("encode frame: {e}")))?;

        let mut writer = self.writer.lock().await;
        tokio::time::timeout(deadline, writer.send(Bytes::from(encoded)))
            .await
            .map_err(|_| UplinkError::Timeout { duration: deadline })?
            .map_err(|e| UplinkError::io("write frame", e))
    }
}

#[async_trait]
impl Transport for FramedTransport {
    async fn read_message(&self, deadline: Duration) -> Result<Frame> {
        let mut reader = self.reader.lock().await;
        let bytes = tokio::time::timeout(deadline, reader.next())
            .await
            .map_err(|_| UplinkError::Timeout { duration: deadline })?
            .ok_or_else(|| {
                UplinkError::io(
                    "read frame",
                    std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "peer closed"),
                )
            })?
            .map_err(|e| UplinkError::io("read frame", e))?;

        trace!(len = bytes.len(), "frame received");
        serde_json::from_slice(&bytes)
            .map_err(|e| UplinkError::malformed(format!("decode frame: {e}")))
    }

    async fn write_data(&self, msg: &DataMessage, deadline: Duration) -> Result<()> {
        self.write_frame(msg, deadline).await
    }

    async fn write_control(&self, msg: &ControlMessage, deadline: Duration) -> Result<()> {
        self.write_frame(msg, deadline).await
    }

    async fn write_header(&self, header: &ConnectionHeader, deadline: Duration) -> Result<()> {
        self.write_frame(header, deadline).await
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut writer = self.writer.lock().await;
        // Flush what we can; the peer sees a clean shutdown either way.
        let _ = writer.close().await;
        debug!("transport closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    async fn connected_pair() -> (FramedTransport, FramedTransport) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr);
        let server = async { listener.accept().await.map(|(stream, _)| stream) };
        let (client, server) = tokio::join!(client, server);

        (FramedTransport::new(client.unwrap()), FramedTransport::new(server.unwrap()))
    }

    #[tokio::test]
    async fn frames_round_trip_between_peers() {
        let (client, server) = connected_pair().await;

        let msg = DataMessage {
            seq_num: 9,
            ack_requested: true,
            payload: json!({"some": "payload"}),
            ..Default::default()
        };
        client.write_data(&msg, Duration::from_secs(1)).await.unwrap();

        match server.read_message(Duration::from_secs(1)).await.unwrap() {
            Frame::Data(received) => assert_eq!(received, msg),
            other => panic!("expected data frame, got {other:?}"),
        }

        server.write_control(&ControlMessage::ack(9), Duration::from_secs(1)).await.unwrap();
        match client.read_message(Duration::from_secs(1)).await.unwrap() {
            Frame::Control(control) => assert_eq!(control, ControlMessage::ack(9)),
            other => panic!("expected control frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn header_is_dispatched_as_a_header_frame() {
        let (client, server) = connected_pair().await;

        let header = ConnectionHeader {
            oid: "org".into(),
            installation_key: "ikey".into(),
            sensor_id: Some("sensor-7".into()),
            hostname: "host".into(),
            platform: "linux".into(),
            architecture: "x86_64".into(),
            capabilities: None,
        };
        client.write_header(&header, Duration::from_secs(1)).await.unwrap();

        match server.read_message(Duration::from_secs(1)).await.unwrap() {
            Frame::Header(received) => assert_eq!(received, header),
            other => panic!("expected header frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn read_deadline_maps_to_timeout() {
        let (client, _server) = connected_pair().await;

        let err = client.read_message(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, UplinkError::Timeout { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn peer_shutdown_maps_to_io_error() {
        let (client, server) = connected_pair().await;

        server.close().await;
        drop(server);

        let err = client.read_message(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, UplinkError::Io { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn garbage_frame_maps_to_malformed() {
        let (client, server) = connected_pair().await;

        {
            let mut writer = server.writer.lock().await;
            writer.send(Bytes::from_static(b"not json")).await.unwrap();
        }

        let err = client.read_message(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, UplinkError::Malformed { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (client, _server) = connected_pair().await;
        client.close().await;
        client.close().await;
    }

    #[test]
    fn url_schemes() {
        assert_eq!(host_port("127.0.0.1:7000").unwrap(), "127.0.0.1:7000");
        assert_eq!(host_port("tcp://127.0.0.1:7000").unwrap(), "127.0.0.1:7000");
        assert!(matches!(
            host_port("wss://example.com/stream"),
            Err(UplinkError::Open { .. })
        ));
    }
}
