//! Public client surface: construction, `ship`, `close`, diagnostics.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

use crate::buffer::{AckBuffer, AckBufferOptions};
use crate::error::{Result, UplinkError};
use crate::protocol::{ConnectionHeader, DataMessage};
use crate::session::{ClientState, Session};
use crate::transport::{Connector, TcpConnector};

/// Caller-facing diagnostic sink. Receives one formatted line per event;
/// must not block.
pub type DebugLogFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Identity fields carried in the connection header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Identity {
    /// Organization id.
    pub oid: String,
    /// Installation key authorizing this client.
    pub installation_key: String,
    /// Optional stable sensor id for this host.
    pub sensor_id: Option<String>,
}

/// Configuration for [`Client::connect`].
///
/// `identity`, `destination`, and the host descriptor fields end up in the
/// connection header; everything else tunes client behavior. Unset fields
/// take defaults, so construction is usually a struct literal over
/// `..Default::default()`.
#[derive(Clone, Default)]
pub struct ClientOptions {
    pub identity: Identity,

    /// Transport endpoint, `host:port` or `tcp://host:port`.
    pub destination: String,

    pub hostname: String,

    /// Platform tag, e.g. `linux`.
    pub platform: String,

    /// Architecture tag, e.g. `x86_64`.
    pub architecture: String,

    /// Capability hints forwarded to the ingestion side.
    pub capabilities: Option<Vec<String>>,

    /// Acknowledgement buffer tuning (capacity, backpressure and ack hooks).
    pub buffer: AckBufferOptions,

    /// Diagnostic sink for connection lifecycle events.
    pub debug_log: Option<DebugLogFn>,

    /// Deadline per transport connect attempt; zero means the default (10 s).
    pub connect_timeout: Duration,

    /// Transport factory override. Defaults to TCP; tests inject in-memory
    /// transports here.
    pub connector: Option<Arc<dyn Connector>>,
}

impl ClientOptions {
    fn validated_header(&self) -> Result<ConnectionHeader> {
        if self.identity.oid.is_empty() {
            return Err(UplinkError::config("identity.oid is required"));
        }
        if self.identity.installation_key.is_empty() {
            return Err(UplinkError::config("identity.installation_key is required"));
        }
        if self.destination.is_empty() {
            return Err(UplinkError::config("destination is required"));
        }
        Ok(ConnectionHeader {
            oid: self.identity.oid.clone(),
            installation_key: self.identity.installation_key.clone(),
            sensor_id: self.identity.sensor_id.clone(),
            hostname: self.hostname.clone(),
            platform: self.platform.clone(),
            architecture: self.architecture.clone(),
            capabilities: self.capabilities.clone(),
        })
    }
}

/// Handle to a running uplink client.
///
/// Cheap to share behind an `Arc`; all methods take `&self`. Producers call
/// [`ship`](Client::ship) concurrently while the session runtime delivers,
/// replays, and reconnects in the background.
pub struct Client {
    buffer: Arc<AckBuffer>,
    session: Session,
    closed: AtomicBool,
    debug_log: Option<DebugLogFn>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Validate options, establish the first transport, and start the
    /// session runtime.
    ///
    /// Returns an error if the options are invalid or the initial open fails;
    /// once this returns `Ok`, transport failures are handled by reconnecting
    /// and are never surfaced.
    pub async fn connect(options: ClientOptions) -> Result<Self> {
        let header = options.validated_header()?;
        let connector = options
            .connector
            .clone()
            .unwrap_or_else(|| Arc::new(TcpConnector::new(options.connect_timeout)));
        let buffer = Arc::new(AckBuffer::new(options.buffer.clone()));

        let session = Session::start(
            connector,
            options.destination.clone(),
            header,
            Arc::clone(&buffer),
            options.debug_log.clone(),
        )
        .await?;

        info!(destination = %options.destination, "uplink client connected");
        Ok(Self { buffer, session, closed: AtomicBool::new(false), debug_log: options.debug_log })
    }

    /// Ship a payload, waiting up to `timeout` for buffer space.
    ///
    /// A zero `timeout` waits until space frees up or the client closes.
    /// Success means the record is sequenced and retained until the peer
    /// acknowledges it; it does not mean the peer has received it yet.
    pub async fn ship(&self, payload: serde_json::Value, timeout: Duration) -> Result<()> {
        self.ship_message(DataMessage::new(payload), timeout).await
    }

    /// Ship a pre-built record (payload plus producer metadata).
    ///
    /// The record must not carry a sequence number; admission stamps
    /// `seq_num` and `ack_requested`.
    pub async fn ship_message(&self, msg: DataMessage, timeout: Duration) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(UplinkError::Closed);
        }
        if self.buffer.admit(msg, timeout).await {
            Ok(())
        } else if !self.buffer.is_running() {
            Err(UplinkError::Closed)
        } else {
            Err(UplinkError::AdmissionTimeout { timeout })
        }
    }

    /// Stop accepting records and tear down the session. Idempotent.
    ///
    /// Blocked `ship` calls return [`UplinkError::Closed`]. Unacked records
    /// are *not* drained to the peer; they remain readable through
    /// [`backlog`](Client::backlog) for caller-driven persistence.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("closing uplink client");
        if let Some(log) = &self.debug_log {
            log("closing uplink client");
        }
        self.buffer.close();
        self.session.shutdown().await;
    }

    /// Snapshot of the unacked backlog, oldest first.
    pub fn backlog(&self) -> Vec<DataMessage> {
        self.buffer.snapshot()
    }

    /// Observable connection state; updates on reconnect cycles and close.
    pub fn state(&self) -> watch::Receiver<ClientState> {
        self.session.state()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        // Callers should close(); this keeps tasks from outliving a leaked
        // handle.
        self.buffer.close();
        self.session.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_support::{wait_until, ScriptedConnector};
    use serde_json::json;

    fn scripted_options(connector: Arc<ScriptedConnector>) -> ClientOptions {
        ClientOptions {
            identity: Identity {
                oid: "org-1".into(),
                installation_key: "key-1".into(),
                sensor_id: None,
            },
            destination: "tcp://scripted".into(),
            hostname: "host".into(),
            platform: "linux".into(),
            architecture: "x86_64".into(),
            connector: Some(connector),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn missing_identity_fails_construction() {
        let err = Client::connect(ClientOptions {
            destination: "tcp://127.0.0.1:1".into(),
            ..Default::default()
        })
        .await
        .unwrap_err();
        assert!(matches!(err, UplinkError::Config { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn missing_destination_fails_construction() {
        let err = Client::connect(ClientOptions {
            identity: Identity {
                oid: "org".into(),
                installation_key: "key".into(),
                sensor_id: None,
            },
            ..Default::default()
        })
        .await
        .unwrap_err();
        assert!(matches!(err, UplinkError::Config { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn unreachable_endpoint_surfaces_open_error() {
        let err = Client::connect(ClientOptions {
            identity: Identity {
                oid: "org".into(),
                installation_key: "key".into(),
                sensor_id: None,
            },
            // Reserved port on localhost: connection refused immediately.
            destination: "127.0.0.1:1".into(),
            connect_timeout: Duration::from_millis(500),
            ..Default::default()
        })
        .await
        .unwrap_err();
        assert!(matches!(err, UplinkError::Open { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn ship_after_close_is_rejected() {
        let connector = Arc::new(ScriptedConnector::default());
        let client = Client::connect(scripted_options(connector)).await.unwrap();

        client.close().await;
        client.close().await; // idempotent

        let err = client.ship(json!({"some": "payload"}), Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, UplinkError::Closed), "got {err:?}");
    }

    #[tokio::test]
    async fn backlog_survives_close_for_caller_persistence() {
        let connector = Arc::new(ScriptedConnector::default());
        let client = Client::connect(scripted_options(Arc::clone(&connector))).await.unwrap();

        client.ship(json!({"n": 1}), Duration::from_secs(1)).await.unwrap();
        client.ship(json!({"n": 2}), Duration::from_secs(1)).await.unwrap();

        // Wait for delivery so the records are in flight, then close without
        // any acks: the backlog must still expose both records.
        let conn = connector.connection(0).unwrap();
        assert!(wait_until(Duration::from_secs(2), || conn.data_seqs().len() == 2).await);
        client.close().await;

        let backlog = client.backlog();
        let seqs: Vec<u64> = backlog.iter().map(|m| m.seq_num).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[tokio::test]
    async fn header_carries_identity_and_host_descriptor() {
        let connector = Arc::new(ScriptedConnector::default());
        let mut options = scripted_options(Arc::clone(&connector));
        options.identity.sensor_id = Some("sensor-9".into());
        options.capabilities = Some(vec!["json".into()]);

        let client = Client::connect(options).await.unwrap();

        let conn = connector.connection(0).unwrap();
        match conn.written().first().cloned() {
            Some(crate::protocol::Frame::Header(header)) => {
                assert_eq!(header.oid, "org-1");
                assert_eq!(header.installation_key, "key-1");
                assert_eq!(header.sensor_id.as_deref(), Some("sensor-9"));
                assert_eq!(header.hostname, "host");
                assert_eq!(header.platform, "linux");
                assert_eq!(header.architecture, "x86_64");
                assert_eq!(header.capabilities, Some(vec!["json".to_string()]));
            }
            other => panic!("expected header frame, got {other:?}"),
        }

        client.close().await;
    }

    #[tokio::test]
    async fn debug_log_observes_lifecycle_events() {
        let lines = Arc::new(parking_lot::Mutex::new(Vec::<String>::new()));
        let sink: DebugLogFn = {
            let lines = Arc::clone(&lines);
            Arc::new(move |line: &str| lines.lock().push(line.to_string()))
        };

        let connector = Arc::new(ScriptedConnector::default());
        let mut options = scripted_options(connector);
        options.debug_log = Some(sink);

        let client = Client::connect(options).await.unwrap();
        client.close().await;

        assert!(lines.lock().iter().any(|line| line.contains("closing")));
    }
}
