//! Session runtime: sender loop, receiver loop, reconnect controller.
//!
//! The runtime owns one transport at a time and drives the acknowledgement
//! buffer through it. A supervisor task holds the lifecycle: it spawns a
//! sender and a receiver per connection, waits for either to report a fault,
//! then runs one reconnect cycle (tear down, rewind delivery, reopen with
//! jittered exponential backoff, rewrite the header, respawn the loops).
//! Faults from both loops funnel into a single-slot channel, so concurrent
//! signals coalesce and only one cycle runs at a time.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::buffer::AckBuffer;
use crate::client::DebugLogFn;
use crate::error::{Result, UplinkError};
use crate::protocol::{ConnectionHeader, ControlVerb, Frame};
use crate::transport::{Connector, Transport};

/// Deadline for writing the connection header after open.
const HEADER_WRITE_DEADLINE: Duration = Duration::from_secs(5);
/// Deadline for each data frame write.
const DATA_WRITE_DEADLINE: Duration = Duration::from_secs(2);
/// The receiver treats a transport with no frames for this long as dead.
const IDLE_READ_DEADLINE: Duration = Duration::from_secs(20);
/// How long the sender waits on the buffer before re-checking for shutdown.
const SENDER_POLL_TICK: Duration = Duration::from_millis(500);
/// First reconnect delay; doubles per failed attempt.
const RECONNECT_BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const RECONNECT_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Observable connection state of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Establishing the initial transport.
    Connecting,
    Connected,
    /// Transport lost; reopen attempts are running behind backoff.
    Reconnecting,
    Closed,
}

/// Why a connection ended.
#[derive(Debug)]
enum SessionFault {
    Write(UplinkError),
    Read(UplinkError),
    ReconnectRequested,
}

struct SupervisorContext {
    connector: Arc<dyn Connector>,
    url: String,
    header: ConnectionHeader,
    buffer: Arc<AckBuffer>,
    debug_log: Option<DebugLogFn>,
    state_tx: watch::Sender<ClientState>,
    cancel: CancellationToken,
}

/// Handle to the running session tasks.
pub(crate) struct Session {
    cancel: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    state_rx: watch::Receiver<ClientState>,
}

impl Session {
    /// Open the initial transport and start the runtime.
    ///
    /// Failure to open or to write the header surfaces here; every later
    /// transport failure is absorbed by the reconnect controller.
    pub(crate) async fn start(
        connector: Arc<dyn Connector>,
        url: String,
        header: ConnectionHeader,
        buffer: Arc<AckBuffer>,
        debug_log: Option<DebugLogFn>,
    ) -> Result<Self> {
        let (state_tx, state_rx) = watch::channel(ClientState::Connecting);

        let transport = open_transport(connector.as_ref(), &url, &header).await?;
        info!(%url, "uplink session established");
        state_tx.send_replace(ClientState::Connected);

        let cancel = CancellationToken::new();
        let ctx = SupervisorContext {
            connector,
            url,
            header,
            buffer,
            debug_log,
            state_tx,
            cancel: cancel.clone(),
        };
        let supervisor = tokio::spawn(supervise(ctx, transport));

        Ok(Self { cancel, supervisor: Mutex::new(Some(supervisor)), state_rx })
    }

    pub(crate) fn state(&self) -> watch::Receiver<ClientState> {
        self.state_rx.clone()
    }

    /// Request teardown without waiting for it.
    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Tear down the runtime and wait for the supervisor to finish.
    pub(crate) async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.supervisor.lock().await.take() {
            let _ = handle.await;
        }
    }
}

async fn open_transport(
    connector: &dyn Connector,
    url: &str,
    header: &ConnectionHeader,
) -> Result<Box<dyn Transport>> {
    let transport = connector.connect(url).await?;
    if let Err(e) = transport.write_header(header, HEADER_WRITE_DEADLINE).await {
        transport.close().await;
        return Err(UplinkError::open_failed_with_source(
            url,
            "failed to write connection header",
            Box::new(e),
        ));
    }
    Ok(transport)
}

async fn supervise(ctx: SupervisorContext, mut transport: Box<dyn Transport>) {
    loop {
        let shared: Arc<dyn Transport> = Arc::from(transport);
        let conn_cancel = ctx.cancel.child_token();
        // Single-slot channel: the first fault wins, later ones coalesce away.
        let (fault_tx, mut fault_rx) = mpsc::channel::<SessionFault>(1);

        let sender = tokio::spawn(sender_loop(
            Arc::clone(&shared),
            Arc::clone(&ctx.buffer),
            conn_cancel.clone(),
            fault_tx.clone(),
        ));
        let receiver = tokio::spawn(receiver_loop(
            Arc::clone(&shared),
            Arc::clone(&ctx.buffer),
            conn_cancel.clone(),
            fault_tx,
            ctx.debug_log.clone(),
        ));

        let fault = tokio::select! {
            _ = ctx.cancel.cancelled() => None,
            fault = fault_rx.recv() => fault,
        };

        conn_cancel.cancel();
        shared.close().await;
        let _ = sender.await;
        let _ = receiver.await;

        let Some(fault) = fault else { break };
        debug!(?fault, "connection ended, starting reconnect cycle");
        if let Some(log) = &ctx.debug_log {
            log(&format!("connection ended ({fault:?}), reconnecting"));
        }

        // Replay everything the peer has not acked on the next transport.
        ctx.buffer.reset_delivery();
        ctx.state_tx.send_replace(ClientState::Reconnecting);

        match reopen_with_backoff(&ctx).await {
            Some(fresh) => {
                transport = fresh;
                ctx.state_tx.send_replace(ClientState::Connected);
            }
            None => break,
        }
    }

    ctx.state_tx.send_replace(ClientState::Closed);
    debug!("session supervisor exited");
}

/// Reopen the transport, doubling the delay on each failed attempt.
/// Returns `None` when cancelled during the wait.
async fn reopen_with_backoff(ctx: &SupervisorContext) -> Option<Box<dyn Transport>> {
    let mut backoff = RECONNECT_BACKOFF_INITIAL;
    loop {
        let delay = jittered(backoff);
        debug!(?delay, "waiting before reconnect attempt");
        tokio::select! {
            _ = ctx.cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        match open_transport(ctx.connector.as_ref(), &ctx.url, &ctx.header).await {
            Ok(transport) => {
                info!(url = %ctx.url, "uplink reconnected");
                return Some(transport);
            }
            Err(e) => {
                warn!(error = %e, "reconnect attempt failed");
                if let Some(log) = &ctx.debug_log {
                    log(&format!("reconnect attempt failed: {e}"));
                }
            }
        }
        backoff = (backoff * 2).min(RECONNECT_BACKOFF_CAP);
    }
}

/// ±50% so simultaneous clients do not reconnect in lockstep.
fn jittered(base: Duration) -> Duration {
    base.mul_f64(rand::rng().random_range(0.5..1.5))
}

async fn sender_loop(
    transport: Arc<dyn Transport>,
    buffer: Arc<AckBuffer>,
    cancel: CancellationToken,
    fault: mpsc::Sender<SessionFault>,
) {
    debug!("sender loop started");
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = buffer.next_to_deliver(SENDER_POLL_TICK) => msg,
        };
        let Some(msg) = msg else { continue };

        trace!(seq = msg.seq_num, ack_requested = msg.ack_requested, "sending record");
        if let Err(e) = transport.write_data(&msg, DATA_WRITE_DEADLINE).await {
            debug!(error = %e, seq = msg.seq_num, "data write failed");
            let _ = fault.try_send(SessionFault::Write(e));
            break;
        }
    }
    debug!("sender loop exited");
}

async fn receiver_loop(
    transport: Arc<dyn Transport>,
    buffer: Arc<AckBuffer>,
    cancel: CancellationToken,
    fault: mpsc::Sender<SessionFault>,
    debug_log: Option<DebugLogFn>,
) {
    debug!("receiver loop started");
    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = transport.read_message(IDLE_READ_DEADLINE) => result,
        };

        match result {
            Ok(Frame::Control(msg)) => match msg.verb {
                ControlVerb::Ack => {
                    let Some(seq) = msg.seq_num else {
                        debug!("ACK frame without a sequence number");
                        continue;
                    };
                    trace!(seq, "ack received");
                    if let Err(e) = buffer.ack(seq) {
                        // The peer may be acking state from a previous
                        // connection; the stream itself is still healthy.
                        debug!(error = %e, "ignoring unexpected ack");
                        if let Some(log) = &debug_log {
                            log(&format!("ignoring unexpected ack: {e}"));
                        }
                    }
                }
                ControlVerb::Reconnect => {
                    info!("peer requested reconnect");
                    let _ = fault.try_send(SessionFault::ReconnectRequested);
                    break;
                }
            },
            Ok(frame) => {
                debug!(?frame, "ignoring non-control frame from peer");
            }
            Err(e) => {
                debug!(error = %e, "read failed");
                let _ = fault.try_send(SessionFault::Read(e));
                break;
            }
        }
    }
    debug!("receiver loop exited");
}
