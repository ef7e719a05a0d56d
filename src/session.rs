//! One SMPP session: a TCP connection, its bind state, and request/response
//! correlation by sequence number.
//!
//! Concurrency contract: one dedicated read loop owns the socket's read
//! half; writes are serialized behind an async mutex. Callers of `submit`
//! get a completion future, they never touch the socket. Inbound deliver_sm
//! PDUs are acknowledged on the spot and handed to the connector over an
//! mpsc channel.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{CodecError, Frame};
use crate::config::ConnectorConfig;
use crate::connection::{Connection, FrameWriter};
use crate::datatypes::{
    BindTransceiver, CommandStatus, DeliverSm, DeliverSmResponse, EnquireLink,
    EnquireLinkResponse, GenericNack, INTERFACE_VERSION_34, SubmitSm, SubmitSmResponse,
    UnbindResponse,
};

/// Sequence numbers past this point trigger a session recycle rather than
/// risking wraparound mid-flight.
const SEQUENCE_CEILING: u32 = 0x7FFF_FFFF;

/// SMPP session states. Only the transceiver path is driven by this gateway;
/// the TX/RX states exist so status reporting can name them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Open,
    BoundTrx,
    BoundTx,
    BoundRx,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Closed => "CLOSED",
            SessionState::Open => "OPEN",
            SessionState::BoundTrx => "BOUND_TRX",
            SessionState::BoundTx => "BOUND_TX",
            SessionState::BoundRx => "BOUND_RX",
        }
    }
}

/// Everything a session needs to connect and keep itself alive.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    pub system_id: String,
    pub password: String,
    pub system_type: Option<String>,
    pub addr_ton: u8,
    pub addr_npi: u8,
    pub address_range: Option<String>,
    pub bind_timeout: Duration,
    pub submit_timeout: Duration,
    pub enquire_link_period: Duration,
    pub enquire_link_timeout: Duration,
}

impl SessionConfig {
    pub fn from_connector(config: &ConnectorConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            system_id: config.systemid.clone(),
            password: config.password.clone(),
            system_type: config.system_type.clone(),
            addr_ton: config.bind_ton,
            addr_npi: config.bind_npi,
            address_range: config.addr_range.clone(),
            bind_timeout: config.bind_timeout(),
            submit_timeout: config.submit_timeout(),
            enquire_link_period: config.enquire_link_period(),
            enquire_link_timeout: config.enquire_link_timeout(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connect to {host}:{port} failed: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("{0} response not received within the deadline")]
    Timeout(&'static str),

    #[error("connection lost")]
    ConnectionLost,

    #[error("bind rejected with status {0:?}")]
    BindRejected(CommandStatus),

    #[error("SMSC interface version {0:#04x} is newer than ours")]
    UnsupportedInterfaceVersion(u8),

    #[error("invalid session state: {0}")]
    InvalidState(&'static str),

    #[error("unexpected response PDU for sequence number")]
    UnexpectedResponse,

    #[error("session sequence numbers exhausted")]
    SequenceExhausted,
}

struct SessionInner {
    config: SessionConfig,
    writer: tokio::sync::Mutex<FrameWriter>,
    // seq -> completion sink; an entry leaves this map exactly once, by
    // response, by timeout, or by close
    pending: Mutex<HashMap<u32, oneshot::Sender<Frame>>>,
    state: Mutex<SessionState>,
    sequence: AtomicU32,
    cancel: CancellationToken,
}

impl SessionInner {
    fn state(&self) -> SessionState {
        *self.state.lock().expect("state lock")
    }

    fn set_state(&self, state: SessionState) {
        let mut current = self.state.lock().expect("state lock");
        debug!(from = current.as_str(), to = state.as_str(), "session state transition");
        *current = state;
    }

    fn next_sequence(&self) -> Result<u32, SessionError> {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        if seq > SEQUENCE_CEILING {
            return Err(SessionError::SequenceExhausted);
        }
        Ok(seq)
    }

    async fn write(&self, frame: &Frame) -> Result<(), SessionError> {
        let mut writer = self.writer.lock().await;
        writer.write_frame(frame).await?;
        Ok(())
    }

    /// Close the session: cancel the enquire-link loop and read loop, fail
    /// every pending request with connection-lost, shut the socket.
    async fn close(&self) {
        self.set_state(SessionState::Closed);
        self.cancel.cancel();

        // Dropping the sinks completes every waiter with ConnectionLost
        let pending: Vec<_> = {
            let mut map = self.pending.lock().expect("pending lock");
            map.drain().collect()
        };
        drop(pending);

        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    /// Send a request frame and await its response by sequence number.
    ///
    /// A timeout removes the pending entry itself; a response removes it in
    /// the read loop; session close drains it. Exactly one of the three wins.
    async fn request(
        &self,
        frame: Frame,
        seq: u32,
        deadline: Duration,
        what: &'static str,
    ) -> Result<Frame, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("pending lock").insert(seq, tx);

        if let Err(err) = self.write(&frame).await {
            self.pending.lock().expect("pending lock").remove(&seq);
            return Err(err);
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(response)) => Ok(response),
            // Sink dropped: the session closed under us
            Ok(Err(_)) => Err(SessionError::ConnectionLost),
            Err(_) => {
                self.pending.lock().expect("pending lock").remove(&seq);
                Err(SessionError::Timeout(what))
            }
        }
    }
}

/// Handle to one SMPP session. Cheap to clone; the underlying connection is
/// shared.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// TCP-connect to the SMSC (CLOSED -> OPEN) and start the read loop.
    /// Inbound deliver_sm PDUs are pushed into `deliver_tx` after being
    /// acknowledged on the wire.
    pub async fn connect(
        config: SessionConfig,
        deliver_tx: mpsc::Sender<DeliverSm>,
    ) -> Result<Session, SessionError> {
        let connection = Connection::connect(&config.host, config.port)
            .await
            .map_err(|source| SessionError::Connect {
                host: config.host.clone(),
                port: config.port,
                source,
            })?;

        let (reader, writer) = connection.into_split();

        let inner = Arc::new(SessionInner {
            config,
            writer: tokio::sync::Mutex::new(writer),
            pending: Mutex::new(HashMap::new()),
            state: Mutex::new(SessionState::Open),
            sequence: AtomicU32::new(0),
            cancel: CancellationToken::new(),
        });

        tokio::spawn(read_loop(Arc::clone(&inner), reader, deliver_tx));

        Ok(Session { inner })
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Resolves when the session has closed for any reason.
    pub async fn closed(&self) {
        self.inner.cancel.cancelled().await;
    }

    pub async fn close(&self) {
        self.inner.close().await;
    }

    /// OPEN -> BOUND_TRX. Sends bind_transceiver and validates the response,
    /// including the sc_interface_version TLV; starts the enquire-link loop
    /// on success. Any failure closes the session.
    pub async fn bind(&self) -> Result<(), SessionError> {
        if self.inner.state() != SessionState::Open {
            return Err(SessionError::InvalidState("bind requires an open, unbound session"));
        }

        let seq = self.inner.next_sequence()?;
        let config = &self.inner.config;
        let frame = Frame::BindTransceiver(BindTransceiver {
            sequence_number: seq,
            system_id: config.system_id.clone(),
            password: Some(config.password.clone()),
            system_type: config.system_type.clone(),
            interface_version: INTERFACE_VERSION_34,
            addr_ton: config.addr_ton,
            addr_npi: config.addr_npi,
            address_range: config.address_range.clone(),
        });

        let deadline = config.bind_timeout;
        let response = match self.inner.request(frame, seq, deadline, "bind_transceiver").await {
            Ok(response) => response,
            Err(err) => {
                self.inner.close().await;
                return Err(err);
            }
        };

        let resp = match response {
            Frame::BindTransceiverResp(resp) => resp,
            _ => {
                self.inner.close().await;
                return Err(SessionError::UnexpectedResponse);
            }
        };

        if resp.command_status != CommandStatus::Ok {
            self.inner.close().await;
            return Err(SessionError::BindRejected(resp.command_status));
        }

        if let Some(version) = resp.sc_interface_version {
            if version > INTERFACE_VERSION_34 {
                self.inner.close().await;
                return Err(SessionError::UnsupportedInterfaceVersion(version));
            }
        }

        self.inner.set_state(SessionState::BoundTrx);
        info!(system_id = %self.inner.config.system_id, "transceiver bound");

        tokio::spawn(enquire_link_loop(Arc::clone(&self.inner)));
        Ok(())
    }

    /// Submit one PDU and await its response. The sequence number is
    /// allocated here. A submit timeout fails this call only; the session
    /// stays up.
    pub async fn submit(&self, mut pdu: SubmitSm) -> Result<SubmitSmResponse, SessionError> {
        // Non-bind PDUs are refused locally outside a bound state
        if self.inner.state() != SessionState::BoundTrx {
            return Err(SessionError::InvalidState("submit requires a bound session"));
        }

        let seq = match self.inner.next_sequence() {
            Ok(seq) => seq,
            Err(err) => {
                // Sequence space exhausted: recycle the session
                self.inner.close().await;
                return Err(err);
            }
        };
        pdu.sequence_number = seq;

        let deadline = self.inner.config.submit_timeout;
        let response = self
            .inner
            .request(Frame::SubmitSm(Box::new(pdu)), seq, deadline, "submit_sm")
            .await?;

        match response {
            Frame::SubmitSmResp(resp) => Ok(resp),
            _ => Err(SessionError::UnexpectedResponse),
        }
    }
}

/// Dedicated read loop: frames PDUs off the socket, completes pending
/// requests, acknowledges SMSC-initiated traffic.
async fn read_loop(
    inner: Arc<SessionInner>,
    mut reader: crate::connection::FrameReader,
    deliver_tx: mpsc::Sender<DeliverSm>,
) {
    loop {
        let frame = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            frame = reader.read_frame() => frame,
        };

        match frame {
            Ok(Some(frame)) => {
                if handle_frame(&inner, frame, &deliver_tx).await.is_break() {
                    break;
                }
            }
            Ok(None) => {
                info!("SMSC closed the connection");
                inner.close().await;
                break;
            }
            Err(err) => {
                // Malformed PDU or socket error: the session is done
                warn!(error = %err, "read loop terminating");
                inner.close().await;
                break;
            }
        }
    }
}

async fn handle_frame(
    inner: &Arc<SessionInner>,
    frame: Frame,
    deliver_tx: &mpsc::Sender<DeliverSm>,
) -> std::ops::ControlFlow<()> {
    use std::ops::ControlFlow;

    if frame.is_response() {
        let seq = frame.sequence_number();
        let sink = inner.pending.lock().expect("pending lock").remove(&seq);
        match sink {
            // The receiver may have timed out already; nothing to do then
            Some(sink) => {
                let _ = sink.send(frame);
            }
            None => warn!(seq, "response with no matching request, discarding"),
        }
        return ControlFlow::Continue(());
    }

    match frame {
        Frame::DeliverSm(pdu) => {
            let ack = Frame::DeliverSmResp(DeliverSmResponse::ok(pdu.sequence_number));
            if let Err(err) = inner.write(&ack).await {
                warn!(error = %err, "failed to ack deliver_sm");
                inner.close().await;
                return ControlFlow::Break(());
            }
            if deliver_tx.send(*pdu).await.is_err() {
                debug!("deliver_sm receiver dropped, inbound PDU discarded");
            }
        }
        Frame::EnquireLink(pdu) => {
            let resp = Frame::EnquireLinkResp(EnquireLinkResponse::new(pdu.sequence_number));
            if let Err(err) = inner.write(&resp).await {
                warn!(error = %err, "failed to answer enquire_link");
                inner.close().await;
                return ControlFlow::Break(());
            }
        }
        Frame::Unbind(pdu) => {
            info!("SMSC requested unbind");
            let resp = Frame::UnbindResp(UnbindResponse::new(pdu.sequence_number));
            let _ = inner.write(&resp).await;
            inner.close().await;
            return ControlFlow::Break(());
        }
        Frame::Unknown { header, .. } => {
            warn!(
                command_id = format_args!("{:#010x}", header.command_id),
                seq = header.sequence_number,
                "unsupported command, sending generic_nack"
            );
            let nack = Frame::GenericNack(GenericNack::invalid_command_id(header.sequence_number));
            let _ = inner.write(&nack).await;
        }
        other => {
            warn!(
                command_id = format_args!("{:#010x}", other.command_id()),
                "unexpected request PDU, sending generic_nack"
            );
            let nack =
                Frame::GenericNack(GenericNack::invalid_command_id(other.sequence_number()));
            let _ = inner.write(&nack).await;
        }
    }

    ControlFlow::Continue(())
}

/// Periodic keepalive. A missing enquire_link_resp within its own short
/// deadline means the connection is dead.
async fn enquire_link_loop(inner: Arc<SessionInner>) {
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = tokio::time::sleep(inner.config.enquire_link_period) => {}
        }

        let seq = match inner.next_sequence() {
            Ok(seq) => seq,
            Err(_) => {
                inner.close().await;
                break;
            }
        };

        let frame = Frame::EnquireLink(EnquireLink::new(seq));
        let deadline = inner.config.enquire_link_timeout;
        match inner.request(frame, seq, deadline, "enquire_link").await {
            Ok(_) => debug!(seq, "enquire_link answered"),
            Err(SessionError::Timeout(_)) => {
                warn!(seq, "enquire_link went unanswered, closing session");
                inner.close().await;
                break;
            }
            Err(_) => break, // already closing
        }
    }
}
