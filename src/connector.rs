//! One connector per logical SMSC binding: a perpetual
//! connect -> bind -> run -> reconnect loop. While bound, the connector
//! drains its MT work queue into the session and routes inbound deliver_sm
//! traffic to the DLR and MO paths.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ConnectorConfig;
use crate::datatypes::{CommandStatus, DeliverSm, SubmitSm, esm_class};
use crate::dlr::{DlrEvent, DlrRecord, parse_dlr_text};
use crate::kv::KvStore;
use crate::mo::{MoError, Reassembler};
use crate::pipeline::{MtJob, PduTemplate};
use crate::queue::{QueueMessage, QueueTransport};
use crate::session::{Session, SessionConfig, SessionState};

/// Shared connector-state registry, read by the status endpoint and the
/// route-table status feed.
pub type StateRegistry = Arc<RwLock<HashMap<String, SessionState>>>;

/// Pause between queue-consume attempts after a transport fault
const CONSUME_RETRY_DELAY: Duration = Duration::from_secs(1);

struct ConnectorInner {
    name: String,
    config: ConnectorConfig,
    queues: Arc<dyn QueueTransport>,
    kv: Arc<dyn KvStore>,
    states: StateRegistry,
    work_queue: String,
    dlr_queue: String,
    mo_queue: String,
    reassembler: Reassembler,
}

#[derive(Clone)]
pub struct Connector {
    inner: Arc<ConnectorInner>,
}

impl Connector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        config: ConnectorConfig,
        queues: Arc<dyn QueueTransport>,
        kv: Arc<dyn KvStore>,
        states: StateRegistry,
        work_queue: String,
        dlr_queue: String,
        mo_queue: String,
    ) -> Connector {
        let reassembler = Reassembler::new(
            Arc::clone(&kv),
            name,
            config.mo_part_ttl(),
            config.multipart_strict,
        );

        Connector {
            inner: Arc::new(ConnectorInner {
                name: name.to_string(),
                config,
                queues,
                kv,
                states,
                work_queue,
                dlr_queue,
                mo_queue,
                reassembler,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn set_state(&self, state: SessionState) {
        self.inner
            .states
            .write()
            .expect("state registry lock")
            .insert(self.inner.name.clone(), state);
    }

    /// The perpetual lifecycle. Returns when the supervisor cancels, or after
    /// a session loss with reconnects disabled.
    pub async fn run(&self, shutdown: CancellationToken) {
        self.set_state(SessionState::Closed);
        self.ensure_queues(&shutdown).await;

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            if let Err(err) = self.run_session(&shutdown).await {
                warn!(connector = %self.inner.name, error = %err, "session attempt failed");
            }
            self.set_state(SessionState::Closed);

            if shutdown.is_cancelled() || !self.inner.config.conn_loss_retry {
                break;
            }

            debug!(
                connector = %self.inner.name,
                delay_s = self.inner.config.conn_loss_delay,
                "reconnecting after delay"
            );
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.inner.config.conn_loss_delay()) => {}
            }
        }

        self.set_state(SessionState::Closed);
    }

    /// Queue-transport faults are retried with a bounded pause; the
    /// connector cannot run without its queues.
    async fn ensure_queues(&self, shutdown: &CancellationToken) {
        let names = [
            self.inner.work_queue.clone(),
            self.inner.dlr_queue.clone(),
            self.inner.mo_queue.clone(),
        ];

        for name in names {
            loop {
                if shutdown.is_cancelled() {
                    return;
                }
                match self.inner.queues.ensure_queue(&name).await {
                    Ok(()) => break,
                    Err(err) => {
                        warn!(queue = %name, error = %err, "queue not available, retrying");
                        tokio::select! {
                            _ = shutdown.cancelled() => return,
                            _ = tokio::time::sleep(CONSUME_RETRY_DELAY) => {}
                        }
                    }
                }
            }
        }
    }

    /// One connect/bind/serve cycle.
    async fn run_session(&self, shutdown: &CancellationToken) -> Result<(), crate::session::SessionError> {
        let (deliver_tx, deliver_rx) = mpsc::channel(16);

        let session =
            Session::connect(SessionConfig::from_connector(&self.inner.config), deliver_tx).await?;
        self.set_state(SessionState::Open);

        if let Err(err) = session.bind().await {
            return Err(err);
        }
        self.set_state(SessionState::BoundTrx);
        info!(connector = %self.inner.name, "connector bound");

        let inbound = tokio::spawn({
            let connector = self.clone();
            async move { connector.inbound_loop(deliver_rx).await }
        });
        let consumer = tokio::spawn({
            let connector = self.clone();
            let session = session.clone();
            let cancel = shutdown.child_token();
            async move { connector.consume_loop(session, cancel).await }
        });

        tokio::select! {
            _ = session.closed() => {}
            _ = shutdown.cancelled() => session.close().await,
        }

        consumer.abort();
        inbound.abort();
        Ok(())
    }

    /// Drain the MT work queue while the session is up. Prefetch is bounded
    /// by the declared submit throughput (default 1) so per-connector
    /// ordering and pacing hold.
    async fn consume_loop(&self, session: Session, cancel: CancellationToken) {
        let prefetch = self.inner.config.submit_throughput.max(1) as usize;

        loop {
            if cancel.is_cancelled() || session.is_closed() {
                break;
            }

            let messages = match self.inner.queues.receive(&self.inner.work_queue, prefetch).await
            {
                Ok(messages) => messages,
                Err(err) => {
                    warn!(connector = %self.inner.name, error = %err, "work queue receive failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(CONSUME_RETRY_DELAY) => {}
                    }
                    continue;
                }
            };

            for message in messages {
                self.handle_work_message(&session, &message).await;
            }
        }
    }

    /// Process one queued MT job. The message is acknowledged after the last
    /// PDU's response or on terminal failure; poison messages are
    /// acknowledged and dropped.
    async fn handle_work_message(&self, session: &Session, message: &QueueMessage) {
        let job: MtJob = match serde_json::from_str(&message.body) {
            Ok(job) => job,
            Err(err) => {
                warn!(connector = %self.inner.name, error = %err, "work message is not valid JSON, dropping");
                self.ack(message).await;
                return;
            }
        };

        if job.pdus.is_empty() {
            warn!(connector = %self.inner.name, req_id = %job.req_id, "work message has no PDUs, dropping");
            self.ack(message).await;
            return;
        }

        let total = job.pdus.len();
        for (index, template) in job.pdus.iter().enumerate() {
            let is_last = index + 1 == total;

            let pdu = match build_submit_sm(template) {
                Ok(pdu) => pdu,
                Err(err) => {
                    warn!(
                        connector = %self.inner.name,
                        req_id = %job.req_id,
                        error = %err,
                        "unusable PDU template, dropping event"
                    );
                    break;
                }
            };

            // Submissions within one bundle are strictly sequential: the
            // next submit awaits the previous response
            match session.submit(pdu).await {
                Ok(resp) if resp.command_status == CommandStatus::Ok => {
                    debug!(
                        connector = %self.inner.name,
                        req_id = %job.req_id,
                        part = index + 1,
                        message_id = %resp.message_id,
                        "submit_sm accepted"
                    );
                    if is_last {
                        if let Some(dlr) = &job.dlr {
                            self.record_dlr_request(&job.req_id, dlr, &resp.message_id).await;
                        }
                    }
                }
                Ok(resp) => {
                    // Remaining PDUs of the bundle are not sent; no retry at
                    // this layer
                    warn!(
                        connector = %self.inner.name,
                        req_id = %job.req_id,
                        part = index + 1,
                        status = ?resp.command_status,
                        "submit_sm rejected, dropping remainder of bundle"
                    );
                    break;
                }
                Err(err) => {
                    warn!(
                        connector = %self.inner.name,
                        req_id = %job.req_id,
                        part = index + 1,
                        error = %err,
                        "submit_sm failed, dropping remainder of bundle"
                    );
                    break;
                }
            }
        }

        self.ack(message).await;
    }

    async fn ack(&self, message: &QueueMessage) {
        if let Err(err) = self
            .inner
            .queues
            .ack(&self.inner.work_queue, &[message.receipt.clone()])
            .await
        {
            warn!(connector = %self.inner.name, error = %err, "failed to ack work message");
        }
    }

    /// Store the DLR correlation record under the SMSC message id, and for
    /// levels 1 and 3 publish the immediate submission-accepted event.
    async fn record_dlr_request(&self, req_id: &str, dlr: &crate::dlr::DlrRequest, message_id: &str) {
        if message_id.is_empty() {
            warn!(connector = %self.inner.name, req_id, "ROK response without message_id, cannot correlate DLR");
            return;
        }

        let record = DlrRecord {
            id: req_id.to_string(),
            url: dlr.url.clone(),
            method: dlr.method.clone(),
            level: dlr.level,
        };

        let payload = match serde_json::to_string(&record) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "DLR record serialization failed");
                return;
            }
        };

        if let Err(err) = self
            .inner
            .kv
            .set_ex(message_id, &payload, self.inner.config.dlr_expiry())
            .await
        {
            warn!(connector = %self.inner.name, error = %err, "failed to store DLR correlation record");
            return;
        }

        if dlr.level == 1 || dlr.level == 3 {
            let event = DlrEvent {
                id: req_id.to_string(),
                id_smsc: Some(message_id.to_string()),
                connector: self.inner.name.clone(),
                level: dlr.level,
                method: dlr.method.clone(),
                url: dlr.url.clone(),
                message_status: "ACCEPTD".to_string(),
                subdate: None,
                donedate: None,
                sub: None,
                dlvrd: None,
                err: None,
                text: None,
                retries: 0,
            };
            self.publish_dlr(&event).await;
        }
    }

    async fn publish_dlr(&self, event: &DlrEvent) {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "DLR event serialization failed");
                return;
            }
        };
        if let Err(err) = self.inner.queues.send(&self.inner.dlr_queue, payload).await {
            warn!(connector = %self.inner.name, error = %err, "failed to publish DLR event");
        }
    }

    /// Inbound deliver_sm dispatch: receipts to the DLR path, default-type
    /// messages to MO reassembly, everything else logged and dropped.
    async fn inbound_loop(&self, mut deliver_rx: mpsc::Receiver<DeliverSm>) {
        while let Some(pdu) = deliver_rx.recv().await {
            if esm_class::is_receipt(pdu.esm_class) {
                self.process_dlr(&pdu).await;
            } else if esm_class::is_default_type(pdu.esm_class) {
                self.process_mo(&pdu).await;
            } else {
                warn!(
                    connector = %self.inner.name,
                    esm_class = format_args!("{:#04x}", pdu.esm_class),
                    "deliver_sm with unhandled message type, dropping"
                );
            }
        }
    }

    /// A receipt-flagged deliver_sm: parse the status line, look up the
    /// correlation record, publish the DLR event. A missing record is a soft
    /// error (the record may have expired).
    async fn process_dlr(&self, pdu: &DeliverSm) {
        let Some(info) = parse_dlr_text(&pdu.short_message) else {
            warn!(connector = %self.inner.name, "receipt text missing id or stat, dropping");
            return;
        };

        let stored = match self.inner.kv.get(&info.id).await {
            Ok(Some(stored)) => stored,
            Ok(None) => {
                warn!(
                    connector = %self.inner.name,
                    id_smsc = %info.id,
                    "no DLR correlation record (expired or never requested), dropping"
                );
                return;
            }
            Err(err) => {
                warn!(connector = %self.inner.name, error = %err, "DLR correlation lookup failed");
                return;
            }
        };

        let record: DlrRecord = match serde_json::from_str(&stored) {
            Ok(record) => record,
            Err(err) => {
                warn!(connector = %self.inner.name, error = %err, "stored DLR record is not valid JSON");
                return;
            }
        };

        let event = DlrEvent {
            id: record.id,
            id_smsc: Some(info.id),
            connector: self.inner.name.clone(),
            level: record.level,
            method: record.method,
            url: record.url,
            message_status: info.stat,
            subdate: Some(info.sdate),
            donedate: Some(info.ddate),
            sub: Some(info.sub),
            dlvrd: Some(info.dlvrd),
            err: Some(info.err),
            text: Some(info.text),
            retries: 0,
        };
        self.publish_dlr(&event).await;
    }

    async fn process_mo(&self, pdu: &DeliverSm) {
        match self.inner.reassembler.ingest(pdu).await {
            Ok(Some(event)) => {
                let payload = match serde_json::to_string(&event) {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(error = %err, "MO event serialization failed");
                        return;
                    }
                };
                if let Err(err) = self.inner.queues.send(&self.inner.mo_queue, payload).await {
                    warn!(connector = %self.inner.name, error = %err, "failed to publish MO event");
                }
            }
            Ok(None) => {} // waiting for more segments
            Err(MoError::UnsupportedCoding(coding)) => {
                warn!(
                    connector = %self.inner.name,
                    data_coding = format_args!("{coding:#04x}"),
                    "SIM-class MO dropped"
                );
            }
            Err(err) => {
                warn!(connector = %self.inner.name, error = %err, "MO reassembly failed");
            }
        }
    }
}

/// Materialize a queued template into a wire PDU. The sequence number is
/// assigned by the session at submit time.
fn build_submit_sm(template: &PduTemplate) -> Result<SubmitSm, hex::FromHexError> {
    let octets = template.message_octets()?;

    Ok(SubmitSm {
        sequence_number: 0,
        service_type: template.service_type.clone(),
        source_addr_ton: template.source_addr_ton,
        source_addr_npi: template.source_addr_npi,
        source_addr: template.source_addr.clone(),
        dest_addr_ton: template.dest_addr_ton,
        dest_addr_npi: template.dest_addr_npi,
        destination_addr: template.destination_addr.clone(),
        esm_class: template.esm_class,
        protocol_id: template.protocol_id.unwrap_or(0),
        priority_flag: template.priority_flag,
        schedule_delivery_time: template.schedule_delivery_time.clone(),
        validity_period: template.validity_period.clone(),
        registered_delivery: template.registered_delivery,
        replace_if_present_flag: template.replace_if_present_flag,
        data_coding: template.data_coding,
        sm_default_msg_id: template.sm_default_msg_id,
        short_message: bytes::Bytes::from(octets),
        sar_msg_ref_num: template.sar_msg_ref_num,
        sar_total_segments: template.sar_total_segments,
        sar_segment_seqnum: template.sar_segment_seqnum,
        more_messages_to_send: template.more_messages_to_send,
        extra_tlvs: Vec::new(),
    })
}
