//! Cross-module tests: a mock SMSC speaking the real codec over loopback
//! TCP, driven through the session, the connector, and the HTTP front.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::codec::Frame;
use crate::config::{ConnectorConfig, GatewayConfig, RouteConfig};
use crate::connection::{Connection, FrameWriter};
use crate::connector::{Connector, StateRegistry};
use crate::datatypes::{
    BindTransceiverResponse, CommandStatus, DeliverSm, EnquireLinkResponse, SubmitSm,
    SubmitSmResponse, UnbindResponse, esm_class,
};
use crate::dlr::{DlrEvent, DlrRecord, DlrRequest};
use crate::httpapi::{ApiState, process_send};
use crate::interceptor::InterceptorRegistry;
use crate::kv::{KvStore, MemoryKv};
use crate::mo::MoEvent;
use crate::pipeline::{MtJob, MtPipeline, PduTemplate};
use crate::queue::{MemoryQueue, QueueTransport};
use crate::routing::RouteTable;
use crate::session::{Session, SessionConfig, SessionError, SessionState};

/// Scripted SMSC behaviour plus a record of what it saw.
struct MockSmsc {
    reject_bind: bool,
    ignore_enquire_link: bool,
    submit_status: CommandStatus,
    message_id_counter: AtomicUsize,
    binds: Mutex<Vec<String>>,
    submits: Mutex<Vec<SubmitSm>>,
    enquire_links: AtomicU32,
    // Write half of the most recent client, for injecting deliver_sm
    client: tokio::sync::Mutex<Option<Arc<tokio::sync::Mutex<FrameWriter>>>>,
}

impl Default for MockSmsc {
    fn default() -> Self {
        Self {
            reject_bind: false,
            ignore_enquire_link: false,
            submit_status: CommandStatus::Ok,
            message_id_counter: AtomicUsize::new(0),
            binds: Mutex::new(Vec::new()),
            submits: Mutex::new(Vec::new()),
            enquire_links: AtomicU32::new(0),
            client: tokio::sync::Mutex::new(None),
        }
    }
}

impl MockSmsc {
    async fn spawn(smsc: &Arc<Self>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind loopback");
        let addr = listener.local_addr().expect("local addr");

        let smsc = Arc::clone(smsc);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let smsc = Arc::clone(&smsc);
                tokio::spawn(async move { smsc.serve(stream).await });
            }
        });

        addr
    }

    async fn serve(self: Arc<Self>, stream: tokio::net::TcpStream) {
        let (mut reader, writer) = Connection::new(stream).into_split();
        let writer = Arc::new(tokio::sync::Mutex::new(writer));
        *self.client.lock().await = Some(Arc::clone(&writer));

        while let Ok(Some(frame)) = reader.read_frame().await {
            let response = match frame {
                Frame::BindTransceiver(pdu) => {
                    self.binds.lock().expect("binds lock").push(pdu.system_id.clone());
                    if self.reject_bind {
                        Some(Frame::BindTransceiverResp(BindTransceiverResponse::error(
                            pdu.sequence_number,
                            CommandStatus::InvalidPassword,
                        )))
                    } else {
                        Some(Frame::BindTransceiverResp(BindTransceiverResponse::ok(
                            pdu.sequence_number,
                            "mock-smsc",
                        )))
                    }
                }
                Frame::SubmitSm(pdu) => {
                    let seq = pdu.sequence_number;
                    self.submits.lock().expect("submits lock").push(*pdu);
                    if self.submit_status == CommandStatus::Ok {
                        let n = self.message_id_counter.fetch_add(1, Ordering::Relaxed) + 1;
                        Some(Frame::SubmitSmResp(SubmitSmResponse::ok(
                            seq,
                            &format!("MOCKID{n}"),
                        )))
                    } else {
                        Some(Frame::SubmitSmResp(SubmitSmResponse::error(
                            seq,
                            self.submit_status,
                        )))
                    }
                }
                Frame::EnquireLink(pdu) => {
                    self.enquire_links.fetch_add(1, Ordering::Relaxed);
                    if self.ignore_enquire_link {
                        None
                    } else {
                        Some(Frame::EnquireLinkResp(EnquireLinkResponse::new(
                            pdu.sequence_number,
                        )))
                    }
                }
                Frame::Unbind(pdu) => {
                    let resp = Frame::UnbindResp(UnbindResponse::new(pdu.sequence_number));
                    let _ = writer.lock().await.write_frame(&resp).await;
                    break;
                }
                // Acks for injected deliver_sm PDUs
                Frame::DeliverSmResp(_) | Frame::EnquireLinkResp(_) => None,
                _ => None,
            };

            if let Some(response) = response {
                if writer.lock().await.write_frame(&response).await.is_err() {
                    break;
                }
            }
        }
    }

    /// Inject a deliver_sm towards the currently connected client.
    async fn deliver(&self, pdu: DeliverSm) {
        let client = self.client.lock().await;
        let writer = client.as_ref().expect("a client is connected");
        writer
            .lock()
            .await
            .write_frame(&Frame::DeliverSm(Box::new(pdu)))
            .await
            .expect("deliver_sm written");
    }

    fn submit_count(&self) -> usize {
        self.submits.lock().expect("submits lock").len()
    }
}

fn session_config(addr: SocketAddr) -> SessionConfig {
    SessionConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
        system_id: "test1".to_string(),
        password: "testpw".to_string(),
        system_type: None,
        addr_ton: 0,
        addr_npi: 1,
        address_range: None,
        bind_timeout: Duration::from_millis(500),
        submit_timeout: Duration::from_millis(500),
        enquire_link_period: Duration::from_secs(30),
        enquire_link_timeout: Duration::from_millis(150),
    }
}

fn submit_pdu(text: &[u8]) -> SubmitSm {
    SubmitSm {
        source_addr: Some("447428666666".to_string()),
        destination_addr: "447428555555".to_string(),
        source_addr_ton: 2,
        source_addr_npi: 1,
        dest_addr_ton: 1,
        dest_addr_npi: 1,
        esm_class: 0x03,
        short_message: bytes::Bytes::copy_from_slice(text),
        ..Default::default()
    }
}

async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn session_binds_and_submits() {
    let smsc = Arc::new(MockSmsc::default());
    let addr = MockSmsc::spawn(&smsc).await;

    let (deliver_tx, _deliver_rx) = mpsc::channel(4);
    let session = Session::connect(session_config(addr), deliver_tx)
        .await
        .expect("connect");
    assert_eq!(session.state(), SessionState::Open);

    session.bind().await.expect("bind");
    assert_eq!(session.state(), SessionState::BoundTrx);
    assert_eq!(smsc.binds.lock().unwrap().as_slice(), ["test1"]);

    let resp = session.submit(submit_pdu(b"hello")).await.expect("submit");
    assert_eq!(resp.command_status, CommandStatus::Ok);
    assert_eq!(resp.message_id, "MOCKID1");

    let resp = session.submit(submit_pdu(b"again")).await.expect("submit");
    assert_eq!(resp.message_id, "MOCKID2");

    // Outbound sequence numbers are strictly increasing
    let submits = smsc.submits.lock().unwrap();
    assert_eq!(submits.len(), 2);
    assert!(submits[0].sequence_number < submits[1].sequence_number);

    drop(submits);
    session.close().await;
}

#[tokio::test]
async fn bind_rejection_closes_the_session() {
    let smsc = Arc::new(MockSmsc {
        reject_bind: true,
        ..Default::default()
    });
    let addr = MockSmsc::spawn(&smsc).await;

    let (deliver_tx, _deliver_rx) = mpsc::channel(4);
    let session = Session::connect(session_config(addr), deliver_tx)
        .await
        .expect("connect");

    let err = session.bind().await.expect_err("bind must fail");
    assert!(matches!(
        err,
        SessionError::BindRejected(CommandStatus::InvalidPassword)
    ));
    assert!(session.is_closed());
}

#[tokio::test]
async fn submit_outside_bound_state_fails_locally() {
    let smsc = Arc::new(MockSmsc::default());
    let addr = MockSmsc::spawn(&smsc).await;

    let (deliver_tx, _deliver_rx) = mpsc::channel(4);
    let session = Session::connect(session_config(addr), deliver_tx)
        .await
        .expect("connect");

    let err = session.submit(submit_pdu(b"nope")).await.expect_err("unbound");
    assert!(matches!(err, SessionError::InvalidState(_)));

    // The PDU never touched the socket
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(smsc.submit_count(), 0);
}

#[tokio::test]
async fn unanswered_enquire_link_is_fatal() {
    let smsc = Arc::new(MockSmsc {
        ignore_enquire_link: true,
        ..Default::default()
    });
    let addr = MockSmsc::spawn(&smsc).await;

    let mut config = session_config(addr);
    config.enquire_link_period = Duration::from_millis(50);
    config.enquire_link_timeout = Duration::from_millis(100);

    let (deliver_tx, _deliver_rx) = mpsc::channel(4);
    let session = Session::connect(config, deliver_tx).await.expect("connect");
    session.bind().await.expect("bind");

    tokio::time::timeout(Duration::from_secs(5), session.closed())
        .await
        .expect("session closes after keepalive timeout");
    assert!(session.is_closed());
    assert!(smsc.enquire_links.load(Ordering::Relaxed) >= 1);
}

#[tokio::test]
async fn inbound_deliver_sm_is_acked_and_forwarded() {
    let smsc = Arc::new(MockSmsc::default());
    let addr = MockSmsc::spawn(&smsc).await;

    let (deliver_tx, mut deliver_rx) = mpsc::channel(4);
    let session = Session::connect(session_config(addr), deliver_tx)
        .await
        .expect("connect");
    session.bind().await.expect("bind");

    smsc.deliver(DeliverSm {
        sequence_number: 1000,
        source_addr: Some("447111111111".to_string()),
        destination_addr: "447222222222".to_string(),
        short_message: bytes::Bytes::from_static(b"Hi"),
        ..Default::default()
    })
    .await;

    let pdu = tokio::time::timeout(Duration::from_secs(5), deliver_rx.recv())
        .await
        .expect("deliver_sm forwarded")
        .expect("channel open");
    assert_eq!(pdu.short_message.as_ref(), b"Hi");

    session.close().await;
}

fn connector_config(addr: SocketAddr) -> ConnectorConfig {
    serde_json::from_value(serde_json::json!({
        "host": addr.ip().to_string(),
        "port": addr.port(),
        "systemid": "test1",
        "password": "testpw",
        "bind_timeout_ms": 500,
        "conn_loss_delay": 1
    }))
    .unwrap()
}

struct ConnectorHarness {
    queues: Arc<MemoryQueue>,
    kv: Arc<MemoryKv>,
    states: StateRegistry,
    shutdown: CancellationToken,
}

impl ConnectorHarness {
    async fn start(smsc: Arc<MockSmsc>) -> Self {
        let addr = MockSmsc::spawn(&smsc).await;
        let queues = Arc::new(MemoryQueue::new(false));
        let kv = Arc::new(MemoryKv::new());
        let states: StateRegistry = Arc::new(RwLock::new(HashMap::new()));

        let connector = Connector::new(
            "conn1",
            connector_config(addr),
            Arc::clone(&queues) as Arc<dyn QueueTransport>,
            Arc::clone(&kv) as Arc<dyn KvStore>,
            Arc::clone(&states),
            "smppconn_conn1".to_string(),
            "dlr".to_string(),
            "mo".to_string(),
        );

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        tokio::spawn(async move { connector.run(token).await });

        let harness = Self {
            queues,
            kv,
            states,
            shutdown,
        };
        harness.wait_for_state(SessionState::BoundTrx).await;
        harness
    }

    async fn wait_for_state(&self, expected: SessionState) {
        let states = Arc::clone(&self.states);
        wait_until("connector state", move || {
            states.read().unwrap().get("conn1") == Some(&expected)
        })
        .await;
    }

    async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn connector_submits_bundle_and_correlates_dlr() {
    let smsc = Arc::new(MockSmsc::default());
    let harness = ConnectorHarness::start(Arc::clone(&smsc)).await;

    // A two-part bundle with a level-3 DLR request
    let job = MtJob {
        req_id: "req-42".to_string(),
        connector: "conn1".to_string(),
        pdus: vec![
            PduTemplate {
                destination_addr: "447428555555".to_string(),
                short_message_hex: Some(hex::encode(b"\x05\x00\x03\x01\x02\x01part one ")),
                esm_class: 0x40,
                more_messages_to_send: Some(1),
                ..Default::default()
            },
            PduTemplate {
                destination_addr: "447428555555".to_string(),
                short_message_hex: Some(hex::encode(b"\x05\x00\x03\x01\x02\x02part two")),
                esm_class: 0x40,
                more_messages_to_send: Some(0),
                ..Default::default()
            },
        ],
        dlr: Some(DlrRequest {
            url: "http://example.org/dlr".to_string(),
            level: 3,
            method: "POST".to_string(),
        }),
    };

    harness
        .queues
        .send("smppconn_conn1", serde_json::to_string(&job).unwrap())
        .await
        .unwrap();

    let smsc_for_wait = Arc::clone(&smsc);
    wait_until("both parts submitted", move || {
        smsc_for_wait.submit_count() == 2
    })
    .await;

    {
        let submits = smsc.submits.lock().unwrap();
        assert!(submits[0].sequence_number < submits[1].sequence_number);
        assert_eq!(submits[1].registered_delivery, 0); // template default
    }

    // Correlation record written under the last part's message id
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while harness.kv.get("MOCKID2").await.unwrap().is_none() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for the correlation record"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let record: DlrRecord =
        serde_json::from_str(&harness.kv.get("MOCKID2").await.unwrap().unwrap()).unwrap();
    assert_eq!(record.id, "req-42");
    assert_eq!(record.level, 3);

    // Level 3 publishes the immediate submission-accepted event
    let accepted = harness.queues.receive("dlr", 10).await.unwrap();
    assert_eq!(accepted.len(), 1);
    let event: DlrEvent = serde_json::from_str(&accepted[0].body).unwrap();
    assert_eq!(event.message_status, "ACCEPTD");
    assert_eq!(event.id, "req-42");
    harness.queues.ack("dlr", &[accepted[0].receipt.clone()]).await.unwrap();

    // The receipt arrives later and resolves through the stored record
    let receipt_text = b"id:MOCKID2 sub:001 dlvrd:001 submit date:0610190851 \
        done date:0610190951 stat:DELIVRD err:000 text:";
    smsc.deliver(DeliverSm {
        sequence_number: 2000,
        source_addr: Some("447428555555".to_string()),
        destination_addr: "447428666666".to_string(),
        esm_class: esm_class::TYPE_DELIVERY_ACK,
        short_message: bytes::Bytes::copy_from_slice(receipt_text),
        ..Default::default()
    })
    .await;

    let queues = Arc::clone(&harness.queues);
    wait_until("DLR event", move || queues.depth("dlr") == 1).await;
    let delivered = harness.queues.receive("dlr", 10).await.unwrap();
    let event: DlrEvent = serde_json::from_str(&delivered[0].body).unwrap();
    assert_eq!(event.id, "req-42");
    assert_eq!(event.id_smsc.as_deref(), Some("MOCKID2"));
    assert_eq!(event.message_status, "DELIVRD");

    harness.stop().await;
}

#[tokio::test]
async fn connector_rejected_submit_drops_rest_of_bundle() {
    let smsc = Arc::new(MockSmsc {
        submit_status: CommandStatus::Throttled,
        ..Default::default()
    });
    let harness = ConnectorHarness::start(Arc::clone(&smsc)).await;

    let job = MtJob {
        req_id: "req-drop".to_string(),
        connector: "conn1".to_string(),
        pdus: vec![
            PduTemplate {
                destination_addr: "447428555555".to_string(),
                short_message: Some("part one".to_string()),
                ..Default::default()
            },
            PduTemplate {
                destination_addr: "447428555555".to_string(),
                short_message: Some("part two".to_string()),
                ..Default::default()
            },
        ],
        dlr: None,
    };

    harness
        .queues
        .send("smppconn_conn1", serde_json::to_string(&job).unwrap())
        .await
        .unwrap();

    let smsc_for_wait = Arc::clone(&smsc);
    wait_until("first part submitted", move || {
        smsc_for_wait.submit_count() >= 1
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    // The rejected first part stops the bundle; part two is never sent
    assert_eq!(smsc.submit_count(), 1);
    // The event was acknowledged, not retried
    assert_eq!(harness.queues.depth("smppconn_conn1"), 0);

    harness.stop().await;
}

#[tokio::test]
async fn connector_poison_message_is_acked_and_dropped() {
    let smsc = Arc::new(MockSmsc::default());
    let harness = ConnectorHarness::start(Arc::clone(&smsc)).await;

    harness
        .queues
        .send("smppconn_conn1", "this is not json".to_string())
        .await
        .unwrap();
    harness
        .queues
        .send(
            "smppconn_conn1",
            r#"{"req_id":"r","connector":"conn1","pdus":[],"dlr":null}"#.to_string(),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(harness.queues.depth("smppconn_conn1"), 0);
    assert_eq!(smsc.submit_count(), 0);

    harness.stop().await;
}

#[tokio::test]
async fn connector_reassembles_inbound_udh_mo() {
    let smsc = Arc::new(MockSmsc::default());
    let harness = ConnectorHarness::start(Arc::clone(&smsc)).await;

    for body in [
        &b"\x05\x00\x03\x01\x02\x01Hello"[..],
        &b"\x05\x00\x03\x01\x02\x02 World"[..],
    ] {
        smsc.deliver(DeliverSm {
            sequence_number: 3000,
            source_addr: Some("447111111111".to_string()),
            destination_addr: "447222222222".to_string(),
            esm_class: esm_class::GSM_UDHI,
            short_message: bytes::Bytes::copy_from_slice(body),
            ..Default::default()
        })
        .await;
    }

    let queues = Arc::clone(&harness.queues);
    wait_until("MO event", move || queues.depth("mo") == 1).await;

    let events = harness.queues.receive("mo", 10).await.unwrap();
    let event: MoEvent = serde_json::from_str(&events[0].body).unwrap();

    use base64::Engine as _;
    let msg = base64::engine::general_purpose::STANDARD
        .decode(&event.msg)
        .unwrap();
    assert_eq!(msg, b"Hello World");
    assert_eq!(event.origin_connector, "conn1");

    harness.stop().await;
}

#[tokio::test]
async fn http_send_flows_through_connector_to_smsc() {
    let smsc = Arc::new(MockSmsc::default());
    let addr = MockSmsc::spawn(&smsc).await;

    let mut gateway = GatewayConfig::default();
    gateway
        .connectors
        .insert("conn1".to_string(), connector_config(addr));
    gateway.mt_routes.insert(
        0,
        RouteConfig {
            kind: "default".to_string(),
            connector: Some("conn1".to_string()),
            connectors: Vec::new(),
            filters: Vec::new(),
        },
    );
    let gateway = Arc::new(gateway);

    let queues = Arc::new(MemoryQueue::new(false));
    let kv = Arc::new(MemoryKv::new());
    let states: StateRegistry = Arc::new(RwLock::new(HashMap::new()));

    let connector = Connector::new(
        "conn1",
        gateway.connectors["conn1"].clone(),
        Arc::clone(&queues) as Arc<dyn QueueTransport>,
        Arc::clone(&kv) as Arc<dyn KvStore>,
        Arc::clone(&states),
        gateway.connector_queue("conn1"),
        gateway.dlr_queue(),
        gateway.mo_queue(),
    );
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move { connector.run(token).await });

    let states_for_wait = Arc::clone(&states);
    wait_until("connector bound", move || {
        states_for_wait.read().unwrap().get("conn1") == Some(&SessionState::BoundTrx)
    })
    .await;

    let route_table = Arc::new(RouteTable::from_config(&gateway).unwrap());
    route_table.update_connector_status(
        [("conn1".to_string(), "BOUND_TRX".to_string())]
            .into_iter()
            .collect(),
    );

    let api = ApiState {
        config: Arc::clone(&gateway),
        pipeline: MtPipeline::default(),
        interceptors: InterceptorRegistry::new(),
        route_table,
        queues: Arc::clone(&queues) as Arc<dyn QueueTransport>,
        states,
    };

    let params: HashMap<String, String> = [
        ("to", "447428555555"),
        ("from", "447428666666"),
        ("username", "test"),
        ("password", "test"),
        ("coding", "0"),
        ("content", "£ test"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();

    let (status, body) = process_send(&api, &params).await;
    assert_eq!(status, axum::http::StatusCode::OK);
    assert!(body.starts_with("Success \""));

    let smsc_for_wait = Arc::clone(&smsc);
    wait_until("submit reaches the SMSC", move || {
        smsc_for_wait.submit_count() == 1
    })
    .await;

    let submits = smsc.submits.lock().unwrap();
    assert_eq!(submits[0].short_message.as_ref(), b"\x01 test");
    assert_eq!(submits[0].destination_addr, "447428555555");
    assert_eq!(submits[0].data_coding, 0);
    drop(submits);

    shutdown.cancel();
}
