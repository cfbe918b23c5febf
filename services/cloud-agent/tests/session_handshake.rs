//! Session FSM integration tests against an in-process WebSocket cloud.
//!
//! Covers the register → hello → cam_register → cam_hello handshake, ack
//! correlation (reply and timeout, each resolving exactly once), the
//! not-READY command drop, and bye-driven reconnection.

use agent_proto::{
    Bye, ByeReason, CamEvent, CamHello, Command, CommandBody, DirectUploadUrl, DoneStatus,
    EventKind, EventObject, GetDirectUploadUrl, Hello, MediaType, UploadCategory,
};
use cloud_agent::config::DeviceConfig;
use cloud_agent::session::{
    AckResult, CommandHandler, HandlerResult, Session, SessionConfig, SessionState,
};
use futures_util::{SinkExt, StreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::Message;

type ServerWs = WebSocketStream<TcpStream>;

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct TestHandler {
    ready_count: AtomicUsize,
    closed: std::sync::Mutex<Vec<ByeReason>>,
}

impl Default for TestHandler {
    fn default() -> Self {
        TestHandler {
            ready_count: AtomicUsize::new(0),
            closed: std::sync::Mutex::new(Vec::new()),
        }
    }
}

impl CommandHandler for TestHandler {
    async fn handle_command(&self, _cmd: &Command) -> HandlerResult {
        HandlerResult::Done(DoneStatus::NotSupported)
    }

    async fn on_ready(&self) {
        self.ready_count.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_closed(&self, reason: ByeReason) {
        self.closed.lock().unwrap().push(reason);
    }
}

fn device() -> DeviceConfig {
    DeviceConfig {
        vendor: "acme".to_owned(),
        brand: "acme".to_owned(),
        model: "cam-1".to_owned(),
        serial: "sn-1".to_owned(),
        fw_version: "1.0".to_owned(),
        device_type: "ipcam".to_owned(),
        ip: "127.0.0.1".to_owned(),
        agent_version: "0.1.0".to_owned(),
        timezone: "UTC".to_owned(),
    }
}

fn session_config(url: String) -> SessionConfig {
    let mut cfg = SessionConfig::new(url, device(), "reg-token".to_owned());
    cfg.default_retry = Duration::from_millis(50);
    cfg.default_ack_timeout = Duration::from_millis(300);
    cfg
}

async fn accept(listener: &TcpListener) -> ServerWs {
    let (stream, _) = listener.accept().await.expect("accept");
    tokio_tungstenite::accept_async(stream).await.expect("ws accept")
}

/// Next command frame, transparently answering pings.
async fn expect_command(ws: &mut ServerWs) -> Command {
    loop {
        match ws.next().await.expect("frame").expect("ws error") {
            Message::Text(text) => {
                return agent_proto::parse(&text).expect("parsable command");
            }
            Message::Ping(data) => {
                let _ = ws.send(Message::Pong(data)).await;
            }
            _ => {}
        }
    }
}

async fn send_command(ws: &mut ServerWs, cmd: Command) {
    ws.send(Message::Text(cmd.to_json().unwrap().into()))
        .await
        .expect("server send");
}

/// Drive the cloud side of the handshake; returns the server msgid counter.
async fn handshake(ws: &mut ServerWs, cam_id: u64) {
    let register = expect_command(ws).await;
    assert!(matches!(register.body, CommandBody::Register(_)));

    let mut hello = Command::new(1, CommandBody::Hello(Hello {
        ca: Some("ca-pem".to_owned()),
        sid: Some("sid-1".to_owned()),
        upload_url: None,
        upload_uri: Some("https://upload.example".to_owned()),
        media_server: Some("rtmp://media.example".to_owned()),
        connid: Some("conn-1".to_owned()),
    }));
    hello.refid = Some(register.msgid);
    send_command(ws, hello).await;

    // The client answers with cam_register, then acks the hello.
    let cam_register = expect_command(ws).await;
    assert!(matches!(cam_register.body, CommandBody::CamRegister(_)));
    let hello_done = expect_command(ws).await;
    match &hello_done.body {
        CommandBody::Done(done) => assert_eq!(done.status, DoneStatus::Ok),
        other => panic!("expected done for hello, got {other:?}"),
    }

    let mut cam_hello = Command::new(
        2,
        CommandBody::CamHello(CamHello {
            media_uri: Some("rtmp://media.example".to_owned()),
            path: Some("/cam".to_owned()),
            activity: true,
        }),
    );
    cam_hello.cam_id = Some(cam_id);
    cam_hello.refid = Some(cam_register.msgid);
    send_command(ws, cam_hello).await;

    let cam_hello_done = expect_command(ws).await;
    match &cam_hello_done.body {
        CommandBody::Done(done) => assert_eq!(done.status, DoneStatus::Ok),
        other => panic!("expected done for cam_hello, got {other:?}"),
    }
}

struct Rig {
    listener: TcpListener,
    handle: cloud_agent::session::SessionHandle,
    handler: Arc<TestHandler>,
    shutdown: watch::Sender<bool>,
}

async fn start_rig() -> Rig {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let session = Session::new(session_config(url));
    let handle = session.handle.clone();
    let handler = Arc::new(TestHandler::default());
    let (shutdown, shutdown_rx) = watch::channel(false);
    tokio::spawn(session.run(handler.clone(), shutdown_rx));
    Rig {
        listener,
        handle,
        handler,
        shutdown,
    }
}

async fn wait_ready(rig: &Rig) {
    let mut state = rig.handle.state();
    tokio::time::timeout(Duration::from_secs(5), async {
        while *state.borrow() != SessionState::Ready {
            state.changed().await.unwrap();
        }
    })
    .await
    .expect("session did not reach READY");
}

fn upload_url_request() -> CommandBody {
    CommandBody::GetDirectUploadUrl(GetDirectUploadUrl {
        category: UploadCategory::Record,
        media_type: MediaType::Mp4,
        file_time: "20260217T100000.000000".to_owned(),
        duration: Some(15_000),
        duration_us: Some(15_000_000),
        size: 1024,
        stream_id: Some("Main".to_owned()),
        memorycard_sync_ticket: None,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn handshake_reaches_ready_and_captures_identity() {
    let rig = start_rig().await;
    let mut ws = accept(&rig.listener).await;
    handshake(&mut ws, 77).await;

    wait_ready(&rig).await;
    assert_eq!(rig.handler.ready_count.load(Ordering::SeqCst), 1);

    let info = rig.handle.info();
    assert_eq!(info.cam_id, Some(77));
    assert_eq!(info.sid.as_deref(), Some("sid-1"));
    assert_eq!(info.upload_url.as_deref(), Some("https://upload.example"));

    let _ = rig.shutdown.send(true);
}

#[tokio::test]
async fn ack_resolves_with_matching_reply_and_sends_done() {
    let rig = start_rig().await;
    let mut ws = accept(&rig.listener).await;
    handshake(&mut ws, 77).await;
    wait_ready(&rig).await;

    let handle = rig.handle.clone();
    let ack_task = tokio::spawn(async move {
        handle
            .send_with_ack(upload_url_request(), Some(Duration::from_secs(2)))
            .await
    });

    let request = expect_command(&mut ws).await;
    assert!(matches!(request.body, CommandBody::GetDirectUploadUrl(_)));

    let mut reply = Command::new(
        10,
        CommandBody::DirectUploadUrl(DirectUploadUrl {
            status: "OK".to_owned(),
            url: Some("https://storage.example/put/1".to_owned()),
            headers: BTreeMap::new(),
            category: Some(UploadCategory::Record),
            event_id: None,
            extra: Vec::new(),
        }),
    );
    reply.refid = Some(request.msgid);
    send_command(&mut ws, reply).await;

    match ack_task.await.unwrap() {
        AckResult::Reply(cmd) => {
            assert_eq!(cmd.refid, Some(request.msgid));
            assert!(matches!(cmd.body, CommandBody::DirectUploadUrl(_)));
        }
        AckResult::TimedOut => panic!("ack timed out unexpectedly"),
    }

    // The resolved direct_upload_url is acknowledged with done(OK).
    let done = expect_command(&mut ws).await;
    match &done.body {
        CommandBody::Done(done) => assert_eq!(done.status, DoneStatus::Ok),
        other => panic!("expected done, got {other:?}"),
    }

    let _ = rig.shutdown.send(true);
}

#[tokio::test]
async fn unanswered_ack_times_out_exactly_once() {
    let rig = start_rig().await;
    let mut ws = accept(&rig.listener).await;
    handshake(&mut ws, 77).await;
    wait_ready(&rig).await;

    let started = std::time::Instant::now();
    let result = rig
        .handle
        .send_with_ack(upload_url_request(), Some(Duration::from_millis(200)))
        .await;
    assert!(result.timed_out());
    assert!(started.elapsed() >= Duration::from_millis(150));

    // The request did reach the wire.
    let request = expect_command(&mut ws).await;
    assert!(matches!(request.body, CommandBody::GetDirectUploadUrl(_)));

    let _ = rig.shutdown.send(true);
}

#[tokio::test]
async fn commands_before_ready_are_dropped() {
    let rig = start_rig().await;
    let mut ws = accept(&rig.listener).await;

    let register = expect_command(&mut ws).await;
    assert!(matches!(register.body, CommandBody::Register(_)));

    // Session is not READY: the event must never hit the wire.
    rig.handle.send(CommandBody::CamEvent(CamEvent {
        event: EventObject::new(EventKind::Motion, None, 1.0),
    }));

    let nothing = tokio::time::timeout(Duration::from_millis(300), expect_command(&mut ws)).await;
    assert!(nothing.is_err(), "command leaked before READY");

    let _ = rig.shutdown.send(true);
}

#[tokio::test]
async fn bye_triggers_reconnect_with_previous_sid() {
    let rig = start_rig().await;

    let mut ws = accept(&rig.listener).await;
    handshake(&mut ws, 77).await;
    wait_ready(&rig).await;

    send_command(
        &mut ws,
        Command::new(
            5,
            CommandBody::Bye(Bye {
                reason: Some(ByeReason::ConnClose),
                retry: Some(50),
            }),
        ),
    )
    .await;
    drop(ws);

    // The session reconnects and re-registers with the previous sid.
    let mut ws2 = accept(&rig.listener).await;
    let register = tokio::time::timeout(Duration::from_secs(5), expect_command(&mut ws2))
        .await
        .expect("no re-register after bye");
    match &register.body {
        CommandBody::Register(register) => {
            assert_eq!(register.prev_sid.as_deref(), Some("sid-1"));
        }
        other => panic!("expected register, got {other:?}"),
    }

    assert!(
        rig.handler
            .closed
            .lock()
            .unwrap()
            .contains(&ByeReason::ConnClose)
    );

    let _ = rig.shutdown.send(true);
}

#[tokio::test]
async fn auth_failure_bye_stops_reconnecting() {
    let rig = start_rig().await;

    let mut ws = accept(&rig.listener).await;
    let _register = expect_command(&mut ws).await;
    send_command(
        &mut ws,
        Command::new(
            1,
            CommandBody::Bye(Bye {
                reason: Some(ByeReason::AuthFailure),
                retry: None,
            }),
        ),
    )
    .await;
    drop(ws);

    let mut state = rig.handle.state();
    tokio::time::timeout(Duration::from_secs(5), async {
        while *state.borrow() != SessionState::Closed {
            state.changed().await.unwrap();
        }
    })
    .await
    .expect("session did not close after auth failure");

    // No further connection attempt lands on the listener.
    let no_reconnect =
        tokio::time::timeout(Duration::from_millis(300), rig.listener.accept()).await;
    assert!(no_reconnect.is_err(), "session reconnected after auth failure");
}
