//! Cloud control-plane session.
//!
//! Owns the WebSocket to the cloud and drives the handshake FSM:
//!
//! 1. Connect to the camera control endpoint (ws:// or wss://)
//! 2. Send `register`; receive `hello` and capture sid/ca/upload endpoints
//! 3. Send `cam_register`; receive `cam_hello` and capture cam_id, now READY
//! 4. Dispatch inbound commands; correlate replies to `send_with_ack` calls
//!    by `refid`; reconnect per the `bye` policy on teardown
//!
//! READY is the only state in which component commands go out; anything
//! queued earlier is dropped with a warning.  Every `send_with_ack` resolves
//! exactly once: with the matching reply, or as timed out.

use crate::config::DeviceConfig;
use agent_proto::{
    Bye, ByeReason, CamRegister, Command, CommandBody, Configure, DoneStatus, Hello, MsgIdGen,
    Register,
};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, error, info, warn};

// ---------------------------------------------------------------------------
// Config & shared state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Control WebSocket URL, e.g. `wss://cam.example.com:8883/ctl`.
    pub url: String,
    pub device: DeviceConfig,
    /// Registration token from the access token.
    pub reg_token: String,
    pub connect_timeout: Duration,
    /// Idle time before a keep-alive ping goes out.
    pub idle_ping: Duration,
    /// Idle time without any traffic after which the link is declared dead.
    pub pong_timeout: Duration,
    /// Reconnect delay when the cloud did not suggest one.
    pub default_retry: Duration,
    pub default_ack_timeout: Duration,
}

impl SessionConfig {
    pub fn new(url: String, device: DeviceConfig, reg_token: String) -> Self {
        SessionConfig {
            url,
            device,
            reg_token,
            connect_timeout: Duration::from_secs(20),
            idle_ping: Duration::from_secs(10),
            pong_timeout: Duration::from_secs(30),
            default_retry: Duration::from_secs(5),
            default_ack_timeout: Duration::from_secs(10),
        }
    }
}

/// Session-scoped values captured from the handshake and `configure`.
#[derive(Debug, Default, Clone)]
pub struct SessionInfo {
    pub sid: Option<String>,
    pub ca: Option<String>,
    pub upload_url: Option<String>,
    pub media_server: Option<String>,
    pub conn_id: Option<String>,
    pub cam_id: Option<u64>,
    pub cam_path: Option<String>,
    pub media_uri: Option<String>,
    pub timezone: Option<String>,
    pub pwd: Option<String>,
    pub uuid: Option<String>,
    /// Alternate server pushed via `configure`; honoured on RECONNECT bye.
    pub reconnect_server: Option<String>,
    pub activity: bool,
}

pub type SharedInfo = Arc<Mutex<SessionInfo>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Registered,
    HelloReceived,
    Ready,
    Closed,
}

// ---------------------------------------------------------------------------
// Handler interface
// ---------------------------------------------------------------------------

/// Outcome of dispatching one inbound command to the upper layer.
#[derive(Debug)]
pub enum HandlerResult {
    Reply(CommandBody),
    Done(DoneStatus),
    NoReply,
}

/// Upper-layer hooks; implemented by the agent manager.
pub trait CommandHandler: Send + Sync + 'static {
    fn handle_command(&self, cmd: &Command) -> impl Future<Output = HandlerResult> + Send;

    /// Called once per connection after `cam_hello` (READY).
    fn on_ready(&self) -> impl Future<Output = ()> + Send;

    fn on_closed(&self, reason: ByeReason) -> impl Future<Output = ()> + Send;
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum AckResult {
    Reply(Command),
    TimedOut,
}

impl AckResult {
    pub fn timed_out(&self) -> bool {
        matches!(self, AckResult::TimedOut)
    }
}

enum Outbound {
    Plain(Command),
    WithAck {
        cmd: Command,
        timeout: Duration,
        ack: oneshot::Sender<AckResult>,
    },
}

/// Cloneable handle used by every component to talk to the cloud.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<Outbound>,
    state: watch::Receiver<SessionState>,
    msgid: Arc<MsgIdGen>,
    info: SharedInfo,
    default_ack_timeout: Duration,
}

impl SessionHandle {
    pub fn is_ready(&self) -> bool {
        *self.state.borrow() == SessionState::Ready
    }

    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn info(&self) -> SessionInfo {
        self.info.lock().expect("session info poisoned").clone()
    }

    pub fn cam_id(&self) -> Option<u64> {
        self.info.lock().expect("session info poisoned").cam_id
    }

    /// Queue a command.  Returns its msgid; the session drops it with a
    /// warning when the link is not READY.
    pub fn send(&self, body: CommandBody) -> u64 {
        let mut cmd = Command::new(self.msgid.next(), body);
        cmd.cam_id = self.cam_id();
        let msgid = cmd.msgid;
        let _ = self.tx.send(Outbound::Plain(cmd));
        msgid
    }

    /// Queue a command and wait for its correlated reply or a timeout.
    pub async fn send_with_ack(&self, body: CommandBody, timeout: Option<Duration>) -> AckResult {
        let mut cmd = Command::new(self.msgid.next(), body);
        cmd.cam_id = self.cam_id();
        let (ack_tx, ack_rx) = oneshot::channel();
        let queued = self
            .tx
            .send(Outbound::WithAck {
                cmd,
                timeout: timeout.unwrap_or(self.default_ack_timeout),
                ack: ack_tx,
            })
            .is_ok();
        if !queued {
            return AckResult::TimedOut;
        }
        ack_rx.await.unwrap_or(AckResult::TimedOut)
    }
}

// ---------------------------------------------------------------------------
// Session runner
// ---------------------------------------------------------------------------

pub struct Session {
    pub handle: SessionHandle,
    cfg: SessionConfig,
    out_rx: mpsc::UnboundedReceiver<Outbound>,
    state_tx: watch::Sender<SessionState>,
    info: SharedInfo,
    msgid: Arc<MsgIdGen>,
}

impl Session {
    pub fn new(cfg: SessionConfig) -> Self {
        let (tx, out_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let info: SharedInfo = Arc::new(Mutex::new(SessionInfo::default()));
        let msgid = Arc::new(MsgIdGen::new());
        let handle = SessionHandle {
            tx,
            state: state_rx,
            msgid: msgid.clone(),
            info: info.clone(),
            default_ack_timeout: cfg.default_ack_timeout,
        };
        Session {
            handle,
            cfg,
            out_rx,
            state_tx,
            info,
            msgid,
        }
    }

    /// Connect-drive-reconnect loop; returns when the cloud refuses the
    /// registration (auth failure) or `shutdown` flips.
    pub async fn run<H: CommandHandler>(
        mut self,
        handler: Arc<H>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let _ = self.state_tx.send(SessionState::Connecting);
            let url = self.connect_url();
            info!(url = %url, "connecting to cloud");

            let close = match tokio::time::timeout(
                self.cfg.connect_timeout,
                tokio_tungstenite::connect_async(url.as_str()),
            )
            .await
            {
                Ok(Ok((ws, _response))) => {
                    let mut conn = Connection {
                        cfg: &self.cfg,
                        info: &self.info,
                        msgid: &self.msgid,
                        state_tx: &self.state_tx,
                        out_rx: &mut self.out_rx,
                        pending: HashMap::new(),
                        bye: None,
                    };
                    conn.drive(ws, handler.as_ref(), &mut shutdown).await
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "connect failed");
                    CloseInfo::conn_close()
                }
                Err(_) => {
                    warn!("connect timed out");
                    CloseInfo::conn_close()
                }
            };

            let _ = self.state_tx.send(SessionState::Disconnected);
            handler.on_closed(close.reason).await;

            if *shutdown.borrow() {
                break;
            }
            if close.reason == ByeReason::AuthFailure {
                error!("cloud rejected registration, not reconnecting");
                break;
            }
            // Only a RECONNECT bye keeps the pushed alternate server; any
            // other teardown goes back to the main registrar.
            if close.reason != ByeReason::Reconnect {
                self.info.lock().expect("session info poisoned").reconnect_server = None;
            }

            let retry = close.retry.unwrap_or(self.cfg.default_retry);
            info!(retry_ms = retry.as_millis() as u64, "reconnecting after delay");
            tokio::select! {
                () = tokio::time::sleep(retry) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        let _ = self.state_tx.send(SessionState::Closed);
    }

    fn connect_url(&self) -> String {
        let info = self.info.lock().expect("session info poisoned");
        match &info.reconnect_server {
            Some(server) if server.contains("://") => server.clone(),
            Some(server) => {
                let scheme = self.cfg.url.split("://").next().unwrap_or("wss");
                format!("{scheme}://{server}")
            }
            None => self.cfg.url.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// One connection
// ---------------------------------------------------------------------------

struct PendingAck {
    ack: oneshot::Sender<AckResult>,
    deadline: tokio::time::Instant,
}

struct CloseInfo {
    reason: ByeReason,
    retry: Option<Duration>,
}

impl CloseInfo {
    fn conn_close() -> Self {
        CloseInfo {
            reason: ByeReason::ConnClose,
            retry: None,
        }
    }
}

struct Connection<'a> {
    cfg: &'a SessionConfig,
    info: &'a SharedInfo,
    msgid: &'a MsgIdGen,
    state_tx: &'a watch::Sender<SessionState>,
    out_rx: &'a mut mpsc::UnboundedReceiver<Outbound>,
    pending: HashMap<u64, PendingAck>,
    bye: Option<CloseInfo>,
}

impl Connection<'_> {
    async fn drive<W, H>(
        &mut self,
        mut ws: W,
        handler: &H,
        shutdown: &mut watch::Receiver<bool>,
    ) -> CloseInfo
    where
        W: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
            + Unpin,
        H: CommandHandler,
    {
        if self.send_command(&mut ws, self.register_command()).await.is_err() {
            return self.finish(CloseInfo::conn_close());
        }
        let _ = self.state_tx.send(SessionState::Registered);

        let mut last_rx = tokio::time::Instant::now();
        let mut ping_outstanding = false;

        let close = loop {
            let next_ack = self.pending.values().map(|p| p.deadline).min();
            let ping_at = last_rx + self.cfg.idle_ping;
            let dead_at = last_rx + self.cfg.pong_timeout;

            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    // A dropped shutdown sender counts as a shutdown request.
                    if changed.is_err() || *shutdown.borrow() {
                        let bye = Command::new(
                            self.msgid.next(),
                            CommandBody::Bye(Bye { reason: Some(ByeReason::ConnClose), retry: None }),
                        );
                        let _ = self.send_command(&mut ws, bye).await;
                        let _ = ws.close().await;
                        break CloseInfo::conn_close();
                    }
                }
                out = self.out_rx.recv() => {
                    match out {
                        Some(Outbound::Plain(cmd)) => {
                            if self.sendable(&cmd) {
                                if self.send_command(&mut ws, cmd).await.is_err() {
                                    break CloseInfo::conn_close();
                                }
                            }
                        }
                        Some(Outbound::WithAck { cmd, timeout, ack }) => {
                            if !self.sendable(&cmd) {
                                let _ = ack.send(AckResult::TimedOut);
                            } else {
                                let msgid = cmd.msgid;
                                match self.send_command(&mut ws, cmd).await {
                                    Ok(()) => {
                                        self.pending.insert(msgid, PendingAck {
                                            ack,
                                            deadline: tokio::time::Instant::now() + timeout,
                                        });
                                    }
                                    Err(()) => {
                                        let _ = ack.send(AckResult::TimedOut);
                                        break CloseInfo::conn_close();
                                    }
                                }
                            }
                        }
                        None => break CloseInfo::conn_close(),
                    }
                }
                frame = ws.next() => {
                    match frame {
                        None => break self.close_info(),
                        Some(Err(e)) => {
                            warn!(error = %e, "websocket error");
                            break self.close_info();
                        }
                        Some(Ok(Message::Text(text))) => {
                            last_rx = tokio::time::Instant::now();
                            ping_outstanding = false;
                            if self.on_frame(&mut ws, &text, handler).await.is_err() {
                                break self.close_info();
                            }
                            if self.bye.is_some() {
                                let _ = ws.close().await;
                                break self.close_info();
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            last_rx = tokio::time::Instant::now();
                            let _ = ws.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) => break self.close_info(),
                        Some(Ok(_)) => {
                            last_rx = tokio::time::Instant::now();
                            ping_outstanding = false;
                        }
                    }
                }
                () = sleep_until_opt(next_ack), if next_ack.is_some() => {
                    self.expire_acks();
                }
                () = tokio::time::sleep_until(dead_at) => {
                    warn!("no traffic within pong timeout, dropping link");
                    break self.close_info();
                }
                () = tokio::time::sleep_until(ping_at), if !ping_outstanding => {
                    debug!("idle, sending keep-alive ping");
                    if ws.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break self.close_info();
                    }
                    ping_outstanding = true;
                }
            }
        };

        self.finish(close)
    }

    /// Resolve all leftovers and reset per-connection state.
    fn finish(&mut self, close: CloseInfo) -> CloseInfo {
        for (_, pending) in self.pending.drain() {
            let _ = pending.ack.send(AckResult::TimedOut);
        }
        // Reject queued ack-requests instead of letting them dangle until
        // the next connection.
        while let Ok(out) = self.out_rx.try_recv() {
            match out {
                Outbound::Plain(cmd) => {
                    warn!(cmd = cmd.body.name(), "dropping command queued while disconnected");
                }
                Outbound::WithAck { ack, .. } => {
                    let _ = ack.send(AckResult::TimedOut);
                }
            }
        }
        close
    }

    fn close_info(&mut self) -> CloseInfo {
        self.bye.take().unwrap_or_else(CloseInfo::conn_close)
    }

    /// Component traffic is only valid in READY; handshake commands and
    /// replies pass through in any state.
    fn sendable(&self, cmd: &Command) -> bool {
        if *self.state_tx.borrow() == SessionState::Ready {
            return true;
        }
        if matches!(
            cmd.body,
            CommandBody::Register(_) | CommandBody::CamRegister(_) | CommandBody::Done(_) | CommandBody::Bye(_)
        ) {
            return true;
        }
        warn!(cmd = cmd.body.name(), "session not ready, dropping command");
        false
    }

    fn expire_acks(&mut self) {
        let now = tokio::time::Instant::now();
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for msgid in expired {
            if let Some(pending) = self.pending.remove(&msgid) {
                warn!(msgid, "command ack timed out");
                let _ = pending.ack.send(AckResult::TimedOut);
            }
        }
    }

    async fn on_frame<W, H>(&mut self, ws: &mut W, text: &str, handler: &H) -> Result<(), ()>
    where
        W: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
        H: CommandHandler,
    {
        debug!(frame = text, "C <= S");
        let Some(cmd) = agent_proto::parse(text) else {
            return Ok(());
        };

        // cam_id consistency: a mismatching frame is answered, not obeyed.
        let known_cam_id = self.info.lock().expect("session info poisoned").cam_id;
        if let (Some(frame_cam), Some(known)) = (cmd.cam_id, known_cam_id)
            && frame_cam != known
            && !matches!(cmd.body, CommandBody::CamHello(_))
        {
            error!(frame_cam, known, "cam_id mismatch");
            let done = Command::done(&cmd, self.msgid.next(), DoneStatus::CmError);
            return self.send_command(ws, done).await;
        }

        // Reply correlation: a frame whose refid matches an outstanding
        // send_with_ack resolves it and is not dispatched further.
        if let Some(refid) = cmd.refid
            && let Some(pending) = self.pending.remove(&refid)
        {
            let needs_done = matches!(cmd.body, CommandBody::DirectUploadUrl(_));
            let done = needs_done.then(|| Command::done(&cmd, self.msgid.next(), DoneStatus::Ok));
            let _ = pending.ack.send(AckResult::Reply(cmd));
            if let Some(done) = done {
                return self.send_command(ws, done).await;
            }
            return Ok(());
        }

        let reply = match &cmd.body {
            CommandBody::Hello(hello) => {
                let hello = hello.clone();
                self.on_hello(ws, &cmd, hello).await?
            }
            CommandBody::CamHello(cam_hello) => {
                {
                    let mut info = self.info.lock().expect("session info poisoned");
                    info.cam_id = cmd.cam_id;
                    if cam_hello.media_uri.is_some() {
                        info.media_uri = cam_hello.media_uri.clone();
                    }
                    if cam_hello.path.is_some() {
                        info.cam_path = cam_hello.path.clone();
                    }
                    info.activity = cam_hello.activity;
                }
                let _ = self.state_tx.send(SessionState::Ready);
                info!(cam_id = cmd.cam_id, "session ready");
                handler.on_ready().await;
                Some(Command::done(&cmd, self.msgid.next(), DoneStatus::Ok))
            }
            CommandBody::Configure(configure) => {
                let configure: Configure = configure.clone();
                {
                    let mut info = self.info.lock().expect("session info poisoned");
                    if configure.pwd.is_some() {
                        info.pwd = configure.pwd.clone();
                    }
                    if configure.uuid.is_some() {
                        info.uuid = configure.uuid.clone();
                    }
                    if configure.connid.is_some() {
                        info.conn_id = configure.connid.clone();
                    }
                    if configure.tz.is_some() {
                        info.timezone = configure.tz.clone();
                    }
                    if configure.server.is_some() {
                        info.reconnect_server = configure.server.clone();
                    }
                }
                Some(Command::done(&cmd, self.msgid.next(), DoneStatus::Ok))
            }
            CommandBody::Bye(bye) => {
                info!(reason = ?bye.reason, retry = bye.retry, "bye from cloud");
                self.bye = Some(CloseInfo {
                    reason: bye.reason.unwrap_or(ByeReason::Invalid),
                    retry: bye.retry.map(Duration::from_millis),
                });
                // No reply to bye.
                None
            }
            CommandBody::ReportProblem(report) => {
                error!(reason = report.reason.as_deref().unwrap_or(""), "cloud reported a problem");
                None
            }
            _ => match handler.handle_command(&cmd).await {
                HandlerResult::Reply(body) => Some(Command::reply(&cmd, self.msgid.next(), body)),
                HandlerResult::Done(status) => Some(Command::done(&cmd, self.msgid.next(), status)),
                HandlerResult::NoReply => None,
            },
        };

        if let Some(reply) = reply {
            self.send_command(ws, reply).await?;
        }
        Ok(())
    }

    async fn on_hello<W>(
        &mut self,
        ws: &mut W,
        cmd: &Command,
        hello: Hello,
    ) -> Result<Option<Command>, ()>
    where
        W: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    {
        {
            let mut info = self.info.lock().expect("session info poisoned");
            if hello.ca.is_some() {
                info.ca = hello.ca;
            }
            if hello.sid.is_some() {
                info.sid = hello.sid;
            }
            // Legacy field first, the newer one wins when both are present.
            if hello.upload_url.is_some() {
                info.upload_url = hello.upload_url;
            }
            if hello.upload_uri.is_some() {
                info.upload_url = hello.upload_uri;
            }
            if hello.media_server.is_some() {
                info.media_server = hello.media_server;
            }
            if hello.connid.is_some() {
                info.conn_id = hello.connid;
            }
        }
        let _ = self.state_tx.send(SessionState::HelloReceived);

        let cam_register = Command::new(self.msgid.next(), CommandBody::CamRegister(self.cam_register_command()));
        self.send_command(ws, cam_register).await?;

        Ok(Some(Command::done(cmd, self.msgid.next(), DoneStatus::Ok)))
    }

    fn register_command(&self) -> Command {
        let info = self.info.lock().expect("session info poisoned");
        let register = Register {
            ver: self.cfg.device.agent_version.clone(),
            tz: info
                .timezone
                .clone()
                .unwrap_or_else(|| self.cfg.device.timezone.clone()),
            vendor: self.cfg.device.vendor.clone(),
            pwd: info.pwd.clone(),
            prev_sid: info.sid.clone(),
            reg_token: Some(self.cfg.reg_token.clone()),
            media_protocols: vec![if self.cfg.url.starts_with("wss") {
                "rtmps".to_owned()
            } else {
                "rtmp".to_owned()
            }],
        };
        Command::new(self.msgid.next(), CommandBody::Register(register))
    }

    fn cam_register_command(&self) -> CamRegister {
        let info = self.info.lock().expect("session info poisoned");
        CamRegister {
            ip: self.cfg.device.ip.clone(),
            uuid: info.uuid.clone(),
            brand: self.cfg.device.brand.clone(),
            model: self.cfg.device.model.clone(),
            sn: self.cfg.device.serial.clone(),
            version: self.cfg.device.fw_version.clone(),
            device_type: self.cfg.device.device_type.clone(),
        }
    }

    async fn send_command<W>(&self, ws: &mut W, cmd: Command) -> Result<(), ()>
    where
        W: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    {
        let json = match cmd.to_json() {
            Ok(json) => json,
            Err(e) => {
                error!(error = %e, cmd = cmd.body.name(), "command serialization failed");
                return Ok(());
            }
        };
        debug!(frame = %json, "C => S");
        ws.send(Message::Text(json.into())).await.map_err(|e| {
            warn!(error = %e, "websocket send failed");
        })
    }
}

async fn sleep_until_opt(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}
