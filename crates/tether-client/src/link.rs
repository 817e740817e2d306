//! Outbound connection from a controller client to the bridge server.
//!
//! Status machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Reconnecting -> Connecting -> ...
//!                      \-> Error -> Reconnecting
//! ```
//!
//! Any close that was not requested through [`ConnectionLink::disconnect`]
//! schedules exactly one reconnect after a fixed delay. Inbound frames and
//! status changes are published on broadcast channels; dropping a receiver
//! unsubscribes it. A broadcast receiver that falls behind loses frames, so
//! the one consumer that must see every request claims a bounded mpsc
//! stream with [`ConnectionLink::claim_frames`] instead.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tether_core::protocol::{ControlMessage, ProtocolError, ServerFrame};
use tether_settings::LinkSettings;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::LinkError;
use crate::heartbeat::{HeartbeatFailure, HeartbeatMonitor};
use crate::port::PortProvider;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A parsed inbound frame, or the reason it could not be parsed.
pub type InboundFrame = Result<ServerFrame, ProtocolError>;

/// Client-side connection state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Idle, and not trying to connect.
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Session established.
    Connected,
    /// Waiting out the backoff before the next attempt.
    Reconnecting,
    /// The last attempt failed.
    Error,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Link timing and addressing.
#[derive(Clone, Debug)]
pub struct LinkConfig {
    /// Server host.
    pub host: String,
    /// Endpoint path.
    pub path: String,
    /// Fixed delay before each reconnect attempt.
    pub reconnect_interval: Duration,
    /// Interval between pings.
    pub heartbeat_interval: Duration,
    /// How long a ping may go unanswered.
    pub heartbeat_timeout: Duration,
    /// Bound on the transport handshake.
    pub connection_timeout: Duration,
    /// Capacity of the outbound frame channel.
    pub outbound_buffer: usize,
}

impl LinkConfig {
    /// `ws://host:port/path`.
    pub fn url(&self, port: u16) -> String {
        format!("ws://{}:{port}{}", self.host, self.path)
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self::from(&LinkSettings::default())
    }
}

impl From<&LinkSettings> for LinkConfig {
    fn from(settings: &LinkSettings) -> Self {
        Self {
            host: settings.host.clone(),
            path: settings.path.clone(),
            reconnect_interval: Duration::from_millis(settings.reconnect_interval_ms),
            heartbeat_interval: Duration::from_millis(settings.heartbeat_interval_ms),
            heartbeat_timeout: Duration::from_millis(settings.heartbeat_timeout_ms),
            connection_timeout: Duration::from_millis(settings.connection_timeout_ms),
            outbound_buffer: settings.outbound_buffer,
        }
    }
}

/// How a session ended.
#[derive(Debug)]
enum SessionEnd {
    Cancelled,
    Closed,
    Transport(String),
    Heartbeat(HeartbeatFailure),
}

/// One client's connection to the bridge server.
pub struct ConnectionLink {
    config: LinkConfig,
    port: Arc<dyn PortProvider>,
    status: Mutex<ConnectionStatus>,
    status_tx: broadcast::Sender<ConnectionStatus>,
    message_tx: broadcast::Sender<InboundFrame>,
    /// Lossless inbound stream; the session reader waits when it is full.
    frame_sink: Mutex<Option<mpsc::Sender<InboundFrame>>>,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    session_cancel: Mutex<Option<CancellationToken>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    /// Bumped per session so a superseded session's exit is ignored.
    generation: AtomicU64,
    /// Set by `disconnect()`; suppresses reconnects.
    stopped: AtomicBool,
}

impl ConnectionLink {
    /// Create a link in the `Disconnected` state.
    pub fn new(config: LinkConfig, port: Arc<dyn PortProvider>) -> Arc<Self> {
        let (status_tx, _) = broadcast::channel(64);
        let (message_tx, _) = broadcast::channel(1024);
        Arc::new(Self {
            config,
            port,
            status: Mutex::new(ConnectionStatus::Disconnected),
            status_tx,
            message_tx,
            frame_sink: Mutex::new(None),
            outbound: Mutex::new(None),
            session_cancel: Mutex::new(None),
            reconnect_task: Mutex::new(None),
            generation: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
        })
    }

    /// Current status.
    pub fn status(&self) -> ConnectionStatus {
        *self.status.lock()
    }

    /// Whether the link is `Connected`.
    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Subscribe to status changes. Only actual changes are published.
    pub fn subscribe_status(&self) -> broadcast::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    /// Subscribe to inbound frames. Pong frames are consumed by the heartbeat.
    pub fn subscribe_messages(&self) -> broadcast::Receiver<InboundFrame> {
        self.message_tx.subscribe()
    }

    /// Take the lossless inbound stream, replacing any earlier claim.
    ///
    /// Every frame that would go to [`subscribe_messages`](Self::subscribe_messages)
    /// is also delivered here. When `capacity` frames are waiting, the
    /// session stops reading the socket until the receiver catches up.
    pub fn claim_frames(&self, capacity: usize) -> mpsc::Receiver<InboundFrame> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        *self.frame_sink.lock() = Some(tx);
        rx
    }

    /// Make one connection attempt, bounded by the connection timeout.
    ///
    /// On failure the link moves to `Error` and schedules a reconnect.
    /// Clears an earlier [`disconnect`](Self::disconnect).
    pub async fn connect(self: &Arc<Self>) -> Result<(), LinkError> {
        self.stopped.store(false, Ordering::Release);
        self.attempt().await
    }

    #[instrument(skip_all)]
    async fn attempt(self: &Arc<Self>) -> Result<(), LinkError> {
        if self.is_connected() {
            return Ok(());
        }
        self.set_status(ConnectionStatus::Connecting);

        let port = match self.port.port().await {
            Ok(port) => port,
            Err(err) => {
                self.on_connect_failed(&err);
                return Err(err);
            }
        };
        let url = self.config.url(port);
        debug!(%url, "connecting");

        let attempt =
            tokio::time::timeout(self.config.connection_timeout, connect_async(url.as_str())).await;
        let ws = match attempt {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(err)) => {
                let err = LinkError::from(err);
                self.on_connect_failed(&err);
                return Err(err);
            }
            Err(_) => {
                let err = LinkError::ConnectTimeout(duration_ms(self.config.connection_timeout));
                self.on_connect_failed(&err);
                return Err(err);
            }
        };

        if self.stopped.load(Ordering::Acquire) {
            debug!("disconnected during handshake, dropping connection");
            return Err(LinkError::NotConnected);
        }
        self.start_session(ws);
        info!(%url, "connected");
        Ok(())
    }

    /// Queue a text frame. Fails fast unless `Connected`.
    pub fn send(&self, text: String) -> Result<(), LinkError> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        let tx = self.outbound.lock().clone().ok_or(LinkError::NotConnected)?;
        tx.try_send(text).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => {
                LinkError::Transport("outbound buffer full".into())
            }
            mpsc::error::TrySendError::Closed(_) => LinkError::ChannelClosed,
        })
    }

    /// Serialize and queue a frame.
    pub fn send_json<T: Serialize>(&self, frame: &T) -> Result<(), LinkError> {
        let text = serde_json::to_string(frame)?;
        self.send(text)
    }

    /// Close the link and stay closed.
    pub fn disconnect(&self) {
        self.stopped.store(true, Ordering::Release);
        if let Some(task) = self.reconnect_task.lock().take() {
            task.abort();
        }
        *self.outbound.lock() = None;
        if let Some(cancel) = self.session_cancel.lock().take() {
            cancel.cancel();
        }
        self.set_status(ConnectionStatus::Disconnected);
    }

    fn set_status(&self, next: ConnectionStatus) {
        let changed = {
            let mut status = self.status.lock();
            if *status == next {
                false
            } else {
                *status = next;
                true
            }
        };
        if changed {
            debug!(status = %next, "link status changed");
            let _ = self.status_tx.send(next);
        }
    }

    fn on_connect_failed(self: &Arc<Self>, err: &LinkError) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        warn!(error = %err, "connection attempt failed");
        self.set_status(ConnectionStatus::Error);
        self.schedule_reconnect();
    }

    /// Schedule one reconnect after the fixed delay. A pending one is reused.
    fn schedule_reconnect(self: &Arc<Self>) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        let mut slot = self.reconnect_task.lock();
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            debug!("reconnect already scheduled");
            return;
        }
        self.set_status(ConnectionStatus::Reconnecting);
        let delay = self.config.reconnect_interval;
        info!(delay_ms = duration_ms(delay), "scheduling reconnect");

        let link = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Free the slot first so a failed attempt can schedule the next one.
            let _ = link.reconnect_task.lock().take();
            if link.stopped.load(Ordering::Acquire) {
                return;
            }
            let _ = link.attempt().await;
        }));
    }

    fn start_session(self: &Arc<Self>, ws: WsStream) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let (tx, rx) = mpsc::channel(self.config.outbound_buffer);
        let cancel = CancellationToken::new();

        *self.outbound.lock() = Some(tx);
        if let Some(previous) = self.session_cancel.lock().replace(cancel.clone()) {
            previous.cancel();
        }
        self.set_status(ConnectionStatus::Connected);

        let link = Arc::clone(self);
        let _ = tokio::spawn(async move {
            let end = link.run_session(ws, rx, cancel).await;
            link.on_session_end(generation, end);
        });
    }

    async fn run_session(
        &self,
        ws: WsStream,
        mut outbound: mpsc::Receiver<String>,
        cancel: CancellationToken,
    ) -> SessionEnd {
        let (mut sink, mut stream) = ws.split();
        let interval = self.config.heartbeat_interval;
        let mut monitor =
            HeartbeatMonitor::new(interval, self.config.heartbeat_timeout, Instant::now());
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        let ping = ControlMessage::Ping.to_json().unwrap_or_default();

        loop {
            let ping_deadline = monitor.ping_deadline();
            tokio::select! {
                () = cancel.cancelled() => {
                    let _ = sink.close().await;
                    return SessionEnd::Cancelled;
                }
                frame = outbound.recv() => {
                    let Some(text) = frame else {
                        return SessionEnd::Cancelled;
                    };
                    if let Err(err) = sink.send(Message::text(text)).await {
                        return SessionEnd::Transport(err.to_string());
                    }
                }
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        self.handle_inbound(text.as_str(), &mut monitor, &cancel).await;
                    }
                    Some(Ok(Message::Close(_))) | None => return SessionEnd::Closed,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return SessionEnd::Transport(err.to_string()),
                },
                _ = ticker.tick() => {
                    let now = Instant::now();
                    if let Err(failure) = monitor.check(now) {
                        return SessionEnd::Heartbeat(failure);
                    }
                    if let Err(err) = sink.send(Message::text(ping.clone())).await {
                        return SessionEnd::Transport(err.to_string());
                    }
                    monitor.on_ping_sent(now);
                }
                () = sleep_until(ping_deadline) => {
                    if let Err(failure) = monitor.check(Instant::now()) {
                        return SessionEnd::Heartbeat(failure);
                    }
                }
            }
        }
    }

    async fn handle_inbound(
        &self,
        text: &str,
        monitor: &mut HeartbeatMonitor,
        cancel: &CancellationToken,
    ) {
        let frame = match ServerFrame::parse(text) {
            Ok(ServerFrame::Control(ControlMessage::Pong)) => {
                monitor.on_pong(Instant::now());
                return;
            }
            Ok(frame) => Ok(frame),
            Err(err) => {
                warn!(error = %err, "malformed frame from server");
                Err(err)
            }
        };
        let _ = self.message_tx.send(frame.clone());

        let sink = self.frame_sink.lock().clone();
        if let Some(sink) = sink {
            let delivered = tokio::select! {
                sent = sink.send(frame) => sent.is_ok(),
                () = cancel.cancelled() => return,
            };
            if !delivered {
                debug!("frame stream receiver dropped");
                let mut slot = self.frame_sink.lock();
                if slot.as_ref().is_some_and(|tx| tx.same_channel(&sink)) {
                    *slot = None;
                }
            }
        }
    }

    fn on_session_end(self: &Arc<Self>, generation: u64, end: SessionEnd) {
        if self.generation.load(Ordering::Acquire) != generation {
            return;
        }
        *self.outbound.lock() = None;
        if self.stopped.load(Ordering::Acquire) {
            debug!("session closed by disconnect");
            return;
        }
        match &end {
            SessionEnd::Heartbeat(failure) => warn!(%failure, "heartbeat lost, forcing reconnect"),
            SessionEnd::Transport(err) => warn!(error = %err, "transport failed"),
            SessionEnd::Closed => info!("server closed the connection"),
            SessionEnd::Cancelled => debug!("session cancelled"),
        }
        self.schedule_reconnect();
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
