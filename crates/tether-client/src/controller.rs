//! `AgentController`: the client-side pipeline.
//!
//! ```text
//! link -> validator -> tracker -> limiter -> dispatch table -> response
//!                                                               |
//!                                    link down -> ResponseDeliveryQueue
//! ```
//!
//! Every transition to `Connected` flushes the queue and re-reports owned
//! windows, since the server drops ownership when a connection goes away.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tether_core::WindowId;
use tether_core::protocol::{
    ControlMessage, ProtocolError, ProtocolRequest, ProtocolResponse, ServerFrame,
};
use tether_settings::TetherSettings;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::dispatch::ActionDispatchTable;
use crate::error::LinkError;
use crate::limiter::{AdmissionLimiter, LimiterStats};
use crate::link::{ConnectionLink, ConnectionStatus, InboundFrame, LinkConfig};
use crate::port::{PortProvider, WindowProvider};
use crate::response_queue::ResponseDeliveryQueue;
use crate::tracker::{RequestTracker, TrackedRequest, TrackerConfig, TrackerStats};
use crate::validator::{RequestValidator, ValidationError, ValidatorStats};

/// Inbound frames buffered between the link and the message loop.
const INBOUND_BUFFER: usize = 256;

/// Controller configuration.
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Connection link settings.
    pub link: LinkConfig,
    /// Actions allowed to run at once.
    pub max_concurrent: usize,
    /// Actions allowed to wait for a slot.
    pub max_queue_size: usize,
    /// Responses held while disconnected.
    pub response_queue_size: usize,
    /// Request lifecycle timing.
    pub tracker: TrackerConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self::from(&TetherSettings::default())
    }
}

impl From<&TetherSettings> for ControllerConfig {
    fn from(settings: &TetherSettings) -> Self {
        Self {
            link: LinkConfig::from(&settings.link),
            max_concurrent: settings.concurrency.max_concurrent,
            max_queue_size: settings.concurrency.max_queue_size,
            response_queue_size: settings.response_queue.max_size,
            tracker: TrackerConfig::from(&settings.tracker),
        }
    }
}

/// Snapshot of controller health.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerStats {
    /// Link state.
    pub connection: ConnectionStatus,
    /// Request lifecycle counters.
    pub requests: TrackerStats,
    /// Admission counters.
    pub limiter: LimiterStats,
    /// Duplicate-id guard counters.
    pub validator: ValidatorStats,
    /// Responses waiting for a connection.
    pub queued_responses: usize,
    /// Responses evicted from a full queue.
    pub dropped_responses: u64,
}

/// Client agent: receives requests over the link, runs them, answers.
pub struct AgentController {
    config: ControllerConfig,
    link: Arc<ConnectionLink>,
    windows: Arc<dyn WindowProvider>,
    dispatch: Arc<ActionDispatchTable>,
    validator: Arc<RequestValidator>,
    tracker: Arc<RequestTracker>,
    limiter: AdmissionLimiter,
    queue: ResponseDeliveryQueue,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AgentController {
    /// Build a controller. Nothing runs until [`start`](Self::start).
    pub fn new(
        config: ControllerConfig,
        port: Arc<dyn PortProvider>,
        windows: Arc<dyn WindowProvider>,
        dispatch: ActionDispatchTable,
    ) -> Arc<Self> {
        let link = ConnectionLink::new(config.link.clone(), port);
        Arc::new(Self {
            link,
            windows,
            dispatch: Arc::new(dispatch),
            validator: Arc::new(RequestValidator::new(config.tracker.stale_after)),
            tracker: Arc::new(RequestTracker::new(config.tracker.clone())),
            limiter: AdmissionLimiter::new(config.max_concurrent, config.max_queue_size),
            queue: ResponseDeliveryQueue::new(config.response_queue_size),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            config,
        })
    }

    /// Start the background loops and make the first connection attempt.
    ///
    /// A failed first attempt is returned, but the link keeps retrying.
    pub async fn start(self: &Arc<Self>) -> Result<(), LinkError> {
        // Subscribe before connecting so the first `Connected` is seen.
        let messages = self.link.claim_frames(INBOUND_BUFFER);
        let statuses = self.link.subscribe_status();
        {
            let mut tasks = self.tasks.lock();
            tasks.push(tokio::spawn(Arc::clone(self).message_loop(messages)));
            tasks.push(tokio::spawn(Arc::clone(self).status_loop(statuses)));
            tasks.push(self.tracker.spawn_sweeper(self.cancel.child_token()));
            tasks.push(
                self.validator
                    .spawn_sweeper(self.config.tracker.sweep_interval, self.cancel.child_token()),
            );
        }
        info!(actions = self.dispatch.len(), "agent controller started");
        self.link.connect().await
    }

    /// Stop the loops and close the link for good.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.link.disconnect();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!("agent controller stopped");
    }

    /// Deliver a response now, or queue it until the link is back.
    ///
    /// Responses still queued from an earlier outage go out first.
    pub fn send_response(&self, response: ProtocolResponse) {
        if self.link.is_connected() {
            let _ = self
                .queue
                .deliver(response, |queued| self.link.send_json(queued));
        } else {
            let _ = self.queue.enqueue(response);
        }
    }

    /// Tell the server a window was opened here.
    pub fn notify_window_created(&self, window_id: WindowId) -> Result<(), LinkError> {
        self.link.send_json(&ControlMessage::WindowCreated { window_id })
    }

    /// Tell the server a window here was closed.
    pub fn notify_window_removed(&self, window_id: WindowId) -> Result<(), LinkError> {
        self.link.send_json(&ControlMessage::WindowRemoved { window_id })
    }

    /// Tell the server this client has focus.
    pub fn notify_window_focused(&self, window_id: Option<WindowId>) -> Result<(), LinkError> {
        self.link.send_json(&ControlMessage::Focused { window_id })
    }

    /// Health snapshot.
    pub fn stats(&self) -> ControllerStats {
        ControllerStats {
            connection: self.link.status(),
            requests: self.tracker.stats(),
            limiter: self.limiter.stats(),
            validator: self.validator.stats(),
            queued_responses: self.queue.size(),
            dropped_responses: self.queue.dropped_count(),
        }
    }

    /// Requests running longer than the configured hung threshold.
    pub fn hung_requests(&self) -> Vec<TrackedRequest> {
        self.tracker.hung_requests_default()
    }

    /// The underlying link.
    pub fn link(&self) -> &Arc<ConnectionLink> {
        &self.link
    }

    /// Responses waiting for a connection.
    pub fn queue(&self) -> &ResponseDeliveryQueue {
        &self.queue
    }

    async fn message_loop(self: Arc<Self>, mut rx: mpsc::Receiver<InboundFrame>) {
        loop {
            let frame = tokio::select! {
                () = self.cancel.cancelled() => break,
                frame = rx.recv() => frame,
            };
            match frame {
                Some(frame) => self.on_frame(frame),
                None => break,
            }
        }
    }

    fn on_frame(self: &Arc<Self>, frame: InboundFrame) {
        match frame {
            Ok(ServerFrame::Request(request)) => {
                let _ = tokio::spawn(Arc::clone(self).handle_request(request));
            }
            Ok(ServerFrame::Control(control)) => {
                debug!(kind = control.kind(), "ignoring control frame from server");
            }
            Err(ProtocolError::InvalidRequest {
                id: Some(id),
                reason,
            }) => {
                let message = ValidationError::Invalid(reason).to_string();
                self.send_response(ProtocolResponse::failure(id.into(), message));
            }
            // Already logged by the link.
            Err(_) => {}
        }
    }

    #[instrument(skip_all, fields(request_id = %request.id, action = %request.action))]
    pub(crate) async fn handle_request(self: Arc<Self>, request: ProtocolRequest) {
        if let Err(err) = self.validator.admit(&request) {
            self.send_response(ProtocolResponse::failure(request.id, err.to_string()));
            return;
        }
        let ProtocolRequest { id, action, payload } = request;
        self.tracker.start(&id, &action);

        let outcome = self
            .limiter
            .execute(async {
                self.tracker.mark_executing(&id);
                self.dispatch.dispatch(&action, payload).await
            })
            .await;

        let response = match outcome {
            Ok(Ok(data)) => {
                self.tracker.complete(&id, None);
                ProtocolResponse::success(id.clone(), Some(data))
            }
            Ok(Err(message)) => {
                self.tracker.complete(&id, Some(message.clone()));
                ProtocolResponse::failure(id.clone(), message)
            }
            Err(err) => {
                let message = err.to_string();
                warn!(error = %message, "request not admitted");
                self.tracker.complete(&id, Some(message.clone()));
                ProtocolResponse::failure(id.clone(), message)
            }
        };
        self.validator.mark_complete(&id);
        self.send_response(response);
    }

    async fn status_loop(self: Arc<Self>, mut rx: broadcast::Receiver<ConnectionStatus>) {
        loop {
            let status = tokio::select! {
                () = self.cancel.cancelled() => break,
                status = rx.recv() => status,
            };
            match status {
                Ok(ConnectionStatus::Connected) => self.on_connected().await,
                Ok(status) => debug!(%status, "link status"),
                Err(RecvError::Lagged(_)) => {
                    // A missed `Connected` must not leave the queue stranded.
                    if self.link.is_connected() {
                        self.on_connected().await;
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    async fn on_connected(&self) {
        let sent = self.queue.flush(|response| self.link.send_json(response));
        if sent > 0 {
            info!(sent, "delivered queued responses");
        }

        let window_ids = self.windows.window_ids().await;
        if window_ids.is_empty() {
            return;
        }
        let count = window_ids.len();
        match self
            .link
            .send_json(&ControlMessage::RegisterWindows { window_ids })
        {
            Ok(()) => debug!(count, "registered windows"),
            Err(err) => warn!(error = %err, "failed to register windows"),
        }
    }
}
