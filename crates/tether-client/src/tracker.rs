//! Per-request lifecycle bookkeeping.
//!
//! Entries move `pending -> executing -> {completed, failed}`. A finished
//! entry is removed after the retention window by its own timer; a periodic
//! sweep also drops anything older than the stale window in case a
//! completion never arrives.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tether_core::RequestId;
use tether_settings::TrackerSettings;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Floor for sweeper periods; `tokio::time::interval` rejects zero.
pub(crate) const MIN_SWEEP_PERIOD: Duration = Duration::from_millis(1);

/// Lifecycle state of a tracked request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Received, waiting for admission.
    Pending,
    /// Admitted and running.
    Executing,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
}

impl RequestStatus {
    fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Executing)
    }
}

/// One tracked request.
#[derive(Clone, Debug)]
pub struct TrackedRequest {
    /// Request id.
    pub id: RequestId,
    /// Action name.
    pub action: String,
    /// When tracking started.
    pub started: Instant,
    /// Current state.
    pub status: RequestStatus,
    /// Time from start to completion.
    pub duration: Option<Duration>,
    /// Error message for failed requests.
    pub error: Option<String>,
}

/// Tracker timing.
#[derive(Clone, Debug)]
pub struct TrackerConfig {
    /// How long finished entries stay visible.
    pub retention: Duration,
    /// Period of the stale sweep.
    pub sweep_interval: Duration,
    /// Age beyond which the sweep drops any entry.
    pub stale_after: Duration,
    /// Default threshold for [`RequestTracker::hung_requests`].
    pub hung_threshold: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self::from(&TrackerSettings::default())
    }
}

impl From<&TrackerSettings> for TrackerConfig {
    fn from(settings: &TrackerSettings) -> Self {
        Self {
            retention: Duration::from_millis(settings.retention_ms),
            sweep_interval: Duration::from_millis(settings.sweep_interval_ms),
            stale_after: Duration::from_millis(settings.stale_after_ms),
            hung_threshold: Duration::from_millis(settings.hung_threshold_ms),
        }
    }
}

/// Aggregate request stats.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerStats {
    /// Retained entries.
    pub total: usize,
    /// Pending or executing.
    pub in_flight: usize,
    /// Waiting for admission.
    pub pending: usize,
    /// Running.
    pub executing: usize,
    /// Finished successfully.
    pub completed: usize,
    /// Finished with an error.
    pub failed: usize,
    /// Mean duration of finished entries, rounded to whole milliseconds.
    pub avg_duration_ms: u64,
    /// `failed / total`, rounded to two decimals.
    pub error_rate: f64,
}

type Entries = Arc<Mutex<HashMap<RequestId, TrackedRequest>>>;

/// Records request state transitions and durations.
pub struct RequestTracker {
    entries: Entries,
    config: TrackerConfig,
}

impl RequestTracker {
    /// Create an empty tracker.
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    /// Start tracking `id` in the `pending` state.
    pub fn start(&self, id: &RequestId, action: &str) {
        let entry = TrackedRequest {
            id: id.clone(),
            action: action.to_owned(),
            started: Instant::now(),
            status: RequestStatus::Pending,
            duration: None,
            error: None,
        };
        let _ = self.entries.lock().insert(id.clone(), entry);
    }

    /// Move `id` to `executing`.
    pub fn mark_executing(&self, id: &RequestId) {
        if let Some(entry) = self.entries.lock().get_mut(id) {
            entry.status = RequestStatus::Executing;
        }
    }

    /// Finish `id`; an error marks it `failed`.
    ///
    /// Must be called inside a tokio runtime: the retention timer is a task.
    pub fn complete(&self, id: &RequestId, error: Option<String>) {
        let started = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(id) else {
                return;
            };
            let duration = entry.started.elapsed();
            entry.status = if error.is_some() {
                RequestStatus::Failed
            } else {
                RequestStatus::Completed
            };
            entry.duration = Some(duration);
            debug!(
                request_id = %id,
                action = %entry.action,
                status = ?entry.status,
                duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
                "request finished"
            );
            entry.error = error;
            entry.started
        };

        let entries = Arc::clone(&self.entries);
        let id = id.clone();
        let retention = self.config.retention;
        let _ = tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            let mut entries = entries.lock();
            // Only remove the entry this timer was armed for.
            if entries.get(&id).is_some_and(|e| e.started == started) {
                let _ = entries.remove(&id);
            }
        });
    }

    /// Look up one entry.
    pub fn get(&self, id: &RequestId) -> Option<TrackedRequest> {
        self.entries.lock().get(id).cloned()
    }

    /// Aggregate stats over retained entries.
    pub fn stats(&self) -> TrackerStats {
        let entries = self.entries.lock();
        let mut stats = TrackerStats {
            total: entries.len(),
            ..TrackerStats::default()
        };
        let mut total_duration = Duration::ZERO;
        let mut timed = 0u32;
        for entry in entries.values() {
            match entry.status {
                RequestStatus::Pending => stats.pending += 1,
                RequestStatus::Executing => stats.executing += 1,
                RequestStatus::Completed => stats.completed += 1,
                RequestStatus::Failed => stats.failed += 1,
            }
            if let Some(duration) = entry.duration {
                total_duration += duration;
                timed += 1;
            }
        }
        stats.in_flight = stats.pending + stats.executing;
        if timed > 0 {
            let avg = total_duration.as_secs_f64() * 1000.0 / f64::from(timed);
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let avg_ms = avg.round() as u64;
            stats.avg_duration_ms = avg_ms;
        }
        if stats.total > 0 {
            #[allow(clippy::cast_precision_loss)]
            let rate = stats.failed as f64 / stats.total as f64;
            stats.error_rate = (rate * 100.0).round() / 100.0;
        }
        stats
    }

    /// Active entries older than `threshold`, oldest first.
    pub fn hung_requests(&self, threshold: Duration) -> Vec<TrackedRequest> {
        let now = Instant::now();
        let mut hung: Vec<TrackedRequest> = self
            .entries
            .lock()
            .values()
            .filter(|e| e.status.is_active() && now.duration_since(e.started) > threshold)
            .cloned()
            .collect();
        hung.sort_by_key(|e| e.started);
        hung
    }

    /// [`hung_requests`](Self::hung_requests) with the configured threshold.
    pub fn hung_requests_default(&self) -> Vec<TrackedRequest> {
        self.hung_requests(self.config.hung_threshold)
    }

    /// Drop every entry older than the stale window. Returns how many.
    pub fn sweep_stale(&self) -> usize {
        let now = Instant::now();
        let stale_after = self.config.stale_after;
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| now.duration_since(e.started) <= stale_after);
        let removed = before - entries.len();
        if removed > 0 {
            warn!(removed, "swept stale request entries");
        }
        removed
    }

    /// Run [`sweep_stale`](Self::sweep_stale) periodically until `cancel` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        let period = self.config.sweep_interval.max(MIN_SWEEP_PERIOD);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let _ = tracker.sweep_stale();
                    }
                    () = cancel.cancelled() => break,
                }
            }
        })
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
