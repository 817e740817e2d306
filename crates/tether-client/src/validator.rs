//! Request admission checks: shape and duplicate ids.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tether_core::RequestId;
use tether_core::protocol::ProtocolRequest;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::tracker::MIN_SWEEP_PERIOD;

/// Why a request was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// The id is already being processed.
    #[error("Duplicate request ID: {0}. Already processing this request.")]
    Duplicate(RequestId),
    /// Missing or malformed fields.
    #[error("Invalid request: {0}")]
    Invalid(String),
}

/// Validator counters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorStats {
    /// Ids currently held.
    pub active_ids: usize,
}

/// Tracks in-flight request ids and rejects malformed or repeated ones.
pub struct RequestValidator {
    active: Mutex<HashMap<RequestId, Instant>>,
    stale_after: Duration,
}

impl RequestValidator {
    /// Create a validator. Ids held longer than `stale_after` are swept.
    pub fn new(stale_after: Duration) -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
            stale_after,
        }
    }

    /// Check `request` and hold its id until [`mark_complete`](Self::mark_complete).
    pub fn admit(&self, request: &ProtocolRequest) -> Result<(), ValidationError> {
        if request.id.as_str().is_empty() {
            return Err(ValidationError::Invalid("id must be a non-empty string".into()));
        }
        if request.action.is_empty() {
            return Err(ValidationError::Invalid(
                "action must be a non-empty string".into(),
            ));
        }
        let mut active = self.active.lock();
        if active.contains_key(&request.id) {
            warn!(request_id = %request.id, "duplicate request id");
            return Err(ValidationError::Duplicate(request.id.clone()));
        }
        let _ = active.insert(request.id.clone(), Instant::now());
        Ok(())
    }

    /// Release `id`.
    pub fn mark_complete(&self, id: &RequestId) {
        let _ = self.active.lock().remove(id);
    }

    /// Release ids held longer than the stale window. Returns how many.
    pub fn sweep_stale(&self) -> usize {
        let now = Instant::now();
        let mut active = self.active.lock();
        let before = active.len();
        active.retain(|_, since| now.duration_since(*since) <= self.stale_after);
        let removed = before - active.len();
        if removed > 0 {
            warn!(removed, "released stale request ids");
        }
        removed
    }

    /// Run [`sweep_stale`](Self::sweep_stale) every `period` until `cancel` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        period: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let validator = Arc::clone(self);
        let period = period.max(MIN_SWEEP_PERIOD);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let _ = validator.sweep_stale();
                    }
                    () = cancel.cancelled() => break,
                }
            }
        })
    }

    /// Current counters.
    pub fn stats(&self) -> ValidatorStats {
        ValidatorStats {
            active_ids: self.active.lock().len(),
        }
    }
}
