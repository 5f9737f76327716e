//! Request correlation table

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::protocol::{ErrorCode, ErrorShape, ResponseFrame};
use crate::{Error, Result};

/// Where an outstanding request is in its exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingPhase {
    /// Nothing received yet
    AwaitingResponse,
    /// An interim `{status:"accepted"}` arrived; only a terminal response
    /// completes the request
    AcceptedAwaitingFinal,
}

/// How a response frame was applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// No request with that id (late, duplicate or timed out)
    Unknown,
    Accepted,
    Completed,
}

struct PendingRequest {
    phase: PendingPhase,
    expect_final: bool,
    tx: oneshot::Sender<Result<Value>>,
}

/// Outstanding requests keyed by id
#[derive(Default)]
pub struct PendingRequests {
    inner: Mutex<HashMap<String, PendingRequest>>,
}

impl std::fmt::Debug for PendingRequests {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequests")
            .field("len", &self.len())
            .finish()
    }
}

impl PendingRequests {
    /// Track a request and get the receiver for its outcome
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` if a request with the same id is still
    /// outstanding
    pub fn insert(&self, id: &str, expect_final: bool) -> Result<oneshot::Receiver<Result<Value>>> {
        let mut inner = self.inner.lock();
        let Entry::Vacant(slot) = inner.entry(id.to_string()) else {
            return Err(Error::InvalidRequest(format!("request id already in flight: {id}")));
        };
        let (tx, rx) = oneshot::channel();
        slot.insert(PendingRequest {
            phase: PendingPhase::AwaitingResponse,
            expect_final,
            tx,
        });
        Ok(rx)
    }

    /// Apply a response frame
    pub fn resolve(&self, frame: ResponseFrame) -> Resolution {
        let pending = {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.get_mut(&frame.id) else {
                return Resolution::Unknown;
            };
            if entry.expect_final && frame.is_accepted() {
                entry.phase = PendingPhase::AcceptedAwaitingFinal;
                return Resolution::Accepted;
            }
            inner.remove(&frame.id)
        };

        if let Some(pending) = pending {
            let outcome = if frame.ok {
                Ok(frame.payload.unwrap_or(Value::Null))
            } else {
                Err(Error::from(frame.error.unwrap_or_else(|| {
                    ErrorShape::new(ErrorCode::Unknown, "request failed")
                })))
            };
            let _ = pending.tx.send(outcome);
        }
        Resolution::Completed
    }

    /// Drop a request without completing it
    pub fn remove(&self, id: &str) -> bool {
        self.inner.lock().remove(id).is_some()
    }

    /// Fail every outstanding request
    pub fn fail_all<F>(&self, make_error: F) -> usize
    where
        F: Fn() -> Error,
    {
        let drained: Vec<PendingRequest> = self.inner.lock().drain().map(|(_, p)| p).collect();
        let count = drained.len();
        for pending in drained {
            let _ = pending.tx.send(Err(make_error()));
        }
        count
    }

    #[must_use]
    pub fn phase(&self, id: &str) -> Option<PendingPhase> {
        self.inner.lock().get(id).map(|p| p.phase)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
