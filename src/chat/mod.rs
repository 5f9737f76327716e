//! Chat run coordination
//!
//! Tracks in-flight chat runs so they can be aborted by id, by session, or
//! when they outlive their deadline. Completed runs are remembered for a
//! few minutes so a retried request with the same idempotency key gets the
//! cached result instead of a second run.

pub mod registry;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use mini_moka::sync::Cache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

pub use registry::{ChatRunQueueEntry, ChatRunRegistry};

use crate::broadcast::{BroadcastOpts, Broadcaster};
use crate::events::{RunContext, RunEventBus};
use crate::protocol::events;

/// Added on top of the requested run timeout
const ABORT_GRACE_MS: i64 = 60_000;
const MIN_RUN_LIFETIME_MS: i64 = 2 * 60_000;
const MAX_RUN_LIFETIME_MS: i64 = 24 * 60 * 60_000;

/// How long an aborted marker outlives its run
const ABORTED_RUN_TTL_MS: i64 = 60 * 60_000;

/// Minimum spacing between streamed deltas of one run
const DELTA_THROTTLE_MS: i64 = 150;

const DEDUPE_TTL: Duration = Duration::from_secs(5 * 60);
const DEDUPE_MAX_ENTRIES: u64 = 1_000;

/// Stop reason used by the expiry sweep
pub const STOP_REASON_TIMEOUT: &str = "timeout";

/// Deadline for a run started at `now_ms`
///
/// `now + max(0, timeout) + grace`, clamped to `[now + 2min, now + 24h]`.
#[must_use]
pub const fn resolve_expires_at_ms(now_ms: i64, timeout_ms: i64) -> i64 {
    let bounded = if timeout_ms > 0 { timeout_ms } else { 0 };
    let target = now_ms
        .saturating_add(bounded)
        .saturating_add(ABORT_GRACE_MS);
    let min = now_ms.saturating_add(MIN_RUN_LIFETIME_MS);
    let max = now_ms.saturating_add(MAX_RUN_LIFETIME_MS);
    if target < min {
        min
    } else if target > max {
        max
    } else {
        target
    }
}

/// Abort handle for one in-flight run
#[derive(Debug, Clone)]
pub struct ChatAbortEntry {
    pub token: CancellationToken,
    pub session_id: String,
    pub session_key: String,
    pub started_at_ms: i64,
    pub expires_at_ms: i64,
}

/// Parameters of a new run
#[derive(Debug, Clone)]
pub struct ChatRunStart {
    /// Client idempotency key, used as the run id
    pub run_id: String,
    pub session_id: String,
    pub session_key: String,
    pub timeout_ms: i64,
    pub now_ms: i64,
}

/// Outcome of [`ChatRunCoordinator::begin_run`]
#[derive(Debug, Clone)]
pub enum BeginRun {
    Started(CancellationToken),
    /// A run with this key is still executing
    InFlight,
    /// A run with this key finished recently
    Cached(Value),
}

/// Outcome of [`ChatRunCoordinator::append_delta`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaOutcome {
    /// Send the full buffered text now
    Emit(String),
    Throttled,
    /// Run finished, was aborted, or never existed
    Unknown,
}

/// Result of an abort request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortOutcome {
    pub aborted: bool,
}

#[derive(Debug, Default)]
struct ChatState {
    controllers: HashMap<String, ChatAbortEntry>,
    buffers: HashMap<String, String>,
    delta_sent_at: HashMap<String, i64>,
    aborted_runs: HashMap<String, i64>,
    runs: ChatRunRegistry,
}

impl ChatState {
    /// Remove a run and everything buffered for it
    fn take_run(&mut self, run_id: &str, now_ms: i64) -> Option<ChatAbortEntry> {
        let entry = self.controllers.remove(run_id)?;
        self.buffers.remove(run_id);
        self.delta_sent_at.remove(run_id);
        self.runs
            .remove(&entry.session_id, run_id, Some(entry.session_key.as_str()));
        self.aborted_runs.insert(run_id.to_string(), now_ms);
        Some(entry)
    }
}

/// Coordinates chat runs for the gateway
pub struct ChatRunCoordinator {
    broadcaster: Arc<Broadcaster>,
    events: Arc<RunEventBus>,
    state: Mutex<ChatState>,
    dedupe: Cache<String, Value>,
}

impl std::fmt::Debug for ChatRunCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatRunCoordinator")
            .field("active", &self.active_count())
            .finish_non_exhaustive()
    }
}

impl ChatRunCoordinator {
    #[must_use]
    pub fn new(broadcaster: Arc<Broadcaster>, events: Arc<RunEventBus>) -> Self {
        Self {
            broadcaster,
            events,
            state: Mutex::new(ChatState::default()),
            dedupe: Cache::builder()
                .max_capacity(DEDUPE_MAX_ENTRIES)
                .time_to_live(DEDUPE_TTL)
                .build(),
        }
    }

    /// Register a run unless its idempotency key is already in use
    pub fn begin_run(&self, start: ChatRunStart) -> BeginRun {
        if let Some(result) = self.dedupe.get(&start.run_id) {
            return BeginRun::Cached(result);
        }

        let token = CancellationToken::new();
        {
            let mut state = self.state.lock();
            if state.controllers.contains_key(&start.run_id) {
                return BeginRun::InFlight;
            }
            state.controllers.insert(
                start.run_id.clone(),
                ChatAbortEntry {
                    token: token.clone(),
                    session_id: start.session_id.clone(),
                    session_key: start.session_key.clone(),
                    started_at_ms: start.now_ms,
                    expires_at_ms: resolve_expires_at_ms(start.now_ms, start.timeout_ms),
                },
            );
            state.aborted_runs.remove(&start.run_id);
            state.runs.add(
                &start.session_id,
                ChatRunQueueEntry {
                    session_key: start.session_key.clone(),
                    client_run_id: start.run_id.clone(),
                },
            );
        }

        self.events.register_run_context(
            &start.run_id,
            RunContext {
                session_key: Some(start.session_key),
                ..RunContext::default()
            },
        );
        tracing::debug!(run_id = %start.run_id, session_id = %start.session_id, "chat run started");
        BeginRun::Started(token)
    }

    /// Buffer streamed text and decide whether a delta is due
    ///
    /// Deltas are throttled per run so a fast token stream does not flood
    /// subscribers; the buffer always holds the full text so far.
    pub fn append_delta(&self, run_id: &str, text: &str, now_ms: i64) -> DeltaOutcome {
        let mut state = self.state.lock();
        if !state.controllers.contains_key(run_id) {
            return DeltaOutcome::Unknown;
        }
        let buffer = {
            let buffer = state.buffers.entry(run_id.to_string()).or_default();
            buffer.push_str(text);
            buffer.clone()
        };

        let due = state
            .delta_sent_at
            .get(run_id)
            .is_none_or(|last| now_ms.saturating_sub(*last) >= DELTA_THROTTLE_MS);
        if !due {
            return DeltaOutcome::Throttled;
        }
        state.delta_sent_at.insert(run_id.to_string(), now_ms);
        DeltaOutcome::Emit(buffer)
    }

    /// Text buffered so far for a run
    #[must_use]
    pub fn buffered_text(&self, run_id: &str) -> Option<String> {
        self.state.lock().buffers.get(run_id).cloned()
    }

    /// Record a run's final result and release it
    pub fn finish_run(&self, run_id: &str, result: Value) -> bool {
        let finished = {
            let mut state = self.state.lock();
            let entry = state.controllers.remove(run_id);
            state.buffers.remove(run_id);
            state.delta_sent_at.remove(run_id);
            if let Some(entry) = &entry {
                state
                    .runs
                    .remove(&entry.session_id, run_id, Some(entry.session_key.as_str()));
            }
            entry.is_some()
        };

        if finished {
            self.dedupe.insert(run_id.to_string(), result);
        }
        finished
    }

    /// Abort a run if it belongs to `session_key`
    pub fn abort_by_id(
        &self,
        run_id: &str,
        session_key: &str,
        stop_reason: Option<&str>,
        now_ms: i64,
    ) -> AbortOutcome {
        let entry = {
            let mut state = self.state.lock();
            let owned = state
                .controllers
                .get(run_id)
                .is_some_and(|e| e.session_key == session_key);
            if !owned {
                return AbortOutcome { aborted: false };
            }
            state.take_run(run_id, now_ms)
        };

        let Some(entry) = entry else {
            return AbortOutcome { aborted: false };
        };
        self.announce_abort(run_id, &entry, stop_reason);
        AbortOutcome { aborted: true }
    }

    /// Abort every run of a session, returning the aborted run ids
    pub fn abort_all_for_session(
        &self,
        session_key: &str,
        stop_reason: Option<&str>,
        now_ms: i64,
    ) -> Vec<String> {
        let aborted: Vec<(String, ChatAbortEntry)> = {
            let mut state = self.state.lock();
            let ids: Vec<String> = state
                .controllers
                .iter()
                .filter(|(_, e)| e.session_key == session_key)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| state.take_run(&id, now_ms).map(|e| (id, e)))
                .collect()
        };

        for (run_id, entry) in &aborted {
            self.announce_abort(run_id, entry, stop_reason);
        }
        aborted.into_iter().map(|(id, _)| id).collect()
    }

    /// Abort runs past their deadline and forget stale abort markers
    pub fn sweep_expired(&self, now_ms: i64) -> Vec<String> {
        let expired: Vec<(String, ChatAbortEntry)> = {
            let mut state = self.state.lock();
            let ids: Vec<String> = state
                .controllers
                .iter()
                .filter(|(_, e)| now_ms > e.expires_at_ms)
                .map(|(id, _)| id.clone())
                .collect();
            let expired = ids
                .into_iter()
                .filter_map(|id| state.take_run(&id, now_ms).map(|e| (id, e)))
                .collect();
            state
                .aborted_runs
                .retain(|_, at| now_ms.saturating_sub(*at) <= ABORTED_RUN_TTL_MS);
            expired
        };

        for (run_id, entry) in &expired {
            self.announce_abort(run_id, entry, Some(STOP_REASON_TIMEOUT));
        }
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "swept expired chat runs");
        }
        expired.into_iter().map(|(id, _)| id).collect()
    }

    fn announce_abort(&self, run_id: &str, entry: &ChatAbortEntry, stop_reason: Option<&str>) {
        entry.token.cancel();

        let mut payload = json!({
            "runId": run_id,
            "sessionKey": entry.session_key,
            "seq": self.events.last_seq(run_id) + 1,
            "state": "aborted",
        });
        if let Some(reason) = stop_reason {
            payload["stopReason"] = Value::from(reason);
        }

        self.broadcaster
            .broadcast(events::CHAT, payload.clone(), BroadcastOpts::default());
        self.broadcaster
            .send_to_session(&entry.session_key, events::CHAT, payload);

        tracing::info!(
            run_id = %run_id,
            session_key = %entry.session_key,
            stop_reason = stop_reason.unwrap_or("abort"),
            "chat run aborted"
        );
    }

    #[must_use]
    pub fn is_aborted(&self, run_id: &str) -> bool {
        self.state.lock().aborted_runs.contains_key(run_id)
    }

    #[must_use]
    pub fn is_active(&self, run_id: &str) -> bool {
        self.state.lock().controllers.contains_key(run_id)
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.state.lock().controllers.len()
    }

    /// Oldest queued run of a session
    #[must_use]
    pub fn next_in_session(&self, session_id: &str) -> Option<ChatRunQueueEntry> {
        self.state.lock().runs.peek(session_id).cloned()
    }
}
