//! Agent run event bus
//!
//! Assigns a per-run monotonic sequence number to every emitted event, stamps
//! server time, resolves the owning session from registered run context and
//! fans the result out to in-process subscribers.
//!
//! Delivery is synchronous and best-effort: a panicking subscriber is logged
//! and skipped, the remaining subscribers still see the event.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::now_ms;

/// Stream that carries run lifecycle phases
pub const LIFECYCLE_STREAM: &str = "lifecycle";

/// Event as submitted by the agent runtime
#[derive(Debug, Clone, Default)]
pub struct AgentEventInput {
    pub run_id: String,
    pub stream: String,
    pub data: Value,
    /// Explicit session override; blank values are ignored
    pub session_key: Option<String>,
}

/// Event as delivered to subscribers and the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEventPayload {
    pub run_id: String,
    pub seq: u64,
    pub stream: String,
    pub ts: i64,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
}

/// Per-run metadata registered before events start flowing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunContext {
    pub session_key: Option<String>,
    pub verbose_level: Option<String>,
    pub is_heartbeat: Option<bool>,
}

impl RunContext {
    /// Overlay the fields set in `update`, keeping the rest
    fn merge(&mut self, update: Self) {
        if update.session_key.is_some() {
            self.session_key = update.session_key;
        }
        if update.verbose_level.is_some() {
            self.verbose_level = update.verbose_level;
        }
        if update.is_heartbeat.is_some() {
            self.is_heartbeat = update.is_heartbeat;
        }
    }
}

/// Handle returned by [`RunEventBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener = Arc<dyn Fn(&AgentEventPayload) + Send + Sync>;

#[derive(Default)]
struct BusState {
    seq_by_run: HashMap<String, u64>,
    contexts: HashMap<String, RunContext>,
}

/// In-memory run event bus
#[derive(Default)]
pub struct RunEventBus {
    state: Mutex<BusState>,
    listeners: Mutex<Vec<(SubscriptionId, Listener)>>,
    next_listener: AtomicU64,
}

impl std::fmt::Debug for RunEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunEventBus")
            .field("runs", &self.state.lock().seq_by_run.len())
            .field("listeners", &self.listeners.lock().len())
            .finish()
    }
}

impl RunEventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence, stamp and deliver an event
    pub fn emit(&self, event: AgentEventInput) -> AgentEventPayload {
        let payload = {
            let mut state = self.state.lock();
            let seq = state
                .seq_by_run
                .entry(event.run_id.clone())
                .and_modify(|s| *s += 1)
                .or_insert(1);
            let seq = *seq;

            let session_key = event
                .session_key
                .filter(|k| !k.trim().is_empty())
                .or_else(|| {
                    state
                        .contexts
                        .get(&event.run_id)
                        .and_then(|c| c.session_key.clone())
                });

            if is_terminal(&event.stream, &event.data) {
                state.contexts.remove(&event.run_id);
            }

            AgentEventPayload {
                run_id: event.run_id,
                seq,
                stream: event.stream,
                ts: now_ms(),
                data: event.data,
                session_key,
            }
        };

        self.dispatch(&payload);
        payload
    }

    fn dispatch(&self, payload: &AgentEventPayload) {
        // Snapshot so listeners may (un)subscribe from inside a callback
        let listeners: Vec<(SubscriptionId, Listener)> = self.listeners.lock().clone();
        for (id, listener) in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(payload))).is_err() {
                tracing::warn!(
                    subscription = id.0,
                    run_id = %payload.run_id,
                    seq = payload.seq,
                    "agent event subscriber panicked"
                );
            }
        }
    }

    /// Register a listener for every emitted event
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&AgentEventPayload) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener; returns whether it was registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Merge context for a run
    pub fn register_run_context(&self, run_id: &str, update: RunContext) {
        self.state
            .lock()
            .contexts
            .entry(run_id.to_string())
            .or_default()
            .merge(update);
    }

    #[must_use]
    pub fn run_context(&self, run_id: &str) -> Option<RunContext> {
        self.state.lock().contexts.get(run_id).cloned()
    }

    pub fn clear_run_context(&self, run_id: &str) {
        self.state.lock().contexts.remove(run_id);
    }

    /// Last sequence number issued for a run (0 if none)
    #[must_use]
    pub fn last_seq(&self, run_id: &str) -> u64 {
        self.state
            .lock()
            .seq_by_run
            .get(run_id)
            .copied()
            .unwrap_or(0)
    }

    /// Forget all counters, contexts and listeners
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.seq_by_run.clear();
        state.contexts.clear();
        drop(state);
        self.listeners.lock().clear();
    }
}

fn is_terminal(stream: &str, data: &Value) -> bool {
    stream == LIFECYCLE_STREAM
        && matches!(
            data.get("phase").and_then(Value::as_str),
            Some("end" | "error")
        )
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;

    use super::*;

    fn input(run_id: &str, stream: &str, data: Value) -> AgentEventInput {
        AgentEventInput {
            run_id: run_id.to_string(),
            stream: stream.to_string(),
            data,
            session_key: None,
        }
    }

    #[test]
    fn seq_is_monotonic_per_run() {
        let bus = RunEventBus::new();
        let seqs: Vec<u64> = (0..5)
            .map(|_| bus.emit(input("run-a", "assistant", json!({}))).seq)
            .collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);

        assert_eq!(bus.emit(input("run-b", "assistant", json!({}))).seq, 1);
        assert_eq!(bus.emit(input("run-a", "assistant", json!({}))).seq, 6);
        assert_eq!(bus.last_seq("run-a"), 6);
        assert_eq!(bus.last_seq("missing"), 0);
    }

    #[test]
    fn session_key_from_context_or_override() {
        let bus = RunEventBus::new();
        bus.register_run_context(
            "run",
            RunContext {
                session_key: Some("main".into()),
                ..RunContext::default()
            },
        );

        let evt = bus.emit(input("run", "assistant", json!({})));
        assert_eq!(evt.session_key.as_deref(), Some("main"));

        let mut explicit = input("run", "assistant", json!({}));
        explicit.session_key = Some("other".into());
        assert_eq!(bus.emit(explicit).session_key.as_deref(), Some("other"));

        let mut blank = input("run", "assistant", json!({}));
        blank.session_key = Some("   ".into());
        assert_eq!(bus.emit(blank).session_key.as_deref(), Some("main"));
    }

    #[test]
    fn context_updates_merge() {
        let bus = RunEventBus::new();
        bus.register_run_context(
            "run",
            RunContext {
                session_key: Some("main".into()),
                verbose_level: Some("full".into()),
                is_heartbeat: None,
            },
        );
        bus.register_run_context(
            "run",
            RunContext {
                is_heartbeat: Some(true),
                ..RunContext::default()
            },
        );

        let ctx = bus.run_context("run").unwrap();
        assert_eq!(ctx.session_key.as_deref(), Some("main"));
        assert_eq!(ctx.verbose_level.as_deref(), Some("full"));
        assert_eq!(ctx.is_heartbeat, Some(true));
    }

    #[test]
    fn lifecycle_end_clears_context() {
        let bus = RunEventBus::new();
        bus.register_run_context(
            "run",
            RunContext {
                session_key: Some("main".into()),
                ..RunContext::default()
            },
        );

        bus.emit(input("run", LIFECYCLE_STREAM, json!({"phase": "start"})));
        assert!(bus.run_context("run").is_some());

        let end = bus.emit(input("run", LIFECYCLE_STREAM, json!({"phase": "end"})));
        assert_eq!(end.session_key.as_deref(), Some("main"));
        assert!(bus.run_context("run").is_none());
    }

    #[test]
    fn panicking_subscriber_is_isolated() {
        let bus = RunEventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));

        bus.subscribe(|_| panic!("boom"));
        let counter = seen.clone();
        bus.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(input("run", "assistant", json!({})));
        bus.emit(input("run", "assistant", json!({})));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unsubscribe_and_reset() {
        let bus = RunEventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let id = bus.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(input("run", "assistant", json!({})));
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.emit(input("run", "assistant", json!({})));
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        bus.reset();
        assert_eq!(bus.emit(input("run", "assistant", json!({}))).seq, 1);
    }
}
