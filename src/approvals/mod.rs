//! Pending exec approvals
//!
//! An agent asks a human to allow a command, then waits. Each pending entry
//! resolves exactly once: by an operator decision or by its timeout, and the
//! entry is removed before it is completed so a late decision is a no-op.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::protocol::now_ms;
use crate::{Error, Result};

/// Operator verdict on a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecApprovalDecision {
    AllowOnce,
    AllowAlways,
    Deny,
}

/// What the agent wants to run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecApprovalRequest {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

/// A created approval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecApprovalRecord {
    pub id: String,
    pub request: ExecApprovalRequest,
    pub created_at_ms: i64,
    pub expires_at_ms: i64,
}

struct PendingApproval {
    record: ExecApprovalRecord,
    tx: oneshot::Sender<ExecApprovalDecision>,
}

/// Table of approvals waiting on an operator
#[derive(Default)]
pub struct ExecApprovalManager {
    pending: Mutex<HashMap<String, PendingApproval>>,
}

impl std::fmt::Debug for ExecApprovalManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecApprovalManager")
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl ExecApprovalManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a record; nothing is pending until [`Self::register`]
    #[must_use]
    pub fn create(
        &self,
        request: ExecApprovalRequest,
        timeout_ms: u64,
        id: Option<String>,
    ) -> ExecApprovalRecord {
        let created_at_ms = now_ms();
        let id = id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        ExecApprovalRecord {
            id,
            request,
            created_at_ms,
            expires_at_ms: created_at_ms.saturating_add(i64::try_from(timeout_ms).unwrap_or(i64::MAX)),
        }
    }

    /// Make `record` resolvable
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` if an approval with the same id is still
    /// pending
    pub fn register(&self, record: ExecApprovalRecord) -> Result<oneshot::Receiver<ExecApprovalDecision>> {
        let mut pending = self.pending.lock();
        match pending.entry(record.id.clone()) {
            Entry::Occupied(_) => Err(Error::InvalidRequest(format!(
                "approval already pending: {}",
                record.id
            ))),
            Entry::Vacant(slot) => {
                let (tx, rx) = oneshot::channel();
                slot.insert(PendingApproval { record, tx });
                Ok(rx)
            }
        }
    }

    /// Wait on a registered approval until it is resolved or `expires_at_ms`
    ///
    /// Returns `None` on expiry or cancellation.
    pub async fn wait(
        &self,
        id: &str,
        expires_at_ms: i64,
        mut rx: oneshot::Receiver<ExecApprovalDecision>,
    ) -> Option<ExecApprovalDecision> {
        let remaining = u64::try_from(expires_at_ms.saturating_sub(now_ms())).unwrap_or(0);
        match tokio::time::timeout(Duration::from_millis(remaining), &mut rx).await {
            Ok(outcome) => outcome.ok(),
            Err(_) => {
                if self.pending.lock().remove(id).is_some() {
                    tracing::info!(approval_id = %id, "exec approval expired");
                    return None;
                }
                // Resolved at the deadline; the decision is already sent
                rx.try_recv().ok()
            }
        }
    }

    /// [`Self::register`] then [`Self::wait`]
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` if the id is already pending
    pub async fn wait_for_decision(&self, record: ExecApprovalRecord) -> Result<Option<ExecApprovalDecision>> {
        let id = record.id.clone();
        let expires_at_ms = record.expires_at_ms;
        let rx = self.register(record)?;
        Ok(self.wait(&id, expires_at_ms, rx).await)
    }

    /// Drop a pending approval without a decision
    pub fn cancel(&self, id: &str) -> bool {
        self.pending.lock().remove(id).is_some()
    }

    /// Complete a pending approval
    ///
    /// Returns `false` for unknown or already-expired ids.
    pub fn resolve(&self, id: &str, decision: ExecApprovalDecision, resolved_by: Option<&str>) -> bool {
        let Some(pending) = self.pending.lock().remove(id) else {
            return false;
        };
        tracing::info!(
            approval_id = %id,
            decision = ?decision,
            resolved_by = resolved_by.unwrap_or("unknown"),
            "exec approval resolved"
        );
        pending.tx.send(decision).is_ok()
    }

    /// Pending record by id
    #[must_use]
    pub fn snapshot(&self, id: &str) -> Option<ExecApprovalRecord> {
        self.pending.lock().get(id).map(|p| p.record.clone())
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn request(command: &str) -> ExecApprovalRequest {
        ExecApprovalRequest {
            command: command.to_string(),
            ..ExecApprovalRequest::default()
        }
    }

    #[tokio::test]
    async fn resolve_completes_waiter() {
        let manager = Arc::new(ExecApprovalManager::new());
        let record = manager.create(request("ls"), 60_000, Some("a1".into()));
        assert_eq!(record.id, "a1");

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.wait_for_decision(record).await.unwrap() })
        };
        while manager.snapshot("a1").is_none() {
            tokio::task::yield_now().await;
        }

        assert!(manager.resolve("a1", ExecApprovalDecision::AllowOnce, Some("op")));
        assert_eq!(waiter.await.unwrap(), Some(ExecApprovalDecision::AllowOnce));
        assert_eq!(manager.pending_count(), 0);
        assert!(!manager.resolve("a1", ExecApprovalDecision::Deny, None));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_removes_entry() {
        let manager = ExecApprovalManager::new();
        let record = manager.create(request("rm"), 1_000, None);
        let id = record.id.clone();

        assert_eq!(manager.wait_for_decision(record).await.unwrap(), None);
        assert!(manager.snapshot(&id).is_none());
        assert!(!manager.resolve(&id, ExecApprovalDecision::AllowAlways, None));
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_id_is_rejected_while_pending() {
        let manager = Arc::new(ExecApprovalManager::new());
        let first = manager.create(request("ls"), 60_000, Some("dup".into()));
        let rx = manager.register(first.clone()).unwrap();

        let second = manager.create(request("rm"), 60_000, Some("dup".into()));
        assert!(matches!(manager.register(second.clone()), Err(Error::InvalidRequest(_))));
        assert!(matches!(
            manager.wait_for_decision(second).await,
            Err(Error::InvalidRequest(_))
        ));
        assert_eq!(manager.pending_count(), 1);
        assert_eq!(manager.snapshot("dup").unwrap().request.command, "ls");

        // The first waiter is untouched and still gets the decision
        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.wait("dup", first.expires_at_ms, rx).await })
        };
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!waiter.is_finished());
        assert!(manager.resolve("dup", ExecApprovalDecision::AllowOnce, None));
        assert_eq!(waiter.await.unwrap(), Some(ExecApprovalDecision::AllowOnce));

        // Free again once resolved
        let again = manager.create(request("ls"), 1_000, Some("dup".into()));
        assert!(manager.register(again).is_ok());
        assert!(manager.cancel("dup"));
        assert!(!manager.cancel("dup"));
    }

    #[test]
    fn unknown_id_is_not_resolved() {
        let manager = ExecApprovalManager::new();
        assert!(!manager.resolve("nope", ExecApprovalDecision::Deny, None));
    }

    #[test]
    fn create_generates_id_and_expiry() {
        let manager = ExecApprovalManager::new();
        let record = manager.create(request("ls"), 5_000, Some("  ".into()));
        assert!(!record.id.trim().is_empty());
        assert_eq!(record.expires_at_ms - record.created_at_ms, 5_000);
    }

    #[test]
    fn decision_wire_names() {
        assert_eq!(
            serde_json::to_value(ExecApprovalDecision::AllowAlways).unwrap(),
            serde_json::json!("allow-always")
        );
        let parsed: ExecApprovalDecision = serde_json::from_str("\"allow-once\"").unwrap();
        assert_eq!(parsed, ExecApprovalDecision::AllowOnce);
    }
}
