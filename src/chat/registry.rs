//! Per-session run queue

use std::collections::{HashMap, VecDeque};

/// One queued run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRunQueueEntry {
    pub session_key: String,
    pub client_run_id: String,
}

/// Runs in arrival order, grouped by session id
#[derive(Debug, Default)]
pub struct ChatRunRegistry {
    queues: HashMap<String, VecDeque<ChatRunQueueEntry>>,
}

impl ChatRunRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, session_id: &str, entry: ChatRunQueueEntry) {
        self.queues
            .entry(session_id.to_string())
            .or_default()
            .push_back(entry);
    }

    /// Oldest run of a session
    #[must_use]
    pub fn peek(&self, session_id: &str) -> Option<&ChatRunQueueEntry> {
        self.queues.get(session_id).and_then(VecDeque::front)
    }

    /// Pop the oldest run of a session
    pub fn shift(&mut self, session_id: &str) -> Option<ChatRunQueueEntry> {
        let queue = self.queues.get_mut(session_id)?;
        let entry = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(session_id);
        }
        entry
    }

    /// Remove a specific run, optionally requiring its session key to match
    pub fn remove(
        &mut self,
        session_id: &str,
        client_run_id: &str,
        session_key: Option<&str>,
    ) -> Option<ChatRunQueueEntry> {
        let queue = self.queues.get_mut(session_id)?;
        let idx = queue.iter().position(|e| {
            e.client_run_id == client_run_id && session_key.is_none_or(|k| e.session_key == k)
        })?;
        let entry = queue.remove(idx);
        if queue.is_empty() {
            self.queues.remove(session_id);
        }
        entry
    }

    #[must_use]
    pub fn len(&self, session_id: &str) -> usize {
        self.queues.get(session_id).map_or(0, VecDeque::len)
    }

    pub fn clear(&mut self) {
        self.queues.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(run: &str) -> ChatRunQueueEntry {
        ChatRunQueueEntry {
            session_key: "main".to_string(),
            client_run_id: run.to_string(),
        }
    }

    #[test]
    fn fifo_per_session() {
        let mut reg = ChatRunRegistry::new();
        reg.add("s1", entry("r1"));
        reg.add("s1", entry("r2"));
        reg.add("s2", entry("r3"));

        assert_eq!(reg.peek("s1").unwrap().client_run_id, "r1");
        assert_eq!(reg.shift("s1").unwrap().client_run_id, "r1");
        assert_eq!(reg.shift("s1").unwrap().client_run_id, "r2");
        assert!(reg.shift("s1").is_none());
        assert_eq!(reg.len("s2"), 1);
    }

    #[test]
    fn remove_checks_session_key() {
        let mut reg = ChatRunRegistry::new();
        reg.add("s1", entry("r1"));
        reg.add("s1", entry("r2"));

        assert!(reg.remove("s1", "r2", Some("other")).is_none());
        assert_eq!(reg.remove("s1", "r2", Some("main")).unwrap().client_run_id, "r2");
        assert!(reg.remove("s1", "r1", None).is_some());
        assert_eq!(reg.len("s1"), 0);
    }

    #[test]
    fn clear_empties_everything() {
        let mut reg = ChatRunRegistry::new();
        reg.add("s1", entry("r1"));
        reg.clear();
        assert!(reg.peek("s1").is_none());
    }
}
