//! Per-connection state owned by the client: the configuration sent at setup, the message log,
//! and outstanding tool calls.

use crate::protocol::{FunctionCall, FunctionResponse, SessionConfig};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};

pub const DEFAULT_LOG_CAPACITY: usize = 500;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamingLogEntry {
    pub timestamp: DateTime<Utc>,
    /// e.g. `client.realtimeInput`, `server.toolCall`
    pub tag: String,
    pub message: String,
    /// Set when identical consecutive entries were collapsed into this one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
}

impl StreamingLogEntry {
    pub fn new(tag: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            tag: tag.into(),
            message: message.into(),
            count: None,
        }
    }

    pub fn repeats(&self) -> u32 {
        self.count.unwrap_or(1)
    }
}

/// Bounded append-only log. Identical consecutive entries collapse into a repeat count.
#[derive(Debug, Clone)]
pub struct SessionLog {
    entries: VecDeque<StreamingLogEntry>,
    capacity: usize,
}

impl SessionLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Appends `entry` and returns the entry as stored.
    pub fn push(&mut self, entry: StreamingLogEntry) -> &StreamingLogEntry {
        let repeat = self
            .entries
            .back()
            .map(|last| last.tag == entry.tag && last.message == entry.message)
            .unwrap_or(false);

        if !repeat {
            if self.entries.len() == self.capacity {
                self.entries.pop_front();
            }
            self.entries.push_back(entry);
        } else if let Some(last) = self.entries.back_mut() {
            last.count = Some(last.repeats() + 1);
        }

        // Non-empty after either branch.
        &self.entries[self.entries.len() - 1]
    }

    pub fn entries(&self) -> impl Iterator<Item = &StreamingLogEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for SessionLog {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

/// Call ids the service is still waiting on.
#[derive(Debug, Default)]
pub struct PendingCalls {
    outstanding: HashSet<String>,
}

impl PendingCalls {
    pub fn register(&mut self, calls: &[FunctionCall]) {
        self.outstanding
            .extend(calls.iter().map(|call| call.id.clone()));
    }

    /// Forget cancelled ids; returns how many were still outstanding.
    pub fn cancel(&mut self, ids: &[String]) -> usize {
        ids.iter().filter(|id| self.outstanding.remove(*id)).count()
    }

    /// Splits `responses` into those that may be sent and those that must not: unknown ids,
    /// cancelled ids, already answered ids and duplicates within the batch. Accepted ids stop
    /// being outstanding.
    pub fn accept(
        &mut self,
        responses: Vec<FunctionResponse>,
    ) -> (Vec<FunctionResponse>, Vec<FunctionResponse>) {
        responses
            .into_iter()
            .partition(|response| self.outstanding.remove(&response.id))
    }

    pub fn is_outstanding(&self, id: &str) -> bool {
        self.outstanding.contains(id)
    }

    pub fn len(&self) -> usize {
        self.outstanding.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outstanding.is_empty()
    }
}

/// Created when a connection opens and replaced by the next one.
#[derive(Debug, Default)]
pub struct Session {
    pub config: Option<SessionConfig>,
    pub log: SessionLog,
    pub pending: PendingCalls,
}

impl Session {
    pub fn new(config: SessionConfig, log_capacity: usize) -> Self {
        Self {
            config: Some(config),
            log: SessionLog::new(log_capacity),
            pending: PendingCalls::default(),
        }
    }
}
