//! Lifecycle audit hooks for the view-model stack.
//!
//! Records capture a stage plus structured details so callers can buffer or
//! inspect what the stack did without parsing log output.

use std::sync::Mutex;
use std::time::SystemTime;

use serde_json::Value;

/// Distinct checkpoints emitted by the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackAuditStage {
    /// A parameters type was mapped to a view-model factory.
    MappingRegistered,
    /// A view-model was constructed and appended.
    EntryOpened,
    /// Opening failed (unmapped type or factory error).
    OpenFailed,
    /// A veto callback refused the close.
    CloseVetoed,
    /// An entry was removed from the collection.
    EntryClosed,
    /// The collection transitioned to empty.
    StackEmptied,
    /// Update callbacks ran for every entry.
    UpdatePass,
    /// Queued reentrant actions were replayed.
    DeferredFlushed,
    /// A removal that finished on the spawner failed.
    Fault,
    /// Forced teardown completed.
    StackDisposed,
}

/// Structured audit entry.
#[derive(Debug, Clone)]
pub struct StackAuditEvent {
    pub timestamp: SystemTime,
    pub stage: StackAuditStage,
    pub details: Vec<(String, Value)>,
}

impl StackAuditEvent {
    fn new(stage: StackAuditStage) -> Self {
        Self {
            timestamp: SystemTime::now(),
            stage,
            details: Vec::new(),
        }
    }

    pub fn detail(&self, key: &str) -> Option<&Value> {
        self.details
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value)
    }
}

pub struct StackAuditEventBuilder {
    event: StackAuditEvent,
}

impl StackAuditEventBuilder {
    pub fn new(stage: StackAuditStage) -> Self {
        Self {
            event: StackAuditEvent::new(stage),
        }
    }

    pub fn detail(mut self, key: impl Into<String>, value: Value) -> Self {
        self.event.details.push((key.into(), value));
        self
    }

    pub fn finish(self) -> StackAuditEvent {
        self.event
    }
}

pub trait StackAudit: Send + Sync {
    fn record(&self, event: StackAuditEvent);
}

/// Default no-op implementation used when auditing is disabled.
#[derive(Debug, Default)]
pub struct NullStackAudit;

impl StackAudit for NullStackAudit {
    fn record(&self, _event: StackAuditEvent) {}
}

/// Buffers every event in memory.
#[derive(Debug, Default)]
pub struct RecordingStackAudit {
    events: Mutex<Vec<StackAuditEvent>>,
}

impl RecordingStackAudit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<StackAuditEvent> {
        self.events
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn stages(&self) -> Vec<StackAuditStage> {
        self.events().into_iter().map(|event| event.stage).collect()
    }

    pub fn count(&self, stage: StackAuditStage) -> usize {
        self.events()
            .iter()
            .filter(|event| event.stage == stage)
            .count()
    }
}

impl StackAudit for RecordingStackAudit {
    fn record(&self, event: StackAuditEvent) {
        if let Ok(mut guard) = self.events.lock() {
            guard.push(event);
        }
    }
}
