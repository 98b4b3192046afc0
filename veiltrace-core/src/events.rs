//! Audit/event feed consumed by the submission front end.
//!
//! Events are emitted after an operation has committed. A failing sink is
//! logged and otherwise ignored: the feed observes state, it never vetoes it.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::{CorrelationId, Principal, SessionId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    SessionRecorded,
    SessionDeactivated,
    AnalystAssigned,
    PatternAnalyzed,
    PrivacyMetricsUpdated,
    AnomalyDetected,
    AnalystAuthorized,
    AnalystRevoked,
    DecryptionRequested,
    DecryptionFulfilled,
    DecryptionFailed,
}

/// What an event is about.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventRef {
    Subject(Principal),
    Session(SessionId),
    Request(CorrelationId),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RegistryEvent {
    pub kind: EventKind,
    pub reference: EventRef,
    pub principal: Principal,
    pub at_ms: u64,
}

impl RegistryEvent {
    pub fn new(kind: EventKind, reference: EventRef, principal: &Principal, at_ms: u64) -> Self {
        Self {
            kind,
            reference,
            principal: principal.clone(),
            at_ms,
        }
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: RegistryEvent) -> anyhow::Result<()>;
}

/// Drops every event.
#[derive(Clone, Debug, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: RegistryEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Keeps events in memory, in emission order.
#[derive(Clone, Debug, Default)]
pub struct MemoryEventSink {
    events: Arc<Mutex<Vec<RegistryEvent>>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RegistryEvent> {
        self.events.lock().clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().iter().map(|event| event.kind).collect()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| event.kind == kind)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: RegistryEvent) -> anyhow::Result<()> {
        self.events.lock().push(event);
        Ok(())
    }
}

/// Fan-out sink; stops at the first failing backend.
pub struct CompositeEventSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl CompositeEventSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for CompositeEventSink {
    fn emit(&self, event: RegistryEvent) -> anyhow::Result<()> {
        for sink in &self.sinks {
            sink.emit(event.clone())?;
        }
        Ok(())
    }
}
