use serde::Serialize;
use serde_json::Value;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TokenAllocated,
    TokenPreempted,
    TokenReallocated,
    TokenConfirmed,
    TokenCompleted,
    TokenCancelled,
    TokenNoshow,
    CapacityOverrideApplied,
    TokenDeadLettered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub kind: EventKind,
    pub token_id: String,
    pub correlation_id: String,
    pub severity: Severity,
    pub metadata: Value,
}

/// Sink for domain events, decoupled from whatever the host actually does
/// with them (write to an audit log, publish to a queue, page someone on
/// `Severity::High`). `AllocationEngine` only ever calls `emit`; it never
/// inspects what happens downstream.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// Default sink: structured log line, nothing else. Good enough for tests
/// and a host that hasn't wired anything fancier yet.
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: Event) {
        info!(
            kind = ?event.kind,
            token_id = %event.token_id,
            correlation_id = %event.correlation_id,
            severity = ?event.severity,
            "domain event"
        );
    }
}
