//! Trace sink for observability events
//!
//! Emission is fire-and-forget: a sink must never block or fail the
//! pipeline, so `emit` is synchronous and infallible from the caller's
//! point of view.

use crate::models::TraceEvent;
use std::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

pub trait TraceSink: Send + Sync {
    fn emit(&self, job_id: Uuid, event: TraceEvent);
}

/// Sink that forwards events to the `tracing` subscriber. Used by both
/// binaries as the default.
#[derive(Debug, Default)]
pub struct LogTraceSink;

impl TraceSink for LogTraceSink {
    fn emit(&self, job_id: Uuid, event: TraceEvent) {
        debug!(
            job_id = %job_id,
            kind = ?event.kind,
            stage = ?event.stage,
            tool = ?event.tool,
            "{}",
            event.summary
        );
    }
}

/// Sink that drops everything.
#[derive(Debug, Default)]
pub struct NullTraceSink;

impl TraceSink for NullTraceSink {
    fn emit(&self, _job_id: Uuid, _event: TraceEvent) {}
}

/// Sink that records events in memory, for tests and job inspection.
#[derive(Debug, Default)]
pub struct MemoryTraceSink {
    events: Mutex<Vec<(Uuid, TraceEvent)>>,
}

impl MemoryTraceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(Uuid, TraceEvent)> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn events_for(&self, job_id: Uuid) -> Vec<TraceEvent> {
        self.events()
            .into_iter()
            .filter(|(id, _)| *id == job_id)
            .map(|(_, event)| event)
            .collect()
    }
}

impl TraceSink for MemoryTraceSink {
    fn emit(&self, job_id: Uuid, event: TraceEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push((job_id, event));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{StageName, TraceEventKind};

    #[test]
    fn memory_sink_records_per_job() {
        let sink = MemoryTraceSink::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        sink.emit(a, TraceEvent::job(TraceEventKind::JobStarted, "start"));
        sink.emit(
            a,
            TraceEvent::stage(TraceEventKind::StageStarted, StageName::Plan, "plan"),
        );
        sink.emit(b, TraceEvent::job(TraceEventKind::JobStarted, "start"));

        assert_eq!(sink.events_for(a).len(), 2);
        assert_eq!(sink.events_for(b).len(), 1);
        assert_eq!(sink.events_for(a)[1].kind, TraceEventKind::StageStarted);
    }
}
