//! EventSink port - where worker events (and so task outcomes) go.
//!
//! The worker logs every event itself; a sink is for whoever else needs them.
//! Default: `NoopEventSink`. Tests use `impls::MemoryEventSink`.

use crate::domain::WorkerEvent;

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &WorkerEvent);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: &WorkerEvent) {}
}
