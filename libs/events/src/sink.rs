//! Event sinks.

use std::sync::Mutex;

use tracing::{info, warn};

use crate::{EventKind, EventLevel, SystemEvent};

/// Destination for system events. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: SystemEvent);
}

/// Renders events as structured log lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: SystemEvent) {
        let resource = event.resource.as_ref().map(ToString::to_string);
        match event.kind.level() {
            EventLevel::Warn => warn!(
                event = %event.kind,
                resource = resource.as_deref().unwrap_or(""),
                error = event.error.as_deref().unwrap_or(""),
                "System event"
            ),
            EventLevel::Info => info!(
                event = %event.kind,
                resource = resource.as_deref().unwrap_or(""),
                "System event"
            ),
        }
    }
}

/// Collects events in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<SystemEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything emitted so far.
    pub fn events(&self) -> Vec<SystemEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events().into_iter().map(|e| e.kind).collect()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events().iter().filter(|e| e.kind == kind).count()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: SystemEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_collects() {
        let sink = MemorySink::new();
        sink.emit(SystemEvent::new(EventKind::CreateNetwork));
        sink.emit(SystemEvent::new(EventKind::CreateVolume));
        sink.emit(SystemEvent::new(EventKind::CreateNetwork));
        assert_eq!(sink.count(EventKind::CreateNetwork), 2);
        assert_eq!(
            sink.kinds(),
            vec![
                EventKind::CreateNetwork,
                EventKind::CreateVolume,
                EventKind::CreateNetwork
            ]
        );
    }

    #[test]
    fn test_tracing_sink_does_not_panic_without_subscriber() {
        TracingSink.emit(SystemEvent::new(EventKind::DeleteImageError).with_error("boom"));
    }
}
