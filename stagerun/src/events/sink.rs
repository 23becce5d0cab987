//! Event sink trait and implementations.

use super::RunEvent;
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, error, info, warn, Level};

/// Receives run events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Delivers an event.
    async fn emit(&self, event: &RunEvent);

    /// Delivers an event without waiting. Must never panic.
    fn try_emit(&self, event: &RunEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event: &RunEvent) {}

    fn try_emit(&self, _event: &RunEvent) {}
}

/// Logs events through `tracing`.
///
/// Failures are always logged at `error` and retries at `warn`; every other
/// event uses the configured level.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a sink logging routine events at `level`.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    fn log_event(&self, event: &RunEvent) {
        let event_type = event.event_type();
        match event {
            RunEvent::Failed {
                fqname,
                excerpt,
                error_path,
            } => error!(
                event_type,
                fqname = %fqname,
                error_path = %error_path.display(),
                "{fqname} failed:\n{excerpt}"
            ),
            RunEvent::Retrying {
                fqname,
                remaining,
                excerpt,
            } => warn!(
                event_type,
                fqname = %fqname,
                remaining,
                "{fqname} failed with a transient error, retrying:\n{excerpt}"
            ),
            RunEvent::StateChanged { fqname, from, to } if self.level == Level::DEBUG => debug!(
                event_type,
                fqname = %fqname,
                from = ?from,
                to = ?to,
                "state changed"
            ),
            RunEvent::StateChanged { fqname, from, to } => info!(
                event_type,
                fqname = %fqname,
                from = ?from,
                to = ?to,
                "state changed"
            ),
            RunEvent::VolatileDataRemoved { count, size } => info!(
                event_type,
                count,
                size,
                "volatile data removed"
            ),
            RunEvent::RunFinished { name, state } => info!(
                event_type,
                name = %name,
                state = ?state,
                "run finished"
            ),
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event: &RunEvent) {
        self.log_event(event);
    }

    fn try_emit(&self, event: &RunEvent) {
        self.log_event(event);
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<RunEvent>>,
}

impl CollectingEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All events so far.
    #[must_use]
    pub fn events(&self) -> Vec<RunEvent> {
        self.events.read().clone()
    }

    /// Number of events so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if nothing was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Events with the given dotted type.
    #[must_use]
    pub fn events_of_type(&self, event_type: &str) -> Vec<RunEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event: &RunEvent) {
        self.try_emit(event);
    }

    fn try_emit(&self, event: &RunEvent) {
        self.events.write().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::JobState;

    fn finished() -> RunEvent {
        RunEvent::RunFinished {
            name: "p".into(),
            state: JobState::Complete,
        }
    }

    #[tokio::test]
    async fn test_noop_and_logging_sinks_accept_events() {
        NoOpEventSink.emit(&finished()).await;
        let sink = LoggingEventSink::new(Level::DEBUG);
        sink.emit(&finished()).await;
        sink.try_emit(&RunEvent::Failed {
            fqname: "p.S".into(),
            excerpt: "boom".into(),
            error_path: "/tmp/_errors".into(),
        });
    }

    #[tokio::test]
    async fn test_collecting_sink() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());
        sink.emit(&finished()).await;
        sink.try_emit(&RunEvent::VolatileDataRemoved { count: 1, size: 2 });
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.events_of_type("run.finished"), vec![finished()]);
    }
}
