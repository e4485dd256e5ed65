//! Event Journal
//!
//! Produces the user-facing log stream. Every entry is emitted as a tracing
//! event, recorded in the bounded log history and published to observers as
//! a `log_update`. Transport is left to the [`EventPublisher`].

use std::sync::Arc;

use crate::application::ports::EventPublisher;
use crate::domain::buffer::BoundedEventBuffer;
use crate::domain::market_data::{LogEntry, LogLevel, SessionEvent};
use crate::infrastructure::metrics;

/// Structured session log backed by a bounded history.
pub struct EventJournal {
    entries: BoundedEventBuffer<LogEntry>,
    publisher: Arc<dyn EventPublisher>,
}

impl std::fmt::Debug for EventJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventJournal")
            .field("entries", &self.entries.len())
            .field("capacity", &self.entries.capacity())
            .finish_non_exhaustive()
    }
}

impl EventJournal {
    /// Create a journal keeping at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize, publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            entries: BoundedEventBuffer::new(capacity),
            publisher,
        }
    }

    /// Record an informational entry.
    pub fn info(&self, message: impl Into<String>) -> LogEntry {
        self.record(LogLevel::Info, message.into())
    }

    /// Record an error entry.
    pub fn error(&self, message: impl Into<String>) -> LogEntry {
        self.record(LogLevel::Error, message.into())
    }

    /// Record an entry at `level`.
    pub fn record(&self, level: LogLevel, message: String) -> LogEntry {
        match level {
            LogLevel::Info => tracing::info!(target: "session", "{message}"),
            LogLevel::Error => tracing::error!(target: "session", "{message}"),
        }

        let entry = LogEntry::now(level, message);
        self.entries.push(entry.clone());

        let event = SessionEvent::LogUpdate(entry.clone());
        let name = event.name();
        let reached = self.publisher.publish(event);
        metrics::record_event_published(name, reached);

        entry
    }

    /// Copy of the log history, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.entries.snapshot()
    }

    /// Number of retained entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the history is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use parking_lot::Mutex;

    use super::*;

    /// Publisher that records every event.
    #[derive(Debug, Default)]
    pub struct RecordingPublisher {
        pub events: Mutex<Vec<SessionEvent>>,
    }

    impl RecordingPublisher {
        pub fn names(&self) -> Vec<&'static str> {
            self.events.lock().iter().map(SessionEvent::name).collect()
        }
    }

    impl EventPublisher for RecordingPublisher {
        fn publish(&self, event: SessionEvent) -> usize {
            self.events.lock().push(event);
            1
        }
    }

    #[test]
    fn records_and_publishes_entry() {
        let publisher = Arc::new(RecordingPublisher::default());
        let journal = EventJournal::new(10, publisher.clone());

        let entry = journal.error("Error 502: Couldn't connect to TWS");

        assert_eq!(entry.level, LogLevel::Error);
        assert_eq!(journal.snapshot(), vec![entry.clone()]);
        assert_eq!(
            publisher.events.lock().as_slice(),
            &[SessionEvent::LogUpdate(entry)]
        );
    }

    #[test]
    fn history_is_bounded() {
        let publisher = Arc::new(RecordingPublisher::default());
        let journal = EventJournal::new(3, publisher.clone());

        for i in 0..5 {
            journal.info(format!("line {i}"));
        }

        let messages: Vec<_> = journal.snapshot().into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["line 2", "line 3", "line 4"]);
        // Every entry is published even when the history evicts it.
        assert_eq!(publisher.events.lock().len(), 5);
    }
}
