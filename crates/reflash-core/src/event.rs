//! Progress and info events for long-running operations

use tokio::sync::mpsc;
use tracing::{debug, info};

/// Event emitted to the caller while an operation runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReflashEvent {
    /// Completion percentage, strictly increasing within one operation
    Progress(u8),
    /// Human-readable status line
    Info(String),
}

/// Where operations report their events
///
/// Events are mirrored to `tracing`. A sink without a receiver only logs.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<ReflashEvent>>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<ReflashEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Sink that only logs
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Create a sink together with its receiving end
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ReflashEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn info(&self, message: impl Into<String>) {
        let message = message.into();
        info!("{}", message);
        self.emit(ReflashEvent::Info(message));
    }

    /// Start tracking progress over `total` units of work
    pub fn progress(&self, total: u64) -> ProgressTracker {
        ProgressTracker {
            sink: self.clone(),
            total,
            last: None,
        }
    }

    fn emit(&self, event: ReflashEvent) {
        if let Some(tx) = &self.tx {
            // A dropped receiver only means nobody is listening
            let _ = tx.send(event);
        }
    }
}

/// Turns a running byte count into percentage events
///
/// A percentage is only emitted when it is higher than the last one, so a
/// count that moves backwards (a partition being rewritten) stays silent
/// until it overtakes the previous high-water mark.
#[derive(Debug)]
pub struct ProgressTracker {
    sink: EventSink,
    total: u64,
    last: Option<u8>,
}

impl ProgressTracker {
    pub fn update(&mut self, done: u64) {
        let percent = if self.total == 0 {
            100
        } else {
            (done.min(self.total) * 100 / self.total) as u8
        };

        if self.last.map_or(true, |last| percent > last) {
            self.last = Some(percent);
            debug!(percent, done, total = self.total, "Progress");
            self.sink.emit(ReflashEvent::Progress(percent));
        }
    }

    /// Mark the whole range as done
    pub fn finish(&mut self) {
        self.update(self.total);
    }

    /// Highest percentage reported so far
    pub fn last(&self) -> Option<u8> {
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn drain(rx: &mut mpsc::UnboundedReceiver<ReflashEvent>) -> Vec<ReflashEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_progress_never_regresses_or_repeats() {
        let (sink, mut rx) = EventSink::channel();
        let mut progress = sink.progress(1000);

        for done in [0, 5, 10, 500, 300, 500, 999, 1000, 1000] {
            progress.update(done);
        }

        assert_eq!(
            drain(&mut rx),
            vec![
                ReflashEvent::Progress(0),
                ReflashEvent::Progress(1),
                ReflashEvent::Progress(50),
                ReflashEvent::Progress(99),
                ReflashEvent::Progress(100),
            ]
        );
    }

    #[test]
    fn test_empty_range_is_complete() {
        let (sink, mut rx) = EventSink::channel();
        let mut progress = sink.progress(0);
        progress.update(0);

        assert_eq!(progress.last(), Some(100));
        assert_eq!(drain(&mut rx), vec![ReflashEvent::Progress(100)]);
    }

    #[test]
    fn test_info_keeps_order_and_survives_dropped_receiver() {
        let (sink, mut rx) = EventSink::channel();
        sink.info("first");
        sink.info(String::from("second"));
        assert_eq!(
            drain(&mut rx),
            vec![
                ReflashEvent::Info("first".into()),
                ReflashEvent::Info("second".into())
            ]
        );

        drop(rx);
        sink.info("nobody listening");
        EventSink::disabled().progress(10).finish();
    }
}
