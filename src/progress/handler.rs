//! Progress handler trait and events

use std::time::Duration;

/// Events emitted while a discovery run progresses
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// Discovery started for a project
    Started { project: String, functions: usize },

    /// A shared development image is being built
    DevImageStarted { language: String },

    DevImageComplete {
        language: String,
        duration: Duration,
        success: bool,
    },

    /// Discovery of one function started
    FunctionStarted {
        function: String,
        index: usize,
        total: usize,
    },

    /// The function's discovery container is running
    ContainerStarted { function: String, container: String },

    /// The function's capture session closed cleanly
    FunctionComplete {
        function: String,
        resources: usize,
        triggers: usize,
        duration: Duration,
    },

    FunctionFailed { function: String, error: String },

    /// All functions were processed
    Completed {
        functions: usize,
        failures: usize,
        total_time: Duration,
    },

    /// The run was cancelled before it finished
    Cancelled,
}

/// Trait for handling progress events during discovery
pub trait ProgressHandler: Send + Sync {
    /// Called when a progress event occurs
    fn on_progress(&self, event: &ProgressEvent);
}

/// No-op handler that ignores all events
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpHandler;

impl ProgressHandler for NoOpHandler {
    fn on_progress(&self, _event: &ProgressEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingHandler {
        count: Arc<AtomicUsize>,
    }

    impl ProgressHandler for CountingHandler {
        fn on_progress(&self, _event: &ProgressEvent) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_progress_events() {
        let count = Arc::new(AtomicUsize::new(0));
        let handler = CountingHandler {
            count: count.clone(),
        };

        handler.on_progress(&ProgressEvent::Started {
            project: "shop".to_string(),
            functions: 2,
        });
        handler.on_progress(&ProgressEvent::FunctionStarted {
            function: "upload".to_string(),
            index: 1,
            total: 2,
        });
        handler.on_progress(&ProgressEvent::Completed {
            functions: 2,
            failures: 0,
            total_time: Duration::from_secs(5),
        });

        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_event_debug() {
        let event = ProgressEvent::DevImageStarted {
            language: "go".to_string(),
        };
        let debug_str = format!("{:?}", event);
        assert!(debug_str.contains("DevImageStarted"));
        assert!(debug_str.contains("go"));
    }
}
