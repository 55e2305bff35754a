//! Logging-based progress handler

use super::{ProgressEvent, ProgressHandler};
use tracing::{debug, info, warn};

/// Handler that logs progress events using tracing
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

impl ProgressHandler for LoggingHandler {
    fn on_progress(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::Started { project, functions } => {
                info!(project = %project, functions, "Starting discovery");
            }
            ProgressEvent::DevImageStarted { language } => {
                info!(language = %language, "Building development image");
            }
            ProgressEvent::DevImageComplete {
                language,
                duration,
                success,
            } => {
                if *success {
                    info!(
                        language = %language,
                        duration_ms = duration.as_millis(),
                        "Development image ready"
                    );
                } else {
                    warn!(language = %language, "Development image build failed");
                }
            }
            ProgressEvent::FunctionStarted {
                function,
                index,
                total,
            } => {
                info!(
                    function = %function,
                    progress = format!("{}/{}", index, total),
                    "Discovering function"
                );
            }
            ProgressEvent::ContainerStarted {
                function,
                container,
            } => {
                debug!(function = %function, container = %container, "Container started");
            }
            ProgressEvent::FunctionComplete {
                function,
                resources,
                triggers,
                duration,
            } => {
                info!(
                    function = %function,
                    resources,
                    triggers,
                    duration_ms = duration.as_millis(),
                    "Function discovered"
                );
            }
            ProgressEvent::FunctionFailed { function, error } => {
                warn!(function = %function, error = %error, "Function discovery failed");
            }
            ProgressEvent::Completed {
                functions,
                failures,
                total_time,
            } => {
                if *failures > 0 {
                    warn!(
                        functions,
                        failures,
                        total_time_ms = total_time.as_millis(),
                        "Discovery finished with failures"
                    );
                } else {
                    info!(
                        functions,
                        total_time_ms = total_time.as_millis(),
                        "Discovery complete"
                    );
                }
            }
            ProgressEvent::Cancelled => {
                warn!("Discovery cancelled");
            }
        }
    }
}
