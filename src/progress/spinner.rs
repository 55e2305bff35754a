//! Terminal spinner for interactive runs

use super::{ProgressEvent, ProgressHandler};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Shows a spinner on stderr describing the function currently being discovered
pub struct SpinnerHandler {
    bar: ProgressBar,
}

impl SpinnerHandler {
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner} {msg} [{elapsed}]") {
            bar.set_style(style);
        }
        bar.enable_steady_tick(Duration::from_millis(120));
        Self { bar }
    }

    /// Removes the spinner from the terminal
    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl Default for SpinnerHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressHandler for SpinnerHandler {
    fn on_progress(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::Started { project, functions } => {
                self.bar
                    .set_message(format!("Discovering {} ({} functions)", project, functions));
            }
            ProgressEvent::DevImageStarted { language } => {
                self.bar
                    .set_message(format!("Building {} development image", language));
            }
            ProgressEvent::FunctionStarted {
                function,
                index,
                total,
            } => {
                self.bar
                    .set_message(format!("[{}/{}] {}", index, total, function));
            }
            ProgressEvent::FunctionFailed { function, error } => {
                self.bar.println(format!("✗ {}: {}", function, error));
            }
            ProgressEvent::FunctionComplete { function, .. } => {
                self.bar.println(format!("✓ {}", function));
            }
            ProgressEvent::Completed { .. } | ProgressEvent::Cancelled => {
                self.bar.finish_and_clear();
            }
            ProgressEvent::DevImageComplete { .. } | ProgressEvent::ContainerStarted { .. } => {}
        }
    }
}
