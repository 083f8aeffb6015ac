//! Progress reporting for long-running flash operations.

use indicatif::{ProgressBar, ProgressStyle};

/// Callbacks a caller can use to observe the progress of an erase/write
/// pass without coupling the core to any particular UI.
pub trait ProgressSink {
    /// Called once before the first `update`, with the total amount of work.
    fn init(&mut self, label: &str, total: u64);
    /// Called as work completes, with the cumulative amount done so far.
    fn update(&mut self, current: u64);
    /// Called once after the last `update`.
    fn finish(&mut self);
}

/// Discards all progress events. Used in tests and for non-interactive runs.
#[derive(Debug, Default)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn init(&mut self, _label: &str, _total: u64) {}
    fn update(&mut self, _current: u64) {}
    fn finish(&mut self) {}
}

/// Renders an `indicatif` bar to the terminal.
pub struct IndicatifProgress {
    bar: Option<ProgressBar>,
}

impl Default for IndicatifProgress {
    fn default() -> Self {
        Self { bar: None }
    }
}

impl ProgressSink for IndicatifProgress {
    fn init(&mut self, label: &str, total: u64) {
        let bar = ProgressBar::new(total);
        bar.set_style(
            ProgressStyle::with_template(
                "{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
        );
        bar.set_message(label.to_string());
        self.bar = Some(bar);
    }

    fn update(&mut self, current: u64) {
        if let Some(bar) = &self.bar {
            bar.set_position(current);
        }
    }

    fn finish(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}
