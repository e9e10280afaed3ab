//! Progress reporting.
//!
//! The engine drives a caller-supplied sink through a small event sequence
//! during long-running operations (flashing, erasing, reading back).
//! Nothing here decides *how* progress is shown; that is the embedding
//! application's job, exactly as [`crate::transport::Transport`] leaves the
//! serial driver to the caller.

/// Receives progress events from the engine during a flash/erase/read
/// operation.
pub trait ProgressSink {
    /// Called once at the start of an operation, naming it.
    fn on_start(&mut self, label: &str, total: usize);

    /// Called as the operation advances, with completion as a percentage
    /// in `0.0..=100.0`.
    fn on_progress(&mut self, percent: f32);

    /// Called once when the operation completes (successfully or not).
    fn on_end(&mut self);

    /// Called for informational messages that aren't progress updates
    /// (e.g. "using flash stub").
    fn on_info(&mut self, message: &str);
}

/// A [`ProgressSink`] that discards every event; the default when a caller
/// has no UI to drive.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn on_start(&mut self, _label: &str, _total: usize) {}
    fn on_progress(&mut self, _percent: f32) {}
    fn on_end(&mut self) {}
    fn on_info(&mut self, _message: &str) {}
}
