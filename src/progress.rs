//! Progress reporting.
//!
//! Long-running operations take a `&mut dyn FnMut(Progress)` and call it
//! synchronously at each step boundary. Reports are advisory only.

/// One progress report: a completed fraction in `0.0..=1.0` and a message.
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub fraction: f64,
    pub message: String,
}

impl Progress {
    pub fn new(fraction: f64, message: impl Into<String>) -> Self {
        Self {
            fraction: fraction.clamp(0.0, 1.0),
            message: message.into(),
        }
    }
}

/// A progress sink that discards every report.
pub fn ignore(_: Progress) {}
