//! Output formatters for heart-rate samples.

pub mod text;

use crate::sample::HeartRateSample;

/// Trait for formatting samples into output lines.
pub trait OutputFormatter: Send + Sync {
    /// Format a sample as a single line, without the trailing newline.
    fn format(&self, sample: &HeartRateSample) -> String;
}
