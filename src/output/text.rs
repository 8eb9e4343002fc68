//! Plain text output, one line per sample.

use crate::output::OutputFormatter;
use crate::sample::HeartRateSample;

/// Timestamp layout used in output lines.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Formats samples as `<timestamp> - <address> (<rssi>dBm) Heart Rate: <value>`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextFormatter;

impl OutputFormatter for TextFormatter {
    fn format(&self, sample: &HeartRateSample) -> String {
        format!(
            "{} - {} ({}dBm) Heart Rate: {}",
            sample.timestamp.format(TIMESTAMP_FORMAT),
            sample.address,
            sample.rssi,
            sample.heart_rate
        )
    }
}
