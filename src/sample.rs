//! Heart-rate sample decoded from a band's advertisement.

use chrono::{DateTime, Local};

/// A heart-rate reading broadcast by a band.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartRateSample {
    /// Local wall-clock time the advertisement was decoded
    pub timestamp: DateTime<Local>,
    /// Address of the band
    pub address: String,
    /// Received signal strength in dBm
    pub rssi: i16,
    /// Heart rate in beats per minute
    pub heart_rate: u8,
}
