//! `miband-listener` library.
//!
//! The binary (`src/main.rs`) is responsible for CLI parsing, logging setup and
//! process exit codes. The core “business logic” lives in [`crate::app`] where it
//! can be tested deterministically with an injected scanner and output streams.

pub mod advertisement;
pub mod app;
pub mod decoder;
pub mod duration;
pub mod output;
pub mod sample;
pub mod scanner;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types at the crate root
pub use advertisement::{AdField, Advertisement};
pub use decoder::{DecodeError, Decoder, parse_company_id};
pub use duration::{parse_duration, parse_scan_window};
pub use output::OutputFormatter;
pub use output::text::TextFormatter;
pub use sample::HeartRateSample;
pub use scanner::{Backend, Scan, ScanConfig, ScanError, ScanResult};
