//! Core application runner (business logic) for `miband-listener`.
//!
//! This module is intentionally decoupled from CLI parsing and process exit codes
//! so it can be tested deterministically.

use crate::decoder::Decoder;
use crate::output::OutputFormatter;
use crate::output::text::TextFormatter;
use crate::scanner::{Backend, Scan, ScanConfig, ScanError};
use clap::Parser;
use std::future::Future;
use std::io;
use std::io::Write;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Configuration for the core run loop.
#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Options {
    /// Bluetooth scanner backend to use
    #[arg(long, default_value_t, value_enum)]
    pub backend: Backend,

    /// Adapter to scan with, e.g. hci1. Defaults to the system default adapter.
    #[arg(long, value_name = "NAME")]
    pub adapter: Option<String>,

    /// Duration of each scan.
    /// Accepts duration with suffix: 2s, 500ms, 1m.
    /// Without suffix, value is interpreted as seconds.
    #[arg(long, default_value = "2s", value_parser = crate::duration::parse_scan_window)]
    pub window: Duration,

    /// Idle time between scans, same format as --window
    #[arg(long, default_value = "1s", value_parser = crate::duration::parse_duration)]
    pub pause: Duration,

    /// Expected first two bytes of the manufacturer data, in hex
    #[arg(long, default_value = "5701", value_parser = crate::decoder::parse_company_id)]
    pub company_id: u16,

    /// Verbose output, log scanner activity
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

impl Options {
    /// Scan settings derived from the command line.
    pub fn scan_config(&self) -> ScanConfig {
        ScanConfig {
            adapter: self.adapter.clone(),
            window: self.window,
            pause: self.pause,
        }
    }
}

/// Errors returned by the core run loop.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Scanner abstraction to enable deterministic unit tests without Bluetooth hardware.
pub trait Scanner: Send + Sync {
    fn start_scan(
        &self,
        backend: Backend,
        config: ScanConfig,
    ) -> Pin<Box<dyn Future<Output = Result<Scan, ScanError>> + Send + '_>>;
}

/// Real scanner implementation that delegates to the compiled-in backends.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealScanner;

impl Scanner for RealScanner {
    fn start_scan(
        &self,
        backend: Backend,
        config: ScanConfig,
    ) -> Pin<Box<dyn Future<Output = Result<Scan, ScanError>> + Send + '_>> {
        Box::pin(async move { crate::scanner::start_scan(backend, config).await })
    }
}

/// Run the core processing loop, writing samples to `out` and decode warnings to `err`.
///
/// - Every advertisement is passed to the decoder; samples are formatted and written to `out`.
/// - Decode errors are written to `err` and the advertisement is skipped.
/// - A scan failure ends the loop with an error.
/// - When `shutdown` completes, the scan is stopped, a notice is written to `out`
///   and the loop ends cleanly. This also applies while the scanner is starting.
pub async fn run_with_io(
    options: Options,
    scanner: &dyn Scanner,
    out: &mut dyn Write,
    err: &mut dyn Write,
    shutdown: impl Future<Output = ()>,
) -> Result<(), RunError> {
    let decoder = Decoder::new(options.company_id);
    let formatter = TextFormatter;

    writeln!(out, "Starting scan")?;
    out.flush()?;

    tokio::pin!(shutdown);

    let started = tokio::select! {
        biased;
        _ = &mut shutdown => None,
        scan = scanner.start_scan(options.backend, options.scan_config()) => Some(scan?),
    };

    let Some(mut scan) = started else {
        log::info!("Interrupted while starting scan");
        writeln!(out, "Stopped scanning.")?;
        return Ok(());
    };

    loop {
        let result = tokio::select! {
            _ = &mut shutdown => {
                log::info!("Interrupted, stopping scan");
                scan.stop().await;
                writeln!(out, "Stopped scanning.")?;
                return Ok(());
            }
            result = scan.recv() => result,
        };

        let Some(result) = result else {
            break;
        };

        match decoder.decode(&result?) {
            Ok(Some(sample)) => {
                writeln!(out, "{}", formatter.format(&sample))?;
                out.flush()?;
            }
            Ok(None) => {}
            Err(decode_err) => writeln!(err, "warning: {decode_err}")?,
        }
    }

    Ok(())
}
