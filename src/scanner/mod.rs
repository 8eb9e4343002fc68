//! Windowed BLE scanning.
//!
//! A backend scans for a fixed window, idles for a pause and starts over,
//! until the receiving side goes away. Every advertisement it sees during a
//! window is forwarded through a channel as an [`Advertisement`]; decoding is
//! left to the caller.

#[cfg(feature = "bluer")]
pub mod bluer;

#[cfg(feature = "hci")]
pub mod hci;

use crate::advertisement::Advertisement;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Error type for scanner operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScanError {
    /// Bluetooth/adapter related error
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
    /// Adapter name that the backend cannot use
    #[error("Invalid adapter: {0}")]
    InvalidAdapter(String),
}

/// Advertisement seen during a scan window, or the failure that ended the scan.
pub type ScanResult = Result<Advertisement, ScanError>;

/// Channel buffer size for scan results.
pub const ADVERTISEMENT_CHANNEL_BUFFER_SIZE: usize = 100;

/// How long a single scan runs.
pub const DEFAULT_SCAN_WINDOW: Duration = Duration::from_secs(2);

/// Idle time between two scans.
pub const DEFAULT_SCAN_PAUSE: Duration = Duration::from_secs(1);

/// How long [`Scan::stop`] waits for a backend to release the adapter.
pub const SCAN_STOP_TIMEOUT: Duration = Duration::from_secs(3);

/// A running scan: the channel it reports through and the task feeding it.
#[derive(Debug)]
pub struct Scan {
    events: mpsc::Receiver<ScanResult>,
    task: Option<JoinHandle<()>>,
}

impl Scan {
    pub fn new(events: mpsc::Receiver<ScanResult>, task: JoinHandle<()>) -> Self {
        Self {
            events,
            task: Some(task),
        }
    }

    /// Scan with no task to wait for on stop.
    pub fn from_receiver(events: mpsc::Receiver<ScanResult>) -> Self {
        Self { events, task: None }
    }

    /// Next advertisement, or `None` once the backend has finished.
    pub async fn recv(&mut self) -> Option<ScanResult> {
        self.events.recv().await
    }

    /// Stop scanning and wait for the backend to shut the radio down.
    ///
    /// Closing the channel tells the backend to end its current window; the
    /// HCI backend disables LE scanning on the controller before returning.
    pub async fn stop(self) {
        let Scan { events, task } = self;
        drop(events);

        if let Some(task) = task
            && tokio::time::timeout(SCAN_STOP_TIMEOUT, task).await.is_err()
        {
            log::warn!("Scanner did not stop within {SCAN_STOP_TIMEOUT:?}");
        }
    }
}

/// Idle between two windows.
///
/// Returns `false` if the receiver was dropped in the meantime.
pub(crate) async fn pause(duration: Duration, tx: &mpsc::Sender<ScanResult>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = tx.closed() => false,
    }
}

/// Available scanner backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    /// BlueZ D-Bus backend (requires bluetoothd daemon)
    #[cfg(feature = "bluer")]
    Bluer,
    /// Raw HCI socket backend (direct kernel access, no daemon required)
    #[cfg(feature = "hci")]
    Hci,
}

impl Default for Backend {
    fn default() -> Self {
        #[cfg(feature = "bluer")]
        return Backend::Bluer;
        #[cfg(all(feature = "hci", not(feature = "bluer")))]
        return Backend::Hci;
        #[cfg(not(any(feature = "bluer", feature = "hci")))]
        compile_error!("At least one backend feature must be enabled");
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(feature = "bluer")]
            Backend::Bluer => write!(f, "bluer"),
            #[cfg(feature = "hci")]
            Backend::Hci => write!(f, "hci"),
        }
    }
}

/// Scan timing and adapter selection shared by all backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanConfig {
    /// Adapter to scan with, e.g. "hci1". `None` uses the default adapter.
    pub adapter: Option<String>,
    /// Duration of one scan
    pub window: Duration,
    /// Idle time between scans
    pub pause: Duration,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            adapter: None,
            window: DEFAULT_SCAN_WINDOW,
            pause: DEFAULT_SCAN_PAUSE,
        }
    }
}

/// Start scanning with the specified backend.
///
/// Adapter setup happens before this returns, so a missing adapter or
/// insufficient permissions surface here. Failures after that arrive through
/// the channel as the last item before it closes.
pub async fn start_scan(backend: Backend, config: ScanConfig) -> Result<Scan, ScanError> {
    log::info!(
        "Starting {backend} scan: window {:?}, pause {:?}",
        config.window,
        config.pause
    );

    match backend {
        #[cfg(feature = "bluer")]
        Backend::Bluer => bluer::start_scan(config).await,
        #[cfg(feature = "hci")]
        Backend::Hci => hci::start_scan(config).await,
    }
}
