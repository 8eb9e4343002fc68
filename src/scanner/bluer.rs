//! BlueZ D-Bus backend.
//!
//! This backend uses the `bluer` crate to communicate with the BlueZ daemon
//! via D-Bus. It requires the `bluetoothd` daemon to be running.

use super::{ADVERTISEMENT_CHANNEL_BUFFER_SIZE, Scan, ScanConfig, ScanError, ScanResult, pause};
use crate::advertisement::{AD_TYPE_COMPLETE_LOCAL_NAME, AdField, Advertisement, format_address};
use bluer::{Adapter, AdapterEvent, Address, DiscoveryFilter, DiscoveryTransport, Session};
use futures::{StreamExt, pin_mut};
use std::time::Duration;
use tokio::sync::mpsc;

impl From<bluer::Error> for ScanError {
    fn from(err: bluer::Error) -> Self {
        ScanError::Bluetooth(err.to_string())
    }
}

/// Start windowed discovery on a BlueZ adapter.
///
/// Powers the adapter on and restricts discovery to LE with duplicate
/// reporting enabled, so every new advertisement of a known device is seen.
pub async fn start_scan(config: ScanConfig) -> Result<Scan, ScanError> {
    let session = Session::new().await?;
    let adapter = match config.adapter.as_deref() {
        Some(name) => session.adapter(name)?,
        None => session.default_adapter().await?,
    };
    log::info!("Using adapter {}", adapter.name());
    adapter.set_powered(true).await?;

    adapter
        .set_discovery_filter(DiscoveryFilter {
            transport: DiscoveryTransport::Le,
            duplicate_data: true,
            ..Default::default()
        })
        .await?;

    let (tx, rx) = mpsc::channel(ADVERTISEMENT_CHANNEL_BUFFER_SIZE);

    // The task owns the session; dropping it would end discovery
    let task = tokio::spawn(async move {
        let _session = session;

        loop {
            match scan_window(&adapter, config.window, &tx).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    break;
                }
            }
            if !pause(config.pause, &tx).await {
                break;
            }
        }
        log::debug!("BlueZ discovery stopped");
    });

    Ok(Scan::new(rx, task))
}

/// Run discovery for one window and forward what it reports.
///
/// Returns `Ok(false)` once the receiver has been dropped. Discovery stops
/// when the event stream is dropped on return.
async fn scan_window(
    adapter: &Adapter,
    window: Duration,
    tx: &mpsc::Sender<ScanResult>,
) -> Result<bool, ScanError> {
    log::debug!("Discovery window of {window:?} on {}", adapter.name());

    // Discovery runs while the stream is alive
    let events = adapter.discover_devices_with_changes().await?;
    pin_mut!(events);

    let deadline = tokio::time::sleep(window);
    tokio::pin!(deadline);

    loop {
        let event = tokio::select! {
            _ = &mut deadline => return Ok(true),
            _ = tx.closed() => return Ok(false),
            event = events.next() => event,
        };

        match event {
            Some(AdapterEvent::DeviceAdded(address)) => {
                match read_advertisement(adapter, address).await {
                    Ok(Some(adv)) => {
                        if tx.send(Ok(adv)).await.is_err() {
                            return Ok(false);
                        }
                    }
                    Ok(None) => {}
                    // Devices may vanish between the event and the property reads
                    Err(e) => log::warn!("{address}: {e}"),
                }
            }
            Some(_) => {}
            None => return Ok(true),
        }
    }
}

/// Collect the advertised properties of a device into an [`Advertisement`].
///
/// Devices without an RSSI are cached entries that were not heard in this
/// discovery and are skipped.
async fn read_advertisement(
    adapter: &Adapter,
    address: Address,
) -> Result<Option<Advertisement>, ScanError> {
    let device = adapter.device(address)?;

    let Some(rssi) = device.rssi().await? else {
        return Ok(None);
    };

    let mut fields = Vec::new();

    if let Some(data) = device.manufacturer_data().await? {
        let mut entries: Vec<_> = data.into_iter().collect();
        entries.sort_by_key(|(company_id, _)| *company_id);
        fields.extend(
            entries
                .iter()
                .map(|(company_id, bytes)| AdField::manufacturer(*company_id, bytes)),
        );
    }

    if let Some(name) = device.name().await? {
        fields.push(AdField::new(AD_TYPE_COMPLETE_LOCAL_NAME, name.as_bytes()));
    }

    Ok(Some(Advertisement::new(format_address(address.0), rssi, fields)))
}
