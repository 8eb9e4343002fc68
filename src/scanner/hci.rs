//! Raw HCI socket backend.
//!
//! This backend uses raw Linux HCI sockets to scan for BLE advertisements
//! without requiring the BlueZ daemon. It requires CAP_NET_RAW and
//! CAP_NET_ADMIN capabilities or root privileges.

use super::{ADVERTISEMENT_CHANNEL_BUFFER_SIZE, Scan, ScanConfig, ScanError, ScanResult, pause};
use crate::advertisement::{Advertisement, format_address, parse_ad_structures};
use libc::{
    AF_BLUETOOTH, SOCK_CLOEXEC, SOCK_NONBLOCK, SOCK_RAW, c_int, c_void, sockaddr, socklen_t,
};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::{Duration, Instant};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;

// HCI protocol constants
const BTPROTO_HCI: c_int = 1;
const SOL_HCI: c_int = 0;
const HCI_FILTER: c_int = 2;
const HCI_CHANNEL_RAW: u16 = 0;

// HCI packet types
const HCI_COMMAND_PKT: u8 = 0x01;
const HCI_EVENT_PKT: u8 = 0x04;

// HCI events
const EVT_CMD_COMPLETE: u8 = 0x0E;
const EVT_CMD_STATUS: u8 = 0x0F;
const EVT_LE_META_EVENT: u8 = 0x3E;
const EVT_LE_ADVERTISING_REPORT: u8 = 0x02;

// LE controller commands
const OGF_LE_CTL: u16 = 0x08;
const OCF_LE_SET_SCAN_PARAMETERS: u16 = 0x000B;
const OCF_LE_SET_SCAN_ENABLE: u16 = 0x000C;

const HCI_SUCCESS: u8 = 0x00;

/// How long to wait for the controller to answer a command.
const HCI_COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

// Scan parameters: passive scan, 10ms interval and window (0.625ms units)
const LE_SCAN_PASSIVE: u8 = 0x00;
const LE_SCAN_INTERVAL: u16 = 0x0010;
const LE_SCAN_WINDOW: u16 = 0x0010;
const LE_PUBLIC_ADDRESS: u8 = 0x00;
const FILTER_POLICY_ACCEPT_ALL: u8 = 0x00;

// Report repeated advertisements so heart rate updates are not dropped
const FILTER_DUPLICATES: u8 = 0x00;

/// Largest HCI event: 1 byte packet type, 2 byte header, 255 bytes parameters.
const HCI_MAX_EVENT_SIZE: usize = 258;

/// HCI socket address structure
#[repr(C)]
struct SockaddrHci {
    hci_family: u16,
    hci_dev: u16,
    hci_channel: u16,
}

/// HCI filter structure for raw sockets
#[repr(C)]
#[derive(Debug, Default)]
struct HciFilter {
    type_mask: u32,
    event_mask: [u32; 2],
    opcode: u16,
}

impl HciFilter {
    /// Filter that only lets the given event codes through.
    fn events(codes: &[u8]) -> Self {
        let mut filter = Self::default();
        filter.type_mask |= 1 << u32::from(HCI_EVENT_PKT);
        for &code in codes {
            let bit = usize::from(code);
            filter.event_mask[bit / 32] |= 1 << (bit % 32);
        }
        filter
    }

    fn le_meta_events() -> Self {
        Self::events(&[EVT_LE_META_EVENT])
    }

    fn command_replies() -> Self {
        Self::events(&[EVT_CMD_COMPLETE, EVT_CMD_STATUS])
    }
}

/// A raw HCI socket bound to one controller.
struct HciSocket {
    fd: OwnedFd,
}

impl HciSocket {
    /// Open a non-blocking raw socket bound to controller `dev_id`.
    fn open(dev_id: u16) -> Result<Self, ScanError> {
        // nix doesn't support BTPROTO_HCI; SOCK_NONBLOCK is required by AsyncFd
        let raw = unsafe {
            libc::socket(
                AF_BLUETOOTH,
                SOCK_RAW | SOCK_CLOEXEC | SOCK_NONBLOCK,
                BTPROTO_HCI,
            )
        };
        if raw < 0 {
            return Err(os_error("create HCI socket"));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let addr = SockaddrHci {
            hci_family: AF_BLUETOOTH as u16,
            hci_dev: dev_id,
            hci_channel: HCI_CHANNEL_RAW,
        };
        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const SockaddrHci as *const sockaddr,
                mem::size_of::<SockaddrHci>() as socklen_t,
            )
        };
        if ret < 0 {
            return Err(os_error(&format!("bind HCI socket to hci{dev_id}")));
        }

        Ok(Self { fd })
    }

    fn set_filter(&self, filter: &HciFilter) -> Result<(), ScanError> {
        let ret = unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                SOL_HCI,
                HCI_FILTER,
                filter as *const HciFilter as *const c_void,
                mem::size_of::<HciFilter>() as socklen_t,
            )
        };
        if ret < 0 {
            return Err(os_error("set HCI filter"));
        }
        Ok(())
    }

    /// Send an LE controller command and wait for the controller to accept it.
    ///
    /// The socket must have the [`HciFilter::command_replies`] filter set.
    fn send_command(&self, ocf: u16, params: &[u8]) -> Result<(), ScanError> {
        let opcode = opcode(OGF_LE_CTL, ocf);
        let packet = command_packet(opcode, params);
        let ret = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                packet.as_ptr() as *const c_void,
                packet.len(),
            )
        };
        if ret < 0 {
            return Err(os_error("send HCI command"));
        }
        self.await_reply(opcode)
    }

    /// Block until the Command Complete or Command Status event for `opcode` arrives.
    fn await_reply(&self, opcode: u16) -> Result<(), ScanError> {
        let deadline = Instant::now() + HCI_COMMAND_TIMEOUT;
        let mut buf = [0u8; HCI_MAX_EVENT_SIZE];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ScanError::Bluetooth(format!(
                    "Timed out waiting for reply to HCI command {opcode:#06x}"
                )));
            }

            let mut pfd = libc::pollfd {
                fd: self.fd.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            let ret = unsafe { libc::poll(&mut pfd, 1, remaining.as_millis() as c_int) };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(ScanError::Bluetooth(format!(
                    "Failed to poll HCI command socket: {err}"
                )));
            }
            if ret == 0 {
                continue;
            }

            let n = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    buf.as_mut_ptr() as *mut c_void,
                    buf.len(),
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if matches!(
                    err.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                ) {
                    continue;
                }
                return Err(ScanError::Bluetooth(format!(
                    "Failed to read HCI command reply: {err}"
                )));
            }

            match command_status(&buf[..n as usize], opcode) {
                Some(HCI_SUCCESS) => return Ok(()),
                Some(status) => {
                    return Err(ScanError::Bluetooth(format!(
                        "HCI command {opcode:#06x} failed with status {status:#04x}"
                    )));
                }
                None => {}
            }
        }
    }

    fn set_scan_parameters(&self) -> Result<(), ScanError> {
        self.send_command(OCF_LE_SET_SCAN_PARAMETERS, &scan_parameters())
    }

    fn set_scan_enabled(&self, enabled: bool) -> Result<(), ScanError> {
        self.send_command(OCF_LE_SET_SCAN_ENABLE, &[u8::from(enabled), FILTER_DUPLICATES])
    }
}

fn os_error(action: &str) -> ScanError {
    ScanError::Bluetooth(format!("Failed to {action}: {}", io::Error::last_os_error()))
}

fn opcode(ogf: u16, ocf: u16) -> u16 {
    (ogf << 10) | ocf
}

/// Build an HCI command packet.
fn command_packet(opcode: u16, params: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(4 + params.len());
    packet.push(HCI_COMMAND_PKT);
    packet.extend_from_slice(&opcode.to_le_bytes());
    packet.push(params.len() as u8);
    packet.extend_from_slice(params);
    packet
}

/// Status carried by a Command Complete or Command Status event answering `opcode`.
///
/// Returns `None` for any other packet.
fn command_status(packet: &[u8], opcode: u16) -> Option<u8> {
    if packet.len() < 7 || packet[0] != HCI_EVENT_PKT {
        return None;
    }
    match packet[1] {
        // num packets, opcode, status
        EVT_CMD_COMPLETE => {
            (u16::from_le_bytes([packet[4], packet[5]]) == opcode).then_some(packet[6])
        }
        // status, num packets, opcode
        EVT_CMD_STATUS => {
            (u16::from_le_bytes([packet[5], packet[6]]) == opcode).then_some(packet[3])
        }
        _ => None,
    }
}

/// Parameters of LE Set Scan Parameters, in wire order.
fn scan_parameters() -> [u8; 7] {
    let interval = LE_SCAN_INTERVAL.to_le_bytes();
    let window = LE_SCAN_WINDOW.to_le_bytes();
    [
        LE_SCAN_PASSIVE,
        interval[0],
        interval[1],
        window[0],
        window[1],
        LE_PUBLIC_ADDRESS,
        FILTER_POLICY_ACCEPT_ALL,
    ]
}

/// Controller index from an adapter name such as "hci1" or "1".
fn device_index(adapter: Option<&str>) -> Result<u16, ScanError> {
    let Some(name) = adapter else {
        return Ok(0);
    };
    name.strip_prefix("hci")
        .unwrap_or(name)
        .parse()
        .map_err(|_| ScanError::InvalidAdapter(name.to_string()))
}

fn is_advertising_report(packet: &[u8]) -> bool {
    packet.len() >= 4
        && packet[0] == HCI_EVENT_PKT
        && packet[1] == EVT_LE_META_EVENT
        && packet[3] == EVT_LE_ADVERTISING_REPORT
}

/// Parse every report of an LE Advertising Report event.
///
/// `packet` is the full event including the packet type byte. Reports are
/// read back to back; a truncated report ends parsing.
fn parse_advertising_report(packet: &[u8]) -> Vec<Advertisement> {
    let mut adverts = Vec::new();

    // Skip packet type, event code, parameter length and subevent
    let Some((&num_reports, mut rest)) = packet.get(4..).and_then(<[u8]>::split_first) else {
        return adverts;
    };

    for _ in 0..num_reports {
        // event type, address type, address, data length
        if rest.len() < 9 {
            break;
        }

        let mut addr = [0u8; 6];
        addr.copy_from_slice(&rest[2..8]);
        addr.reverse(); // HCI uses little-endian address

        let data_len = usize::from(rest[8]);
        // data is followed by a signed RSSI byte
        if rest.len() < 10 + data_len {
            break;
        }

        let ad_data = &rest[9..9 + data_len];
        let rssi = i16::from(rest[9 + data_len] as i8);

        adverts.push(Advertisement::new(
            format_address(addr),
            rssi,
            parse_ad_structures(ad_data),
        ));
        rest = &rest[10 + data_len..];
    }

    adverts
}

/// Start windowed scanning on a raw HCI socket.
///
/// # Requirements
/// - CAP_NET_RAW and CAP_NET_ADMIN capabilities or root privileges
/// - An available HCI device (hci0 unless another adapter is given)
pub async fn start_scan(config: ScanConfig) -> Result<Scan, ScanError> {
    let dev_id = device_index(config.adapter.as_deref())?;
    log::info!("Using adapter hci{dev_id}");

    let events = HciSocket::open(dev_id)?;
    events.set_filter(&HciFilter::le_meta_events())?;

    // Commands go through their own socket so their replies don't reach the event reader
    let commands = HciSocket::open(dev_id)?;
    commands.set_filter(&HciFilter::command_replies())?;

    // A scan left running by an earlier process makes the controller refuse new parameters
    if let Err(e) = commands.set_scan_enabled(false) {
        log::debug!("Disabling scan before setup: {e}");
    }
    commands.set_scan_parameters()?;

    let events = AsyncFd::new(events.fd)
        .map_err(|e| ScanError::Bluetooth(format!("Failed to create async fd: {e}")))?;

    let (tx, rx) = mpsc::channel(ADVERTISEMENT_CHANNEL_BUFFER_SIZE);

    let task = tokio::spawn(async move {
        loop {
            match scan_window(&events, &commands, config.window, &tx).await {
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
        log::debug!("HCI scan stopped");
    });

    Ok(Scan::new(rx, task))
}

/// Enable scanning for one window, forward reports, then disable it again.
///
/// The scan is disabled even when the window ends early because the
/// receiver was dropped. Returns `Ok(false)` in that case.
async fn scan_window(
    events: &AsyncFd<OwnedFd>,
    commands: &HciSocket,
    window: Duration,
    tx: &mpsc::Sender<ScanResult>,
) -> Result<bool, ScanError> {
    log::debug!("Scan window of {window:?}");
    commands.set_scan_enabled(true)?;
    let result = forward_reports(events, window, tx).await;
    finish_window(result, commands.set_scan_enabled(false))
}

/// Combine the outcome of a window with the outcome of disabling the scan.
///
/// A failure during the window wins; a disable failure next to it is only logged.
fn finish_window(
    result: Result<bool, ScanError>,
    disabled: Result<(), ScanError>,
) -> Result<bool, ScanError> {
    match (result, disabled) {
        (result, Ok(())) => result,
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Err(disable_err)) => {
            log::warn!("Failed to disable scan: {disable_err}");
            Err(e)
        }
    }
}

async fn forward_reports(
    events: &AsyncFd<OwnedFd>,
    window: Duration,
    tx: &mpsc::Sender<ScanResult>,
) -> Result<bool, ScanError> {
    let deadline = tokio::time::sleep(window);
    tokio::pin!(deadline);

    let mut buf = [0u8; HCI_MAX_EVENT_SIZE];

    loop {
        let mut guard = tokio::select! {
            _ = &mut deadline => return Ok(true),
            _ = tx.closed() => return Ok(false),
            guard = events.readable() => guard
                .map_err(|e| ScanError::Bluetooth(format!("Failed to poll HCI socket: {e}")))?,
        };

        // Drain all available packets before waiting again
        loop {
            let n = match guard.try_io(|inner| {
                let ret = unsafe {
                    libc::read(inner.as_raw_fd(), buf.as_mut_ptr() as *mut c_void, buf.len())
                };
                if ret < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(ret as usize)
                }
            }) {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => n,
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(e)) => {
                    return Err(ScanError::Bluetooth(format!("Failed to read HCI event: {e}")));
                }
                Err(_would_block) => break,
            };

            let packet = &buf[..n];
            if !is_advertising_report(packet) {
                continue;
            }
            for adv in parse_advertising_report(packet) {
                if tx.send(Ok(adv)).await.is_err() {
                    return Ok(false);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advertisement::AD_TYPE_MANUFACTURER_DATA;

    fn report(addr_le: [u8; 6], ad_data: &[u8], rssi: i8) -> Vec<u8> {
        let mut r = vec![0x00, 0x00]; // ADV_IND, public address
        r.extend_from_slice(&addr_le);
        r.push(ad_data.len() as u8);
        r.extend_from_slice(ad_data);
        r.push(rssi as u8);
        r
    }

    fn event(reports: &[Vec<u8>]) -> Vec<u8> {
        let mut params = vec![EVT_LE_ADVERTISING_REPORT, reports.len() as u8];
        for r in reports {
            params.extend_from_slice(r);
        }
        let mut packet = vec![HCI_EVENT_PKT, EVT_LE_META_EVENT, params.len() as u8];
        packet.extend_from_slice(&params);
        packet
    }

    const BAND_AD: [u8; 11] = [
        0x02, 0x01, 0x06, // Flags
        0x07, 0xFF, 0x57, 0x01, 0x02, 0x00, 0x00, 0x48, // Manufacturer data, heart rate 72
    ];

    #[test]
    fn test_hci_filter_setup() {
        let filter = HciFilter::le_meta_events();
        // HCI_EVENT_PKT (0x04) sets bit 4 in type_mask
        assert_eq!(filter.type_mask, 1 << HCI_EVENT_PKT);
        // EVT_LE_META_EVENT (0x3E = 62) sets bit 30 in event_mask[1]
        assert_eq!(filter.event_mask[0], 0);
        assert_eq!(filter.event_mask[1], 1 << (EVT_LE_META_EVENT % 32));
    }

    #[test]
    fn test_command_reply_filter() {
        let filter = HciFilter::command_replies();
        assert_eq!(filter.type_mask, 1 << HCI_EVENT_PKT);
        // Command Complete (0x0E) and Command Status (0x0F) are bits 14 and 15
        assert_eq!(filter.event_mask[0], (1 << 14) | (1 << 15));
        assert_eq!(filter.event_mask[1], 0);
        assert_eq!(filter.opcode, 0);
    }

    #[test]
    fn test_command_packet() {
        let opcode = opcode(OGF_LE_CTL, OCF_LE_SET_SCAN_ENABLE);
        assert_eq!(opcode, 0x200C);

        let packet = command_packet(opcode, &[0x01, 0x00]);
        // opcode little-endian
        assert_eq!(packet, vec![0x01, 0x0C, 0x20, 0x02, 0x01, 0x00]);
    }

    #[test]
    fn test_command_status_from_command_complete() {
        let scan_enable = opcode(OGF_LE_CTL, OCF_LE_SET_SCAN_ENABLE);

        let ok = [HCI_EVENT_PKT, EVT_CMD_COMPLETE, 0x04, 0x01, 0x0C, 0x20, 0x00];
        assert_eq!(command_status(&ok, scan_enable), Some(HCI_SUCCESS));

        // Command Disallowed
        let disallowed = [HCI_EVENT_PKT, EVT_CMD_COMPLETE, 0x04, 0x01, 0x0C, 0x20, 0x0C];
        assert_eq!(command_status(&disallowed, scan_enable), Some(0x0C));

        // Reply to Set Scan Parameters does not answer Set Scan Enable
        let other = [HCI_EVENT_PKT, EVT_CMD_COMPLETE, 0x04, 0x01, 0x0B, 0x20, 0x00];
        assert_eq!(command_status(&other, scan_enable), None);
    }

    #[test]
    fn test_command_status_from_command_status_event() {
        let scan_params = opcode(OGF_LE_CTL, OCF_LE_SET_SCAN_PARAMETERS);
        let packet = [HCI_EVENT_PKT, EVT_CMD_STATUS, 0x04, 0x01, 0x01, 0x0B, 0x20];
        assert_eq!(command_status(&packet, scan_params), Some(0x01));
    }

    #[test]
    fn test_command_status_ignores_other_packets() {
        let scan_enable = opcode(OGF_LE_CTL, OCF_LE_SET_SCAN_ENABLE);
        let packet = event(&[report([1, 2, 3, 4, 5, 6], &BAND_AD, -40)]);
        assert_eq!(command_status(&packet, scan_enable), None);
        assert_eq!(command_status(&[HCI_EVENT_PKT, EVT_CMD_COMPLETE], scan_enable), None);
    }

    #[test]
    fn test_finish_window_keeps_window_error() {
        let read_err = ScanError::Bluetooth("Failed to read HCI event".to_string());
        let disable_err = ScanError::Bluetooth("Failed to send HCI command".to_string());

        assert_eq!(
            finish_window(Err(read_err.clone()), Err(disable_err.clone())),
            Err(read_err.clone())
        );
        assert_eq!(finish_window(Err(read_err.clone()), Ok(())), Err(read_err));
    }

    #[test]
    fn test_finish_window_reports_disable_error() {
        let disable_err = ScanError::Bluetooth("Failed to send HCI command".to_string());

        assert_eq!(finish_window(Ok(true), Err(disable_err.clone())), Err(disable_err));
        assert_eq!(finish_window(Ok(true), Ok(())), Ok(true));
        assert_eq!(finish_window(Ok(false), Ok(())), Ok(false));
    }

    #[test]
    fn test_scan_parameters() {
        assert_eq!(
            scan_parameters(),
            [0x00, 0x10, 0x00, 0x10, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_device_index() {
        assert_eq!(device_index(None).unwrap(), 0);
        assert_eq!(device_index(Some("hci1")).unwrap(), 1);
        assert_eq!(device_index(Some("2")).unwrap(), 2);
        assert!(matches!(
            device_index(Some("usb0")),
            Err(ScanError::InvalidAdapter(_))
        ));
    }

    #[test]
    fn test_parse_single_report() {
        let packet = event(&[report([0xCC, 0xBB, 0xAA, 0x10, 0x0F, 0xC8], &BAND_AD, -67)]);
        assert!(is_advertising_report(&packet));

        let adverts = parse_advertising_report(&packet);
        assert_eq!(adverts.len(), 1);

        let adv = &adverts[0];
        assert_eq!(adv.address, "c8:0f:10:aa:bb:cc");
        assert_eq!(adv.rssi, -67);
        assert_eq!(adv.fields.len(), 2);
        assert_eq!(adv.fields[1].ad_type, AD_TYPE_MANUFACTURER_DATA);
        assert_eq!(adv.manufacturer_data(), Some("570102000048"));
    }

    #[test]
    fn test_parse_multiple_reports() {
        let packet = event(&[
            report([1, 2, 3, 4, 5, 6], &BAND_AD, -40),
            report([6, 5, 4, 3, 2, 1], &[0x02, 0x01, 0x06], -90),
        ]);

        let adverts = parse_advertising_report(&packet);
        assert_eq!(adverts.len(), 2);
        assert_eq!(adverts[0].address, "06:05:04:03:02:01");
        assert_eq!(adverts[0].rssi, -40);
        assert_eq!(adverts[1].address, "01:02:03:04:05:06");
        assert_eq!(adverts[1].rssi, -90);
        assert_eq!(adverts[1].manufacturer_data(), None);
    }

    #[test]
    fn test_parse_truncated_report() {
        let mut packet = event(&[report([1, 2, 3, 4, 5, 6], &BAND_AD, -40)]);
        packet.truncate(packet.len() - 3);
        assert!(parse_advertising_report(&packet).is_empty());
        assert!(parse_advertising_report(&[HCI_EVENT_PKT, EVT_LE_META_EVENT]).is_empty());
    }

    #[test]
    fn test_other_events_are_not_reports() {
        // Command Complete
        assert!(!is_advertising_report(&[HCI_EVENT_PKT, 0x0E, 0x04, 0x01]));
        // LE Connection Complete
        assert!(!is_advertising_report(&[HCI_EVENT_PKT, EVT_LE_META_EVENT, 0x13, 0x01]));
    }
}
