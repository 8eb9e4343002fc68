//! Decoding of the heart rate a band broadcasts in its manufacturer data.
//!
//! Xiaomi/Huami bands put the company identifier (wire bytes `57 01`) at the
//! start of the manufacturer-specific data and the current heart rate at
//! byte 5. The layout is undocumented; only these two offsets are used.

use crate::advertisement::Advertisement;
use crate::sample::HeartRateSample;
use chrono::Local;
use thiserror::Error;

/// Expected first two bytes of the manufacturer data, read big-endian.
pub const DEFAULT_COMPANY_ID: u16 = 0x5701;

/// Shortest manufacturer data worth decoding, in bytes.
pub const MIN_MANUFACTURER_DATA_LEN: usize = 7;

/// Byte offset of the heart rate within the manufacturer data.
pub const HEART_RATE_OFFSET: usize = 5;

/// Errors raised while decoding manufacturer data.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// Manufacturer data is not a valid hex string
    #[error("invalid manufacturer data from {address}: {source}")]
    InvalidHex {
        address: String,
        #[source]
        source: hex::FromHexError,
    },
}

/// Decoder for band advertisements.
///
/// Holds only the company identifier to match, so decoding the same event
/// twice always gives the same result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoder {
    company_id: u16,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(DEFAULT_COMPANY_ID)
    }
}

impl Decoder {
    pub fn new(company_id: u16) -> Self {
        Self { company_id }
    }

    pub fn company_id(&self) -> u16 {
        self.company_id
    }

    /// Decode an advertisement into a heart-rate sample.
    ///
    /// Returns `Ok(None)` when the advertisement carries no manufacturer data,
    /// when the data is shorter than [`MIN_MANUFACTURER_DATA_LEN`] bytes, or
    /// when it belongs to another vendor. Returns an error only when the data
    /// is not valid hex.
    pub fn decode(&self, adv: &Advertisement) -> Result<Option<HeartRateSample>, DecodeError> {
        let Some(value) = adv.manufacturer_data() else {
            log::trace!("{}: no manufacturer data", adv.address);
            return Ok(None);
        };

        if value.len() < MIN_MANUFACTURER_DATA_LEN * 2 {
            log::trace!(
                "{}: manufacturer data too short ({} hex chars)",
                adv.address,
                value.len()
            );
            return Ok(None);
        }

        let data = hex::decode(value).map_err(|source| DecodeError::InvalidHex {
            address: adv.address.clone(),
            source,
        })?;

        let company_id = u16::from_be_bytes([data[0], data[1]]);
        if company_id != self.company_id {
            log::trace!("{}: company id {company_id:04x} ignored", adv.address);
            return Ok(None);
        }

        let heart_rate = data[HEART_RATE_OFFSET];
        log::debug!(
            "{} ({}): heart rate {heart_rate}",
            adv.address,
            adv.local_name().as_deref().unwrap_or("unnamed")
        );

        Ok(Some(HeartRateSample {
            timestamp: Local::now(),
            address: adv.address.clone(),
            rssi: adv.rssi,
            heart_rate,
        }))
    }
}

/// Parse a company identifier given in hex, with or without a `0x` prefix.
///
/// # Examples
/// ```
/// use miband_listener::decoder::parse_company_id;
///
/// assert_eq!(parse_company_id("5701").unwrap(), 0x5701);
/// assert_eq!(parse_company_id("0x0157").unwrap(), 0x0157);
/// ```
pub fn parse_company_id(src: &str) -> Result<u16, String> {
    let src = src.trim();
    let digits = src
        .strip_prefix("0x")
        .or_else(|| src.strip_prefix("0X"))
        .unwrap_or(src);

    if digits.is_empty() || digits.len() > 4 {
        return Err(format!("invalid company id: {src} (expected up to 4 hex digits)"));
    }

    u16::from_str_radix(digits, 16).map_err(|_| format!("invalid company id: {src}"))
}
