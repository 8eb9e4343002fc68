use crate::advertisement::{AD_TYPE_MANUFACTURER_DATA, AdField, Advertisement, describe_ad_type};
use crate::sample::HeartRateSample;
use chrono::{Local, TimeZone};

/// A stable band address for unit tests.
pub const TEST_ADDRESS: &str = "c8:0f:10:aa:bb:cc";

/// Advertisement from a band reporting `heart_rate`, as a real band sends it.
pub fn band_advertisement(heart_rate: u8) -> Advertisement {
    Advertisement::new(
        TEST_ADDRESS,
        -67,
        vec![
            AdField::new(0x01, &[0x06]),
            AdField::manufacturer(0x0157, &[0x02, 0x00, 0x00, heart_rate, 0x00, 0x00, 0x00]),
            AdField::new(0x09, b"Mi Smart Band 6"),
        ],
    )
}

/// Advertisement whose manufacturer data is exactly `value`, valid hex or not.
pub fn raw_manufacturer_advertisement(value: &str) -> Advertisement {
    Advertisement::new(
        TEST_ADDRESS,
        -67,
        vec![AdField {
            ad_type: AD_TYPE_MANUFACTURER_DATA,
            description: describe_ad_type(AD_TYPE_MANUFACTURER_DATA).to_string(),
            value: value.to_string(),
        }],
    )
}

/// Sample with a fixed timestamp of 2024-03-01 08:15:42 local time.
pub fn fixed_sample(heart_rate: u8) -> HeartRateSample {
    HeartRateSample {
        timestamp: Local.with_ymd_and_hms(2024, 3, 1, 8, 15, 42).unwrap(),
        address: TEST_ADDRESS.to_string(),
        rssi: -67,
        heart_rate,
    }
}
