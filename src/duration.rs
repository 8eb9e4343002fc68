//! Parsing of scan window and pause durations given on the command line.

use std::time::Duration;

/// Parse a duration from a human-readable string.
///
/// Accepts `ms`, `s`, `m` and `h` suffixes. A bare number is seconds.
///
/// # Examples
/// ```
/// use miband_listener::duration::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
/// assert_eq!(parse_duration("1").unwrap(), Duration::from_secs(1));
/// assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
/// ```
pub fn parse_duration(src: &str) -> Result<Duration, String> {
    let src = src.trim();
    if src.is_empty() {
        return Err("empty duration string".to_string());
    }

    // "ms" must be tried before "m" and "s"
    let (num, unit_millis) = if let Some(num) = src.strip_suffix("ms") {
        (num, 1)
    } else if let Some(num) = src.strip_suffix('h') {
        (num, 3_600_000)
    } else if let Some(num) = src.strip_suffix('m') {
        (num, 60_000)
    } else if let Some(num) = src.strip_suffix('s') {
        (num, 1_000)
    } else {
        (src, 1_000)
    };

    let value: u64 = num
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration: {src}"))?;

    value
        .checked_mul(unit_millis)
        .map(Duration::from_millis)
        .ok_or_else(|| format!("duration too large: {src}"))
}

/// Parse the length of a scan window. A zero window would never listen.
pub fn parse_scan_window(src: &str) -> Result<Duration, String> {
    match parse_duration(src)? {
        Duration::ZERO => Err("scan window must be longer than zero".to_string()),
        window => Ok(window),
    }
}
