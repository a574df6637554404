//! Payload decoders for well-known characteristics.

use crate::error::{Error, Result};

/// Decode a UTF-8 string characteristic such as the manufacturer name.
///
/// Trailing NUL padding, which some devices send, is stripped.
///
/// # Example
///
/// ```
/// use peripheral_link::decode_utf8;
///
/// assert_eq!(decode_utf8(b"Hammerhead\0\0").unwrap(), "Hammerhead");
/// ```
pub fn decode_utf8(payload: &[u8]) -> Result<String> {
    let end = payload
        .iter()
        .rposition(|b| *b != 0)
        .map_or(0, |last| last + 1);

    std::str::from_utf8(&payload[..end])
        .map(str::to_string)
        .map_err(|e| Error::decode(format!("invalid UTF-8: {}", e)))
}

/// Decode the Battery Level characteristic (percentage, 0-100).
///
/// # Example
///
/// ```
/// use peripheral_link::decode_battery_level;
///
/// assert_eq!(decode_battery_level(&[87]).unwrap(), 87);
/// assert!(decode_battery_level(&[]).is_err());
/// ```
pub fn decode_battery_level(payload: &[u8]) -> Result<u8> {
    match payload.first() {
        Some(level) if *level <= 100 => Ok(*level),
        Some(level) => Err(Error::decode(format!("battery level {} out of range", level))),
        None => Err(Error::decode("empty battery level payload")),
    }
}

/// Format a payload as upper-case hex for diagnostics.
#[inline]
pub fn to_hex(payload: &[u8]) -> String {
    payload.iter().map(|b| format!("{:02X}", b)).collect()
}
