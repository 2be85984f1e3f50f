//! Device identity parsing
//!
//! Turns a raw platform device-path string such as
//! `USB\VID_0951&PID_1625\0019E06B9C85F9A0F7550C20` into a structured
//! [`DeviceIdentity`]. Most strings offered to the parser are not USB
//! instances at all, so a failed parse is a normal outcome and is reported
//! as `None`.

use serde::{Deserialize, Serialize};

/// Separator used by PnP instance paths
pub const INSTANCE_PATH_SEPARATOR: char = '\\';

const VENDOR_PREFIX: &str = "VID_";
const PRODUCT_PREFIX: &str = "PID_";
const ID_TOKEN_LEN: usize = 8;

/// Identity of a physical USB device instance
///
/// Immutable once parsed. `vendor_id` and `product_id` are always the
/// trailing four characters of their `VID_`/`PID_` tokens.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// USB vendor id (4 hex chars)
    pub vendor_id: String,
    /// USB product id (4 hex chars)
    pub product_id: String,
    /// Serial number (third path segment)
    pub serial: String,
    /// Raw path the identity was parsed from
    pub system_path: String,
}

impl DeviceIdentity {
    /// Parse an instance path using the PnP separator
    pub fn parse(raw: &str) -> Option<Self> {
        parse_device_id(raw, INSTANCE_PATH_SEPARATOR)
    }
}

/// Parse a raw device-path string into a [`DeviceIdentity`]
///
/// Requires at least three `separator`-delimited segments, a second segment
/// of at least two `&`-joined tokens, and those tokens to be exactly
/// `VID_xxxx` and `PID_xxxx`. Anything else yields `None`.
pub fn parse_device_id(raw: &str, separator: char) -> Option<DeviceIdentity> {
    let segments: Vec<&str> = raw.split(separator).collect();
    if segments.len() < 3 {
        return None;
    }

    let mut tokens = segments[1].split('&');
    let vendor_id = id_suffix(tokens.next()?, VENDOR_PREFIX)?;
    let product_id = id_suffix(tokens.next()?, PRODUCT_PREFIX)?;

    Some(DeviceIdentity {
        vendor_id: vendor_id.to_string(),
        product_id: product_id.to_string(),
        serial: segments[2].to_string(),
        system_path: raw.to_string(),
    })
}

/// Return the 4-char id of a `VID_xxxx`/`PID_xxxx` token
fn id_suffix<'a>(token: &'a str, prefix: &str) -> Option<&'a str> {
    if token.chars().count() != ID_TOKEN_LEN {
        return None;
    }
    token.strip_prefix(prefix)
}
