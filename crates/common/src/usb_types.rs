//! USB type abstractions and utilities
//!
//! Plain value types shared by the device handle, the acceptor and the
//! configuration layer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Direction bit of an endpoint address (set = device-to-host)
pub const ENDPOINT_DIR_IN: u8 = 0x80;

/// Device option selecting which interface is claimed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InterfaceNumber(pub u8);

impl InterfaceNumber {
    pub fn value(&self) -> u8 {
        self.0
    }
}

/// Device option selecting the endpoint used for transfers
///
/// Stored as configured. Sends use the address unchanged; receives use it
/// with the direction bit set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointAddress(pub u8);

impl EndpointAddress {
    pub fn value(&self) -> u8 {
        self.0
    }

    /// Address used for host-to-device transfers
    pub fn out_address(&self) -> u8 {
        self.0
    }

    /// Address used for device-to-host transfers
    pub fn in_address(&self) -> u8 {
        self.0 | ENDPOINT_DIR_IN
    }

    pub fn is_in(&self) -> bool {
        self.0 & ENDPOINT_DIR_IN != 0
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// Vendor/product pair identifying a device model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIds {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl DeviceIds {
    pub const fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }

    pub fn matches(&self, other: &DeviceIds) -> bool {
        self == other
    }
}

impl fmt::Display for DeviceIds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

impl FromStr for DeviceIds {
    type Err = String;

    /// Parse `VID:PID` in hex, with or without a `0x` prefix
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (vid, pid) = s
            .split_once(':')
            .ok_or_else(|| format!("Invalid device id '{}', expected VID:PID", s))?;

        Ok(Self {
            vendor_id: parse_hex_u16(vid)?,
            product_id: parse_hex_u16(pid)?,
        })
    }
}

/// Parse a hex number with optional `0x` prefix
pub fn parse_hex_u16(s: &str) -> Result<u16, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u16::from_str_radix(digits, 16).map_err(|e| format!("Invalid hex value '{}': {}", s, e))
}
