//! Device identity types shared by every transport kind

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Description of a device as reported by a transport's enumeration
///
/// HID transports fill in `usage_page`/`usage` and `path`; USB transports
/// fill in the endpoint and interface fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_page: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_endpoint: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_endpoint: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<u8>,
    /// Platform path (HID only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
}

impl DeviceDescriptor {
    /// Create a descriptor carrying only vendor and product IDs
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
            ..Self::default()
        }
    }

    /// Builder-style usage page/usage setter
    pub fn with_usage(mut self, usage_page: u16, usage: u16) -> Self {
        self.usage_page = Some(usage_page);
        self.usage = Some(usage);
        self
    }

    /// Builder-style endpoint setter
    pub fn with_endpoints(mut self, in_endpoint: Option<u8>, out_endpoint: Option<u8>) -> Self {
        self.in_endpoint = in_endpoint;
        self.out_endpoint = out_endpoint;
        self
    }

    /// Whether this descriptor is the device named by `identity`
    pub fn matches_identity(&self, identity: &TargetIdentity) -> bool {
        if self.vendor_id != identity.vendor_id || self.product_id != identity.product_id {
            return false;
        }
        match identity.usage {
            Some((page, usage)) => self.usage_page == Some(page) && self.usage == Some(usage),
            None => true,
        }
    }
}

/// Vendor/product filter for enumeration
///
/// A field set to `None` matches any value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFilter {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
}

impl DeviceFilter {
    /// Filter that matches every device
    pub fn any() -> Self {
        Self::default()
    }

    pub fn new(vendor_id: Option<u16>, product_id: Option<u16>) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }

    pub fn matches(&self, descriptor: &DeviceDescriptor) -> bool {
        self.vendor_id.is_none_or(|vid| vid == descriptor.vendor_id)
            && self.product_id.is_none_or(|pid| pid == descriptor.product_id)
    }

    /// Keep only the descriptors this filter matches, preserving order
    pub fn apply(&self, descriptors: Vec<DeviceDescriptor>) -> Vec<DeviceDescriptor> {
        descriptors.into_iter().filter(|d| self.matches(d)).collect()
    }
}

/// The physical device a session (re)acquires
///
/// Formats as `vvvv:pppp` or `vvvv:pppp/gggg:uuuu` (hex, usage page and
/// usage optional).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    /// Optional (usage page, usage) pair, HID only
    pub usage: Option<(u16, u16)>,
}

impl TargetIdentity {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
            usage: None,
        }
    }

    pub fn with_usage(vendor_id: u16, product_id: u16, usage_page: u16, usage: u16) -> Self {
        Self {
            vendor_id,
            product_id,
            usage: Some((usage_page, usage)),
        }
    }
}

impl fmt::Display for TargetIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)?;
        if let Some((page, usage)) = self.usage {
            write!(f, "/{:04x}:{:04x}", page, usage)?;
        }
        Ok(())
    }
}

fn parse_hex_u16(s: &str) -> Result<u16, String> {
    let trimmed = s.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    u16::from_str_radix(digits, 16).map_err(|_| format!("Invalid hex value: {}", s))
}

fn parse_pair(s: &str) -> Result<(u16, u16), String> {
    let (a, b) = s
        .split_once(':')
        .ok_or_else(|| format!("Expected 'xxxx:yyyy', got: {}", s))?;
    Ok((parse_hex_u16(a)?, parse_hex_u16(b)?))
}

impl FromStr for TargetIdentity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ids, usage) = match s.split_once('/') {
            Some((ids, usage)) => (ids, Some(parse_pair(usage)?)),
            None => (s, None),
        };
        let (vendor_id, product_id) = parse_pair(ids)?;
        Ok(Self {
            vendor_id,
            product_id,
            usage,
        })
    }
}

impl Serialize for TargetIdentity {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TargetIdentity {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Parse a `u16` given in hex, with or without a `0x` prefix
pub fn parse_id(s: &str) -> Result<u16, String> {
    parse_hex_u16(s)
}
