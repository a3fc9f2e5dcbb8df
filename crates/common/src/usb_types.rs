//! USB device summaries and VID:PID filters

use capture::ResolvedEndpoint;
use std::fmt;
use std::str::FromStr;

/// Vendor ID of the Linux Foundation, used by root hubs
pub const ROOT_HUB_VENDOR: u16 = 0x1d6b;

/// USB device class code for hubs
pub const CLASS_HUB: u8 = 0x09;

/// Whether a device descriptor describes a host controller root hub
pub fn is_root_hub(vendor_id: u16, class_code: u8) -> bool {
    vendor_id == ROOT_HUB_VENDOR && class_code == CLASS_HUB
}

/// One enumerated USB device, as shown by `--list-devices`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSummary {
    pub bus_number: u8,
    pub device_address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    /// Bulk-IN endpoint the logger would read, if one resolves
    pub bulk_in: Option<ResolvedEndpoint>,
}

impl fmt::Display for DeviceSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:04x} bus {:03} device {:03} - {} {}",
            self.vendor_id,
            self.product_id,
            self.bus_number,
            self.device_address,
            self.manufacturer.as_deref().unwrap_or("Unknown Manufacturer"),
            self.product.as_deref().unwrap_or("Unknown Product")
        )?;
        match &self.bulk_in {
            Some(ep) => write!(
                f,
                " [bulk-IN {:#04x} on interface {}, {} bytes]",
                ep.address, ep.interface, ep.max_packet_size
            ),
            None => f.write_str(" [no bulk-IN]"),
        }
    }
}

/// VID:PID pattern with `*` wildcards
///
/// Written as `0x1234:0x5678`, `0x1234:*`, `*:0x5678` or `*:*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFilter {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
}

impl DeviceFilter {
    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id.is_none_or(|v| v == vendor_id)
            && self.product_id.is_none_or(|p| p == product_id)
    }

    /// True when `filters` is empty or any filter matches
    pub fn allows(filters: &[DeviceFilter], vendor_id: u16, product_id: u16) -> bool {
        filters.is_empty() || filters.iter().any(|f| f.matches(vendor_id, product_id))
    }

    fn parse_id(id: &str, name: &str) -> Result<Option<u16>, String> {
        if id == "*" {
            return Ok(None);
        }

        let hex_part = id
            .strip_prefix("0x")
            .or_else(|| id.strip_prefix("0X"))
            .ok_or_else(|| format!("Invalid {} '{}', must start with '0x' (e.g., '0x1234')", name, id))?;

        if hex_part.is_empty() || hex_part.len() > 4 {
            return Err(format!("Invalid {} '{}', hex part must be 1-4 digits", name, id));
        }

        u16::from_str_radix(hex_part, 16)
            .map(Some)
            .map_err(|_| format!("Invalid {} '{}', not a valid hex number", name, id))
    }
}

impl FromStr for DeviceFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (vid, pid) = s.split_once(':').ok_or_else(|| {
            format!(
                "Invalid filter format '{}', expected VID:PID (e.g., '0x1234:0x5678' or '0x1234:*')",
                s
            )
        })?;

        Ok(Self {
            vendor_id: Self::parse_id(vid, "VID")?,
            product_id: Self::parse_id(pid, "PID")?,
        })
    }
}

impl fmt::Display for DeviceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.vendor_id {
            Some(v) => write!(f, "{:#06x}", v)?,
            None => f.write_str("*")?,
        }
        f.write_str(":")?;
        match self.product_id {
            Some(p) => write!(f, "{:#06x}", p),
            None => f.write_str("*"),
        }
    }
}
