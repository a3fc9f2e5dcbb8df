//! Endpoint resolution over a raw configuration descriptor
//!
//! The configuration descriptor is a concatenation of records, each starting
//! with `bLength` and `bDescriptorType`. We walk the records by their declared
//! length until `wTotalLength` is consumed, remembering the most recent
//! interface that looks like a data interface, and stop at the first bulk-IN
//! endpoint that follows such an interface.

use crate::error::{CaptureError, Result};
use tracing::{debug, trace};

/// Standard descriptor type: CONFIGURATION
pub const DESC_TYPE_CONFIGURATION: u8 = 0x02;
/// Standard descriptor type: INTERFACE
pub const DESC_TYPE_INTERFACE: u8 = 0x04;
/// Standard descriptor type: ENDPOINT
pub const DESC_TYPE_ENDPOINT: u8 = 0x05;

/// Interface class code for CDC-Data
pub const CLASS_CDC_DATA: u8 = 0x0A;

/// Direction bit of `bEndpointAddress`
const ENDPOINT_DIR_IN: u8 = 0x80;
/// Transfer-type bits of `bmAttributes`
const TRANSFER_TYPE_MASK: u8 = 0x03;
const TRANSFER_TYPE_BULK: u8 = 0x02;

/// Size of the configuration descriptor header
pub const CONFIG_HEADER_LEN: usize = 9;

/// Bulk-IN endpoint chosen for reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedEndpoint {
    /// `bInterfaceNumber` owning the endpoint
    pub interface: u8,
    /// `bAlternateSetting` of the owning interface
    pub alt_setting: u8,
    /// `bEndpointAddress` (direction bit set)
    pub address: u8,
    /// `wMaxPacketSize` (low 11 bits)
    pub max_packet_size: u16,
    /// `bInterfaceClass` of the owning interface
    pub interface_class: u8,
}

/// Interface remembered while scanning for its endpoints
#[derive(Debug, Clone, Copy)]
struct Candidate {
    number: u8,
    alt_setting: u8,
    class: u8,
}

/// Read `wTotalLength` from a configuration descriptor header
pub fn total_length(header: &[u8]) -> Option<u16> {
    if header.len() < 4 || header[1] != DESC_TYPE_CONFIGURATION {
        return None;
    }
    Some(u16::from_le_bytes([header[2], header[3]]))
}

/// Locate the data interface and its bulk-IN endpoint
///
/// An interface is a candidate when its class is CDC-Data or when it declares
/// at least one endpoint; with `forced_interface` set, only that interface
/// number qualifies. The first bulk-IN endpoint under a candidate wins.
pub fn resolve_bulk_in(config: &[u8], forced_interface: Option<u8>) -> Result<ResolvedEndpoint> {
    let declared = total_length(config).ok_or(CaptureError::MalformedDescriptor {
        offset: 0,
        reason: "not a configuration descriptor",
    })? as usize;
    let end = declared.min(config.len());

    let mut offset = 0;
    let mut candidate: Option<Candidate> = None;

    while offset < end {
        let remaining = end - offset;
        if remaining < 2 {
            return Err(CaptureError::MalformedDescriptor {
                offset,
                reason: "truncated record header",
            });
        }

        let length = config[offset] as usize;
        if length < 2 {
            return Err(CaptureError::MalformedDescriptor {
                offset,
                reason: "zero-length record",
            });
        }
        if length > remaining {
            return Err(CaptureError::MalformedDescriptor {
                offset,
                reason: "record overruns total length",
            });
        }

        let record = &config[offset..offset + length];
        match record[1] {
            DESC_TYPE_INTERFACE if length >= 9 => {
                let number = record[2];
                let alt_setting = record[3];
                let num_endpoints = record[4];
                let class = record[5];

                let qualifies = match forced_interface {
                    Some(forced) => number == forced,
                    None => class == CLASS_CDC_DATA || num_endpoints > 0,
                };

                debug!(
                    "Interface {} alt {}: class={:#04x}, subclass={:#04x}, endpoints={}{}",
                    number,
                    alt_setting,
                    class,
                    record[6],
                    num_endpoints,
                    if qualifies { " (candidate)" } else { "" }
                );

                candidate = qualifies.then_some(Candidate {
                    number,
                    alt_setting,
                    class,
                });
            }
            DESC_TYPE_ENDPOINT if length >= 7 => {
                let address = record[2];
                let attributes = record[3];
                let max_packet_size = u16::from_le_bytes([record[4], record[5]]) & 0x07FF;

                trace!(
                    "Endpoint {:#04x}: type={}, dir={}",
                    address,
                    attributes & TRANSFER_TYPE_MASK,
                    if address & ENDPOINT_DIR_IN != 0 { "IN" } else { "OUT" }
                );

                if let Some(c) = candidate
                    && address & ENDPOINT_DIR_IN != 0
                    && attributes & TRANSFER_TYPE_MASK == TRANSFER_TYPE_BULK
                {
                    debug!(
                        "Resolved bulk-IN endpoint {:#04x} on interface {}",
                        address, c.number
                    );
                    return Ok(ResolvedEndpoint {
                        interface: c.number,
                        alt_setting: c.alt_setting,
                        address,
                        max_packet_size,
                        interface_class: c.class,
                    });
                }
            }
            _ => {}
        }

        offset += length;
    }

    Err(CaptureError::NoBulkIn)
}
