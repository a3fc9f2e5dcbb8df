//! Endpoint resolution against configuration descriptors of real devices
//!
//! Run with: `cargo test -p capture --test descriptor_dumps`

use capture::{CaptureError, ResolvedEndpoint, resolve_bulk_in};

/// RP2040 running a TinyUSB CDC-ACM stack: IAD, communication interface with
/// an interrupt endpoint, then the CDC-Data interface
const PICO_CDC_ACM: [u8; 75] = [
    0x09, 0x02, 0x4B, 0x00, 0x02, 0x01, 0x00, 0x80, 0x32, // configuration
    0x08, 0x0B, 0x00, 0x02, 0x02, 0x02, 0x00, 0x00, // interface association
    0x09, 0x04, 0x00, 0x00, 0x01, 0x02, 0x02, 0x00, 0x04, // interface 0, CDC comm
    0x05, 0x24, 0x00, 0x20, 0x01, // CDC header
    0x05, 0x24, 0x01, 0x00, 0x01, // call management
    0x04, 0x24, 0x02, 0x02, // ACM
    0x05, 0x24, 0x06, 0x00, 0x01, // union
    0x07, 0x05, 0x81, 0x03, 0x08, 0x00, 0x10, // EP 0x81 interrupt IN
    0x09, 0x04, 0x01, 0x00, 0x02, 0x0A, 0x00, 0x00, 0x00, // interface 1, CDC data
    0x07, 0x05, 0x02, 0x02, 0x40, 0x00, 0x00, // EP 0x02 bulk OUT
    0x07, 0x05, 0x82, 0x02, 0x40, 0x00, 0x00, // EP 0x82 bulk IN
];

/// FT232R: one vendor-specific interface
const FT232R: [u8; 32] = [
    0x09, 0x02, 0x20, 0x00, 0x01, 0x01, 0x00, 0xA0, 0x2D, // configuration
    0x09, 0x04, 0x00, 0x00, 0x02, 0xFF, 0xFF, 0xFF, 0x02, // interface 0, vendor
    0x07, 0x05, 0x81, 0x02, 0x40, 0x00, 0x00, // EP 0x81 bulk IN
    0x07, 0x05, 0x02, 0x02, 0x40, 0x00, 0x00, // EP 0x02 bulk OUT
];

/// High-speed composite device: HID keyboard plus a vendor bulk interface
const HID_PLUS_VENDOR: [u8; 57] = [
    0x09, 0x02, 0x39, 0x00, 0x02, 0x01, 0x00, 0x80, 0x32, // configuration
    0x09, 0x04, 0x00, 0x00, 0x01, 0x03, 0x01, 0x01, 0x00, // interface 0, HID
    0x09, 0x21, 0x11, 0x01, 0x00, 0x01, 0x22, 0x3F, 0x00, // HID class descriptor
    0x07, 0x05, 0x81, 0x03, 0x08, 0x00, 0x0A, // EP 0x81 interrupt IN
    0x09, 0x04, 0x01, 0x00, 0x02, 0xFF, 0x00, 0x00, 0x00, // interface 1, vendor
    0x07, 0x05, 0x03, 0x02, 0x00, 0x02, 0x00, // EP 0x03 bulk OUT
    0x07, 0x05, 0x83, 0x02, 0x00, 0x02, 0x00, // EP 0x83 bulk IN
];

#[test]
fn test_cdc_acm_skips_notification_endpoint() {
    let endpoint = resolve_bulk_in(&PICO_CDC_ACM, None).unwrap();
    assert_eq!(
        endpoint,
        ResolvedEndpoint {
            interface: 1,
            alt_setting: 0,
            address: 0x82,
            max_packet_size: 64,
            interface_class: 0x0A,
        }
    );
}

#[test]
fn test_vendor_serial_bridge() {
    let endpoint = resolve_bulk_in(&FT232R, None).unwrap();
    assert_eq!(endpoint.interface, 0);
    assert_eq!(endpoint.address, 0x81);
    assert_eq!(endpoint.interface_class, 0xFF);
}

#[test]
fn test_composite_device() {
    let endpoint = resolve_bulk_in(&HID_PLUS_VENDOR, None).unwrap();
    assert_eq!(endpoint.interface, 1);
    assert_eq!(endpoint.address, 0x83);
    assert_eq!(endpoint.max_packet_size, 512);

    // Forcing the HID interface leaves nothing to read
    assert!(matches!(
        resolve_bulk_in(&HID_PLUS_VENDOR, Some(0)),
        Err(CaptureError::NoBulkIn)
    ));
    assert_eq!(
        resolve_bulk_in(&HID_PLUS_VENDOR, Some(1)).unwrap().address,
        0x83
    );
}

#[test]
fn test_short_reads() {
    // Cut on a record boundary before the data interface
    assert!(matches!(
        resolve_bulk_in(&PICO_CDC_ACM[..40], None),
        Err(CaptureError::NoBulkIn)
    ));

    // Cut inside a record
    assert!(matches!(
        resolve_bulk_in(&PICO_CDC_ACM[..42], None),
        Err(CaptureError::MalformedDescriptor { offset: 40, .. })
    ));
}
