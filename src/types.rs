//! ## Types
//!
//! The device-facing data model shared across the crate.
//!

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::codec::TypedValue;

/// ### EndpointTriple
///
/// The three endpoint addresses an MTP interface exposes.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointTriple {
    /// Bulk IN endpoint address
    pub input: u8,
    /// Bulk OUT endpoint address
    pub output: u8,
    /// Interrupt IN endpoint address, if present
    pub event: Option<u8>,
}

/// ### IfaceTriple
///
/// Class, subclass and protocol of an interface descriptor.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IfaceTriple {
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

/// USB bus speed category reported by discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum UsbSpeed {
    Low,
    Full,
    High,
    Super,
    SuperPlus,
}

/// ### InterfaceCandidate
///
/// One interface alternative the probe ladder may try.
///
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceCandidate {
    pub interface_number: u8,
    pub alt_setting: u8,
    pub iface: IfaceTriple,
    pub endpoints: EndpointTriple,
    /// Largest packet the bulk endpoints accept
    pub max_packet_size: u16,
}

/// ### DeviceDescriptor
///
/// Opaque identity produced by discovery. Stable for the duration of
/// one attach.
///
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
    pub bcd_device: u16,
    pub candidates: Vec<InterfaceCandidate>,
    pub usb_serial: Option<String>,
    pub speed: Option<UsbSpeed>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
}

impl DeviceDescriptor {
    /// Match key for the quirk database, derived from the candidate the
    /// ladder selected (or the best-scored one before selection).
    pub fn fingerprint(&self, candidate: &InterfaceCandidate) -> DeviceFingerprint {
        DeviceFingerprint {
            vendor_id: self.vendor_id,
            product_id: self.product_id,
            bcd_device: Some(self.bcd_device),
            iface: candidate.iface,
            endpoints: candidate.endpoints,
        }
    }
}

/// ### DeviceFingerprint
///
/// Quirk-database match key.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFingerprint {
    pub vendor_id: u16,
    pub product_id: u16,
    pub bcd_device: Option<u16>,
    pub iface: IfaceTriple,
    pub endpoints: EndpointTriple,
}

impl fmt::Display for DeviceFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:04x} if {:02x}/{:02x}/{:02x}",
            self.vendor_id,
            self.product_id,
            self.iface.class,
            self.iface.subclass,
            self.iface.protocol
        )
    }
}

/// ### MtpDeviceInfo
///
/// Decoded GetDeviceInfo dataset.
///
#[derive(Debug, Clone, Default, Serialize)]
pub struct MtpDeviceInfo {
    pub standard_version: u16,
    pub vendor_extension_id: u32,
    pub vendor_extension_version: u16,
    pub vendor_extension_desc: String,
    pub functional_mode: u16,
    pub operations_supported: Vec<u16>,
    pub events_supported: Vec<u16>,
    pub device_properties_supported: Vec<u16>,
    pub capture_formats: Vec<u16>,
    pub playback_formats: Vec<u16>,
    pub manufacturer: String,
    pub model: String,
    pub device_version: String,
    pub serial_number: String,
}

impl MtpDeviceInfo {
    pub fn supports_op(&self, code: u16) -> bool {
        self.operations_supported.contains(&code)
    }
}

/// ### StorageInfo
///
/// One logical volume on the device.
///
#[derive(Debug, Clone, Serialize)]
pub struct StorageInfo {
    pub storage_id: u32,
    pub description: String,
    pub capacity_bytes: u64,
    pub free_bytes: u64,
    pub read_only: bool,
    pub file_system_type: u16,
}

/// ### ObjectInfo
///
/// One object (file or folder) within a session. `parent` of 0 means
/// the storage root.
///
#[derive(Debug, Clone, Serialize)]
pub struct ObjectInfo {
    pub handle: u32,
    pub storage_id: u32,
    pub parent: u32,
    pub name: String,
    pub size_bytes: Option<u64>,
    pub modified: Option<String>,
    pub format_code: u16,
    pub is_directory: bool,
    #[serde(skip)]
    pub properties: BTreeMap<u16, TypedValue>,
}

/// Session event routed out of the event pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    ObjectAdded(u32),
    ObjectRemoved(u32),
    ObjectMoved(u32),
    StorageInfoChanged(u32),
}

/// Byte range of a partial read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub len: u64,
}
