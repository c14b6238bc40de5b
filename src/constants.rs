//! ## Constants
//!
//! PTP/MTP code tables and crate-wide defaults.
//!

pub mod usb {
    /// The interface class for PTP/MTP ("Still Image")
    pub const STILL_IMAGE_CLASS_CODE: u8 = 0x06;
    /// Still Image subclass
    pub const STILL_IMAGE_SUBCLASS_CODE: u8 = 0x01;
    /// Still Image protocol
    pub const STILL_IMAGE_PROTOCOL_CODE: u8 = 0x01;
    /// Vendor-specific class; many Android phones expose MTP here
    pub const VENDOR_SPECIFIC_CLASS_CODE: u8 = 0xFF;
    /// Subclass used by vendor-specific MTP interfaces
    pub const MTP_VENDOR_SUBCLASS_CODE: u8 = 0xFF;
    /// Protocol used by vendor-specific MTP interfaces
    pub const MTP_VENDOR_PROTOCOL_CODE: u8 = 0x00;

    /// bRequest of the PTP class "Device Reset" request
    pub const CLASS_REQUEST_DEVICE_RESET: u8 = 0x66;
    /// bRequest of the PTP class "Cancel" request
    pub const CLASS_REQUEST_CANCEL: u8 = 0x64;
}

pub mod container_type {
    pub const COMMAND: u16 = 1;
    pub const DATA: u16 = 2;
    pub const RESPONSE: u16 = 3;
    pub const EVENT: u16 = 4;
}

#[allow(unused)]
pub mod op {
    pub const GET_DEVICE_INFO: u16 = 0x1001;
    pub const OPEN_SESSION: u16 = 0x1002;
    pub const CLOSE_SESSION: u16 = 0x1003;
    pub const GET_STORAGE_IDS: u16 = 0x1004;
    pub const GET_STORAGE_INFO: u16 = 0x1005;
    pub const GET_NUM_OBJECTS: u16 = 0x1006;
    pub const GET_OBJECT_HANDLES: u16 = 0x1007;
    pub const GET_OBJECT_INFO: u16 = 0x1008;
    pub const GET_OBJECT: u16 = 0x1009;
    pub const DELETE_OBJECT: u16 = 0x100B;
    pub const SEND_OBJECT_INFO: u16 = 0x100C;
    pub const SEND_OBJECT: u16 = 0x100D;
    pub const RESET_DEVICE: u16 = 0x1010;
    pub const MOVE_OBJECT: u16 = 0x1019;
    pub const GET_PARTIAL_OBJECT: u16 = 0x101B;
    pub const GET_OBJECT_PROPS_SUPPORTED: u16 = 0x9801;
    pub const GET_OBJECT_PROP_VALUE: u16 = 0x9803;
    pub const SET_OBJECT_PROP_VALUE: u16 = 0x9804;
    pub const GET_OBJECT_PROP_LIST: u16 = 0x9805;
    pub const GET_PARTIAL_OBJECT_64: u16 = 0x95C1;
    pub const SEND_PARTIAL_OBJECT: u16 = 0x95C2;
    pub const TRUNCATE_OBJECT: u16 = 0x95C3;
    pub const BEGIN_EDIT_OBJECT: u16 = 0x95C4;
    pub const END_EDIT_OBJECT: u16 = 0x95C5;
}

#[allow(unused)]
pub mod rc {
    pub const OK: u16 = 0x2001;
    pub const GENERAL_ERROR: u16 = 0x2002;
    pub const SESSION_NOT_OPEN: u16 = 0x2003;
    pub const INVALID_TRANSACTION_ID: u16 = 0x2004;
    pub const OPERATION_NOT_SUPPORTED: u16 = 0x2005;
    pub const INCOMPLETE_TRANSFER: u16 = 0x2007;
    pub const INVALID_STORAGE_ID: u16 = 0x2008;
    pub const INVALID_OBJECT_HANDLE: u16 = 0x2009;
    pub const STORE_FULL: u16 = 0x200C;
    pub const OBJECT_WRITE_PROTECTED: u16 = 0x200D;
    pub const STORE_READ_ONLY: u16 = 0x200E;
    pub const ACCESS_DENIED: u16 = 0x200F;
    pub const DEVICE_BUSY: u16 = 0x2019;
    pub const INVALID_PARENT_OBJECT: u16 = 0x201A;
    pub const SESSION_ALREADY_OPEN: u16 = 0x201E;
    pub const TRANSACTION_CANCELLED: u16 = 0x201F;
    pub const INVALID_OBJECT_PROP_CODE: u16 = 0xA801;
    pub const SPECIFICATION_BY_GROUP_UNSUPPORTED: u16 = 0xA807;
}

#[allow(unused)]
pub mod event {
    pub const CANCEL_TRANSACTION: u16 = 0x4001;
    pub const OBJECT_ADDED: u16 = 0x4002;
    pub const OBJECT_REMOVED: u16 = 0x4003;
    pub const OBJECT_MOVED: u16 = 0x4004;
    pub const DEVICE_PROP_CHANGED: u16 = 0x4006;
    pub const STORAGE_INFO_CHANGED: u16 = 0x400C;
}

#[allow(unused)]
pub mod fmt {
    /// Undefined binary object
    pub const UNDEFINED: u16 = 0x3000;
    /// Association: the directory format code
    pub const ASSOCIATION: u16 = 0x3001;
}

#[allow(unused)]
pub mod prop {
    pub const STORAGE_ID: u16 = 0xDC01;
    pub const OBJECT_FORMAT: u16 = 0xDC02;
    pub const OBJECT_SIZE: u16 = 0xDC04;
    pub const OBJECT_FILE_NAME: u16 = 0xDC07;
    pub const DATE_MODIFIED: u16 = 0xDC09;
    pub const PARENT_OBJECT: u16 = 0xDC0B;
    pub const PERSISTENT_UID: u16 = 0xDC41;
    pub const NAME: u16 = 0xDC44;
}

pub mod defaults {
    use std::time::Duration;

    /// Baseline transfer chunk before any tuning layer applies
    pub const MAX_CHUNK_BYTES: usize = 1024 * 1024;
    /// Floor the chunk-fallback ladder never goes below
    pub const MIN_CHUNK_BYTES: usize = 256 * 1024;
    /// Buffers pre-allocated by the transfer pipeline pool
    pub const PIPELINE_POOL_BUFFERS: usize = 16;
    /// The size in bytes of a PTP container header
    pub const CONTAINER_HEADER_SIZE: usize = 12;

    pub const IO_TIMEOUT: Duration = Duration::from_secs(10);
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
    pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(15);
    pub const OVERALL_DEADLINE: Duration = Duration::from_secs(600);
    pub const STABILIZE_DELAY: Duration = Duration::from_millis(0);
    pub const EVENT_PUMP_DELAY: Duration = Duration::from_millis(250);
    pub const PROGRESS_THROTTLE: Duration = Duration::from_millis(200);

    /// Conservative values forced by safe mode
    pub const SAFE_MAX_CHUNK_BYTES: usize = 128 * 1024;
    pub const SAFE_IO_TIMEOUT: Duration = Duration::from_secs(30);
    pub const SAFE_OVERALL_DEADLINE: Duration = Duration::from_secs(300);

    /// Capacity of the diagnostics transaction ring
    pub const TIMELINE_CAPACITY: usize = 1000;
    /// Capacity of the event fan-out channel before drop-oldest kicks in
    pub const EVENT_CHANNEL_CAPACITY: usize = 64;
    /// Handles requested per enumeration batch
    pub const LIST_BATCH_SIZE: usize = 256;
}
