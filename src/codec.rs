//! ## Wire Codec
//!
//! Little-endian encode/decode of PTP container headers, typed MTP
//! values and property lists.
//!
//! Decoding is total: every function returns `CodecError` on malformed
//! input and never panics. Type dispatch goes through an explicit code
//! table; bit-14 of the type code is the array bit on paper, but the
//! string type 0xFFFF carries it too, so masking is never used to
//! route a value.
//!

use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;

use crate::constants::{container_type, defaults::CONTAINER_HEADER_SIZE};
use crate::error::CodecError;
use crate::types::{MtpDeviceInfo, ObjectInfo, StorageInfo};

// ==========
// CURSOR
// ==========

/// Bounds-checked little-endian reader over a byte slice.
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> ByteReader<'a> {
        ByteReader { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::Truncated {
                offset: self.pos,
                needed: n - self.remaining(),
            });
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8, CodecError> {
        Ok(self.take(1)?[0] as i8)
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    pub fn read_i16(&mut self) -> Result<i16, CodecError> {
        Ok(LittleEndian::read_i16(self.take(2)?))
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    pub fn read_i32(&mut self) -> Result<i32, CodecError> {
        Ok(LittleEndian::read_i32(self.take(4)?))
    }

    pub fn read_u64(&mut self) -> Result<u64, CodecError> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    pub fn read_i64(&mut self) -> Result<i64, CodecError> {
        Ok(LittleEndian::read_i64(self.take(8)?))
    }

    pub fn read_u128(&mut self) -> Result<u128, CodecError> {
        Ok(LittleEndian::read_u128(self.take(16)?))
    }

    pub fn read_i128(&mut self) -> Result<i128, CodecError> {
        Ok(LittleEndian::read_i128(self.take(16)?))
    }

    /// UTF-16LE string: u8 count of code units including the trailing
    /// NUL; an empty string is a single 0 byte.
    pub fn read_string(&mut self) -> Result<String, CodecError> {
        let count = self.read_u8()? as usize;
        if count == 0 {
            return Ok(String::new());
        }
        let raw = self.take(count * 2)?;
        let mut units = Vec::with_capacity(count);
        for pair in raw.chunks_exact(2) {
            units.push(LittleEndian::read_u16(pair));
        }
        // the final unit is the NUL terminator
        match units.pop() {
            Some(0) => {}
            _ => return Err(CodecError::BadString),
        }
        String::from_utf16(&units).map_err(|_| CodecError::BadString)
    }

    /// Lenient string read for devices whose property lists omit the
    /// trailing NUL, or whose count field counts bytes instead of
    /// UTF-16 code units.
    pub fn read_string_lenient(&mut self, count_is_bytes: bool) -> Result<String, CodecError> {
        let count = self.read_u8()? as usize;
        if count == 0 {
            return Ok(String::new());
        }
        let unit_count = if count_is_bytes { count / 2 } else { count };
        let raw = self.take(unit_count * 2)?;
        let mut units = Vec::with_capacity(unit_count);
        for pair in raw.chunks_exact(2) {
            units.push(LittleEndian::read_u16(pair));
        }
        if units.last() == Some(&0) {
            units.pop();
        }
        String::from_utf16(&units).map_err(|_| CodecError::BadString)
    }
}

// ==========
// WRITER HELPERS
// ==========

pub fn put_u16(out: &mut Vec<u8>, v: u16) {
    let mut b = [0u8; 2];
    LittleEndian::write_u16(&mut b, v);
    out.extend_from_slice(&b);
}

pub fn put_u32(out: &mut Vec<u8>, v: u32) {
    let mut b = [0u8; 4];
    LittleEndian::write_u32(&mut b, v);
    out.extend_from_slice(&b);
}

pub fn put_u64(out: &mut Vec<u8>, v: u64) {
    let mut b = [0u8; 8];
    LittleEndian::write_u64(&mut b, v);
    out.extend_from_slice(&b);
}

pub fn put_u128(out: &mut Vec<u8>, v: u128) {
    let mut b = [0u8; 16];
    LittleEndian::write_u128(&mut b, v);
    out.extend_from_slice(&b);
}

/// Encode a string as u8 code-unit count (including trailing NUL)
/// followed by UTF-16LE units. Empty string encodes as a single 0.
pub fn put_string(out: &mut Vec<u8>, s: &str) {
    let units: Vec<u16> = s.encode_utf16().collect();
    if units.is_empty() {
        out.push(0);
        return;
    }
    // count byte caps the string at 254 units plus NUL
    let take = units.len().min(254);
    out.push((take + 1) as u8);
    for u in &units[..take] {
        put_u16(out, *u);
    }
    put_u16(out, 0);
}

// ==========
// CONTAINERS
// ==========

/// ### PtpContainer
///
/// Header of one command, data, response or event container, plus its
/// parameters (command/response/event) or payload length (data).
///
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PtpContainer {
    pub kind: ContainerKind,
    pub code: u16,
    pub transaction_id: u32,
    pub params: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ContainerKind {
    Command,
    Data,
    Response,
    Event,
}

impl ContainerKind {
    pub fn code(self) -> u16 {
        match self {
            ContainerKind::Command => container_type::COMMAND,
            ContainerKind::Data => container_type::DATA,
            ContainerKind::Response => container_type::RESPONSE,
            ContainerKind::Event => container_type::EVENT,
        }
    }

    pub fn from_code(code: u16) -> Option<ContainerKind> {
        match code {
            container_type::COMMAND => Some(ContainerKind::Command),
            container_type::DATA => Some(ContainerKind::Data),
            container_type::RESPONSE => Some(ContainerKind::Response),
            container_type::EVENT => Some(ContainerKind::Event),
            _ => None,
        }
    }
}

/// Decoded container header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerHeader {
    pub length: u32,
    pub kind: ContainerKind,
    pub code: u16,
    pub transaction_id: u32,
}

impl ContainerHeader {
    /// Payload bytes following the 12-byte header.
    pub fn payload_len(&self) -> usize {
        self.length as usize - CONTAINER_HEADER_SIZE
    }
}

/// Parse the 12-byte container header off the front of `buf`.
pub fn decode_container_header(buf: &[u8]) -> Result<ContainerHeader, CodecError> {
    let mut r = ByteReader::new(buf);
    let length = r.read_u32()?;
    let kind_code = r.read_u16()?;
    let code = r.read_u16()?;
    let transaction_id = r.read_u32()?;

    if (length as usize) < CONTAINER_HEADER_SIZE {
        return Err(CodecError::BadContainer("declared length below header size"));
    }
    let kind = ContainerKind::from_code(kind_code)
        .ok_or(CodecError::BadContainer("unknown container type"))?;
    Ok(ContainerHeader {
        length,
        kind,
        code,
        transaction_id,
    })
}

/// Encode a command/response/event container with up to five params.
pub fn encode_container(c: &PtpContainer) -> Result<Vec<u8>, CodecError> {
    if c.params.len() > 5 {
        return Err(CodecError::BadContainer("more than five parameters"));
    }
    let mut out = Vec::with_capacity(CONTAINER_HEADER_SIZE + c.params.len() * 4);
    put_u32(&mut out, (CONTAINER_HEADER_SIZE + c.params.len() * 4) as u32);
    put_u16(&mut out, c.kind.code());
    put_u16(&mut out, c.code);
    put_u32(&mut out, c.transaction_id);
    for p in &c.params {
        put_u32(&mut out, *p);
    }
    Ok(out)
}

/// Encode the header of a data container announcing `payload_len` bytes.
pub fn encode_data_header(code: u16, transaction_id: u32, payload_len: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(CONTAINER_HEADER_SIZE);
    // lengths past u32::MAX are streamed with the 0xFFFFFFFF marker
    let declared = (payload_len + CONTAINER_HEADER_SIZE as u64).min(u32::MAX as u64) as u32;
    put_u32(&mut out, declared);
    put_u16(&mut out, container_type::DATA);
    put_u16(&mut out, code);
    put_u32(&mut out, transaction_id);
    out
}

/// Decode a full non-data container (header plus params).
pub fn decode_container(buf: &[u8]) -> Result<PtpContainer, CodecError> {
    let header = decode_container_header(buf)?;
    let declared = header.length as usize;
    if buf.len() < declared {
        return Err(CodecError::Truncated {
            offset: buf.len(),
            needed: declared - buf.len(),
        });
    }
    let param_bytes = declared - CONTAINER_HEADER_SIZE;
    if param_bytes % 4 != 0 || param_bytes > 20 {
        return Err(CodecError::BadContainer("parameter block not 0..5 u32s"));
    }
    let mut r = ByteReader::new(&buf[CONTAINER_HEADER_SIZE..declared]);
    let mut params = Vec::with_capacity(param_bytes / 4);
    for _ in 0..param_bytes / 4 {
        params.push(r.read_u32()?);
    }
    Ok(PtpContainer {
        kind: header.kind,
        code: header.code,
        transaction_id: header.transaction_id,
        params,
    })
}

// ==========
// TYPED VALUES
// ==========

/// Data type codes of the MTP typed-value encoding.
#[allow(unused)]
pub mod data_type {
    pub const UNDEF: u16 = 0x0000;
    pub const INT8: u16 = 0x0001;
    pub const UINT8: u16 = 0x0002;
    pub const INT16: u16 = 0x0003;
    pub const UINT16: u16 = 0x0004;
    pub const INT32: u16 = 0x0005;
    pub const UINT32: u16 = 0x0006;
    pub const INT64: u16 = 0x0007;
    pub const UINT64: u16 = 0x0008;
    pub const INT128: u16 = 0x0009;
    pub const UINT128: u16 = 0x000A;
    pub const AINT8: u16 = 0x4001;
    pub const AUINT8: u16 = 0x4002;
    pub const AINT16: u16 = 0x4003;
    pub const AUINT16: u16 = 0x4004;
    pub const AINT32: u16 = 0x4005;
    pub const AUINT32: u16 = 0x4006;
    pub const AINT64: u16 = 0x4007;
    pub const AUINT64: u16 = 0x4008;
    pub const AINT128: u16 = 0x4009;
    pub const AUINT128: u16 = 0x400A;
    /// Shares bit 14 with the array range; must never be mask-routed
    pub const STR: u16 = 0xFFFF;
}

/// ### TypedValue
///
/// One MTP typed value as carried in property lists and property
/// get/set payloads.
///
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TypedValue {
    Undefined,
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    I128(i128),
    U128(u128),
    AI8(Vec<i8>),
    AU8(Vec<u8>),
    AI16(Vec<i16>),
    AU16(Vec<u16>),
    AI32(Vec<i32>),
    AU32(Vec<u32>),
    AI64(Vec<i64>),
    AU64(Vec<u64>),
    AI128(Vec<i128>),
    AU128(Vec<u128>),
    Str(String),
}

macro_rules! read_array {
    ($r:expr, $read:ident) => {{
        let count = $r.read_u32()? as usize;
        let mut v = Vec::with_capacity(count.min(1 << 16));
        for _ in 0..count {
            v.push($r.$read()?);
        }
        v
    }};
}

impl TypedValue {
    pub fn type_code(&self) -> u16 {
        use data_type::*;
        match self {
            TypedValue::Undefined => UNDEF,
            TypedValue::I8(_) => INT8,
            TypedValue::U8(_) => UINT8,
            TypedValue::I16(_) => INT16,
            TypedValue::U16(_) => UINT16,
            TypedValue::I32(_) => INT32,
            TypedValue::U32(_) => UINT32,
            TypedValue::I64(_) => INT64,
            TypedValue::U64(_) => UINT64,
            TypedValue::I128(_) => INT128,
            TypedValue::U128(_) => UINT128,
            TypedValue::AI8(_) => AINT8,
            TypedValue::AU8(_) => AUINT8,
            TypedValue::AI16(_) => AINT16,
            TypedValue::AU16(_) => AUINT16,
            TypedValue::AI32(_) => AINT32,
            TypedValue::AU32(_) => AUINT32,
            TypedValue::AI64(_) => AINT64,
            TypedValue::AU64(_) => AUINT64,
            TypedValue::AI128(_) => AINT128,
            TypedValue::AU128(_) => AUINT128,
            TypedValue::Str(_) => STR,
        }
    }

    /// Decode one value of the given wire type. Dispatch is a full
    /// match on the code table; unknown codes fail with `BadType`.
    pub fn decode(type_code: u16, r: &mut ByteReader<'_>) -> Result<TypedValue, CodecError> {
        use data_type::*;
        Ok(match type_code {
            UNDEF => TypedValue::Undefined,
            INT8 => TypedValue::I8(r.read_i8()?),
            UINT8 => TypedValue::U8(r.read_u8()?),
            INT16 => TypedValue::I16(r.read_i16()?),
            UINT16 => TypedValue::U16(r.read_u16()?),
            INT32 => TypedValue::I32(r.read_i32()?),
            UINT32 => TypedValue::U32(r.read_u32()?),
            INT64 => TypedValue::I64(r.read_i64()?),
            UINT64 => TypedValue::U64(r.read_u64()?),
            INT128 => TypedValue::I128(r.read_i128()?),
            UINT128 => TypedValue::U128(r.read_u128()?),
            AINT8 => TypedValue::AI8(read_array!(r, read_i8)),
            AUINT8 => TypedValue::AU8(read_array!(r, read_u8)),
            AINT16 => TypedValue::AI16(read_array!(r, read_i16)),
            AUINT16 => TypedValue::AU16(read_array!(r, read_u16)),
            AINT32 => TypedValue::AI32(read_array!(r, read_i32)),
            AUINT32 => TypedValue::AU32(read_array!(r, read_u32)),
            AINT64 => TypedValue::AI64(read_array!(r, read_i64)),
            AUINT64 => TypedValue::AU64(read_array!(r, read_u64)),
            AINT128 => TypedValue::AI128(read_array!(r, read_i128)),
            AUINT128 => TypedValue::AU128(read_array!(r, read_u128)),
            STR => TypedValue::Str(r.read_string()?),
            other => return Err(CodecError::BadType(other)),
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            TypedValue::Undefined => {}
            TypedValue::I8(v) => out.push(*v as u8),
            TypedValue::U8(v) => out.push(*v),
            TypedValue::I16(v) => put_u16(out, *v as u16),
            TypedValue::U16(v) => put_u16(out, *v),
            TypedValue::I32(v) => put_u32(out, *v as u32),
            TypedValue::U32(v) => put_u32(out, *v),
            TypedValue::I64(v) => put_u64(out, *v as u64),
            TypedValue::U64(v) => put_u64(out, *v),
            TypedValue::I128(v) => put_u128(out, *v as u128),
            TypedValue::U128(v) => put_u128(out, *v),
            TypedValue::AI8(v) => {
                put_u32(out, v.len() as u32);
                out.extend(v.iter().map(|x| *x as u8));
            }
            TypedValue::AU8(v) => {
                put_u32(out, v.len() as u32);
                out.extend_from_slice(v);
            }
            TypedValue::AI16(v) => {
                put_u32(out, v.len() as u32);
                v.iter().for_each(|x| put_u16(out, *x as u16));
            }
            TypedValue::AU16(v) => {
                put_u32(out, v.len() as u32);
                v.iter().for_each(|x| put_u16(out, *x));
            }
            TypedValue::AI32(v) => {
                put_u32(out, v.len() as u32);
                v.iter().for_each(|x| put_u32(out, *x as u32));
            }
            TypedValue::AU32(v) => {
                put_u32(out, v.len() as u32);
                v.iter().for_each(|x| put_u32(out, *x));
            }
            TypedValue::AI64(v) => {
                put_u32(out, v.len() as u32);
                v.iter().for_each(|x| put_u64(out, *x as u64));
            }
            TypedValue::AU64(v) => {
                put_u32(out, v.len() as u32);
                v.iter().for_each(|x| put_u64(out, *x));
            }
            TypedValue::AI128(v) => {
                put_u32(out, v.len() as u32);
                v.iter().for_each(|x| put_u128(out, *x as u128));
            }
            TypedValue::AU128(v) => {
                put_u32(out, v.len() as u32);
                v.iter().for_each(|x| put_u128(out, *x));
            }
            TypedValue::Str(s) => put_string(out, s),
        }
    }

    /// Widen any unsigned scalar to u64.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            TypedValue::U8(v) => Some(*v as u64),
            TypedValue::U16(v) => Some(*v as u64),
            TypedValue::U32(v) => Some(*v as u64),
            TypedValue::U64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            TypedValue::U8(v) => Some(*v as u32),
            TypedValue::U16(v) => Some(*v as u32),
            TypedValue::U32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u16(&self) -> Option<u16> {
        match self {
            TypedValue::U8(v) => Some(*v as u16),
            TypedValue::U16(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            TypedValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

// ==========
// PROPERTY LISTS
// ==========

/// One element of a GetObjectPropList payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropListEntry {
    pub handle: u32,
    pub prop_code: u16,
    pub data_type: u16,
    pub value: TypedValue,
}

/// String decode behavior for property lists, selected per quirk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StringLenience {
    /// Count is UTF-16 code units and the trailing NUL is mandatory
    #[default]
    Strict,
    /// Accept a missing trailing NUL
    MissingNul,
    /// Count field counts bytes, not code units
    CountIsBytes,
}

/// Decode `count; {handle, propCode, dataType, value}*`.
pub fn decode_prop_list(
    buf: &[u8],
    lenience: StringLenience,
) -> Result<Vec<PropListEntry>, CodecError> {
    let mut r = ByteReader::new(buf);
    let count = r.read_u32()? as usize;
    let mut entries = Vec::with_capacity(count.min(1 << 16));
    for _ in 0..count {
        let handle = r.read_u32()?;
        let prop_code = r.read_u16()?;
        let data_type = r.read_u16()?;
        let value = match (data_type, lenience) {
            (data_type::STR, StringLenience::Strict) => TypedValue::Str(r.read_string()?),
            (data_type::STR, StringLenience::MissingNul) => {
                TypedValue::Str(r.read_string_lenient(false)?)
            }
            (data_type::STR, StringLenience::CountIsBytes) => {
                TypedValue::Str(r.read_string_lenient(true)?)
            }
            (code, _) => TypedValue::decode(code, &mut r)?,
        };
        entries.push(PropListEntry {
            handle,
            prop_code,
            data_type,
            value,
        });
    }
    Ok(entries)
}

pub fn encode_prop_list(entries: &[PropListEntry], out: &mut Vec<u8>) {
    put_u32(out, entries.len() as u32);
    for e in entries {
        put_u32(out, e.handle);
        put_u16(out, e.prop_code);
        put_u16(out, e.data_type);
        e.value.encode(out);
    }
}

// ==========
// DATASETS
// ==========

fn read_u16_array(r: &mut ByteReader<'_>) -> Result<Vec<u16>, CodecError> {
    Ok(read_array!(r, read_u16))
}

/// Decode a plain u32 array payload (storage ids, object handles).
pub fn decode_u32_array(buf: &[u8]) -> Result<Vec<u32>, CodecError> {
    let mut r = ByteReader::new(buf);
    Ok(read_array!(r, read_u32))
}

/// Decode the GetDeviceInfo dataset.
pub fn decode_device_info(buf: &[u8]) -> Result<MtpDeviceInfo, CodecError> {
    let mut r = ByteReader::new(buf);
    Ok(MtpDeviceInfo {
        standard_version: r.read_u16()?,
        vendor_extension_id: r.read_u32()?,
        vendor_extension_version: r.read_u16()?,
        vendor_extension_desc: r.read_string()?,
        functional_mode: r.read_u16()?,
        operations_supported: read_u16_array(&mut r)?,
        events_supported: read_u16_array(&mut r)?,
        device_properties_supported: read_u16_array(&mut r)?,
        capture_formats: read_u16_array(&mut r)?,
        playback_formats: read_u16_array(&mut r)?,
        manufacturer: r.read_string()?,
        model: r.read_string()?,
        device_version: r.read_string()?,
        serial_number: r.read_string()?,
    })
}

/// Decode the GetStorageInfo dataset for `storage_id`.
pub fn decode_storage_info(storage_id: u32, buf: &[u8]) -> Result<StorageInfo, CodecError> {
    let mut r = ByteReader::new(buf);
    let _storage_type = r.read_u16()?;
    let file_system_type = r.read_u16()?;
    let access_capability = r.read_u16()?;
    let capacity_bytes = r.read_u64()?;
    let free_bytes = r.read_u64()?;
    let _free_images = r.read_u32()?;
    let description = r.read_string()?;
    let volume_label = r.read_string()?;
    Ok(StorageInfo {
        storage_id,
        description: if description.is_empty() {
            volume_label
        } else {
            description
        },
        capacity_bytes,
        // some devices report free space above capacity after a format
        free_bytes: free_bytes.min(capacity_bytes),
        read_only: access_capability != 0,
        file_system_type,
    })
}

/// Decode the GetObjectInfo dataset for `handle`.
pub fn decode_object_info(handle: u32, buf: &[u8]) -> Result<ObjectInfo, CodecError> {
    let mut r = ByteReader::new(buf);
    let storage_id = r.read_u32()?;
    let format_code = r.read_u16()?;
    let _protection_status = r.read_u16()?;
    let compressed_size = r.read_u32()?;
    let _thumb_format = r.read_u16()?;
    let _thumb_size = r.read_u32()?;
    let _thumb_w = r.read_u32()?;
    let _thumb_h = r.read_u32()?;
    let _image_w = r.read_u32()?;
    let _image_h = r.read_u32()?;
    let _image_depth = r.read_u32()?;
    let parent = r.read_u32()?;
    let _association_type = r.read_u16()?;
    let _association_desc = r.read_u32()?;
    let _sequence_number = r.read_u32()?;
    let filename = r.read_string()?;
    let _capture_date = r.read_string()?;
    let modification_date = r.read_string()?;
    let _keywords = r.read_string()?;

    let is_directory = format_code == crate::constants::fmt::ASSOCIATION;
    Ok(ObjectInfo {
        handle,
        storage_id,
        parent,
        name: normalize_name(&filename),
        // 0xFFFFFFFF means "larger than u32"; real size comes from props
        size_bytes: if compressed_size == u32::MAX {
            None
        } else {
            Some(compressed_size as u64)
        },
        modified: if modification_date.is_empty() {
            None
        } else {
            Some(modification_date)
        },
        format_code,
        is_directory,
        properties: Default::default(),
    })
}

/// Encode the SendObjectInfo dataset for a new object.
pub fn encode_object_info(
    storage_id: u32,
    parent: u32,
    name: &str,
    size_bytes: u64,
    format_code: u16,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 + name.len() * 2);
    put_u32(&mut out, storage_id);
    put_u16(&mut out, format_code);
    put_u16(&mut out, 0); // protection status
    put_u32(&mut out, size_bytes.min(u32::MAX as u64) as u32);
    put_u16(&mut out, 0); // thumb format
    put_u32(&mut out, 0); // thumb size
    put_u32(&mut out, 0); // thumb width
    put_u32(&mut out, 0); // thumb height
    put_u32(&mut out, 0); // image width
    put_u32(&mut out, 0); // image height
    put_u32(&mut out, 0); // image depth
    put_u32(&mut out, parent);
    put_u16(
        &mut out,
        if format_code == crate::constants::fmt::ASSOCIATION {
            1
        } else {
            0
        },
    );
    put_u32(&mut out, 0); // association desc
    put_u32(&mut out, 0); // sequence number
    put_string(&mut out, name);
    put_string(&mut out, ""); // capture date
    put_string(&mut out, ""); // modification date
    put_string(&mut out, ""); // keywords
    out
}

// ==========
// NAME NORMALIZATION
// ==========

/// Compose the combining sequences MTP devices emit in practice into
/// their precomposed form, so names compare stably as path components.
/// Covers the Latin-1 repertoire; sequences outside it pass through.
pub fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut chars = name.chars().peekable();
    while let Some(c) = chars.next() {
        let composed = match chars.peek() {
            Some(&mark @ '\u{0300}'..='\u{0327}') => compose_latin1(c, mark),
            _ => None,
        };
        match composed {
            Some(p) => {
                chars.next();
                out.push(p);
            }
            None => out.push(c),
        }
    }
    out
}

fn compose_latin1(base: char, mark: char) -> Option<char> {
    const GRAVE: char = '\u{0300}';
    const ACUTE: char = '\u{0301}';
    const CIRCUMFLEX: char = '\u{0302}';
    const TILDE: char = '\u{0303}';
    const DIAERESIS: char = '\u{0308}';
    const RING: char = '\u{030A}';
    const CEDILLA: char = '\u{0327}';

    let composed = match (base, mark) {
        ('A', GRAVE) => 'À',
        ('A', ACUTE) => 'Á',
        ('A', CIRCUMFLEX) => 'Â',
        ('A', TILDE) => 'Ã',
        ('A', DIAERESIS) => 'Ä',
        ('A', RING) => 'Å',
        ('C', CEDILLA) => 'Ç',
        ('E', GRAVE) => 'È',
        ('E', ACUTE) => 'É',
        ('E', CIRCUMFLEX) => 'Ê',
        ('E', DIAERESIS) => 'Ë',
        ('I', GRAVE) => 'Ì',
        ('I', ACUTE) => 'Í',
        ('I', CIRCUMFLEX) => 'Î',
        ('I', DIAERESIS) => 'Ï',
        ('N', TILDE) => 'Ñ',
        ('O', GRAVE) => 'Ò',
        ('O', ACUTE) => 'Ó',
        ('O', CIRCUMFLEX) => 'Ô',
        ('O', TILDE) => 'Õ',
        ('O', DIAERESIS) => 'Ö',
        ('U', GRAVE) => 'Ù',
        ('U', ACUTE) => 'Ú',
        ('U', CIRCUMFLEX) => 'Û',
        ('U', DIAERESIS) => 'Ü',
        ('Y', ACUTE) => 'Ý',
        ('a', GRAVE) => 'à',
        ('a', ACUTE) => 'á',
        ('a', CIRCUMFLEX) => 'â',
        ('a', TILDE) => 'ã',
        ('a', DIAERESIS) => 'ä',
        ('a', RING) => 'å',
        ('c', CEDILLA) => 'ç',
        ('e', GRAVE) => 'è',
        ('e', ACUTE) => 'é',
        ('e', CIRCUMFLEX) => 'ê',
        ('e', DIAERESIS) => 'ë',
        ('i', GRAVE) => 'ì',
        ('i', ACUTE) => 'í',
        ('i', CIRCUMFLEX) => 'î',
        ('i', DIAERESIS) => 'ï',
        ('n', TILDE) => 'ñ',
        ('o', GRAVE) => 'ò',
        ('o', ACUTE) => 'ó',
        ('o', CIRCUMFLEX) => 'ô',
        ('o', TILDE) => 'õ',
        ('o', DIAERESIS) => 'ö',
        ('u', GRAVE) => 'ù',
        ('u', ACUTE) => 'ú',
        ('u', CIRCUMFLEX) => 'û',
        ('u', DIAERESIS) => 'ü',
        ('y', ACUTE) => 'ý',
        ('y', DIAERESIS) => 'ÿ',
        _ => return None,
    };
    Some(composed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(v: TypedValue) {
        let mut buf = Vec::new();
        v.encode(&mut buf);
        let mut r = ByteReader::new(&buf);
        let decoded = TypedValue::decode(v.type_code(), &mut r).unwrap();
        assert_eq!(decoded, v);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn scalar_roundtrips() {
        roundtrip(TypedValue::I8(-5));
        roundtrip(TypedValue::U8(250));
        roundtrip(TypedValue::I16(-30_000));
        roundtrip(TypedValue::U16(65_000));
        roundtrip(TypedValue::I32(-2_000_000_000));
        roundtrip(TypedValue::U32(4_000_000_000));
        roundtrip(TypedValue::I64(i64::MIN));
        roundtrip(TypedValue::U64(u64::MAX));
        roundtrip(TypedValue::I128(i128::MIN));
        roundtrip(TypedValue::U128(u128::MAX));
    }

    #[test]
    fn array_roundtrips() {
        roundtrip(TypedValue::AI8(vec![-1, 0, 1]));
        roundtrip(TypedValue::AU8(vec![1, 2, 3]));
        roundtrip(TypedValue::AI16(vec![-7, 7]));
        roundtrip(TypedValue::AU16(vec![0x1001, 0x1002]));
        roundtrip(TypedValue::AI32(vec![i32::MIN, i32::MAX]));
        roundtrip(TypedValue::AU32(vec![0x00010001]));
        roundtrip(TypedValue::AI64(vec![-9]));
        roundtrip(TypedValue::AU64(vec![u64::MAX, 0]));
        roundtrip(TypedValue::AI128(vec![1]));
        roundtrip(TypedValue::AU128(vec![]));
    }

    #[test]
    fn string_roundtrips() {
        roundtrip(TypedValue::Str(String::new()));
        roundtrip(TypedValue::Str("IMG_0001.JPG".into()));
        roundtrip(TypedValue::Str("téléphone".into()));
    }

    #[test]
    fn empty_string_is_single_zero_byte() {
        let mut buf = Vec::new();
        put_string(&mut buf, "");
        assert_eq!(buf, vec![0]);
    }

    #[test]
    fn string_count_includes_trailing_nul() {
        let mut buf = Vec::new();
        put_string(&mut buf, "ab");
        assert_eq!(buf[0], 3);
        assert_eq!(&buf[1..], &[b'a', 0, b'b', 0, 0, 0]);
    }

    #[test]
    fn string_without_nul_fails_strict_and_passes_lenient() {
        // count 2, units "ab", no terminator
        let buf = [2u8, b'a', 0, b'b', 0];
        let mut r = ByteReader::new(&buf);
        assert_eq!(r.read_string(), Err(CodecError::BadString));
        let mut r = ByteReader::new(&buf);
        assert_eq!(r.read_string_lenient(false).unwrap(), "ab");
    }

    #[test]
    fn undefined_encodes_nothing() {
        let mut buf = Vec::new();
        TypedValue::Undefined.encode(&mut buf);
        assert!(buf.is_empty());
        let mut r = ByteReader::new(&[]);
        assert_eq!(
            TypedValue::decode(data_type::UNDEF, &mut r).unwrap(),
            TypedValue::Undefined
        );
    }

    #[test]
    fn string_type_never_routes_through_array_mask() {
        // 0xFFFF has bit 14 set like the array codes; the dispatch
        // table must still decode it as a string, not a u128 array.
        let mut buf = Vec::new();
        put_string(&mut buf, "x");
        let mut r = ByteReader::new(&buf);
        let v = TypedValue::decode(0xFFFF, &mut r).unwrap();
        assert_eq!(v, TypedValue::Str("x".into()));
    }

    #[test]
    fn unknown_type_is_bad_type() {
        let mut r = ByteReader::new(&[0, 0, 0, 0]);
        assert_eq!(
            TypedValue::decode(0x4002 | 0x0800, &mut r),
            Err(CodecError::BadType(0x4802))
        );
    }

    #[test]
    fn truncation_never_panics() {
        let mut full = Vec::new();
        let value = TypedValue::AU32(vec![1, 2, 3, 4]);
        value.encode(&mut full);
        for cut in 0..full.len() {
            let mut r = ByteReader::new(&full[..cut]);
            let res = TypedValue::decode(value.type_code(), &mut r);
            assert!(matches!(res, Err(CodecError::Truncated { .. })), "cut={cut}");
        }
    }

    #[test]
    fn container_roundtrip() {
        let c = PtpContainer {
            kind: ContainerKind::Command,
            code: 0x1004,
            transaction_id: 7,
            params: vec![0xFFFFFFFF, 0, 2],
        };
        let buf = encode_container(&c).unwrap();
        assert_eq!(buf.len(), 24);
        assert_eq!(decode_container(&buf).unwrap(), c);
    }

    #[test]
    fn container_header_rejects_short_length() {
        let mut buf = Vec::new();
        put_u32(&mut buf, 8); // below header size
        put_u16(&mut buf, 1);
        put_u16(&mut buf, 0x1001);
        put_u32(&mut buf, 1);
        assert!(matches!(
            decode_container_header(&buf),
            Err(CodecError::BadContainer(_))
        ));
    }

    #[test]
    fn container_header_truncation() {
        let c = PtpContainer {
            kind: ContainerKind::Response,
            code: 0x2001,
            transaction_id: 3,
            params: vec![],
        };
        let buf = encode_container(&c).unwrap();
        for cut in 0..buf.len() {
            assert!(decode_container(&buf[..cut]).is_err(), "cut={cut}");
        }
    }

    #[test]
    fn prop_list_roundtrip() {
        let entries = vec![
            PropListEntry {
                handle: 0x10,
                prop_code: crate::constants::prop::OBJECT_SIZE,
                data_type: data_type::UINT64,
                value: TypedValue::U64(123_456),
            },
            PropListEntry {
                handle: 0x10,
                prop_code: crate::constants::prop::OBJECT_FILE_NAME,
                data_type: data_type::STR,
                value: TypedValue::Str("notes.txt".into()),
            },
        ];
        let mut buf = Vec::new();
        encode_prop_list(&entries, &mut buf);
        let decoded = decode_prop_list(&buf, StringLenience::Strict).unwrap();
        assert_eq!(decoded, entries);
    }

    #[test]
    fn device_info_decodes() {
        let mut buf = Vec::new();
        put_u16(&mut buf, 100); // standard version
        put_u32(&mut buf, 6); // vendor extension id
        put_u16(&mut buf, 100);
        put_string(&mut buf, "microsoft.com: 1.0");
        put_u16(&mut buf, 0);
        TypedValue::AU16(vec![0x1001, 0x1002, 0x95C1]).encode(&mut buf);
        TypedValue::AU16(vec![0x4002]).encode(&mut buf);
        TypedValue::AU16(vec![]).encode(&mut buf);
        TypedValue::AU16(vec![]).encode(&mut buf);
        TypedValue::AU16(vec![0x3001]).encode(&mut buf);
        put_string(&mut buf, "Acme");
        put_string(&mut buf, "Phone 7");
        put_string(&mut buf, "1.0");
        put_string(&mut buf, "SER123");
        let info = decode_device_info(&buf).unwrap();
        assert_eq!(info.model, "Phone 7");
        assert!(info.supports_op(0x95C1));
        assert_eq!(info.serial_number, "SER123");
    }

    #[test]
    fn storage_info_clamps_free_space() {
        let mut buf = Vec::new();
        put_u16(&mut buf, 3); // storage type
        put_u16(&mut buf, 2); // fs type
        put_u16(&mut buf, 0); // access
        put_u64(&mut buf, 1000);
        put_u64(&mut buf, 5000); // free > capacity
        put_u32(&mut buf, 0);
        put_string(&mut buf, "Internal storage");
        put_string(&mut buf, "");
        let si = decode_storage_info(0x00010001, &buf).unwrap();
        assert_eq!(si.free_bytes, 1000);
        assert!(!si.read_only);
    }

    #[test]
    fn object_info_roundtrip_via_encode() {
        let buf = encode_object_info(0x00010001, 0, "dir", 0, crate::constants::fmt::ASSOCIATION);
        let info = decode_object_info(42, &buf).unwrap();
        assert!(info.is_directory);
        assert_eq!(info.name, "dir");
        assert_eq!(info.parent, 0);
        assert_eq!(info.handle, 42);
    }

    #[test]
    fn names_compose_to_nfc() {
        assert_eq!(normalize_name("Cafe\u{0301}"), "Café");
        assert_eq!(normalize_name("plain"), "plain");
        assert_eq!(normalize_name("u\u{0308}ber"), "über");
    }
}
