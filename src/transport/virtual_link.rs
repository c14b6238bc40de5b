//! ## Virtual Link
//!
//! A scripted in-memory device that satisfies the same transport
//! contract as real hardware. The test suite programs faults (stalls,
//! busy responses, detach) and preloads storages/objects, then drives
//! the full engine/session/pipeline stack against it.
//!

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::codec::{
    self, decode_container_header, encode_container, put_string, put_u16, put_u32, ByteReader,
    ContainerKind, PtpContainer, TypedValue,
};
use crate::constants::defaults::CONTAINER_HEADER_SIZE;
use crate::constants::{event, fmt, op, rc};
use crate::error::TransportError;

use super::{BulkLink, EndpointSel, InterruptReader};

/// Objects and volumes preloaded into the device model.
#[derive(Debug, Clone)]
struct VirtualObject {
    storage_id: u32,
    parent: u32,
    name: String,
    format_code: u16,
    data: Vec<u8>,
}

impl VirtualObject {
    fn is_directory(&self) -> bool {
        self.format_code == fmt::ASSOCIATION
    }
}

#[derive(Debug, Clone)]
struct VirtualStorage {
    description: String,
    capacity_bytes: u64,
    free_bytes: u64,
    read_only: bool,
}

/// Busy script: reject partial reads/writes larger than a threshold.
#[derive(Debug, Clone, Copy)]
struct BusyAboveChunk {
    op: u16,
    min_offset: u64,
    max_ok_len: u64,
}

/// A data-out phase in flight: command seen, payload accumulating.
struct PendingDataOut {
    command: PtpContainer,
    declared_len: Option<usize>,
    buf: Vec<u8>,
}

struct VirtualState {
    // identity
    manufacturer: String,
    model: String,
    serial: String,
    operations: Vec<u16>,

    storages: BTreeMap<u32, VirtualStorage>,
    objects: BTreeMap<u32, VirtualObject>,
    next_handle: u32,

    session_open: bool,
    detached: bool,

    // wire queues
    outbound: VecDeque<Vec<u8>>,
    events: VecDeque<Vec<u8>>,
    pending_out: Option<PendingDataOut>,
    // SendObjectInfo result waiting for its SendObject
    staged_object: Option<u32>,

    // fault scripts
    read_stalls: u32,
    write_stalls: u32,
    read_delay: Option<Duration>,
    busy_above: Option<BusyAboveChunk>,
    forced_responses: BTreeMap<u16, VecDeque<u16>>,

    // observability for tests
    clear_halt_calls: u32,
    reset_calls: u32,
}

/// ### VirtualDevice
///
/// Shared handle to the device model. Clone it into a [`VirtualLink`]
/// and keep a copy in the test to script faults and inspect state.
///
#[derive(Clone)]
pub struct VirtualDevice {
    state: Arc<Mutex<VirtualState>>,
}

pub struct VirtualDeviceBuilder {
    manufacturer: String,
    model: String,
    serial: String,
    operations: Vec<u16>,
    storages: Vec<(u32, VirtualStorage)>,
}

impl VirtualDeviceBuilder {
    pub fn model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    pub fn serial(mut self, serial: &str) -> Self {
        self.serial = serial.to_string();
        self
    }

    /// Remove an operation from the supported set, to exercise
    /// fallback paths.
    pub fn without_op(mut self, code: u16) -> Self {
        self.operations.retain(|&c| c != code);
        self
    }

    pub fn storage(mut self, id: u32, description: &str, capacity: u64, free: u64) -> Self {
        self.storages.push((
            id,
            VirtualStorage {
                description: description.to_string(),
                capacity_bytes: capacity,
                free_bytes: free,
                read_only: false,
            },
        ));
        self
    }

    pub fn read_only_storage(mut self, id: u32, description: &str, capacity: u64) -> Self {
        self.storages.push((
            id,
            VirtualStorage {
                description: description.to_string(),
                capacity_bytes: capacity,
                free_bytes: 0,
                read_only: true,
            },
        ));
        self
    }

    pub fn build(self) -> VirtualDevice {
        let mut storages = BTreeMap::new();
        for (id, s) in self.storages {
            storages.insert(id, s);
        }
        if storages.is_empty() {
            storages.insert(
                0x00010001,
                VirtualStorage {
                    description: "Internal storage".to_string(),
                    capacity_bytes: 64 << 30,
                    free_bytes: 32 << 30,
                    read_only: false,
                },
            );
        }
        VirtualDevice {
            state: Arc::new(Mutex::new(VirtualState {
                manufacturer: self.manufacturer,
                model: self.model,
                serial: self.serial,
                operations: self.operations,
                storages,
                objects: BTreeMap::new(),
                next_handle: 1,
                session_open: false,
                detached: false,
                outbound: VecDeque::new(),
                events: VecDeque::new(),
                pending_out: None,
                staged_object: None,
                read_stalls: 0,
                write_stalls: 0,
                read_delay: None,
                busy_above: None,
                forced_responses: BTreeMap::new(),
                clear_halt_calls: 0,
                reset_calls: 0,
            })),
        }
    }
}

impl VirtualDevice {
    pub fn builder() -> VirtualDeviceBuilder {
        VirtualDeviceBuilder {
            manufacturer: "Acme".to_string(),
            model: "Virtual Phone".to_string(),
            serial: "VIRT0001".to_string(),
            operations: vec![
                op::GET_DEVICE_INFO,
                op::OPEN_SESSION,
                op::CLOSE_SESSION,
                op::GET_STORAGE_IDS,
                op::GET_STORAGE_INFO,
                op::GET_OBJECT_HANDLES,
                op::GET_OBJECT_INFO,
                op::GET_OBJECT,
                op::DELETE_OBJECT,
                op::SEND_OBJECT_INFO,
                op::SEND_OBJECT,
                op::MOVE_OBJECT,
                op::GET_PARTIAL_OBJECT,
                op::GET_PARTIAL_OBJECT_64,
                op::SEND_PARTIAL_OBJECT,
                op::TRUNCATE_OBJECT,
                op::GET_OBJECT_PROP_LIST,
                op::GET_OBJECT_PROP_VALUE,
                op::SET_OBJECT_PROP_VALUE,
                op::RESET_DEVICE,
            ],
            storages: Vec::new(),
        }
    }

    // ==========
    // CONTENT SETUP
    // ==========

    pub fn add_folder(&self, storage_id: u32, parent: u32, name: &str) -> u32 {
        let mut st = self.state.lock().unwrap();
        st.insert_object(VirtualObject {
            storage_id,
            parent,
            name: name.to_string(),
            format_code: fmt::ASSOCIATION,
            data: Vec::new(),
        })
    }

    pub fn add_file(&self, storage_id: u32, parent: u32, name: &str, data: Vec<u8>) -> u32 {
        let mut st = self.state.lock().unwrap();
        st.insert_object(VirtualObject {
            storage_id,
            parent,
            name: name.to_string(),
            format_code: fmt::UNDEFINED,
            data,
        })
    }

    pub fn object_data(&self, handle: u32) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(&handle)
            .map(|o| o.data.clone())
    }

    pub fn object_name(&self, handle: u32) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(&handle)
            .map(|o| o.name.clone())
    }

    pub fn has_object(&self, handle: u32) -> bool {
        self.state.lock().unwrap().objects.contains_key(&handle)
    }

    // ==========
    // FAULT SCRIPTS
    // ==========

    /// The next `n` bulk reads fail with a pipe stall.
    pub fn script_read_stalls(&self, n: u32) {
        self.state.lock().unwrap().read_stalls = n;
    }

    /// The next `n` bulk writes fail with a pipe stall.
    pub fn script_write_stalls(&self, n: u32) {
        self.state.lock().unwrap().write_stalls = n;
    }

    /// Delay every bulk read by `delay`, to make transactions take a
    /// measurable amount of time.
    pub fn script_read_delay(&self, delay: Duration) {
        self.state.lock().unwrap().read_delay = Some(delay);
    }

    /// Respond DeviceBusy to `op_code` whenever the requested length
    /// exceeds `max_ok_len` at or past `min_offset`.
    pub fn script_busy_above_chunk(&self, op_code: u16, min_offset: u64, max_ok_len: u64) {
        self.state.lock().unwrap().busy_above = Some(BusyAboveChunk {
            op: op_code,
            min_offset,
            max_ok_len,
        });
    }

    /// Queue a forced response code for the next invocation of `op_code`.
    pub fn script_response(&self, op_code: u16, response_code: u16) {
        self.state
            .lock()
            .unwrap()
            .forced_responses
            .entry(op_code)
            .or_default()
            .push_back(response_code);
    }

    /// Simulate a surprise detach; every call fails with NoDevice.
    pub fn detach(&self) {
        self.state.lock().unwrap().detached = true;
    }

    pub fn reattach(&self) {
        self.state.lock().unwrap().detached = false;
    }

    /// Queue an event container on the interrupt endpoint.
    pub fn push_event(&self, code: u16, param: u32) {
        let bytes = encode_container(&PtpContainer {
            kind: ContainerKind::Event,
            code,
            transaction_id: 0,
            params: vec![param],
        })
        .expect("event container");
        self.state.lock().unwrap().events.push_back(bytes);
    }

    /// Queue raw bytes on the bulk IN endpoint (transport-level tests).
    pub fn push_event_bytes(&self, bytes: Vec<u8>) {
        self.state.lock().unwrap().outbound.push_back(bytes);
    }

    pub fn clear_halt_count(&self) -> u32 {
        self.state.lock().unwrap().clear_halt_calls
    }

    pub fn reset_count(&self) -> u32 {
        self.state.lock().unwrap().reset_calls
    }

    pub fn session_is_open(&self) -> bool {
        self.state.lock().unwrap().session_open
    }
}

/// ### VirtualLink
///
/// The [`BulkLink`] face of a [`VirtualDevice`].
///
pub struct VirtualLink {
    device: VirtualDevice,
    closed: bool,
}

impl VirtualLink {
    pub fn new(device: VirtualDevice) -> VirtualLink {
        VirtualLink {
            device,
            closed: false,
        }
    }
}

impl BulkLink for VirtualLink {
    fn write(&mut self, data: &[u8], _timeout: Duration) -> Result<(), TransportError> {
        let mut st = self.device.state.lock().unwrap();
        if st.detached || self.closed {
            return Err(TransportError::NoDevice);
        }
        if st.write_stalls > 0 {
            st.write_stalls -= 1;
            return Err(TransportError::Stall);
        }
        st.accept_bytes(data);
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize, TransportError> {
        let delay = self.device.state.lock().unwrap().read_delay;
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        let mut st = self.device.state.lock().unwrap();
        if st.detached || self.closed {
            return Err(TransportError::NoDevice);
        }
        if st.read_stalls > 0 {
            st.read_stalls -= 1;
            return Err(TransportError::Stall);
        }
        match st.outbound.front_mut() {
            Some(front) => {
                let n = front.len().min(buf.len());
                buf[..n].copy_from_slice(&front[..n]);
                if n == front.len() {
                    st.outbound.pop_front();
                } else {
                    front.drain(..n);
                }
                Ok(n)
            }
            None => Err(TransportError::Timeout),
        }
    }

    fn read_interrupt(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        {
            let mut st = self.device.state.lock().unwrap();
            if st.detached || self.closed {
                return Err(TransportError::NoDevice);
            }
            if let Some(front) = st.events.pop_front() {
                let n = front.len().min(buf.len());
                buf[..n].copy_from_slice(&front[..n]);
                return Ok(n);
            }
        }
        // keep the event pump from spinning hot against an empty queue
        std::thread::sleep(timeout.min(Duration::from_millis(2)));
        Err(TransportError::Timeout)
    }

    fn clear_halt(&mut self, _ep: EndpointSel) -> Result<(), TransportError> {
        let mut st = self.device.state.lock().unwrap();
        if st.detached {
            return Err(TransportError::NoDevice);
        }
        st.clear_halt_calls += 1;
        Ok(())
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        let mut st = self.device.state.lock().unwrap();
        if st.detached {
            return Err(TransportError::NoDevice);
        }
        st.reset_calls += 1;
        st.outbound.clear();
        st.pending_out = None;
        st.session_open = false;
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
    }

    fn max_packet_size(&self) -> usize {
        512
    }

    fn has_interrupt_endpoint(&self) -> bool {
        true
    }

    fn take_interrupt_reader(&mut self) -> Option<Box<dyn InterruptReader>> {
        Some(Box::new(VirtualInterruptReader {
            device: self.device.clone(),
        }))
    }
}

struct VirtualInterruptReader {
    device: VirtualDevice,
}

impl InterruptReader for VirtualInterruptReader {
    fn read_interrupt(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        {
            let mut st = self.device.state.lock().unwrap();
            if st.detached {
                return Err(TransportError::NoDevice);
            }
            if let Some(front) = st.events.pop_front() {
                let n = front.len().min(buf.len());
                buf[..n].copy_from_slice(&front[..n]);
                return Ok(n);
            }
        }
        std::thread::sleep(timeout.min(Duration::from_millis(2)));
        Err(TransportError::Timeout)
    }
}

// ==========
// DEVICE MODEL
// ==========

impl VirtualState {
    fn insert_object(&mut self, object: VirtualObject) -> u32 {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.objects.insert(handle, object);
        handle
    }

    /// Accept one bulk-out transfer: either a command container or a
    /// piece of an in-flight data phase.
    fn accept_bytes(&mut self, data: &[u8]) {
        if let Some(mut pending) = self.pending_out.take() {
            pending.buf.extend_from_slice(data);
            if pending.declared_len.is_none() && pending.buf.len() >= CONTAINER_HEADER_SIZE {
                if let Ok(header) = decode_container_header(&pending.buf) {
                    pending.declared_len = Some(header.length as usize);
                }
            }
            match pending.declared_len {
                Some(total) if pending.buf.len() >= total => {
                    let payload = pending.buf[CONTAINER_HEADER_SIZE..total].to_vec();
                    let command = pending.command.clone();
                    self.dispatch_with_data(&command, &payload);
                }
                _ => self.pending_out = Some(pending),
            }
            return;
        }

        let container = match codec::decode_container(data) {
            Ok(c) => c,
            Err(_) => return, // garbage on the wire; a real device would hang
        };
        if container.kind != ContainerKind::Command {
            return;
        }
        if self.op_expects_data_out(container.code) {
            self.pending_out = Some(PendingDataOut {
                command: container,
                declared_len: None,
                buf: Vec::new(),
            });
            return;
        }
        self.dispatch(&container);
    }

    fn op_expects_data_out(&self, code: u16) -> bool {
        matches!(
            code,
            op::SEND_OBJECT_INFO
                | op::SEND_OBJECT
                | op::SEND_PARTIAL_OBJECT
                | op::SET_OBJECT_PROP_VALUE
        )
    }

    fn respond(&mut self, code: u16, tid: u32, params: Vec<u32>) {
        let bytes = encode_container(&PtpContainer {
            kind: ContainerKind::Response,
            code,
            transaction_id: tid,
            params,
        })
        .expect("response container");
        self.outbound.push_back(bytes);
    }

    fn send_data(&mut self, op_code: u16, tid: u32, payload: Vec<u8>) {
        let mut container = codec::encode_data_header(op_code, tid, payload.len() as u64);
        container.extend_from_slice(&payload);
        self.outbound.push_back(container);
    }

    fn forced_response(&mut self, op_code: u16) -> Option<u16> {
        self.forced_responses
            .get_mut(&op_code)
            .and_then(|q| q.pop_front())
    }

    fn dispatch(&mut self, c: &PtpContainer) {
        let tid = c.transaction_id;

        if let Some(code) = self.forced_response(c.code) {
            self.respond(code, tid, vec![]);
            return;
        }
        if !self.operations.contains(&c.code) {
            self.respond(rc::OPERATION_NOT_SUPPORTED, tid, vec![]);
            return;
        }

        match c.code {
            op::GET_DEVICE_INFO => {
                let payload = self.device_info_payload();
                self.send_data(c.code, tid, payload);
                self.respond(rc::OK, tid, vec![]);
            }
            op::OPEN_SESSION => {
                if self.session_open {
                    self.respond(rc::SESSION_ALREADY_OPEN, tid, vec![]);
                } else {
                    self.session_open = true;
                    self.respond(rc::OK, tid, vec![]);
                }
            }
            op::CLOSE_SESSION => {
                self.session_open = false;
                self.respond(rc::OK, tid, vec![]);
            }
            op::RESET_DEVICE => {
                self.session_open = false;
                self.respond(rc::OK, tid, vec![]);
            }
            op::GET_STORAGE_IDS => {
                let ids: Vec<u32> = self.storages.keys().copied().collect();
                let mut payload = Vec::new();
                put_u32(&mut payload, ids.len() as u32);
                ids.iter().for_each(|id| put_u32(&mut payload, *id));
                self.send_data(c.code, tid, payload);
                self.respond(rc::OK, tid, vec![]);
            }
            op::GET_STORAGE_INFO => {
                let id = c.params.first().copied().unwrap_or(0);
                match self.storages.get(&id) {
                    Some(s) => {
                        let payload = storage_info_payload(s);
                        self.send_data(c.code, tid, payload);
                        self.respond(rc::OK, tid, vec![]);
                    }
                    None => self.respond(rc::INVALID_STORAGE_ID, tid, vec![]),
                }
            }
            op::GET_OBJECT_HANDLES => {
                let storage = c.params.first().copied().unwrap_or(u32::MAX);
                let parent = c.params.get(2).copied().unwrap_or(0);
                let handles = self.child_handles(storage, parent);
                let mut payload = Vec::new();
                put_u32(&mut payload, handles.len() as u32);
                handles.iter().for_each(|h| put_u32(&mut payload, *h));
                self.send_data(c.code, tid, payload);
                self.respond(rc::OK, tid, vec![]);
            }
            op::GET_OBJECT_INFO => {
                let handle = c.params.first().copied().unwrap_or(0);
                match self.objects.get(&handle) {
                    Some(o) => {
                        let payload = codec::encode_object_info(
                            o.storage_id,
                            o.parent,
                            &o.name,
                            o.data.len() as u64,
                            o.format_code,
                        );
                        self.send_data(c.code, tid, payload);
                        self.respond(rc::OK, tid, vec![]);
                    }
                    None => self.respond(rc::INVALID_OBJECT_HANDLE, tid, vec![]),
                }
            }
            op::GET_OBJECT => {
                let handle = c.params.first().copied().unwrap_or(0);
                match self.objects.get(&handle) {
                    Some(o) => {
                        let data = o.data.clone();
                        self.send_data(c.code, tid, data);
                        self.respond(rc::OK, tid, vec![]);
                    }
                    None => self.respond(rc::INVALID_OBJECT_HANDLE, tid, vec![]),
                }
            }
            op::GET_PARTIAL_OBJECT | op::GET_PARTIAL_OBJECT_64 => {
                self.partial_read(c);
            }
            op::TRUNCATE_OBJECT => {
                let handle = c.params.first().copied().unwrap_or(0);
                let len = u64::from(c.params.get(1).copied().unwrap_or(0))
                    | (u64::from(c.params.get(2).copied().unwrap_or(0)) << 32);
                match self.objects.get_mut(&handle) {
                    Some(o) => {
                        o.data.truncate(len as usize);
                        self.respond(rc::OK, tid, vec![]);
                    }
                    None => self.respond(rc::INVALID_OBJECT_HANDLE, tid, vec![]),
                }
            }
            op::DELETE_OBJECT => {
                let handle = c.params.first().copied().unwrap_or(0);
                if !self.objects.contains_key(&handle) {
                    self.respond(rc::INVALID_OBJECT_HANDLE, tid, vec![]);
                    return;
                }
                self.delete_recursive(handle);
                self.respond(rc::OK, tid, vec![]);
            }
            op::MOVE_OBJECT => {
                let handle = c.params.first().copied().unwrap_or(0);
                let new_parent = c.params.get(2).copied().unwrap_or(0);
                let target_parent = if new_parent == u32::MAX { 0 } else { new_parent };
                match self.objects.get_mut(&handle) {
                    Some(o) => {
                        o.parent = target_parent;
                        self.respond(rc::OK, tid, vec![]);
                    }
                    None => self.respond(rc::INVALID_OBJECT_HANDLE, tid, vec![]),
                }
            }
            op::GET_OBJECT_PROP_LIST => {
                let selector = c.params.first().copied().unwrap_or(u32::MAX);
                let payload = self.prop_list_payload(selector);
                self.send_data(c.code, tid, payload);
                self.respond(rc::OK, tid, vec![]);
            }
            op::GET_OBJECT_PROP_VALUE => {
                let handle = c.params.first().copied().unwrap_or(0);
                let prop = c.params.get(1).copied().unwrap_or(0) as u16;
                match self.objects.get(&handle) {
                    Some(o) => {
                        let value = match prop {
                            crate::constants::prop::OBJECT_SIZE => {
                                TypedValue::U64(o.data.len() as u64)
                            }
                            crate::constants::prop::OBJECT_FILE_NAME => {
                                TypedValue::Str(o.name.clone())
                            }
                            _ => TypedValue::U32(0),
                        };
                        let mut payload = Vec::new();
                        value.encode(&mut payload);
                        self.send_data(c.code, tid, payload);
                        self.respond(rc::OK, tid, vec![]);
                    }
                    None => self.respond(rc::INVALID_OBJECT_HANDLE, tid, vec![]),
                }
            }
            _ => self.respond(rc::OPERATION_NOT_SUPPORTED, tid, vec![]),
        }
    }

    fn partial_read(&mut self, c: &PtpContainer) {
        let tid = c.transaction_id;
        let handle = c.params.first().copied().unwrap_or(0);
        let (offset, len) = if c.code == op::GET_PARTIAL_OBJECT_64 {
            let off = u64::from(c.params.get(1).copied().unwrap_or(0))
                | (u64::from(c.params.get(2).copied().unwrap_or(0)) << 32);
            (off, u64::from(c.params.get(3).copied().unwrap_or(0)))
        } else {
            (
                u64::from(c.params.get(1).copied().unwrap_or(0)),
                u64::from(c.params.get(2).copied().unwrap_or(0)),
            )
        };

        if let Some(busy) = self.busy_above {
            if busy.op == c.code && offset >= busy.min_offset && len > busy.max_ok_len {
                self.respond(rc::DEVICE_BUSY, tid, vec![]);
                return;
            }
        }

        match self.objects.get(&handle) {
            Some(o) => {
                let start = (offset as usize).min(o.data.len());
                let end = (start + len as usize).min(o.data.len());
                let slice = o.data[start..end].to_vec();
                let actual = slice.len() as u32;
                self.send_data(c.code, tid, slice);
                self.respond(rc::OK, tid, vec![actual]);
            }
            None => self.respond(rc::INVALID_OBJECT_HANDLE, tid, vec![]),
        }
    }

    fn dispatch_with_data(&mut self, c: &PtpContainer, payload: &[u8]) {
        let tid = c.transaction_id;

        if let Some(code) = self.forced_response(c.code) {
            self.respond(code, tid, vec![]);
            return;
        }
        if !self.operations.contains(&c.code) {
            self.respond(rc::OPERATION_NOT_SUPPORTED, tid, vec![]);
            return;
        }

        match c.code {
            op::SEND_OBJECT_INFO => {
                let storage_id = match c.params.first().copied() {
                    Some(0) | None => self.storages.keys().next().copied().unwrap_or(0),
                    Some(id) => id,
                };
                let parent_param = c.params.get(1).copied().unwrap_or(0);
                let parent = if parent_param == u32::MAX { 0 } else { parent_param };
                let info = match codec::decode_object_info(0, payload) {
                    Ok(i) => i,
                    Err(_) => {
                        self.respond(rc::GENERAL_ERROR, tid, vec![]);
                        return;
                    }
                };
                if self
                    .storages
                    .get(&storage_id)
                    .map(|s| s.read_only)
                    .unwrap_or(true)
                {
                    self.respond(rc::STORE_READ_ONLY, tid, vec![]);
                    return;
                }
                let handle = self.insert_object(VirtualObject {
                    storage_id,
                    parent,
                    name: info.name,
                    format_code: info.format_code,
                    data: Vec::new(),
                });
                self.staged_object = Some(handle);
                self.respond(rc::OK, tid, vec![storage_id, parent, handle]);
            }
            op::SEND_OBJECT => {
                match self.staged_object.take() {
                    Some(handle) => {
                        if let Some(o) = self.objects.get_mut(&handle) {
                            o.data = payload.to_vec();
                        }
                        self.respond(rc::OK, tid, vec![]);
                    }
                    None => self.respond(rc::GENERAL_ERROR, tid, vec![]),
                }
            }
            op::SEND_PARTIAL_OBJECT => {
                let handle = c.params.first().copied().unwrap_or(0);
                let offset = u64::from(c.params.get(1).copied().unwrap_or(0))
                    | (u64::from(c.params.get(2).copied().unwrap_or(0)) << 32);
                if let Some(busy) = self.busy_above {
                    if busy.op == c.code
                        && offset >= busy.min_offset
                        && payload.len() as u64 > busy.max_ok_len
                    {
                        self.respond(rc::DEVICE_BUSY, tid, vec![]);
                        return;
                    }
                }
                match self.objects.get_mut(&handle) {
                    Some(o) => {
                        let end = offset as usize + payload.len();
                        if o.data.len() < end {
                            o.data.resize(end, 0);
                        }
                        o.data[offset as usize..end].copy_from_slice(payload);
                        self.respond(rc::OK, tid, vec![payload.len() as u32]);
                    }
                    None => self.respond(rc::INVALID_OBJECT_HANDLE, tid, vec![]),
                }
            }
            op::SET_OBJECT_PROP_VALUE => {
                let handle = c.params.first().copied().unwrap_or(0);
                let prop = c.params.get(1).copied().unwrap_or(0) as u16;
                match self.objects.get_mut(&handle) {
                    Some(o) if prop == crate::constants::prop::OBJECT_FILE_NAME => {
                        let mut r = ByteReader::new(payload);
                        match r.read_string() {
                            Ok(name) => {
                                o.name = name;
                                self.respond(rc::OK, tid, vec![]);
                            }
                            Err(_) => self.respond(rc::GENERAL_ERROR, tid, vec![]),
                        }
                    }
                    Some(_) => self.respond(rc::INVALID_OBJECT_PROP_CODE, tid, vec![]),
                    None => self.respond(rc::INVALID_OBJECT_HANDLE, tid, vec![]),
                }
            }
            _ => self.respond(rc::OPERATION_NOT_SUPPORTED, tid, vec![]),
        }
    }

    fn child_handles(&self, storage: u32, parent_param: u32) -> Vec<u32> {
        let parent = if parent_param == u32::MAX { 0 } else { parent_param };
        self.objects
            .iter()
            .filter(|(_, o)| storage == u32::MAX || o.storage_id == storage)
            .filter(|(_, o)| o.parent == parent)
            .map(|(h, _)| *h)
            .collect()
    }

    /// Children-of prop list: every property the enumeration path
    /// needs for the objects under `selector` (0xFFFFFFFF = root).
    fn prop_list_payload(&self, selector: u32) -> Vec<u8> {
        use crate::codec::data_type;
        use crate::constants::prop;

        let handles = self.child_handles(u32::MAX, selector);
        let mut entries = Vec::new();
        for h in handles {
            let o = &self.objects[&h];
            entries.push(codec::PropListEntry {
                handle: h,
                prop_code: prop::STORAGE_ID,
                data_type: data_type::UINT32,
                value: TypedValue::U32(o.storage_id),
            });
            entries.push(codec::PropListEntry {
                handle: h,
                prop_code: prop::OBJECT_FORMAT,
                data_type: data_type::UINT16,
                value: TypedValue::U16(o.format_code),
            });
            entries.push(codec::PropListEntry {
                handle: h,
                prop_code: prop::OBJECT_SIZE,
                data_type: data_type::UINT64,
                value: TypedValue::U64(o.data.len() as u64),
            });
            entries.push(codec::PropListEntry {
                handle: h,
                prop_code: prop::OBJECT_FILE_NAME,
                data_type: data_type::STR,
                value: TypedValue::Str(o.name.clone()),
            });
            entries.push(codec::PropListEntry {
                handle: h,
                prop_code: prop::PARENT_OBJECT,
                data_type: data_type::UINT32,
                value: TypedValue::U32(o.parent),
            });
        }
        let mut payload = Vec::new();
        codec::encode_prop_list(&entries, &mut payload);
        payload
    }

    fn delete_recursive(&mut self, handle: u32) {
        let children: Vec<u32> = self
            .objects
            .iter()
            .filter(|(_, o)| o.parent == handle)
            .map(|(h, _)| *h)
            .collect();
        for child in children {
            self.delete_recursive(child);
        }
        self.objects.remove(&handle);
    }

    fn device_info_payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_u16(&mut out, 100);
        put_u32(&mut out, 6);
        put_u16(&mut out, 100);
        put_string(&mut out, "microsoft.com: 1.0");
        put_u16(&mut out, 0);
        TypedValue::AU16(self.operations.clone()).encode(&mut out);
        TypedValue::AU16(vec![
            event::OBJECT_ADDED,
            event::OBJECT_REMOVED,
            event::STORAGE_INFO_CHANGED,
        ])
        .encode(&mut out);
        TypedValue::AU16(vec![]).encode(&mut out);
        TypedValue::AU16(vec![]).encode(&mut out);
        TypedValue::AU16(vec![fmt::UNDEFINED, fmt::ASSOCIATION]).encode(&mut out);
        put_string(&mut out, &self.manufacturer);
        put_string(&mut out, &self.model);
        put_string(&mut out, "1.0");
        put_string(&mut out, &self.serial);
        out
    }
}

fn storage_info_payload(s: &VirtualStorage) -> Vec<u8> {
    let mut out = Vec::new();
    put_u16(&mut out, 0x0003); // fixed RAM
    put_u16(&mut out, 0x0002); // generic hierarchical
    put_u16(&mut out, if s.read_only { 0x0001 } else { 0x0000 });
    codec::put_u64(&mut out, s.capacity_bytes);
    codec::put_u64(&mut out, s.free_bytes);
    put_u32(&mut out, 0);
    put_string(&mut out, &s.description);
    put_string(&mut out, "");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(code: u16, tid: u32, params: Vec<u32>) -> Vec<u8> {
        encode_container(&PtpContainer {
            kind: ContainerKind::Command,
            code,
            transaction_id: tid,
            params,
        })
        .unwrap()
    }

    fn drain_response(link: &mut VirtualLink) -> (Vec<Vec<u8>>, PtpContainer) {
        let mut data = Vec::new();
        loop {
            let mut buf = vec![0u8; 1 << 20];
            let n = link.read(&mut buf, Duration::from_millis(10)).unwrap();
            buf.truncate(n);
            let header = decode_container_header(&buf).unwrap();
            if header.kind == ContainerKind::Response {
                return (data, codec::decode_container(&buf).unwrap());
            }
            data.push(buf);
        }
    }

    #[test]
    fn responds_to_device_info_and_open() {
        let device = VirtualDevice::builder().model("Test Phone").build();
        let mut link = VirtualLink::new(device);
        link.write(&command(op::GET_DEVICE_INFO, 1, vec![]), Duration::ZERO)
            .unwrap();
        let (data, resp) = drain_response(&mut link);
        assert_eq!(resp.code, rc::OK);
        let info = codec::decode_device_info(&data[0][CONTAINER_HEADER_SIZE..]).unwrap();
        assert_eq!(info.model, "Test Phone");

        link.write(&command(op::OPEN_SESSION, 2, vec![1]), Duration::ZERO)
            .unwrap();
        let (_, resp) = drain_response(&mut link);
        assert_eq!(resp.code, rc::OK);

        // second open reports the session as already open
        link.write(&command(op::OPEN_SESSION, 3, vec![1]), Duration::ZERO)
            .unwrap();
        let (_, resp) = drain_response(&mut link);
        assert_eq!(resp.code, rc::SESSION_ALREADY_OPEN);
    }

    #[test]
    fn send_object_info_then_object_creates_file() {
        let device = VirtualDevice::builder().build();
        let mut link = VirtualLink::new(device.clone());
        link.write(&command(op::OPEN_SESSION, 1, vec![1]), Duration::ZERO)
            .unwrap();
        drain_response(&mut link);

        let info = codec::encode_object_info(0x00010001, 0, "new.bin", 4, fmt::UNDEFINED);
        link.write(
            &command(op::SEND_OBJECT_INFO, 2, vec![0x00010001, u32::MAX]),
            Duration::ZERO,
        )
        .unwrap();
        let mut data_container = codec::encode_data_header(op::SEND_OBJECT_INFO, 2, info.len() as u64);
        data_container.extend_from_slice(&info);
        link.write(&data_container, Duration::ZERO).unwrap();
        let (_, resp) = drain_response(&mut link);
        assert_eq!(resp.code, rc::OK);
        let handle = resp.params[2];

        link.write(&command(op::SEND_OBJECT, 3, vec![]), Duration::ZERO)
            .unwrap();
        let mut data_container = codec::encode_data_header(op::SEND_OBJECT, 3, 4);
        data_container.extend_from_slice(&[9, 9, 9, 9]);
        link.write(&data_container, Duration::ZERO).unwrap();
        let (_, resp) = drain_response(&mut link);
        assert_eq!(resp.code, rc::OK);
        assert_eq!(device.object_data(handle).unwrap(), vec![9, 9, 9, 9]);
    }

    #[test]
    fn detach_makes_every_call_fail() {
        let device = VirtualDevice::builder().build();
        let mut link = VirtualLink::new(device.clone());
        device.detach();
        let err = link
            .write(&command(op::GET_DEVICE_INFO, 1, vec![]), Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, TransportError::NoDevice));
    }
}
