//! ## Device Session
//!
//! The per-device actor. Owns the protocol engine exclusively,
//! serializes every protocol operation behind the FIFO transaction
//! lock, pumps device events on a side task, and reconciles partial
//! transfers left behind by earlier runs.
//!

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, info, warn};

use crate::cancel::{CancelToken, Deadline};
use crate::codec::{self, StringLenience};
use crate::constants::{defaults, event, fmt, op, prop, rc};
use crate::diagnostics::{ProbeReceipt, TransactionTimeline};
use crate::engine::ProtocolEngine;
use crate::error::{MtpError, TransportError};
use crate::identity::{IdentitySignals, IdentityStore, StableDeviceIdentity};
use crate::journal::{TransferJournal, TransferKind};
use crate::lock::TransactionLock;
use crate::pipeline::{self, DownloadRequest, ProgressFn, UploadRequest};
use crate::probe::{probe_session, LinkFactory, ProbeConfig};
use crate::quirks::QuirkDatabase;
use crate::transport::InterruptReader;
use crate::tuning::{EffectiveTuning, HookPhase, LearnedProfile, TuningMode, UserOverrides};
use crate::types::{
    ByteRange, DeviceDescriptor, DeviceEvent, DeviceFingerprint, MtpDeviceInfo, ObjectInfo,
    StorageInfo,
};

/// Directory listings are fetched in slices this large so cancellation
/// is observed between slices.
const LIST_BATCH: usize = defaults::LIST_BATCH_SIZE;

/// Handle chains longer than this are treated as a containment cycle.
const MAX_PATH_DEPTH: usize = 1000;

// ==========
// EVENT FAN-OUT
// ==========

struct EventQueueInner {
    queue: Mutex<VecDeque<DeviceEvent>>,
    cv: Condvar,
}

/// One subscriber's view of the session event stream. Bounded; the
/// oldest event is dropped when a slow consumer falls behind.
pub struct EventStream {
    inner: Arc<EventQueueInner>,
}

impl EventStream {
    pub fn try_recv(&self) -> Option<DeviceEvent> {
        self.inner.queue.lock().unwrap().pop_front()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<DeviceEvent> {
        let mut queue = self.inner.queue.lock().unwrap();
        if let Some(ev) = queue.pop_front() {
            return Some(ev);
        }
        let (mut queue, _) = self.inner.cv.wait_timeout(queue, timeout).unwrap();
        queue.pop_front()
    }
}

#[derive(Default)]
struct EventFanout {
    subscribers: Mutex<Vec<Arc<EventQueueInner>>>,
}

impl EventFanout {
    fn subscribe(&self) -> EventStream {
        let inner = Arc::new(EventQueueInner {
            queue: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
        });
        self.subscribers.lock().unwrap().push(inner.clone());
        EventStream { inner }
    }

    fn publish(&self, ev: DeviceEvent) {
        for sub in self.subscribers.lock().unwrap().iter() {
            let mut queue = sub.queue.lock().unwrap();
            if queue.len() == defaults::EVENT_CHANNEL_CAPACITY {
                queue.pop_front();
            }
            queue.push_back(ev);
            sub.cv.notify_one();
        }
    }
}

// ==========
// SESSION
// ==========

/// Caller-provided knobs for opening a session.
pub struct SessionOptions<'a> {
    pub quirks: &'a QuirkDatabase,
    pub mode: TuningMode,
    pub overrides: &'a UserOverrides,
    pub learned: Option<&'a LearnedProfile>,
    /// Hash and size-check transfers
    pub verify_transfers: bool,
}

/// ### DeviceSession
///
/// One attached device, one open MTP session. All methods are safe to
/// call from any thread; protocol work is serialized internally.
///
pub struct DeviceSession {
    engine: Mutex<ProtocolEngine>,
    lock: TransactionLock,
    tuning: EffectiveTuning,
    device_info: MtpDeviceInfo,
    fingerprint: DeviceFingerprint,
    receipt: ProbeReceipt,
    timeline: Arc<TransactionTimeline>,
    journal: Arc<TransferJournal>,
    identity: StableDeviceIdentity,
    device_id: String,
    lenience: StringLenience,
    verify_transfers: bool,
    closed: AtomicBool,
    events: Arc<EventFanout>,
    pump: Mutex<Option<(JoinHandle<()>, CancelToken)>>,
}

impl DeviceSession {
    /// ### Open
    ///
    /// Run the probe ladder, resolve identity and policy, start the
    /// event pump and reconcile leftover partial transfers.
    ///
    pub fn open(
        descriptor: &DeviceDescriptor,
        factory: &mut dyn LinkFactory,
        options: &SessionOptions<'_>,
        journal: Arc<TransferJournal>,
        identity_store: &IdentityStore,
        cancel: &CancelToken,
    ) -> Result<DeviceSession, MtpError> {
        let timeline = TransactionTimeline::new();
        let probe_config = ProbeConfig {
            quirks: options.quirks,
            mode: options.mode,
            overrides: options.overrides,
            learned: options.learned,
        };

        let outcome = match probe_session(descriptor, factory, &probe_config, timeline.clone(), cancel)
        {
            Ok(outcome) => outcome,
            Err((error, receipt)) => {
                warn!(
                    "probe failed after {} attempt(s): {error}",
                    receipt.attempts.len()
                );
                return Err(error);
            }
        };

        // RESOLVE IDENTITY
        // ==========
        let identity = identity_store.resolve_identity(&IdentitySignals {
            mtp_serial: Some(outcome.device_info.serial_number.clone()).filter(|s| !s.is_empty()),
            usb_serial: descriptor.usb_serial.clone(),
            vendor_id: descriptor.vendor_id,
            product_id: descriptor.product_id,
            model: Some(outcome.device_info.model.clone()).filter(|s| !s.is_empty()),
            manufacturer: Some(outcome.device_info.manufacturer.clone())
                .filter(|s| !s.is_empty()),
            iface: Some(outcome.candidate.iface),
        });
        if !outcome.device_info.serial_number.is_empty() {
            identity_store.update_mtp_serial(identity.domain_id, &outcome.device_info.serial_number);
        }
        let device_id = identity.domain_id.to_string();
        info!(
            "session open for {} ({}) as {device_id}",
            outcome.device_info.model, outcome.fingerprint
        );

        let rule = options
            .quirks
            .best_match(&outcome.fingerprint, Some(&outcome.device_info));
        let lenience = match rule.map(|r| r.ops) {
            Some(ops) if ops.string_count_is_bytes == Some(true) => StringLenience::CountIsBytes,
            Some(ops) if ops.string_missing_nul == Some(true) => StringLenience::MissingNul,
            _ => StringLenience::Strict,
        };

        let session = DeviceSession {
            engine: Mutex::new(outcome.engine),
            lock: TransactionLock::new(),
            tuning: outcome.tuning,
            device_info: outcome.device_info,
            fingerprint: outcome.fingerprint,
            receipt: outcome.receipt,
            timeline,
            journal,
            identity,
            device_id,
            lenience,
            verify_transfers: options.verify_transfers,
            closed: AtomicBool::new(false),
            events: Arc::new(EventFanout::default()),
            pump: Mutex::new(None),
        };

        session.start_event_pump();
        if let Err(e) = session.reconcile_partials(cancel) {
            warn!("partial-transfer reconciliation failed: {e}");
        }
        Ok(session)
    }

    // ==========
    // SNAPSHOTS
    // ==========

    pub fn info(&self) -> &MtpDeviceInfo {
        &self.device_info
    }

    pub fn identity(&self) -> &StableDeviceIdentity {
        &self.identity
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn fingerprint(&self) -> &DeviceFingerprint {
        &self.fingerprint
    }

    pub fn policy(&self) -> &EffectiveTuning {
        &self.tuning
    }

    pub fn receipt(&self) -> &ProbeReceipt {
        &self.receipt
    }

    pub fn timeline(&self) -> Arc<TransactionTimeline> {
        self.timeline.clone()
    }

    pub fn events(&self) -> EventStream {
        self.events.subscribe()
    }

    // ==========
    // PROTOCOL OPERATIONS
    // ==========

    /// List the storages the device currently exposes.
    pub fn storages(&self, cancel: &CancelToken) -> Result<Vec<StorageInfo>, MtpError> {
        self.run(cancel, |engine, deadline| {
            self.run_delay_hooks(HookPhase::BeforeGetStorageIds);
            let (payload, _) = engine.get_data(op::GET_STORAGE_IDS, &[], deadline, cancel)?;
            let ids = codec::decode_u32_array(&payload)?;
            let mut storages = Vec::with_capacity(ids.len());
            for id in ids {
                cancel.check().map_err(MtpError::Transport)?;
                let (payload, _) = engine.get_data(op::GET_STORAGE_INFO, &[id], deadline, cancel)?;
                storages.push(codec::decode_storage_info(id, &payload)?);
            }
            Ok(storages)
        })
    }

    /// ### List
    ///
    /// Children of `parent` (None = storage root), via one property
    /// list round-trip when the policy prefers it, otherwise via
    /// GetObjectHandles plus batched GetObjectInfo.
    ///
    pub fn list(
        &self,
        storage_id: u32,
        parent: Option<u32>,
        cancel: &CancelToken,
    ) -> Result<Vec<ObjectInfo>, MtpError> {
        let parent_param = parent.unwrap_or(u32::MAX);
        self.run(cancel, |engine, deadline| {
            if self.tuning.prefer_prop_list_enumeration {
                match self.list_via_prop_list(engine, parent_param, deadline, cancel) {
                    Ok(objects) => return Ok(objects),
                    // fall back when the device claims support but
                    // rejects the query shape
                    Err(MtpError::ProtocolError { code, .. })
                        if code == rc::OPERATION_NOT_SUPPORTED
                            || code == rc::SPECIFICATION_BY_GROUP_UNSUPPORTED =>
                    {
                        debug!("prop-list enumeration rejected, falling back to object info")
                    }
                    Err(e) => return Err(e),
                }
            }
            self.list_via_object_info(engine, storage_id, parent_param, deadline, cancel)
        })
    }

    fn list_via_prop_list(
        &self,
        engine: &mut ProtocolEngine,
        parent_param: u32,
        deadline: &Deadline,
        cancel: &CancelToken,
    ) -> Result<Vec<ObjectInfo>, MtpError> {
        let (payload, _) = engine.get_data(
            op::GET_OBJECT_PROP_LIST,
            &[parent_param, 0, u32::MAX, 0, 1],
            deadline,
            cancel,
        )?;
        let entries = codec::decode_prop_list(&payload, self.lenience)?;

        let mut objects: BTreeMap<u32, ObjectInfo> = BTreeMap::new();
        for entry in entries {
            let object = objects.entry(entry.handle).or_insert_with(|| ObjectInfo {
                handle: entry.handle,
                storage_id: 0,
                parent: if parent_param == u32::MAX { 0 } else { parent_param },
                name: String::new(),
                size_bytes: None,
                modified: None,
                format_code: fmt::UNDEFINED,
                is_directory: false,
                properties: Default::default(),
            });
            match entry.prop_code {
                prop::STORAGE_ID => {
                    object.storage_id = entry.value.as_u32().unwrap_or(0);
                }
                prop::OBJECT_FORMAT => {
                    object.format_code = entry.value.as_u16().unwrap_or(fmt::UNDEFINED);
                    object.is_directory = object.format_code == fmt::ASSOCIATION;
                }
                prop::OBJECT_SIZE => {
                    object.size_bytes = entry.value.as_u64();
                }
                prop::OBJECT_FILE_NAME => {
                    if let Some(name) = entry.value.as_str() {
                        object.name = codec::normalize_name(name);
                    }
                }
                prop::PARENT_OBJECT => {
                    object.parent = entry.value.as_u32().unwrap_or(0);
                }
                prop::DATE_MODIFIED => {
                    object.modified = entry.value.as_str().map(str::to_string);
                }
                _ => {}
            }
            object.properties.insert(entry.prop_code, entry.value);
        }
        Ok(objects.into_values().collect())
    }

    fn list_via_object_info(
        &self,
        engine: &mut ProtocolEngine,
        storage_id: u32,
        parent_param: u32,
        deadline: &Deadline,
        cancel: &CancelToken,
    ) -> Result<Vec<ObjectInfo>, MtpError> {
        let (payload, _) = engine.get_data(
            op::GET_OBJECT_HANDLES,
            &[storage_id, 0, parent_param],
            deadline,
            cancel,
        )?;
        let handles = codec::decode_u32_array(&payload)?;
        let mut objects = Vec::with_capacity(handles.len());
        for batch in handles.chunks(LIST_BATCH) {
            cancel.check().map_err(MtpError::Transport)?;
            for &handle in batch {
                let (payload, _) =
                    engine.get_data(op::GET_OBJECT_INFO, &[handle], deadline, cancel)?;
                objects.push(codec::decode_object_info(handle, &payload)?);
            }
        }
        Ok(objects)
    }

    pub fn get_info(&self, handle: u32, cancel: &CancelToken) -> Result<ObjectInfo, MtpError> {
        self.run(cancel, |engine, deadline| {
            let (payload, _) = engine.get_data(op::GET_OBJECT_INFO, &[handle], deadline, cancel)?;
            Ok(codec::decode_object_info(handle, &payload)?)
        })
    }

    /// Reconstruct the path of `handle` by walking parent links. A
    /// visited set and a depth cap guard against containment cycles.
    pub fn path_of(&self, handle: u32, cancel: &CancelToken) -> Result<PathBuf, MtpError> {
        let mut segments = Vec::new();
        let mut visited = HashSet::new();
        let mut current = handle;
        while current != 0 {
            if !visited.insert(current) || segments.len() >= MAX_PATH_DEPTH {
                return Err(MtpError::PreconditionFailed(
                    "containment cycle in object tree".into(),
                ));
            }
            let info = self.get_info(current, cancel)?;
            segments.push(info.name);
            current = info.parent;
        }
        segments.reverse();
        Ok(segments.iter().collect())
    }

    /// ### Read To File
    ///
    /// Journaled, resumable download of one object into `dest`.
    ///
    pub fn read_to_file(
        &self,
        handle: u32,
        dest: &Path,
        progress: Option<ProgressFn<'_>>,
        cancel: &CancelToken,
    ) -> Result<u64, MtpError> {
        let info = self.get_info(handle, cancel)?;
        let temp = temp_path_for(dest);

        // resume an earlier failed read of the same object if its temp
        // survived and the device can seek
        let resumable = self
            .journal
            .resumables(&self.device_id)
            .into_iter()
            .find(|r| {
                r.kind == TransferKind::Read
                    && r.handle == Some(handle)
                    && r.final_path.as_deref() == Some(dest)
                    && r.supports_partial
                    && r.local_temp_path.exists()
            });
        let supports_partial = self.tuning.partial_read64 || self.tuning.partial_read32;
        let (journal_id, resume_from) = match resumable {
            Some(record) if supports_partial => {
                info!(
                    "resuming download of {} from byte {}",
                    record.name, record.committed_bytes
                );
                (record.id, record.committed_bytes)
            }
            _ => {
                let id = self.journal.begin_read(
                    &self.device_id,
                    handle,
                    &info.name,
                    info.size_bytes,
                    supports_partial,
                    &temp,
                    dest,
                    None,
                )?;
                (id, 0)
            }
        };

        self.run(cancel, |engine, deadline| {
            self.run_delay_hooks(HookPhase::BeforeTransfer);
            let result = pipeline::download(
                engine,
                &self.tuning,
                &self.journal,
                &DownloadRequest {
                    handle,
                    size: info.size_bytes,
                    temp_path: &temp,
                    final_path: dest,
                    resume_from,
                    journal_id,
                    verify: self.verify_transfers,
                },
                progress,
                cancel,
                deadline,
            );
            self.run_delay_hooks(HookPhase::AfterTransfer);
            result
        })
    }

    /// Unjournaled random-access read for file-provider callers.
    pub fn read_range(
        &self,
        handle: u32,
        range: ByteRange,
        sink: &mut dyn std::io::Write,
        cancel: &CancelToken,
    ) -> Result<u64, MtpError> {
        self.run(cancel, |engine, deadline| {
            pipeline::read_range(engine, &self.tuning, handle, range, sink, cancel, deadline)
        })
    }

    /// ### Write From File
    ///
    /// Journaled upload of a local file into `parent` (0 = storage
    /// root). Returns the new object handle.
    ///
    pub fn write_from_file(
        &self,
        storage_id: u32,
        parent: u32,
        name: &str,
        source: &Path,
        progress: Option<ProgressFn<'_>>,
        cancel: &CancelToken,
    ) -> Result<u32, MtpError> {
        let size = std::fs::metadata(source)?.len();
        let supports_partial = self.tuning.partial_write;
        let journal_id = self.journal.begin_write(
            &self.device_id,
            parent,
            name,
            Some(size),
            supports_partial,
            source,
            source,
        )?;

        self.run(cancel, |engine, deadline| {
            self.run_delay_hooks(HookPhase::BeforeTransfer);
            let result = pipeline::upload(
                engine,
                &self.tuning,
                &self.journal,
                &UploadRequest {
                    storage_id,
                    parent,
                    name,
                    source_path: source,
                    size,
                    format_code: fmt::UNDEFINED,
                    journal_id,
                    verify: self.verify_transfers,
                },
                progress,
                cancel,
                deadline,
            );
            self.run_delay_hooks(HookPhase::AfterTransfer);
            result
        })
    }

    /// Delete an object. Directories require `recursive` unless empty.
    pub fn delete(
        &self,
        handle: u32,
        recursive: bool,
        cancel: &CancelToken,
    ) -> Result<(), MtpError> {
        self.run(cancel, |engine, deadline| {
            let (payload, _) = engine.get_data(op::GET_OBJECT_INFO, &[handle], deadline, cancel)?;
            let info = codec::decode_object_info(handle, &payload)?;
            if info.is_directory && !recursive {
                let (payload, _) = engine.get_data(
                    op::GET_OBJECT_HANDLES,
                    &[u32::MAX, 0, handle],
                    deadline,
                    cancel,
                )?;
                if !codec::decode_u32_array(&payload)?.is_empty() {
                    return Err(MtpError::PreconditionFailed(
                        "directory is not empty".into(),
                    ));
                }
            }
            engine.execute(op::DELETE_OBJECT, &[handle], deadline, cancel)?;
            Ok(())
        })
    }

    pub fn move_object(
        &self,
        handle: u32,
        storage_id: u32,
        new_parent: u32,
        cancel: &CancelToken,
    ) -> Result<(), MtpError> {
        self.run(cancel, |engine, deadline| {
            engine.execute(
                op::MOVE_OBJECT,
                &[handle, storage_id, root_param(new_parent)],
                deadline,
                cancel,
            )?;
            Ok(())
        })
    }

    pub fn rename(
        &self,
        handle: u32,
        new_name: &str,
        cancel: &CancelToken,
    ) -> Result<(), MtpError> {
        self.run(cancel, |engine, deadline| {
            let mut payload = Vec::new();
            codec::put_string(&mut payload, new_name);
            let mut cursor = std::io::Cursor::new(payload);
            let len = cursor.get_ref().len() as u64;
            engine.execute_data_out(
                op::SET_OBJECT_PROP_VALUE,
                &[handle, prop::OBJECT_FILE_NAME as u32],
                len,
                &mut cursor,
                deadline,
                cancel,
            )?;
            Ok(())
        })
    }

    pub fn create_folder(
        &self,
        storage_id: u32,
        parent: u32,
        name: &str,
        cancel: &CancelToken,
    ) -> Result<u32, MtpError> {
        self.run(cancel, |engine, deadline| {
            let info = codec::encode_object_info(storage_id, parent, name, 0, fmt::ASSOCIATION);
            let mut cursor = std::io::Cursor::new(info);
            let len = cursor.get_ref().len() as u64;
            let result = engine.execute_data_out(
                op::SEND_OBJECT_INFO,
                &[storage_id, root_param(parent)],
                len,
                &mut cursor,
                deadline,
                cancel,
            )?;
            result.params.get(2).copied().ok_or(MtpError::ProtocolError {
                code: 0,
                message: Some("SendObjectInfo response missing the new handle".into()),
            })
        })
    }

    /// ### Reconcile Partials
    ///
    /// For journaled writes that left a partial object on the device,
    /// delete the partial before any new upload runs.
    ///
    pub fn reconcile_partials(&self, cancel: &CancelToken) -> Result<usize, MtpError> {
        let candidates: Vec<_> = self
            .journal
            .resumables(&self.device_id)
            .into_iter()
            .filter(|r| r.kind == TransferKind::Write)
            .filter(|r| r.remote_handle.is_some())
            .filter(|r| match r.total_bytes {
                Some(total) => r.committed_bytes < total,
                None => true,
            })
            .collect();
        if candidates.is_empty() {
            return Ok(0);
        }

        self.run(cancel, |engine, deadline| {
            let mut deleted = 0;
            for record in &candidates {
                let handle = record.remote_handle.expect("filtered above");
                let info = match engine.get_data(op::GET_OBJECT_INFO, &[handle], deadline, cancel)
                {
                    Ok((payload, _)) => codec::decode_object_info(handle, &payload)?,
                    Err(MtpError::ObjectNotFound) => {
                        debug!("partial object {handle:#x} already gone");
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                let is_partial = match (info.size_bytes, record.total_bytes) {
                    (Some(actual), Some(total)) => actual < total,
                    _ => true,
                };
                if is_partial {
                    info!(
                        "deleting partial upload {:#x} ({}) before re-upload",
                        handle, record.name
                    );
                    engine.execute(op::DELETE_OBJECT, &[handle], deadline, cancel)?;
                    deleted += 1;
                }
            }
            Ok(deleted)
        })
    }

    /// ### Close
    ///
    /// Stop the pump, close the device session and latch this handle.
    ///
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_event_pump();
        // best effort: the device may already be gone
        let cancel = CancelToken::new();
        let deadline = Deadline::after(Duration::from_secs(2));
        if let Ok(_guard) = self.lock.acquire(&cancel, &deadline) {
            let mut engine = self.engine.lock().unwrap();
            if let Err(e) = engine.execute(op::CLOSE_SESSION, &[], &deadline, &cancel) {
                debug!("CloseSession failed during shutdown: {e}");
            }
            engine.close();
        }
        info!("session {} closed", self.device_id);
    }

    // ==========
    // INTERNALS
    // ==========

    fn ensure_open(&self) -> Result<(), MtpError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(MtpError::DeviceDisconnected)
        } else {
            Ok(())
        }
    }

    fn latch_closed(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            warn!("session {} latched closed after fatal error", self.device_id);
            self.stop_event_pump();
        }
    }

    /// Run one protocol operation under the transaction lock and the
    /// overall deadline.
    fn run<T>(
        &self,
        cancel: &CancelToken,
        f: impl FnOnce(&mut ProtocolEngine, &Deadline) -> Result<T, MtpError>,
    ) -> Result<T, MtpError> {
        self.ensure_open()?;
        let deadline = Deadline::after(self.tuning.overall_deadline());
        let guard = self.lock.acquire(cancel, &deadline)?;
        let mut engine = self.engine.lock().unwrap();
        let result = f(&mut engine, &deadline);
        drop(engine);
        drop(guard);

        match result {
            Err(MtpError::Transport(TransportError::Cancelled)) | Err(MtpError::Cancelled) => {
                Err(MtpError::Cancelled)
            }
            Err(e) => {
                if e.is_session_fatal() {
                    self.latch_closed();
                }
                Err(e)
            }
            ok => ok,
        }
    }

    fn run_delay_hooks(&self, phase: HookPhase) {
        for hook in self.tuning.hooks_for(phase) {
            if let Some(ms) = hook.delay_ms {
                std::thread::sleep(Duration::from_millis(ms));
            }
        }
    }

    fn start_event_pump(&self) {
        if self.tuning.disable_event_pump {
            debug!("event pump disabled by policy");
            return;
        }
        let reader = match self.engine.lock().unwrap().take_interrupt_reader() {
            Some(reader) => reader,
            None => {
                debug!("no interrupt endpoint, events unavailable");
                return;
            }
        };
        let cancel = CancelToken::new();
        let handle = spawn_event_pump(
            reader,
            self.events.clone(),
            cancel.clone(),
            self.tuning.event_pump_delay(),
        );
        *self.pump.lock().unwrap() = Some((handle, cancel));
    }

    fn stop_event_pump(&self) {
        if let Some((handle, cancel)) = self.pump.lock().unwrap().take() {
            cancel.cancel();
            let _ = handle.join();
        }
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn root_param(parent: u32) -> u32 {
    if parent == 0 {
        u32::MAX
    } else {
        parent
    }
}

fn temp_path_for(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".mtppart");
    dest.with_file_name(name)
}

fn spawn_event_pump(
    mut reader: Box<dyn InterruptReader>,
    fanout: Arc<EventFanout>,
    cancel: CancelToken,
    pump_delay: Duration,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("mtp-event-pump".into())
        .spawn(move || {
            let mut buf = [0u8; 64];
            while !cancel.is_cancelled() {
                match reader.read_interrupt(&mut buf, pump_delay) {
                    Ok(n) => {
                        if let Some(ev) = decode_event(&buf[..n]) {
                            debug!("device event: {ev:?}");
                            fanout.publish(ev);
                        }
                    }
                    Err(TransportError::Timeout) => {
                        std::thread::sleep(pump_delay);
                    }
                    Err(TransportError::NoDevice) => {
                        debug!("event pump stopping: device gone");
                        break;
                    }
                    Err(e) => {
                        debug!("event pump read error: {e}");
                        std::thread::sleep(pump_delay);
                    }
                }
            }
        })
        .expect("spawn event pump thread")
}

fn decode_event(buf: &[u8]) -> Option<DeviceEvent> {
    let container = codec::decode_container(buf).ok()?;
    if container.kind != codec::ContainerKind::Event {
        return None;
    }
    let param = container.params.first().copied().unwrap_or(0);
    match container.code {
        event::OBJECT_ADDED => Some(DeviceEvent::ObjectAdded(param)),
        event::OBJECT_REMOVED => Some(DeviceEvent::ObjectRemoved(param)),
        event::OBJECT_MOVED => Some(DeviceEvent::ObjectMoved(param)),
        event::STORAGE_INFO_CHANGED => Some(DeviceEvent::StorageInfoChanged(param)),
        // unrecognized events are dropped
        _ => None,
    }
}
