//! ## Transfer Pipeline
//!
//! Streaming reads and writes layered over the protocol engine: a
//! pooled two-stage pipeline (device I/O in one stage, local file I/O
//! and journaling in the other), a chunk-fallback ladder for flaky
//! devices, throttled progress with smoothed throughput, and content
//! verification.
//!

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use log::{debug, warn};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::cancel::{CancelToken, Deadline};
use crate::constants::{defaults, op, rc};
use crate::engine::ProtocolEngine;
use crate::error::{MtpError, TransportError};
use crate::journal::{promote_temp, TransferJournal};
use crate::tuning::{EffectiveTuning, ReadStrategy, WriteStrategy};
use crate::types::ByteRange;

/// Pipeline depth: stage 1 may run at most this far ahead of stage 2.
const STAGE_DEPTH: usize = 2;

/// EWMA weight for instantaneous throughput.
const THROUGHPUT_ALPHA: f64 = 0.2;

// ==========
// BUFFER POOL
// ==========

/// Fixed set of pre-allocated chunk buffers. Stage 1 suspends on an
/// empty pool until stage 2 releases, which bounds memory end to end.
pub struct BufferPool {
    rx: Receiver<Vec<u8>>,
    tx: Sender<Vec<u8>>,
}

#[derive(Clone)]
pub struct PoolHandle(Sender<Vec<u8>>);

impl PoolHandle {
    fn release(&self, mut buf: Vec<u8>) {
        buf.clear();
        // receiver gone means the transfer is over; dropping is fine
        let _ = self.0.send(buf);
    }
}

impl BufferPool {
    pub fn new(buffers: usize, buffer_size: usize) -> BufferPool {
        let (tx, rx) = mpsc::channel();
        for _ in 0..buffers {
            tx.send(Vec::with_capacity(buffer_size)).expect("fresh channel");
        }
        BufferPool { rx, tx }
    }

    pub fn handle(&self) -> PoolHandle {
        PoolHandle(self.tx.clone())
    }

    fn acquire(&self, cancel: &CancelToken, deadline: &Deadline) -> Result<Vec<u8>, MtpError> {
        loop {
            cancel.check().map_err(MtpError::Transport)?;
            if deadline.expired() {
                return Err(MtpError::Timeout);
            }
            match self.rx.recv_timeout(Duration::from_millis(50)) {
                Ok(buf) => return Ok(buf),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(MtpError::PreconditionFailed("buffer pool torn down".into()))
                }
            }
        }
    }
}

// ==========
// PROGRESS
// ==========

#[derive(Debug, Clone, Copy)]
pub struct TransferProgress {
    pub transferred: u64,
    pub total: Option<u64>,
    pub mbps: f64,
}

pub type ProgressFn<'a> = &'a (dyn Fn(TransferProgress) + Send + Sync);

struct ProgressMeter<'a> {
    callback: Option<ProgressFn<'a>>,
    total: Option<u64>,
    ewma_mbps: f64,
    last_emit: Instant,
    last_chunk: Instant,
}

impl<'a> ProgressMeter<'a> {
    fn new(callback: Option<ProgressFn<'a>>, total: Option<u64>) -> ProgressMeter<'a> {
        let now = Instant::now();
        ProgressMeter {
            callback,
            total,
            ewma_mbps: 0.0,
            last_emit: now,
            last_chunk: now,
        }
    }

    fn on_chunk(&mut self, transferred: u64, chunk_len: usize) {
        let now = Instant::now();
        let dt = now.duration_since(self.last_chunk).as_secs_f64().max(1e-6);
        self.last_chunk = now;
        let inst = chunk_len as f64 / dt / (1024.0 * 1024.0);
        self.ewma_mbps = if self.ewma_mbps == 0.0 {
            inst
        } else {
            THROUGHPUT_ALPHA * inst + (1.0 - THROUGHPUT_ALPHA) * self.ewma_mbps
        };
        if let Some(callback) = self.callback {
            if now.duration_since(self.last_emit) >= defaults::PROGRESS_THROTTLE {
                self.last_emit = now;
                callback(TransferProgress {
                    transferred,
                    total: self.total,
                    mbps: self.ewma_mbps,
                });
            }
        }
    }

    fn finish(&mut self, transferred: u64) -> f64 {
        if let Some(callback) = self.callback {
            callback(TransferProgress {
                transferred,
                total: self.total,
                mbps: self.ewma_mbps,
            });
        }
        self.ewma_mbps
    }
}

// ==========
// CHUNK FALLBACK
// ==========

/// Per-transfer chunk ladder: halve on Stall/DeviceBusy down to the
/// floor, one retry per step. The shrink is tactical and never written
/// back to policy.
struct ChunkLadder {
    current: usize,
}

impl ChunkLadder {
    fn new(max_chunk: usize) -> ChunkLadder {
        ChunkLadder { current: max_chunk }
    }

    fn chunk(&self) -> usize {
        self.current
    }

    /// Whether the error is worth a retry at a smaller chunk.
    fn fallback(&mut self, error: &MtpError) -> bool {
        let retryable = matches!(
            error,
            MtpError::Transport(TransportError::Stall)
                | MtpError::ProtocolError {
                    code: rc::DEVICE_BUSY,
                    ..
                }
        );
        if retryable && self.current > defaults::MIN_CHUNK_BYTES {
            self.current = (self.current / 2).max(defaults::MIN_CHUNK_BYTES);
            debug!("chunk fallback to {} bytes", self.current);
            true
        } else {
            false
        }
    }
}

// ==========
// DOWNLOAD
// ==========

pub struct DownloadRequest<'a> {
    pub handle: u32,
    pub size: Option<u64>,
    pub temp_path: &'a Path,
    pub final_path: &'a Path,
    /// Byte offset already committed by an earlier run
    pub resume_from: u64,
    pub journal_id: Uuid,
    pub verify: bool,
}

/// ### Download
///
/// Stream one object to a local file through the two-stage pipeline,
/// journaling committed progress as stage 2 lands each buffer.
///
pub fn download(
    engine: &mut ProtocolEngine,
    tuning: &EffectiveTuning,
    journal: &TransferJournal,
    request: &DownloadRequest<'_>,
    progress: Option<ProgressFn<'_>>,
    cancel: &CancelToken,
    deadline: &Deadline,
) -> Result<u64, MtpError> {
    let result = match (tuning.read, request.size) {
        (ReadStrategy::Partial64, Some(size)) => {
            pipelined_download(engine, tuning, journal, request, size, true, progress, cancel, deadline)
        }
        (ReadStrategy::Partial32, Some(size)) if size <= u32::MAX as u64 => {
            pipelined_download(engine, tuning, journal, request, size, false, progress, cancel, deadline)
        }
        _ => whole_download(engine, journal, request, progress, cancel, deadline),
    };

    match result {
        Ok(total) => {
            if request.verify {
                if let Some(expected) = request.size {
                    if total != expected {
                        let message =
                            format!("downloaded {total} bytes, device declared {expected}");
                        journal.fail(request.journal_id, &message)?;
                        return Err(MtpError::VerificationFailed(message));
                    }
                }
            }
            promote_temp(request.temp_path, request.final_path)?;
            journal.complete(request.journal_id)?;
            Ok(total)
        }
        Err(e) => {
            // the partial temp stays on disk for resume
            let _ = journal.fail(request.journal_id, &e.to_string());
            Err(e)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn pipelined_download(
    engine: &mut ProtocolEngine,
    tuning: &EffectiveTuning,
    journal: &TransferJournal,
    request: &DownloadRequest<'_>,
    size: u64,
    wide_offsets: bool,
    progress: Option<ProgressFn<'_>>,
    cancel: &CancelToken,
    deadline: &Deadline,
) -> Result<u64, MtpError> {
    let pool = BufferPool::new(defaults::PIPELINE_POOL_BUFFERS, tuning.max_chunk_bytes);
    let releaser = pool.handle();
    let mut ladder = ChunkLadder::new(tuning.max_chunk_bytes);

    let (tx, rx) = mpsc::sync_channel::<(Vec<u8>, u64)>(STAGE_DEPTH);
    let journal_id = request.journal_id;
    let mut offset = request.resume_from;

    let writer_result = std::thread::scope(|scope| -> Result<WriterOutcome, MtpError> {
        // STAGE 2: LOCAL FILE + JOURNAL
        // ==========
        let writer = scope.spawn(move || -> Result<WriterOutcome, MtpError> {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .open(request.temp_path)?;
            file.seek(SeekFrom::Start(request.resume_from))?;
            file.set_len(request.resume_from)?;
            // a resumed run only sees the tail, so no hash for it
            let mut hasher = (request.verify && request.resume_from == 0).then(Sha256::new);
            let mut meter = ProgressMeter::new(progress, Some(size));
            let mut committed = request.resume_from;
            for (buf, chunk_offset) in rx {
                file.write_all(&buf)?;
                if let Some(h) = hasher.as_mut() {
                    h.update(&buf);
                }
                committed = chunk_offset + buf.len() as u64;
                journal.update_progress(journal_id, committed)?;
                meter.on_chunk(committed, buf.len());
                releaser.release(buf);
            }
            file.sync_all()?;
            let mbps = meter.finish(committed);
            Ok(WriterOutcome {
                committed,
                mbps,
                hash: hasher.map(|h| format!("{:x}", h.finalize())),
            })
        });

        // STAGE 1: DEVICE READS
        // ==========
        let stage1_result = {
            let mut stage1 = || -> Result<(), MtpError> {
                while offset < size {
                    cancel.check().map_err(MtpError::Transport)?;
                    if deadline.expired() {
                        return Err(MtpError::Timeout);
                    }
                    let mut buf = pool.acquire(cancel, deadline)?;
                    let n = loop {
                        let want = ladder.chunk().min((size - offset) as usize);
                        match read_chunk(
                            engine,
                            request.handle,
                            offset,
                            want,
                            wide_offsets,
                            &mut buf,
                            deadline,
                            cancel,
                        ) {
                            Ok(n) => break n,
                            Err(e) => {
                                if !ladder.fallback(&e) {
                                    return Err(e);
                                }
                            }
                        }
                    };
                    if n == 0 {
                        return Err(MtpError::ProtocolError {
                            code: 0,
                            message: Some("device returned an empty partial read".into()),
                        });
                    }
                    if tx.send((buf, offset)).is_err() {
                        // stage 2 died; its error is authoritative
                        return Ok(());
                    }
                    offset += n as u64;
                }
                Ok(())
            };
            stage1()
        };
        drop(tx);
        let writer_outcome = writer.join().expect("stage 2 never panics")?;
        stage1_result?;
        Ok(writer_outcome)
    })?;

    if let Some(hash) = &writer_result.hash {
        journal.add_content_hash(request.journal_id, hash)?;
    }
    if writer_result.mbps > 0.0 {
        journal.record_throughput(request.journal_id, writer_result.mbps)?;
    }
    Ok(writer_result.committed)
}

struct WriterOutcome {
    committed: u64,
    mbps: f64,
    hash: Option<String>,
}

#[allow(clippy::too_many_arguments)]
fn read_chunk(
    engine: &mut ProtocolEngine,
    handle: u32,
    offset: u64,
    len: usize,
    wide_offsets: bool,
    buf: &mut Vec<u8>,
    deadline: &Deadline,
    cancel: &CancelToken,
) -> Result<usize, MtpError> {
    buf.clear();
    let (code, params) = if wide_offsets {
        (
            op::GET_PARTIAL_OBJECT_64,
            vec![
                handle,
                (offset & 0xFFFF_FFFF) as u32,
                (offset >> 32) as u32,
                len as u32,
            ],
        )
    } else {
        (op::GET_PARTIAL_OBJECT, vec![handle, offset as u32, len as u32])
    };
    let (_result, n) = engine.execute_data_in(code, &params, buf, deadline, cancel)?;
    Ok(n as usize)
}

fn whole_download(
    engine: &mut ProtocolEngine,
    journal: &TransferJournal,
    request: &DownloadRequest<'_>,
    progress: Option<ProgressFn<'_>>,
    cancel: &CancelToken,
    deadline: &Deadline,
) -> Result<u64, MtpError> {
    // no partial support: single data phase straight into the file,
    // committing as bytes land
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(request.temp_path)?;
    let mut sink = CommittingWriter {
        file,
        journal,
        journal_id: request.journal_id,
        written: 0,
        hasher: request.verify.then(Sha256::new),
        meter: ProgressMeter::new(progress, request.size),
    };
    engine.execute_data_in(op::GET_OBJECT, &[request.handle], &mut sink, deadline, cancel)?;
    sink.file.sync_all()?;
    let mbps = sink.meter.finish(sink.written);
    if mbps > 0.0 {
        journal.record_throughput(request.journal_id, mbps)?;
    }
    if let Some(h) = sink.hasher.take() {
        journal.add_content_hash(request.journal_id, &format!("{:x}", h.finalize()))?;
    }
    Ok(sink.written)
}

struct CommittingWriter<'a> {
    file: File,
    journal: &'a TransferJournal,
    journal_id: Uuid,
    written: u64,
    hasher: Option<Sha256>,
    meter: ProgressMeter<'a>,
}

impl Write for CommittingWriter<'_> {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.file.write_all(data)?;
        if let Some(h) = self.hasher.as_mut() {
            h.update(data);
        }
        self.written += data.len() as u64;
        if self
            .journal
            .update_progress(self.journal_id, self.written)
            .is_err()
        {
            warn!("journal update failed mid-download");
        }
        self.meter.on_chunk(self.written, data.len());
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

/// ### Read Range
///
/// Stream part of an object straight to a sink, unjournaled. Used for
/// random-access reads by file-provider style callers.
///
pub fn read_range(
    engine: &mut ProtocolEngine,
    tuning: &EffectiveTuning,
    handle: u32,
    range: ByteRange,
    sink: &mut dyn Write,
    cancel: &CancelToken,
    deadline: &Deadline,
) -> Result<u64, MtpError> {
    let wide_offsets = match tuning.read {
        ReadStrategy::Partial64 => true,
        ReadStrategy::Partial32 if range.offset + range.len <= u32::MAX as u64 => false,
        ReadStrategy::Partial32 => {
            return Err(MtpError::NotSupported("64-bit partial reads"))
        }
        ReadStrategy::Whole => return Err(MtpError::NotSupported("partial reads")),
    };
    let mut ladder = ChunkLadder::new(tuning.max_chunk_bytes);
    let mut buf = Vec::with_capacity(tuning.max_chunk_bytes);
    let mut offset = range.offset;
    let end = range.offset + range.len;
    while offset < end {
        cancel.check().map_err(MtpError::Transport)?;
        let n = loop {
            let want = ladder.chunk().min((end - offset) as usize);
            match read_chunk(engine, handle, offset, want, wide_offsets, &mut buf, deadline, cancel)
            {
                Ok(n) => break n,
                Err(e) => {
                    if !ladder.fallback(&e) {
                        return Err(e);
                    }
                }
            }
        };
        if n == 0 {
            // reading past the end of the object
            break;
        }
        sink.write_all(&buf[..n])?;
        offset += n as u64;
    }
    Ok(offset - range.offset)
}

// ==========
// UPLOAD
// ==========

pub struct UploadRequest<'a> {
    pub storage_id: u32,
    pub parent: u32,
    pub name: &'a str,
    pub source_path: &'a Path,
    pub size: u64,
    pub format_code: u16,
    pub journal_id: Uuid,
    pub verify: bool,
}

/// ### Upload
///
/// Create the remote object, then stream the payload: pipelined
/// SendPartialObject chunks when the device supports them, one
/// SendObject data phase otherwise.
///
pub fn upload(
    engine: &mut ProtocolEngine,
    tuning: &EffectiveTuning,
    journal: &TransferJournal,
    request: &UploadRequest<'_>,
    progress: Option<ProgressFn<'_>>,
    cancel: &CancelToken,
    deadline: &Deadline,
) -> Result<u32, MtpError> {
    // CREATE THE REMOTE OBJECT
    // ==========
    let info = crate::codec::encode_object_info(
        request.storage_id,
        request.parent,
        request.name,
        request.size,
        request.format_code,
    );
    let mut info_cursor = std::io::Cursor::new(info);
    let info_len = info_cursor.get_ref().len() as u64;
    let result = engine.execute_data_out(
        op::SEND_OBJECT_INFO,
        &[request.storage_id, parent_param(request.parent)],
        info_len,
        &mut info_cursor,
        deadline,
        cancel,
    )?;
    let handle = *result
        .params
        .get(2)
        .ok_or(MtpError::ProtocolError {
            code: 0,
            message: Some("SendObjectInfo response missing the new handle".into()),
        })?;
    journal.record_remote_handle(request.journal_id, handle)?;

    let outcome = if tuning.write == WriteStrategy::Partial {
        pipelined_upload(engine, tuning, journal, request, handle, progress, cancel, deadline)
    } else {
        whole_upload(engine, journal, request, progress, cancel, deadline)
    };

    match outcome {
        Ok(()) => {
            if request.verify {
                verify_remote_size(engine, handle, request.size, deadline, cancel).map_err(
                    |e| {
                        let _ = journal.fail(request.journal_id, &e.to_string());
                        e
                    },
                )?;
            }
            journal.complete(request.journal_id)?;
            Ok(handle)
        }
        Err(e) => {
            let _ = journal.fail(request.journal_id, &e.to_string());
            Err(e)
        }
    }
}

fn parent_param(parent: u32) -> u32 {
    // the wire uses all-ones for "storage root"
    if parent == 0 {
        u32::MAX
    } else {
        parent
    }
}

#[allow(clippy::too_many_arguments)]
fn pipelined_upload(
    engine: &mut ProtocolEngine,
    tuning: &EffectiveTuning,
    journal: &TransferJournal,
    request: &UploadRequest<'_>,
    handle: u32,
    progress: Option<ProgressFn<'_>>,
    cancel: &CancelToken,
    deadline: &Deadline,
) -> Result<(), MtpError> {
    let pool = BufferPool::new(defaults::PIPELINE_POOL_BUFFERS, tuning.max_chunk_bytes);
    let releaser = pool.handle();
    let max_chunk = tuning.max_chunk_bytes;

    let (tx, rx) = mpsc::sync_channel::<Vec<u8>>(STAGE_DEPTH);
    let (hash_tx, hash_rx) = mpsc::channel::<String>();
    let source_path = request.source_path.to_path_buf();
    let total = request.size;
    let verify = request.verify;
    let reader_cancel = cancel.clone();

    std::thread::scope(|scope| -> Result<(), MtpError> {
        // STAGE 1: LOCAL FILE READS
        // ==========
        let reader = scope.spawn(move || -> Result<(), MtpError> {
            let mut file = File::open(&source_path)?;
            let mut hasher = verify.then(Sha256::new);
            let mut remaining = total;
            while remaining > 0 {
                let want = max_chunk.min(remaining as usize);
                let mut buf = pool.acquire(&reader_cancel, &Deadline::unbounded())?;
                buf.resize(want, 0);
                file.read_exact(&mut buf)?;
                if let Some(h) = hasher.as_mut() {
                    h.update(&buf);
                }
                remaining -= want as u64;
                if tx.send(buf).is_err() {
                    return Ok(());
                }
            }
            if let Some(h) = hasher {
                let _ = hash_tx.send(format!("{:x}", h.finalize()));
            }
            Ok(())
        });

        // STAGE 2: DEVICE WRITES
        // ==========
        let mut ladder = ChunkLadder::new(max_chunk);
        let mut meter = ProgressMeter::new(progress, Some(total));
        let mut offset = 0u64;
        let stage2_result = {
            let mut stage2 = || -> Result<(), MtpError> {
                for buf in rx.iter() {
                    cancel.check().map_err(MtpError::Transport)?;
                    if deadline.expired() {
                        return Err(MtpError::Timeout);
                    }
                    send_slices(
                        engine, handle, &mut offset, &buf, &mut ladder, deadline, cancel,
                    )?;
                    journal.update_progress(request.journal_id, offset)?;
                    meter.on_chunk(offset, buf.len());
                    releaser.release(buf);
                }
                Ok(())
            };
            stage2()
        };
        drop(rx);
        let reader_result = reader.join().expect("stage 1 never panics");
        stage2_result?;
        reader_result?;
        let mbps = meter.finish(offset);
        if mbps > 0.0 {
            journal.record_throughput(request.journal_id, mbps)?;
        }
        Ok(())
    })?;

    if let Ok(hash) = hash_rx.try_recv() {
        journal.add_content_hash(request.journal_id, &hash)?;
    }
    Ok(())
}

/// Send one pooled buffer as one or more SendPartialObject slices,
/// narrowing the slice on busy/stall.
fn send_slices(
    engine: &mut ProtocolEngine,
    handle: u32,
    offset: &mut u64,
    data: &[u8],
    ladder: &mut ChunkLadder,
    deadline: &Deadline,
    cancel: &CancelToken,
) -> Result<(), MtpError> {
    let mut sent = 0usize;
    while sent < data.len() {
        let want = ladder.chunk().min(data.len() - sent);
        let slice = &data[sent..sent + want];
        let params = [
            handle,
            (*offset & 0xFFFF_FFFF) as u32,
            (*offset >> 32) as u32,
        ];
        let mut cursor = slice;
        match engine.execute_data_out(
            op::SEND_PARTIAL_OBJECT,
            &params,
            slice.len() as u64,
            &mut cursor,
            deadline,
            cancel,
        ) {
            Ok(_) => {
                sent += want;
                *offset += want as u64;
            }
            Err(e) => {
                if !ladder.fallback(&e) {
                    return Err(e);
                }
            }
        }
    }
    Ok(())
}

fn whole_upload(
    engine: &mut ProtocolEngine,
    journal: &TransferJournal,
    request: &UploadRequest<'_>,
    progress: Option<ProgressFn<'_>>,
    cancel: &CancelToken,
    deadline: &Deadline,
) -> Result<(), MtpError> {
    let file = File::open(request.source_path)?;
    let mut source = MeteredReader {
        inner: file,
        journal,
        journal_id: request.journal_id,
        read: 0,
        hasher: request.verify.then(Sha256::new),
        meter: ProgressMeter::new(progress, Some(request.size)),
    };
    engine.execute_data_out(
        op::SEND_OBJECT,
        &[],
        request.size,
        &mut source,
        deadline,
        cancel,
    )?;
    let mbps = source.meter.finish(source.read);
    if mbps > 0.0 {
        journal.record_throughput(request.journal_id, mbps)?;
    }
    if let Some(h) = source.hasher.take() {
        journal.add_content_hash(request.journal_id, &format!("{:x}", h.finalize()))?;
    }
    Ok(())
}

struct MeteredReader<'a> {
    inner: File,
    journal: &'a TransferJournal,
    journal_id: Uuid,
    read: u64,
    hasher: Option<Sha256>,
    meter: ProgressMeter<'a>,
}

impl Read for MeteredReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            if let Some(h) = self.hasher.as_mut() {
                h.update(&buf[..n]);
            }
            self.read += n as u64;
            if self.journal.update_progress(self.journal_id, self.read).is_err() {
                warn!("journal update failed mid-upload");
            }
            self.meter.on_chunk(self.read, n);
        }
        Ok(n)
    }
}

fn verify_remote_size(
    engine: &mut ProtocolEngine,
    handle: u32,
    expected: u64,
    deadline: &Deadline,
    cancel: &CancelToken,
) -> Result<(), MtpError> {
    let (payload, _) = engine.get_data(op::GET_OBJECT_INFO, &[handle], deadline, cancel)?;
    let info = crate::codec::decode_object_info(handle, &payload)?;
    match info.size_bytes {
        Some(actual) if actual != expected => {
            warn!("upload verification failed: device reports {actual} of {expected} bytes");
            let _ = engine.execute(op::DELETE_OBJECT, &[handle], deadline, cancel);
            Err(MtpError::VerificationFailed(format!(
                "device stored {actual} bytes, expected {expected}"
            )))
        }
        _ => Ok(()),
    }
}
