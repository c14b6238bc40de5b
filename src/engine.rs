//! ## Protocol Engine
//!
//! The command/data/response state machine. One transaction is a
//! command container, an optional data phase in either direction, and
//! a response container carrying the same transaction id.
//!

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, trace, warn};

use crate::cancel::{CancelToken, Deadline};
use crate::codec::{
    decode_container, decode_container_header, encode_container, encode_data_header,
    ContainerKind, PtpContainer,
};
use crate::constants::defaults::CONTAINER_HEADER_SIZE;
use crate::constants::rc;
use crate::diagnostics::{
    op_label, TransactionOutcome, TransactionRecord, TransactionTimeline,
};
use crate::error::{MtpError, TransportError};
use crate::transport::{BulkTransport, Phase, PhaseBudgets};
use crate::tuning::{BusyBackoff, EffectiveTuning};

/// Response code and parameters of a completed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub code: u16,
    pub params: Vec<u32>,
}

/// ### ProtocolEngine
///
/// Owns the transport exclusively. Callers serialize transactions; the
/// engine enforces id monotonicity and phase order.
///
pub struct ProtocolEngine {
    transport: BulkTransport,
    next_tid: u32,
    max_chunk: usize,
    inactivity: std::time::Duration,
    busy_backoff: Option<BusyBackoff>,
    timeline: Arc<TransactionTimeline>,
}

impl ProtocolEngine {
    pub fn new(transport: BulkTransport, timeline: Arc<TransactionTimeline>) -> ProtocolEngine {
        ProtocolEngine {
            transport,
            next_tid: 1,
            max_chunk: crate::constants::defaults::MAX_CHUNK_BYTES,
            inactivity: crate::constants::defaults::INACTIVITY_TIMEOUT,
            busy_backoff: None,
            timeline,
        }
    }

    /// Push the resolved policy down into the transport budgets and
    /// the engine's own knobs.
    pub fn apply_policy(&mut self, policy: &EffectiveTuning) {
        self.transport.set_budgets(PhaseBudgets::uniform(policy.io_timeout()));
        self.max_chunk = policy.max_chunk_bytes;
        self.inactivity = policy.inactivity_timeout();
        self.busy_backoff = policy.busy_backoff();
    }

    pub fn max_chunk(&self) -> usize {
        self.max_chunk
    }

    pub fn has_interrupt_endpoint(&self) -> bool {
        self.transport.has_interrupt_endpoint()
    }

    pub fn take_interrupt_reader(
        &mut self,
    ) -> Option<Box<dyn crate::transport::InterruptReader>> {
        self.transport.take_interrupt_reader()
    }

    fn alloc_tid(&mut self) -> u32 {
        let tid = self.next_tid;
        // zero is reserved; skip it on wrap
        self.next_tid = self.next_tid.checked_add(1).unwrap_or(1);
        tid
    }

    /// Restart transaction numbering for a fresh session.
    pub fn reset_transaction_ids(&mut self) {
        self.next_tid = 1;
    }

    // ==========
    // OPERATIONS
    // ==========

    /// ### Execute Command
    ///
    /// A transaction without a data phase. DeviceBusy responses retry
    /// under the configured backoff hook.
    ///
    pub fn execute(
        &mut self,
        code: u16,
        params: &[u32],
        deadline: &Deadline,
        cancel: &CancelToken,
    ) -> Result<CommandResult, MtpError> {
        let mut attempt = 0u32;
        loop {
            let result = self.transaction(code, params, DataPhase::None, deadline, cancel);
            match (&result, self.busy_backoff) {
                (
                    Err(MtpError::ProtocolError {
                        code: rc::DEVICE_BUSY,
                        ..
                    }),
                    Some(backoff),
                ) if attempt < backoff.retries => {
                    let delay = backoff.delay(attempt).min(deadline.remaining());
                    debug!(
                        "{} busy, retrying in {:?} (attempt {})",
                        op_label(code),
                        delay,
                        attempt + 1
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                _ => return result.map(|(result, _, _)| result),
            }
        }
    }

    /// ### Execute With Data In
    ///
    /// A transaction whose data phase streams from the device into
    /// `sink`. Returns the response and the number of payload bytes.
    ///
    pub fn execute_data_in(
        &mut self,
        code: u16,
        params: &[u32],
        sink: &mut dyn Write,
        deadline: &Deadline,
        cancel: &CancelToken,
    ) -> Result<(CommandResult, u64), MtpError> {
        self.transaction(code, params, DataPhase::In(sink), deadline, cancel)
            .map(|(result, bytes_in, _)| (result, bytes_in))
    }

    /// ### Execute With Data Out
    ///
    /// A transaction whose data phase streams `total` bytes from
    /// `source` to the device.
    ///
    pub fn execute_data_out(
        &mut self,
        code: u16,
        params: &[u32],
        total: u64,
        source: &mut dyn Read,
        deadline: &Deadline,
        cancel: &CancelToken,
    ) -> Result<CommandResult, MtpError> {
        self.transaction(code, params, DataPhase::Out { source, total }, deadline, cancel)
            .map(|(result, _, _)| result)
    }

    /// Buffer an entire data-in payload; for small datasets only.
    pub fn get_data(
        &mut self,
        code: u16,
        params: &[u32],
        deadline: &Deadline,
        cancel: &CancelToken,
    ) -> Result<(Vec<u8>, CommandResult), MtpError> {
        let mut buf = Vec::new();
        let (result, _) = self.execute_data_in(code, params, &mut buf, deadline, cancel)?;
        Ok((buf, result))
    }

    /// Poll the interrupt endpoint for one event container.
    pub fn read_event(
        &mut self,
        timeout: std::time::Duration,
    ) -> Result<Option<PtpContainer>, MtpError> {
        let mut buf = [0u8; 64];
        let n = match self.transport.read_interrupt(&mut buf, timeout) {
            Ok(n) => n,
            Err(TransportError::Timeout) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match decode_container(&buf[..n]) {
            Ok(c) if c.kind == ContainerKind::Event => Ok(Some(c)),
            Ok(c) => {
                trace!("non-event container on interrupt endpoint: {:?}", c.kind);
                Ok(None)
            }
            Err(e) => {
                trace!("undecodable interrupt transfer: {e}");
                Ok(None)
            }
        }
    }

    /// Clear both halts and issue the class device reset; transaction
    /// numbering restarts.
    pub fn reset(&mut self) -> Result<(), MtpError> {
        self.transport.reset()?;
        self.reset_transaction_ids();
        Ok(())
    }

    pub fn close(&mut self) {
        self.transport.close();
    }

    // ==========
    // TRANSACTION CORE
    // ==========

    fn transaction(
        &mut self,
        code: u16,
        params: &[u32],
        mut data: DataPhase<'_>,
        deadline: &Deadline,
        cancel: &CancelToken,
    ) -> Result<(CommandResult, u64, u64), MtpError> {
        let tid = self.alloc_tid();
        let started = Instant::now();
        trace!("-> {} tid {} params {:x?}", op_label(code), tid, params);

        let run = self.run_phases(code, params, &mut data, tid, deadline, cancel);

        let (outcome, bytes_in, bytes_out) = match &run {
            Ok((result, bi, bo)) => {
                let outcome = if result.code == rc::OK {
                    TransactionOutcome::Ok
                } else {
                    TransactionOutcome::ResponseCode(result.code)
                };
                (outcome, *bi, *bo)
            }
            Err(MtpError::Cancelled) | Err(MtpError::Transport(TransportError::Cancelled)) => {
                (TransactionOutcome::Cancelled, 0, 0)
            }
            Err(e) => (TransactionOutcome::TransportError(e.to_string()), 0, 0),
        };
        self.timeline.record(TransactionRecord {
            opcode: code,
            label: op_label(code),
            transaction_id: tid,
            bytes_in,
            bytes_out,
            duration_ms: started.elapsed().as_millis() as u64,
            outcome,
        });

        let (result, bytes_in, bytes_out) = run?;
        if result.code == rc::OK {
            Ok((result, bytes_in, bytes_out))
        } else {
            Err(MtpError::from_response_code(result.code))
        }
    }

    fn run_phases(
        &mut self,
        code: u16,
        params: &[u32],
        data: &mut DataPhase<'_>,
        tid: u32,
        deadline: &Deadline,
        cancel: &CancelToken,
    ) -> Result<(CommandResult, u64, u64), MtpError> {
        // COMMAND PHASE
        // ==========
        let command = encode_container(&PtpContainer {
            kind: ContainerKind::Command,
            code,
            transaction_id: tid,
            params: params.to_vec(),
        })?;
        self.transport
            .bulk_write(&command, Phase::BulkOut, deadline, cancel, false)?;

        let mut bytes_in = 0u64;
        let mut bytes_out = 0u64;

        // DATA PHASE
        // ==========
        match data {
            DataPhase::None => {}
            DataPhase::Out { source, total } => {
                bytes_out =
                    self.stream_data_out(code, tid, *total, &mut **source, deadline, cancel)?;
            }
            DataPhase::In(_) => {}
        }

        // DATA-IN / RESPONSE PHASES
        // ==========
        let result = match data {
            DataPhase::In(sink) => {
                let (result, n) =
                    self.read_data_then_response(code, tid, &mut **sink, deadline, cancel)?;
                bytes_in = n;
                result
            }
            _ => self.read_response(tid, deadline, cancel)?,
        };

        Ok((result, bytes_in, bytes_out))
    }

    fn stream_data_out(
        &mut self,
        code: u16,
        tid: u32,
        total: u64,
        source: &mut dyn Read,
        deadline: &Deadline,
        cancel: &CancelToken,
    ) -> Result<u64, MtpError> {
        // header and first chunk share one transfer
        let first_len = (total as usize).min(self.max_chunk);
        let mut buf = encode_data_header(code, tid, total);
        if first_len > 0 {
            let start = buf.len();
            buf.resize(start + first_len, 0);
            source.read_exact(&mut buf[start..])?;
        }
        let mut sent = first_len as u64;
        let last = sent >= total;
        self.transport
            .bulk_write(&buf, Phase::BulkOut, deadline, cancel, last)?;

        let mut chunk = vec![0u8; self.max_chunk];
        while sent < total {
            cancel.check().map_err(MtpError::Transport)?;
            let n = ((total - sent) as usize).min(self.max_chunk);
            source.read_exact(&mut chunk[..n])?;
            let last = sent + n as u64 >= total;
            let write_deadline = deadline.min_with(self.inactivity);
            self.transport
                .bulk_write(&chunk[..n], Phase::BulkOut, &write_deadline, cancel, last)?;
            sent += n as u64;
        }
        Ok(sent)
    }

    fn read_data_then_response(
        &mut self,
        code: u16,
        tid: u32,
        sink: &mut dyn Write,
        deadline: &Deadline,
        cancel: &CancelToken,
    ) -> Result<(CommandResult, u64), MtpError> {
        let mut buf = vec![0u8; self.max_chunk + CONTAINER_HEADER_SIZE];
        let n = self
            .transport
            .bulk_read(&mut buf, Phase::BulkIn, deadline, cancel)?;
        let header = decode_container_header(&buf[..n])?;
        if header.transaction_id != tid {
            return Err(self.protocol_desync(format!(
                "expected tid {tid}, device answered tid {}",
                header.transaction_id
            )));
        }

        match header.kind {
            ContainerKind::Response => {
                let container = decode_container(&buf[..n])?;
                Ok((
                    CommandResult {
                        code: container.code,
                        params: container.params,
                    },
                    0,
                ))
            }
            ContainerKind::Data => {
                if header.code != code {
                    return Err(self.protocol_desync(format!(
                        "data phase echoes op {:#06x}, expected {:#06x}",
                        header.code, code
                    )));
                }
                // declared length 0xFFFFFFFF means the device streams
                // until a short transfer
                let known_len = header.length != u32::MAX;
                let mut received = (n - CONTAINER_HEADER_SIZE) as u64;
                sink.write_all(&buf[CONTAINER_HEADER_SIZE..n])?;

                if known_len {
                    let total = header.payload_len() as u64;
                    while received < total {
                        cancel.check().map_err(MtpError::Transport)?;
                        let want = ((total - received) as usize).min(self.max_chunk);
                        let read_deadline = deadline.min_with(self.inactivity);
                        let n = self.transport.bulk_read(
                            &mut buf[..want],
                            Phase::BulkIn,
                            &read_deadline,
                            cancel,
                        )?;
                        if n == 0 {
                            return Err(TransportError::TimeoutInPhase(Phase::BulkIn).into());
                        }
                        sink.write_all(&buf[..n])?;
                        received += n as u64;
                    }
                } else {
                    loop {
                        cancel.check().map_err(MtpError::Transport)?;
                        let read_deadline = deadline.min_with(self.inactivity);
                        let n = self.transport.bulk_read(
                            &mut buf,
                            Phase::BulkIn,
                            &read_deadline,
                            cancel,
                        )?;
                        sink.write_all(&buf[..n])?;
                        received += n as u64;
                        if n < buf.len() {
                            break;
                        }
                    }
                }

                let result = self.read_response(tid, deadline, cancel)?;
                Ok((result, received))
            }
            other => Err(self.protocol_desync(format!(
                "unexpected {:?} container during data phase",
                other
            ))),
        }
    }

    fn read_response(
        &mut self,
        tid: u32,
        deadline: &Deadline,
        cancel: &CancelToken,
    ) -> Result<CommandResult, MtpError> {
        let mut buf = [0u8; 64];
        let n = self
            .transport
            .bulk_read(&mut buf, Phase::ResponseWait, deadline, cancel)?;
        let container = decode_container(&buf[..n])?;
        if container.kind != ContainerKind::Response {
            return Err(self.protocol_desync(format!(
                "expected response container, got {:?}",
                container.kind
            )));
        }
        if container.transaction_id != tid {
            return Err(self.protocol_desync(format!(
                "response tid {} does not match command tid {tid}",
                container.transaction_id
            )));
        }
        trace!(
            "<- response {:#06x} params {:x?}",
            container.code,
            container.params
        );
        Ok(CommandResult {
            code: container.code,
            params: container.params,
        })
    }

    /// Phase desynchronization: clear both halts and reset so the next
    /// transaction starts from a clean pipe.
    fn protocol_desync(&mut self, message: String) -> MtpError {
        warn!("protocol desync: {message}");
        if let Err(e) = self.reset() {
            warn!("reset after desync failed: {e}");
        }
        MtpError::ProtocolError {
            code: 0,
            message: Some(message),
        }
    }
}

enum DataPhase<'a> {
    None,
    In(&'a mut dyn Write),
    Out {
        source: &'a mut dyn Read,
        total: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::op;
    use crate::transport::virtual_link::{VirtualDevice, VirtualLink};

    fn engine_for(device: &VirtualDevice) -> ProtocolEngine {
        let transport = BulkTransport::new(
            Box::new(VirtualLink::new(device.clone())),
            PhaseBudgets::uniform(std::time::Duration::from_secs(2)),
        );
        ProtocolEngine::new(transport, TransactionTimeline::new())
    }

    fn unbounded() -> (Deadline, CancelToken) {
        (Deadline::unbounded(), CancelToken::new())
    }

    #[test]
    fn command_without_data_phase() {
        let device = VirtualDevice::builder().build();
        let mut engine = engine_for(&device);
        let (deadline, cancel) = unbounded();
        let result = engine
            .execute(op::OPEN_SESSION, &[1], &deadline, &cancel)
            .unwrap();
        assert_eq!(result.code, rc::OK);
        assert!(device.session_is_open());
    }

    #[test]
    fn transaction_ids_start_at_one_and_increment() {
        let device = VirtualDevice::builder().build();
        let mut engine = engine_for(&device);
        let (deadline, cancel) = unbounded();
        engine
            .execute(op::OPEN_SESSION, &[1], &deadline, &cancel)
            .unwrap();
        let (_, result) = engine
            .get_data(op::GET_STORAGE_IDS, &[], &deadline, &cancel)
            .unwrap();
        assert_eq!(result.code, rc::OK);
        let snapshot = engine.timeline.snapshot();
        assert_eq!(snapshot[0].transaction_id, 1);
        assert_eq!(snapshot[1].transaction_id, 2);
    }

    #[test]
    fn data_in_streams_whole_payload() {
        let device = VirtualDevice::builder().build();
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let handle = device.add_file(0x00010001, 0, "blob.bin", payload.clone());
        let mut engine = engine_for(&device);
        let (deadline, cancel) = unbounded();
        engine
            .execute(op::OPEN_SESSION, &[1], &deadline, &cancel)
            .unwrap();
        let mut out = Vec::new();
        let (result, n) = engine
            .execute_data_in(op::GET_OBJECT, &[handle], &mut out, &deadline, &cancel)
            .unwrap();
        assert_eq!(result.code, rc::OK);
        assert_eq!(n, payload.len() as u64);
        assert_eq!(out, payload);
    }

    #[test]
    fn data_out_round_trips() {
        let device = VirtualDevice::builder().build();
        let mut engine = engine_for(&device);
        let (deadline, cancel) = unbounded();
        engine
            .execute(op::OPEN_SESSION, &[1], &deadline, &cancel)
            .unwrap();

        let info = crate::codec::encode_object_info(
            0x00010001,
            0,
            "up.bin",
            5,
            crate::constants::fmt::UNDEFINED,
        );
        let mut cursor = std::io::Cursor::new(info.clone());
        let result = engine
            .execute_data_out(
                op::SEND_OBJECT_INFO,
                &[0x00010001, u32::MAX],
                info.len() as u64,
                &mut cursor,
                &deadline,
                &cancel,
            )
            .unwrap();
        assert_eq!(result.code, rc::OK);
        let new_handle = result.params[2];

        let body = b"hello".to_vec();
        let mut cursor = std::io::Cursor::new(body.clone());
        engine
            .execute_data_out(op::SEND_OBJECT, &[], 5, &mut cursor, &deadline, &cancel)
            .unwrap();
        assert_eq!(device.object_data(new_handle).unwrap(), body);
    }

    #[test]
    fn non_ok_response_surfaces_as_error() {
        let device = VirtualDevice::builder().build();
        let mut engine = engine_for(&device);
        let (deadline, cancel) = unbounded();
        engine
            .execute(op::OPEN_SESSION, &[1], &deadline, &cancel)
            .unwrap();
        let err = engine
            .execute(op::DELETE_OBJECT, &[0xDEAD], &deadline, &cancel)
            .unwrap_err();
        assert!(matches!(err, MtpError::ObjectNotFound));
    }

    #[test]
    fn busy_response_retries_under_backoff_hook() {
        let device = VirtualDevice::builder().build();
        let mut engine = engine_for(&device);
        engine.busy_backoff = Some(BusyBackoff {
            base_ms: 1,
            jitter: 0.0,
            retries: 3,
        });
        let (deadline, cancel) = unbounded();
        device.script_response(op::OPEN_SESSION, rc::DEVICE_BUSY);
        device.script_response(op::OPEN_SESSION, rc::DEVICE_BUSY);
        let result = engine
            .execute(op::OPEN_SESSION, &[1], &deadline, &cancel)
            .unwrap();
        assert_eq!(result.code, rc::OK);
    }

    #[test]
    fn busy_without_hook_surfaces() {
        let device = VirtualDevice::builder().build();
        let mut engine = engine_for(&device);
        let (deadline, cancel) = unbounded();
        device.script_response(op::OPEN_SESSION, rc::DEVICE_BUSY);
        let err = engine
            .execute(op::OPEN_SESSION, &[1], &deadline, &cancel)
            .unwrap_err();
        assert!(matches!(
            err,
            MtpError::ProtocolError {
                code: rc::DEVICE_BUSY,
                ..
            }
        ));
    }

    #[test]
    fn stall_during_storage_ids_recovers_once() {
        let device = VirtualDevice::builder().build();
        let mut engine = engine_for(&device);
        let (deadline, cancel) = unbounded();
        engine
            .execute(op::OPEN_SESSION, &[1], &deadline, &cancel)
            .unwrap();
        device.script_read_stalls(1);
        let (data, result) = engine
            .get_data(op::GET_STORAGE_IDS, &[], &deadline, &cancel)
            .unwrap();
        assert_eq!(result.code, rc::OK);
        assert_eq!(device.clear_halt_count(), 1);
        let ids = crate::codec::decode_u32_array(&data).unwrap();
        assert_eq!(ids, vec![0x00010001]);
    }
}
