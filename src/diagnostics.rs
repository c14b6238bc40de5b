//! ## Diagnostics
//!
//! Read-only observability: a bounded ring of transaction records, the
//! probe receipt assembled at session open, and the mapping from
//! internal errors to short actionable strings.
//!

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;

use crate::constants::{defaults, op};
use crate::error::{MtpError, TransportError};
use crate::tuning::EffectiveTuning;
use crate::types::{DeviceFingerprint, InterfaceCandidate};

/// Human label for an operation code.
pub fn op_label(code: u16) -> &'static str {
    match code {
        op::GET_DEVICE_INFO => "GetDeviceInfo",
        op::OPEN_SESSION => "OpenSession",
        op::CLOSE_SESSION => "CloseSession",
        op::GET_STORAGE_IDS => "GetStorageIDs",
        op::GET_STORAGE_INFO => "GetStorageInfo",
        op::GET_NUM_OBJECTS => "GetNumObjects",
        op::GET_OBJECT_HANDLES => "GetObjectHandles",
        op::GET_OBJECT_INFO => "GetObjectInfo",
        op::GET_OBJECT => "GetObject",
        op::DELETE_OBJECT => "DeleteObject",
        op::SEND_OBJECT_INFO => "SendObjectInfo",
        op::SEND_OBJECT => "SendObject",
        op::RESET_DEVICE => "ResetDevice",
        op::MOVE_OBJECT => "MoveObject",
        op::GET_PARTIAL_OBJECT => "GetPartialObject",
        op::GET_OBJECT_PROPS_SUPPORTED => "GetObjectPropsSupported",
        op::GET_OBJECT_PROP_VALUE => "GetObjectPropValue",
        op::SET_OBJECT_PROP_VALUE => "SetObjectPropValue",
        op::GET_OBJECT_PROP_LIST => "GetObjectPropList",
        op::GET_PARTIAL_OBJECT_64 => "GetPartialObject64",
        op::SEND_PARTIAL_OBJECT => "SendPartialObject",
        op::TRUNCATE_OBJECT => "TruncateObject",
        op::BEGIN_EDIT_OBJECT => "BeginEditObject",
        op::END_EDIT_OBJECT => "EndEditObject",
        _ => "Unknown",
    }
}

/// Outcome of one protocol transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TransactionOutcome {
    Ok,
    ResponseCode(u16),
    TransportError(String),
    Cancelled,
}

/// ### TransactionRecord
///
/// One row of the transaction timeline.
///
#[derive(Debug, Clone, Serialize)]
pub struct TransactionRecord {
    pub opcode: u16,
    pub label: &'static str,
    pub transaction_id: u32,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub duration_ms: u64,
    pub outcome: TransactionOutcome,
}

/// ### TransactionTimeline
///
/// Bounded ring of the most recent transactions; the oldest record is
/// dropped at capacity.
///
#[derive(Debug)]
pub struct TransactionTimeline {
    capacity: usize,
    records: Mutex<VecDeque<TransactionRecord>>,
}

impl TransactionTimeline {
    pub fn new() -> Arc<TransactionTimeline> {
        Arc::new(TransactionTimeline {
            capacity: defaults::TIMELINE_CAPACITY,
            records: Mutex::new(VecDeque::new()),
        })
    }

    #[cfg(test)]
    pub fn with_capacity(capacity: usize) -> Arc<TransactionTimeline> {
        Arc::new(TransactionTimeline {
            capacity,
            records: Mutex::new(VecDeque::new()),
        })
    }

    pub fn record(&self, record: TransactionRecord) {
        let mut records = self.records.lock().unwrap();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Read-only snapshot, oldest first.
    pub fn snapshot(&self) -> Vec<TransactionRecord> {
        self.records.lock().unwrap().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One probe attempt, kept whether it won or lost.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeAttempt {
    pub interface_number: u8,
    pub alt_setting: u8,
    pub score: i32,
    pub elapsed_ms: u64,
    /// None when this attempt won
    pub failure: Option<String>,
}

/// ### ProbeReceipt
///
/// Structured record of one session open: every attempt, the winner,
/// the probed capabilities and the policy the session settled on.
///
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProbeReceipt {
    pub fingerprint: Option<DeviceFingerprint>,
    pub attempts: Vec<ProbeAttempt>,
    pub winner: Option<InterfaceCandidate>,
    pub operations_supported: Vec<u16>,
    pub quirk_rule_id: Option<String>,
    pub policy: Option<EffectiveTuning>,
    pub session_opened: bool,
}

impl ProbeReceipt {
    pub fn record_attempt(
        &mut self,
        candidate: &InterfaceCandidate,
        score: i32,
        elapsed: Duration,
        failure: Option<String>,
    ) {
        self.attempts.push(ProbeAttempt {
            interface_number: candidate.interface_number,
            alt_setting: candidate.alt_setting,
            score,
            elapsed_ms: elapsed.as_millis() as u64,
            failure,
        });
    }
}

/// ### Actionable Message
///
/// Short user-facing hint for an error kind. Wording stays stable so
/// front-ends can rely on it.
///
pub fn actionable_message(error: &MtpError) -> String {
    match error {
        MtpError::Transport(TransportError::Busy)
        | MtpError::ProtocolError {
            code: crate::constants::rc::DEVICE_BUSY,
            ..
        } => "Device appears to be in charging mode. Unlock your device and select \
              'File Transfer'."
            .to_string(),
        MtpError::Transport(TransportError::AccessDenied) | MtpError::PermissionDenied => {
            "Access to the device was denied. Check USB permissions, or close other \
             applications using the device."
                .to_string()
        }
        MtpError::Transport(TransportError::NoDevice) | MtpError::DeviceDisconnected => {
            "The device was disconnected. Reconnect the cable and try again.".to_string()
        }
        MtpError::Transport(TransportError::Stall) => {
            "The device stopped responding on its data pipe. Replug the cable or restart \
             the device."
                .to_string()
        }
        MtpError::Transport(TransportError::Timeout)
        | MtpError::Transport(TransportError::TimeoutInPhase(_))
        | MtpError::Timeout => {
            "The device did not answer in time. Unlock the screen and keep it awake \
             during transfers."
                .to_string()
        }
        MtpError::StorageFull => "The device storage is full. Free up space and retry.".to_string(),
        MtpError::ReadOnly | MtpError::ObjectWriteProtected => {
            "The target storage or file is read-only on the device.".to_string()
        }
        MtpError::ObjectNotFound => {
            "The file no longer exists on the device. Refresh the listing.".to_string()
        }
        MtpError::SessionBusy => {
            "Another transfer is in progress on this device. Wait for it to finish."
                .to_string()
        }
        MtpError::Cancelled | MtpError::Transport(TransportError::Cancelled) => {
            "The operation was cancelled.".to_string()
        }
        MtpError::VerificationFailed(_) => {
            "The transferred data failed verification and was discarded. Retry the \
             transfer."
                .to_string()
        }
        other => format!("Unexpected device error: {other}."),
    }
}
