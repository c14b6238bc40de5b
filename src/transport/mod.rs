//! ## Transport
//!
//! Bulk endpoint I/O with phase-classified timeouts, pipe-stall
//! recovery and cooperative cancellation.
//!
//! The split mirrors the hardware boundary: a [`BulkLink`] moves raw
//! bytes through one endpoint (libusb-backed, or the scripted virtual
//! link used by the test suite), and [`BulkTransport`] layers the
//! recovery policy on top so every link gets identical semantics.
//!

pub mod usb;
pub mod virtual_link;

use std::time::Duration;

use log::{debug, warn};

use crate::cancel::{CancelToken, Deadline};
use crate::error::TransportError;

/// Largest single I/O handed to a link; transfers are sliced so the
/// cancellation token is observed at least this often.
const IO_SLICE_BYTES: usize = 256 * 1024;

/// ### Phase
///
/// Which budget an I/O runs under, and what recovery is legal for it.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    BulkOut,
    BulkIn,
    /// Waiting for the response container after command/data
    ResponseWait,
}

/// Endpoint selector for clear-halt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointSel {
    BulkIn,
    BulkOut,
}

/// Per-phase timeout budgets, filled in from the effective tuning.
#[derive(Debug, Clone, Copy)]
pub struct PhaseBudgets {
    pub bulk_out: Duration,
    pub bulk_in: Duration,
    pub response_wait: Duration,
}

impl PhaseBudgets {
    pub fn uniform(io_timeout: Duration) -> PhaseBudgets {
        PhaseBudgets {
            bulk_out: io_timeout,
            bulk_in: io_timeout,
            response_wait: io_timeout,
        }
    }

    fn for_phase(&self, phase: Phase) -> Duration {
        match phase {
            Phase::BulkOut => self.bulk_out,
            Phase::BulkIn => self.bulk_in,
            Phase::ResponseWait => self.response_wait,
        }
    }
}

/// Reads event containers off the interrupt endpoint. Split from the
/// link so the event pump never contends with bulk traffic for longer
/// than one poll slice.
pub trait InterruptReader: Send {
    fn read_interrupt(&mut self, buf: &mut [u8], timeout: Duration)
        -> Result<usize, TransportError>;
}

/// ### BulkLink
///
/// Raw endpoint I/O. One in-flight operation at a time; serialization
/// is the device session's responsibility.
///
pub trait BulkLink: Send {
    /// Write `data` to the bulk OUT endpoint. Must either write all of
    /// it or fail.
    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<(), TransportError>;

    /// Read up to `buf.len()` bytes from the bulk IN endpoint,
    /// returning the transfer length.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Read one interrupt transfer (event container), if the link has
    /// an interrupt endpoint.
    fn read_interrupt(&mut self, buf: &mut [u8], timeout: Duration)
        -> Result<usize, TransportError>;

    fn clear_halt(&mut self, ep: EndpointSel) -> Result<(), TransportError>;

    /// Class-level device reset.
    fn reset(&mut self) -> Result<(), TransportError>;

    fn close(&mut self);

    /// Largest packet the bulk endpoints accept.
    fn max_packet_size(&self) -> usize;

    fn has_interrupt_endpoint(&self) -> bool;

    /// Hand out an independent reader for the interrupt endpoint, if
    /// the link has one. At most one reader is ever taken.
    fn take_interrupt_reader(&mut self) -> Option<Box<dyn InterruptReader>>;
}

/// ### BulkTransport
///
/// The recovery-bearing transport the protocol engine talks to.
///
/// - a pipe stall is cleared and the transfer retried once; a second
///   stall surfaces `TransportError::Stall`
/// - a timeout surfaces `TimeoutInPhase` after the phase budget, with
///   no implicit retry
/// - transfers are sliced so cancellation and deadline are observed
///   between slices
///
pub struct BulkTransport {
    link: Box<dyn BulkLink>,
    budgets: PhaseBudgets,
    closed: bool,
}

impl BulkTransport {
    pub fn new(link: Box<dyn BulkLink>, budgets: PhaseBudgets) -> BulkTransport {
        BulkTransport {
            link,
            budgets,
            closed: false,
        }
    }

    pub fn set_budgets(&mut self, budgets: PhaseBudgets) {
        self.budgets = budgets;
    }

    pub fn max_packet_size(&self) -> usize {
        self.link.max_packet_size()
    }

    pub fn has_interrupt_endpoint(&self) -> bool {
        self.link.has_interrupt_endpoint()
    }

    pub fn take_interrupt_reader(&mut self) -> Option<Box<dyn InterruptReader>> {
        self.link.take_interrupt_reader()
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed {
            Err(TransportError::NoDevice)
        } else {
            Ok(())
        }
    }

    fn io_timeout(&self, phase: Phase, deadline: &Deadline) -> Result<Duration, TransportError> {
        let budget = deadline.io_budget(self.budgets.for_phase(phase));
        if budget.is_zero() {
            Err(TransportError::TimeoutInPhase(phase))
        } else {
            Ok(budget)
        }
    }

    /// ### Bulk Write
    ///
    /// Write `data` in cancellation-sliced pieces under the phase
    /// budget. A terminating zero-length packet is sent when the total
    /// lands on a packet boundary and `zlp` is requested.
    ///
    pub fn bulk_write(
        &mut self,
        data: &[u8],
        phase: Phase,
        deadline: &Deadline,
        cancel: &CancelToken,
        zlp: bool,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut offset = 0;
        loop {
            cancel.check()?;
            if deadline.expired() {
                return Err(TransportError::TimeoutInPhase(phase));
            }
            let end = (offset + IO_SLICE_BYTES).min(data.len());
            let timeout = self.io_timeout(phase, deadline)?;
            self.write_with_recovery(&data[offset..end], timeout, phase)?;
            offset = end;
            if offset >= data.len() {
                break;
            }
        }
        if zlp && !data.is_empty() && data.len() % self.link.max_packet_size() == 0 {
            let timeout = self.io_timeout(phase, deadline)?;
            self.write_with_recovery(&[], timeout, phase)?;
        }
        Ok(())
    }

    /// ### Bulk Read
    ///
    /// Read one transfer into `buf` under the phase budget, returning
    /// the number of bytes the device sent.
    ///
    pub fn bulk_read(
        &mut self,
        buf: &mut [u8],
        phase: Phase,
        deadline: &Deadline,
        cancel: &CancelToken,
    ) -> Result<usize, TransportError> {
        self.ensure_open()?;
        cancel.check()?;
        if deadline.expired() {
            return Err(TransportError::TimeoutInPhase(phase));
        }
        let timeout = self.io_timeout(phase, deadline)?;
        self.read_with_recovery(buf, timeout, phase)
    }

    pub fn read_interrupt(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.ensure_open()?;
        self.link.read_interrupt(buf, timeout)
    }

    pub fn clear_halt(&mut self, ep: EndpointSel) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.link.clear_halt(ep)
    }

    /// Clear both halts and issue the class device reset.
    pub fn reset(&mut self) -> Result<(), TransportError> {
        self.ensure_open()?;
        debug!("resetting transport");
        let _ = self.link.clear_halt(EndpointSel::BulkIn);
        let _ = self.link.clear_halt(EndpointSel::BulkOut);
        self.link.reset()
    }

    pub fn close(&mut self) {
        if !self.closed {
            self.link.close();
            self.closed = true;
        }
    }

    fn write_with_recovery(
        &mut self,
        data: &[u8],
        timeout: Duration,
        phase: Phase,
    ) -> Result<(), TransportError> {
        match self.link.write(data, timeout) {
            Err(TransportError::Stall) => {
                warn!("bulk OUT stalled, clearing halt and retrying once");
                self.link.clear_halt(EndpointSel::BulkOut)?;
                match self.link.write(data, timeout) {
                    Err(TransportError::Stall) => Err(TransportError::Stall),
                    other => self.classify_timeout(other, phase),
                }
            }
            other => self.classify_timeout(other, phase),
        }
    }

    fn read_with_recovery(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
        phase: Phase,
    ) -> Result<usize, TransportError> {
        match self.link.read(buf, timeout) {
            Err(TransportError::Stall) => {
                warn!("bulk IN stalled, clearing halt and retrying once");
                self.link.clear_halt(EndpointSel::BulkIn)?;
                match self.link.read(buf, timeout) {
                    Err(TransportError::Stall) => Err(TransportError::Stall),
                    other => self.classify_timeout(other, phase),
                }
            }
            other => self.classify_timeout(other, phase),
        }
    }

    fn classify_timeout<T>(
        &self,
        res: Result<T, TransportError>,
        phase: Phase,
    ) -> Result<T, TransportError> {
        match res {
            Err(TransportError::Timeout) => Err(TransportError::TimeoutInPhase(phase)),
            other => other,
        }
    }
}

impl Drop for BulkTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::virtual_link::{VirtualDevice, VirtualLink};
    use super::*;
    use crate::constants::defaults;

    fn transport_for(device: &VirtualDevice) -> BulkTransport {
        BulkTransport::new(
            Box::new(VirtualLink::new(device.clone())),
            PhaseBudgets::uniform(defaults::IO_TIMEOUT),
        )
    }

    #[test]
    fn stall_is_cleared_once_then_surfaced() {
        let device = VirtualDevice::builder().build();
        device.script_read_stalls(1);
        let mut t = transport_for(&device);
        // queue something readable
        device.push_event_bytes(vec![0u8; 4]);
        let mut buf = [0u8; 64];
        // one stall: recovered internally
        t.bulk_read(&mut buf, Phase::BulkIn, &Deadline::unbounded(), &CancelToken::new())
            .unwrap();
        assert_eq!(device.clear_halt_count(), 1);

        device.script_read_stalls(2);
        device.push_event_bytes(vec![0u8; 4]);
        let err = t
            .bulk_read(&mut buf, Phase::BulkIn, &Deadline::unbounded(), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, TransportError::Stall));
    }

    #[test]
    fn timeout_is_phase_classified() {
        let device = VirtualDevice::builder().build();
        let mut t = transport_for(&device);
        let mut buf = [0u8; 64];
        // nothing queued: the virtual link times out
        let err = t
            .bulk_read(
                &mut buf,
                Phase::ResponseWait,
                &Deadline::after(Duration::from_millis(20)),
                &CancelToken::new(),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::TimeoutInPhase(Phase::ResponseWait)
        ));
    }

    #[test]
    fn cancelled_token_fails_fast() {
        let device = VirtualDevice::builder().build();
        let mut t = transport_for(&device);
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = t
            .bulk_write(&[1, 2, 3], Phase::BulkOut, &Deadline::unbounded(), &cancel, false)
            .unwrap_err();
        assert!(matches!(err, TransportError::Cancelled));
    }

    #[test]
    fn closed_transport_reports_no_device() {
        let device = VirtualDevice::builder().build();
        let mut t = transport_for(&device);
        t.close();
        let err = t
            .bulk_write(&[0], Phase::BulkOut, &Deadline::unbounded(), &CancelToken::new(), false)
            .unwrap_err();
        assert!(matches!(err, TransportError::NoDevice));
    }
}
