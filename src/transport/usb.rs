//! ## USB Link
//!
//! The libusb-backed bulk link and the descriptor walk that turns an
//! opened device into a set of probe candidates.
//!

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, warn};
use rusb::{Context, Device, DeviceHandle, Direction, TransferType, UsbContext};

use super::{BulkLink, EndpointSel, InterruptReader};
use crate::constants::usb;
use crate::error::TransportError;
use crate::types::{DeviceDescriptor, EndpointTriple, IfaceTriple, InterfaceCandidate, UsbSpeed};

/// Longest the interrupt reader may hold the handle per poll; bulk
/// traffic never waits longer than this on the pump.
const INTERRUPT_POLL_SLICE: Duration = Duration::from_millis(50);

/// ### Handle
///
/// The device handle shared between bulk I/O and the interrupt reader.
///
#[derive(Debug, Clone)]
pub struct Handle(Arc<Mutex<DeviceHandle<Context>>>);

impl Handle {
    fn new(handle: DeviceHandle<Context>) -> Handle {
        Handle(Arc::new(Mutex::new(handle)))
    }

    fn borrow(&self) -> MutexGuard<'_, DeviceHandle<Context>> {
        self.0.lock().unwrap()
    }
}

/// ### UsbLink
///
/// Owns the claimed interface and moves raw bytes through its
/// endpoints. Exclusive to one session.
///
pub struct UsbLink {
    handle: Handle,
    interface_number: u8,
    has_kernel_driver: bool,
    bulk_in: u8,
    bulk_out: u8,
    interrupt: Option<u8>,
    max_packet_size: u16,
    reader_taken: bool,
    released: bool,
}

impl UsbLink {
    /// ### Claim
    ///
    /// Claim `candidate` on an opened handle. On failure the handle is
    /// returned so the probe ladder can try the next candidate.
    ///
    pub fn claim(
        mut handle: DeviceHandle<Context>,
        candidate: &InterfaceCandidate,
    ) -> Result<UsbLink, (DeviceHandle<Context>, TransportError)> {
        // DETACH KERNEL DRIVER
        // ==========
        let has_kernel_driver = match handle.kernel_driver_active(candidate.interface_number) {
            Ok(true) => match handle.detach_kernel_driver(candidate.interface_number) {
                Ok(()) => true,
                Err(e) => return Err((handle, e.into())),
            },
            _ => false,
        };

        // CLAIM INTERFACE AND SELECT ALT SETTING
        // ==========
        if let Err(e) = handle.claim_interface(candidate.interface_number) {
            return Err((handle, e.into()));
        }
        if candidate.alt_setting != 0 {
            if let Err(e) =
                handle.set_alternate_setting(candidate.interface_number, candidate.alt_setting)
            {
                let _ = handle.release_interface(candidate.interface_number);
                return Err((handle, e.into()));
            }
        }

        debug!(
            "claimed interface {} alt {} (in {:#04x} out {:#04x})",
            candidate.interface_number,
            candidate.alt_setting,
            candidate.endpoints.input,
            candidate.endpoints.output
        );

        Ok(UsbLink {
            handle: Handle::new(handle),
            interface_number: candidate.interface_number,
            has_kernel_driver,
            bulk_in: candidate.endpoints.input,
            bulk_out: candidate.endpoints.output,
            interrupt: candidate.endpoints.event,
            max_packet_size: candidate.max_packet_size,
            reader_taken: false,
            released: false,
        })
    }
}

impl BulkLink for UsbLink {
    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<(), TransportError> {
        if data.is_empty() {
            // explicit zero-length packet
            self.handle.borrow().write_bulk(self.bulk_out, &[], timeout)?;
            return Ok(());
        }
        let mut written = 0;
        // libusb may split large transfers; loop until drained
        while written < data.len() {
            let n = self
                .handle
                .borrow()
                .write_bulk(self.bulk_out, &data[written..], timeout)?;
            if n == 0 {
                return Err(TransportError::Io("zero-length bulk write".into()));
            }
            written += n;
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        Ok(self.handle.borrow().read_bulk(self.bulk_in, buf, timeout)?)
    }

    fn read_interrupt(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        match self.interrupt {
            Some(ep) => Ok(self.handle.borrow().read_interrupt(ep, buf, timeout)?),
            None => Err(TransportError::Io("no interrupt endpoint".into())),
        }
    }

    fn clear_halt(&mut self, ep: EndpointSel) -> Result<(), TransportError> {
        let addr = match ep {
            EndpointSel::BulkIn => self.bulk_in,
            EndpointSel::BulkOut => self.bulk_out,
        };
        Ok(self.handle.borrow().clear_halt(addr)?)
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        // PTP class "Device Reset" on the interface; fall back to a
        // port reset when the device rejects the class request
        let request_type = rusb::request_type(
            Direction::Out,
            rusb::RequestType::Class,
            rusb::Recipient::Interface,
        );
        let res = self.handle.borrow().write_control(
            request_type,
            usb::CLASS_REQUEST_DEVICE_RESET,
            0,
            self.interface_number as u16,
            &[],
            Duration::from_secs(2),
        );
        match res {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!("class reset rejected ({e}), falling back to port reset");
                Ok(self.handle.borrow().reset()?)
            }
        }
    }

    fn close(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let mut handle = self.handle.borrow();
        if let Err(e) = handle.release_interface(self.interface_number) {
            warn!("failed to release interface {}: {e}", self.interface_number);
        }
        if self.has_kernel_driver {
            if let Err(e) = handle.attach_kernel_driver(self.interface_number) {
                warn!("failed to reattach kernel driver: {e}");
            }
        }
    }

    fn max_packet_size(&self) -> usize {
        self.max_packet_size as usize
    }

    fn has_interrupt_endpoint(&self) -> bool {
        self.interrupt.is_some()
    }

    fn take_interrupt_reader(&mut self) -> Option<Box<dyn InterruptReader>> {
        if self.reader_taken {
            return None;
        }
        let ep = self.interrupt?;
        self.reader_taken = true;
        Some(Box::new(UsbInterruptReader {
            handle: self.handle.clone(),
            ep,
        }))
    }
}

impl Drop for UsbLink {
    fn drop(&mut self) {
        self.close();
    }
}

struct UsbInterruptReader {
    handle: Handle,
    ep: u8,
}

impl InterruptReader for UsbInterruptReader {
    fn read_interrupt(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        let slice = timeout.min(INTERRUPT_POLL_SLICE);
        let res = self.handle.borrow().read_interrupt(self.ep, buf, slice);
        Ok(res?)
    }
}

/// ### Describe Device
///
/// Walk the configuration descriptors of an opened device and collect
/// every interface that could carry MTP, together with its endpoints.
///
pub fn describe_device<T: UsbContext>(
    device: &Device<T>,
    handle: Option<&DeviceHandle<T>>,
) -> Result<DeviceDescriptor, TransportError> {
    let device_desc = device.device_descriptor().map_err(TransportError::from)?;

    let mut candidates: Vec<InterfaceCandidate> = Vec::new();

    for n in 0..device_desc.num_configurations() {
        let config_desc = match device.config_descriptor(n) {
            Ok(c) => c,
            Err(_) => continue,
        };
        for interface in config_desc.interfaces() {
            for interface_desc in interface.descriptors() {
                // COLLECT THE ENDPOINTS
                // ==========
                let mut bulk_in = None;
                let mut bulk_out = None;
                let mut interrupt = None;
                let mut max_packet = 0u16;
                for ep in interface_desc.endpoint_descriptors() {
                    match (ep.transfer_type(), ep.direction()) {
                        (TransferType::Bulk, Direction::In) => {
                            bulk_in = Some(ep.address());
                            max_packet = max_packet.max(ep.max_packet_size());
                        }
                        (TransferType::Bulk, Direction::Out) => {
                            bulk_out = Some(ep.address());
                            max_packet = max_packet.max(ep.max_packet_size());
                        }
                        (TransferType::Interrupt, Direction::In) => {
                            interrupt = Some(ep.address());
                        }
                        _ => {}
                    }
                }
                let (input, output) = match (bulk_in, bulk_out) {
                    (Some(i), Some(o)) => (i, o),
                    // without a bulk pair the interface cannot carry MTP
                    _ => continue,
                };
                candidates.push(InterfaceCandidate {
                    interface_number: interface_desc.interface_number(),
                    alt_setting: interface_desc.setting_number(),
                    iface: IfaceTriple {
                        class: interface_desc.class_code(),
                        subclass: interface_desc.sub_class_code(),
                        protocol: interface_desc.protocol_code(),
                    },
                    endpoints: EndpointTriple {
                        input,
                        output,
                        event: interrupt,
                    },
                    max_packet_size: if max_packet == 0 { 512 } else { max_packet },
                });
            }
        }
    }

    let usb_serial = handle.and_then(|h| {
        h.read_serial_number_string_ascii(&device_desc)
            .ok()
            .filter(|s| !s.is_empty())
    });
    let manufacturer = handle.and_then(|h| h.read_manufacturer_string_ascii(&device_desc).ok());
    let model = handle.and_then(|h| h.read_product_string_ascii(&device_desc).ok());

    let version = device_desc.device_version();
    let bcd_device = ((version.major() as u16) << 8)
        | ((version.minor() as u16) << 4)
        | version.sub_minor() as u16;

    Ok(DeviceDescriptor {
        vendor_id: device_desc.vendor_id(),
        product_id: device_desc.product_id(),
        bcd_device,
        candidates,
        usb_serial,
        speed: Some(match device.speed() {
            rusb::Speed::Low => UsbSpeed::Low,
            rusb::Speed::Full => UsbSpeed::Full,
            rusb::Speed::High => UsbSpeed::High,
            rusb::Speed::Super => UsbSpeed::Super,
            _ => UsbSpeed::High,
        }),
        manufacturer,
        model,
    })
}

/// True when any candidate looks like an MTP/PTP interface.
pub fn looks_like_mtp(descriptor: &DeviceDescriptor) -> bool {
    descriptor.candidates.iter().any(|c| {
        c.iface.class == usb::STILL_IMAGE_CLASS_CODE
            || (c.iface.class == usb::VENDOR_SPECIFIC_CLASS_CODE
                && c.iface.subclass == usb::MTP_VENDOR_SUBCLASS_CODE)
    })
}

/// ### List Devices
///
/// Enumerate attached devices that expose at least one MTP-looking
/// interface.
///
pub fn list_mtp_devices(
    context: &Context,
) -> Result<Vec<(Device<Context>, DeviceDescriptor)>, TransportError> {
    let mut out = Vec::new();
    for device in context.devices().map_err(TransportError::from)?.iter() {
        let descriptor = match describe_device(&device, None) {
            Ok(d) => d,
            Err(_) => continue,
        };
        if looks_like_mtp(&descriptor) {
            out.push((device, descriptor));
        }
    }
    Ok(out)
}
