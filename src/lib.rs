//! # Rust MTP
//!
//! Pure Rust host-side implementation of the Media Transfer Protocol
//! (MTP, a superset of PTP) over bulk USB.
//!
//! The crate discovers MTP-capable interfaces on attached devices,
//! opens per-device sessions, enumerates storages and objects, and
//! streams file transfers with resume support. Device oddities are
//! absorbed by a layered tuning system (probed capabilities, learned
//! profiles, a JSON quirk database and user overrides), and every
//! transfer is journaled so an unplugged cable never loses progress.
//!
//! ## Example
//!
//! The example below connects to the first MTP device, lists the root
//! of its first storage and downloads one file.
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use rs_mtp::{
//!     CancelToken, DeviceSession, IdentityStore, QuirkDatabase, SessionOptions,
//!     TransferJournal, TuningMode, UserOverrides,
//! };
//!
//! fn main() -> anyhow::Result<()> {
//!     let context = rusb::Context::new()?;
//!     let (device, descriptor) = rs_mtp::transport::usb::list_mtp_devices(&context)?
//!         .into_iter()
//!         .next()
//!         .expect("no MTP device attached");
//!
//!     let quirks = QuirkDatabase::default();
//!     let journal = Arc::new(TransferJournal::open(Path::new("transfers.jsonl"))?);
//!     let identities = IdentityStore::open(Path::new("identities.json"));
//!     let options = SessionOptions {
//!         quirks: &quirks,
//!         mode: TuningMode::Normal,
//!         overrides: &UserOverrides::from_env(),
//!         learned: None,
//!         verify_transfers: true,
//!     };
//!
//!     let mut factory = rs_mtp::UsbLinkFactory::new(device);
//!     let cancel = CancelToken::new();
//!     let session = DeviceSession::open(
//!         &descriptor, &mut factory, &options, journal, &identities, &cancel,
//!     )?;
//!
//!     let storages = session.storages(&cancel)?;
//!     for object in session.list(storages[0].storage_id, None, &cancel)? {
//!         println!("{:>10}  {}", object.size_bytes.unwrap_or(0), object.name);
//!     }
//!     Ok(())
//! }
//! ```
//!

pub mod cancel;
pub mod codec;
pub mod constants;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod identity;
pub mod journal;
pub mod lock;
pub mod pipeline;
pub mod probe;
pub mod quirks;
pub mod session;
pub mod transport;
pub mod tuning;
pub mod types;

pub use cancel::{CancelToken, Deadline};
pub use diagnostics::{actionable_message, ProbeReceipt, TransactionTimeline};
pub use error::{CodecError, JournalError, MtpError, TransportError};
pub use identity::{IdentitySignals, IdentityStore, StableDeviceIdentity};
pub use journal::{TransferJournal, TransferKind, TransferRecord, TransferState};
pub use pipeline::TransferProgress;
pub use quirks::QuirkDatabase;
pub use session::{DeviceSession, EventStream, SessionOptions};
pub use tuning::{EffectiveTuning, LearnedStore, TuningMode, UserOverrides};
pub use types::{
    ByteRange, DeviceDescriptor, DeviceEvent, DeviceFingerprint, MtpDeviceInfo, ObjectInfo,
    StorageInfo,
};

use rusb::{Context, Device, DeviceHandle};

use probe::LinkFactory;
use transport::usb::UsbLink;
use transport::BulkLink;
use types::InterfaceCandidate;

/// ### UsbLinkFactory
///
/// Opens one handle to a real device and claims whichever candidate
/// interface the probe ladder asks for.
///
pub struct UsbLinkFactory {
    device: Device<Context>,
    handle: Option<DeviceHandle<Context>>,
}

impl UsbLinkFactory {
    pub fn new(device: Device<Context>) -> UsbLinkFactory {
        UsbLinkFactory {
            device,
            handle: None,
        }
    }
}

impl LinkFactory for UsbLinkFactory {
    fn open(
        &mut self,
        candidate: &InterfaceCandidate,
    ) -> Result<Box<dyn BulkLink>, TransportError> {
        let handle = match self.handle.take() {
            Some(handle) => handle,
            None => self.device.open().map_err(TransportError::from)?,
        };
        match UsbLink::claim(handle, candidate) {
            Ok(link) => Ok(Box::new(link)),
            Err((handle, error)) => {
                // keep the handle for the next candidate
                self.handle = Some(handle);
                Err(error)
            }
        }
    }
}
