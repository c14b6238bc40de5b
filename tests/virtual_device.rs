//! End-to-end scenarios driven through the scripted virtual device:
//! the full probe/session/pipeline/journal stack with no hardware.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rs_mtp::constants::op;
use rs_mtp::probe::LinkFactory;
use rs_mtp::transport::virtual_link::{VirtualDevice, VirtualLink};
use rs_mtp::transport::BulkLink;
use rs_mtp::types::{
    DeviceDescriptor, DeviceEvent, EndpointTriple, IfaceTriple, InterfaceCandidate, UsbSpeed,
};
use rs_mtp::{
    CancelToken, DeviceSession, IdentityStore, MtpError, QuirkDatabase, SessionOptions,
    TransferJournal, TransferState, TuningMode, UserOverrides,
};

const STORAGE: u32 = 0x00010001;

static NO_OVERRIDES: UserOverrides = UserOverrides {
    max_chunk_bytes: None,
    io_timeout_ms: None,
    handshake_timeout_ms: None,
    inactivity_timeout_ms: None,
    overall_deadline_ms: None,
    disable_event_pump: None,
    disable_write_resume: None,
};

fn descriptor() -> DeviceDescriptor {
    DeviceDescriptor {
        vendor_id: 0x18d1,
        product_id: 0x4ee1,
        bcd_device: 0x0404,
        candidates: vec![InterfaceCandidate {
            interface_number: 0,
            alt_setting: 0,
            iface: IfaceTriple {
                class: 0x06,
                subclass: 0x01,
                protocol: 0x01,
            },
            endpoints: EndpointTriple {
                input: 0x81,
                output: 0x01,
                event: Some(0x82),
            },
            max_packet_size: 512,
        }],
        usb_serial: Some("USBSER01".into()),
        speed: Some(UsbSpeed::High),
        manufacturer: Some("Acme".into()),
        model: Some("Virtual Phone".into()),
    }
}

fn factory_for(device: &VirtualDevice) -> impl LinkFactory {
    let device = device.clone();
    move |_c: &InterfaceCandidate| -> Result<Box<dyn BulkLink>, rs_mtp::TransportError> {
        Ok(Box::new(VirtualLink::new(device.clone())))
    }
}

struct Harness {
    journal: Arc<TransferJournal>,
    identities: IdentityStore,
    quirks: QuirkDatabase,
    overrides: &'static UserOverrides,
}

impl Harness {
    fn new(dir: &Path) -> Harness {
        Harness {
            journal: Arc::new(TransferJournal::open(&dir.join("transfers.jsonl")).unwrap()),
            identities: IdentityStore::open(&dir.join("identities.json")),
            quirks: QuirkDatabase::default(),
            overrides: &NO_OVERRIDES,
        }
    }

    fn with_overrides(dir: &Path, overrides: &'static UserOverrides) -> Harness {
        let mut h = Harness::new(dir);
        h.overrides = overrides;
        h
    }

    fn open(&self, device: &VirtualDevice) -> DeviceSession {
        let options = SessionOptions {
            quirks: &self.quirks,
            mode: TuningMode::Normal,
            overrides: self.overrides,
            learned: None,
            verify_transfers: true,
        };
        let mut factory = factory_for(device);
        DeviceSession::open(
            &descriptor(),
            &mut factory,
            &options,
            self.journal.clone(),
            &self.identities,
            &CancelToken::new(),
        )
        .expect("session open")
    }
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 239) as u8).collect()
}

// ==========
// SCENARIO 1: PIPE-STALL RECOVERY
// ==========

#[test]
fn stall_during_get_storage_ids_recovers_with_one_clear_halt() {
    let dir = tempfile::tempdir().unwrap();
    let device = VirtualDevice::builder().build();
    let harness = Harness::new(dir.path());
    let session = harness.open(&device);
    let baseline = device.clear_halt_count();

    device.script_read_stalls(1);
    let storages = session.storages(&CancelToken::new()).unwrap();
    assert_eq!(storages.len(), 1);
    assert_eq!(storages[0].storage_id, STORAGE);
    assert_eq!(device.clear_halt_count(), baseline + 1);
    session.close();
}

// ==========
// SCENARIO 2: CHUNK FALLBACK
// ==========

static BIG_CHUNK: UserOverrides = UserOverrides {
    max_chunk_bytes: Some(4 * 1024 * 1024),
    io_timeout_ms: None,
    handshake_timeout_ms: None,
    inactivity_timeout_ms: None,
    overall_deadline_ms: None,
    disable_event_pump: None,
    disable_write_resume: None,
};

#[test]
fn device_busy_mid_transfer_halves_chunks_until_success() {
    let dir = tempfile::tempdir().unwrap();
    let device = VirtualDevice::builder().build();
    let payload = patterned(10 * 1024 * 1024);
    let handle = device.add_file(STORAGE, 0, "big.bin", payload.clone());

    let harness = Harness::with_overrides(dir.path(), &BIG_CHUNK);
    let session = harness.open(&device);

    // past 2 MiB the device rejects partial reads larger than 1 MiB
    device.script_busy_above_chunk(op::GET_PARTIAL_OBJECT_64, 2 * 1024 * 1024, 1024 * 1024);

    let dest = dir.path().join("big.bin");
    let bytes = session
        .read_to_file(handle, &dest, None, &CancelToken::new())
        .unwrap();
    assert_eq!(bytes, payload.len() as u64);
    assert_eq!(std::fs::read(&dest).unwrap(), payload);

    // the journal saw the transfer through to the end
    assert!(session.policy().max_chunk_bytes == 4 * 1024 * 1024);
    assert!(harness.journal.resumables(session.device_id()).is_empty());
    session.close();
}

// ==========
// SCENARIO 3 + 4: RESUMABILITY BOOKKEEPING
// ==========

#[test]
fn interrupted_read_is_resumable_until_completed() {
    let dir = tempfile::tempdir().unwrap();
    let journal = TransferJournal::open(&dir.path().join("transfers.jsonl")).unwrap();
    let id = journal
        .begin_read(
            "device-1",
            0xAAAA,
            "clip.mp4",
            Some(10_000),
            true,
            &dir.path().join("clip.mp4.part"),
            &dir.path().join("clip.mp4"),
            None,
        )
        .unwrap();
    journal.update_progress(id, 3_000).unwrap();
    journal.fail(id, "device detached").unwrap();

    let resumable = journal.resumables("device-1");
    assert_eq!(resumable.len(), 1);
    assert_eq!(resumable[0].state, TransferState::Failed);
    assert_eq!(resumable[0].committed_bytes, 3_000);
    assert_eq!(resumable[0].handle, Some(0xAAAA));

    journal.complete(id).unwrap();
    assert!(journal.resumables("device-1").is_empty());
}

#[test]
fn failed_download_resumes_from_committed_offset() {
    let dir = tempfile::tempdir().unwrap();
    let device = VirtualDevice::builder().build();
    let payload = patterned(2 * 1024 * 1024);
    let handle = device.add_file(STORAGE, 0, "resume.bin", payload.clone());

    let harness = Harness::new(dir.path());
    let session = harness.open(&device);
    let device_id = session.device_id().to_string();

    // past 512 KiB every allowed chunk size is rejected, so the
    // fallback ladder bottoms out and the transfer fails
    device.script_busy_above_chunk(op::GET_PARTIAL_OBJECT_64, 512 * 1024, 16 * 1024);

    let dest = dir.path().join("resume.bin");
    let err = session
        .read_to_file(handle, &dest, None, &CancelToken::new())
        .unwrap_err();
    assert!(matches!(err, MtpError::ProtocolError { .. }));

    let resumable = harness.journal.resumables(&device_id);
    assert_eq!(resumable.len(), 1);
    let committed = resumable[0].committed_bytes;
    assert!(committed > 0, "some progress must have been journaled");
    assert!(committed < payload.len() as u64);

    // lift the fault and retry: the download continues where it left off
    device.script_busy_above_chunk(op::GET_PARTIAL_OBJECT_64, u64::MAX, u64::MAX);
    let bytes = session
        .read_to_file(handle, &dest, None, &CancelToken::new())
        .unwrap();
    assert_eq!(bytes, payload.len() as u64);
    assert_eq!(std::fs::read(&dest).unwrap(), payload);
    assert!(harness.journal.resumables(&device_id).is_empty());
    session.close();
}

// ==========
// SCENARIO 5: TRANSACTION ORDERING
// ==========

#[test]
fn second_caller_finishes_after_first_returns() {
    let dir = tempfile::tempdir().unwrap();
    let device = VirtualDevice::builder().build();
    let harness = Harness::new(dir.path());
    let session = Arc::new(harness.open(&device));

    // every bulk read now takes 50 ms, so one storages() call holds
    // the transaction lock for several round-trips
    device.script_read_delay(Duration::from_millis(50));

    let s1 = session.clone();
    let first = std::thread::spawn(move || {
        s1.storages(&CancelToken::new()).unwrap();
        Instant::now()
    });

    std::thread::sleep(Duration::from_millis(60));
    let second_submitted = Instant::now();
    session.list(STORAGE, None, &CancelToken::new()).unwrap();
    let second_done = Instant::now();

    let first_done = first.join().unwrap();
    assert!(
        first_done > second_submitted,
        "the first operation must still be running when the second is submitted"
    );
    assert!(
        second_done > first_done,
        "the queued operation must finish after the one that held the lock"
    );
    session.close();
}

// ==========
// SCENARIO 6: RECONCILE PARTIALS ON OPEN
// ==========

#[test]
fn partial_upload_is_deleted_on_next_open() {
    let dir = tempfile::tempdir().unwrap();
    let device = VirtualDevice::builder().build();

    // establish the stable identity for this device
    let device_id = {
        let harness = Harness::new(dir.path());
        let session = harness.open(&device);
        let id = session.device_id().to_string();
        session.close();
        id
    };

    // a previous run left half an object on the device
    let partial = device.add_file(STORAGE, 0, "half.bin", vec![0u8; 5_000]);
    {
        let journal = TransferJournal::open(&dir.path().join("transfers.jsonl")).unwrap();
        let id = journal
            .begin_write(
                &device_id,
                0,
                "half.bin",
                Some(10_000),
                true,
                &dir.path().join("half.bin"),
                &dir.path().join("half.bin"),
            )
            .unwrap();
        journal.update_progress(id, 5_000).unwrap();
        journal.record_remote_handle(id, partial).unwrap();
        journal.fail(id, "unplugged").unwrap();
    }

    assert!(device.has_object(partial));
    let harness = Harness::new(dir.path());
    let session = harness.open(&device);
    assert!(
        !device.has_object(partial),
        "the partial remote object must be deleted before any new write"
    );
    session.close();
}

// ==========
// SESSION OPERATIONS
// ==========

#[test]
fn listing_uses_prop_lists_and_sees_directories() {
    let dir = tempfile::tempdir().unwrap();
    let device = VirtualDevice::builder().build();
    let music = device.add_folder(STORAGE, 0, "Music");
    device.add_file(STORAGE, music, "song.mp3", vec![1u8; 4096]);
    device.add_file(STORAGE, 0, "readme.txt", b"hello".to_vec());

    let harness = Harness::new(dir.path());
    let session = harness.open(&device);
    assert!(session.policy().prefer_prop_list_enumeration);

    let cancel = CancelToken::new();
    let mut root = session.list(STORAGE, None, &cancel).unwrap();
    root.sort_by(|a, b| a.name.cmp(&b.name));
    assert_eq!(root.len(), 2);
    assert_eq!(root[0].name, "Music");
    assert!(root[0].is_directory);
    assert_eq!(root[1].name, "readme.txt");
    assert_eq!(root[1].size_bytes, Some(5));

    let children = session.list(STORAGE, Some(music), &cancel).unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].name, "song.mp3");
    assert_eq!(children[0].parent, music);
    session.close();
}

#[test]
fn upload_rename_move_delete_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let device = VirtualDevice::builder().build();
    let harness = Harness::new(dir.path());
    let session = harness.open(&device);
    let cancel = CancelToken::new();

    let source = dir.path().join("upload.bin");
    let payload = patterned(700 * 1024);
    std::fs::write(&source, &payload).unwrap();

    let folder = session
        .create_folder(STORAGE, 0, "Incoming", &cancel)
        .unwrap();
    let handle = session
        .write_from_file(STORAGE, folder, "upload.bin", &source, None, &cancel)
        .unwrap();
    assert_eq!(device.object_data(handle).unwrap(), payload);

    session.rename(handle, "renamed.bin", &cancel).unwrap();
    assert_eq!(device.object_name(handle).unwrap(), "renamed.bin");

    session.move_object(handle, STORAGE, 0, &cancel).unwrap();
    let root = session.list(STORAGE, None, &cancel).unwrap();
    assert!(root.iter().any(|o| o.handle == handle));

    let err = session.delete(folder, false, &cancel);
    // the folder is empty after the move, so non-recursive delete works
    err.unwrap();
    session.delete(handle, false, &cancel).unwrap();
    assert!(!device.has_object(handle));
    session.close();
}

#[test]
fn non_empty_directory_needs_recursive_delete() {
    let dir = tempfile::tempdir().unwrap();
    let device = VirtualDevice::builder().build();
    let folder = device.add_folder(STORAGE, 0, "DCIM");
    let child = device.add_file(STORAGE, folder, "img.jpg", vec![1, 2, 3]);

    let harness = Harness::new(dir.path());
    let session = harness.open(&device);
    let cancel = CancelToken::new();

    let err = session.delete(folder, false, &cancel).unwrap_err();
    assert!(matches!(err, MtpError::PreconditionFailed(_)));
    session.delete(folder, true, &cancel).unwrap();
    assert!(!device.has_object(folder));
    assert!(!device.has_object(child));
    session.close();
}

#[test]
fn whole_object_fallback_when_partial_unsupported() {
    let dir = tempfile::tempdir().unwrap();
    let device = VirtualDevice::builder()
        .without_op(op::GET_PARTIAL_OBJECT_64)
        .without_op(op::GET_PARTIAL_OBJECT)
        .without_op(op::SEND_PARTIAL_OBJECT)
        .build();
    let payload = patterned(300 * 1024);
    let handle = device.add_file(STORAGE, 0, "whole.bin", payload.clone());

    let harness = Harness::new(dir.path());
    let session = harness.open(&device);
    let cancel = CancelToken::new();
    assert!(!session.policy().partial_read64);
    assert!(!session.policy().partial_write);

    let dest = dir.path().join("whole.bin");
    let bytes = session.read_to_file(handle, &dest, None, &cancel).unwrap();
    assert_eq!(bytes, payload.len() as u64);
    assert_eq!(std::fs::read(&dest).unwrap(), payload);

    let source = dir.path().join("up-whole.bin");
    std::fs::write(&source, &payload).unwrap();
    let uploaded = session
        .write_from_file(STORAGE, 0, "up-whole.bin", &source, None, &cancel)
        .unwrap();
    assert_eq!(device.object_data(uploaded).unwrap(), payload);
    session.close();
}

#[test]
fn event_pump_routes_recognized_events() {
    let dir = tempfile::tempdir().unwrap();
    let device = VirtualDevice::builder().build();
    let harness = Harness::new(dir.path());
    let session = harness.open(&device);

    let events = session.events();
    device.push_event(0x4002, 0x77); // ObjectAdded
    device.push_event(0x9999, 1); // unrecognized, dropped
    device.push_event(0x400C, STORAGE); // StorageInfoChanged

    let first = events.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(first, DeviceEvent::ObjectAdded(0x77));
    let second = events.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(second, DeviceEvent::StorageInfoChanged(STORAGE));
    session.close();
}

#[test]
fn cancelled_operation_releases_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let device = VirtualDevice::builder().build();
    let payload = patterned(1024 * 1024);
    let handle = device.add_file(STORAGE, 0, "c.bin", payload);

    let harness = Harness::new(dir.path());
    let session = harness.open(&device);

    let cancelled = CancelToken::new();
    cancelled.cancel();
    let err = session
        .read_to_file(handle, &dir.path().join("c.bin"), None, &cancelled)
        .unwrap_err();
    assert!(matches!(err, MtpError::Cancelled));

    // the transaction lock was released on the cancel path
    let storages = session.storages(&CancelToken::new()).unwrap();
    assert_eq!(storages.len(), 1);
    session.close();
}

#[test]
fn detach_latches_the_session_closed() {
    let dir = tempfile::tempdir().unwrap();
    let device = VirtualDevice::builder().build();
    let harness = Harness::new(dir.path());
    let session = harness.open(&device);

    device.detach();
    let err = session.storages(&CancelToken::new()).unwrap_err();
    assert!(matches!(
        err,
        MtpError::Transport(rs_mtp::TransportError::NoDevice)
    ));

    // fail fast from then on, even after reattach
    device.reattach();
    let err = session.storages(&CancelToken::new()).unwrap_err();
    assert!(matches!(err, MtpError::DeviceDisconnected));
}

#[test]
fn identity_survives_reconnect() {
    let dir = tempfile::tempdir().unwrap();
    let device = VirtualDevice::builder().build();

    let first = {
        let harness = Harness::new(dir.path());
        let session = harness.open(&device);
        let id = session.identity().domain_id;
        session.close();
        id
    };
    let second = {
        let harness = Harness::new(dir.path());
        let session = harness.open(&device);
        let id = session.identity().domain_id;
        session.close();
        id
    };
    assert_eq!(first, second);
}
