//! ## Probe Ladder
//!
//! Scores the candidate interfaces of a freshly attached device, then
//! walks them best-first: claim, GetDeviceInfo under the handshake
//! budget, OpenSession. Every attempt lands in the probe receipt.
//!

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::cancel::{CancelToken, Deadline};
use crate::constants::{defaults, op, rc, usb};
use crate::diagnostics::{ProbeReceipt, TransactionTimeline};
use crate::engine::ProtocolEngine;
use crate::error::{MtpError, TransportError};
use crate::quirks::QuirkDatabase;
use crate::transport::{BulkLink, BulkTransport, PhaseBudgets};
use crate::tuning::{
    build_effective_tuning, EffectiveTuning, HookPhase, LearnedProfile, ProbedCapabilities,
    TuningMode, UserOverrides,
};
use crate::types::{DeviceDescriptor, DeviceFingerprint, InterfaceCandidate, MtpDeviceInfo};

/// Handshakes slower than this classify the device as slow, which
/// doubles the timeout layer in the tuning merge.
const SLOW_HANDSHAKE: Duration = Duration::from_secs(2);

/// Builds one raw link per candidate the ladder wants to try.
pub trait LinkFactory {
    fn open(&mut self, candidate: &InterfaceCandidate) -> Result<Box<dyn BulkLink>, TransportError>;
}

impl<F> LinkFactory for F
where
    F: FnMut(&InterfaceCandidate) -> Result<Box<dyn BulkLink>, TransportError>,
{
    fn open(&mut self, candidate: &InterfaceCandidate) -> Result<Box<dyn BulkLink>, TransportError> {
        self(candidate)
    }
}

/// Inputs the ladder needs beyond the descriptor.
pub struct ProbeConfig<'a> {
    pub quirks: &'a QuirkDatabase,
    pub mode: TuningMode,
    pub overrides: &'a UserOverrides,
    pub learned: Option<&'a LearnedProfile>,
}

/// What a successful probe hands to the session.
pub struct ProbeOutcome {
    pub engine: ProtocolEngine,
    pub device_info: MtpDeviceInfo,
    pub candidate: InterfaceCandidate,
    pub fingerprint: DeviceFingerprint,
    pub tuning: EffectiveTuning,
    pub receipt: ProbeReceipt,
    pub handshake: Duration,
}

/// ### Score Candidate
///
/// Still-image interfaces beat vendor-specific ones, three endpoints
/// beat two, alternate setting zero gets a nudge.
///
pub fn score_candidate(c: &InterfaceCandidate) -> i32 {
    let mut score = 0;
    if c.iface.class == usb::STILL_IMAGE_CLASS_CODE {
        score += 10;
    }
    if c.iface.class == usb::VENDOR_SPECIFIC_CLASS_CODE
        && c.iface.subclass == usb::MTP_VENDOR_SUBCLASS_CODE
        && c.iface.protocol == usb::MTP_VENDOR_PROTOCOL_CODE
    {
        score += 6;
    }
    if c.endpoints.event.is_some() {
        score += 4;
    }
    if c.alt_setting == 0 {
        score += 1;
    }
    score
}

/// ### Probe Session
///
/// Walk the candidates best-first until one yields an open session.
/// Returns the best-diagnosed failure when every candidate fails.
///
pub fn probe_session(
    descriptor: &DeviceDescriptor,
    factory: &mut dyn LinkFactory,
    config: &ProbeConfig<'_>,
    timeline: Arc<TransactionTimeline>,
    cancel: &CancelToken,
) -> Result<ProbeOutcome, (MtpError, ProbeReceipt)> {
    let mut receipt = ProbeReceipt::default();

    if descriptor.candidates.is_empty() {
        return Err((
            MtpError::PreconditionFailed("device exposes no bulk interface".into()),
            receipt,
        ));
    }

    // ORDER THE CANDIDATES
    // ==========
    let mut ordered: Vec<(i32, &InterfaceCandidate)> = descriptor
        .candidates
        .iter()
        .map(|c| (score_candidate(c), c))
        .collect();
    // a pinning quirk rule force-selects its interface
    let pinned = ordered.iter().find_map(|(_, c)| {
        config
            .quirks
            .pinned_interface(&descriptor.fingerprint(c), None)
            .filter(|pin| *pin == c.interface_number)
    });
    if let Some(pin) = pinned {
        debug!("quirk database pins interface {pin}");
        ordered.retain(|(_, c)| c.interface_number == pin);
    }
    ordered.sort_by(|(sa, ca), (sb, cb)| {
        sb.cmp(sa)
            .then(ca.interface_number.cmp(&cb.interface_number))
    });

    let mut last_error: Option<MtpError> = None;

    for (score, candidate) in ordered {
        let attempt_started = Instant::now();
        match try_candidate(descriptor, candidate, factory, config, &timeline, cancel) {
            Ok((engine, device_info, handshake)) => {
                receipt.record_attempt(candidate, score, attempt_started.elapsed(), None);
                return Ok(finish_probe(
                    descriptor, candidate, engine, device_info, handshake, config, receipt,
                ));
            }
            Err(e) => {
                warn!(
                    "candidate interface {} failed probe: {e}",
                    candidate.interface_number
                );
                receipt.record_attempt(
                    candidate,
                    score,
                    attempt_started.elapsed(),
                    Some(e.to_string()),
                );
                last_error = Some(e);
            }
        }
    }

    let error = last_error.unwrap_or(MtpError::DeviceDisconnected);
    Err((error, receipt))
}

fn try_candidate(
    descriptor: &DeviceDescriptor,
    candidate: &InterfaceCandidate,
    factory: &mut dyn LinkFactory,
    config: &ProbeConfig<'_>,
    timeline: &Arc<TransactionTimeline>,
    cancel: &CancelToken,
) -> Result<(ProtocolEngine, MtpDeviceInfo, Duration), MtpError> {
    let fingerprint = descriptor.fingerprint(candidate);
    // quirk knowledge available before the handshake: fingerprint only
    let pre_rule = config.quirks.best_match(&fingerprint, None);
    let reset_on_open = pre_rule
        .and_then(|r| r.ops.reset_on_open)
        .unwrap_or(false);
    let stabilize = pre_rule
        .and_then(|r| r.tuning.stabilize_ms)
        .map(Duration::from_millis)
        .unwrap_or(defaults::STABILIZE_DELAY);
    let hooks: &[crate::tuning::PhaseHook] = pre_rule.map(|r| r.hooks.as_slice()).unwrap_or(&[]);

    // CLAIM
    // ==========
    let link = factory.open(candidate).map_err(MtpError::Transport)?;
    let transport = BulkTransport::new(link, PhaseBudgets::uniform(defaults::IO_TIMEOUT));
    let mut engine = ProtocolEngine::new(transport, timeline.clone());

    if !stabilize.is_zero() {
        std::thread::sleep(stabilize);
    }
    run_delay_hooks(hooks, HookPhase::PostClaimInterface);

    // HANDSHAKE
    // ==========
    run_delay_hooks(hooks, HookPhase::BeforeGetDeviceInfo);
    let handshake_deadline = Deadline::after(defaults::HANDSHAKE_TIMEOUT);
    let handshake_started = Instant::now();
    let (payload, result) =
        engine.get_data(op::GET_DEVICE_INFO, &[], &handshake_deadline, cancel)?;
    let handshake = handshake_started.elapsed();
    if result.code != rc::OK {
        return Err(MtpError::from_response_code(result.code));
    }
    let device_info = crate::codec::decode_device_info(&payload)?;
    debug!(
        "handshake with {} {} in {:?}",
        device_info.manufacturer, device_info.model, handshake
    );

    // OPEN SESSION
    // ==========
    open_session(&mut engine, reset_on_open, cancel)?;
    run_delay_hooks(hooks, HookPhase::PostOpenSession);

    Ok((engine, device_info, handshake))
}

fn open_session(
    engine: &mut ProtocolEngine,
    reset_on_open: bool,
    cancel: &CancelToken,
) -> Result<(), MtpError> {
    let deadline = Deadline::after(defaults::IO_TIMEOUT);
    match engine.execute(op::OPEN_SESSION, &[1], &deadline, cancel) {
        Ok(_) => Ok(()),
        Err(MtpError::ProtocolError {
            code: rc::SESSION_ALREADY_OPEN,
            ..
        }) => {
            // a stale session from a previous host is fine; an
            // optional reset gives the device a clean slate
            if reset_on_open {
                engine.reset()?;
                engine.execute(op::OPEN_SESSION, &[1], &deadline, cancel)?;
            }
            Ok(())
        }
        Err(MtpError::ProtocolError {
            code: rc::DEVICE_BUSY,
            ..
        }) if reset_on_open => {
            info!("device busy on OpenSession, resetting once");
            engine.reset()?;
            engine
                .execute(op::OPEN_SESSION, &[1], &deadline, cancel)
                .map(|_| ())
        }
        Err(e) => Err(e),
    }
}

fn finish_probe(
    descriptor: &DeviceDescriptor,
    candidate: &InterfaceCandidate,
    mut engine: ProtocolEngine,
    device_info: MtpDeviceInfo,
    handshake: Duration,
    config: &ProbeConfig<'_>,
    mut receipt: ProbeReceipt,
) -> ProbeOutcome {
    let fingerprint = descriptor.fingerprint(candidate);

    let mut probed = ProbedCapabilities::from_device_info(&device_info, descriptor.speed);
    probed.slow_device = handshake > SLOW_HANDSHAKE;

    let rule = config.quirks.best_match(&fingerprint, Some(&device_info));
    let tuning = build_effective_tuning(
        config.mode,
        Some(&probed),
        config.learned,
        rule,
        config.overrides,
    );
    engine.apply_policy(&tuning);

    receipt.fingerprint = Some(fingerprint);
    receipt.winner = Some(candidate.clone());
    receipt.operations_supported = device_info.operations_supported.clone();
    receipt.quirk_rule_id = rule.map(|r| r.id.clone());
    receipt.policy = Some(tuning.clone());
    receipt.session_opened = true;

    ProbeOutcome {
        engine,
        device_info,
        candidate: candidate.clone(),
        fingerprint,
        tuning,
        receipt,
        handshake,
    }
}

fn run_delay_hooks(hooks: &[crate::tuning::PhaseHook], phase: HookPhase) {
    for hook in hooks.iter().filter(|h| h.phase == phase) {
        if let Some(ms) = hook.delay_ms {
            std::thread::sleep(Duration::from_millis(ms));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::virtual_link::{VirtualDevice, VirtualLink};
    use crate::types::{EndpointTriple, IfaceTriple};

    fn candidate(number: u8, class: u8, with_event: bool, alt: u8) -> InterfaceCandidate {
        InterfaceCandidate {
            interface_number: number,
            alt_setting: alt,
            iface: IfaceTriple {
                class,
                subclass: if class == 0x06 { 0x01 } else { 0xFF },
                protocol: if class == 0x06 { 0x01 } else { 0x00 },
            },
            endpoints: EndpointTriple {
                input: 0x81,
                output: 0x01,
                event: with_event.then_some(0x82),
            },
            max_packet_size: 512,
        }
    }

    fn descriptor(candidates: Vec<InterfaceCandidate>) -> DeviceDescriptor {
        DeviceDescriptor {
            vendor_id: 0x18d1,
            product_id: 0x4ee1,
            bcd_device: 0x0404,
            candidates,
            usb_serial: Some("USBSER".into()),
            speed: Some(crate::types::UsbSpeed::High),
            manufacturer: Some("Acme".into()),
            model: Some("Virtual Phone".into()),
        }
    }

    fn virtual_factory(device: VirtualDevice) -> impl LinkFactory {
        move |_c: &InterfaceCandidate| -> Result<Box<dyn BulkLink>, TransportError> {
            Ok(Box::new(VirtualLink::new(device.clone())))
        }
    }

    static NO_OVERRIDES: UserOverrides = UserOverrides {
        max_chunk_bytes: None,
        io_timeout_ms: None,
        handshake_timeout_ms: None,
        inactivity_timeout_ms: None,
        overall_deadline_ms: None,
        disable_event_pump: None,
        disable_write_resume: None,
    };

    fn default_config(quirks: &QuirkDatabase) -> ProbeConfig<'_> {
        ProbeConfig {
            quirks,
            mode: TuningMode::Normal,
            overrides: &NO_OVERRIDES,
            learned: None,
        }
    }

    #[test]
    fn scoring_prefers_still_image_with_events() {
        let full = candidate(0, 0x06, true, 0);
        let vendor = candidate(1, 0xFF, true, 0);
        let bare = candidate(2, 0x08, false, 1);
        assert_eq!(score_candidate(&full), 15);
        assert_eq!(score_candidate(&vendor), 11);
        assert_eq!(score_candidate(&bare), 0);
    }

    #[test]
    fn ladder_opens_session_on_best_candidate() {
        let device = VirtualDevice::builder().build();
        let quirks = QuirkDatabase::default();
        let config = default_config(&quirks);
        let mut factory = virtual_factory(device.clone());
        let outcome = probe_session(
            &descriptor(vec![candidate(1, 0xFF, true, 0), candidate(0, 0x06, true, 0)]),
            &mut factory,
            &config,
            TransactionTimeline::new(),
            &CancelToken::new(),
        )
        .map_err(|(e, _)| e)
        .unwrap();
        assert!(device.session_is_open());
        assert_eq!(outcome.candidate.interface_number, 0);
        assert_eq!(outcome.receipt.attempts.len(), 1);
        assert!(outcome.receipt.session_opened);
        assert_eq!(outcome.device_info.model, "Virtual Phone");
        // probe layer saw GetPartialObject64 in the supported set
        assert!(outcome.tuning.partial_read64);
    }

    #[test]
    fn session_already_open_is_success() {
        let device = VirtualDevice::builder().build();
        device.script_response(op::OPEN_SESSION, rc::SESSION_ALREADY_OPEN);
        let quirks = QuirkDatabase::default();
        let config = default_config(&quirks);
        let mut factory = virtual_factory(device.clone());
        let outcome = probe_session(
            &descriptor(vec![candidate(0, 0x06, true, 0)]),
            &mut factory,
            &config,
            TransactionTimeline::new(),
            &CancelToken::new(),
        )
        .map_err(|(e, _)| e)
        .unwrap();
        assert!(outcome.receipt.session_opened);
    }

    #[test]
    fn busy_open_resets_once_when_quirk_asks() {
        let device = VirtualDevice::builder().build();
        device.script_response(op::OPEN_SESSION, rc::DEVICE_BUSY);
        let quirks = QuirkDatabase::from_json(
            r#"{
                "schemaVersion": "1",
                "entries": [
                    {
                        "id": "reset-on-open",
                        "match": { "vid": 6353, "pid": 20193 },
                        "ops": { "resetOnOpen": true }
                    }
                ]
            }"#,
        )
        .unwrap();
        let config = default_config(&quirks);
        let mut factory = virtual_factory(device.clone());
        let outcome = probe_session(
            &descriptor(vec![candidate(0, 0x06, true, 0)]),
            &mut factory,
            &config,
            TransactionTimeline::new(),
            &CancelToken::new(),
        )
        .map_err(|(e, _)| e)
        .unwrap();
        assert_eq!(device.reset_count(), 1);
        assert!(outcome.receipt.session_opened);
    }

    #[test]
    fn all_candidates_failing_reports_attempts() {
        let device = VirtualDevice::builder().build();
        device.detach();
        let quirks = QuirkDatabase::default();
        let config = default_config(&quirks);
        let mut factory = virtual_factory(device);
        let (error, receipt) = probe_session(
            &descriptor(vec![candidate(0, 0x06, true, 0), candidate(1, 0xFF, true, 0)]),
            &mut factory,
            &config,
            TransactionTimeline::new(),
            &CancelToken::new(),
        )
        .err()
        .unwrap();
        assert!(matches!(
            error,
            MtpError::Transport(TransportError::NoDevice)
        ));
        assert_eq!(receipt.attempts.len(), 2);
        assert!(receipt.attempts.iter().all(|a| a.failure.is_some()));
    }

    #[test]
    fn pinned_interface_is_force_selected() {
        let device = VirtualDevice::builder().build();
        let quirks = QuirkDatabase::from_json(
            r#"{
                "schemaVersion": "1",
                "entries": [
                    {
                        "id": "pin-vendor-iface",
                        "match": { "vid": 6353, "pid": 20193 },
                        "pinInterface": 1
                    }
                ]
            }"#,
        )
        .unwrap();
        let config = default_config(&quirks);
        let mut factory = virtual_factory(device);
        let outcome = probe_session(
            &descriptor(vec![candidate(0, 0x06, true, 0), candidate(1, 0xFF, true, 0)]),
            &mut factory,
            &config,
            TransactionTimeline::new(),
            &CancelToken::new(),
        )
        .map_err(|(e, _)| e)
        .unwrap();
        // the lower-scored vendor interface wins because the rule pins it
        assert_eq!(outcome.candidate.interface_number, 1);
    }
}
