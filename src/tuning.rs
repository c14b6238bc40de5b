//! ## Effective Tuning
//!
//! The layered merge that turns defaults, probed capabilities, learned
//! profiles, static quirks and user overrides into the one policy a
//! session runs under.
//!
//! Layer order is fixed; later layers override earlier ones. The merge
//! is a pure function of its inputs: identical inputs produce an
//! identical policy.
//!

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use log::{debug, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::constants::{defaults, op};
use crate::quirks::QuirkRule;
use crate::types::{MtpDeviceInfo, UsbSpeed};

fn ms(d: Duration) -> u64 {
    d.as_millis() as u64
}

/// Hook phases, named after the transition the session evaluates them at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HookPhase {
    PostOpenUsb,
    PostClaimInterface,
    PostOpenSession,
    BeforeGetDeviceInfo,
    BeforeGetStorageIds,
    BeforeTransfer,
    AfterTransfer,
    OnDeviceBusy,
}

/// Exponential busy backoff with jitter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusyBackoff {
    pub base_ms: u64,
    /// Fraction of the computed delay applied as ± jitter
    pub jitter: f64,
    pub retries: u32,
}

impl BusyBackoff {
    /// `max(100 ms, base · 2^min(attempt,10) ± jitter·that)`
    pub fn delay(&self, attempt: u32) -> Duration {
        let scaled = self.base_ms.saturating_mul(1u64 << attempt.min(10)) as f64;
        let jittered = if self.jitter > 0.0 {
            let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
            scaled + spread * scaled
        } else {
            scaled
        };
        Duration::from_millis((jittered.max(0.0)) as u64).max(Duration::from_millis(100))
    }
}

/// One declarative action attached to a session transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseHook {
    pub phase: HookPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub busy_backoff: Option<BusyBackoff>,
}

/// How directory contents are enumerated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EnumerationStrategy {
    /// One GetObjectPropList round-trip per directory
    PropList,
    /// GetObjectHandles plus per-handle GetObjectInfo
    ObjectInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReadStrategy {
    Partial64,
    Partial32,
    Whole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WriteStrategy {
    Partial,
    Whole,
}

/// ### EffectiveTuning
///
/// The one policy record a session runs under.
///
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EffectiveTuning {
    pub max_chunk_bytes: usize,
    pub io_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub inactivity_timeout_ms: u64,
    pub overall_deadline_ms: u64,
    pub stabilize_ms: u64,
    pub event_pump_delay_ms: u64,

    pub partial_read64: bool,
    pub partial_read32: bool,
    pub partial_write: bool,
    pub prefer_prop_list_enumeration: bool,
    pub disable_event_pump: bool,
    pub reset_on_open: bool,
    pub disable_write_resume: bool,

    pub enumeration: EnumerationStrategy,
    pub read: ReadStrategy,
    pub write: WriteStrategy,

    pub hooks: Vec<PhaseHook>,
}

impl Default for EffectiveTuning {
    fn default() -> EffectiveTuning {
        EffectiveTuning {
            max_chunk_bytes: defaults::MAX_CHUNK_BYTES,
            io_timeout_ms: ms(defaults::IO_TIMEOUT),
            handshake_timeout_ms: ms(defaults::HANDSHAKE_TIMEOUT),
            inactivity_timeout_ms: ms(defaults::INACTIVITY_TIMEOUT),
            overall_deadline_ms: ms(defaults::OVERALL_DEADLINE),
            stabilize_ms: ms(defaults::STABILIZE_DELAY),
            event_pump_delay_ms: ms(defaults::EVENT_PUMP_DELAY),
            partial_read64: false,
            partial_read32: false,
            partial_write: false,
            prefer_prop_list_enumeration: false,
            disable_event_pump: false,
            reset_on_open: false,
            disable_write_resume: false,
            enumeration: EnumerationStrategy::ObjectInfo,
            read: ReadStrategy::Whole,
            write: WriteStrategy::Whole,
            hooks: Vec::new(),
        }
    }
}

impl EffectiveTuning {
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout_ms)
    }

    pub fn overall_deadline(&self) -> Duration {
        Duration::from_millis(self.overall_deadline_ms)
    }

    pub fn stabilize(&self) -> Duration {
        Duration::from_millis(self.stabilize_ms)
    }

    pub fn event_pump_delay(&self) -> Duration {
        Duration::from_millis(self.event_pump_delay_ms)
    }

    pub fn hooks_for(&self, phase: HookPhase) -> impl Iterator<Item = &PhaseHook> {
        self.hooks.iter().filter(move |h| h.phase == phase)
    }

    pub fn busy_backoff(&self) -> Option<BusyBackoff> {
        self.hooks_for(HookPhase::OnDeviceBusy)
            .find_map(|h| h.busy_backoff)
    }

    /// Recompute the strategy selectors after the flag layers settled.
    fn select_strategies(&mut self) {
        self.enumeration = if self.prefer_prop_list_enumeration {
            EnumerationStrategy::PropList
        } else {
            EnumerationStrategy::ObjectInfo
        };
        self.read = if self.partial_read64 {
            ReadStrategy::Partial64
        } else if self.partial_read32 {
            ReadStrategy::Partial32
        } else {
            ReadStrategy::Whole
        };
        self.write = if self.partial_write {
            WriteStrategy::Partial
        } else {
            WriteStrategy::Whole
        };
    }
}

/// Capabilities observed during the probe, layer 2 of the merge.
#[derive(Debug, Clone, Default)]
pub struct ProbedCapabilities {
    pub speed: Option<UsbSpeed>,
    pub operations_supported: Vec<u16>,
    /// Set when the handshake took long enough to classify the device
    /// as slow
    pub slow_device: bool,
}

impl ProbedCapabilities {
    pub fn from_device_info(info: &MtpDeviceInfo, speed: Option<UsbSpeed>) -> ProbedCapabilities {
        ProbedCapabilities {
            speed,
            operations_supported: info.operations_supported.clone(),
            slow_device: false,
        }
    }

    fn supports(&self, code: u16) -> bool {
        self.operations_supported.contains(&code)
    }
}

/// Long-lived statistical profile for one device fingerprint, layer 3.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LearnedProfile {
    pub samples: u32,
    pub success_rate: f64,
    pub optimal_chunk_bytes: Option<usize>,
    pub p95_throughput_mbps: Option<f64>,
    pub typical_handshake_ms: Option<u64>,
}

impl LearnedProfile {
    /// Profiles apply only once enough clean runs back them.
    const MIN_SAMPLES: u32 = 5;

    fn applies(&self) -> bool {
        self.samples >= Self::MIN_SAMPLES && self.success_rate > 0.8
    }
}

/// User-set overrides, layer 5. Every field beats every other layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UserOverrides {
    pub max_chunk_bytes: Option<usize>,
    pub io_timeout_ms: Option<u64>,
    pub handshake_timeout_ms: Option<u64>,
    pub inactivity_timeout_ms: Option<u64>,
    pub overall_deadline_ms: Option<u64>,
    pub disable_event_pump: Option<bool>,
    pub disable_write_resume: Option<bool>,
}

impl UserOverrides {
    /// Pick overrides out of the process environment.
    pub fn from_env() -> UserOverrides {
        fn num<T: std::str::FromStr>(key: &str) -> Option<T> {
            std::env::var(key).ok().and_then(|v| v.parse().ok())
        }
        UserOverrides {
            max_chunk_bytes: num("MTP_MAX_CHUNK"),
            io_timeout_ms: num("MTP_IO_TIMEOUT_MS"),
            handshake_timeout_ms: num("MTP_HANDSHAKE_TIMEOUT_MS"),
            inactivity_timeout_ms: num("MTP_INACTIVITY_TIMEOUT_MS"),
            overall_deadline_ms: num("MTP_OVERALL_DEADLINE_MS"),
            disable_event_pump: num::<u8>("MTP_DISABLE_EVENTS").map(|v| v != 0),
            disable_write_resume: num::<u8>("MTP_DISABLE_WRITE_RESUME").map(|v| v != 0),
        }
    }
}

/// Which layers participate in the merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TuningMode {
    #[default]
    Normal,
    /// Bypass probed/learned/static layers and force conservative values
    Safe,
    /// Bypass learned and static layers
    Strict,
}

/// ### Build Effective Tuning
///
/// Apply the five layers in order. Deterministic for fixed inputs.
///
pub fn build_effective_tuning(
    mode: TuningMode,
    probed: Option<&ProbedCapabilities>,
    learned: Option<&LearnedProfile>,
    quirk: Option<&QuirkRule>,
    overrides: &UserOverrides,
) -> EffectiveTuning {
    // LAYER 1: BASELINE
    // ==========
    let mut t = EffectiveTuning::default();

    if mode == TuningMode::Safe {
        t.max_chunk_bytes = defaults::SAFE_MAX_CHUNK_BYTES;
        t.io_timeout_ms = ms(defaults::SAFE_IO_TIMEOUT);
        t.overall_deadline_ms = ms(defaults::SAFE_OVERALL_DEADLINE);
    }

    // LAYER 2: PROBED CAPABILITIES
    // ==========
    if mode != TuningMode::Safe {
        if let Some(probed) = probed {
            match probed.speed {
                Some(UsbSpeed::Low) | Some(UsbSpeed::Full) => {
                    t.max_chunk_bytes = t.max_chunk_bytes.min(64 * 1024);
                }
                Some(UsbSpeed::Super) | Some(UsbSpeed::SuperPlus) => {
                    t.max_chunk_bytes = t.max_chunk_bytes.max(2 * 1024 * 1024);
                }
                _ => {}
            }
            t.partial_read64 = probed.supports(op::GET_PARTIAL_OBJECT_64);
            t.partial_read32 = probed.supports(op::GET_PARTIAL_OBJECT);
            t.partial_write = probed.supports(op::SEND_PARTIAL_OBJECT);
            t.prefer_prop_list_enumeration = probed.supports(op::GET_OBJECT_PROP_LIST);
            if probed.slow_device {
                t.io_timeout_ms *= 2;
                t.handshake_timeout_ms *= 2;
            }
        }
    }

    // LAYER 3: LEARNED PROFILE
    // ==========
    if mode == TuningMode::Normal {
        if let Some(learned) = learned.filter(|l| l.applies()) {
            if let Some(chunk) = learned.optimal_chunk_bytes {
                t.max_chunk_bytes = chunk;
            }
            if let Some(typical) = learned.typical_handshake_ms {
                t.handshake_timeout_ms = t.handshake_timeout_ms.max(typical * 3);
            }
        }
    }

    // LAYER 4: STATIC QUIRK
    // ==========
    if mode == TuningMode::Normal {
        if let Some(rule) = quirk {
            debug!("applying quirk rule {}", rule.id);
            let q = &rule.tuning;
            if let Some(v) = q.max_chunk_bytes {
                t.max_chunk_bytes = v;
            }
            if let Some(v) = q.io_timeout_ms {
                t.io_timeout_ms = v;
            }
            if let Some(v) = q.handshake_timeout_ms {
                t.handshake_timeout_ms = v;
            }
            if let Some(v) = q.inactivity_timeout_ms {
                t.inactivity_timeout_ms = v;
            }
            if let Some(v) = q.overall_deadline_ms {
                t.overall_deadline_ms = v;
            }
            if let Some(v) = q.stabilize_ms {
                t.stabilize_ms = v;
            }
            if let Some(v) = q.event_pump_delay_ms {
                t.event_pump_delay_ms = v;
            }
            let ops = &rule.ops;
            if let Some(v) = ops.supports_get_partial_object64 {
                t.partial_read64 = v;
            }
            if let Some(v) = ops.supports_send_partial_object {
                t.partial_write = v;
            }
            if let Some(v) = ops.prefer_get_object_prop_list {
                t.prefer_prop_list_enumeration = v;
            }
            if let Some(v) = ops.disable_write_resume {
                t.disable_write_resume = v;
            }
            if let Some(v) = ops.disable_event_pump {
                t.disable_event_pump = v;
            }
            if let Some(v) = ops.reset_on_open {
                t.reset_on_open = v;
            }
            t.hooks.extend(rule.hooks.iter().cloned());
        }
    }

    // LAYER 5: USER OVERRIDES
    // ==========
    if let Some(v) = overrides.max_chunk_bytes {
        t.max_chunk_bytes = v;
    }
    if let Some(v) = overrides.io_timeout_ms {
        t.io_timeout_ms = v;
    }
    if let Some(v) = overrides.handshake_timeout_ms {
        t.handshake_timeout_ms = v;
    }
    if let Some(v) = overrides.inactivity_timeout_ms {
        t.inactivity_timeout_ms = v;
    }
    if let Some(v) = overrides.overall_deadline_ms {
        t.overall_deadline_ms = v;
    }
    if let Some(v) = overrides.disable_event_pump {
        t.disable_event_pump = v;
    }
    if let Some(v) = overrides.disable_write_resume {
        t.disable_write_resume = v;
    }

    t.max_chunk_bytes = t.max_chunk_bytes.max(defaults::MIN_CHUNK_BYTES.min(64 * 1024));
    t.select_strategies();
    t
}

// ==========
// LEARNED STORE
// ==========

/// ### LearnedStore
///
/// JSON-file store of learned profiles keyed by fingerprint. Updated
/// only on clean success; the profile applies once `MIN_SAMPLES`
/// clean runs back it.
///
pub struct LearnedStore {
    path: PathBuf,
    profiles: HashMap<String, LearnedProfile>,
}

impl LearnedStore {
    pub fn open(path: PathBuf) -> LearnedStore {
        let profiles = fs::read(&path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default();
        LearnedStore { path, profiles }
    }

    pub fn get(&self, fingerprint: &str) -> Option<&LearnedProfile> {
        self.profiles.get(fingerprint)
    }

    /// Record one clean transfer. The optimal chunk converges toward
    /// the chunk size that survived the run.
    pub fn record_success(
        &mut self,
        fingerprint: &str,
        chunk_bytes: usize,
        throughput_mbps: f64,
        handshake: Duration,
    ) {
        let p = self.profiles.entry(fingerprint.to_string()).or_default();
        let n = p.samples as f64;
        p.success_rate = (p.success_rate * n + 1.0) / (n + 1.0);
        p.samples += 1;
        p.optimal_chunk_bytes = Some(match p.optimal_chunk_bytes {
            Some(prev) => ((prev as f64 * 0.7) + (chunk_bytes as f64 * 0.3)) as usize,
            None => chunk_bytes,
        });
        p.p95_throughput_mbps = Some(match p.p95_throughput_mbps {
            Some(prev) => prev.max(throughput_mbps),
            None => throughput_mbps,
        });
        p.typical_handshake_ms = Some(match p.typical_handshake_ms {
            Some(prev) => ((prev as f64 * 0.7) + (ms(handshake) as f64 * 0.3)) as u64,
            None => ms(handshake),
        });
        self.persist();
    }

    pub fn record_failure(&mut self, fingerprint: &str) {
        let p = self.profiles.entry(fingerprint.to_string()).or_default();
        let n = p.samples as f64;
        p.success_rate = (p.success_rate * n) / (n + 1.0);
        p.samples += 1;
        self.persist();
    }

    fn persist(&self) {
        let write = || -> std::io::Result<()> {
            if let Some(dir) = self.path.parent() {
                fs::create_dir_all(dir)?;
            }
            let tmp = self.path.with_extension("tmp");
            let mut f = fs::File::create(&tmp)?;
            f.write_all(&serde_json::to_vec_pretty(&self.profiles).unwrap_or_default())?;
            f.sync_all()?;
            fs::rename(&tmp, &self.path)?;
            Ok(())
        };
        if let Err(e) = write() {
            warn!("failed to persist learned profiles: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probed_with(ops: &[u16], speed: UsbSpeed) -> ProbedCapabilities {
        ProbedCapabilities {
            speed: Some(speed),
            operations_supported: ops.to_vec(),
            slow_device: false,
        }
    }

    #[test]
    fn baseline_only() {
        let t = build_effective_tuning(
            TuningMode::Normal,
            None,
            None,
            None,
            &UserOverrides::default(),
        );
        assert_eq!(t.max_chunk_bytes, defaults::MAX_CHUNK_BYTES);
        assert_eq!(t.read, ReadStrategy::Whole);
        assert_eq!(t.enumeration, EnumerationStrategy::ObjectInfo);
    }

    #[test]
    fn probed_layer_sets_partial_flags_and_speed_floor() {
        let probed = probed_with(
            &[op::GET_PARTIAL_OBJECT_64, op::GET_OBJECT_PROP_LIST],
            UsbSpeed::Full,
        );
        let t = build_effective_tuning(
            TuningMode::Normal,
            Some(&probed),
            None,
            None,
            &UserOverrides::default(),
        );
        assert!(t.partial_read64);
        assert_eq!(t.read, ReadStrategy::Partial64);
        assert_eq!(t.enumeration, EnumerationStrategy::PropList);
        assert_eq!(t.max_chunk_bytes, 64 * 1024);
    }

    #[test]
    fn learned_layer_needs_confidence() {
        let thin = LearnedProfile {
            samples: 2,
            success_rate: 1.0,
            optimal_chunk_bytes: Some(512 * 1024),
            ..Default::default()
        };
        let t = build_effective_tuning(
            TuningMode::Normal,
            None,
            Some(&thin),
            None,
            &UserOverrides::default(),
        );
        assert_eq!(t.max_chunk_bytes, defaults::MAX_CHUNK_BYTES);

        let solid = LearnedProfile {
            samples: 10,
            success_rate: 0.95,
            optimal_chunk_bytes: Some(512 * 1024),
            typical_handshake_ms: Some(4_000),
            ..Default::default()
        };
        let t = build_effective_tuning(
            TuningMode::Normal,
            None,
            Some(&solid),
            None,
            &UserOverrides::default(),
        );
        assert_eq!(t.max_chunk_bytes, 512 * 1024);
        // typical handshake ×3 beats the 5 s default
        assert_eq!(t.handshake_timeout_ms, 12_000);
    }

    #[test]
    fn safe_mode_bypasses_middle_layers() {
        let probed = probed_with(&[op::GET_PARTIAL_OBJECT_64], UsbSpeed::Super);
        let solid = LearnedProfile {
            samples: 10,
            success_rate: 1.0,
            optimal_chunk_bytes: Some(8 * 1024 * 1024),
            ..Default::default()
        };
        let t = build_effective_tuning(
            TuningMode::Safe,
            Some(&probed),
            Some(&solid),
            None,
            &UserOverrides::default(),
        );
        assert_eq!(t.max_chunk_bytes, defaults::SAFE_MAX_CHUNK_BYTES);
        assert_eq!(t.io_timeout_ms, 30_000);
        assert_eq!(t.overall_deadline_ms, 300_000);
        assert!(!t.partial_read64);
    }

    #[test]
    fn user_overrides_beat_everything() {
        let overrides = UserOverrides {
            max_chunk_bytes: Some(300 * 1024),
            io_timeout_ms: Some(1_234),
            ..Default::default()
        };
        let t = build_effective_tuning(TuningMode::Safe, None, None, None, &overrides);
        assert_eq!(t.max_chunk_bytes, 300 * 1024);
        assert_eq!(t.io_timeout_ms, 1_234);
    }

    #[test]
    fn merge_is_deterministic() {
        let probed = probed_with(&[op::GET_PARTIAL_OBJECT_64], UsbSpeed::High);
        let learned = LearnedProfile {
            samples: 9,
            success_rate: 0.9,
            optimal_chunk_bytes: Some(768 * 1024),
            typical_handshake_ms: Some(900),
            ..Default::default()
        };
        let overrides = UserOverrides::default();
        let a = build_effective_tuning(
            TuningMode::Normal,
            Some(&probed),
            Some(&learned),
            None,
            &overrides,
        );
        let b = build_effective_tuning(
            TuningMode::Normal,
            Some(&probed),
            Some(&learned),
            None,
            &overrides,
        );
        assert_eq!(
            serde_json::to_vec(&a).unwrap(),
            serde_json::to_vec(&b).unwrap()
        );
    }

    #[test]
    fn busy_backoff_grows_and_floors() {
        let b = BusyBackoff {
            base_ms: 50,
            jitter: 0.0,
            retries: 5,
        };
        assert_eq!(b.delay(0), Duration::from_millis(100)); // floor
        assert_eq!(b.delay(2), Duration::from_millis(200));
        // exponent caps at 10
        assert_eq!(b.delay(20), b.delay(10));
    }
}
