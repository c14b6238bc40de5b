//! ## Quirk Database
//!
//! Static per-device rules loaded from JSON, matched against a device
//! fingerprint. Unknown keys are ignored so newer databases keep
//! loading on older builds.
//!

use std::fs;
use std::path::Path;

use log::{debug, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::tuning::PhaseHook;
use crate::types::{DeviceFingerprint, MtpDeviceInfo};

/// ### QuirkDatabase
///
/// Root of the quirk file: `{ schemaVersion, entries }`.
///
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuirkDatabase {
    #[serde(default)]
    pub schema_version: String,
    #[serde(default)]
    pub entries: Vec<QuirkRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Experimental,
    Community,
    Verified,
}

impl Default for Confidence {
    fn default() -> Confidence {
        Confidence::Experimental
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    Proposed,
    Verified,
    Promoted,
}

impl Default for RuleStatus {
    fn default() -> RuleStatus {
        RuleStatus::Proposed
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IfaceCriteria {
    pub class: Option<u8>,
    pub subclass: Option<u8>,
    pub protocol: Option<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointCriteria {
    pub input: Option<u8>,
    pub output: Option<u8>,
    pub event: Option<u8>,
}

/// Match block of one rule. Every present criterion must match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchCriteria {
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub bcd_device: Option<u16>,
    #[serde(default)]
    pub iface: Option<IfaceCriteria>,
    #[serde(default)]
    pub endpoints: Option<EndpointCriteria>,
    pub device_info_regex: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TuningOverrides {
    pub max_chunk_bytes: Option<usize>,
    pub io_timeout_ms: Option<u64>,
    pub handshake_timeout_ms: Option<u64>,
    pub inactivity_timeout_ms: Option<u64>,
    pub overall_deadline_ms: Option<u64>,
    pub stabilize_ms: Option<u64>,
    pub event_pump_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpsOverrides {
    pub supports_get_partial_object64: Option<bool>,
    pub supports_send_partial_object: Option<bool>,
    pub prefer_get_object_prop_list: Option<bool>,
    pub disable_write_resume: Option<bool>,
    pub disable_event_pump: Option<bool>,
    pub reset_on_open: Option<bool>,
    /// Property-list strings whose count field counts bytes
    pub string_count_is_bytes: Option<bool>,
    /// Property-list strings that omit the trailing NUL
    pub string_missing_nul: Option<bool>,
}

/// ### QuirkRule
///
/// One entry of the database.
///
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuirkRule {
    pub id: String,
    #[serde(rename = "match", default)]
    pub criteria: MatchCriteria,
    #[serde(default)]
    pub tuning: TuningOverrides,
    #[serde(default)]
    pub ops: OpsOverrides,
    #[serde(default)]
    pub hooks: Vec<PhaseHook>,
    #[serde(default)]
    pub confidence: Confidence,
    #[serde(default)]
    pub status: RuleStatus,
    /// Pins the probe ladder to one interface number
    #[serde(default)]
    pub pin_interface: Option<u8>,
}

impl QuirkRule {
    /// Whether every present criterion matches, and how specific the
    /// rule is when it does.
    fn match_score(
        &self,
        fp: &DeviceFingerprint,
        info: Option<&MtpDeviceInfo>,
    ) -> Option<u32> {
        let c = &self.criteria;
        let mut score = 0u32;

        if let Some(vid) = c.vid {
            if vid != fp.vendor_id {
                return None;
            }
            score += 1;
        }
        if let Some(pid) = c.pid {
            if pid != fp.product_id {
                return None;
            }
            score += 2;
        }
        if let Some(bcd) = c.bcd_device {
            if Some(bcd) != fp.bcd_device {
                return None;
            }
            score += 2;
        }
        if let Some(iface) = &c.iface {
            for (want, have) in [
                (iface.class, fp.iface.class),
                (iface.subclass, fp.iface.subclass),
                (iface.protocol, fp.iface.protocol),
            ] {
                if let Some(want) = want {
                    if want != have {
                        return None;
                    }
                    score += 1;
                }
            }
        }
        if let Some(ep) = &c.endpoints {
            for (want, have) in [
                (ep.input, Some(fp.endpoints.input)),
                (ep.output, Some(fp.endpoints.output)),
                (ep.event, fp.endpoints.event),
            ] {
                if let Some(want) = want {
                    if Some(want) != have {
                        return None;
                    }
                    score += 1;
                }
            }
        }
        if let Some(pattern) = &c.device_info_regex {
            let haystack = match info {
                Some(info) => format!(
                    "{} {} {}",
                    info.manufacturer, info.model, info.device_version
                ),
                None => return None,
            };
            match Regex::new(pattern) {
                Ok(re) if re.is_match(&haystack) => score += 3,
                Ok(_) => return None,
                Err(e) => {
                    warn!("quirk rule {} has a bad regex: {e}", self.id);
                    return None;
                }
            }
        }
        Some(score)
    }
}

impl QuirkDatabase {
    /// ### Load
    ///
    /// Parse the database from a JSON file. A missing file is an empty
    /// database; a corrupt one is an error.
    ///
    pub fn load(path: &Path) -> anyhow::Result<QuirkDatabase> {
        if !path.exists() {
            return Ok(QuirkDatabase::default());
        }
        let bytes = fs::read(path)?;
        let db: QuirkDatabase = serde_json::from_slice(&bytes)?;
        debug!(
            "loaded quirk database v{} with {} entries",
            db.schema_version,
            db.entries.len()
        );
        Ok(db)
    }

    pub fn from_json(json: &str) -> anyhow::Result<QuirkDatabase> {
        Ok(serde_json::from_str(json)?)
    }

    /// ### Best Match
    ///
    /// The most specific matching rule; ties break on the lexically
    /// smaller rule id.
    ///
    pub fn best_match(
        &self,
        fp: &DeviceFingerprint,
        info: Option<&MtpDeviceInfo>,
    ) -> Option<&QuirkRule> {
        self.entries
            .iter()
            .filter_map(|rule| rule.match_score(fp, info).map(|score| (score, rule)))
            // max_by picks the last of equal elements; order the key so
            // the lexically smaller id wins ties
            .max_by(|(sa, ra), (sb, rb)| sa.cmp(sb).then(rb.id.cmp(&ra.id)))
            .map(|(_, rule)| rule)
    }

    /// Interface pinned for this device, if any matching rule pins one.
    pub fn pinned_interface(
        &self,
        fp: &DeviceFingerprint,
        info: Option<&MtpDeviceInfo>,
    ) -> Option<u8> {
        self.best_match(fp, info).and_then(|r| r.pin_interface)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EndpointTriple, IfaceTriple};

    fn fingerprint() -> DeviceFingerprint {
        DeviceFingerprint {
            vendor_id: 0x18d1,
            product_id: 0x4ee1,
            bcd_device: Some(0x0404),
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
        }
    }

    const DB: &str = r#"{
        "schemaVersion": "1",
        "entries": [
            {
                "id": "vendor-wide",
                "match": { "vid": 6353 },
                "tuning": { "maxChunkBytes": 524288 }
            },
            {
                "id": "exact-model",
                "match": { "vid": 6353, "pid": 20193 },
                "tuning": { "ioTimeoutMs": 20000 },
                "ops": { "supportsSendPartialObject": true },
                "confidence": "verified",
                "status": "promoted"
            },
            {
                "id": "other-device",
                "match": { "vid": 1 },
                "futureKey": { "ignored": true }
            }
        ]
    }"#;

    #[test]
    fn unknown_keys_are_ignored() {
        let db = QuirkDatabase::from_json(DB).unwrap();
        assert_eq!(db.entries.len(), 3);
    }

    #[test]
    fn most_specific_rule_wins() {
        let db = QuirkDatabase::from_json(DB).unwrap();
        let rule = db.best_match(&fingerprint(), None).unwrap();
        assert_eq!(rule.id, "exact-model");
        assert_eq!(rule.ops.supports_send_partial_object, Some(true));
    }

    #[test]
    fn ties_break_on_lexical_id() {
        let json = r#"{
            "schemaVersion": "1",
            "entries": [
                { "id": "bbb", "match": { "vid": 6353 } },
                { "id": "aaa", "match": { "vid": 6353 } }
            ]
        }"#;
        let db = QuirkDatabase::from_json(json).unwrap();
        assert_eq!(db.best_match(&fingerprint(), None).unwrap().id, "aaa");
    }

    #[test]
    fn absent_criteria_match_anything_present_must_match() {
        let db = QuirkDatabase::from_json(DB).unwrap();
        let mut fp = fingerprint();
        fp.product_id = 0x9999;
        // exact-model no longer matches; vendor-wide still does
        assert_eq!(db.best_match(&fp, None).unwrap().id, "vendor-wide");
        fp.vendor_id = 0x0001;
        assert_eq!(db.best_match(&fp, None).unwrap().id, "other-device");
    }

    #[test]
    fn regex_criterion_requires_device_info() {
        let json = r#"{
            "schemaVersion": "1",
            "entries": [
                { "id": "pixelish", "match": { "deviceInfoRegex": "Pixel [0-9]+" } }
            ]
        }"#;
        let db = QuirkDatabase::from_json(json).unwrap();
        assert!(db.best_match(&fingerprint(), None).is_none());
        let info = MtpDeviceInfo {
            manufacturer: "Google".into(),
            model: "Pixel 7".into(),
            device_version: "14".into(),
            ..Default::default()
        };
        assert_eq!(
            db.best_match(&fingerprint(), Some(&info)).unwrap().id,
            "pixelish"
        );
    }
}
