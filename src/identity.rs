//! ## Stable Device Identity
//!
//! Maps whatever signals an attach yields onto a durable, domain-scoped
//! identity. The identity key is built from the strongest available
//! signal and upgraded in place when a stronger one appears later; the
//! domain UUID never changes once minted.
//!

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::types::IfaceTriple;

/// Signals available when a device attaches.
#[derive(Debug, Clone, Default)]
pub struct IdentitySignals {
    pub mtp_serial: Option<String>,
    pub usb_serial: Option<String>,
    pub vendor_id: u16,
    pub product_id: u16,
    pub model: Option<String>,
    pub manufacturer: Option<String>,
    pub iface: Option<IfaceTriple>,
}

fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

impl IdentitySignals {
    /// Candidate keys, strongest first.
    fn candidate_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        if let Some(serial) = self.mtp_serial.as_deref().filter(|s| !s.is_empty()) {
            keys.push(format!("mtp:{serial}"));
        }
        if let Some(serial) = self.usb_serial.as_deref().filter(|s| !s.is_empty()) {
            keys.push(format!("usb:{serial}"));
        }
        if let Some(model) = self.model.as_deref().filter(|s| !s.is_empty()) {
            keys.push(format!(
                "vidpid-model:{:04x}:{:04x}:{}",
                self.vendor_id,
                self.product_id,
                short_hash(model)
            ));
        }
        if let Some(iface) = self.iface {
            keys.push(format!(
                "type:{}",
                short_hash(&format!(
                    "{:02x}-{:02x}-{:02x}",
                    iface.class, iface.subclass, iface.protocol
                ))
            ));
        }
        keys
    }
}

fn merge_signals(identity: &mut StableDeviceIdentity, signals: &IdentitySignals) {
    if signals.mtp_serial.is_some() {
        identity.mtp_serial = signals.mtp_serial.clone();
    }
    if signals.usb_serial.is_some() {
        identity.usb_serial = signals.usb_serial.clone();
    }
    if signals.manufacturer.is_some() {
        identity.manufacturer = signals.manufacturer.clone();
    }
    if let Some(model) = &signals.model {
        identity.model = Some(model.clone());
        identity.display_name = model.clone();
    }
    identity.vendor_id = Some(signals.vendor_id);
    identity.product_id = Some(signals.product_id);
}

fn key_rank(key: &str) -> u8 {
    if key.starts_with("mtp:") {
        3
    } else if key.starts_with("usb:") {
        2
    } else if key.starts_with("vidpid-model:") {
        1
    } else {
        0
    }
}

/// ### StableDeviceIdentity
///
/// One persisted identity row.
///
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StableDeviceIdentity {
    pub domain_id: Uuid,
    pub identity_key: String,
    pub display_name: String,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub usb_serial: Option<String>,
    pub mtp_serial: Option<String>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// ### IdentityStore
///
/// Process-wide single-writer store over one JSON file; readers get
/// consistent snapshots.
///
pub struct IdentityStore {
    path: PathBuf,
    identities: Mutex<HashMap<Uuid, StableDeviceIdentity>>,
}

impl IdentityStore {
    pub fn open(path: &Path) -> IdentityStore {
        let identities: HashMap<Uuid, StableDeviceIdentity> = fs::read(path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<Vec<StableDeviceIdentity>>(&bytes).ok())
            .map(|list| list.into_iter().map(|i| (i.domain_id, i)).collect())
            .unwrap_or_default();
        IdentityStore {
            path: path.to_path_buf(),
            identities: Mutex::new(identities),
        }
    }

    /// ### Resolve Identity
    ///
    /// Find the identity these signals belong to, upgrading its key if
    /// a stronger signal appeared, or mint a new one.
    ///
    pub fn resolve_identity(&self, signals: &IdentitySignals) -> StableDeviceIdentity {
        let keys = signals.candidate_keys();
        let mut identities = self.identities.lock().unwrap();

        let existing = identities
            .values()
            .find(|identity| {
                keys.iter().any(|k| *k == identity.identity_key)
                    || (signals.mtp_serial.is_some()
                        && identity.mtp_serial == signals.mtp_serial)
                    || (signals.usb_serial.is_some()
                        && identity.usb_serial == signals.usb_serial)
            })
            .map(|i| i.domain_id);

        let now = Utc::now();
        let identity = match existing {
            Some(domain_id) => {
                let identity = identities.get_mut(&domain_id).expect("looked up above");
                identity.last_seen_at = now;
                if let Some(strongest) = keys.first() {
                    if key_rank(strongest) > key_rank(&identity.identity_key) {
                        debug!(
                            "upgrading identity key {} -> {strongest}",
                            identity.identity_key
                        );
                        identity.identity_key = strongest.clone();
                    }
                }
                merge_signals(identity, signals);
                identity.clone()
            }
            None => {
                let identity = StableDeviceIdentity {
                    domain_id: Uuid::new_v4(),
                    identity_key: keys
                        .first()
                        .cloned()
                        .unwrap_or_else(|| "type:unknown".to_string()),
                    display_name: signals
                        .model
                        .clone()
                        .or_else(|| signals.manufacturer.clone())
                        .unwrap_or_else(|| "MTP device".to_string()),
                    vendor_id: Some(signals.vendor_id),
                    product_id: Some(signals.product_id),
                    usb_serial: signals.usb_serial.clone(),
                    mtp_serial: signals.mtp_serial.clone(),
                    manufacturer: signals.manufacturer.clone(),
                    model: signals.model.clone(),
                    created_at: now,
                    last_seen_at: now,
                };
                identities.insert(identity.domain_id, identity.clone());
                identity
            }
        };
        self.persist(&identities);
        identity
    }

    /// Attach the MTP serial learned during the handshake; upgrades
    /// the identity key when it beats the current one.
    pub fn update_mtp_serial(&self, domain_id: Uuid, serial: &str) {
        let mut identities = self.identities.lock().unwrap();
        if let Some(identity) = identities.get_mut(&domain_id) {
            identity.mtp_serial = Some(serial.to_string());
            let key = format!("mtp:{serial}");
            if key_rank(&key) > key_rank(&identity.identity_key) {
                identity.identity_key = key;
            }
            identity.last_seen_at = Utc::now();
        }
        self.persist(&identities);
    }

    pub fn all_identities(&self) -> Vec<StableDeviceIdentity> {
        let mut list: Vec<StableDeviceIdentity> =
            self.identities.lock().unwrap().values().cloned().collect();
        list.sort_by_key(|i| i.created_at);
        list
    }

    pub fn remove_identity(&self, domain_id: Uuid) {
        let mut identities = self.identities.lock().unwrap();
        identities.remove(&domain_id);
        self.persist(&identities);
    }

    fn persist(&self, identities: &HashMap<Uuid, StableDeviceIdentity>) {
        let write = || -> std::io::Result<()> {
            if let Some(dir) = self.path.parent() {
                fs::create_dir_all(dir)?;
            }
            let mut list: Vec<&StableDeviceIdentity> = identities.values().collect();
            list.sort_by_key(|i| i.created_at);
            let tmp = self.path.with_extension("tmp");
            let mut f = fs::File::create(&tmp)?;
            f.write_all(&serde_json::to_vec_pretty(&list).unwrap_or_default())?;
            f.sync_all()?;
            fs::rename(&tmp, &self.path)
        };
        if let Err(e) = write() {
            log::warn!("failed to persist identity store: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store_in(dir: &Path) -> IdentityStore {
        IdentityStore::open(&dir.join("identities.json"))
    }

    fn usb_only_signals() -> IdentitySignals {
        IdentitySignals {
            usb_serial: Some("USB123".into()),
            vendor_id: 0x18d1,
            product_id: 0x4ee1,
            model: Some("Pixel 7".into()),
            manufacturer: Some("Google".into()),
            ..Default::default()
        }
    }

    #[test]
    fn identity_is_stable_across_resolves() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let a = store.resolve_identity(&usb_only_signals());
        let b = store.resolve_identity(&usb_only_signals());
        assert_eq!(a.domain_id, b.domain_id);
        assert_eq!(a.identity_key, "usb:USB123");
        assert_eq!(store.all_identities().len(), 1);
    }

    #[test]
    fn stronger_signal_upgrades_key_and_keeps_uuid() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let first = store.resolve_identity(&usb_only_signals());

        let mut with_mtp = usb_only_signals();
        with_mtp.mtp_serial = Some("MTPSER".into());
        let second = store.resolve_identity(&with_mtp);
        assert_eq!(first.domain_id, second.domain_id);
        assert_eq!(second.identity_key, "mtp:MTPSER");
    }

    #[test]
    fn update_mtp_serial_upgrades_in_place() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let identity = store.resolve_identity(&usb_only_signals());
        store.update_mtp_serial(identity.domain_id, "LATESER");
        let refreshed = store
            .all_identities()
            .into_iter()
            .find(|i| i.domain_id == identity.domain_id)
            .unwrap();
        assert_eq!(refreshed.identity_key, "mtp:LATESER");
        assert_eq!(refreshed.mtp_serial.as_deref(), Some("LATESER"));
    }

    #[test]
    fn serial_less_devices_fall_back_to_model_key() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let signals = IdentitySignals {
            vendor_id: 0x04a9,
            product_id: 0x3218,
            model: Some("EOS 5D".into()),
            ..Default::default()
        };
        let identity = store.resolve_identity(&signals);
        assert!(identity.identity_key.starts_with("vidpid-model:04a9:3218:"));
    }

    #[test]
    fn store_survives_reopen_and_removal() {
        let dir = tempdir().unwrap();
        let domain_id;
        {
            let store = store_in(dir.path());
            domain_id = store.resolve_identity(&usb_only_signals()).domain_id;
        }
        let store = store_in(dir.path());
        assert_eq!(store.all_identities().len(), 1);
        store.remove_identity(domain_id);
        assert!(store.all_identities().is_empty());
        let store = store_in(dir.path());
        assert!(store.all_identities().is_empty());
    }
}
