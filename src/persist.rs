//! Persisted state: the display-registry snapshot for fast restart and
//! the capabilities-string cache.
//!
//! The tuned-sleep multiplier store lives next to the tuning logic in
//! [`crate::sleep`].

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::edid::EdidId;

/// Schema version of [`RegistrySnapshot`].
pub const SNAPSHOT_VERSION: u32 = 1;

/// JSON snapshot of the display registry.
#[derive(Debug, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub version: u32,
    pub all_displays: Vec<DisplaySnapshot>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IoPathSnapshot {
    pub io: String,
    pub busno: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DisplaySnapshot {
    pub io_path: IoPathSnapshot,
    pub dispno: i32,
    pub flags: u16,
    /// The 128-byte EDID block, hex encoded.
    pub edid: String,
    pub mfg_id: String,
    pub model_name: String,
    pub product_code: u16,
    pub serial_ascii: String,
    pub mccs_version: Option<(u8, u8)>,
    pub capabilities: Option<String>,
    pub drm_connector: Option<String>,
    /// For phantoms, the bus of the display this one shadows.
    pub actual_display_busno: Option<u32>,
}

pub fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

pub fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

/// Persistence boundary for raw capabilities strings, keyed by monitor
/// identity so a restart can skip the slow multi-part read.
pub trait CapabilityStore: Send + Sync {
    fn load(&self, id: &EdidId) -> io::Result<Option<String>>;
    fn save(&self, id: &EdidId, capabilities: &str) -> io::Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CapabilityFile {
    version: u32,
    capabilities: HashMap<String, String>,
}

/// [`CapabilityStore`] backed by a single JSON file.
#[derive(Debug)]
pub struct JsonCapabilityStore {
    path: PathBuf,
}

impl JsonCapabilityStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonCapabilityStore { path: path.into() }
    }

    fn read_file(&self) -> io::Result<CapabilityFile> {
        match std::fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(CapabilityFile {
                version: 1,
                capabilities: HashMap::new(),
            }),
            Err(e) => Err(e),
        }
    }
}

impl CapabilityStore for JsonCapabilityStore {
    fn load(&self, id: &EdidId) -> io::Result<Option<String>> {
        Ok(self.read_file()?.capabilities.get(&id.to_string()).cloned())
    }

    fn save(&self, id: &EdidId, capabilities: &str) -> io::Result<()> {
        let mut file = self.read_file()?;
        file.version = 1;
        file.capabilities.insert(id.to_string(), capabilities.to_owned());
        let bytes = serde_json::to_vec_pretty(&file)?;
        std::fs::write(&self.path, bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let bytes = [0x00u8, 0xff, 0x10, 0xac, 0x7f];
        let s = hex_encode(&bytes);
        assert_eq!(s, "00ff10ac7f");
        assert_eq!(hex_decode(&s).unwrap(), bytes);
        assert_eq!(hex_decode("0"), None);
        assert_eq!(hex_decode("zz"), None);
    }

    #[test]
    fn capability_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonCapabilityStore::new(dir.path().join("caps.json"));
        let id = EdidId {
            mfg_id: "DEL".into(),
            model_name: "U2720Q".into(),
            product_code: 0xA027,
            serial_ascii: "ABC123".into(),
            serial_binary: 1,
        };
        assert_eq!(store.load(&id).unwrap(), None);
        store.save(&id, "(prot(monitor))").unwrap();
        assert_eq!(store.load(&id).unwrap().as_deref(), Some("(prot(monitor))"));
    }

    #[test]
    fn snapshot_serializes_with_version() {
        let snap = RegistrySnapshot {
            version: SNAPSHOT_VERSION,
            all_displays: vec![DisplaySnapshot {
                io_path: IoPathSnapshot {
                    io: "i2c".into(),
                    busno: 6,
                },
                dispno: 1,
                flags: 0x03,
                edid: "00ff".into(),
                mfg_id: "DEL".into(),
                model_name: "U2720Q".into(),
                product_code: 0xA027,
                serial_ascii: "ABC123".into(),
                mccs_version: Some((2, 1)),
                capabilities: None,
                drm_connector: Some("card0-DP-1".into()),
                actual_display_busno: None,
            }],
        };
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["version"], 1);
        assert_eq!(json["all_displays"][0]["io_path"]["busno"], 6);
    }
}
