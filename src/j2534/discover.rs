use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::j2534::types::ProtocolId;

pub type SupportedProtocols = BTreeSet<ProtocolId>;

/// Pointer width a driver module was built for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PointerWidth {
    Bits32,
    Bits64,
}

impl PointerWidth {
    /// Width of the running process
    pub const fn host() -> Self {
        if cfg!(target_pointer_width = "64") {
            Self::Bits64
        } else {
            Self::Bits32
        }
    }
}

impl fmt::Display for PointerWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bits32 => f.write_str("32-bit"),
            Self::Bits64 => f.write_str("64-bit"),
        }
    }
}

/// An installed J2534 driver as recorded by the system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverDescriptor {
    pub name: String,
    pub vendor: Option<String>,
    pub library_path: PathBuf,
    pub protocols: SupportedProtocols,
    pub width: PointerWidth,
}

impl DriverDescriptor {
    /// Descriptor for a module path with nothing else known about it
    pub fn from_path(library_path: impl Into<PathBuf>) -> Self {
        let library_path = library_path.into();
        let name = library_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            name,
            vendor: None,
            library_path,
            protocols: SupportedProtocols::new(),
            width: PointerWidth::host(),
        }
    }

    pub fn supports(&self, protocol: ProtocolId) -> bool {
        self.protocols.contains(&protocol)
    }
}

/// Keeps the first descriptor per library path, compared case-insensitively
fn dedup_by_path(descriptors: Vec<DriverDescriptor>) -> Vec<DriverDescriptor> {
    let mut seen = HashSet::new();
    descriptors
        .into_iter()
        .filter(|d| seen.insert(d.library_path.to_string_lossy().to_lowercase()))
        .collect()
}

/// Discover J2534 drivers from the Windows registry.
/// Reads both the 32-bit and 64-bit views of `HKLM\SOFTWARE\PassThruSupport.04.04`.
#[cfg(target_os = "windows")]
pub fn discover_drivers() -> Vec<DriverDescriptor> {
    use winreg::enums::*;
    use winreg::RegKey;

    const PASSTHRU_KEY: &str = r"SOFTWARE\PassThruSupport.04.04";

    let hklm = RegKey::predef(HKEY_LOCAL_MACHINE);
    // 32-bit view first: on a 32-bit OS both flags land on the same keys
    let views = [
        (KEY_READ | KEY_WOW64_32KEY, PointerWidth::Bits32),
        (KEY_READ | KEY_WOW64_64KEY, PointerWidth::Bits64),
    ];

    let mut results = Vec::new();
    for (flags, width) in views {
        let Ok(key) = hklm.open_subkey_with_flags(PASSTHRU_KEY, flags) else {
            continue;
        };
        for name in key.enum_keys().filter_map(|k| k.ok()) {
            let Ok(subkey) = key.open_subkey_with_flags(&name, flags) else {
                continue;
            };
            let Ok(dll_path) = subkey.get_value::<String, _>("FunctionLibrary") else {
                log::debug!("PassThru entry {} has no FunctionLibrary; skipped", name);
                continue;
            };
            let protocols = ProtocolId::ALL
                .iter()
                .copied()
                .filter(|p| {
                    subkey
                        .get_value::<u32, _>(p.name())
                        .map_or(false, |v| v != 0)
                })
                .collect();
            results.push(DriverDescriptor {
                name: subkey
                    .get_value::<String, _>("Name")
                    .unwrap_or_else(|_| name.clone()),
                vendor: subkey.get_value::<String, _>("Vendor").ok(),
                library_path: PathBuf::from(dll_path),
                protocols,
                width,
            });
        }
    }

    let results = dedup_by_path(results);
    log::debug!("Found {} J2534 driver(s) in the registry", results.len());
    results
}

/// Discover J2534 drivers from JSON manifests.
/// Reads `$PASSTHRU_MANIFEST_DIR`, or `~/.passthru` when unset.
#[cfg(not(target_os = "windows"))]
pub fn discover_drivers() -> Vec<DriverDescriptor> {
    let Some(dir) = manifest_dir() else {
        return Vec::new();
    };
    match load_manifest_dir(&dir) {
        Ok(drivers) => drivers,
        Err(e) => {
            log::debug!("No J2534 manifests in {}: {}", dir.display(), e);
            Vec::new()
        }
    }
}

#[cfg(not(target_os = "windows"))]
fn manifest_dir() -> Option<PathBuf> {
    if let Some(dir) = std::env::var_os("PASSTHRU_MANIFEST_DIR") {
        return Some(PathBuf::from(dir));
    }
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".passthru"))
}

/// One manifest file: `{"NAME": .., "FUNCTION_LIB": .., "CAN": true, ..}`
#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(rename = "NAME")]
    name: String,
    #[serde(rename = "VENDOR", default)]
    vendor: Option<String>,
    #[serde(rename = "FUNCTION_LIB")]
    function_lib: PathBuf,
    #[serde(flatten)]
    flags: serde_json::Map<String, serde_json::Value>,
}

/// Parses one manifest document
pub fn parse_manifest(json: &str) -> serde_json::Result<DriverDescriptor> {
    let manifest: Manifest = serde_json::from_str(json)?;
    let protocols = ProtocolId::ALL
        .iter()
        .copied()
        .filter(|p| match manifest.flags.get(p.name()) {
            Some(serde_json::Value::Bool(b)) => *b,
            Some(serde_json::Value::Number(n)) => n.as_u64().map_or(false, |v| v != 0),
            _ => false,
        })
        .collect();
    Ok(DriverDescriptor {
        name: manifest.name,
        vendor: manifest.vendor,
        library_path: manifest.function_lib,
        protocols,
        width: PointerWidth::host(),
    })
}

/// Reads every `*.json` manifest in `dir`, sorted by file name.
/// Files that fail to parse are skipped with a warning.
pub fn load_manifest_dir(dir: &Path) -> std::io::Result<Vec<DriverDescriptor>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().map_or(false, |ext| ext == "json"))
        .collect();
    paths.sort();

    let mut results = Vec::new();
    for path in paths {
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) => {
                log::warn!("Cannot read J2534 manifest {}: {}", path.display(), e);
                continue;
            }
        };
        match parse_manifest(&text) {
            Ok(descriptor) => results.push(descriptor),
            Err(e) => log::warn!("Invalid J2534 manifest {}: {}", path.display(), e),
        }
    }
    Ok(dedup_by_path(results))
}
