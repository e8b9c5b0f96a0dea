//! USB mass-storage discovery (Linux)
//!
//! Kindles expose their storage as `usb-Kindle_Internal_Storage_<SERIAL>-0:0` under
//! `/dev/disk/by-id`. The link target is matched against `/proc/mounts` to find
//! where the storage is mounted. Devices that are attached but not mounted are
//! skipped since nothing can be written to them.

use super::{DeviceResolver, DeviceSerial, TargetDevice};
use crate::error::Result;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const BY_ID_PREFIX: &str = "usb-Kindle_";

#[derive(Debug, Clone)]
pub struct UsbResolver {
    by_id_dir: PathBuf,
    mounts_file: PathBuf,
}

impl Default for UsbResolver {
    fn default() -> Self {
        Self::new("/dev/disk/by-id", "/proc/mounts")
    }
}

impl UsbResolver {
    /// Resolver over custom roots, for tests and unusual layouts
    pub fn new(by_id_dir: impl Into<PathBuf>, mounts_file: impl Into<PathBuf>) -> Self {
        Self {
            by_id_dir: by_id_dir.into(),
            mounts_file: mounts_file.into(),
        }
    }

    fn mounts(&self) -> Result<Vec<(PathBuf, PathBuf)>> {
        if !self.mounts_file.exists() {
            return Ok(Vec::new());
        }
        let text = fs::read_to_string(&self.mounts_file)?;
        Ok(text
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                let device = fields.next()?;
                let mount_point = fields.next()?;
                Some((canonical(Path::new(&unescape_mount(device))), PathBuf::from(unescape_mount(mount_point))))
            })
            .collect())
    }
}

impl DeviceResolver for UsbResolver {
    fn candidates(&self) -> Result<Vec<TargetDevice>> {
        if !self.by_id_dir.is_dir() {
            return Ok(Vec::new());
        }

        let mounts = self.mounts()?;
        let mut seen = HashSet::new();
        let mut devices = Vec::new();

        let mut entries: Vec<_> = fs::read_dir(&self.by_id_dir)?.filter_map(|e| e.ok()).collect();
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(serial) = serial_from_link_name(&name) else { continue };

            let node = canonical(&entry.path());
            let Some((_, mount_point)) = mounts.iter().find(|(dev, _)| *dev == node) else {
                debug!(serial = %serial, node = %node.display(), "Kindle attached but not mounted");
                continue;
            };

            if seen.insert(serial.clone()) {
                devices.push(TargetDevice::new(serial, mount_point.clone()));
            }
        }

        debug!(count = devices.len(), "USB device scan complete");
        Ok(devices)
    }
}

/// Serial embedded in a by-id link name
fn serial_from_link_name(name: &str) -> Option<DeviceSerial> {
    let rest = name.strip_prefix(BY_ID_PREFIX)?;
    let tail = rest.rsplit('_').next()?;
    let serial = tail.split('-').next()?;
    DeviceSerial::parse(serial).ok()
}

fn canonical(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// `/proc/mounts` escapes whitespace as octal (`\040`)
fn unescape_mount(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let code = digits.iter().fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                if let Ok(byte) = u8::try_from(code) {
                    out.push(byte);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
