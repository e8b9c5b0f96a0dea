//! Target devices
//!
//! A [`TargetDevice`] is a Kindle serial plus the mount point of its USB storage.
//! Discovery is platform glue and sits behind [`DeviceResolver`]; the rest of the
//! crate only needs a resolved device to write the license file to.

pub mod usb;

use crate::config::DeviceEntry;
use crate::crypto::{decode, ActivationBlob, ActivationRecord};
use crate::error::{KindlepassError, Result};
use crate::file::paths;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

pub use usb::UsbResolver;

/// Serial lengths accepted for legacy readers
const SERIAL_MIN_LEN: usize = 16;
const SERIAL_MAX_LEN: usize = 19;

// ============================================================================
// SERIAL
// ============================================================================

/// Normalised device serial number
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct DeviceSerial(String);

impl DeviceSerial {
    /// Parse a serial as printed on the device (spaces allowed, any case)
    pub fn parse(input: &str) -> Result<Self> {
        let serial: String = input
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_ascii_uppercase();

        if !(SERIAL_MIN_LEN..=SERIAL_MAX_LEN).contains(&serial.len()) {
            return Err(KindlepassError::InvalidInput(format!(
                "serial number must be {} to {} characters, got {}",
                SERIAL_MIN_LEN,
                SERIAL_MAX_LEN,
                serial.len()
            )));
        }
        if !serial.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(KindlepassError::InvalidInput(
                "serial number must be alphanumeric".to_string(),
            ));
        }

        Ok(Self(serial))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Model name derived from the serial prefix
    pub fn model(&self) -> &'static str {
        match &self.0[..4] {
            "B001" | "B101" => "Kindle 1",
            "B002" | "B003" => "Kindle 2",
            "B004" | "B005" => "Kindle DX",
            "B009" => "Kindle DX Graphite",
            "B008" => "Kindle 3 WiFi",
            "B006" | "B00A" => "Kindle 3 3G",
            "B00C" => "Kindle PaperWhite",
            "B00E" | "B023" | "9023" => "Kindle 4",
            "B00F" | "B010" => "Kindle Touch 3G",
            "B011" => "Kindle Touch WiFi",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for DeviceSerial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for DeviceSerial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceSerial({})", self.0)
    }
}

// ============================================================================
// TARGET DEVICE
// ============================================================================

/// A mounted reader the license file can be written to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDevice {
    pub serial: DeviceSerial,
    pub mount_point: PathBuf,
}

impl TargetDevice {
    pub fn new(serial: DeviceSerial, mount_point: impl Into<PathBuf>) -> Self {
        Self {
            serial,
            mount_point: mount_point.into(),
        }
    }

    /// `<mount>/system/AudibleActivation.sys`
    pub fn license_path(&self) -> PathBuf {
        paths::device_license_path(&self.mount_point)
    }

    pub fn model(&self) -> &'static str {
        self.serial.model()
    }

    /// License already on the device, if it decodes and belongs to this serial
    pub fn existing_license(&self) -> Result<Option<ActivationRecord>> {
        let path = self.license_path();
        if !path.is_file() {
            return Ok(None);
        }

        let bytes = std::fs::read(&path)?;
        let record = match decode(&ActivationBlob::new(bytes)) {
            Ok(record) => record,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Existing license does not decode");
                return Ok(None);
            }
        };

        if record.device_serial() == Some(self.serial.as_str()) {
            Ok(Some(record))
        } else {
            debug!(path = %path.display(), "Existing license belongs to another serial");
            Ok(None)
        }
    }

    pub fn is_activated(&self) -> bool {
        matches!(self.existing_license(), Ok(Some(_)))
    }
}

// ============================================================================
// RESOLVERS
// ============================================================================

/// Maps serials or storage handles to writable devices
pub trait DeviceResolver {
    /// Devices currently available
    fn candidates(&self) -> Result<Vec<TargetDevice>>;

    /// Find a device by serial or by mount point / storage handle
    ///
    /// # Errors
    /// `DeviceNotFound` when nothing matches
    fn resolve(&self, serial_or_handle: &str) -> Result<TargetDevice> {
        let wanted_serial = DeviceSerial::parse(serial_or_handle).ok();
        let wanted_path = Path::new(serial_or_handle.trim());

        self.candidates()?
            .into_iter()
            .find(|d| Some(&d.serial) == wanted_serial.as_ref() || d.mount_point == wanted_path)
            .ok_or_else(|| KindlepassError::DeviceNotFound(serial_or_handle.to_string()))
    }
}

/// Devices listed explicitly, e.g. from the config file
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    devices: Vec<TargetDevice>,
}

impl StaticResolver {
    pub fn new(devices: Vec<TargetDevice>) -> Self {
        Self { devices }
    }

    pub fn from_entries(entries: &[DeviceEntry]) -> Result<Self> {
        let devices = entries
            .iter()
            .map(|e| Ok(TargetDevice::new(DeviceSerial::parse(&e.serial)?, e.mount_point.clone())))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { devices })
    }
}

impl DeviceResolver for StaticResolver {
    fn candidates(&self) -> Result<Vec<TargetDevice>> {
        Ok(self.devices.clone())
    }
}
