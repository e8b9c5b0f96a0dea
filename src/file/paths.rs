//! License file locations

use crate::crypto::LICENSE_FILE_NAME;
use crate::device::DeviceSerial;
use crate::error::{KindlepassError, Result};
use std::path::{Path, PathBuf};

/// Directory on the reader's storage holding system files
pub const DEVICE_SYSTEM_DIR: &str = "system";

/// Per-user directory for saved licenses
pub const SAVE_DIR_NAME: &str = ".kindlepass";

/// `<mount>/system/AudibleActivation.sys`
pub fn device_license_path(mount_point: &Path) -> PathBuf {
    mount_point.join(DEVICE_SYSTEM_DIR).join(LICENSE_FILE_NAME)
}

/// `~/.kindlepass/<SERIAL>/AudibleActivation.sys`
pub fn default_save_path(serial: &DeviceSerial) -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| KindlepassError::Config("cannot determine home directory".to_string()))?;
    Ok(save_path_under(&home, serial))
}

pub(crate) fn save_path_under(home: &Path, serial: &DeviceSerial) -> PathBuf {
    home.join(SAVE_DIR_NAME).join(serial.as_str()).join(LICENSE_FILE_NAME)
}
