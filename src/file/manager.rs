//! Atomic license writes
//!
//! The license is written to a temp file next to its destination, synced, then
//! renamed into place. The device never sees a partially written
//! `AudibleActivation.sys`, and the temp file is removed on every failure path
//! (`NamedTempFile` deletes itself when dropped).

use crate::crypto::LicenseFile;
use crate::device::TargetDevice;
use crate::error::{KindlepassError, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

/// Write `license` to `path` atomically
///
/// # Errors
/// `DeviceWriteFailed` with the destination path; nothing is left at `path` or
/// beside it
pub fn write_license_atomic(path: &Path, license: &LicenseFile) -> Result<()> {
    let fail = |source: std::io::Error| KindlepassError::DeviceWriteFailed {
        path: path.to_path_buf(),
        source,
    };

    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut tmp = tempfile::Builder::new()
        .prefix(".AudibleActivation")
        .suffix(".tmp")
        .tempfile_in(parent)
        .map_err(fail)?;

    tmp.write_all(license.as_bytes()).map_err(fail)?;
    tmp.as_file().sync_all().map_err(fail)?;
    tmp.persist(path).map_err(|e| fail(e.error))?;

    info!(path = %path.display(), bytes = license.len(), "Wrote license file");
    Ok(())
}

/// Write the license to `<mount>/system/AudibleActivation.sys`
pub fn write_license(target: &TargetDevice, license: &LicenseFile) -> Result<PathBuf> {
    if !target.mount_point.is_dir() {
        return Err(KindlepassError::DeviceWriteFailed {
            path: target.mount_point.clone(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "device is not mounted"),
        });
    }

    let path = target.license_path();
    if let Some(system_dir) = path.parent() {
        std::fs::create_dir_all(system_dir).map_err(|source| KindlepassError::DeviceWriteFailed {
            path: path.clone(),
            source,
        })?;
    }

    write_license_atomic(&path, license)?;
    Ok(path)
}

/// Write the license to an arbitrary path, creating parent directories
pub fn save_license_to(path: &Path, license: &LicenseFile) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| KindlepassError::DeviceWriteFailed {
            path: path.to_path_buf(),
            source,
        })?;
    }
    write_license_atomic(path, license)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{build_license_file, ActivationGroup, ActivationRecord, GroupTag};
    use crate::device::DeviceSerial;

    fn license() -> LicenseFile {
        let record = ActivationRecord::from_groups(vec![
            ActivationGroup::new(GroupTag::DeviceSerial, b"B0419XXXXXXXXXXX".to_vec()),
            ActivationGroup::new(GroupTag::ActivationKey, vec![0xAA, 0xBB, 0xCC, 0xDD]),
        ])
        .unwrap();
        build_license_file(&record)
    }

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_atomic_write_replaces_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("AudibleActivation.sys");
        std::fs::write(&path, b"old").unwrap();

        write_license_atomic(&path, &license()).unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), license().as_bytes());
        assert_eq!(entries(dir.path()), vec!["AudibleActivation.sys"]);
    }

    #[test]
    fn test_failed_write_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        // A directory at the destination makes the final rename fail
        let path = dir.path().join("AudibleActivation.sys");
        std::fs::create_dir(&path).unwrap();

        let err = write_license_atomic(&path, &license()).unwrap_err();
        assert!(matches!(err, KindlepassError::DeviceWriteFailed { .. }));
        assert_eq!(entries(dir.path()), vec!["AudibleActivation.sys"]);
        assert!(path.is_dir());
    }

    #[test]
    fn test_write_to_device_creates_system_dir() {
        let mount = tempfile::tempdir().unwrap();
        let target = TargetDevice::new(DeviceSerial::parse("B0419XXXXXXXXXXX").unwrap(), mount.path());

        let path = write_license(&target, &license()).unwrap();
        assert_eq!(path, mount.path().join("system").join("AudibleActivation.sys"));
        assert_eq!(std::fs::read(path).unwrap(), license().as_bytes());
        assert!(target.is_activated());
    }

    #[test]
    fn test_write_to_unmounted_device_fails() {
        let target = TargetDevice::new(
            DeviceSerial::parse("B0419XXXXXXXXXXX").unwrap(),
            "/nonexistent/kindle/mount",
        );
        assert!(matches!(
            write_license(&target, &license()),
            Err(KindlepassError::DeviceWriteFailed { .. })
        ));
    }

    #[test]
    fn test_save_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a").join("b").join("AudibleActivation.sys");
        save_license_to(&path, &license()).unwrap();
        assert_eq!(std::fs::read(path).unwrap(), license().as_bytes());
    }
}
