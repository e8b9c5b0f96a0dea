//! License file placement and atomic writes
//!
//! - [`paths`] - where `AudibleActivation.sys` goes on a device or on disk
//! - [`manager`] - temp-file-and-rename writes that never leave a partial file behind

pub mod manager;
pub mod paths;

// Re-export commonly used functions
pub use manager::{save_license_to, write_license, write_license_atomic};
pub use paths::{default_save_path, device_license_path};
