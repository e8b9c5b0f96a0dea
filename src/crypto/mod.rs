//! Activation blob decoding
//!
//! Turns the binary payload of the legacy activation endpoint into the activation
//! bytes shown to the user and the `AudibleActivation.sys` file written to the device.
//!
//! # Contents
//! - [`blob`] - group framing, [`decode`], [`build_license_file`]
//! - [`activation`] - the 4-byte activation key and its hex form

pub mod activation;
pub mod blob;

// Re-export commonly used types from activation module
pub use activation::{
    ActivationBytes,
    format_activation_bytes,
    parse_activation_bytes,
    validate_activation_bytes,
};

// Re-export decoder operations
pub use blob::{
    ActivationBlob,
    ActivationGroup,
    ActivationRecord,
    GroupTag,
    LicenseFile,
    LICENSE_FILE_NAME,
    build_license_file,
    decode,
    extract_activation_bytes,
};
