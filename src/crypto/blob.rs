// Kindlepass - Audible activation for legacy Kindle readers
// Copyright (C) 2025 Kindlepass contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Legacy activation blob decoding and license file reconstruction
//!
//! # Blob Layout
//!
//! All integers are big-endian.
//!
//! ```text
//! offset 0     u32   declared length N of the group section (header excluded)
//! offset 4     groups until offset 4 + N:
//!                u16   tag
//!                u16   payload length L (group header excluded)
//!                L     payload bytes
//! offset 4+N   trailing padding, ignored
//! ```
//!
//! The device firmware validates `AudibleActivation.sys` itself, so the license
//! file is the framed section of the blob re-serialised exactly: same header, same
//! groups, same order. Trailing padding is not part of it.

use crate::crypto::activation::{ActivationBytes, ACTIVATION_BYTES_LEN};
use crate::error::{KindlepassError, Result};
use tracing::debug;

/// Size of the blob header (declared length)
pub const BLOB_HEADER_LEN: usize = 4;

/// Size of a group header (tag + length)
pub const GROUP_HEADER_LEN: usize = 4;

/// File name the device firmware reads
pub const LICENSE_FILE_NAME: &str = "AudibleActivation.sys";

// ============================================================================
// RAW BLOB
// ============================================================================

/// Raw bytes returned by the legacy activation endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationBlob {
    bytes: Vec<u8>,
}

impl ActivationBlob {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl From<Vec<u8>> for ActivationBlob {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

// ============================================================================
// GROUPS
// ============================================================================

/// Group tags the provider is known to send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum GroupTag {
    DeviceSerial = 0x01,
    DeviceType = 0x02,
    DeviceName = 0x03,
    CustomerId = 0x04,
    IssuedAt = 0x05,
    Signature = 0x06,
    ActivationKey = 0x07,
    PlayerToken = 0x08,
}

impl GroupTag {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x01 => Some(GroupTag::DeviceSerial),
            0x02 => Some(GroupTag::DeviceType),
            0x03 => Some(GroupTag::DeviceName),
            0x04 => Some(GroupTag::CustomerId),
            0x05 => Some(GroupTag::IssuedAt),
            0x06 => Some(GroupTag::Signature),
            0x07 => Some(GroupTag::ActivationKey),
            0x08 => Some(GroupTag::PlayerToken),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// One tagged group of the blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationGroup {
    pub tag: GroupTag,
    pub payload: Vec<u8>,
}

impl ActivationGroup {
    pub fn new(tag: GroupTag, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            tag,
            payload: payload.into(),
        }
    }

    fn encoded_len(&self) -> usize {
        GROUP_HEADER_LEN + self.payload.len()
    }
}

/// Decoded blob: groups in the order the provider sent them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationRecord {
    groups: Vec<ActivationGroup>,
}

impl ActivationRecord {
    /// Build a record from groups, enforcing the same rules as [`decode`]
    pub fn from_groups(groups: Vec<ActivationGroup>) -> Result<Self> {
        let mut key_groups = 0;
        let mut total = 0usize;
        for group in &groups {
            if group.payload.len() > u16::MAX as usize {
                return Err(KindlepassError::InvalidInput(format!(
                    "group 0x{:02x} payload of {} bytes does not fit a u16 length",
                    group.tag.as_u16(),
                    group.payload.len()
                )));
            }
            if group.tag == GroupTag::ActivationKey {
                key_groups += 1;
                if group.payload.len() != ACTIVATION_BYTES_LEN {
                    return Err(KindlepassError::InvalidInput(format!(
                        "activation key group must hold {} bytes",
                        ACTIVATION_BYTES_LEN
                    )));
                }
            }
            total += group.encoded_len();
        }

        if key_groups == 0 {
            return Err(KindlepassError::MissingActivationGroup);
        }
        if key_groups > 1 {
            return Err(KindlepassError::InvalidInput(
                "more than one activation key group".to_string(),
            ));
        }
        if total > u32::MAX as usize {
            return Err(KindlepassError::InvalidInput("record too large".to_string()));
        }

        Ok(Self { groups })
    }

    pub fn groups(&self) -> &[ActivationGroup] {
        &self.groups
    }

    /// First group carrying `tag`
    pub fn group(&self, tag: GroupTag) -> Option<&ActivationGroup> {
        self.groups.iter().find(|g| g.tag == tag)
    }

    /// Device serial recorded in the blob, if present and valid UTF-8
    pub fn device_serial(&self) -> Option<&str> {
        self.group(GroupTag::DeviceSerial)
            .and_then(|g| std::str::from_utf8(&g.payload).ok())
            .map(|s| s.trim_end_matches('\0'))
    }

    /// Length of the group section as written in the header
    pub fn section_len(&self) -> usize {
        self.groups.iter().map(ActivationGroup::encoded_len).sum()
    }
}

// ============================================================================
// LICENSE FILE
// ============================================================================

/// Bytes of `AudibleActivation.sys`
#[derive(Clone, PartialEq, Eq)]
pub struct LicenseFile {
    bytes: Vec<u8>,
}

impl LicenseFile {
    pub fn file_name(&self) -> &'static str {
        LICENSE_FILE_NAME
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl std::fmt::Debug for LicenseFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LicenseFile")
            .field("name", &LICENSE_FILE_NAME)
            .field("len", &self.bytes.len())
            .finish()
    }
}

// ============================================================================
// OPERATIONS
// ============================================================================

/// Walk the blob's group framing into an [`ActivationRecord`]
///
/// # Errors
/// - `MalformedBlob` - truncated header or group, declared length past the end of
///   the buffer, unknown tag, duplicate or wrongly sized activation key group
/// - `MissingActivationGroup` - no activation key group
pub fn decode(blob: &ActivationBlob) -> Result<ActivationRecord> {
    let bytes = blob.as_bytes();

    if bytes.len() < BLOB_HEADER_LEN {
        return Err(KindlepassError::malformed(
            0,
            format!(
                "blob is {} bytes, shorter than the {}-byte header",
                bytes.len(),
                BLOB_HEADER_LEN
            ),
        ));
    }

    let declared = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let end = BLOB_HEADER_LEN
        .checked_add(declared)
        .filter(|end| *end <= bytes.len())
        .ok_or_else(|| {
            KindlepassError::malformed(
                0,
                format!(
                    "declared length {} exceeds the {} bytes that follow the header",
                    declared,
                    bytes.len() - BLOB_HEADER_LEN
                ),
            )
        })?;

    let mut groups = Vec::new();
    let mut key_seen = false;
    let mut offset = BLOB_HEADER_LEN;

    while offset < end {
        if end - offset < GROUP_HEADER_LEN {
            return Err(KindlepassError::malformed(
                offset,
                format!("truncated group header ({} bytes left)", end - offset),
            ));
        }

        let raw_tag = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]);
        let len = u16::from_be_bytes([bytes[offset + 2], bytes[offset + 3]]) as usize;
        let start = offset + GROUP_HEADER_LEN;

        let tag = GroupTag::from_u16(raw_tag).ok_or_else(|| {
            KindlepassError::malformed(offset, format!("unexpected group tag 0x{:04x}", raw_tag))
        })?;

        if len > end - start {
            return Err(KindlepassError::malformed(
                offset,
                format!(
                    "group 0x{:02x} declares {} bytes but only {} remain",
                    raw_tag,
                    len,
                    end - start
                ),
            ));
        }

        if tag == GroupTag::ActivationKey {
            if key_seen {
                return Err(KindlepassError::malformed(offset, "duplicate activation key group"));
            }
            if len != ACTIVATION_BYTES_LEN {
                return Err(KindlepassError::malformed(
                    offset,
                    format!(
                        "activation key group must hold {} bytes, found {}",
                        ACTIVATION_BYTES_LEN, len
                    ),
                ));
            }
            key_seen = true;
        }

        groups.push(ActivationGroup {
            tag,
            payload: bytes[start..start + len].to_vec(),
        });
        offset = start + len;
    }

    if !key_seen {
        return Err(KindlepassError::MissingActivationGroup);
    }

    debug!(
        groups = groups.len(),
        declared,
        padding = bytes.len() - end,
        "Decoded activation blob"
    );

    Ok(ActivationRecord { groups })
}

/// Read the activation bytes out of the activation key group
pub fn extract_activation_bytes(record: &ActivationRecord) -> Result<ActivationBytes> {
    let group = record
        .group(GroupTag::ActivationKey)
        .ok_or(KindlepassError::MissingActivationGroup)?;
    ActivationBytes::from_key_payload(&group.payload)
}

/// Re-serialise the record into the on-device license file
pub fn build_license_file(record: &ActivationRecord) -> LicenseFile {
    let section_len = record.section_len();
    let mut bytes = Vec::with_capacity(BLOB_HEADER_LEN + section_len);

    // Both casts are bounded by ActivationRecord's constructors
    bytes.extend_from_slice(&(section_len as u32).to_be_bytes());
    for group in &record.groups {
        bytes.extend_from_slice(&group.tag.as_u16().to_be_bytes());
        bytes.extend_from_slice(&(group.payload.len() as u16).to_be_bytes());
        bytes.extend_from_slice(&group.payload);
    }

    LicenseFile { bytes }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(tag: u16, payload: &[u8]) -> Vec<u8> {
        let mut out = tag.to_be_bytes().to_vec();
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn framed(groups: &[Vec<u8>], padding: usize) -> Vec<u8> {
        let section: Vec<u8> = groups.concat();
        let mut out = (section.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(&section);
        out.extend(std::iter::repeat(0u8).take(padding));
        out
    }

    #[test]
    fn test_decode_single_key_group() {
        let blob = ActivationBlob::new(framed(&[group(0x07, &[1, 2, 3, 4])], 0));
        let record = decode(&blob).unwrap();
        assert_eq!(record.groups().len(), 1);
        assert_eq!(record.groups()[0].tag, GroupTag::ActivationKey);
        assert_eq!(extract_activation_bytes(&record).unwrap().to_hex(), "04030201");
    }

    #[test]
    fn test_decode_stops_at_declared_end() {
        // Padding that would parse as a bogus group must be ignored
        let mut bytes = framed(&[group(0x07, &[1, 2, 3, 4])], 0);
        bytes.extend_from_slice(&group(0xFFFF, &[9; 12]));
        let record = decode(&ActivationBlob::new(bytes)).unwrap();
        assert_eq!(record.groups().len(), 1);
    }

    #[test]
    fn test_decode_rejects_short_header() {
        let err = decode(&ActivationBlob::new(vec![0, 0])).unwrap_err();
        assert!(matches!(err, KindlepassError::MalformedBlob { offset: 0, .. }));
    }

    #[test]
    fn test_decode_rejects_declared_length_past_buffer() {
        let mut bytes = framed(&[group(0x07, &[1, 2, 3, 4])], 0);
        bytes[3] += 10;
        let err = decode(&ActivationBlob::new(bytes)).unwrap_err();
        assert!(matches!(err, KindlepassError::MalformedBlob { .. }));
    }

    #[test]
    fn test_decode_rejects_group_past_declared_end() {
        let mut bytes = framed(&[group(0x01, b"B0419XXXXXXXXXXX"), group(0x07, &[1, 2, 3, 4])], 0);
        // Serial group claims 0x100 bytes
        bytes[6] = 0x01;
        let err = decode(&ActivationBlob::new(bytes)).unwrap_err();
        match err {
            KindlepassError::MalformedBlob { offset, reason } => {
                assert_eq!(offset, BLOB_HEADER_LEN);
                assert!(reason.contains("remain"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_truncated_group_header() {
        let mut section = group(0x07, &[1, 2, 3, 4]);
        section.extend_from_slice(&[0x00, 0x01]);
        let mut bytes = (section.len() as u32).to_be_bytes().to_vec();
        bytes.extend_from_slice(&section);
        let err = decode(&ActivationBlob::new(bytes)).unwrap_err();
        assert!(matches!(err, KindlepassError::MalformedBlob { offset: 12, .. }));
    }

    #[test]
    fn test_decode_rejects_unknown_tag() {
        let bytes = framed(&[group(0x07, &[1, 2, 3, 4]), group(0x2A, b"??")], 0);
        let err = decode(&ActivationBlob::new(bytes)).unwrap_err();
        match err {
            KindlepassError::MalformedBlob { reason, .. } => assert!(reason.contains("0x002a")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_duplicate_key_group() {
        let bytes = framed(&[group(0x07, &[1, 2, 3, 4]), group(0x07, &[5, 6, 7, 8])], 0);
        let err = decode(&ActivationBlob::new(bytes)).unwrap_err();
        assert!(matches!(err, KindlepassError::MalformedBlob { .. }));
    }

    #[test]
    fn test_decode_rejects_wrong_key_length() {
        let bytes = framed(&[group(0x07, &[1, 2, 3])], 0);
        let err = decode(&ActivationBlob::new(bytes)).unwrap_err();
        assert!(matches!(err, KindlepassError::MalformedBlob { .. }));
    }

    #[test]
    fn test_decode_missing_key_group() {
        let bytes = framed(&[group(0x01, b"B0419XXXXXXXXXXX")], 4);
        let err = decode(&ActivationBlob::new(bytes)).unwrap_err();
        assert!(matches!(err, KindlepassError::MissingActivationGroup));
    }

    #[test]
    fn test_zero_length_group_is_accepted() {
        let bytes = framed(&[group(0x06, &[]), group(0x07, &[1, 2, 3, 4])], 0);
        let record = decode(&ActivationBlob::new(bytes.clone())).unwrap();
        assert_eq!(record.groups()[0].payload.len(), 0);
        assert_eq!(build_license_file(&record).as_bytes(), &bytes[..]);
    }

    #[test]
    fn test_device_serial_lookup() {
        let bytes = framed(&[group(0x01, b"B0419XXXXXXXXXXX"), group(0x07, &[1, 2, 3, 4])], 0);
        let record = decode(&ActivationBlob::new(bytes)).unwrap();
        assert_eq!(record.device_serial(), Some("B0419XXXXXXXXXXX"));
    }

    #[test]
    fn test_from_groups_rules() {
        let err = ActivationRecord::from_groups(vec![ActivationGroup::new(GroupTag::DeviceSerial, b"x".to_vec())])
            .unwrap_err();
        assert!(matches!(err, KindlepassError::MissingActivationGroup));

        let record = ActivationRecord::from_groups(vec![
            ActivationGroup::new(GroupTag::DeviceType, b"A2CZJZGLK2JJVM".to_vec()),
            ActivationGroup::new(GroupTag::ActivationKey, vec![0xAA, 0xBB, 0xCC, 0xDD]),
        ])
        .unwrap();
        let license = build_license_file(&record);
        assert_eq!(decode(&ActivationBlob::new(license.into_bytes())).unwrap(), record);
    }

    #[test]
    fn test_license_debug_hides_bytes() {
        let record = ActivationRecord::from_groups(vec![ActivationGroup::new(
            GroupTag::ActivationKey,
            vec![1, 2, 3, 4],
        )])
        .unwrap();
        let debug = format!("{:?}", build_license_file(&record));
        assert!(debug.contains("AudibleActivation.sys"));
        assert!(debug.contains("len: 12"));
    }
}
