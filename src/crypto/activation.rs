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


//! Activation bytes
//!
//! The 4-byte key audio tooling needs to decrypt AAX files. The legacy activation
//! blob stores it in the activation key group as a little-endian value, so the
//! group payload is reversed to obtain the bytes in display order:
//!
//! ```text
//! key group payload   01 02 03 04
//! activation bytes    04 03 02 01   -> "04030201"
//! ```

use crate::error::{KindlepassError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of bytes in an activation key
pub const ACTIVATION_BYTES_LEN: usize = 4;

/// Activation bytes in display order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActivationBytes([u8; ACTIVATION_BYTES_LEN]);

impl ActivationBytes {
    /// Derive activation bytes from the raw payload of the activation key group
    ///
    /// # Errors
    /// `MalformedBlob` if the payload is not exactly 4 bytes
    pub fn from_key_payload(payload: &[u8]) -> Result<Self> {
        let mut bytes: [u8; ACTIVATION_BYTES_LEN] = payload.try_into().map_err(|_| {
            KindlepassError::malformed(
                0,
                format!(
                    "activation key group must hold {} bytes, found {}",
                    ACTIVATION_BYTES_LEN,
                    payload.len()
                ),
            )
        })?;
        bytes.reverse();
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; ACTIVATION_BYTES_LEN] {
        &self.0
    }

    /// The key as an integer; equals the little-endian reading of the group payload
    pub fn as_u32(&self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    /// 8-character lowercase hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl From<[u8; ACTIVATION_BYTES_LEN]> for ActivationBytes {
    fn from(bytes: [u8; ACTIVATION_BYTES_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for ActivationBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Format activation bytes for display
pub fn format_activation_bytes(bytes: &ActivationBytes) -> String {
    bytes.to_hex()
}

/// Parse an 8-character hex string into activation bytes
///
/// Surrounding whitespace is ignored and either case is accepted.
pub fn parse_activation_bytes(input: &str) -> Result<ActivationBytes> {
    let trimmed = input.trim();
    if trimmed.len() != ACTIVATION_BYTES_LEN * 2 {
        return Err(KindlepassError::InvalidInput(format!(
            "activation bytes must be {} hex characters, got {}",
            ACTIVATION_BYTES_LEN * 2,
            trimmed.len()
        )));
    }

    let decoded = hex::decode(trimmed)
        .map_err(|e| KindlepassError::InvalidInput(format!("Invalid hex activation bytes: {}", e)))?;

    let bytes: [u8; ACTIVATION_BYTES_LEN] = decoded
        .try_into()
        .map_err(|_| KindlepassError::InvalidInput("activation bytes must decode to 4 bytes".to_string()))?;

    Ok(ActivationBytes(bytes))
}

/// Check whether a string is a well-formed activation key
pub fn validate_activation_bytes(input: &str) -> bool {
    parse_activation_bytes(input).is_ok()
}
