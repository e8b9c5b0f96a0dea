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


//! End-to-end activation
//!
//! Wires the pieces together: negotiate a session (asking a [`ChallengeHandler`]
//! whenever the provider wants verification), fetch the activation blob, decode it
//! and hand back the activation bytes with the license file.
//!
//! # Example
//!
//! ```rust,no_run
//! use kindlepass::activator::{Activator, ChallengeHandler};
//! use kindlepass::api::{Challenge, Credentials};
//! use kindlepass::config::ClientConfig;
//! use kindlepass::device::DeviceSerial;
//!
//! struct Refuse;
//! impl ChallengeHandler for Refuse {
//!     fn respond(&mut self, _challenge: &Challenge) -> Option<String> {
//!         None
//!     }
//! }
//!
//! # async fn example() -> kindlepass::Result<()> {
//! let activator = Activator::new(ClientConfig::default());
//! let credentials = Credentials::new("user@example.com", "password")?;
//! let serial = DeviceSerial::parse("B0080XXXXXXXXXXX")?;
//! let outcome = activator.run(credentials, serial, &mut Refuse).await?;
//! println!("Activation bytes: {}", outcome.activation_bytes);
//! # Ok(())
//! # }
//! ```

use crate::api::{
    ActivationRetriever, Challenge, Credentials, NegotiationOutcome, Session, SessionNegotiator,
};
use crate::config::ClientConfig;
use crate::crypto::{
    build_license_file, decode, extract_activation_bytes, ActivationBlob, ActivationBytes, ActivationRecord,
    LicenseFile,
};
use crate::device::{DeviceSerial, TargetDevice};
use crate::error::{KindlepassError, Result, Stage};
use crate::file;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Challenges answered in one sign-in before giving up
const MAX_CHALLENGES: usize = 10;

/// Answers that were not accepted locally (e.g. an option not offered) before giving up
const MAX_INVALID_ANSWERS: usize = 3;

/// Answers provider challenges on the user's behalf
pub trait ChallengeHandler {
    /// The answer to `challenge`, or `None` to abandon the activation
    fn respond(&mut self, challenge: &Challenge) -> Option<String>;
}

impl<F> ChallengeHandler for F
where
    F: FnMut(&Challenge) -> Option<String>,
{
    fn respond(&mut self, challenge: &Challenge) -> Option<String> {
        self(challenge)
    }
}

/// Everything a successful activation produces
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationOutcome {
    pub record: ActivationRecord,
    pub activation_bytes: ActivationBytes,
    pub license: LicenseFile,
}

impl ActivationOutcome {
    pub fn from_record(record: ActivationRecord) -> Result<Self> {
        let activation_bytes = extract_activation_bytes(&record)?;
        let license = build_license_file(&record);
        Ok(Self {
            record,
            activation_bytes,
            license,
        })
    }

    pub fn from_blob(blob: &ActivationBlob) -> Result<Self> {
        Self::from_record(decode(blob)?)
    }

    /// Decode a license file already on disk
    pub fn from_license_path(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_blob(&ActivationBlob::new(bytes))
    }
}

/// Runs activations with one client configuration
pub struct Activator {
    config: ClientConfig,
}

impl Activator {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Sign in and register `serial`, answering challenges through `handler`
    pub async fn authenticate(
        &self,
        credentials: Credentials,
        serial: DeviceSerial,
        handler: &mut dyn ChallengeHandler,
    ) -> Result<Session> {
        let mut negotiator = SessionNegotiator::new(self.config.clone())?;
        let mut outcome = negotiator.negotiate(credentials, serial).await?;

        for _ in 0..MAX_CHALLENGES {
            let request = match outcome {
                NegotiationOutcome::Authenticated(session) => return Ok(session),
                NegotiationOutcome::Challenge(request) => request,
            };

            let mut rejected = 0;
            outcome = loop {
                let Some(answer) = handler.respond(request.challenge()) else {
                    negotiator.abandon();
                    return Err(KindlepassError::Cancelled(format!(
                        "{} challenge left unanswered",
                        request.challenge().kind()
                    )));
                };

                match negotiator.resolve(&request, &answer).await {
                    Err(KindlepassError::InvalidInput(reason)) if rejected < MAX_INVALID_ANSWERS => {
                        warn!(%reason, "Challenge answer not accepted, asking again");
                        rejected += 1;
                    }
                    result => break result?,
                }
            };
        }

        match outcome {
            NegotiationOutcome::Authenticated(session) => Ok(session),
            NegotiationOutcome::Challenge(_) => {
                negotiator.abandon();
                Err(KindlepassError::UnsupportedChallenge {
                    stage: Stage::Challenge,
                    detail: format!("more than {} challenges", MAX_CHALLENGES),
                })
            }
        }
    }

    /// Sign in, fetch and decode the activation for `serial`
    pub async fn run(
        &self,
        credentials: Credentials,
        serial: DeviceSerial,
        handler: &mut dyn ChallengeHandler,
    ) -> Result<ActivationOutcome> {
        let session = self.authenticate(credentials, serial, handler).await?;
        let retriever = ActivationRetriever::new(&self.config)?;
        let blob = retriever.fetch_activation_blob(session).await?;

        let outcome = ActivationOutcome::from_blob(&blob)?;
        info!(
            groups = outcome.record.groups().len(),
            license_bytes = outcome.license.len(),
            "Activation decoded"
        );
        Ok(outcome)
    }

    /// Activate a mounted device and write the license to it
    ///
    /// Unless `force` is set, a license already on the device for the same
    /// serial is reused without signing in. With `force` a new activation is
    /// requested and replaces it.
    pub async fn activate_device(
        &self,
        credentials: Credentials,
        target: &TargetDevice,
        force: bool,
        handler: &mut dyn ChallengeHandler,
    ) -> Result<(ActivationOutcome, PathBuf)> {
        if force {
            info!(serial = %target.serial, "Requesting a new activation");
        } else if let Some(record) = target.existing_license()? {
            info!(serial = %target.serial, "Device already activated, reusing its license");
            return Ok((ActivationOutcome::from_record(record)?, target.license_path()));
        }

        let outcome = self.run(credentials, target.serial.clone(), handler).await?;
        let path = file::write_license(target, &outcome.license)?;
        Ok((outcome, path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{ActivationGroup, GroupTag};

    fn record() -> ActivationRecord {
        ActivationRecord::from_groups(vec![
            ActivationGroup::new(GroupTag::DeviceSerial, b"B0419XXXXXXXXXXX".to_vec()),
            ActivationGroup::new(GroupTag::ActivationKey, vec![0xAA, 0xBB, 0xCC, 0xDD]),
        ])
        .unwrap()
    }

    #[test]
    fn test_outcome_from_record() {
        let outcome = ActivationOutcome::from_record(record()).unwrap();
        assert_eq!(outcome.activation_bytes.to_hex(), "ddccbbaa");
        assert_eq!(outcome.license, build_license_file(&record()));
    }

    #[test]
    fn test_outcome_from_license_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("AudibleActivation.sys");
        std::fs::write(&path, build_license_file(&record()).as_bytes()).unwrap();

        let outcome = ActivationOutcome::from_license_path(&path).unwrap();
        assert_eq!(outcome.record, record());
    }

    #[test]
    fn test_closure_handler() {
        let mut calls = 0;
        let mut handler = |_: &Challenge| {
            calls += 1;
            Some("123456".to_string())
        };
        let challenge = Challenge::OneTimePasscode {
            prompt: String::new(),
            field: "otpCode".to_string(),
        };
        assert_eq!(handler.respond(&challenge).as_deref(), Some("123456"));
        drop(handler);
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_existing_license_skips_network() {
        let mount = tempfile::tempdir().unwrap();
        let target = TargetDevice::new(DeviceSerial::parse("B0419XXXXXXXXXXX").unwrap(), mount.path());
        file::write_license(&target, &build_license_file(&record())).unwrap();

        // Nothing listens on the discard port; a network call would fail
        let activator = Activator::new(ClientConfig::with_base_url("http://127.0.0.1:9"));
        let credentials = Credentials::new("user@example.com", "pw").unwrap();
        let (outcome, path) = activator
            .activate_device(credentials, &target, false, &mut |_: &Challenge| -> Option<String> { None })
            .await
            .unwrap();

        assert_eq!(outcome.activation_bytes.to_hex(), "ddccbbaa");
        assert_eq!(path, target.license_path());
    }

    #[tokio::test]
    async fn test_force_ignores_existing_license() {
        let mount = tempfile::tempdir().unwrap();
        let target = TargetDevice::new(DeviceSerial::parse("B0419XXXXXXXXXXX").unwrap(), mount.path());
        file::write_license(&target, &build_license_file(&record())).unwrap();

        let activator = Activator::new(ClientConfig::with_base_url("http://127.0.0.1:9"));
        let credentials = Credentials::new("user@example.com", "pw").unwrap();
        let err = activator
            .activate_device(credentials, &target, true, &mut |_: &Challenge| -> Option<String> { None })
            .await
            .unwrap_err();

        // The sign-in was attempted instead of reusing the file
        assert_eq!(err.stage(), Some(Stage::LoginPage));
        assert!(target.is_activated());
    }
}
