//! Audible activation for legacy Kindle readers
//!
//! Kindle 1 through Kindle Touch cannot sign in to the current identity provider
//! by themselves, so they never receive the `AudibleActivation.sys` file needed to
//! play Audible titles. This crate performs the exchange on their behalf:
//!
//! 1. [`api::SessionNegotiator`] signs in and registers the device serial,
//!    surfacing CAPTCHA and verification steps as [`api::Challenge`] values
//! 2. [`api::ActivationRetriever`] fetches the raw activation blob
//! 3. [`crypto`] decodes it into the activation bytes and the license file
//! 4. [`device`] and [`file`] find the reader and write the license atomically
//!
//! [`activator::Activator`] runs the whole sequence.

// Core modules
pub mod activator;
pub mod api;
pub mod config;
pub mod crypto;
pub mod device;
pub mod error;
pub mod file;

// Re-export commonly used types for convenience
pub use activator::{ActivationOutcome, Activator, ChallengeHandler};
pub use error::{KindlepassError, Result};
