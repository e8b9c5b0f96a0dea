//! Provider-facing side of activation
//!
//! [`auth::SessionNegotiator`] signs in and registers the device,
//! [`activation::ActivationRetriever`] exchanges the resulting session for the raw
//! activation blob. Both share the retrying transport in [`client`].

pub mod activation;
pub mod auth;
pub mod client;
pub mod html;
pub mod registration;
pub mod wire;

// Re-export commonly used types
pub use activation::ActivationRetriever;
pub use auth::{
    Challenge, ChallengeRequest, Credentials, DeviceIdentity, NegotiationOutcome, NegotiationState, Session,
    SessionNegotiator, VerificationOption,
};
pub use registration::RegistrationResponse;
