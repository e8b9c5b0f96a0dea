//! Provider-owned paths, parameters and form field names
//!
//! These names are fixed by the identity provider and the legacy activation endpoint.
//! They are a compatibility contract; keep them in this module and nowhere else.

use crate::api::auth::DeviceIdentity;
use crate::config::Locale;

// ============================================================================
// PATHS
// ============================================================================

pub const SIGNIN_PATH: &str = "/ap/signin";
pub const RETURN_TO_PATH: &str = "/ap/maplanding";
pub const REGISTER_PATH: &str = "/auth/register";
pub const ACTIVATION_PATH: &str = "/license/token";

// ============================================================================
// SIGN-IN FORM
// ============================================================================

pub const SIGNIN_FORM: &str = "signIn";
pub const FIELD_EMAIL: &str = "email";
pub const FIELD_PASSWORD: &str = "password";

/// Query parameter of the success redirect carrying the authorization code
pub const AUTH_CODE_PARAM: &str = "openid.oa2.authorization_code";

// ============================================================================
// CHALLENGE PAGES
// ============================================================================

/// Error box shown on rejected credentials
pub const MARKER_AUTH_ERROR: &str = "auth-error-message-box";

/// CAPTCHA image embedded in the sign-in form
pub const MARKER_CAPTCHA_IMAGE: &str = "auth-captcha-image";
pub const FIELD_CAPTCHA_GUESS: &str = "guess";

/// Stand-alone CAPTCHA page of the verification flow
pub const FIELD_CVF_CAPTCHA: &str = "cvf_captcha_input";

/// One-time password from an authenticator app
pub const MARKER_MFA_FORM: &str = "auth-mfa-form";
pub const FIELD_OTP: &str = "otpCode";

/// Choice of where to send a verification code
pub const MARKER_CLAIMS_PICKER: &str = "claimspicker";
pub const FIELD_CLAIM_OPTION: &str = "option";

/// Code sent by e-mail or SMS
pub const MARKER_VERIFY_FORM: &str = "verification-code-form";
pub const FIELD_VERIFY_CODE: &str = "code";

/// Field name used for redirects completed outside the client
pub const FIELD_REDIRECT_URL: &str = "redirect_url";

// ============================================================================
// LEGACY ACTIVATION
// ============================================================================

pub const PLAYER_MANUFACTURER: &str = "Audible,Kindle";
pub const PLAYER_MODEL: &str = "Kindle";

/// Query of the sign-in page
pub fn signin_params(
    locale: &Locale,
    return_to: &str,
    client_id: &str,
    code_challenge: &str,
) -> Vec<(&'static str, String)> {
    vec![
        ("openid.pape.max_auth_age", "0".to_string()),
        ("openid.return_to", return_to.to_string()),
        ("openid.identity", "http://specs.openid.net/auth/2.0/identifier_select".to_string()),
        ("openid.claimed_id", "http://specs.openid.net/auth/2.0/identifier_select".to_string()),
        ("openid.assoc_handle", format!("amzn_audible_kindle_{}", locale.country_code)),
        ("openid.mode", "checkid_setup".to_string()),
        ("openid.ns", "http://specs.openid.net/auth/2.0".to_string()),
        ("openid.ns.oa2", "http://www.amazon.com/ap/ext/oauth/2".to_string()),
        ("openid.oa2.response_type", "code".to_string()),
        ("openid.oa2.code_challenge_method", "S256".to_string()),
        ("openid.oa2.code_challenge", code_challenge.to_string()),
        ("openid.oa2.client_id", format!("device:{}", client_id)),
        ("openid.oa2.scope", "device_auth_access".to_string()),
        ("marketPlaceId", locale.marketplace_id.clone()),
        ("pageId", "amzn_audible_kindle".to_string()),
    ]
}

/// OAuth client id the provider derives device registrations from
pub fn client_id(device: &DeviceIdentity) -> String {
    hex::encode(format!("{}#{}", device.serial.as_str(), device.device_type))
}

/// Query of the legacy activation request
pub fn activation_params(device: &DeviceIdentity) -> Vec<(&'static str, String)> {
    vec![
        ("action", "register".to_string()),
        ("player_manuf", PLAYER_MANUFACTURER.to_string()),
        ("player_model", PLAYER_MODEL.to_string()),
        ("player_id", device.serial.as_str().to_string()),
        ("serial", device.serial.as_str().to_string()),
    ]
}
