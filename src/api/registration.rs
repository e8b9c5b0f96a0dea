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


//! Device registration
//!
//! Exchanges the authorization code of a successful sign-in for device tokens.
//! The legacy activation endpoint only answers for a registered device, so this
//! is the last step of negotiation.
//!
//! # Request
//! **POST** `{api_base}/auth/register`
//!
//! ```json
//! {
//!   "requested_token_type": ["bearer", "website_cookies"],
//!   "cookies": { "website_cookies": [], "domain": ".amazon.com" },
//!   "registration_data": {
//!     "domain": "Device",
//!     "device_serial": "B0419XXXXXXXXXXX",
//!     "device_type": "A2CZJZGLK2JJVM",
//!     "device_name": "Kindle",
//!     "app_name": "Audible",
//!     "device_model": "Kindle"
//!   },
//!   "auth_data": {
//!     "client_id": "...",
//!     "authorization_code": "...",
//!     "code_verifier": "...",
//!     "code_algorithm": "SHA-256",
//!     "client_domain": "DeviceLegacy"
//!   },
//!   "requested_extensions": ["device_info", "customer_info"]
//! }
//! ```
//!
//! # Response
//! Either `response.success` with tokens and extensions, or `response.error`.

use crate::api::auth::DeviceIdentity;
use crate::api::wire;
use crate::error::{KindlepassError, Result, Stage};
use serde::Deserialize;
use serde_json::json;

/// Top level of the registration response
#[derive(Deserialize)]
pub struct RegistrationResponse {
    pub response: RegistrationResult,
}

/// `success` or `error`, never both
#[derive(Deserialize)]
pub struct RegistrationResult {
    #[serde(default)]
    pub success: Option<RegistrationSuccess>,
    #[serde(default)]
    pub error: Option<RegistrationError>,
}

#[derive(Deserialize)]
pub struct RegistrationSuccess {
    #[serde(default)]
    pub customer_id: Option<String>,
    pub tokens: Tokens,
    #[serde(default)]
    pub extensions: Extensions,
}

#[derive(Deserialize)]
pub struct Tokens {
    pub bearer: BearerToken,
    #[serde(default)]
    pub website_cookies: Vec<WebsiteCookie>,
}

#[derive(Deserialize)]
pub struct BearerToken {
    pub access_token: String,
    /// Lifetime in seconds, sent as a string
    #[serde(default)]
    pub expires_in: Option<String>,
}

impl BearerToken {
    /// Lifetime in seconds, if the provider sent a parseable value
    pub fn expires_in_secs(&self) -> Option<i64> {
        self.expires_in.as_deref().and_then(|s| s.trim().parse().ok())
    }
}

/// Cookie issued for the provider's websites
#[derive(Deserialize)]
pub struct WebsiteCookie {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Value")]
    pub value: String,
}

/// Requested `device_info` and `customer_info` echoes
#[derive(Default, Deserialize)]
pub struct Extensions {
    #[serde(default)]
    pub device_info: Option<DeviceInfo>,
    #[serde(default)]
    pub customer_info: Option<CustomerInfo>,
}

#[derive(Deserialize)]
pub struct DeviceInfo {
    #[serde(default)]
    pub device_serial_number: Option<String>,
}

#[derive(Deserialize)]
pub struct CustomerInfo {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationError {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl RegistrationResponse {
    /// Parse a response body
    ///
    /// A body that is not JSON is a provider change, not a transport error, and is
    /// reported as `RetrievalFailed` with a snippet of what came back.
    pub fn from_json(status: u16, body: &str) -> Result<Self> {
        serde_json::from_str(body).map_err(|e| {
            KindlepassError::retrieval(
                Stage::Registration,
                Some(status),
                format!("unexpected registration response: {}", e),
                body,
            )
        })
    }

    /// The success payload, or the provider's error as `RetrievalFailed`
    pub fn into_success(self, status: u16) -> Result<RegistrationSuccess> {
        match (self.response.success, self.response.error) {
            (Some(success), _) => Ok(success),
            (None, Some(error)) => Err(KindlepassError::RetrievalFailed {
                stage: Stage::Registration,
                status: Some(status),
                message: format!(
                    "provider rejected registration: {} {}",
                    error.code.as_deref().unwrap_or("unknown"),
                    error.message.as_deref().unwrap_or("")
                )
                .trim_end()
                .to_string(),
                body_snippet: None,
            }),
            (None, None) => Err(KindlepassError::RetrievalFailed {
                stage: Stage::Registration,
                status: Some(status),
                message: "registration response has neither success nor error".to_string(),
                body_snippet: None,
            }),
        }
    }
}

impl RegistrationSuccess {
    /// Account holder's name, when `customer_info` was returned
    pub fn customer_name(&self) -> Option<&str> {
        self.extensions.customer_info.as_ref()?.name.as_deref()
    }

    /// Check that the provider registered the device that was asked for
    ///
    /// A missing `device_info` echo is accepted.
    pub fn check_device(&self, device: &DeviceIdentity) -> Result<()> {
        let echoed = self
            .extensions
            .device_info
            .as_ref()
            .and_then(|info| info.device_serial_number.as_deref());
        match echoed {
            Some(serial) if !serial.trim().eq_ignore_ascii_case(device.serial.as_str()) => {
                Err(KindlepassError::RetrievalFailed {
                    stage: Stage::Registration,
                    status: None,
                    message: format!("provider registered serial {} instead of {}", serial, device.serial),
                    body_snippet: None,
                })
            }
            _ => Ok(()),
        }
    }
}

/// Body of the registration request
pub fn build_request(
    device: &DeviceIdentity,
    cookie_domain: &str,
    authorization_code: &str,
    code_verifier: &str,
) -> serde_json::Value {
    json!({
        "requested_token_type": ["bearer", "website_cookies"],
        "cookies": {
            "website_cookies": [],
            "domain": cookie_domain,
        },
        "registration_data": {
            "domain": "Device",
            "device_serial": device.serial.as_str(),
            "device_type": device.device_type,
            "device_name": device.device_name,
            "app_name": "Audible",
            "device_model": wire::PLAYER_MODEL,
        },
        "auth_data": {
            "client_id": wire::client_id(device),
            "authorization_code": authorization_code,
            "code_verifier": code_verifier,
            "code_algorithm": "SHA-256",
            "client_domain": "DeviceLegacy",
        },
        "requested_extensions": ["device_info", "customer_info"],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceSerial;

    const SUCCESS: &str = r#"{
        "response": {
            "success": {
                "customer_id": "amzn1.account.TEST",
                "tokens": {
                    "bearer": {
                        "access_token": "Atna|token",
                        "expires_in": "3600"
                    },
                    "website_cookies": [
                        {"Name": "session-id", "Value": "123-456", "Domain": ".amazon.com",
                         "Path": "/", "Secure": "true", "HttpOnly": "false"},
                        {"Name": "ubid-main", "Value": "789"}
                    ]
                },
                "extensions": {
                    "device_info": {"device_name": "Kindle", "device_serial_number": "B0419XXXXXXXXXXX"},
                    "customer_info": {"name": "Test User", "home_region": "NA"}
                }
            }
        },
        "request_id": "req-1"
    }"#;

    fn device() -> DeviceIdentity {
        DeviceIdentity {
            serial: DeviceSerial::parse("B0419XXXXXXXXXXX").unwrap(),
            device_name: "Kindle".to_string(),
            device_type: "A2CZJZGLK2JJVM".to_string(),
        }
    }

    #[test]
    fn test_parse_success() {
        let success = RegistrationResponse::from_json(200, SUCCESS)
            .unwrap()
            .into_success(200)
            .unwrap();

        assert_eq!(success.customer_id.as_deref(), Some("amzn1.account.TEST"));
        assert_eq!(success.tokens.bearer.access_token, "Atna|token");
        assert_eq!(success.tokens.bearer.expires_in_secs(), Some(3600));
        assert_eq!(success.tokens.website_cookies.len(), 2);
        assert_eq!(success.tokens.website_cookies[0].name, "session-id");
        assert_eq!(success.tokens.website_cookies[1].value, "789");
        assert_eq!(success.customer_name(), Some("Test User"));
        assert!(success.check_device(&device()).is_ok());
    }

    #[test]
    fn test_registration_for_another_device() {
        let body = SUCCESS.replace("B0419XXXXXXXXXXX", "B0080XXXXXXXXXXX");
        let success = RegistrationResponse::from_json(200, &body)
            .unwrap()
            .into_success(200)
            .unwrap();

        let err = success.check_device(&device()).unwrap_err();
        assert!(matches!(err, KindlepassError::RetrievalFailed { stage: Stage::Registration, .. }));

        let without_echo = SUCCESS.replace(r#""device_serial_number": "B0419XXXXXXXXXXX""#, r#""device_name2": "x""#);
        let success = RegistrationResponse::from_json(200, &without_echo)
            .unwrap()
            .into_success(200)
            .unwrap();
        assert!(success.check_device(&device()).is_ok());
        assert_eq!(success.customer_name(), Some("Test User"));
    }

    #[test]
    fn test_provider_error_is_retrieval_failure() {
        let body = r#"{"response":{"error":{"code":"InvalidValue","message":"bad code"}},"request_id":"x"}"#;
        let err = RegistrationResponse::from_json(400, body)
            .unwrap()
            .into_success(400)
            .err()
            .unwrap();
        match err {
            KindlepassError::RetrievalFailed { stage, status, message, .. } => {
                assert_eq!(stage, Stage::Registration);
                assert_eq!(status, Some(400));
                assert!(message.contains("InvalidValue"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_non_json_body() {
        let err = RegistrationResponse::from_json(200, "<html>maintenance</html>").err().unwrap();
        assert!(matches!(
            err,
            KindlepassError::RetrievalFailed { body_snippet: Some(ref s), .. } if s.contains("maintenance")
        ));
    }

    #[test]
    fn test_build_request() {
        let body = build_request(&device(), ".amazon.com", "CODE", "VERIFIER");
        assert_eq!(body["registration_data"]["device_serial"], "B0419XXXXXXXXXXX");
        assert_eq!(body["registration_data"]["device_type"], "A2CZJZGLK2JJVM");
        assert_eq!(body["auth_data"]["authorization_code"], "CODE");
        assert_eq!(body["auth_data"]["code_verifier"], "VERIFIER");
        assert_eq!(body["auth_data"]["client_id"], wire::client_id(&device()));
        assert_eq!(body["cookies"]["domain"], ".amazon.com");
    }
}
