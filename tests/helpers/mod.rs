//! Test helpers for mock-provider integration tests
//!
//! This module provides blob builders, canned provider pages and a `wiremock`
//! server pre-loaded with the happy-path sign-in, registration and activation
//! endpoints.

#![allow(dead_code)]

use kindlepass::api::{Credentials, DeviceIdentity, Session};
use kindlepass::config::ClientConfig;
use kindlepass::device::DeviceSerial;
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const SERIAL: &str = "B0419XXXXXXXXXXX";
pub const EMAIL: &str = "user@example.com";
pub const PASSWORD: &str = "hunter2";
pub const AUTH_CODE: &str = "ANdNAVhyhqirUelHGEHA";
pub const ACCESS_TOKEN: &str = "Atna|EwICIFakeAccessToken";

// ============================================================================
// BLOBS
// ============================================================================

/// Frame `groups` the way the activation endpoint does, followed by `padding` zero bytes
pub fn blob(groups: &[(u16, &[u8])], padding: usize) -> Vec<u8> {
    let mut section = Vec::new();
    for (tag, payload) in groups {
        section.extend_from_slice(&tag.to_be_bytes());
        section.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        section.extend_from_slice(payload);
    }

    let mut bytes = (section.len() as u32).to_be_bytes().to_vec();
    bytes.extend_from_slice(&section);
    bytes.extend(std::iter::repeat(0u8).take(padding));
    bytes
}

/// 40-byte blob: header, serial group, key group `AA BB CC DD`, 8 bytes of padding
pub fn end_to_end_blob() -> Vec<u8> {
    blob(&[(0x01, SERIAL.as_bytes()), (0x07, [0xAA, 0xBB, 0xCC, 0xDD].as_slice())], 8)
}

/// Framed length of [`end_to_end_blob`] without padding
pub const END_TO_END_LICENSE_LEN: usize = 32;

// ============================================================================
// PROVIDER PAGES
// ============================================================================

pub fn signin_page() -> String {
    r#"<html><head><title>Amazon Sign-In</title></head><body>
        <form name="signIn" method="post" action="/ap/signin">
          <input type="hidden" name="appActionToken" value="pj2FakeToken">
          <input type="hidden" name="workflowState" value="eyJ6aXAiOiJ">
          <input type="email" name="email">
          <input type="password" name="password">
          <input type="submit" id="signInSubmit">
        </form>
    </body></html>"#
        .to_string()
}

pub fn error_page() -> String {
    r#"<html><body>
        <div id="auth-error-message-box" class="a-box a-alert a-alert-error">
          <div class="a-box-inner"><h4 class="a-alert-heading">There was a problem</h4>
          <span>Your password is incorrect</span></div>
        </div>
        <form name="signIn" method="post" action="/ap/signin">
          <input type="hidden" name="appActionToken" value="pj2FakeToken">
        </form>
    </body></html>"#
        .to_string()
}

pub fn captcha_page() -> String {
    r#"<html><body>
        <form name="signIn" method="post" action="/ap/signin">
          <input type="hidden" name="appActionToken" value="pj2FakeToken">
          <input type="hidden" name="use_image_captcha" value="true">
          <img id="auth-captcha-image" src="/captcha/image.jpg" alt="Visual CAPTCHA image">
          <input type="text" name="guess">
        </form>
    </body></html>"#
        .to_string()
}

/// Sign-in page after a wrong CAPTCHA guess: error box plus a new image
pub fn wrong_captcha_page() -> String {
    r#"<html><body>
        <div id="auth-error-message-box" class="a-box a-alert a-alert-error">
          <div class="a-box-inner"><h4 class="a-alert-heading">There was a problem</h4>
          <span>Enter the characters as they are given in the challenge.</span></div>
        </div>
        <form name="signIn" method="post" action="/ap/signin">
          <input type="hidden" name="appActionToken" value="pj2FakeToken2">
          <input type="hidden" name="use_image_captcha" value="true">
          <img id="auth-captcha-image" src="/captcha/image2.jpg" alt="Visual CAPTCHA image">
          <input type="text" name="guess">
        </form>
    </body></html>"#
        .to_string()
}

pub fn mfa_page() -> String {
    r#"<html><body>
        <form id="auth-mfa-form" method="post" action="/ap/mfa">
          <input type="hidden" name="mfaToken" value="mfa-123">
          <p>Enter the OTP from the authenticator app</p>
          <input type="tel" name="otpCode">
        </form>
    </body></html>"#
        .to_string()
}

pub fn claims_picker_page() -> String {
    r#"<html><body>
        <form name="claimspicker" method="post" action="/ap/cvf/verify">
          <input type="hidden" name="arb" value="arb-1">
          <h1>Verification needed</h1>
          <label><input type="radio" name="option" value="email"> Email u***@example.com</label>
          <label><input type="radio" name="option" value="sms"> Text +1 ***-***-0142</label>
        </form>
    </body></html>"#
        .to_string()
}

pub fn verification_code_page() -> String {
    r#"<html><body>
        <form id="verification-code-form" method="post" action="/ap/cvf/code">
          <input type="hidden" name="arb" value="arb-2">
          <p>We sent a code to +1 ***-***-0142</p>
          <input type="text" name="code">
        </form>
    </body></html>"#
        .to_string()
}

/// `302` to the success landing page carrying the authorization code
pub fn success_redirect() -> ResponseTemplate {
    ResponseTemplate::new(302).insert_header(
        "Location",
        format!("/ap/maplanding?openid.oa2.authorization_code={}&openid.mode=id_res", AUTH_CODE).as_str(),
    )
}

pub fn html(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("Content-Type", "text/html; charset=UTF-8")
        .set_body_string(body)
}

pub fn registration_success() -> serde_json::Value {
    serde_json::json!({
        "response": {
            "success": {
                "customer_id": "amzn1.account.AFAKECUSTOMER",
                "tokens": {
                    "bearer": {
                        "access_token": ACCESS_TOKEN,
                        "expires_in": "3600"
                    },
                    "website_cookies": [
                        {"Name": "session-id", "Value": "139-0000000-0000000", "Domain": ".amazon.com", "Path": "/"},
                        {"Name": "x-main", "Value": "\"FakeXMain\"", "Domain": ".amazon.com", "Path": "/"}
                    ]
                },
                "extensions": {
                    "device_info": {"device_name": "Kindle", "device_serial_number": SERIAL, "device_type": "A2CZJZGLK2JJVM"},
                    "customer_info": {"name": "Test User", "given_name": "Test", "home_region": "NA"}
                }
            }
        },
        "request_id": "f00dfeed"
    })
}

// ============================================================================
// MOCK PROVIDER
// ============================================================================

/// Client config pointing every endpoint at `server`
pub fn config(server: &MockServer) -> ClientConfig {
    ClientConfig::with_base_url(&server.uri())
}

pub fn credentials() -> Credentials {
    Credentials::new(EMAIL, PASSWORD).unwrap()
}

pub fn serial() -> DeviceSerial {
    DeviceSerial::parse(SERIAL).unwrap()
}

/// Session for retriever tests that skip negotiation
pub fn session(config: &ClientConfig) -> Session {
    Session::from_tokens(
        DeviceIdentity::new(serial(), config),
        ACCESS_TOKEN,
        vec![("session-id".to_string(), "139-0000000-0000000".to_string())],
    )
}

pub async fn mount_signin_page(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/ap/signin"))
        .respond_with(html(signin_page()))
        .mount(server)
        .await;
}

/// Correct credentials redirect straight to the landing page
pub async fn mount_credentials_success(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/ap/signin"))
        .and(body_string_contains("password=hunter2"))
        .and(body_string_contains("appActionToken=pj2FakeToken"))
        .respond_with(success_redirect())
        .mount(server)
        .await;
}

pub async fn mount_registration(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/auth/register"))
        .and(body_string_contains(format!("\"authorization_code\":\"{}\"", AUTH_CODE)))
        .and(body_string_contains("\"code_verifier\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(registration_success()))
        .mount(server)
        .await;
}

pub async fn mount_activation(server: &MockServer, body: Vec<u8>) {
    Mock::given(method("GET"))
        .and(path("/license/token"))
        .and(query_param("action", "register"))
        .and(query_param("player_manuf", "Audible,Kindle"))
        .and(query_param("serial", SERIAL))
        .and(header("Authorization", format!("Bearer {}", ACCESS_TOKEN).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .mount(server)
        .await;
}

/// Sign-in, registration and activation all succeed without challenges
pub async fn happy_provider() -> MockServer {
    let server = MockServer::start().await;
    mount_signin_page(&server).await;
    mount_credentials_success(&server).await;
    mount_registration(&server).await;
    mount_activation(&server, end_to_end_blob()).await;
    server
}

// ============================================================================
// OUTPUT
// ============================================================================

/// Print a section header
pub fn print_header(title: &str) {
    println!("\n{}", "=".repeat(60));
    println!("{}", title);
    println!("{}", "=".repeat(60));
}

/// Pretty print a table row
pub fn print_row(label: &str, value: &str) {
    println!("   {:25} {}", format!("{}:", label), value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_end_to_end_blob_shape() {
        let bytes = end_to_end_blob();
        assert_eq!(bytes.len(), 40);
        assert_eq!(&bytes[..4], &[0, 0, 0, 28]);
        assert_eq!(&bytes[24..32], &[0x00, 0x07, 0x00, 0x04, 0xAA, 0xBB, 0xCC, 0xDD]);
        assert!(bytes[END_TO_END_LICENSE_LEN..].iter().all(|b| *b == 0));
    }
}
