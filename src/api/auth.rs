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


//! Session negotiation with the identity provider
//!
//! # Flow
//!
//! 1. GET the sign-in page (PKCE `code_challenge` in the query)
//! 2. POST the sign-in form: hidden fields, `email`, `password`
//! 3. Classify the answer:
//!    - redirect carrying `openid.oa2.authorization_code` → register the device
//!    - challenge page → [`NegotiationOutcome::Challenge`], wait for [`SessionNegotiator::resolve`]
//!    - error box → `InvalidCredentials`, anything unknown → `UnsupportedChallenge`
//! 4. POST `/auth/register` with the code and the PKCE verifier → [`Session`]
//!
//! # States
//!
//! ```text
//! Started ──negotiate──► AwaitingChallengeResponse ──resolve──► (again, or)
//!    │                          │                                Authenticated
//!    └──────────────────────────┴──────── terminal error ──────► Failed
//! ```
//!
//! A challenge is returned to the caller instead of being answered through a
//! callback, so the caller may take as long as it wants, or drop the negotiator
//! to cancel.

use crate::api::client::{HttpClient, ProviderResponse};
use crate::api::html::{self, HtmlForm};
use crate::api::registration::{build_request, RegistrationResponse};
use crate::api::wire;
use crate::config::{ClientConfig, Locale};
use crate::device::DeviceSerial;
use crate::error::{KindlepassError, Result, Stage};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use tracing::{debug, info, warn};
use url::Url;

/// Redirects followed on the provider's own host before giving up
const MAX_REDIRECTS: usize = 8;

/// Longest prompt text taken from a challenge page
const MAX_PROMPT_LEN: usize = 300;

// ============================================================================
// CREDENTIALS
// ============================================================================

/// Account e-mail and password
///
/// Held only for one negotiation attempt. Not `Clone`, and `Debug` never
/// prints the password.
pub struct Credentials {
    email: String,
    password: String,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Result<Self> {
        let email = email.into().trim().to_string();
        let password = password.into();

        if email.is_empty() {
            return Err(KindlepassError::InvalidInput("email must not be empty".to_string()));
        }
        if password.is_empty() {
            return Err(KindlepassError::InvalidInput("password must not be empty".to_string()));
        }

        Ok(Self { email, password })
    }

    pub fn email(&self) -> &str {
        &self.email
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

// ============================================================================
// DEVICE IDENTITY
// ============================================================================

/// What the provider registers: serial, display name and device type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub serial: DeviceSerial,
    pub device_name: String,
    pub device_type: String,
}

impl DeviceIdentity {
    pub fn new(serial: DeviceSerial, config: &ClientConfig) -> Self {
        Self {
            serial,
            device_name: config.device_name.clone(),
            device_type: config.device_type.clone(),
        }
    }
}

// ============================================================================
// SESSION
// ============================================================================

/// Authenticated, registered session
///
/// Move-only: the activation retriever consumes it, and a second retrieval
/// needs a new negotiation.
pub struct Session {
    cookies: Vec<(String, String)>,
    access_token: String,
    customer_id: Option<String>,
    device: DeviceIdentity,
    customer_name: Option<String>,
    obtained_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Session from tokens obtained outside the negotiator
    pub fn from_tokens(device: DeviceIdentity, access_token: impl Into<String>, cookies: Vec<(String, String)>) -> Self {
        Self {
            cookies,
            access_token: access_token.into(),
            customer_id: None,
            device,
            customer_name: None,
            obtained_at: Utc::now(),
            expires_at: None,
        }
    }

    pub fn device(&self) -> &DeviceIdentity {
        &self.device
    }

    pub fn customer_id(&self) -> Option<&str> {
        self.customer_id.as_deref()
    }

    /// Account holder's name as returned by registration
    pub fn customer_name(&self) -> Option<&str> {
        self.customer_name.as_deref()
    }

    pub fn obtained_at(&self) -> DateTime<Utc> {
        self.obtained_at
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.map(|at| at <= Utc::now()).unwrap_or(false)
    }

    pub fn cookie_count(&self) -> usize {
        self.cookies.len()
    }

    /// `Cookie` header value
    pub(crate) fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        Some(
            self.cookies
                .iter()
                .map(|(name, value)| format!("{}={}", name, value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    pub(crate) fn access_token(&self) -> &str {
        &self.access_token
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("device", &self.device)
            .field("customer_id", &self.customer_id)
            .field("access_token", &"<redacted>")
            .field("cookies", &self.cookies.len())
            .field("obtained_at", &self.obtained_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

// ============================================================================
// CHALLENGES
// ============================================================================

/// One of the options a verification-method picker offers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationOption {
    /// Value to answer with
    pub value: String,
    /// Text shown next to the option (masked e-mail, phone number)
    pub label: String,
}

/// An intermediate verification step the provider demands
#[derive(Clone, PartialEq, Eq)]
pub enum Challenge {
    /// Distorted text image; the answer is the text
    ///
    /// After a wrong guess `prompt` carries the provider's error message.
    Captcha {
        image: Vec<u8>,
        image_url: String,
        prompt: String,
        field: String,
    },

    /// Code from an authenticator app, e-mail or SMS
    OneTimePasscode { prompt: String, field: String },

    /// Where the provider should send a code; the answer is an option's `value`
    ChooseVerificationMethod {
        prompt: String,
        options: Vec<VerificationOption>,
        field: String,
    },

    /// The provider sent the browser somewhere this client cannot follow.
    /// The answer is the final URL reached after completing the step in a browser.
    UnexpectedRedirect { url: String, field: String },
}

impl Challenge {
    /// Provider field the answer is submitted under
    pub fn field(&self) -> &str {
        match self {
            Challenge::Captcha { field, .. }
            | Challenge::OneTimePasscode { field, .. }
            | Challenge::ChooseVerificationMethod { field, .. }
            | Challenge::UnexpectedRedirect { field, .. } => field,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Challenge::Captcha { .. } => "captcha",
            Challenge::OneTimePasscode { .. } => "one-time passcode",
            Challenge::ChooseVerificationMethod { .. } => "verification method",
            Challenge::UnexpectedRedirect { .. } => "unexpected redirect",
        }
    }
}

impl fmt::Debug for Challenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Challenge::Captcha {
                image,
                image_url,
                prompt,
                field,
            } => f
                .debug_struct("Captcha")
                .field("image", &format_args!("{} bytes", image.len()))
                .field("image_url", image_url)
                .field("prompt", prompt)
                .field("field", field)
                .finish(),
            Challenge::OneTimePasscode { prompt, field } => f
                .debug_struct("OneTimePasscode")
                .field("prompt", prompt)
                .field("field", field)
                .finish(),
            Challenge::ChooseVerificationMethod { prompt, options, field } => f
                .debug_struct("ChooseVerificationMethod")
                .field("prompt", prompt)
                .field("options", options)
                .field("field", field)
                .finish(),
            Challenge::UnexpectedRedirect { url, field } => f
                .debug_struct("UnexpectedRedirect")
                .field("url", url)
                .field("field", field)
                .finish(),
        }
    }
}

/// A challenge plus the sequence number the answer must match
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeRequest {
    challenge: Challenge,
    sequence: u64,
}

impl ChallengeRequest {
    pub fn challenge(&self) -> &Challenge {
        &self.challenge
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

#[derive(Debug)]
pub enum NegotiationOutcome {
    Authenticated(Session),
    Challenge(ChallengeRequest),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Started,
    AwaitingChallengeResponse,
    Authenticated,
    Failed,
}

// ============================================================================
// PKCE
// ============================================================================

/// Proof key for the authorization code exchange (S256)
pub(crate) struct Pkce {
    verifier: String,
    challenge: String,
}

impl Pkce {
    pub(crate) fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self::from_verifier(URL_SAFE_NO_PAD.encode(bytes))
    }

    pub(crate) fn from_verifier(verifier: String) -> Self {
        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
        Self { verifier, challenge }
    }
}

// ============================================================================
// NEGOTIATOR
// ============================================================================

/// Data of one negotiation attempt, dropped when it ends
struct Attempt {
    credentials: Credentials,
    device: DeviceIdentity,
    pkce: Pkce,
}

/// What is needed to submit the answer to the current challenge
struct PendingChallenge {
    sequence: u64,
    field: String,
    /// Form to post to; `None` for a redirect completed in a browser
    action: Option<Url>,
    hidden: Vec<(String, String)>,
    /// Sign-in form CAPTCHAs are re-submitted with the credentials
    with_credentials: bool,
    /// Accepted answers, for option pickers
    allowed: Option<Vec<String>>,
}

/// Result of classifying one provider answer
enum Step {
    Code(String),
    Challenge(Challenge, PendingChallenge),
}

/// Drives one sign-in against the identity provider
pub struct SessionNegotiator {
    http: HttpClient,
    config: ClientConfig,
    locale: Locale,
    auth_base: Url,
    api_base: String,
    state: NegotiationState,
    attempt: Option<Attempt>,
    pending: Option<PendingChallenge>,
    next_sequence: u64,
}

impl SessionNegotiator {
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let locale = config.locale()?;
        let auth_base = Url::parse(&config.auth_base()?)
            .map_err(|e| KindlepassError::Config(format!("Invalid auth base URL: {}", e)))?;
        let api_base = config.api_base()?;
        let http = HttpClient::new(&config, true)?;

        Ok(Self {
            http,
            config,
            locale,
            auth_base,
            api_base,
            state: NegotiationState::Started,
            attempt: None,
            pending: None,
            next_sequence: 1,
        })
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Sign in and register `serial`
    ///
    /// # Errors
    /// `InvalidState` unless the negotiator is fresh; otherwise any terminal
    /// error, after which the negotiator is `Failed`.
    pub async fn negotiate(&mut self, credentials: Credentials, serial: DeviceSerial) -> Result<NegotiationOutcome> {
        if self.state != NegotiationState::Started {
            return Err(KindlepassError::InvalidState(format!(
                "negotiate called in state {:?}",
                self.state
            )));
        }

        info!(serial = %serial, locale = %self.locale.country_code, "Starting negotiation");
        self.attempt = Some(Attempt {
            credentials,
            device: DeviceIdentity::new(serial, &self.config),
            pkce: Pkce::generate(),
        });

        let step = self.sign_in().await;
        self.advance(step).await
    }

    /// Answer the pending challenge
    ///
    /// # Errors
    /// `InvalidState` when no challenge is pending or `request` is stale, and
    /// `InvalidInput` for an empty answer or an option that was not offered.
    /// Neither changes the state.
    pub async fn resolve(&mut self, request: &ChallengeRequest, response: &str) -> Result<NegotiationOutcome> {
        if self.state != NegotiationState::AwaitingChallengeResponse {
            return Err(KindlepassError::InvalidState(format!(
                "resolve called in state {:?}",
                self.state
            )));
        }
        let pending = self
            .pending
            .as_ref()
            .ok_or_else(|| KindlepassError::InvalidState("no challenge pending".to_string()))?;
        if pending.sequence != request.sequence {
            return Err(KindlepassError::InvalidState(format!(
                "stale challenge {} (pending is {})",
                request.sequence, pending.sequence
            )));
        }

        let answer = response.trim();
        if answer.is_empty() {
            return Err(KindlepassError::InvalidInput("challenge response must not be empty".to_string()));
        }
        if let Some(allowed) = &pending.allowed {
            if !allowed.iter().any(|v| v == answer) {
                return Err(KindlepassError::InvalidInput(format!(
                    "{:?} is not one of the offered options",
                    answer
                )));
            }
        }
        let redirect_target = match pending.action {
            Some(_) => None,
            None => Some(
                Url::parse(answer).map_err(|e| KindlepassError::InvalidInput(format!("not a URL: {}", e)))?,
            ),
        };

        let Some(pending) = self.pending.take() else {
            return Err(KindlepassError::InvalidState("no challenge pending".to_string()));
        };
        debug!(sequence = pending.sequence, field = %pending.field, "Resolving challenge");

        let step = match (redirect_target, pending.action.clone()) {
            (Some(target), _) => match authorization_code(&target) {
                Some(code) => Ok(Step::Code(code)),
                None => Err(KindlepassError::UnsupportedChallenge {
                    stage: Stage::Challenge,
                    detail: "redirect URL carries no authorization code".to_string(),
                }),
            },
            (None, Some(action)) => self.submit_challenge(&pending, action, answer).await,
            (None, None) => Err(KindlepassError::InvalidState("challenge has no form".to_string())),
        };

        self.advance(step).await
    }

    /// Give up on the current attempt
    pub fn abandon(&mut self) {
        if self.state != NegotiationState::Authenticated {
            info!(state = ?self.state, "Negotiation abandoned");
            self.fail();
        }
    }

    fn fail(&mut self) {
        self.state = NegotiationState::Failed;
        self.attempt = None;
        self.pending = None;
    }

    fn attempt(&self) -> Result<&Attempt> {
        self.attempt
            .as_ref()
            .ok_or_else(|| KindlepassError::InvalidState("no negotiation in progress".to_string()))
    }

    /// Apply a classified step to the state machine
    async fn advance(&mut self, step: Result<Step>) -> Result<NegotiationOutcome> {
        let result = match step {
            Ok(Step::Code(code)) => self.register(&code).await.map(NegotiationOutcome::Authenticated),
            Ok(Step::Challenge(challenge, mut pending)) => {
                let sequence = self.next_sequence;
                self.next_sequence += 1;
                pending.sequence = sequence;
                self.pending = Some(pending);
                Ok(NegotiationOutcome::Challenge(ChallengeRequest { challenge, sequence }))
            }
            Err(e) => Err(e),
        };

        match &result {
            Ok(NegotiationOutcome::Authenticated(_)) => {
                info!("Negotiation complete");
                self.state = NegotiationState::Authenticated;
                self.attempt = None;
                self.pending = None;
            }
            Ok(NegotiationOutcome::Challenge(request)) => {
                info!(kind = request.challenge.kind(), sequence = request.sequence, "Provider requires a challenge");
                self.state = NegotiationState::AwaitingChallengeResponse;
            }
            Err(e) => {
                warn!(stage = ?e.stage(), error = %e, "Negotiation failed");
                self.fail();
            }
        }
        result
    }

    // ------------------------------------------------------------------
    // Provider exchanges
    // ------------------------------------------------------------------

    async fn sign_in(&self) -> Result<Step> {
        let attempt = self.attempt()?;
        let return_to = self.endpoint(wire::RETURN_TO_PATH)?;
        let client_id = wire::client_id(&attempt.device);
        let params = wire::signin_params(&self.locale, return_to.as_str(), &client_id, &attempt.pkce.challenge);
        let signin_url = Url::parse_with_params(self.endpoint(wire::SIGNIN_PATH)?.as_str(), &params)
            .map_err(|e| KindlepassError::Config(format!("Invalid sign-in URL: {}", e)))?;

        let page = self
            .http
            .send(Stage::LoginPage, |c| c.get(signin_url.clone()))
            .await?;
        let page = self.follow_redirects(page, Stage::LoginPage).await?;
        if !page.is_success() {
            return Err(KindlepassError::retrieval(
                Stage::LoginPage,
                Some(page.status),
                "unexpected status",
                &page.text(),
            ));
        }

        let html = page.text();
        let form = html::find_form(&html, wire::SIGNIN_FORM).ok_or_else(|| KindlepassError::UnsupportedChallenge {
            stage: Stage::LoginPage,
            detail: "sign-in form not found".to_string(),
        })?;
        let action = form_action(&form, &page.url)?;

        let mut fields = form.hidden_fields();
        push_credentials(&mut fields, &attempt.credentials);

        debug!(action = %action, fields = fields.len(), "Submitting credentials");
        let response = self
            .http
            .send(Stage::Credentials, |c| c.post(action.clone()).form(&fields))
            .await?;

        self.classify(response, Stage::Credentials).await
    }

    async fn submit_challenge(&self, pending: &PendingChallenge, action: Url, answer: &str) -> Result<Step> {
        let attempt = self.attempt()?;

        let mut fields = pending.hidden.clone();
        fields.push((pending.field.clone(), answer.to_string()));
        if pending.with_credentials {
            push_credentials(&mut fields, &attempt.credentials);
        }

        let response = self
            .http
            .send(Stage::Challenge, |c| c.post(action.clone()).form(&fields))
            .await?;

        self.classify(response, Stage::Challenge).await
    }

    /// Follow redirects that stay on the provider's host
    ///
    /// Stops at the first page, at the success redirect, or at a redirect to
    /// another host.
    async fn follow_redirects(&self, response: ProviderResponse, stage: Stage) -> Result<ProviderResponse> {
        let mut response = response;
        let mut hops = 0;
        while response.is_redirect() {
            let target = redirect_target(&response, stage)?;
            if authorization_code(&target).is_some() || !same_origin(&target, &self.auth_base) {
                break;
            }

            hops += 1;
            if hops > MAX_REDIRECTS {
                return Err(KindlepassError::retrieval(
                    stage,
                    Some(response.status),
                    format!("more than {} redirects", MAX_REDIRECTS),
                    "",
                ));
            }
            debug!(%stage, path = target.path(), "Following redirect");
            response = self.http.send(stage, |c| c.get(target.clone())).await?;
        }
        Ok(response)
    }

    /// Turn a provider answer into the authorization code or a challenge
    async fn classify(&self, response: ProviderResponse, stage: Stage) -> Result<Step> {
        if let Some(code) = authorization_code(&response.url) {
            return Ok(Step::Code(code));
        }

        let response = self.follow_redirects(response, stage).await?;
        if response.is_redirect() {
            let target = redirect_target(&response, stage)?;
            if let Some(code) = authorization_code(&target) {
                debug!(%stage, "Received authorization code");
                return Ok(Step::Code(code));
            }

            warn!(%stage, host = target.host_str().unwrap_or(""), "Redirected off the provider host");
            let pending = PendingChallenge {
                sequence: 0,
                field: wire::FIELD_REDIRECT_URL.to_string(),
                action: None,
                hidden: Vec::new(),
                with_credentials: false,
                allowed: None,
            };
            let challenge = Challenge::UnexpectedRedirect {
                url: target.to_string(),
                field: wire::FIELD_REDIRECT_URL.to_string(),
            };
            return Ok(Step::Challenge(challenge, pending));
        }

        if !response.is_success() {
            return Err(KindlepassError::retrieval(
                stage,
                Some(response.status),
                "unexpected status",
                &response.text(),
            ));
        }

        self.classify_page(&response, stage).await
    }

    /// Recognise the challenge a provider page asks for
    async fn classify_page(&self, response: &ProviderResponse, stage: Stage) -> Result<Step> {
        let html = response.text();
        // A wrong CAPTCHA guess comes back with the error box and a new image
        let error = html
            .contains(wire::MARKER_AUTH_ERROR)
            .then(|| html::text_after_id(&html, wire::MARKER_AUTH_ERROR));

        if let Some(src) = html::attribute_of_id(&html, wire::MARKER_CAPTCHA_IMAGE, "src") {
            let form = html::find_form(&html, wire::SIGNIN_FORM)
                .or_else(|| html::find_form_with_input(&html, wire::FIELD_CAPTCHA_GUESS));
            return self
                .captcha(response, form, &src, wire::FIELD_CAPTCHA_GUESS, true, error.flatten())
                .await;
        }

        if let Some(form) = html::find_form_with_input(&html, wire::FIELD_CVF_CAPTCHA) {
            let src = form.first_image_src().ok_or_else(|| KindlepassError::UnsupportedChallenge {
                stage,
                detail: "captcha page without an image".to_string(),
            })?;
            return self
                .captcha(response, Some(form), &src, wire::FIELD_CVF_CAPTCHA, false, error.flatten())
                .await;
        }

        if let Some(message) = error {
            let message = message.unwrap_or_else(|| "the provider rejected the sign-in".to_string());
            return Err(KindlepassError::InvalidCredentials { message });
        }

        if let Some(form) = html::find_form(&html, wire::MARKER_MFA_FORM) {
            return self.passcode(response, &form, wire::FIELD_OTP, "Enter the code from your authenticator app");
        }

        if let Some(form) = html::find_form(&html, wire::MARKER_CLAIMS_PICKER) {
            let options: Vec<VerificationOption> = form
                .radio_options(wire::FIELD_CLAIM_OPTION)
                .into_iter()
                .map(|o| VerificationOption {
                    value: o.value,
                    label: o.label,
                })
                .collect();
            if options.is_empty() {
                return Err(KindlepassError::UnsupportedChallenge {
                    stage,
                    detail: "verification method picker without options".to_string(),
                });
            }

            let pending = PendingChallenge {
                sequence: 0,
                field: wire::FIELD_CLAIM_OPTION.to_string(),
                action: Some(form_action(&form, &response.url)?),
                hidden: form.hidden_fields(),
                with_credentials: false,
                allowed: Some(options.iter().map(|o| o.value.clone()).collect()),
            };
            let challenge = Challenge::ChooseVerificationMethod {
                prompt: prompt_text(&form, "Choose where to receive a verification code"),
                options,
                field: wire::FIELD_CLAIM_OPTION.to_string(),
            };
            return Ok(Step::Challenge(challenge, pending));
        }

        if let Some(form) = html::find_form(&html, wire::MARKER_VERIFY_FORM) {
            return self.passcode(response, &form, wire::FIELD_VERIFY_CODE, "Enter the verification code you received");
        }

        Err(KindlepassError::UnsupportedChallenge {
            stage,
            detail: format!("unrecognised page at {}", response.url.path()),
        })
    }

    async fn captcha(
        &self,
        response: &ProviderResponse,
        form: Option<HtmlForm>,
        src: &str,
        field: &str,
        with_credentials: bool,
        error: Option<String>,
    ) -> Result<Step> {
        let form = form.ok_or_else(|| KindlepassError::UnsupportedChallenge {
            stage: Stage::Challenge,
            detail: "captcha without a form".to_string(),
        })?;
        let image_url = response
            .url
            .join(src)
            .map_err(|e| KindlepassError::InvalidInput(format!("invalid captcha URL: {}", e)))?;

        let image = self
            .http
            .send(Stage::Challenge, |c| c.get(image_url.clone()))
            .await?;
        if !image.is_success() || image.body.is_empty() {
            return Err(KindlepassError::retrieval(
                Stage::Challenge,
                Some(image.status),
                "could not load captcha image",
                "",
            ));
        }

        let pending = PendingChallenge {
            sequence: 0,
            field: field.to_string(),
            action: Some(form_action(&form, &response.url)?),
            hidden: form.hidden_fields(),
            with_credentials,
            allowed: None,
        };
        if let Some(message) = &error {
            debug!(%message, "Provider rejected the previous CAPTCHA answer");
        }
        let challenge = Challenge::Captcha {
            image: image.body,
            image_url: image_url.to_string(),
            prompt: error.unwrap_or_else(|| "Enter the characters shown in the image".to_string()),
            field: field.to_string(),
        };
        Ok(Step::Challenge(challenge, pending))
    }

    fn passcode(&self, response: &ProviderResponse, form: &HtmlForm, field: &str, fallback: &str) -> Result<Step> {
        let pending = PendingChallenge {
            sequence: 0,
            field: field.to_string(),
            action: Some(form_action(form, &response.url)?),
            hidden: form.hidden_fields(),
            with_credentials: false,
            allowed: None,
        };
        let challenge = Challenge::OneTimePasscode {
            prompt: prompt_text(form, fallback),
            field: field.to_string(),
        };
        Ok(Step::Challenge(challenge, pending))
    }

    /// Exchange the authorization code for device tokens
    async fn register(&self, code: &str) -> Result<Session> {
        let attempt = self.attempt()?;
        let url = format!("{}{}", self.api_base, wire::REGISTER_PATH);
        let cookie_domain = format!(".amazon.{}", self.locale.amazon_domain);
        let body = build_request(&attempt.device, &cookie_domain, code, &attempt.pkce.verifier);

        let response = self
            .http
            .send(Stage::Registration, |c| c.post(&url).json(&body))
            .await?;
        let text = response.text();

        let success = RegistrationResponse::from_json(response.status, &text)?.into_success(response.status)?;
        if !response.is_success() {
            return Err(KindlepassError::retrieval(
                Stage::Registration,
                Some(response.status),
                "unexpected status",
                &text,
            ));
        }
        success.check_device(&attempt.device)?;
        let customer_name = success.customer_name().map(str::to_string);

        let obtained_at = Utc::now();
        let expires_at = success
            .tokens
            .bearer
            .expires_in_secs()
            .map(|secs| obtained_at + chrono::Duration::seconds(secs));
        let cookies = success
            .tokens
            .website_cookies
            .iter()
            .map(|c| (c.name.clone(), c.value.trim_matches('"').to_string()))
            .collect::<Vec<_>>();

        info!(
            serial = %attempt.device.serial,
            cookies = cookies.len(),
            has_customer_id = success.customer_id.is_some(),
            "Device registered"
        );

        Ok(Session {
            cookies,
            access_token: success.tokens.bearer.access_token,
            customer_id: success.customer_id,
            device: attempt.device.clone(),
            customer_name,
            obtained_at,
            expires_at,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.auth_base
            .join(path)
            .map_err(|e| KindlepassError::Config(format!("Invalid endpoint {}: {}", path, e)))
    }
}

// ============================================================================
// HELPERS
// ============================================================================

fn push_credentials(fields: &mut Vec<(String, String)>, credentials: &Credentials) {
    fields.retain(|(name, _)| name != wire::FIELD_EMAIL && name != wire::FIELD_PASSWORD);
    fields.push((wire::FIELD_EMAIL.to_string(), credentials.email.clone()));
    fields.push((wire::FIELD_PASSWORD.to_string(), credentials.password.clone()));
}

fn form_action(form: &HtmlForm, page: &Url) -> Result<Url> {
    match form.action() {
        Some(action) => page
            .join(action)
            .map_err(|e| KindlepassError::UnsupportedChallenge {
                stage: Stage::Challenge,
                detail: format!("form action {:?} is not a URL: {}", action, e),
            }),
        None => Ok(page.clone()),
    }
}

fn prompt_text(form: &HtmlForm, fallback: &str) -> String {
    let text: String = form.text().chars().take(MAX_PROMPT_LEN).collect();
    if text.is_empty() {
        fallback.to_string()
    } else {
        text
    }
}

fn redirect_target(response: &ProviderResponse, stage: Stage) -> Result<Url> {
    let location = response.location.as_deref().ok_or_else(|| {
        KindlepassError::retrieval(stage, Some(response.status), "redirect without Location", "")
    })?;
    response.url.join(location).map_err(|e| {
        KindlepassError::retrieval(
            stage,
            Some(response.status),
            format!("invalid redirect target {:?}: {}", location, e),
            "",
        )
    })
}

/// Authorization code carried by a success redirect
fn authorization_code(url: &Url) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k == wire::AUTH_CODE_PARAM)
        .map(|(_, v)| v.into_owned())
        .filter(|v| !v.is_empty())
}

fn same_origin(a: &Url, b: &Url) -> bool {
    a.scheme() == b.scheme() && a.host_str() == b.host_str() && a.port_or_known_default() == b.port_or_known_default()
}
