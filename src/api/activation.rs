//! Legacy activation retrieval
//!
//! **GET** `{activation_base}/license/token?action=register&player_manuf=Audible,Kindle&player_model=Kindle&player_id=<serial>&serial=<serial>`
//!
//! The response body is the raw activation blob. It is returned untouched; the
//! decoder in [`crate::crypto`] owns its format.

use crate::api::auth::Session;
use crate::api::client::HttpClient;
use crate::api::wire;
use crate::config::ClientConfig;
use crate::crypto::ActivationBlob;
use crate::error::{KindlepassError, Result, Stage};
use reqwest::header::{AUTHORIZATION, COOKIE};
use tracing::info;

pub struct ActivationRetriever {
    http: HttpClient,
    base: String,
}

impl ActivationRetriever {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            // The session carries its own cookies
            http: HttpClient::new(config, false)?,
            base: config.activation_base()?,
        })
    }

    /// Request the activation blob for the session's device
    ///
    /// Consumes `session`; it is not valid for a second request.
    ///
    /// # Errors
    /// `RetrievalFailed` on a non-success status or an empty body
    pub async fn fetch_activation_blob(&self, session: Session) -> Result<ActivationBlob> {
        let url = format!("{}{}", self.base, wire::ACTIVATION_PATH);
        let params = wire::activation_params(session.device());
        let cookies = session.cookie_header();
        let bearer = format!("Bearer {}", session.access_token());

        info!(serial = %session.device().serial, "Requesting activation blob");
        let response = self
            .http
            .send(Stage::Activation, |c| {
                let request = c.get(&url).query(&params).header(AUTHORIZATION, bearer.as_str());
                match &cookies {
                    Some(cookies) => request.header(COOKIE, cookies.as_str()),
                    None => request,
                }
            })
            .await?;

        if !response.is_success() {
            return Err(KindlepassError::retrieval(
                Stage::Activation,
                Some(response.status),
                "activation request rejected",
                &response.text(),
            ));
        }
        if response.body.is_empty() {
            return Err(KindlepassError::retrieval(
                Stage::Activation,
                Some(response.status),
                "empty activation response",
                "",
            ));
        }

        info!(bytes = response.body.len(), "Received activation blob");
        Ok(ActivationBlob::new(response.body))
    }
}
