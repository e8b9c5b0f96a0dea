//! HTTP transport shared by the negotiator and the retriever
//!
//! Redirects are never followed automatically; the negotiator needs to see the
//! `Location` of the success redirect. Timeouts, connect errors and 5xx responses
//! are retried with linear backoff (`attempt * retry_backoff`) up to
//! `max_retries` times, then escalated to `RetrievalFailed`.

use crate::config::ClientConfig;
use crate::error::{KindlepassError, Result, Stage};
use reqwest::header::LOCATION;
use reqwest::redirect::Policy;
use reqwest::{Client, RequestBuilder};
use std::time::Duration;
use tracing::{debug, warn};

/// Response read fully into memory
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    /// URL the request was sent to
    pub url: url::Url,
    pub status: u16,
    /// Raw `Location` header, if any
    pub location: Option<String>,
    pub body: Vec<u8>,
}

impl ProviderResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// reqwest client plus the retry policy
pub struct HttpClient {
    client: Client,
    max_retries: u32,
    backoff: Duration,
}

impl HttpClient {
    /// Build a client; `cookie_store` keeps provider cookies between requests
    pub fn new(config: &ClientConfig, cookie_store: bool) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .timeout(config.request_timeout())
            .redirect(Policy::none())
            .cookie_store(cookie_store)
            .build()?;

        Ok(Self {
            client,
            max_retries: config.max_retries,
            backoff: config.retry_backoff(),
        })
    }

    /// Send a request, retrying transient failures
    ///
    /// `build` is called once per attempt because request bodies cannot be replayed.
    pub async fn send<F>(&self, stage: Stage, build: F) -> Result<ProviderResponse>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;

            let failure = match build(&self.client).send().await {
                Ok(response) => {
                    let url = response.url().clone();
                    let status = response.status().as_u16();
                    let location = response
                        .headers()
                        .get(LOCATION)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);

                    match response.bytes().await {
                        Ok(body) if status < 500 => {
                            debug!(%stage, status, bytes = body.len(), "Provider response");
                            return Ok(ProviderResponse {
                                url,
                                status,
                                location,
                                body: body.to_vec(),
                            });
                        }
                        Ok(body) => Transient {
                            status: Some(status),
                            message: format!("server error {}", status),
                            body: String::from_utf8_lossy(&body).into_owned(),
                        },
                        Err(e) => Transient {
                            status: Some(status),
                            message: format!("failed to read body: {}", e),
                            body: String::new(),
                        },
                    }
                }
                Err(e) if e.is_timeout() || e.is_connect() => Transient {
                    status: None,
                    message: e.to_string(),
                    body: String::new(),
                },
                Err(e) => return Err(KindlepassError::Http(e)),
            };

            let error = KindlepassError::TransientNetwork {
                stage,
                attempt,
                message: failure.message.clone(),
            };

            if attempt > self.max_retries {
                warn!(%stage, attempt, "Giving up after transient failures");
                return Err(KindlepassError::retrieval(
                    stage,
                    failure.status,
                    format!("gave up after {} attempts: {}", attempt, failure.message),
                    &failure.body,
                ));
            }

            let delay = self.backoff * attempt;
            warn!(%stage, attempt, delay_ms = delay.as_millis() as u64, error = %error, "Retrying");
            tokio::time::sleep(delay).await;
        }
    }
}

struct Transient {
    status: Option<u16>,
    message: String,
    body: String,
}
