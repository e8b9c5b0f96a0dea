//! Client configuration
//!
//! Defaults come from the selected [`Locale`]. A TOML file at
//! `<config dir>/kindlepass/config.toml` may override any of them:
//!
//! ```toml
//! locale = "uk"
//! device_name = "Kindle"
//! max_retries = 3
//! retry_backoff_ms = 500
//!
//! [[devices]]
//! serial = "B0419XXXXXXXXXXX"
//! mount_point = "/media/kindle"
//! ```
//!
//! Base URL overrides exist mainly so tests can point the client at a mock provider.

use crate::error::{KindlepassError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Device type the legacy activation endpoint expects for Kindle readers
pub const KINDLE_DEVICE_TYPE: &str = "A2CZJZGLK2JJVM";

/// Display name registered for the device
pub const DEFAULT_DEVICE_NAME: &str = "Kindle";

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Linux; U; en-US) AppleWebKit/528.5+ (KHTML, like Gecko, Safari/528.5+) Version/4.0 Kindle/3.0 (screen 600x800; rotate)";

// ============================================================================
// LOCALE
// ============================================================================

/// Marketplace the account belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locale {
    /// Short code used on the command line (`us`, `uk`, ...)
    pub country_code: String,

    /// Human readable name
    pub name: String,

    /// Amazon top level domain (`com`, `co.uk`, ...)
    pub amazon_domain: String,

    /// Audible top level domain
    pub audible_domain: String,

    pub marketplace_id: String,
}

impl Locale {
    fn new(country_code: &str, name: &str, amazon_domain: &str, audible_domain: &str, marketplace_id: &str) -> Self {
        Self {
            country_code: country_code.to_string(),
            name: name.to_string(),
            amazon_domain: amazon_domain.to_string(),
            audible_domain: audible_domain.to_string(),
            marketplace_id: marketplace_id.to_string(),
        }
    }

    pub fn us() -> Self {
        Self::new("us", "United States", "com", "com", "AF2M0KC94RCEA")
    }

    pub fn uk() -> Self {
        Self::new("uk", "United Kingdom", "co.uk", "co.uk", "A2I9A3Q2GNFNGQ")
    }

    pub fn ca() -> Self {
        Self::new("ca", "Canada", "ca", "ca", "A2CQZ5RBY40XE")
    }

    pub fn au() -> Self {
        Self::new("au", "Australia", "com.au", "com.au", "AN7EY7DTAW63G")
    }

    pub fn fr() -> Self {
        Self::new("fr", "France", "fr", "fr", "A2728XDNODOQ8T")
    }

    pub fn de() -> Self {
        Self::new("de", "Germany", "de", "de", "AN7V1F1VY261K")
    }

    pub fn jp() -> Self {
        Self::new("jp", "Japan", "co.jp", "co.jp", "A1QAP3MOU4173J")
    }

    pub fn it() -> Self {
        Self::new("it", "Italy", "it", "it", "A2N7FU2W2BU2ZC")
    }

    pub fn india() -> Self {
        Self::new("in", "India", "in", "in", "AJO3FBRUE6J4S")
    }

    /// All supported locales
    pub fn all() -> Vec<Self> {
        vec![
            Self::uk(),
            Self::us(),
            Self::ca(),
            Self::au(),
            Self::fr(),
            Self::de(),
            Self::jp(),
            Self::it(),
            Self::india(),
        ]
    }

    /// Look a locale up by country code
    pub fn from_country_code(code: &str) -> Result<Self> {
        let code = code.trim().to_ascii_lowercase();
        Self::all()
            .into_iter()
            .find(|l| l.country_code == code)
            .ok_or_else(|| KindlepassError::InvalidInput(format!("Unknown country code: {}", code)))
    }

    pub fn auth_url(&self) -> String {
        format!("https://www.amazon.{}", self.amazon_domain)
    }

    pub fn api_url(&self) -> String {
        format!("https://api.amazon.{}", self.amazon_domain)
    }

    pub fn audible_url(&self) -> String {
        format!("https://www.audible.{}", self.audible_domain)
    }
}

impl Default for Locale {
    fn default() -> Self {
        Self::us()
    }
}

// ============================================================================
// CLIENT CONFIG
// ============================================================================

/// A device pinned in the config file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub serial: String,
    pub mount_point: PathBuf,
}

/// Settings for the negotiation and retrieval clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Country code of the account's marketplace
    pub locale: String,

    /// Display name registered with the provider
    pub device_name: String,

    pub device_type: String,

    /// Sign-in host; defaults to the locale's Amazon site
    pub auth_base_url: Option<String>,

    /// Registration API host; defaults to the locale's Amazon API
    pub api_base_url: Option<String>,

    /// Legacy activation host; defaults to the locale's Audible site
    pub activation_base_url: Option<String>,

    /// Retries for transient failures (timeouts, connect errors, 5xx)
    pub max_retries: u32,

    /// Linear backoff unit; attempt `n` waits `n * retry_backoff_ms`
    pub retry_backoff_ms: u64,

    pub request_timeout_secs: u64,

    pub user_agent: String,

    /// Devices known without auto-detection
    pub devices: Vec<DeviceEntry>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            locale: Locale::us().country_code,
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            device_type: KINDLE_DEVICE_TYPE.to_string(),
            auth_base_url: None,
            api_base_url: None,
            activation_base_url: None,
            max_retries: 3,
            retry_backoff_ms: 500,
            request_timeout_secs: 30,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            devices: Vec::new(),
        }
    }
}

impl ClientConfig {
    /// Config for a locale with everything else defaulted
    pub fn for_locale(locale: &Locale) -> Self {
        Self {
            locale: locale.country_code.clone(),
            ..Default::default()
        }
    }

    /// Config pointing every endpoint at one base URL, with fast retries
    ///
    /// Used against mock providers.
    pub fn with_base_url(base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/').to_string();
        Self {
            auth_base_url: Some(base.clone()),
            api_base_url: Some(base.clone()),
            activation_base_url: Some(base),
            retry_backoff_ms: 10,
            request_timeout_secs: 5,
            ..Default::default()
        }
    }

    /// Default location of the config file
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("kindlepass").join("config.toml"))
    }

    /// Load from a TOML file; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&text)?;
        debug!(path = %path.display(), locale = %config.locale, "Loaded config");
        Ok(config)
    }

    /// Load from [`ClientConfig::default_path`]
    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| KindlepassError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        Locale::from_country_code(&self.locale).map_err(|e| KindlepassError::Config(e.to_string()))?;

        if self.device_name.trim().is_empty() {
            return Err(KindlepassError::Config("device_name must not be empty".to_string()));
        }
        if self.device_type.trim().is_empty() {
            return Err(KindlepassError::Config("device_type must not be empty".to_string()));
        }
        if self.request_timeout_secs == 0 {
            return Err(KindlepassError::Config("request_timeout_secs must be positive".to_string()));
        }
        for url in [&self.auth_base_url, &self.api_base_url, &self.activation_base_url]
            .into_iter()
            .flatten()
        {
            url::Url::parse(url).map_err(|e| KindlepassError::Config(format!("Invalid base URL {}: {}", url, e)))?;
        }
        Ok(())
    }

    pub fn locale(&self) -> Result<Locale> {
        Locale::from_country_code(&self.locale)
    }

    pub fn auth_base(&self) -> Result<String> {
        Ok(match &self.auth_base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => self.locale()?.auth_url(),
        })
    }

    pub fn api_base(&self) -> Result<String> {
        Ok(match &self.api_base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => self.locale()?.api_url(),
        })
    }

    pub fn activation_base(&self) -> Result<String> {
        Ok(match &self.activation_base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => self.locale()?.audible_url(),
        })
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
