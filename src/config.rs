//! Client configuration.
//!
//! The credential is read once, validated, and carried in an owned [`ClientConfig`] that is
//! handed to [`crate::Gemini::new`].  Nothing in the crate reads the environment on its own.

use std::env;
use std::fmt;
use std::time::Duration;

use reqwest::header::HeaderValue;
use url::Url;

use crate::error::{Error, Result};

/// Environment variable holding the API credential.
pub const API_KEY_ENV: &str = "API_KEY";

/// Consulted when [`API_KEY_ENV`] is unset.
pub const FALLBACK_API_KEY_ENV: &str = "GEMINI_API_KEY";

/// Default endpoint for the Gemini REST API.
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/";

/// Default time allowed to connect and receive response headers.
///
/// Streamed bodies are not bounded.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Connection settings for the Gemini API.
#[derive(Clone)]
pub struct ClientConfig {
    api_key: String,
    base_url: Url,
    timeout: Duration,
}

impl ClientConfig {
    /// Create a configuration with an explicit credential and default endpoint.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the key is blank or cannot be sent as a header.
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let api_key = api_key.into().trim().to_string();
        if api_key.is_empty() {
            return Err(Error::configuration(
                "API key is empty",
                Some(API_KEY_ENV.to_string()),
            ));
        }
        if HeaderValue::from_str(&api_key).is_err() {
            return Err(Error::configuration(
                "API key contains characters that are not valid in a header",
                Some(API_KEY_ENV.to_string()),
            ));
        }
        let base_url = Url::parse(DEFAULT_BASE_URL)?;
        Ok(Self {
            api_key,
            base_url,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Read the credential from `API_KEY`, falling back to `GEMINI_API_KEY`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when neither variable holds a usable key.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Like [`ClientConfig::from_env`], with the variable lookup supplied by the caller.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_key = [API_KEY_ENV, FALLBACK_API_KEY_ENV]
            .into_iter()
            .filter_map(|key| lookup(key))
            .find(|value| !value.trim().is_empty())
            .ok_or_else(|| {
                Error::configuration(
                    format!("{API_KEY_ENV} environment variable not set"),
                    Some(API_KEY_ENV.to_string()),
                )
            })?;
        Self::new(api_key)
    }

    /// Point the client at a different endpoint (a proxy or a test server).
    ///
    /// A trailing slash is added when missing so that relative joins keep the final path
    /// segment.
    pub fn with_base_url(mut self, base_url: &str) -> Result<Self> {
        let mut base_url = Url::parse(base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        self.base_url = base_url;
        Ok(self)
    }

    /// Override the time allowed to connect and receive response headers.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The API credential.
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// The API endpoint; always ends in `/`.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// The time allowed to connect and receive response headers.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url.as_str())
            .field("timeout", &self.timeout)
            .finish()
    }
}
