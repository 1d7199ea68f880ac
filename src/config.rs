use secrecy::{ExposeSecret, SecretBox};
use std::env;
use thiserror::Error;
use url::Url;

pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1alpha.GenerativeService.BidiGenerateContent";
pub const DEFAULT_MODEL: &str = "models/gemini-2.0-flash-exp";

const API_KEY_VAR: &str = "GEMINI_API_KEY";
const ENDPOINT_VAR: &str = "LIVE_ENDPOINT";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid API key: {0}")]
    InvalidKey(String),
    #[error("Invalid endpoint URL: {0}")]
    InvalidEndpoint(#[from] url::ParseError),
}

/// Where the session connects to.
///
/// `Direct` talks to the service and carries the key as a query parameter. `Relay` points at a
/// credential-injecting relay that re-originates the connection, so no key is attached locally.
#[derive(Debug)]
pub enum Endpoint {
    Direct { url: Url, api_key: SecretBox<String> },
    Relay { url: Url },
}

impl Endpoint {
    pub fn direct(url: &str, api_key: String) -> Result<Self, ConfigError> {
        if api_key.trim().is_empty() {
            return Err(ConfigError::InvalidKey("API key cannot be empty".to_string()));
        }
        Ok(Endpoint::Direct {
            url: Url::parse(url)?,
            api_key: SecretBox::new(Box::new(api_key)),
        })
    }

    pub fn relay(url: &str) -> Result<Self, ConfigError> {
        Ok(Endpoint::Relay {
            url: Url::parse(url)?,
        })
    }

    /// Builds the URL to dial. The key is only exposed here.
    pub fn connect_url(&self) -> Url {
        match self {
            Endpoint::Direct { url, api_key } => {
                let mut url = url.clone();
                url.query_pairs_mut()
                    .append_pair("key", api_key.expose_secret());
                url
            }
            Endpoint::Relay { url } => url.clone(),
        }
    }

    /// URL safe to print: never includes the key.
    pub fn display_url(&self) -> &Url {
        match self {
            Endpoint::Direct { url, .. } | Endpoint::Relay { url } => url,
        }
    }
}

/// Configuration loaded from the environment
#[derive(Debug)]
pub struct ApiConfig {
    pub endpoint: Endpoint,
}

impl ApiConfig {
    /// Load configuration from environment variables, reading `.env` first if present
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        if let Ok(relay) = env::var(ENDPOINT_VAR) {
            if !relay.trim().is_empty() {
                return Ok(Self {
                    endpoint: Endpoint::relay(relay.trim())?,
                });
            }
        }

        let key =
            env::var(API_KEY_VAR).map_err(|_| ConfigError::MissingEnvVar(API_KEY_VAR.to_string()))?;

        Ok(Self {
            endpoint: Endpoint::direct(DEFAULT_ENDPOINT, key)?,
        })
    }
}

/// Load configuration with helpful error messages for development
pub fn load_config() -> Result<ApiConfig, ConfigError> {
    match ApiConfig::load() {
        Ok(config) => {
            log::info!(
                "Loaded API configuration (endpoint: {})",
                config.endpoint.display_url()
            );
            Ok(config)
        }
        Err(ConfigError::MissingEnvVar(var)) => {
            log::error!("Missing required environment variable: {}", var);
            log::error!("Create a .env file in the project root with:");
            log::error!("{}=your_api_key_here", var);
            log::error!("or point {} at a relay that injects credentials", ENDPOINT_VAR);
            Err(ConfigError::MissingEnvVar(var))
        }
        Err(e) => {
            log::error!("Configuration error: {}", e);
            Err(e)
        }
    }
}
