use std::env;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::CopilotError;

const DEFAULT_API_URL: &str = "https://api.sqlcopilot.dev";
const CREDENTIAL_DIR: &str = ".sqlcopilot";
const CREDENTIAL_FILE: &str = "config.toml";

/// Resolved authentication material, as an explicit tri-state the caller
/// must match on rather than a bare "is configured" boolean.
#[derive(Clone, Debug)]
pub enum AuthState {
    Bearer(String),
    ApiKey(String),
    Unauthenticated,
}

impl AuthState {
    pub fn is_authenticated(&self) -> bool {
        !matches!(self, Self::Unauthenticated)
    }

    /// `(header_name, header_value)` pair for the outbound request, or `None`
    /// when unauthenticated.
    pub fn header(&self) -> Option<(&'static str, String)> {
        match self {
            Self::Bearer(token) => Some(("Authorization", format!("Bearer {token}"))),
            Self::ApiKey(key) => Some(("API-KEY", key.clone())),
            Self::Unauthenticated => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub api_url: String,
    pub auth: AuthState,
}

/// On-disk credential file shape, e.g. `~/.sqlcopilot/config.toml`.
#[derive(Deserialize, Default)]
struct CredentialFile {
    #[serde(rename = "apiUrl")]
    api_url: Option<String>,
    #[serde(rename = "accessToken")]
    access_token: Option<String>,
    #[serde(rename = "apiKey")]
    api_key: Option<String>,
}

impl Config {
    /// Load configuration from environment first, falling back to a TOML
    /// credential file. Missing auth is not an error here — callers disable
    /// completion at init rather than failing startup.
    pub fn from_env() -> Result<Self, CopilotError> {
        dotenvy::dotenv().ok();

        let file = read_credential_file();

        let api_url = env::var("SQLCOPILOT_API_URL")
            .ok()
            .or_else(|| file.as_ref().and_then(|f| f.api_url.clone()))
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());

        let auth = if let Ok(token) = env::var("SQLCOPILOT_ACCESS_TOKEN") {
            AuthState::Bearer(token)
        } else if let Ok(key) = env::var("SQLCOPILOT_API_KEY") {
            AuthState::ApiKey(key)
        } else if let Some(token) = file.as_ref().and_then(|f| f.access_token.clone()) {
            AuthState::Bearer(token)
        } else if let Some(key) = file.as_ref().and_then(|f| f.api_key.clone()) {
            AuthState::ApiKey(key)
        } else {
            tracing::warn!("no credentials configured — completion disabled at init");
            AuthState::Unauthenticated
        };

        Ok(Config { api_url, auth })
    }

    pub fn completion_url(&self) -> String {
        format!("{}/v1/sql/completion", self.api_url)
    }

    pub fn session_url(&self) -> String {
        format!("{}/v1/sql/session", self.api_url)
    }

    pub fn chat_url(&self) -> String {
        format!("{}/v1/sql/chat", self.api_url)
    }
}

fn credential_path() -> Option<PathBuf> {
    let home = env::var_os("HOME")?;
    Some(PathBuf::from(home).join(CREDENTIAL_DIR).join(CREDENTIAL_FILE))
}

fn read_credential_file() -> Option<CredentialFile> {
    let path = credential_path()?;
    let text = std::fs::read_to_string(&path).ok()?;
    match toml::from_str(&text) {
        Ok(f) => Some(f),
        Err(e) => {
            tracing::warn!(path = %path.display(), "failed to parse credential file: {e}");
            None
        }
    }
}
