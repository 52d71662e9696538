use thiserror::Error;

#[derive(Debug, Error)]
pub enum CopilotError {
    #[error("SSE preamble malformed at byte {0}")]
    SsePreamble(usize),

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("upstream error from completion endpoint: {0}")]
    Upstream(String),

    #[error("authentication not configured")]
    AuthMissing,

    #[error("cursor position report malformed: {0}")]
    CursorReport(String),

    #[error("terminal I/O error: {0}")]
    Terminal(#[from] std::io::Error),

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl CopilotError {
    /// Sanitized message safe to log; never includes upstream response bodies.
    pub fn user_message(&self) -> String {
        match self {
            Self::SsePreamble(_) => "malformed response stream".to_string(),
            Self::Timeout(_) => "request timed out".to_string(),
            Self::Upstream(_) => "upstream request failed".to_string(),
            Self::AuthMissing => "authentication not configured".to_string(),
            Self::CursorReport(_) => "terminal did not respond to cursor query".to_string(),
            Self::Terminal(_) => "terminal I/O error".to_string(),
            Self::Request(_) => "request to completion service failed".to_string(),
            Self::Config(_) => "configuration error".to_string(),
            Self::Other(_) => "an error occurred".to_string(),
        }
    }
}
