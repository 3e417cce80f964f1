//! Alert delivery seam and content fingerprints.
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Errors produced while delivering an alert.
#[derive(Debug)]
pub enum SinkError {
    /// The sink endpoint is not usable.
    InvalidDsn(String),
    /// The request could not be sent.
    Http(reqwest::Error),
    /// The sink rejected the alert.
    Status { code: u16, body: String },
}

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkError::InvalidDsn(msg) => write!(f, "invalid Sentry DSN: {msg}"),
            SinkError::Http(e) => write!(f, "HTTP error: {e}"),
            SinkError::Status { code, body } => write!(f, "Sentry returned {code}: {body}"),
        }
    }
}

impl std::error::Error for SinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SinkError::Http(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for SinkError {
    fn from(e: reqwest::Error) -> Self {
        SinkError::Http(e)
    }
}

/// Somewhere alerts can be sent.
pub trait AlertSink {
    async fn send(
        &self,
        title: &str,
        body: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<(), SinkError>;
}

/// Hex SHA-256 of the content. Identical failures share a fingerprint, so the
/// sink groups them into one issue.
pub fn fingerprint(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// Alert title: `Supervisor <LABEL>: <fingerprint>`.
pub fn alert_title(label: &str, fingerprinted: &str) -> String {
    format!("Supervisor {label}: {}", fingerprint(fingerprinted))
}
