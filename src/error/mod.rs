use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Backend API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Circuit breaker is open for backend '{backend}'")]
    CircuitOpen { backend: String },

    #[error("Request to '{backend}' failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        backend: String,
        attempts: u32,
        last: String,
    },

    #[error("Request cancelled")]
    Cancelled,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        Error::Backend(msg.into())
    }

    pub fn api(status: u16, body: impl Into<String>) -> Self {
        Error::Api {
            status,
            body: body.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn credential(msg: impl Into<String>) -> Self {
        Error::Credential(msg.into())
    }

    pub fn unknown(msg: impl Into<String>) -> Self {
        Error::Unknown(msg.into())
    }
}

/// Failure taxonomy used by the retry policy and error history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Api,
    Auth,
    RateLimit,
    Timeout,
    Validation,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Api => "api",
            ErrorKind::Auth => "auth",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Validation => "validation",
            ErrorKind::Unknown => "unknown",
        }
    }
}

/// Severity weights logging and alerting only; it never drives control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub kind: ErrorKind,
    pub severity: Severity,
}

/// Maps any failure to a kind and severity. Total: every input lands on some
/// kind, unmatched inputs fall through to `Unknown`.
pub fn classify(error: &Error) -> Classification {
    let kind = classify_kind(error);
    Classification {
        kind,
        severity: severity_of(kind),
    }
}

fn classify_kind(error: &Error) -> ErrorKind {
    match error {
        Error::Http(e) => {
            if e.is_timeout() {
                return ErrorKind::Timeout;
            }
            if e.is_connect() {
                return ErrorKind::Network;
            }
            if let Some(status) = e.status() {
                return kind_from_status(status.as_u16());
            }
            ErrorKind::Network
        }
        Error::Api { status, .. } => kind_from_status(*status),
        Error::Validation(_) => ErrorKind::Validation,
        Error::Credential(_) => ErrorKind::Auth,
        _ => classify_message(&error.to_string()),
    }
}

fn kind_from_status(status: u16) -> ErrorKind {
    match status {
        401 | 403 => ErrorKind::Auth,
        429 => ErrorKind::RateLimit,
        408 => ErrorKind::Timeout,
        400..=499 => ErrorKind::Validation,
        500..=599 => ErrorKind::Api,
        _ => ErrorKind::Unknown,
    }
}

/// Keyword-driven classification for failures that arrive as plain text.
/// Auth and rate-limit markers are checked first, then timeout before the
/// generic connection bucket so timeouts keep their own kind.
fn classify_message(message: &str) -> ErrorKind {
    let message = message.to_lowercase();
    let contains_any = |keywords: &[&str]| keywords.iter().any(|k| message.contains(k));

    if contains_any(&[
        "401",
        "unauthorized",
        "authentication",
        "invalid key",
        "invalid api key",
    ]) {
        ErrorKind::Auth
    } else if contains_any(&["429", "rate limit", "too many requests", "quota"]) {
        ErrorKind::RateLimit
    } else if contains_any(&["timeout", "timed out", "time out"]) {
        ErrorKind::Timeout
    } else if contains_any(&["connection", "network", "unreachable", "dns"]) {
        ErrorKind::Network
    } else if contains_any(&["400", "invalid", "validation", "bad request"]) {
        ErrorKind::Validation
    } else if contains_any(&["500", "502", "503", "504", "server error", "internal error"]) {
        ErrorKind::Api
    } else {
        ErrorKind::Unknown
    }
}

fn severity_of(kind: ErrorKind) -> Severity {
    match kind {
        ErrorKind::Auth => Severity::Critical,
        ErrorKind::Validation | ErrorKind::Api => Severity::High,
        ErrorKind::Network | ErrorKind::Timeout | ErrorKind::RateLimit | ErrorKind::Unknown => {
            Severity::Medium
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_auth_keywords() {
        let err = Error::backend("API error 401: unauthorized");
        let c = classify(&err);
        assert_eq!(c.kind, ErrorKind::Auth);
        assert_eq!(c.severity, Severity::Critical);
    }

    #[test]
    fn test_classify_rate_limit_keywords() {
        for msg in ["429 too many requests", "quota exceeded", "rate limit hit"] {
            let c = classify(&Error::backend(msg));
            assert_eq!(c.kind, ErrorKind::RateLimit, "message: {}", msg);
            assert_eq!(c.severity, Severity::Medium);
        }
    }

    #[test]
    fn test_classify_timeout_before_network() {
        // "connection timed out" carries both markers; timeout wins
        let c = classify(&Error::backend("connection timed out"));
        assert_eq!(c.kind, ErrorKind::Timeout);
    }

    #[test]
    fn test_classify_network_keywords() {
        let c = classify(&Error::backend("connection refused by host"));
        assert_eq!(c.kind, ErrorKind::Network);
        assert_eq!(c.severity, Severity::Medium);
    }

    #[test]
    fn test_classify_validation_and_api() {
        assert_eq!(
            classify(&Error::backend("bad request: missing field")).kind,
            ErrorKind::Validation
        );
        assert_eq!(
            classify(&Error::backend("503 server error")).kind,
            ErrorKind::Api
        );
        assert_eq!(
            classify(&Error::backend("503 server error")).severity,
            Severity::High
        );
    }

    #[test]
    fn test_classify_status_codes() {
        assert_eq!(classify(&Error::api(401, "nope")).kind, ErrorKind::Auth);
        assert_eq!(
            classify(&Error::api(429, "slow down")).kind,
            ErrorKind::RateLimit
        );
        assert_eq!(
            classify(&Error::api(422, "unprocessable")).kind,
            ErrorKind::Validation
        );
        assert_eq!(classify(&Error::api(502, "bad gateway")).kind, ErrorKind::Api);
    }

    #[test]
    fn test_classify_is_total() {
        let c = classify(&Error::unknown("something entirely novel happened"));
        assert_eq!(c.kind, ErrorKind::Unknown);
        assert_eq!(c.severity, Severity::Medium);
    }

    #[test]
    fn test_classify_typed_variants() {
        assert_eq!(
            classify(&Error::validation("prompt empty")).kind,
            ErrorKind::Validation
        );
        assert_eq!(
            classify(&Error::credential("bad format")).kind,
            ErrorKind::Auth
        );
    }

    #[test]
    fn test_severity_mapping() {
        assert_eq!(severity_of(ErrorKind::Auth), Severity::Critical);
        assert_eq!(severity_of(ErrorKind::Validation), Severity::High);
        assert_eq!(severity_of(ErrorKind::Api), Severity::High);
        assert_eq!(severity_of(ErrorKind::Network), Severity::Medium);
        assert_eq!(severity_of(ErrorKind::Timeout), Severity::Medium);
        assert_eq!(severity_of(ErrorKind::RateLimit), Severity::Medium);
        assert_eq!(severity_of(ErrorKind::Unknown), Severity::Medium);
    }
}
