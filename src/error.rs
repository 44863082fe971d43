use thiserror::Error;

/// A single share URI or document entry could not be decoded.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty input")]
    Empty,
    #[error("missing scheme or host")]
    MissingHost,
    #[error("missing or invalid port")]
    InvalidPort,
    #[error("invalid base64 payload")]
    InvalidBase64,
    #[error("invalid json payload: {0}")]
    InvalidJson(String),
    #[error("invalid uri: {0}")]
    InvalidUri(String),
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),
    #[error("{0}")]
    Malformed(String),
    /// Nothing usable was extracted; carries the per-line warnings.
    #[error("no nodes recognized")]
    NoNodes(Vec<String>),
}

/// A node or record failed a validation rule and must not be emitted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("key '{0}' missing")]
    MissingField(&'static str),
    #[error("invalid uuid: {0}")]
    InvalidUuid(String),
    #[error("invalid REALITY public key: {0}")]
    InvalidRealityKey(String),
    #[error("invalid REALITY short ID: {0}")]
    InvalidShortId(String),
    #[error("flow={0} ({1})")]
    UnsupportedFlow(String, &'static str),
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),
    #[error("{0}")]
    InvalidRecord(String),
}

/// The verification engine never became ready.
#[derive(Debug, Clone, Error)]
pub enum EngineStartupError {
    #[error("engine binary not found: {0}")]
    BinaryNotFound(String),
    #[error("no testable nodes")]
    NoProxies,
    #[error("engine io error: {0}")]
    Io(String),
    #[error("engine exited: {message}{}", log_suffix(.log_tail))]
    Exited {
        message: String,
        log_tail: Option<String>,
    },
    #[error("engine startup timed out{}", log_suffix(.log_tail))]
    Timeout { log_tail: Option<String> },
}

impl EngineStartupError {
    /// Full diagnostic text, including the captured log tail when present.
    pub fn diagnostic(&self) -> String {
        self.to_string()
    }

    pub fn with_log_tail(self, tail: Option<String>) -> Self {
        match self {
            Self::Exited { message, .. } => Self::Exited {
                message,
                log_tail: tail,
            },
            Self::Timeout { .. } => Self::Timeout { log_tail: tail },
            other => other,
        }
    }
}

fn log_suffix(tail: &Option<String>) -> String {
    match tail {
        Some(t) if !t.is_empty() => format!("\nlog:\n{t}"),
        _ => String::new(),
    }
}

/// A single delay measurement failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NetworkError {
    #[error("dial: {0}")]
    Dial(String),
    #[error("tls: {0}")]
    Tls(String),
    #[error("timeout")]
    Timeout,
    #[error("api: {0}")]
    Api(String),
    #[error("{0}")]
    Delay(String),
}

/// Run-level failure, reported once to the caller.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    EngineStartup(#[from] EngineStartupError),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error("canceled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_error_carries_log_tail() {
        let err = EngineStartupError::Timeout { log_tail: None }
            .with_log_tail(Some("line a\nline b".to_string()));
        let text = err.diagnostic();
        assert!(text.starts_with("engine startup timed out"));
        assert!(text.ends_with("line a\nline b"));
    }

    #[test]
    fn test_missing_field_message() {
        let err = ValidationError::MissingField("password");
        assert_eq!(err.to_string(), "key 'password' missing");
    }
}
