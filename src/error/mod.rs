use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum ArbError {
    #[error("RPC error: {0}")]
    RpcError(String),
    #[error("Aggregator error: {0}")]
    AggregatorError(String),
    #[error("HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Wallet error: {0}")]
    WalletError(String),
    #[error("Execution error: {0}")]
    ExecutionError(String),
    #[error("Transaction error: {0}")]
    TransactionError(String),
    #[error("Transaction simulation failed: {0}")]
    SimulationFailed(String),
    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),
    #[error("Timeout: {0}")]
    TimeoutError(String),
    #[error("Decider error: {0}")]
    DeciderError(String),
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl ArbError {
    /// HTTP status carried by this error, parsed out of the message when the
    /// error did not originate from a typed response.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            ArbError::HttpStatus { status, .. } => Some(*status),
            ArbError::RateLimitExceeded(_) => Some(429),
            other => parse_status_from_message(&other.to_string()),
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        self.http_status() == Some(429)
    }

    /// Transient upstream failures worth another attempt under backoff.
    pub fn is_retryable(&self) -> bool {
        if let Some(status) = self.http_status() {
            return matches!(status, 429 | 500 | 502 | 503 | 504);
        }
        let msg = self.to_string().to_lowercase();
        matches!(self, ArbError::TimeoutError(_))
            || msg.contains("timeout")
            || msg.contains("timed out")
            || msg.contains("connection")
            || msg.contains("network")
            || msg.contains("aborted")
    }
}

/// Pull an HTTP status code out of free-form error text. Upstream SDKs bury
/// the status inside the message ("429 Too Many Requests", "status code: 503").
fn parse_status_from_message(msg: &str) -> Option<u16> {
    for status in [429u16, 500, 502, 503, 504] {
        let needle = status.to_string();
        let mut search = msg;
        while let Some(idx) = search.find(&needle) {
            let before_ok = idx == 0 || !search.as_bytes()[idx - 1].is_ascii_digit();
            let end = idx + needle.len();
            let after_ok = end >= search.len() || !search.as_bytes()[end].is_ascii_digit();
            if before_ok && after_ok {
                return Some(status);
            }
            search = &search[end..];
        }
    }
    if msg.to_lowercase().contains("too many requests") {
        return Some(429);
    }
    None
}

impl From<reqwest::Error> for ArbError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            ArbError::TimeoutError(error.to_string())
        } else if let Some(status) = error.status() {
            ArbError::HttpStatus {
                status: status.as_u16(),
                body: error.to_string(),
            }
        } else {
            ArbError::AggregatorError(error.to_string())
        }
    }
}

impl From<solana_client::client_error::ClientError> for ArbError {
    fn from(error: solana_client::client_error::ClientError) -> Self {
        let error_str = error.to_string();
        if error_str.contains("429") || error_str.contains("rate limit") {
            ArbError::RateLimitExceeded(error_str)
        } else if error_str.contains("timeout") || error_str.contains("timed out") {
            ArbError::TimeoutError(error_str)
        } else if error_str.contains("simulation") {
            ArbError::SimulationFailed(error_str)
        } else {
            ArbError::RpcError(error_str)
        }
    }
}

impl From<serde_json::Error> for ArbError {
    fn from(error: serde_json::Error) -> Self {
        ArbError::AggregatorError(format!("JSON decode: {}", error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_status_out_of_free_text() {
        assert_eq!(
            parse_status_from_message("HTTP 429 Too Many Requests"),
            Some(429)
        );
        assert_eq!(parse_status_from_message("status code: 503"), Some(503));
        assert_eq!(parse_status_from_message("error 50000 units"), None);
        assert_eq!(parse_status_from_message("all good"), None);
    }

    #[test]
    fn rate_limit_detection_covers_wrapped_messages() {
        let err = ArbError::AggregatorError("quote failed: HTTP 429".to_string());
        assert!(err.is_rate_limit());
        assert!(err.is_retryable());

        let err = ArbError::HttpStatus {
            status: 400,
            body: "bad request".to_string(),
        };
        assert!(!err.is_rate_limit());
        assert!(!err.is_retryable());
    }

    #[test]
    fn retryable_classification() {
        for status in [429u16, 500, 502, 503, 504] {
            let err = ArbError::HttpStatus {
                status,
                body: String::new(),
            };
            assert!(err.is_retryable(), "status {status} should retry");
        }
        assert!(ArbError::TimeoutError("deadline elapsed".into()).is_retryable());
        assert!(!ArbError::ConfigError("bad pair".into()).is_retryable());
    }
}
