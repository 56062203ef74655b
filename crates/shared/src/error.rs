use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    TooLarge,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// A failed request to either chat system, as reported by its client.
///
/// Collaborators wrap this in `anyhow::Error` so that callers can
/// `downcast_ref` it to decide whether a retry makes sense.
#[derive(Debug, Clone, Error)]
#[error("request failed with status {status}: {message}")]
pub struct RequestError {
    pub status: u16,
    pub code: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Bad gateway or gateway timeout.
    Transient,
    /// Too large, forbidden or malformed.
    Permanent,
    Other,
}

impl RequestError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn class(&self) -> FailureClass {
        match self.status {
            502 | 504 => FailureClass::Transient,
            400 | 403 | 413 => FailureClass::Permanent,
            _ => FailureClass::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_statuses_are_transient() {
        assert_eq!(RequestError::new(502, "bad gateway").class(), FailureClass::Transient);
        assert_eq!(RequestError::new(504, "timeout").class(), FailureClass::Transient);
    }

    #[test]
    fn client_errors_are_permanent() {
        for status in [400, 403, 413] {
            assert_eq!(RequestError::new(status, "nope").class(), FailureClass::Permanent);
        }
        assert_eq!(RequestError::new(500, "boom").class(), FailureClass::Other);
    }
}
