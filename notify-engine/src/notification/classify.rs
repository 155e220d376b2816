//! Failure classification for channel errors.

use serde::{Deserialize, Serialize};

use super::channels::DeliveryError;

/// How a delivery failure should be treated by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Worth retrying: timeouts, throttling, server-side outages.
    Transient,
    /// Retrying cannot help: auth, missing endpoint, invalid payload.
    Permanent,
    /// Not recognised. Treated as retryable, bounded by max attempts.
    Unknown,
}

impl ErrorClass {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Permanent)
    }
}

/// Classify an HTTP status code.
pub fn classify_http_status(status: u16) -> ErrorClass {
    match status {
        408 | 429 | 500 | 502 | 503 | 504 => ErrorClass::Transient,
        400 | 401 | 403 | 404 | 405 | 410 | 413 | 422 => ErrorClass::Permanent,
        _ => ErrorClass::Unknown,
    }
}

/// Classify an SMTP reply code. 4yz is a transient negative completion,
/// 5yz a permanent one.
pub fn classify_smtp_code(code: u16) -> ErrorClass {
    match code {
        400..=499 => ErrorClass::Transient,
        500..=599 => ErrorClass::Permanent,
        _ => ErrorClass::Unknown,
    }
}

/// Classify a delivery error.
pub fn classify(error: &DeliveryError) -> ErrorClass {
    match error {
        DeliveryError::Timeout(_) | DeliveryError::Connection(_) => ErrorClass::Transient,
        DeliveryError::Http { status, .. } => classify_http_status(*status),
        DeliveryError::Smtp { code, .. } => classify_smtp_code(*code),
        DeliveryError::Rejected(_) => ErrorClass::Permanent,
        DeliveryError::Other(_) => ErrorClass::Unknown,
    }
}
