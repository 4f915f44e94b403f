//! Error classification for the gateway's session lifecycle.
//!
//! # Classification Strategy
//!
//! Errors are grouped the way §7 of the design describes: validation errors never
//! change state, auth/transport errors destroy the session, channel/internal errors
//! are surfaced to a callback without tearing down the SSH connection.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Auth(String),

    #[error("{0}")]
    Transport(String),

    #[error("{0}")]
    Channel(String),

    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    /// Whether this error class should tear down the owning session.
    pub fn destroys_session(&self) -> bool {
        matches!(self, GatewayError::Auth(_) | GatewayError::Transport(_))
    }

    pub fn message(&self) -> String {
        self.to_string()
    }
}

/// Authentication/dial error patterns that indicate permanent failures and should
/// never be retried, to avoid repeatedly failing with bad credentials.
const AUTH_ERRORS: &[&str] = &[
    "authentication failed",
    "authentication timeout",
    "permission denied",
    "publickey",
    "auth fail",
    "no authentication",
    "all authentication methods failed",
    "invalid private key",
];

/// Connection error patterns that indicate transient failures worth retrying.
const RETRYABLE_ERRORS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection timed out",
    "timeout",
    "network is unreachable",
    "no route to host",
    "host is down",
    "temporary failure",
    "resource temporarily unavailable",
    "handshake failed",
    "failed to connect",
    "broken pipe",
    "would block",
];

/// Determines if a dial error is transient (worth retrying) or permanent.
///
/// Authentication-shaped errors are checked first and always win, so that a
/// message combining both auth and connection keywords is never retried.
pub fn is_retryable_error(error: &str) -> bool {
    let lower = error.to_lowercase();

    for auth_err in AUTH_ERRORS {
        if lower.contains(auth_err) {
            return false;
        }
    }

    for retryable_err in RETRYABLE_ERRORS {
        if lower.contains(retryable_err) {
            return true;
        }
    }

    !lower.contains("ssh") || lower.contains("timeout") || lower.contains("connect")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_errors_not_retryable() {
        assert!(!is_retryable_error("Authentication failed"));
        assert!(!is_retryable_error("Permission denied"));
        assert!(!is_retryable_error("Authentication timeout"));
    }

    #[test]
    fn test_connection_errors_retryable() {
        assert!(is_retryable_error("Connection refused"));
        assert!(is_retryable_error("connection timed out after 30s"));
    }

    #[test]
    fn test_auth_takes_precedence() {
        assert!(!is_retryable_error(
            "Connection timeout during authentication failed"
        ));
    }

    #[test]
    fn test_ssh_protocol_error_not_retryable_by_default() {
        assert!(!is_retryable_error("SSH protocol error"));
        assert!(is_retryable_error("SSH connection timeout"));
    }

    #[test]
    fn test_destroys_session_classification() {
        assert!(GatewayError::Auth("x".into()).destroys_session());
        assert!(GatewayError::Transport("x".into()).destroys_session());
        assert!(!GatewayError::Channel("x".into()).destroys_session());
        assert!(!GatewayError::Internal("x".into()).destroys_session());
        assert!(!GatewayError::Validation("x".into()).destroys_session());
    }
}
